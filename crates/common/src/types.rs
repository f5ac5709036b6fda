//! Message model handed to the rendering pipeline by the document parser.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Subtype wildcard accepted in handler and alternative rules.
pub const WILDCARD: &str = "*";

/// A `type/subtype` pair. Comparisons are case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MimeType {
    pub type_: String,
    pub subtype: String,
}

impl MimeType {
    pub fn new(type_: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            subtype: subtype.into(),
        }
    }

    /// Whether the subtype is the `*` wildcard.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.subtype == WILDCARD
    }

    /// Rule match: exact type, and wildcard or exact subtype.
    #[must_use]
    pub fn matches(&self, type_: &str, subtype: &str) -> bool {
        self.type_ == type_ && (self.is_wildcard() || self.subtype == subtype)
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_, self.subtype)
    }
}

impl FromStr for MimeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (type_, subtype) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::invalid_mime_type(s, "missing `/`"))?;
        if type_.is_empty() {
            return Err(Error::invalid_mime_type(s, "empty type"));
        }
        if subtype.is_empty() {
            return Err(Error::invalid_mime_type(s, "empty subtype"));
        }
        if subtype.contains('/') {
            return Err(Error::invalid_mime_type(s, "more than one `/`"));
        }
        Ok(Self::new(type_, subtype))
    }
}

impl TryFrom<String> for MimeType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MimeType> for String {
    fn from(mime: MimeType) -> Self {
        mime.to_string()
    }
}

/// One message header, in the order the parser produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl FromStr for Header {
    type Err = Error;

    /// Parses `Key: Value`; the value is trimmed of surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok(Self::new(key.trim(), value.trim()))
            },
            _ => Err(Error::InvalidHeader(s.to_string())),
        }
    }
}

/// A typed content unit of a multipart message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePart {
    pub type_: String,
    pub subtype: String,
    pub content: Vec<u8>,
}

impl MessagePart {
    pub fn new(type_: impl Into<String>, subtype: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            type_: type_.into(),
            subtype: subtype.into(),
            content,
        }
    }

    /// Current length of the content buffer.
    #[must_use]
    pub fn size(&self) -> usize {
        self.content.len()
    }

    #[must_use]
    pub fn mime_type(&self) -> MimeType {
        MimeType::new(self.type_.clone(), self.subtype.clone())
    }
}

/// A parsed message: ordered headers and ordered parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub headers: Vec<Header>,
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn new(headers: Vec<Header>, parts: Vec<MessagePart>) -> Self {
        Self { headers, parts }
    }
}
