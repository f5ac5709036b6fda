use thiserror::Error;

/// Errors raised while building or interpreting the message model.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid mime type `{input}`: {reason}")]
    InvalidMimeType { input: String, reason: &'static str },

    #[error("invalid header `{0}`: expected `Key: Value`")]
    InvalidHeader(String),
}

impl Error {
    #[must_use]
    pub fn invalid_mime_type(input: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidMimeType {
            input: input.into(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
