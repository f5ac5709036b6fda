//! Shared message model and error definitions used across all mimeview crates.

pub mod error;
pub mod types;

pub use {
    error::{Error, Result},
    types::{Header, Message, MessagePart, MimeType},
};
