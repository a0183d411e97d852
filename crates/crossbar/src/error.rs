use std::io;

use thiserror::Error;

/// Errors surfaced by the public bus API.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus is not running")]
    NotStarted,
    #[error("failed to start the bus")]
    FailedToStart(#[source] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Failure to serialize or deserialize a user message.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct CodecError(Box<dyn std::error::Error + Send + Sync>);

impl CodecError {
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }
}

/// The trailing length check of a frame disagreed with its prefix.
/// Both ends must agree on the extra-size-check setting.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("corrupt message stream: trailing length {found} != {expected}")]
pub struct CorruptStream {
    pub expected: u32,
    pub found: u32,
}
