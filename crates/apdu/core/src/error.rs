//! Core error type for APDU operations

use crate::response::error::ResponseError;
use crate::transport::TransportError;

/// Core error type that encompasses the failures of this crate
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Response processing failure
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// Invalid command length
    #[error("Invalid command length: {0}")]
    InvalidCommandLength(usize),

    /// Invalid command data
    #[error("Invalid command data: {0}")]
    InvalidCommandData(&'static str),
}

/// Result type for APDU operations
pub type Result<T> = std::result::Result<T, Error>;
