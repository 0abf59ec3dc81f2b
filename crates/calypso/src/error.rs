use std::fmt;

use calypso_apdu_core::{StatusWord, TransportError};

use crate::commands::CommandRef;
use crate::sam::SamError;

/// Result type for Calypso transactions
pub type Result<T> = std::result::Result<T, Error>;

/// Details attached to every command-level failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    /// Human readable cause
    pub message: &'static str,
    /// Command that failed
    pub command: CommandRef,
    /// Status word returned by the card, if the failure came from one
    pub status: Option<StatusWord>,
}

impl CommandFailure {
    /// Failure raised from a card status word
    pub const fn from_status(
        command: CommandRef,
        message: &'static str,
        status: StatusWord,
    ) -> Self {
        Self {
            message,
            command,
            status: Some(status),
        }
    }

    /// Failure detected locally, before or without any status word
    pub const fn local(command: CommandRef, message: &'static str) -> Self {
        Self {
            message,
            command,
            status: None,
        }
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.command, self.message)?;
        if let Some(status) = self.status {
            write!(f, " (SW {status})")?;
        }
        Ok(())
    }
}

/// Error type for Calypso transactions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Transport failure while exchanging with the card
    #[error("Communication error: {0}")]
    Communication(#[from] TransportError),

    /// File or record not found, or wrong file type
    #[error("Card data access error: {0}")]
    CardDataAccess(CommandFailure),

    /// Session integrity broken: MAC or anticipated data mismatch, missing
    /// security conditions
    #[error("Card security context error: {0}")]
    SecurityContext(CommandFailure),

    /// Incorrect signature or MAC data
    #[error("Card security data error: {0}")]
    SecurityData(CommandFailure),

    /// Malformed request
    #[error("Illegal parameter: {0}")]
    IllegalParameter(CommandFailure),

    /// Access conditions refuse the operation
    #[error("Card access forbidden: {0}")]
    AccessForbidden(CommandFailure),

    /// Value out of the bounds accepted by the card
    #[error("Card data out of bounds: {0}")]
    DataOutOfBounds(CommandFailure),

    /// Card or application terminated
    #[error("Card terminated: {0}")]
    Terminated(CommandFailure),

    /// Session buffer capacity exceeded
    #[error("Session buffer overflow: {0}")]
    SessionBufferOverflow(CommandFailure),

    /// Status word absent from the command table
    #[error("Unknown status: {0}")]
    UnknownStatus(CommandFailure),

    /// Response payload does not have the expected layout
    #[error("Unexpected response length: {0}")]
    UnexpectedResponseLength(CommandFailure),

    /// Stored value operation rejected before reaching the card
    #[error("SV consistency error: {0}")]
    SvConsistency(&'static str),

    /// Operation not allowed in the current transaction state
    #[error("Illegal state: {0}")]
    IllegalState(&'static str),

    /// SAM collaborator failure
    #[error(transparent)]
    Sam(#[from] SamError),
}

impl Error {
    /// Whether this error must short-circuit the batch and abort the session
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Communication(_)
                | Self::SecurityContext(_)
                | Self::SecurityData(_)
                | Self::IllegalParameter(_)
                | Self::SessionBufferOverflow(_)
                | Self::Sam(_)
        )
    }

    /// Details of a command-level failure
    pub const fn failure(&self) -> Option<&CommandFailure> {
        match self {
            Self::CardDataAccess(f)
            | Self::SecurityContext(f)
            | Self::SecurityData(f)
            | Self::IllegalParameter(f)
            | Self::AccessForbidden(f)
            | Self::DataOutOfBounds(f)
            | Self::Terminated(f)
            | Self::SessionBufferOverflow(f)
            | Self::UnknownStatus(f)
            | Self::UnexpectedResponseLength(f) => Some(f),
            _ => None,
        }
    }

    /// Status word that caused the error, if any
    pub fn status(&self) -> Option<StatusWord> {
        self.failure().and_then(|f| f.status)
    }

    pub(crate) const fn unexpected_length(command: CommandRef, message: &'static str) -> Self {
        Self::UnexpectedResponseLength(CommandFailure::local(command, message))
    }
}
