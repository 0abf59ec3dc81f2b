//! Status word to error mapping
//!
//! Every command owns a static table associating status words with an
//! outcome. Lookups fall back to [`BASE_STATUS_TABLE`], and a status word
//! found in neither table maps to [`Error::UnknownStatus`].

use calypso_apdu_core::StatusWord;
use tracing::{debug, warn};

use crate::commands::CommandRef;
use crate::error::{CommandFailure, Error};

/// Class of error raised for a failing status word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`Error::CardDataAccess`]
    CardDataAccess,
    /// See [`Error::SecurityContext`]
    SecurityContext,
    /// See [`Error::SecurityData`]
    SecurityData,
    /// See [`Error::IllegalParameter`]
    IllegalParameter,
    /// See [`Error::AccessForbidden`]
    AccessForbidden,
    /// See [`Error::DataOutOfBounds`]
    DataOutOfBounds,
    /// See [`Error::Terminated`]
    Terminated,
    /// See [`Error::SessionBufferOverflow`]
    SessionBufferOverflow,
}

impl ErrorKind {
    /// Wrap a failure into the matching error variant
    pub const fn into_error(self, failure: CommandFailure) -> Error {
        match self {
            Self::CardDataAccess => Error::CardDataAccess(failure),
            Self::SecurityContext => Error::SecurityContext(failure),
            Self::SecurityData => Error::SecurityData(failure),
            Self::IllegalParameter => Error::IllegalParameter(failure),
            Self::AccessForbidden => Error::AccessForbidden(failure),
            Self::DataOutOfBounds => Error::DataOutOfBounds(failure),
            Self::Terminated => Error::Terminated(failure),
            Self::SessionBufferOverflow => Error::SessionBufferOverflow(failure),
        }
    }
}

/// Entry of a status table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEntry {
    /// Status word, SW1 in the high byte
    pub status: u16,
    /// Description of the status
    pub message: &'static str,
    /// `None` for a successful status
    pub outcome: Option<ErrorKind>,
}

impl StatusEntry {
    /// Successful status
    pub const fn success(status: u16, message: &'static str) -> Self {
        Self {
            status,
            message,
            outcome: None,
        }
    }

    /// Failing status
    pub const fn failure(status: u16, message: &'static str, kind: ErrorKind) -> Self {
        Self {
            status,
            message,
            outcome: Some(kind),
        }
    }
}

/// Status table of a command
pub type StatusTable = &'static [StatusEntry];

/// Statuses shared by every command
pub const BASE_STATUS_TABLE: StatusTable = &[
    StatusEntry::success(0x9000, "Successful execution"),
    StatusEntry::failure(0x6D00, "Instruction unknown", ErrorKind::IllegalParameter),
    StatusEntry::failure(0x6E00, "Class not supported", ErrorKind::IllegalParameter),
];

fn lookup(table: StatusTable, status: u16) -> Option<&'static StatusEntry> {
    table
        .iter()
        .chain(BASE_STATUS_TABLE.iter())
        .find(|entry| entry.status == status)
}

/// Whether the table marks this status word as successful
pub fn is_success(table: StatusTable, status: StatusWord) -> bool {
    lookup(table, status.to_u16()).is_some_and(|entry| entry.outcome.is_none())
}

/// Map a status word to the outcome declared by the command table
pub fn check_status(
    command: CommandRef,
    table: StatusTable,
    status: StatusWord,
) -> Result<(), Error> {
    let Some(entry) = lookup(table, status.to_u16()) else {
        warn!(%command, %status, "Status word absent from the command table");
        return Err(Error::UnknownStatus(CommandFailure::from_status(
            command,
            status.description(),
            status,
        )));
    };

    match entry.outcome {
        None => Ok(()),
        Some(kind) => {
            debug!(%command, %status, cause = entry.message, "Command failed");
            Err(kind.into_error(CommandFailure::from_status(command, entry.message, status)))
        }
    }
}
