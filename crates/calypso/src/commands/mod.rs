//! Card commands
//!
//! Every command builds its request once, declares how it interacts with
//! the session (buffer usage, anticipated response) and decodes its
//! response into the transaction context.

mod close_session;
mod counter;
mod open_session;
mod read_records;
mod select_file;
mod sv_get;
mod sv_operation;
mod update_record;

use std::fmt;

use bytes::Bytes;
use calypso_apdu_core::{Command, Response};
use derive_more::Display;

pub use close_session::CloseSessionCommand;
pub use counter::CounterCommand;
pub use open_session::OpenSessionCommand;
pub use read_records::{ReadMode, ReadRecordsCommand};
pub use select_file::{SelectFileCommand, SelectedFile};
pub use sv_get::SvGetCommand;
pub use sv_operation::{SvLogStamp, SvOperationCommand};
pub use update_record::UpdateRecordCommand;

use crate::context::{CommandContext, OpenSessionData, TransactionContext};
use crate::error::Error;
use crate::status::StatusTable;
use crate::sv::SvGetData;

/// Identifies the kind of a command in results and errors
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandRef {
    /// Select File
    #[display("Select File")]
    SelectFile,
    /// Read Records
    #[display("Read Records")]
    ReadRecords,
    /// Update Record
    #[display("Update Record")]
    UpdateRecord,
    /// Append Record
    #[display("Append Record")]
    AppendRecord,
    /// Increase
    #[display("Increase")]
    Increase,
    /// Decrease
    #[display("Decrease")]
    Decrease,
    /// Open Secure Session
    #[display("Open Secure Session")]
    OpenSession,
    /// Close Secure Session
    #[display("Close Secure Session")]
    CloseSession,
    /// SV Get
    #[display("SV Get")]
    SvGet,
    /// SV Reload
    #[display("SV Reload")]
    SvReload,
    /// SV Debit
    #[display("SV Debit")]
    SvDebit,
    /// SV Undebit
    #[display("SV Undebit")]
    SvUndebit,
}

impl CommandRef {
    /// Whether the command drives the session lifecycle
    pub const fn is_session_management(self) -> bool {
        matches!(self, Self::OpenSession | Self::CloseSession)
    }
}

/// Response a command expects from the card, computed before the exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anticipation {
    /// The command has no anticipated response
    NotApplicable,
    /// Complete anticipated response, status word included
    Available(Bytes),
    /// The data needed to anticipate the response is not known yet
    Unavailable,
}

/// Decoded outcome of a successful command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    /// Nothing to report beyond success
    None,
    /// File selected
    Selected(SelectedFile),
    /// Records read, by record number
    Records(Vec<(u8, Bytes)>),
    /// New value of a counter
    Counter {
        /// Counter number
        number: u8,
        /// Value after the operation
        value: u32,
    },
    /// Session opened
    SessionOpened(OpenSessionData),
    /// Session closed, with the MAC returned by the card (empty on abort)
    SessionClosed {
        /// Card session MAC
        card_mac: Bytes,
        /// Response data the card postponed until the close, in order
        postponed: Vec<Bytes>,
    },
    /// SV Get response
    SvData(SvGetData),
    /// SV signature returned by the card
    SvSignature(Bytes),
    /// SV operation accepted, its signature comes with the session close
    SvPostponed,
}

/// Capability shared by all card commands
pub trait CardCommand: fmt::Debug + Send {
    /// Kind of the command
    fn command_ref(&self) -> CommandRef;

    /// Request APDU
    fn request(&self) -> &Command;

    /// Statuses of this command, on top of the base table
    fn status_table(&self) -> StatusTable;

    /// Whether the command consumes space in the session buffer
    fn uses_session_buffer(&self) -> bool {
        false
    }

    /// Whether the request needs SAM data before it can be sent
    fn requires_crypto_finalization(&self) -> bool {
        false
    }

    /// Expected response size, status word included
    fn expected_response_length(&self) -> usize {
        self.request().le.map_or(0, usize::from) + 2
    }

    /// Response the card will return, built from data already known
    fn anticipate(&self, _ctx: &TransactionContext) -> Anticipation {
        Anticipation::NotApplicable
    }

    /// Decode a successful response into the transaction context
    fn parse_response(
        &mut self,
        ctx: &mut CommandContext<'_>,
        response: &Response,
    ) -> Result<CommandOutput, Error>;

    /// Keep what can be salvaged from a failed response
    fn parse_partial(
        &mut self,
        _ctx: &mut CommandContext<'_>,
        _response: &Response,
    ) -> Option<CommandOutput> {
        None
    }
}

/// Short file identifier part of P2
pub(crate) const fn sfi_p2(sfi: u8, low_bits: u8) -> u8 {
    sfi.wrapping_mul(8).wrapping_add(low_bits)
}

/// Append the success status word to response data
pub(crate) fn with_success_status(data: &[u8]) -> Bytes {
    let mut bytes = Vec::with_capacity(data.len() + 2);
    bytes.extend_from_slice(data);
    bytes.extend_from_slice(&[0x90, 0x00]);
    Bytes::from(bytes)
}
