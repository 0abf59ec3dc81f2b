use bytes::Bytes;
use calypso_apdu_core::{Command, Response};

use super::{CardCommand, CommandOutput, CommandRef};
use crate::card::CalypsoCard;
use crate::constants::ins;
use crate::context::CommandContext;
use crate::error::Error;
use crate::status::{ErrorKind, StatusEntry, StatusTable};
use crate::sv::{SvGetData, SvOperation};

const STATUS_TABLE: StatusTable = &[
    StatusEntry::failure(
        0x6982,
        "Security conditions not fulfilled",
        ErrorKind::SecurityContext,
    ),
    StatusEntry::failure(
        0x6985,
        "Preconditions not satisfied (a store value operation was already done in the current session)",
        ErrorKind::SecurityContext,
    ),
    StatusEntry::failure(0x6A81, "Incorrect P1 or P2", ErrorKind::IllegalParameter),
    StatusEntry::failure(0x6A86, "Le inconsistent with P2", ErrorKind::IllegalParameter),
    StatusEntry::failure(0x6D00, "SV function not present", ErrorKind::IllegalParameter),
];

/// SV Get command
#[derive(Debug, Clone)]
pub struct SvGetCommand {
    request: Command,
    operation: SvOperation,
}

impl SvGetCommand {
    /// Read the SV state ahead of a reload, or of a debit or undebit
    pub fn new(card: &CalypsoCard, operation: SvOperation) -> Self {
        let p1 = if card.extended_mode { 0x01 } else { 0x00 };
        let p2 = match operation {
            SvOperation::Reload => 0x07,
            SvOperation::Debit => 0x09,
        };
        Self {
            request: Command::new_with_le(card.class.sv_cla(), ins::SV_GET, p1, p2, 0x00),
            operation,
        }
    }

    /// Operation declared to the card
    pub const fn operation(&self) -> SvOperation {
        self.operation
    }

    /// `INS P1 P2 Le` as needed by the SAM to prepare the next SV command
    pub fn header(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.request.ins, self.request.p1, self.request.p2, 0x00])
    }
}

impl CardCommand for SvGetCommand {
    fn command_ref(&self) -> CommandRef {
        CommandRef::SvGet
    }

    fn request(&self) -> &Command {
        &self.request
    }

    fn status_table(&self) -> StatusTable {
        STATUS_TABLE
    }

    fn parse_response(
        &mut self,
        _ctx: &mut CommandContext<'_>,
        response: &Response,
    ) -> Result<CommandOutput, Error> {
        SvGetData::parse(response.payload()).map(CommandOutput::SvData)
    }
}
