use bytes::Bytes;
use calypso_apdu_core::response::utils::extract_int;
use calypso_apdu_core::{Command, Response};
use tracing::debug;

use super::{CardCommand, CommandOutput, CommandRef, sfi_p2};
use crate::card::{CalypsoCard, WriteAccessLevel};
use crate::constants::ins;
use crate::context::{CommandContext, OpenSessionData};
use crate::error::Error;
use crate::status::{ErrorKind, StatusEntry, StatusTable};

const STATUS_TABLE: StatusTable = &[
    StatusEntry::failure(0x6700, "Lc value not supported", ErrorKind::IllegalParameter),
    StatusEntry::failure(0x6900, "Transaction Counter is 0", ErrorKind::Terminated),
    StatusEntry::failure(
        0x6981,
        "Command forbidden (read requested and current EF is a Binary file)",
        ErrorKind::CardDataAccess,
    ),
    StatusEntry::failure(
        0x6982,
        "Security conditions not fulfilled (PIN code not presented, AES key forbidding the compatibility mode, encryption required)",
        ErrorKind::SecurityContext,
    ),
    StatusEntry::failure(
        0x6985,
        "Access forbidden (Never access mode, Session already opened)",
        ErrorKind::AccessForbidden,
    ),
    StatusEntry::failure(
        0x6986,
        "Command not allowed (read requested and no current EF)",
        ErrorKind::CardDataAccess,
    ),
    StatusEntry::failure(0x6A81, "Wrong key index", ErrorKind::SecurityContext),
    StatusEntry::failure(0x6A82, "File not found", ErrorKind::CardDataAccess),
    StatusEntry::failure(
        0x6A83,
        "Record not found (record index is above NumRec)",
        ErrorKind::CardDataAccess,
    ),
    StatusEntry::failure(0x6B00, "P1 or P2 value not supported", ErrorKind::IllegalParameter),
];

/// Open Secure Session command (revision 3)
#[derive(Debug, Clone)]
pub struct OpenSessionCommand {
    request: Command,
    level: WriteAccessLevel,
    extended_mode: bool,
    sfi: u8,
    record: u8,
}

impl OpenSessionCommand {
    /// Open a session at `level`, optionally reading `record` of `sfi`
    ///
    /// A record number of zero opens the session without reading anything.
    pub fn new(
        card: &CalypsoCard,
        level: WriteAccessLevel,
        terminal_challenge: &[u8],
        sfi: u8,
        record: u8,
    ) -> Self {
        let p1 = record.wrapping_mul(8).wrapping_add(level.key_index());
        let (p2, data) = if card.extended_mode {
            let mut data = Vec::with_capacity(terminal_challenge.len() + 1);
            data.push(0x00);
            data.extend_from_slice(terminal_challenge);
            (sfi_p2(sfi, 2), Bytes::from(data))
        } else {
            (sfi_p2(sfi, 1), Bytes::copy_from_slice(terminal_challenge))
        };
        Self {
            request: Command::new_with_data_and_le(
                card.class.cla(),
                ins::OPEN_SESSION,
                p1,
                p2,
                data,
                0x00,
            ),
            level,
            extended_mode: card.extended_mode,
            sfi,
            record,
        }
    }

    /// Access level requested
    pub const fn level(&self) -> WriteAccessLevel {
        self.level
    }

    fn decode(&self, payload: &[u8]) -> Option<OpenSessionData> {
        let (challenge_length, flags, header_length) = if self.extended_mode {
            (8, *payload.get(8)?, 12)
        } else {
            // ratification byte is 00 when the previous session was not ratified
            (4, u8::from(*payload.get(4)? == 0x00), 8)
        };
        let data_length = usize::from(*payload.get(header_length - 1)?);
        if payload.len() != header_length + data_length {
            return None;
        }
        Some(OpenSessionData {
            transaction_counter: extract_int(payload, 0, 3, false) as u32,
            card_challenge: Bytes::copy_from_slice(&payload[..challenge_length]),
            previous_session_ratified: flags & 0x01 == 0,
            manage_secure_session_authorized: self.extended_mode && flags & 0x02 != 0,
            kif: payload[header_length - 3],
            kvc: payload[header_length - 2],
            record_data: Bytes::copy_from_slice(&payload[header_length..]),
        })
    }
}

impl CardCommand for OpenSessionCommand {
    fn command_ref(&self) -> CommandRef {
        CommandRef::OpenSession
    }

    fn request(&self) -> &Command {
        &self.request
    }

    fn status_table(&self) -> StatusTable {
        STATUS_TABLE
    }

    fn parse_response(
        &mut self,
        ctx: &mut CommandContext<'_>,
        response: &Response,
    ) -> Result<CommandOutput, Error> {
        let data = self.decode(response.payload()).ok_or_else(|| {
            Error::unexpected_length(
                CommandRef::OpenSession,
                "Malformed Open Secure Session response",
            )
        })?;
        debug!(
            level = %self.level,
            tc = data.transaction_counter,
            ratified = data.previous_session_ratified,
            kif = data.kif,
            kvc = data.kvc,
            "Secure session opened"
        );

        let transaction = &mut *ctx.transaction;
        if self.record != 0 && !data.record_data.is_empty() {
            transaction
                .records
                .set(self.sfi, self.record, data.record_data.clone());
        }
        transaction.write_access_level = Some(self.level);
        transaction.session_data = Some(data.clone());
        Ok(CommandOutput::SessionOpened(data))
    }
}
