use bytes::Bytes;
use calypso_apdu_core::{Command, Response};

use super::{CardCommand, CommandOutput, CommandRef};
use crate::card::{CalypsoCard, CardClass};
use crate::constants::ins;
use crate::context::CommandContext;
use crate::error::Error;
use crate::status::{ErrorKind, StatusEntry, StatusTable};

const STATUS_TABLE: StatusTable = &[
    StatusEntry::failure(
        0x6700,
        "Lc signatureLo not supported (e.g. Lc=4 with a Revision 3.2 mode for Open Secure Session)",
        ErrorKind::IllegalParameter,
    ),
    StatusEntry::failure(0x6B00, "P1 or P2 signatureLo not supported", ErrorKind::IllegalParameter),
    StatusEntry::failure(0x6988, "incorrect signatureLo", ErrorKind::SecurityData),
    StatusEntry::failure(0x6985, "No session was opened", ErrorKind::AccessForbidden),
];

/// Close Secure Session command
#[derive(Debug, Clone)]
pub struct CloseSessionCommand {
    request: Command,
    mac_length: usize,
    abort: bool,
}

impl CloseSessionCommand {
    /// Close the session with the terminal MAC
    pub fn close(card: &CalypsoCard, p1: u8, terminal_mac: impl Into<Bytes>) -> Self {
        Self {
            request: Command::new_with_data_and_le(
                card.class.cla(),
                ins::CLOSE_SESSION,
                p1,
                0x00,
                terminal_mac,
                0x00,
            ),
            mac_length: card.mac_length(),
            abort: false,
        }
    }

    /// Abort the session, the card cancels every modification
    pub fn abort(class: CardClass) -> Self {
        Self {
            request: Command::new_with_data(
                class.cla(),
                ins::CLOSE_SESSION,
                0x00,
                0x00,
                Bytes::new(),
            ),
            mac_length: 0,
            abort: true,
        }
    }

    /// Whether this is an abort
    pub const fn is_abort(&self) -> bool {
        self.abort
    }
}

impl CardCommand for CloseSessionCommand {
    fn command_ref(&self) -> CommandRef {
        CommandRef::CloseSession
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
        if self.abort {
            return Ok(CommandOutput::SessionClosed {
                card_mac: Bytes::new(),
                postponed: Vec::new(),
            });
        }
        let payload = response.payload_bytes();
        if payload.len() < self.mac_length {
            return Err(Error::unexpected_length(
                CommandRef::CloseSession,
                "Card session MAC missing",
            ));
        }
        let mac_offset = payload.len() - self.mac_length;
        Ok(CommandOutput::SessionClosed {
            card_mac: payload.slice(mac_offset..),
            postponed: parse_postponed(&payload.slice(..mac_offset))?,
        })
    }
}

/// Split the length prefixed items preceding the card MAC
fn parse_postponed(data: &Bytes) -> Result<Vec<Bytes>, Error> {
    let mut items = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let end = offset + 1 + data[offset] as usize;
        if end > data.len() {
            return Err(Error::unexpected_length(
                CommandRef::CloseSession,
                "Malformed postponed data",
            ));
        }
        items.push(data.slice(offset + 1..end));
        offset = end;
    }
    Ok(items)
}
