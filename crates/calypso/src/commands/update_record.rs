use bytes::Bytes;
use calypso_apdu_core::{Command, Response};

use super::{Anticipation, CardCommand, CommandOutput, CommandRef, sfi_p2, with_success_status};
use crate::card::CardClass;
use crate::constants::ins;
use crate::context::{CommandContext, TransactionContext};
use crate::error::Error;
use crate::status::{ErrorKind, StatusEntry, StatusTable};

const UPDATE_STATUS_TABLE: StatusTable = &[
    StatusEntry::failure(
        0x6400,
        "Too many modifications in session",
        ErrorKind::SessionBufferOverflow,
    ),
    StatusEntry::failure(0x6700, "Lc value not supported", ErrorKind::IllegalParameter),
    StatusEntry::failure(
        0x6981,
        "Command forbidden on cyclic files when the record exists and is not record 01h and on binary files",
        ErrorKind::CardDataAccess,
    ),
    StatusEntry::failure(
        0x6982,
        "Security conditions not fulfilled (no session, wrong key, encryption required)",
        ErrorKind::SecurityContext,
    ),
    StatusEntry::failure(
        0x6985,
        "Access forbidden (Never access mode, DF is invalidated, etc.)",
        ErrorKind::AccessForbidden,
    ),
    StatusEntry::failure(0x6986, "Command not allowed (no current EF)", ErrorKind::CardDataAccess),
    StatusEntry::failure(0x6A82, "File not found", ErrorKind::CardDataAccess),
    StatusEntry::failure(
        0x6A83,
        "Record is not found (record index is 0 or above NumRec)",
        ErrorKind::CardDataAccess,
    ),
    StatusEntry::failure(0x6B00, "P2 value not supported", ErrorKind::IllegalParameter),
];

const APPEND_STATUS_TABLE: StatusTable = &[
    StatusEntry::failure(
        0x6400,
        "Too many modifications in session",
        ErrorKind::SessionBufferOverflow,
    ),
    StatusEntry::failure(0x6700, "Lc value not supported", ErrorKind::IllegalParameter),
    StatusEntry::failure(0x6981, "The current EF is not a Cyclic EF", ErrorKind::CardDataAccess),
    StatusEntry::failure(
        0x6982,
        "Security conditions not fulfilled (no session, wrong key)",
        ErrorKind::SecurityContext,
    ),
    StatusEntry::failure(
        0x6985,
        "Access forbidden (Never access mode, DF is invalidated, etc.)",
        ErrorKind::AccessForbidden,
    ),
    StatusEntry::failure(0x6986, "Command not allowed (no current EF)", ErrorKind::CardDataAccess),
    StatusEntry::failure(0x6A82, "File not found", ErrorKind::CardDataAccess),
    StatusEntry::failure(0x6B00, "P1 or P2 value not supported", ErrorKind::IllegalParameter),
];

/// Update Record or Append Record command
#[derive(Debug, Clone)]
pub struct UpdateRecordCommand {
    request: Command,
    command_ref: CommandRef,
    sfi: u8,
    record: u8,
    data: Bytes,
}

impl UpdateRecordCommand {
    /// Replace the content of a record
    pub fn update(class: CardClass, sfi: u8, record: u8, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            request: Command::new_with_data(
                class.cla(),
                ins::UPDATE_RECORD,
                record,
                sfi_p2(sfi, 4),
                data.clone(),
            ),
            command_ref: CommandRef::UpdateRecord,
            sfi,
            record,
            data,
        }
    }

    /// Add a record at the head of a cyclic file
    pub fn append(class: CardClass, sfi: u8, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            request: Command::new_with_data(
                class.cla(),
                ins::APPEND_RECORD,
                0x00,
                sfi_p2(sfi, 0),
                data.clone(),
            ),
            command_ref: CommandRef::AppendRecord,
            sfi,
            record: 1,
            data,
        }
    }
}

impl CardCommand for UpdateRecordCommand {
    fn command_ref(&self) -> CommandRef {
        self.command_ref
    }

    fn request(&self) -> &Command {
        &self.request
    }

    fn status_table(&self) -> StatusTable {
        match self.command_ref {
            CommandRef::AppendRecord => APPEND_STATUS_TABLE,
            _ => UPDATE_STATUS_TABLE,
        }
    }

    fn uses_session_buffer(&self) -> bool {
        true
    }

    fn anticipate(&self, _ctx: &TransactionContext) -> Anticipation {
        Anticipation::Available(with_success_status(&[]))
    }

    fn parse_response(
        &mut self,
        ctx: &mut CommandContext<'_>,
        _response: &Response,
    ) -> Result<CommandOutput, Error> {
        let records = &mut ctx.transaction.records;
        match self.command_ref {
            CommandRef::AppendRecord => records.append_cyclic(self.sfi, self.data.clone()),
            _ => records.set(self.sfi, self.record, self.data.clone()),
        }
        Ok(CommandOutput::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferCapacity;
    use crate::card::CalypsoCard;
    use hex_literal::hex;

    #[test]
    fn test_request_bytes() {
        let update = UpdateRecordCommand::update(CardClass::Iso, 0x08, 1, hex!("AABB").to_vec());
        assert_eq!(update.request().to_bytes().as_ref(), hex!("00DC014402AABB"));
        assert!(update.uses_session_buffer());

        let append = UpdateRecordCommand::append(CardClass::Iso, 0x08, hex!("CC").to_vec());
        assert_eq!(append.request().to_bytes().as_ref(), hex!("00E2004001CC"));
    }

    #[test]
    fn test_parse_updates_cache() {
        let mut ctx =
            TransactionContext::new(CalypsoCard::new(vec![1; 8], BufferCapacity::bytes(430)));
        let ok = Response::from_bytes(&hex!("9000")).unwrap();

        let mut update =
            UpdateRecordCommand::update(CardClass::Iso, 0x08, 1, hex!("AABB").to_vec());
        update
            .parse_response(&mut CommandContext::new(&mut ctx), &ok)
            .unwrap();
        let mut append = UpdateRecordCommand::append(CardClass::Iso, 0x08, hex!("CC").to_vec());
        append
            .parse_response(&mut CommandContext::new(&mut ctx), &ok)
            .unwrap();

        assert_eq!(ctx.records().get(0x08, 1).unwrap().as_ref(), hex!("CC"));
        assert_eq!(ctx.records().get(0x08, 2).unwrap().as_ref(), hex!("AABB"));
        assert_eq!(
            update.anticipate(&ctx),
            Anticipation::Available(Bytes::from_static(&hex!("9000")))
        );
    }
}
