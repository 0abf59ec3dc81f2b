use bytes::Bytes;
use calypso_apdu_core::{Command, Response};
use tracing::trace;

use super::{Anticipation, CardCommand, CommandOutput, CommandRef, sfi_p2, with_success_status};
use crate::card::CardClass;
use crate::constants::ins;
use crate::context::{CommandContext, TransactionContext};
use crate::error::Error;
use crate::status::{ErrorKind, StatusEntry, StatusTable};

const STATUS_TABLE: StatusTable = &[
    StatusEntry::failure(0x6981, "Command forbidden on binary files", ErrorKind::CardDataAccess),
    StatusEntry::failure(
        0x6982,
        "Security conditions not fulfilled (PIN code not presented, encryption required)",
        ErrorKind::SecurityContext,
    ),
    StatusEntry::failure(
        0x6985,
        "Access forbidden (Never access mode, stored value log file and a stored value operation was done during the current session)",
        ErrorKind::AccessForbidden,
    ),
    StatusEntry::failure(0x6986, "Command not allowed (no current EF)", ErrorKind::CardDataAccess),
    StatusEntry::failure(0x6A82, "File not found", ErrorKind::CardDataAccess),
    StatusEntry::failure(
        0x6A83,
        "Record not found (record index is 0, or above NumRec)",
        ErrorKind::CardDataAccess,
    ),
    StatusEntry::failure(0x6B00, "P2 value not supported", ErrorKind::IllegalParameter),
];

/// Read Records mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// One record, response is the raw record content
    OneRecord,
    /// Several records, response is a list of `[number length content]`
    MultipleRecords {
        /// Size of each record
        record_size: usize,
    },
}

/// Read Records command
#[derive(Debug, Clone)]
pub struct ReadRecordsCommand {
    request: Command,
    sfi: u8,
    first_record: u8,
    mode: ReadMode,
}

impl ReadRecordsCommand {
    /// Read one record; `le` of zero reads the whole record
    pub fn one(class: CardClass, sfi: u8, record: u8, le: u8) -> Self {
        Self::new(class, sfi, record, ReadMode::OneRecord, le)
    }

    /// Read `le / (record_size + 2)` consecutive records starting at `first_record`
    pub fn multiple(
        class: CardClass,
        sfi: u8,
        first_record: u8,
        record_size: usize,
        le: u8,
    ) -> Self {
        Self::new(
            class,
            sfi,
            first_record,
            ReadMode::MultipleRecords { record_size },
            le,
        )
    }

    fn new(class: CardClass, sfi: u8, first_record: u8, mode: ReadMode, le: u8) -> Self {
        let p2 = match mode {
            ReadMode::OneRecord => sfi_p2(sfi, 4),
            ReadMode::MultipleRecords { .. } => sfi_p2(sfi, 5),
        };
        Self {
            request: Command::new_with_le(class.cla(), ins::READ_RECORDS, first_record, p2, le),
            sfi,
            first_record,
            mode,
        }
    }

    /// Short file identifier
    pub const fn sfi(&self) -> u8 {
        self.sfi
    }

    /// First record read
    pub const fn first_record(&self) -> u8 {
        self.first_record
    }

    /// Read mode
    pub const fn mode(&self) -> ReadMode {
        self.mode
    }

    fn le(&self) -> usize {
        self.request.le.map_or(0, usize::from)
    }

    fn anticipate_one(&self, ctx: &TransactionContext) -> Option<Bytes> {
        let content = ctx.record_content(self.sfi, self.first_record)?;
        let le = self.le();
        if content.is_empty() || content.len() < le {
            return None;
        }
        let length = if le != 0 { le } else { content.len() };
        Some(with_success_status(&content[..length]))
    }

    fn anticipate_multiple(&self, ctx: &TransactionContext, record_size: usize) -> Option<Bytes> {
        let count = self.le() / (record_size + 2);
        if count == 0 {
            return None;
        }
        let mut data = Vec::with_capacity(self.le());
        for offset in 0..count {
            let number = self.first_record.checked_add(u8::try_from(offset).ok()?)?;
            let content = ctx.record_content(self.sfi, number)?;
            if content.len() < record_size {
                return None;
            }
            data.push(number);
            data.push(record_size as u8);
            data.extend_from_slice(&content[..record_size]);
        }
        Some(with_success_status(&data))
    }

    /// Split a multiple-record payload, stopping at the first malformed entry
    fn split_records(data: &[u8]) -> (Vec<(u8, Bytes)>, bool) {
        let mut records = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let [number, length, tail @ ..] = rest else {
                return (records, false);
            };
            let length = usize::from(*length);
            if tail.len() < length {
                return (records, false);
            }
            records.push((*number, Bytes::copy_from_slice(&tail[..length])));
            rest = &tail[length..];
        }
        (records, true)
    }

    fn store(&self, ctx: &mut CommandContext<'_>, records: &[(u8, Bytes)]) {
        for (number, content) in records {
            trace!(sfi = self.sfi, record = number, "Caching record content");
            ctx.transaction.records.set(self.sfi, *number, content.clone());
        }
    }
}

impl CardCommand for ReadRecordsCommand {
    fn command_ref(&self) -> CommandRef {
        CommandRef::ReadRecords
    }

    fn request(&self) -> &Command {
        &self.request
    }

    fn status_table(&self) -> StatusTable {
        STATUS_TABLE
    }

    fn anticipate(&self, ctx: &TransactionContext) -> Anticipation {
        let anticipated = match self.mode {
            ReadMode::OneRecord => self.anticipate_one(ctx),
            ReadMode::MultipleRecords { record_size } => self.anticipate_multiple(ctx, record_size),
        };
        anticipated.map_or(Anticipation::Unavailable, Anticipation::Available)
    }

    fn parse_response(
        &mut self,
        ctx: &mut CommandContext<'_>,
        response: &Response,
    ) -> Result<CommandOutput, Error> {
        let records = match self.mode {
            ReadMode::OneRecord => vec![(self.first_record, response.payload_bytes())],
            ReadMode::MultipleRecords { .. } => {
                let (records, complete) = Self::split_records(response.payload());
                if !complete {
                    return Err(Error::unexpected_length(
                        CommandRef::ReadRecords,
                        "Malformed multiple records response",
                    ));
                }
                records
            }
        };
        self.store(ctx, &records);
        Ok(CommandOutput::Records(records))
    }

    fn parse_partial(
        &mut self,
        ctx: &mut CommandContext<'_>,
        response: &Response,
    ) -> Option<CommandOutput> {
        if !matches!(self.mode, ReadMode::MultipleRecords { .. }) {
            return None;
        }
        let (records, _) = Self::split_records(response.payload());
        if records.is_empty() {
            return None;
        }
        self.store(ctx, &records);
        Some(CommandOutput::Records(records))
    }
}
