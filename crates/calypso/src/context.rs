//! Transaction wide state shared by the commands of a transaction

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bytes::{Bytes, BytesMut};
use derive_more::Display;

use crate::buffer::SessionBufferAccountant;
use crate::card::{CalypsoCard, DirectoryHeader, FileHeader, WriteAccessLevel};
use crate::constants::{COUNTER_MAX, COUNTER_SIZE};
use crate::sv::SvTransactionState;

/// Lifecycle state of the secure session
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session in progress
    #[default]
    #[display("CLOSED")]
    Closed,
    /// Session open, possibly speculatively in pre-open mode
    #[display("OPEN")]
    Open,
    /// Session being aborted
    #[display("ABORTING")]
    Aborting,
}

/// Read access to record contents known outside the transaction
///
/// Consulted after the session cache when building anticipated responses.
pub trait RecordStore: Send + fmt::Debug {
    /// Last known content of a record
    fn cached_content(&self, sfi: u8, record: u8) -> Option<Bytes>;
}

/// Record contents read or written during the transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordCache {
    files: HashMap<u8, BTreeMap<u8, Bytes>>,
}

impl RecordCache {
    /// Content of a record
    pub fn get(&self, sfi: u8, record: u8) -> Option<&Bytes> {
        self.files.get(&sfi).and_then(|records| records.get(&record))
    }

    /// Replace the content of a record
    pub fn set(&mut self, sfi: u8, record: u8, content: Bytes) {
        self.files.entry(sfi).or_default().insert(record, content);
    }

    /// Insert a record at the head of a cyclic file, shifting older ones
    pub fn append_cyclic(&mut self, sfi: u8, content: Bytes) {
        let records = self.files.entry(sfi).or_default();
        let shifted: BTreeMap<u8, Bytes> = std::mem::take(records)
            .into_iter()
            .filter_map(|(number, data)| number.checked_add(1).map(|n| (n, data)))
            .collect();
        *records = shifted;
        records.insert(1, content);
    }

    /// Value of a 3-byte counter stored in record 1
    pub fn counter(&self, sfi: u8, counter: u8) -> Option<u32> {
        let offset = (counter as usize).checked_sub(1)? * COUNTER_SIZE;
        let record = self.get(sfi, 1)?;
        let bytes = record.get(offset..offset + COUNTER_SIZE)?;
        Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
    }

    /// Store the value of a counter, growing record 1 if needed
    pub fn set_counter(&mut self, sfi: u8, counter: u8, value: u32) {
        let Some(index) = (counter as usize).checked_sub(1) else {
            return;
        };
        let offset = index * COUNTER_SIZE;
        let mut record = BytesMut::from(self.get(sfi, 1).map_or(&[][..], |r| r.as_ref()));
        if record.len() < offset + COUNTER_SIZE {
            record.resize(offset + COUNTER_SIZE, 0);
        }
        let value = value.min(COUNTER_MAX).to_be_bytes();
        record[offset..offset + COUNTER_SIZE].copy_from_slice(&value[1..]);
        self.set(sfi, 1, record.freeze());
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.files.values().all(BTreeMap::is_empty)
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.files.clear();
    }
}

/// Data returned by the card when the session opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSessionData {
    /// Card transaction counter
    pub transaction_counter: u32,
    /// Card challenge (counter and random number)
    pub card_challenge: Bytes,
    /// Whether the previous session was ratified
    pub previous_session_ratified: bool,
    /// Whether Manage Secure Session is allowed (extended mode only)
    pub manage_secure_session_authorized: bool,
    /// Key identifier
    pub kif: u8,
    /// Key version
    pub kvc: u8,
    /// Content of the record read at opening, possibly empty
    pub record_data: Bytes,
}

/// State of one logical transaction
#[derive(Debug)]
pub struct TransactionContext {
    card: CalypsoCard,
    pub(crate) directory: Option<DirectoryHeader>,
    pub(crate) file_headers: HashMap<u8, FileHeader>,
    pub(crate) records: RecordCache,
    store: Option<Box<dyn RecordStore>>,
    pub(crate) write_access_level: Option<WriteAccessLevel>,
    pub(crate) session: SessionState,
    pub(crate) session_data: Option<OpenSessionData>,
    pub(crate) encryption_active: bool,
    pub(crate) pre_open: bool,
    pub(crate) finished: bool,
    pub(crate) buffer: SessionBufferAccountant,
    pub(crate) sv: SvTransactionState,
}

impl TransactionContext {
    /// Create a context for the given card
    pub fn new(card: CalypsoCard) -> Self {
        let buffer = SessionBufferAccountant::new(card.session_buffer);
        Self {
            card,
            directory: None,
            file_headers: HashMap::new(),
            records: RecordCache::default(),
            store: None,
            write_access_level: None,
            session: SessionState::Closed,
            session_data: None,
            encryption_active: false,
            pre_open: false,
            finished: false,
            buffer,
            sv: SvTransactionState::default(),
        }
    }

    pub(crate) fn set_record_store(&mut self, store: Box<dyn RecordStore>) {
        self.store = Some(store);
    }

    /// Card snapshot
    pub const fn card(&self) -> &CalypsoCard {
        &self.card
    }

    /// Header of the current directory, once selected
    pub const fn directory(&self) -> Option<&DirectoryHeader> {
        self.directory.as_ref()
    }

    /// Header of an elementary file, once selected
    pub fn file_header(&self, sfi: u8) -> Option<&FileHeader> {
        self.file_headers.get(&sfi)
    }

    /// Records cached during the transaction
    pub const fn records(&self) -> &RecordCache {
        &self.records
    }

    /// Last known content of a record, from the cache then the record store
    pub fn record_content(&self, sfi: u8, record: u8) -> Option<Bytes> {
        self.records
            .get(sfi, record)
            .cloned()
            .or_else(|| self.store.as_ref().and_then(|s| s.cached_content(sfi, record)))
    }

    /// Access level of the current session
    pub const fn write_access_level(&self) -> Option<WriteAccessLevel> {
        self.write_access_level
    }

    /// Session lifecycle state
    pub const fn session_state(&self) -> SessionState {
        self.session
    }

    /// Whether a session is open, possibly speculatively
    pub const fn is_session_open(&self) -> bool {
        matches!(self.session, SessionState::Open)
    }

    /// Data returned by the last Open Secure Session
    pub const fn session_data(&self) -> Option<&OpenSessionData> {
        self.session_data.as_ref()
    }

    /// Whether commands are ciphered
    pub const fn is_encryption_active(&self) -> bool {
        self.encryption_active
    }

    /// Whether the session was opened in pre-open mode
    pub const fn is_pre_open(&self) -> bool {
        self.pre_open
    }

    /// Whether the transaction ended and awaits a reset
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Session buffer accountant
    pub const fn buffer(&self) -> &SessionBufferAccountant {
        &self.buffer
    }

    /// Stored value state
    pub const fn sv(&self) -> &SvTransactionState {
        &self.sv
    }

    pub(crate) fn end_session(&mut self) {
        self.session = SessionState::Closed;
        self.encryption_active = false;
        self.pre_open = false;
        self.records.clear();
    }

    pub(crate) fn reset(&mut self) {
        self.end_session();
        self.directory = None;
        self.file_headers.clear();
        self.write_access_level = None;
        self.session_data = None;
        self.finished = false;
        self.buffer.reset();
        self.sv = SvTransactionState::default();
    }
}

/// Per-command view on the transaction
#[derive(Debug)]
pub struct CommandContext<'a> {
    /// Owning transaction
    pub transaction: &'a mut TransactionContext,
}

impl<'a> CommandContext<'a> {
    /// Borrow `transaction` for one command
    pub const fn new(transaction: &'a mut TransactionContext) -> Self {
        Self { transaction }
    }
}
