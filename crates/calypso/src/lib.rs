//! Calypso card secure session transactions
//!
//! Drives a Calypso card through secure sessions over ISO/IEC 7816-4 APDUs,
//! keeping a SAM session digest in step with every exchange:
//!
//! - session lifecycle, including pre-open and multiple session modes
//! - SAM synchronization (post exchange, anticipated or ciphered)
//! - session buffer accounting
//! - stored value Get / Reload / Debit / Undebit / Check sequencing
//! - status word mapping into typed errors
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

mod buffer;
mod card;
pub mod commands;
mod config;
pub mod constants;
mod context;
mod crypto;
mod error;
mod sam;
mod status;
mod sv;
mod transaction;

pub use buffer::{BufferCapacity, SessionBufferAccountant};
pub use commands::{CardCommand, CommandOutput, CommandRef};
pub use card::{CalypsoCard, CardClass, DirectoryHeader, EfType, FileHeader, WriteAccessLevel};
pub use config::TransactionSettings;
pub use context::{
    CommandContext, OpenSessionData, RecordCache, RecordStore, SessionState, TransactionContext,
};
pub use crypto::{CryptoSynchronizer, SyncStrategy};
pub use error::{CommandFailure, Error, Result};
pub use sam::{DigestInit, SamError, SecurityModule, SharedSam, SvPrepareRequest, SvSecurityData};
pub use status::{BASE_STATUS_TABLE, ErrorKind, StatusEntry, StatusTable, check_status, is_success};
pub use sv::{
    StoredValueCoordinator, SvAction, SvDebitLogRecord, SvGetData, SvLoadLogRecord, SvOperation,
    SvPhase, SvTransactionState,
};
pub use transaction::{BatchReport, CardTransaction, CommandOutcome, CommandResult};

pub use calypso_apdu_core::{CardTransport, StatusWord, TransportError};
