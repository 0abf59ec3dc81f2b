//! Security module (SAM) collaborator
//!
//! The engine never computes cryptograms itself. It tells the SAM which
//! bytes enter the session digest and asks it for MACs, ciphered APDUs and
//! stored value signatures. A physical SAM handles one operation at a time,
//! so every call goes through a [`SharedSam`] lock.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::card::WriteAccessLevel;
use crate::sv::{SvAction, SvOperation};

/// Errors reported by the SAM collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SamError {
    /// The SAM refused the operation
    #[error("SAM access forbidden: {0}")]
    AccessForbidden(&'static str),

    /// Incorrect data submitted to the SAM
    #[error("SAM security data error: {0}")]
    SecurityData(&'static str),

    /// The SAM is not in a state allowing the operation
    #[error("SAM illegal state: {0}")]
    IllegalState(&'static str),

    /// Failure talking to the SAM
    #[error("SAM communication error: {0}")]
    Communication(String),
}

/// Data needed by the SAM to start the session digest
#[derive(Debug, Clone, Copy)]
pub struct DigestInit<'a> {
    /// Access level of the session
    pub level: WriteAccessLevel,
    /// Key identifier returned by the card
    pub kif: u8,
    /// Key version returned by the card
    pub kvc: u8,
    /// Revision 3.2 extended mode in use
    pub extended_mode: bool,
    /// Data of the Open Secure Session response
    pub open_session_data: &'a [u8],
}

/// Data needed by the SAM to sign an SV Reload, Debit or Undebit
#[derive(Debug, Clone, Copy)]
pub struct SvPrepareRequest<'a> {
    /// Operation declared at SV Get
    pub operation: SvOperation,
    /// Action to sign
    pub action: SvAction,
    /// Header of the SV Get command (`INS P1 P2 Le`)
    pub sv_get_header: &'a [u8],
    /// Complete SV Get response, status word included
    pub sv_get_response: &'a [u8],
    /// SV command under construction, up to the SAM supplied fields
    pub partial_request: &'a [u8],
}

/// SAM supplied fields of an SV Reload, Debit or Undebit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvSecurityData {
    /// SAM serial number
    pub sam_id: [u8; 4],
    /// SAM transaction number
    pub sam_tnum: [u8; 3],
    /// High part of the SV signature (5 or 10 bytes)
    pub signature_hi: Bytes,
}

/// Operations the engine requires from a SAM
pub trait SecurityModule: Send + fmt::Debug {
    /// Produce the terminal challenge sent in Open Secure Session
    fn terminal_challenge(&mut self, length: usize) -> Result<Bytes, SamError>;

    /// Start a new session digest from the Open Secure Session response
    fn init_session_digest(&mut self, init: &DigestInit<'_>) -> Result<(), SamError>;

    /// Feed a request or a response into the running session digest
    fn update_session_digest(&mut self, apdu: &[u8]) -> Result<(), SamError>;

    /// Finalize the digest and return the terminal session MAC
    fn compute_session_mac(&mut self) -> Result<Bytes, SamError>;

    /// Check the MAC returned by the card at session close
    fn verify_card_mac(&mut self, card_mac: &[u8]) -> Result<bool, SamError>;

    /// Cipher a request; the plain request also enters the digest
    fn encrypt_request(&mut self, apdu: &[u8]) -> Result<Bytes, SamError>;

    /// Decipher a response; the plain response also enters the digest
    fn decrypt_response(&mut self, apdu: &[u8]) -> Result<Bytes, SamError>;

    /// Compute the SAM part of an SV command
    fn prepare_sv_operation(
        &mut self,
        request: &SvPrepareRequest<'_>,
    ) -> Result<SvSecurityData, SamError>;

    /// Check the SV signature returned by the card
    fn verify_sv_signature(&mut self, signature: &[u8]) -> Result<bool, SamError>;

    /// Drop any digest in progress
    fn reset_session(&mut self) -> Result<(), SamError> {
        Ok(())
    }
}

/// Handle on a SAM shared between transactions
#[derive(Debug)]
pub struct SharedSam<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedSam<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: SecurityModule> SharedSam<S> {
    /// Wrap a SAM
    pub fn new(sam: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sam)),
        }
    }

    /// Exclusive access to the SAM for one operation
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock()
    }

    /// Run a closure with exclusive access to the SAM
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.inner.lock())
    }
}
