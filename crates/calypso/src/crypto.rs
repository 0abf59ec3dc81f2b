//! Keeps the SAM session digest in step with the card exchanges
//!
//! Every APDU exchanged inside a secure session must enter the SAM digest,
//! request then response, exactly once. Depending on the session mode this
//! happens after the exchange, before it (pre-open mode, from an anticipated
//! response) or through the SAM cipher when encryption is active.

use bytes::Bytes;
use calypso_apdu_core::{Response, TransportError};
use tracing::{debug, trace, warn};

use crate::commands::{Anticipation, CardCommand, CommandRef};
use crate::context::TransactionContext;
use crate::error::{CommandFailure, Error, Result};
use crate::sam::SecurityModule;

/// How a command is synchronized with the SAM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Outside a session, or the command drives the session itself
    None,
    /// Request ciphered and response deciphered by the SAM
    Encrypted,
    /// Request and anticipated response fed before the exchange
    Anticipated(Bytes),
    /// Pre-open command whose response could not be anticipated, fed after
    /// the exchange instead
    Deferred,
    /// Request and response fed after the exchange
    PostOnly,
}

impl SyncStrategy {
    /// Whether the SAM is involved before the exchange
    pub const fn requires_pre_sync(&self) -> bool {
        matches!(self, Self::Encrypted | Self::Anticipated(_))
    }

    /// Whether the SAM is involved after the exchange
    pub const fn requires_post_sync(&self) -> bool {
        matches!(self, Self::Encrypted | Self::PostOnly | Self::Deferred)
    }
}

/// Decides and applies the synchronization of each command
#[derive(Debug, Clone, Copy, Default)]
pub struct CryptoSynchronizer;

impl CryptoSynchronizer {
    /// Pick the strategy of a command given the session state
    pub fn strategy(&self, ctx: &TransactionContext, command: &dyn CardCommand) -> SyncStrategy {
        if !ctx.is_session_open() || command.command_ref().is_session_management() {
            return SyncStrategy::None;
        }
        if ctx.is_encryption_active() {
            return SyncStrategy::Encrypted;
        }
        if !ctx.is_pre_open() || command.requires_crypto_finalization() {
            return SyncStrategy::PostOnly;
        }
        match command.anticipate(ctx) {
            Anticipation::NotApplicable => SyncStrategy::PostOnly,
            Anticipation::Available(response) => SyncStrategy::Anticipated(response),
            Anticipation::Unavailable => {
                warn!(
                    command = %command.command_ref(),
                    "Anticipated response unavailable, synchronization deferred after the exchange"
                );
                SyncStrategy::Deferred
            }
        }
    }

    /// Feed the SAM ahead of the exchange, returning the bytes to send
    pub fn synchronize_before<S: SecurityModule + ?Sized>(
        &self,
        sam: &mut S,
        strategy: &SyncStrategy,
        request: Bytes,
    ) -> Result<Bytes> {
        match strategy {
            SyncStrategy::Encrypted => {
                trace!(request = %hex::encode(&request), "Ciphering request");
                Ok(sam.encrypt_request(&request)?)
            }
            SyncStrategy::Anticipated(response) => {
                trace!(anticipated = %hex::encode(response), "Feeding anticipated exchange");
                sam.update_session_digest(&request)?;
                sam.update_session_digest(response)?;
                Ok(request)
            }
            SyncStrategy::None | SyncStrategy::Deferred | SyncStrategy::PostOnly => Ok(request),
        }
    }

    /// Feed the SAM after the exchange and decode the plain response
    pub fn synchronize_after<S: SecurityModule + ?Sized>(
        &self,
        sam: &mut S,
        strategy: &SyncStrategy,
        request: &[u8],
        raw_response: &[u8],
    ) -> Result<Response> {
        let plain = match strategy {
            SyncStrategy::Encrypted => sam.decrypt_response(raw_response)?,
            SyncStrategy::PostOnly | SyncStrategy::Deferred => {
                sam.update_session_digest(request)?;
                sam.update_session_digest(raw_response)?;
                Bytes::copy_from_slice(raw_response)
            }
            SyncStrategy::None | SyncStrategy::Anticipated(_) => {
                Bytes::copy_from_slice(raw_response)
            }
        };
        Self::decode(&plain)
    }

    /// Decode a response that needs no SAM processing
    pub fn decode(raw_response: &[u8]) -> Result<Response> {
        Response::from_bytes(raw_response).map_err(|e| {
            debug!(error = %e, "Malformed response from card");
            Error::Communication(TransportError::Transmission)
        })
    }

    /// Compare the real response with the one fed to the SAM beforehand
    pub fn verify_anticipated(
        &self,
        command: CommandRef,
        strategy: &SyncStrategy,
        response: &Response,
    ) -> Result<()> {
        let SyncStrategy::Anticipated(expected) = strategy else {
            return Ok(());
        };
        if response.to_bytes() != *expected {
            warn!(
                %command,
                expected = %hex::encode(expected),
                actual = %hex::encode(response.to_bytes()),
                "Anticipated response mismatch"
            );
            return Err(Error::SecurityContext(CommandFailure::local(
                command,
                "Data out does not match the anticipated data out",
            )));
        }
        Ok(())
    }
}
