//! Common test utilities

#![allow(dead_code, unreachable_pub, missing_docs)]

use std::collections::VecDeque;

use bytes::Bytes;
use calypso_card::{
    BufferCapacity, CalypsoCard, CardTransport, DigestInit, SamError, SecurityModule,
    SvPrepareRequest,
    SvSecurityData, TransportError, WriteAccessLevel,
};

/// Terminal challenge byte returned by [`FakeSam`]
pub const CHALLENGE_BYTE: u8 = 0x11;

/// Serial number of the test cards
pub const SERIAL: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0x11, 0x22, 0x33, 0x44];

/// Compatibility mode card with a byte counted session buffer
pub fn card(buffer: usize) -> CalypsoCard {
    CalypsoCard::new(SERIAL.to_vec(), BufferCapacity::bytes(buffer))
}

/// Send engine logs to the test output
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Flip every bit, standing in for the SAM cipher
pub fn xor(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ 0xFF).collect()
}

/// Card transport replaying scripted replies and recording every request
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: VecDeque<Result<Bytes, TransportError>>,
    pub requests: Vec<Bytes>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw reply, status word included
    pub fn reply(mut self, raw: impl AsRef<[u8]>) -> Self {
        self.replies.push_back(Ok(Bytes::copy_from_slice(raw.as_ref())));
        self
    }

    /// Queue a transport failure
    pub fn fail(mut self, error: TransportError) -> Self {
        self.replies.push_back(Err(error));
        self
    }

    /// Replies not consumed yet
    pub fn remaining(&self) -> usize {
        self.replies.len()
    }
}

impl CardTransport for ScriptedTransport {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        self.requests.push(Bytes::copy_from_slice(command));
        self.replies
            .pop_front()
            .unwrap_or(Err(TransportError::Transmission))
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Deterministic SAM
///
/// The session MAC is the XOR fold of every digest input; ciphering flips
/// every bit.
#[derive(Debug)]
pub struct FakeSam {
    pub digest: Vec<Bytes>,
    pub digest_inits: Vec<(WriteAccessLevel, u8, u8)>,
    pub mac_length: usize,
    pub accept_card_mac: bool,
    pub accept_sv_signature: bool,
    pub sv_requests: Vec<Bytes>,
    pub sv_signatures: Vec<Bytes>,
    pub resets: usize,
}

impl Default for FakeSam {
    fn default() -> Self {
        Self {
            digest: Vec::new(),
            digest_inits: Vec::new(),
            mac_length: 4,
            accept_card_mac: true,
            accept_sv_signature: true,
            sv_requests: Vec::new(),
            sv_signatures: Vec::new(),
            resets: 0,
        }
    }
}

impl FakeSam {
    /// MAC over the digest inputs recorded so far
    pub fn expected_mac(&self) -> Vec<u8> {
        let mut mac = vec![0u8; self.mac_length];
        for (i, byte) in self.digest.iter().flat_map(|apdu| apdu.iter()).enumerate() {
            mac[i % self.mac_length] ^= byte;
        }
        mac
    }
}

impl SecurityModule for FakeSam {
    fn terminal_challenge(&mut self, length: usize) -> Result<Bytes, SamError> {
        Ok(Bytes::from(vec![CHALLENGE_BYTE; length]))
    }

    fn init_session_digest(&mut self, init: &DigestInit<'_>) -> Result<(), SamError> {
        self.digest.clear();
        self.mac_length = if init.extended_mode { 8 } else { 4 };
        self.digest_inits.push((init.level, init.kif, init.kvc));
        Ok(())
    }

    fn update_session_digest(&mut self, apdu: &[u8]) -> Result<(), SamError> {
        self.digest.push(Bytes::copy_from_slice(apdu));
        Ok(())
    }

    fn compute_session_mac(&mut self) -> Result<Bytes, SamError> {
        Ok(Bytes::from(self.expected_mac()))
    }

    fn verify_card_mac(&mut self, _card_mac: &[u8]) -> Result<bool, SamError> {
        Ok(self.accept_card_mac)
    }

    fn encrypt_request(&mut self, apdu: &[u8]) -> Result<Bytes, SamError> {
        self.digest.push(Bytes::copy_from_slice(apdu));
        Ok(Bytes::from(xor(apdu)))
    }

    fn decrypt_response(&mut self, apdu: &[u8]) -> Result<Bytes, SamError> {
        let plain = Bytes::from(xor(apdu));
        self.digest.push(plain.clone());
        Ok(plain)
    }

    fn prepare_sv_operation(
        &mut self,
        request: &SvPrepareRequest<'_>,
    ) -> Result<SvSecurityData, SamError> {
        if request.sv_get_response.is_empty() {
            return Err(SamError::IllegalState("SV Get response missing"));
        }
        self.sv_requests.push(Bytes::copy_from_slice(request.partial_request));
        Ok(SvSecurityData {
            sam_id: [0xA1, 0xA2, 0xA3, 0xA4],
            sam_tnum: [0x00, 0x00, 0x10],
            signature_hi: Bytes::from_static(&[0x01, 0x02, 0x03, 0x04, 0x05]),
        })
    }

    fn verify_sv_signature(&mut self, signature: &[u8]) -> Result<bool, SamError> {
        self.sv_signatures.push(Bytes::copy_from_slice(signature));
        Ok(self.accept_sv_signature)
    }

    fn reset_session(&mut self) -> Result<(), SamError> {
        self.resets += 1;
        self.digest.clear();
        Ok(())
    }
}
