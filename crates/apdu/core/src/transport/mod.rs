//! Transport traits for APDU communication with cards
//!
//! A transport moves raw APDU bytes to a card and back. It knows nothing
//! about command structure, sessions or secure messaging.

pub mod error;

use std::fmt;

use bytes::Bytes;
pub use error::TransportError;
use tracing::{debug, trace};

use crate::{Command, Response};

/// Trait for basic card transports
pub trait CardTransport: Send + fmt::Debug {
    /// Send raw APDU bytes to card and return response bytes
    ///
    /// The returned bytes include the trailing status word.
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        trace!(command = ?hex::encode(command), "Transmitting raw command");
        let result = self.do_transmit_raw(command);
        match &result {
            Ok(response) => {
                trace!(response = ?hex::encode(response), "Received raw response");
            }
            Err(e) => {
                debug!(error = ?e, "Transport error during transmission");
            }
        }
        result
    }

    /// Internal implementation of transmit_raw
    ///
    /// This is the method that concrete implementations should override.
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError>;

    /// Serialize a command, transmit it and parse the response
    ///
    /// A reply shorter than a status word is reported as a transmission
    /// failure since nothing meaningful came back from the card.
    fn transmit(&mut self, command: &Command) -> Result<Response, TransportError> {
        let raw = self.transmit_raw(&command.to_bytes())?;
        Response::from_bytes(&raw).map_err(|e| {
            debug!(error = %e, "Malformed response from card");
            TransportError::Transmission
        })
    }

    /// Check if the transport is connected to a physical card
    fn is_connected(&self) -> bool;

    /// Reset the transport connection
    fn reset(&mut self) -> Result<(), TransportError>;
}

impl<T: CardTransport + ?Sized> CardTransport for Box<T> {
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        (**self).transmit_raw(command)
    }

    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        (**self).do_transmit_raw(command)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        (**self).reset()
    }
}

#[cfg(test)]
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub(crate) struct MockTransport {
    pub(crate) responses: Vec<Bytes>,
    pub(crate) commands: Vec<Bytes>,
    pub(crate) connected: bool,
}

#[cfg(test)]
impl MockTransport {
    pub(crate) fn new(responses: Vec<Bytes>) -> Self {
        Self {
            responses,
            commands: Vec::new(),
            connected: true,
        }
    }
}

#[cfg(test)]
impl CardTransport for MockTransport {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        if !self.connected {
            return Err(TransportError::Connection);
        }

        self.commands.push(Bytes::copy_from_slice(command));

        if self.responses.is_empty() {
            return Err(TransportError::Transmission);
        }
        Ok(self.responses.remove(0))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        self.commands.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_transmit_parses_response() {
        let mut transport = MockTransport::new(vec![Bytes::from_static(&hex!("01029000"))]);
        let response = transport
            .transmit(&Command::new_with_le(0x00, 0xB2, 0x01, 0x0C, 0x02))
            .unwrap();

        assert_eq!(response.payload(), &hex!("0102"));
        assert!(response.is_success());
        assert_eq!(transport.commands[0].as_ref(), hex!("00B2010C02"));
    }

    #[test]
    fn test_transmit_short_reply() {
        let mut transport = MockTransport::new(vec![Bytes::from_static(&[0x90])]);
        let result = transport.transmit(&Command::new(0x00, 0xA4, 0x09, 0x00));
        assert_eq!(result, Err(TransportError::Transmission));
    }

    #[test]
    fn test_disconnected_transport() {
        let mut transport = MockTransport::new(vec![]);
        transport.connected = false;
        assert_eq!(
            transport.transmit_raw(&hex!("00A40900")),
            Err(TransportError::Connection)
        );
        assert!(transport.commands.is_empty());
    }
}
