//! Core types for APDU (Application Protocol Data Unit) exchanges
//!
//! This crate provides the foundational types and traits for working with smart card
//! APDU commands and responses according to ISO/IEC 7816-4:
//!
//! - building and parsing commands and responses
//! - interpreting status words
//! - talking to a card through a pluggable [`CardTransport`]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub use bytes::{Bytes, BytesMut};

pub mod command;
pub mod error;
pub mod response;
pub mod transport;

pub use command::{Command, ExpectedLength};
pub use error::Error;
pub use response::Response;
pub use response::status::StatusWord;
pub use transport::{CardTransport, TransportError};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{Bytes, BytesMut, Error};

    pub use crate::Command;
    pub use crate::command::ExpectedLength;

    pub use crate::Response;
    pub use crate::response::status::{StatusWord, common as status};
    pub use crate::response::utils;

    pub use crate::{CardTransport, TransportError};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reexports() {
        let cmd = Command::new(0x00, 0xA4, 0x09, 0x00);
        assert_eq!(cmd.header(), [0x00, 0xA4, 0x09, 0x00]);

        let data = Bytes::from_static(&[0x01, 0x02, 0x03]);
        let resp = Response::success(data);
        assert!(resp.is_success());
        assert_eq!(resp.payload(), &[0x01, 0x02, 0x03]);
        assert_eq!(resp.status(), StatusWord::new(0x90, 0x00));
    }
}
