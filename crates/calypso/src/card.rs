//! Snapshot of the card capabilities and file structure

use bytes::Bytes;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::buffer::BufferCapacity;
use crate::constants::{CLA_ISO, CLA_LEGACY, CLA_LEGACY_SV, SELECT_BY_LID_ISO, SELECT_BY_LID_LEGACY};

/// Card class, deciding the CLA byte of every command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardClass {
    /// ISO cards (rev 3)
    #[default]
    Iso,
    /// Legacy cards (rev 1 and 2)
    Legacy,
}

impl CardClass {
    /// CLA byte of regular commands
    pub const fn cla(self) -> u8 {
        match self {
            Self::Iso => CLA_ISO,
            Self::Legacy => CLA_LEGACY,
        }
    }

    /// CLA byte of stored value commands
    pub const fn sv_cla(self) -> u8 {
        match self {
            Self::Iso => CLA_ISO,
            Self::Legacy => CLA_LEGACY_SV,
        }
    }

    /// P1 of Select File by LID
    pub const fn select_by_lid_p1(self) -> u8 {
        match self {
            Self::Iso => SELECT_BY_LID_ISO,
            Self::Legacy => SELECT_BY_LID_LEGACY,
        }
    }
}

/// Access level requested when opening a secure session
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteAccessLevel {
    /// Personalization key
    #[display("PERSONALIZATION")]
    Personalization,
    /// Load key
    #[display("LOAD")]
    Load,
    /// Debit key
    #[display("DEBIT")]
    Debit,
}

impl WriteAccessLevel {
    /// Key index sent in the Open Secure Session command
    pub const fn key_index(self) -> u8 {
        match self {
            Self::Personalization => 1,
            Self::Load => 2,
            Self::Debit => 3,
        }
    }
}

/// Type of an elementary file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EfType {
    /// Binary file
    Binary,
    /// Linear record file
    Linear,
    /// Cyclic record file
    Cyclic,
    /// Counters emulated on a linear file
    SimulatedCounters,
    /// Counter file
    Counters,
}

impl EfType {
    /// Decode the type byte of the proprietary information
    pub const fn from_card_value(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Binary),
            0x02 => Some(Self::Linear),
            0x04 => Some(Self::Cyclic),
            0x08 => Some(Self::SimulatedCounters),
            0x09 => Some(Self::Counters),
            _ => None,
        }
    }
}

/// Header of an elementary file, as returned by Select File
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Logical identifier
    pub lid: u16,
    /// Short file identifier
    pub sfi: u8,
    /// File type
    pub ef_type: EfType,
    /// Record size, or file size for binary files
    pub record_size: usize,
    /// Number of records
    pub records_number: usize,
    /// Access conditions
    pub access_conditions: [u8; 4],
    /// Key indexes
    pub key_indexes: [u8; 4],
    /// DF status byte
    pub df_status: u8,
    /// Shared data reference
    pub shared_reference: u16,
}

/// Header of a dedicated file, as returned by Select File
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryHeader {
    /// Logical identifier
    pub lid: u16,
    /// Access conditions
    pub access_conditions: [u8; 4],
    /// Key indexes
    pub key_indexes: [u8; 4],
    /// DF status byte
    pub df_status: u8,
    /// KVC per access level (personalization, load, debit)
    pub kvcs: [u8; 3],
    /// KIF per access level (personalization, load, debit)
    pub kifs: [u8; 3],
}

impl DirectoryHeader {
    /// KVC expected for the given access level
    pub const fn kvc(&self, level: WriteAccessLevel) -> u8 {
        self.kvcs[level.key_index() as usize - 1]
    }

    /// KIF expected for the given access level
    pub const fn kif(&self, level: WriteAccessLevel) -> u8 {
        self.kifs[level.key_index() as usize - 1]
    }
}

/// Card identity and capabilities captured at selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalypsoCard {
    /// Application serial number
    pub serial_number: Bytes,
    /// Card class
    pub class: CardClass,
    /// Revision 3.2 extended mode support
    pub extended_mode: bool,
    /// Session buffer capacity
    pub session_buffer: BufferCapacity,
}

impl CalypsoCard {
    /// Create a snapshot of an ISO card without extended mode
    pub fn new(serial_number: impl Into<Bytes>, session_buffer: BufferCapacity) -> Self {
        Self {
            serial_number: serial_number.into(),
            class: CardClass::Iso,
            extended_mode: false,
            session_buffer,
        }
    }

    /// Set the card class
    pub const fn with_class(mut self, class: CardClass) -> Self {
        self.class = class;
        self
    }

    /// Enable or disable the extended mode
    pub const fn with_extended_mode(mut self, extended_mode: bool) -> Self {
        self.extended_mode = extended_mode;
        self
    }

    /// Length of the terminal challenge sent in Open Secure Session
    pub const fn challenge_length(&self) -> usize {
        if self.extended_mode { 8 } else { 4 }
    }

    /// Length of the session MACs exchanged at close
    pub const fn mac_length(&self) -> usize {
        if self.extended_mode { 8 } else { 4 }
    }

    /// Length of the low part of the SV signature returned by the card
    pub const fn sv_signature_length(&self) -> usize {
        if self.extended_mode { 6 } else { 3 }
    }

    /// Length of the high part of the SV signature computed by the SAM
    pub const fn sv_signature_hi_length(&self) -> usize {
        if self.extended_mode { 10 } else { 5 }
    }
}
