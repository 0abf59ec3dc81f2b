//! Calypso command bytes and card layout constants

/// ISO class byte
pub const CLA_ISO: u8 = 0x00;
/// Class byte of legacy (rev 1/2) cards
pub const CLA_LEGACY: u8 = 0x94;
/// Class byte of stored value commands on legacy cards
pub const CLA_LEGACY_SV: u8 = 0xFA;

/// Instruction bytes
pub mod ins {
    /// Select File
    pub const SELECT_FILE: u8 = 0xA4;
    /// Read Records
    pub const READ_RECORDS: u8 = 0xB2;
    /// Update Record
    pub const UPDATE_RECORD: u8 = 0xDC;
    /// Append Record
    pub const APPEND_RECORD: u8 = 0xE2;
    /// Increase (counter)
    pub const INCREASE: u8 = 0x32;
    /// Decrease (counter)
    pub const DECREASE: u8 = 0x30;
    /// Open Secure Session (rev 3)
    pub const OPEN_SESSION: u8 = 0x8A;
    /// Close Secure Session
    pub const CLOSE_SESSION: u8 = 0x8E;
    /// SV Get
    pub const SV_GET: u8 = 0x7C;
    /// SV Reload
    pub const SV_RELOAD: u8 = 0xB8;
    /// SV Debit
    pub const SV_DEBIT: u8 = 0xBA;
    /// SV Undebit
    pub const SV_UNDEBIT: u8 = 0xBC;
}

/// Select File P1 selecting by LID on ISO cards
pub const SELECT_BY_LID_ISO: u8 = 0x09;
/// Select File P1 selecting by LID on legacy cards
pub const SELECT_BY_LID_LEGACY: u8 = 0x08;

/// Proprietary information tag in the Select File response
pub const TAG_PROPRIETARY_INFORMATION: u8 = 0x85;
/// Length of the proprietary information
pub const PROPRIETARY_INFORMATION_LENGTH: usize = 23;

/// Offsets inside the proprietary information
pub(crate) mod sel {
    pub(crate) const SFI: usize = 0;
    pub(crate) const TYPE: usize = 1;
    pub(crate) const EF_TYPE: usize = 2;
    pub(crate) const REC_SIZE: usize = 3;
    pub(crate) const NUM_REC: usize = 4;
    pub(crate) const AC: usize = 5;
    pub(crate) const AC_LENGTH: usize = 4;
    pub(crate) const NKEY: usize = 9;
    pub(crate) const NKEY_LENGTH: usize = 4;
    pub(crate) const DF_STATUS: usize = 13;
    pub(crate) const KVCS: usize = 14;
    pub(crate) const KIFS: usize = 17;
    pub(crate) const DATA_REF: usize = 14;
    pub(crate) const LID: usize = 21;
}

/// File types found in the proprietary information
pub(crate) mod file_type {
    pub(crate) const MF: u8 = 0x01;
    pub(crate) const DF: u8 = 0x02;
    pub(crate) const EF: u8 = 0x04;
}

/// Size of a counter inside a counter file record
pub const COUNTER_SIZE: usize = 3;
/// Largest value a 3-byte counter can hold
pub const COUNTER_MAX: u32 = 0x00FF_FFFF;

/// Smallest amount accepted by SV Reload, Debit and Undebit
pub const SV_MIN_AMOUNT: i32 = 1;
/// Largest amount accepted by SV Reload, Debit and Undebit
pub const SV_MAX_AMOUNT: i32 = 32767;

/// Length of an SV load log record
pub const SV_LOAD_LOG_LENGTH: usize = 22;
/// Length of an SV debit log record
pub const SV_DEBIT_LOG_LENGTH: usize = 19;

/// SV Get response length, compatibility mode reload
pub const SV_GET_COMPAT_RELOAD_LENGTH: usize = 0x21;
/// SV Get response length, compatibility mode debit or undebit
pub const SV_GET_COMPAT_DEBIT_LENGTH: usize = 0x1E;
/// SV Get response length, revision 3.2 mode
pub const SV_GET_EXTENDED_LENGTH: usize = 0x3D;
