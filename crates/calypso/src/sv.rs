//! Stored value data and sequencing rules
//!
//! An SV transaction is always `SV Get`, then one of `SV Reload`,
//! `SV Debit` or `SV Undebit`, then the SAM check of the card signature.
//! At most one mutating operation is allowed per secure session.

use bytes::Bytes;
use calypso_apdu_core::response::utils::extract_int;
use derive_more::Display;
use tracing::debug;

use crate::commands::CommandRef;
use crate::config::TransactionSettings;
use crate::constants::{
    SV_DEBIT_LOG_LENGTH, SV_GET_COMPAT_DEBIT_LENGTH, SV_GET_COMPAT_RELOAD_LENGTH,
    SV_GET_EXTENDED_LENGTH, SV_LOAD_LOG_LENGTH, SV_MAX_AMOUNT, SV_MIN_AMOUNT,
};
use crate::error::{CommandFailure, Error, Result};

/// Operation declared by SV Get
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SvOperation {
    /// Reload
    #[display("RELOAD")]
    Reload,
    /// Debit or undebit
    #[display("DEBIT")]
    Debit,
}

/// Mutating SV command
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SvAction {
    /// Add an amount to the balance
    #[display("RELOAD")]
    Reload,
    /// Subtract an amount from the balance
    #[display("DEBIT")]
    Debit,
    /// Cancel a previous debit
    #[display("UNDEBIT")]
    Undebit,
}

impl SvAction {
    /// Operation that SV Get must have declared
    pub const fn operation(self) -> SvOperation {
        match self {
            Self::Reload => SvOperation::Reload,
            Self::Debit | Self::Undebit => SvOperation::Debit,
        }
    }

    /// Command reference of the card command
    pub const fn command_ref(self) -> CommandRef {
        match self {
            Self::Reload => CommandRef::SvReload,
            Self::Debit => CommandRef::SvDebit,
            Self::Undebit => CommandRef::SvUndebit,
        }
    }

    /// Signed effect of the action on the balance
    pub const fn balance_delta(self, amount: i32) -> i32 {
        match self {
            Self::Reload | Self::Undebit => amount,
            Self::Debit => -amount,
        }
    }
}

/// Entry of the SV load log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvLoadLogRecord {
    /// Load date
    pub date: [u8; 2],
    /// Free data
    pub free_data: [u8; 2],
    /// KVC of the load key
    pub kvc: u8,
    /// Balance after the load
    pub balance: i32,
    /// Loaded amount
    pub amount: i32,
    /// Load time
    pub time: [u8; 2],
    /// SAM serial number
    pub sam_id: [u8; 4],
    /// SAM transaction number
    pub sam_tnum: u32,
    /// SV transaction number
    pub sv_tnum: u16,
}

impl SvLoadLogRecord {
    /// Parse the 22 byte record starting at `offset`
    pub fn parse(data: &[u8], offset: usize) -> Option<Self> {
        let log = data.get(offset..offset + SV_LOAD_LOG_LENGTH)?;
        Some(Self {
            date: [log[0], log[1]],
            free_data: [log[2], log[4]],
            kvc: log[3],
            balance: extract_int(log, 5, 3, true),
            amount: extract_int(log, 8, 3, true),
            time: [log[11], log[12]],
            sam_id: [log[13], log[14], log[15], log[16]],
            sam_tnum: extract_int(log, 17, 3, false) as u32,
            sv_tnum: extract_int(log, 20, 2, false) as u16,
        })
    }
}

/// Entry of the SV debit log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvDebitLogRecord {
    /// Debited amount
    pub amount: i32,
    /// Debit date
    pub date: [u8; 2],
    /// Debit time
    pub time: [u8; 2],
    /// KVC of the debit key
    pub kvc: u8,
    /// SAM serial number
    pub sam_id: [u8; 4],
    /// SAM transaction number
    pub sam_tnum: u32,
    /// Balance after the debit
    pub balance: i32,
    /// SV transaction number
    pub sv_tnum: u16,
}

impl SvDebitLogRecord {
    /// Parse the 19 byte record starting at `offset`
    pub fn parse(data: &[u8], offset: usize) -> Option<Self> {
        let log = data.get(offset..offset + SV_DEBIT_LOG_LENGTH)?;
        Some(Self {
            amount: extract_int(log, 0, 2, true),
            date: [log[2], log[3]],
            time: [log[4], log[5]],
            kvc: log[6],
            sam_id: [log[7], log[8], log[9], log[10]],
            sam_tnum: extract_int(log, 11, 3, false) as u32,
            balance: extract_int(log, 14, 3, true),
            sv_tnum: extract_int(log, 17, 2, false) as u16,
        })
    }
}

/// Decoded SV Get response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvGetData {
    /// Current KVC
    pub kvc: u8,
    /// SV transaction number
    pub transaction_number: u16,
    /// Low part of the previous SV signature
    pub previous_signature_lo: Bytes,
    /// Card challenge
    pub challenge: Bytes,
    /// Current balance
    pub balance: i32,
    /// Last load log, when returned
    pub load_log: Option<SvLoadLogRecord>,
    /// Last debit log, when returned
    pub debit_log: Option<SvDebitLogRecord>,
}

impl SvGetData {
    /// Decode an SV Get response payload
    ///
    /// The layout is chosen from the payload length alone: 0x21 bytes for a
    /// compatibility mode reload, 0x1E for a compatibility mode debit and
    /// 0x3D for the revision 3.2 mode carrying both logs.
    pub fn parse(data: &[u8]) -> Result<Self> {
        match data.len() {
            SV_GET_COMPAT_RELOAD_LENGTH | SV_GET_COMPAT_DEBIT_LENGTH => {
                let reload = data.len() == SV_GET_COMPAT_RELOAD_LENGTH;
                Ok(Self {
                    kvc: data[0],
                    transaction_number: extract_int(data, 1, 2, false) as u16,
                    previous_signature_lo: Bytes::copy_from_slice(&data[3..6]),
                    challenge: Bytes::copy_from_slice(&data[6..8]),
                    balance: extract_int(data, 8, 3, true),
                    load_log: if reload { SvLoadLogRecord::parse(data, 11) } else { None },
                    debit_log: if reload { None } else { SvDebitLogRecord::parse(data, 11) },
                })
            }
            SV_GET_EXTENDED_LENGTH => Ok(Self {
                challenge: Bytes::copy_from_slice(&data[0..8]),
                kvc: data[8],
                transaction_number: extract_int(data, 9, 2, false) as u16,
                previous_signature_lo: Bytes::copy_from_slice(&data[11..17]),
                balance: extract_int(data, 17, 3, true),
                load_log: SvLoadLogRecord::parse(data, 20),
                debit_log: SvDebitLogRecord::parse(data, 42),
            }),
            _ => Err(Error::unexpected_length(
                CommandRef::SvGet,
                "Incorrect data length in response to SV Get",
            )),
        }
    }
}

/// Progress of the SV transaction
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SvPhase {
    /// No SV Get performed yet
    #[default]
    Idle,
    /// SV Get done, waiting for the mutating command
    Ready(SvOperation),
    /// Mutating command accepted by the card, waiting for the SAM check
    Pending {
        /// Action performed
        action: SvAction,
        /// Amount of the action
        amount: i32,
        /// Signature returned by the card
        signature: Bytes,
    },
    /// Mutating command accepted, the card returns its signature with the
    /// session close
    Postponed {
        /// Action performed
        action: SvAction,
        /// Amount of the action
        amount: i32,
    },
    /// Signature checked
    Completed,
}

/// Stored value state of the transaction
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SvTransactionState {
    /// Last decoded SV Get response
    pub data: Option<SvGetData>,
    /// Header of the last SV Get (`INS P1 P2 Le`)
    pub sv_get_header: Bytes,
    /// Complete last SV Get response
    pub sv_get_response: Bytes,
    /// Current phase
    pub phase: SvPhase,
    /// A mutating operation has been performed in the current session
    pub performed_in_session: bool,
    /// Mutating operations completed over the whole transaction
    pub operations: usize,
}

impl SvTransactionState {
    /// Current balance, as last read or updated
    pub fn balance(&self) -> Option<i32> {
        self.data.as_ref().map(|d| d.balance)
    }

    /// Current SV transaction number
    pub fn transaction_number(&self) -> Option<u16> {
        self.data.as_ref().map(|d| d.transaction_number)
    }

    /// Whether a signature awaits the SAM check
    pub const fn is_pending(&self) -> bool {
        matches!(self.phase, SvPhase::Pending { .. })
    }

    /// Whether the signature comes with the session close
    pub const fn is_postponed(&self) -> bool {
        matches!(self.phase, SvPhase::Postponed { .. })
    }

    /// Called when a new secure session opens
    pub const fn on_session_opened(&mut self) {
        self.performed_in_session = false;
    }
}

/// Sequencing and balance rules of SV transactions
#[derive(Debug, Clone, Copy)]
pub struct StoredValueCoordinator {
    allow_negative_balance: bool,
    negative_balance_limit: i32,
}

impl StoredValueCoordinator {
    /// Build the rules from the transaction settings
    pub const fn new(settings: &TransactionSettings) -> Self {
        Self {
            allow_negative_balance: settings.allow_negative_balance,
            negative_balance_limit: settings.negative_balance_limit,
        }
    }

    /// Check that an SV Get may be issued
    pub fn check_get(&self, state: &SvTransactionState) -> Result<()> {
        if state.is_pending() || state.is_postponed() {
            return Err(Error::SvConsistency(
                "The previous SV operation has not been checked",
            ));
        }
        Ok(())
    }

    /// Record a successful SV Get
    pub fn record_get(
        &self,
        state: &mut SvTransactionState,
        operation: SvOperation,
        data: SvGetData,
        header: Bytes,
        response: Bytes,
    ) {
        debug!(%operation, balance = data.balance, tnum = data.transaction_number, "SV Get");
        state.data = Some(data);
        state.sv_get_header = header;
        state.sv_get_response = response;
        state.phase = SvPhase::Ready(operation);
    }

    /// Validate a mutating operation before anything is sent
    ///
    /// The one operation per session rule only holds while `in_session`.
    pub fn check_action(
        &self,
        state: &SvTransactionState,
        action: SvAction,
        amount: i32,
        in_session: bool,
    ) -> Result<()> {
        if !(SV_MIN_AMOUNT..=SV_MAX_AMOUNT).contains(&amount) {
            return Err(Error::IllegalParameter(CommandFailure::local(
                action.command_ref(),
                "Amount out of range",
            )));
        }
        if in_session && state.performed_in_session {
            return Err(Error::SvConsistency(
                "Only one SV operation is allowed per secure session",
            ));
        }
        match state.phase {
            SvPhase::Ready(operation) if operation == action.operation() => {}
            _ => {
                return Err(Error::SvConsistency(
                    "An SV Get for the matching operation must precede the SV operation",
                ));
            }
        }
        let Some(data) = state.data.as_ref() else {
            return Err(Error::SvConsistency("No SV data available"));
        };

        match action {
            SvAction::Debit => {
                let floor = if self.allow_negative_balance {
                    self.negative_balance_limit.min(0)
                } else {
                    0
                };
                if data.balance - amount < floor {
                    return Err(Error::SvConsistency("Balance would become negative"));
                }
            }
            SvAction::Undebit => {
                let last_debit = data.debit_log.as_ref().map_or(0, |log| log.amount);
                if amount > last_debit {
                    return Err(Error::SvConsistency(
                        "Undebit amount exceeds the last debit amount",
                    ));
                }
            }
            SvAction::Reload => {}
        }
        Ok(())
    }

    /// Record the card acceptance of a mutating operation
    pub fn record_action(
        &self,
        state: &mut SvTransactionState,
        action: SvAction,
        amount: i32,
        signature: Bytes,
        in_session: bool,
    ) {
        state.performed_in_session |= in_session;
        state.phase = SvPhase::Pending {
            action,
            amount,
            signature,
        };
    }

    /// Record a mutating operation whose signature is postponed until the
    /// session close
    pub fn record_postponed(&self, state: &mut SvTransactionState, action: SvAction, amount: i32) {
        debug!(%action, amount, "SV signature postponed");
        state.performed_in_session = true;
        state.phase = SvPhase::Postponed { action, amount };
    }

    /// Signature awaiting the SAM check
    pub fn pending_signature(&self, state: &SvTransactionState) -> Result<Bytes> {
        match &state.phase {
            SvPhase::Pending { signature, .. } => Ok(signature.clone()),
            SvPhase::Postponed { .. } => Err(Error::SvConsistency(
                "The SV signature is checked at the session close",
            )),
            _ => Err(Error::SvConsistency("No SV operation awaits a check")),
        }
    }

    /// Apply the outcome of the SAM check, returning the new balance
    pub fn complete_check(&self, state: &mut SvTransactionState, verified: bool) -> Result<i32> {
        let (action, amount) = match state.phase {
            SvPhase::Pending { action, amount, .. } | SvPhase::Postponed { action, amount } => {
                (action, amount)
            }
            _ => return Err(Error::SvConsistency("No SV operation awaits a check")),
        };
        if !verified {
            state.phase = SvPhase::Idle;
            return Err(Error::SecurityData(CommandFailure::local(
                action.command_ref(),
                "Incorrect SV signature",
            )));
        }
        let data = state
            .data
            .as_mut()
            .ok_or(Error::SvConsistency("No SV data available"))?;
        data.balance += action.balance_delta(amount);
        data.transaction_number = data.transaction_number.wrapping_add(1);
        state.operations += 1;
        state.phase = SvPhase::Completed;
        debug!(%action, amount, balance = data.balance, "SV operation checked");
        Ok(data.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // kvc, tnum, previous signature, challenge, balance 100, load log
    const COMPAT_RELOAD: [u8; 0x21] = hex!(
        "79 0003 112233 4455 000064"
        "1234 AA 79 BB 000062 000002 0A0B 01020304 000010 0002"
    );

    // kvc, tnum, previous signature, challenge, balance -2, debit log
    const COMPAT_DEBIT: [u8; 0x1E] = hex!(
        "79 0010 112233 4455 FFFFFE"
        "0005 1234 0A0B 79 01020304 000011 FFFFFE 000F"
    );

    const EXTENDED: [u8; 0x3D] = hex!(
        "0102030405060708 79 0021 AABBCCDDEEFF 0003E8"
        "1234 AA 79 BB 0003E0 000008 0A0B 01020304 000010 0020"
        "0003 1234 0A0B 79 01020304 000011 0003E0 001F"
    );

    fn coordinator() -> StoredValueCoordinator {
        StoredValueCoordinator::new(&TransactionSettings::default())
    }

    fn ready_state(operation: SvOperation, response: &[u8]) -> SvTransactionState {
        let mut state = SvTransactionState::default();
        coordinator().record_get(
            &mut state,
            operation,
            SvGetData::parse(response).unwrap(),
            Bytes::new(),
            Bytes::new(),
        );
        state
    }

    #[test]
    fn test_parse_compat_reload() {
        let data = SvGetData::parse(&COMPAT_RELOAD).unwrap();
        assert_eq!(data.kvc, 0x79);
        assert_eq!(data.transaction_number, 3);
        assert_eq!(data.previous_signature_lo.as_ref(), hex!("112233"));
        assert_eq!(data.challenge.as_ref(), hex!("4455"));
        assert_eq!(data.balance, 100);
        assert!(data.debit_log.is_none());

        let load = data.load_log.unwrap();
        assert_eq!(load.balance, 98);
        assert_eq!(load.amount, 2);
        assert_eq!(load.sam_id, hex!("01020304"));
        assert_eq!(load.sam_tnum, 0x10);
        assert_eq!(load.sv_tnum, 2);
    }

    #[test]
    fn test_parse_compat_debit() {
        let data = SvGetData::parse(&COMPAT_DEBIT).unwrap();
        assert_eq!(data.balance, -2);
        assert!(data.load_log.is_none());

        let debit = data.debit_log.unwrap();
        assert_eq!(debit.amount, 5);
        assert_eq!(debit.kvc, 0x79);
        assert_eq!(debit.balance, -2);
        assert_eq!(debit.sv_tnum, 0x0F);
    }

    #[test]
    fn test_parse_extended() {
        let data = SvGetData::parse(&EXTENDED).unwrap();
        assert_eq!(data.challenge.as_ref(), hex!("0102030405060708"));
        assert_eq!(data.kvc, 0x79);
        assert_eq!(data.transaction_number, 0x21);
        assert_eq!(data.previous_signature_lo.as_ref(), hex!("AABBCCDDEEFF"));
        assert_eq!(data.balance, 1000);
        assert_eq!(data.load_log.unwrap().amount, 8);
        assert_eq!(data.debit_log.unwrap().amount, 3);
    }

    #[test]
    fn test_parse_is_repeatable() {
        assert_eq!(
            SvGetData::parse(&EXTENDED).unwrap(),
            SvGetData::parse(&EXTENDED).unwrap()
        );
    }

    #[test]
    fn test_parse_rejects_other_lengths() {
        let err = SvGetData::parse(&EXTENDED[..0x20]).unwrap_err();
        assert!(matches!(err, Error::UnexpectedResponseLength(_)));
    }

    #[test]
    fn test_second_action_in_session_rejected() {
        let coordinator = coordinator();
        let mut state = ready_state(SvOperation::Reload, &COMPAT_RELOAD);

        coordinator.check_action(&state, SvAction::Reload, 2, true).unwrap();
        let signature = Bytes::from_static(&[1, 2, 3]);
        coordinator.record_action(&mut state, SvAction::Reload, 2, signature, true);
        assert_eq!(coordinator.complete_check(&mut state, true).unwrap(), 102);

        state.phase = SvPhase::Ready(SvOperation::Reload);
        assert!(matches!(
            coordinator.check_action(&state, SvAction::Reload, 2, true),
            Err(Error::SvConsistency(_))
        ));

        state.on_session_opened();
        assert!(coordinator.check_action(&state, SvAction::Reload, 2, true).is_ok());
    }

    #[test]
    fn test_actions_outside_session_are_not_limited() {
        let coordinator = coordinator();
        let mut state = ready_state(SvOperation::Reload, &COMPAT_RELOAD);

        for expected in [102, 104] {
            coordinator.check_action(&state, SvAction::Reload, 2, false).unwrap();
            let signature = Bytes::from_static(&[1, 2, 3]);
            coordinator.record_action(&mut state, SvAction::Reload, 2, signature, false);
            assert_eq!(coordinator.complete_check(&mut state, true).unwrap(), expected);
            state.phase = SvPhase::Ready(SvOperation::Reload);
        }
        assert!(!state.performed_in_session);
        assert_eq!(state.operations, 2);
    }

    #[test]
    fn test_postponed_signature_checked_later() {
        let coordinator = coordinator();
        let mut state = ready_state(SvOperation::Reload, &COMPAT_RELOAD);
        coordinator.record_postponed(&mut state, SvAction::Reload, 2);

        assert!(state.is_postponed());
        assert!(!state.is_pending());
        assert!(matches!(
            coordinator.pending_signature(&state),
            Err(Error::SvConsistency(_))
        ));
        assert!(coordinator.check_get(&state).is_err());
        assert_eq!(coordinator.complete_check(&mut state, true).unwrap(), 102);
        assert_eq!(state.phase, SvPhase::Completed);
    }

    #[test]
    fn test_action_requires_matching_get() {
        let state = ready_state(SvOperation::Reload, &COMPAT_RELOAD);
        assert!(matches!(
            coordinator().check_action(&state, SvAction::Debit, 1, true),
            Err(Error::SvConsistency(_))
        ));
        assert!(matches!(
            coordinator().check_action(&SvTransactionState::default(), SvAction::Reload, 1, true),
            Err(Error::SvConsistency(_))
        ));
    }

    #[test]
    fn test_amount_bounds() {
        let state = ready_state(SvOperation::Reload, &COMPAT_RELOAD);
        assert!(matches!(
            coordinator().check_action(&state, SvAction::Reload, 0, true),
            Err(Error::IllegalParameter(_))
        ));
        assert!(matches!(
            coordinator().check_action(&state, SvAction::Reload, 32768, true),
            Err(Error::IllegalParameter(_))
        ));
        assert!(coordinator().check_action(&state, SvAction::Reload, 32767, true).is_ok());
    }

    #[test]
    fn test_negative_balance_policy() {
        let state = ready_state(SvOperation::Debit, &COMPAT_DEBIT);
        assert!(matches!(
            coordinator().check_action(&state, SvAction::Debit, 1, true),
            Err(Error::SvConsistency(_))
        ));

        let settings = TransactionSettings::default()
            .with_allow_negative_balance(true)
            .with_negative_balance_limit(-10);
        let lenient = StoredValueCoordinator::new(&settings);
        assert!(lenient.check_action(&state, SvAction::Debit, 8, true).is_ok());
        assert!(lenient.check_action(&state, SvAction::Debit, 9, true).is_err());
    }

    #[test]
    fn test_undebit_limited_by_last_debit() {
        let state = ready_state(SvOperation::Debit, &COMPAT_DEBIT);
        assert!(coordinator().check_action(&state, SvAction::Undebit, 5, true).is_ok());
        assert!(matches!(
            coordinator().check_action(&state, SvAction::Undebit, 6, true),
            Err(Error::SvConsistency(_))
        ));
    }

    #[test]
    fn test_failed_check() {
        let coordinator = coordinator();
        let mut state = ready_state(SvOperation::Reload, &COMPAT_RELOAD);
        let signature = Bytes::from_static(&[1, 2, 3]);
        coordinator.record_action(&mut state, SvAction::Reload, 2, signature, true);

        let err = coordinator.complete_check(&mut state, false).unwrap_err();
        assert!(matches!(err, Error::SecurityData(_)));
        assert_eq!(state.balance(), Some(100));
        assert_eq!(state.operations, 0);
    }
}
