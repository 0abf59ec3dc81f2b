use bytes::Bytes;
use calypso_apdu_core::response::utils::int_to_bytes;
use calypso_apdu_core::{Command, Response};

use super::{CardCommand, CommandOutput, CommandRef};
use crate::card::CalypsoCard;
use crate::constants::ins;
use crate::context::CommandContext;
use crate::error::{CommandFailure, Error};
use crate::sam::SvSecurityData;
use crate::status::{ErrorKind, StatusEntry, StatusTable};
use crate::sv::SvAction;

const STATUS_TABLE: StatusTable = &[
    StatusEntry::failure(
        0x6400,
        "Too many modifications in session",
        ErrorKind::SessionBufferOverflow,
    ),
    StatusEntry::failure(0x6700, "Lc value not supported", ErrorKind::IllegalParameter),
    StatusEntry::failure(
        0x6900,
        "Transaction counter is 0 or SV TNum is FFFEh or FFFFh",
        ErrorKind::Terminated,
    ),
    StatusEntry::failure(
        0x6985,
        "Preconditions not satisfied (no SV Get, or SV operation already done in the session)",
        ErrorKind::AccessForbidden,
    ),
    StatusEntry::failure(0x6988, "Incorrect signatureHi", ErrorKind::SecurityData),
    StatusEntry::success(
        SW_POSTPONED,
        "Successful execution, response data postponed until session closing",
    ),
];

const SW_POSTPONED: u16 = 0x6200;

/// Date, time and free data written in the SV logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SvLogStamp {
    /// Date, in the application format
    pub date: [u8; 2],
    /// Time, in the application format
    pub time: [u8; 2],
    /// Free data (reload only)
    pub free: [u8; 2],
}

/// SV Reload, SV Debit or SV Undebit command
///
/// The request is built in two steps: the card visible part first, then the
/// SAM identifiers and signature once [`SvOperationCommand::finalize`] is
/// called with the data prepared by the SAM.
#[derive(Debug, Clone)]
pub struct SvOperationCommand {
    request: Command,
    action: SvAction,
    amount: i32,
    signature_length: usize,
    signature_hi_length: usize,
    partial: Bytes,
    finalized: bool,
}

impl SvOperationCommand {
    /// Start building the command
    pub fn new(
        card: &CalypsoCard,
        action: SvAction,
        amount: i32,
        kvc: u8,
        stamp: SvLogStamp,
    ) -> Self {
        let mut data = Vec::with_capacity(32);
        match action {
            SvAction::Reload => {
                data.extend_from_slice(&stamp.date);
                data.push(stamp.free[0]);
                data.push(kvc);
                data.push(stamp.free[1]);
                data.extend(int_to_bytes(amount, 3));
                data.extend_from_slice(&stamp.time);
            }
            SvAction::Debit | SvAction::Undebit => {
                // debits are sent negated
                data.extend(int_to_bytes(action.balance_delta(amount), 2));
                data.extend_from_slice(&stamp.date);
                data.extend_from_slice(&stamp.time);
                data.push(kvc);
            }
        }
        let ins = match action {
            SvAction::Reload => ins::SV_RELOAD,
            SvAction::Debit => ins::SV_DEBIT,
            SvAction::Undebit => ins::SV_UNDEBIT,
        };
        Self {
            request: Command::new_with_le(card.class.sv_cla(), ins, 0x00, 0x00, 0x00),
            action,
            amount,
            signature_length: card.sv_signature_length(),
            signature_hi_length: card.sv_signature_hi_length(),
            partial: Bytes::from(data),
            finalized: false,
        }
    }

    /// Action performed
    pub const fn action(&self) -> SvAction {
        self.action
    }

    /// Amount of the action
    pub const fn amount(&self) -> i32 {
        self.amount
    }

    /// Whether the SAM data has been added
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Command as known before the SAM step (`CLA INS P1 P2 Lc` and the
    /// data preceding the SAM identifiers)
    pub fn partial_request(&self) -> Bytes {
        let lc = self.partial.len() + 4 + 3 + self.signature_hi_length;
        let mut out = Vec::with_capacity(5 + self.partial.len());
        out.extend_from_slice(&self.request.header());
        out.push(lc as u8);
        out.extend_from_slice(&self.partial);
        Bytes::from(out)
    }

    /// Complete the request with the SAM prepared data
    pub fn finalize(&mut self, security: &SvSecurityData) -> Result<(), Error> {
        if security.signature_hi.len() != self.signature_hi_length {
            return Err(Error::IllegalParameter(CommandFailure::local(
                self.action.command_ref(),
                "Unexpected SV signature length from the SAM",
            )));
        }
        let mut data = Vec::with_capacity(self.partial.len() + 7 + self.signature_hi_length);
        data.extend_from_slice(&self.partial);
        data.extend_from_slice(&security.sam_id);
        data.extend_from_slice(&security.sam_tnum);
        data.extend_from_slice(&security.signature_hi);
        self.request = self.request.clone().with_data(data);
        self.finalized = true;
        Ok(())
    }
}

impl CardCommand for SvOperationCommand {
    fn command_ref(&self) -> CommandRef {
        self.action.command_ref()
    }

    fn request(&self) -> &Command {
        &self.request
    }

    fn status_table(&self) -> StatusTable {
        STATUS_TABLE
    }

    fn uses_session_buffer(&self) -> bool {
        true
    }

    fn requires_crypto_finalization(&self) -> bool {
        true
    }

    fn expected_response_length(&self) -> usize {
        self.signature_length + 2
    }

    fn parse_response(
        &mut self,
        ctx: &mut CommandContext<'_>,
        response: &Response,
    ) -> Result<CommandOutput, Error> {
        let payload = response.payload_bytes();
        if response.status().to_u16() == SW_POSTPONED {
            if !ctx.transaction.is_session_open() {
                return Err(Error::SvConsistency(
                    "SV signature postponed outside a secure session",
                ));
            }
            if !payload.is_empty() {
                return Err(Error::unexpected_length(
                    self.action.command_ref(),
                    "Unexpected data with a postponed SV signature",
                ));
            }
            return Ok(CommandOutput::SvPostponed);
        }
        if payload.len() != self.signature_length {
            return Err(Error::unexpected_length(
                self.action.command_ref(),
                "Incorrect SV signature length",
            ));
        }
        Ok(CommandOutput::SvSignature(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferCapacity;
    use crate::context::{SessionState, TransactionContext};
    use hex_literal::hex;

    fn card() -> CalypsoCard {
        CalypsoCard::new(vec![0x01; 8], BufferCapacity::bytes(430))
    }

    fn security() -> SvSecurityData {
        SvSecurityData {
            sam_id: hex!("A1A2A3A4"),
            sam_tnum: hex!("000010"),
            signature_hi: Bytes::from_static(&hex!("0102030405")),
        }
    }

    const STAMP: SvLogStamp = SvLogStamp {
        date: hex!("1234"),
        time: hex!("0A0B"),
        free: hex!("AABB"),
    };

    #[test]
    fn test_reload_request() {
        let mut cmd = SvOperationCommand::new(&card(), SvAction::Reload, 2, 0x79, STAMP);
        assert_eq!(cmd.partial_request().as_ref(), hex!("00B8000016 1234 AA 79 BB 000002 0A0B"));
        assert!(!cmd.is_finalized());

        cmd.finalize(&security()).unwrap();
        assert_eq!(
            cmd.request().to_bytes().as_ref(),
            hex!("00B8000016 1234 AA 79 BB 000002 0A0B A1A2A3A4 000010 0102030405 00")
        );
        assert!(cmd.uses_session_buffer());
        assert!(cmd.requires_crypto_finalization());
    }

    #[test]
    fn test_debit_amount_is_negated() {
        let debit = SvOperationCommand::new(&card(), SvAction::Debit, 5, 0x79, STAMP);
        assert_eq!(debit.partial_request().as_ref(), hex!("00BA000013 FFFB 1234 0A0B 79"));

        let undebit = SvOperationCommand::new(&card(), SvAction::Undebit, 5, 0x79, STAMP);
        assert_eq!(undebit.partial_request().as_ref(), hex!("00BC000013 0005 1234 0A0B 79"));
    }

    #[test]
    fn test_finalize_checks_signature_length() {
        let extended = card().with_extended_mode(true);
        let mut cmd = SvOperationCommand::new(&extended, SvAction::Reload, 2, 0x79, STAMP);
        assert!(matches!(
            cmd.finalize(&security()),
            Err(Error::IllegalParameter(_))
        ));
    }

    #[test]
    fn test_parse_signature() {
        let mut ctx = TransactionContext::new(card());
        let mut cmd = SvOperationCommand::new(&card(), SvAction::Reload, 2, 0x79, STAMP);
        let ok = Response::from_bytes(&hex!("C1C2C39000")).unwrap();
        assert_eq!(
            cmd.parse_response(&mut CommandContext::new(&mut ctx), &ok)
                .unwrap(),
            CommandOutput::SvSignature(Bytes::from_static(&hex!("C1C2C3")))
        );

        let wrong = Response::from_bytes(&hex!("C1C29000")).unwrap();
        assert!(
            cmd.parse_response(&mut CommandContext::new(&mut ctx), &wrong)
                .is_err()
        );
    }

    #[test]
    fn test_parse_postponed_signature() {
        let mut ctx = TransactionContext::new(card());
        let mut cmd = SvOperationCommand::new(&card(), SvAction::Reload, 2, 0x79, STAMP);
        let postponed = Response::from_bytes(&hex!("6200")).unwrap();
        assert!(matches!(
            cmd.parse_response(&mut CommandContext::new(&mut ctx), &postponed),
            Err(Error::SvConsistency(_))
        ));

        ctx.session = SessionState::Open;
        assert_eq!(
            cmd.parse_response(&mut CommandContext::new(&mut ctx), &postponed)
                .unwrap(),
            CommandOutput::SvPostponed
        );

        let with_data = Response::from_bytes(&hex!("C1C2C36200")).unwrap();
        assert!(matches!(
            cmd.parse_response(&mut CommandContext::new(&mut ctx), &with_data),
            Err(Error::UnexpectedResponseLength(_))
        ));
    }
}
