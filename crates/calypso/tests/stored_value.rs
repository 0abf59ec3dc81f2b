//! Stored value transactions against a scripted card

mod common;

use calypso_card::{
    CardTransaction, CommandRef, Error, SessionState, SharedSam, SvOperation, SvPhase,
    WriteAccessLevel,
};
use hex_literal::hex;

use common::{FakeSam, ScriptedTransport, card, init_tracing};

const OPEN_RESPONSE: [u8; 10] = hex!("030490 00 01 30 79 00 9000");
const CLOSE_RESPONSE: [u8; 6] = hex!("11223344 9000");
const ABORT_REQUEST: [u8; 5] = hex!("008E000000");

/// Compatibility mode reload layout, balance 100, SV TNum 5
const SV_GET_RELOAD: [u8; 35] = hex!(
    "79 0005 AABBCC 1122 000064"
    "1234 00 79 00 000062 000002 0A0B A1A2A3A4 000010 0004"
    "9000"
);

/// Compatibility mode debit layout, balance 100, last debit 7
const SV_GET_DEBIT: [u8; 32] = hex!(
    "79 0005 AABBCC 1122 000064"
    "0007 1234 0A0B 79 A1A2A3A4 000011 00006B 0004"
    "9000"
);

/// Same card after a reload of 2, balance 102, SV TNum 6
const SV_GET_RELOAD_AFTER: [u8; 35] = hex!(
    "79 0006 AABBCC 1122 000066"
    "1234 00 79 00 000064 000002 0A0B A1A2A3A4 000010 0005"
    "9000"
);

fn transaction(
    transport: ScriptedTransport,
) -> (CardTransaction<ScriptedTransport, FakeSam>, SharedSam<FakeSam>) {
    init_tracing();
    let sam = SharedSam::new(FakeSam::default());
    (CardTransaction::new(transport, sam.clone(), card(430)), sam)
}

#[test]
fn test_reload_end_to_end() {
    let transport = ScriptedTransport::new()
        .reply(OPEN_RESPONSE)
        .reply(SV_GET_RELOAD)
        .reply(hex!("C1C2C3 9000"))
        .reply(CLOSE_RESPONSE);
    let (mut tx, sam) = transaction(transport);

    tx.open_session(WriteAccessLevel::Load).unwrap();
    let data = tx.sv_get(SvOperation::Reload).unwrap();
    assert_eq!(data.balance, 100);
    assert_eq!(data.transaction_number, 5);
    assert_eq!(data.load_log.as_ref().map(|log| log.amount), Some(2));

    tx.sv_reload(2).unwrap();
    assert!(tx.context().sv().is_pending());
    assert_eq!(tx.sv_check().unwrap(), 102);
    tx.close_session(true).unwrap();

    let sv = tx.context().sv();
    assert_eq!(sv.balance(), Some(102));
    assert_eq!(sv.operations, 1);
    assert_eq!(sv.phase, SvPhase::Completed);
    assert_eq!(tx.context().session_state(), SessionState::Closed);

    let requests = &tx.transport().requests;
    assert_eq!(requests[1].as_ref(), hex!("007C000700"));
    assert_eq!(
        requests[2].as_ref(),
        hex!("00B8000016 0000 00 79 00 000002 0000 A1A2A3A4 000010 0102030405 00")
    );
    assert_eq!(
        sam.lock().sv_requests[0].as_ref(),
        hex!("00B8000016 0000 00 79 00 000002 0000")
    );
}

#[test]
fn test_second_operation_in_session_fails_locally() {
    let transport = ScriptedTransport::new()
        .reply(OPEN_RESPONSE)
        .reply(SV_GET_RELOAD)
        .reply(hex!("C1C2C3 9000"));
    let (mut tx, _) = transaction(transport);

    tx.open_session(WriteAccessLevel::Load).unwrap();
    tx.sv_get(SvOperation::Reload).unwrap();
    tx.sv_reload(2).unwrap();
    tx.sv_check().unwrap();

    let sent = tx.transport().requests.len();
    assert!(matches!(tx.sv_reload(3), Err(Error::SvConsistency(_))));
    assert_eq!(tx.transport().requests.len(), sent);
}

#[test]
fn test_operation_without_sv_get_fails_locally() {
    let (mut tx, _) = transaction(ScriptedTransport::new().reply(OPEN_RESPONSE));
    tx.open_session(WriteAccessLevel::Load).unwrap();

    assert!(matches!(tx.sv_reload(2), Err(Error::SvConsistency(_))));
    assert!(matches!(tx.sv_reload(0), Err(Error::IllegalParameter(_))));
    assert_eq!(tx.transport().requests.len(), 1);
}

#[test]
fn test_debit_beyond_balance_fails_locally() {
    let transport = ScriptedTransport::new()
        .reply(OPEN_RESPONSE)
        .reply(SV_GET_DEBIT);
    let (mut tx, _) = transaction(transport);

    tx.open_session(WriteAccessLevel::Debit).unwrap();
    let data = tx.sv_get(SvOperation::Debit).unwrap();
    assert_eq!(data.debit_log.as_ref().map(|log| log.amount), Some(7));

    assert!(matches!(tx.sv_debit(101), Err(Error::SvConsistency(_))));
    assert!(matches!(tx.sv_undebit(8), Err(Error::SvConsistency(_))));
    assert_eq!(tx.transport().requests.len(), 2);
}

#[test]
fn test_debit_is_signed_and_checked() {
    let transport = ScriptedTransport::new()
        .reply(OPEN_RESPONSE)
        .reply(SV_GET_DEBIT)
        .reply(hex!("D1D2D3 9000"))
        .reply(CLOSE_RESPONSE);
    let (mut tx, _) = transaction(transport);

    tx.open_session(WriteAccessLevel::Debit).unwrap();
    tx.sv_get(SvOperation::Debit).unwrap();
    tx.sv_debit(5).unwrap();
    assert_eq!(tx.sv_check().unwrap(), 95);
    tx.close_session(true).unwrap();

    assert_eq!(
        tx.transport().requests[2].as_ref(),
        hex!("00BA000013 FFFB 0000 0000 79 A1A2A3A4 000010 0102030405 00")
    );
}

#[test]
fn test_sv_get_precondition_failure_is_security_context() {
    let (mut tx, _) = transaction(ScriptedTransport::new().reply(hex!("6985")));

    let error = tx.sv_get(SvOperation::Reload).unwrap_err();
    assert!(matches!(error, Error::SecurityContext(_)));
    assert_eq!(error.failure().map(|f| f.command), Some(CommandRef::SvGet));
}

#[test]
fn test_rejected_signature_aborts_session() {
    let transport = ScriptedTransport::new()
        .reply(OPEN_RESPONSE)
        .reply(SV_GET_RELOAD)
        .reply(hex!("C1C2C3 9000"))
        .reply(hex!("9000"));
    let (mut tx, sam) = transaction(transport);

    tx.open_session(WriteAccessLevel::Load).unwrap();
    tx.sv_get(SvOperation::Reload).unwrap();
    tx.sv_reload(2).unwrap();
    sam.lock().accept_sv_signature = false;

    assert!(matches!(tx.sv_check(), Err(Error::SecurityData(_))));
    assert_eq!(tx.transport().requests.last().unwrap().as_ref(), ABORT_REQUEST);
    assert_eq!(tx.context().session_state(), SessionState::Closed);
    assert_eq!(tx.context().sv().balance(), Some(100));
}

#[test]
fn test_close_without_check_aborts() {
    let transport = ScriptedTransport::new()
        .reply(OPEN_RESPONSE)
        .reply(SV_GET_RELOAD)
        .reply(hex!("C1C2C3 9000"))
        .reply(hex!("9000"));
    let (mut tx, _) = transaction(transport);

    tx.open_session(WriteAccessLevel::Load).unwrap();
    tx.sv_get(SvOperation::Reload).unwrap();
    tx.sv_reload(2).unwrap();

    assert!(matches!(tx.close_session(true), Err(Error::SecurityData(_))));
    assert_eq!(tx.transport().requests.last().unwrap().as_ref(), ABORT_REQUEST);
    assert!(tx.context().is_finished());
}

#[test]
fn test_reloads_outside_session_are_not_limited() {
    let transport = ScriptedTransport::new()
        .reply(SV_GET_RELOAD)
        .reply(hex!("C1C2C3 9000"))
        .reply(SV_GET_RELOAD_AFTER)
        .reply(hex!("C4C5C6 9000"));
    let (mut tx, sam) = transaction(transport);

    tx.sv_get(SvOperation::Reload).unwrap();
    tx.sv_reload(2).unwrap();
    assert_eq!(tx.sv_check().unwrap(), 102);

    let data = tx.sv_get(SvOperation::Reload).unwrap();
    assert_eq!(data.balance, 102);
    tx.sv_reload(3).unwrap();
    assert_eq!(tx.sv_check().unwrap(), 105);

    assert_eq!(tx.context().sv().operations, 2);
    assert_eq!(tx.context().session_state(), SessionState::Closed);
    assert_eq!(tx.transport().remaining(), 0);
    assert_eq!(sam.lock().sv_signatures.len(), 2);
}

#[test]
fn test_postponed_signature_checked_at_close() {
    let transport = ScriptedTransport::new()
        .reply(OPEN_RESPONSE)
        .reply(SV_GET_RELOAD)
        .reply(hex!("6200"))
        .reply(hex!("03 C1C2C3 11223344 9000"));
    let (mut tx, sam) = transaction(transport);

    tx.open_session(WriteAccessLevel::Load).unwrap();
    tx.sv_get(SvOperation::Reload).unwrap();
    tx.sv_reload(2).unwrap();
    assert!(tx.context().sv().is_postponed());

    assert!(matches!(tx.sv_check(), Err(Error::SvConsistency(_))));
    assert_eq!(tx.context().session_state(), SessionState::Open);

    tx.close_session(true).unwrap();
    let sv = tx.context().sv();
    assert_eq!(sv.balance(), Some(102));
    assert_eq!(sv.phase, SvPhase::Completed);
    assert_eq!(sam.lock().sv_signatures[0].as_ref(), hex!("C1C2C3"));
}

#[test]
fn test_postponed_signature_missing_at_close() {
    let transport = ScriptedTransport::new()
        .reply(OPEN_RESPONSE)
        .reply(SV_GET_RELOAD)
        .reply(hex!("6200"))
        .reply(CLOSE_RESPONSE);
    let (mut tx, sam) = transaction(transport);

    tx.open_session(WriteAccessLevel::Load).unwrap();
    tx.sv_get(SvOperation::Reload).unwrap();
    tx.sv_reload(2).unwrap();

    assert!(matches!(tx.close_session(true), Err(Error::SecurityData(_))));
    assert_eq!(tx.context().session_state(), SessionState::Closed);
    assert_eq!(tx.context().sv().balance(), Some(100));
    assert!(sam.lock().sv_signatures.is_empty());
}
