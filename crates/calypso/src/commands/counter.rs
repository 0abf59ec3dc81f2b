use calypso_apdu_core::response::utils::{extract_int, int_to_bytes};
use calypso_apdu_core::{Command, Response};

use super::{Anticipation, CardCommand, CommandOutput, CommandRef, sfi_p2, with_success_status};
use crate::card::CardClass;
use crate::constants::{COUNTER_MAX, COUNTER_SIZE, ins};
use crate::context::{CommandContext, TransactionContext};
use crate::error::Error;
use crate::status::{ErrorKind, StatusEntry, StatusTable};

const STATUS_TABLE: StatusTable = &[
    StatusEntry::failure(
        0x6400,
        "Too many modifications in session",
        ErrorKind::SessionBufferOverflow,
    ),
    StatusEntry::failure(0x6700, "Lc value not supported", ErrorKind::IllegalParameter),
    StatusEntry::failure(
        0x6981,
        "The current EF is not a Counters or Simulated Counter EF",
        ErrorKind::CardDataAccess,
    ),
    StatusEntry::failure(
        0x6982,
        "Security conditions not fulfilled (no session, wrong key, encryption required)",
        ErrorKind::SecurityContext,
    ),
    StatusEntry::failure(
        0x6985,
        "Access forbidden (Never access mode, DF is invalidated, etc.)",
        ErrorKind::AccessForbidden,
    ),
    StatusEntry::failure(0x6986, "Command not allowed (no current EF)", ErrorKind::CardDataAccess),
    StatusEntry::failure(0x6A80, "Overflow error", ErrorKind::DataOutOfBounds),
    StatusEntry::failure(0x6A82, "File not found", ErrorKind::CardDataAccess),
    StatusEntry::failure(0x6B00, "P1 or P2 value not supported", ErrorKind::IllegalParameter),
    StatusEntry::success(0x6103, "Successful execution (possible only in ISO7816 T=0)"),
];

/// Increase or Decrease command on a counter
#[derive(Debug, Clone)]
pub struct CounterCommand {
    request: Command,
    command_ref: CommandRef,
    sfi: u8,
    counter: u8,
    delta: u32,
}

impl CounterCommand {
    /// Add `delta` to a counter
    pub fn increase(class: CardClass, sfi: u8, counter: u8, delta: u32) -> Self {
        Self::new(class, CommandRef::Increase, ins::INCREASE, sfi, counter, delta)
    }

    /// Subtract `delta` from a counter
    pub fn decrease(class: CardClass, sfi: u8, counter: u8, delta: u32) -> Self {
        Self::new(class, CommandRef::Decrease, ins::DECREASE, sfi, counter, delta)
    }

    fn new(
        class: CardClass,
        command_ref: CommandRef,
        ins: u8,
        sfi: u8,
        counter: u8,
        delta: u32,
    ) -> Self {
        let delta = delta.min(COUNTER_MAX);
        Self {
            request: Command::new_with_data_and_le(
                class.cla(),
                ins,
                counter,
                sfi_p2(sfi, 0),
                int_to_bytes(delta as i32, COUNTER_SIZE),
                0x00,
            ),
            command_ref,
            sfi,
            counter,
            delta,
        }
    }

    fn apply(&self, value: u32) -> Option<u32> {
        match self.command_ref {
            CommandRef::Increase => value.checked_add(self.delta).filter(|v| *v <= COUNTER_MAX),
            _ => value.checked_sub(self.delta),
        }
    }
}

impl CardCommand for CounterCommand {
    fn command_ref(&self) -> CommandRef {
        self.command_ref
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

    fn expected_response_length(&self) -> usize {
        COUNTER_SIZE + 2
    }

    fn anticipate(&self, ctx: &TransactionContext) -> Anticipation {
        let current = ctx.record_content(self.sfi, 1).and_then(|record| {
            let offset = usize::from(self.counter).checked_sub(1)? * COUNTER_SIZE;
            (record.len() >= offset + COUNTER_SIZE)
                .then(|| extract_int(&record, offset, COUNTER_SIZE, false) as u32)
        });
        current
            .and_then(|value| self.apply(value))
            .map_or(Anticipation::Unavailable, |value| {
                let data = int_to_bytes(value as i32, COUNTER_SIZE);
                Anticipation::Available(with_success_status(&data))
            })
    }

    fn parse_response(
        &mut self,
        ctx: &mut CommandContext<'_>,
        response: &Response,
    ) -> Result<CommandOutput, Error> {
        let payload = response.payload();
        if payload.len() != COUNTER_SIZE {
            return Err(Error::unexpected_length(
                self.command_ref,
                "Counter value expected in response",
            ));
        }
        let value = extract_int(payload, 0, COUNTER_SIZE, false) as u32;
        ctx.transaction.records.set_counter(self.sfi, self.counter, value);
        Ok(CommandOutput::Counter {
            number: self.counter,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferCapacity;
    use crate::card::CalypsoCard;
    use bytes::Bytes;
    use hex_literal::hex;

    fn context() -> TransactionContext {
        TransactionContext::new(CalypsoCard::new(vec![1; 8], BufferCapacity::bytes(430)))
    }

    #[test]
    fn test_request_bytes() {
        let cmd = CounterCommand::increase(CardClass::Iso, 0x19, 2, 10);
        assert_eq!(cmd.request().to_bytes().as_ref(), hex!("003202C8030000 0A00"));
        assert_eq!(cmd.expected_response_length(), 5);
    }

    #[test]
    fn test_anticipate_from_cached_counters() {
        let mut ctx = context();
        let increase = CounterCommand::increase(CardClass::Iso, 0x19, 2, 10);
        let decrease = CounterCommand::decrease(CardClass::Iso, 0x19, 1, 101);
        assert_eq!(increase.anticipate(&ctx), Anticipation::Unavailable);

        ctx.records.set(0x19, 1, Bytes::from_static(&hex!("000064 00012C")));
        assert_eq!(
            increase.anticipate(&ctx),
            Anticipation::Available(Bytes::from_static(&hex!("0001369000")))
        );
        // would go below zero
        assert_eq!(decrease.anticipate(&ctx), Anticipation::Unavailable);
    }

    #[test]
    fn test_parse_sets_counter() {
        let mut ctx = context();
        let mut cmd = CounterCommand::decrease(CardClass::Iso, 0x19, 1, 4);
        let response = Response::from_bytes(&hex!("0000609000")).unwrap();

        let output = cmd
            .parse_response(&mut CommandContext::new(&mut ctx), &response)
            .unwrap();
        assert_eq!(output, CommandOutput::Counter { number: 1, value: 0x60 });
        assert_eq!(ctx.records().counter(0x19, 1), Some(0x60));

        let short = Response::from_bytes(&hex!("00609000")).unwrap();
        assert!(
            cmd.parse_response(&mut CommandContext::new(&mut ctx), &short)
                .is_err()
        );
    }
}
