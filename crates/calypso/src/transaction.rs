//! Secure session transaction engine
//!
//! A [`CardTransaction`] owns the card transport, a handle on the SAM and
//! the [`TransactionContext`]. Commands are prepared into a queue and sent
//! by [`CardTransaction::execute_all`]; session and stored value operations
//! flush the queue and run immediately.
//!
//! Each command goes through the same pipeline: session buffer admission,
//! SAM synchronization before the exchange, the exchange itself, SAM
//! synchronization after it, anticipated response check, status word
//! mapping and finally response parsing into the context.

use bytes::Bytes;
use calypso_apdu_core::{CardTransport, Response};
use tracing::{debug, instrument, warn};

use crate::card::{CalypsoCard, WriteAccessLevel};
use crate::commands::{
    CardCommand, CloseSessionCommand, CommandOutput, CommandRef, CounterCommand, OpenSessionCommand,
    ReadRecordsCommand, SelectFileCommand, SvGetCommand, SvLogStamp, SvOperationCommand,
    UpdateRecordCommand,
};
use crate::config::TransactionSettings;
use crate::context::{
    CommandContext, OpenSessionData, RecordStore, SessionState, TransactionContext,
};
use crate::crypto::CryptoSynchronizer;
use crate::error::{CommandFailure, Error, Result};
use crate::sam::{DigestInit, SecurityModule, SharedSam, SvPrepareRequest};
use crate::status::check_status;
use crate::sv::{StoredValueCoordinator, SvAction, SvGetData, SvOperation, SvPhase};

/// Outcome of one command of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Response received and parsed
    Completed(CommandOutput),
    /// The command failed; `partial` holds what could be salvaged
    Failed {
        /// Cause of the failure
        error: Error,
        /// Data parsed before the failure, if any
        partial: Option<CommandOutput>,
    },
    /// Not sent because an earlier command of the batch failed
    Skipped,
}

/// Result slot of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Command kind
    pub command: CommandRef,
    /// Outcome
    pub outcome: CommandOutcome,
    /// Plain response, when one was received
    pub response: Option<Response>,
}

impl CommandResult {
    fn skipped(command: CommandRef) -> Self {
        Self {
            command,
            outcome: CommandOutcome::Skipped,
            response: None,
        }
    }

    /// Error of the command, if it failed
    pub const fn error(&self) -> Option<&Error> {
        match &self.outcome {
            CommandOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Per-command outcomes of a batch plus the session outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// One entry per command, in execution order
    pub results: Vec<CommandResult>,
    /// Session state once the batch is over
    pub session_state: SessionState,
    /// Whether the session was aborted by the batch
    pub aborted: bool,
    /// Failure of the best-effort abort close, if any
    pub abort_close_error: Option<Error>,
}

impl BatchReport {
    /// Whether every command completed
    pub fn is_success(&self) -> bool {
        self.results
            .iter()
            .all(|r| matches!(r.outcome, CommandOutcome::Completed(_)))
    }

    /// First command error of the batch
    pub fn first_error(&self) -> Option<&Error> {
        self.results.iter().find_map(CommandResult::error)
    }
}

struct Failure {
    error: Error,
    partial: Option<CommandOutput>,
    response: Option<Response>,
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self {
            error,
            partial: None,
            response: None,
        }
    }
}

impl From<calypso_apdu_core::TransportError> for Failure {
    fn from(error: calypso_apdu_core::TransportError) -> Self {
        Error::from(error).into()
    }
}

/// Transaction with one card
#[derive(Debug)]
pub struct CardTransaction<T: CardTransport, S: SecurityModule> {
    transport: T,
    sam: SharedSam<S>,
    context: TransactionContext,
    settings: TransactionSettings,
    sync: CryptoSynchronizer,
    queue: Vec<Box<dyn CardCommand>>,
}

impl<T: CardTransport, S: SecurityModule> CardTransaction<T, S> {
    /// Start a transaction with default settings
    pub fn new(transport: T, sam: SharedSam<S>, card: CalypsoCard) -> Self {
        Self {
            transport,
            sam,
            context: TransactionContext::new(card),
            settings: TransactionSettings::default(),
            sync: CryptoSynchronizer,
            queue: Vec::new(),
        }
    }

    /// Replace the settings
    pub fn with_settings(mut self, settings: TransactionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Consult `store` for record contents unknown to the transaction
    pub fn with_record_store(mut self, store: impl RecordStore + 'static) -> Self {
        self.context.set_record_store(Box::new(store));
        self
    }

    /// Transaction state
    pub const fn context(&self) -> &TransactionContext {
        &self.context
    }

    /// Settings in use
    pub const fn settings(&self) -> &TransactionSettings {
        &self.settings
    }

    /// Card transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Session buffer used by the current session
    pub const fn session_buffer_usage(&self) -> usize {
        self.context.buffer.usage()
    }

    /// Number of prepared commands not sent yet
    pub fn pending_commands(&self) -> usize {
        self.queue.len()
    }

    fn coordinator(&self) -> StoredValueCoordinator {
        StoredValueCoordinator::new(&self.settings)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.context.is_finished() {
            return Err(Error::IllegalState(
                "The transaction is over, reset it before issuing new commands",
            ));
        }
        Ok(())
    }

    fn ensure_session_open(&self) -> Result<()> {
        if !self.context.is_session_open() {
            return Err(Error::IllegalState("No secure session is open"));
        }
        Ok(())
    }

    /// Queue a command
    pub fn enqueue(&mut self, command: Box<dyn CardCommand>) -> &mut Self {
        self.queue.push(command);
        self
    }

    /// Queue a Select File by LID
    pub fn prepare_select_file(&mut self, lid: u16) -> &mut Self {
        let class = self.context.card().class;
        self.enqueue(Box::new(SelectFileCommand::by_lid(class, lid)))
    }

    /// Queue the read of one record
    pub fn prepare_read_record(&mut self, sfi: u8, record: u8, le: u8) -> &mut Self {
        let class = self.context.card().class;
        self.enqueue(Box::new(ReadRecordsCommand::one(class, sfi, record, le)))
    }

    /// Queue the read of consecutive records
    pub fn prepare_read_records(
        &mut self,
        sfi: u8,
        first_record: u8,
        record_size: usize,
        le: u8,
    ) -> &mut Self {
        let class = self.context.card().class;
        self.enqueue(Box::new(ReadRecordsCommand::multiple(
            class,
            sfi,
            first_record,
            record_size,
            le,
        )))
    }

    /// Queue the update of a record
    pub fn prepare_update_record(
        &mut self,
        sfi: u8,
        record: u8,
        data: impl Into<Bytes>,
    ) -> &mut Self {
        let class = self.context.card().class;
        self.enqueue(Box::new(UpdateRecordCommand::update(class, sfi, record, data)))
    }

    /// Queue the append of a record to a cyclic file
    pub fn prepare_append_record(&mut self, sfi: u8, data: impl Into<Bytes>) -> &mut Self {
        let class = self.context.card().class;
        self.enqueue(Box::new(UpdateRecordCommand::append(class, sfi, data)))
    }

    /// Queue the increase of a counter
    pub fn prepare_increase(&mut self, sfi: u8, counter: u8, delta: u32) -> &mut Self {
        let class = self.context.card().class;
        self.enqueue(Box::new(CounterCommand::increase(class, sfi, counter, delta)))
    }

    /// Queue the decrease of a counter
    pub fn prepare_decrease(&mut self, sfi: u8, counter: u8, delta: u32) -> &mut Self {
        let class = self.context.card().class;
        self.enqueue(Box::new(CounterCommand::decrease(class, sfi, counter, delta)))
    }

    /// Send every prepared command
    ///
    /// Failures are reported per command. A fatal failure, or any failure of
    /// a command consuming the session buffer, skips the rest of the batch
    /// and aborts the open session.
    #[instrument(skip(self), fields(commands = self.queue.len()))]
    pub fn execute_all(&mut self) -> Result<BatchReport> {
        self.ensure_usable()?;
        let commands = std::mem::take(&mut self.queue);
        Ok(self.run_batch(commands))
    }

    fn run_batch(&mut self, commands: Vec<Box<dyn CardCommand>>) -> BatchReport {
        let mut results = Vec::with_capacity(commands.len());
        let mut stopped = false;
        let mut aborted = false;
        let mut abort_close_error = None;

        for mut command in commands {
            let command_ref = command.command_ref();
            if stopped {
                results.push(CommandResult::skipped(command_ref));
                continue;
            }

            match self.process(command.as_mut()) {
                Ok((output, response)) => results.push(CommandResult {
                    command: command_ref,
                    outcome: CommandOutcome::Completed(output),
                    response: Some(response),
                }),
                Err(failure) => {
                    let session_write =
                        self.context.is_session_open() && command.uses_session_buffer();
                    stopped = failure.error.is_fatal()
                        || session_write
                        || command_ref == CommandRef::OpenSession;
                    if command_ref == CommandRef::OpenSession {
                        self.context.end_session();
                    }
                    results.push(CommandResult {
                        command: command_ref,
                        outcome: CommandOutcome::Failed {
                            error: failure.error,
                            partial: failure.partial,
                        },
                        response: failure.response,
                    });
                    if stopped && self.context.is_session_open() {
                        aborted = true;
                        abort_close_error = self.abort_close().err();
                        self.context.finished = true;
                    }
                }
            }
        }

        BatchReport {
            results,
            session_state: self.context.session_state(),
            aborted,
            abort_close_error,
        }
    }

    /// Run the pipeline of one command
    fn process(
        &mut self,
        command: &mut dyn CardCommand,
    ) -> std::result::Result<(CommandOutput, Response), Failure> {
        let command_ref = command.command_ref();
        if self.context.is_session_open() && command.uses_session_buffer() {
            self.admit(command)?;
        }

        let strategy = self.sync.strategy(&self.context, command);
        let request = command.request().to_bytes();
        let sent = if strategy.requires_pre_sync() {
            self.sam
                .with(|sam| self.sync.synchronize_before(sam, &strategy, request.clone()))?
        } else {
            request.clone()
        };

        let raw = self.transport.transmit_raw(&sent)?;

        let response = if strategy.requires_post_sync() {
            self.sam
                .with(|sam| self.sync.synchronize_after(sam, &strategy, &request, &raw))?
        } else {
            CryptoSynchronizer::decode(&raw)?
        };

        if let Err(error) = self.sync.verify_anticipated(command_ref, &strategy, &response) {
            return Err(Failure {
                error,
                partial: None,
                response: Some(response),
            });
        }

        if let Err(error) = check_status(command_ref, command.status_table(), response.status()) {
            let partial =
                command.parse_partial(&mut CommandContext::new(&mut self.context), &response);
            return Err(Failure {
                error,
                partial,
                response: Some(response),
            });
        }

        let mut ctx = CommandContext::new(&mut self.context);
        let parsed = command
            .parse_response(&mut ctx, &response)
            .and_then(|output| {
                if let CommandOutput::SessionOpened(data) = &output {
                    self.on_session_opened(data, response.payload())?;
                }
                Ok(output)
            });

        match parsed {
            Ok(output) => Ok((output, response)),
            Err(error) => Err(Failure {
                error,
                partial: None,
                response: Some(response),
            }),
        }
    }

    /// Reserve buffer space for a command, rotating the session if allowed
    fn admit(&mut self, command: &dyn CardCommand) -> Result<()> {
        if self.context.buffer.admit(command) {
            return Ok(());
        }

        let level = self.context.write_access_level();
        let can_rotate = self.settings.multiple_session_enabled
            && !self.context.is_encryption_active()
            && !self.context.sv.is_pending()
            && !self.context.sv.is_postponed()
            && self.context.buffer.fits_empty_session(command);
        match level {
            Some(level) if can_rotate && level != WriteAccessLevel::Debit => {
                debug!(%level, "Session buffer full, closing and reopening the session");
                self.close_secure_session()?;
                self.open_now(level, 0, 0)?;
                if self.context.buffer.admit(command) {
                    return Ok(());
                }
            }
            _ => {}
        }

        warn!(
            command = %command.command_ref(),
            usage = self.context.buffer.usage(),
            cost = self.context.buffer.cost(command),
            "Session buffer overflow"
        );
        Err(Error::SessionBufferOverflow(CommandFailure::local(
            command.command_ref(),
            "The command does not fit in the session buffer",
        )))
    }

    fn on_session_opened(&mut self, data: &OpenSessionData, open_response: &[u8]) -> Result<()> {
        let level = self
            .context
            .write_access_level()
            .ok_or(Error::IllegalState("Session opened without access level"))?;
        let extended_mode = self.context.card().extended_mode;
        self.sam.with(|sam| {
            sam.init_session_digest(&DigestInit {
                level,
                kif: data.kif,
                kvc: data.kvc,
                extended_mode,
                open_session_data: open_response,
            })
        })?;
        self.context.buffer.reset();
        self.context.sv.on_session_opened();
        self.context.session = SessionState::Open;
        Ok(())
    }

    /// Send the queued commands, returning the first failure
    fn flush(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let commands = std::mem::take(&mut self.queue);
        let report = self.run_batch(commands);
        match report.first_error() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Run one command immediately, after the queued ones
    fn execute_now(&mut self, command: Box<dyn CardCommand>) -> Result<(CommandOutput, Response)> {
        let report = self.run_batch(vec![command]);
        let Some(result) = report.results.into_iter().next() else {
            return Err(Error::IllegalState("Command was not executed"));
        };
        match (result.outcome, result.response) {
            (CommandOutcome::Completed(output), Some(response)) => Ok((output, response)),
            (CommandOutcome::Failed { error, .. }, _) => Err(error),
            _ => Err(Error::IllegalState("Command was not executed")),
        }
    }

    fn open_now(
        &mut self,
        level: WriteAccessLevel,
        sfi: u8,
        record: u8,
    ) -> Result<OpenSessionData> {
        let card = self.context.card();
        let challenge = self
            .sam
            .with(|sam| sam.terminal_challenge(card.challenge_length()))?;
        let command = OpenSessionCommand::new(card, level, &challenge, sfi, record);
        self.context.write_access_level = Some(level);
        match self.execute_now(Box::new(command))? {
            (CommandOutput::SessionOpened(data), _) => Ok(data),
            _ => Err(Error::IllegalState("Unexpected Open Secure Session output")),
        }
    }

    /// Open a secure session at `level`
    pub fn open_session(&mut self, level: WriteAccessLevel) -> Result<OpenSessionData> {
        self.open_session_and_read(level, 0, 0)
    }

    /// Open a secure session at `level`, reading `record` of `sfi` on the way
    pub fn open_session_and_read(
        &mut self,
        level: WriteAccessLevel,
        sfi: u8,
        record: u8,
    ) -> Result<OpenSessionData> {
        self.ensure_usable()?;
        if self.context.is_session_open() {
            return Err(Error::IllegalState("A secure session is already open"));
        }
        self.flush()?;
        self.open_now(level, sfi, record)
    }

    /// Place an Open Secure Session at the head of the queue
    ///
    /// The session is considered open right away. Commands queued after it
    /// feed the SAM with their anticipated responses when these can be
    /// computed from data already known.
    pub fn pre_open_session(&mut self, level: WriteAccessLevel) -> Result<()> {
        self.ensure_usable()?;
        if self.context.is_session_open() {
            return Err(Error::IllegalState("A secure session is already open"));
        }
        let card = self.context.card();
        let challenge = self
            .sam
            .with(|sam| sam.terminal_challenge(card.challenge_length()))?;
        let command = OpenSessionCommand::new(card, level, &challenge, 0, 0);
        self.queue.insert(0, Box::new(command));
        self.context.write_access_level = Some(level);
        self.context.session = SessionState::Open;
        self.context.pre_open = true;
        self.context.buffer.reset();
        debug!(%level, "Session pre-opened");
        Ok(())
    }

    /// Close with the session MAC and check the card MAC, without ending the
    /// transaction
    ///
    /// Returns the response data the card postponed until the close.
    fn close_secure_session(&mut self) -> Result<Vec<Bytes>> {
        let mac = self.sam.with(|sam| sam.compute_session_mac())?;
        let p1 = self.settings.close_session_p1();
        let command = CloseSessionCommand::close(self.context.card(), p1, mac);
        let (output, _) = self.execute_now(Box::new(command))?;
        let CommandOutput::SessionClosed { card_mac, postponed } = output else {
            return Err(Error::IllegalState("Unexpected Close Secure Session output"));
        };
        let verified = self.sam.with(|sam| sam.verify_card_mac(&card_mac))?;
        self.context.end_session();
        if !verified {
            return Err(Error::SecurityContext(CommandFailure::local(
                CommandRef::CloseSession,
                "Card session MAC is incorrect",
            )));
        }
        debug!(postponed = postponed.len(), "Secure session closed");
        Ok(postponed)
    }

    /// Check the SV signature the card returned with the session close
    fn check_postponed_sv(&mut self, postponed: &[Bytes]) -> Result<()> {
        if !self.context.sv.is_postponed() {
            return Ok(());
        }
        let coordinator = self.coordinator();
        let Some(signature) = postponed.first() else {
            self.context.sv.phase = SvPhase::Idle;
            return Err(Error::SecurityData(CommandFailure::local(
                CommandRef::CloseSession,
                "The postponed SV signature is missing",
            )));
        };
        let verified = self.sam.with(|sam| sam.verify_sv_signature(signature))?;
        coordinator.complete_check(&mut self.context.sv, verified).map(|_| ())
    }

    /// Best-effort abort of the card session
    fn abort_close(&mut self) -> Result<()> {
        self.context.session = SessionState::Aborting;
        let command = CloseSessionCommand::abort(self.context.card().class);
        let result = self
            .transport
            .transmit(command.request())
            .map_err(Error::from)
            .and_then(|response| {
                check_status(CommandRef::CloseSession, command.status_table(), response.status())
            });
        if let Err(e) = self.sam.with(|sam| sam.reset_session()) {
            warn!(error = %e, "SAM session reset failed");
        }
        self.context.end_session();
        match &result {
            Ok(()) => debug!("Secure session aborted"),
            Err(e) => warn!(error = %e, "Abort of the secure session failed"),
        }
        result
    }

    /// Close the secure session
    ///
    /// Prepared commands are sent first. With `ratified` unset the session is
    /// aborted and every modification is cancelled. A postponed SV signature
    /// is checked once the card MAC is verified.
    pub fn close_session(&mut self, ratified: bool) -> Result<()> {
        self.ensure_usable()?;
        self.ensure_session_open()?;
        self.flush()?;
        if !self.context.is_session_open() {
            return Err(Error::IllegalState("The secure session was aborted"));
        }

        if !ratified {
            let result = self.abort_close();
            self.context.finished = true;
            return result;
        }

        if self.context.sv.is_pending() {
            if let Err(e) = self.abort_close() {
                debug!(error = %e, "Abort after missing SV check failed");
            }
            self.context.finished = true;
            return Err(Error::SecurityData(CommandFailure::local(
                CommandRef::CloseSession,
                "The SV operation was not checked before closing",
            )));
        }

        let result = self
            .close_secure_session()
            .and_then(|postponed| self.check_postponed_sv(&postponed));
        if result.is_err() && self.context.is_session_open() {
            if let Err(e) = self.abort_close() {
                debug!(error = %e, "Abort after failed close failed");
            }
        }
        self.context.finished = true;
        result
    }

    /// Abort the secure session, dropping prepared commands
    pub fn abort_session(&mut self) -> Result<()> {
        self.ensure_session_open()?;
        self.queue.clear();
        let result = self.abort_close();
        self.context.finished = true;
        result
    }

    /// Cipher the following commands of the session
    pub fn activate_encryption(&mut self) -> Result<()> {
        self.set_encryption(true)
    }

    /// Stop ciphering the following commands
    pub fn deactivate_encryption(&mut self) -> Result<()> {
        self.set_encryption(false)
    }

    fn set_encryption(&mut self, active: bool) -> Result<()> {
        self.ensure_usable()?;
        self.ensure_session_open()?;
        if !self.context.card().extended_mode {
            return Err(Error::IllegalState("Encryption requires the extended mode"));
        }
        self.flush()?;
        self.context.encryption_active = active;
        debug!(active, "Session encryption switched");
        Ok(())
    }

    /// Read the stored value state ahead of `operation`
    pub fn sv_get(&mut self, operation: SvOperation) -> Result<SvGetData> {
        self.ensure_usable()?;
        self.flush()?;
        let coordinator = self.coordinator();
        coordinator.check_get(&self.context.sv)?;

        let command = SvGetCommand::new(self.context.card(), operation);
        let header = command.header();
        let (output, response) = self.execute_now(Box::new(command))?;
        let CommandOutput::SvData(data) = output else {
            return Err(Error::IllegalState("Unexpected SV Get output"));
        };
        let raw = response.to_bytes();
        coordinator.record_get(&mut self.context.sv, operation, data.clone(), header, raw);
        Ok(data)
    }

    /// Reload the balance by `amount`
    pub fn sv_reload(&mut self, amount: i32) -> Result<()> {
        self.sv_operation(SvAction::Reload, amount, SvLogStamp::default())
    }

    /// Debit the balance by `amount`
    pub fn sv_debit(&mut self, amount: i32) -> Result<()> {
        self.sv_operation(SvAction::Debit, amount, SvLogStamp::default())
    }

    /// Cancel a debit of `amount`
    pub fn sv_undebit(&mut self, amount: i32) -> Result<()> {
        self.sv_operation(SvAction::Undebit, amount, SvLogStamp::default())
    }

    /// Run an SV Reload, Debit or Undebit with explicit log data
    pub fn sv_operation(&mut self, action: SvAction, amount: i32, stamp: SvLogStamp) -> Result<()> {
        self.ensure_usable()?;
        self.flush()?;
        let coordinator = self.coordinator();
        let in_session = self.context.is_session_open();
        coordinator.check_action(&self.context.sv, action, amount, in_session)?;

        let sv = &self.context.sv;
        let kvc = sv
            .data
            .as_ref()
            .map(|data| data.kvc)
            .ok_or(Error::SvConsistency("No SV data available"))?;
        let mut command = SvOperationCommand::new(self.context.card(), action, amount, kvc, stamp);
        let partial_request = command.partial_request();
        let security = self.sam.with(|sam| {
            sam.prepare_sv_operation(&SvPrepareRequest {
                operation: action.operation(),
                action,
                sv_get_header: &sv.sv_get_header,
                sv_get_response: &sv.sv_get_response,
                partial_request: &partial_request,
            })
        })?;
        command.finalize(&security)?;

        let (output, _) = self.execute_now(Box::new(command))?;
        match output {
            CommandOutput::SvSignature(signature) => {
                let sv = &mut self.context.sv;
                coordinator.record_action(sv, action, amount, signature, in_session);
            }
            CommandOutput::SvPostponed => {
                coordinator.record_postponed(&mut self.context.sv, action, amount);
            }
            _ => return Err(Error::IllegalState("Unexpected SV operation output")),
        }
        Ok(())
    }

    /// Have the SAM check the signature of the last SV operation, returning
    /// the new balance
    ///
    /// A failed check aborts the open session.
    pub fn sv_check(&mut self) -> Result<i32> {
        self.ensure_usable()?;
        let coordinator = self.coordinator();
        let signature = coordinator.pending_signature(&self.context.sv)?;
        let result = self
            .sam
            .with(|sam| sam.verify_sv_signature(&signature))
            .map_err(Error::from)
            .and_then(|verified| coordinator.complete_check(&mut self.context.sv, verified));

        if result.is_err() && self.context.is_session_open() {
            if let Err(e) = self.abort_close() {
                debug!(error = %e, "Abort after SV check failure failed");
            }
            self.context.finished = true;
        }
        result
    }

    /// Forget everything and make the transaction usable again
    pub fn reset(&mut self) {
        self.queue.clear();
        self.context.reset();
        if let Err(e) = self.sam.with(|sam| sam.reset_session()) {
            warn!(error = %e, "SAM session reset failed");
        }
    }
}
