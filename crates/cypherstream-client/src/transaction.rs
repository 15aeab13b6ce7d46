//! Transaction lifecycle.
//!
//! Each transaction is driven by one spawned task that owns its write queue,
//! id, and timers. Callers talk to it through a [`TransactionHandle`]:
//! commands go in over an unbounded channel, events come back over a
//! bounded one, and the current [`TransactionStatus`] is published on a
//! watch channel. Flushes run inside the task, so at most one request is in
//! flight per transaction.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tracing::Instrument;
use uuid::Uuid;

use cypherstream_core::{
    normalize, BatchDirectives, ClientConfig, Completion, EngineError, ResponseEvent, RowStream,
    Statement, StatementInput, TransactionEvent, TransactionOptions, TransactionState,
    TransactionStatus,
};

use crate::batcher::{Batch, PendingWrite, QueuedStatement, Settle, WriteBatcher};
use crate::multiplexer::ResultMultiplexer;
use crate::parser::{transaction_id_from_location, ResponseParser, RowFormat};
use crate::transport::{Method, Transport, TransportRequest};

enum Command {
    Write {
        statements: Vec<Statement>,
        directives: BatchDirectives,
        settle: Settle,
    },
    Commit,
    Rollback,
    /// Input that failed normalization; fails the transaction when reached.
    Reject {
        error: EngineError,
        settle: Settle,
    },
}

/// Start the task for a new transaction.
pub(crate) fn spawn(
    transport: Arc<dyn Transport>,
    config: &ClientConfig,
    options: TransactionOptions,
) -> TransactionHandle {
    let trace_id = Uuid::new_v4();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::channel(config.channel_capacity.max(1));

    let state = if options.transaction_id.is_some() {
        TransactionState::Open
    } else {
        TransactionState::Unopened
    };
    let (status_tx, status_rx) = watch::channel(TransactionStatus {
        state,
        id: options.transaction_id.clone(),
        expires: None,
    });

    let engine = Engine {
        transport,
        endpoint: config.endpoint.trim_end_matches('/').to_string(),
        capacity: config.channel_capacity.max(1),
        batcher: WriteBatcher::new(options.batch_size, options.debounce()),
        id: options.transaction_id.clone(),
        options,
        state,
        expires_at: None,
        next_ordinal: 0,
        status: status_tx,
        events: event_tx,
    };
    tokio::spawn(
        engine
            .run(command_rx)
            .instrument(tracing::info_span!("transaction", trace_id = %trace_id)),
    );

    TransactionHandle {
        writer: TransactionWriter {
            commands: command_tx,
            status: status_rx.clone(),
            closing: None,
        },
        events: TransactionEvents {
            events: event_rx,
            status: status_rx,
        },
    }
}

// ── Engine task ───────────────────────────────────────────────────

struct Engine {
    transport: Arc<dyn Transport>,
    endpoint: String,
    options: TransactionOptions,
    capacity: usize,
    batcher: WriteBatcher,
    state: TransactionState,
    id: Option<String>,
    expires_at: Option<Instant>,
    next_ordinal: usize,
    status: watch::Sender<TransactionStatus>,
    events: mpsc::Sender<TransactionEvent>,
}

impl Engine {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let idle = time::sleep(Duration::ZERO);
        let expiry = time::sleep(Duration::ZERO);
        tokio::pin!(idle, expiry);

        while !self.state.is_terminal() {
            let idle_armed = match self.batcher.idle_deadline() {
                Some(deadline) => {
                    idle.as_mut().reset(deadline);
                    true
                }
                None => false,
            };
            let expiry_armed = match self.expires_at {
                Some(deadline) if self.state == TransactionState::Open => {
                    expiry.as_mut().reset(deadline);
                    true
                }
                _ => false,
            };

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        self.abandon().await;
                        break;
                    }
                },
                () = &mut idle, if idle_armed => self.flush().await,
                () = &mut expiry, if expiry_armed => self.expire().await,
            }
        }
        tracing::debug!(state = %self.state, "Transaction task finished");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Write {
                statements,
                directives,
                settle,
            } => {
                if directives.rollback {
                    self.rollback().await;
                    let _ = settle.send(Ok(()));
                    return;
                }
                self.enqueue(statements, &directives, settle);
                if directives.commit {
                    self.commit().await;
                    return;
                }
                while self.batcher.is_full() && !self.state.is_terminal() {
                    self.flush().await;
                }
            }
            Command::Commit => self.commit().await,
            Command::Rollback => self.rollback().await,
            Command::Reject { error, settle } => {
                let _ = settle.send(Err(error.clone()));
                self.fail(error).await;
            }
        }
    }

    fn enqueue(&mut self, statements: Vec<Statement>, directives: &BatchDirectives, settle: Settle) {
        let metadata = directives.metadata.unwrap_or(self.options.metadata);
        let mut queued = Vec::with_capacity(statements.len());
        for statement in statements {
            if !statement.is_executable() {
                continue;
            }
            let Statement {
                text,
                parameters,
                directives: own,
            } = statement;
            let Some(text) = text else { continue };
            queued.push(QueuedStatement {
                ordinal: self.next_ordinal,
                text,
                parameters,
                metadata,
                on_result: own.on_result,
            });
            self.next_ordinal += 1;
        }
        tracing::debug!(statements = queued.len(), "Write queued");
        self.batcher
            .push(PendingWrite::new(queued, directives.headers.clone(), Some(settle)));
    }

    /// Send one batch's worth of queued statements.
    async fn flush(&mut self) {
        let mut batch = self.batcher.take();
        if batch.is_empty() {
            batch.settle(&Ok(()));
            return;
        }
        let result = self.exchange(&batch, false).await;
        batch.settle(&result);
        if let Err(error) = result {
            self.fail(error).await;
        }
    }

    async fn commit(&mut self) {
        if self.state.rejects_writes() {
            return;
        }
        self.set_state(TransactionState::Committing);

        while self.batcher.queued() > self.batcher.batch_size() {
            let mut batch = self.batcher.take();
            let result = self.exchange(&batch, false).await;
            batch.settle(&result);
            if let Err(error) = result {
                return self.fail(error).await;
            }
        }

        let mut batch = self.batcher.take();
        if self.id.is_none() && batch.is_empty() {
            // Nothing ever reached the server.
            batch.settle(&Ok(()));
        } else {
            let result = self.exchange(&batch, true).await;
            batch.settle(&result);
            if let Err(error) = result {
                return self.fail(error).await;
            }
        }

        self.set_state(TransactionState::Committed);
        tracing::info!(transaction_id = ?self.id, "Transaction committed");
        self.emit(TransactionEvent::Finished(Completion::Committed)).await;
    }

    async fn rollback(&mut self) {
        if self.state.rejects_writes() {
            return;
        }
        self.set_state(TransactionState::RollingBack);

        let discarded = self.batcher.discard();
        if !discarded.is_empty() {
            tracing::debug!(writes = discarded.len(), "Discarding unsent writes");
        }
        for settle in discarded {
            let _ = settle.send(Err(EngineError::InvalidState {
                state: TransactionState::RollingBack,
                operation: "flush a write on",
            }));
        }

        if let Some(id) = self.id.clone() {
            if let Err(error) = self.send_rollback(&id).await {
                return self.fail(error).await;
            }
        }

        self.set_state(TransactionState::RolledBack);
        tracing::info!(transaction_id = ?self.id, "Transaction rolled back");
        self.emit(TransactionEvent::Finished(Completion::RolledBack)).await;
    }

    /// End the transaction with `error`. Emits the single `Failed` event.
    async fn fail(&mut self, error: EngineError) {
        for settle in self.batcher.discard() {
            let _ = settle.send(Err(error.clone()));
        }
        tracing::error!(error = %error, transaction_id = ?self.id, "Transaction failed");

        // A server-reported error already voided the transaction, and a
        // failed rollback is not retried.
        let rolled_back_by_server = error.is_server_reported();
        if !rolled_back_by_server && self.state != TransactionState::RollingBack {
            if let Some(id) = self.id.clone() {
                if let Err(rollback_error) = self.send_rollback(&id).await {
                    tracing::warn!(error = %rollback_error, "Best-effort rollback failed");
                }
            }
        }

        self.set_state(TransactionState::RolledBack);
        self.emit(TransactionEvent::Failed(error)).await;
    }

    /// The writer went away without committing.
    async fn abandon(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!(transaction_id = ?self.id, "Writer dropped, rolling back");
        self.rollback().await;
    }

    async fn expire(&mut self) {
        self.expires_at = None;
        self.set_state(TransactionState::Expired);
        tracing::warn!(transaction_id = ?self.id, "Transaction expired");
        self.emit(TransactionEvent::Expired).await;
    }

    // ── Exchanges ─────────────────────────────────────────────────

    async fn exchange(&mut self, batch: &Batch, commit: bool) -> Result<(), EngineError> {
        let request = TransportRequest {
            method: Method::Post,
            url: self.url(commit),
            headers: self.headers(batch.headers()),
            body: Some(batch.request_body()),
        };
        tracing::debug!(url = %request.url, statements = batch.len(), commit, "Flushing batch");

        let mut mux = ResultMultiplexer::new(batch.slots(), self.options.return_type, self.capacity);
        let result = self.stream_response(request, batch.formats(), &mut mux).await;
        match &result {
            Ok(()) => mux.finish().await,
            Err(error) => mux.fail(error).await,
        }
        result
    }

    async fn send_rollback(&mut self, id: &str) -> Result<(), EngineError> {
        let request = TransportRequest {
            method: Method::Delete,
            url: format!("{}/{}", self.endpoint, id),
            headers: self.headers(&BTreeMap::new()),
            body: None,
        };
        tracing::debug!(url = %request.url, "Sending rollback");
        let mut mux = ResultMultiplexer::new(Vec::new(), self.options.return_type, self.capacity);
        self.stream_response(request, Vec::new(), &mut mux).await
    }

    async fn stream_response(
        &mut self,
        request: TransportRequest,
        formats: Vec<RowFormat>,
        mux: &mut ResultMultiplexer,
    ) -> Result<(), EngineError> {
        let response = self.transport.send(request).await?.into_success().await?;
        if let Some(id) = response.location.as_deref().and_then(transaction_id_from_location) {
            self.capture_id(id).await;
        }

        let mut parser = ResponseParser::new(formats);
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            for event in parser.feed(&chunk?)? {
                self.dispatch(event, mux).await?;
            }
        }
        for event in parser.finish()? {
            self.dispatch(event, mux).await?;
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        event: ResponseEvent,
        mux: &mut ResultMultiplexer,
    ) -> Result<(), EngineError> {
        match event {
            ResponseEvent::TransactionLocation(id) => self.capture_id(id).await,
            ResponseEvent::ExpiryNotice(deadline) => self.note_expiry(deadline).await,
            ResponseEvent::ResultBoundary(index) => mux.open_result(index).await?,
            ResponseEvent::ColumnList(columns) => mux.columns(columns)?,
            ResponseEvent::RowData { result, values } => {
                mux.row(result, values, &self.events).await?
            }
            ResponseEvent::StatementError { code, message } => {
                return Err(EngineError::Statement { code, message });
            }
            ResponseEvent::Done => {}
        }
        Ok(())
    }

    /// The id is assigned once; later locations are ignored.
    async fn capture_id(&mut self, id: String) {
        if self.id.is_some() {
            return;
        }
        tracing::info!(transaction_id = %id, "Transaction opened");
        self.id = Some(id.clone());
        self.status.send_modify(|status| status.id = Some(id.clone()));
        if self.state == TransactionState::Unopened {
            self.set_state(TransactionState::Open);
        }
        self.emit(TransactionEvent::TransactionId(id)).await;
    }

    /// Re-arm the expiry timer to the newest deadline.
    async fn note_expiry(&mut self, deadline: DateTime<Utc>) {
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.expires_at = Some(Instant::now() + remaining);
        self.status.send_modify(|status| status.expires = Some(deadline));
        tracing::debug!(expires = %deadline, "Expiry deadline updated");
        self.emit(TransactionEvent::Expires(deadline)).await;
    }

    fn url(&self, commit: bool) -> String {
        let mut url = self.endpoint.clone();
        if let Some(id) = &self.id {
            url.push('/');
            url.push_str(id);
        }
        if commit {
            url.push_str("/commit");
        }
        url
    }

    /// Transaction headers overlaid with those carried by the writes.
    fn headers(&self, batch: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut headers = self.options.headers.clone();
        headers.extend(batch.iter().map(|(k, v)| (k.clone(), v.clone())));
        headers.into_iter().collect()
    }

    fn set_state(&mut self, state: TransactionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "Transaction state changed");
        self.state = state;
        self.status.send_modify(|status| status.state = state);
    }

    async fn emit(&self, event: TransactionEvent) {
        // Nobody listening is not an error; the transaction still completes.
        let _ = self.events.send(event).await;
    }
}

// ── Caller handles ────────────────────────────────────────────────

/// Both halves of an open transaction.
pub struct TransactionHandle {
    writer: TransactionWriter,
    events: TransactionEvents,
}

impl TransactionHandle {
    pub fn write(&mut self, input: impl Into<StatementInput>) -> Result<WriteReceipt, EngineError> {
        self.writer.write(input)
    }

    pub fn commit(&mut self) {
        self.writer.commit();
    }

    pub fn rollback(&mut self) {
        self.writer.rollback();
    }

    pub fn status(&self) -> TransactionStatus {
        self.writer.status()
    }

    pub fn state(&self) -> TransactionState {
        self.writer.state()
    }

    pub fn id(&self) -> Option<String> {
        self.writer.id()
    }

    pub async fn next_event(&mut self) -> Option<TransactionEvent> {
        self.events.next_event().await
    }

    /// Separate the write side from the event side.
    pub fn split(self) -> (TransactionWriter, TransactionEvents) {
        (self.writer, self.events)
    }

    /// Keep only the row sequence. Dropping the writer here rolls back a
    /// transaction that was not already told to commit.
    pub fn into_rows(self) -> RowStream {
        self.events.into_rows()
    }
}

/// Write side of a transaction.
///
/// Dropping it without committing rolls the transaction back.
pub struct TransactionWriter {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<TransactionStatus>,
    /// Set as soon as commit or rollback is requested, before the task
    /// observes it.
    closing: Option<TransactionState>,
}

impl TransactionWriter {
    /// Queue statements. Fails immediately only if the transaction no longer
    /// accepts writes; every other failure arrives on the event channel.
    pub fn write(&mut self, input: impl Into<StatementInput>) -> Result<WriteReceipt, EngineError> {
        self.ensure_writable()?;
        let (settle, settled) = oneshot::channel();
        let command = match normalize(input.into()) {
            Ok(statements) => {
                let directives = BatchDirectives::hoist(&statements);
                if directives.rollback {
                    self.closing = Some(TransactionState::RollingBack);
                } else if directives.commit {
                    self.closing = Some(TransactionState::Committing);
                }
                Command::Write {
                    statements,
                    directives,
                    settle,
                }
            }
            Err(error) => Command::Reject { error, settle },
        };
        self.send(command)?;
        Ok(WriteReceipt {
            settled,
            status: self.status.clone(),
        })
    }

    /// Flush anything buffered and commit. Only the first call has an effect.
    pub fn commit(&mut self) {
        self.close(TransactionState::Committing, Command::Commit);
    }

    /// Discard anything buffered and roll back. Only the first call (or a
    /// commit before it) has an effect.
    pub fn rollback(&mut self) {
        self.close(TransactionState::RollingBack, Command::Rollback);
    }

    pub fn status(&self) -> TransactionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> TransactionState {
        self.status.borrow().state
    }

    pub fn id(&self) -> Option<String> {
        self.status.borrow().id.clone()
    }

    fn close(&mut self, closing: TransactionState, command: Command) {
        if self.closing.is_some() || self.state().rejects_writes() {
            return;
        }
        self.closing = Some(closing);
        let _ = self.commands.send(command);
    }

    fn current_state(&self) -> TransactionState {
        let published = self.state();
        match self.closing {
            Some(closing) if !published.rejects_writes() => closing,
            _ => published,
        }
    }

    fn ensure_writable(&self) -> Result<(), EngineError> {
        let state = self.current_state();
        if state.rejects_writes() {
            return Err(EngineError::InvalidState {
                state,
                operation: "write to",
            });
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands.send(command).map_err(|_| EngineError::InvalidState {
            state: self.current_state(),
            operation: "write to",
        })
    }
}

/// Resolves when the flush carrying a write's statements settles.
///
/// Writes discarded by a rollback, or never flushed because the transaction
/// ended, resolve with [`EngineError::InvalidState`].
pub struct WriteReceipt {
    settled: oneshot::Receiver<Result<(), EngineError>>,
    status: watch::Receiver<TransactionStatus>,
}

impl Future for WriteReceipt {
    type Output = Result<(), EngineError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.settled).poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(_) => Poll::Ready(Err(EngineError::InvalidState {
                state: this.status.borrow().state,
                operation: "flush a write on",
            })),
        }
    }
}

/// Event side of a transaction: notifications, rows, and exactly one
/// terminal event.
pub struct TransactionEvents {
    events: mpsc::Receiver<TransactionEvent>,
    status: watch::Receiver<TransactionStatus>,
}

impl TransactionEvents {
    pub async fn next_event(&mut self) -> Option<TransactionEvent> {
        self.events.recv().await
    }

    pub fn status(&self) -> TransactionStatus {
        self.status.borrow().clone()
    }

    pub fn into_rows(self) -> RowStream {
        RowStream::new(self.events)
    }
}

impl Stream for TransactionEvents {
    type Item = TransactionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}
