//! Write buffering and size/idle coalescing.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;

use cypherstream_core::{EngineError, Parameters, ResultCallback};

use crate::multiplexer::StatementSlot;
use crate::parser::RowFormat;

/// Resolved once the flush carrying a write's last statement settles.
pub type Settle = oneshot::Sender<Result<(), EngineError>>;

/// A statement ready to be sent, numbered within its transaction.
#[derive(Clone)]
pub struct QueuedStatement {
    pub ordinal: usize,
    pub text: String,
    pub parameters: Option<Parameters>,
    pub metadata: bool,
    pub on_result: Option<ResultCallback>,
}

impl std::fmt::Debug for QueuedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedStatement")
            .field("ordinal", &self.ordinal)
            .field("text", &self.text)
            .field("metadata", &self.metadata)
            .field("on_result", &self.on_result.is_some())
            .finish_non_exhaustive()
    }
}

/// Everything one `write` call contributed.
#[derive(Debug)]
pub struct PendingWrite {
    statements: VecDeque<QueuedStatement>,
    headers: Option<BTreeMap<String, String>>,
    settle: Option<Settle>,
}

impl PendingWrite {
    pub fn new(
        statements: Vec<QueuedStatement>,
        headers: Option<BTreeMap<String, String>>,
        settle: Option<Settle>,
    ) -> Self {
        Self {
            statements: statements.into(),
            headers,
            settle,
        }
    }
}

/// Queues writes until the batch size is reached or the idle interval
/// passes. Never reorders statements.
#[derive(Debug)]
pub struct WriteBatcher {
    queue: VecDeque<PendingWrite>,
    queued: usize,
    batch_size: usize,
    debounce: Duration,
    idle_deadline: Option<Instant>,
    /// Headers from control-only writes that flushed with no statements.
    carried_headers: BTreeMap<String, String>,
}

impl WriteBatcher {
    pub fn new(batch_size: usize, debounce: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            queued: 0,
            batch_size: batch_size.max(1),
            debounce,
            idle_deadline: None,
            carried_headers: BTreeMap::new(),
        }
    }

    /// Queue a write and re-arm the idle deadline.
    pub fn push(&mut self, write: PendingWrite) {
        self.queued += write.statements.len();
        self.queue.push_back(write);
        self.idle_deadline = Some(Instant::now() + self.debounce);
    }

    pub fn is_full(&self) -> bool {
        self.queued >= self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Statements waiting to be sent.
    pub fn queued(&self) -> usize {
        self.queued
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// When an idle flush is due, if anything is queued.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    /// Remove up to `batch_size` statements in arrival order.
    ///
    /// A write that does not fit is split; its settle handle goes with the
    /// batch holding its last statement. Headers of a batch that ends up
    /// empty are carried into the next one.
    pub fn take(&mut self) -> Batch {
        let mut batch = Batch {
            headers: std::mem::take(&mut self.carried_headers),
            ..Batch::default()
        };
        while let Some(front) = self.queue.front_mut() {
            let room = self.batch_size.saturating_sub(batch.statements.len());
            let take = front.statements.len().min(room);
            if take == 0 && !front.statements.is_empty() {
                break;
            }
            if let Some(headers) = &front.headers {
                batch.merge_headers(headers);
            }
            batch.statements.extend(front.statements.drain(..take));
            self.queued -= take;
            if !front.statements.is_empty() {
                break;
            }
            if let Some(settle) = self.queue.pop_front().and_then(|write| write.settle) {
                batch.settles.push(settle);
            }
        }
        if self.queue.is_empty() {
            self.idle_deadline = None;
        }
        if batch.is_empty() {
            self.carried_headers = batch.headers.clone();
        }
        batch
    }

    /// Drop every queued write, returning their settle handles.
    pub fn discard(&mut self) -> Vec<Settle> {
        self.queued = 0;
        self.idle_deadline = None;
        self.carried_headers.clear();
        self.queue.drain(..).filter_map(|write| write.settle).collect()
    }
}

/// Statements sent together in one request.
#[derive(Debug, Default)]
pub struct Batch {
    statements: Vec<QueuedStatement>,
    settles: Vec<Settle>,
    headers: BTreeMap<String, String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statements(&self) -> &[QueuedStatement] {
        &self.statements
    }

    /// Headers from the batch's writes; the first write to name one wins.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    fn merge_headers(&mut self, headers: &BTreeMap<String, String>) {
        for (name, value) in headers {
            self.headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Resolve every write settled by this batch. Later calls do nothing.
    pub fn settle(&mut self, result: &Result<(), EngineError>) {
        for settle in self.settles.drain(..) {
            let _ = settle.send(result.clone());
        }
    }

    pub fn formats(&self) -> Vec<RowFormat> {
        self.statements
            .iter()
            .map(|s| RowFormat::for_metadata(s.metadata))
            .collect()
    }

    pub fn slots(&self) -> Vec<StatementSlot> {
        self.statements
            .iter()
            .map(|s| StatementSlot {
                ordinal: s.ordinal,
                metadata: s.metadata,
                on_result: s.on_result.clone(),
            })
            .collect()
    }

    pub fn request_body(&self) -> Value {
        let statements: Vec<Value> = self
            .statements
            .iter()
            .map(|s| {
                let mut entry = Map::new();
                entry.insert("statement".into(), Value::String(s.text.clone()));
                if let Some(parameters) = &s.parameters {
                    entry.insert("parameters".into(), Value::Object(parameters.clone()));
                }
                entry.insert(
                    "resultDataContents".into(),
                    json!([RowFormat::for_metadata(s.metadata).key()]),
                );
                Value::Object(entry)
            })
            .collect();
        json!({ "statements": statements })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(ordinal: usize) -> QueuedStatement {
        QueuedStatement {
            ordinal,
            text: format!("RETURN {ordinal}"),
            parameters: None,
            metadata: false,
            on_result: None,
        }
    }

    fn write(ordinals: std::ops::Range<usize>) -> (PendingWrite, oneshot::Receiver<Result<(), EngineError>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingWrite::new(ordinals.map(statement).collect(), None, Some(tx)),
            rx,
        )
    }

    fn ordinals(batch: &Batch) -> Vec<usize> {
        batch.statements().iter().map(|s| s.ordinal).collect()
    }

    #[test]
    fn test_size_limit_splits_across_batches() {
        let mut batcher = WriteBatcher::new(2, Duration::ZERO);
        for i in 0..3 {
            batcher.push(write(i..i + 1).0);
        }
        assert!(batcher.is_full());

        let first = batcher.take();
        assert_eq!(ordinals(&first), vec![0, 1]);
        assert_eq!(first.settles.len(), 2);
        assert!(!batcher.is_full());

        let second = batcher.take();
        assert_eq!(ordinals(&second), vec![2]);
        assert!(batcher.is_empty());
        assert!(batcher.idle_deadline().is_none());
    }

    #[test]
    fn test_oversized_write_settles_with_its_last_chunk() {
        let mut batcher = WriteBatcher::new(2, Duration::ZERO);
        let (big, mut rx) = write(0..5);
        batcher.push(big);

        let mut first = batcher.take();
        assert_eq!(ordinals(&first), vec![0, 1]);
        assert!(first.settles.is_empty());
        first.settle(&Ok(()));
        assert!(rx.try_recv().is_err());

        assert_eq!(ordinals(&batcher.take()), vec![2, 3]);
        let mut last = batcher.take();
        assert_eq!(ordinals(&last), vec![4]);
        last.settle(&Ok(()));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_control_only_writes_are_swept() {
        let mut batcher = WriteBatcher::new(1, Duration::ZERO);
        let (a, _) = write(0..1);
        let (empty, _) = write(1..1);
        batcher.push(a);
        batcher.push(empty);

        let batch = batcher.take();
        assert_eq!(ordinals(&batch), vec![0]);
        assert_eq!(batch.settles.len(), 2);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_headers_of_an_empty_batch_carry_forward() {
        let mut batcher = WriteBatcher::new(10, Duration::ZERO);
        let control = BTreeMap::from([("X-Foo".to_string(), "control".to_string())]);
        batcher.push(PendingWrite::new(Vec::new(), Some(control), None));
        let empty = batcher.take();
        assert!(empty.is_empty());
        assert_eq!(empty.headers()["X-Foo"], "control");

        let later = BTreeMap::from([
            ("X-Foo".to_string(), "later".to_string()),
            ("X-Bar".to_string(), "bar".to_string()),
        ]);
        batcher.push(PendingWrite::new(vec![statement(0)], Some(later), None));
        let batch = batcher.take();
        assert_eq!(ordinals(&batch), vec![0]);
        assert_eq!(batch.headers()["X-Foo"], "control");
        assert_eq!(batch.headers()["X-Bar"], "bar");
        assert!(batcher.take().headers().is_empty());
    }

    #[test]
    fn test_settle_resolves_each_handle_once() {
        let mut batcher = WriteBatcher::new(10, Duration::ZERO);
        let (a, mut rx) = write(0..1);
        batcher.push(a);
        let mut batch = batcher.take();
        batch.settle(&Err(EngineError::protocol("bad")));
        batch.settle(&Ok(()));
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn test_discard_returns_pending_handles() {
        let mut batcher = WriteBatcher::new(10, Duration::ZERO);
        batcher.push(write(0..2).0);
        batcher.push(write(2..3).0);
        assert_eq!(batcher.queued(), 3);
        assert_eq!(batcher.discard().len(), 2);
        assert_eq!(batcher.queued(), 0);
        assert!(batcher.take().is_empty());
    }

    #[test]
    fn test_first_header_occurrence_wins() {
        let mut batcher = WriteBatcher::new(10, Duration::ZERO);
        let first = BTreeMap::from([("X-Foo".to_string(), "first".to_string())]);
        let second = BTreeMap::from([
            ("X-Foo".to_string(), "second".to_string()),
            ("X-Bar".to_string(), "bar".to_string()),
        ]);
        batcher.push(PendingWrite::new(vec![statement(0)], Some(first), None));
        batcher.push(PendingWrite::new(vec![statement(1)], Some(second), None));

        let batch = batcher.take();
        assert_eq!(batch.headers()["X-Foo"], "first");
        assert_eq!(batch.headers()["X-Bar"], "bar");
    }

    #[test]
    fn test_request_body_shape() {
        let mut with_params = statement(0);
        with_params.parameters = Some(json!({"x": 1}).as_object().cloned().unwrap());
        let mut with_metadata = statement(1);
        with_metadata.metadata = true;

        let mut batcher = WriteBatcher::new(10, Duration::ZERO);
        batcher.push(PendingWrite::new(vec![with_params, with_metadata], None, None));
        let batch = batcher.take();

        assert_eq!(
            batch.request_body(),
            json!({"statements": [
                {"statement": "RETURN 0", "parameters": {"x": 1}, "resultDataContents": ["row"]},
                {"statement": "RETURN 1", "resultDataContents": ["rest"]}
            ]})
        );
        assert_eq!(batch.formats(), vec![RowFormat::Row, RowFormat::Rest]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deadline_rearms_on_every_push() {
        let mut batcher = WriteBatcher::new(10, Duration::from_millis(50));
        let start = Instant::now();
        batcher.push(write(0..1).0);
        assert_eq!(batcher.idle_deadline(), Some(start + Duration::from_millis(50)));

        tokio::time::advance(Duration::from_millis(10)).await;
        batcher.push(write(1..2).0);
        assert_eq!(batcher.idle_deadline(), Some(start + Duration::from_millis(60)));
    }
}
