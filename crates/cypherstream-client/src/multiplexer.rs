//! Routes decoded rows to the main sequence and per-statement sub-streams.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use cypherstream_core::{
    to_native, Completion, EngineError, Record, ResultCallback, ReturnType, RowStream,
    TransactionEvent,
};

/// What the multiplexer needs to know about one submitted statement.
#[derive(Clone)]
pub struct StatementSlot {
    pub ordinal: usize,
    pub metadata: bool,
    pub on_result: Option<ResultCallback>,
}

/// Tracks the open result of a single response.
///
/// At most one sub-stream is open at a time; it is closed before the next
/// result's sub-stream is opened and before the response completes.
pub struct ResultMultiplexer {
    slots: Vec<StatementSlot>,
    return_type: ReturnType,
    capacity: usize,
    cursor: Option<usize>,
    columns: Option<Vec<String>>,
    sub: Option<mpsc::Sender<TransactionEvent>>,
}

impl ResultMultiplexer {
    pub fn new(slots: Vec<StatementSlot>, return_type: ReturnType, capacity: usize) -> Self {
        Self {
            slots,
            return_type,
            capacity: capacity.max(1),
            cursor: None,
            columns: None,
            sub: None,
        }
    }

    /// Result `index` begins: close the previous sub-stream, then open one
    /// for `index` if its statement registered a callback.
    pub async fn open_result(&mut self, index: usize) -> Result<(), EngineError> {
        self.close_sub().await;
        let Some(slot) = self.slots.get(index) else {
            return Err(EngineError::protocol(format!(
                "response has result {index} but only {} statements were sent",
                self.slots.len()
            )));
        };
        self.cursor = Some(index);
        self.columns = None;

        if let Some(callback) = slot.on_result.clone() {
            let (tx, rx) = mpsc::channel(self.capacity);
            let rows = RowStream::new(rx);
            catch_unwind(AssertUnwindSafe(|| callback(rows))).map_err(EngineError::from_panic)?;
            self.sub = Some(tx);
        }
        Ok(())
    }

    pub fn columns(&mut self, names: Vec<String>) -> Result<(), EngineError> {
        if self.cursor.is_none() {
            return Err(EngineError::protocol("column list outside of a result"));
        }
        self.columns = Some(names);
        Ok(())
    }

    /// Build, normalize and deliver one row. The sub-stream receives it
    /// before the main sequence.
    pub async fn row(
        &mut self,
        result: usize,
        values: Vec<Value>,
        main: &mpsc::Sender<TransactionEvent>,
    ) -> Result<(), EngineError> {
        if self.cursor != Some(result) {
            return Err(EngineError::protocol(format!(
                "row for result {result} arrived outside of it"
            )));
        }
        let Some(columns) = &self.columns else {
            return Err(EngineError::protocol("row arrived before its column list"));
        };
        if columns.len() != values.len() {
            return Err(EngineError::protocol(format!(
                "row has {} values for {} columns",
                values.len(),
                columns.len()
            )));
        }
        let Some(slot) = self.slots.get(result) else {
            return Err(EngineError::protocol(format!("no statement for result {result}")));
        };

        let fields: Map<String, Value> = columns
            .iter()
            .cloned()
            .zip(values.into_iter().map(|value| match self.return_type {
                ReturnType::Native => to_native(value, slot.metadata),
                ReturnType::Raw => value,
            }))
            .collect();
        let record = Record::new(slot.ordinal, fields);

        let sub_gone = match &self.sub {
            Some(sub) => sub.send(TransactionEvent::Row(record.clone())).await.is_err(),
            None => false,
        };
        if sub_gone {
            // Consumer dropped its sub-stream; keep feeding the main one.
            self.sub = None;
        }
        let _ = main.send(TransactionEvent::Row(record)).await;
        Ok(())
    }

    /// The response completed; close any open sub-stream.
    pub async fn finish(&mut self) {
        self.close_sub().await;
        self.cursor = None;
    }

    /// The response failed; end any open sub-stream with `error`.
    pub async fn fail(&mut self, error: &EngineError) {
        if let Some(sub) = self.sub.take() {
            let _ = sub.send(TransactionEvent::Failed(error.clone())).await;
        }
        self.cursor = None;
    }

    async fn close_sub(&mut self) {
        if let Some(sub) = self.sub.take() {
            let _ = sub
                .send(TransactionEvent::Finished(Completion::StatementComplete))
                .await;
        }
    }
}
