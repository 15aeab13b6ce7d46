//! Row sequences handed to callers.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::events::{Record, TransactionEvent};

/// An ordered sequence of rows backed by a bounded channel.
///
/// Yields `Ok(row)` per row, then ends. A failure is yielded once as
/// `Err` and the stream ends after it. Transaction notifications on the
/// underlying channel are skipped.
#[derive(Debug)]
pub struct RowStream {
    events: mpsc::Receiver<TransactionEvent>,
    finished: bool,
}

impl RowStream {
    pub fn new(events: mpsc::Receiver<TransactionEvent>) -> Self {
        Self {
            events,
            finished: false,
        }
    }

    /// A stream that yields `error` and ends.
    pub fn failed(error: EngineError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(TransactionEvent::Failed(error));
        Self::new(rx)
    }

    /// Feed every row to `consume`. An error returned by `consume` stops the
    /// stream and comes back as [`EngineError::Consumer`].
    pub async fn try_for_each_row<F, E>(mut self, mut consume: F) -> Result<(), EngineError>
    where
        F: FnMut(Record) -> Result<(), E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        use futures::StreamExt;

        while let Some(row) = self.next().await {
            consume(row?).map_err(EngineError::consumer)?;
        }
        Ok(())
    }
}

impl Stream for RowStream {
    type Item = Result<Record, EngineError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        loop {
            match ready!(this.events.poll_recv(cx)) {
                Some(TransactionEvent::Row(record)) => return Poll::Ready(Some(Ok(record))),
                Some(TransactionEvent::Failed(error)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Some(TransactionEvent::Finished(_)) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Some(_) => continue,
                None => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(EngineError::connection(
                        "output sequence closed before completion",
                    ))));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Completion;
    use futures::StreamExt;
    use serde_json::{json, Map};

    fn row(n: i64) -> TransactionEvent {
        let mut fields = Map::new();
        fields.insert("n".into(), json!(n));
        TransactionEvent::Row(Record::new(0, fields))
    }

    #[tokio::test]
    async fn test_yields_rows_and_skips_notifications() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(TransactionEvent::TransactionId("7".into())).await.unwrap();
        tx.send(row(1)).await.unwrap();
        tx.send(TransactionEvent::Expired).await.unwrap();
        tx.send(row(2)).await.unwrap();
        tx.send(TransactionEvent::Finished(Completion::Committed)).await.unwrap();

        let rows: Vec<_> = RowStream::new(rx).collect().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].as_ref().unwrap().get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_failure_is_yielded_once_then_ends() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(row(1)).await.unwrap();
        tx.send(TransactionEvent::Failed(EngineError::protocol("bad"))).await.unwrap();
        tx.send(row(2)).await.unwrap();

        let mut stream = RowStream::new(rx);
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_channel_without_terminal_is_an_error() {
        let (tx, rx) = mpsc::channel(8);
        drop(tx);
        let mut stream = RowStream::new(rx);
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_consumer_failures_are_wrapped() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(row(1)).await.unwrap();
        tx.send(row(2)).await.unwrap();
        tx.send(TransactionEvent::Finished(Completion::Committed)).await.unwrap();

        let mut seen = 0;
        let err = RowStream::new(rx)
            .try_for_each_row(|_| {
                seen += 1;
                Err("refusing row")
            })
            .await
            .unwrap_err();
        assert_eq!(seen, 1);
        assert_eq!(err.kind(), crate::error::ErrorKind::Consumer);
    }

    #[tokio::test]
    async fn test_failed_constructor_yields_error() {
        let mut stream = RowStream::failed(EngineError::InvalidInput("empty".into()));
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }
}
