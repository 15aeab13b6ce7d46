//! Error taxonomy for the streaming engine.
//!
//! Every failure the engine can observe maps onto one [`EngineError`]
//! variant. Only [`EngineError::InvalidState`] is ever returned at a call
//! site; everything else is delivered as the terminal event of an output
//! sequence.

use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

use crate::events::TransactionState;

/// Errors produced by the engine.
///
/// Clone is cheap: a single failure is fanned out to the main sequence,
/// every open sub-stream, and every pending write receipt.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Invalid statement input: {0}")]
    InvalidInput(String),

    #[error("Cannot {operation} a transaction that is {state}")]
    InvalidState {
        state: TransactionState,
        operation: &'static str,
    },

    #[error("Statement failed: {code}: {message}")]
    Statement { code: String, message: String },

    #[error("Transport error{}: {body}", status_suffix(.status))]
    Transport { status: Option<u16>, body: String },

    #[error("Row consumer failed: {0}")]
    Consumer(#[source] Arc<dyn std::error::Error + Send + Sync>),

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    InvalidState,
    Statement,
    Transport,
    Consumer,
    Protocol,
}

/// A panic raised by a per-statement callback, captured as a consumer error.
#[derive(Error, Debug)]
#[error("callback panicked: {0}")]
pub struct CallbackPanic(pub String);

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Statement { .. } => ErrorKind::Statement,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Consumer(_) => ErrorKind::Consumer,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// True when the server reported the failure inside a well-formed
    /// response. The server has already voided the transaction in that case.
    pub fn is_server_reported(&self) -> bool {
        matches!(self, Self::Statement { .. })
    }

    /// Wrap an error raised by code handling an emitted row.
    pub fn consumer(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Consumer(Arc::from(error.into()))
    }

    /// Wrap a panic payload caught around a consumer callback.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Consumer(Arc::new(CallbackPanic(message)))
    }

    /// Connection-level failure with no HTTP status.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            body: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

/// Classify an HTTP status. Returns `None` for 2xx, otherwise a
/// [`EngineError::Transport`] carrying the raw body.
pub fn classify_status(status: u16, body: &[u8]) -> Option<EngineError> {
    if (200..300).contains(&status) {
        return None;
    }
    Some(EngineError::Transport {
        status: Some(status),
        body: String::from_utf8_lossy(body).into_owned(),
    })
}

pub type Result<T> = std::result::Result<T, EngineError>;
