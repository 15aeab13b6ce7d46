//! cypherstream-core: shared types for the cypherstream engine.
//!
//! This crate provides the pieces every layer of the engine agrees on:
//! - Statement records and the normalizer for caller input
//! - Value normalization for rows leaving the engine
//! - The error taxonomy and its classifier
//! - Response and transaction events, records, and row streams
//! - Configuration

pub mod config;
pub mod error;
pub mod events;
pub mod statement;
pub mod stream;
pub mod value;

pub use config::{ClientConfig, TransactionOptions};
pub use error::{EngineError, ErrorKind};
pub use events::{
    Completion, Record, ResponseEvent, TransactionEvent, TransactionState, TransactionStatus,
};
pub use statement::{
    normalize, BatchDirectives, Directives, Parameters, ResultCallback, Statement, StatementInput,
};
pub use stream::RowStream;
pub use value::{to_native, ReturnType};
