//! cypherstream-client: the transactional streaming engine.
//!
//! Statements written to a transaction are batched, sent to the
//! transactional HTTP endpoint, and the response is decoded incrementally
//! into rows on the transaction's event channel and on any per-statement
//! sub-streams.

pub mod batcher;
pub mod client;
pub mod multiplexer;
pub mod parser;
pub mod transaction;
pub mod transport;

pub use client::CypherClient;
pub use transaction::{TransactionEvents, TransactionHandle, TransactionWriter, WriteReceipt};
pub use transport::{HttpTransport, Method, Transport, TransportRequest, TransportResponse};

pub use cypherstream_core::{
    ClientConfig, Completion, Directives, EngineError, ErrorKind, Parameters, Record, ReturnType,
    RowStream, Statement, StatementInput, TransactionEvent, TransactionOptions, TransactionState,
    TransactionStatus,
};
