//! Entry point for running statements against the transactional endpoint.

use std::sync::Arc;

use cypherstream_core::{
    ClientConfig, EngineError, Parameters, RowStream, StatementInput, TransactionOptions,
};

use crate::transaction::{self, TransactionHandle};
use crate::transport::{HttpTransport, Transport};

/// Opens transactions against one endpoint.
///
/// Clone is cheap (inner Arc). Every transaction it opens is independent.
#[derive(Clone)]
pub struct CypherClient {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
}

impl CypherClient {
    /// Client over HTTP using the credentials in `config`.
    pub fn connect(config: ClientConfig) -> Result<Self, EngineError> {
        let transport = HttpTransport::new(&config)?;
        tracing::info!(endpoint = %config.endpoint, "Client configured");
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run `input` in a single auto-committed exchange and stream its rows.
    ///
    /// `parameters` apply to every statement that has none of its own.
    /// Must be called within a Tokio runtime.
    pub fn open(
        &self,
        input: impl Into<StatementInput>,
        parameters: Option<Parameters>,
        options: Option<TransactionOptions>,
    ) -> RowStream {
        let mut input = input.into();
        if let Some(parameters) = parameters {
            input = input.with_default_parameters(parameters);
        }

        let mut transaction = self.open_transaction(options);
        if let Err(error) = transaction.write(input) {
            return RowStream::failed(error);
        }
        transaction.commit();
        transaction.into_rows()
    }

    /// Start a transaction. Nothing is sent until the first flush.
    ///
    /// Must be called within a Tokio runtime.
    pub fn open_transaction(&self, options: Option<TransactionOptions>) -> TransactionHandle {
        let options = options.unwrap_or_else(|| self.config.transaction.clone());
        transaction::spawn(self.transport.clone(), &self.config, options)
    }
}
