//! Client and transaction configuration.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`CYPHERSTREAM_` prefix, `__` between nested keys)
//! 2. Config file (`<prefix>.toml`, optional)
//! 3. Defaults

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::value::ReturnType;

/// Connection-level settings shared by every transaction a client opens.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Transaction resource URL, e.g. `http://localhost:7474/db/data/transaction`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Basic-auth user. Credentials are only ever taken from here.
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Capacity of every output channel; a full channel pauses decoding.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Defaults for transactions opened without explicit options.
    #[serde(default)]
    pub transaction: TransactionOptions,
}

/// Per-transaction options.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionOptions {
    #[serde(default)]
    pub return_type: ReturnType,

    /// Request identity/label envelopes and pass them through.
    #[serde(default)]
    pub metadata: bool,

    /// Idle interval after the most recent write before a flush.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Maximum statements per flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Attach to an existing server transaction instead of opening one.
    #[serde(default)]
    pub transaction_id: Option<String>,
}

impl TransactionOptions {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn with_return_type(mut self, return_type: ReturnType) -> Self {
        self.return_type = return_type;
        self
    }

    pub fn with_metadata(mut self, metadata: bool) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = u64::try_from(debounce.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn attach(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

fn default_endpoint() -> String {
    "http://localhost:7474/db/data/transaction".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

fn default_debounce_ms() -> u64 {
    0
}

fn default_batch_size() -> usize {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            user: None,
            password: None,
            channel_capacity: default_channel_capacity(),
            transaction: TransactionOptions::default(),
        }
    }
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            return_type: ReturnType::default(),
            metadata: false,
            debounce_ms: default_debounce_ms(),
            batch_size: default_batch_size(),
            headers: BTreeMap::new(),
            transaction_id: None,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Load from `<file_prefix>.toml` (if present) overlaid with
    /// `CYPHERSTREAM_*` environment variables.
    pub fn load(file_prefix: &str) -> Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("CYPHERSTREAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut loaded: Self = cfg.try_deserialize()?;
        loaded.channel_capacity = loaded.channel_capacity.max(1);
        loaded.transaction.batch_size = loaded.transaction.batch_size.max(1);
        tracing::debug!(endpoint = %loaded.endpoint, "Loaded client configuration");
        Ok(loaded)
    }
}
