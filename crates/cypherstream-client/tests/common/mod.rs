//! Scripted in-memory transport shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use cypherstream_client::{
    ClientConfig, CypherClient, EngineError, Method, TransactionEvent, TransactionEvents,
    TransactionHandle, Transport, TransportRequest, TransportResponse,
};

pub const ENDPOINT: &str = "http://localhost:7474/db/data/transaction";
pub const EMPTY_BODY: &str = r#"{"results":[],"errors":[]}"#;

/// One canned response, delivered in the given chunks.
#[derive(Debug, Clone)]
pub struct Scripted {
    pub status: u16,
    pub location: Option<String>,
    pub chunks: Vec<String>,
}

impl Scripted {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            location: None,
            chunks: vec![body.to_string()],
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            ..Self::ok(body)
        }
    }

    /// A 201 naming transaction `id`, as the first exchange of a
    /// transaction receives.
    pub fn created(id: &str, body: &str) -> Self {
        Self {
            status: 201,
            location: Some(format!("{ENDPOINT}/{id}")),
            chunks: vec![body.to_string()],
        }
    }

    /// Split the body into chunks of `size` bytes.
    pub fn chunked(mut self, size: usize) -> Self {
        let body = self.chunks.concat();
        self.chunks = body
            .as_bytes()
            .chunks(size)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
        self
    }
}

/// Records every request and answers from a script, falling back to an
/// empty success once the script runs out.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<(Method, String)> {
        self.requests()
            .into_iter()
            .map(|r| (r.method, r.url))
            .collect()
    }

    /// Statement texts sent in request `index`.
    pub fn statements(&self, index: usize) -> Vec<String> {
        let requests = self.requests();
        let body = requests[index].body.as_ref().expect("request has a body");
        body["statements"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["statement"].as_str().unwrap().to_string())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, EngineError> {
        self.requests.lock().unwrap().push(request);
        let scripted = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Scripted::ok(EMPTY_BODY));

        let chunks: Vec<Result<Bytes, EngineError>> = scripted
            .chunks
            .into_iter()
            .map(|c| Ok(Bytes::from(c)))
            .collect();
        Ok(TransportResponse {
            status: scripted.status,
            location: scripted.location,
            body: futures::stream::iter(chunks).boxed(),
        })
    }
}

pub fn client(transport: &Arc<ScriptedTransport>) -> CypherClient {
    CypherClient::with_transport(ClientConfig::new(ENDPOINT), transport.clone())
}

/// Read events until (and including) the terminal one.
pub async fn drain(transaction: &mut TransactionHandle) -> Vec<TransactionEvent> {
    let mut seen = Vec::new();
    while let Some(event) = transaction.next_event().await {
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            break;
        }
    }
    seen
}

pub async fn drain_events(events: &mut TransactionEvents) -> Vec<TransactionEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.next_event().await {
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            break;
        }
    }
    seen
}
