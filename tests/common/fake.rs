//! An in-memory `ServerConnection` for driving the supervisor and
//! initializer without a real language server: canned replies keyed by
//! method, a recorded wire trace, injectable inbound events, optional
//! per-method reply delays, and a kill switch simulating transport loss.

use async_trait::async_trait;
use futures::FutureExt;
use lsp_types::{
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, HoverParams, Position,
    TextDocumentIdentifier, TextDocumentItem, TextDocumentPositionParams, Uri,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use lsp_driver::connection::{
    providers, InitializeParamsProvider, RequestId, ServerConnection, ServerConnectionProvider,
    ServerEvent, TextDocumentItemProvider,
};
use lsp_driver::Error;

/// One outbound message observed on the fake wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Request {
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: RequestId,
        result: Value,
    },
    ErrorResponse {
        id: RequestId,
        code: i64,
        message: String,
    },
}

pub struct FakeConnection {
    trace: Mutex<Vec<WireMessage>>,
    replies: Mutex<HashMap<String, Value>>,
    delays: Mutex<HashMap<String, Duration>>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    dead: AtomicBool,
    closed: AtomicBool,
}

impl FakeConnection {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let fake = Self {
            trace: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            dead: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        fake.reply_with("initialize", json!({ "capabilities": {} }));
        fake.reply_with("shutdown", Value::Null);
        Arc::new(fake)
    }

    /// Set the canned reply for a request method.
    pub fn reply_with(&self, method: &str, reply: Value) {
        self.replies.lock().unwrap().insert(method.to_string(), reply);
    }

    /// Delay the reply to a request method.
    pub fn delay_reply(&self, method: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(method.to_string(), delay);
    }

    /// Push an inbound server -> client request.
    pub fn inject_request(&self, id: RequestId, method: &str, params: Value) {
        let _ = self.events_tx.send(ServerEvent::Request {
            id,
            method: method.to_string(),
            params,
        });
    }

    /// Push an inbound server -> client notification.
    pub fn inject_notification(&self, method: &str, params: Value) {
        let _ = self.events_tx.send(ServerEvent::Notification {
            method: method.to_string(),
            params,
        });
    }

    /// Simulate transport loss: every send from now on fails.
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The full wire trace, in order.
    pub fn trace(&self) -> Vec<WireMessage> {
        self.trace.lock().unwrap().clone()
    }

    /// Method names of outbound requests and notifications, in order.
    pub fn methods(&self) -> Vec<String> {
        self.trace()
            .into_iter()
            .filter_map(|message| match message {
                WireMessage::Request { method, .. } => Some(method),
                WireMessage::Notification { method, .. } => Some(method),
                _ => None,
            })
            .collect()
    }

    /// How many requests with the given method reached the wire.
    pub fn requests_named(&self, method: &str) -> usize {
        self.trace()
            .iter()
            .filter(|message| {
                matches!(message, WireMessage::Request { method: m, .. } if m == method)
            })
            .count()
    }

    /// The `textDocument.uri` of every outbound notification with the given
    /// method, in order.
    pub fn notification_uris(&self, method: &str) -> Vec<String> {
        self.trace()
            .into_iter()
            .filter_map(|message| match message {
                WireMessage::Notification { method: m, params } if m == method => params
                    .pointer("/textDocument/uri")
                    .and_then(|uri| uri.as_str())
                    .map(str::to_string),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ServerConnection for FakeConnection {
    async fn send_request(&self, method: &str, params: Value) -> Result<Value, Error> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::UnableToSendRequest(format!(
                "connection lost before `{method}`"
            )));
        }
        self.trace.lock().unwrap().push(WireMessage::Request {
            method: method.to_string(),
            params,
        });
        let delay = self.delays.lock().unwrap().get(method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .replies
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), Error> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::NotificationDispatchFailed(format!(
                "connection lost before `{method}`"
            )));
        }
        self.trace.lock().unwrap().push(WireMessage::Notification {
            method: method.to_string(),
            params,
        });
        Ok(())
    }

    async fn respond(&self, id: RequestId, result: Value) -> Result<(), Error> {
        self.trace
            .lock()
            .unwrap()
            .push(WireMessage::Response { id, result });
        Ok(())
    }

    async fn respond_error(&self, id: RequestId, code: i64, message: String) -> Result<(), Error> {
        self.trace
            .lock()
            .unwrap()
            .push(WireMessage::ErrorResponse { id, code, message });
        Ok(())
    }

    fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A connection provider that records every connection it hands out, so
/// tests can inspect each incarnation separately.
pub struct FakeFactory {
    made: Mutex<Vec<Arc<FakeConnection>>>,
    setup: Box<dyn Fn(&FakeConnection) + Send + Sync>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Self::with_setup(|_| {})
    }

    /// `setup` is applied to every connection before it is handed out.
    pub fn with_setup(setup: impl Fn(&FakeConnection) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            made: Mutex::new(Vec::new()),
            setup: Box::new(setup),
        })
    }

    pub fn provider(self: &Arc<Self>) -> Arc<dyn ServerConnectionProvider> {
        let factory = self.clone();
        providers::connection_provider_fn(move || {
            let factory = factory.clone();
            async move {
                let fake = FakeConnection::new();
                (factory.setup)(&fake);
                factory.made.lock().unwrap().push(fake.clone());
                Ok(fake as Arc<dyn ServerConnection>)
            }
        })
    }

    /// How many connections were spawned so far.
    pub fn spawned(&self) -> usize {
        self.made.lock().unwrap().len()
    }

    /// The `index`-th connection handed out.
    pub fn connection(&self, index: usize) -> Arc<FakeConnection> {
        self.made.lock().unwrap()[index].clone()
    }
}

/// An initialize-params provider with the crate defaults and no root.
pub fn params_provider() -> Arc<dyn InitializeParamsProvider> {
    providers::initialize_params_fn(|| async { Ok(lsp_driver::default_initialize_params(None)) })
}

/// A document lookup that fabricates content from the URI.
pub fn document_provider() -> Arc<dyn TextDocumentItemProvider> {
    providers::document_item_fn(|uri| {
        async move {
            let text = format!("content of {}", uri.as_str());
            Ok(text_document_item(uri, &text))
        }
        .boxed()
    })
}

pub fn uri(s: &str) -> Uri {
    s.parse().expect("test uri")
}

pub fn text_document_item(uri: Uri, text: &str) -> TextDocumentItem {
    TextDocumentItem {
        uri,
        language_id: "rust".to_string(),
        version: 0,
        text: text.to_string(),
    }
}

pub fn did_open_params(uri_str: &str) -> DidOpenTextDocumentParams {
    DidOpenTextDocumentParams {
        text_document: text_document_item(uri(uri_str), "fn main() {}"),
    }
}

pub fn did_close_params(uri_str: &str) -> DidCloseTextDocumentParams {
    DidCloseTextDocumentParams {
        text_document: TextDocumentIdentifier { uri: uri(uri_str) },
    }
}

pub fn hover_params(uri_str: &str) -> HoverParams {
    HoverParams {
        text_document_position_params: TextDocumentPositionParams {
            text_document: TextDocumentIdentifier { uri: uri(uri_str) },
            position: Position {
                line: 0,
                character: 0,
            },
        },
        work_done_progress_params: Default::default(),
    }
}

/// The canned hover reply used across scenarios: contents "abc", range
/// (0,0) -> (0,1).
pub fn hover_reply() -> Value {
    json!({
        "contents": "abc",
        "range": {
            "start": { "line": 0, "character": 0 },
            "end": { "line": 0, "character": 1 }
        }
    })
}
