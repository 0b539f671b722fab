//! The connection boundary the driver core is built on.
//!
//! Everything below this trait (JSON-RPC framing, subprocess spawning,
//! stdio piping) is somebody else's problem. The driver only needs a peer
//! it can send untyped messages to and a stream of inbound events, plus a
//! handful of asynchronous configuration callbacks supplied by the embedder.

use async_trait::async_trait;
use futures::future::BoxFuture;
use lsp_types::{InitializeParams, TextDocumentItem, Uri};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Error;

/// JSON-RPC request id used on the inbound (server -> client) path.
pub type RequestId = i64;

/// An inbound message from the language server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A server-initiated notification.
    Notification { method: String, params: Value },
    /// A server-initiated request that expects a reply.
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
}

impl ServerEvent {
    pub fn method(&self) -> &str {
        match self {
            ServerEvent::Notification { method, .. } => method,
            ServerEvent::Request { method, .. } => method,
        }
    }
}

/// A live JSON-RPC peer for one server incarnation.
///
/// Implementations own the underlying process: `close` must terminate it,
/// and dropping the connection must not leak it.
#[async_trait]
pub trait ServerConnection: Send + Sync {
    /// Send a client -> server request and await its reply.
    async fn send_request(&self, method: &str, params: Value) -> Result<Value, Error>;

    /// Send a client -> server notification.
    async fn send_notification(&self, method: &str, params: Value) -> Result<(), Error>;

    /// Reply successfully to a server -> client request.
    async fn respond(&self, id: RequestId, result: Value) -> Result<(), Error>;

    /// Reply with a JSON-RPC error to a server -> client request.
    async fn respond_error(&self, id: RequestId, code: i64, message: String) -> Result<(), Error>;

    /// The inbound event stream. Single consumer: `None` once taken.
    fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>>;

    /// Tear the connection down. Idempotent.
    fn close(&self);
}

/// Asynchronous factory producing a fresh connection per incarnation.
#[async_trait]
pub trait ServerConnectionProvider: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ServerConnection>, Error>;
}

/// Supplies the `initialize` request parameters at handshake time.
#[async_trait]
pub trait InitializeParamsProvider: Send + Sync {
    async fn initialize_params(&self) -> Result<InitializeParams, Error>;
}

/// Looks up the current content of an open document. Only consulted while
/// replaying `didOpen` after an unplanned restart.
#[async_trait]
pub trait TextDocumentItemProvider: Send + Sync {
    async fn text_document_item(&self, uri: &Uri) -> Result<TextDocumentItem, Error>;
}

/// Answers server -> client requests the driver does not consume itself.
#[async_trait]
pub trait ServerRequestHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, Error>;
}

/// Adapters turning plain async closures into the provider traits above.
pub mod providers {
    use super::*;

    struct ConnectionProviderFn<F>(F);

    #[async_trait]
    impl<F, Fut> ServerConnectionProvider for ConnectionProviderFn<F>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<Arc<dyn ServerConnection>, Error>> + Send,
    {
        async fn connect(&self) -> Result<Arc<dyn ServerConnection>, Error> {
            (self.0)().await
        }
    }

    pub fn connection_provider_fn<F, Fut>(f: F) -> Arc<dyn ServerConnectionProvider>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn ServerConnection>, Error>> + Send + 'static,
    {
        Arc::new(ConnectionProviderFn(f))
    }

    struct InitializeParamsFn<F>(F);

    #[async_trait]
    impl<F, Fut> InitializeParamsProvider for InitializeParamsFn<F>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<InitializeParams, Error>> + Send,
    {
        async fn initialize_params(&self) -> Result<InitializeParams, Error> {
            (self.0)().await
        }
    }

    pub fn initialize_params_fn<F, Fut>(f: F) -> Arc<dyn InitializeParamsProvider>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<InitializeParams, Error>> + Send + 'static,
    {
        Arc::new(InitializeParamsFn(f))
    }

    struct DocumentItemFn<F>(F);

    #[async_trait]
    impl<F> TextDocumentItemProvider for DocumentItemFn<F>
    where
        F: Fn(Uri) -> BoxFuture<'static, Result<TextDocumentItem, Error>> + Send + Sync,
    {
        async fn text_document_item(&self, uri: &Uri) -> Result<TextDocumentItem, Error> {
            (self.0)(uri.clone()).await
        }
    }

    pub fn document_item_fn<F>(f: F) -> Arc<dyn TextDocumentItemProvider>
    where
        F: Fn(Uri) -> BoxFuture<'static, Result<TextDocumentItem, Error>> + Send + Sync + 'static,
    {
        Arc::new(DocumentItemFn(f))
    }

    struct RequestHandlerFn<F>(F);

    #[async_trait]
    impl<F> ServerRequestHandler for RequestHandlerFn<F>
    where
        F: Fn(String, Value) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync,
    {
        async fn handle(&self, method: &str, params: Value) -> Result<Value, Error> {
            (self.0)(method.to_string(), params).await
        }
    }

    pub fn server_request_handler_fn<F>(f: F) -> Arc<dyn ServerRequestHandler>
    where
        F: Fn(String, Value) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync + 'static,
    {
        Arc::new(RequestHandlerFn(f))
    }
}
