//! Lazy LSP handshake and capability tracking for one server incarnation.
//!
//! The initializer guarantees that `initialize`/`initialized` run exactly
//! once, before any caller message reaches the connection, no matter how
//! many tasks race on first use. It also watches the inbound event stream
//! for dynamic capability (un)registrations and keeps a live snapshot.

use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use lsp_types::notification::{Exit, Initialized, Notification};
use lsp_types::request::{Initialize, RegisterCapability, Request, Shutdown, UnregisterCapability};
use lsp_types::{
    InitializeResult, InitializedParams, RegistrationParams, ServerCapabilities, ServerInfo,
    UnregistrationParams,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::connection::{
    InitializeParamsProvider, RequestId, ServerConnection, ServerEvent, ServerRequestHandler,
};
use crate::error::Error;
use crate::registrations;
use crate::tap::StreamTap;

const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;
const JSONRPC_INTERNAL_ERROR: i64 = -32603;

/// Lifecycle of one incarnation. `Shutdown` is terminal: a new incarnation
/// means a new initializer.
enum InitializerState {
    Uninitialized,
    Initialized(InitializeResult),
    Shutdown,
}

struct Inner {
    connection: Arc<dyn ServerConnection>,
    state: Mutex<InitializerState>,
    capabilities_tx: mpsc::UnboundedSender<ServerCapabilities>,
    request_handler: Option<Arc<dyn ServerRequestHandler>>,
}

pub struct LazyInitializer {
    inner: Arc<Inner>,
    params_provider: Arc<dyn InitializeParamsProvider>,
    /// One permit covering the handshake and the shutdown sequence, so that
    /// concurrent first-use callers coalesce onto a single attempt.
    gate: Semaphore,
    events: StreamTap<ServerEvent>,
    capabilities_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerCapabilities>>>,
}

impl LazyInitializer {
    pub fn new(
        connection: Arc<dyn ServerConnection>,
        params_provider: Arc<dyn InitializeParamsProvider>,
        request_handler: Option<Arc<dyn ServerRequestHandler>>,
    ) -> Self {
        let (capabilities_tx, capabilities_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            connection: connection.clone(),
            state: Mutex::new(InitializerState::Uninitialized),
            capabilities_tx,
            request_handler,
        });

        let events = StreamTap::new();
        match connection.take_event_stream() {
            Some(receiver) => {
                // The observer holds a weak reference so the forwarder task
                // cannot keep a dropped initializer alive.
                let weak = Arc::downgrade(&inner);
                events.set_source_observed(UnboundedReceiverStream::new(receiver), move |event| {
                    let inner = Weak::upgrade(&weak);
                    async move {
                        if let Some(inner) = inner {
                            inner.observe_event(&event).await;
                        }
                        event
                    }
                    .boxed()
                });
            }
            None => {
                warn!("connection event stream was already taken; inbound events will not be observed");
            }
        }

        Self {
            inner,
            params_provider,
            gate: Semaphore::new(1),
            events,
            capabilities_rx: Mutex::new(Some(capabilities_rx)),
        }
    }

    /// The current capability snapshot, without forcing initialization.
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        match &*self.inner.state.lock().unwrap() {
            InitializerState::Initialized(result) => Some(result.capabilities.clone()),
            _ => None,
        }
    }

    /// The server's self-description, without forcing initialization.
    pub fn server_info(&self) -> Option<ServerInfo> {
        match &*self.inner.state.lock().unwrap() {
            InitializerState::Initialized(result) => result.server_info.clone(),
            _ => None,
        }
    }

    /// The capability snapshot, erroring instead of starting the server.
    pub fn require_capabilities(&self) -> Result<ServerCapabilities, Error> {
        self.capabilities().ok_or(Error::CapabilitiesUnavailable)
    }

    /// Capability snapshots, one per change. Single consumer: `None` once
    /// taken.
    pub fn take_capabilities_stream(&self) -> Option<UnboundedReceiverStream<ServerCapabilities>> {
        self.capabilities_rx
            .lock()
            .unwrap()
            .take()
            .map(UnboundedReceiverStream::new)
    }

    /// Inbound server events, observed and passed through. Single consumer.
    pub fn take_event_stream(&self) -> Option<UnboundedReceiverStream<ServerEvent>> {
        self.events.take_outbound()
    }

    fn is_initialized(&self) -> bool {
        matches!(
            &*self.inner.state.lock().unwrap(),
            InitializerState::Initialized(_)
        )
    }

    /// Perform the handshake, or return the cached result. Idempotent;
    /// concurrent callers coalesce onto one attempt. A failed attempt leaves
    /// the state untouched so the next caller retries.
    pub async fn initialize_if_needed(&self) -> Result<InitializeResult, Error> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| Error::StateInvalid("handshake gate closed".into()))?;

        match &*self.inner.state.lock().unwrap() {
            InitializerState::Initialized(result) => return Ok(result.clone()),
            InitializerState::Shutdown => return Err(Error::ServerStopped),
            InitializerState::Uninitialized => {}
        }

        let params = self.params_provider.initialize_params().await?;
        let params = encode_request_params(&params)?;
        let reply = self
            .inner
            .connection
            .send_request(Initialize::METHOD, params)
            .await?;
        let result: InitializeResult = decode_reply(reply)?;

        self.inner
            .connection
            .send_notification(Initialized::METHOD, encode_notification_params(&InitializedParams {})?)
            .await?;

        *self.inner.state.lock().unwrap() = InitializerState::Initialized(result.clone());
        let _ = self.inner.capabilities_tx.send(result.capabilities.clone());
        info!(
            server = result
                .server_info
                .as_ref()
                .map(|info| info.name.as_str())
                .unwrap_or("unknown"),
            "language server handshake complete"
        );
        Ok(result)
    }

    /// Send a notification, initializing first if needed.
    ///
    /// `exit` is dropped silently unless the incarnation is initialized.
    ///
    /// # Panics
    ///
    /// Panics if called with `initialized`, which only the handshake may
    /// send.
    pub async fn send_notification<N>(&self, params: N::Params) -> Result<(), Error>
    where
        N: Notification,
    {
        assert_ne!(
            N::METHOD,
            Initialized::METHOD,
            "`initialized` is sent by the handshake and must not be sent directly"
        );

        if N::METHOD == Exit::METHOD && !self.is_initialized() {
            debug!("dropping `exit` for a server that is not initialized");
            return Ok(());
        }

        self.initialize_if_needed().await?;
        let params = encode_notification_params(&params)?;
        self.inner.connection.send_notification(N::METHOD, params).await
    }

    /// Send a request, initializing first if needed.
    ///
    /// A `shutdown` request while not initialized is answered locally with a
    /// null payload and does not start the server; result types that reject
    /// null surface `RequestDispatchFailed`. A successful `shutdown` round
    /// trip makes the incarnation terminal.
    ///
    /// # Panics
    ///
    /// Panics if called with `initialize`, which must go through
    /// [`LazyInitializer::initialize_if_needed`].
    pub async fn send_request<R>(&self, params: R::Params) -> Result<R::Result, Error>
    where
        R: Request,
    {
        assert_ne!(
            R::METHOD,
            Initialize::METHOD,
            "`initialize` must go through `initialize_if_needed`"
        );

        if R::METHOD == Shutdown::METHOD && !self.is_initialized() {
            debug!("synthesizing `shutdown` reply for a server that is not initialized");
            return decode_reply(Value::Null);
        }

        self.initialize_if_needed().await?;
        let params = encode_request_params(&params)?;
        let reply = self.inner.connection.send_request(R::METHOD, params).await?;

        if R::METHOD == Shutdown::METHOD {
            *self.inner.state.lock().unwrap() = InitializerState::Shutdown;
            info!("language server acknowledged shutdown");
        }
        decode_reply(reply)
    }

    /// Gracefully stop an initialized server: `shutdown` request, state flip,
    /// `exit` notification, connection teardown. A no-op when nothing was
    /// ever initialized. The whole sequence runs under the gate so no other
    /// handshake or shutdown can interleave.
    pub async fn shutdown_and_exit(&self) -> Result<(), Error> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| Error::StateInvalid("handshake gate closed".into()))?;

        if !self.is_initialized() {
            debug!("shutdown requested for a server that is not initialized");
            return Ok(());
        }

        self.inner
            .connection
            .send_request(Shutdown::METHOD, Value::Null)
            .await?;
        *self.inner.state.lock().unwrap() = InitializerState::Shutdown;
        self.inner
            .connection
            .send_notification(Exit::METHOD, Value::Null)
            .await?;
        self.inner.connection.close();
        info!("language server shut down");
        Ok(())
    }

    /// Mark the connection dead without sending anything. The capability
    /// snapshot is discarded with the rest of the incarnation state.
    pub fn invalidate_connection(&self) {
        *self.inner.state.lock().unwrap() = InitializerState::Uninitialized;
        debug!("connection invalidated; incarnation reset to uninitialized");
    }
}

impl Drop for LazyInitializer {
    fn drop(&mut self) {
        if self.is_initialized() {
            // Best-effort exit so the child does not outlive us.
            let connection = self.inner.connection.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = connection.send_notification(Exit::METHOD, Value::Null).await;
                    connection.close();
                });
            } else {
                connection.close();
            }
        } else {
            self.inner.connection.close();
        }
    }
}

impl Inner {
    async fn observe_event(&self, event: &ServerEvent) {
        let ServerEvent::Request { id, method, params } = event else {
            return;
        };
        match method.as_str() {
            RegisterCapability::METHOD => self.apply_capability_change(params, true),
            UnregisterCapability::METHOD => self.apply_capability_change(params, false),
            _ => {}
        }
        self.answer_request(*id, method, params.clone()).await;
    }

    /// Fold a register/unregister request into the snapshot, publishing a
    /// new value only when the snapshot structurally changed. Failures are
    /// logged and swallowed; the request is still answered.
    fn apply_capability_change(&self, params: &Value, register: bool) {
        let mut state = self.inner_state();
        let InitializerState::Initialized(result) = &mut *state else {
            warn!("capability change received before initialization; ignoring");
            return;
        };

        let mut updated = result.capabilities.clone();
        let outcome = if register {
            serde_json::from_value::<RegistrationParams>(params.clone())
                .map_err(|error| error.to_string())
                .and_then(|p| {
                    registrations::apply_registrations(&mut updated, &p.registrations)
                        .map_err(|error| error.to_string())
                })
        } else {
            serde_json::from_value::<UnregistrationParams>(params.clone())
                .map_err(|error| error.to_string())
                .and_then(|p| {
                    registrations::apply_unregistrations(&mut updated, &p.unregisterations)
                        .map_err(|error| error.to_string())
                })
        };

        match outcome {
            Ok(()) if updated != result.capabilities => {
                result.capabilities = updated.clone();
                let _ = self.capabilities_tx.send(updated);
                debug!(register, "capability snapshot updated");
            }
            Ok(()) => {}
            Err(reason) => warn!(%reason, "swallowing capability change that failed to apply"),
        }
    }

    fn inner_state(&self) -> std::sync::MutexGuard<'_, InitializerState> {
        self.state.lock().unwrap()
    }

    async fn answer_request(&self, id: RequestId, method: &str, params: Value) {
        let reply = match &self.request_handler {
            Some(handler) => match handler.handle(method, params).await {
                Ok(result) => self.connection.respond(id, result).await,
                Err(error) => {
                    warn!(method, %error, "server request handler failed");
                    self.connection
                        .respond_error(id, JSONRPC_INTERNAL_ERROR, error.to_string())
                        .await
                }
            },
            None => {
                let error = Error::HandlerUnavailable(method.to_string());
                warn!(method, %error, "inbound server request has no handler");
                self.connection
                    .respond_error(id, JSONRPC_METHOD_NOT_FOUND, error.to_string())
                    .await
            }
        };
        if let Err(error) = reply {
            warn!(method, %error, "failed to answer server request");
        }
    }
}

fn encode_request_params<P: serde::Serialize>(params: &P) -> Result<Value, Error> {
    serde_json::to_value(params).map_err(|error| Error::RequestDispatchFailed(error.to_string()))
}

fn encode_notification_params<P: serde::Serialize>(params: &P) -> Result<Value, Error> {
    serde_json::to_value(params)
        .map_err(|error| Error::NotificationDispatchFailed(error.to_string()))
}

pub(crate) fn decode_reply<T: DeserializeOwned>(reply: Value) -> Result<T, Error> {
    serde_json::from_value(reply).map_err(|error| Error::RequestDispatchFailed(error.to_string()))
}
