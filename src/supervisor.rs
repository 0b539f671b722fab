//! Crash-tolerant supervision over a lazily spawned language server.
//!
//! The supervisor presents one persistent server-like surface whose lifetime
//! exceeds any single backing process: it spawns on first use, tracks which
//! documents the caller has opened, replays `didOpen` after an unplanned
//! restart, and throttles restart loops with a cool-down so a crashing
//! server cannot spin.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use lsp_types::notification::{DidCloseTextDocument, DidOpenTextDocument, Exit, Notification};
use lsp_types::request::{Request, Shutdown};
use lsp_types::{
    DidOpenTextDocumentParams, InitializeResult, ServerCapabilities, ServerInfo, Uri,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::connection::{
    InitializeParamsProvider, ServerConnectionProvider, ServerEvent, ServerRequestHandler,
    TextDocumentItemProvider,
};
use crate::error::Error;
use crate::initializer::{decode_reply, LazyInitializer};
use crate::tap::StreamTap;

/// How long a crashed server stays in the stopped state before the next
/// message is allowed to respawn it.
pub const DEFAULT_RESTART_COOL_DOWN: Duration = Duration::from_secs(5);

enum SupervisorState {
    /// Fresh; the next message spawns without replay.
    NotStarted,
    /// Crashed and cooled down; the next message spawns and replays the
    /// documents that were open at the moment of invalidation.
    RestartNeeded { replay: Vec<Uri> },
    /// The normal steady state.
    Running(Arc<LazyInitializer>),
    /// A graceful stop is in flight; messages are rejected.
    ShuttingDown,
    /// Crashed; messages are rejected until the cool-down elapses.
    Stopped { since: Instant, replay: Vec<Uri> },
}

struct Config {
    server_provider: Option<Arc<dyn ServerConnectionProvider>>,
    document_provider: Option<Arc<dyn TextDocumentItemProvider>>,
    params_provider: Option<Arc<dyn InitializeParamsProvider>>,
    request_handler: Option<Arc<dyn ServerRequestHandler>>,
}

struct Shared {
    state: Mutex<SupervisorState>,
    /// URIs opened by the caller, in insertion order, `didOpen` minus
    /// `didClose`.
    open_documents: Mutex<Vec<Uri>>,
    /// One permit covering spawn and shutdown transitions.
    gate: Semaphore,
    events: StreamTap<ServerEvent>,
    capabilities: StreamTap<ServerCapabilities>,
    cool_down: Duration,
    config: Config,
}

pub struct Supervisor {
    shared: Arc<Shared>,
}

/// Construction-time configuration for a [`Supervisor`]. Providers that are
/// never supplied surface as [`Error::NoProvider`] from the first call that
/// needs them.
pub struct SupervisorBuilder {
    config: Config,
    cool_down: Duration,
}

impl SupervisorBuilder {
    pub fn new() -> Self {
        Self {
            config: Config {
                server_provider: None,
                document_provider: None,
                params_provider: None,
                request_handler: None,
            },
            cool_down: DEFAULT_RESTART_COOL_DOWN,
        }
    }

    /// The factory invoked for every spawn, planned or crash-driven.
    pub fn server_provider(mut self, provider: Arc<dyn ServerConnectionProvider>) -> Self {
        self.config.server_provider = Some(provider);
        self
    }

    /// Document content lookup used only while replaying `didOpen`.
    pub fn text_document_item_provider(
        mut self,
        provider: Arc<dyn TextDocumentItemProvider>,
    ) -> Self {
        self.config.document_provider = Some(provider);
        self
    }

    /// Forwarded to the inner initializer for the handshake.
    pub fn initialize_params_provider(
        mut self,
        provider: Arc<dyn InitializeParamsProvider>,
    ) -> Self {
        self.config.params_provider = Some(provider);
        self
    }

    /// Answers server -> client requests. Without one, such requests are
    /// refused with a method-not-found reply.
    pub fn server_request_handler(mut self, handler: Arc<dyn ServerRequestHandler>) -> Self {
        self.config.request_handler = Some(handler);
        self
    }

    /// Override the restart cool-down.
    ///
    /// # Panics
    ///
    /// Panics on a zero duration; the throttle must be non-zero.
    pub fn restart_cool_down(mut self, cool_down: Duration) -> Self {
        assert!(!cool_down.is_zero(), "restart cool-down must be non-zero");
        self.cool_down = cool_down;
        self
    }

    pub fn build(self) -> Supervisor {
        Supervisor {
            shared: Arc::new(Shared {
                state: Mutex::new(SupervisorState::NotStarted),
                open_documents: Mutex::new(Vec::new()),
                gate: Semaphore::new(1),
                events: StreamTap::new(),
                capabilities: StreamTap::new(),
                cool_down: self.cool_down,
                config: self.config,
            }),
        }
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::new()
    }

    /// The external event stream. Stable across restarts. Single consumer.
    pub fn take_event_stream(&self) -> Option<UnboundedReceiverStream<ServerEvent>> {
        self.shared.events.take_outbound()
    }

    /// The external capabilities stream. Stable across restarts. Single
    /// consumer.
    pub fn take_capabilities_stream(&self) -> Option<UnboundedReceiverStream<ServerCapabilities>> {
        self.shared.capabilities.take_outbound()
    }

    /// The current capability snapshot, without starting a server.
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        match &*self.shared.state.lock().unwrap() {
            SupervisorState::Running(initializer) => initializer.capabilities(),
            _ => None,
        }
    }

    /// The running server's self-description, without starting a server.
    pub fn server_info(&self) -> Option<ServerInfo> {
        match &*self.shared.state.lock().unwrap() {
            SupervisorState::Running(initializer) => initializer.server_info(),
            _ => None,
        }
    }

    /// Snapshot of the open document set, in insertion order.
    pub fn open_documents(&self) -> Vec<Uri> {
        self.shared.open_documents.lock().unwrap().clone()
    }

    fn is_running(&self) -> bool {
        matches!(
            &*self.shared.state.lock().unwrap(),
            SupervisorState::Running(_)
        )
    }

    /// Force the handshake now, spawning first if needed.
    pub async fn initialize_if_needed(&self) -> Result<InitializeResult, Error> {
        let initializer = self.running_initializer().await?;
        let result = initializer.initialize_if_needed().await;
        self.fail_over_on_loss(&result);
        result
    }

    /// Send a request, spawning and initializing first if needed.
    ///
    /// A `shutdown` request while no server is running is answered locally
    /// with a null payload and does not spawn; result types that reject null
    /// surface `RequestDispatchFailed`. During a planned stop or the crash
    /// cool-down window the request is rejected with `ServerStopped` like
    /// any other.
    pub async fn send_request<R>(&self, params: R::Params) -> Result<R::Result, Error>
    where
        R: Request,
    {
        if R::METHOD == Shutdown::METHOD {
            match &*self.shared.state.lock().unwrap() {
                SupervisorState::Running(_) => {}
                SupervisorState::ShuttingDown | SupervisorState::Stopped { .. } => {
                    return Err(Error::ServerStopped)
                }
                SupervisorState::NotStarted | SupervisorState::RestartNeeded { .. } => {
                    debug!("synthesizing `shutdown` reply: no server is running");
                    return decode_reply(Value::Null);
                }
            }
        }

        let initializer = self.running_initializer().await?;
        let result = initializer.send_request::<R>(params).await;
        self.fail_over_on_loss(&result);
        result
    }

    /// Send a notification, spawning and initializing first if needed.
    ///
    /// `didOpen`/`didClose` update the open document set before anything is
    /// forwarded; `exit` while no server is running is dropped silently.
    pub async fn send_notification<N>(&self, params: N::Params) -> Result<(), Error>
    where
        N: Notification,
    {
        match N::METHOD {
            DidOpenTextDocument::METHOD => self.note_did_open(&params)?,
            DidCloseTextDocument::METHOD => self.note_did_close(&params)?,
            Exit::METHOD => {
                if !self.is_running() {
                    debug!("dropping `exit`: no server is running");
                    return Ok(());
                }
            }
            _ => {}
        }

        let initializer = self.running_initializer().await?;
        let result = initializer.send_notification::<N>(params).await;
        self.fail_over_on_loss(&result);
        result
    }

    /// Gracefully stop the running server. A no-op when nothing is running,
    /// leaving the supervisor fresh so the next message spawns without
    /// replay. Rejected with `ServerStopped` during the crash cool-down
    /// window.
    pub async fn shutdown_and_exit(&self) -> Result<(), Error> {
        let _permit = self
            .shared
            .gate
            .acquire()
            .await
            .map_err(|_| Error::StateInvalid("supervisor gate closed".into()))?;

        let initializer = {
            let mut state = self.shared.state.lock().unwrap();
            match &*state {
                SupervisorState::Running(initializer) => {
                    let initializer = initializer.clone();
                    *state = SupervisorState::ShuttingDown;
                    Some(initializer)
                }
                SupervisorState::ShuttingDown => return Err(Error::ServerStopped),
                // The cool-down window rejects every call, planned stops
                // included; the throttle and the replay snapshot stay intact.
                SupervisorState::Stopped { .. } => return Err(Error::ServerStopped),
                SupervisorState::NotStarted | SupervisorState::RestartNeeded { .. } => {
                    *state = SupervisorState::NotStarted;
                    None
                }
            }
        };

        let Some(initializer) = initializer else {
            debug!("shutdown requested with no live server");
            return Ok(());
        };

        let result = initializer.shutdown_and_exit().await;
        *self.shared.state.lock().unwrap() = SupervisorState::NotStarted;
        info!("language server supervision reset after shutdown");
        result
    }

    /// External hook: the transport reports the connection is gone. Stamps
    /// the stopped state and schedules the cool-down; repeated invalidations
    /// and invalidations during a planned shutdown are no-ops.
    pub fn connection_invalidated(&self) {
        let stamped = Instant::now();
        {
            let mut state = self.shared.state.lock().unwrap();
            match &*state {
                SupervisorState::Running(initializer) => {
                    initializer.invalidate_connection();
                    // Snapshot now: replay covers exactly the documents that
                    // were open when the connection was lost.
                    let replay = self.open_documents();
                    *state = SupervisorState::Stopped {
                        since: stamped,
                        replay,
                    };
                }
                SupervisorState::Stopped { .. } => {
                    debug!("connection invalidated while already stopped");
                    return;
                }
                SupervisorState::ShuttingDown => {
                    debug!("connection invalidated during planned shutdown");
                    return;
                }
                SupervisorState::NotStarted | SupervisorState::RestartNeeded { .. } => {
                    debug!("connection invalidated with no live server");
                    return;
                }
            }
        }
        warn!(
            cool_down_ms = self.shared.cool_down.as_millis() as u64,
            "language server connection lost; restart throttled"
        );

        // The cool-down task holds a weak reference; a dropped supervisor
        // must not be kept alive by its own timer.
        let weak = Arc::downgrade(&self.shared);
        let cool_down = self.shared.cool_down;
        tokio::spawn(async move {
            tokio::time::sleep(cool_down).await;
            let Some(shared) = Weak::upgrade(&weak) else {
                return;
            };
            let mut state = shared.state.lock().unwrap();
            // A planned shutdown or a newer stop wins over this timer.
            if let SupervisorState::Stopped { since, replay } = &mut *state {
                if *since == stamped {
                    let replay = std::mem::take(replay);
                    *state = SupervisorState::RestartNeeded { replay };
                    info!("restart cool-down elapsed; next message respawns and replays");
                }
            }
        });
    }

    /// Resolve the running initializer, spawning one if the state allows.
    async fn running_initializer(&self) -> Result<Arc<LazyInitializer>, Error> {
        let _permit = self
            .shared
            .gate
            .acquire()
            .await
            .map_err(|_| Error::StateInvalid("supervisor gate closed".into()))?;

        let replay = {
            let state = self.shared.state.lock().unwrap();
            match &*state {
                SupervisorState::Running(initializer) => return Ok(initializer.clone()),
                SupervisorState::ShuttingDown | SupervisorState::Stopped { .. } => {
                    return Err(Error::ServerStopped)
                }
                SupervisorState::NotStarted => None,
                // Cloned, not taken: a failed spawn must retry with the same
                // replay list.
                SupervisorState::RestartNeeded { replay } => Some(replay.clone()),
            }
        };

        let provider = self
            .shared
            .config
            .server_provider
            .clone()
            .ok_or(Error::NoProvider("server connection"))?;
        let params_provider = self
            .shared
            .config
            .params_provider
            .clone()
            .ok_or(Error::NoProvider("initialize params"))?;

        info!(replay = replay.is_some(), "spawning language server");
        let connection = provider.connect().await?;
        let initializer = Arc::new(LazyInitializer::new(
            connection,
            params_provider,
            self.shared.config.request_handler.clone(),
        ));

        // Rebind the external streams before any traffic flows, so nothing
        // from the new incarnation is lost.
        if let Some(events) = initializer.take_event_stream() {
            self.shared.events.set_source(events);
        }
        if let Some(capabilities) = initializer.take_capabilities_stream() {
            self.shared.capabilities.set_source(capabilities);
        }

        if let Some(uris) = replay {
            self.replay_open_documents(&initializer, uris).await;
        }

        *self.shared.state.lock().unwrap() = SupervisorState::Running(initializer.clone());
        Ok(initializer)
    }

    /// Re-open each replayed document on the new incarnation, in insertion
    /// order. Per-URI failures are logged and skipped; a restart with a
    /// partially replayed document set beats no restart.
    async fn replay_open_documents(&self, initializer: &Arc<LazyInitializer>, uris: Vec<Uri>) {
        if uris.is_empty() {
            return;
        }
        let Some(provider) = self.shared.config.document_provider.clone() else {
            warn!("cannot replay open documents: no text document item provider configured");
            return;
        };

        info!(count = uris.len(), "replaying open documents after restart");
        for uri in uris {
            let item = match provider.text_document_item(&uri).await {
                Ok(item) => item,
                Err(error) => {
                    warn!(uri = uri.as_str(), %error, "skipping open-document replay");
                    continue;
                }
            };
            let params = DidOpenTextDocumentParams {
                text_document: item,
            };
            if let Err(error) = initializer
                .send_notification::<DidOpenTextDocument>(params)
                .await
            {
                warn!(uri = uri.as_str(), %error, "failed to replay didOpen");
            }
        }
    }

    fn note_did_open<P: Serialize>(&self, params: &P) -> Result<(), Error> {
        let Some(uri) = document_uri(params) else {
            return Err(Error::NotificationDispatchFailed(
                "didOpen params carry no document uri".into(),
            ));
        };
        let mut open = self.shared.open_documents.lock().unwrap();
        if open.contains(&uri) {
            debug_assert!(
                false,
                "didOpen for a document that is already open: {}",
                uri.as_str()
            );
            warn!(uri = uri.as_str(), "didOpen for a document that is already open");
            return Ok(());
        }
        open.push(uri);
        Ok(())
    }

    fn note_did_close<P: Serialize>(&self, params: &P) -> Result<(), Error> {
        let Some(uri) = document_uri(params) else {
            return Err(Error::NotificationDispatchFailed(
                "didClose params carry no document uri".into(),
            ));
        };
        let mut open = self.shared.open_documents.lock().unwrap();
        match open.iter().position(|open_uri| *open_uri == uri) {
            Some(index) => {
                open.remove(index);
            }
            None => {
                debug_assert!(
                    false,
                    "didClose for a document that is not open: {}",
                    uri.as_str()
                );
                warn!(uri = uri.as_str(), "didClose for a document that is not open");
            }
        }
        Ok(())
    }

    fn fail_over_on_loss<T>(&self, result: &Result<T, Error>) {
        if let Err(error) = result {
            if error.is_connection_loss() {
                warn!(%error, "transport loss detected; invalidating the connection");
                self.connection_invalidated();
            }
        }
    }
}

/// Pull `textDocument.uri` out of serialized notification params.
fn document_uri<P: Serialize>(params: &P) -> Option<Uri> {
    let value = serde_json::to_value(params).ok()?;
    value
        .pointer("/textDocument/uri")?
        .as_str()?
        .parse::<Uri>()
        .ok()
}
