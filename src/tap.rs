//! A fan-out stream whose inbound source can be rebound at runtime.
//!
//! The supervisor hands its consumers one event stream and one capabilities
//! stream for the lifetime of the supervisor, while the server behind them
//! is restarted any number of times. Each restart rebinds the tap's source
//! to the new incarnation; the downstream end never notices.

use futures::future::BoxFuture;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};

type Observer<T> = Box<dyn FnMut(T) -> BoxFuture<'static, T> + Send>;

pub struct StreamTap<T> {
    tx: mpsc::UnboundedSender<T>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> StreamTap<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            outbound: Mutex::new(Some(rx)),
            forwarder: Mutex::new(None),
        }
    }

    /// The downstream end, created once at construction. Single consumer:
    /// `None` once taken. The stream ends only when the tap is dropped.
    pub fn take_outbound(&self) -> Option<UnboundedReceiverStream<T>> {
        self.outbound
            .lock()
            .unwrap()
            .take()
            .map(UnboundedReceiverStream::new)
    }

    /// Rebind the inbound source. The previous forwarder is cancelled first;
    /// values already in flight on it may be lost.
    pub fn set_source<S>(&self, source: S)
    where
        S: Stream<Item = T> + Send + Unpin + 'static,
    {
        self.bind(source, None);
    }

    /// Rebind with an observer that is invoked, and awaited, for every
    /// element before it is forwarded downstream.
    pub fn set_source_observed<S, F>(&self, source: S, on_value: F)
    where
        S: Stream<Item = T> + Send + Unpin + 'static,
        F: FnMut(T) -> BoxFuture<'static, T> + Send + 'static,
    {
        self.bind(source, Some(Box::new(on_value)));
    }

    fn bind<S>(&self, mut source: S, mut observer: Option<Observer<T>>)
    where
        S: Stream<Item = T> + Send + Unpin + 'static,
    {
        let tx = self.tx.clone();
        let mut slot = self.forwarder.lock().unwrap();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(async move {
            while let Some(value) = source.next().await {
                let value = match observer.as_mut() {
                    Some(observe) => observe(value).await,
                    None => value,
                };
                if tx.send(value).is_err() {
                    break;
                }
            }
        }));
    }
}

impl<T> Drop for StreamTap<T> {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.lock().unwrap().take() {
            task.abort();
        }
    }
}
