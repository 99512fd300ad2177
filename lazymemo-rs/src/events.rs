//! Broadcasts swallowed refresh failures to interested parties.
//!
//! When a cache runs with [ErrorPolicy::Swallow](crate::options::ErrorPolicy::Swallow), a failing
//! refresh doesn't reach the caller once a good value is known. Still, someone might want to know
//! about it. Therefore each failure is handed to all registered handlers and also sent to all
//! broadcast listeners.
//!
//! Note that only the error itself is reported. There is no information about which argument
//! tuple was being refreshed.
//!
//! # Examples
//!
//! ```
//! # use lazymemo::events::ErrorEvents;
//! # use std::sync::Arc;
//! # use std::sync::atomic::{AtomicUsize, Ordering};
//! let events = ErrorEvents::<String>::new();
//! let counter = Arc::new(AtomicUsize::new(0));
//!
//! let seen = counter.clone();
//! let subscription = events.subscribe(move |_error: &String| {
//!     seen.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! events.emit(&"boom".to_owned());
//! assert_eq!(counter.load(Ordering::SeqCst), 1);
//!
//! // Once unsubscribed, the handler is no longer invoked...
//! assert_eq!(events.unsubscribe(subscription), true);
//! events.emit(&"boom".to_owned());
//! assert_eq!(counter.load(Ordering::SeqCst), 1);
//! ```
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;

/// Describes the receiver type handed out by [ErrorEvents::listener].
pub type ErrorReceiver<E> = broadcast::Receiver<E>;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Identifies a handler registered via [ErrorEvents::subscribe].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Keeps the error handlers and the broadcast channel of a cache.
pub struct ErrorEvents<E> {
    handlers: Mutex<Vec<(SubscriptionId, Handler<E>)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> Default for ErrorEvents<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> ErrorEvents<E> {
    /// Creates a new instance without any handlers or listeners.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);

        ErrorEvents {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    /// Registers a handler which is invoked for each reported error.
    ///
    /// Handlers are invoked synchronously by the refresh task which observed the failure,
    /// therefore they should return quickly.
    pub fn subscribe<H>(&self, handler: H) -> SubscriptionId
    where
        H: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));

        id
    }

    /// Removes a previously registered handler.
    ///
    /// Returns **true** if the handler was present, **false** otherwise.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let count_before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);

        handlers.len() != count_before
    }

    /// Obtains a broadcast receiver which is sent every error reported after this call.
    ///
    /// Note that a receiver which lags behind by more than 128 errors will miss some of them.
    pub fn listener(&self) -> ErrorReceiver<E> {
        self.sender.subscribe()
    }

    /// Returns the errors reported after this call as a stream.
    ///
    /// Errors missed due to lagging behind are skipped silently.
    pub fn stream(&self) -> impl Stream<Item = E> {
        tokio_stream::StreamExt::filter_map(BroadcastStream::new(self.sender.subscribe()), |event| {
            event.ok()
        })
    }

    /// Returns the number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Reports the given error to all handlers and listeners.
    pub fn emit(&self, error: &E) {
        // Copy the handlers so that a handler may (un)subscribe without dead-locking...
        let handlers: Vec<Handler<E>> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler(error);
        }

        // Having no listeners is fine...
        let _ = self.sender.send(error.clone());
    }
}
