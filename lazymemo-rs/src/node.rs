//! Provides the cache entry for a single argument tuple.
//!
//! A [CacheNode] remembers the outcome of the last refresh (either a value or an error), when
//! this refresh completed and whether a refresh is currently running. The central idea is
//! "stale while revalidate": once a node has been initialized, callers are always answered
//! immediately. If the cached state is older than the max age, a refresh is started in the
//! background and the stale state is delivered one more time. Only the very first call (or the
//! first call after an invalidation) has to wait for a computation.
//!
//! Also, there is never more than one refresh per node. The check for a running refresh and the
//! registration of a new one happen within a single critical section, so that concurrent callers
//! (even on different threads) cannot start a second one. All other callers either join the
//! running refresh (if they have to wait) or simply use the current state.
#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::events::ErrorEvents;
use crate::fmt::format_duration;
use crate::metrics::Metrics;
use crate::options::{ErrorPolicy, Options};
use crate::spawn;

/// Completes once the refresh it belongs to has released the node.
///
/// Yields an error if the refresh was dropped before finishing (e.g. the computation panicked).
type InFlight = Shared<oneshot::Receiver<()>>;

/// Bundles everything a node needs to know about its cache when resolving a call.
pub struct Context<'a, E> {
    /// The max age after which the cached state is considered stale.
    pub max_age: Duration,
    /// The settings of the owning cache.
    pub options: &'a Options,
    /// Receives failures swallowed under [ErrorPolicy::Swallow].
    pub events: &'a Arc<ErrorEvents<E>>,
    /// The usage counters of the owning cache.
    pub metrics: &'a Arc<Metrics>,
}

struct State<V, E> {
    refreshed_at: Option<Instant>,
    value: Option<V>,
    error: Option<E>,
    initialized: bool,
    in_flight: Option<InFlight>,
}

impl<V, E> Default for State<V, E> {
    fn default() -> Self {
        State {
            refreshed_at: None,
            value: None,
            error: None,
            initialized: false,
            in_flight: None,
        }
    }
}

impl<V: Clone, E: Clone> State<V, E> {
    fn is_stale(&self, max_age: Duration) -> bool {
        // Comparing the elapsed time (instead of computing an expiry) cannot overflow, even
        // for a max age like Duration::MAX...
        match self.refreshed_at {
            Some(refreshed_at) if self.initialized => refreshed_at.elapsed() >= max_age,
            _ => true,
        }
    }

    /// Returns the outcome to hand out or **None** if no refresh has completed yet.
    fn outcome(&self) -> Option<Result<V, E>> {
        if !self.initialized {
            return None;
        }

        match (&self.error, &self.value) {
            (Some(error), _) => Some(Err(error.clone())),
            (None, Some(value)) => Some(Ok(value.clone())),
            (None, None) => None,
        }
    }
}

/// Stores the cached outcome for a single argument tuple.
///
/// Nodes are created in a pristine state by the [KeyTree](crate::tree) and are never removed.
/// They are only ever modified by their own refresh and by [invalidate](CacheNode::invalidate).
pub struct CacheNode<V, E> {
    state: Mutex<State<V, E>>,
}

impl<V, E> Default for CacheNode<V, E> {
    fn default() -> Self {
        CacheNode {
            state: Mutex::new(State::default()),
        }
    }
}

impl<V, E> CacheNode<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Display + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, State<V, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Determines whether at least one refresh has completed since the node was created or
    /// last invalidated.
    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// Determines whether a refresh is currently running.
    pub fn is_refreshing(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    /// Returns the cached outcome without triggering any computation.
    pub fn peek(&self) -> Option<Result<V, E>> {
        self.lock().outcome()
    }

    /// Resolves a call against this node.
    ///
    /// If the node is stale and no refresh is running, **compute** is invoked to obtain the
    /// future of a new refresh, which is then run by a background task. The caller only waits
    /// if the node has never been initialized. In all other cases the current state is returned
    /// right away.
    ///
    /// A caller which had to wait never starts another refresh once the one it waited for has
    /// completed. It only re-enters the check if there is still no outcome, which happens if
    /// the node was invalidated in the meantime or if the refresh was aborted (e.g. because
    /// the computation panicked).
    pub async fn resolve<F, Fut>(
        self: &Arc<Self>,
        compute: F,
        context: Context<'_, E>,
    ) -> Result<V, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let mut first_attempt = true;
        loop {
            let (in_flight, guard, outcome) = {
                let mut state = self.lock();
                let mut guard = None;
                if state.is_stale(context.max_age) && state.in_flight.is_none() {
                    let (done, in_flight) = oneshot::channel();
                    state.in_flight = Some(in_flight.shared());
                    guard = Some(ReleaseGuard {
                        node: self.clone(),
                        done: Some(done),
                        completed: false,
                    });
                }

                (state.in_flight.clone(), guard, state.outcome())
            };

            // The guard is already armed, so that the node is released even if the
            // computation panics right away...
            if let Some(guard) = guard {
                let computation = compute().boxed();
                self.spawn_refresh(computation, guard, &context);
            }

            if first_attempt {
                context.metrics.record_read(outcome.is_some());
                first_attempt = false;
            }

            if let Some(outcome) = outcome {
                return outcome;
            }

            match in_flight {
                Some(in_flight) => {
                    if in_flight.await.is_ok() {
                        let outcome = self.lock().outcome();
                        if let Some(outcome) = outcome {
                            return outcome;
                        }
                    } else {
                        log::error!(
                            "An awaited refresh of cache '{}' was aborted. Retrying...",
                            context.options.name
                        );
                    }
                }
                // An uninitialized node is always stale and therefore always carries a
                // refresh, so this is merely a fallback...
                None => tokio::task::yield_now().await,
            }
        }
    }

    fn spawn_refresh(
        self: &Arc<Self>,
        computation: BoxFuture<'static, Result<V, E>>,
        guard: ReleaseGuard<V, E>,
        context: &Context<'_, E>,
    ) {
        context.metrics.record_refresh();

        let policy = context.options.errors;
        let name = context.options.name.clone();
        let events = context.events.clone();
        let metrics = context.metrics.clone();

        spawn!(async move {
            let mut guard = guard;
            let started = Instant::now();
            log::debug!("Refreshing an entry of cache '{}'...", name);

            let result = computation.await;
            let success = result.is_ok();
            if let Err(error) = guard.node.complete(result, policy) {
                metrics.record_failure();
                match policy {
                    ErrorPolicy::Passthrough => {
                        log::debug!("A refresh of cache '{}' failed: {}", name, error)
                    }
                    ErrorPolicy::Swallow => {
                        log::warn!("A refresh of cache '{}' failed: {}", name, error);
                        events.emit(&error);
                    }
                }
            }

            log::debug!(
                "Refreshing an entry of cache '{}' {} after {}.",
                name,
                if success { "succeeded" } else { "failed" },
                format_duration(started.elapsed())
            );
            guard.completed = true;
        });
    }

    /// Applies the result of a refresh.
    ///
    /// Returns the error of a failed refresh, so that the caller can report it.
    fn complete(&self, result: Result<V, E>, policy: ErrorPolicy) -> Result<(), E> {
        let mut state = self.lock();
        match result {
            Ok(value) => {
                state.error = None;
                state.value = Some(value);
                state.refreshed_at = Some(Instant::now());
                state.initialized = true;
                Ok(())
            }
            Err(error) => {
                match policy {
                    ErrorPolicy::Passthrough => {
                        state.value = None;
                        state.error = Some(error.clone());
                        state.refreshed_at = Some(Instant::now());
                        state.initialized = true;
                    }
                    ErrorPolicy::Swallow => {
                        // A known value is kept and the clock stays where it is, so that the next
                        // call retries. Without a value, the error is all a caller can get, so it
                        // is cached like a regular outcome...
                        if state.value.is_none() {
                            state.error = Some(error.clone());
                            state.refreshed_at = Some(Instant::now());
                            state.initialized = true;
                        }
                    }
                }

                Err(error)
            }
        }
    }

    /// Resets the node to its pristine state.
    ///
    /// A running refresh is not aborted. Rather, we wait until it has completed and only then
    /// reset the node. Therefore the next call after this returns behaves exactly like a
    /// first-ever call.
    pub async fn invalidate(&self) {
        loop {
            let in_flight = {
                let mut state = self.lock();
                match state.in_flight.clone() {
                    Some(in_flight) => in_flight,
                    None => {
                        *state = State::default();
                        return;
                    }
                }
            };

            // An aborted refresh has released the node as well, so the outcome doesn't matter...
            let _ = in_flight.await;
        }
    }
}

/// Releases the in-flight handle of a node once its refresh ends.
///
/// The guard is created together with the handle, before the computation is even invoked.
/// Therefore the handle is also released if creating the computation panics or if the
/// refresh task is dropped or panics, so that a node can never end up with a dangling refresh.
struct ReleaseGuard<V, E> {
    node: Arc<CacheNode<V, E>>,
    done: Option<oneshot::Sender<()>>,
    completed: bool,
}

impl<V, E> Drop for ReleaseGuard<V, E> {
    fn drop(&mut self) {
        self.node
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight = None;

        // Dropping the sender without a message signals an aborted refresh to all waiters...
        if let Some(done) = self.done.take() {
            if self.completed {
                let _ = done.send(());
            }
        }
    }
}
