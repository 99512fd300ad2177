//! Provides the public facade which memoizes a computation.
//!
//! An [AggregateCache] wraps a computation and answers calls with the same signature: For each
//! argument tuple a [CacheNode](crate::node::CacheNode) is located (or created) in the key tree
//! and the call is forwarded to it. Next to this, the cache provides access to the error events
//! (for failures which were swallowed) and permits to invalidate all entries at once.
//!
//! # Examples
//!
//! ```
//! # use lazymemo::cache::build;
//! # use lazymemo::options::Options;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let squares = build(
//!     |(n,): (u64,)| async move { Ok::<_, String>(n * n) },
//!     Duration::from_secs(60),
//!     Options::default(),
//! );
//!
//! assert_eq!(squares.get((4,)).await, Ok(16));
//! assert_eq!(squares.get((5,)).await, Ok(25));
//! assert_eq!(squares.len(), 2);
//!
//! // Forget everything...
//! squares.invalidate().await;
//! assert_eq!(squares.get((4,)).await, Ok(16));
//! # }
//! ```
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio_stream::Stream;

use crate::events::{ErrorEvents, ErrorReceiver, SubscriptionId};
use crate::fmt::format_duration;
use crate::metrics::Metrics;
use crate::node::Context;
use crate::options::Options;
use crate::tree::{Arguments, Walk};

/// Describes the type erased computation wrapped by a cache.
type Computation<A, V, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<V, E>> + Send + Sync>;

/// Creates a cache for the given computation.
///
/// Outcomes are considered stale once they are older than **max_age**. A max age of zero
/// therefore triggers a (background) refresh on every call, but still delivers the previous
/// outcome right away.
///
/// Note that a [Builder](crate::builder::Builder) provides some more convenient ways to set up
/// a cache.
pub fn build<A, V, E, F, Fut>(compute: F, max_age: Duration, options: Options) -> AggregateCache<A, V, E>
where
    A: Arguments<V, E>,
    V: Clone + Send + Sync + 'static,
    E: Clone + Display + Send + Sync + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    AggregateCache::new(compute, max_age, options)
}

/// Memoizes a computation per argument tuple.
///
/// Cloning a cache is cheap, all clones share the same entries.
pub struct AggregateCache<A, V, E>
where
    A: Arguments<V, E>,
{
    tree: Arc<A::Tree>,
    compute: Computation<A, V, E>,
    max_age: Duration,
    options: Arc<Options>,
    events: Arc<ErrorEvents<E>>,
    metrics: Arc<Metrics>,
}

impl<A, V, E> Clone for AggregateCache<A, V, E>
where
    A: Arguments<V, E>,
{
    fn clone(&self) -> Self {
        AggregateCache {
            tree: self.tree.clone(),
            compute: self.compute.clone(),
            max_age: self.max_age,
            options: self.options.clone(),
            events: self.events.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<A, V, E> AggregateCache<A, V, E>
where
    A: Arguments<V, E>,
    V: Clone + Send + Sync + 'static,
    E: Clone + Display + Send + Sync + 'static,
{
    /// Creates a new and empty cache. See [build] for a description of the parameters.
    pub fn new<F, Fut>(compute: F, max_age: Duration, options: Options) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        log::debug!(
            "Creating cache '{}' for {} argument(s) (max age: {}, errors: {}).",
            options.name,
            A::ARITY,
            format_duration(max_age),
            options.errors
        );

        let compute: Computation<A, V, E> =
            Arc::new(move |arguments: A| compute(arguments).boxed());

        AggregateCache {
            tree: Arc::new(Default::default()),
            compute,
            max_age,
            options: Arc::new(options),
            events: Arc::new(ErrorEvents::new()),
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Returns the outcome for the given arguments.
    ///
    /// If a (possibly stale) outcome is present, it is returned immediately. If it is stale, a
    /// refresh is started in the background, unless one is already running. Only if no outcome
    /// is present at all, this waits for the computation to complete.
    ///
    /// The error of a failed computation is returned as is, according to the
    /// [ErrorPolicy](crate::options::ErrorPolicy) of this cache.
    pub async fn get(&self, arguments: A) -> Result<V, E> {
        let node = A::resolve(&self.tree, &arguments);
        let context = Context {
            max_age: self.max_age,
            options: &self.options,
            events: &self.events,
            metrics: &self.metrics,
        };

        node.resolve(|| (self.compute)(arguments.clone()), context)
            .await
    }

    /// Resets all entries to their pristine state.
    ///
    /// Entries which are currently being refreshed are reset once the refresh has completed.
    /// Once this returns, the next call for each of the entries present when this was invoked
    /// behaves like the very first call.
    pub async fn invalidate(&self) {
        let mut nodes = Vec::new();
        self.tree.collect_nodes(&mut nodes);

        log::info!(
            "Invalidating {} entries of cache '{}'...",
            nodes.len(),
            self.options.name
        );
        let _ = join_all(nodes.iter().map(|node| node.invalidate())).await;

        self.metrics.record_invalidation();
    }

    /// Registers a handler which is invoked for each failed refresh which was swallowed.
    ///
    /// This is only ever invoked for caches using
    /// [ErrorPolicy::Swallow](crate::options::ErrorPolicy::Swallow).
    pub fn subscribe_errors<H>(&self, handler: H) -> SubscriptionId
    where
        H: Fn(&E) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    /// Removes a handler registered via [subscribe_errors](AggregateCache::subscribe_errors).
    pub fn unsubscribe_errors(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Obtains a broadcast receiver for all swallowed failures.
    pub fn error_listener(&self) -> ErrorReceiver<E> {
        self.events.listener()
    }

    /// Provides all swallowed failures as a stream.
    pub fn error_stream(&self) -> impl Stream<Item = E> {
        self.events.stream()
    }

    /// Returns the number of entries which currently hold an outcome.
    ///
    /// Invalidated entries are not counted until they have been computed again.
    pub fn len(&self) -> usize {
        let mut nodes = Vec::new();
        self.tree.collect_nodes(&mut nodes);
        nodes.iter().filter(|node| node.is_initialized()).count()
    }

    /// Determines if no entry holds an outcome.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the usage counters of this cache.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Returns the max age of entries.
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Returns the settings of this cache.
    pub fn options(&self) -> &Options {
        &self.options
    }
}

impl<V, E> AggregateCache<(), V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Display + Send + Sync + 'static,
{
    /// Returns the outcome of a computation without arguments.
    pub async fn fetch(&self) -> Result<V, E> {
        self.get(()).await
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{build, AggregateCache};
    use crate::options::Options;
    use crate::testing::test_async;
    use futures::FutureExt;
    use mock_instant::thread_local::MockClock;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_stream::StreamExt;

    /// Provides a backing value which can be changed while a cache holds on to an older one.
    ///
    /// Also returns a counter of how often the backing value was read by the cache.
    fn shared_value(
        value: i32,
        max_age: Duration,
        options: Options,
    ) -> (Arc<AtomicI32>, Arc<AtomicUsize>, AggregateCache<(), i32, String>) {
        let backing = Arc::new(AtomicI32::new(value));
        let invocations = Arc::new(AtomicUsize::new(0));
        let source = backing.clone();
        let counter = invocations.clone();
        let cache = build(
            move |_: ()| {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
                let value = source.load(Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Ok(value)
                }
            },
            max_age,
            options,
        );

        (backing, invocations, cache)
    }

    /// Provides a computation which fails while the returned flag is set.
    fn flaky(
        max_age: Duration,
        options: Options,
    ) -> (Arc<AtomicBool>, Arc<AtomicUsize>, AggregateCache<(), usize, String>) {
        let failing = Arc::new(AtomicBool::new(false));
        let invocations = Arc::new(AtomicUsize::new(0));
        let should_fail = failing.clone();
        let counter = invocations.clone();
        let cache = build(
            move |_: ()| {
                let invocation = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let fail = should_fail.load(Ordering::SeqCst);
                async move {
                    if fail {
                        Err(format!("failure #{}", invocation))
                    } else {
                        Ok(invocation)
                    }
                }
            },
            max_age,
            options,
        );

        (failing, invocations, cache)
    }

    async fn let_refreshes_complete() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn values_are_cached_within_max_age() {
        test_async(async {
            let (backing, invocations, cache) =
                shared_value(42, Duration::from_secs(100), Options::default());

            assert_eq!(cache.fetch().await, Ok(42));
            backing.store(43, Ordering::SeqCst);
            assert_eq!(cache.fetch().await, Ok(42));
            let_refreshes_complete().await;
            assert_eq!(cache.fetch().await, Ok(42));
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn stale_values_are_served_while_refreshing() {
        test_async(async {
            let (backing, invocations, cache) =
                shared_value(42, Duration::ZERO, Options::default());

            // Waiting for the first computation must not trigger a second one, even though its
            // outcome is stale right away...
            assert_eq!(cache.fetch().await, Ok(42));
            let_refreshes_complete().await;
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            backing.store(43, Ordering::SeqCst);

            // The stale value is delivered immediately, but a refresh is triggered...
            assert_eq!(cache.fetch().await, Ok(42));
            assert_eq!(invocations.load(Ordering::SeqCst), 2);
            let_refreshes_complete().await;
            assert_eq!(cache.fetch().await, Ok(43));
        });
    }

    #[test]
    fn overlapping_stale_calls_trigger_a_single_refresh() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let counter = invocations.clone();
            let cache = build(
                move |_: ()| {
                    let invocation = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok::<_, String>(invocation)
                    }
                },
                Duration::from_millis(10),
                Options::default(),
            );

            assert_eq!(cache.fetch().await, Ok(1));

            MockClock::advance(Duration::from_millis(20));
            assert_eq!(cache.fetch().await, Ok(1));
            assert_eq!(cache.fetch().await, Ok(1));
            assert_eq!(invocations.load(Ordering::SeqCst), 2);

            let_refreshes_complete().await;
            assert_eq!(invocations.load(Ordering::SeqCst), 2);
            assert_eq!(cache.fetch().await, Ok(2));
        });
    }

    #[test]
    fn each_argument_tuple_is_cached_separately() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let counter = invocations.clone();
            let cache = build(
                move |(n1, n2, n3): (i32, i32, i32)| {
                    let invocation = counter.fetch_add(1, Ordering::SeqCst) as i32 + 1;
                    async move { Ok::<_, String>(n1 + n2 + n3 + 100 * invocation) }
                },
                Duration::ZERO,
                Options::default(),
            );

            // Both calls share the outcome of the first invocation...
            assert_eq!(cache.get((1, 2, 3)).await, Ok(106));
            let_refreshes_complete().await;
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            assert_eq!(cache.get((1, 2, 3)).await, Ok(106));
            assert_eq!(invocations.load(Ordering::SeqCst), 2);
            let_refreshes_complete().await;

            // ...whereas this one observes the refresh triggered by the second call.
            assert_eq!(cache.get((1, 2, 3)).await, Ok(206));
            assert_eq!(cache.len(), 1);

            // Another tuple gets its own entry...
            assert_eq!(cache.get((3, 2, 1)).await.map(|value| value % 100), Ok(6));
            assert_eq!(cache.len(), 2);
        });
    }

    #[test]
    fn passthrough_serves_errors_until_a_refresh_succeeds() {
        test_async(async {
            let (failing, _, cache) = flaky(Duration::ZERO, Options::default());
            assert_eq!(cache.fetch().await, Ok(1));

            failing.store(true, Ordering::SeqCst);
            // Still delivers the cached value but triggers a failing refresh...
            assert_eq!(cache.fetch().await, Ok(1));
            let_refreshes_complete().await;

            assert_eq!(cache.fetch().await, Err("failure #2".to_owned()));
            let_refreshes_complete().await;
            assert_eq!(cache.fetch().await, Err("failure #3".to_owned()));

            failing.store(false, Ordering::SeqCst);
            let_refreshes_complete().await;
            assert_eq!(cache.fetch().await.is_err(), true);
            let_refreshes_complete().await;
            assert_eq!(cache.fetch().await.is_ok(), true);
        });
    }

    #[test]
    fn passthrough_caches_errors_within_max_age() {
        test_async(async {
            let (failing, invocations, cache) = flaky(Duration::from_secs(100), Options::default());
            failing.store(true, Ordering::SeqCst);

            assert_eq!(cache.fetch().await, Err("failure #1".to_owned()));
            assert_eq!(cache.fetch().await, Err("failure #1".to_owned()));
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            assert_eq!(cache.metrics().failures(), 1);
        });
    }

    #[test]
    fn swallow_keeps_the_last_good_value_and_reports_failures() {
        test_async(async {
            let (failing, invocations, cache) =
                flaky(Duration::from_millis(10), Options::default().swallow_errors());
            let reported = Arc::new(Mutex::new(Vec::new()));
            let sink = reported.clone();
            let _ = cache.subscribe_errors(move |error: &String| {
                sink.lock().unwrap().push(error.clone())
            });

            assert_eq!(cache.fetch().await, Ok(1));
            failing.store(true, Ordering::SeqCst);
            MockClock::advance(Duration::from_millis(20));

            assert_eq!(cache.fetch().await, Ok(1));
            let_refreshes_complete().await;
            assert_eq!(reported.lock().unwrap().clone(), vec!["failure #2".to_owned()]);

            // As the clock wasn't advanced by the failure, the next call retries right away...
            assert_eq!(cache.fetch().await, Ok(1));
            let_refreshes_complete().await;
            assert_eq!(invocations.load(Ordering::SeqCst), 3);
            assert_eq!(
                reported.lock().unwrap().clone(),
                vec!["failure #2".to_owned(), "failure #3".to_owned()]
            );

            failing.store(false, Ordering::SeqCst);
            assert_eq!(cache.fetch().await, Ok(1));
            let_refreshes_complete().await;
            assert_eq!(cache.fetch().await, Ok(4));
            assert_eq!(reported.lock().unwrap().len(), 2);
        });
    }

    #[test]
    fn swallow_still_reports_a_first_failure_to_the_caller() {
        test_async(async {
            let (failing, invocations, cache) =
                flaky(Duration::from_secs(1), Options::default().swallow_errors());
            let mut errors = Box::pin(cache.error_stream());
            failing.store(true, Ordering::SeqCst);

            assert_eq!(cache.fetch().await, Err("failure #1".to_owned()));
            assert_eq!(errors.next().await, Some("failure #1".to_owned()));

            // As no value was ever computed, the error is cached like a regular outcome...
            assert_eq!(cache.fetch().await, Err("failure #1".to_owned()));
            assert_eq!(cache.fetch().await, Err("failure #1".to_owned()));
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            // ...until it is stale and a refresh succeeds.
            failing.store(false, Ordering::SeqCst);
            MockClock::advance(Duration::from_secs(2));
            assert_eq!(cache.fetch().await, Err("failure #1".to_owned()));
            let_refreshes_complete().await;
            assert_eq!(invocations.load(Ordering::SeqCst), 2);
            assert_eq!(cache.fetch().await, Ok(2));
        });
    }

    #[test]
    fn swallow_replaces_errors_while_no_value_is_known() {
        test_async(async {
            let (failing, invocations, cache) =
                flaky(Duration::from_secs(1), Options::default().swallow_errors());
            failing.store(true, Ordering::SeqCst);

            assert_eq!(cache.fetch().await, Err("failure #1".to_owned()));
            MockClock::advance(Duration::from_secs(2));
            assert_eq!(cache.fetch().await, Err("failure #1".to_owned()));
            let_refreshes_complete().await;

            assert_eq!(invocations.load(Ordering::SeqCst), 2);
            assert_eq!(cache.fetch().await, Err("failure #2".to_owned()));
            assert_eq!(cache.metrics().failures(), 2);
        });
    }

    #[test]
    fn a_computation_panicking_on_creation_does_not_block_the_entry() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let counter = invocations.clone();
            let cache = build(
                move |_: ()| {
                    let invocation = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if invocation == 2 {
                        panic!("cannot create computation");
                    }
                    async move { Ok::<_, String>(invocation) }
                },
                Duration::ZERO,
                Options::default(),
            );

            assert_eq!(cache.fetch().await, Ok(1));
            assert_eq!(AssertUnwindSafe(cache.fetch()).catch_unwind().await.is_err(), true);

            // Later calls still trigger refreshes...
            assert_eq!(cache.fetch().await, Ok(1));
            let_refreshes_complete().await;
            assert_eq!(invocations.load(Ordering::SeqCst), 3);
            assert_eq!(cache.fetch().await, Ok(3));

            // ...and invalidating doesn't hang.
            let invalidated =
                tokio::time::timeout(Duration::from_secs(1), cache.invalidate()).await;
            assert_eq!(invalidated.is_ok(), true);
        });
    }

    #[test]
    fn unsubscribed_handlers_are_no_longer_invoked() {
        test_async(async {
            let (failing, _, cache) = flaky(Duration::ZERO, Options::default().swallow_errors());
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            let id = cache.subscribe_errors(move |_: &String| {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            });
            let mut listener = cache.error_listener();

            failing.store(true, Ordering::SeqCst);
            assert_eq!(cache.fetch().await.is_err(), true);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(listener.recv().await.unwrap(), "failure #1");

            assert_eq!(cache.unsubscribe_errors(id), true);
            let _ = cache.fetch().await;
            let_refreshes_complete().await;
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(listener.recv().await.unwrap(), "failure #2");
        });
    }

    #[test]
    fn invalidation_resets_all_entries() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let counter = invocations.clone();
            let cache = build(
                move |(key,): (&'static str,)| {
                    let invocation = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Ok::<_, String>(format!("{}{}", key, invocation)) }
                },
                Duration::from_secs(100),
                Options::default(),
            );

            assert_eq!(cache.get(("a",)).await, Ok("a1".to_owned()));
            assert_eq!(cache.get(("b",)).await, Ok("b2".to_owned()));

            cache.invalidate().await;
            assert_eq!(cache.len(), 0);
            assert_eq!(cache.metrics().invalidations(), 1);

            // Each entry behaves like a first call again...
            assert_eq!(cache.get(("b",)).await, Ok("b3".to_owned()));
            assert_eq!(cache.get(("a",)).await, Ok("a4".to_owned()));
            assert_eq!(cache.get(("a",)).await, Ok("a4".to_owned()));
        });
    }

    #[test]
    fn invalidation_waits_for_running_refreshes() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let counter = invocations.clone();
            let cache = build(
                move |_: ()| {
                    let invocation = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, String>(invocation)
                    }
                },
                Duration::ZERO,
                Options::default(),
            );

            assert_eq!(cache.fetch().await, Ok(1));
            // Starts a slow background refresh...
            assert_eq!(cache.fetch().await, Ok(1));

            cache.invalidate().await;
            assert_eq!(invocations.load(Ordering::SeqCst), 2);

            // The result of the refresh is gone, so that we wait for a new computation...
            assert_eq!(cache.fetch().await, Ok(3));
        });
    }

    #[test]
    fn metrics_reflect_usage() {
        test_async(async {
            let (_, _, cache) = shared_value(1, Duration::from_secs(100), Options::default());
            assert_eq!(cache.is_empty(), true);

            let _ = cache.fetch().await;
            let _ = cache.fetch().await;
            let _ = cache.fetch().await;

            assert_eq!(cache.is_empty(), false);
            assert_eq!(cache.metrics().reads(), 3);
            assert_eq!(cache.metrics().hits(), 2);
            assert_eq!(cache.metrics().refreshes(), 1);
            assert_eq!(cache.max_age(), Duration::from_secs(100));
            assert_eq!(cache.options().name, "default");
        });
    }

    #[test]
    fn clones_share_their_entries() {
        test_async(async {
            let (backing, _, cache) = shared_value(1, Duration::from_secs(100), Options::default());
            let clone = cache.clone();

            assert_eq!(cache.fetch().await, Ok(1));
            backing.store(2, Ordering::SeqCst);
            assert_eq!(clone.fetch().await, Ok(1));
            assert_eq!(clone.metrics().reads(), 2);
        });
    }
}
