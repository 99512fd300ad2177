//! Lazymemo is a library which memoizes expensive async computations using a
//! "stale while revalidate" strategy.
//!
//! # Introduction
//! Many services depend on data which is expensive to compute or to fetch (think of remote
//! lookups, aggregations or rendered fragments) but which doesn't change that often. Simply
//! caching such data with a TTL has the drawback that once the TTL is reached, some unlucky caller
//! has to wait for the data to be recomputed. Even worse, if many callers hit the expired entry at
//! once, all of them trigger a recomputation.
//!
//! **Lazymemo** therefore wraps a computation into an [AggregateCache](cache::AggregateCache)
//! which behaves as follows:
//! * The very first call for a given argument tuple waits for the computation to complete.
//! * Every later call is answered immediately using the cached outcome.
//! * If this outcome is older than the configured **max age**, a refresh is started in the
//!   background. The caller still receives the stale outcome.
//! * There is never more than one refresh per argument tuple. Callers arriving while a refresh
//!   is running simply use the current outcome (or join the refresh, if there is none yet).
//!
//! # Errors
//! A failing computation is handled according to the [ErrorPolicy](options::ErrorPolicy) of the
//! cache. Either the error is cached and handed out just like a value (**passthrough**) or the
//! last good value is kept and the error is only reported to subscribed handlers (**swallow**).
//!
//! # Modules
//! * [cache]: the public facade to memoize a computation.
//! * [builder]: provides a convenient way of setting up a cache.
//! * [node]: the cache entry of a single argument tuple, which contains the refresh logic.
//! * [tree]: maps argument tuples onto their cache entries.
//! * [events]: broadcasts swallowed failures.
//! * [metrics]: collects usage counters.
//!
//! # Examples
//! ```
//! # use lazymemo::builder::Builder;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let greetings = Builder::new()
//!     .name("greetings")
//!     .max_age(Duration::from_secs(10))
//!     .build(|(name,): (String,)| async move { Ok::<_, String>(format!("Hello {}", name)) });
//!
//! assert_eq!(
//!     greetings.get(("World".to_owned(),)).await,
//!     Ok("Hello World".to_owned())
//! );
//! # }
//! ```
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod builder;
pub mod cache;
pub mod events;
pub mod fmt;
pub mod metrics;
pub mod node;
pub mod options;
pub mod tree;

pub use builder::Builder;
pub use cache::{build, AggregateCache};
pub use options::{ErrorPolicy, Options};

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) with
/// [enable_logging](builder::Builder::enable_logging), which will invoke this when the cache
/// is built. Calling this more than once is fine.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Each test might set up its own cache with logging enabled, therefore we must only
    // initialize the logger once...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate lazymemo;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
