//! Provides a builder which can be used to setup a cache.
//!
//! While [build](crate::cache::build) expects all settings up front, a builder permits to only
//! specify what differs from the defaults. It can also be initialized from a YAML snippet (e.g.
//! a section of a config file) and offers some shortcuts to wrap computations which don't take
//! arguments or which aren't async at all.
//!
//! # Example
//! Setting up a cache which keeps its last good value if a refresh fails:
//! ```
//! # use lazymemo::builder::Builder;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let cache = Builder::new()
//!     .name("answers")
//!     .max_age(Duration::from_secs(60))
//!     .swallow_errors()
//!     .build_nullary(|| async { Ok::<_, String>(42) });
//!
//! assert_eq!(cache.fetch().await, Ok(42));
//! # }
//! ```
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use yaml_rust::yaml::Hash;
use yaml_rust::{Yaml, YamlLoader};

use crate::cache::AggregateCache;
use crate::fmt::parse_duration;
use crate::init_logging;
use crate::options::{ErrorPolicy, Options};
use crate::tree::Arguments;

/// Collects the settings of a cache and finally creates it for a given computation.
///
/// # Example
/// Loading the settings from YAML:
/// ```
/// # use lazymemo::builder::Builder;
/// # use std::time::Duration;
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let cache = Builder::from_yaml("
/// name: lengths
/// max_age: 15m
/// errors: swallow
/// ")?
/// .build_sync(|(text,): (String,)| Ok::<_, String>(text.len()));
///
/// assert_eq!(cache.max_age(), Duration::from_secs(15 * 60));
/// assert_eq!(cache.get(("hello".to_owned(),)).await, Ok(5));
/// # Ok(())
/// # }
/// ```
#[derive(Default, Debug, Clone)]
pub struct Builder {
    name: Option<String>,
    max_age: Duration,
    errors: ErrorPolicy,
    setup_logging: bool,
}

impl Builder {
    /// Creates a new builder.
    ///
    /// Unless specified otherwise, the cache will have a max age of zero (every call triggers a
    /// refresh in the background) and will pass errors through to the caller.
    pub fn new() -> Self {
        Builder {
            name: None,
            max_age: Duration::ZERO,
            errors: ErrorPolicy::Passthrough,
            setup_logging: false,
        }
    }

    /// Creates a builder from the given YAML settings.
    ///
    /// The settings are expected to be a map which might contain:
    /// * **name**: the name of the cache as used in log messages
    /// * **max_age**: either a number of seconds or a duration like `250ms`, `15m` or `1h`
    /// * **errors**: either `passthrough` or `swallow`
    ///
    /// Missing keys simply keep their defaults.
    pub fn from_yaml(data: &str) -> anyhow::Result<Self> {
        let docs = YamlLoader::load_from_str(data)
            .map_err(|error| anyhow::anyhow!("Cannot parse cache settings: {}", error))?;

        let settings = match docs.first() {
            Some(Yaml::Hash(settings)) => settings,
            None | Some(Yaml::Null) => return Ok(Builder::new()),
            Some(_) => {
                return Err(anyhow::anyhow!(
                    "Cache settings must be a map of keys and values."
                ))
            }
        };

        let mut builder = Builder::new();

        match setting(settings, "name") {
            None => (),
            Some(Yaml::String(name)) => builder = builder.name(name.as_str()),
            Some(other) => return Err(anyhow::anyhow!("Invalid cache name: {:?}", other)),
        }

        match setting(settings, "max_age") {
            None => (),
            Some(Yaml::Integer(seconds)) => builder = builder.max_age_seconds(*seconds as f64)?,
            Some(real @ Yaml::Real(_)) => {
                let seconds = real
                    .as_f64()
                    .context("Cannot parse the max age of the cache.")?;
                builder = builder.max_age_seconds(seconds)?;
            }
            Some(Yaml::String(duration)) => builder = builder.max_age(parse_duration(duration)?),
            Some(other) => return Err(anyhow::anyhow!("Invalid max age: {:?}", other)),
        }

        match setting(settings, "errors") {
            None => (),
            Some(Yaml::String(policy)) => builder = builder.errors(policy.parse()?),
            Some(other) => return Err(anyhow::anyhow!("Invalid error policy: {:?}", other)),
        }

        Ok(builder)
    }

    /// Specifies the name of the cache, which is used in log messages.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Specifies the duration after which a cached outcome is considered stale.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Specifies the max age in (possibly fractional) seconds.
    ///
    /// Fails for negative, infinite or NaN values.
    ///
    /// # Example
    /// ```
    /// # use lazymemo::builder::Builder;
    /// assert_eq!(Builder::new().max_age_seconds(1.5).is_ok(), true);
    /// assert_eq!(Builder::new().max_age_seconds(-1.).is_err(), true);
    /// assert_eq!(Builder::new().max_age_seconds(f64::NAN).is_err(), true);
    /// ```
    pub fn max_age_seconds(self, seconds: f64) -> anyhow::Result<Self> {
        let max_age = Duration::try_from_secs_f64(seconds)
            .with_context(|| format!("Invalid max age: {} seconds", seconds))?;

        Ok(self.max_age(max_age))
    }

    /// Specifies how failed refreshes are handled.
    pub fn errors(mut self, policy: ErrorPolicy) -> Self {
        self.errors = policy;
        self
    }

    /// Keeps the last good value if a refresh fails.
    ///
    /// This is a shortcut for `errors(ErrorPolicy::Swallow)`.
    pub fn swallow_errors(self) -> Self {
        self.errors(ErrorPolicy::Swallow)
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// See [init_logging](crate::init_logging) for details.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    fn into_options(self) -> (Duration, Options) {
        if self.setup_logging {
            init_logging();
        }

        let options = Options {
            errors: self.errors,
            name: self.name.unwrap_or_else(|| Options::default().name),
        };

        (self.max_age, options)
    }

    /// Creates a cache for an async computation.
    pub fn build<A, V, E, F, Fut>(self, compute: F) -> AggregateCache<A, V, E>
    where
        A: Arguments<V, E>,
        V: Clone + Send + Sync + 'static,
        E: Clone + Display + Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (max_age, options) = self.into_options();
        AggregateCache::new(compute, max_age, options)
    }

    /// Creates a cache for an async computation which doesn't take any arguments.
    pub fn build_nullary<V, E, F, Fut>(self, compute: F) -> AggregateCache<(), V, E>
    where
        V: Clone + Send + Sync + 'static,
        E: Clone + Display + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.build(move |_: ()| compute())
    }

    /// Creates a cache for a plain (blocking) computation.
    ///
    /// Note that the computation is still run in a background task when refreshing. Therefore
    /// it shouldn't block for long, otherwise it should rather be made async.
    pub fn build_sync<A, V, E, F>(self, compute: F) -> AggregateCache<A, V, E>
    where
        A: Arguments<V, E>,
        V: Clone + Send + Sync + 'static,
        E: Clone + Display + Send + Sync + 'static,
        F: Fn(A) -> Result<V, E> + Send + Sync + 'static,
    {
        self.build(move |arguments: A| futures::future::ready(compute(arguments)))
    }
}

fn setting<'a>(settings: &'a Hash, key: &str) -> Option<&'a Yaml> {
    settings.get(&Yaml::String(key.to_owned()))
}
