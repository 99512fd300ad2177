//! Contains the settings which control how a cache treats failing computations.
//!
//! Each [AggregateCache](crate::cache::AggregateCache) is created with a set of [Options]. These
//! carry the [ErrorPolicy] and a name which is only used for logging.
//!
//! # Examples
//!
//! ```
//! # use lazymemo::options::{ErrorPolicy, Options};
//! let options = Options::default().swallow_errors().with_name("zip-codes");
//! assert_eq!(options.errors, ErrorPolicy::Swallow);
//! assert_eq!(options.name, "zip-codes");
//!
//! // Policies can also be parsed from their config names...
//! assert_eq!("passthrough".parse::<ErrorPolicy>().unwrap(), ErrorPolicy::Passthrough);
//! ```
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// Determines what happens to the cached state once a refresh fails.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// A failing refresh replaces the cached value. Every caller receives the error until a
    /// later refresh succeeds again.
    #[default]
    Passthrough,

    /// A failing refresh keeps the last good value and reports the error to the error
    /// listeners of the cache instead. As the staleness clock isn't advanced, the next call
    /// will retry the computation. Until a value is known, the error is cached (and reported)
    /// just like with [ErrorPolicy::Passthrough].
    Swallow,
}

impl FromStr for ErrorPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "passthrough" => Ok(ErrorPolicy::Passthrough),
            "swallow" => Ok(ErrorPolicy::Swallow),
            _ => Err(anyhow::anyhow!(
                "Unknown error policy '{}'. Expected either 'passthrough' or 'swallow'.",
                value
            )),
        }
    }
}

impl Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Passthrough => write!(f, "passthrough"),
            ErrorPolicy::Swallow => write!(f, "swallow"),
        }
    }
}

/// Provides the optional settings of a cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Selects how refresh failures are handled.
    pub errors: ErrorPolicy,

    /// Names the cache in log messages.
    pub name: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            errors: ErrorPolicy::default(),
            name: "default".to_owned(),
        }
    }
}

impl Options {
    /// Switches to [ErrorPolicy::Swallow].
    pub fn swallow_errors(mut self) -> Self {
        self.errors = ErrorPolicy::Swallow;
        self
    }

    /// Specifies the name used when logging.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}
