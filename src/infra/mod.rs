//! Infrastructure: configuration, merging, logging, cancellation and retry helpers

pub mod backoff;
pub mod cancel;
pub mod config;
pub mod logging;
pub mod merge;
pub mod watcher;

pub use backoff::{ExponentialBackoff, MaxRetriesReached};
pub use cancel::GenerationTokens;
pub use config::{ConfigError, ServicePaths};
