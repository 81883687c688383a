//! Logging setup driven by the shared [`Config`].
//!
//! [`init_worker`] runs in the start handler of every executor-owned thread pool. It installs
//! a subscriber for that worker thread only, filtered by the pipeline's `log_level`, so two
//! pipelines with different levels can run side by side in one process. [`init_from_config`]
//! is the process-wide counterpart for applications; the first successful call wins.

use crate::config::Config;
use std::cell::RefCell;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn";

thread_local! {
    static WORKER_SUBSCRIBER: RefCell<Option<DefaultGuard>> = const { RefCell::new(None) };
}

/// Build the filter for a config: `log_level` key, then `RUST_LOG`, then `warn`.
#[must_use]
pub fn filter_for(config: &Config) -> EnvFilter {
    if let Some(level) = config.log_level()
        && let Ok(filter) = EnvFilter::try_new(level)
    {
        return filter;
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a fmt subscriber for this process if none is installed yet.
///
/// Returns `true` when this call installed the subscriber.
pub fn init_from_config(config: &Config) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(config))
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Install a fmt subscriber for the current thread, unless it already has one from an
/// earlier call. It stays in effect until the thread exits.
///
/// Returns `true` when this call installed the subscriber.
pub fn init_worker(config: &Config) -> bool {
    WORKER_SUBSCRIBER.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return false;
        }
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter_for(config))
            .with_writer(std::io::stderr)
            .with_target(true)
            .finish();
        *slot = Some(tracing::subscriber::set_default(subscriber));
        true
    })
}
