//! Shared TTL cache used for cross-instance coordination.
//!
//! The job subsystem only ever talks to the cache through [`CacheBackend`], which
//! promises per-key atomic put/check and nothing stronger (no multi-key
//! transactions). Three backends are provided:
//!
//! - **NoopBackend**: used when no cache is configured; every write succeeds and
//!   every read misses, which collapses coordination to single-instance mode
//! - **InMemoryBackend**: process-local TTL cache for single-host deployments and tests
//! - **RedisBackend**: the shared cache for multi-instance deployments

pub mod backend;

pub use backend::{CacheBackend, InMemoryBackend, NoopBackend, RedisBackend};

use std::sync::Arc;

use crate::config::RedisConfig;

/// Connect to the configured cache, falling back to [`NoopBackend`].
///
/// A connection failure is a degraded-mode signal, never an abort signal.
pub async fn connect(config: Option<&RedisConfig>) -> Arc<dyn CacheBackend> {
    let Some(config) = config else {
        tracing::info!("No shared cache configured; running in single-instance mode");
        return Arc::new(NoopBackend);
    };

    match RedisBackend::connect(config).await {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            tracing::warn!(
                url = %config.url,
                error = %e,
                "Shared cache unreachable; running in single-instance mode"
            );
            Arc::new(NoopBackend)
        }
    }
}
