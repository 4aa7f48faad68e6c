//! Server-side cookie sessions.
//!
//! - [`store`]: the [`SessionStore`] trait and the in-memory backend
//! - [`redis_store`]: the Redis backend
//! - [`manager`]: issue, validate-and-rotate, revoke
//! - [`audit`]: structured audit events

pub mod audit;
pub mod manager;
pub mod redis_store;
pub mod store;

use std::sync::Arc;

pub use manager::{AuthStage, Session, SessionManager};
pub use redis_store::RedisSessionStore;
pub use store::{InMemorySessionStore, SessionStore, spawn_reaper};

use crate::Result;
use crate::config::{StoreBackend, StoreConfig};

/// Build the configured store backend.
///
/// For the memory backend a reaper is started on `shutdown`. For Redis the
/// server is pinged once so a bad URI or unreachable server is reported at
/// startup; the process still starts and requests fail closed.
///
/// # Errors
///
/// Returns [`Error::Config`](crate::Error::Config) if the Redis URI is
/// missing or invalid.
pub async fn build_store(
    config: &StoreConfig,
    shutdown: &tokio::sync::broadcast::Sender<()>,
) -> Result<Arc<dyn SessionStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = Arc::new(InMemorySessionStore::new());
            spawn_reaper(Arc::clone(&store), config.reap_interval, shutdown.subscribe());
            Ok(store)
        }
        StoreBackend::Redis => {
            let store = RedisSessionStore::from_config(config)?;
            if let Err(e) = store.ping().await {
                tracing::error!(error = %e, "Session store not reachable at startup");
            }
            Ok(Arc::new(store))
        }
    }
}
