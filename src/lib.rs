pub mod config;
pub mod identity;
pub mod observability;
pub mod rest;
pub mod storage;

use std::sync::Arc;

use config::ServiceConfig;
use identity::IdentityResolver;
use storage::SqliteContactStore;

/// Shared application state passed to every request handler.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServiceConfig>,
    pub store: Arc<SqliteContactStore>,
    pub resolver: Arc<IdentityResolver>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    pub fn new(config: Arc<ServiceConfig>, store: Arc<SqliteContactStore>) -> Self {
        let resolver = Arc::new(IdentityResolver::new(store.clone()));
        Self {
            config,
            store,
            resolver,
            started_at: std::time::Instant::now(),
        }
    }
}
