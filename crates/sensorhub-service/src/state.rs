//! Application state shared across handlers.

use std::sync::Arc;

use sensorhub_store::Store;
use tokio::sync::Mutex;

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::dispatch::TaskPublisher;

/// Shared application state.
///
/// Handlers lock `store`, open one unit of work, commit it and release the
/// lock before awaiting anything else.
pub struct AppState {
    /// The data store (wrapped in Mutex for thread-safe access).
    pub store: Mutex<Store>,
    /// Configuration, fixed at startup.
    pub config: Config,
    /// Cache of full measurement pages.
    pub cache: Arc<dyn ResponseCache>,
    /// Where stats tasks are sent.
    pub publisher: Arc<dyn TaskPublisher>,
}

impl AppState {
    /// Create new application state.
    pub fn new(
        store: Store,
        config: Config,
        cache: Arc<dyn ResponseCache>,
        publisher: Arc<dyn TaskPublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(store),
            config,
            cache,
            publisher,
        })
    }
}
