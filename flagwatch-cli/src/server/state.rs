use std::sync::Arc;

use flagwatch_lib::Registry;

/// Shared application state for the HTTP server.
///
/// The registry is the same instance the watcher keeps in sync with the
/// features file, so reads here always see the latest reload.
pub struct AppState {
    pub registry: Arc<Registry>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}
