use std::sync::Arc;

use crate::config::RoomSettings;
use crate::registry::RoomRegistry;
use crate::signal::SignalRouter;

/// Shared server state handed to every socket task.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub router: Arc<SignalRouter>,
}

impl AppState {
    pub fn new(settings: RoomSettings) -> Self {
        let registry = Arc::new(RoomRegistry::new(settings));
        let router = Arc::new(SignalRouter::new(registry.clone()));
        Self { registry, router }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(RoomSettings::default())
    }
}
