use rendezvous_config::Settings;
use rendezvous_services::{
    AllowListDirectory, Clock, MeetingDirectory, OpenDirectory, RoomRegistry, SignalStore,
    SystemClock, store::build_store,
};
use std::sync::Arc;
use tracing::info;

use crate::ws::storage::WsStorage;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn SignalStore>,
    pub rooms: Arc<RoomRegistry>,
    pub ws_storage: Arc<WsStorage>,
    pub directory: Arc<dyn MeetingDirectory>,
}

impl AppState {
    /// Builds the configured store backend and directory.
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = build_store(&settings, clock.clone()).await?;
        Ok(Self::with_store(settings, store, clock))
    }

    /// Wires the state around an already built store.
    pub fn with_store(settings: Settings, store: Arc<dyn SignalStore>, clock: Arc<dyn Clock>) -> Self {
        let directory: Arc<dyn MeetingDirectory> = if settings.directory.allowed.is_empty() {
            Arc::new(OpenDirectory)
        } else {
            info!(
                meetings = settings.directory.allowed.len(),
                "Using allow-list meeting directory"
            );
            Arc::new(AllowListDirectory::new(settings.directory.allowed.clone()))
        };

        Self {
            settings,
            clock,
            store,
            rooms: Arc::new(RoomRegistry::new()),
            ws_storage: Arc::new(WsStorage::new()),
            directory,
        }
    }
}
