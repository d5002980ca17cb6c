use std::sync::Arc;
use std::time::Duration;

use rendezvous_services::SignalStore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodically drops idle meeting buckets from the store.
pub fn spawn_janitor(store: Arc<dyn SignalStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick fires immediately; nothing is idle yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.sweep_idle().await {
                Ok(0) => debug!("Janitor found no idle meetings"),
                Ok(removed) => info!(removed, "Janitor dropped idle meetings"),
                Err(e) => warn!(%e, "Janitor sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rendezvous_services::model::NewChatMessage;
    use rendezvous_services::store::MemoryStore;
    use rendezvous_services::{ManualClock, RetentionPolicy};

    #[tokio::test(start_paused = true)]
    async fn janitor_sweeps_idle_buckets() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store: Arc<dyn SignalStore> =
            Arc::new(MemoryStore::new(RetentionPolicy::default(), clock.clone()));
        store
            .post_message("room1", NewChatMessage::new("Ann", "hi"))
            .await
            .unwrap();

        let handle = spawn_janitor(store.clone(), Duration::from_secs(60));
        clock.advance(chrono::Duration::hours(2));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(store.list_messages("room1", None).await.unwrap().is_empty());
        handle.abort();
    }
}
