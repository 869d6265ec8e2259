use std::time::Duration;

use tokio::task::JoinHandle;

use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct Reconciler {
    registry: SessionRegistry,
    interval: Duration,
}

impl Reconciler {
    pub fn new(registry: SessionRegistry, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; nothing to reap yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    async fn tick(&self) {
        let reaped = self.registry.reconcile().await;
        if !reaped.is_empty() {
            tracing::info!(count = reaped.len(), slots = ?reaped, "reconciler removed exited sessions");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::encoder::tests::sh_controller;
    use crate::registry::StartRequest;
    use loopcast_session::{Destination, SlotId};

    #[tokio::test]
    async fn sweep_removes_crashed_session_without_status_query() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.mp4");
        std::fs::write(&src, b"x").unwrap();

        let reg = SessionRegistry::new(sh_controller("sleep 0.1", Duration::from_secs(1)), 100);
        reg.start(StartRequest {
            slot_id: SlotId("s1".to_string()),
            source: src.clone(),
            destination: Destination::resolve("rtmp://127.0.0.1/live", "k").unwrap(),
            cleanup_source: true,
        })
        .await
        .unwrap();

        let handle = Reconciler::new(reg.clone(), Duration::from_millis(250)).spawn();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        handle.abort();

        // Owned source is gone only if the sweep already reaped the session.
        assert!(!src.exists());
        assert!(reg.reconcile().await.is_empty());
        assert!(reg.sessions().await.is_empty());
    }
}
