use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures_util::future::join_all;
use loopcast_session::SlotId;

use crate::registry::SessionRegistry;

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub stopped: Vec<SlotId>,
    pub failed: Vec<(SlotId, String)>,
}

/// Drains the registry once at service exit, through the same stop path
/// used by explicit requests.
#[derive(Clone)]
pub struct ShutdownSupervisor {
    registry: SessionRegistry,
    ran: Arc<AtomicBool>,
}

impl ShutdownSupervisor {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            ran: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn run(&self) -> ShutdownReport {
        if self.ran.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }

        let slots = self.registry.close().await;
        tracing::info!(
            count = slots.len(),
            grace_ms = self.registry.controller().grace().as_millis() as u64,
            "draining stream sessions"
        );

        let results = join_all(slots.into_iter().map(|slot_id| {
            let registry = self.registry.clone();
            async move {
                let res = registry.stop(&slot_id).await;
                (slot_id, res)
            }
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (slot_id, res) in results {
            match res {
                Ok(_) => report.stopped.push(slot_id),
                Err(err) => {
                    tracing::warn!(%slot_id, %err, "shutdown: failed to stop session");
                    report.failed.push((slot_id, err.to_string()));
                }
            }
        }

        tracing::info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "stream sessions drained"
        );
        report
    }
}
