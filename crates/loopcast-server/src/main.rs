use loopcast_agent::{
    AgentConfig, ProcessController, Reconciler, SessionRegistry, ShutdownSupervisor,
    shutdown::shutdown_signal,
};
use loopcast_server::config::ServerConfig;
use loopcast_server::state::AppState;
use loopcast_server::storage::VideoStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server_cfg = ServerConfig::from_env()?;
    let agent_cfg = AgentConfig::from_env();

    let store = VideoStore::init(server_cfg.videos_dir(), server_cfg.sessions_dir()).await?;

    let controller = ProcessController::ffmpeg(agent_cfg.encoder_bin.clone(), agent_cfg.term_grace);
    let encoder_available = controller.probe().await;
    if encoder_available {
        tracing::info!(program = %agent_cfg.encoder_bin, "encoder is installed and accessible");
    } else {
        tracing::error!(
            program = %agent_cfg.encoder_bin,
            "encoder not runnable; stream starts will fail until it is installed (set LOOPCAST_ENCODER_BIN)"
        );
    }

    let registry = SessionRegistry::new(controller, agent_cfg.log_max_lines);
    let supervisor = ShutdownSupervisor::new(registry.clone());

    let reconciler = agent_cfg
        .reconcile_interval
        .map(|interval| Reconciler::new(registry.clone(), interval).spawn());

    let state = AppState {
        registry,
        store,
        encoder_available,
    };
    let app = loopcast_server::router(state, &server_cfg);

    let listener = tokio::net::TcpListener::bind(server_cfg.bind).await?;
    tracing::info!(addr = %server_cfg.bind, data_root = %server_cfg.data_root.display(), "loopcast HTTP listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Drain even if the server errored out: no encoder may outlive us.
    if let Some(handle) = reconciler {
        handle.abort();
    }
    let report = supervisor.run().await;
    if !report.failed.is_empty() {
        tracing::warn!(failed = ?report.failed, "some sessions did not stop cleanly");
    }

    served?;
    Ok(())
}
