use std::sync::Arc;

use ingot_agent::{
    archive::ArchiveEngine,
    artifact_fetch::HttpFetcher,
    backup::BackupService,
    broadcast::SessionBroadcastHub,
    config::AgentConfig,
    http_api::{self, AppState},
    process_manager::{ProcessSupervisor, SupervisorSettings},
    provision::Provisioner,
    pty_shell::PtyLauncher,
    task_registry::TaskRegistry,
    tenant_store::{FsTenantDirectory, TenantDirectory},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt::writer::BoxMakeWriter};

/// Logs go to stderr, or to a daily-rolling file when a log directory is configured.
fn init_tracing(cfg: &AgentConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (writer, guard, ansi) = match &cfg.log_dir {
        Some(dir) => {
            let (non_blocking, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "ingot-agent.log"));
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), None, true),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_writer(writer)
        .init();
    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env()?;
    let _guard = init_tracing(&cfg);

    std::fs::create_dir_all(&cfg.data_root)?;
    tracing::info!(data_root = %cfg.data_root.display(), "ingot-agent starting");

    let dir: Arc<dyn TenantDirectory> = Arc::new(FsTenantDirectory::new(&cfg.data_root));
    let supervisor = ProcessSupervisor::new(
        SessionBroadcastHub::new(),
        Arc::new(PtyLauncher::new(cfg.shell.clone())),
        SupervisorSettings::from(&cfg),
    );
    let archive = ArchiveEngine::new(TaskRegistry::new(cfg.task_retention), cfg.archive_workers);
    let provisioner = Arc::new(Provisioner::new(
        dir.clone(),
        supervisor.clone(),
        HttpFetcher,
        cfg.server_jar_url.clone(),
    ));

    let restored = provisioner.restore_sessions().await?;
    tracing::info!(restored, "tenant sessions attached");

    let app = http_api::router(AppState {
        supervisor,
        archive: archive.clone(),
        backups: BackupService::new(archive, dir.clone()),
        provisioner,
        dir,
    });

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    tracing::info!(addr = %cfg.listen_addr, "ingot-agent HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
