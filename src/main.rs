use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use ai_jobs::config::{JobsConfig, api_key_from_env};
use ai_jobs::jobs::{JobManager, RunnerConfig, TaskRunner};
use ai_jobs::llm::{LlmConfig, create_provider};
use ai_jobs::notifier::ChangeNotifier;
use ai_jobs::store::{FileJobStore, JobStore, SessionStore};
use ai_jobs::sync::{ClientHints, job_routes};

/// Stderr logging, plus a daily rolling file when a log dir is configured.
fn init_tracing(config: &JobsConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "ai-jobs.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = JobsConfig::from_env()?;
    let _log_guard = init_tracing(&config)?;

    let api_key = api_key_from_env().inspect_err(|_| {
        eprintln!("Error: ANTHROPIC_API_KEY not set");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
    })?;

    eprintln!("AI Jobs v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Data: {}", config.data_dir.display());
    eprintln!("   Job WS: ws://0.0.0.0:{}/ws/jobs", config.port);
    eprintln!("   Job API: http://0.0.0.0:{}/api/jobs", config.port);

    // ── Stores ──────────────────────────────────────────────────────────
    let store: Arc<dyn JobStore> = Arc::new(
        FileJobStore::open(config.jobs_dir())
            .await
            .context("opening job store")?,
    );
    let sessions = Arc::new(
        SessionStore::open(config.sessions_dir())
            .await
            .context("opening session store")?,
    );
    let manager = Arc::new(JobManager::new(Arc::clone(&store)));

    if config.reap_orphans {
        let reaped = manager
            .reap_orphans("Interrupted by restart")
            .await
            .context("reaping orphaned jobs")?;
        eprintln!("   Reaped {} orphaned jobs", reaped.len());
    }

    // ── Runner ──────────────────────────────────────────────────────────
    let llm = create_provider(&LlmConfig {
        api_key,
        model: config.model.clone(),
    })?;
    let runner = Arc::new(TaskRunner::new(
        Arc::clone(&manager),
        llm,
        RunnerConfig {
            step_timeout: config.step_timeout,
            ..Default::default()
        },
    ));

    // ── Server ──────────────────────────────────────────────────────────
    let notifier = ChangeNotifier::new(store, config.debounce);
    let hints = ClientHints {
        poll_interval: config.poll_interval,
        stall_threshold: config.stall_threshold,
    };
    let app = job_routes(runner, notifier, sessions, hints).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    tracing::info!(port = config.port, "Job server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    Ok(())
}
