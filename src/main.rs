use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use bevakning::api::{ApiState, api_routes};
use bevakning::captcha::{CaptchaConfig, CaptchaSolver, DEFAULT_SOLVE_POLL};
use bevakning::clock::{Clock, SystemClock};
use bevakning::config::{EngineConfig, ServerConfig};
use bevakning::jobs::{BirthYearRule, JobEngine, JobRegistry, spawn_sweeper};
use bevakning::session::{ScriptSessionFactory, SessionManager, spawn_idle_reaper};
use bevakning::store::{JobStore, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server_config = ServerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export BEVAKNING_AUTOMATION_CMD=\"node scripts/automation.js\"");
        std::process::exit(1);
    });
    let engine_config = EngineConfig::from_env();

    eprintln!("Bevakning v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/jobs", server_config.http_port);
    eprintln!("   Automation: {}", server_config.automation_cmd.join(" "));
    eprintln!(
        "   Strategies: {}",
        engine_config
            .strategies
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    eprintln!(
        "   Session idle timeout: {}s, lane size: {}",
        engine_config.session_idle_timeout.as_secs(),
        engine_config.lane_size
    );

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(Path::new(&server_config.db_path))
            .await
            .with_context(|| format!("Failed to open database at {}", server_config.db_path))?,
    );
    eprintln!("   Database: {}", server_config.db_path);

    let job_store: Arc<dyn JobStore> = backend.clone();
    let registry = JobRegistry::new(Some(job_store));

    // ── Startup Recovery: jobs a previous process never finished ─────────
    match registry.recover_interrupted().await {
        Ok(0) => {}
        Ok(n) => eprintln!("   Recovered {n} interrupted jobs (marked failed)"),
        Err(e) => tracing::warn!(error = %e, "Startup recovery failed"),
    }

    // ── Session ──────────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut factory = ScriptSessionFactory::new(server_config.automation_cmd.clone())?;
    if let Some(captcha) = CaptchaConfig::from_env() {
        eprintln!("   Captcha solver: {}", captcha.base_url);
        factory = factory.with_captcha_solver(Arc::new(CaptchaSolver::new(
            captcha,
            Arc::clone(&clock),
            DEFAULT_SOLVE_POLL,
        )));
    }
    let sessions = Arc::new(SessionManager::new(
        Arc::new(factory),
        Arc::clone(&clock),
        engine_config.session_idle_timeout,
    ));

    // ── Engine ───────────────────────────────────────────────────────────
    let engine = Arc::new(JobEngine::new(
        &engine_config,
        Arc::clone(&registry),
        Arc::clone(&sessions),
        backend,
        Arc::new(BirthYearRule),
        clock,
    ));

    let _sweep_handle = spawn_sweeper(
        registry,
        engine_config.sweep_interval,
        engine_config.job_retention,
    );
    let reaper_handle = spawn_idle_reaper(sessions, engine_config.sweep_interval);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api_routes(ApiState {
        engine: Arc::clone(&engine),
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server_config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", server_config.http_port))?;
    tracing::info!(port = server_config.http_port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down, draining jobs and closing automation session");
            reaper_handle.abort();
            let outcome = engine.shutdown(engine_config.shutdown_grace).await;
            tracing::info!(?outcome, "Automation session released");
        })
        .await?;

    Ok(())
}
