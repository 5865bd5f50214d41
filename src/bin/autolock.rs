use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use acs_autolock::SESSION_COOKIE_VAR;
use acs_autolock::api::fetch_identity;
use acs_autolock::config::{AppConfig, CONFIG_PATH};
use acs_autolock::engine::{RaceController, RaceSettings};
use acs_autolock::executor::ClaimExecutor;
use acs_autolock::feed::{FeedSettings, run_feed};
use acs_autolock::gateway::SessionGateway;
use acs_autolock::monitor::LockMonitor;
use acs_autolock::reporter;
use acs_autolock::state::{Eligibility, RaceStats};

/// Frames buffered between the feed socket and the race controller.
const FRAME_BUFFER: usize = 1024;

#[derive(Parser)]
#[command(name = "autolock", about = "Race to lock new questions as they are posted")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Log the claims that would be sent instead of sending them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;
    config.validate()?;
    info!("Loaded config from {}", args.config.display());

    let cookie = config.resolve_cookie(std::env::var(SESSION_COOKIE_VAR).ok())?;
    let settings = &config.settings;
    let endpoints = &config.endpoints;
    let project_id = config.session.project_id.clone();

    let gateway = Arc::new(SessionGateway::new(
        &cookie,
        &config.session.user_agent,
        settings.request_timeout(),
    )?);

    // Fail fast on a dead session rather than racing with it.
    let user_id = fetch_identity(gateway.as_ref(), &endpoints.account_url, &project_id).await?;
    let mode = if args.dry_run { "dry-run" } else { "live" };
    info!(
        "Starting autolock ({mode}) as {user_id}: max_age={}s min_lock_age={}s hesitation={}",
        settings.max_age_secs, settings.min_lock_age_secs, settings.hesitation_probability,
    );

    let eligibility = Eligibility::default();
    let stats = Arc::new(RaceStats::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = LockMonitor::new(
        gateway.clone(),
        endpoints.account_url.clone(),
        endpoints.questions_url.clone(),
        project_id.clone(),
        eligibility.clone(),
        stats.clone(),
        settings.monitor_min_secs,
        settings.monitor_max_secs,
    );
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
    let feed_settings = FeedSettings {
        url: endpoints.feed_url.clone(),
        reconnect_delay: settings.reconnect_delay(),
        max_reconnect_delay: settings.max_reconnect_delay(),
        connect_timeout: settings.request_timeout(),
        heartbeat: settings.feed_heartbeat(),
    };
    let feed_handle = tokio::spawn(run_feed(
        feed_settings,
        frames_tx,
        stats.clone(),
        shutdown_rx.clone(),
    ));

    let executor = Arc::new(ClaimExecutor::new(
        gateway.clone(),
        endpoints.claim_url.clone(),
        project_id,
        args.dry_run,
    ));
    let mut controller = RaceController::new(
        executor,
        eligibility,
        stats.clone(),
        RaceSettings {
            max_age_secs: settings.max_age_secs,
            min_lock_age_secs: settings.min_lock_age_secs,
            human: settings.human_delay(),
            recheck_eligibility: settings.recheck_eligibility,
        },
    );

    info!("Listening for new questions. Press Ctrl+C to stop.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = controller.run(frames_rx, shutdown_rx) => {
            warn!("Race controller stopped unexpectedly");
        }
    }

    // --- Graceful shutdown ---
    let _ = shutdown_tx.send(true);
    controller.shutdown(settings.shutdown_grace()).await;
    if let Err(e) = feed_handle.await {
        warn!("Feed task failed: {e}");
    }
    if let Err(e) = monitor_handle.await {
        warn!("Monitor task failed: {e}");
    }

    reporter::report_summary(&stats.summary());
    Ok(())
}
