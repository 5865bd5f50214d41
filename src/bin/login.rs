//! login: first-time session setup for the autolock bot.
//!
//! Opens the site in the configured browser (if any) so you can sign in,
//! then reads the session cookie with hidden input, validates it against
//! the account endpoint, and stores it in the config file.
//!
//! Copy the cookie from the browser's devtools (the `a_session_*` cookie
//! for the API host), formatted as `name=value`.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::process::Command;

use acs_autolock::api::fetch_identity;
use acs_autolock::config::{AppConfig, BrowserConfig, CONFIG_PATH};
use acs_autolock::gateway::SessionGateway;

#[derive(Parser)]
#[command(
    name = "login",
    about = "Open the site for manual login, validate the session cookie and save it to config.toml"
)]
struct Cli {
    /// Path to the TOML config file (created with defaults if missing)
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Session cookie (`name=value`). If omitted, reads it with hidden input.
    #[arg(long)]
    cookie: Option<String>,

    /// Do not launch the browser, even if one is configured
    #[arg(long)]
    no_browser: bool,
}

fn browser_command(browser: &BrowserConfig) -> Option<Command> {
    let path = browser.executable_path.as_ref()?;
    let mut cmd = Command::new(path);
    if browser.headless {
        cmd.arg("--headless");
    }
    cmd.arg(&browser.website_url);
    Some(cmd)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut app_config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        println!("{} not found, starting from defaults", cli.config.display());
        AppConfig::default()
    };

    println!("=== Autolock: Session Setup ===\n");

    // ── Step 1: Manual login ───────────────────────────────────────
    let mut browser = None;
    if !cli.no_browser && cli.cookie.is_none() {
        match browser_command(&app_config.browser) {
            Some(mut cmd) => {
                println!("Opening {} ...", app_config.browser.website_url);
                let child = cmd.spawn().with_context(|| {
                    format!(
                        "failed to launch browser {:?}",
                        app_config.browser.executable_path
                    )
                })?;
                browser = Some(child);
                println!("Log in, then copy the session cookie from devtools.");
            }
            None => {
                println!(
                    "No browser configured; log in at {} yourself and copy the session cookie.",
                    app_config.browser.website_url
                );
            }
        }
        println!();
    }

    // ── Step 2: Read cookie ────────────────────────────────────────
    let cookie = match cli.cookie {
        Some(c) => c.trim().to_string(),
        None => {
            let c = rpassword::prompt_password("Enter session cookie (name=value): ")
                .context("failed to read session cookie")?;
            c.trim().to_string()
        }
    };
    if cookie.is_empty() {
        bail!("session cookie cannot be empty");
    }
    if !cookie.contains('=') {
        bail!("session cookie must look like name=value");
    }

    // ── Step 3: Validate against the account endpoint ──────────────
    println!("Validating session...");
    let gateway = SessionGateway::new(
        &cookie,
        &app_config.session.user_agent,
        app_config.settings.request_timeout(),
    )?;
    let user_id = fetch_identity(
        &gateway,
        &app_config.endpoints.account_url,
        &app_config.session.project_id,
    )
    .await
    .context("session rejected, is the cookie current?")?;
    println!("  Logged in as: {user_id}");
    println!();

    // ── Step 4: Save ───────────────────────────────────────────────
    app_config.session.cookie = Some(cookie);
    app_config
        .save(&cli.config)
        .with_context(|| format!("failed to update {}", cli.config.display()))?;
    println!("Session cookie saved to {}", cli.config.display());

    if let Some(mut child) = browser {
        // The browser only served the manual login.
        child.kill().await.ok();
    }

    println!("\n=== Setup complete ===");
    println!("Run `autolock` (or `autolock --dry-run`) to start racing.");

    Ok(())
}
