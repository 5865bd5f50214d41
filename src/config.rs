use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::timing::HumanDelayConfig;
use crate::{ACCOUNT_URL, CLAIM_URL, FEED_WS_URL, PROJECT_ID, QUESTIONS_URL, WEBSITE_URL};

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/115.0";

/// Top-level application config deserialized from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

/// Session credentials taken from a logged-in browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Raw `Cookie` header value copied from the browser
    /// (e.g. `a_session_643c...=...`). May be supplied via env instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    #[serde(default = "default_project_id")]
    pub project_id: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_project_id() -> String {
    PROJECT_ID.to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie: None,
            project_id: default_project_id(),
            user_agent: default_user_agent(),
        }
    }
}

/// Remote endpoints. Defaults point at the production deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default = "default_feed_url")]
    pub feed_url: String,
    #[serde(default = "default_claim_url")]
    pub claim_url: String,
    #[serde(default = "default_account_url")]
    pub account_url: String,
    #[serde(default = "default_questions_url")]
    pub questions_url: String,
}

fn default_feed_url() -> String {
    FEED_WS_URL.to_string()
}

fn default_claim_url() -> String {
    CLAIM_URL.to_string()
}

fn default_account_url() -> String {
    ACCOUNT_URL.to_string()
}

fn default_questions_url() -> String {
    QUESTIONS_URL.to_string()
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            feed_url: default_feed_url(),
            claim_url: default_claim_url(),
            account_url: default_account_url(),
            questions_url: default_questions_url(),
        }
    }
}

/// Race timing and runtime settings. All durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Events older than this are never claimed.
    #[serde(default = "default_max_age")]
    pub max_age_secs: f64,
    /// A question must be at least this old before the claim fires.
    #[serde(default = "default_min_lock_age")]
    pub min_lock_age_secs: f64,
    #[serde(default = "default_hesitation_probability")]
    pub hesitation_probability: f64,
    #[serde(default = "default_hesitation_secs")]
    pub hesitation_secs: f64,
    #[serde(default = "default_fast_delay_min")]
    pub fast_delay_min_secs: f64,
    #[serde(default = "default_fast_delay_max")]
    pub fast_delay_max_secs: f64,
    #[serde(default = "default_monitor_min")]
    pub monitor_min_secs: f64,
    #[serde(default = "default_monitor_max")]
    pub monitor_max_secs: f64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_secs: u64,
    /// Client heartbeat on the feed socket; 0 disables it.
    #[serde(default = "default_feed_heartbeat")]
    pub feed_heartbeat_secs: u64,
    /// How long shutdown waits for in-flight claims before aborting them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Drop a scheduled claim if the monitor paused the bot while it waited.
    #[serde(default)]
    pub recheck_eligibility: bool,
}

fn default_max_age() -> f64 {
    20.0
}

fn default_min_lock_age() -> f64 {
    0.2
}

fn default_hesitation_probability() -> f64 {
    0.10
}

fn default_hesitation_secs() -> f64 {
    2.0
}

fn default_fast_delay_min() -> f64 {
    0.2
}

fn default_fast_delay_max() -> f64 {
    0.5
}

fn default_monitor_min() -> f64 {
    60.0
}

fn default_monitor_max() -> f64 {
    90.0
}

fn default_request_timeout() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    2
}

fn default_max_reconnect_delay() -> u64 {
    30
}

fn default_feed_heartbeat() -> u64 {
    20
}

fn default_shutdown_grace() -> u64 {
    3
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age(),
            min_lock_age_secs: default_min_lock_age(),
            hesitation_probability: default_hesitation_probability(),
            hesitation_secs: default_hesitation_secs(),
            fast_delay_min_secs: default_fast_delay_min(),
            fast_delay_max_secs: default_fast_delay_max(),
            monitor_min_secs: default_monitor_min(),
            monitor_max_secs: default_monitor_max(),
            request_timeout_secs: default_request_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_delay_secs: default_max_reconnect_delay(),
            feed_heartbeat_secs: default_feed_heartbeat(),
            shutdown_grace_secs: default_shutdown_grace(),
            recheck_eligibility: false,
        }
    }
}

impl SettingsConfig {
    pub fn human_delay(&self) -> HumanDelayConfig {
        HumanDelayConfig {
            hesitation_probability: self.hesitation_probability,
            hesitation_secs: self.hesitation_secs,
            fast_min_secs: self.fast_delay_min_secs,
            fast_max_secs: self.fast_delay_max_secs,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }

    pub fn feed_heartbeat(&self) -> Option<Duration> {
        (self.feed_heartbeat_secs > 0).then(|| Duration::from_secs(self.feed_heartbeat_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Browser used for the manual login step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Browser binary. When unset, `login` skips launching a browser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<PathBuf>,
    #[serde(default)]
    pub headless: bool,
    #[serde(default = "default_website_url")]
    pub website_url: String,
}

fn default_website_url() -> String {
    WEBSITE_URL.to_string()
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: false,
            website_url: default_website_url(),
        }
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Write config to the given TOML file path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Reject settings that would make the race loop misbehave.
    pub fn validate(&self) -> Result<()> {
        let s = &self.settings;
        for (name, value) in [
            ("max_age_secs", s.max_age_secs),
            ("min_lock_age_secs", s.min_lock_age_secs),
            ("hesitation_probability", s.hesitation_probability),
            ("hesitation_secs", s.hesitation_secs),
            ("fast_delay_min_secs", s.fast_delay_min_secs),
            ("fast_delay_max_secs", s.fast_delay_max_secs),
            ("monitor_min_secs", s.monitor_min_secs),
            ("monitor_max_secs", s.monitor_max_secs),
        ] {
            if !value.is_finite() {
                bail!("settings.{name} must be a finite number, got {value}");
            }
        }
        if s.max_age_secs <= 0.0 {
            bail!("settings.max_age_secs must be positive");
        }
        if s.min_lock_age_secs < 0.0 {
            bail!("settings.min_lock_age_secs must not be negative");
        }
        if !(0.0..=1.0).contains(&s.hesitation_probability) {
            bail!("settings.hesitation_probability must be between 0 and 1");
        }
        if s.hesitation_secs < 0.0 {
            bail!("settings.hesitation_secs must not be negative");
        }
        if s.fast_delay_min_secs < 0.0 || s.fast_delay_max_secs < s.fast_delay_min_secs {
            bail!("settings.fast_delay_* must satisfy 0 <= min <= max");
        }
        if s.monitor_min_secs <= 0.0 || s.monitor_max_secs < s.monitor_min_secs {
            bail!("settings.monitor_* must satisfy 0 < min <= max");
        }
        if s.request_timeout_secs == 0 {
            bail!("settings.request_timeout_secs must be positive");
        }
        if s.reconnect_delay_secs == 0 || s.max_reconnect_delay_secs < s.reconnect_delay_secs {
            bail!("settings.*reconnect_delay_secs must satisfy 0 < base <= max");
        }
        Ok(())
    }

    /// Session cookie from the environment, falling back to the config file.
    pub fn resolve_cookie(&self, env_value: Option<String>) -> Result<String> {
        env_value
            .filter(|c| !c.trim().is_empty())
            .or_else(|| self.session.cookie.clone().filter(|c| !c.trim().is_empty()))
            .map(|c| c.trim().to_string())
            .context("no session cookie: set session.cookie in config.toml or AUTOLOCK_SESSION_COOKIE (run `login` first)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.settings.max_age_secs, 20.0);
        assert_eq!(config.settings.min_lock_age_secs, 0.2);
        assert_eq!(config.settings.hesitation_probability, 0.10);
        assert_eq!(config.settings.request_timeout_secs, 10);
        assert!(!config.settings.recheck_eligibility);
        assert_eq!(config.settings.feed_heartbeat(), Some(Duration::from_secs(20)));
        assert_eq!(config.session.project_id, PROJECT_ID);
        assert_eq!(config.endpoints.claim_url, CLAIM_URL);
        assert!(config.session.cookie.is_none());
        assert!(!config.browser.headless);
        config.validate().unwrap();
    }

    #[test]
    fn partial_settings_keep_other_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [session]
            cookie = "a_session=abc"

            [settings]
            max_age_secs = 15.0
            recheck_eligibility = true
            "#,
        )
        .unwrap();
        assert_eq!(config.session.cookie.as_deref(), Some("a_session=abc"));
        assert_eq!(config.settings.max_age_secs, 15.0);
        assert_eq!(config.settings.monitor_max_secs, 90.0);
        assert!(config.settings.recheck_eligibility);
    }

    #[test]
    fn validate_rejects_bad_probability() {
        let mut config = AppConfig::default();
        config.settings.hesitation_probability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_monitor_range() {
        let mut config = AppConfig::default();
        config.settings.monitor_min_secs = 90.0;
        config.settings.monitor_max_secs = 60.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_finite() {
        for toml_value in ["nan", "inf", "-inf"] {
            for field in ["max_age_secs", "monitor_min_secs", "fast_delay_max_secs"] {
                let config: AppConfig =
                    toml::from_str(&format!("[settings]\n{field} = {toml_value}\n")).unwrap();
                let err = config.validate().unwrap_err();
                assert!(err.to_string().contains(field), "{field} = {toml_value}: {err}");
            }
        }
        let mut config = AppConfig::default();
        config.settings.hesitation_secs = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn cookie_env_overrides_file() {
        let mut config = AppConfig::default();
        config.session.cookie = Some("from-file".into());
        assert_eq!(
            config.resolve_cookie(Some("from-env".into())).unwrap(),
            "from-env"
        );
        assert_eq!(config.resolve_cookie(Some("  ".into())).unwrap(), "from-file");
        config.session.cookie = None;
        assert!(config.resolve_cookie(None).is_err());
    }

    #[test]
    fn save_then_load_keeps_cookie() {
        let path = std::env::temp_dir().join(format!(
            "autolock-config-{}.toml",
            rand::random::<u64>()
        ));
        let mut config = AppConfig::default();
        config.session.cookie = Some("a_session=xyz".into());
        config.save(&path).unwrap();
        let loaded = AppConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.session.cookie.as_deref(), Some("a_session=xyz"));
        assert_eq!(loaded.endpoints.feed_url, FEED_WS_URL);
    }
}
