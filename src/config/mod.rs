use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Scraper configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    /// Search-results URL to start paginating from.
    #[serde(default)]
    pub search_url: String,

    /// Site root that relative detail and pagination links resolve against.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default)]
    pub jitter_ms: u64,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_accept_language")]
    pub accept_language: String,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Notification channel configuration. A channel is enabled when its
/// credentials are present.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub line_channel_access_token: Option<String>,

    #[serde(default)]
    pub line_user_id: Option<String>,

    #[serde(default = "default_line_api_url")]
    pub line_api_url: String,

    #[serde(default)]
    pub slack_webhook_url: Option<String>,

    #[serde(default)]
    pub email_enabled: bool,

    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,

    /// STARTTLS submission port.
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub smtp_username: Option<String>,

    #[serde(default)]
    pub smtp_password: Option<String>,

    #[serde(default)]
    pub email_from: Option<String>,

    /// Comma-separated recipient addresses.
    #[serde(default)]
    pub email_to: Option<String>,

    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("search URL is not set (SUUMO_SEARCH_URL or scraper.search_url)")]
    MissingSearchUrl,

    #[error("no notification channel configured: set LINE (token + user id), a Slack webhook URL or email_enabled with SMTP settings")]
    NoChannel,

    #[error("LINE channel access token is set but the LINE user id is missing")]
    IncompleteLine,

    #[error("email is enabled but these settings are missing: {}", missing.join(", "))]
    IncompleteEmail { missing: Vec<&'static str> },

    #[error("max_pages must be at least 1")]
    ZeroPages,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://suumo.jp".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_request_delay_ms() -> u64 {
    3000
}
fn default_max_pages() -> u32 {
    10
}
fn default_rate_limit_cooldown_secs() -> u64 {
    60
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
        .to_string()
}
fn default_accept_language() -> String {
    "ja,en;q=0.9".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/suumo.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_line_api_url() -> String {
    "https://api.line.me/v2/bot/message/push".to_string()
}
fn default_smtp_host() -> String {
    "smtp.gmail.com".to_string()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_notify_timeout_secs() -> u64 {
    15
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            search_url: String::new(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
            jitter_ms: 0,
            max_pages: default_max_pages(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            user_agent: default_user_agent(),
            accept_language: default_accept_language(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            line_channel_access_token: None,
            line_user_id: None,
            line_api_url: default_line_api_url(),
            slack_webhook_url: None,
            email_enabled: false,
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            email_from: None,
            email_to: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("SUUMO").separator("__"))
            .set_override_option("scraper.search_url", non_empty_env("SUUMO_SEARCH_URL"))?
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize()?;
        Ok(app_cfg)
    }

    /// Preconditions checked before a run starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scraper.search_url.trim().is_empty() {
            return Err(ConfigError::MissingSearchUrl);
        }
        if self.scraper.max_pages == 0 {
            return Err(ConfigError::ZeroPages);
        }

        let n = &self.notify;
        if n.line_token().is_some() && n.line_user().is_none() {
            return Err(ConfigError::IncompleteLine);
        }
        if n.email_enabled {
            let missing = n.missing_email_settings();
            if !missing.is_empty() {
                return Err(ConfigError::IncompleteEmail { missing });
            }
        }
        if !n.line_enabled() && n.slack_url().is_none() && !n.email_enabled {
            return Err(ConfigError::NoChannel);
        }
        Ok(())
    }
}

impl NotifyConfig {
    pub fn line_token(&self) -> Option<&str> {
        non_blank(self.line_channel_access_token.as_deref())
    }

    pub fn line_user(&self) -> Option<&str> {
        non_blank(self.line_user_id.as_deref())
    }

    pub fn line_enabled(&self) -> bool {
        self.line_token().is_some() && self.line_user().is_some()
    }

    pub fn slack_url(&self) -> Option<&str> {
        non_blank(self.slack_webhook_url.as_deref())
    }

    pub fn email_recipients(&self) -> Vec<&str> {
        self.email_to
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn missing_email_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if non_blank(self.smtp_username.as_deref()).is_none() {
            missing.push("smtp_username");
        }
        if non_blank(self.smtp_password.as_deref()).is_none() {
            missing.push("smtp_password");
        }
        if non_blank(self.email_from.as_deref()).is_none() {
            missing.push("email_from");
        }
        if self.email_recipients().is_empty() {
            missing.push("email_to");
        }
        missing
    }

    /// SMTP settings, when email is enabled and complete.
    pub fn email(&self) -> Option<EmailSettings<'_>> {
        if !self.email_enabled || !self.missing_email_settings().is_empty() {
            return None;
        }
        Some(EmailSettings {
            host: &self.smtp_host,
            port: self.smtp_port,
            username: non_blank(self.smtp_username.as_deref())?,
            password: non_blank(self.smtp_password.as_deref())?,
            from: non_blank(self.email_from.as_deref())?,
            to: self.email_recipients(),
        })
    }
}

pub struct EmailSettings<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub password: &'a str,
    pub from: &'a str,
    pub to: Vec<&'a str>,
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
