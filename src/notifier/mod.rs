//! Delivery of new-listing and error notifications.
//!
//! Channel failures are logged and swallowed: a notification problem never
//! changes what the store records.

pub mod email;
pub mod line;
pub mod slack;

use crate::config::NotifyConfig;
use crate::models::Listing;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use self::email::EmailChannel;
use self::line::LineChannel;
use self::slack::SlackChannel;

pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{channel} rejected the message: HTTP {status}")]
    Rejected { channel: &'static str, status: reqwest::StatusCode },

    #[error("could not build mail: {0}")]
    Mail(#[from] lettre::error::Error),

    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// One delivery channel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_listings(&self, listings: &[Listing]) -> ChannelResult<()>;

    async fn send_error(&self, message: &str) -> ChannelResult<()>;
}

/// What the pipeline hands new listings and run failures to.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, listings: &[Listing]);
    async fn notify_error(&self, message: &str);
}

pub fn error_text(message: &str) -> String {
    format!("[SUUMO Monitor エラー]\n{}", message)
}

// ── Fan-out notifier ─────────────────────────────────────────────────────────

pub struct Notifier {
    channels: Vec<Box<dyn Channel>>,
}

impl Notifier {
    pub fn new(channels: Vec<Box<dyn Channel>>) -> Self {
        Self { channels }
    }

    /// Every channel whose credentials are configured.
    pub fn from_config(config: &NotifyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build notification HTTP client")?;

        let mut channels: Vec<Box<dyn Channel>> = Vec::new();
        if let (Some(token), Some(user)) = (config.line_token(), config.line_user()) {
            channels.push(Box::new(LineChannel::new(
                client.clone(),
                &config.line_api_url,
                token,
                user,
            )));
        }
        if let Some(url) = config.slack_url() {
            channels.push(Box::new(SlackChannel::new(client.clone(), url)));
        }
        if let Some(email) = config.email() {
            let timeout = Duration::from_secs(config.timeout_secs);
            channels.push(Box::new(EmailChannel::new(&email, timeout)?));
        }
        Ok(Self::new(channels))
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }
}

#[async_trait]
impl NotificationSink for Notifier {
    async fn notify(&self, listings: &[Listing]) {
        if listings.is_empty() {
            info!("No new listings, skipping notification");
            return;
        }
        for ch in &self.channels {
            match ch.send_listings(listings).await {
                Ok(()) => info!("{}: notified {} listings", ch.name(), listings.len()),
                Err(e) => error!("{}: notification failed: {}", ch.name(), e),
            }
        }
    }

    async fn notify_error(&self, message: &str) {
        for ch in &self.channels {
            if let Err(e) = ch.send_error(message).await {
                error!("{}: error report failed: {}", ch.name(), e);
            }
        }
    }
}
