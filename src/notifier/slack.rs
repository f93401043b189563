//! Slack incoming-webhook channel.

use async_trait::async_trait;
use serde_json::json;

use super::{Channel, ChannelError, ChannelResult, error_text};
use crate::models::Listing;

pub struct SlackChannel {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackChannel {
    pub fn new(client: reqwest::Client, webhook_url: &str) -> Self {
        Self {
            client,
            webhook_url: webhook_url.to_string(),
        }
    }

    async fn post(&self, text: &str) -> ChannelResult<()> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ChannelError::Rejected { channel: "slack", status: resp.status() });
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send_listings(&self, listings: &[Listing]) -> ChannelResult<()> {
        if listings.is_empty() {
            return Ok(());
        }
        self.post(&listings_text(listings)).await
    }

    async fn send_error(&self, message: &str) -> ChannelResult<()> {
        self.post(&format!(":warning: {}", error_text(message))).await
    }
}

pub fn listings_text(listings: &[Listing]) -> String {
    std::iter::once(format!(":house: *SUUMO新着* {}件", listings.len()))
        .chain(listings.iter().map(|l| l.url.clone()))
        .collect::<Vec<_>>()
        .join("\n")
}
