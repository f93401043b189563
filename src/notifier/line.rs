//! LINE Messaging API push channel.

use async_trait::async_trait;
use serde_json::json;

use super::{Channel, ChannelError, ChannelResult, error_text};
use crate::models::Listing;

/// Per-message limit of the push API, in characters.
pub const LINE_MAX_MSG_LEN: usize = 5000;

pub struct LineChannel {
    client: reqwest::Client,
    api_url: String,
    token: String,
    user_id: String,
}

impl LineChannel {
    pub fn new(client: reqwest::Client, api_url: &str, token: &str, user_id: &str) -> Self {
        Self {
            client,
            api_url: api_url.to_string(),
            token: token.to_string(),
            user_id: user_id.to_string(),
        }
    }

    async fn push(&self, text: &str) -> ChannelResult<()> {
        let payload = json!({
            "to": self.user_id,
            "messages": [{ "type": "text", "text": truncate(text) }],
        });

        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ChannelError::Rejected { channel: "line", status: resp.status() });
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for LineChannel {
    fn name(&self) -> &'static str {
        "line"
    }

    /// Sends every chunk even if an earlier one failed; reports the first error.
    async fn send_listings(&self, listings: &[Listing]) -> ChannelResult<()> {
        let mut first_err = None;
        for chunk in chunk_messages(listings) {
            if let Err(e) = self.push(&chunk).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn send_error(&self, message: &str) -> ChannelResult<()> {
        self.push(&error_text(message)).await
    }
}

/// Header plus one URL per line, split so no message exceeds the limit.
pub fn chunk_messages(listings: &[Listing]) -> Vec<String> {
    if listings.is_empty() {
        return vec![];
    }

    let mut chunks = Vec::new();
    let mut current = format!("【SUUMO新着】{}件\n", listings.len());
    let mut current_len = current.chars().count();

    for l in listings {
        let entry = format!("{}\n", l.url);
        let entry_len = entry.chars().count();
        if current_len + entry_len > LINE_MAX_MSG_LEN {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(&entry);
        current_len += entry_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= LINE_MAX_MSG_LEN {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(LINE_MAX_MSG_LEN - 3).collect();
    cut.push_str("...");
    cut
}
