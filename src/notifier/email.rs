//! SMTP e-mail channel: STARTTLS + login, multipart plain/HTML body.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::info;

use super::{Channel, ChannelResult, error_text};
use crate::config::EmailSettings;
use crate::models::Listing;

pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    addresses: Addresses,
}

impl EmailChannel {
    pub fn new(settings: &EmailSettings<'_>, timeout: Duration) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(settings.host)
            .with_context(|| format!("Invalid SMTP host {}", settings.host))?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.to_string(),
                settings.password.to_string(),
            ))
            .timeout(Some(timeout))
            .build();

        Ok(Self {
            transport,
            addresses: Addresses::parse(settings.from, &settings.to)?,
        })
    }

    async fn deliver(&self, message: Message) -> ChannelResult<()> {
        self.transport.send(message).await?;
        Ok(())
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send_listings(&self, listings: &[Listing]) -> ChannelResult<()> {
        if listings.is_empty() {
            return Ok(());
        }
        self.deliver(self.addresses.listings_message(listings)?).await?;
        info!("Mail sent to {} recipients", self.addresses.to.len());
        Ok(())
    }

    async fn send_error(&self, message: &str) -> ChannelResult<()> {
        self.deliver(self.addresses.error_message(message)?).await
    }
}

/// Sender and recipients, parsed once.
pub struct Addresses {
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl Addresses {
    pub fn parse(from: &str, to: &[&str]) -> Result<Self> {
        let from = from.parse().with_context(|| format!("Invalid sender address {}", from))?;
        let to = to
            .iter()
            .map(|addr| addr.parse().with_context(|| format!("Invalid recipient address {}", addr)))
            .collect::<Result<Vec<Mailbox>>>()?;
        Ok(Self { from, to })
    }

    fn builder(&self, subject: String) -> lettre::message::MessageBuilder {
        self.to
            .iter()
            .cloned()
            .fold(Message::builder().from(self.from.clone()), |b, to| b.to(to))
            .subject(subject)
    }

    pub fn listings_message(&self, listings: &[Listing]) -> ChannelResult<Message> {
        let message = self
            .builder(subject(listings.len()))
            .multipart(MultiPart::alternative_plain_html(plain_body(listings), html_body(listings)))?;
        Ok(message)
    }

    pub fn error_message(&self, message: &str) -> ChannelResult<Message> {
        let message = self
            .builder("[SUUMO] Monitor エラー".to_string())
            .singlepart(SinglePart::plain(error_text(message)))?;
        Ok(message)
    }
}

pub fn subject(count: usize) -> String {
    format!("[SUUMO] {}件の新着物件があります", count)
}

pub fn plain_body(listings: &[Listing]) -> String {
    let mut lines = vec![
        format!("SUUMO 新着物件通知 ({}件)", listings.len()),
        "=".repeat(40),
    ];
    lines.extend(listings.iter().map(|l| l.url.clone()));
    lines.join("\n")
}

pub fn html_body(listings: &[Listing]) -> String {
    let links: String = listings
        .iter()
        .map(|l| {
            let url = escape_html(&l.url);
            format!(r#"<li><a href="{url}">{url}</a></li>"#)
        })
        .collect();
    format!(
        "<html><body>\n<h2>SUUMO 新着物件通知 ({}件)</h2>\n<ul>{}</ul>\n</body></html>",
        listings.len(),
        links
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
