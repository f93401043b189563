use crate::config::ScraperConfig;
use anyhow::{Context, Result};
use encoding_rs::{Encoding, SHIFT_JIS, UTF_8};
use regex::bytes::Regex;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::RetryIf;
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, warn};

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

// <meta charset="..."> or <meta http-equiv=... content="text/html; charset=...">
static META_CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i-u)<meta[^>]+charset\s*=\s*["']?([A-Za-z0-9_\-]+)"#).unwrap());

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("rate limited (429) at {url}")]
    RateLimited { url: String },

    #[error("HTTP {status} at {url}")]
    Status { url: String, status: StatusCode },
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }
}

pub struct HttpClient {
    inner: reqwest::Client,
    rate_limit_cooldown: Duration,
}

impl HttpClient {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language).context("Invalid Accept-Language")?,
        );

        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            rate_limit_cooldown: Duration::from_secs(config.rate_limit_cooldown_secs),
        })
    }

    #[cfg(test)]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }

    /// Fetch a URL as text. A 429 is retried exactly once after the cooldown;
    /// every other failure is returned as-is.
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let strategy = FixedInterval::new(self.rate_limit_cooldown).take(1);

        RetryIf::spawn(
            strategy,
            || self.get_once(url),
            |e: &FetchError| {
                if e.is_rate_limited() {
                    warn!("Rate limited (429), retrying once in {:?}", self.rate_limit_cooldown);
                    true
                } else {
                    false
                }
            },
        )
        .await
    }

    async fn get_once(&self, url: &str) -> Result<String, FetchError> {
        debug!("GET {}", url);

        let resp = self
            .inner
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Transport { url: url.to_string(), source })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited { url: url.to_string() });
        }
        if !status.is_success() {
            return Err(FetchError::Status { url: url.to_string(), status });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default();
        let bytes = resp
            .bytes()
            .await
            .map_err(|source| FetchError::Transport { url: url.to_string(), source })?;

        Ok(decode_body(&bytes, &content_type))
    }
}

/// Decode an HTML body. Charset from the Content-Type header, then from a
/// `<meta>` tag in the first 1 KiB, then UTF-8. Undeclared bytes that are not
/// valid UTF-8 are read as Shift_JIS.
pub fn decode_body(bytes: &[u8], content_type: &str) -> String {
    let declared = charset_label(content_type.as_bytes())
        .or_else(|| META_CHARSET.captures(&bytes[..bytes.len().min(1024)]).map(|c| c[1].to_vec()))
        .and_then(|label| Encoding::for_label(&label));

    if let Some(encoding) = declared {
        let (text, _, had_errors) = encoding.decode(bytes);
        if had_errors {
            warn!("Body has bytes invalid in declared charset {}", encoding.name());
        }
        return text.into_owned();
    }

    match UTF_8.decode_without_bom_handling_and_without_replacement(bytes) {
        Some(text) => text.into_owned(),
        None => {
            debug!("Body is not UTF-8 and declares no charset, reading as Shift_JIS");
            SHIFT_JIS.decode(bytes).0.into_owned()
        }
    }
}

fn charset_label(content_type: &[u8]) -> Option<Vec<u8>> {
    let lower = content_type.to_ascii_lowercase();
    let at = lower.windows(8).position(|w| w == b"charset=")?;
    let label: Vec<u8> = lower[at + 8..]
        .iter()
        .copied()
        .skip_while(|b| *b == b'"')
        .take_while(|b| !matches!(b, b';' | b'"' | b' '))
        .collect();
    (!label.is_empty()).then_some(label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::new(&ScraperConfig::default())
            .unwrap()
            .with_cooldown(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_fetch_success_sends_browser_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/results"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>物件</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let body = assert_ok!(client().get_text(&format!("{}/results", server.uri())).await);
        assert!(body.contains("物件"));

        let requests = server.received_requests().await.unwrap();
        let headers = &requests[0].headers;
        let ua = headers.get("user-agent").unwrap().to_str().unwrap();
        assert!(ua.starts_with("Mozilla/5.0"));
        let lang = headers.get("accept-language").unwrap().to_str().unwrap();
        assert_eq!(lang, "ja,en;q=0.9");
    }

    #[test]
    fn test_decode_body_charset_sources() {
        let (sjis, _, _) = SHIFT_JIS.encode("中野区 1LDK");

        assert_eq!(decode_body(&sjis, "text/html; charset=Shift_JIS"), "中野区 1LDK");
        assert_eq!(decode_body("中野区".as_bytes(), "text/html; charset=\"utf-8\""), "中野区");

        let mut page = br#"<html><head><meta charset="shift_jis"></head><body>"#.to_vec();
        page.extend_from_slice(&sjis);
        assert!(decode_body(&page, "text/html").ends_with("中野区 1LDK"));

        // undeclared: valid UTF-8 stays UTF-8, anything else is read as Shift_JIS
        assert_eq!(decode_body("物件".as_bytes(), ""), "物件");
        assert_eq!(decode_body(&sjis, ""), "中野区 1LDK");
    }

    #[tokio::test]
    async fn test_shift_jis_page_is_decoded() {
        let server = MockServer::start().await;
        let (body, _, _) = SHIFT_JIS.encode("<html>賃貸</html>");
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body.into_owned(), "text/html; charset=Shift_JIS"),
            )
            .mount(&server)
            .await;

        let text = assert_ok!(client().get_text(&format!("{}/results", server.uri())).await);
        assert_eq!(text, "<html>賃貸</html>");
    }

    #[tokio::test]
    async fn test_rate_limit_retried_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/results"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/results"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let body = assert_ok!(client().get_text(&format!("{}/results", server.uri())).await);
        assert_eq!(body, "ok");
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_second_rate_limit_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(2)
            .mount(&server)
            .await;

        let err = assert_err!(client().get_text(&format!("{}/results", server.uri())).await);
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn test_server_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let err = assert_err!(client().get_text(&format!("{}/results", server.uri())).await);
        assert!(matches!(err, FetchError::Status { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE));
    }
}
