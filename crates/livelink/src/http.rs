use std::sync::OnceLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use tracing::debug;

use crate::classifier::RawError;
use crate::error::{LinkError, Result};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Longest response body excerpt carried in a raw error.
const MAX_BODY_EXCERPT: usize = 512;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate may have installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the HTTP client shared by the resolution strategies.
pub fn build_client(user_agent: &str, request_timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder().user_agent(user_agent);
    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }
    builder
        .build()
        .map_err(|e| LinkError::config(format!("failed to build HTTP client: {}", e)))
}

/// Convert header pairs from configuration into a `HeaderMap`.
pub fn header_map<'a, I>(headers: I) -> Result<HeaderMap>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| LinkError::config(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| LinkError::config(format!("invalid value for header '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Parse a `Retry-After` header given either as seconds or as an HTTP date.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

/// Turn a non-success response into a raw error, keeping the status, the
/// retry-after hint and the start of the body (vendor error text).
pub async fn error_for_response(response: reqwest::Response) -> RawError {
    let status = response.status();
    let hint = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(MAX_BODY_EXCERPT).collect();

    let reason = status.canonical_reason().unwrap_or("unexpected status");
    let message = if excerpt.trim().is_empty() {
        reason.to_string()
    } else {
        format!("{}: {}", reason, excerpt.trim())
    };

    let raw = RawError::http_status(status.as_u16(), message);
    match hint {
        Some(hint) => raw.with_retry_after(hint),
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("42"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(42)));
    }

    #[test]
    fn test_retry_after_date_in_past_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_header_map_rejects_bad_names() {
        let good = [("X-Token".to_string(), "abc".to_string())];
        assert_eq!(header_map(good.iter().map(|(k, v)| (k, v))).unwrap().len(), 1);

        let bad = [("bad header".to_string(), "abc".to_string())];
        assert!(header_map(bad.iter().map(|(k, v)| (k, v))).is_err());
    }
}
