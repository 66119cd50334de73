//! HTTP-backed resolution strategies built from configuration.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::{ResolutionStrategy, StrategyContext, StrategyOutput, StrategyTier};
use crate::classifier::RawError;
use crate::config::{StrategyConfig, StrategyKindConfig};
use crate::error::{LinkError, Result};
use crate::http::{error_for_response, header_map};

/// Placeholder replaced by the URL-encoded handle.
pub const HANDLE_PLACEHOLDER: &str = "{handle}";

fn render_url(template: &str, handle: &str) -> String {
    let handle = handle.trim().trim_start_matches('@');
    template.replace(HANDLE_PLACEHOLDER, &urlencoding::encode(handle))
}

/// Fetch a page and pull the room identifier out of it with a regex.
///
/// The identifier is the `id` named group, or the first capture group.
/// Any other named groups are returned as session metadata.
pub struct PageScrapeStrategy {
    name: String,
    tier: StrategyTier,
    enabled: bool,
    client: reqwest::Client,
    url_template: String,
    pattern: Regex,
    headers: HeaderMap,
}

impl PageScrapeStrategy {
    pub fn new(
        name: impl Into<String>,
        url_template: impl Into<String>,
        pattern: &str,
        client: reqwest::Client,
    ) -> Result<Self> {
        let name = name.into();
        let pattern = Regex::new(pattern)
            .map_err(|e| LinkError::config(format!("strategy '{}': invalid pattern: {}", name, e)))?;
        if pattern.captures_len() < 2 {
            return Err(LinkError::config(format!(
                "strategy '{}': pattern needs a capture group for the room identifier",
                name
            )));
        }
        Ok(Self {
            name,
            tier: StrategyTier::Fallback,
            enabled: true,
            client,
            url_template: url_template.into(),
            pattern,
            headers: HeaderMap::new(),
        })
    }

    pub fn with_tier(mut self, tier: StrategyTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub(crate) fn extract(&self, page: &str) -> std::result::Result<StrategyOutput, RawError> {
        let captures = self.pattern.captures(page).ok_or_else(|| {
            RawError::new(format!(
                "room identifier not found in page (pattern {})",
                self.pattern.as_str()
            ))
        })?;

        let identifier = captures
            .name("id")
            .or_else(|| captures.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let mut metadata = Map::new();
        for group in self.pattern.capture_names().flatten() {
            if group == "id" {
                continue;
            }
            if let Some(m) = captures.name(group) {
                metadata.insert(group.to_string(), Value::String(m.as_str().to_string()));
            }
        }

        let output = StrategyOutput::new(identifier);
        Ok(if metadata.is_empty() {
            output
        } else {
            output.with_metadata(Value::Object(metadata))
        })
    }
}

#[async_trait]
impl ResolutionStrategy for PageScrapeStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> StrategyTier {
        self.tier
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn resolve(&self, ctx: &StrategyContext) -> std::result::Result<StrategyOutput, RawError> {
        let url = render_url(&self.url_template, &ctx.handle);
        trace!(strategy = %self.name, url = %url, "Fetching room page");

        let mut request = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .timeout(ctx.timeout);
        // A credential for a page scrape is a session cookie.
        if let Some(cookie) = ctx.credential.as_deref() {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        let page = response.text().await?;
        self.extract(&page)
    }
}

/// Where an API key goes on the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyPlacement {
    Header(HeaderName),
    Query(String),
}

/// Call a JSON API and read the identifier from a JSON pointer.
///
/// The whole response body becomes the session metadata, which is where the
/// stream start time usually lives.
pub struct JsonApiStrategy {
    name: String,
    tier: StrategyTier,
    enabled: bool,
    client: reqwest::Client,
    url_template: String,
    identifier_pointer: String,
    headers: HeaderMap,
    api_key: Option<String>,
    api_key_placement: Option<ApiKeyPlacement>,
    require_api_key: bool,
}

impl JsonApiStrategy {
    pub fn new(
        name: impl Into<String>,
        url_template: impl Into<String>,
        identifier_pointer: impl Into<String>,
        client: reqwest::Client,
    ) -> Result<Self> {
        let name = name.into();
        let identifier_pointer = identifier_pointer.into();
        if !identifier_pointer.is_empty() && !identifier_pointer.starts_with('/') {
            return Err(LinkError::config(format!(
                "strategy '{}': identifier pointer must start with '/'",
                name
            )));
        }
        Ok(Self {
            name,
            tier: StrategyTier::Primary,
            enabled: true,
            client,
            url_template: url_template.into(),
            identifier_pointer,
            headers: HeaderMap::new(),
            api_key: None,
            api_key_placement: None,
            require_api_key: false,
        })
    }

    pub fn with_tier(mut self, tier: StrategyTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Send an API key with every request. With `required`, the strategy is
    /// skipped unless a key is configured or supplied at connect time.
    pub fn with_api_key(
        mut self,
        key: Option<String>,
        placement: ApiKeyPlacement,
        required: bool,
    ) -> Self {
        self.api_key = key.filter(|k| !k.is_empty());
        self.api_key_placement = Some(placement);
        self.require_api_key = required;
        self
    }

    pub(crate) fn extract(&self, body: Value) -> std::result::Result<StrategyOutput, RawError> {
        let identifier = match body.pointer(&self.identifier_pointer) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(RawError::new(format!(
                    "invalid type at {}: expected string or number, got {}",
                    self.identifier_pointer, other
                )));
            }
            None => {
                // Vendors often answer 200 with an error payload.
                let vendor = ["/error", "/message", "/msg", "/status_msg"]
                    .iter()
                    .find_map(|p| body.pointer(p).and_then(Value::as_str))
                    .unwrap_or("");
                return Err(RawError::new(format!(
                    "missing field {} in response {}",
                    self.identifier_pointer, vendor
                )));
            }
        };
        Ok(StrategyOutput::new(identifier).with_metadata(body))
    }
}

#[async_trait]
impl ResolutionStrategy for JsonApiStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> StrategyTier {
        self.tier
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn missing_credential(&self) -> bool {
        self.require_api_key && self.api_key.is_none()
    }

    async fn resolve(&self, ctx: &StrategyContext) -> std::result::Result<StrategyOutput, RawError> {
        let url = render_url(&self.url_template, &ctx.handle);
        let mut request = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .timeout(ctx.timeout);

        let key = ctx.credential.as_deref().or(self.api_key.as_deref());
        match (&self.api_key_placement, key) {
            (Some(ApiKeyPlacement::Header(header)), Some(key)) => {
                let value = HeaderValue::from_str(key)
                    .map_err(|_| RawError::new("invalid api key: not a valid header value"))?;
                request = request.header(header.clone(), value);
            }
            (Some(ApiKeyPlacement::Query(param)), Some(key)) => {
                request = request.query(&[(param.as_str(), key)]);
            }
            _ => {}
        }

        debug!(strategy = %self.name, url = %url, attempt = ctx.attempt, "Calling room API");
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        let body: Value = response.json().await?;
        self.extract(body)
    }
}

/// Instantiate the configured strategies, in configuration order.
pub fn build_strategies(
    configs: &[StrategyConfig],
    client: &reqwest::Client,
) -> Result<Vec<Arc<dyn ResolutionStrategy>>> {
    let mut strategies: Vec<Arc<dyn ResolutionStrategy>> = Vec::with_capacity(configs.len());
    for config in configs {
        let headers = header_map(config.headers.iter())?;
        match &config.kind {
            StrategyKindConfig::PageScrape {
                url_template,
                pattern,
            } => {
                let mut strategy =
                    PageScrapeStrategy::new(&config.name, url_template, pattern, client.clone())?
                        .with_headers(headers)
                        .with_enabled(config.enabled);
                if let Some(tier) = config.tier {
                    strategy = strategy.with_tier(tier);
                }
                strategies.push(Arc::new(strategy));
            }
            StrategyKindConfig::JsonApi {
                url_template,
                identifier_pointer,
                api_key_header,
                api_key_query,
                require_api_key,
            } => {
                let mut strategy = JsonApiStrategy::new(
                    &config.name,
                    url_template,
                    identifier_pointer,
                    client.clone(),
                )?
                .with_headers(headers)
                .with_enabled(config.enabled);
                if let Some(tier) = config.tier {
                    strategy = strategy.with_tier(tier);
                }

                let placement = match (api_key_header, api_key_query) {
                    (Some(header), _) => Some(ApiKeyPlacement::Header(
                        HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
                            LinkError::config(format!(
                                "strategy '{}': invalid api key header: {}",
                                config.name, e
                            ))
                        })?,
                    )),
                    (None, Some(param)) => Some(ApiKeyPlacement::Query(param.clone())),
                    (None, None) => None,
                };
                if let Some(placement) = placement {
                    strategy =
                        strategy.with_api_key(config.api_key.clone(), placement, *require_api_key);
                }
                strategies.push(Arc::new(strategy));
            }
        }
    }
    Ok(strategies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ErrorKind, classify};
    use serde_json::json;

    fn client() -> reqwest::Client {
        crate::http::install_rustls_provider();
        reqwest::Client::new()
    }

    #[test]
    fn test_render_url_encodes_handle() {
        assert_eq!(
            render_url("https://example.com/@{handle}/live", "@alice b"),
            "https://example.com/@alice%20b/live"
        );
    }

    #[test]
    fn test_page_scrape_extracts_identifier_and_metadata() {
        let strategy = PageScrapeStrategy::new(
            "page",
            "https://example.com/{handle}",
            r#""roomId":"(?P<id>\d+)".*?"createTime":(?P<create_time>\d+)"#,
            client(),
        )
        .unwrap();

        let page = r#"<script>{"roomId":"7312","title":"hi","createTime":1718000000}</script>"#;
        let output = strategy.extract(page).unwrap();
        assert_eq!(output.identifier, "7312");
        assert_eq!(output.metadata, json!({"create_time": "1718000000"}));
    }

    #[test]
    fn test_page_scrape_missing_match_is_parse_failure() {
        let strategy =
            PageScrapeStrategy::new("page", "https://x/{handle}", r#"room_id=(\d+)"#, client())
                .unwrap();
        let err = strategy.extract("<html>nothing here</html>").unwrap_err();
        assert_eq!(classify(&err).kind, ErrorKind::ParseFailure);
    }

    #[test]
    fn test_page_scrape_requires_capture_group() {
        assert!(PageScrapeStrategy::new("page", "https://x", r"room_id=\d+", client()).is_err());
        assert!(PageScrapeStrategy::new("page", "https://x", r"(", client()).is_err());
    }

    #[test]
    fn test_json_api_extracts_identifier() {
        let strategy =
            JsonApiStrategy::new("api", "https://x/{handle}", "/data/room_id", client()).unwrap();
        let body = json!({"data": {"room_id": 991, "start_time": 1718000000}});
        let output = strategy.extract(body.clone()).unwrap();
        assert_eq!(output.identifier, "991");
        assert_eq!(output.metadata, body);
    }

    #[test]
    fn test_json_api_vendor_error_is_classified() {
        let strategy =
            JsonApiStrategy::new("api", "https://x/{handle}", "/data/room_id", client()).unwrap();
        let err = strategy
            .extract(json!({"error": "Rate limit exceeded, slow down"}))
            .unwrap_err();
        assert_eq!(classify(&err).kind, ErrorKind::RateLimited);

        let err = strategy.extract(json!({"data": {}})).unwrap_err();
        assert_eq!(classify(&err).kind, ErrorKind::ParseFailure);
    }

    #[test]
    fn test_required_api_key_controls_enablement() {
        let base =
            || JsonApiStrategy::new("api", "https://x/{handle}", "/id", client()).unwrap();
        let header = ApiKeyPlacement::Header(HeaderName::from_static("x-api-key"));

        assert!(base().with_api_key(None, header.clone(), true).missing_credential());
        assert!(
            !base()
                .with_api_key(Some("k".into()), header.clone(), true)
                .missing_credential()
        );
        assert!(!base().with_api_key(None, header, false).missing_credential());
        assert!(!base().with_enabled(false).is_enabled());
    }

    #[test]
    fn test_build_strategies_from_config() {
        let configs: Vec<StrategyConfig> = serde_json::from_value(json!([
            {
                "name": "signed-api",
                "type": "json_api",
                "tier": "authoritative",
                "url_template": "https://api.example.com/room?user={handle}",
                "identifier_pointer": "/data/room_id",
                "api_key_header": "x-api-key",
                "require_api_key": true
            },
            {
                "name": "page",
                "type": "page_scrape",
                "url_template": "https://example.com/@{handle}/live",
                "pattern": "room_id=(\\d+)"
            }
        ]))
        .unwrap();

        let strategies = build_strategies(&configs, &client()).unwrap();
        assert_eq!(strategies.len(), 2);
        assert_eq!(strategies[0].tier(), StrategyTier::Authoritative);
        assert!(strategies[0].missing_credential(), "no api key configured");
        assert_eq!(strategies[1].tier(), StrategyTier::Fallback);
    }
}
