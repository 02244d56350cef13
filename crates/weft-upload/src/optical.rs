//! Optical bridge hand-off.
//!
//! The bridge pre-ingests item metadata so reads are serviceable before
//! the bundle confirms. Delivery is strictly best-effort: capped
//! retries, failures logged, the pipeline never waits on it.

use serde::Serialize;
use std::time::Duration;
use weft::WeftError;

const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// The metadata envelope the bridge ingests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemEnvelope {
    pub id: String,
    pub owner: String,
    pub signature_kind: String,
    pub byte_count: u64,
    pub uploaded_at: i64,
}

/// Validate that all bridge URLs use HTTPS and do not target private
/// IPs. Bridge URLs are operator-supplied config; a URL pointed at an
/// internal service is an SSRF hazard.
pub fn validate_bridge_urls(urls: &[String]) {
    for url_str in urls {
        if !url_str.starts_with("https://") {
            tracing::warn!(
                url = %url_str,
                "optical bridge URL does not use HTTPS — envelopes will be sent in cleartext"
            );
        }

        // Check for private/loopback IPs in bridge URLs
        if let Ok(parsed) = url::Url::parse(url_str) {
            match parsed.host() {
                Some(url::Host::Ipv4(ip)) => {
                    if ip.is_loopback()
                        || ip.is_private()
                        || ip.is_link_local()
                        || ip.is_unspecified()
                    {
                        tracing::warn!(
                            url = %url_str,
                            "optical bridge URL targets a private/loopback IP — potential SSRF risk"
                        );
                    }
                }
                Some(url::Host::Domain(domain)) => {
                    let d = domain.to_lowercase();
                    if d == "localhost" || d.ends_with(".local") || d.ends_with(".internal") {
                        tracing::warn!(
                            url = %url_str,
                            "optical bridge URL targets localhost/local domain — potential SSRF risk"
                        );
                    }
                }
                _ => {}
            }
        }
    }
}

pub struct OpticalBridge {
    client: reqwest::Client,
    urls: Vec<String>,
    admin_key: Option<String>,
}

impl OpticalBridge {
    pub fn new(urls: Vec<String>, admin_key: Option<String>) -> Self {
        if !urls.is_empty() {
            validate_bridge_urls(&urls);
        }
        Self {
            client: reqwest::Client::new(),
            urls,
            admin_key,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.urls.is_empty()
    }

    /// POST the envelope to every configured bridge. Always returns the
    /// count of bridges that acknowledged; a zero is logged, not raised.
    pub async fn post_item(&self, envelope: &ItemEnvelope) -> usize {
        let mut delivered = 0;
        for url in &self.urls {
            if self.post_one(url, envelope).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn post_one(&self, base_url: &str, envelope: &ItemEnvelope) -> bool {
        let url = format!("{}/queue-data-item", base_url.trim_end_matches('/'));
        let mut backoff = weft::backoff::backoff_iter(500, 5_000);

        for attempt in 1..=MAX_ATTEMPTS {
            let mut req = self
                .client
                .post(&url)
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .json(envelope);
            if let Some(key) = &self.admin_key {
                req = req.header("Authorization", format!("Bearer {key}"));
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(item = %envelope.id, bridge = %url, "optical hand-off delivered");
                    return true;
                }
                Ok(resp) => {
                    tracing::warn!(
                        item = %envelope.id,
                        bridge = %url,
                        status = %resp.status(),
                        attempt,
                        "optical bridge rejected hand-off"
                    );
                }
                Err(e) => {
                    let err = WeftError::from_transport("optical bridge", &e);
                    tracing::warn!(
                        item = %envelope.id,
                        bridge = %url,
                        attempt,
                        error = %err,
                        "optical hand-off failed"
                    );
                }
            }
            if attempt < MAX_ATTEMPTS {
                if let Some(delay) = backoff.next() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
        false
    }
}
