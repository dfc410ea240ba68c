//! Pinning-service publisher.
//!
//! POSTs `{"content": <payload>}` to the configured endpoint with an
//! optional bearer token. The service answers with the content address
//! under `cid` (generic pinning APIs) or `IpfsHash` (Pinata-style APIs).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{parse_payload, ContentAddress, MetadataPublisher, PublishError};

#[derive(Debug, Deserialize)]
struct PinResponse {
    #[serde(default)]
    cid: Option<String>,
    #[serde(default, rename = "IpfsHash")]
    ipfs_hash: Option<String>,
}

/// Publisher backed by an HTTP pinning service.
pub struct HttpPinningPublisher {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpPinningPublisher {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PublishError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PublishError::Unavailable(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for HttpPinningPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPinningPublisher")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl MetadataPublisher for HttpPinningPublisher {
    async fn publish(&self, payload: &str) -> Result<ContentAddress, PublishError> {
        let document = parse_payload(payload)?;

        let mut request = self.http.post(&self.url).json(&json!({ "content": document }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(PublishError::Unavailable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected(format!("HTTP {status}: {body}")));
        }

        let body: PinResponse = response
            .json()
            .await
            .map_err(|e| PublishError::InvalidResponse(e.to_string()))?;
        let raw = body
            .cid
            .or(body.ipfs_hash)
            .ok_or_else(|| PublishError::InvalidResponse("no cid in response".into()))?;

        let address = ContentAddress::parse(&raw)?;
        debug!(content_address = %address, url = %self.url, "metadata pinned");
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_token() {
        let publisher = HttpPinningPublisher::new(
            "http://127.0.0.1:5001/pins",
            Some("s3cret-token".into()),
            Duration::from_secs(1),
        )
        .unwrap();
        let rendered = format!("{publisher:?}");
        assert!(!rendered.contains("s3cret-token"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn response_accepts_both_field_names() {
        let a: PinResponse = serde_json::from_str(r#"{"cid":"QmA"}"#).unwrap();
        let b: PinResponse = serde_json::from_str(r#"{"IpfsHash":"QmB","PinSize":10}"#).unwrap();
        assert_eq!(a.cid.as_deref(), Some("QmA"));
        assert_eq!(b.ipfs_hash.as_deref(), Some("QmB"));
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        let publisher =
            HttpPinningPublisher::new("http://127.0.0.1:9/pins", None, Duration::from_millis(500))
                .unwrap();
        assert!(matches!(
            publisher.publish(r#"{"name":"x"}"#).await,
            Err(PublishError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn invalid_payload_never_hits_the_network() {
        let publisher =
            HttpPinningPublisher::new("http://127.0.0.1:9/pins", None, Duration::from_millis(500))
                .unwrap();
        assert!(matches!(
            publisher.publish("nope").await,
            Err(PublishError::InvalidPayload(_))
        ));
    }
}
