//! REST-hook channel: HTTP POST of the serialized bundle to the endpoint.

use async_trait::async_trait;
use reqwest::Client;

use super::DeliveryChannel;
use crate::types::{ChannelConfig, DeliveryOutcome};

pub struct RestHookChannel {
    client: Client,
}

impl RestHookChannel {
    pub fn new() -> Self {
        // Attempt timeouts are applied by the dispatcher per subscription;
        // the client only bounds connection establishment.
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for RestHookChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryChannel for RestHookChannel {
    fn code(&self) -> &'static str {
        "rest-hook"
    }

    async fn deliver(
        &self,
        subscription_id: &str,
        channel: &ChannelConfig,
        payload: &[u8],
        content_type: &str,
    ) -> DeliveryOutcome {
        let Some(endpoint) = channel.endpoint.as_deref() else {
            return DeliveryOutcome::Fatal("rest-hook channel has no endpoint".into());
        };

        let mut request = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(payload.to_vec());

        for (key, value) in &channel.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    tracing::debug!(
                        subscription_id,
                        endpoint,
                        status,
                        "REST-hook delivery succeeded"
                    );
                    DeliveryOutcome::Ok {
                        http_status: Some(status),
                    }
                } else {
                    let body = response.text().await.unwrap_or_default();
                    let message = format!("HTTP {status}: {body}");
                    tracing::warn!(
                        subscription_id,
                        endpoint,
                        status,
                        "REST-hook delivery failed"
                    );
                    if retryable_status(status) {
                        DeliveryOutcome::Retryable(message)
                    } else {
                        DeliveryOutcome::Fatal(message)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    subscription_id,
                    endpoint,
                    error = %e,
                    "REST-hook delivery failed with transport error"
                );
                DeliveryOutcome::Retryable(e.to_string())
            }
        }
    }
}

/// HTTP statuses worth retrying; every other non-2xx is fatal.
fn retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn channel_to(endpoint: &str) -> ChannelConfig {
        let mut config = ChannelConfig::rest_hook(endpoint);
        config
            .headers
            .push(("X-Api-Key".to_string(), "secret".to_string()));
        config
    }

    #[test]
    fn test_retryable_status_classification() {
        for status in [408, 425, 429, 500, 502, 503, 504] {
            assert!(retryable_status(status), "{status} should be retryable");
        }
        for status in [400, 401, 403, 404, 410, 422] {
            assert!(!retryable_status(status), "{status} should be fatal");
        }
    }

    #[tokio::test]
    async fn test_delivers_payload_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/fhir+json"))
            .and(header("x-api-key", "secret"))
            .and(body_json_string(r#"{"resourceType":"Bundle"}"#))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let channel = RestHookChannel::new();
        let config = channel_to(&format!("{}/hook", server.uri()));
        let outcome = channel
            .deliver(
                "s1",
                &config,
                br#"{"resourceType":"Bundle"}"#,
                "application/fhir+json",
            )
            .await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::Ok {
                http_status: Some(200)
            }
        ));
    }

    #[tokio::test]
    async fn test_503_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let channel = RestHookChannel::new();
        let config = channel_to(&server.uri());
        let outcome = channel.deliver("s1", &config, b"{}", "application/json").await;
        assert!(matches!(outcome, DeliveryOutcome::Retryable(_)));
    }

    #[tokio::test]
    async fn test_404_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let channel = RestHookChannel::new();
        let config = channel_to(&server.uri());
        let outcome = channel.deliver("s1", &config, b"{}", "application/json").await;
        assert!(matches!(outcome, DeliveryOutcome::Fatal(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let channel = RestHookChannel::new();
        // Reserved port with nothing listening.
        let config = channel_to("http://127.0.0.1:1/hook");
        let outcome = channel.deliver("s1", &config, b"{}", "application/json").await;
        assert!(matches!(outcome, DeliveryOutcome::Retryable(_)));
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_fatal() {
        let channel = RestHookChannel::new();
        let mut config = ChannelConfig::rest_hook("x");
        config.endpoint = None;
        let outcome = channel.deliver("s1", &config, b"{}", "application/json").await;
        assert!(matches!(outcome, DeliveryOutcome::Fatal(_)));
    }
}
