//! Partner API client implementation

use order_gateway_core::config::PartnerConfig;
use order_gateway_core::order::OrderId;
use order_gateway_core::partner::{PartnerClient, PartnerError, PartnerReceipt, PartnerResult};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Longest response body kept in a [`PartnerError::Status`].
pub const MAX_ERROR_BODY: usize = 512;

/// Partner states that mean "ask again later".
const PENDING_STATES: [&str; 3] = ["PENDING", "IN_PROGRESS", "PROCESSING"];

#[derive(Debug, Serialize)]
struct CreateRequestBody {
    #[serde(rename = "OrderId")]
    order_id: i64,
}

#[derive(Debug, Deserialize)]
struct CreateRequestResponse {
    #[serde(alias = "Id", alias = "id", alias = "CorrelationId", alias = "correlationId")]
    correlation_id: String,
}

/// Partner API client
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct PartnerHttpClient {
    client: Client,
    base_url: String,
    api_key: String,
    create_path: String,
    result_path: String,
    kinds_path: String,
}

impl PartnerHttpClient {
    /// Build a client from configuration.
    ///
    /// The total request timeout is the connect timeout plus the read
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns `PartnerError::Connect` if the HTTP client cannot be built
    /// (e.g. the TLS backend fails to initialise).
    pub fn new(config: &PartnerConfig) -> Result<Self, PartnerError> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let read_timeout = Duration::from_secs(config.read_timeout_secs);

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout + read_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .build()
            .map_err(|e| PartnerError::Connect(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            create_path: config.create_path.clone(),
            result_path: config.result_path.trim_end_matches('/').to_string(),
            kinds_path: config.kinds_path.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, PartnerError> {
        let response = request
            .query(&[("api-key", self.api_key.as_str())])
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(PartnerError::Status {
            status: status.as_u16(),
            body: truncate(body),
        })
    }
}

fn map_transport_error(err: reqwest::Error) -> PartnerError {
    if err.is_timeout() {
        PartnerError::Timeout(err.to_string())
    } else if err.is_connect() {
        PartnerError::Connect(err.to_string())
    } else if err.is_decode() {
        PartnerError::Decode(err.to_string())
    } else {
        PartnerError::Connect(err.to_string())
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

/// Whether a result body says the partner is still working.
///
/// Recognises a `status`/`Status` field in [`PENDING_STATES`], and the
/// `{ "Data": null }` shape without a `Message`.
fn is_pending(body: &serde_json::Value) -> bool {
    let state = body
        .get("status")
        .or_else(|| body.get("Status"))
        .and_then(serde_json::Value::as_str);
    if let Some(state) = state {
        return PENDING_STATES.iter().any(|pending| pending.eq_ignore_ascii_case(state));
    }

    let data_missing = matches!(body.get("Data"), Some(serde_json::Value::Null));
    let message = body
        .get("Message")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    data_missing && message.is_empty()
}

impl PartnerClient for PartnerHttpClient {
    fn create_request(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<PartnerReceipt, PartnerError>> + Send + '_>> {
        Box::pin(async move {
            let body = CreateRequestBody {
                order_id: order_id.get(),
            };
            let response = self
                .send(self.client.post(self.url(&self.create_path)).json(&body))
                .await?;

            let created = response
                .json::<CreateRequestResponse>()
                .await
                .map_err(|e| PartnerError::Decode(e.to_string()))?;

            tracing::debug!(
                order_id = %order_id,
                correlation_id = %created.correlation_id,
                "Partner accepted request"
            );
            Ok(PartnerReceipt {
                correlation_id: created.correlation_id,
            })
        })
    }

    fn get_result(
        &self,
        order_id: OrderId,
        correlation_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<PartnerResult, PartnerError>> + Send + '_>> {
        let url = format!("{}/{correlation_id}", self.url(&self.result_path));
        Box::pin(async move {
            let response = self
                .send(self.client.get(url).query(&[("Type", "JSON")]))
                .await?;

            if response.status() == StatusCode::ACCEPTED {
                tracing::debug!(order_id = %order_id, "Partner result not ready");
                return Ok(PartnerResult::Pending);
            }

            let body = response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| PartnerError::Decode(e.to_string()))?;

            if is_pending(&body) {
                tracing::debug!(order_id = %order_id, "Partner result not ready");
                Ok(PartnerResult::Pending)
            } else {
                Ok(PartnerResult::Ready(body))
            }
        })
    }

    fn request_kinds(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, PartnerError>> + Send + '_>> {
        Box::pin(async move {
            self.send(self.client.get(self.url(&self.kinds_path)))
                .await?
                .json::<serde_json::Value>()
                .await
                .map_err(|e| PartnerError::Decode(e.to_string()))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_creation() {
        let config = PartnerConfig {
            base_url: "http://partner.local/".to_string(),
            result_path: "/api/requests/result/".to_string(),
            ..PartnerConfig::default()
        };
        let client = PartnerHttpClient::new(&config).unwrap();
        assert_eq!(client.base_url, "http://partner.local");
        assert_eq!(client.url("/api/requests"), "http://partner.local/api/requests");
        assert_eq!(client.url("kinds"), "http://partner.local/kinds");
        assert_eq!(client.result_path, "/api/requests/result");
    }

    #[test]
    fn pending_detection() {
        assert!(is_pending(&json!({"status": "in_progress"})));
        assert!(is_pending(&json!({"Data": null, "Message": ""})));
        assert!(!is_pending(&json!({"status": "DONE"})));
        assert!(!is_pending(&json!({"Data": null, "Message": "unknown request"})));
        assert!(!is_pending(&json!({"Data": {"pledge": 1}})));
    }

    #[test]
    fn long_bodies_are_truncated_on_a_char_boundary() {
        let body = "é".repeat(MAX_ERROR_BODY);
        let truncated = truncate(body);
        assert!(truncated.len() <= MAX_ERROR_BODY);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
