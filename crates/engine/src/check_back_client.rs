//! Check-back RPC: ask a business whether its local transaction committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use courier_common::error::AppError;

/// A business's answer about one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckBackStatus {
    Unknown,
    Committed,
    Cancelled,
}

#[async_trait]
pub trait CheckBackClient: Send + Sync {
    /// Query the business registered as `service_name` about transaction `key`.
    async fn check(&self, service_name: &str, key: &str) -> Result<CheckBackStatus, AppError>;
}

/// Resolves a business service name to the base URL of its check-back endpoint.
pub trait ServiceDirectory: Send + Sync {
    fn resolve(&self, service_name: &str) -> Option<String>;
}

/// Fixed name → URL table, usually built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    endpoints: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new(endpoints: HashMap<String, String>) -> Self {
        Self { endpoints }
    }
}

impl ServiceDirectory for StaticDirectory {
    fn resolve(&self, service_name: &str) -> Option<String> {
        self.endpoints
            .get(service_name)
            .map(|url| url.trim_end_matches('/').to_string())
    }
}

#[derive(Serialize)]
struct CheckBackRequest<'a> {
    key: &'a str,
}

#[derive(Deserialize)]
struct CheckBackResponse {
    status: CheckBackStatus,
}

/// Calls `POST {endpoint}/tx/check-back` with `{"key": ...}`.
pub struct HttpCheckBackClient {
    http: reqwest::Client,
    directory: Arc<dyn ServiceDirectory>,
}

impl HttpCheckBackClient {
    pub fn new(directory: Arc<dyn ServiceDirectory>, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, directory })
    }
}

#[async_trait]
impl CheckBackClient for HttpCheckBackClient {
    async fn check(&self, service_name: &str, key: &str) -> Result<CheckBackStatus, AppError> {
        let endpoint = self.directory.resolve(service_name).ok_or_else(|| {
            AppError::Rpc(format!("No check-back endpoint registered for '{}'", service_name))
        })?;

        let response = self
            .http
            .post(format!("{}/tx/check-back", endpoint))
            .json(&CheckBackRequest { key })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(format!("Check-back to '{}' timed out", service_name))
                } else {
                    AppError::Rpc(format!("Check-back to '{}' failed: {}", service_name, e))
                }
            })?;

        if !response.status().is_success() {
            return Err(AppError::Rpc(format!(
                "Check-back to '{}' returned {}",
                service_name,
                response.status()
            )));
        }

        let body: CheckBackResponse = response.json().await.map_err(|e| {
            AppError::Rpc(format!("Invalid check-back response from '{}': {}", service_name, e))
        })?;

        Ok(body.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_directory_resolves_and_trims() {
        let directory = StaticDirectory::new(HashMap::from([(
            "orders".to_string(),
            "http://orders:8080/".to_string(),
        )]));
        assert_eq!(
            directory.resolve("orders").as_deref(),
            Some("http://orders:8080")
        );
        assert!(directory.resolve("billing").is_none());
    }

    #[test]
    fn test_response_status_parsing() {
        let body: CheckBackResponse =
            serde_json::from_str(r#"{"status": "committed"}"#).unwrap();
        assert_eq!(body.status, CheckBackStatus::Committed);
        let body: CheckBackResponse =
            serde_json::from_str(r#"{"status": "cancelled"}"#).unwrap();
        assert_eq!(body.status, CheckBackStatus::Cancelled);
        assert!(serde_json::from_str::<CheckBackResponse>(r#"{"status": "maybe"}"#).is_err());
    }

    #[tokio::test]
    async fn test_unregistered_service_is_rpc_error() {
        let client =
            HttpCheckBackClient::new(Arc::new(StaticDirectory::default()), Duration::from_secs(1))
                .unwrap();
        assert!(matches!(
            client.check("ghost", "k1").await,
            Err(AppError::Rpc(_))
        ));
    }
}
