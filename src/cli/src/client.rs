//! HTTP client for communicating with the Perch API server.

use anyhow::{Context, Result};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Error body returned by every failing endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub status_code: u16,
    pub error: String,
    pub message: String,
    #[serde(default)]
    pub issues: Vec<ApiIssue>,
}

#[derive(Debug, Deserialize)]
pub struct ApiIssue {
    pub path: String,
    pub message: String,
}

/// Failure of an API call, carrying the server's error code when one was sent.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{error} ({status_code}): {message}{}", format_issues(.issues))]
    Api {
        status_code: u16,
        error: String,
        message: String,
        issues: Vec<ApiIssue>,
    },

    #[error("API error ({status}): {body}")]
    Unexpected { status: StatusCode, body: String },
}

fn format_issues(issues: &[ApiIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("\n  - {}: {}", i.path, i.message))
        .collect()
}

impl From<ApiError> for ClientError {
    fn from(e: ApiError) -> Self {
        Self::Api {
            status_code: e.status_code,
            error: e.error,
            message: e.message,
            issues: e.issues,
        }
    }
}

/// HTTP client for the Perch API.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform a GET request and deserialize the response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.send(Method::GET, path, None::<&()>).await?;
        Self::decode(resp, path).await
    }

    /// Perform a POST request with an optional JSON body and deserialize the response.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: Option<&B>) -> Result<T> {
        let resp = self.send(Method::POST, path, body).await?;
        Self::decode(resp, path).await
    }

    /// GET returning the JSON body whatever the status (the health endpoint answers 503 with a body).
    pub async fn get_raw(&self, path: &str) -> Result<(StatusCode, serde_json::Value)> {
        let resp = self.send(Method::GET, path, None::<&()>).await?;
        let status = resp.status();
        let body = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", path))?;
        Ok((status, body))
    }

    async fn send<B: Serialize>(&self, method: Method, path: &str, body: Option<&B>) -> Result<Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))
    }

    async fn decode<T: DeserializeOwned>(resp: Response, path: &str) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = match serde_json::from_str::<ApiError>(&body) {
                Ok(api) => ClientError::from(api),
                Err(_) => ClientError::Unexpected { status, body },
            };
            return Err(err.into());
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display_lists_issues() {
        let payload = r#"{"statusCode":400,"error":"VALIDATION_ERROR","message":"Validation failed",
            "issues":[{"path":"telegramId","message":"Required"}]}"#;
        let api: ApiError = serde_json::from_str(payload).unwrap();
        let rendered = ClientError::from(api).to_string();
        assert!(rendered.starts_with("VALIDATION_ERROR (400): Validation failed"));
        assert!(rendered.contains("telegramId: Required"));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ApiClient::new("http://localhost:3000/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:3000");
    }
}
