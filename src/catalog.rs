use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Outcome of validating a model id against the catalog.
#[derive(Debug, Clone)]
pub struct CatalogValidation {
    pub canonical_id: String,
    pub gated: bool,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("not found")]
    NotFound,
    #[error("catalog returned status {0}")]
    Status(u16),
    #[error("{0}")]
    Connection(String),
}

const DEFAULT_CATALOG_BASE: &str = "https://huggingface.co";

#[derive(Clone)]
pub struct CatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent("blackbox-server/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: DEFAULT_CATALOG_BASE.to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("blackbox-server/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }

    /// Validates `model_id` against the catalog. 200 yields the canonical id
    /// and gated flag; 404 falls back to `search`; any other status or a
    /// connection failure surfaces as `CatalogError`.
    pub async fn validate(
        &self,
        model_id: &str,
        token: Option<&str>,
    ) -> Result<CatalogValidation, CatalogError> {
        let model_id = model_id.trim();
        let url = format!("{}/api/models/{}", self.base_url, urlencoded(model_id));

        let mut request = self.client.get(&url);
        if let Some(token) = token {
            let token = token.trim();
            if !token.is_empty() {
                request = request.bearer_auth(token);
            }
        }

        let response = request.send().await.map_err(map_connection_error)?;
        match response.status().as_u16() {
            200 => {
                let body: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| CatalogError::Connection(e.to_string()))?;
                let canonical_id = body
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(model_id)
                    .to_string();
                let gated = body.get("gated").and_then(|v| v.as_bool()).unwrap_or(false);
                Ok(CatalogValidation {
                    canonical_id,
                    gated,
                })
            }
            404 => {
                let hits = self.search(model_id, token).await?;
                match hits.into_iter().next() {
                    Some(first) => Box::pin(self.validate(&first, token)).await,
                    None => Err(CatalogError::NotFound),
                }
            }
            other => Err(CatalogError::Status(other)),
        }
    }

    /// Searches the catalog for `query`, returning up to 5 candidate ids
    /// ordered by downloads descending.
    async fn search(&self, query: &str, token: Option<&str>) -> Result<Vec<String>, CatalogError> {
        let url = format!(
            "{}/api/models?search={}&sort=downloads&direction=-1&limit=5",
            self.base_url,
            urlencoded(query)
        );
        let mut request = self.client.get(&url);
        if let Some(token) = token {
            let token = token.trim();
            if !token.is_empty() {
                request = request.bearer_auth(token);
            }
        }
        let response = request.send().await.map_err(map_connection_error)?;
        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status().as_u16()));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CatalogError::Connection(e.to_string()))?;
        let ids = body
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.get("id").and_then(|id| id.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }
}

impl Default for CatalogClient {
    fn default() -> Self {
        Self::new()
    }
}

/// curl-equivalent exit code → human-readable cause, per §4.6.
fn map_connection_error(err: reqwest::Error) -> CatalogError {
    let message = if err.is_timeout() {
        "Timeout"
    } else if err.is_connect() {
        "Failed to connect"
    } else if err.to_string().contains("dns") || err.to_string().contains("resolve") {
        "Could not resolve host"
    } else if err.to_string().to_lowercase().contains("certificate") {
        "SSL certificate problem"
    } else if err.to_string().to_lowercase().contains("ssl") {
        "SSL connect error"
    } else {
        "connection error"
    };
    debug!(error = %err, "catalog connection error");
    CatalogError::Connection(message.to_string())
}

/// URL-encodes `input`, preserving `/`, `.`, `-`, `_`, `~` per §4.6.
pub fn urlencoded(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'/' | b'.' | b'-' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencoded_preserves_slash_and_safe_chars() {
        assert_eq!(
            urlencoded("Qwen/Qwen2.5-7B_Instruct~v1"),
            "Qwen/Qwen2.5-7B_Instruct~v1"
        );
    }

    #[test]
    fn urlencoded_escapes_spaces_and_other_bytes() {
        assert_eq!(urlencoded("a b"), "a%20b");
    }

    #[tokio::test]
    async fn validate_parses_canonical_id_and_gated_flag() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/models/meta-llama/Llama-3")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"meta-llama/Llama-3","gated":true}"#)
            .create_async()
            .await;

        let client = CatalogClient::with_base_url(&server.url());
        let result = client.validate("meta-llama/Llama-3", None).await.unwrap();
        assert_eq!(result.canonical_id, "meta-llama/Llama-3");
        assert!(result.gated);
    }

    #[tokio::test]
    async fn validate_surfaces_non_404_status_as_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/models/broken")
            .with_status(503)
            .create_async()
            .await;

        let client = CatalogClient::with_base_url(&server.url());
        let err = client.validate("broken", None).await.unwrap_err();
        matches!(err, CatalogError::Status(503));
    }

    #[tokio::test]
    async fn validate_404_with_empty_search_fails_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _model_mock = server
            .mock("GET", "/api/models/missing")
            .with_status(404)
            .create_async()
            .await;
        let _search_mock = server
            .mock("GET", "/api/models?search=missing&sort=downloads&direction=-1&limit=5")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let client = CatalogClient::with_base_url(&server.url());
        let err = client.validate("missing", None).await.unwrap_err();
        matches!(err, CatalogError::NotFound);
    }
}
