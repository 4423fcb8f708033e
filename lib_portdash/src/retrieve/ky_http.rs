//! # HTTP Retrieval Utilities
//!
//! This module provides an asynchronous API client wrapper around `reqwest`.
//! It includes middleware support for exponential backoff retries and
//! standardized JSON response handling.

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

/// A standardized container for API responses.
///
/// This struct wraps the deserialized data along with metadata about the
/// HTTP transaction, such as status codes and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// An asynchronous HTTP client bound to one base URL.
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
}

impl ApiClient {
    /// Creates a new `ApiClient` that retries transient failures up to
    /// `max_retries` times with exponential backoff.
    ///
    /// # Errors
    /// Returns an error if `base_url` is not a valid absolute URL.
    pub fn new(base_url: &str, max_retries: u32) -> anyhow::Result<Self> {
        let url = Url::parse(base_url)?;
        Ok(Self::with_base(url, max_retries))
    }

    /// Same as [`ApiClient::new`] for an already parsed URL.
    pub fn with_base(base_url: Url, max_retries: u32) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);

        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            inner: client,
            base_url,
        }
    }

    /// The base URL relative paths are joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs an HTTP request and captures the response.
    ///
    /// Non-2xx statuses are not errors here: they come back with
    /// `success: false` and the body text in `error_body`. An empty 2xx body
    /// is decoded as JSON `null`.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb.
    /// * `path` - Path relative to the base URL.
    /// * `query` - Query pairs appended to the URL.
    /// * `body` - Optional value serialized as the JSON body.
    ///
    /// # Errors
    /// URL joining, network execution or body decoding failures.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut full_url = self.base_url.join(path)?;
        if !query.is_empty() {
            full_url.query_pairs_mut().extend_pairs(query.iter());
        }
        log::debug!("{} {}", method, full_url);

        let mut req = self.inner.request(method, full_url);

        if let Some(b) = body {
            let json_body = serde_json::to_string(b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let headers = response.headers().clone();

        if status.is_success() {
            let text = response.text().await?;
            let data = if text.trim().is_empty() {
                serde_json::from_str("null")?
            } else {
                serde_json::from_str(&text)?
            };
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers,
            })
        }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient").field("base_url", &self.base_url.as_str()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{StatusCode, Uri};
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn echo(method: Method, uri: Uri, body: String) -> Json<Value> {
        Json(json!({"method": method.as_str(), "uri": uri.to_string(), "body": body}))
    }

    async fn spawn_backend() -> String {
        let app = Router::new()
            .route("/api/config/restart-services", post(echo))
            .route("/api/dashboard/accounts/{id}", get(|| async { (StatusCode::NOT_FOUND, "no such account") }))
            .route("/api/config/env", put(|| async { StatusCode::NO_CONTENT }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[test]
    fn test_rejects_relative_base_url() {
        assert!(ApiClient::new("api/v1", 0).is_err());
    }

    #[tokio::test]
    async fn test_joins_path_query_and_body() {
        let api = ApiClient::new(&spawn_backend().await, 0).unwrap();

        let query = vec![("config_type".to_string(), "env".to_string())];
        let res = api
            .request::<Value, Value>(Method::POST, "api/config/restart-services", &query, Some(&json!({"a": 1})))
            .await
            .unwrap();

        assert!(res.success);
        let data = res.data.unwrap();
        assert_eq!(data["method"], "POST");
        assert_eq!(data["uri"], "/api/config/restart-services?config_type=env");
        assert_eq!(data["body"], r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_non_success_keeps_error_body() {
        let api = ApiClient::new(&spawn_backend().await, 0).unwrap();

        let res = api
            .request::<Value, ()>(Method::GET, "api/dashboard/accounts/X", &[], None)
            .await
            .unwrap();

        assert!(!res.success);
        assert_eq!(res.status, 404);
        assert_eq!(res.error_body.as_deref(), Some("no such account"));
    }

    #[tokio::test]
    async fn test_empty_success_body_is_null() {
        let api = ApiClient::new(&spawn_backend().await, 0).unwrap();

        let res = api
            .request::<Value, Value>(Method::PUT, "api/config/env", &[], Some(&json!({"A": "1"})))
            .await
            .unwrap();

        assert!(res.success);
        assert_eq!(res.status, 204);
        assert_eq!(res.data, Some(Value::Null));
    }
}
