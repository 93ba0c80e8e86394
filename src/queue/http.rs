//! reqwest-backed request client

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use url::Url;

use super::{Method, RequestClient, RequestError};

/// JSON client for the survey API. Paths are resolved against `base_url`.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RequestError> {
        let base_url = base_url.into();
        Url::parse(&base_url)
            .map_err(|e| RequestError::Invalid(format!("api base url {:?}: {}", base_url, e)))?;
        let client = Client::builder()
            .build()
            .map_err(|e| RequestError::Invalid(format!("http client build failed: {}", e)))?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

/// Only failures to reach the server are worth queueing. Builder and
/// redirect errors are permanent.
fn classify(error: reqwest::Error) -> RequestError {
    if error.is_builder() || error.is_redirect() {
        RequestError::Invalid(error.to_string())
    } else if error.is_connect() || error.is_timeout() || error.is_request() {
        RequestError::Unreachable(error.to_string())
    } else if error.is_decode() || error.is_body() {
        RequestError::Decode(error.to_string())
    } else {
        RequestError::Invalid(error.to_string())
    }
}

/// Pull the server's `detail` field out of an error body if it has one.
fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("detail").map(|d| match d {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }))
        .unwrap_or_else(|| format!("HTTP error! status: {}", status.as_u16()))
}

#[async_trait]
impl RequestClient for HttpClient {
    async fn request(
        &self,
        path: &str,
        method: Method,
        body: Option<&Value>,
    ) -> Result<Value, RequestError> {
        let url = self.url_for(path);
        log::debug!("{} {}", method, url);

        let mut request = self.client.request(to_reqwest(method), &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(classify)?;

        let status = response.status();
        let text = response.text().await.map_err(classify)?;
        if !status.is_success() {
            return Err(RequestError::Status {
                status: status.as_u16(),
                message: error_message(status, &text),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| RequestError::Decode(e.to_string()))
    }
}
