//! JSON-over-HTTP transport.
//!
//! One request in, one normalized JSON payload out:
//! - relative paths resolve against the configured base URL,
//! - non-2xx responses become [`LabError::RequestFailed`] carrying the
//!   server's message when the error body has one,
//! - `{ "data": T }` envelopes are unwrapped and records gain an `_id` alias.
//!
//! The transport never retries; that is the query layer's decision.

use crate::auth::StaticToken;
use labsite_core::{ApiConfig, LabError, LabResult, TokenProvider};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::multipart::Form;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;

/// Method, headers, query string and body of one request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::get()
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post(body: Value) -> Self {
        Self::new(Method::POST).body(body)
    }

    pub fn put(body: Value) -> Self {
        Self::new(Method::PUT).body(body)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl Transport {
    pub fn new(config: &ApiConfig) -> LabResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| LabError::invalid_request(format!("HTTP client setup: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens: Arc::new(StaticToken::new(config.token.clone())),
        })
    }

    /// Replace the token source (e.g. with a session that can log in/out).
    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn resolve_url(&self, path: &str) -> String {
        resolve_url(&self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> LabResult<Value> {
        self.request(path, RequestOptions::get()).await
    }

    pub async fn post(&self, path: &str, body: Value) -> LabResult<Value> {
        self.request(path, RequestOptions::post(body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> LabResult<Value> {
        self.request(path, RequestOptions::put(body)).await
    }

    pub async fn delete(&self, path: &str) -> LabResult<Value> {
        self.request(path, RequestOptions::delete()).await
    }

    /// Perform one request and normalize the response.
    pub async fn request(&self, path: &str, options: RequestOptions) -> LabResult<Value> {
        let url = self.resolve_url(path);
        let mut headers = self.auth_headers()?;
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| LabError::invalid_request(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| LabError::invalid_request(format!("header value: {}", e)))?;
            headers.insert(name, value);
        }

        let mut request = self
            .client
            .request(options.method.clone(), &url)
            .headers(headers);
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        tracing::debug!(method = %options.method, url = %url, "sending request");
        let response = request.send().await.map_err(from_reqwest)?;
        normalize_response(&options.method, &url, response).await
    }

    /// POST a multipart form; the response is normalized like any other.
    pub async fn send_multipart(&self, path: &str, form: Form) -> LabResult<Value> {
        let url = self.resolve_url(path);
        tracing::debug!(url = %url, "sending multipart request");
        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers()?)
            .multipart(form)
            .send()
            .await
            .map_err(from_reqwest)?;
        normalize_response(&Method::POST, &url, response).await
    }

    fn auth_headers(&self) -> LabResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(token) = self.tokens.bearer_token() {
            let value = format!("Bearer {}", token);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&value)
                    .map_err(|e| LabError::invalid_request(format!("bearer token: {}", e)))?,
            );
        }
        Ok(headers)
    }
}

/// Join `path` onto `base_url` unless it is already absolute.
pub fn resolve_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

async fn normalize_response(
    method: &Method,
    url: &str,
    response: reqwest::Response,
) -> LabResult<Value> {
    let status = response.status();
    let body = response.bytes().await.map_err(from_reqwest)?;

    if !status.is_success() {
        let message = server_message(&body);
        tracing::warn!(
            method = %method,
            url = %url,
            status = status.as_u16(),
            message = message.as_deref().unwrap_or(""),
            "request failed"
        );
        return Err(LabError::request_failed(status.as_u16(), message));
    }
    if status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    parse_payload(&body)
}

/// Parse a success body, unwrap the `data` envelope and alias ids.
pub fn parse_payload(body: &[u8]) -> LabResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(LabError::invalid_response("empty body"));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| LabError::invalid_response(format!("body is not JSON: {}", e)))?;
    Ok(unwrap_payload(value))
}

/// Unwrap `{ "data": T }` to `T` and alias record ids.
pub fn unwrap_payload(body: Value) -> Value {
    let payload = match body {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    alias_ids(payload)
}

/// Add `_id = id` to every record that has `id` but no `_id`.
///
/// Applies to the payload itself when it is an object, or to each object
/// element when it is an array.
pub fn alias_ids(payload: Value) -> Value {
    match payload {
        Value::Array(items) => Value::Array(items.into_iter().map(alias_record).collect()),
        other => alias_record(other),
    }
}

fn alias_record(record: Value) -> Value {
    match record {
        Value::Object(mut map) => {
            if !map.contains_key("_id") {
                if let Some(id) = map.get("id").cloned() {
                    map.insert("_id".to_string(), id);
                }
            }
            Value::Object(map)
        }
        other => other,
    }
}

/// Best-effort message from a JSON error body. Parse failures yield `None`.
pub fn server_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object()?;
    if let Some(message) = object.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }
    match object.get("error") {
        Some(Value::String(message)) => Some(message.clone()),
        Some(Value::Object(inner)) => inner
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn from_reqwest(err: reqwest::Error) -> LabError {
    if err.is_decode() {
        LabError::invalid_response(err.to_string())
    } else {
        LabError::network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_url_single_rule() {
        assert_eq!(
            resolve_url("https://lab.edu/", "/api/projects"),
            "https://lab.edu/api/projects"
        );
        assert_eq!(
            resolve_url("https://lab.edu", "api/projects"),
            "https://lab.edu/api/projects"
        );
        assert_eq!(
            resolve_url("https://lab.edu", "https://cdn.lab.edu/x.json"),
            "https://cdn.lab.edu/x.json"
        );
    }

    #[test]
    fn test_unwrap_aliases_id() {
        let out = unwrap_payload(json!({"data": {"id": "x", "foo": 1}}));
        assert_eq!(out, json!({"id": "x", "foo": 1, "_id": "x"}));
    }

    #[test]
    fn test_existing_legacy_id_untouched() {
        let record = json!({"id": "x", "_id": "legacy", "foo": 1});
        assert_eq!(unwrap_payload(json!({ "data": record.clone() })), record);
    }

    #[test]
    fn test_unwrap_list_aliases_each_record() {
        let out = unwrap_payload(json!({"data": [{"id": 1}, {"_id": "b"}, "scalar"]}));
        assert_eq!(out, json!([{"id": 1, "_id": 1}, {"_id": "b"}, "scalar"]));
    }

    #[test]
    fn test_body_without_envelope_passes_through() {
        assert_eq!(unwrap_payload(json!({"urls": ["a"]})), json!({"urls": ["a"]}));
    }

    #[test]
    fn test_parse_payload_rejects_empty_and_non_json() {
        assert!(matches!(
            parse_payload(b"  \n"),
            Err(LabError::InvalidResponse { .. })
        ));
        assert!(matches!(
            parse_payload(b"<html>oops</html>"),
            Err(LabError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_server_message_shapes() {
        assert_eq!(
            server_message(br#"{"message": "title required"}"#).as_deref(),
            Some("title required")
        );
        assert_eq!(
            server_message(br#"{"error": "forbidden"}"#).as_deref(),
            Some("forbidden")
        );
        assert_eq!(
            server_message(br#"{"error": {"message": "boom"}}"#).as_deref(),
            Some("boom")
        );
        assert_eq!(server_message(b"Internal Server Error"), None);
        assert_eq!(server_message(b""), None);
    }

    #[test]
    fn test_request_options_builders() {
        let options = RequestOptions::post(json!({"a": 1}))
            .header("x-request-id", "42")
            .query("status", "current");
        assert_eq!(options.method, Method::POST);
        assert_eq!(options.body, Some(json!({"a": 1})));
        assert_eq!(options.headers, vec![("x-request-id".into(), "42".into())]);
        assert_eq!(options.query, vec![("status".into(), "current".into())]);
    }
}
