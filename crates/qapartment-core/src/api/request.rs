//! Replayable request descriptor.
//!
//! A `reqwest::RequestBuilder` is consumed when sent, so the client keeps
//! everything needed to rebuild the call and dispatch it again after a
//! token refresh.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Serialize;

use super::AuthError;

#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Bytes {
        content_type: String,
        data: Vec<u8>,
    },
}

/// Which backend surface a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiBase {
    /// The admin back-office API, e.g. `/api/admin/properties`.
    #[default]
    Admin,
    /// The general API that also hosts the auth endpoints, e.g. `/api/auth/me`.
    Api,
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub base: ApiBase,
    /// Path relative to the selected base URL, e.g. `/properties`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    /// Overrides the client's default timeout for every dispatch of this
    /// request.
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            base: ApiBase::Admin,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Address the request to another base URL.
    pub fn on(mut self, base: ApiBase) -> Self {
        self.base = base;
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, AuthError> {
        let value = serde_json::to_value(body)
            .map_err(|e| AuthError::InvalidRequest(format!("Failed to encode body: {}", e)))?;
        self.body = Some(RequestBody::Json(value));
        Ok(self)
    }

    /// Raw body, e.g. an image upload.
    pub fn bytes(mut self, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.body = Some(RequestBody::Bytes {
            content_type: content_type.into(),
            data,
        });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build a fresh `reqwest` request against `base_url`, which the caller
    /// resolves from [`ApiRequest::base`]. Called once per dispatch.
    pub(crate) fn build(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        default_timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let url = join_url(base_url, &self.path);
        let mut builder = client
            .request(self.method.clone(), url)
            .headers(self.headers.clone())
            .timeout(self.timeout.unwrap_or(default_timeout));

        if !self.query.is_empty() {
            builder = builder.query(&self.query);
        }

        match &self.body {
            Some(RequestBody::Json(value)) => builder.json(value),
            Some(RequestBody::Bytes { content_type, data }) => builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(data.clone()),
            None => builder,
        }
    }
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

// ============================================================================
// Tests
// ============================================================================
