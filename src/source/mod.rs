//! The search-index source: a pooled HTTP client plus the prefetching scroller.

pub mod scroller;

pub use scroller::{Document, Scroller};

use std::time::Duration;

use reqwest::RequestBuilder;
use serde_json::Value;

use crate::error::SourceError;

/// A pooled HTTP client against one or more search-index hosts.
///
/// Cloneable and cheap to share: `reqwest::Client` is itself an `Arc` around
/// its connection pool.
#[derive(Clone)]
pub struct SourceClient {
    inner: reqwest::Client,
    hosts: Vec<String>,
    user: Option<String>,
    password: Option<String>,
}

impl SourceClient {
    pub fn builder() -> SourceClientBuilder {
        SourceClientBuilder::new()
    }

    fn host(&self) -> &str {
        // Round-robin is unnecessary at this crate's scale; the first
        // configured host is used for every request, matching the single
        // pooled-connection idiom used elsewhere in this crate.
        self.hosts.first().map(String::as_str).unwrap_or("")
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.user {
            Some(user) => req.basic_auth(user, self.password.as_deref()),
            None => req,
        }
    }

    pub async fn count(
        &self,
        index: &str,
        timestamp_field: &str,
        max_date: Option<&str>,
    ) -> Result<u64, SourceError> {
        let url = format!("{}/{}/_count", self.host().trim_end_matches('/'), index);
        let body = max_date_query(timestamp_field, max_date);

        let resp = self
            .authed(self.inner.get(&url))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let json: Value = resp
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        if !status.is_success() {
            return Err(SourceError::ResponseError(format!(
                "count query returned status {status}: {json}"
            )));
        }

        json.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| SourceError::Malformed("missing integer `count` field".to_string()))
    }

    pub async fn search(
        &self,
        index: &str,
        size: u64,
        sort: &Value,
        search_after: Option<&[Value]>,
        timestamp_field: &str,
        max_date: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Value, SourceError> {
        let url = format!("{}/{}/_search", self.host().trim_end_matches('/'), index);

        let mut body = serde_json::json!({
            "size": size,
            "sort": sort,
        });
        if let Some(after) = search_after {
            body["search_after"] = Value::Array(after.to_vec());
        }
        if let Some(query) = max_date_query(timestamp_field, max_date) {
            body["query"] = query;
        }

        let resp = self
            .authed(self.inner.post(&url))
            .timeout(request_timeout)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let json: Value = resp
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        if !status.is_success() {
            return Err(SourceError::ResponseError(format!(
                "search query returned status {status}: {json}"
            )));
        }

        Ok(json)
    }
}

fn max_date_query(timestamp_field: &str, max_date: Option<&str>) -> Option<Value> {
    max_date.map(|max| {
        serde_json::json!({
            "range": { timestamp_field: { "lt": max } }
        })
    })
}

/// Builder for [`SourceClient`], mirroring the pack's pooled-client idiom.
#[must_use = "builders do nothing unless you call .build()"]
pub struct SourceClientBuilder {
    hosts: Vec<String>,
    user: Option<String>,
    password: Option<String>,
    timeout: Option<Duration>,
}

impl SourceClientBuilder {
    fn new() -> Self {
        Self {
            hosts: Vec::new(),
            user: None,
            password: None,
            timeout: None,
        }
    }

    pub fn hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn basic_auth(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.user = user;
        self.password = password;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<SourceClient, SourceError> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let inner = builder
            .build()
            .map_err(|e| SourceError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(SourceClient {
            inner,
            hosts: self.hosts,
            user: self.user,
            password: self.password,
        })
    }
}

impl Default for SourceClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
