//! Encodes, compresses, and pushes a [`Batch`] to the log sink.

use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use reqwest::RequestBuilder;
use tracing::warn;

use crate::batch::Batch;
use crate::config::PushMode;
use crate::error::SinkError;
use crate::retry::{sleep_unless_stopped, StopSignal};

const PUSH_PATH: &str = "/loki/api/v1/push";

/// A pooled HTTP client that pushes batches to one sink endpoint, in one
/// fixed encoding mode, with infinite retry under cancel.
#[derive(Clone)]
pub struct SinkClient {
    inner: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    tenant_id: Option<String>,
    mode: PushMode,
    dry_run: bool,
}

impl SinkClient {
    pub fn new(
        base_url: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
        tenant_id: Option<String>,
        mode: PushMode,
        dry_run: bool,
    ) -> Result<Self, SinkError> {
        let inner = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(SinkError::from)?;

        Ok(Self {
            inner,
            base_url: base_url.into(),
            username,
            password,
            tenant_id,
            mode,
            dry_run,
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        let req = match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_deref()),
            None => req,
        };
        match &self.tenant_id {
            Some(tenant) => req.header("X-Scope-OrgId", tenant),
            None => req,
        }
    }

    fn encode(&self, batch: &Batch) -> Result<(Vec<u8>, &'static str, Option<&'static str>), SinkError> {
        match self.mode {
            PushMode::Protobuf => {
                let request = batch.encode_protobuf();
                let encoded = request.encode_to_vec();
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(&encoded)
                    .map_err(|e| SinkError::Encoding(e.to_string()))?;
                Ok((compressed, "application/x-protobuf", None))
            }
            PushMode::Gzip => {
                let json = batch.encode_json();
                let mut encoder = GzEncoder::new(Vec::new(), Compression::new(5));
                encoder
                    .write_all(&json)
                    .map_err(|e| SinkError::Encoding(e.to_string()))?;
                let compressed = encoder
                    .finish()
                    .map_err(|e| SinkError::Encoding(e.to_string()))?;
                Ok((compressed, "application/json; charset=utf8", Some("gzip")))
            }
            PushMode::Json => {
                let json = batch.encode_json();
                Ok((json, "application/json; charset=utf8", None))
            }
        }
    }

    /// Push `batch` to the sink. Retries indefinitely on transport errors
    /// and non-2xx responses (sleeping ~2s between attempts) until either a
    /// 2xx response is received or `stop` fires, in which case the batch is
    /// discarded and the checkpoint must NOT be advanced.
    ///
    /// The returned size is the request payload's encoded length, not the
    /// response body's.
    pub async fn push(&self, batch: &Batch, stop: &StopSignal) -> Result<(u16, usize), SinkError> {
        let (body, content_type, content_encoding) = self.encode(batch)?;
        let body_len = body.len();

        if self.dry_run {
            let url = format!("{}{}", self.base_url.trim_end_matches('/'), PUSH_PATH);
            tracing::info!(url = %url, bytes = body_len, "dry-run sink push (no-op)");
            return Ok((200, body_len));
        }

        loop {
            if stop.is_set() {
                return Err(SinkError::Cancelled);
            }

            let url = format!("{}{}", self.base_url.trim_end_matches('/'), PUSH_PATH);
            let mut req = self
                .authed(self.inner.post(&url))
                .header("Content-Type", content_type)
                .body(body.clone());
            if let Some(encoding) = content_encoding {
                req = req.header("Content-Encoding", encoding);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok((status.as_u16(), body_len));
                    }

                    let body_preview: String = resp
                        .text()
                        .await
                        .unwrap_or_default()
                        .chars()
                        .take(256)
                        .collect();
                    warn!(status = status.as_u16(), body = %body_preview, "sink rejected batch, retrying");

                    if sleep_unless_stopped(stop, Duration::from_secs(2))
                        .await
                        .is_stopped()
                    {
                        return Err(SinkError::Cancelled);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "sink push transport error, retrying");
                    if sleep_unless_stopped(stop, Duration::from_secs(2))
                        .await
                        .is_stopped()
                    {
                        return Err(SinkError::Cancelled);
                    }
                }
            }
        }
    }

    /// Push `batch` exactly once, ignoring the stop signal and without any
    /// retry. Used for the drain phase's final flush: a batch handed to
    /// drain after a graceful stop has already fired must still be
    /// attempted, not discarded just because `stop` is set — `push` would
    /// bail at its stop-check before making any request at all.
    pub async fn push_final(&self, batch: &Batch) -> Result<(u16, usize), SinkError> {
        let (body, content_type, content_encoding) = self.encode(batch)?;
        let body_len = body.len();

        if self.dry_run {
            let url = format!("{}{}", self.base_url.trim_end_matches('/'), PUSH_PATH);
            tracing::info!(url = %url, bytes = body_len, "dry-run sink push (no-op)");
            return Ok((200, body_len));
        }

        let url = format!("{}{}", self.base_url.trim_end_matches('/'), PUSH_PATH);
        let mut req = self
            .authed(self.inner.post(&url))
            .header("Content-Type", content_type)
            .body(body);
        if let Some(encoding) = content_encoding {
            req = req.header("Content-Encoding", encoding);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body_preview: String = resp
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(256)
                .collect();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body_preview,
            });
        }

        Ok((status.as_u16(), body_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LabelSet;

    #[test]
    fn protobuf_mode_produces_snappy_framed_bytes() {
        let client = SinkClient::new(
            "http://localhost:3100",
            None,
            None,
            None,
            PushMode::Protobuf,
            true,
        )
        .unwrap();

        let mut batch = Batch::new();
        let mut labels = LabelSet::new();
        labels.insert("job", "logs");
        batch.push(labels, 1, "hello".into());

        let (encoded, content_type, content_encoding) = client.encode(&batch).unwrap();
        assert_eq!(content_type, "application/x-protobuf");
        assert!(content_encoding.is_none());

        let decompressed = snap::raw::Decoder::new().decompress_vec(&encoded).unwrap();
        let decoded = crate::proto::PushRequest::decode(decompressed.as_slice()).unwrap();
        assert_eq!(decoded.streams.len(), 1);
    }

    #[test]
    fn gzip_mode_sets_content_encoding_header() {
        let client =
            SinkClient::new("http://localhost:3100", None, None, None, PushMode::Gzip, true)
                .unwrap();
        let batch = Batch::new();
        let (_, content_type, content_encoding) = client.encode(&batch).unwrap();
        assert_eq!(content_type, "application/json; charset=utf8");
        assert_eq!(content_encoding, Some("gzip"));
    }
}
