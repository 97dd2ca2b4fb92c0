use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::RecordKind;

/// Failure of a single remote submission. All variants are transient from the
/// queue's point of view: the record stays (or becomes) pending.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not build request: {0}")]
    Request(String),
}

/// Remote endpoint accepting captured farm records.
#[async_trait]
pub trait RecordApi: Send + Sync {
    /// Deliver one record. `idempotency_key` is stable across retries of the
    /// same record.
    async fn submit_record(
        &self,
        kind: RecordKind,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<(), RemoteError>;
}

/// Run `submit_record` under a hard deadline; an elapsed deadline is just
/// another failure.
pub async fn submit_with_timeout(
    api: &dyn RecordApi,
    kind: RecordKind,
    payload: &Value,
    idempotency_key: &str,
    timeout: Duration,
) -> Result<(), RemoteError> {
    match tokio::time::timeout(timeout, api.submit_record(kind, payload, idempotency_key)).await {
        Ok(res) => res,
        Err(_) => Err(RemoteError::Timeout(timeout)),
    }
}

#[derive(Clone)]
pub struct HttpRecordApi {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for HttpRecordApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRecordApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpRecordApi {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid API base URL")?;
        let http = Client::builder()
            .user_agent(concat!("farm-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            &cfg.remote.base_url,
            cfg.remote.token.clone(),
            cfg.remote.timeout(),
        )
    }

    pub fn endpoint(&self, kind: RecordKind) -> Result<Url> {
        self.base_url
            .join(&format!("v1/records/{}", kind.as_str()))
            .context("invalid API base URL")
    }

    pub fn build_request(
        &self,
        kind: RecordKind,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<reqwest::Request> {
        let endpoint = self.endpoint(kind)?;
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Idempotency-Key", idempotency_key)
            .header("Content-Type", "application/json")
            .json(payload)
            .build()
            .context("failed to build record request")
    }
}

#[async_trait]
impl RecordApi for HttpRecordApi {
    async fn submit_record(
        &self,
        kind: RecordKind,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        let request = self
            .build_request(kind, payload, idempotency_key)
            .map_err(|err| RemoteError::Request(format!("{err:#}")))?;
        debug!(url = %request.url(), %kind, idempotency_key, "submitting record");

        let res = self.http.execute(request).await?;
        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(%kind, "rate limited by record API");
        } else {
            warn!(%kind, %status, "record API rejected submission");
        }
        Err(RemoteError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
