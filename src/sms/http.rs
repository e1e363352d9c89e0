//! HTTP-backed `Sms` adapter. The Slot Message Store is an external
//! collaborator (spec §1 Non-goals); this is the concrete client a running
//! worker uses to actually reach it, grounded on the teacher's `reqwest`
//! usage pattern for its own downstream HTTP calls.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch::Message;
use crate::error::{AppError, AppResult};
use crate::pk_multiset::BatchId;

use super::{PushOutcome, Sms};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct WireMessage<'a> {
    primary_key: &'a [String],
    payload: &'a Value,
    commit_lsn: Option<i64>,
    commit_idx: Option<u64>,
}

#[derive(Serialize)]
struct PutBatchRequest<'a> {
    batch_id: BatchId,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct UnpersistedResponse {
    batch_ids: Vec<BatchId>,
}

#[derive(Deserialize)]
struct CountResponse {
    count: u64,
}

/// Talks to the SMS over plain HTTP/JSON. `base_url` is read once at
/// construction from the environment variable named in config
/// (`sms.endpoint_env`) rather than re-read per call.
pub struct HttpSms {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSms {
    pub fn new(base_url: impl Into<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build SMS HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Reads the endpoint from the named environment variable, as config
    /// validation already requires it to be set (spec §6 config).
    pub fn from_env(endpoint_env: &str) -> AppResult<Self> {
        let base_url = std::env::var(endpoint_env).map_err(|_| {
            AppError::InvalidConfig(format!(
                "environment variable '{endpoint_env}' is not set"
            ))
        })?;
        Self::new(base_url)
    }
}

#[async_trait]
impl Sms for HttpSms {
    async fn put_table_reader_batch(
        &self,
        consumer_id: &str,
        messages: &[Message],
        batch_id: BatchId,
    ) -> AppResult<PushOutcome> {
        let body = PutBatchRequest {
            batch_id,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    primary_key: &m.primary_key.0,
                    payload: &m.payload,
                    commit_lsn: m.commit_lsn,
                    commit_idx: m.commit_idx,
                })
                .collect(),
        };

        let url = format!(
            "{}/consumers/{consumer_id}/table-reader-batches",
            self.base_url
        );
        let resp = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::TransientDb(format!("SMS push failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(PushOutcome::Ok);
        }
        if status == reqwest::StatusCode::PAYLOAD_TOO_LARGE {
            return Ok(PushOutcome::PayloadTooLarge);
        }
        if status.is_server_error() {
            return Err(AppError::TransientDb(format!(
                "SMS push returned {status}"
            )));
        }
        Err(AppError::SmsFatal(format!(
            "SMS push rejected with {status}"
        )))
    }

    async fn unpersisted_table_reader_batch_ids(&self, consumer_id: &str) -> AppResult<Vec<BatchId>> {
        let url = format!(
            "{}/consumers/{consumer_id}/table-reader-batches/unpersisted",
            self.base_url
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::TransientDb(format!("SMS query failed: {e}")))?
            .error_for_status()
            .map_err(|e| AppError::TransientDb(format!("SMS query failed: {e}")))?;

        let parsed: UnpersistedResponse = resp
            .json()
            .await
            .map_err(|e| AppError::TransientDb(format!("SMS response decode failed: {e}")))?;
        Ok(parsed.batch_ids)
    }

    async fn count_messages(&self, consumer_id: &str) -> AppResult<u64> {
        let url = format!("{}/consumers/{consumer_id}/table-reader-batches/count", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::TransientDb(format!("SMS query failed: {e}")))?
            .error_for_status()
            .map_err(|e| AppError::TransientDb(format!("SMS query failed: {e}")))?;

        let parsed: CountResponse = resp
            .json()
            .await
            .map_err(|e| AppError::TransientDb(format!("SMS response decode failed: {e}")))?;
        Ok(parsed.count)
    }

    async fn is_alive(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }
}
