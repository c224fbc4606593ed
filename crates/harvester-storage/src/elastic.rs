//! Elasticsearch `_bulk` adapter.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{info_span, warn, Instrument};

use crate::{BulkResponse, IndexError, IndexOperation, SearchIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub url: String,
    pub index: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            index: "plu".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct ElasticIndex {
    client: reqwest::Client,
    config: ElasticConfig,
}

impl ElasticIndex {
    pub fn new(config: ElasticConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    fn bulk_url(&self) -> String {
        format!("{}/_bulk", self.config.url.trim_end_matches('/'))
    }

    async fn post_ndjson(&self, url: &str, body: String) -> Result<Value, IndexError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.config.backoff.max_retries {
            let resp_result = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                .body(body.clone())
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json::<Value>().await?);
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "bulk request rejected; retrying");
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(IndexError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(IndexError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(IndexError::Request(err)),
            None => Err(IndexError::HttpStatus {
                status: 0,
                url: url.to_string(),
            }),
        }
    }
}

#[async_trait]
impl SearchIndex for ElasticIndex {
    async fn send_operations(&self, ops: &[IndexOperation]) -> Result<BulkResponse, IndexError> {
        if ops.is_empty() {
            return Ok(BulkResponse::default());
        }
        let body = bulk_body(&self.config.index, ops)?;
        let url = self.bulk_url();
        let span = info_span!("elastic_bulk", index = %self.config.index, ops = ops.len());
        let response = self.post_ndjson(&url, body).instrument(span).await?;
        Ok(parse_bulk_response(&response))
    }
}

/// Renders operations as a `_bulk` NDJSON body (trailing newline included).
pub fn bulk_body(index: &str, ops: &[IndexOperation]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for op in ops {
        match op {
            IndexOperation::Delete { id } => {
                body.push_str(&serde_json::to_string(
                    &json!({"delete": {"_index": index, "_id": id}}),
                )?);
                body.push('\n');
            }
            IndexOperation::Index { id, document } => {
                body.push_str(&serde_json::to_string(
                    &json!({"index": {"_index": index, "_id": id}}),
                )?);
                body.push('\n');
                body.push_str(&serde_json::to_string(document)?);
                body.push('\n');
            }
        }
    }
    Ok(body)
}

/// Counts applied items. A delete answered with 404 targeted an id that is
/// already gone and counts as applied.
pub fn parse_bulk_response(response: &Value) -> BulkResponse {
    let mut out = BulkResponse::default();
    let Some(items) = response.get("items").and_then(Value::as_array) else {
        return out;
    };
    for item in items {
        let Some((action, result)) = item.as_object().and_then(|o| o.iter().next()) else {
            continue;
        };
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
        let id = result.get("_id").and_then(Value::as_str).unwrap_or_default();
        let ok = (200..300).contains(&status) || (action == "delete" && status == 404);
        if ok {
            out.applied += 1;
        } else {
            let reason = result
                .pointer("/error/reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            out.failed.push(format!("{action} {id}: {status} {reason}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::document;

    #[test]
    fn retry_classification_covers_server_errors_and_throttling() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn bulk_body_puts_deletes_before_the_index_action() {
        let ops = vec![
            IndexOperation::Delete { id: "hh/old".into() },
            IndexOperation::Index {
                id: "hh/new".into(),
                document: Box::new(document("new", 9)),
            },
        ];
        let body = bulk_body("plu", &ops).unwrap();
        let lines = body.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"delete\""));
        assert!(lines[1].contains("\"_id\":\"hh/new\""));
        let doc: Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(doc["identifier"], "new");
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn missing_delete_targets_are_not_failures() {
        let response = json!({
            "errors": true,
            "items": [
                {"delete": {"_id": "hh/gone", "status": 404}},
                {"index": {"_id": "hh/new", "status": 201}},
                {"index": {"_id": "hh/bad", "status": 400, "error": {"reason": "mapper_parsing_exception"}}}
            ]
        });
        let parsed = parse_bulk_response(&response);
        assert_eq!(parsed.applied, 2);
        assert_eq!(parsed.failed, vec!["index hh/bad: 400 mapper_parsing_exception".to_string()]);
    }
}
