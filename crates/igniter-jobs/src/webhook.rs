//! Outgoing completion webhooks.
//!
//! Delivery is best-effort: failures are logged by the caller and never fail
//! the job.

use chrono::{DateTime, Utc};
use igniter_core::{IgniterError, IgniterResult};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// User agent sent on every webhook request.
const USER_AGENT: &str = "Igniter-Jobs-Webhook/1.0";

/// Request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Webhook request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub job_id: String,
    pub job_name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub execution_time: u64,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub timestamp: DateTime<Utc>,
    pub source: &'static str,
    pub version: &'static str,
}

impl WebhookPayload {
    /// Builds a completion payload.
    #[must_use]
    pub fn completed(
        job_id: impl Into<String>,
        job_name: impl Into<String>,
        result: Option<Value>,
        execution_time_ms: u64,
        tags: Option<Vec<String>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            job_name: job_name.into(),
            status: "completed".to_string(),
            result,
            execution_time: execution_time_ms,
            completed_at: now,
            tags,
            timestamp: now,
            source: "igniter-jobs",
            version: "1.0.0",
        }
    }
}

/// Webhook sender sharing one HTTP client.
#[derive(Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
}

impl WebhookClient {
    /// Creates the client.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// POSTs the payload as JSON.
    pub async fn send(&self, url: &str, payload: &WebhookPayload) -> IgniterResult<()> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| IgniterError::internal(format!("Webhook request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(IgniterError::internal(format!(
                "Webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

impl Default for WebhookClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_shape() {
        let payload = WebhookPayload::completed(
            "job-1",
            "emails.send",
            Some(json!({"sent": true})),
            42,
            Some(vec!["billing".into()]),
        );
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(value["jobId"], "job-1");
        assert_eq!(value["jobName"], "emails.send");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["executionTime"], 42);
        assert_eq!(value["source"], "igniter-jobs");
        assert_eq!(value["version"], "1.0.0");
        assert!(value["timestamp"].is_string());
        assert!(value["completedAt"].is_string());
    }
}
