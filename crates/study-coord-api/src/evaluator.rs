//! Outbound client for the external evaluation service.
//!
//! The evaluator runs out-of-band: a batch submission returns a workflow id
//! immediately and results are fetched later (or pushed back through the
//! result callback). Calls use a short fixed timeout with a single retry on
//! transport errors so an inbound request is never blocked indefinitely.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use study_coord_core::{CoordError, EvaluationItemStatus};

/// One per-call result as delivered by the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluatorItem {
    pub call_id: String,
    pub status: EvaluationItemStatus,
    #[serde(default)]
    pub result: Value,
}

pub trait EvaluatorClient {
    /// Submits a batch and returns the external workflow identifier.
    fn submit_batch(&self, call_ids: &[String], metric_id: &str) -> Result<String, CoordError>;

    /// Fetches whatever results the workflow has produced so far.
    fn fetch_results(&self, workflow_id: &str) -> Result<Vec<EvaluatorItem>, CoordError>;
}

pub struct HttpEvaluatorClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: Option<String>,
}

impl HttpEvaluatorClient {
    /// # Errors
    /// Returns [`CoordError::BadRequest`] when the base URL is blank or the
    /// timeout is zero.
    pub fn new(
        base_url: &str,
        timeout_ms: u64,
        api_key: Option<String>,
    ) -> Result<Self, CoordError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(CoordError::BadRequest(
                "evaluator base url MUST be provided".to_string(),
            ));
        }
        if timeout_ms == 0 {
            return Err(CoordError::BadRequest(
                "evaluator timeout MUST be > 0".to_string(),
            ));
        }
        let timeout = Duration::from_millis(timeout_ms.max(100));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Ok(Self { agent, base_url, api_key })
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let mut request = self.agent.request(method, url);
        if let Some(key) = &self.api_key {
            request = request.set("authorization", &format!("Bearer {key}"));
        }
        request
    }

    /// HTTP error statuses are upstream failures and are not retried here;
    /// transport errors get exactly one retry.
    fn call_json<F>(&self, attempt: F) -> Result<Value, CoordError>
    where
        F: Fn() -> Result<ureq::Response, ureq::Error>,
    {
        let response = match attempt() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(CoordError::Upstream(format!(
                    "evaluator returned HTTP {code}"
                )));
            }
            Err(ureq::Error::Transport(_)) => attempt().map_err(|err| {
                CoordError::Upstream(format!("evaluator unreachable: {err}"))
            })?,
        };
        response
            .into_json::<Value>()
            .map_err(|err| CoordError::Upstream(format!("evaluator sent invalid JSON: {err}")))
    }
}

impl EvaluatorClient for HttpEvaluatorClient {
    fn submit_batch(&self, call_ids: &[String], metric_id: &str) -> Result<String, CoordError> {
        let url = format!("{}/v1/evaluations", self.base_url);
        let payload = json!({ "callIds": call_ids, "metricId": metric_id });
        let body = self.call_json(|| self.request("POST", &url).send_json(&payload))?;
        body.get("workflowId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                CoordError::Upstream("evaluator response missing workflowId".to_string())
            })
    }

    fn fetch_results(&self, workflow_id: &str) -> Result<Vec<EvaluatorItem>, CoordError> {
        let url = format!("{}/v1/evaluations/{workflow_id}/results", self.base_url);
        let body = self.call_json(|| self.request("GET", &url).call())?;
        let raw_items = body
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| CoordError::Upstream("evaluator response missing items".to_string()))?;

        let mut items = Vec::with_capacity(raw_items.len());
        for raw in raw_items {
            let Some(call_id) = raw.get("callId").and_then(Value::as_str) else {
                continue;
            };
            // An unrecognised per-item status is recorded as a retryable
            // error instead of poisoning the rest of the batch.
            let status = raw
                .get("status")
                .and_then(Value::as_str)
                .and_then(EvaluationItemStatus::parse)
                .unwrap_or(EvaluationItemStatus::Error);
            let result = raw.get("result").cloned().unwrap_or(Value::Null);
            items.push(EvaluatorItem {
                call_id: call_id.to_string(),
                status,
                result,
            });
        }
        Ok(items)
    }
}
