use anyhow::Result;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::store::Store;

const ORACLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);
const SYNC_BACKOFF_MAX: Duration = Duration::from_secs(600);

/// Verdict for one analyzed message or one adjudicated fingerprint. Shared
/// between the local API response and the oracle wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub proximity_match: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<i32>,
}

impl AnalysisResult {
    pub fn allow() -> Self {
        Self {
            action: "allow".to_string(),
            label: None,
            proximity_match: false,
            distance: None,
        }
    }

    pub fn spam(label: &str, distance: i32) -> Self {
        Self {
            action: "spam".to_string(),
            label: Some(label.to_string()),
            proximity_match: true,
            distance: Some(distance),
        }
    }

    pub fn is_spam(&self) -> bool {
        self.action == "spam"
    }
}

#[derive(Debug, Deserialize)]
struct DecisionEnvelope {
    result: AnalysisResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub new_seq: i64,
    pub action: String,
    #[serde(default)]
    pub ops: Vec<SyncOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOp {
    pub action: String,
    pub bands: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("oracle returned malformed response: {0}")]
    Malformed(String),
}

#[derive(Clone)]
pub struct OracleClient {
    http: Client,
    base_url: String,
}

impl OracleClient {
    pub fn new(base_url: String) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(ORACLE_TIMEOUT)
            .user_agent(format!("mailuminati-guardian/{}", crate::ENGINE_VERSION))
            .build()?;
        Ok(Self { http, base_url })
    }

    /// Ask the oracle to adjudicate one fingerprint. Network errors, non-2xx
    /// statuses and malformed payloads all degrade to "partial match, unable
    /// to confirm" so an oracle outage can never flip a verdict to spam.
    pub async fn decision(&self, node_id: &str, signature: &str) -> AnalysisResult {
        match self.try_decision(node_id, signature).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "oracle decision failed, degrading to partial match");
                AnalysisResult {
                    action: "allow".to_string(),
                    label: None,
                    proximity_match: true,
                    distance: None,
                }
            }
        }
    }

    async fn try_decision(
        &self,
        node_id: &str,
        signature: &str,
    ) -> Result<AnalysisResult, OracleError> {
        let response = self
            .http
            .post(format!("{}/analyze", self.base_url))
            .json(&json!({ "node_id": node_id, "signature": signature }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(OracleError::Malformed(format!(
                "status {}",
                response.status()
            )));
        }

        let envelope: DecisionEnvelope = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        Ok(envelope.result)
    }

    /// Forward a report; the oracle's status code and body are handed back
    /// verbatim for the caller to proxy.
    pub async fn report(
        &self,
        node_id: &str,
        signatures: &[String],
        report_type: &str,
    ) -> Result<(u16, String), OracleError> {
        let response = self
            .http
            .post(format!("{}/report", self.base_url))
            .json(&json!({
                "node_id": node_id,
                "signatures": signatures,
                "report_type": report_type,
            }))
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok((status, body))
    }

    /// Poll for a band-index delta. `Ok(None)` means 304 Not Modified:
    /// neither the sequence nor the indexes are touched.
    pub async fn sync(
        &self,
        node_id: &str,
        current_seq: i64,
    ) -> Result<Option<SyncResponse>, OracleError> {
        let response = self
            .http
            .post(format!("{}/sync", self.base_url))
            .json(&json!({ "node_id": node_id, "current_seq": current_seq }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(OracleError::Malformed(format!(
                "status {}",
                response.status()
            )));
        }

        let delta: SyncResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        Ok(Some(delta))
    }
}

/// One sync round: fetch the delta for our current sequence and apply it.
/// The sequence only advances in the same pipeline as the ops, so a failure
/// mid-batch replays from the old sequence on the next poll.
pub async fn do_sync(client: &OracleClient, store: &Store, node_id: &str) -> Result<()> {
    let current_seq = store.current_seq().await?;
    let Some(delta) = client.sync(node_id, current_seq).await? else {
        debug!(current_seq, "sync: not modified");
        return Ok(());
    };

    match delta.action.as_str() {
        "UPDATE_DELTA" => {
            store.apply_sync_ops(&delta.ops, delta.new_seq).await?;
        }
        "FULL_RESYNC" => {
            store.flush_oracle_bands().await?;
            store.apply_sync_ops(&delta.ops, delta.new_seq).await?;
        }
        other => {
            warn!(action = other, "ignoring unknown sync action");
            return Ok(());
        }
    }

    info!(
        new_seq = delta.new_seq,
        ops = delta.ops.len(),
        action = %delta.action,
        "oracle sync applied"
    );
    Ok(())
}

/// Long-running sync poller: fixed cadence, exponential backoff capped at
/// ten minutes while the oracle is unreachable, reset on the first success.
pub async fn sync_worker(client: OracleClient, store: Store, node_id: String) {
    let mut delay = SYNC_INTERVAL;
    loop {
        tokio::time::sleep(delay).await;
        match do_sync(&client, &store, &node_id).await {
            Ok(()) => delay = SYNC_INTERVAL,
            Err(e) => {
                warn!(error = %e, retry_in = ?delay, "sync failed");
                delay = (delay * 2).min(SYNC_BACKOFF_MAX);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_response_parsing() {
        let delta: SyncResponse =
            serde_json::from_str(r#"{"new_seq": 123, "action": "UPDATE_DELTA", "ops": []}"#)
                .unwrap();
        assert_eq!(delta.new_seq, 123);
        assert_eq!(delta.action, "UPDATE_DELTA");
        assert!(delta.ops.is_empty());

        let delta: SyncResponse = serde_json::from_str(
            r#"{"new_seq": 7, "action": "FULL_RESYNC",
                "ops": [{"action": "add", "bands": ["0:AABBCC", "3:BBCCDD"]},
                        {"action": "remove", "bands": ["6:CCDDEE"]}]}"#,
        )
        .unwrap();
        assert_eq!(delta.ops.len(), 2);
        assert_eq!(delta.ops[0].action, "add");
        assert_eq!(delta.ops[0].bands.len(), 2);
    }

    #[test]
    fn test_analysis_result_serialization_omits_empty_fields() {
        let allow = AnalysisResult::allow();
        let json = serde_json::to_string(&allow).unwrap();
        assert!(json.contains(r#""action":"allow""#));
        assert!(!json.contains("label"));
        assert!(!json.contains("distance"));

        let spam = AnalysisResult::spam("local_spam", 42);
        let json = serde_json::to_string(&spam).unwrap();
        assert!(json.contains(r#""label":"local_spam""#));
        assert!(json.contains(r#""distance":42"#));
        assert!(json.contains(r#""proximity_match":true"#));
    }

    #[test]
    fn test_decision_envelope_parsing() {
        let envelope: DecisionEnvelope = serde_json::from_str(
            r#"{"result": {"action": "allow", "proximity_match": false}}"#,
        )
        .unwrap();
        assert_eq!(envelope.result.action, "allow");
        assert!(!envelope.result.proximity_match);
    }

    #[tokio::test]
    async fn test_decision_degrades_to_partial_match_when_unreachable() {
        // TCP port 1 on loopback refuses connections immediately.
        let client = OracleClient::new("http://127.0.0.1:1".to_string()).unwrap();
        let verdict = client.decision("test-node", "T1AABBCC").await;

        assert_eq!(verdict.action, "allow");
        assert!(verdict.proximity_match);
    }

    #[tokio::test]
    async fn test_report_surfaces_unreachable_oracle() {
        let client = OracleClient::new("http://127.0.0.1:1".to_string()).unwrap();
        let result = client.report("test-node", &["T1AABBCC".to_string()], "spam").await;
        assert!(matches!(result, Err(OracleError::Unreachable(_))));
    }
}
