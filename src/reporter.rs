use serde::Deserialize;
use tracing::{info, warn};

use crate::analyzer::{DISTANCE_THRESHOLD, MIN_BAND_MATCHES};
use crate::config::GuardianConfig;
use crate::distance::distance_batch;
use crate::fingerprint::extract_bands;
use crate::store::{Store, LOCAL_FRAG_PREFIX};

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    #[serde(rename = "message-id")]
    pub message_id: String,
    pub report_type: String,
}

/// Apply local learning for a spam/ham report over the fingerprints captured
/// at scan time. Returns true when every piece of new information was
/// already known locally (a ≤ threshold neighbor existed), in which case the
/// report is not forwarded to the oracle.
pub async fn apply_local_learning(
    store: &Store,
    config: &GuardianConfig,
    hashes: &[String],
    report_type: &str,
) -> bool {
    if report_type != "spam" && report_type != "ham" {
        return false;
    }

    let mut skip_oracle = false;
    let retention = config.retention();

    for hash in hashes {
        // Find the canonical local representative: the nearest stored
        // digest within the distance threshold, or the reported digest
        // itself when nothing close is indexed yet.
        let bands = extract_bands(hash);
        let matching = store
            .matching_band_keys(LOCAL_FRAG_PREFIX, &bands)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "local band check failed during report");
                Vec::new()
            });

        let mut best_hash: Option<String> = None;
        let mut best_dist = i32::MAX;

        if matching.len() >= MIN_BAND_MATCHES {
            let candidates = store.band_members(&matching).await.unwrap_or_else(|e| {
                warn!(error = %e, "local band lookup failed during report");
                Vec::new()
            });
            if !candidates.is_empty() {
                if let Ok(distances) = distance_batch(hash, &candidates) {
                    for (candidate, dist) in distances {
                        if dist < best_dist {
                            best_dist = dist;
                            best_hash = Some(candidate);
                        }
                    }
                }
            }
        }

        let neighbor_known = best_dist <= DISTANCE_THRESHOLD;
        let target = match (neighbor_known, best_hash) {
            (true, Some(best)) => best,
            _ => hash.clone(),
        };

        match report_type {
            "spam" => {
                if neighbor_known {
                    // The campaign is already represented locally; learning
                    // strengthens it, forwarding would only amplify.
                    skip_oracle = true;
                }

                // Weight is snapshotted once so a SIGHUP mid-report cannot
                // mix old and new values across hashes.
                let weight = config.spam_weight();
                match store.score_incr(&target, weight, retention).await {
                    Ok(score) => info!(hash = %target, score, "learned spam hash"),
                    Err(e) => warn!(hash = %target, error = %e, "failed to update spam score"),
                }
                if let Err(e) = store.index_add(&target, retention).await {
                    warn!(hash = %target, error = %e, "failed to refresh band index");
                }
            }
            "ham" => {
                // Only punish an existing entry; a ham report for an unknown
                // digest has nothing to correct locally.
                if neighbor_known {
                    let weight = config.ham_weight();
                    match store.score_decr(&target, weight, retention).await {
                        Ok(score) => info!(hash = %target, score, "ham report"),
                        Err(e) => warn!(hash = %target, error = %e, "failed to update ham score"),
                    }
                }
            }
            _ => unreachable!(),
        }
    }

    skip_oracle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_request_parsing() {
        let req: ReportRequest =
            serde_json::from_str(r#"{"message-id": "<abc@x>", "report_type": "spam"}"#).unwrap();
        assert_eq!(req.message_id, "<abc@x>");
        assert_eq!(req.report_type, "spam");

        assert!(serde_json::from_str::<ReportRequest>("{invalid json").is_err());
        assert!(serde_json::from_str::<ReportRequest>(r#"{"report_type": "spam"}"#).is_err());
    }
}
