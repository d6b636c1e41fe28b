use tracing::{info, warn};

use crate::config::GuardianConfig;
use crate::distance::distance_batch;
use crate::fingerprint::extract_bands;
use crate::metrics;
use crate::oracle::{AnalysisResult, OracleClient};
use crate::store::{
    Store, LOCAL_FRAG_PREFIX, ORACLE_CACHE_FRAG_PREFIX, ORACLE_FRAG_PREFIX,
};

/// Two digests within this TLSH distance share a verdict.
pub const DISTANCE_THRESHOLD: i32 = 70;

/// Minimum shared LSH bands before a candidate set is worth computing
/// distances over; fewer matches are indistinguishable from noise.
pub const MIN_BAND_MATCHES: usize = 4;

/// Per-request header context carried into the match logs.
pub struct AnalysisContext<'a> {
    pub message_id: &'a str,
    pub subject: &'a str,
}

/// Run the tiered proximity search over the message's fingerprints, in
/// order: oracle decision cache, oracle-cache band proximity, local
/// reputation, oracle LSH adjudication. The first spam verdict wins; store
/// failures downgrade to "no data" and never fail the request.
pub async fn classify(
    store: &Store,
    oracle: &OracleClient,
    config: &GuardianConfig,
    node_id: &str,
    signatures: &[String],
    ctx: &AnalysisContext<'_>,
) -> AnalysisResult {
    let mut final_result = AnalysisResult::allow();

    'signatures: for sig in signatures {
        // Tier A: prior oracle verdict for this exact digest.
        match store.oracle_cache_get(sig).await {
            Ok(Some(cached)) if cached.is_spam() => {
                metrics::CACHE_HITS_TOTAL.with_label_values(&["positive"]).inc();
                final_result = cached;
                break 'signatures;
            }
            Ok(Some(_)) => {
                metrics::CACHE_HITS_TOTAL.with_label_values(&["negative"]).inc();
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "oracle decision cache unavailable"),
        }

        let bands = extract_bands(sig);

        // Tier B: proximity against spam variants from recent oracle queries.
        match store
            .matching_band_keys(ORACLE_CACHE_FRAG_PREFIX, &bands)
            .await
        {
            Ok(keys) if keys.len() >= MIN_BAND_MATCHES => {
                let members = store.band_members(&keys).await.unwrap_or_else(|e| {
                    warn!(error = %e, "oracle cache band lookup failed");
                    Vec::new()
                });
                if !members.is_empty() {
                    if let Ok(distances) = distance_batch(sig, &members) {
                        for (hash, dist) in &distances {
                            if *dist <= DISTANCE_THRESHOLD {
                                info!(
                                    match_hash = %hash,
                                    distance = *dist,
                                    subject = ctx.subject,
                                    message_id = ctx.message_id,
                                    "oracle cache proximity match"
                                );
                                metrics::CACHE_HITS_TOTAL
                                    .with_label_values(&["positive"])
                                    .inc();
                                final_result = AnalysisResult::spam("oracle_cache_match", *dist);
                                break 'signatures;
                            }
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "oracle cache band check failed"),
        }

        // Tier C: local reputation built from operator reports.
        let local_keys = store
            .matching_band_keys(LOCAL_FRAG_PREFIX, &bands)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "local band check failed");
                Vec::new()
            });

        if local_keys.len() >= MIN_BAND_MATCHES {
            // A positive lookup is the retention signal: every matched band
            // key gets its TTL pushed out.
            if let Err(e) = store.refresh_band_keys(&local_keys, config.retention()).await {
                warn!(error = %e, "failed to refresh local band TTLs");
            }

            let members = store.band_members(&local_keys).await.unwrap_or_else(|e| {
                warn!(error = %e, "local band lookup failed");
                Vec::new()
            });
            if !members.is_empty() {
                if let Ok(distances) = distance_batch(sig, &members) {
                    let threshold = config.spam_threshold();
                    for (hash, dist) in &distances {
                        if *dist <= DISTANCE_THRESHOLD {
                            let score = store.score_get(hash).await.unwrap_or(0);
                            if score >= threshold {
                                info!(
                                    match_hash = %hash,
                                    score,
                                    distance = *dist,
                                    subject = ctx.subject,
                                    message_id = ctx.message_id,
                                    "local spam detected"
                                );
                                metrics::LOCAL_MATCH_TOTAL.inc();
                                final_result = AnalysisResult::spam("local_spam", *dist);
                                break 'signatures;
                            }
                        }
                    }
                }
            }

            // Bands collided but nothing scored high enough: remember the
            // proximity and move to the next fingerprint without asking the
            // oracle about this one.
            final_result.proximity_match = true;
            continue 'signatures;
        }

        // Tier D: oracle LSH collision, adjudicated by the oracle itself.
        let oracle_keys = store
            .matching_band_keys(ORACLE_FRAG_PREFIX, &bands)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "oracle band check failed");
                Vec::new()
            });

        if oracle_keys.len() >= MIN_BAND_MATCHES {
            let verdict = oracle.decision(node_id, sig).await;
            if verdict.is_spam() {
                info!(
                    signature = %sig,
                    subject = ctx.subject,
                    message_id = ctx.message_id,
                    "oracle spam detected"
                );
                metrics::ORACLE_MATCH_TOTAL
                    .with_label_values(&["complete"])
                    .inc();
                if let Err(e) = store.oracle_cache_put(sig, &verdict).await {
                    warn!(error = %e, "failed to cache oracle verdict");
                }
                final_result = verdict;
                break 'signatures;
            }

            info!(
                signature = %sig,
                subject = ctx.subject,
                message_id = ctx.message_id,
                "oracle partial match"
            );
            metrics::ORACLE_MATCH_TOTAL
                .with_label_values(&["partial"])
                .inc();
            final_result.proximity_match = true;
        }
    }

    final_result
}
