use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;
use tracing::info;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SCANNED_TOTAL: IntCounter = IntCounter::new(
        "mailuminati_guardian_scanned_total",
        "Total number of emails scanned"
    )
    .unwrap();
    pub static ref LOCAL_MATCH_TOTAL: IntCounter = IntCounter::new(
        "mailuminati_guardian_local_match_total",
        "Total number of emails matched locally"
    )
    .unwrap();
    pub static ref ORACLE_MATCH_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "mailuminati_guardian_oracle_match_total",
            "Total number of emails matched via oracle"
        ),
        &["type"]
    )
    .unwrap();
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "mailuminati_guardian_cache_hits_total",
            "Total number of cache hits"
        ),
        &["result"]
    )
    .unwrap();
}

/// Register every engine counter with the exposition registry. Failure here
/// is fatal at startup: a node that cannot account for its verdicts must not
/// serve traffic.
pub fn register_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(SCANNED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LOCAL_MATCH_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ORACLE_MATCH_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone()))?;
    Ok(())
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Periodically log a snapshot of the engine counters so operators without a
/// Prometheus scraper still see activity in the journal.
pub async fn stats_worker() {
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    // The first tick fires immediately; skip it so startup logs stay quiet.
    tick.tick().await;

    loop {
        tick.tick().await;
        info!(
            scanned = SCANNED_TOTAL.get(),
            local_matches = LOCAL_MATCH_TOTAL.get(),
            oracle_complete = ORACLE_MATCH_TOTAL.with_label_values(&["complete"]).get(),
            oracle_partial = ORACLE_MATCH_TOTAL.with_label_values(&["partial"]).get(),
            cache_positive = CACHE_HITS_TOTAL.with_label_values(&["positive"]).get(),
            cache_negative = CACHE_HITS_TOTAL.with_label_values(&["negative"]).get(),
            "engine statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_and_exposition() {
        // Registration may already have happened in another test; both
        // outcomes leave the registry serving the guardian counters.
        let _ = register_metrics();

        SCANNED_TOTAL.inc();
        ORACLE_MATCH_TOTAL.with_label_values(&["partial"]).inc();
        CACHE_HITS_TOTAL.with_label_values(&["positive"]).inc();

        let text = gather_metrics();
        assert!(text.contains("mailuminati_guardian_scanned_total"));
        assert!(text.contains("mailuminati_guardian_oracle_match_total"));
        assert!(text.contains("type=\"partial\""));
        assert!(text.contains("result=\"positive\""));
    }

    #[test]
    fn test_double_registration_fails() {
        let first = register_metrics();
        let second = register_metrics();
        // Whichever call ran first succeeded; the later one must error
        // instead of silently double-counting.
        assert!(first.is_err() || second.is_err());
    }
}
