use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analyzer::{self, AnalysisContext};
use crate::config::GuardianConfig;
use crate::fingerprint::{extract_bodies, message_fingerprints, parse_message};
use crate::image_analyzer::{should_analyze_images, ImageAnalyzer};
use crate::metrics;
use crate::oracle::OracleClient;
use crate::reporter::{self, ReportRequest};
use crate::store::{canonical_message_id, sha1_hex, Store};

/// Hard cap on inbound message size; larger bodies are rejected.
pub const MAX_PROCESS_SIZE: usize = 15 * 1024 * 1024;

pub struct AppState {
    pub store: Store,
    pub oracle: OracleClient,
    pub images: ImageAnalyzer,
    pub config: Arc<GuardianConfig>,
    pub node_id: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/analyze", post(analyze))
        .route("/report", post(report))
        .route("/status", get(status))
        .route("/metrics", get(metrics_text))
        .layer(DefaultBodyLimit::max(MAX_PROCESS_SIZE))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    proximity_match: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    distance: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    hashes: Vec<String>,
}

async fn analyze(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    metrics::SCANNED_TOTAL.inc();

    let Some(message) = parse_message(&body) else {
        return (StatusCode::BAD_REQUEST, "Invalid MIME").into_response();
    };

    let message_id = canonical_message_id(message.message_id().unwrap_or(""));
    let subject = message.subject().unwrap_or("").to_string();

    let (text, html) = extract_bodies(&message);
    let mut signatures = message_fingerprints(&message, &text, &html);

    if state.config.image_analysis_enabled() && should_analyze_images(&html) {
        if let Some(sig) = state.images.best_image_digest(&state.store, &html).await {
            signatures.push(sig);
        }
    }

    // Persist the scan record off the request path; a report may reference
    // it later, but the MTA is waiting on this response right now.
    {
        let store = state.store.clone();
        let msgid_sha = sha1_hex(&message_id);
        let hashes = signatures.clone();
        tokio::spawn(async move {
            if let Err(e) = store.scan_put(&msgid_sha, hashes).await {
                warn!(error = %e, "failed to persist scan record");
            }
        });
    }

    let ctx = AnalysisContext {
        message_id: &message_id,
        subject: &subject,
    };
    let verdict = analyzer::classify(
        &state.store,
        &state.oracle,
        &state.config,
        &state.node_id,
        &signatures,
        &ctx,
    )
    .await;

    let response = AnalyzeResponse {
        action: verdict.action,
        label: verdict.label,
        proximity_match: verdict.proximity_match,
        distance: verdict.distance,
        hashes: signatures,
    };
    (StatusCode::OK, Json(response)).into_response()
}

async fn report(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    info!(path = "/report", "request");

    let Ok(request) = serde_json::from_slice::<ReportRequest>(&body) else {
        return (StatusCode::BAD_REQUEST, "Invalid JSON body").into_response();
    };

    let message_id = canonical_message_id(&request.message_id);
    let msgid_sha = sha1_hex(&message_id);

    match state.store.report_mark(&msgid_sha, &request.report_type).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                report_type = %request.report_type,
                message_id = %message_id,
                "duplicate report ignored"
            );
            return (
                StatusCode::CONFLICT,
                Json(json!({"status": "duplicate", "message": "Already reported"})),
            )
                .into_response();
        }
        Err(e) => {
            warn!(error = %e, "store error while marking report");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Store error").into_response();
        }
    }

    let record = match state.store.scan_get(&msgid_sha).await {
        Ok(Some(record)) => record,
        Ok(None) => return (StatusCode::NOT_FOUND, "No scan data found").into_response(),
        Err(e) => {
            warn!(error = %e, "store error while fetching scan record");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Store error").into_response();
        }
    };

    if record.hashes.is_empty() {
        return (StatusCode::BAD_REQUEST, "No hashes to report").into_response();
    }

    info!(
        report_type = %request.report_type,
        message_id = %message_id,
        "processing report"
    );
    let known_locally = reporter::apply_local_learning(
        &state.store,
        &state.config,
        &record.hashes,
        &request.report_type,
    )
    .await;

    if request.report_type == "spam" && known_locally {
        info!(message_id = %message_id, "skip oracle report (already known)");
        return (
            StatusCode::OK,
            Json(json!({"status": "skipped_oracle", "reason": "known_locally"})),
        )
            .into_response();
    }

    match state
        .oracle
        .report(&state.node_id, &record.hashes, &request.report_type)
        .await
    {
        Ok((status, body)) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "oracle report failed");
            (StatusCode::SERVICE_UNAVAILABLE, "Oracle unreachable").into_response()
        }
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    info!(path = "/status", "request");

    match state.store.current_seq().await {
        Ok(current_seq) => (
            StatusCode::OK,
            [(header::CACHE_CONTROL, "no-store")],
            Json(json!({
                "node_id": state.node_id,
                "current_seq": current_seq,
                "version": crate::ENGINE_VERSION,
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "store unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, "Redis unavailable").into_response()
        }
    }
}

async fn metrics_text() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_response_omits_empty_fields() {
        let allow = AnalyzeResponse {
            action: "allow".to_string(),
            label: None,
            proximity_match: false,
            distance: None,
            hashes: Vec::new(),
        };
        let json = serde_json::to_string(&allow).unwrap();
        assert_eq!(json, r#"{"action":"allow","proximity_match":false}"#);
    }

    #[test]
    fn test_analyze_response_full_shape() {
        let spam = AnalyzeResponse {
            action: "spam".to_string(),
            label: Some("local_spam".to_string()),
            proximity_match: true,
            distance: Some(12),
            hashes: vec!["T1AAAA".to_string()],
        };
        let json = serde_json::to_string(&spam).unwrap();
        assert!(json.contains(r#""label":"local_spam""#));
        assert!(json.contains(r#""distance":12"#));
        assert!(json.contains(r#""hashes":["T1AAAA"]"#));
    }
}
