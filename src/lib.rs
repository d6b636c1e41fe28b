pub mod analyzer;
pub mod config;
pub mod distance;
pub mod fingerprint;
pub mod image_analyzer;
pub mod metrics;
pub mod normalization;
pub mod oracle;
pub mod reporter;
pub mod server;
pub mod store;

pub const ENGINE_VERSION: &str = "0.6.0";

// Re-export the types the binary and integration callers compose.
pub use analyzer::{AnalysisContext, DISTANCE_THRESHOLD, MIN_BAND_MATCHES};
pub use config::GuardianConfig;
pub use image_analyzer::ImageAnalyzer;
pub use oracle::{AnalysisResult, OracleClient};
pub use server::AppState;
pub use store::Store;
