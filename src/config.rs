use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mailuminati-guardian/guardian.conf";
pub const DEFAULT_ORACLE_URL: &str = "https://oracle.mailuminati.com";
pub const DEFAULT_LOCAL_RETENTION_DAYS: u64 = 15;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Runtime configuration. The raw `KEY=VALUE` map sits behind a
/// reader/writer lock and is only written on startup and SIGHUP; the knobs
/// the request path reads on every call live in atomics so a reload can
/// never tear a half-applied value into a running request.
pub struct GuardianConfig {
    values: RwLock<HashMap<String, String>>,
    spam_weight: AtomicI64,
    ham_weight: AtomicI64,
    spam_threshold: AtomicI64,
    retention_secs: AtomicU64,
    image_analysis: AtomicBool,
}

impl GuardianConfig {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            spam_weight: AtomicI64::new(1),
            ham_weight: AtomicI64::new(2),
            spam_threshold: AtomicI64::new(1),
            retention_secs: AtomicU64::new(DEFAULT_LOCAL_RETENTION_DAYS * SECS_PER_DAY),
            image_analysis: AtomicBool::new(true),
        }
    }

    /// Load (or reload) the `KEY=VALUE` config file. A missing file is not an
    /// error; the environment and built-in defaults still apply.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let mut parsed = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_string();
                let mut value = value.trim();
                if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                    value = &value[1..value.len() - 1];
                }
                parsed.insert(key, value.to_string());
            }
        }

        // Full replacement so keys removed from the file fall back to env.
        let mut values = self.values.write().unwrap();
        *values = parsed;
        Ok(())
    }

    /// Resolve a key: config map, then process environment, then default.
    pub fn get(&self, key: &str, default: &str) -> String {
        if let Some(v) = self.values.read().unwrap().get(key) {
            return v.clone();
        }
        match std::env::var(key) {
            Ok(v) if !v.is_empty() => v,
            _ => default.to_string(),
        }
    }

    /// Re-derive the hot-path knobs from the current map/env. Called at
    /// startup and on SIGHUP.
    pub fn refresh(&self) {
        let spam = self
            .get("SPAM_WEIGHT", "1")
            .parse::<i64>()
            .unwrap_or(1)
            .max(0);
        self.spam_weight.store(spam, Ordering::SeqCst);

        let ham = self
            .get("HAM_WEIGHT", "2")
            .parse::<i64>()
            .unwrap_or(2)
            .max(0);
        self.ham_weight.store(ham, Ordering::SeqCst);

        // Safety: a threshold below 1 would flag every indexed digest.
        let threshold = self
            .get("SPAM_THRESHOLD", "1")
            .parse::<i64>()
            .unwrap_or(1)
            .max(1);
        self.spam_threshold.store(threshold, Ordering::SeqCst);

        let days = match self.get("LOCAL_RETENTION_DAYS", "15").parse::<u64>() {
            Ok(d) if d > 0 => d,
            _ => DEFAULT_LOCAL_RETENTION_DAYS,
        };
        self.retention_secs
            .store(days * SECS_PER_DAY, Ordering::SeqCst);

        let image = self
            .get("MI_ENABLE_IMAGE_ANALYSIS", "true")
            .to_lowercase()
            == "true";
        self.image_analysis.store(image, Ordering::SeqCst);

        info!(
            spam_weight = spam,
            ham_weight = ham,
            threshold,
            retention_days = days,
            image_analysis = image,
            "logic configuration refreshed"
        );
    }

    pub fn spam_weight(&self) -> i64 {
        self.spam_weight.load(Ordering::SeqCst)
    }

    pub fn ham_weight(&self) -> i64 {
        self.ham_weight.load(Ordering::SeqCst)
    }

    pub fn spam_threshold(&self) -> i64 {
        self.spam_threshold.load(Ordering::SeqCst)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs.load(Ordering::SeqCst))
    }

    pub fn image_analysis_enabled(&self) -> bool {
        self.image_analysis.load(Ordering::SeqCst)
    }

    pub fn redis_addr(&self) -> String {
        format!(
            "redis://{}:{}",
            self.get("REDIS_HOST", "localhost"),
            self.get("REDIS_PORT", "6379")
        )
    }

    pub fn bind_addr(&self) -> String {
        format!(
            "{}:{}",
            self.get("GUARDIAN_BIND_ADDR", "127.0.0.1"),
            self.get("PORT", "12421")
        )
    }

    pub fn oracle_url(&self) -> String {
        self.get("ORACLE_URL", DEFAULT_ORACLE_URL)
    }
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_config(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "guardian-conf-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_file_parsing_quotes_and_comments() {
        let path = write_temp_config(
            "# a comment\n\
             SPAM_WEIGHT = 3\n\
             ORACLE_URL=\"https://oracle.example.com\"\n\
             \n\
             MALFORMED LINE WITHOUT EQUALS\n",
        );

        let config = GuardianConfig::new();
        config.load_file(&path).unwrap();

        assert_eq!(config.get("SPAM_WEIGHT", "1"), "3");
        assert_eq!(
            config.get("ORACLE_URL", DEFAULT_ORACLE_URL),
            "https://oracle.example.com"
        );
        assert_eq!(config.get("UNSET_KEY_FOR_TEST", "fallback"), "fallback");

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let config = GuardianConfig::new();
        assert!(config
            .load_file("/nonexistent/guardian-test.conf")
            .is_ok());
    }

    #[test]
    fn test_refresh_applies_weights_and_clamps_threshold() {
        let path = write_temp_config(
            "SPAM_WEIGHT=5\nHAM_WEIGHT=7\nSPAM_THRESHOLD=0\nLOCAL_RETENTION_DAYS=2\n",
        );

        let config = GuardianConfig::new();
        config.load_file(&path).unwrap();
        config.refresh();

        assert_eq!(config.spam_weight(), 5);
        assert_eq!(config.ham_weight(), 7);
        assert_eq!(config.spam_threshold(), 1, "threshold must clamp to >= 1");
        assert_eq!(config.retention(), Duration::from_secs(2 * SECS_PER_DAY));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_refresh_rejects_invalid_values() {
        let path = write_temp_config(
            "SPAM_WEIGHT=not-a-number\nLOCAL_RETENTION_DAYS=0\nMI_ENABLE_IMAGE_ANALYSIS=FALSE\n",
        );

        let config = GuardianConfig::new();
        config.load_file(&path).unwrap();
        config.refresh();

        assert_eq!(config.spam_weight(), 1);
        assert_eq!(
            config.retention(),
            Duration::from_secs(DEFAULT_LOCAL_RETENTION_DAYS * SECS_PER_DAY)
        );
        assert!(!config.image_analysis_enabled());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_reload_replaces_map() {
        let path = write_temp_config("SPAM_WEIGHT=9\n");
        let config = GuardianConfig::new();
        config.load_file(&path).unwrap();
        assert_eq!(config.get("SPAM_WEIGHT", "1"), "9");

        std::fs::write(&path, "HAM_WEIGHT=4\n").unwrap();
        config.load_file(&path).unwrap();

        // SPAM_WEIGHT disappeared from the file, so the default applies again.
        assert_eq!(config.get("SPAM_WEIGHT", "1"), "1");
        assert_eq!(config.get("HAM_WEIGHT", "2"), "4");

        std::fs::remove_file(path).ok();
    }
}
