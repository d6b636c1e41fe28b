//! Key/value store operations. The external store is the shared memory of
//! the engine; no learned state is cached in-process.
//!
//! Key schema:
//!   mi_f:<band>            oracle LSH band index (presence only)
//!   oc_f:<band>            oracle-cache band index (set of digests)
//!   lg_f:<band>            local learning band index (set of digests)
//!   lg_s:<digest>          local reputation score (signed integer)
//!   mi:msgid:<sha1>        scan record  {hashes, timestamp}
//!   mi:rpt:<sha1>:<type>   report dedup marker
//!   mi:img:<sha1(url)>     external image digest cache  "<size>|<digest>"
//!   mi:oracle_cache:<F>    oracle decision cache (JSON AnalysisResult)
//!   mi_meta:id             node id (UUID, stable)
//!   mi_meta:v              oracle sync sequence

use anyhow::{Context, Result};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

use crate::fingerprint::extract_bands;
use crate::oracle::{AnalysisResult, SyncOp};

pub const ORACLE_FRAG_PREFIX: &str = "mi_f:";
pub const ORACLE_CACHE_FRAG_PREFIX: &str = "oc_f:";
pub const LOCAL_FRAG_PREFIX: &str = "lg_f:";
pub const LOCAL_SCORE_PREFIX: &str = "lg_s:";
pub const SCAN_PREFIX: &str = "mi:msgid:";
pub const REPORT_PREFIX: &str = "mi:rpt:";
pub const IMAGE_CACHE_PREFIX: &str = "mi:img:";
pub const ORACLE_CACHE_PREFIX: &str = "mi:oracle_cache:";
pub const META_NODE_ID: &str = "mi_meta:id";
pub const META_SEQ: &str = "mi_meta:v";

/// TTL for scan records, report dedup markers, the image cache and the
/// oracle decision cache.
pub const SHORT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Fingerprints recorded for a message at analysis time, fetched back when a
/// report names the same Message-ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub hashes: Vec<String>,
    pub timestamp: i64,
}

pub fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Message-IDs arrive from reporters with or without the RFC822 angle
/// brackets; both the scan and the report path hash the bracketed form.
pub fn canonical_message_id(message_id: &str) -> String {
    if message_id.is_empty() {
        return String::new();
    }
    let mut canonical = String::with_capacity(message_id.len() + 2);
    if !message_id.starts_with('<') {
        canonical.push('<');
    }
    canonical.push_str(message_id);
    if !message_id.ends_with('>') {
        canonical.push('>');
    }
    canonical
}

pub fn parse_image_cache_value(value: &str) -> Option<(u64, String)> {
    let (size, digest) = value.split_once('|')?;
    let size = size.parse::<u64>().ok()?;
    if digest.is_empty() {
        return None;
    }
    Some((size, digest.to_string()))
}

#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
}

impl Store {
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(addr)
            .with_context(|| format!("invalid store address {addr}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("store connection failed")?;
        Ok(Self { conn })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    // ── Node identity and sync sequence ──────────────────────────────────

    /// Read the node id, creating and persisting one on first boot. The
    /// sync sequence is seeded to 0 alongside a fresh id.
    pub async fn init_node(&self) -> Result<String> {
        let mut conn = self.conn.clone();
        let existing: Option<String> = conn.get(META_NODE_ID).await?;
        if let Some(id) = existing.filter(|id| !id.is_empty()) {
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        let _: () = conn.set(META_NODE_ID, &id).await?;
        let _: () = conn.set(META_SEQ, 0).await?;
        Ok(id)
    }

    pub async fn current_seq(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        let seq: Option<i64> = conn.get(META_SEQ).await?;
        Ok(seq.unwrap_or(0))
    }

    // ── Band indexes ─────────────────────────────────────────────────────

    /// Pipelined presence check: which of the given bands exist under the
    /// given key prefix. Returns the full key names that matched.
    pub async fn matching_band_keys(&self, prefix: &str, bands: &[String]) -> Result<Vec<String>> {
        if bands.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = bands.iter().map(|b| format!("{prefix}{b}")).collect();
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.exists(key);
        }

        let mut conn = self.conn.clone();
        let present: Vec<bool> = pipe.query_async(&mut conn).await?;

        Ok(keys
            .into_iter()
            .zip(present)
            .filter_map(|(key, hit)| hit.then_some(key))
            .collect())
    }

    /// Union of the digest sets stored under the given band keys, first
    /// occurrence order preserved.
    pub async fn band_members(&self, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.smembers(key);
        }

        let mut conn = self.conn.clone();
        let sets: Vec<Vec<String>> = pipe.query_async(&mut conn).await?;

        let mut seen = HashSet::new();
        let mut members = Vec::new();
        for digest in sets.into_iter().flatten() {
            if seen.insert(digest.clone()) {
                members.push(digest);
            }
        }
        Ok(members)
    }

    /// Extend the TTL on a set of band keys. Retention through refresh is
    /// the only mechanism keeping learned entries alive.
    pub async fn refresh_band_keys(&self, keys: &[String], ttl: Duration) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.expire(key, ttl.as_secs() as i64).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Add a digest to the local band index under every band it derives,
    /// refreshing band and score TTLs.
    pub async fn index_add(&self, digest: &str, ttl: Duration) -> Result<()> {
        let bands = extract_bands(digest);
        if bands.is_empty() {
            return Ok(());
        }

        let secs = ttl.as_secs() as i64;
        let mut pipe = redis::pipe();
        for band in &bands {
            let key = format!("{LOCAL_FRAG_PREFIX}{band}");
            pipe.sadd(&key, digest).ignore();
            pipe.expire(&key, secs).ignore();
        }
        pipe.expire(format!("{LOCAL_SCORE_PREFIX}{digest}"), secs)
            .ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    // ── Reputation scores ────────────────────────────────────────────────

    pub async fn score_incr(&self, digest: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let key = format!("{LOCAL_SCORE_PREFIX}{digest}");
        let mut conn = self.conn.clone();
        let score: i64 = conn.incr(&key, delta).await?;
        let _: i64 = conn.expire(&key, ttl.as_secs() as i64).await?;
        Ok(score)
    }

    pub async fn score_decr(&self, digest: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let key = format!("{LOCAL_SCORE_PREFIX}{digest}");
        let mut conn = self.conn.clone();
        let score: i64 = conn.decr(&key, delta).await?;
        let _: i64 = conn.expire(&key, ttl.as_secs() as i64).await?;
        Ok(score)
    }

    pub async fn score_get(&self, digest: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let score: Option<i64> = conn.get(format!("{LOCAL_SCORE_PREFIX}{digest}")).await?;
        Ok(score.unwrap_or(0))
    }

    // ── Scan records and report dedup ────────────────────────────────────

    pub async fn scan_put(&self, msgid_sha: &str, hashes: Vec<String>) -> Result<()> {
        let record = ScanRecord {
            hashes,
            timestamp: Utc::now().timestamp(),
        };
        let payload = serde_json::to_string(&record)?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(
                format!("{SCAN_PREFIX}{msgid_sha}"),
                payload,
                SHORT_TTL.as_secs(),
            )
            .await?;
        Ok(())
    }

    pub async fn scan_get(&self, msgid_sha: &str) -> Result<Option<ScanRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(format!("{SCAN_PREFIX}{msgid_sha}")).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Best-effort dedup marker. Returns true on first insert, false when
    /// the same (message, type) was already reported within the TTL.
    pub async fn report_mark(&self, msgid_sha: &str, report_type: &str) -> Result<bool> {
        let key = format!("{REPORT_PREFIX}{msgid_sha}:{report_type}");
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(SHORT_TTL.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    // ── External image cache ─────────────────────────────────────────────

    pub async fn image_cache_get(&self, url: &str) -> Result<Option<(u64, String)>> {
        let key = format!("{IMAGE_CACHE_PREFIX}{}", sha1_hex(url));
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await?;
        Ok(raw.as_deref().and_then(parse_image_cache_value))
    }

    pub async fn image_cache_put(&self, url: &str, size: u64, digest: &str) -> Result<()> {
        let key = format!("{IMAGE_CACHE_PREFIX}{}", sha1_hex(url));
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(&key, format!("{size}|{digest}"), SHORT_TTL.as_secs())
            .await?;
        Ok(())
    }

    // ── Oracle decision cache and replicated band indexes ────────────────

    pub async fn oracle_cache_get(&self, digest: &str) -> Result<Option<AnalysisResult>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(format!("{ORACLE_CACHE_PREFIX}{digest}")).await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Materialize a confirmed oracle verdict into the decision cache and
    /// the oracle-cache band index. These replicas are only ever written
    /// here and by sync; local learning never touches them.
    pub async fn oracle_cache_put(&self, digest: &str, result: &AnalysisResult) -> Result<()> {
        let payload = serde_json::to_string(result)?;
        let secs = SHORT_TTL.as_secs() as i64;

        let mut pipe = redis::pipe();
        pipe.cmd("SET")
            .arg(format!("{ORACLE_CACHE_PREFIX}{digest}"))
            .arg(payload)
            .arg("EX")
            .arg(secs)
            .ignore();
        for band in extract_bands(digest) {
            let key = format!("{ORACLE_CACHE_FRAG_PREFIX}{band}");
            pipe.sadd(&key, digest).ignore();
            pipe.expire(&key, secs).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Apply one sync delta batch: band adds/removes on the oracle LSH
    /// index, with the new sequence written in the same pipeline so a
    /// half-applied batch is replayed from the old sequence on retry.
    pub async fn apply_sync_ops(&self, ops: &[SyncOp], new_seq: i64) -> Result<()> {
        let mut pipe = redis::pipe();
        for op in ops {
            for band in &op.bands {
                let key = format!("{ORACLE_FRAG_PREFIX}{band}");
                match op.action.as_str() {
                    "add" => {
                        pipe.set(&key, 1).ignore();
                    }
                    "remove" => {
                        pipe.del(&key).ignore();
                    }
                    _ => {}
                }
            }
        }
        pipe.set(META_SEQ, new_seq).ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Drop the whole replicated oracle LSH index ahead of a full rebuild.
    pub async fn flush_oracle_bands(&self) -> Result<()> {
        let mut scan_conn = self.conn.clone();
        let pattern = format!("{ORACLE_FRAG_PREFIX}*");
        let keys: Vec<String> = {
            let mut iter = scan_conn.scan_match::<_, String>(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut conn = self.conn.clone();
        for chunk in keys.chunks(500) {
            let _: () = conn.del(chunk).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_hex_known_value() {
        // sha1("<a@x>") — the scan key digest for a canonical Message-ID.
        assert_eq!(sha1_hex("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(sha1_hex("").len(), 40);
    }

    #[test]
    fn test_canonical_message_id() {
        assert_eq!(canonical_message_id("a@x"), "<a@x>");
        assert_eq!(canonical_message_id("<a@x>"), "<a@x>");
        assert_eq!(canonical_message_id("<a@x"), "<a@x>");
        assert_eq!(canonical_message_id("a@x>"), "<a@x>");
        assert_eq!(canonical_message_id(""), "");
    }

    #[test]
    fn test_parse_image_cache_value() {
        assert_eq!(
            parse_image_cache_value("45056|T1ABCDEF"),
            Some((45056, "T1ABCDEF".to_string()))
        );
        assert_eq!(parse_image_cache_value("not-a-size|T1AB"), None);
        assert_eq!(parse_image_cache_value("1234|"), None);
        assert_eq!(parse_image_cache_value("no-separator"), None);
    }

    #[test]
    fn test_scan_record_roundtrip() {
        let record = ScanRecord {
            hashes: vec!["T1AAAA".to_string(), "T1BBBB".to_string()],
            timestamp: 1_700_000_000,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"hashes\""));
        assert!(json.contains("\"timestamp\""));

        let back: ScanRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hashes, record.hashes);
        assert_eq!(back.timestamp, record.timestamp);
    }
}
