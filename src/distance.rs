use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::str::FromStr;
use tlsh2::TlshDefault;
use tracing::debug;

/// Re-hydrate a digest string (as stored in the index) into a comparable form.
pub fn parse_digest(digest: &str) -> Option<TlshDefault> {
    TlshDefault::from_str(digest).ok()
}

/// Standard TLSH distance between two digests, without the file-length
/// penalty. Lower is more similar; 0 means identical digests.
pub fn distance(a: &str, b: &str) -> Result<i32> {
    let ta = parse_digest(a).ok_or_else(|| anyhow!("invalid TLSH digest: {a}"))?;
    let tb = parse_digest(b).ok_or_else(|| anyhow!("invalid TLSH digest: {b}"))?;
    Ok(ta.diff(&tb, false))
}

/// Distances from `target` to every candidate. Candidates that fail to parse
/// (index corruption, truncated writes) are skipped rather than failing the
/// whole batch.
pub fn distance_batch(target: &str, candidates: &[String]) -> Result<HashMap<String, i32>> {
    let t = parse_digest(target).ok_or_else(|| anyhow!("invalid TLSH digest: {target}"))?;

    let mut distances = HashMap::with_capacity(candidates.len());
    for candidate in candidates {
        match parse_digest(candidate) {
            Some(tc) => {
                distances.insert(candidate.clone(), t.diff(&tc, false));
            }
            None => debug!(digest = %candidate, "skipping unparseable candidate digest"),
        }
    }
    Ok(distances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::compute_tlsh;

    fn digest_of(text: &str) -> String {
        compute_tlsh(text.as_bytes()).expect("digest")
    }

    #[test]
    fn test_zero_self_distance() {
        let h = digest_of(&"spam message offering quick money ".repeat(10));
        assert_eq!(distance(&h, &h).unwrap(), 0);
    }

    #[test]
    fn test_similar_texts_are_close() {
        let t1 = "This is a very important spam message to make you earn money quickly.".repeat(5);
        let t2 = "This is a very important spam message to make you earn money quickly!".repeat(5);
        let d = distance(&digest_of(&t1), &digest_of(&t2)).unwrap();
        assert!((0..=150).contains(&d), "similar texts too far apart: {d}");
    }

    #[test]
    fn test_invalid_digest_is_an_error() {
        let h = digest_of(&"some perfectly ordinary message body text ".repeat(10));
        assert!(distance("not-a-digest", &h).is_err());
        assert!(distance(&h, "T1zzzz").is_err());
    }

    #[test]
    fn test_batch_skips_unparseable_candidates() {
        let h1 = digest_of(&"first unique message body with plenty of text ".repeat(8));
        let h2 = digest_of(&"second unique message body with plenty of text ".repeat(8));
        let candidates = vec![h2.clone(), "garbage".to_string()];

        let distances = distance_batch(&h1, &candidates).unwrap();
        assert_eq!(distances.len(), 1);
        assert!(distances.contains_key(&h2));
    }

    #[test]
    fn test_batch_is_deterministic() {
        let h1 = digest_of(&"alpha beta gamma delta epsilon zeta eta theta ".repeat(8));
        let h2 = digest_of(&"alpha beta gamma delta epsilon zeta eta iota ".repeat(8));
        let candidates = vec![h2.clone()];

        let a = distance_batch(&h1, &candidates).unwrap();
        let b = distance_batch(&h1, &candidates).unwrap();
        assert_eq!(a.get(&h2), b.get(&h2));
    }
}
