use mail_parser::{Message, MessageParser, MimeHeaders};
use tlsh2::TlshDefaultBuilder;
use tracing::warn;

use crate::normalization::normalize_email_body;

/// Attachments below this size are ignored when they are images; small inline
/// logos and tracking pixels carry no campaign signal.
pub const MIN_VISUAL_SIZE: usize = 50 * 1024;

/// Minimum body length before a TLSH digest is attempted. The algorithm needs
/// enough material to fill its buckets; anything shorter fails anyway.
pub const MIN_BODY_LEN: usize = 100;

const DIGEST_PREFIX: &str = "T1";
// Checksum, L and Q bytes: 3 bytes = 6 hex chars between "T1" and the body.
const HEADER_HEX_LEN: usize = 6;
const BODY_HEX_LEN: usize = 64;
const BAND_WINDOW: usize = 6;
const BAND_STRIDE: usize = 3;

pub fn parse_message(raw: &[u8]) -> Option<Message<'_>> {
    MessageParser::default().parse(raw)
}

/// Compute a TLSH digest over arbitrary bytes. Returns `None` when the input
/// is too short or too uniform for the algorithm; callers treat that as "this
/// source contributes no fingerprint".
pub fn compute_tlsh(data: &[u8]) -> Option<String> {
    let tlsh = TlshDefaultBuilder::build_from(data)?;
    Some(String::from_utf8_lossy(&tlsh.hash()).into_owned())
}

/// Concatenation of all inline text parts and all inline HTML parts.
pub fn extract_bodies(msg: &Message<'_>) -> (String, String) {
    let mut text = String::new();
    let mut pos = 0;
    while let Some(part) = msg.body_text(pos) {
        text.push_str(&part);
        pos += 1;
    }

    let mut html = String::new();
    let mut pos = 0;
    while let Some(part) = msg.body_html(pos) {
        html.push_str(&part);
        pos += 1;
    }

    (text, html)
}

/// Derive the ordered fingerprint list for a parsed message: normalized body,
/// raw body, then significant attachments in MIME order. The external-image
/// digest, when enabled, is appended by the caller after the sidechannel runs.
pub fn message_fingerprints(msg: &Message<'_>, text: &str, html: &str) -> Vec<String> {
    let mut signatures = Vec::new();

    let normalized = normalize_email_body(text, html);
    if normalized.len() > MIN_BODY_LEN {
        match compute_tlsh(normalized.as_bytes()) {
            Some(sig) => signatures.push(sig),
            None => warn!("failed to compute TLSH for normalized body"),
        }
    }

    let mut raw_body = String::with_capacity(text.len() + html.len());
    raw_body.push_str(text);
    raw_body.push_str(html);
    if raw_body.len() > MIN_BODY_LEN {
        if let Some(sig) = compute_tlsh(raw_body.as_bytes()) {
            signatures.push(sig);
        }
    }

    for attachment in msg.attachments() {
        let content = attachment.contents();
        let is_image = attachment
            .content_type()
            .map(|ct| ct.ctype().eq_ignore_ascii_case("image"))
            .unwrap_or(false);

        if (is_image && content.len() > MIN_VISUAL_SIZE) || (!is_image && content.len() > 128) {
            match compute_tlsh(content) {
                Some(sig) => signatures.push(sig),
                None => warn!(
                    filename = attachment.attachment_name().unwrap_or("<unnamed>"),
                    "failed to compute TLSH for attachment"
                ),
            }
        }
    }

    signatures
}

/// Slide a 6-hex-character window with stride 3 over the first 64 characters
/// of the digest body, producing `"i:v"` band strings. Digests too short to
/// carry a full body yield no bands.
pub fn extract_bands(digest: &str) -> Vec<String> {
    let body_start = DIGEST_PREFIX.len() + HEADER_HEX_LEN;
    if digest.len() < body_start + BODY_HEX_LEN {
        return Vec::new();
    }

    let body = &digest[body_start..body_start + BODY_HEX_LEN];
    let mut bands = Vec::with_capacity(BODY_HEX_LEN / BAND_STRIDE);
    let mut i = 0;
    while i + BAND_WINDOW <= BODY_HEX_LEN {
        bands.push(format!("{}:{}", i, &body[i..i + BAND_WINDOW]));
        i += BAND_STRIDE;
    }
    bands
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text() -> String {
        "This is a sufficiently long test text to generate a valid TLSH hash. \
         We need some variability and length for the algorithm to work properly. \
         Let's repeat the text to be sure we have enough material. \
         This is a sufficiently long test text to generate a valid TLSH hash."
            .to_string()
    }

    #[test]
    fn test_compute_tlsh_format() {
        let hash = compute_tlsh(sample_text().as_bytes()).expect("digest");
        assert!(
            hash.to_uppercase().starts_with("T1"),
            "digest should carry the T1 version prefix, got: {hash}"
        );
        assert!(hash.len() >= 70, "digest seems too short: {hash}");
    }

    #[test]
    fn test_compute_tlsh_deterministic() {
        let input = sample_text();
        let a = compute_tlsh(input.as_bytes());
        let b = compute_tlsh(input.as_bytes());
        assert_eq!(a, b);
    }

    #[test]
    fn test_compute_tlsh_short_input_yields_none() {
        assert_eq!(compute_tlsh(b"tiny"), None);
    }

    #[test]
    fn test_extract_bands_format() {
        // 72 chars: "T1" + 6 header hex + 64 body hex, the shape a real
        // digest has.
        let fake = format!("T1{}{}", "010203", "A".repeat(64));
        let bands = extract_bands(&fake);

        assert_eq!(bands.len(), 20);
        for band in &bands {
            let (idx, value) = band.split_once(':').expect("i:v format");
            assert!(idx.parse::<usize>().is_ok(), "bad index in {band}");
            assert_eq!(value.len(), 6, "bad window size in {band}");
        }
        assert_eq!(bands[0], "0:AAAAAA");
    }

    #[test]
    fn test_extract_bands_from_real_digest() {
        let hash = compute_tlsh(sample_text().as_bytes()).expect("digest");
        let bands = extract_bands(&hash);

        assert_eq!(
            bands.len(),
            20,
            "a genuine digest must yield the full band set, got {bands:?} from {hash}"
        );
        for band in &bands {
            let (_, value) = band.split_once(':').expect("i:v format");
            assert_eq!(value.len(), 6);
        }
    }

    #[test]
    fn test_extract_bands_is_pure() {
        let hash = compute_tlsh(sample_text().as_bytes()).expect("digest");
        assert_eq!(extract_bands(&hash), extract_bands(&hash));
    }

    #[test]
    fn test_extract_bands_short_digest() {
        assert!(extract_bands("T1ABCDEF").is_empty());
    }

    #[test]
    fn test_message_fingerprints_plain_text() {
        let raw = format!(
            "Message-ID: <a@x>\r\nSubject: Test\r\nContent-Type: text/plain\r\n\r\n{}",
            sample_text()
        );
        let msg = parse_message(raw.as_bytes()).expect("parse");
        let (text, html) = extract_bodies(&msg);
        let sigs = message_fingerprints(&msg, &text, &html);

        // Normalized and raw body are both long enough here.
        assert_eq!(sigs.len(), 2);
    }

    #[test]
    fn test_message_fingerprints_short_body() {
        let raw = b"Message-ID: <b@x>\r\nContent-Type: text/plain\r\n\r\nshort".to_vec();
        let msg = parse_message(&raw).expect("parse");
        let (text, html) = extract_bodies(&msg);
        assert!(message_fingerprints(&msg, &text, &html).is_empty());
    }
}
