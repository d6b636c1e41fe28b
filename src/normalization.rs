use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref RE_IMG_TAG: Regex = Regex::new(r#"(?i)<img[^>]+src=["'][^"']*["'][^>]*>"#).unwrap();
    static ref RE_TRACKER: Regex =
        Regex::new(r#"(?i)(utm_[a-z0-9_]+|gclid|fbclid|msclkid|mc_eid)=[^&"'\s]*"#).unwrap();
    static ref RE_HEX_TOKEN: Regex = Regex::new(r"\b[0-9a-f]{8,}\b").unwrap();
    static ref RE_WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Sentinel substituted for every `<img src=…>` tag so that campaigns which
/// only rotate their tracking pixel URLs still hash identically.
pub const IMG_SENTINEL: &str = r#"<img src="imgurl">"#;

/// Sentinel substituted for hex-looking tokens (per-recipient IDs, unsubscribe
/// tokens) of 8 or more characters.
pub const HEX_SENTINEL: &str = "****";

/// Produce the normalized body used for the primary fingerprint: lowercased,
/// image tags and hex tokens replaced by fixed sentinels, URL tracker
/// parameters dropped, whitespace runs collapsed. Deterministic and
/// order-preserving apart from the substitutions.
pub fn normalize_email_body(text: &str, html: &str) -> String {
    let mut combined = String::with_capacity(text.len() + html.len());
    combined.push_str(text);
    combined.push_str(html);

    let lowered = combined.to_lowercase();
    let no_imgs = RE_IMG_TAG.replace_all(&lowered, IMG_SENTINEL);
    let no_trackers = RE_TRACKER.replace_all(&no_imgs, "");
    let no_hex = RE_HEX_TOKEN.replace_all(&no_trackers, HEX_SENTINEL);
    let collapsed = RE_WHITESPACE.replace_all(&no_hex, " ");

    collapsed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_text() {
        assert_eq!(normalize_email_body("Hello World", ""), "hello world");
    }

    #[test]
    fn test_html_image_replaced_with_sentinel() {
        let html = r#"<html><body><img src="http://evil.com/track.png"></body></html>"#;
        let result = normalize_email_body("", html);
        assert!(result.contains(r#"<img src="imgurl">"#), "got: {result}");
        assert!(!result.contains("evil.com"));
    }

    #[test]
    fn test_hex_token_replaced() {
        let result = normalize_email_body("Token: A1B2C3D4E5F60718", "");
        assert!(result.contains("token: ****"), "got: {result}");
    }

    #[test]
    fn test_tracker_params_stripped() {
        let html = r#"<a href="http://site.com?utm_source=spam&gclid=12345">Link</a>"#;
        let result = normalize_email_body("", html);
        assert!(
            result.contains(r#"<a href="http://site.com?&">link</a>"#),
            "got: {result}"
        );
    }

    #[test]
    fn test_whitespace_collapsed() {
        let result = normalize_email_body("Too    many\n\n   spaces", "");
        assert_eq!(result, "too many spaces");
    }

    #[test]
    fn test_deterministic() {
        let text = "Some Mixed CASE text with a token DEADBEEFCAFE1234 inside";
        let a = normalize_email_body(text, "");
        let b = normalize_email_body(text, "");
        assert_eq!(a, b);
    }
}
