//! Environment identifier extraction from inbound datagrams.
//!
//! The first packet of a session names the preview environment it wants with
//! a `pr-<digits>` token. Two payload shapes are understood:
//! - a JSON object whose `domain` (or `hostname`, `host`) string carries the token
//! - anything else, scanned as text for the first token
//!
//! A payload without a token is a normal outcome and yields `None`.

use std::fmt;

use serde_json::Value;
use tracing::debug;

/// Literal that introduces an environment identifier.
const TOKEN_PREFIX: &[u8] = b"pr-";

/// JSON fields consulted, in order, before falling back to a raw scan.
const DOMAIN_FIELDS: [&str; 3] = ["domain", "hostname", "host"];

/// Longest digit run accepted as an identifier.
pub const MAX_ID_DIGITS: usize = 20;

/// Numeric token naming a preview environment (`42` for `pr-42`).
///
/// Digits are kept as sent so derived service names match the deployment's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    /// Parse a bare digit string.
    pub fn parse(digits: &str) -> Option<Self> {
        let valid = !digits.is_empty()
            && digits.len() <= MAX_ID_DIGITS
            && digits.bytes().all(|b| b.is_ascii_digit());
        valid.then(|| Self(digits.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Registry service name, `pr-<id>-service`.
    pub fn service_name(&self) -> String {
        format!("pr-{}-service", self.0)
    }

    /// Per-environment DNS label, `pr-<id>`.
    pub fn host_label(&self) -> String {
        format!("pr-{}", self.0)
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extract the environment identifier carried by a payload, if any.
///
/// Structured parsing is tried first; when the payload is not a JSON object or
/// its domain-like fields carry no token, the whole payload is scanned as text.
pub fn extract(payload: &[u8]) -> Option<EnvironmentId> {
    extract_structured(payload).or_else(|| find_token(payload))
}

fn extract_structured(payload: &[u8]) -> Option<EnvironmentId> {
    // Cheap reject before handing arbitrary binary to the JSON parser.
    let first = payload.iter().find(|b| !b.is_ascii_whitespace())?;
    if *first != b'{' {
        return None;
    }

    let value: Value = serde_json::from_slice(payload).ok()?;
    let object = value.as_object()?;

    DOMAIN_FIELDS
        .iter()
        .filter_map(|field| object.get(*field).and_then(Value::as_str))
        .find_map(|text| find_token(text.as_bytes()))
}

/// First `pr-<digits>` occurrence in a byte string.
fn find_token(haystack: &[u8]) -> Option<EnvironmentId> {
    let mut offset = 0;

    while let Some(pos) = find_subslice(&haystack[offset..], TOKEN_PREFIX) {
        let digits_start = offset + pos + TOKEN_PREFIX.len();
        let digit_count = haystack[digits_start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();

        if digit_count > 0 {
            let digits = &haystack[digits_start..digits_start + digit_count];
            if let Some(id) = std::str::from_utf8(digits)
                .ok()
                .and_then(EnvironmentId::parse)
            {
                return Some(id);
            }
            debug!(
                digits = digit_count,
                max_digits = MAX_ID_DIGITS,
                "Identifier too long; skipped"
            );
        }

        offset = digits_start + digit_count;
    }

    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::json_domain(br#"{"domain":"pr-42-preview.example"}"#.as_slice(), Some("42"))]
    #[case::raw_text(b"hello pr-7 world".as_slice(), Some("7"))]
    #[case::no_token(b"hello world".as_slice(), None)]
    #[case::prefix_without_digits(b"pr-abc pr-".as_slice(), None)]
    #[case::skips_bad_candidate(b"pr-x then pr-15".as_slice(), Some("15"))]
    #[case::first_wins(b"pr-1 pr-2".as_slice(), Some("1"))]
    #[case::leading_zeros_kept(b"pr-007".as_slice(), Some("007"))]
    #[case::hostname_field(br#"{"hostname":"pr-9.preview.test"}"#.as_slice(), Some("9"))]
    #[case::host_field(br#"{"host":"pr-10"}"#.as_slice(), Some("10"))]
    #[case::empty(b"".as_slice(), None)]
    #[case::binary(&[0x16, 0x03, 0x01, 0xff, 0x00][..], None)]
    fn test_extract(#[case] payload: &[u8], #[case] expected: Option<&str>) {
        let id = extract(payload);
        assert_eq!(id.as_ref().map(EnvironmentId::as_str), expected);
    }

    #[test]
    fn test_domain_field_preferred_over_other_text() {
        let payload = br#"{"note":"pr-1","domain":"pr-2.example"}"#;
        assert_eq!(extract(payload).unwrap().as_str(), "2");
    }

    #[test]
    fn test_json_without_domain_falls_back_to_raw_scan() {
        let payload = br#"{"target":"pr-33-preview"}"#;
        assert_eq!(extract(payload).unwrap().as_str(), "33");
    }

    #[test]
    fn test_malformed_json_falls_back_to_raw_scan() {
        let payload = br#"{"domain":"pr-5.example""#;
        assert_eq!(extract(payload).unwrap().as_str(), "5");
    }

    #[test]
    fn test_non_string_domain_ignored() {
        let payload = br#"{"domain":42}"#;
        assert!(extract(payload).is_none());
    }

    #[test]
    fn test_overlong_digit_run_rejected() {
        let payload = format!("pr-{}", "9".repeat(MAX_ID_DIGITS + 1));
        assert!(extract(payload.as_bytes()).is_none());
    }

    #[test]
    fn test_derived_names() {
        let id = EnvironmentId::parse("42").unwrap();
        assert_eq!(id.service_name(), "pr-42-service");
        assert_eq!(id.host_label(), "pr-42");
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_parse_rejects_non_digits() {
        assert!(EnvironmentId::parse("").is_none());
        assert!(EnvironmentId::parse("4a").is_none());
        assert!(EnvironmentId::parse("-1").is_none());
    }
}
