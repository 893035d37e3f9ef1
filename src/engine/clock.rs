// VaultStream Engine — Time Helpers
//
// Every persisted timestamp is RFC 3339 UTC written from Rust. Writing them
// all through these helpers keeps the string format identical everywhere,
// which makes lexicographic comparison in SQL also chronological.

use chrono::{DateTime, Duration, Utc};

/// Current instant as the canonical stored string.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Current instant shifted by `secs` (may be negative).
pub fn iso_in_secs(secs: i64) -> String {
    (Utc::now() + Duration::seconds(secs)).to_rfc3339()
}

/// Current instant shifted by `ms` milliseconds.
pub fn iso_in_ms(ms: i64) -> String {
    (Utc::now() + Duration::milliseconds(ms)).to_rfc3339()
}

/// Parse a stored timestamp. Returns `None` for malformed input rather than
/// failing the surrounding query.
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_strings_order_lexicographically() {
        let earlier = iso_in_secs(-60);
        let now = now_iso();
        let later = iso_in_secs(60);
        assert!(earlier < now);
        assert!(now < later);
    }

    #[test]
    fn parse_roundtrip() {
        let s = now_iso();
        assert!(parse_iso(&s).is_some());
        assert!(parse_iso("not a time").is_none());
    }
}
