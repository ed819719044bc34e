//! Hostname match policy: the single predicate that decides whether a DNS
//! name or a raw TCP connection prefix is "wanted" for interception.
//!
//! The same predicate is deliberately used for both DNS question names and
//! raw first-packet bytes, so an unparseable TLS ClientHello that still
//! contains the marketing name is classified as wanted even if host
//! extraction later fails.

/// Decides whether a string should be intercepted, based on a configured
/// set of case-insensitive substrings.
#[derive(Debug, Clone)]
pub struct InterceptPolicy {
    /// Substrings to match. Expected to already be lowercased by the
    /// caller (`Config::load` lowercases `intercepts` once at startup).
    needles: Vec<String>,
}

impl InterceptPolicy {
    pub fn new(needles: Vec<String>) -> Self {
        Self { needles }
    }

    /// Returns true iff any configured substring is contained in the
    /// lowercased form of `s`. An empty intercept list never matches.
    pub fn matches(&self, s: &str) -> bool {
        if self.needles.is_empty() {
            return false;
        }
        let lowered = s.to_lowercase();
        self.needles.iter().any(|needle| lowered.contains(needle.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_never_matches() {
        let policy = InterceptPolicy::new(vec![]);
        assert!(!policy.matches("example-stream.cdn.net"));
    }

    #[test]
    fn matches_is_case_insensitive_and_unanchored() {
        let policy = InterceptPolicy::new(vec!["example-stream".to_string()]);
        assert!(policy.matches("EXAMPLE-STREAM.cdn.net"));
        assert!(policy.matches("www.example-stream.cdn.net."));
        assert!(!policy.matches("www.other.com"));
    }

    #[test]
    fn matches_any_of_several_needles() {
        let policy = InterceptPolicy::new(vec!["foo".to_string(), "bar".to_string()]);
        assert!(policy.matches("api.bar.example.com"));
        assert!(!policy.matches("api.baz.example.com"));
    }

    #[test]
    fn matches_raw_prefix_bytes_via_lossy_decoding() {
        let policy = InterceptPolicy::new(vec!["example-stream".to_string()]);
        let prefix = b"\x16\x03\x01\x00\x00example-stream\x00".to_vec();
        let as_str = String::from_utf8_lossy(&prefix);
        assert!(policy.matches(&as_str));
    }
}
