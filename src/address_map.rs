//! Address Map: shared hostname -> last-known real IPv4 address cache.
//!
//! Written only by the DNS responder (including its refresh task); read by
//! both the DNS responder and the TCP MITM relay. A single mutex serializes
//! writers; readers take the same lock for the duration of a lookup so no
//! reader ever observes a torn or partially updated entry. The corpus's
//! original guard was a capacity-1 channel used as a binary semaphore; this
//! is the same discipline expressed with an ordinary mutex.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, String>,
}

/// Shared hostname -> IPv4 cache, owned by the DNS responder and handed out
/// to readers as an `Arc<AddressMap>`.
#[derive(Debug, Default)]
pub struct AddressMap {
    inner: Mutex<Inner>,
}

fn strip_trailing_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

impl AddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `name`, trying the verbatim (lowercased) form first and then
    /// the form with a trailing dot appended.
    pub fn lookup(&self, name: &str) -> Option<String> {
        let lowered = name.to_lowercase();
        let inner = self.inner.lock().expect("address map lock poisoned");
        if let Some(ip) = inner.entries.get(&lowered) {
            return Some(ip.clone());
        }
        let with_dot = format!("{}.", lowered);
        inner.entries.get(&with_dot).cloned()
    }

    /// Insert `ip` for every name in `names`, writing both the dotted and
    /// non-dotted form of each (lowercased). Blank names are skipped so an
    /// empty input never produces a spurious `"."` entry.
    pub fn insert_many(&self, names: &[String], ip: &str) {
        let mut inner = self.inner.lock().expect("address map lock poisoned");
        for name in names {
            let lowered = name.to_lowercase();
            let stripped = strip_trailing_dot(&lowered).to_string();
            if stripped.is_empty() {
                continue;
            }
            inner.entries.insert(stripped.clone(), ip.to_string());
            inner.entries.insert(format!("{}.", stripped), ip.to_string());
        }
    }

    /// Snapshot of all currently cached names, deduplicated and with
    /// trailing dots stripped -- used by the refresh task, which only needs
    /// one re-resolution per logical name even though each is stored twice.
    pub fn snapshot_keys(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("address map lock poisoned");
        let mut keys: Vec<String> = inner
            .entries
            .keys()
            .map(|k| strip_trailing_dot(k).to_string())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_many_writes_both_dotted_forms() {
        let map = AddressMap::new();
        map.insert_many(&["Example.Cdn.Net".to_string()], "203.0.113.7");

        assert_eq!(map.lookup("example.cdn.net"), Some("203.0.113.7".to_string()));
        assert_eq!(map.lookup("example.cdn.net."), Some("203.0.113.7".to_string()));
    }

    #[test]
    fn lookup_tries_trailing_dot_fallback() {
        let map = AddressMap::new();
        map.insert_many(&["foo.example".to_string()], "198.51.100.4");

        // lookup("foo.example.") hits the verbatim entry directly; lookup
        // with no dot at all still finds it via the non-dotted key.
        assert_eq!(map.lookup("foo.example"), Some("198.51.100.4".to_string()));
    }

    #[test]
    fn lookup_miss_returns_none() {
        let map = AddressMap::new();
        assert_eq!(map.lookup("never.seen"), None);
    }

    #[test]
    fn repeated_insert_many_is_idempotent() {
        let map = AddressMap::new();
        map.insert_many(&["foo.example".to_string()], "198.51.100.4");
        let first = map.snapshot_keys();
        map.insert_many(&["foo.example".to_string()], "198.51.100.4");
        let second = map.snapshot_keys();
        assert_eq!(first, second);
        assert_eq!(map.lookup("foo.example"), Some("198.51.100.4".to_string()));
    }

    #[test]
    fn insert_many_skips_blank_names() {
        let map = AddressMap::new();
        map.insert_many(&["".to_string(), ".".to_string()], "10.0.0.1");
        assert!(map.snapshot_keys().is_empty());
    }

    #[test]
    fn snapshot_keys_deduplicates_dotted_and_undotted_forms() {
        let map = AddressMap::new();
        map.insert_many(&["foo.example".to_string()], "198.51.100.4");
        assert_eq!(map.snapshot_keys(), vec!["foo.example".to_string()]);
    }
}
