//! Client Affinity Cache: short-TTL map from a client's remote address
//! (`ip:port`) to the last real destination the relay resolved for it,
//! used when a follow-on connection carries no parseable host header.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Entries older than this are logically absent from `get`'s perspective,
/// even before the reaper has physically removed them.
pub const CACHE_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// How often the reaper wakes up and removes expired entries.
pub const REAP_INTERVAL: Duration = Duration::from_secs(30 * 60);

struct Entry {
    dest_ip: String,
    inserted_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
}

/// Process-wide client -> destination affinity cache, owned by the TCP
/// relay. Neither this cache nor the address map survives a restart.
#[derive(Default)]
pub struct ClientAffinityCache {
    inner: Mutex<Inner>,
}

impl ClientAffinityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached destination for `client_key`, or `None` if the
    /// key is missing or the entry is older than `CACHE_EXPIRY`. This is
    /// the stricter of the two documented behaviors (see the crate's
    /// design notes): `get` itself enforces expiry rather than trusting the
    /// reaper to have already run.
    pub fn get(&self, client_key: &str) -> Option<String> {
        let inner = self.inner.lock().expect("affinity cache lock poisoned");
        inner.entries.get(client_key).and_then(|entry| {
            if entry.inserted_at.elapsed() <= CACHE_EXPIRY {
                Some(entry.dest_ip.clone())
            } else {
                None
            }
        })
    }

    /// Overwrite (or create) the entry for `client_key`, resetting its age.
    pub fn put(&self, client_key: &str, dest_ip: &str) {
        let mut inner = self.inner.lock().expect("affinity cache lock poisoned");
        inner.entries.insert(
            client_key.to_string(),
            Entry {
                dest_ip: dest_ip.to_string(),
                inserted_at: Instant::now(),
            },
        );
    }

    /// Scan the whole map under the exclusive lock and drop every entry
    /// older than `CACHE_EXPIRY`. Returns the number of entries removed.
    pub fn reap(&self) -> usize {
        let mut inner = self.inner.lock().expect("affinity cache lock poisoned");
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| entry.inserted_at.elapsed() <= CACHE_EXPIRY);
        before - inner.entries.len()
    }
}

#[cfg(test)]
impl ClientAffinityCache {
    /// Test-only helper to insert an entry with a synthetic age, so expiry
    /// and reaping can be exercised without sleeping in real time.
    fn put_with_age(&self, client_key: &str, dest_ip: &str, age: Duration) {
        let mut inner = self.inner.lock().expect("affinity cache lock poisoned");
        inner.entries.insert(
            client_key.to_string(),
            Entry {
                dest_ip: dest_ip.to_string(),
                inserted_at: Instant::now() - age,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let cache = ClientAffinityCache::new();
        cache.put("192.0.2.1:54321", "203.0.113.7");
        assert_eq!(cache.get("192.0.2.1:54321"), Some("203.0.113.7".to_string()));
    }

    #[test]
    fn get_misses_unknown_key() {
        let cache = ClientAffinityCache::new();
        assert_eq!(cache.get("192.0.2.1:1"), None);
    }

    #[test]
    fn put_overwrites_and_resets_age() {
        let cache = ClientAffinityCache::new();
        cache.put_with_age("192.0.2.1:1", "203.0.113.7", CACHE_EXPIRY + Duration::from_secs(1));
        assert_eq!(cache.get("192.0.2.1:1"), None, "stale entry should already read as absent");

        cache.put("192.0.2.1:1", "203.0.113.8");
        assert_eq!(cache.get("192.0.2.1:1"), Some("203.0.113.8".to_string()));
    }

    #[test]
    fn get_treats_expired_entries_as_absent() {
        let cache = ClientAffinityCache::new();
        cache.put_with_age("192.0.2.1:1", "203.0.113.7", CACHE_EXPIRY + Duration::from_secs(1));
        assert_eq!(cache.get("192.0.2.1:1"), None);
    }

    #[test]
    fn reap_removes_only_expired_entries() {
        let cache = ClientAffinityCache::new();
        cache.put_with_age("stale:1", "203.0.113.7", CACHE_EXPIRY + Duration::from_secs(1));
        cache.put("fresh:1", "203.0.113.8");

        let removed = cache.reap();
        assert_eq!(removed, 1);
        assert_eq!(cache.get("stale:1"), None);
        assert_eq!(cache.get("fresh:1"), Some("203.0.113.8".to_string()));
    }
}
