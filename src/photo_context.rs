//! Photo-context affinity
//!
//! Remembers the last photo description per client so a chat follow-up can
//! refer to it without re-sending it. The key is a heuristic fingerprint, not
//! an identity: clients behind one address with the same browser share it.

use std::time::Duration;

use crate::cache::TtlCache;
use crate::clock::SharedClock;

const USER_AGENT_PREFIX_CHARS: usize = 80;

/// Client address plus a truncated user agent.
pub fn fingerprint(client_addr: &str, user_agent: &str) -> String {
    let ua: String = user_agent.chars().take(USER_AGENT_PREFIX_CHARS).collect();
    format!("{}|{}", client_addr, ua)
}

pub struct PhotoContextCache {
    entries: TtlCache<String, String>,
}

impl PhotoContextCache {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: TtlCache::new("photo_context", ttl, clock),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(&key.to_string())
    }

    pub fn set(&self, key: &str, photo_context: &str) {
        if photo_context.trim().is_empty() {
            return;
        }
        self.entries.set(key.to_string(), photo_context.to_string());
    }

    pub fn sweep(&self) -> usize {
        self.entries.sweep()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
