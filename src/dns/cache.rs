//! DNS answer cache
//!
//! Caches full DNS response messages keyed by the first question's
//! `(qname, qtype)`, so repeat queries can be answered directly from the
//! gateway without opening a relay flow.
//!
//! # Semantics
//!
//! - `query` parses a raw request; malformed or question-less requests
//!   miss. A hit returns the stored response with its transaction id
//!   rewritten to the *querier's* id. Expired entries are deleted on
//!   lookup.
//! - `store` parses a raw response and ignores anything malformed,
//!   non-success, question-less, or answer-less. The entry expires
//!   `TTL-of-first-answer` seconds after insertion. Last writer wins.
//!
//! Only the first question is ever keyed, and there is no negative
//! caching. One mutex covers both operations; entries are whole parsed
//! messages, so a hit costs a clone and an id rewrite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, ResponseCode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Cache key: first question's name (lowercased) and query type.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct AnswerKey {
    qname: String,
    qtype: u16,
}

impl AnswerKey {
    /// Extract the key from a message's first question, if any.
    fn from_message(message: &Message) -> Option<Self> {
        let question = message.queries().first()?;
        Some(Self {
            qname: question.name().to_string().to_lowercase(),
            qtype: question.query_type().into(),
        })
    }
}

#[derive(Debug)]
struct AnswerEntry {
    message: Message,
    expires_at: Instant,
}

impl AnswerEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache operation counters.
#[derive(Debug, Default)]
pub struct DnsCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    stores: AtomicU64,
}

impl DnsCacheStats {
    /// Get the hit count.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get the miss count (including expired lookups).
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get the count of entries deleted on expired lookup.
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Get the count of stored responses.
    pub fn stores(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> DnsCacheStatsSnapshot {
        DnsCacheStatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            expirations: self.expirations(),
            stores: self.stores(),
        }
    }
}

/// Snapshot of cache counters for serialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DnsCacheStatsSnapshot {
    /// Lookup hits.
    pub hits: u64,
    /// Lookup misses, including expired entries.
    pub misses: u64,
    /// Entries deleted because they had expired.
    pub expirations: u64,
    /// Responses stored.
    pub stores: u64,
}

/// Thread-safe DNS answer cache.
#[derive(Debug, Default)]
pub struct DnsAnswerCache {
    entries: Mutex<HashMap<AnswerKey, AnswerEntry>>,
    stats: DnsCacheStats,
}

impl DnsAnswerCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the answer for a raw DNS request.
    ///
    /// Returns `None` for malformed or question-less requests and for
    /// misses. On a hit the returned message carries the request's
    /// transaction id; the caller serializes it.
    pub fn query(&self, request: &[u8]) -> Option<Message> {
        let request = Message::from_vec(request).ok()?;
        let key = AnswerKey::from_message(&request)?;

        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(&key) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if entry.is_expired() {
            entries.remove(&key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut answer = entry.message.clone();
        answer.set_id(request.id());
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        trace!(qname = %key.qname, qtype = key.qtype, "dns cache hit");
        Some(answer)
    }

    /// Store a raw DNS response.
    ///
    /// Malformed, non-success, question-less, and answer-less responses
    /// are silently ignored.
    pub fn store(&self, response: &[u8]) {
        let Ok(response) = Message::from_vec(response) else {
            return;
        };
        if response.response_code() != ResponseCode::NoError {
            return;
        }
        if response.queries().is_empty() || response.answers().is_empty() {
            return;
        }
        let Some(key) = AnswerKey::from_message(&response) else {
            return;
        };

        let ttl = response.answers()[0].ttl();
        let entry = AnswerEntry {
            message: response,
            expires_at: Instant::now() + Duration::from_secs(u64::from(ttl)),
        };

        self.entries.lock().insert(key, entry);
        self.stats.stores.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of cached answers (including any not yet reaped).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cache operation counters.
    pub fn stats(&self) -> &DnsCacheStats {
        &self.stats
    }
}
