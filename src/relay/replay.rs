//! Response replay cache: retains a chunked streaming response's
//! emitted chunks briefly after `end` so a `response.missing` resend request
//! can be served byte-for-byte.
//!
//! Eviction is a periodic sweep over a `DashMap`, the same idiom the upload
//! reassembler's cleanup loop uses, rather than scheduling one timer per
//! entry.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const RETENTION_AFTER_END: Duration = Duration::from_secs(5);
const SWEEP_PERIOD: Duration = Duration::from_secs(1);

struct ReplayEntry {
    chunks: BTreeMap<u64, String>,
    ended_at: Option<Instant>,
}

pub struct ReplayCache {
    entries: DashMap<String, ReplayEntry>,
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record a chunk emitted for `request_id` at `seq`. Single-writer: only
    /// the worker currently streaming that response calls this.
    pub fn record(&self, request_id: &str, seq: u64, b64: impl Into<String>) {
        let mut entry = self.entries.entry(request_id.to_string()).or_insert_with(|| ReplayEntry {
            chunks: BTreeMap::new(),
            ended_at: None,
        });
        entry.chunks.insert(seq, b64.into());
    }

    /// Mark the stream as finished; the entry becomes eligible for eviction
    /// `RETENTION_AFTER_END` from now.
    pub fn mark_ended(&self, request_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(request_id) {
            entry.ended_at = Some(Instant::now());
        }
    }

    /// Fetch the recorded chunks for the requested sequence numbers, in
    /// ascending order, skipping any that were never recorded (already
    /// evicted, or never sent because they don't exist).
    pub fn get_missing(&self, request_id: &str, seqs: &[u64]) -> Vec<(u64, String)> {
        let Some(entry) = self.entries.get(request_id) else {
            return Vec::new();
        };
        seqs.iter()
            .filter_map(|seq| entry.chunks.get(seq).map(|b64| (*seq, b64.clone())))
            .collect()
    }

    fn sweep_once(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| match entry.ended_at {
            Some(ended) => now.duration_since(ended) < RETENTION_AFTER_END,
            None => true,
        });
    }

    /// Spawn the background sweeper. Returns the task handle so callers can
    /// abort it on node shutdown.
    pub fn spawn_sweeper(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            loop {
                ticker.tick().await;
                self.sweep_once();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_returns_recorded_chunks_in_requested_order() {
        let cache = ReplayCache::new();
        cache.record("r1", 1, "YQ==");
        cache.record("r1", 2, "Yg==");
        cache.record("r1", 3, "Yw==");
        let got = cache.get_missing("r1", &[2, 3]);
        assert_eq!(got, vec![(2, "Yg==".to_string()), (3, "Yw==".to_string())]);
    }

    #[test]
    fn missing_request_id_returns_empty() {
        let cache = ReplayCache::new();
        assert!(cache.get_missing("nope", &[1]).is_empty());
    }

    #[test]
    fn sweep_evicts_after_retention_window() {
        let cache = ReplayCache::new();
        cache.record("r1", 1, "YQ==");
        cache.mark_ended("r1");
        {
            let mut entry = cache.entries.get_mut("r1").unwrap();
            entry.ended_at = Some(Instant::now() - Duration::from_secs(6));
        }
        cache.sweep_once();
        assert!(cache.get_missing("r1", &[1]).is_empty());
    }

    #[test]
    fn sweep_keeps_entries_within_retention_window() {
        let cache = ReplayCache::new();
        cache.record("r1", 1, "YQ==");
        cache.mark_ended("r1");
        cache.sweep_once();
        assert_eq!(cache.get_missing("r1", &[1]).len(), 1);
    }
}
