//! Service statistics.
//!
//! Five monotone counters shared by every request handler. Each event
//! is one atomic add; the report path reads a snapshot without ever
//! blocking writers. The same events are mirrored to the `metrics`
//! recorder for external collection.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;

/// Thread-safe counters for the proxy's whole lifetime.
#[derive(Debug, Default)]
pub struct Stats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    conditional_hits: AtomicU64,
    upstream_bytes: AtomicU64,
    client_bytes: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub conditional_hits: u64,
    pub upstream_bytes: u64,
    pub client_bytes: u64,
}

impl Stats {
    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        counter!("raffica_cache_hit_total").increment(1);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        counter!("raffica_cache_miss_total").increment(1);
    }

    pub fn record_conditional_hit(&self) {
        self.conditional_hits.fetch_add(1, Ordering::Relaxed);
        counter!("raffica_conditional_hit_total").increment(1);
    }

    pub fn add_upstream_bytes(&self, bytes: u64) {
        self.upstream_bytes.fetch_add(bytes, Ordering::Relaxed);
        counter!("raffica_upstream_bytes_total").increment(bytes);
    }

    pub fn add_client_bytes(&self, bytes: u64) {
        self.client_bytes.fetch_add(bytes, Ordering::Relaxed);
        counter!("raffica_client_bytes_total").increment(bytes);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            conditional_hits: self.conditional_hits.load(Ordering::Relaxed),
            upstream_bytes: self.upstream_bytes.load(Ordering::Relaxed),
            client_bytes: self.client_bytes.load(Ordering::Relaxed),
        }
    }

    /// Render the plain-text stats page: configuration echo followed
    /// by counters and derived savings figures.
    pub fn render(&self, config_echo: &str) -> String {
        use std::fmt::Write;

        let s = self.snapshot();
        let requests = s.cache_hits + s.cache_misses + s.conditional_hits;
        let hit_ratio = if requests > 0 {
            (s.cache_hits + s.conditional_hits) as f64 / requests as f64 * 100.0
        } else {
            0.0
        };

        let mut out = String::new();
        out.push_str("Configuration\n");
        out.push_str(config_echo);
        out.push('\n');

        // Formatting into a String cannot fail.
        let _ = writeln!(out, "Requests count: {requests}");
        let _ = writeln!(out, "Cache hit ratio: {hit_ratio:.3}%");
        let _ = writeln!(out, "Cache hits: {}", s.cache_hits);
        let _ = writeln!(out, "Cache misses: {}", s.cache_misses);
        let _ = writeln!(out, "If-None-Match hits: {}", s.conditional_hits);
        let _ = writeln!(
            out,
            "Read from upstream: {:.3} MBytes",
            s.upstream_bytes as f64 / 1_000_000.0
        );
        let _ = writeln!(
            out,
            "Sent to clients: {:.3} MBytes",
            s.client_bytes as f64 / 1_000_000.0
        );
        let _ = writeln!(
            out,
            "Upstream traffic saved: {:.3} MBytes",
            (s.client_bytes as i64 - s.upstream_bytes as i64) as f64 / 1_000_000.0
        );
        let _ = writeln!(
            out,
            "Upstream requests saved: {}",
            s.cache_hits + s.conditional_hits
        );
        out
    }
}
