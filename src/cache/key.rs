//! Cache key derivation.
//!
//! A key is the byte concatenation `host || path-and-query`. Keys are
//! opaque to the store; equality is byte-exact, so requests for the
//! same path under different hosts can never collide.

use xxhash_rust::xxh3::xxh3_64;

/// Build the cache key for a request.
///
/// `host` is either the client-supplied request host or the configured
/// upstream host, selected once at startup by the host-selection
/// policy; the same policy and inputs always yield identical bytes.
pub fn cache_key(host: &[u8], path_and_query: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(host.len() + path_and_query.len());
    key.extend_from_slice(host);
    key.extend_from_slice(path_and_query);
    key
}

/// Hash a key for shard selection.
///
/// Shard routing addresses persistent snapshot files, so the hash must
/// stay stable across process restarts and toolchain upgrades; xxh3 is
/// a fixed algorithm, unlike the std hasher whose output may change
/// between releases.
pub fn shard_index(key: &[u8], shards: usize) -> usize {
    (xxh3_64(key) % shards as u64) as usize
}
