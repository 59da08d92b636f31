//! Raffica cache layer.
//!
//! Three pieces sit between the request orchestrator and raw storage:
//!
//! - **Key derivation**: `host || path-and-query` byte keys
//! - **Envelope codec**: length-prefixed `(content-type, body)` framing
//! - **Byte store**: sharded, size-bounded key→blob storage with
//!   transactional puts
//!
//! ## Configuration
//!
//! Storage is controlled via `raffica.toml`:
//!
//! ```toml
//! [cache]
//! capacity_bytes = 104857600
//! max_items = 100000
//! # file_paths = "/var/cache/raffica/shard0,/var/cache/raffica/shard1"
//! ```

pub mod envelope;
mod key;
mod lock;
mod store;

pub use envelope::EnvelopeError;
pub use key::{cache_key, shard_index};
pub use store::{ByteCache, SetTxn, ShardedStore, StoreConfig, StoreError};
