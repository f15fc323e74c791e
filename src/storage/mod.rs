//! Storage Module
//!
//! A fixed array of independently locked partitions. Each key is owned by
//! exactly one partition, chosen by hashing the key, and the choice never
//! changes while the process runs.
//!
//! ## Example
//!
//! ```
//! use pipekv::storage::ShardedStore;
//! use bytes::Bytes;
//!
//! let store = ShardedStore::with_shards(4);
//! store.set(Bytes::from("name"), Bytes::from("Ariz"));
//! assert_eq!(store.get(b"name"), Some(Bytes::from("Ariz")));
//! assert!(store.shard_index(b"name") < 4);
//! ```

pub mod store;

pub use store::{ShardedStore, StoreStats, DEFAULT_SHARDS};
