//! The embedded ordered KV primitive backing each store.
//!
//! Write path: committed batch → memtable → (flush) → L0 SST file.
//! Read path:  memtable → flushing memtable → SST files, newest first.
//!
//! Every committed batch is stamped with a monotonically increasing
//! sequence; reads are served at a snapshot sequence, and commit-time
//! conflict detection compares each written key's newest committed
//! sequence against the transaction's snapshot.

pub mod block_cache;
pub mod engine;
pub mod memtable;
pub mod sst;

pub use block_cache::BlockCache;
pub use engine::{LsmConfig, LsmEngine};
