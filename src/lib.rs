//! An in-memory block cache for a storage engine.
//!
//! Blocks live in reference-counted [`Buffer`](buffer::entity::Buffer)s owned by a
//! [`Cache`]. Work is done through a [`Transaction`], which hands out
//! [`BufferGuard`](buffer::handle::BufferGuard) pins; a missing block comes back as a
//! [`PendingBuffer`](buffer::handle::PendingBuffer) future that is woken once the asynchronous
//! load completes. Exactly one read is in flight per block however many acquisitions wait for
//! it, and no buffer is evicted while pinned, dirty or being written back.
//!
//! The cache and everything it hands out are bound to the thread that created them:
//!
//! ```compile_fail
//! fn assert_send<T: Send>() {}
//! assert_send::<blockcache::Cache<blockcache::storage::disk::FileDisk, blockcache::policy::lru::Lru>>();
//! ```

pub mod allocator;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod policy;
pub mod storage;
pub mod transaction;

pub use cache::{Cache, CacheStats};
pub use config::CacheConfig;
pub use error::Error;
pub use storage::entity::{BlockData, BlockId};
pub use transaction::{Acquired, Transaction, TxId};
