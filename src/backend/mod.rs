//! Pluggable object storage boundary.
//!
//! Everything above this layer talks to a narrow put/get/list/delete trait;
//! the core never branches on backend identity. Keys are `/`-separated paths
//! with the tenant ID as the first element.

pub mod io;
pub mod local;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use io::BlockStore;
pub use local::LocalStore;
pub use memory::MemoryStore;

/// Minimal object-store capability surface. Implementations must provide
/// write-then-visible semantics per object: a `get` or `list` never observes
/// a partially written object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Ok(None) when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// All keys under the prefix, in unspecified order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}
