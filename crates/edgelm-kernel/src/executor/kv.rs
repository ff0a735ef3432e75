//! KV-cache contract.

use crate::error::Result;

/// Per-layer K/V buffers for one model. Growing happens through prefill and
/// decode; `resize` only ever truncates.
pub trait KvCache: Send {
    /// Truncates the cache to `num_entries`. Requests larger than the
    /// current size are a no-op.
    fn resize(&mut self, num_entries: usize) -> Result<()>;

    /// Number of resident entries per block.
    fn num_entries(&self) -> usize;

    /// Serializes the cache for cloning or checkpointing.
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Restores the cache from a serialized snapshot.
    fn load(&mut self, serialized: &[u8]) -> Result<()>;
}
