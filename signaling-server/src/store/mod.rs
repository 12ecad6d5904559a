//! Serialized, TTL-aware key-value storage.
//!
//! Sessions, rendezvous tokens, and mailbox headers are all JSON blobs
//! behind string keys with a TTL. [`Store`] is the one seam between
//! component logic and the backing store — component code never caches
//! authoritative state across request boundaries, it always goes back
//! through here.
//!
//! Two implementations: [`memory::MemoryStore`] (default, in-process) and
//! [`redis_store::RedisStore`] (when `SIGNALING_REDIS_URL` is set). Both
//! implement the same atomic primitives: set-if-absent, CAS-delete
//! (atomic read-then-remove, for single-use rendezvous tokens), and TTL
//! extension. [`retry::RetryingStore`] wraps either one to retry a
//! transient failure with jittered backoff before it ever reaches
//! component code.

pub mod memory;
pub mod redis_store;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
}

/// Serialized, TTL-aware key-value storage with the atomic primitives the
/// session/rendezvous/mailbox components are built on.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch the raw value at `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Unconditionally write `value` at `key` with the given TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Write `value` at `key` only if `key` is absent. Returns whether the
    /// write happened.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError>;

    /// Atomically fetch and remove `key` in one step. Used for single-use
    /// claims, where a read-then-delete would race concurrent callers.
    async fn cas_delete(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Unconditionally remove `key`. Idempotent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Extend `key`'s TTL without touching its value. Returns whether the
    /// key existed.
    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}
