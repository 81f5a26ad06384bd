//! Persistence seam for the quota ledger and cluster registry.

pub mod client;
pub mod kv;
pub mod memory;
pub mod retry;

pub use client::StateStore;
pub use kv::{CorruptRecord, KvStore};
pub use memory::MemoryStore;
pub use retry::{RetryPolicy, Transient, retry_transient};
