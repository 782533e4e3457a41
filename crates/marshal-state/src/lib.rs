//! marshal-state — durable state for the Marshal control core.
//!
//! Backed by [redb](https://docs.rs/redb), holds jobs, versioned job
//! configs, pods, updates, hosts, and the host maintenance queue.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{job_id}:{instance:06}`, `{job_id}:{version:020}`)
//! keep related records adjacent for prefix scans.
//!
//! Multi-record mutations go through [`Commit`], which applies every
//! precondition (job entity version, update revision, host state) and
//! every write inside a single redb write transaction.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod commit;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use commit::Commit;
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
