//! marshal-drain — host maintenance for Marshal.
//!
//! Hosts move `UP → DRAINING → DOWN → UP`. Starting maintenance is a
//! synchronous commit that also enqueues the host; a background loop
//! evicts resident pods from queued hosts once per draining period and
//! takes a host down when nothing is left on it. Completing maintenance
//! brings a `DOWN` host back up.

pub mod coordinator;
pub mod error;

pub use coordinator::{CycleReport, DrainCoordinator, DrainRecovery};
pub use error::{DrainError, DrainResult};
