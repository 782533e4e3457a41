//! marshal-runtime — the seams between Marshal and the cluster it drives.
//!
//! Marshal never places or runs tasks itself. It asks a [`TaskOperator`]
//! to launch, stop or kill pods and a [`HealthEvaluator`] whether a
//! launched pod is healthy. Both are async traits so the daemon can plug
//! in a real placement engine.
//!
//! # Architecture
//!
//! ```text
//! UpdateEngine / JobManager / DrainCoordinator
//!   ├── TaskOperator::launch / stop / kill
//!   └── HealthEvaluator::evaluate → HealthVerdict
//!
//! SimulatedCluster (implements both)
//!   ├── Placement over UP hosts from the StateStore
//!   ├── Host affinity and in-place hints
//!   ├── FailureRule for container and health-check commands
//!   └── HealthTracker per running pod
//! ```

pub mod checker;
pub mod error;
pub mod operator;
pub mod simulated;

pub use checker::{HealthStatus, HealthTracker};
pub use error::{RuntimeError, RuntimeResult};
pub use operator::{HealthEvaluator, HealthVerdict, LaunchRequest, LaunchResult, TaskOperator};
pub use simulated::{FailureRule, SimulatedCluster};
