//! marshal-update — rolling updates of stateless jobs.
//!
//! Moves a job from one versioned spec to another in waves, with pause,
//! resume, abort, a per-update failure budget and automatic rollback.
//!
//! # Architecture
//!
//! ```text
//! UpdateEngine
//!   ├── operator calls ── version (entity version ledger) ── Commit
//!   └── run loop ── one driver task per active update
//!         └── step()
//!               ├── diff::diff_pods → plan
//!               ├── machine (pure transitions, failure budget)
//!               └── BatchExecutor::run_wave → TaskOperator / HealthEvaluator
//! JobManager      create / start / stop jobs, read pods
//! recovery        fail orphaned updates, resume the rest
//! ```
//!
//! Progress is stored on the update after every wave, so a restarted
//! controller picks up at the next wave.

pub mod diff;
pub mod engine;
pub mod error;
pub mod executor;
pub mod job;
pub mod machine;
pub mod recovery;
pub mod version;

pub use engine::{EngineSettings, StepOutcome, UpdateEngine};
pub use error::{StatusCode, UpdateError, UpdateResult};
pub use executor::{BatchExecutor, ExecutorSettings};
pub use job::JobManager;
pub use machine::WaveOutcome;
pub use recovery::{recover_updates, RecoveryReport};
