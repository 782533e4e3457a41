//! redb table definitions for the Marshal state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Job records keyed by `{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Immutable job specs keyed by `{job_id}:{config_version:020}`.
pub const JOB_CONFIGS: TableDefinition<&str, &[u8]> = TableDefinition::new("job_configs");

/// Pod records keyed by `{job_id}:{instance_id:06}`.
pub const PODS: TableDefinition<&str, &[u8]> = TableDefinition::new("pods");

/// Update entities keyed by `{update_id}`.
pub const UPDATES: TableDefinition<&str, &[u8]> = TableDefinition::new("updates");

/// Host entities keyed by `{hostname}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Hosts waiting for a drain cycle, keyed by `{hostname}`, valued by enqueue time.
pub const MAINTENANCE_QUEUE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("maintenance_queue");
