pub mod config;
pub mod status;

pub use config::{
    ConcurrentUpdatePolicy, ConfigError, DrainSettings, LogSettings, MarshalConfig, StoreSettings,
    UpdateSettings, DEFAULT_DRAINING_PERIOD,
};
pub use status::StatusCode;
