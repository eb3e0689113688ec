pub mod config;
pub mod time;
pub mod types;

pub use config::{AgentConfig, ConfigError, ConfigResult};
pub use time::{date_stamp, epoch_secs, parse_duration};
pub use types::*;
