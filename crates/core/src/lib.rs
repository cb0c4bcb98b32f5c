pub mod config;
pub mod error;

pub use config::{load_dotenv, ConcurrencyConfig, RetryConfig, SchedulerConfig, ShutdownConfig};
pub use error::*;
