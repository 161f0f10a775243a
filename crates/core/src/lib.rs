pub mod config;
pub mod error;

pub use config::{CollectorConfig, DispatchConfig, LifecycleConfig, RelayConfig, ScanConfig};
pub use error::*;
