pub mod config;
pub mod ids;
pub mod logging;
pub mod paths;
pub mod sink;
pub mod store;

pub use config::{Config, ConfigError, LogLevel, LoggingConfig, StoreConfig, ValidationError};
pub use ids::{RequestId, SessionId};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use paths::{AppDirs, DirsError};
pub use sink::{DeviceSink, SinkError, SinkResult};
pub use store::{
    ProbeRecord, RequestSnapshot, RequestStore, StoreError, StoreEvent, StoreResult, Subscription,
};

pub const APP_NAME: &str = "patchlink";
pub const APP_AUTHOR: &str = "Patchlink";
pub const APP_QUALIFIER: &str = "io";
