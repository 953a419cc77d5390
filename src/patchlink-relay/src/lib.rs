//! Session relay between a remote request store and a host output sink.

pub mod command;
pub mod relay;

pub use command::{CommandParseError, HostCommand};
pub use relay::{RelayStatus, SessionRelay};
