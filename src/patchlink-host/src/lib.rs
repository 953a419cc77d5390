//! Adapters between the relay and the host environment's message ports.

pub mod console;
pub mod outlet;

pub use console::spawn_command_reader;
pub use outlet::OutletSink;
