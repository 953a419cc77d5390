use thiserror::Error;

/// Single-value emission surface toward the host environment.
///
/// Implementations MUST be cheap and non-blocking from the relay's point of
/// view. A failed emission is logged by the caller and never retried.
pub trait DeviceSink: Send + Sync {
    /// Stable sink identifier (e.g., "outlet").
    fn id(&self) -> &str;

    /// Emit one device name to the host's output port.
    fn emit(&self, device_name: &str) -> SinkResult<()>;
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("output port unavailable: {message}")]
    Unavailable { message: String },
    #[error("{message}")]
    Other { message: String },
}

pub type SinkResult<T> = Result<T, SinkError>;
