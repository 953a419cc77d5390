use patchlink_core::{DeviceSink, SinkError, SinkResult};
use std::io::Write;
use std::sync::Mutex;

/// Writes one device name per line to the host's output port.
///
/// Production use wraps stdout; any `Write` works for tests. The writer is
/// flushed after every emission so the host sees values as they arrive,
/// not when a buffer fills.
pub struct OutletSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> OutletSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl OutletSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> DeviceSink for OutletSink<W> {
    fn id(&self) -> &str {
        "outlet"
    }

    fn emit(&self, device_name: &str) -> SinkResult<()> {
        let mut writer = self.writer.lock().map_err(|_| SinkError::Unavailable {
            message: "output port lock poisoned".into(),
        })?;
        writeln!(writer, "{device_name}").map_err(|error| SinkError::Unavailable {
            message: error.to_string(),
        })?;
        writer.flush().map_err(|error| SinkError::Unavailable {
            message: error.to_string(),
        })
    }
}
