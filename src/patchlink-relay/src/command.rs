use patchlink_core::SessionId;
use thiserror::Error;

/// Messages the host can send to the relay. All are fire-and-forget; none
/// produce a return value beyond log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// Replace the observed session id.
    SetSession(SessionId),
    /// Attach the realtime listener.
    Start,
    /// Detach the realtime listener.
    Stop,
    /// Write a diagnostic probe to the store.
    Test,
    /// Legacy forced-check request; informational only under realtime
    /// subscriptions.
    Check,
    /// Clear the processed-request cache.
    Clear,
    /// Emit a multi-line status report on the logging channel.
    Status,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("setSession requires a session id")]
    MissingSessionId,
    #[error("unexpected argument for {command}: {argument}")]
    UnexpectedArgument { command: String, argument: String },
}

impl HostCommand {
    /// Parse one host message line, e.g. `setSession studio_a` or `start`.
    pub fn parse(line: &str) -> Result<Self, CommandParseError> {
        let mut parts = line.split_whitespace();
        let head = parts.next().ok_or(CommandParseError::Empty)?;
        let argument = parts.next();

        if head == "setSession" {
            let id = argument.ok_or(CommandParseError::MissingSessionId)?;
            return Ok(Self::SetSession(SessionId::new(id)));
        }

        let command = match head {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "test" => Self::Test,
            "check" => Self::Check,
            "clear" => Self::Clear,
            "status" => Self::Status,
            other => return Err(CommandParseError::Unknown(other.to_string())),
        };

        if let Some(argument) = argument {
            return Err(CommandParseError::UnexpectedArgument {
                command: head.to_string(),
                argument: argument.to_string(),
            });
        }

        Ok(command)
    }
}
