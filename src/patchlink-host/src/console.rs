use patchlink_relay::HostCommand;
use std::io::BufRead;
use tokio::sync::mpsc;

/// Read host messages line by line on a blocking thread and forward the
/// parsed commands to the relay's channel.
///
/// Malformed lines are logged and dropped, matching the fire-and-forget
/// command contract. EOF ends the thread and closes the channel, which in
/// turn shuts the relay down.
pub fn spawn_command_reader<R>(input: R, buffer: usize) -> mpsc::Receiver<HostCommand>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));
    std::thread::spawn(move || {
        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to read host input");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match HostCommand::parse(&line) {
                Ok(command) => {
                    if tx.blocking_send(command).is_err() {
                        // relay side is gone
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(line = %line, error = %error, "ignoring unrecognized host message")
                }
            }
        }
    });
    rx
}
