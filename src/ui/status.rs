use dialoguer::console::style;

use crate::engine::stream::ConnectionIndicator;

pub enum CommandStatus {
    Success,
    Error,
    Warning,
}

pub fn print_command_status(status: CommandStatus, message: &str) {
    let indicator = match status {
        CommandStatus::Success => style("✓").green(),
        CommandStatus::Error => style("✗").red(),
        CommandStatus::Warning => style("!").yellow(),
    };
    eprintln!("{indicator} {message}");
}

/// Human description of the status channel indicator.
pub fn connection_line(indicator: &ConnectionIndicator) -> (CommandStatus, String) {
    match indicator {
        ConnectionIndicator::Connecting => {
            (CommandStatus::Warning, "Connecting to status channel".into())
        }
        ConnectionIndicator::Connected => (CommandStatus::Success, "Live updates connected".into()),
        ConnectionIndicator::Reconnecting {
            attempt,
            delay,
            error,
        } => {
            let mut line = format!(
                "Disconnected; reconnecting in {:.0?} (attempt {attempt})",
                delay
            );
            if let Some(error) = error {
                line.push_str(&format!(": {error}"));
            }
            (CommandStatus::Error, line)
        }
    }
}
