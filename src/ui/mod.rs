mod progress;
mod spinner;
mod status;
mod table;

pub use progress::byte_bar;

pub use spinner::with_spinner;

pub use status::{connection_line, print_command_status, CommandStatus};

pub use table::{apply_column_padding, header, status_cell, styled_table, truncate};

/// Both stdin and stderr are terminals, so prompting is possible.
pub fn is_interactive() -> bool {
    use std::io::IsTerminal;
    std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
}
