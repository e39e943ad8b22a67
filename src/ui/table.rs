use comfy_table::{presets::NOTHING, Attribute, Cell, Color, ContentArrangement, Table};

use crate::files::api::ScanStatus;

/// Borderless, non-wrapping table used by list output.
pub fn styled_table() -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_content_arrangement(ContentArrangement::Disabled);
    table
}

/// Truncate to `max_chars` characters, marking the cut with an ellipsis.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{kept}…")
}

pub fn apply_column_padding(table: &mut Table, padding: (u16, u16)) {
    for i in 0..table.column_count() {
        if let Some(col) = table.column_mut(i) {
            col.set_padding(padding);
        }
    }
}

pub fn header(text: &str) -> Cell {
    Cell::new(text)
        .add_attribute(Attribute::Bold)
        .add_attribute(Attribute::Dim)
}

pub fn status_cell(status: ScanStatus) -> Cell {
    let color = match status {
        ScanStatus::Pending | ScanStatus::Scanning => Color::Yellow,
        ScanStatus::Clean => Color::Green,
        ScanStatus::Infected | ScanStatus::Quarantined => Color::Red,
        ScanStatus::Error | ScanStatus::Deleted => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}
