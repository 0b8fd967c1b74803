use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

use crate::events::Status;

/// Table and cell creation helpers
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn status_color(status: Status) -> TableColor {
    match status {
        Status::Success => TableColor::Green,
        Status::Fail => TableColor::Red,
        Status::Exception => TableColor::Magenta,
        Status::Warning => TableColor::Yellow,
        Status::Running | Status::Preparing => TableColor::Cyan,
        Status::Cancelled => TableColor::DarkGrey,
        Status::Pending | Status::Unknown => TableColor::Grey,
    }
}

pub fn status_glyph(status: Status) -> &'static str {
    match status {
        Status::Success => "✓",
        Status::Fail => "✗",
        Status::Exception => "!",
        Status::Warning => "⚠",
        Status::Running | Status::Preparing => "▶",
        Status::Cancelled => "⊘",
        Status::Pending => "…",
        Status::Unknown => "?",
    }
}

/// Cell colored by status; uncolored when there is no status yet.
pub fn status_cell(text: impl Into<String>, status: Option<Status>) -> Cell {
    let cell = Cell::new(text.into());
    match status {
        Some(status) => cell.fg(status_color(status)),
        None => cell,
    }
}
