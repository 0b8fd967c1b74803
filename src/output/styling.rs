use std::fmt::Display;

use console::{style, StyledObject};

use crate::events::Status;

fn styled(text: impl Display) -> StyledObject<String> {
    style(text.to_string())
}

pub fn bright(text: impl Display) -> StyledObject<String> {
    styled(text).bright()
}

pub fn bright_yellow(text: impl Display) -> StyledObject<String> {
    bright(text).yellow()
}

pub fn bright_green(text: impl Display) -> StyledObject<String> {
    bright(text).green()
}

pub fn bright_red(text: impl Display) -> StyledObject<String> {
    bright(text).red()
}

pub fn dim(text: impl Display) -> StyledObject<String> {
    styled(text).dim()
}

pub fn magenta_bold(text: impl Display) -> StyledObject<String> {
    styled(text).magenta().bold()
}

/// Colors `text` the way the waterfall colors a cell in `status`.
pub fn by_status(status: Status, text: impl Display) -> StyledObject<String> {
    let text = styled(text);
    match status {
        Status::Success => text.green(),
        Status::Fail => text.red(),
        Status::Exception => text.magenta(),
        Status::Warning => text.yellow(),
        Status::Running | Status::Preparing => text.cyan(),
        Status::Cancelled | Status::Pending | Status::Unknown => text.dim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_status_keeps_text() {
        console::set_colors_enabled(false);
        assert_eq!(by_status(Status::Fail, "boom").to_string(), "boom");
        assert_eq!(bright_green("✓").to_string(), "✓");
    }
}
