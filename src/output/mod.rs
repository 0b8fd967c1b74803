mod exports;
mod progress;
mod styling;
mod tables;
mod waterfall;

pub use exports::export_json;
pub use progress::PhaseProgress;
pub use styling::{bright_green, bright_red, by_status, dim, magenta_bold};
pub use waterfall::{print_buildsets, print_waterfall, render_waterfall};

/// Prints the `buildwatch` banner to stderr.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        magenta_bold("▦ buildwatch"),
        dim(env!("CARGO_PKG_VERSION")),
        dim("Live CI waterfall")
    );
}

/// Prints a transient error line for a failed request. Never fatal to a live view.
pub fn print_error_banner(message: impl std::fmt::Display) {
    eprintln!("{} {}", bright_red("✗"), bright_red(message));
}
