use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::styling::{bright, bright_green, bright_yellow};

/// Spinner for the two start-up phases of a live view
pub struct PhaseProgress {
    pb: ProgressBar,
}

impl PhaseProgress {
    pub fn start_phase_1(repo: &str) -> Self {
        eprintln!("{}  {}", bright("⚙️"), bright("Phases").underlined());
        let pb = create_spinner(
            bright_yellow(format!("Phase 1/2: Subscribing to {repo} events")).to_string(),
        );
        Self { pb }
    }

    pub fn finish_phase_1_start_phase_2(self) -> Self {
        self.pb
            .finish_with_message(bright_green("Phase 1/2: Subscribed ✓").to_string());
        let pb = create_spinner(bright_yellow("Phase 2/2: Fetching buildsets").to_string());
        Self { pb }
    }

    pub fn finish_phase_2(self, buildset_count: usize) {
        self.pb.finish_with_message(
            bright_green(format!("Phase 2/2: Seeded {buildset_count} buildsets ✓")).to_string(),
        );
        eprintln!();
    }

    pub fn abandon(self, message: &str) {
        self.pb.abandon_with_message(message.to_string());
    }
}

fn create_spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("  {msg} {spinner}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}
