use std::fmt::Write;

use comfy_table::{Cell, Color as TableColor, Table};

use crate::engine::Affordance;
use crate::events::BuildSet;
use crate::waterfall::{BuildNode, BuildsetRow, StepNode, WaterfallModel};

use super::styling::{bright, dim};
use super::tables::{create_table, status_cell, status_glyph};

// Cell text stays unstyled: comfy-table measures raw bytes, so colors go on
// the cell itself.

/// Output lines kept per step when output is shown inline.
const OUTPUT_TAIL_LINES: usize = 3;

/// Prints the waterfall as a table: buildsets as rows (newest first),
/// builders as columns.
pub fn print_waterfall(model: &WaterfallModel, show_output: bool) {
    println!("{}", render_waterfall(model, show_output));
}

pub fn render_waterfall(model: &WaterfallModel, show_output: bool) -> String {
    let mut output = String::new();

    let title = model.repository().unwrap_or("waterfall");
    let _ = write!(output, "{} {}", bright("▦"), bright(title).underlined());
    if let Some(updated_at) = model.updated_at() {
        let _ = write!(output, "  {}", dim(format!("updated {}", updated_at.format("%H:%M:%S"))));
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "{}", waterfall_table(model, show_output));
    output
}

fn waterfall_table(model: &WaterfallModel, show_output: bool) -> Table {
    let mut table = create_table();

    let mut header = vec![Cell::new("Buildset").fg(TableColor::Cyan)];
    header.extend(
        model
            .builders()
            .map(|column| status_cell(column.name.clone(), column.status)),
    );
    table.set_header(header);

    for row in model.buildsets().rev() {
        let mut cells = vec![Cell::new(buildset_summary(row))];
        for column in model.builders() {
            let builds: Vec<&BuildNode> = row
                .cells
                .get(&column.id)
                .into_iter()
                .flatten()
                .filter_map(|uuid| model.build(uuid))
                .collect();

            let text = builds
                .iter()
                .map(|build| build_summary(build, show_output))
                .collect::<Vec<_>>()
                .join("\n\n");
            cells.push(status_cell(text, builds.last().map(|build| build.status)));
        }
        table.add_row(cells);
    }

    table
}

fn buildset_summary(row: &BuildsetRow) -> String {
    let mut text = String::new();
    let title = if row.title.is_empty() { &row.id } else { &row.title };
    let _ = writeln!(text, "{title}");

    let commit: String = row.commit.chars().take(8).collect();
    let _ = write!(text, "{} {commit}", row.branch);
    if !row.author.is_empty() {
        let _ = write!(text, " {}", row.author);
    }
    match (&row.finished, &row.total_time, &row.started) {
        (Some(_), Some(total_time), _) => {
            let _ = write!(text, "\ntook {total_time}");
        }
        (_, _, Some(started)) => {
            let _ = write!(text, "\nstarted {started}");
        }
        _ => {}
    }
    text
}

fn build_summary(build: &BuildNode, show_output: bool) -> String {
    let mut text = String::new();

    let label = match build.number {
        Some(number) => format!("#{number}"),
        None => build.uuid.chars().take(8).collect(),
    };
    let _ = write!(text, "{} {} {}", status_glyph(build.status), label, build.status);
    if let Some(total_time) = &build.total_time {
        let _ = write!(text, " ({total_time})");
    }
    let actions: Vec<&str> = build
        .affordances
        .iter()
        .map(|affordance| match affordance {
            Affordance::Cancel => "cancel",
            Affordance::Rebuild => "rebuild",
            Affordance::Reschedule => "reschedule",
        })
        .collect();
    if !actions.is_empty() {
        let _ = write!(text, " [{}]", actions.join("|"));
    }

    for step in build.steps.values() {
        let _ = write!(text, "\n{}", step_line(step));
        if show_output {
            if step.truncated {
                text.push_str("\n      [earlier output dropped]");
            }
            for line in output_tail(&step.output) {
                let _ = write!(text, "\n      {line}");
            }
        }
    }
    text
}

fn step_line(step: &StepNode) -> String {
    let name = if step.name.is_empty() { &step.command } else { &step.name };
    let glyph = status_glyph(step.status);
    match &step.total_time {
        Some(total_time) => format!("  {:>2} {glyph} {name} ({total_time})", step.index),
        None => format!("  {:>2} {glyph} {name}", step.index),
    }
}

fn output_tail(output: &str) -> Vec<&str> {
    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].to_vec()
}

/// Prints buildsets fetched over REST, newest first as returned.
pub fn print_buildsets(buildsets: &[BuildSet]) {
    let mut table = create_table();
    table.set_header(
        ["Buildset", "Branch", "Commit", "Author", "Builds", "Total time"]
            .iter()
            .map(|label| Cell::new(*label).fg(TableColor::Cyan))
            .collect::<Vec<_>>(),
    );

    for buildset in buildsets {
        let builds = buildset
            .builds
            .iter()
            .map(|build| {
                let name = if build.builder.name.is_empty() {
                    crate::engine::UNKNOWN_BUILDER
                } else {
                    build.builder.name.as_str()
                };
                format!("{} {name}", status_glyph(build.status))
            })
            .collect::<Vec<_>>()
            .join("\n");

        table.add_row(vec![
            Cell::new(if buildset.title.is_empty() { &buildset.id } else { &buildset.title }),
            Cell::new(&buildset.branch),
            Cell::new(buildset.commit.chars().take(8).collect::<String>()),
            Cell::new(&buildset.author),
            Cell::new(builds),
            Cell::new(buildset.total_time.as_deref().unwrap_or("-")),
        ]);
    }

    println!("{table}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Reconciler;
    use crate::events::{Build, Builder, Status};

    #[test]
    fn test_output_tail_keeps_last_non_empty_lines() {
        let output = "one\n\ntwo\nthree\nfour\n";
        assert_eq!(output_tail(output), vec!["two", "three", "four"]);
        assert!(output_tail("").is_empty());
    }

    #[test]
    fn test_render_lists_builders_and_builds() {
        console::set_colors_enabled(false);
        let builder = Builder {
            id: "1".to_string(),
            name: "py311".to_string(),
        };
        let mut engine = Reconciler::new(
            WaterfallModel::new(vec![builder.clone()]).with_repository("toxic/repo"),
        );
        engine.build_added(Build {
            uuid: "abcdef0123".to_string(),
            status: Status::Pending,
            builder,
            buildset: Some(BuildSet {
                id: "bs-1".to_string(),
                title: "Fix flaky test".to_string(),
                branch: "master".to_string(),
                ..BuildSet::default()
            }),
            ..Build::default()
        });

        let rendered = render_waterfall(engine.sink(), false);
        assert!(rendered.contains("toxic/repo"));
        assert!(rendered.contains("py311"));
        assert!(rendered.contains("Fix flaky test"));
        assert!(rendered.contains("abcdef01 pending"));
        assert!(rendered.contains("[cancel]"));
    }

    #[test]
    fn test_truncated_output_is_marked() {
        let mut step = StepNode {
            uuid: "s0".to_string(),
            index: 0,
            name: "tests".to_string(),
            command: "make test".to_string(),
            status: Status::Running,
            started: None,
            finished: None,
            total_time: None,
            output: "line 9\nline 10\n".to_string(),
            truncated: true,
        };
        let mut build = BuildNode {
            uuid: "b1".to_string(),
            buildset_id: "bs".to_string(),
            builder_id: "1".to_string(),
            number: Some(4),
            status: Status::Running,
            started: None,
            finished: None,
            total_time: None,
            affordances: Default::default(),
            steps: Default::default(),
        };
        build.steps.insert(step.uuid.clone(), step.clone());

        let text = build_summary(&build, true);
        assert!(text.contains("[earlier output dropped]"));
        assert!(text.contains("line 10"));
        assert!(!build_summary(&build, false).contains("dropped"));

        step.truncated = false;
        build.steps.insert(step.uuid.clone(), step);
        assert!(!build_summary(&build, true).contains("dropped"));
    }
}
