use indexmap::IndexMap;

use crate::events::{Build, BuildRef, BuildSet, Builder, Event, Status, Step};

/// Builders referenced by a list of buildsets, in first-seen order.
pub fn builders_of(buildsets: &[BuildSet]) -> Vec<Builder> {
    let mut builders: IndexMap<String, Builder> = IndexMap::new();
    for build in buildsets.iter().flat_map(|buildset| &buildset.builds) {
        builders
            .entry(build.builder.id.clone())
            .or_insert_with(|| build.builder.clone());
    }
    builders.into_values().collect()
}

/// Replays a REST snapshot as the events that would have produced it.
///
/// Buildsets are seeded in the given order, which is the order their rows
/// are inserted. Each build goes through `build_added` as pending and then
/// whatever transitions its current status implies; its steps follow in
/// index order. Finished steps carry their finish ahead of their start,
/// unfinished ones keep the status the snapshot reported.
pub fn seed_events(buildsets: &[BuildSet]) -> Vec<Event> {
    let mut events = Vec::new();

    for buildset in buildsets {
        let header = BuildSet {
            builds: Vec::new(),
            ..buildset.clone()
        };

        for build in &buildset.builds {
            let build = Build {
                buildset: Some(header.clone()),
                ..build.clone()
            };
            seed_build(&mut events, build);
        }
    }

    events
}

fn seed_build(events: &mut Vec<Event>, mut build: Build) {
    let mut steps = std::mem::take(&mut build.steps);
    steps.sort_by_key(|step| step.index);
    let status = build.status;

    events.push(Event::BuildAdded(Build {
        status: if status == Status::Preparing {
            Status::Preparing
        } else {
            Status::Pending
        },
        ..build.clone()
    }));

    match status {
        Status::Pending | Status::Preparing => return,
        Status::Cancelled => {
            events.push(Event::BuildCancelled(build));
            return;
        }
        _ => events.push(Event::BuildStarted(build.clone())),
    }

    for step in steps {
        let step = Step {
            build: BuildRef {
                uuid: build.uuid.clone(),
                id: step.build.id.clone(),
            },
            ..step
        };
        if step.status.is_terminal() {
            // Queued ahead of its start so the step never opens an output stream.
            events.push(Event::StepFinished(step.clone()));
            events.push(Event::StepStarted(Step {
                status: Status::Running,
                ..step
            }));
        } else {
            events.push(Event::StepStarted(step));
        }
    }

    if status.is_terminal() {
        events.push(Event::BuildFinished(build));
    }
}
