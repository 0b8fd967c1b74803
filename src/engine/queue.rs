use serde::Serialize;

use crate::events::{Build, Step};

/// Events waiting for a dependency that has not rendered yet.
///
/// Every queue is keyed by entity uuid: deferring an entry that is already
/// queued is a no-op, so a retransmitted event renders at most once.
#[derive(Debug, Default)]
pub struct PendingQueues {
    step_started: Vec<Step>,
    step_finished: Vec<Step>,
    build_started: Vec<Build>,
    build_finished: Vec<Build>,
}

/// Queue sizes, reported when a view is torn down.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub step_started: usize,
    pub step_finished: usize,
    pub build_started: usize,
    pub build_finished: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.step_started + self.step_finished + self.build_started + self.build_finished
    }
}

impl PendingQueues {
    pub fn defer_step_started(&mut self, step: Step) -> bool {
        push_unique(&mut self.step_started, step, |s| &s.uuid)
    }

    pub fn defer_step_finished(&mut self, step: Step) -> bool {
        push_unique(&mut self.step_finished, step, |s| &s.uuid)
    }

    pub fn defer_build_started(&mut self, build: Build) -> bool {
        push_unique(&mut self.build_started, build, |b| &b.uuid)
    }

    pub fn defer_build_finished(&mut self, build: Build) -> bool {
        push_unique(&mut self.build_finished, build, |b| &b.uuid)
    }

    /// Removes and returns queued `step_started` entries of one build, lowest index first.
    pub fn take_step_started(&mut self, build_uuid: &str) -> Vec<Step> {
        let mut steps = take_matching(&mut self.step_started, |s| s.build_uuid() == build_uuid);
        steps.sort_by_key(|s| s.index);
        steps
    }

    /// Removes and returns queued `step_finished` entries of one build, lowest index first.
    pub fn take_step_finished(&mut self, build_uuid: &str) -> Vec<Step> {
        let mut steps = take_matching(&mut self.step_finished, |s| s.build_uuid() == build_uuid);
        steps.sort_by_key(|s| s.index);
        steps
    }

    pub fn take_build_started(&mut self, build_uuid: &str) -> Vec<Build> {
        take_matching(&mut self.build_started, |b| b.uuid == build_uuid)
    }

    pub fn take_build_finished(&mut self, build_uuid: &str) -> Vec<Build> {
        take_matching(&mut self.build_finished, |b| b.uuid == build_uuid)
    }

    pub fn counts(&self) -> PendingCounts {
        PendingCounts {
            step_started: self.step_started.len(),
            step_finished: self.step_finished.len(),
            build_started: self.build_started.len(),
            build_finished: self.build_finished.len(),
        }
    }

    /// Whether a `step_finished` for this step is waiting for its start.
    pub fn has_step_finished(&self, step_uuid: &str) -> bool {
        self.step_finished.iter().any(|s| s.uuid == step_uuid)
    }
}

fn push_unique<T>(queue: &mut Vec<T>, item: T, key: impl Fn(&T) -> &String) -> bool {
    if queue.iter().any(|queued| key(queued) == key(&item)) {
        return false;
    }
    queue.push(item);
    true
}

fn take_matching<T>(queue: &mut Vec<T>, matches: impl Fn(&T) -> bool) -> Vec<T> {
    let (taken, kept): (Vec<T>, Vec<T>) = std::mem::take(queue).into_iter().partition(matches);
    *queue = kept;
    taken
}
