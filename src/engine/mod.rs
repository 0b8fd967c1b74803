//! Reconciliation of out-of-order build and step events.
//!
//! Builds, steps and output arrive over independent sockets with no global
//! sequence number. The [`Reconciler`] applies each event to a [`RenderSink`]
//! as soon as its dependency has rendered and parks it in [`PendingQueues`]
//! otherwise. Build-level events only need their build node to exist; step
//! starts additionally render strictly in `index` order within a build.

mod output;
mod queue;
mod sink;

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};

use crate::events::{Build, BuildSet, Event, OutputChunk, Status, Step};

pub use output::{OutputBuffer, DEFAULT_MAX_OUTPUT_BYTES};
pub use queue::{PendingCounts, PendingQueues};
pub use sink::{Affordance, Attr, NoSentinels, NodeId, OutputSentinels, RenderSink, UNKNOWN_BUILDER};

/// Buildset id used when a build payload carries no buildset.
const UNKNOWN_BUILDSET: &str = "unknown";

/// Event reconciliation engine for one waterfall view.
///
/// One instance is created per open view and dropped with it; nothing here is
/// shared between views. Every operation returns `true` when the event was
/// applied (or was already reflected in the sink) and `false` when it had to
/// be deferred or dropped.
pub struct Reconciler<S, O = NoSentinels> {
    sink: S,
    sentinels: O,
    last_step_index: HashMap<String, u32>,
    pending: PendingQueues,
    outputs: HashMap<String, OutputBuffer>,
    started_buildsets: HashSet<String>,
    max_output_bytes: usize,
}

impl<S: RenderSink> Reconciler<S, NoSentinels> {
    pub fn new(sink: S) -> Self {
        Self::with_sentinels(sink, NoSentinels)
    }
}

impl<S: RenderSink, O: OutputSentinels> Reconciler<S, O> {
    pub fn with_sentinels(sink: S, sentinels: O) -> Self {
        Self {
            sink,
            sentinels,
            last_step_index: HashMap::new(),
            pending: PendingQueues::default(),
            outputs: HashMap::new(),
            started_buildsets: HashSet::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    #[cfg(test)]
    pub fn sentinels(&self) -> &O {
        &self.sentinels
    }

    #[cfg(test)]
    pub fn pending(&self) -> PendingCounts {
        self.pending.counts()
    }

    /// Highest step index rendered so far for a build.
    pub fn last_step_index(&self, build_uuid: &str) -> Option<u32> {
        self.last_step_index.get(build_uuid).copied()
    }

    /// Dispatches one event to its operation.
    pub fn apply(&mut self, event: Event) -> bool {
        debug!("Applying {} event", event.kind());
        match event {
            Event::BuildAdded(build) => self.build_added(build),
            Event::BuildStarted(build) => self.build_started(build),
            Event::BuildFinished(build) => self.build_finished(build),
            Event::BuildCancelled(build) => self.build_cancelled(build),
            Event::StepStarted(step) => self.step_started(step),
            Event::StepFinished(step) => self.step_finished(step),
            Event::StepOutputInfo(chunk) => self.step_output(chunk),
        }
    }

    /// Creates the build node, and its buildset row when missing. Never deferred.
    pub fn build_added(&mut self, build: Build) -> bool {
        let buildset_id = build
            .buildset
            .as_ref()
            .map(|buildset| buildset.id.clone())
            .unwrap_or_else(|| UNKNOWN_BUILDSET.to_string());

        if !self.sink.has_node(&NodeId::buildset(&buildset_id)) {
            let placeholder;
            let buildset = match &build.buildset {
                Some(buildset) => buildset,
                None => {
                    placeholder = BuildSet {
                        id: buildset_id.clone(),
                        ..BuildSet::default()
                    };
                    &placeholder
                }
            };
            self.sink.insert_buildset_row(buildset);
            for builder_id in self.sink.known_builders() {
                self.sink.insert_build_cell(&buildset_id, &builder_id);
            }
        }

        let node = NodeId::build(&build.uuid);
        if self.sink.has_node(&node) {
            debug!("Build {} already rendered, ignoring build_added", build.uuid);
            return true;
        }

        self.sink.append_build_node(&buildset_id, &build);
        if build.status == Status::Pending {
            self.sink.show_affordance(&node, Affordance::Cancel);
        }

        self.drain_builds(&build.uuid);
        self.drain_steps(&build.uuid);
        true
    }

    pub fn build_started(&mut self, build: Build) -> bool {
        if !self.sink.has_node(&NodeId::build(&build.uuid)) {
            debug!("Build {} not rendered yet, deferring build_started", build.uuid);
            self.pending.defer_build_started(build);
            return false;
        }

        let uuid = build.uuid.clone();
        self.apply_build_started(&build);
        self.drain_builds(&uuid);
        self.drain_steps(&uuid);
        true
    }

    pub fn build_finished(&mut self, build: Build) -> bool {
        if !self.sink.has_node(&NodeId::build(&build.uuid)) {
            debug!("Build {} not rendered yet, deferring build_finished", build.uuid);
            self.pending.defer_build_finished(build);
            return false;
        }

        let uuid = build.uuid.clone();
        self.apply_build_finished(&build);
        self.drain_builds(&uuid);
        self.drain_steps(&uuid);
        true
    }

    /// Cancellation has no deferral path: a cancel for a build that never
    /// rendered is dropped.
    pub fn build_cancelled(&mut self, build: Build) -> bool {
        let node = NodeId::build(&build.uuid);
        if !self.sink.has_node(&node) {
            warn!("Dropping build_cancelled for unknown build {}", build.uuid);
            return false;
        }

        let current = self.sink.current_status(&node);
        if current.is_some_and(Status::is_terminal) {
            debug!("Build {} already finished, ignoring build_cancelled", build.uuid);
        } else {
            self.sink
                .update_status_class(&node, current, Status::Cancelled);
            self.sink.hide_affordance(&node, Affordance::Cancel);
            self.sink.show_affordance(&node, Affordance::Reschedule);
        }

        self.drain_builds(&build.uuid);
        self.drain_steps(&build.uuid);
        true
    }

    pub fn step_started(&mut self, step: Step) -> bool {
        if self.sink.has_node(&NodeId::step(&step.uuid)) {
            debug!("Step {} already rendered, ignoring step_started", step.uuid);
            return true;
        }

        if !self.try_start_step(&step) {
            debug!(
                "Step {} (index {}) of build {} not ready, deferring",
                step.uuid,
                step.index,
                step.build_uuid()
            );
            self.pending.defer_step_started(step);
            return false;
        }

        self.drain_steps(step.build_uuid());
        true
    }

    pub fn step_finished(&mut self, step: Step) -> bool {
        if self.try_finish_step(&step) {
            return true;
        }

        debug!("Step {} not rendered yet, deferring step_finished", step.uuid);
        self.pending.defer_step_finished(step);
        false
    }

    /// Appends streamed output to a running step. Chunks for steps without a
    /// live sentinel are dropped.
    pub fn step_output(&mut self, chunk: OutputChunk) -> bool {
        let Some(buffer) = self.outputs.get_mut(&chunk.uuid) else {
            debug!("No live output for step {}, dropping chunk", chunk.uuid);
            return false;
        };

        buffer.push(&chunk.output);
        let node = NodeId::step(&chunk.uuid);
        self.sink.set_attribute(&node, Attr::Output, buffer.as_str());
        if buffer.is_truncated() {
            self.sink.set_attribute(&node, Attr::Truncated, "true");
        }
        true
    }

    /// Closes every live sentinel and hands back the sink.
    ///
    /// Queued events are not expired while a view is open; whatever is still
    /// waiting here is reported and discarded with the view.
    pub fn teardown(mut self) -> (S, PendingCounts) {
        let live: Vec<String> = self.outputs.drain().map(|(uuid, _)| uuid).collect();
        for uuid in live {
            if let Err(e) = self.sentinels.close(&uuid) {
                warn!("Failed to close output sentinel for step {uuid}: {e}");
            }
        }

        let stranded = self.pending.counts();
        if stranded.total() > 0 {
            warn!(
                "Discarding {} queued events whose dependencies never arrived",
                stranded.total()
            );
        } else {
            info!("Waterfall view closed with no pending events");
        }

        (self.sink, stranded)
    }

    fn apply_build_started(&mut self, build: &Build) {
        let node = NodeId::build(&build.uuid);
        let current = self.sink.current_status(&node);

        if current.is_some_and(Status::is_terminal) {
            debug!("Build {} already finished, ignoring build_started", build.uuid);
            return;
        }

        if current != Some(Status::Running) {
            self.sink
                .update_status_class(&node, current, Status::Running);
        }
        self.sink.hide_affordance(&node, Affordance::Cancel);
        if let Some(started) = &build.started {
            self.sink.set_attribute(&node, Attr::Started, started);
        }

        let builder = NodeId::builder(&build.builder.id);
        let builder_status = self.sink.current_status(&builder);
        if builder_status != Some(Status::Running) {
            self.sink
                .update_status_class(&builder, builder_status, Status::Running);
        }

        // The first stamp a buildset receives is its start; payloads without
        // one leave the row as it is.
        if let Some(buildset) = &build.buildset {
            let started = buildset.started.as_ref().or(build.started.as_ref());
            if let Some(started) = started {
                if self.started_buildsets.insert(buildset.id.clone()) {
                    self.sink
                        .set_attribute(&NodeId::buildset(&buildset.id), Attr::Started, started);
                }
            }
        }
    }

    fn apply_build_finished(&mut self, build: &Build) {
        let node = NodeId::build(&build.uuid);
        let current = self.sink.current_status(&node);

        if current.is_some_and(Status::is_terminal) {
            debug!("Build {} already finished, ignoring build_finished", build.uuid);
            return;
        }

        self.sink.update_status_class(&node, current, build.status);
        self.sink.hide_affordance(&node, Affordance::Cancel);
        self.sink.show_affordance(&node, Affordance::Rebuild);
        if let Some(finished) = &build.finished {
            self.sink.set_attribute(&node, Attr::Finished, finished);
        }
        if let Some(total_time) = &build.total_time {
            self.sink.set_attribute(&node, Attr::TotalTime, total_time);
        }

        let builder = NodeId::builder(&build.builder.id);
        let builder_status = self.sink.current_status(&builder);
        self.sink
            .update_status_class(&builder, builder_status, build.status);

        if let Some(buildset) = &build.buildset {
            let row = NodeId::buildset(&buildset.id);
            if let Some(finished) = &buildset.finished {
                self.sink.set_attribute(&row, Attr::Finished, finished);
            }
            if let Some(total_time) = &buildset.total_time {
                self.sink.set_attribute(&row, Attr::TotalTime, total_time);
            }
        }
    }

    /// Renders a step if its build exists and every lower index has rendered.
    fn try_start_step(&mut self, step: &Step) -> bool {
        let build_uuid = step.build_uuid();
        if !self.sink.has_node(&NodeId::build(build_uuid)) {
            return false;
        }

        if step.index > 0 {
            let in_sequence = self.last_step_index(build_uuid) == Some(step.index - 1);
            let rendered = self.sink.step_count(build_uuid);
            if !in_sequence || rendered > step.index as usize {
                return false;
            }
        }

        self.sink.append_step_node(step);
        if step.status.is_terminal() || self.pending.has_step_finished(&step.uuid) {
            debug!("Step {} already finished, not streaming its output", step.uuid);
        } else {
            self.sentinels.open(step);
            self.outputs
                .insert(step.uuid.clone(), OutputBuffer::new(self.max_output_bytes));
        }

        let last = self
            .last_step_index
            .entry(build_uuid.to_string())
            .or_insert(step.index);
        *last = (*last).max(step.index);
        true
    }

    /// Finishes a rendered step. A step already in a terminal state counts as applied.
    fn try_finish_step(&mut self, step: &Step) -> bool {
        let node = NodeId::step(&step.uuid);
        if !self.sink.has_node(&node) {
            return false;
        }

        let current = self.sink.current_status(&node);
        if current.is_some_and(Status::is_terminal) {
            debug!("Step {} already finished, ignoring step_finished", step.uuid);
            return true;
        }

        let streamed = self.outputs.remove(&step.uuid);
        if streamed.is_some() {
            if let Err(e) = self.sentinels.close(&step.uuid) {
                warn!("Failed to close output sentinel for step {}: {e}", step.uuid);
            }
        }

        self.sink.update_status_class(&node, current, step.status);
        if let Some(started) = &step.started {
            self.sink.set_attribute(&node, Attr::Started, started);
        }
        if let Some(finished) = &step.finished {
            self.sink.set_attribute(&node, Attr::Finished, finished);
        }
        if let Some(total_time) = &step.total_time {
            self.sink.set_attribute(&node, Attr::TotalTime, total_time);
        }

        if !step.output.is_empty() {
            self.sink.set_attribute(&node, Attr::Output, &step.output);
            self.sink.set_attribute(&node, Attr::Truncated, "false");
        } else if let Some(buffer) = streamed.filter(|buffer| !buffer.is_empty()) {
            if buffer.is_truncated() {
                self.sink.set_attribute(&node, Attr::Truncated, "true");
            }
            self.sink
                .set_attribute(&node, Attr::Output, &buffer.into_string());
        }
        true
    }

    /// Applies queued build events of a build whose node now exists.
    fn drain_builds(&mut self, build_uuid: &str) {
        for build in self.pending.take_build_started(build_uuid) {
            debug!("Draining queued build_started for {build_uuid}");
            self.apply_build_started(&build);
        }
        for build in self.pending.take_build_finished(build_uuid) {
            debug!("Draining queued build_finished for {build_uuid}");
            self.apply_build_finished(&build);
        }
    }

    /// Replays queued step events of one build until a pass makes no progress.
    ///
    /// Starts go first in index order, then finishes. Each progressing pass
    /// consumes at least one queued entry, so the loop terminates.
    fn drain_steps(&mut self, build_uuid: &str) {
        loop {
            let mut progressed = false;

            for step in self.pending.take_step_started(build_uuid) {
                if self.sink.has_node(&NodeId::step(&step.uuid)) {
                    progressed = true;
                } else if self.try_start_step(&step) {
                    debug!("Drained queued step_started {} (index {})", step.uuid, step.index);
                    progressed = true;
                } else {
                    self.pending.defer_step_started(step);
                }
            }

            for step in self.pending.take_step_finished(build_uuid) {
                if self.try_finish_step(&step) {
                    debug!("Drained queued step_finished {}", step.uuid);
                    progressed = true;
                } else {
                    self.pending.defer_step_finished(step);
                }
            }

            if !progressed {
                break;
            }
        }
    }
}
