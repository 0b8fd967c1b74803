use serde::Serialize;

use crate::error::Result;
use crate::events::{Build, BuildSet, Status, Step};

/// Key of a rendered node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeId {
    Buildset(String),
    Build(String),
    Step(String),
    Builder(String),
}

impl NodeId {
    pub fn build(uuid: &str) -> Self {
        NodeId::Build(uuid.to_owned())
    }

    pub fn step(uuid: &str) -> Self {
        NodeId::Step(uuid.to_owned())
    }

    pub fn buildset(id: &str) -> Self {
        NodeId::Buildset(id.to_owned())
    }

    pub fn builder(id: &str) -> Self {
        NodeId::Builder(id.to_owned())
    }
}

/// Attributes the engine may stamp on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attr {
    Started,
    Finished,
    TotalTime,
    Output,
    /// Set once the oldest streamed output had to be dropped.
    Truncated,
}

/// User actions a build node may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Affordance {
    Cancel,
    Rebuild,
    Reschedule,
}

/// The view tree the engine drives.
///
/// The engine only ever asks whether a node exists and what status it shows;
/// everything else is write-only. That keeps the engine independent of how
/// the waterfall is actually drawn.
pub trait RenderSink {
    fn has_node(&self, id: &NodeId) -> bool;

    fn current_status(&self, id: &NodeId) -> Option<Status>;

    /// Number of step nodes already rendered under a build.
    fn step_count(&self, build_uuid: &str) -> usize;

    /// Builder ids that get a placeholder cell in every new buildset row.
    fn known_builders(&self) -> Vec<String>;

    fn insert_buildset_row(&mut self, buildset: &BuildSet);

    fn insert_build_cell(&mut self, buildset_id: &str, builder_id: &str);

    /// Renders a build under its buildset row, in its builder's column.
    /// Builders the sink does not know still render, under a placeholder name.
    fn append_build_node(&mut self, buildset_id: &str, build: &Build);

    fn append_step_node(&mut self, step: &Step);

    fn update_status_class(&mut self, id: &NodeId, old: Option<Status>, new: Status);

    fn set_attribute(&mut self, id: &NodeId, key: Attr, value: &str);

    fn show_affordance(&mut self, id: &NodeId, affordance: Affordance);

    fn hide_affordance(&mut self, id: &NodeId, affordance: Affordance);
}

/// Live output subscriptions, one per running step.
pub trait OutputSentinels {
    fn open(&mut self, step: &Step);

    /// Closing a sentinel that is not open is a no-op.
    fn close(&mut self, step_uuid: &str) -> Result<()>;
}

/// Sentinels for views that never stream output, such as replays.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSentinels;

impl OutputSentinels for NoSentinels {
    fn open(&mut self, _step: &Step) {}

    fn close(&mut self, _step_uuid: &str) -> Result<()> {
        Ok(())
    }
}

/// Placeholder shown for builders the view cannot resolve.
pub const UNKNOWN_BUILDER: &str = "unknown builder";
