use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::debug;
use serde::Serialize;

use crate::engine::{Affordance, Attr, NodeId, RenderSink, UNKNOWN_BUILDER};
use crate::events::{Build, BuildSet, Builder, Status, Step};

/// One waterfall column.
#[derive(Debug, Clone, Serialize)]
pub struct BuilderColumn {
    pub id: String,
    pub name: String,
    /// Aggregate status: the status of the most recent build event for this builder.
    pub status: Option<Status>,
}

/// One waterfall row.
#[derive(Debug, Clone, Serialize)]
pub struct BuildsetRow {
    pub id: String,
    pub commit: String,
    pub branch: String,
    pub author: String,
    pub title: String,
    pub created: Option<String>,
    pub started: Option<String>,
    pub finished: Option<String>,
    pub total_time: Option<String>,
    /// Build uuids per builder id, in render order.
    pub cells: IndexMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildNode {
    pub uuid: String,
    pub buildset_id: String,
    pub builder_id: String,
    pub number: Option<u64>,
    pub status: Status,
    pub started: Option<String>,
    pub finished: Option<String>,
    pub total_time: Option<String>,
    pub affordances: BTreeSet<Affordance>,
    /// Steps in the order they were rendered.
    pub steps: IndexMap<String, StepNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepNode {
    pub uuid: String,
    pub index: u32,
    pub name: String,
    pub command: String,
    pub status: Status,
    pub started: Option<String>,
    pub finished: Option<String>,
    pub total_time: Option<String>,
    pub output: String,
    /// Older output was dropped to stay within the view's output limit.
    pub truncated: bool,
}

/// In-memory waterfall: buildsets as rows, builders as columns.
///
/// This is the render sink the terminal views draw from. It holds exactly
/// what the engine wrote into it and nothing else.
#[derive(Debug, Default, Serialize)]
pub struct WaterfallModel {
    repository: Option<String>,
    builders: IndexMap<String, BuilderColumn>,
    buildsets: IndexMap<String, BuildsetRow>,
    builds: IndexMap<String, BuildNode>,
    #[serde(skip)]
    step_owner: HashMap<String, String>,
    updated_at: Option<DateTime<Utc>>,
}

impl WaterfallModel {
    pub fn new(builders: impl IntoIterator<Item = Builder>) -> Self {
        let builders = builders
            .into_iter()
            .map(|builder| {
                let column = BuilderColumn {
                    id: builder.id.clone(),
                    name: display_name(&builder),
                    status: None,
                };
                (builder.id, column)
            })
            .collect();

        Self {
            builders,
            ..Self::default()
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn repository(&self) -> Option<&str> {
        self.repository.as_deref()
    }

    pub fn builders(&self) -> impl DoubleEndedIterator<Item = &BuilderColumn> {
        self.builders.values()
    }

    #[cfg(test)]
    pub fn builder(&self, id: &str) -> Option<&BuilderColumn> {
        self.builders.get(id)
    }

    /// Rows in insertion order, oldest first.
    pub fn buildsets(&self) -> impl DoubleEndedIterator<Item = &BuildsetRow> {
        self.buildsets.values()
    }

    #[cfg(test)]
    pub fn buildset(&self, id: &str) -> Option<&BuildsetRow> {
        self.buildsets.get(id)
    }

    pub fn build(&self, uuid: &str) -> Option<&BuildNode> {
        self.builds.get(uuid)
    }

    pub fn step(&self, uuid: &str) -> Option<&StepNode> {
        let owner = self.step_owner.get(uuid)?;
        self.builds.get(owner)?.steps.get(uuid)
    }

    /// Step indices of a build in render order.
    #[cfg(test)]
    pub fn step_order(&self, build_uuid: &str) -> Vec<u32> {
        self.builds
            .get(build_uuid)
            .map(|build| build.steps.values().map(|step| step.index).collect())
            .unwrap_or_default()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    fn step_mut(&mut self, uuid: &str) -> Option<&mut StepNode> {
        let owner = self.step_owner.get(uuid)?;
        self.builds.get_mut(owner)?.steps.get_mut(uuid)
    }

    fn ensure_builder(&mut self, builder: &Builder) {
        if !self.builders.contains_key(&builder.id) {
            debug!("Builder {:?} not known to this view, using placeholder", builder.id);
            self.builders.insert(
                builder.id.clone(),
                BuilderColumn {
                    id: builder.id.clone(),
                    name: display_name(builder),
                    status: None,
                },
            );
        }
    }
}

fn display_name(builder: &Builder) -> String {
    if builder.name.is_empty() {
        UNKNOWN_BUILDER.to_string()
    } else {
        builder.name.clone()
    }
}

fn row_from(buildset: &BuildSet) -> BuildsetRow {
    BuildsetRow {
        id: buildset.id.clone(),
        commit: buildset.commit.clone(),
        branch: buildset.branch.clone(),
        author: buildset.author.clone(),
        title: buildset.title.clone(),
        created: buildset.created.clone(),
        started: buildset.started.clone(),
        finished: buildset.finished.clone(),
        total_time: buildset.total_time.clone(),
        cells: IndexMap::new(),
    }
}

impl RenderSink for WaterfallModel {
    fn has_node(&self, id: &NodeId) -> bool {
        match id {
            NodeId::Buildset(id) => self.buildsets.contains_key(id),
            NodeId::Build(uuid) => self.builds.contains_key(uuid),
            NodeId::Step(uuid) => self.step(uuid).is_some(),
            NodeId::Builder(id) => self.builders.contains_key(id),
        }
    }

    fn current_status(&self, id: &NodeId) -> Option<Status> {
        match id {
            NodeId::Buildset(_) => None,
            NodeId::Build(uuid) => self.builds.get(uuid).map(|build| build.status),
            NodeId::Step(uuid) => self.step(uuid).map(|step| step.status),
            NodeId::Builder(id) => self.builders.get(id).and_then(|column| column.status),
        }
    }

    fn step_count(&self, build_uuid: &str) -> usize {
        self.builds
            .get(build_uuid)
            .map_or(0, |build| build.steps.len())
    }

    fn known_builders(&self) -> Vec<String> {
        self.builders.keys().cloned().collect()
    }

    fn insert_buildset_row(&mut self, buildset: &BuildSet) {
        self.buildsets
            .entry(buildset.id.clone())
            .or_insert_with(|| row_from(buildset));
        self.touch();
    }

    fn insert_build_cell(&mut self, buildset_id: &str, builder_id: &str) {
        if let Some(row) = self.buildsets.get_mut(buildset_id) {
            row.cells.entry(builder_id.to_string()).or_default();
        }
    }

    fn append_build_node(&mut self, buildset_id: &str, build: &Build) {
        self.ensure_builder(&build.builder);

        let row = self
            .buildsets
            .entry(buildset_id.to_string())
            .or_insert_with(|| {
                row_from(&BuildSet {
                    id: buildset_id.to_string(),
                    ..BuildSet::default()
                })
            });
        row.cells
            .entry(build.builder.id.clone())
            .or_default()
            .push(build.uuid.clone());

        self.builds.insert(
            build.uuid.clone(),
            BuildNode {
                uuid: build.uuid.clone(),
                buildset_id: buildset_id.to_string(),
                builder_id: build.builder.id.clone(),
                number: build.number,
                status: build.status,
                started: build.started.clone(),
                finished: build.finished.clone(),
                total_time: build.total_time.clone(),
                affordances: BTreeSet::new(),
                steps: IndexMap::new(),
            },
        );
        self.touch();
    }

    fn append_step_node(&mut self, step: &Step) {
        let Some(build) = self.builds.get_mut(step.build_uuid()) else {
            return;
        };

        build.steps.insert(
            step.uuid.clone(),
            StepNode {
                uuid: step.uuid.clone(),
                index: step.index,
                name: step.name.clone(),
                command: step.command.clone(),
                status: step.status,
                started: step.started.clone(),
                finished: None,
                total_time: None,
                output: String::new(),
                truncated: false,
            },
        );
        self.step_owner
            .insert(step.uuid.clone(), step.build_uuid().to_string());
        self.touch();
    }

    fn update_status_class(&mut self, id: &NodeId, _old: Option<Status>, new: Status) {
        match id {
            NodeId::Buildset(_) => return,
            NodeId::Build(uuid) => {
                if let Some(build) = self.builds.get_mut(uuid) {
                    build.status = new;
                }
            }
            NodeId::Step(uuid) => {
                if let Some(step) = self.step_mut(uuid) {
                    step.status = new;
                }
            }
            NodeId::Builder(id) => {
                if let Some(column) = self.builders.get_mut(id) {
                    column.status = Some(new);
                }
            }
        }
        self.touch();
    }

    fn set_attribute(&mut self, id: &NodeId, key: Attr, value: &str) {
        let value = value.to_string();
        match id {
            NodeId::Buildset(id) => {
                if let Some(row) = self.buildsets.get_mut(id) {
                    match key {
                        Attr::Started => row.started = Some(value),
                        Attr::Finished => row.finished = Some(value),
                        Attr::TotalTime => row.total_time = Some(value),
                        Attr::Output | Attr::Truncated => {}
                    }
                }
            }
            NodeId::Build(uuid) => {
                if let Some(build) = self.builds.get_mut(uuid) {
                    match key {
                        Attr::Started => build.started = Some(value),
                        Attr::Finished => build.finished = Some(value),
                        Attr::TotalTime => build.total_time = Some(value),
                        Attr::Output | Attr::Truncated => {}
                    }
                }
            }
            NodeId::Step(uuid) => {
                if let Some(step) = self.step_mut(uuid) {
                    match key {
                        Attr::Started => step.started = Some(value),
                        Attr::Finished => step.finished = Some(value),
                        Attr::TotalTime => step.total_time = Some(value),
                        Attr::Output => step.output = value,
                        Attr::Truncated => step.truncated = value == "true",
                    }
                }
            }
            NodeId::Builder(_) => {}
        }
        self.touch();
    }

    fn show_affordance(&mut self, id: &NodeId, affordance: Affordance) {
        if let NodeId::Build(uuid) = id {
            if let Some(build) = self.builds.get_mut(uuid) {
                build.affordances.insert(affordance);
            }
        }
    }

    fn hide_affordance(&mut self, id: &NodeId, affordance: Affordance) {
        if let NodeId::Build(uuid) = id {
            if let Some(build) = self.builds.get_mut(uuid) {
                build.affordances.remove(&affordance);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BuildRef;

    fn builder(id: &str, name: &str) -> Builder {
        Builder {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_unknown_builder_gets_placeholder_column() {
        let mut model = WaterfallModel::new(vec![builder("b1", "py311")]);
        model.insert_buildset_row(&BuildSet {
            id: "bs".to_string(),
            ..BuildSet::default()
        });

        let build = Build {
            uuid: "u1".to_string(),
            builder: builder("b9", ""),
            ..Build::default()
        };
        model.append_build_node("bs", &build);

        assert_eq!(model.builder("b9").unwrap().name, UNKNOWN_BUILDER);
        assert_eq!(model.buildset("bs").unwrap().cells["b9"], vec!["u1"]);
        assert_eq!(model.known_builders(), vec!["b1", "b9"]);
    }

    #[test]
    fn test_step_nodes_are_looked_up_through_their_build() {
        let mut model = WaterfallModel::default();
        model.append_build_node(
            "bs",
            &Build {
                uuid: "u1".to_string(),
                ..Build::default()
            },
        );
        model.append_step_node(&Step {
            uuid: "s0".to_string(),
            status: Status::Running,
            build: BuildRef {
                uuid: "u1".to_string(),
                id: None,
            },
            ..Step::default()
        });

        assert!(model.has_node(&NodeId::step("s0")));
        assert_eq!(model.step_count("u1"), 1);

        model.set_attribute(&NodeId::step("s0"), Attr::Output, "hello");
        model.update_status_class(&NodeId::step("s0"), Some(Status::Running), Status::Success);
        let step = model.step("s0").unwrap();
        assert_eq!(step.output, "hello");
        assert_eq!(step.status, Status::Success);
    }

    #[test]
    fn test_step_for_missing_build_is_not_rendered() {
        let mut model = WaterfallModel::default();
        model.append_step_node(&Step {
            uuid: "s0".to_string(),
            ..Step::default()
        });
        assert!(!model.has_node(&NodeId::step("s0")));
    }
}
