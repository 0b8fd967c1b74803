use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Visual status of a build, step or builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Preparing,
    Running,
    Success,
    Fail,
    Exception,
    Warning,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl Status {
    /// Terminal statuses are sinks: nothing moves a build or step out of them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Fail | Status::Exception | Status::Warning | Status::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Preparing => "preparing",
            Status::Running => "running",
            Status::Success => "success",
            Status::Fail => "fail",
            Status::Exception => "exception",
            Status::Warning => "warning",
            Status::Cancelled => "cancelled",
            Status::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named build configuration. Rendered as one waterfall column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Builder {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A group of builds triggered by one commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSet {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub finished: Option<String>,
    #[serde(default)]
    pub total_time: Option<String>,
    #[serde(default)]
    pub builds: Vec<Build>,
}

/// Execution of one builder against one commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Build {
    pub uuid: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub builder: Builder,
    /// Owning buildset. Nested builds inside a buildset payload omit it.
    #[serde(default)]
    pub buildset: Option<BuildSet>,
    #[serde(default)]
    pub number: Option<u64>,
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub finished: Option<String>,
    #[serde(default)]
    pub total_time: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Reference from a step back to the build that owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRef {
    #[serde(default)]
    pub uuid: String,
    #[serde(default, deserialize_with = "optional_id_string")]
    pub id: Option<String>,
}

/// One command executed within a build, displayed in `index` order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    pub uuid: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub finished: Option<String>,
    #[serde(default)]
    pub total_time: Option<String>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub build: BuildRef,
}

impl Step {
    pub fn build_uuid(&self) -> &str {
        &self.build.uuid
    }
}

/// Incremental output for a running step, delivered on its sentinel socket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Step uuid; sentinels fill it in when the server omits it.
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub output: String,
}

/// A decoded websocket frame: the mandatory tag plus the untouched payload.
///
/// Every frame a subscription receives is first decoded to a `Notice`, which is
/// what the document-level bus republishes. Typed consumers then narrow it with
/// [`Event::from_notice`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub event_type: String,
    pub payload: Value,
}

impl Notice {
    /// Decodes a raw text frame. Frames that are not JSON objects carrying a
    /// string `event_type` yield `None`.
    pub fn decode(text: &str) -> Option<Self> {
        let payload: Value = serde_json::from_str(text).ok()?;
        let event_type = payload.get("event_type")?.as_str()?.to_owned();
        Some(Self {
            event_type,
            payload,
        })
    }
}

/// Events consumed by the reconciliation engine, tagged by `event_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum Event {
    BuildAdded(Build),
    BuildStarted(Build),
    BuildFinished(Build),
    BuildCancelled(Build),
    StepStarted(Step),
    StepFinished(Step),
    StepOutputInfo(OutputChunk),
}

const KNOWN_TAGS: &[&str] = &[
    "build_added",
    "build_started",
    "build_finished",
    "build_cancelled",
    "step_started",
    "step_finished",
    "step_output_info",
];

impl Event {
    /// Narrows a notice to a typed event.
    ///
    /// Unknown tags are `Ok(None)` so newer servers can add event types
    /// without breaking older dashboards. A known tag with a payload of the
    /// wrong shape is an error.
    pub fn from_notice(notice: &Notice) -> Result<Option<Self>> {
        if !KNOWN_TAGS.contains(&notice.event_type.as_str()) {
            return Ok(None);
        }
        Ok(Some(Self::deserialize(&notice.payload)?))
    }

    /// Decodes one raw frame. See [`Event::from_notice`].
    pub fn decode(text: &str) -> Result<Option<Self>> {
        match Notice::decode(text) {
            Some(notice) => Self::from_notice(&notice),
            None => Ok(None),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::BuildAdded(_) => "build_added",
            Event::BuildStarted(_) => "build_started",
            Event::BuildFinished(_) => "build_finished",
            Event::BuildCancelled(_) => "build_cancelled",
            Event::StepStarted(_) => "step_started",
            Event::StepFinished(_) => "step_finished",
            Event::StepOutputInfo(_) => "step_output_info",
        }
    }
}

/// Ids arrive as strings from some servers and integers from others.
fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}

fn optional_id_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "id_string")] String);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(id)| id))
}
