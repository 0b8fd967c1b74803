use serde::{Deserialize, Serialize};

/// REST collections exposed under `/api/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Resource {
    Repo,
    Slave,
    Notification,
    User,
    Build,
    Buildset,
}

impl Resource {
    /// Collection path relative to the API root, with its trailing slash.
    pub fn path(self) -> &'static str {
        match self {
            Resource::Repo => "repo/",
            Resource::Slave => "slave/",
            Resource::Notification => "notification/",
            Resource::User => "user/",
            Resource::Build => "build/",
            Resource::Buildset => "buildset/",
        }
    }
}

/// Body of `POST /api/repo/start-build`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartBuild {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub builders_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub named_tree: Option<String>,
}

/// List endpoints answer either with a bare array or wrapped in `items`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ListResponse<T> {
    Items { items: Vec<T> },
    Bare(Vec<T>),
}

impl<T> ListResponse<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            ListResponse::Items { items } => items,
            ListResponse::Bare(items) => items,
        }
    }
}
