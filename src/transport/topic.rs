use std::fmt;

use url::Url;

use crate::error::Result;

/// A websocket feed exposed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Build, step and buildset events of one repository.
    Waterfall { repo_id: String },
    /// Incremental output of one running step.
    StepOutput { step_uuid: String },
    /// Status changes of one repository.
    RepoStatus { repo_id: String },
}

impl Topic {
    /// Resolves the topic against the websocket base URL.
    pub fn url(&self, ws_base: &Url) -> Result<Url> {
        let (path, key, value) = match self {
            Topic::Waterfall { repo_id } => ("api/socks/builds", "repository_id", repo_id),
            Topic::StepOutput { step_uuid } => ("api/socks/step-output", "uuid", step_uuid),
            Topic::RepoStatus { repo_id } => ("api/socks/repo-status", "repository_id", repo_id),
        };

        let mut base = ws_base.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut url = base.join(path)?;
        url.query_pairs_mut().append_pair(key, value);
        Ok(url)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Waterfall { repo_id } => write!(f, "waterfall feed of repository {repo_id}"),
            Topic::StepOutput { step_uuid } => write!(f, "output feed of step {step_uuid}"),
            Topic::RepoStatus { repo_id } => write!(f, "status feed of repository {repo_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_urls() {
        let base = Url::parse("ws://ci.example.com:8888").unwrap();

        let url = Topic::Waterfall {
            repo_id: "5a1b".to_string(),
        }
        .url(&base)
        .unwrap();
        assert_eq!(url.as_str(), "ws://ci.example.com:8888/api/socks/builds?repository_id=5a1b");

        let url = Topic::StepOutput {
            step_uuid: "s 1".to_string(),
        }
        .url(&base)
        .unwrap();
        assert_eq!(url.as_str(), "ws://ci.example.com:8888/api/socks/step-output?uuid=s+1");
    }

    #[test]
    fn test_topic_url_keeps_base_path() {
        let base = Url::parse("wss://example.com/ci").unwrap();
        let url = Topic::RepoStatus {
            repo_id: "r".to_string(),
        }
        .url(&base)
        .unwrap();
        assert_eq!(url.as_str(), "wss://example.com/ci/api/socks/repo-status?repository_id=r");
    }
}
