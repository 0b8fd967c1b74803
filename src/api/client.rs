use std::time::Duration;

use log::{debug, warn};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::auth::Token;
use crate::error::{BuildWatchError, Result};
use crate::events::BuildSet;

use super::types::{ListResponse, Resource, StartBuild};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MILLIS: u64 = 2000;

/// Client for the server's REST API.
///
/// Writes and deletes address a single record with `?id=<id>`; list reads
/// pass their filters as query parameters.
pub struct ApiClient {
    client: Client,
    api_url: Url,
    token: Option<Token>,
    retry_delay: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<Token>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("buildwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BuildWatchError::Config(format!("Failed to create HTTP client: {e}")))?;

        let mut base = Url::parse(base_url)
            .map_err(|e| BuildWatchError::Config(format!("Invalid base URL: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let api_url = base
            .join("api/")
            .map_err(|e| BuildWatchError::Config(format!("Invalid API base URL: {e}")))?;

        Ok(Self {
            client,
            api_url,
            token,
            retry_delay: Duration::from_millis(RETRY_DELAY_MILLIS),
        })
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// URL of a collection, or of one record of it when `id` is given.
    pub fn resource_url(&self, resource: Resource, id: Option<&str>) -> Result<Url> {
        let mut url = self.api_url.join(resource.path())?;
        if let Some(id) = id {
            url.query_pairs_mut().append_pair("id", id);
        }
        Ok(url)
    }

    fn action_url(&self, resource: Resource, action: &str, id: &str) -> Result<Url> {
        let mut url = self.api_url.join(resource.path())?.join(action)?;
        url.query_pairs_mut().append_pair("id", id);
        Ok(url)
    }

    fn auth_request(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token.as_str())
        } else {
            request
        }
    }

    /// Sends a request, retrying on network errors, rate limits and server errors.
    async fn send(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value> {
        let mut retry_count = 0;
        loop {
            let mut request = self.auth_request(self.client.request(method.clone(), url.clone()));
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    if retry_count >= MAX_RETRIES {
                        return Err(e.into());
                    }
                    warn!(
                        "Network error ({e}), retrying in {}ms ({}/{MAX_RETRIES})...",
                        self.retry_delay.as_millis(),
                        retry_count + 1,
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();

            if status == 429 || status.is_server_error() {
                if retry_count >= MAX_RETRIES {
                    return Err(BuildWatchError::ApiAfterRetries {
                        status: status.as_u16(),
                        retries: MAX_RETRIES,
                    });
                }
                warn!(
                    "API error (status {status}), retrying {}/{MAX_RETRIES}...",
                    retry_count + 1
                );
                tokio::time::sleep(self.retry_delay).await;
                retry_count += 1;
                continue;
            }

            if !status.is_success() {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read error response".to_string());
                return Err(BuildWatchError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let text = response.text().await?;
            debug!("{method} {url} -> {status}");
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&text)?);
        }
    }

    pub async fn list<T: DeserializeOwned>(
        &self,
        resource: Resource,
        filters: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut url = self.resource_url(resource, None)?;
        if !filters.is_empty() {
            url.query_pairs_mut().extend_pairs(filters);
        }
        let value = self.send(Method::GET, url, None).await?;
        let list: ListResponse<T> = serde_json::from_value(value)?;
        Ok(list.into_vec())
    }

    pub async fn get<T: DeserializeOwned>(&self, resource: Resource, id: &str) -> Result<T> {
        let url = self.resource_url(resource, Some(id))?;
        let value = self.send(Method::GET, url, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn create(&self, resource: Resource, body: &impl Serialize) -> Result<Value> {
        let url = self.resource_url(resource, None)?;
        let body = serde_json::to_value(body)?;
        self.send(Method::POST, url, Some(&body)).await
    }

    pub async fn update(&self, resource: Resource, id: &str, body: &impl Serialize) -> Result<Value> {
        let url = self.resource_url(resource, Some(id))?;
        let body = serde_json::to_value(body)?;
        self.send(Method::PUT, url, Some(&body)).await
    }

    pub async fn delete(&self, resource: Resource, id: &str) -> Result<()> {
        let url = self.resource_url(resource, Some(id))?;
        self.send(Method::DELETE, url, None).await?;
        Ok(())
    }

    pub async fn start_build(&self, repo_id: &str, request: &StartBuild) -> Result<Value> {
        let url = self.action_url(Resource::Repo, "start-build", repo_id)?;
        let body = serde_json::to_value(request)?;
        self.send(Method::POST, url, Some(&body)).await
    }

    pub async fn cancel_build(&self, repo_id: &str, build_uuid: &str) -> Result<Value> {
        let url = self.action_url(Resource::Repo, "cancel-build", repo_id)?;
        let body = serde_json::json!({ "build_uuid": build_uuid });
        self.send(Method::POST, url, Some(&body)).await
    }

    /// Buildsets of one repository, newest first.
    pub async fn list_buildsets(&self, repo_id: &str) -> Result<Vec<BuildSet>> {
        self.list(Resource::Buildset, &[("repo_id", repo_id)]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn client(server: &mockito::ServerGuard) -> ApiClient {
        ApiClient::new(&server.url(), Some(Token::from("t0ken")))
            .unwrap()
            .with_retry_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_resource_urls_use_id_query() {
        let client = ApiClient::new("http://ci.example.com/ui", None).unwrap();
        assert_eq!(
            client.resource_url(Resource::Slave, Some("s1")).unwrap().as_str(),
            "http://ci.example.com/ui/api/slave/?id=s1"
        );
        assert_eq!(
            client
                .action_url(Resource::Repo, "start-build", "r1")
                .unwrap()
                .as_str(),
            "http://ci.example.com/ui/api/repo/start-build?id=r1"
        );
    }

    #[tokio::test]
    async fn test_list_buildsets_accepts_wrapped_items() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/buildset/")
            .match_query(Matcher::UrlEncoded("repo_id".into(), "r1".into()))
            .match_header("authorization", "Bearer t0ken")
            .with_status(200)
            .with_body(
                json!({"items": [{"id": "bs1", "branch": "master", "builds": [
                    {"uuid": "b1", "status": "success", "builder": {"id": "1", "name": "py"}}
                ]}]})
                .to_string(),
            )
            .create_async()
            .await;

        let buildsets = client(&server).list_buildsets("r1").await.unwrap();
        mock.assert_async().await;
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].builds[0].uuid, "b1");
    }

    #[tokio::test]
    async fn test_list_accepts_bare_array() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/slave/")
            .with_status(200)
            .with_body(r#"[{"id": 1}, {"id": 2}]"#)
            .create_async()
            .await;

        let slaves: Vec<Value> = client(&server).list(Resource::Slave, &[]).await.unwrap();
        assert_eq!(slaves.len(), 2);
    }

    #[tokio::test]
    async fn test_start_and_cancel_build() {
        let mut server = mockito::Server::new_async().await;
        let start = server
            .mock("POST", "/api/repo/start-build")
            .match_query(Matcher::UrlEncoded("id".into(), "r1".into()))
            .match_body(Matcher::Json(json!({"branch": "master", "builders_names": ["py"]})))
            .with_status(200)
            .with_body(r#"{"repo-start-build": "builds added"}"#)
            .create_async()
            .await;
        let cancel = server
            .mock("POST", "/api/repo/cancel-build")
            .match_query(Matcher::UrlEncoded("id".into(), "r1".into()))
            .match_body(Matcher::Json(json!({"build_uuid": "b1"})))
            .with_status(200)
            .create_async()
            .await;

        let client = client(&server);
        let request = StartBuild {
            branch: Some("master".to_string()),
            builders_names: vec!["py".to_string()],
            named_tree: None,
        };
        client.start_build("r1", &request).await.unwrap();
        assert_eq!(client.cancel_build("r1", "b1").await.unwrap(), Value::Null);

        start.assert_async().await;
        cancel.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_sends_id_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/api/notification/")
            .match_query(Matcher::UrlEncoded("id".into(), "n1".into()))
            .with_status(200)
            .create_async()
            .await;

        client(&server)
            .delete(Resource::Notification, "n1")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/repo/")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body("no such repo")
            .expect(1)
            .create_async()
            .await;

        let err = client(&server)
            .get::<Value>(Resource::Repo, "missing")
            .await
            .unwrap_err();
        mock.assert_async().await;
        assert!(matches!(err, BuildWatchError::Api { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_reported() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/build/")
            .with_status(503)
            .expect((MAX_RETRIES + 1) as usize)
            .create_async()
            .await;

        let err = client(&server)
            .list::<Value>(Resource::Build, &[])
            .await
            .unwrap_err();
        mock.assert_async().await;
        assert!(matches!(
            err,
            BuildWatchError::ApiAfterRetries { status: 503, retries: MAX_RETRIES }
        ));
    }
}
