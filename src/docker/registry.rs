//! Image-registry client (Registry HTTP API v2)
//!
//! Used by the tag reconciler to list a repository's tags and resolve a
//! tag's manifest digest. Only basic auth is supported; token flows are a
//! deployment concern handled by a fronting proxy.

use std::time::Duration;

use base64::Engine;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::config::RegistryConfiguration;

use super::result::{CallError, CallResult};

const REGISTRY_TIMEOUT: Duration = Duration::from_secs(30);

const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

pub struct RegistryClient {
    base_url: String,
    client: Client,
    authorization: Option<String>,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfiguration) -> CallResult<Self> {
        let client = Client::builder()
            .timeout(REGISTRY_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CallError::error(format!("registry client init: {}", e)))?;

        let authorization = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => {
                let token = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", user, pass));
                Some(format!("Basic {}", token))
            }
            _ => None,
        };

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            authorization,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(auth) = &self.authorization {
            request = request.header("Authorization", auth.clone());
        }
        request
    }

    /// All tags of a repository. `Ok(None)` when the registry does not know
    /// the repository; the reconciler skips those without failing a cycle.
    pub async fn list_tags(&self, repository: &str) -> CallResult<Option<Vec<String>>> {
        let path = format!("/v2/{}/tags/list", repository);
        let response = self
            .request(Method::GET, &path)
            .send()
            .await
            .map_err(|e| CallError::error(format!("registry {}: {}", path, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response
            .text()
            .await
            .map_err(|e| CallError::error(format!("registry {}: {}", path, e)))?;
        if !status.is_success() {
            return Err(CallError::from_status(status, &text));
        }

        let list: TagList = serde_json::from_str(&text)
            .map_err(|e| CallError::error(format!("registry {}: decode failed: {}", path, e)))?;
        Ok(Some(list.tags.unwrap_or_default()))
    }

    /// Resolve a tag to its manifest digest via the Docker-Content-Digest
    /// header. `Ok(None)` for unknown repository or tag.
    pub async fn manifest_digest(
        &self,
        repository: &str,
        tag: &str,
    ) -> CallResult<Option<String>> {
        let path = format!("/v2/{}/manifests/{}", repository, tag);
        let response = self
            .request(Method::HEAD, &path)
            .header("Accept", MANIFEST_V2)
            .send()
            .await
            .map_err(|e| CallError::error(format!("registry {}: {}", path, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CallError::from_status(status, ""));
        }

        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        if digest.is_none() {
            debug!("registry {}: no content digest header", path);
        }
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;

    async fn spawn_registry(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(url: String) -> RegistryConfiguration {
        RegistryConfiguration {
            url,
            username: None,
            password: None,
        }
    }

    #[tokio::test]
    async fn test_list_tags() {
        let router = Router::new().route(
            "/v2/library/nginx/tags/list",
            get(|| async { r#"{"name":"library/nginx","tags":["1.0","1.1","latest"]}"# }),
        );
        let url = spawn_registry(router).await;
        let client = RegistryClient::new(&config(url)).unwrap();

        let tags = client.list_tags("library/nginx").await.unwrap().unwrap();
        assert_eq!(tags, vec!["1.0", "1.1", "latest"]);
    }

    #[tokio::test]
    async fn test_unknown_repository_is_none() {
        let url = spawn_registry(Router::new()).await;
        let client = RegistryClient::new(&config(url)).unwrap();

        assert!(client.list_tags("nope/nope").await.unwrap().is_none());
        assert!(client
            .manifest_digest("nope/nope", "latest")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_manifest_digest_header() {
        let router = Router::new().route(
            "/v2/library/nginx/manifests/latest",
            get(|| async {
                (
                    [(
                        "Docker-Content-Digest",
                        "sha256:4355a46b19d348dc2f57c046f8ef63d4538ebb936000f3c9ee954a27460dd865",
                    )],
                    "",
                )
            }),
        );
        let url = spawn_registry(router).await;
        let client = RegistryClient::new(&config(url)).unwrap();

        let digest = client
            .manifest_digest("library/nginx", "latest")
            .await
            .unwrap()
            .unwrap();
        assert!(digest.starts_with("sha256:"));
    }

    #[test]
    fn test_basic_auth_header() {
        let client = RegistryClient::new(&RegistryConfiguration {
            url: "https://registry.example.com/".into(),
            username: Some("ci".into()),
            password: Some("secret".into()),
        })
        .unwrap();
        assert_eq!(client.base_url(), "https://registry.example.com");
        assert_eq!(
            client.authorization.as_deref(),
            Some("Basic Y2k6c2VjcmV0")
        );
    }
}
