use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app::Application;
use crate::discovery::{ClusterConfig, ClusterFeature};
use crate::error::Result;

/// Cluster summary returned by listings.
#[derive(Debug, Serialize)]
pub struct ClusterView {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub features: Vec<ClusterFeature>,
    pub nodes: usize,
    pub containers: usize,
}

impl ClusterView {
    fn build(app: &Application, config: ClusterConfig) -> Self {
        let members = app.nodes.list_by_cluster(&config.name);
        let containers = members
            .iter()
            .map(|n| app.containers.list_by_node(&n.name).len())
            .sum();
        Self {
            name: config.name,
            title: config.title,
            description: config.description,
            features: config.features,
            nodes: members.len(),
            containers,
        }
    }
}

/// Body of `PUT /clusters/{name}`; the path segment names the cluster.
#[derive(Debug, Default, Deserialize)]
pub struct ClusterUpsert {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_filter: Option<String>,
    #[serde(default)]
    pub features: Vec<ClusterFeature>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub registries: Vec<String>,
    #[serde(default)]
    pub docker_timeout_s: Option<u64>,
    #[serde(default)]
    pub cache_ttl_s: Option<u64>,
    #[serde(default)]
    pub children: Vec<String>,
}

pub async fn list_clusters(State(app): State<Arc<Application>>) -> Json<Vec<ClusterView>> {
    let views = app
        .discovery
        .list()
        .into_iter()
        .map(|config| ClusterView::build(&app, config))
        .collect();
    Json(views)
}

pub async fn get_cluster(
    State(app): State<Arc<Application>>,
    Path(name): Path<String>,
) -> Result<Json<ClusterView>> {
    let config = app
        .discovery
        .get_cluster(&name)
        .ok_or_else(|| crate::error::ControlError::NotFound(format!("cluster {}", name)))?;
    Ok(Json(ClusterView::build(&app, config)))
}

pub async fn put_cluster(
    State(app): State<Arc<Application>>,
    Path(name): Path<String>,
    Json(body): Json<ClusterUpsert>,
) -> Result<(StatusCode, Json<ClusterConfig>)> {
    let config = ClusterConfig {
        name,
        title: body.title,
        description: body.description,
        image_filter: body.image_filter,
        features: body.features,
        hosts: body.hosts,
        registries: body.registries,
        docker_timeout_s: body.docker_timeout_s,
        cache_ttl_s: body.cache_ttl_s,
        children: body.children,
    };
    let stored = app.discovery.put_cluster(config).await;
    Ok((StatusCode::OK, Json(stored)))
}

pub async fn delete_cluster(
    State(app): State<Arc<Application>>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    app.discovery.delete_cluster(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
