use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::app::Application;
use crate::error::{ControlError, Result};
use crate::node::NodeRecord;

#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    pub address: String,
}

pub async fn list_nodes(State(app): State<Arc<Application>>) -> Json<Vec<NodeRecord>> {
    Json(app.nodes.list())
}

pub async fn register_node(
    State(app): State<Arc<Application>>,
    Path(name): Path<String>,
    Json(body): Json<RegisterNodeRequest>,
) -> Result<(StatusCode, Json<NodeRecord>)> {
    if body.address.trim().is_empty() {
        return Err(ControlError::Validation("node address must not be empty".into()));
    }
    let record = app.nodes.register(&name, &body.address).await;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn remove_node(
    State(app): State<Arc<Application>>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    app.nodes.remove(&name).await?;
    // Registrations on a removed node are dropped with it.
    app.containers.remove_node(&name).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn attach_node(
    State(app): State<Arc<Application>>,
    Path((cluster, node)): Path<(String, String)>,
) -> Result<Json<NodeRecord>> {
    let record = app.discovery.set_node_cluster(&node, Some(cluster)).await?;
    Ok(Json(record))
}

pub async fn detach_node(
    State(app): State<Arc<Application>>,
    Path((cluster, node)): Path<(String, String)>,
) -> Result<Json<NodeRecord>> {
    let current = app
        .nodes
        .get(&node)
        .ok_or_else(|| ControlError::NotFound(format!("node {}", node)))?;
    if current.cluster.as_deref() != Some(cluster.as_str()) {
        return Err(ControlError::Validation(format!(
            "node {} is not attached to cluster {}",
            node, cluster
        )));
    }
    let record = app.discovery.set_node_cluster(&node, None).await?;
    Ok(Json(record))
}
