use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;

use crate::app::Application;
use crate::containers::ContainerRegistration;
use crate::error::{ControlError, Result};

pub async fn list_cluster_containers(
    State(app): State<Arc<Application>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<ContainerRegistration>>> {
    if app.discovery.get_cluster(&name).is_none() {
        return Err(ControlError::NotFound(format!("cluster {}", name)));
    }
    let mut all: Vec<ContainerRegistration> = app
        .nodes
        .list_by_cluster(&name)
        .into_iter()
        .flat_map(|node| app.containers.list_by_node(&node.name))
        .collect();
    all.sort_by(|a, b| a.fleet_name().cmp(&b.fleet_name()));
    Ok(Json(all))
}
