use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;

use crate::app::Application;
use crate::error::Result;
use crate::source::{ClusterSource, RootSource, SourceApplyReport};

pub async fn get_root_source(State(app): State<Arc<Application>>) -> Json<RootSource> {
    Json(app.source.get_root_source())
}

pub async fn set_root_source(
    State(app): State<Arc<Application>>,
    Json(source): Json<RootSource>,
) -> Result<Json<SourceApplyReport>> {
    let report = app.source.set_root_source(&source).await?;
    Ok(Json(report))
}

pub async fn get_cluster_source(
    State(app): State<Arc<Application>>,
    Path(name): Path<String>,
) -> Result<Json<ClusterSource>> {
    Ok(Json(app.source.get_cluster_source(&name)?))
}

pub async fn set_cluster_source(
    State(app): State<Arc<Application>>,
    Path(name): Path<String>,
    Json(mut source): Json<ClusterSource>,
) -> Result<Json<SourceApplyReport>> {
    // The path segment is authoritative for the cluster name.
    source.config.name = name;
    let report = app.source.set_cluster_source(&source).await?;
    Ok(Json(report))
}
