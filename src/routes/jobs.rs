use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::app::Application;
use crate::error::{ControlError, Result};
use crate::jobs::{JobParameters, JobRecord};

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub parameters: JobParameters,
}

pub async fn list_jobs(State(app): State<Arc<Application>>) -> Json<Vec<JobRecord>> {
    Json(app.jobs.list())
}

/// Create and start a job in one request.
pub async fn create_job(
    State(app): State<Arc<Application>>,
    Json(body): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobRecord>)> {
    let instance = app.jobs.submit(&body.type_name, body.parameters).await?;
    Ok((StatusCode::CREATED, Json(instance.record())))
}

pub async fn get_job(
    State(app): State<Arc<Application>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>> {
    let instance = app
        .jobs
        .get(&id)
        .ok_or_else(|| ControlError::NotFound(format!("job {}", id)))?;
    Ok(Json(instance.record()))
}

/// DELETE cancels; the instance stays queryable in its terminal state.
pub async fn cancel_job(
    State(app): State<Arc<Application>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    app.jobs.cancel(&id).await?;
    Ok(StatusCode::ACCEPTED)
}
