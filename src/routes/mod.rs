//! Operator REST surface
//!
//! Thin axum handlers over the application services. Authentication and
//! ACL projection are a fronting proxy's concern; this surface speaks the
//! documented error taxonomy in structured JSON bodies.

pub mod clusters;
pub mod containers;
pub mod jobs;
pub mod nodes;
pub mod source;

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::app::Application;

pub fn router(app: Arc<Application>) -> Router {
    Router::new()
        .route("/clusters", get(clusters::list_clusters))
        .route(
            "/clusters/:name",
            put(clusters::put_cluster)
                .get(clusters::get_cluster)
                .delete(clusters::delete_cluster),
        )
        .route(
            "/clusters/:name/nodes/:node",
            post(nodes::attach_node).delete(nodes::detach_node),
        )
        .route("/clusters/:name/containers", get(containers::list_cluster_containers))
        .route(
            "/clusters/:name/source",
            get(source::get_cluster_source).post(source::set_cluster_source),
        )
        .route("/nodes", get(nodes::list_nodes))
        .route("/nodes/:name", post(nodes::register_node).delete(nodes::remove_node))
        .route("/source", get(source::get_root_source).post(source::set_root_source))
        .route("/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route("/jobs/:id", get(jobs::get_job).delete(jobs::cancel_job))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}
