//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{any, delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::PanelError;
use crate::server::handlers::{
    deploy::{deploy_template_handler, redeploy_handler, remove_project_handler},
    events::list_events_handler,
    health_handler,
    jobs::{get_job_handler, job_events_handler, list_jobs_handler},
    ports::{
        allocate_handler, get_range_handler, query_ports_handler, set_note_handler,
        set_range_handler,
    },
    version_handler,
    volumes::{
        close_handler, heartbeat_handler, proxy_handler, proxy_root_handler,
        start_session_handler,
    },
};
use crate::server::state::ServerState;

/// Build the panel router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Jobs
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/{id}", get(get_job_handler))
        .route("/api/jobs/{id}/events", get(job_events_handler))
        // Deployments
        .route("/api/templates/{id}/deploy", post(deploy_template_handler))
        .route("/api/projects/{name}/redeploy", post(redeploy_handler))
        .route("/api/projects/{name}", delete(remove_project_handler))
        // Ports
        .route("/api/ports", get(query_ports_handler))
        .route("/api/ports/range", get(get_range_handler).post(set_range_handler))
        .route("/api/ports/note", post(set_note_handler))
        .route("/api/ports/allocate", post(allocate_handler))
        // Volume browsing
        .route("/api/volumes/{name}/browse", post(start_session_handler))
        .route("/api/volumes/browse/{sid}/heartbeat", post(heartbeat_handler))
        .route("/api/volumes/browse/{sid}/close", post(close_handler))
        .route("/api/volumes/browse/{sid}/fb", any(proxy_root_handler))
        .route("/api/volumes/browse/{sid}/fb/", any(proxy_root_handler))
        .route("/api/volumes/browse/{sid}/fb/{*path}", any(proxy_handler))
        // Runtime events
        .route("/api/events", get(list_events_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), PanelError>>, PanelError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| PanelError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| PanelError::ServerError(e.to_string()))
    });

    Ok(handle)
}
