//! Demo HTTP server that keeps its request loop free by pushing heavy work
//! into forked workers.
//!
//! Endpoints:
//! - ANY /compute - Fork a compute worker, wait for its sum, reply `Sum is <n>`
//! - ANY * - `Ok`

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{ErrorKind, ProcessError};
use crate::process::{ProcessRunner, ProcessSpec};
use crate::worker::compute::ComputeRequest;
use crate::worker::Worker;

/// Shared server state.
#[derive(Debug)]
pub struct ServerState {
    pub runner: ProcessRunner,
    /// What `/compute` forks for each request.
    pub worker: ProcessSpec,
    pub config: ServerConfig,
}

// === Server Lifecycle ===

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/compute", any(compute_handler))
        .fallback(index_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server on `127.0.0.1:<port>` and run until it fails.
pub async fn start_server(
    config: ServerConfig,
    runner: ProcessRunner,
    worker: ProcessSpec,
    open_browser: bool,
) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(
        %addr,
        worker = %worker.display_name(),
        timeout = ?config.worker_timeout,
        "brood server listening"
    );

    if open_browser {
        if let Err(e) = open::that(format!("http://{addr}/compute")) {
            warn!(error = %e, "failed to open browser");
        }
    }

    let state = Arc::new(ServerState {
        runner,
        worker,
        config,
    });
    serve(listener, state).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, state: Arc<ServerState>) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("Server error")
}

// === Handlers ===

async fn index_handler() -> &'static str {
    "Ok"
}

async fn compute_handler(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
) -> Result<String, AppError> {
    let request_id = Uuid::now_v7();
    let span = info_span!("compute", %request_id);
    compute(&state, &method, &uri).instrument(span).await
}

async fn compute(state: &ServerState, method: &Method, uri: &Uri) -> Result<String, AppError> {
    info!(%method, %uri, "compute requested");

    let mut worker = Worker::fork(&state.runner, &state.worker)?;
    debug!("sending start to worker");

    let reply = worker
        .request::<_, u64>(
            &ComputeRequest::start(state.config.compute_upto),
            state.config.worker_timeout,
        )
        .await;

    match reply {
        Ok(sum) => {
            info!(sum, "worker replied");
            tokio::spawn(
                async move {
                    let exit = worker.shutdown().await;
                    debug!(%exit, "worker finished");
                }
                .in_current_span(),
            );
            Ok(format!("Sum is {sum}"))
        }
        Err(e) => {
            warn!(error = %e, "compute failed");
            if let Err(term) = worker.terminate() {
                debug!(error = %term, "worker already gone");
            }
            Err(e.into())
        }
    }
}

// === Errors ===

/// Handler error mapped onto an HTTP status.
#[derive(Debug)]
pub struct AppError(ProcessError);

impl From<ProcessError> for AppError {
    fn from(err: ProcessError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::WorkerTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn spawn_server(worker: ProcessSpec, timeout: Option<Duration>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            runner: ProcessRunner::default(),
            worker: worker.piped(),
            config: ServerConfig {
                port: addr.port(),
                worker_timeout: timeout,
                compute_upto: 10,
            },
        });
        tokio::spawn(serve(listener, state));
        format!("http://{addr}")
    }

    fn echo_sum() -> ProcessSpec {
        ProcessSpec::shell("read line; echo 499999999500000000")
    }

    #[tokio::test]
    async fn other_paths_answer_ok() {
        let base = spawn_server(echo_sum(), None).await;
        let client = reqwest::Client::new();

        let res = client.get(format!("{base}/")).send().await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.unwrap(), "Ok");

        let res = client.post(format!("{base}/anything")).send().await.unwrap();
        assert_eq!(res.text().await.unwrap(), "Ok");
    }

    #[tokio::test]
    async fn compute_returns_worker_sum() {
        let base = spawn_server(echo_sum(), Some(Duration::from_secs(10))).await;

        let res = reqwest::get(format!("{base}/compute")).await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.unwrap(), "Sum is 499999999500000000");
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let base = spawn_server(
            ProcessSpec::shell("read line; sleep 30"),
            Some(Duration::from_millis(200)),
        )
        .await;

        let res = reqwest::get(format!("{base}/compute")).await.unwrap();
        assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT.as_u16());
    }

    #[tokio::test]
    async fn missing_worker_binary_is_500() {
        let base = spawn_server(ProcessSpec::new("/no/such/worker"), None).await;

        let res = reqwest::get(format!("{base}/compute")).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR.as_u16());
    }

    #[tokio::test]
    async fn requests_are_served_while_compute_runs() {
        let base = spawn_server(
            ProcessSpec::shell("read line; sleep 1; echo 1"),
            Some(Duration::from_secs(10)),
        )
        .await;

        let slow = tokio::spawn(reqwest::get(format!("{base}/compute")));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let res = reqwest::get(format!("{base}/")).await.unwrap();
        assert_eq!(res.text().await.unwrap(), "Ok");
        assert!(started.elapsed() < Duration::from_millis(900));

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.text().await.unwrap(), "Sum is 1");
    }
}
