//! HTTP query API.
//!
//! Every query route is answered from the shared state containers through
//! [`QueryContext::dispatch`]. `/metrics` and `/healthz` are served
//! regardless of readiness.

mod dispatch;
mod filter;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::metrics::MonitorMetrics;
use crate::state::Counter;

pub use dispatch::{QueryContext, QueryError};
pub use filter::{Filter, FilterError, QueryKind};

/// Serves the query API, `/metrics` and `/healthz`.
pub struct ApiServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

/// Shared state for axum handlers.
struct AppState {
    ctx: QueryContext,
    metrics: Arc<MonitorMetrics>,
    errors: Counter,
}

impl ApiServer {
    pub fn new(addr: SocketAddr, ctx: QueryContext, errors: Counter) -> Self {
        let metrics = Arc::clone(&ctx.metrics);
        Self {
            addr,
            state: Arc::new(AppState {
                ctx,
                metrics,
                errors,
            }),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Bind the listener and serve in the background. Returns the bound
    /// address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let app = router(Arc::clone(&self.state));

        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "query API server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "query API server error");
            }
        });

        Ok(local_addr)
    }

    /// Stops the server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler));

    for kind in QueryKind::ALL {
        app = app.route(
            kind.path(),
            get(
                move |State(state): State<Arc<AppState>>,
                      Query(params): Query<Vec<(String, String)>>| async move {
                    query_handler(&state, kind, &params)
                },
            ),
        );
    }

    app.with_state(state)
}

fn query_handler(state: &AppState, kind: QueryKind, params: &[(String, String)]) -> Response {
    let result = Filter::parse(kind, params)
        .map_err(QueryError::from)
        .and_then(|filter| state.ctx.dispatch(kind, &filter));

    let (status, response) = match result {
        Ok(body) => (StatusCode::OK, Json(body).into_response()),
        Err(e) => {
            state.errors.inc();
            let status = e.status();
            tracing::debug!(
                path = kind.path(),
                status = status.as_u16(),
                error = %e,
                "query failed",
            );
            (status, (status, e.to_string()).into_response())
        }
    };

    state
        .metrics
        .query_requests
        .with_label_values(&[kind.path(), status.as_str()])
        .inc();

    response
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
