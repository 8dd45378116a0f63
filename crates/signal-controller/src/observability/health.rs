//! Liveness and readiness probes.
//!
//! - `GET /health`: 200 while the process is up
//! - `GET /ready`: 200 once the node is registered and serving peers, 503
//!   before that and again while shutting down
//!
//! `/metrics` is merged in by the binary from the Prometheus handle.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Live, not yet ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Stop advertising readiness, e.g. while draining on shutdown.
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(probe_live))
        .route("/ready", get(probe_ready))
        .with_state(health_state)
}

async fn probe_live(State(state): State<Arc<HealthState>>) -> StatusCode {
    status(state.is_live())
}

async fn probe_ready(State(state): State<Arc<HealthState>>) -> StatusCode {
    status(state.is_ready())
}

fn status(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn probe(app: Router, path: &str) -> StatusCode {
        let request = Request::get(path).body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[test]
    fn test_ready_flag_toggles() {
        let state = HealthState::new();
        assert!(state.is_live());
        assert!(!state.is_ready());

        state.set_ready();
        assert!(state.is_ready());

        state.set_not_ready();
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_health_is_ok_while_running() {
        let app = health_router(Arc::new(HealthState::new()));
        assert_eq!(probe(app, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_waits_for_registration() {
        let state = Arc::new(HealthState::new());
        assert_eq!(
            probe(health_router(Arc::clone(&state)), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.set_ready();
        assert_eq!(
            probe(health_router(state), "/ready").await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_other_paths_are_not_routed() {
        let app = health_router(Arc::new(HealthState::new()));
        assert_eq!(probe(app, "/metrics").await, StatusCode::NOT_FOUND);
    }
}
