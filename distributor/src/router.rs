use std::future::ready;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::distributor::Distributor;
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::push;

#[derive(Clone)]
pub struct AppState {
    pub distributor: Arc<Distributor>,
}

async fn index() -> &'static str {
    "distributor"
}

async fn readiness() -> &'static str {
    "ready"
}

/// The HTTP surface: the push route, readiness, and optionally the
/// prometheus scrape endpoint. `metrics` installs the global recorder, so
/// only one router per process may enable it.
pub fn router(distributor: Arc<Distributor>, metrics: bool) -> Router {
    let state = AppState { distributor };

    let router = Router::new()
        .route("/", get(index))
        .route("/ready", get(readiness))
        .route("/api/v1/push", post(push::push))
        .layer(TraceLayer::new_for_http());

    let router = if metrics {
        let recorder_handle = setup_metrics_recorder();
        router
            .route("/metrics", get(move || ready(recorder_handle.render())))
            .layer(axum::middleware::from_fn(track_metrics))
    } else {
        router
    };

    router.with_state(state)
}
