use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;
use tradutor::{queue::Broker, store::JobStore};

use crate::{
    handlers::{health_handler, submit_translation_handler, translation_status_handler},
    state::AppState,
};

pub fn create_router<S, B>(state: AppState<S, B>) -> Router
where
    S: JobStore,
    B: Broker,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(health_handler::<S, B>))
        .route("/translations", post(submit_translation_handler::<S, B>))
        .route(
            "/translations/{request_id}",
            get(translation_status_handler::<S, B>),
        )
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}
