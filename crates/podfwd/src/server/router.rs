//! Axum router construction.

use axum::{
    routing::{delete, get},
    Router,
};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};

use super::{events, handlers, middleware, state::AppState};

/// Build the application [`Router`] with all routes and middleware attached.
///
/// The event stream is long-lived, so it is merged in after the timeout layer.
pub fn build(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/forwards",
            get(handlers::list_forwards).post(handlers::create_forward),
        )
        .route("/api/forwards/:id", delete(handlers::delete_forward))
        .route("/api/namespaces", get(handlers::list_namespaces))
        .route("/api/resources", get(handlers::list_resources))
        .route("/health", get(handlers::health))
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT));

    let streams = Router::new().route("/api/forwards/events", get(events::stream_events));

    api.merge(streams)
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = build(AppState::default());
        let req = Request::builder()
            .uri("/unknown")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn health_route_exists() {
        let app = build(AppState::default());
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn events_route_is_not_shadowed_by_id_route() {
        let state = AppState::default();
        state.shutdown.cancel();
        let app = build(state);
        let req = Request::builder()
            .uri("/api/forwards/events")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
    }

    #[tokio::test]
    async fn delete_unknown_forward_returns_404() {
        let app = build(AppState::default());
        let req = Request::builder()
            .method("DELETE")
            .uri("/api/forwards/does-not-exist")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 404);
    }
}
