pub mod auth;
pub mod billing;
pub mod chat;
mod documents;
pub mod error;
pub mod metrics;
mod notifications;
mod paraphrase;
pub mod rate_limit;
mod reports;
mod search;
mod tasks;
mod teams;
mod tokens;
mod topics;
mod validation;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Auth routes (public, tighter rate limit)
    let auth_routes = Router::new()
        .route("/login", post(auth::login))
        .route("/validate", get(auth::validate))
        .route("/setup-status", get(auth::setup_status))
        .route("/setup", post(auth::setup))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_auth,
        ));

    // SSE routes: each open session holds a connection, so they get their
    // own budget. The limiter is the outer layer so unauthenticated traffic
    // is throttled before any token verification work.
    let stream_routes = Router::new()
        .route("/search/stream", get(search::search_stream))
        .route("/chat/stream", get(chat::chat_stream))
        .route("/paraphrase/stream", get(paraphrase::paraphrase_stream))
        .route("/topics/find/stream", get(topics::topics_find_stream))
        .route("/topics/report/stream", get(reports::topic_report_stream))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_stream,
        ));

    // Protected API routes
    let api_routes = Router::new()
        // Documents
        .route("/documents", get(documents::list_documents))
        .route("/documents", post(documents::create_document))
        .route("/documents/:id", get(documents::get_document))
        .route("/documents/:id", put(documents::update_document))
        .route("/documents/:id", delete(documents::delete_document))
        .route("/documents/:id/summarize", post(documents::summarize_document))
        // Literature search (aggregate)
        .route("/search", get(search::search))
        // Tasks
        .route("/tasks", get(tasks::list_tasks))
        .route("/tasks", post(tasks::create_task))
        .route("/tasks/:id", get(tasks::get_task))
        .route("/tasks/:id", put(tasks::update_task))
        .route("/tasks/:id", delete(tasks::delete_task))
        // Teams
        .route("/teams", get(teams::list_teams))
        .route("/teams", post(teams::create_team))
        .route("/teams/:id", get(teams::get_team))
        .route("/teams/:id", put(teams::update_team))
        .route("/teams/:id", delete(teams::delete_team))
        .route("/teams/:id/members", post(teams::add_member))
        .route("/teams/:id/members/:user_id", put(teams::update_member_role))
        .route("/teams/:id/members/:user_id", delete(teams::remove_member))
        // Notifications
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        // Token ledger
        .route("/tokens", get(tokens::get_balance))
        .route("/tokens/transactions", get(tokens::list_transactions))
        .route("/tokens/refund", post(tokens::refund))
        .route("/usage", get(tokens::usage))
        // Billing
        .route("/billing/checkout", post(billing::create_checkout))
        // Everything above requires a user; rate limiting still comes first
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_api,
        ))
        .merge(stream_routes);

    let webhook_routes = Router::new()
        .route("/stripe", post(billing::stripe_webhook))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_webhook,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .nest("/api/auth", auth_routes)
        .nest("/api", api_routes)
        .nest("/webhooks", webhook_routes)
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::config::Config;

    async fn test_app(api_requests_per_window: u32) -> Router {
        let db = crate::db::init_in_memory().await.unwrap();
        let mut config = Config::default();
        config.rate_limit.api_requests_per_window = api_requests_per_window;
        create_router(Arc::new(AppState::new(config, db)))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = test_app(100).await;
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_require_auth() {
        let app = test_app(100).await;
        let response = app.oneshot(get("/api/tasks")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_limiter_throttles_unauthenticated_requests() {
        let app = test_app(2).await;
        for _ in 0..2 {
            let response = app.clone().oneshot(get("/api/tasks")).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        // The third request is rejected by the limiter, not by auth, because
        // the limiter sits outside the auth layer
        let response = app.oneshot(get("/api/tasks")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
