// HTTP surface: OAuth endpoints for both hops plus bearer-protected resources

pub mod error;
pub mod oauth;
pub mod resources;

use crate::bridge::OAuthBridge;
use crate::rate_limit::{self, RateLimiter};
use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<OAuthBridge>,
}

/// Create the full router: auth surface, resource surface, CORS.
pub fn create_router(state: AppState) -> Router {
    let config = state.bridge.config();
    let limits = &config.settings.rate_limit;

    let mut auth_routes = Router::new()
        .route("/auth/provider/start", get(oauth::provider_start))
        .route("/auth/provider/callback", get(oauth::provider_callback))
        .route("/oauth/authorize", get(oauth::authorize))
        .route("/oauth/token", post(oauth::token));

    let mut api_routes = Router::new()
        .route("/api/provider/user", get(resources::user))
        .route("/api/provider/items", get(resources::items))
        .route("/api/connector/revoke", post(resources::revoke))
        .route("/api/connector/status", get(resources::status));

    if limits.enabled {
        let window = Duration::from_secs(limits.window_seconds);
        let auth_limiter = Arc::new(RateLimiter::new("auth", limits.auth_limit, window));
        let api_limiter = Arc::new(RateLimiter::new("api", limits.api_limit, window));
        auth_routes = auth_routes.route_layer(middleware::from_fn_with_state(
            auth_limiter,
            rate_limit::enforce,
        ));
        api_routes = api_routes.route_layer(middleware::from_fn_with_state(
            api_limiter,
            rate_limit::enforce,
        ));
    }

    let cors = cors_layer(&config.cors_origins);
    let router = auth_routes.merge(api_routes).with_state(state);

    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

/// Exact-origin allow-list; `None` when no origin is configured.
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring unparsable CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
    )
}
