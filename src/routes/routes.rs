//! Defines routes for the image storage service.
//!
//! ## Structure
//! - **Image endpoints** (behind the identity gate)
//!   - `POST /image`                       — upload a base64-encoded image
//!   - `GET  /image/{project}/{key}`       — fetch, optionally resized via ?width=&height=
//!   - `GET  /images`                      — paged listing of stored originals
//!
//! - **Probes** (auth-exempt)
//!   - `GET /healthz` — liveness
//!   - `GET /readyz`  — DB + object storage readiness

use crate::{
    AppState,
    config::AppConfig,
    handlers::{
        health_handlers::{healthz, readyz},
        image_handlers::{get_image, list_images, upload_image},
    },
    middleware::auth::require_auth,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method, header},
    middleware,
    routing::{get, post},
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// Build and return the router for all endpoints.
///
/// Health probes stay outside the identity gate; everything image-shaped is
/// wrapped in the auth middleware. The body limit leaves headroom for base64
/// inflation (~4/3) over the decoded upload ceiling.
pub fn routes(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.config.max_upload_bytes * 2);

    let image_routes = Router::new()
        .route("/image", post(upload_image))
        .route("/image/{project}/{key}", get(get_image))
        .route("/images", get(list_images))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(body_limit);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(image_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config))
        .with_state(state)
}

/// CORS policy from configuration.
///
/// With explicit origins we allow credentials (the identity cookie); with no
/// origins configured the layer is wide open but credential-less, which is
/// what local development wants.
fn cors_layer(cfg: &AppConfig) -> CorsLayer {
    if cfg.allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = cfg
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "skipping invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("cf-access-jwt-assertion"),
        ])
        .allow_credentials(true)
}
