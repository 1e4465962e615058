//! HTTP surface of the service.
//!
//! - `auth` - bearer token extractor
//! - `users` - identity management (/oauth2/users, /oauth2/login, ...)
//! - `health` - liveness check (/healthz)
//! - `openapi` - OpenAPI/Utoipa configuration

pub mod auth;
pub mod health;
pub mod openapi;
pub mod users;

pub use health::MISC_TAG;
pub use users::USERS_TAG;

use crate::AppResources;
use crate::oauth2::{self, OAuth2State};
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

/// Full application router, documentation included.
pub fn app(state: OAuth2State) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .nest(
            "/oauth2",
            oauth2::router(state.clone()).merge(users::router(state)),
        )
        .routes(routes!(health::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    router.merge(Redoc::with_url("/api-docs", api))
}

#[tracing::instrument(skip(resources))]
pub async fn start_webserver(resources: AppResources) -> color_eyre::Result<()> {
    let state = OAuth2State::new(&resources.storage, &resources.config);
    let router = app(state);

    let addr = resources.config.bind_address.as_str();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}
