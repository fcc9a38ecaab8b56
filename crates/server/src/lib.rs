//! Shopgate server library.
//!
//! Provides a reusable server function to serve the admission gateway
//! either for the binary, or for integration tests. The application
//! routes being protected are handed in by the caller; the retail
//! backend itself is an external collaborator.

#![deny(missing_docs)]

mod client_identity;
mod health;
mod rate_limit;
mod stats;

use std::net::SocketAddr;
use std::sync::Arc;

use ::rate_limit::RateLimiterService;
use anyhow::anyhow;
use axum::{Router, routing::get};
pub use client_identity::ClientIdentityLayer;
use config::Config;
pub use self::rate_limit::{RateLimitLayer, RejectionHandler};
use tokio::net::TcpListener;

/// Configuration for serving Shopgate.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to
    pub listen_address: SocketAddr,
    /// The deserialized Shopgate TOML configuration.
    pub config: Config,
}

/// Starts and runs the admission gateway in front of the provided
/// application router.
pub async fn serve(ServeConfig { listen_address, config }: ServeConfig, app: Router) -> anyhow::Result<()> {
    let router = build_router(&config, app).await?;

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    log::info!("Admission gateway listening on http://{listen_address}");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| anyhow!("Failed to start HTTP server: {e}"))?;

    Ok(())
}

/// Builds the full router: the application routes behind the identity
/// and admission layers, plus the operational endpoints.
pub async fn build_router(config: &Config, app: Router) -> anyhow::Result<Router> {
    let service = Arc::new(RateLimiterService::new(&config.server.rate_limits).await?);

    let mut protected = app;

    if config.server.rate_limits.enabled {
        protected = protected.layer(RateLimitLayer::new(service.clone()));
    } else {
        log::warn!("Request admission is disabled - every request is forwarded unchecked");
    }

    // The identity layer wraps the admission layer so extracted
    // identities are visible to it.
    if config.server.client_identity.enabled {
        protected = protected.layer(ClientIdentityLayer::new(config.server.client_identity.clone()));
    }

    let mut router = Router::new().merge(protected);

    // Operational endpoints are mounted outside the admission layer so
    // they are never rate limited themselves.
    if config.server.stats.enabled {
        router = router.merge(stats::router(&config.server.stats, service));
    }

    if config.server.health.enabled {
        router = router.route(&config.server.health.path, get(health::health));
    }

    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::{Request, StatusCode};
    use tower::util::ServiceExt;

    fn test_config() -> Config {
        toml::from_str("").unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_answers() {
        let router = build_router(&test_config(), Router::new()).await.unwrap();

        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stats_endpoint_answers() {
        let router = build_router(&test_config(), Router::new()).await.unwrap();

        let response = router
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
