//! Caller identity extraction for admission keys and quota scaling.
//!
//! Shopgate does not authenticate anyone itself; it trusts the identity
//! headers the upstream auth proxy injects. A request without them is
//! simply anonymous and gets keyed by its network address downstream.

use std::{
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::body::Body;
use config::{ClientIdentity, ClientIdentityConfig};
use http::{HeaderMap, Request, Response};
use tower::Layer;

/// Extract the caller's identity from configured headers.
pub(crate) fn extract_identity(headers: &HeaderMap, config: &ClientIdentityConfig) -> Option<ClientIdentity> {
    let client_id = headers
        .get(&config.client_id_header)?
        .to_str()
        .ok()?
        .trim()
        .to_string();

    if client_id.is_empty() {
        return None;
    }

    let role = headers
        .get(&config.role_header)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    Some(ClientIdentity { client_id, role })
}

/// Layer storing the extracted [`ClientIdentity`] in request extensions.
#[derive(Clone)]
pub struct ClientIdentityLayer(Arc<ClientIdentityConfig>);

impl ClientIdentityLayer {
    /// Create the layer from configuration.
    pub fn new(config: ClientIdentityConfig) -> Self {
        Self(Arc::new(config))
    }
}

impl<Service> Layer<Service> for ClientIdentityLayer
where
    Service: Send + Clone,
{
    type Service = ClientIdentityService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        ClientIdentityService {
            next,
            config: self.0.clone(),
        }
    }
}

/// Service produced by [`ClientIdentityLayer`].
#[derive(Clone)]
pub struct ClientIdentityService<Service> {
    next: Service,
    config: Arc<ClientIdentityConfig>,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for ClientIdentityService<Service>
where
    Service: tower::Service<Request<ReqBody>, Response = Response<Body>> + Send + Clone + 'static,
    Service::Future: Send,
    Service::Error: Display + 'static,
    ReqBody: http_body::Body + Send + 'static,
{
    type Response = Response<Body>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let mut next = self.next.clone();
        let config = self.config.clone();

        Box::pin(async move {
            match extract_identity(req.headers(), &config) {
                Some(identity) => {
                    log::debug!("Identified caller {} with role {:?}", identity.client_id, identity.role);

                    let (mut parts, body) = req.into_parts();
                    parts.extensions.insert(identity);

                    next.call(Request::from_parts(parts, body)).await
                }
                None => next.call(req).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientIdentityConfig {
        ClientIdentityConfig {
            enabled: true,
            ..Default::default()
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in pairs {
            headers.insert(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }

        headers
    }

    #[test]
    fn extracts_id_and_role() {
        let identity = extract_identity(
            &headers(&[("X-Client-Id", "user-42"), ("X-Client-Role", "admin")]),
            &config(),
        )
        .unwrap();

        assert_eq!(identity.client_id, "user-42");
        assert_eq!(identity.role.as_deref(), Some("admin"));
    }

    #[test]
    fn role_is_optional() {
        let identity = extract_identity(&headers(&[("X-Client-Id", "user-42")]), &config()).unwrap();

        assert_eq!(identity.client_id, "user-42");
        assert_eq!(identity.role, None);
    }

    #[test]
    fn missing_id_header_means_anonymous() {
        assert_eq!(extract_identity(&headers(&[("X-Client-Role", "admin")]), &config()), None);
    }

    #[test]
    fn blank_id_header_means_anonymous() {
        assert_eq!(extract_identity(&headers(&[("X-Client-Id", "  ")]), &config()), None);
    }

    #[test]
    fn custom_header_names_are_honored() {
        let config = ClientIdentityConfig {
            enabled: true,
            client_id_header: "X-User".to_string(),
            role_header: "X-Tier".to_string(),
        };

        let identity = extract_identity(&headers(&[("X-User", "u1"), ("X-Tier", "staff")]), &config).unwrap();

        assert_eq!(identity.client_id, "u1");
        assert_eq!(identity.role.as_deref(), Some("staff"));
    }
}
