//! Request admission middleware: the dispatcher in front of the retail
//! API.
//!
//! Per request it resolves the applicable rule from the path, applies
//! the caller's role multiplier, derives the counting key, asks the
//! counter engine for a decision and either forwards the request with
//! quota headers attached or answers 429. Every decision is recorded in
//! the statistics monitor together with the admission latency.

use std::{
    fmt::Display,
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use ::rate_limit::{AdmissionDecision, RateLimitRule, RateLimiterService};
use axum::{body::Body, extract::ConnectInfo};
use config::{ClientIdentity, KeyStrategy};
use http::{
    HeaderMap, HeaderValue, Request, Response, StatusCode,
    header::{CONTENT_TYPE, RETRY_AFTER},
};
use tower::Layer;

/// Hook invoked instead of the default 429 response when a request is
/// rejected, for endpoints that need a custom rejection shape.
pub type RejectionHandler = Arc<dyn Fn(&RateLimitRule, &AdmissionDecision) -> Response<Body> + Send + Sync>;

/// Layer applying the admission dispatcher to the wrapped routes.
#[derive(Clone)]
pub struct RateLimitLayer {
    service: Arc<RateLimiterService>,
    on_limit_reached: Option<RejectionHandler>,
}

impl RateLimitLayer {
    /// Create the layer around a limiter service.
    pub fn new(service: Arc<RateLimiterService>) -> Self {
        Self {
            service,
            on_limit_reached: None,
        }
    }

    /// Replaces the default 429 response with a custom handler.
    pub fn on_limit_reached(mut self, handler: RejectionHandler) -> Self {
        self.on_limit_reached = Some(handler);
        self
    }
}

impl<Service> Layer<Service> for RateLimitLayer
where
    Service: Send + Clone,
{
    type Service = RateLimitService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        RateLimitService {
            next,
            service: self.service.clone(),
            on_limit_reached: self.on_limit_reached.clone(),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<Service> {
    next: Service,
    service: Arc<RateLimiterService>,
    on_limit_reached: Option<RejectionHandler>,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for RateLimitService<Service>
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
        let service = self.service.clone();
        let on_limit_reached = self.on_limit_reached.clone();

        Box::pin(async move {
            let started = Instant::now();
            let path = req.uri().path().to_string();

            // Identity is set by the identity layer when the upstream
            // auth proxy vouched for the caller.
            let identity = req.extensions().get::<ClientIdentity>().cloned();
            let address = extract_client_ip(&req);

            let registry = service.registry();
            let rule_name = registry.resolve(&path).to_string();
            let role = identity.as_ref().and_then(|identity| identity.role.as_deref());
            let rule = registry.rule_for_role(&rule_name, role);

            let Some(key) = counting_key(&rule, identity.as_ref(), address) else {
                // Without a key there is no bucket to count against.
                log::debug!("No counting key for {path}, request admitted without rate limiting");
                return next.call(req).await;
            };

            let decision = service.admit(&key, &rule).await;

            let caller = caller_label(identity.as_ref(), address);
            let latency_ms = started.elapsed().as_millis() as u64;
            service.monitor().record_request(&path, &caller, latency_ms, !decision.allowed);

            if decision.allowed {
                let mut response = next.call(req).await?;
                apply_headers(response.headers_mut(), &rule, &decision);
                return Ok(response);
            }

            log::debug!(
                "Request to {path} rejected for key '{key}': quota of {} per {:?} exhausted",
                decision.limit,
                rule.window
            );

            if let Some(handler) = on_limit_reached {
                return Ok(handler(&rule, &decision));
            }

            Ok(too_many_requests(&rule, &decision))
        })
    }
}

/// Derive the quota bucket key for a request.
///
/// Identity-derived and address-derived keys live in distinct scopes,
/// so a caller switching identity mid-session never lands back in a
/// fresh bucket it controls.
fn counting_key(
    rule: &RateLimitRule,
    identity: Option<&ClientIdentity>,
    address: Option<IpAddr>,
) -> Option<String> {
    let key = match rule.key_strategy {
        KeyStrategy::Global => format!("rule:{}", rule.name),
        KeyStrategy::Address => format!("ip:{}", address?),
        KeyStrategy::Caller => match identity {
            Some(identity) if !identity.client_id.is_empty() => format!("client:{}", identity.client_id),
            _ => format!("ip:{}", address?),
        },
    };

    Some(key)
}

fn caller_label(identity: Option<&ClientIdentity>, address: Option<IpAddr>) -> String {
    match identity {
        Some(identity) if !identity.client_id.is_empty() => format!("client:{}", identity.client_id),
        _ => match address {
            Some(address) => format!("ip:{address}"),
            None => "unknown".to_string(),
        },
    }
}

/// Attach quota headers according to the rule's header policy.
fn apply_headers(headers: &mut HeaderMap, rule: &RateLimitRule, decision: &AdmissionDecision) {
    if rule.standard_headers {
        headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));

        if let Some(reset) = iso_reset(decision.reset_at_ms)
            && let Ok(value) = HeaderValue::from_str(&reset)
        {
            headers.insert("X-RateLimit-Reset", value);
        }
    }

    if rule.legacy_headers {
        headers.insert("X-Rate-Limit-Limit", HeaderValue::from(decision.limit));
        headers.insert("X-Rate-Limit-Remaining", HeaderValue::from(decision.remaining));
        headers.insert("X-Rate-Limit-Reset", HeaderValue::from(decision.reset_at_ms / 1_000));
    }
}

/// Window end as an ISO-8601 timestamp.
fn iso_reset(reset_at_ms: u64) -> Option<String> {
    jiff::Timestamp::from_millisecond(reset_at_ms as i64)
        .ok()
        .map(|timestamp| timestamp.to_string())
}

fn too_many_requests(rule: &RateLimitRule, decision: &AdmissionDecision) -> Response<Body> {
    let message = rule
        .message
        .clone()
        .unwrap_or_else(|| "Too many requests, please try again later.".to_string());

    let body = serde_json::json!({
        "error": "Too many requests",
        "message": message,
        "retryAfter": decision.retry_after_secs,
        "limit": decision.limit,
        "remaining": decision.remaining,
        "resetTime": iso_reset(decision.reset_at_ms),
    });

    let mut response = Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header(CONTENT_TYPE, "application/json")
        .header(RETRY_AFTER, decision.retry_after_secs)
        .body(Body::from(body.to_string()))
        .unwrap();

    apply_headers(response.headers_mut(), rule, decision);

    response
}

/// Extract the caller's network address from the request.
fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    // Direct connection info first.
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    // X-Forwarded-For for proxied requests; the first entry is the
    // original client.
    if let Some(forwarded_for) = req.headers().get("x-forwarded-for") {
        let value = forwarded_for.to_str().ok()?;
        let ip_str = value.split(',').next()?;

        return ip_str.trim().parse::<IpAddr>().ok();
    }

    let ip_str = req.headers().get("x-real-ip")?.to_str().ok()?;

    ip_str.parse::<IpAddr>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientIdentityLayer;
    use axum::{Router, routing::get};
    use config::Config;
    use indoc::indoc;
    use tower::util::ServiceExt;

    const CONFIG: &str = indoc! {r#"
        [server.client_identity]
        enabled = true

        [server.rate_limits.rules.api]
        window = "60s"
        max_requests = 100

        [server.rate_limits.rules.auth]
        window = "60s"
        max_requests = 2
        message = "Too many login attempts, please try again later."

        [server.rate_limits.rules.audit]
        window = "60s"
        max_requests = 1
        key_strategy = "address"
        legacy_headers = true

        [[server.rate_limits.endpoints]]
        path = "/api/auth/login"
        rule = "auth"

        [[server.rate_limits.endpoints]]
        prefix = "/api/audit"
        rule = "audit"

        [[server.rate_limits.endpoints]]
        prefix = "/api"
        rule = "api"

        [server.rate_limits.roles]
        admin = 3.0
    "#};

    async fn limiter() -> Arc<RateLimiterService> {
        let config: Config = toml::from_str(CONFIG).unwrap();
        Arc::new(RateLimiterService::new(&config.server.rate_limits).await.unwrap())
    }

    async fn router(service: Arc<RateLimiterService>) -> Router {
        let config: Config = toml::from_str(CONFIG).unwrap();

        Router::new()
            .route("/api/auth/login", get(|| async { "ok" }))
            .route("/api/audit/logs", get(|| async { "ok" }))
            .route("/api/products", get(|| async { "ok" }))
            .layer(RateLimitLayer::new(service))
            .layer(ClientIdentityLayer::new(config.server.client_identity))
    }

    fn request(path: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri(path);

        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn remaining_counts_down_and_the_excess_request_is_rejected() {
        let app = router(limiter().await).await;
        let from = [("x-forwarded-for", "1.2.3.4")];

        for expected_remaining in ["1", "0"] {
            let response = app.clone().oneshot(request("/api/auth/login", &from)).await.unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["X-RateLimit-Limit"], "2");
            assert_eq!(response.headers()["X-RateLimit-Remaining"], expected_remaining);
        }

        let response = app.clone().oneshot(request("/api/auth/login", &from)).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(RETRY_AFTER));

        let body = body_json(response).await;

        assert_eq!(body["error"], "Too many requests");
        assert_eq!(body["message"], "Too many login attempts, please try again later.");
        assert_eq!(body["limit"], 2);
        assert_eq!(body["remaining"], 0);
        assert!(body["retryAfter"].as_u64().unwrap() > 0);
        assert!(body["resetTime"].is_string());
    }

    #[tokio::test]
    async fn different_addresses_consume_separate_quotas() {
        let app = router(limiter().await).await;

        for address in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            let response = app
                .clone()
                .oneshot(request("/api/auth/login", &[("x-forwarded-for", address)]))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn authenticated_callers_are_keyed_by_identity() {
        let app = router(limiter().await).await;

        // Same address, different identities: separate buckets.
        for client in ["alice", "bob"] {
            for _ in 0..2 {
                let response = app
                    .clone()
                    .oneshot(request(
                        "/api/auth/login",
                        &[("x-forwarded-for", "9.9.9.9"), ("X-Client-Id", client)],
                    ))
                    .await
                    .unwrap();

                assert_eq!(response.status(), StatusCode::OK);
            }
        }
    }

    #[tokio::test]
    async fn role_multiplier_scales_the_effective_quota() {
        let app = router(limiter().await).await;
        let headers = [
            ("x-forwarded-for", "5.5.5.5"),
            ("X-Client-Id", "admin-1"),
            ("X-Client-Role", "admin"),
        ];

        // Base quota 2 scaled by 3.0: six requests pass, the seventh
        // does not.
        for _ in 0..6 {
            let response = app.clone().oneshot(request("/api/auth/login", &headers)).await.unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["X-RateLimit-Limit"], "6");
        }

        let response = app.clone().oneshot(request("/api/auth/login", &headers)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn prefix_resolution_applies_the_general_api_rule() {
        let app = router(limiter().await).await;

        let response = app
            .clone()
            .oneshot(request("/api/products", &[("x-forwarded-for", "1.2.3.4")]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-RateLimit-Limit"], "100");
    }

    #[tokio::test]
    async fn legacy_headers_carry_epoch_seconds() {
        let app = router(limiter().await).await;

        let response = app
            .clone()
            .oneshot(request("/api/audit/logs", &[("x-forwarded-for", "1.2.3.4")]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let reset = response.headers()["X-Rate-Limit-Reset"].to_str().unwrap();
        assert!(reset.parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn underivable_key_admits_the_request_unmodified() {
        let app = router(limiter().await).await;

        // The audit rule keys by address, and this request carries none.
        for _ in 0..3 {
            let response = app.clone().oneshot(request("/api/audit/logs", &[])).await.unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key("X-RateLimit-Limit"));
        }
    }

    #[tokio::test]
    async fn custom_rejection_handler_replaces_the_default_response() {
        let service = limiter().await;
        let handler: RejectionHandler = Arc::new(|_rule, decision| {
            Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header("X-Queue-Full", decision.retry_after_secs)
                .body(Body::empty())
                .unwrap()
        });

        let app = Router::new()
            .route("/api/auth/login", get(|| async { "ok" }))
            .layer(RateLimitLayer::new(service).on_limit_reached(handler));

        let from = [("x-forwarded-for", "7.7.7.7")];

        for _ in 0..2 {
            app.clone().oneshot(request("/api/auth/login", &from)).await.unwrap();
        }

        let response = app.clone().oneshot(request("/api/auth/login", &from)).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key("X-Queue-Full"));
    }

    #[tokio::test]
    async fn monitor_reset_does_not_reset_quota_windows() {
        let service = limiter().await;
        let app = router(service.clone()).await;
        let from = [("x-forwarded-for", "6.6.6.6")];

        for _ in 0..2 {
            app.clone().oneshot(request("/api/auth/login", &from)).await.unwrap();
        }

        service.monitor().reset();

        // The aggregates are gone, the window is not.
        let response = app.clone().oneshot(request("/api/auth/login", &from)).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn outcomes_are_recorded_in_the_monitor() {
        let service = limiter().await;
        let app = router(service.clone()).await;
        let from = [("x-forwarded-for", "8.8.8.8")];

        for _ in 0..3 {
            app.clone().oneshot(request("/api/auth/login", &from)).await.unwrap();
        }

        let snapshot = service.monitor().snapshot();

        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.blocked_requests, 1);
        assert_eq!(snapshot.top_blocked_endpoints[0].name, "/api/auth/login");
        assert_eq!(snapshot.top_blocked_callers[0].name, "ip:8.8.8.8");
    }
}
