use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::middleware::NoOpMiddleware;
use std::sync::Arc;
use std::time::Instant;
use tower_governor::GovernorLayer;
use tower_governor::governor::{GovernorConfig, GovernorConfigBuilder};
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{Span, info_span};
use uuid::Uuid;

use reverie_domain::identity::ActorIdentity;
use reverie_domain::ports::auth::AuthError;
use reverie_infra::config::AppConfig;

use crate::error::ApiError;
use crate::observability::{self, RequestLabels};
use crate::state::AppState;
use crate::validation;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Clone, Debug)]
pub struct CorrelationId(pub String);

/// Caller identity resolved from the bearer token, if any.
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
    pub actor: Option<ActorIdentity>,
}

impl AuthContext {
    pub fn is_authenticated(&self) -> bool {
        self.actor.is_some()
    }
}

#[derive(Clone)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::now_v7().to_string())
            .ok()
            .map(RequestId::new)
    }
}

pub fn set_request_id_layer() -> SetRequestIdLayer<UuidRequestId> {
    SetRequestIdLayer::x_request_id(UuidRequestId)
}

pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, JournalRequestSpan> {
    TraceLayer::new_for_http().make_span_with(JournalRequestSpan)
}

/// Span per request. Never records bodies: journal content is PHI.
#[derive(Clone, Default)]
pub struct JournalRequestSpan;

impl<B> MakeSpan<B> for JournalRequestSpan {
    fn make_span(&mut self, req: &Request<B>) -> Span {
        let headers = req.headers();
        info_span!(
            "http_request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = header_or_dash(headers, REQUEST_ID_HEADER),
            correlation_id = header_or_dash(headers, CORRELATION_ID_HEADER),
            idempotency_key = headers.contains_key(IDEMPOTENCY_KEY_HEADER)
        )
    }
}

fn header_or_dash<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
}

pub fn timeout_layer(config: &AppConfig) -> TimeoutLayer {
    TimeoutLayer::new(config.request_timeout())
}

pub type RateLimitLayer = GovernorLayer<PeerIpKeyExtractor, NoOpMiddleware>;

pub fn rate_limit_layer(config: &AppConfig) -> RateLimitLayer {
    let built = GovernorConfigBuilder::default()
        .per_second(config.rate_limit_per_second)
        .burst_size(config.rate_limit_burst)
        .finish();
    let Some(governor) = built else {
        tracing::error!(
            per_second = config.rate_limit_per_second,
            burst = config.rate_limit_burst,
            "rejected rate limit settings; falling back to governor defaults"
        );
        return GovernorLayer {
            config: Arc::new(GovernorConfig::default()),
        };
    };
    GovernorLayer {
        config: Arc::new(governor),
    }
}

/// Attaches an [`AuthContext`] to every request. Rejection is left to
/// [`require_auth_middleware`] so public routes stay reachable.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let mut context = AuthContext::default();
    if let Some(token) = bearer_token(req.headers()).map(str::to_string) {
        match state.verifier.verify(&token).await {
            Ok(verified) => context.actor = Some(ActorIdentity::with_user_id(verified.user_id)),
            Err(AuthError::Missing) => {}
            Err(err) => {
                tracing::warn!(error = %err, "rejected bearer token");
                observability::register_auth_rejection("invalid_token");
            }
        }
    }
    req.extensions_mut().insert(context);
    next.run(req).await
}

pub async fn require_auth_middleware(req: Request<Body>, next: Next) -> Response {
    match req.extensions().get::<AuthContext>() {
        Some(context) if context.is_authenticated() => next.run(req).await,
        _ => {
            observability::register_auth_rejection("missing_credential");
            ApiError::Unauthorized.into_response()
        }
    }
}

/// Accepts a caller-supplied correlation id or mints one, and echoes it on
/// the response. The id also travels into workflow jobs.
pub async fn correlation_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let correlation_id = match req.headers().get(CORRELATION_ID_HEADER) {
        None => Uuid::now_v7().to_string(),
        Some(value) => match value.to_str().map(validation::correlation_id) {
            Ok(Ok(id)) => id,
            Ok(Err(err)) => return err.into_response(),
            Err(_) => {
                return ApiError::Validation("correlation id must be ascii".into()).into_response();
            }
        },
    };

    let header_name = HeaderName::from_static(CORRELATION_ID_HEADER);
    let header_value = HeaderValue::from_str(&correlation_id).ok();
    if let Some(value) = header_value.clone() {
        req.headers_mut().insert(header_name.clone(), value);
    }
    req.extensions_mut().insert(CorrelationId(correlation_id));

    let mut response = next.run(req).await;
    if let Some(value) = header_value {
        response.headers_mut().insert(header_name, value);
    }
    response
}

pub async fn metrics_layer(req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let labels = RequestLabels {
        method: req.method().to_string(),
        route: req
            .extensions()
            .get::<MatchedPath>()
            .map_or_else(|| req.uri().path().to_string(), |path| path.as_str().to_string()),
        keyed: req.headers().contains_key(IDEMPOTENCY_KEY_HEADER),
    };
    let response = next.run(req).await;
    observability::register_http_request(&labels, response.status(), started.elapsed());
    response
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(bearer_token(&headers_with_auth("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&headers_with_auth("BEARER  abc ")), Some("abc"));
        assert_eq!(bearer_token(&headers_with_auth("Basic abc")), None);
        assert_eq!(bearer_token(&headers_with_auth("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
