use axum::extract::{Extension, Path, State};
use axum::{
    Json, Router,
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use reverie_domain::identity::ActorIdentity;
use reverie_domain::journal::{JournalEntry, JournalEntryCreate, RequestContext};
use reverie_domain::util::utc_date;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::middleware::{AuthContext, CorrelationId, IDEMPOTENCY_KEY_HEADER};
use crate::{
    error::ApiError, middleware as app_middleware, observability, state::AppState, validation,
};

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/v1/journal-entries",
            get(list_journal_entries).post(create_journal_entry),
        )
        .route("/v1/journal-entries/:entry_id", get(get_journal_entry))
        .route("/v1/spend/today", get(get_spend_today))
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
        .layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(app_middleware::timeout_layer(&state.config))
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ))
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ));

    if !state.config.is_test() {
        app = app.layer(app_middleware::rate_limit_layer(&state.config));
    }

    app.with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    encryption_key_id: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
        encryption_key_id: state.config.encryption_key_id.clone(),
    })
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[derive(Debug, Deserialize, Validate)]
struct CreateJournalEntryRequest {
    #[validate(length(min = 1, max = 10000))]
    content: String,
    #[serde(default)]
    #[validate(length(max = 64))]
    mood: String,
    #[serde(default)]
    #[validate(length(max = 20))]
    tags: Vec<String>,
}

/// The raw body is taken as a string: the idempotency fingerprint is computed
/// over the exact bytes the client sent, not a re-serialization.
async fn create_journal_entry(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<JournalEntry>), ApiError> {
    let actor = actor_identity(&auth)?;
    let payload: CreateJournalEntryRequest = serde_json::from_str(&body)
        .map_err(|err| ApiError::Validation(format!("invalid request body: {err}")))?;
    validation::validate(&payload)?;
    let idempotency_key = idempotency_key_from_headers(&headers)?;

    let request = RequestContext {
        raw_body: body,
        idempotency_key,
        correlation_id,
    };
    let input = JournalEntryCreate {
        content: payload.content,
        mood: payload.mood,
        tags: payload.tags,
    };
    let entry = state
        .journal
        .create_entry(&actor, &request, input)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn list_journal_entries(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<JournalEntry>>, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(Json(state.journal.list_entries(&actor).await?))
}

async fn get_journal_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<JournalEntry>, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(Json(state.journal.get_entry(&actor, &entry_id).await?))
}

#[derive(Debug, Serialize, Deserialize)]
struct SpendTodayResponse {
    user_id: String,
    date: String,
    request_count: u64,
    accumulated_cost: Decimal,
    daily_limit: Decimal,
    remaining: Decimal,
}

async fn get_spend_today(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<SpendTodayResponse>, ApiError> {
    let actor = actor_identity(&auth)?;
    let check = state.ledger.check_limit(&actor.user_id, Decimal::ZERO).await?;
    let summary = state.ledger.summary(&actor.user_id).await?;
    let (date, request_count) = match summary {
        Some(record) => (record.date, record.request_count),
        None => (utc_date(reverie_domain::clock::now_ms()), 0),
    };
    Ok(Json(SpendTodayResponse {
        user_id: actor.user_id,
        date,
        request_count,
        accumulated_cost: check.current_cost,
        daily_limit: check.daily_limit,
        remaining: check.remaining,
    }))
}

fn actor_identity(auth: &AuthContext) -> Result<ActorIdentity, ApiError> {
    auth.actor
        .clone()
        .filter(|actor| !actor.user_id.trim().is_empty())
        .ok_or(ApiError::Unauthorized)
}

fn idempotency_key_from_headers(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::Validation("idempotency key must be printable ascii".into()))?;
    validation::idempotency_key(value).map(Some)
}
