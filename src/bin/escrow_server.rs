use anyhow::Context;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use escrow_desk::{
    auth::bearer_token,
    config::AppConfig,
    deals::{CloseOutcome, OpenedRoom},
    logging,
    model::WalletEntry,
    Actor, ApplyOutcome, Clock, Database, Deal, DealRegistry, DealStatus, DealType, Dispute,
    ErrorKind, EscrowError, FeeQuote, Notifier, NewDeal, Room, SystemClock, TakeOutcome,
    TokenIssuer, TracingNotifier, TrustEvent, TrustEventKind, TrustEventRequest, TrustState,
    WebhookNotifier,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "escrow-server")]
#[command(about = "HTTP API for the escrow deal engine")]
struct Args {
    #[arg(short, long, default_value = "escrow.toml", env = "ESCROW_CONFIG")]
    config: PathBuf,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Clone)]
struct AppState {
    registry: DealRegistry,
    tokens: TokenIssuer,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        AppConfig::load_with_env_overrides(&args.config)?
    } else {
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        config
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    config.validate()?;

    logging::init(&config.logging);
    info!("Starting escrow server");

    let secret = config
        .get_jwt_secret()
        .context("auth.jwt_secret or JWT_SECRET must be set")?;
    let tokens = TokenIssuer::new(secret, config.auth.token_ttl_hours)?;

    let db = Database::new(&config.database).await?;
    let notifier: Arc<dyn Notifier> = match WebhookNotifier::from_config(&config.notify) {
        Some(webhook) => {
            info!("Delivering notifications to {}", webhook.endpoint());
            Arc::new(webhook)
        }
        None => Arc::new(TracingNotifier),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = DealRegistry::new(db, &config, notifier, clock);

    let app = router(AppState { registry, tokens });

    let listener = TcpListener::bind(config.get_server_address()).await?;
    info!("Escrow server listening on {}", listener.local_addr()?);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/deals", post(create_deal))
        .route("/deals/:deal_id", get(get_deal))
        .route("/deals/:deal_id/take", post(take_deal))
        .route("/deals/:deal_id/close", post(close_deal))
        .route("/deals/:deal_id/cancel", post(cancel_deal))
        .route("/deals/:deal_id/room", post(open_room))
        .route("/deals/:deal_id/disputes", post(open_dispute))
        .route("/disputes/:dispute_id/resolve", post(resolve_dispute))
        .route("/fees/quote", post(quote_fee))
        .route("/trust/events", post(record_trust_event))
        .route("/trust/events/:event_id/rollback", post(rollback_trust_event))
        .route("/users/:user_id/deals", get(list_user_deals))
        .route("/users/:user_id/trust", get(get_trust))
        .route("/users/:user_id/trust/freeze", post(freeze_trust))
        .route("/users/:user_id/trust/unfreeze", post(unfreeze_trust))
        .route("/users/:user_id/no-dispute-bonus", post(award_no_dispute_bonus))
        .route("/users/:user_id/monthly-clean", post(award_monthly_clean))
        .route("/users/:user_id/wallet", get(get_wallet))
        .route("/rooms", get(list_rooms).post(register_room))
        .route("/rooms/free", get(list_free_rooms))
        .route("/rooms/:room_id/active", post(set_room_active))
        .route("/me/shift", post(set_shift))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

struct ApiError(EscrowError);

impl From<EscrowError> for ApiError {
    fn from(err: EscrowError) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorKind,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Internal => {
                error!("Request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match kind {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.0.to_string(),
        };

        (status, Json(ErrorBody { error: kind, message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Authenticated caller. The stored role wins over the one in the token, so bans apply at once.
struct Caller(Actor);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .ok_or_else(|| EscrowError::Auth("missing bearer token".to_string()))?;

        let mut actor = state.tokens.verify(token)?;
        if let Some(user) = state.registry.db().get_user(actor.user_id).await? {
            actor.role = user.role;
        }

        Ok(Caller(actor))
    }
}

fn require_staff(actor: &Actor) -> Result<(), ApiError> {
    if actor.is_staff() {
        Ok(())
    } else {
        Err(EscrowError::forbidden("staff only").into())
    }
}

fn require_admin(actor: &Actor) -> Result<(), ApiError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EscrowError::forbidden("admins only").into())
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "escrow-server",
    }))
}

async fn create_deal(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Json(request): Json<NewDeal>,
) -> ApiResult<Deal> {
    Ok(Json(state.registry.create(&actor, request).await?))
}

async fn get_deal(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(deal_id): Path<i64>,
) -> ApiResult<Deal> {
    let deal = state.registry.get(deal_id).await?;
    if !deal.is_participant(actor.user_id) && !actor.is_staff() {
        return Err(EscrowError::forbidden("not your deal").into());
    }
    Ok(Json(deal))
}

async fn take_deal(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(deal_id): Path<i64>,
) -> ApiResult<TakeOutcome> {
    Ok(Json(state.registry.take(deal_id, &actor).await?))
}

async fn close_deal(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(deal_id): Path<i64>,
) -> ApiResult<CloseOutcome> {
    Ok(Json(state.registry.close(deal_id, &actor).await?))
}

async fn cancel_deal(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(deal_id): Path<i64>,
) -> ApiResult<Deal> {
    Ok(Json(state.registry.cancel(deal_id, &actor).await?))
}

async fn open_room(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(deal_id): Path<i64>,
) -> ApiResult<OpenedRoom> {
    Ok(Json(state.registry.open_room(deal_id, &actor).await?))
}

#[derive(Deserialize)]
struct DisputeRequest {
    description: String,
}

async fn open_dispute(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(deal_id): Path<i64>,
    Json(request): Json<DisputeRequest>,
) -> ApiResult<Dispute> {
    Ok(Json(
        state
            .registry
            .open_dispute(deal_id, &actor, &request.description)
            .await?,
    ))
}

#[derive(Deserialize)]
struct ResolveRequest {
    winner_id: Option<i64>,
}

async fn resolve_dispute(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(dispute_id): Path<i64>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<Dispute> {
    Ok(Json(
        state
            .registry
            .resolve_dispute(dispute_id, &actor, request.winner_id)
            .await?,
    ))
}

#[derive(Deserialize)]
struct QuoteRequest {
    seller_id: i64,
    deal_type: DealType,
    #[serde(default)]
    price: Decimal,
    addon: Option<Decimal>,
}

async fn quote_fee(
    State(state): State<AppState>,
    Caller(_actor): Caller,
    Json(request): Json<QuoteRequest>,
) -> ApiResult<FeeQuote> {
    Ok(Json(
        state
            .registry
            .quote(request.seller_id, request.deal_type, request.price, request.addon)
            .await?,
    ))
}

#[derive(Deserialize)]
struct TrustEventBody {
    user_id: i64,
    event_type: String,
    delta: Option<i32>,
    reason: String,
    ref_type: Option<String>,
    ref_id: Option<i64>,
    #[serde(default)]
    allow_duplicate: bool,
}

async fn record_trust_event(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Json(body): Json<TrustEventBody>,
) -> ApiResult<ApplyOutcome> {
    require_staff(&actor)?;

    let kind: TrustEventKind = body.event_type.parse()?;
    let mut request = TrustEventRequest::new(body.user_id, kind, body.reason);
    if let Some(delta) = body.delta {
        request = request.with_delta(delta);
    }
    match (body.ref_type, body.ref_id) {
        (Some(ref_type), Some(ref_id)) => request = request.with_reference(ref_type, ref_id),
        (None, None) => {}
        _ => {
            return Err(EscrowError::invalid_input("ref_type and ref_id go together").into());
        }
    }
    if body.allow_duplicate {
        request = request.allowing_duplicates();
    }

    Ok(Json(state.registry.trust().apply(request).await?))
}

async fn rollback_trust_event(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(event_id): Path<i64>,
) -> ApiResult<TrustEvent> {
    require_admin(&actor)?;
    Ok(Json(state.registry.trust().rollback(event_id).await?))
}

#[derive(Serialize)]
struct TrustView {
    #[serde(flatten)]
    state: TrustState,
    recent_penalties: Vec<String>,
}

async fn get_trust(
    State(state): State<AppState>,
    Caller(_actor): Caller,
    Path(user_id): Path<i64>,
) -> ApiResult<TrustView> {
    let trust = state.registry.trust();
    Ok(Json(TrustView {
        state: trust.state(user_id).await?,
        recent_penalties: trust.recent_penalties(user_id, 3).await?,
    }))
}

async fn freeze_trust(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(user_id): Path<i64>,
) -> ApiResult<TrustState> {
    require_admin(&actor)?;
    let trust = state.registry.trust();
    trust.freeze(user_id).await?;
    Ok(Json(trust.state(user_id).await?))
}

async fn unfreeze_trust(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(user_id): Path<i64>,
) -> ApiResult<TrustState> {
    require_admin(&actor)?;
    let trust = state.registry.trust();
    trust.unfreeze(user_id).await?;
    Ok(Json(trust.state(user_id).await?))
}

async fn award_no_dispute_bonus(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(user_id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    require_staff(&actor)?;
    let awarded = state.registry.award_no_dispute_bonus(user_id).await?;
    Ok(Json(serde_json::json!({ "user_id": user_id, "awarded": awarded })))
}

async fn award_monthly_clean(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(user_id): Path<i64>,
) -> ApiResult<Option<ApplyOutcome>> {
    require_staff(&actor)?;
    Ok(Json(state.registry.trust().award_monthly_clean(user_id).await?))
}

#[derive(Deserialize)]
struct DealFilter {
    status: Option<DealStatus>,
}

async fn list_user_deals(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(user_id): Path<i64>,
    Query(filter): Query<DealFilter>,
) -> ApiResult<Vec<Deal>> {
    if actor.user_id != user_id && !actor.is_staff() {
        return Err(EscrowError::forbidden("not your archive").into());
    }
    Ok(Json(state.registry.list_for_user(user_id, filter.status).await?))
}

async fn get_wallet(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(user_id): Path<i64>,
) -> ApiResult<Vec<WalletEntry>> {
    if actor.user_id != user_id && !actor.is_admin() {
        return Err(EscrowError::forbidden("not your wallet").into());
    }
    Ok(Json(state.registry.db().wallet_entries(user_id).await?))
}

#[derive(Deserialize)]
struct RegisterRoomRequest {
    chat_handle: String,
    title: Option<String>,
}

async fn register_room(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Json(request): Json<RegisterRoomRequest>,
) -> ApiResult<Room> {
    Ok(Json(
        state
            .registry
            .register_room(&actor, &request.chat_handle, request.title.as_deref())
            .await?,
    ))
}

async fn list_rooms(State(state): State<AppState>, Caller(actor): Caller) -> ApiResult<Vec<Room>> {
    require_staff(&actor)?;
    Ok(Json(state.registry.rooms().list_all().await?))
}

async fn list_free_rooms(
    State(state): State<AppState>,
    Caller(actor): Caller,
) -> ApiResult<Vec<Room>> {
    require_staff(&actor)?;
    Ok(Json(state.registry.rooms().list_free().await?))
}

#[derive(Deserialize)]
struct RoomActiveRequest {
    active: bool,
}

async fn set_room_active(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(room_id): Path<i64>,
    Json(request): Json<RoomActiveRequest>,
) -> ApiResult<Room> {
    Ok(Json(
        state
            .registry
            .set_room_active(&actor, room_id, request.active)
            .await?,
    ))
}

#[derive(Deserialize)]
struct ShiftRequest {
    on_shift: bool,
}

async fn set_shift(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Json(request): Json<ShiftRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .registry
        .db()
        .set_on_shift(actor.user_id, request.on_shift)
        .await?;
    Ok(Json(serde_json::json!({
        "user_id": actor.user_id,
        "on_shift": request.on_shift,
    })))
}
