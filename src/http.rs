use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::{AuthError, AuthService};
use crate::billing::{BillingEngine, BillingError, BulkAddOutcome, TransactionSummary};
use crate::chat::{ChatError, ChatReply, ChatRequest, ChatService, ModelCatalogEntry};
use crate::consistency::{ConsistencyChecker, ConsistencyError, ConsistencyReport, RepairOutcome};
use crate::model::ModelId;
use crate::sqlite_store::{InteractionRecord, TransactionRecord, UserRecord};

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub billing: Arc<BillingEngine>,
    pub chat: Arc<ChatService>,
    pub consistency: Arc<ConsistencyChecker>,
    admin_token: Option<String>,
}

impl AppState {
    pub fn new(
        auth: Arc<AuthService>,
        billing: Arc<BillingEngine>,
        chat: Arc<ChatService>,
        consistency: Arc<ConsistencyChecker>,
    ) -> Self {
        Self {
            auth,
            billing,
            chat,
            consistency,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    user_id: i64,
    username: String,
    email: String,
    balance: i64,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    user_id: i64,
    username: String,
}

#[derive(Debug, Serialize)]
struct LogoutResponse {
    logged_out: bool,
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
    user_id: i64,
    balance: i64,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: Vec<ModelCatalogEntry>,
}

#[derive(Debug, Serialize)]
struct ModelCostResponse {
    model: ModelId,
    cost: i64,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_page_limit")]
    limit: usize,
}

fn default_page_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    interactions: Vec<InteractionRecord>,
}

#[derive(Debug, Serialize)]
struct TransactionsResponse {
    transactions: Vec<TransactionRecord>,
}

#[derive(Debug, Deserialize)]
struct AmountRequest {
    amount: i64,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreditMutationResponse {
    user_id: i64,
    balance: i64,
}

#[derive(Debug, Deserialize)]
struct BulkAddRequest {
    grants: Vec<BulkGrant>,
}

#[derive(Debug, Deserialize)]
struct BulkGrant {
    user_id: i64,
    amount: i64,
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/v1/register", post(register))
        .route("/v1/login", post(login))
        .route("/v1/logout", post(logout))
        .route("/v1/balance", get(balance))
        .route("/v1/models", get(models))
        .route("/v1/models/:model/cost", get(model_cost))
        .route("/v1/chat", post(chat))
        .route("/v1/history", get(history))
        .route("/v1/transactions", get(transactions))
        .route("/v1/transactions/summary", get(transactions_summary))
        .route("/v1/credits/add", post(credits_add))
        .route("/v1/credits/refund", post(credits_refund))
        .route("/v1/credits/charge", post(credits_charge));

    if state.admin_token.is_some() {
        router = router
            .route("/admin/consistency/:user_id", get(admin_consistency_check))
            .route(
                "/admin/consistency/:user_id/repair",
                post(admin_consistency_repair),
            )
            .route("/admin/credits/bulk_add", post(admin_bulk_add))
            .route("/admin/transactions/:user_id", get(admin_transactions));
    }

    router.with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), (StatusCode, Json<ErrorResponse>)> {
    let user = state
        .auth
        .register(&payload.username, &payload.email, &payload.password)
        .await
        .map_err(map_auth_error)?;
    let balance = state
        .billing
        .balance(user.id)
        .await
        .map_err(map_billing_error)?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: user.id,
            username: user.username,
            email: user.email,
            balance,
        }),
    ))
}

async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ErrorResponse>)> {
    let (token, user) = state
        .auth
        .login(&payload.username, &payload.password)
        .await
        .map_err(map_auth_error)?;
    Ok(Json(LoginResponse {
        token,
        user_id: user.id,
        username: user.username,
    }))
}

async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LogoutResponse>, (StatusCode, Json<ErrorResponse>)> {
    let token = bearer_token(&headers)?;
    let logged_out = state.auth.logout(&token).await.map_err(map_auth_error)?;
    Ok(Json(LogoutResponse { logged_out }))
}

async fn balance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BalanceResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&state, &headers).await?;
    let balance = state
        .billing
        .balance(user.id)
        .await
        .map_err(map_billing_error)?;
    Ok(Json(BalanceResponse {
        user_id: user.id,
        balance,
    }))
}

async fn models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ModelsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&state, &headers).await?;
    let balance = state
        .billing
        .balance(user.id)
        .await
        .map_err(map_billing_error)?;
    Ok(Json(ModelsResponse {
        models: state.chat.model_catalog(balance),
    }))
}

async fn model_cost(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(model): Path<String>,
) -> Result<Json<ModelCostResponse>, (StatusCode, Json<ErrorResponse>)> {
    authenticate(&state, &headers).await?;
    let id = ModelId::parse(&model).map_err(|err| {
        error_response(StatusCode::BAD_REQUEST, "invalid_model", err.to_string())
    })?;
    let cost = state.chat.model_cost(&id).ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            "unknown_model",
            format!("unknown model: {id}"),
        )
    })?;
    Ok(Json(ModelCostResponse { model: id, cost }))
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatReply>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&state, &headers).await?;
    let reply = state
        .chat
        .send_message(user.id, payload)
        .await
        .map_err(map_chat_error)?;
    Ok(Json(reply))
}

async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<Json<HistoryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&state, &headers).await?;
    let interactions = state
        .chat
        .history(user.id, page.offset, page.limit)
        .await
        .map_err(map_chat_error)?;
    Ok(Json(HistoryResponse { interactions }))
}

async fn transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<Json<TransactionsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&state, &headers).await?;
    let transactions = state
        .billing
        .transactions(user.id, page.offset, page.limit)
        .await
        .map_err(map_billing_error)?;
    Ok(Json(TransactionsResponse { transactions }))
}

async fn transactions_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TransactionSummary>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&state, &headers).await?;
    let summary = state
        .billing
        .summary(user.id)
        .await
        .map_err(map_billing_error)?;
    Ok(Json(summary))
}

async fn credits_add(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AmountRequest>,
) -> Result<Json<CreditMutationResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&state, &headers).await?;
    let description = payload.description.as_deref().unwrap_or("credit addition");
    let balance = state
        .billing
        .add(user.id, payload.amount, description)
        .await
        .map_err(map_billing_error)?;
    Ok(Json(CreditMutationResponse {
        user_id: user.id,
        balance,
    }))
}

async fn credits_refund(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AmountRequest>,
) -> Result<Json<CreditMutationResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&state, &headers).await?;
    let description = payload.description.as_deref().unwrap_or("refund");
    let balance = state
        .billing
        .refund(user.id, payload.amount, description)
        .await
        .map_err(map_billing_error)?;
    Ok(Json(CreditMutationResponse {
        user_id: user.id,
        balance,
    }))
}

async fn credits_charge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AmountRequest>,
) -> Result<Json<CreditMutationResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&state, &headers).await?;
    let description = payload.description.as_deref().unwrap_or("manual charge");
    let balance = state
        .billing
        .charge(user.id, payload.amount, description)
        .await
        .map_err(map_billing_error)?;
    Ok(Json(CreditMutationResponse {
        user_id: user.id,
        balance,
    }))
}

async fn admin_consistency_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<Json<ConsistencyReport>, (StatusCode, Json<ErrorResponse>)> {
    require_admin(&state, &headers)?;
    let report = state
        .consistency
        .check(user_id)
        .await
        .map_err(map_consistency_error)?;
    Ok(Json(report))
}

async fn admin_consistency_repair(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<Json<RepairOutcome>, (StatusCode, Json<ErrorResponse>)> {
    require_admin(&state, &headers)?;
    let outcome = state
        .consistency
        .repair(user_id)
        .await
        .map_err(map_consistency_error)?;
    Ok(Json(outcome))
}

async fn admin_bulk_add(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BulkAddRequest>,
) -> Result<Json<BulkAddOutcome>, (StatusCode, Json<ErrorResponse>)> {
    require_admin(&state, &headers)?;
    let grants: Vec<(i64, i64)> = payload
        .grants
        .iter()
        .map(|grant| (grant.user_id, grant.amount))
        .collect();
    Ok(Json(state.billing.bulk_add(&grants).await))
}

async fn admin_transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    Query(page): Query<PageQuery>,
) -> Result<Json<TransactionsResponse>, (StatusCode, Json<ErrorResponse>)> {
    require_admin(&state, &headers)?;
    let transactions = state
        .billing
        .transactions(user_id, page.offset, page.limit)
        .await
        .map_err(map_billing_error)?;
    Ok(Json(TransactionsResponse { transactions }))
}

async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<UserRecord, (StatusCode, Json<ErrorResponse>)> {
    let token = bearer_token(headers)?;
    state.auth.resolve(&token).await.map_err(map_auth_error)
}

fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    let expected = state.admin_token.as_deref().ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            "not_configured",
            "admin endpoints are not enabled",
        )
    })?;
    let token = bearer_token(headers)?;
    if token != expected {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid admin token",
        ));
    }
    Ok(())
}

fn bearer_token(headers: &HeaderMap) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    extract_bearer(headers).ok_or_else(|| {
        error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing bearer token",
        )
    })
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn map_auth_error(err: AuthError) -> (StatusCode, Json<ErrorResponse>) {
    match &err {
        AuthError::InvalidUsername { .. } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_username", err.to_string())
        }
        AuthError::InvalidEmail => {
            error_response(StatusCode::BAD_REQUEST, "invalid_email", err.to_string())
        }
        AuthError::WeakPassword { .. } => {
            error_response(StatusCode::BAD_REQUEST, "weak_password", err.to_string())
        }
        AuthError::AlreadyRegistered => {
            error_response(StatusCode::CONFLICT, "already_registered", err.to_string())
        }
        AuthError::InvalidCredentials => error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_credentials",
            err.to_string(),
        ),
        AuthError::InvalidToken => {
            error_response(StatusCode::UNAUTHORIZED, "invalid_token", err.to_string())
        }
        AuthError::Rng | AuthError::Jwt(_) | AuthError::Store(_) => {
            tracing::error!(%err, "auth internal error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "internal error",
            )
        }
    }
}

fn map_billing_error(err: BillingError) -> (StatusCode, Json<ErrorResponse>) {
    match &err {
        BillingError::AccountNotFound { .. } => {
            error_response(StatusCode::NOT_FOUND, "account_not_found", err.to_string())
        }
        BillingError::InvalidAmount { .. } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_amount", err.to_string())
        }
        BillingError::InsufficientFunds { .. } => error_response(
            StatusCode::PAYMENT_REQUIRED,
            "insufficient_credits",
            err.to_string(),
        ),
        BillingError::Store(_) => {
            tracing::error!(%err, "billing internal error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "internal error",
            )
        }
    }
}

fn map_chat_error(err: ChatError) -> (StatusCode, Json<ErrorResponse>) {
    match &err {
        ChatError::InvalidMessage { .. } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_message", err.to_string())
        }
        ChatError::UnknownModel { .. } | ChatError::ModelId(_) => {
            error_response(StatusCode::BAD_REQUEST, "unknown_model", err.to_string())
        }
        ChatError::InsufficientCredits { .. } => error_response(
            StatusCode::PAYMENT_REQUIRED,
            "insufficient_credits",
            err.to_string(),
        ),
        ChatError::Generation(_) => error_response(
            StatusCode::BAD_GATEWAY,
            "generation_failed",
            err.to_string(),
        ),
        ChatError::AccountNotFound { .. } => {
            error_response(StatusCode::NOT_FOUND, "account_not_found", err.to_string())
        }
        ChatError::Billing(_) | ChatError::Store(_) => {
            tracing::error!(%err, "chat internal error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "billing_failed",
                "the exchange could not be billed",
            )
        }
    }
}

fn map_consistency_error(err: ConsistencyError) -> (StatusCode, Json<ErrorResponse>) {
    match &err {
        ConsistencyError::AccountNotFound { .. } => {
            error_response(StatusCode::NOT_FOUND, "account_not_found", err.to_string())
        }
        ConsistencyError::Store(_) => {
            tracing::error!(%err, "consistency internal error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "internal error",
            )
        }
    }
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}
