use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    middleware,
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::Config;
use crate::engine::{Countdown, EngineRegistry};
use crate::error::{ApiErrorWithMeta, api_error};
use crate::ledger::Ledger;
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::service::{
    AccountView, DashboardSummary, EarnOverview, ReferralStats, RewardsService, WithdrawalReceipt,
    start_of_day,
};
use crate::session::{Session, SessionRegistry, UserId};
use crate::types::{
    LedgerAudit, LedgerEntry, NewUser, ProfileUpdate, Task, TaskFilter, User, Withdrawal,
};
use crate::TASK_REWARD;

const DEFAULT_ACTIVITY_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// Read models and write paths over the ledger.
    pub service: RewardsService,
    /// Countdown engines by user.
    pub engines: Arc<EngineRegistry>,
    /// Live sessions by user.
    pub sessions: Arc<SessionRegistry>,
    /// The application configuration.
    pub config: Config,
}

impl AppState {
    pub fn new(ledger: Arc<dyn Ledger>, config: Config) -> Self {
        let engines = EngineRegistry::new(ledger.clone(), config.task_duration_secs, TASK_REWARD);
        Self {
            service: RewardsService::new(ledger),
            engines: Arc::new(engines),
            sessions: Arc::new(SessionRegistry::new()),
            config,
        }
    }
}

/// The earn view: today's progress, recent tasks and the running countdown.
#[derive(Serialize)]
pub struct EarnResponse {
    #[serde(flatten)]
    pub overview: EarnOverview,
    pub countdown: Countdown,
}

#[derive(Deserialize)]
pub struct TaskListQuery {
    /// The maximum number of tasks to return.
    pub limit: Option<usize>,
    /// Only tasks created since UTC midnight.
    #[serde(default)]
    pub today: bool,
}

#[derive(Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<usize>,
}

/// The request to withdraw part of the balance.
#[derive(Deserialize)]
pub struct WithdrawRequest {
    /// The amount as typed, e.g. "12.50".
    pub amount: String,
    /// `paypal` or `bank`.
    pub payment_method: Option<String>,
}

#[derive(Serialize)]
pub struct SignOutResponse {
    /// Whether a live session, and with it any running countdown, was ended.
    pub signed_out: bool,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/users", post(register_handler))
        .route("/me", get(dashboard_handler))
        .route("/account", get(account_handler).patch(update_account_handler))
        .route("/earn", get(earn_handler))
        .route("/earn/start", post(start_task_handler))
        .route("/tasks", get(list_tasks_handler))
        .route(
            "/withdrawals",
            get(list_withdrawals_handler).post(create_withdrawal_handler),
        )
        .route("/referrals", get(referrals_handler))
        .route("/activity", get(activity_handler))
        .route("/audit", get(audit_handler))
        .route("/session/sign-out", post(sign_out_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn register_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<NewUser>,
) -> Result<ApiOk<User>, ApiErrorWithMeta> {
    let user = st.service.register(req).await.map_err(|e| api_error(e, &meta))?;
    Ok(ApiOk::created("user registered", user, meta))
}

async fn dashboard_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: Session,
) -> Result<ApiOk<DashboardSummary>, ApiErrorWithMeta> {
    let summary = st
        .service
        .dashboard(session.user_id())
        .await
        .map_err(|e| api_error(e, &meta))?;
    Ok(ApiOk::ok("dashboard fetched", summary, meta))
}

async fn account_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: Session,
) -> Result<ApiOk<AccountView>, ApiErrorWithMeta> {
    let account = st
        .service
        .account(session.user_id())
        .await
        .map_err(|e| api_error(e, &meta))?;
    Ok(ApiOk::ok("account fetched", account, meta))
}

async fn update_account_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: Session,
    Json(req): Json<ProfileUpdate>,
) -> Result<ApiOk<AccountView>, ApiErrorWithMeta> {
    let account = st
        .service
        .update_profile(session.user_id(), req)
        .await
        .map_err(|e| api_error(e, &meta))?;
    Ok(ApiOk::ok("profile updated", account, meta))
}

async fn earn_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: Session,
) -> Result<ApiOk<EarnResponse>, ApiErrorWithMeta> {
    let overview = st
        .service
        .earn_overview(session.user_id(), Utc::now())
        .await
        .map_err(|e| api_error(e, &meta))?;
    let countdown = st.engines.countdown(session.user_id());
    Ok(ApiOk::ok(
        "earn overview fetched",
        EarnResponse {
            overview,
            countdown,
        },
        meta,
    ))
}

async fn start_task_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: Session,
) -> Result<ApiOk<Countdown>, ApiErrorWithMeta> {
    let engine = st.engines.engine_for(session.user_id());
    let countdown = engine.start_task(session).map_err(|e| api_error(e, &meta))?;
    Ok(ApiOk::accepted("task started", countdown, meta))
}

async fn list_tasks_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: Session,
    Query(q): Query<TaskListQuery>,
) -> Result<ApiOk<Vec<Task>>, ApiErrorWithMeta> {
    let limit = q.limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT);
    let mut filter = TaskFilter::default().limit(limit);
    if q.today {
        filter = filter.since(start_of_day(Utc::now()));
    }
    let tasks = st
        .service
        .tasks(session.user_id(), &filter)
        .await
        .map_err(|e| api_error(e, &meta))?;
    Ok(ApiOk::ok("tasks fetched", tasks, meta))
}

async fn list_withdrawals_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: Session,
) -> Result<ApiOk<Vec<Withdrawal>>, ApiErrorWithMeta> {
    let withdrawals = st
        .service
        .withdrawals(session.user_id())
        .await
        .map_err(|e| api_error(e, &meta))?;
    Ok(ApiOk::ok("withdrawals fetched", withdrawals, meta))
}

async fn create_withdrawal_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: Session,
    Json(req): Json<WithdrawRequest>,
) -> Result<ApiOk<WithdrawalReceipt>, ApiErrorWithMeta> {
    let receipt = st
        .service
        .request_withdrawal(
            session.user_id(),
            &req.amount,
            req.payment_method.as_deref(),
        )
        .await
        .map_err(|e| api_error(e, &meta))?;
    Ok(ApiOk::created("withdrawal request submitted", receipt, meta))
}

async fn referrals_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: Session,
) -> Result<ApiOk<ReferralStats>, ApiErrorWithMeta> {
    let stats = st
        .service
        .referrals(session.user_id())
        .await
        .map_err(|e| api_error(e, &meta))?;
    Ok(ApiOk::ok("referrals fetched", stats, meta))
}

async fn activity_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: Session,
    Query(q): Query<ActivityQuery>,
) -> Result<ApiOk<Vec<LedgerEntry>>, ApiErrorWithMeta> {
    let limit = q.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT).min(MAX_LIST_LIMIT);
    let entries = st
        .service
        .activity(session.user_id(), limit)
        .await
        .map_err(|e| api_error(e, &meta))?;
    Ok(ApiOk::ok("activity fetched", entries, meta))
}

async fn audit_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: Session,
) -> Result<ApiOk<LedgerAudit>, ApiErrorWithMeta> {
    let audit = st
        .service
        .audit(session.user_id())
        .await
        .map_err(|e| api_error(e, &meta))?;
    Ok(ApiOk::ok("ledger audited", audit, meta))
}

async fn sign_out_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    UserId(user_id): UserId,
) -> ApiOk<SignOutResponse> {
    let signed_out = st.sessions.sign_out(user_id);
    st.engines.remove(user_id);
    ApiOk::ok("signed out", SignOutResponse { signed_out }, meta)
}
