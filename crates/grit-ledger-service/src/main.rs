use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use grit_ledger_core::{
    format_date, now_utc, parse_rfc3339_utc, utc_day, ActionConfig, ActivitySource, AwardOutcome,
    AwardRequest, CountryStats, LeaderboardEntry, StreakSummary, Tier, User, UserId, XpEvent,
};
use grit_ledger_dispatch::{DeadJob, EnqueueOptions, Job, QueueDepths, SqliteJobQueue};
use grit_ledger_store_sqlite::SqliteRewardStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "grit_ledger.service.v1";

/// Thin per-request facade over the SQLite stores. Holds only the path:
/// every operation opens its own connection, which keeps the handle `Clone`
/// and lets blocking work run on the tokio blocking pool without shared
/// connection state.
#[derive(Debug, Clone)]
struct RewardApi {
    db_path: Arc<PathBuf>,
}

impl RewardApi {
    fn new(db_path: PathBuf) -> Self {
        Self {
            db_path: Arc::new(db_path),
        }
    }

    fn store(&self) -> Result<SqliteRewardStore> {
        SqliteRewardStore::open(&self.db_path)
    }

    fn queue(&self) -> Result<SqliteJobQueue> {
        let path = self
            .db_path
            .to_str()
            .ok_or_else(|| anyhow!("database path must be valid UTF-8"))?;
        SqliteJobQueue::open(path)
    }

    fn migrate(&self) -> Result<()> {
        self.store()?.migrate()?;
        self.queue()?.migrate()?;
        Ok(())
    }

    fn create_user(&self, request: CreateUserRequest) -> Result<User> {
        self.store()?
            .create_user(&request.display_name, &request.country_code, request.tier, now_utc())
    }

    fn log_activity(&self, request: ActivityLogRequest) -> Result<Value> {
        let store = self.store()?;
        let user_id = parse_user_id(&request.user_id)?;
        let occurred_at = match request.occurred_at.as_deref() {
            Some(raw) => parse_rfc3339_utc(raw).map_err(|err| anyhow!(err.to_string()))?,
            None => now_utc(),
        };
        let metadata = request.metadata.unwrap_or_else(|| json!({}));
        let log_id = store.log_activity(user_id, request.source, occurred_at, &metadata)?;
        Ok(json!({ "log_id": log_id.to_string() }))
    }

    fn award(&self, request: AwardHttpRequest) -> Result<AwardOutcome> {
        let mut store = self.store()?;
        let award = AwardRequest {
            user_id: parse_user_id(&request.user_id)?,
            action_key: request.action_key,
            idempotency_key: request.idempotency_key,
            metadata: request.metadata.unwrap_or_else(|| json!({})),
        };
        store.award_xp(&award, now_utc())
    }

    fn actions(&self) -> Result<Vec<ActionConfig>> {
        self.store()?.list_action_configs(false)
    }

    fn upsert_action(&self, action: ActionConfig) -> Result<ActionConfig> {
        let store = self.store()?;
        store.upsert_action_config(&action)?;
        store
            .get_action_config(&action.action_key)?
            .ok_or_else(|| anyhow!("action vanished right after upsert"))
    }

    fn history(&self, user_id: &str, limit: usize, offset: usize) -> Result<Vec<XpEvent>> {
        self.store()?.xp_history(parse_user_id(user_id)?, limit, offset)
    }

    fn streak(&self, user_id: &str) -> Result<StreakSummary> {
        self.store()?.streak_summary(parse_user_id(user_id)?, now_utc())
    }

    fn today_contribution(&self, user_id: &str) -> Result<Value> {
        let store = self.store()?;
        let today = utc_day(now_utc());
        let contributed = store.today_contribution(parse_user_id(user_id)?, today)?;
        Ok(json!({
            "contribution_date": format_date(today).map_err(|err| anyhow!(err.to_string()))?,
            "xp_contributed": contributed,
        }))
    }

    fn leaderboard(
        &self,
        season: Option<u32>,
        country: Option<&str>,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>> {
        self.store()?.leaderboard(season, country, limit)
    }

    fn country_stats(&self, country: &str, season: Option<u32>) -> Result<CountryStats> {
        self.store()?
            .country_stats(country, season)?
            .ok_or_else(|| anyhow!("no stats recorded for country {country}"))
    }

    fn set_country_buffer(&self, country: &str, value: Option<f64>) -> Result<CountryStats> {
        let mut store = self.store()?;
        match value {
            Some(factor) => store.set_country_buffer_factor(country, factor)?,
            None => store.clear_country_buffer_factor(country)?,
        }
        store
            .country_stats(country, None)?
            .ok_or_else(|| anyhow!("no stats recorded for country {country}"))
    }

    fn set_global_buffer(&self, value: f64) -> Result<Value> {
        let mut store = self.store()?;
        store.set_global_buffer_factor(value)?;
        Ok(json!({ "global_buffer_factor": value }))
    }

    fn refresh_active_users(&self, window_days: u32) -> Result<Value> {
        let mut store = self.store()?;
        let refreshed = store.refresh_active_users(window_days, now_utc())?;
        Ok(json!({ "refreshed_countries": refreshed }))
    }

    fn start_season(&self) -> Result<Value> {
        let mut store = self.store()?;
        let season = store.start_season()?;
        Ok(json!({ "season": season }))
    }

    fn enqueue_job(&self, request: EnqueueRequest) -> Result<Job> {
        let options = EnqueueOptions {
            priority: request.priority.unwrap_or(0),
            dedupe_key: request.dedupe_key,
            max_attempts: request.max_attempts,
            delay_ms: request.delay_ms.unwrap_or(0),
        };
        self.queue()?.enqueue(
            &request.queue,
            &request.job_type,
            &request.payload.unwrap_or_else(|| json!({})),
            &options,
            now_utc(),
        )
    }

    fn job_depths(&self) -> Result<Vec<QueueDepths>> {
        self.queue()?.depths()
    }

    fn dead_jobs(&self, queue: Option<&str>, limit: usize) -> Result<Vec<DeadJob>> {
        self.queue()?.list_dead(queue, limit)
    }

    fn replay_dead(&self, job_id: &str) -> Result<Job> {
        let parsed = Ulid::from_string(job_id.trim())
            .with_context(|| format!("invalid ULID job_id: {job_id}"))?;
        self.queue()?.replay_dead(parsed, now_utc())
    }
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    let parsed =
        Ulid::from_string(raw.trim()).with_context(|| format!("invalid ULID user_id: {raw}"))?;
    Ok(UserId(parsed))
}

#[derive(Debug, Clone)]
struct ServiceState {
    api: RewardApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    write_conflict_total: AtomicU64,
    storage_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    write_conflict_total: u64,
    storage_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "not_found" => {
                self.not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "write_conflict" => {
                self.write_conflict_total.fetch_add(1, Ordering::Relaxed);
            }
            "storage_unavailable" => {
                self.storage_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            write_conflict_total: self.write_conflict_total.load(Ordering::Relaxed),
            storage_unavailable_total: self.storage_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({ "rejection": rejection.to_string() })),
        )
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();
        let diagnostic = format!("{err:#}");
        let normalized = diagnostic.to_ascii_lowercase();

        if normalized.contains("unknown user")
            || normalized.contains("unknown queue")
            || normalized.contains("no stats recorded")
            || normalized.contains("no replayable dead letter")
        {
            return Self::failure(StatusCode::NOT_FOUND, "not_found", message, None);
        }

        if normalized.contains("unique constraint failed")
            || normalized.contains("foreign key constraint failed")
            || normalized.contains("append-only")
        {
            return Self::failure(StatusCode::CONFLICT, "write_conflict", message, None);
        }

        if normalized.contains("validation")
            || normalized.contains("invalid")
            || normalized.contains("must be")
            || normalized.contains("must not")
        {
            return Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None);
        }

        if normalized.contains("sqlite") || normalized.contains("database") {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(RewardApi) -> Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateUserRequest {
    display_name: String,
    country_code: String,
    tier: Tier,
}

#[derive(Debug, Clone, Deserialize)]
struct ActivityLogRequest {
    user_id: String,
    source: ActivitySource,
    occurred_at: Option<String>,
    metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct AwardHttpRequest {
    user_id: String,
    action_key: String,
    idempotency_key: Option<String>,
    metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct LeaderboardQuery {
    season: Option<u32>,
    country: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct SeasonQuery {
    season: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct CountryBufferRequest {
    country_code: String,
    /// `null` clears the override so the country inherits the global value.
    buffer_factor: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct GlobalBufferRequest {
    buffer_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct RefreshActiveRequest {
    window_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct EnqueueRequest {
    queue: String,
    job_type: String,
    payload: Option<Value>,
    priority: Option<i64>,
    dedupe_key: Option<String>,
    max_attempts: Option<u32>,
    delay_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeadJobsQuery {
    queue: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Parser)]
#[command(name = "grit-ledger-service")]
#[command(about = "Local HTTP service for the GritLedger reward system")]
struct Args {
    #[arg(long, default_value = "./grit_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/users", post(users_create))
        .route("/v1/users/:user_id/history", get(users_history))
        .route("/v1/users/:user_id/streak", get(users_streak))
        .route("/v1/users/:user_id/contribution", get(users_contribution))
        .route("/v1/activity", post(activity_log))
        .route("/v1/xp/award", post(xp_award))
        .route("/v1/xp/actions", get(xp_actions).post(xp_actions_upsert))
        .route("/v1/leaderboard", get(leaderboard_show))
        .route("/v1/countries/:country_code", get(country_show))
        .route("/v1/admin/country-buffer", post(admin_country_buffer))
        .route("/v1/admin/global-buffer", post(admin_global_buffer))
        .route("/v1/admin/active-users/refresh", post(admin_refresh_active))
        .route("/v1/admin/season/start", post(admin_season_start))
        .route("/v1/jobs", post(jobs_enqueue))
        .route("/v1/jobs/depths", get(jobs_depths))
        .route("/v1/jobs/dead", get(jobs_dead))
        .route("/v1/jobs/:job_id/replay", post(jobs_replay))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let api = RewardApi::new(args.db);
    api.migrate().context("startup migration failed")?;

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    tracing::info!(bind = %args.bind, "grit-ledger-service listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn users_create(
    State(state): State<ServiceState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<User>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let user = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "users_create",
            move |api| api.create_user(request),
        )
        .await?;
    Ok(Json(envelope(user)))
}

async fn users_history(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ServiceEnvelope<Vec<XpEvent>>>, ServiceFailure> {
    let events = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "users_history",
            move |api| {
                api.history(
                    &user_id,
                    query.limit.unwrap_or(20),
                    query.offset.unwrap_or(0),
                )
            },
        )
        .await?;
    Ok(Json(envelope(events)))
}

async fn users_streak(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<StreakSummary>>, ServiceFailure> {
    let summary = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "users_streak",
            move |api| api.streak(&user_id),
        )
        .await?;
    Ok(Json(envelope(summary)))
}

async fn users_contribution(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceFailure> {
    let contribution = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "users_contribution",
            move |api| api.today_contribution(&user_id),
        )
        .await?;
    Ok(Json(envelope(contribution)))
}

async fn activity_log(
    State(state): State<ServiceState>,
    payload: Result<Json<ActivityLogRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let result = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "activity_log",
            move |api| api.log_activity(request),
        )
        .await?;
    Ok(Json(envelope(result)))
}

async fn xp_award(
    State(state): State<ServiceState>,
    payload: Result<Json<AwardHttpRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AwardOutcome>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let outcome = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "xp_award",
            move |api| api.award(request),
        )
        .await?;
    Ok(Json(envelope(outcome)))
}

async fn xp_actions(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<ActionConfig>>>, ServiceFailure> {
    let actions = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "xp_actions",
            |api| api.actions(),
        )
        .await?;
    Ok(Json(envelope(actions)))
}

async fn xp_actions_upsert(
    State(state): State<ServiceState>,
    payload: Result<Json<ActionConfig>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ActionConfig>>, ServiceFailure> {
    let Json(action) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let stored = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "xp_actions_upsert",
            move |api| api.upsert_action(action),
        )
        .await?;
    Ok(Json(envelope(stored)))
}

async fn leaderboard_show(
    State(state): State<ServiceState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<ServiceEnvelope<Vec<LeaderboardEntry>>>, ServiceFailure> {
    let entries = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "leaderboard_show",
            move |api| {
                api.leaderboard(
                    query.season,
                    query.country.as_deref(),
                    query.limit.unwrap_or(10),
                )
            },
        )
        .await?;
    Ok(Json(envelope(entries)))
}

async fn country_show(
    State(state): State<ServiceState>,
    Path(country_code): Path<String>,
    Query(query): Query<SeasonQuery>,
) -> Result<Json<ServiceEnvelope<CountryStats>>, ServiceFailure> {
    let stats = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "country_show",
            move |api| api.country_stats(&country_code, query.season),
        )
        .await?;
    Ok(Json(envelope(stats)))
}

async fn admin_country_buffer(
    State(state): State<ServiceState>,
    payload: Result<Json<CountryBufferRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<CountryStats>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let stats = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "admin_country_buffer",
            move |api| api.set_country_buffer(&request.country_code, request.buffer_factor),
        )
        .await?;
    Ok(Json(envelope(stats)))
}

async fn admin_global_buffer(
    State(state): State<ServiceState>,
    payload: Result<Json<GlobalBufferRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let result = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "admin_global_buffer",
            move |api| api.set_global_buffer(request.buffer_factor),
        )
        .await?;
    Ok(Json(envelope(result)))
}

async fn admin_refresh_active(
    State(state): State<ServiceState>,
    payload: Result<Json<RefreshActiveRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let result = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "admin_refresh_active",
            move |api| api.refresh_active_users(request.window_days),
        )
        .await?;
    Ok(Json(envelope(result)))
}

async fn admin_season_start(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceFailure> {
    let result = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "admin_season_start",
            |api| api.start_season(),
        )
        .await?;
    Ok(Json(envelope(result)))
}

async fn jobs_enqueue(
    State(state): State<ServiceState>,
    payload: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Job>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let job = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "jobs_enqueue",
            move |api| api.enqueue_job(request),
        )
        .await?;
    Ok(Json(envelope(job)))
}

async fn jobs_depths(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<QueueDepths>>>, ServiceFailure> {
    let depths = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "jobs_depths",
            |api| api.job_depths(),
        )
        .await?;
    Ok(Json(envelope(depths)))
}

async fn jobs_dead(
    State(state): State<ServiceState>,
    Query(query): Query<DeadJobsQuery>,
) -> Result<Json<ServiceEnvelope<Vec<DeadJob>>>, ServiceFailure> {
    let dead = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "jobs_dead",
            move |api| api.dead_jobs(query.queue.as_deref(), query.limit.unwrap_or(20)),
        )
        .await?;
    Ok(Json(envelope(dead)))
}

async fn jobs_replay(
    State(state): State<ServiceState>,
    Path(job_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Job>>, ServiceFailure> {
    let job = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "jobs_replay",
            move |api| api.replay_dead(&job_id),
        )
        .await?;
    Ok(Json(envelope(job)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_unknown_user_to_not_found() {
        let err = anyhow!("unknown user 01J0SQQP7M70P6Y3R4T8D8G8M2");
        let failure =
            ServiceState::classify_api_error(&err, StatusCode::INTERNAL_SERVER_ERROR, "other");
        assert_eq!(failure.status, StatusCode::NOT_FOUND);
        assert_eq!(failure.code, "not_found");
    }

    #[test]
    fn classify_maps_constraint_violations_to_conflict() {
        let err = anyhow!("UNIQUE constraint failed: xp_events.idempotency_key");
        let failure =
            ServiceState::classify_api_error(&err, StatusCode::INTERNAL_SERVER_ERROR, "other");
        assert_eq!(failure.status, StatusCode::CONFLICT);
        assert_eq!(failure.code, "write_conflict");
    }

    #[test]
    fn classify_maps_validation_messages_to_bad_request() {
        let err = anyhow!("award validation failed: action_key MUST NOT be empty");
        let failure =
            ServiceState::classify_api_error(&err, StatusCode::INTERNAL_SERVER_ERROR, "other");
        assert_eq!(failure.status, StatusCode::BAD_REQUEST);
        assert_eq!(failure.code, "validation_error");
    }

    #[test]
    fn telemetry_counts_by_code() {
        let telemetry = ServiceTelemetry::default();
        telemetry.record_failure("validation_error", false);
        telemetry.record_failure("not_found", false);
        telemetry.record_failure("write_failed", true);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.requests_failure_total, 3);
        assert_eq!(snapshot.validation_error_total, 1);
        assert_eq!(snapshot.not_found_total, 1);
        assert_eq!(snapshot.timeout_total, 1);
        assert_eq!(snapshot.other_error_total, 1);
    }
}
