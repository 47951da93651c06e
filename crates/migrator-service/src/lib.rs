//! HTTP control surface for a live table migration.
//!
//! Build a [`ControlState`] around the application's own [`DualWritePool`] and mount
//! [`app`]; policy switches made over HTTP then steer the pool the application writes
//! through, and they are persisted next to the event log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use migrator_core::{
    format_rfc3339, now_utc, orient, DualWritePool, DualWriteTelemetrySnapshot, EventProducer,
    EventSource, RowEntity, ValidationMode, WritePolicy, DEFAULT_DIRECTION, REVERSED_DIRECTION,
};
use migrator_engine::{
    run_blocking, ConsumerConfig, Fixer, FixerConsumer, ValidationProgress,
    ValidationProgressSnapshot, ValidationReport, Validator, ValidatorConfig,
    DEFAULT_CALL_TIMEOUT,
};
use migrator_store_sqlite::SqliteEventBus;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const CODE_OK: i32 = 0;
const CODE_INVALID_ARGUMENT: i32 = 4;
const CODE_ALREADY_RUNNING: i32 = 5;
const CODE_NOT_RUNNING: i32 = 6;
const CODE_INTERNAL: i32 = 7;

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub table: String,
    pub call_timeout: Duration,
    /// Pause between incremental passes when a request does not name one.
    pub incremental_sleep: Duration,
    /// How long a stop request waits for the run to report before answering.
    pub stop_grace: Duration,
}

impl ControlOptions {
    #[must_use]
    pub fn for_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            incremental_sleep: Duration::from_secs(1),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

#[derive(Clone)]
pub struct ControlState {
    pool: DualWritePool,
    bus: Arc<SqliteEventBus>,
    options: Arc<ControlOptions>,
    validation: Arc<Mutex<ValidationSlot>>,
    telemetry: Arc<ControlTelemetry>,
}

#[derive(Default)]
struct ValidationSlot {
    next_run: u64,
    active: Option<ActiveRun>,
    last_report: Option<ValidationReport>,
}

/// Stays in the slot until its task has exited, even after a stop request times out.
struct ActiveRun {
    id: u64,
    mode: ValidationMode,
    direction: String,
    started_at: String,
    stop: watch::Sender<bool>,
    progress: Arc<ValidationProgress>,
    finished: watch::Receiver<Option<ValidationReport>>,
    handle: JoinHandle<()>,
}

impl ActiveRun {
    fn running(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[derive(Debug, Clone, Serialize)]
struct Envelope<T>
where
    T: Serialize,
{
    code: i32,
    msg: String,
    data: T,
}

#[derive(Debug, Clone)]
struct ControlFailure {
    status: StatusCode,
    code: i32,
    message: String,
}

type Reply<T> = Result<Json<Envelope<T>>, ControlFailure>;

#[derive(Debug, Clone, Deserialize)]
struct PolicyRequest {
    policy: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FullValidationRequest {
    batch_size: Option<usize>,
    sleep_interval_ms: Option<u64>,
    direction: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct IncrementalValidationRequest {
    watermark: i64,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    sleep_interval_ms: Option<u64>,
    #[serde(default)]
    direction: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    table: String,
    topic: String,
    policy: Option<&'static str>,
    timeout_ms: u64,
    telemetry: ControlTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct PolicyResponse {
    policy: &'static str,
    code: u8,
}

#[derive(Debug, Clone, Serialize)]
struct PolicyChange {
    previous: Option<&'static str>,
    policy: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ValidationStarted {
    table: String,
    mode: &'static str,
    direction: String,
    started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_watermark: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
struct ProgressResponse {
    running: bool,
    mode: Option<&'static str>,
    direction: Option<String>,
    started_at: Option<String>,
    progress: Option<ValidationProgressSnapshot>,
    last_report: Option<ValidationReport>,
}

#[derive(Debug, Clone, Serialize)]
struct DualWriteStats {
    policy: Option<&'static str>,
    telemetry: DualWriteTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ControlTelemetry {
    requests_total: AtomicU64,
    requests_failure_total: AtomicU64,
    invalid_argument_total: AtomicU64,
    conflict_total: AtomicU64,
    internal_error_total: AtomicU64,
    validations_started_total: AtomicU64,
    policy_changes_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ControlTelemetrySnapshot {
    requests_total: u64,
    requests_failure_total: u64,
    invalid_argument_total: u64,
    conflict_total: u64,
    internal_error_total: u64,
    validations_started_total: u64,
    policy_changes_total: u64,
}

impl IntoResponse for ControlFailure {
    fn into_response(self) -> Response {
        let payload = Envelope { code: self.code, msg: self.message, data: serde_json::Value::Null };
        (self.status, Json(payload)).into_response()
    }
}

fn envelope<T>(data: T) -> Json<Envelope<T>>
where
    T: Serialize,
{
    Json(Envelope { code: CODE_OK, msg: "ok".to_string(), data })
}

fn lock(slot: &Mutex<ValidationSlot>) -> MutexGuard<'_, ValidationSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ControlState {
    /// Wraps the caller's pool and restores the write policy persisted for the bus topic.
    /// When nothing has been persisted yet the pool's current policy is saved instead.
    ///
    /// # Errors
    /// Returns an error when the persisted policy cannot be read or saved, or when the pool
    /// holds an unmapped policy code and nothing is persisted.
    pub fn new(
        pool: DualWritePool,
        bus: Arc<SqliteEventBus>,
        options: ControlOptions,
    ) -> Result<Self> {
        match bus.load_policy_code()? {
            Some(code) => {
                pool.policy_cell().store_code(code);
                match WritePolicy::from_code(code) {
                    Some(policy) => {
                        info!(topic = %bus.topic(), policy = policy.as_str(), "write policy restored");
                    }
                    None => warn!(topic = %bus.topic(), code, "persisted write policy code is unknown"),
                }
            }
            None => bus.save_policy_code(pool.policy()?.code())?,
        }

        Ok(Self {
            pool,
            bus,
            options: Arc::new(options),
            validation: Arc::new(Mutex::new(ValidationSlot::default())),
            telemetry: Arc::new(ControlTelemetry::default()),
        })
    }

    /// The pool steered by this surface; clones share its policy and telemetry.
    #[must_use]
    pub fn pool(&self) -> &DualWritePool {
        &self.pool
    }

    fn failure(&self, status: StatusCode, code: i32, message: impl Into<String>) -> ControlFailure {
        self.telemetry.record_failure(code);
        let message = message.into();
        warn!(code, status = status.as_u16(), message = %message, "control request failed");
        ControlFailure { status, code, message }
    }

    fn invalid_argument(&self, message: impl Into<String>) -> ControlFailure {
        self.failure(StatusCode::BAD_REQUEST, CODE_INVALID_ARGUMENT, message)
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ControlFailure {
        self.invalid_argument(rejection.body_text())
    }

    fn internal(&self, message: impl Into<String>) -> ControlFailure {
        self.failure(StatusCode::INTERNAL_SERVER_ERROR, CODE_INTERNAL, message)
    }

    fn current_policy(&self) -> Option<&'static str> {
        self.pool.policy().ok().map(WritePolicy::as_str)
    }

    fn validator_config(
        &self,
        batch_size: Option<usize>,
        sleep_interval: Duration,
        direction: Option<String>,
    ) -> ValidatorConfig {
        let mut config = ValidatorConfig::for_table(self.options.table.as_str());
        config.call_timeout = self.options.call_timeout;
        config.sleep_interval = sleep_interval;
        if let Some(batch_size) = batch_size {
            config.batch_size = batch_size;
        }
        if let Some(direction) = direction {
            config.direction = direction;
        }
        config
    }

    fn start_validation(&self, config: ValidatorConfig) -> Reply<ValidationStarted> {
        let mode = config.mode;
        let start_watermark = config.start_watermark;
        let direction = config.direction.clone();
        let (base, target) = orient(&direction, &self.pool.base(), &self.pool.target())
            .map_err(|err| self.invalid_argument(err.to_string()))?;
        let validator = Validator::<RowEntity>::new(
            base,
            target,
            Arc::clone(&self.bus) as Arc<dyn EventProducer>,
            config,
        )
        .map_err(|err| self.invalid_argument(format!("{err:#}")))?;
        let started_at = format_rfc3339(now_utc()).map_err(|err| self.internal(err.to_string()))?;

        let mut slot = lock(&self.validation);
        if slot.active.as_ref().is_some_and(ActiveRun::running) {
            return Err(self.failure(
                StatusCode::CONFLICT,
                CODE_ALREADY_RUNNING,
                "a validation run is already in progress",
            ));
        }

        slot.next_run += 1;
        let id = slot.next_run;
        let (stop, cancel) = watch::channel(false);
        let (report_tx, finished) = watch::channel(None);
        let progress = validator.progress();
        let shared = Arc::clone(&self.validation);
        let handle = tokio::spawn(async move {
            let report = validator.validate(cancel).await;
            lock(&shared).last_report = Some(report.clone());
            report_tx.send_replace(Some(report));
        });
        slot.active = Some(ActiveRun {
            id,
            mode,
            direction: direction.clone(),
            started_at: started_at.clone(),
            stop,
            progress,
            finished,
            handle,
        });
        drop(slot);

        self.telemetry.validations_started_total.fetch_add(1, Ordering::Relaxed);
        info!(
            table = %self.options.table,
            run = id,
            mode = mode.as_str(),
            direction = %direction,
            start_watermark,
            "validation run started"
        );
        Ok(envelope(ValidationStarted {
            table: self.options.table.clone(),
            mode: mode.as_str(),
            direction,
            started_at,
            start_watermark: (mode == ValidationMode::Incremental).then_some(start_watermark),
        }))
    }

    /// Signals the in-flight run to stop and waits up to the stop grace for its report.
    ///
    /// Returns `Ok(None)` when nothing is running. A run that outlives the grace stays
    /// registered, so no second run can start until it has exited.
    ///
    /// # Errors
    /// Returns an error when the run does not stop within the grace or exits without a
    /// report.
    pub async fn stop_active_run(&self) -> Result<Option<ValidationReport>> {
        let signalled = {
            let slot = lock(&self.validation);
            slot.active.as_ref().filter(|run| run.running()).map(|run| {
                run.stop.send_replace(true);
                (run.id, run.finished.clone())
            })
        };
        let Some((id, mut finished)) = signalled else {
            return Ok(None);
        };

        let grace = self.options.stop_grace;
        let report = match tokio::time::timeout(grace, finished.wait_for(Option::is_some)).await {
            Ok(Ok(report)) => report.clone(),
            Ok(Err(_)) => None,
            Err(_) => {
                return Err(anyhow!(
                    "validation run {id} did not stop within {}ms; it stays registered until it exits",
                    grace.as_millis()
                ))
            }
        };

        self.retire_run(id);
        report
            .map(Some)
            .ok_or_else(|| anyhow!("validation run {id} exited without a report"))
    }

    fn retire_run(&self, id: u64) {
        let mut slot = lock(&self.validation);
        if slot.active.as_ref().is_some_and(|run| run.id == id) {
            slot.active = None;
        }
    }
}

impl ControlTelemetry {
    fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, code: i32) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        let counter = match code {
            CODE_INVALID_ARGUMENT => &self.invalid_argument_total,
            CODE_ALREADY_RUNNING | CODE_NOT_RUNNING => &self.conflict_total,
            _ => &self.internal_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ControlTelemetrySnapshot {
        ControlTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            invalid_argument_total: self.invalid_argument_total.load(Ordering::Relaxed),
            conflict_total: self.conflict_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            validations_started_total: self.validations_started_total.load(Ordering::Relaxed),
            policy_changes_total: self.policy_changes_total.load(Ordering::Relaxed),
        }
    }
}

#[must_use]
pub fn app(state: ControlState) -> Router {
    Router::new()
        .route("/migrator/health", get(health))
        .route("/migrator/policy", get(get_policy).post(set_policy))
        .route("/migrator/validation/full", post(start_full_validation))
        .route("/migrator/validation/incremental", post(start_incremental_validation))
        .route("/migrator/validation/stop", post(stop_validation))
        .route("/migrator/validation/progress", get(validation_progress))
        .route("/migrator/dual-write/stats", get(dual_write_stats))
        .with_state(state)
}

/// One fixer consumer per direction over the pool's stores. The reversed consumer is
/// named `<consumer>-dst` so each keeps its own offset.
///
/// # Errors
/// Returns an error when the table's columns cannot be introspected.
pub async fn fixer_consumers(
    pool: &DualWritePool,
    bus: &Arc<SqliteEventBus>,
    table: &str,
    consumer: &str,
    call_timeout: Duration,
) -> Result<Vec<FixerConsumer>> {
    let mut consumers = Vec::with_capacity(2);
    for direction in [DEFAULT_DIRECTION, REVERSED_DIRECTION] {
        let (base, target) = orient(direction, &pool.base(), &pool.target())?;
        let fixer = Fixer::new(base, target, table, call_timeout).await?;
        let name = if direction == DEFAULT_DIRECTION {
            consumer.to_string()
        } else {
            format!("{consumer}-{direction}")
        };
        consumers.push(FixerConsumer::new(
            fixer,
            Arc::clone(bus) as Arc<dyn EventSource>,
            ConsumerConfig {
                consumer: name,
                direction: direction.to_string(),
                call_timeout,
                ..ConsumerConfig::default()
            },
        ));
    }
    Ok(consumers)
}

async fn health(State(state): State<ControlState>) -> Json<Envelope<HealthResponse>> {
    state.telemetry.record_request();
    let timeout_ms = u64::try_from(state.options.call_timeout.as_millis()).unwrap_or(u64::MAX);
    envelope(HealthResponse {
        status: "ok",
        table: state.options.table.clone(),
        topic: state.bus.topic().to_string(),
        policy: state.current_policy(),
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn get_policy(State(state): State<ControlState>) -> Reply<PolicyResponse> {
    state.telemetry.record_request();
    let policy = state.pool.policy().map_err(|err| state.internal(err.to_string()))?;
    Ok(envelope(PolicyResponse { policy: policy.as_str(), code: policy.code() }))
}

async fn set_policy(
    State(state): State<ControlState>,
    payload: Result<Json<PolicyRequest>, JsonRejection>,
) -> Reply<PolicyChange> {
    state.telemetry.record_request();
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let policy = request
        .policy
        .parse::<WritePolicy>()
        .map_err(|err| state.invalid_argument(err.to_string()))?;

    // Persist first: a switch that would not survive a restart is not applied.
    let bus = Arc::clone(&state.bus);
    run_blocking(state.options.call_timeout, "persist_policy", move || {
        bus.save_policy_code(policy.code())
    })
    .await
    .map_err(|err| state.internal(format!("{err:#}")))?;

    let previous = state.current_policy();
    state.pool.set_policy(policy);
    state.telemetry.policy_changes_total.fetch_add(1, Ordering::Relaxed);
    Ok(envelope(PolicyChange { previous, policy: policy.as_str() }))
}

async fn start_full_validation(
    State(state): State<ControlState>,
    payload: Result<Json<FullValidationRequest>, JsonRejection>,
) -> Reply<ValidationStarted> {
    state.telemetry.record_request();
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let sleep = request.sleep_interval_ms.map_or(Duration::ZERO, Duration::from_millis);
    state.start_validation(state.validator_config(request.batch_size, sleep, request.direction))
}

async fn start_incremental_validation(
    State(state): State<ControlState>,
    payload: Result<Json<IncrementalValidationRequest>, JsonRejection>,
) -> Reply<ValidationStarted> {
    state.telemetry.record_request();
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let sleep =
        request.sleep_interval_ms.map_or(state.options.incremental_sleep, Duration::from_millis);
    let config = state
        .validator_config(request.batch_size, sleep, request.direction)
        .incremental(request.watermark);
    state.start_validation(config)
}

async fn stop_validation(State(state): State<ControlState>) -> Reply<ValidationReport> {
    state.telemetry.record_request();
    match state.stop_active_run().await {
        Ok(Some(report)) => {
            info!(table = %state.options.table, "validation run stopped on request");
            Ok(envelope(report))
        }
        Ok(None) => Err(state.failure(
            StatusCode::CONFLICT,
            CODE_NOT_RUNNING,
            "no validation run is in progress",
        )),
        Err(err) => Err(state.internal(format!("{err:#}"))),
    }
}

async fn validation_progress(State(state): State<ControlState>) -> Json<Envelope<ProgressResponse>> {
    state.telemetry.record_request();
    let slot = lock(&state.validation);
    let response = match &slot.active {
        Some(run) => ProgressResponse {
            running: run.running(),
            mode: Some(run.mode.as_str()),
            direction: Some(run.direction.clone()),
            started_at: Some(run.started_at.clone()),
            progress: Some(run.progress.snapshot()),
            last_report: slot.last_report.clone(),
        },
        None => ProgressResponse {
            running: false,
            mode: None,
            direction: None,
            started_at: None,
            progress: None,
            last_report: slot.last_report.clone(),
        },
    };
    drop(slot);
    envelope(response)
}

async fn dual_write_stats(State(state): State<ControlState>) -> Json<Envelope<DualWriteStats>> {
    state.telemetry.record_request();
    envelope(DualWriteStats { policy: state.current_policy(), telemetry: state.pool.telemetry() })
}
