//! Async validation and repair for a table under live migration.
//!
//! Stores are synchronous, so every store or bus call from this crate goes through
//! [`run_blocking`], which bounds it with a per-call timeout.

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use migrator_core::{
    validate_identifier, Entity, EventProducer, EventSource, InconsistencyEvent,
    InconsistencyKind, MigratorError, Row, SqlValue, Store, ValidationMode, ValidatorCursor,
    DEFAULT_DIRECTION, DEFAULT_UPDATE_TIME_COLUMN, ID_COLUMN,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_CONSUMER: &str = "migrator-fixer";
pub const DEFAULT_MAX_FIX_ATTEMPTS: u32 = 5;

/// Ids per bulk `IN (...)` lookup, far below SQLite's bound-parameter limit.
const BULK_LOOKUP_CHUNK: usize = 500;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Runs a blocking store call on the blocking pool, bounded by `timeout`.
///
/// The blocking call itself is not interrupted on timeout; its result is discarded.
///
/// # Errors
/// Returns [`MigratorError::Timeout`] (inside `anyhow::Error`) when the deadline passes, a
/// join error when the call panics, and otherwise whatever `op` returns.
pub async fn run_blocking<T, F>(timeout: Duration, label: &'static str, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(op);
    let joined = tokio::time::timeout(timeout, handle).await.map_err(|_| {
        anyhow::Error::new(MigratorError::Timeout {
            operation: label.to_string(),
            timeout_ms: millis(timeout),
        })
    })?;

    joined.map_err(|err| anyhow!("{label} join failure: {err}"))?
}

fn cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Sleeps for `duration` unless cancellation arrives first. Returns `true` when cancelled.
async fn pause(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if *cancel.borrow_and_update() {
            return true;
        }
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => return cancelled(cancel),
            changed = cancel.changed() => {
                if changed.is_err() {
                    // Sender gone: nobody can cancel any more.
                    tokio::time::sleep_until(deadline).await;
                    return cancelled(cancel);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidatorConfig {
    pub table: String,
    pub update_time_column: String,
    pub direction: String,
    pub batch_size: usize,
    /// Pause between passes. Zero ends the run after one pass; otherwise base→target resumes
    /// from its cursor (full mode then picks up newly inserted ids).
    pub sleep_interval: Duration,
    pub call_timeout: Duration,
    pub error_backoff: Duration,
    pub max_consecutive_errors: u32,
    pub backpressure_poll: Duration,
    pub mode: ValidationMode,
    pub start_watermark: i64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            table: String::new(),
            update_time_column: DEFAULT_UPDATE_TIME_COLUMN.to_string(),
            direction: DEFAULT_DIRECTION.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            sleep_interval: Duration::ZERO,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            error_backoff: Duration::from_millis(200),
            max_consecutive_errors: 5,
            backpressure_poll: Duration::from_millis(100),
            mode: ValidationMode::Full,
            start_watermark: 0,
        }
    }
}

impl ValidatorConfig {
    #[must_use]
    pub fn for_table(table: impl Into<String>) -> Self {
        Self { table: table.into(), ..Self::default() }
    }

    #[must_use]
    pub fn incremental(mut self, watermark: i64) -> Self {
        self.mode = ValidationMode::Incremental;
        self.start_watermark = watermark;
        self
    }

    /// # Errors
    /// Rejects non-identifier table/column names and a zero batch size.
    pub fn validate(&self) -> Result<(), MigratorError> {
        validate_identifier(&self.table)?;
        validate_identifier(&self.update_time_column)?;
        if self.batch_size == 0 {
            return Err(MigratorError::Validation("batch_size MUST be > 0".to_string()));
        }
        if self.max_consecutive_errors == 0 {
            return Err(MigratorError::Validation(
                "max_consecutive_errors MUST be > 0".to_string(),
            ));
        }
        if self.direction.trim().is_empty() {
            return Err(MigratorError::Validation("direction MUST be non-empty".to_string()));
        }
        Ok(())
    }

    fn limit(&self) -> SqlValue {
        SqlValue::from(i64::try_from(self.batch_size).unwrap_or(i64::MAX))
    }
}

#[derive(Debug)]
pub struct ValidationProgress {
    base_scanned: AtomicU64,
    target_scanned: AtomicU64,
    events_emitted: AtomicU64,
    lookup_errors: AtomicU64,
    publish_errors: AtomicU64,
    watermark: AtomicI64,
}

impl Default for ValidationProgress {
    fn default() -> Self {
        Self {
            base_scanned: AtomicU64::new(0),
            target_scanned: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            lookup_errors: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            watermark: AtomicI64::new(i64::MIN),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationProgressSnapshot {
    pub base_scanned: u64,
    pub target_scanned: u64,
    pub events_emitted: u64,
    pub lookup_errors: u64,
    pub publish_errors: u64,
    /// Highest update time validated so far; `None` before any incremental progress.
    pub watermark: Option<i64>,
}

impl ValidationProgress {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn record_watermark(&self, watermark: i64) {
        self.watermark.fetch_max(watermark, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ValidationProgressSnapshot {
        let watermark = self.watermark.load(Ordering::Relaxed);
        ValidationProgressSnapshot {
            base_scanned: self.base_scanned.load(Ordering::Relaxed),
            target_scanned: self.target_scanned.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            lookup_errors: self.lookup_errors.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            watermark: (watermark != i64::MIN).then_some(watermark),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DirectionOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub base_to_target: DirectionOutcome,
    pub target_to_base: DirectionOutcome,
    pub progress: ValidationProgressSnapshot,
}

/// Compares base and target in both directions and publishes one event per divergence.
pub struct Validator<E: Entity> {
    base: Arc<dyn Store>,
    target: Arc<dyn Store>,
    producer: Arc<dyn EventProducer>,
    config: Arc<ValidatorConfig>,
    high_load: Arc<AtomicBool>,
    progress: Arc<ValidationProgress>,
    lookup_sql: Arc<str>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Validator<E> {
    fn clone(&self) -> Self {
        Self {
            base: Arc::clone(&self.base),
            target: Arc::clone(&self.target),
            producer: Arc::clone(&self.producer),
            config: Arc::clone(&self.config),
            high_load: Arc::clone(&self.high_load),
            progress: Arc::clone(&self.progress),
            lookup_sql: Arc::clone(&self.lookup_sql),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Validator<E> {
    /// # Errors
    /// Returns an error when `config` is invalid.
    pub fn new(
        base: Arc<dyn Store>,
        target: Arc<dyn Store>,
        producer: Arc<dyn EventProducer>,
        config: ValidatorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let lookup_sql: Arc<str> =
            format!("SELECT * FROM {} WHERE {ID_COLUMN} = ?1", config.table).into();
        Ok(Self {
            base,
            target,
            producer,
            config: Arc::new(config),
            high_load: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(ValidationProgress::default()),
            lookup_sql,
            _entity: PhantomData,
        })
    }

    /// Shares an externally owned load flag; while it is set base→target pauses.
    #[must_use]
    pub fn with_high_load(mut self, flag: Arc<AtomicBool>) -> Self {
        self.high_load = flag;
        self
    }

    #[must_use]
    pub fn progress(&self) -> Arc<ValidationProgress> {
        Arc::clone(&self.progress)
    }

    #[must_use]
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Runs both directions as sibling tasks and waits for both.
    pub async fn validate(&self, cancel: watch::Receiver<bool>) -> ValidationReport {
        if self.config.mode == ValidationMode::Incremental {
            self.progress.record_watermark(self.config.start_watermark);
        }
        info!(
            table = %self.config.table,
            mode = self.config.mode.as_str(),
            direction = %self.config.direction,
            start_watermark = self.config.start_watermark,
            "validation started"
        );

        let forward = {
            let validator = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { validator.base_to_target(cancel).await })
        };
        let backward = {
            let validator = self.clone();
            tokio::spawn(async move { validator.target_to_base(cancel).await })
        };

        let base_to_target = joined_outcome("base_to_target", forward.await);
        let target_to_base = joined_outcome("target_to_base", backward.await);
        let progress = self.progress.snapshot();

        info!(
            table = %self.config.table,
            base_to_target = ?base_to_target,
            target_to_base = ?target_to_base,
            events_emitted = progress.events_emitted,
            "validation finished"
        );
        ValidationReport { base_to_target, target_to_base, progress }
    }

    fn start_cursor(&self) -> ValidatorCursor {
        match self.config.mode {
            ValidationMode::Full => ValidatorCursor::full(),
            ValidationMode::Incremental => ValidatorCursor::incremental(self.config.start_watermark),
        }
    }

    fn page_query(&self, cursor: &ValidatorCursor) -> (String, Vec<SqlValue>) {
        let table = &self.config.table;
        let utime = &self.config.update_time_column;
        let limit = self.config.limit();
        match (cursor.mode, cursor.last_id) {
            (ValidationMode::Full, last_id) => (
                format!("SELECT * FROM {table} WHERE {ID_COLUMN} > ?1 ORDER BY {ID_COLUMN} ASC LIMIT ?2"),
                vec![SqlValue::from(last_id.unwrap_or(i64::MIN)), limit],
            ),
            (ValidationMode::Incremental, None) => (
                format!(
                    "SELECT * FROM {table} WHERE {utime} >= ?1 \
                     ORDER BY {utime} ASC, {ID_COLUMN} ASC LIMIT ?2"
                ),
                vec![SqlValue::from(cursor.watermark), limit],
            ),
            (ValidationMode::Incremental, Some(last_id)) => (
                format!(
                    "SELECT * FROM {table} WHERE {utime} > ?1 OR ({utime} = ?1 AND {ID_COLUMN} > ?2) \
                     ORDER BY {utime} ASC, {ID_COLUMN} ASC LIMIT ?3"
                ),
                vec![SqlValue::from(cursor.watermark), SqlValue::from(last_id), limit],
            ),
        }
    }

    fn cursor_key(&self, row: &Row) -> Result<(i64, i64), MigratorError> {
        let id = row.id()?;
        let update_time = match self.config.mode {
            ValidationMode::Full => 0,
            ValidationMode::Incremental => row.get_i64(&self.config.update_time_column)?,
        };
        Ok((update_time, id))
    }

    async fn base_to_target(&self, mut cancel: watch::Receiver<bool>) -> DirectionOutcome {
        let mut cursor = self.start_cursor();
        let mut consecutive_errors = 0_u32;

        loop {
            if cancelled(&cancel) {
                return DirectionOutcome::Cancelled;
            }
            while self.high_load.load(Ordering::Acquire) {
                if pause(self.config.backpressure_poll, &mut cancel).await {
                    return DirectionOutcome::Cancelled;
                }
            }

            let (sql, params) = self.page_query(&cursor);
            let base = Arc::clone(&self.base);
            let page =
                run_blocking(self.config.call_timeout, "base_page", move || base.query(&sql, &params))
                    .await;

            let page = match page {
                Ok(page) => {
                    consecutive_errors = 0;
                    page
                }
                Err(err) => {
                    consecutive_errors += 1;
                    warn!(
                        table = %self.config.table,
                        consecutive_errors,
                        error = %format!("{err:#}"),
                        "base page read failed"
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        return DirectionOutcome::Failed(format!("{err:#}"));
                    }
                    if pause(self.config.error_backoff, &mut cancel).await {
                        return DirectionOutcome::Cancelled;
                    }
                    continue;
                }
            };

            let exhausted = page.len() < self.config.batch_size;
            for row in &page {
                if cancelled(&cancel) {
                    return DirectionOutcome::Cancelled;
                }
                let (update_time, id) = match self.cursor_key(row) {
                    Ok(key) => key,
                    Err(err) => return DirectionOutcome::Failed(err.to_string()),
                };
                self.check_base_row(row, &cancel).await;
                cursor.advance(update_time, id);
                ValidationProgress::bump(&self.progress.base_scanned, 1);
                if cursor.mode == ValidationMode::Incremental {
                    self.progress.record_watermark(cursor.watermark);
                }
            }

            if exhausted {
                if self.config.sleep_interval.is_zero() {
                    return DirectionOutcome::Completed;
                }
                debug!(
                    mode = cursor.mode.as_str(),
                    watermark = cursor.watermark,
                    last_id = cursor.last_id,
                    "pass complete; sleeping"
                );
                if pause(self.config.sleep_interval, &mut cancel).await {
                    return DirectionOutcome::Cancelled;
                }
            }
        }
    }

    async fn check_base_row(&self, row: &Row, cancel: &watch::Receiver<bool>) {
        let base_entity = match E::from_row(row) {
            Ok(entity) => entity,
            Err(err) => {
                self.lookup_failed(None, &anyhow::Error::new(err));
                return;
            }
        };
        let id = base_entity.id();

        let target = Arc::clone(&self.target);
        let sql = Arc::clone(&self.lookup_sql);
        let lookup = run_blocking(self.config.call_timeout, "target_lookup", move || {
            target.query_row(&sql, &[SqlValue::from(id)])
        })
        .await;

        let kind = match lookup {
            Ok(Some(target_row)) => match E::from_row(&target_row) {
                Ok(target_entity) if base_entity.compare_to(&target_entity) => None,
                Ok(_) => Some(InconsistencyKind::NotEqual),
                Err(err) => {
                    self.lookup_failed(Some(id), &anyhow::Error::new(err));
                    return;
                }
            },
            Ok(None) => Some(InconsistencyKind::TargetMissing),
            Err(err) => {
                self.lookup_failed(Some(id), &err);
                return;
            }
        };

        // A lookup can outlive a stop request; nothing is published after it.
        if let Some(kind) = kind {
            if !cancelled(cancel) {
                self.publish(id, kind).await;
            }
        }
    }

    fn lookup_failed(&self, record_id: Option<i64>, err: &anyhow::Error) {
        ValidationProgress::bump(&self.progress.lookup_errors, 1);
        warn!(
            table = %self.config.table,
            record_id,
            error = %format!("{err:#}"),
            "record lookup failed; skipping"
        );
    }

    async fn target_to_base(&self, mut cancel: watch::Receiver<bool>) -> DirectionOutcome {
        let table = &self.config.table;
        let page_sql: Arc<str> = format!(
            "SELECT {ID_COLUMN} FROM {table} WHERE {ID_COLUMN} > ?1 ORDER BY {ID_COLUMN} ASC LIMIT ?2"
        )
        .into();
        let mut last_id = i64::MIN;
        let mut consecutive_errors = 0_u32;

        loop {
            if cancelled(&cancel) {
                return DirectionOutcome::Cancelled;
            }

            let target = Arc::clone(&self.target);
            let sql = Arc::clone(&page_sql);
            let params = vec![SqlValue::from(last_id), self.config.limit()];
            let page = run_blocking(self.config.call_timeout, "target_id_page", move || {
                target
                    .query(&sql, &params)?
                    .iter()
                    .map(|row| row.id().map_err(anyhow::Error::new))
                    .collect::<Result<Vec<i64>>>()
            })
            .await;

            let ids = match page {
                Ok(ids) => {
                    consecutive_errors = 0;
                    ids
                }
                Err(err) => {
                    consecutive_errors += 1;
                    warn!(
                        table = %table,
                        consecutive_errors,
                        error = %format!("{err:#}"),
                        "target id page read failed"
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        return DirectionOutcome::Failed(format!("{err:#}"));
                    }
                    if pause(self.config.error_backoff, &mut cancel).await {
                        return DirectionOutcome::Cancelled;
                    }
                    continue;
                }
            };

            if !ids.is_empty() {
                self.report_base_missing(&ids, &cancel).await;
                ValidationProgress::bump(
                    &self.progress.target_scanned,
                    u64::try_from(ids.len()).unwrap_or(u64::MAX),
                );
            }
            if let Some(last) = ids.last() {
                last_id = *last;
            }

            if ids.len() < self.config.batch_size {
                if self.config.sleep_interval.is_zero() {
                    return DirectionOutcome::Completed;
                }
                // Deletions can land anywhere, so every pass rescans all target ids.
                if pause(self.config.sleep_interval, &mut cancel).await {
                    return DirectionOutcome::Cancelled;
                }
                last_id = i64::MIN;
            }
        }
    }

    async fn report_base_missing(&self, ids: &[i64], cancel: &watch::Receiver<bool>) {
        for chunk in ids.chunks(BULK_LOOKUP_CHUNK) {
            if cancelled(cancel) {
                return;
            }
            let present = match self.base_ids_present(chunk).await {
                Ok(present) => present,
                Err(err) => {
                    ValidationProgress::bump(&self.progress.lookup_errors, 1);
                    warn!(
                        table = %self.config.table,
                        chunk = chunk.len(),
                        first_id = chunk.first().copied(),
                        error = %format!("{err:#}"),
                        "base bulk lookup failed; skipping chunk"
                    );
                    continue;
                }
            };

            for id in chunk.iter().filter(|id| !present.contains(*id)) {
                if cancelled(cancel) {
                    return;
                }
                self.publish(*id, InconsistencyKind::BaseMissing).await;
            }
        }
    }

    async fn base_ids_present(&self, ids: &[i64]) -> Result<BTreeSet<i64>> {
        let placeholders = (1..=ids.len()).map(|index| format!("?{index}")).collect::<Vec<_>>();
        let sql = format!(
            "SELECT {ID_COLUMN} FROM {} WHERE {ID_COLUMN} IN ({})",
            self.config.table,
            placeholders.join(", ")
        );
        let params: Vec<SqlValue> = ids.iter().copied().map(SqlValue::from).collect();
        let base = Arc::clone(&self.base);
        run_blocking(self.config.call_timeout, "base_bulk_lookup", move || {
            base.query(&sql, &params)?
                .iter()
                .map(|row| row.id().map_err(anyhow::Error::new))
                .collect::<Result<BTreeSet<i64>>>()
        })
        .await
    }

    async fn publish(&self, record_id: i64, kind: InconsistencyKind) {
        let event = InconsistencyEvent::new(record_id, self.config.direction.clone(), kind);
        let producer = Arc::clone(&self.producer);
        let result = run_blocking(self.config.call_timeout, "publish_event", move || {
            producer.produce(&event)
        })
        .await;

        match result {
            Ok(()) => {
                ValidationProgress::bump(&self.progress.events_emitted, 1);
                debug!(record_id, kind = kind.as_str(), "inconsistency reported");
            }
            Err(err) => {
                // The next pass rediscovers the divergence.
                ValidationProgress::bump(&self.progress.publish_errors, 1);
                warn!(
                    record_id,
                    kind = kind.as_str(),
                    error = %format!("{err:#}"),
                    "failed to publish inconsistency event"
                );
            }
        }
    }
}

fn joined_outcome(
    label: &'static str,
    joined: Result<DirectionOutcome, tokio::task::JoinError>,
) -> DirectionOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(direction = label, error = %err, "validation task aborted");
            DirectionOutcome::Failed(format!("{label} task failed: {err}"))
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FixAction {
    Upserted,
    Deleted,
}

impl FixAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upserted => "upserted",
            Self::Deleted => "deleted",
        }
    }
}

/// Repairs target from base. Stateless; applying the same event twice leaves the same state.
#[derive(Clone)]
pub struct Fixer {
    base: Arc<dyn Store>,
    target: Arc<dyn Store>,
    table: String,
    columns: Arc<[String]>,
    call_timeout: Duration,
    select_sql: Arc<str>,
    upsert_sql: Arc<str>,
    delete_sql: Arc<str>,
}

impl Fixer {
    /// Introspects the column set of `table` on base once.
    ///
    /// # Errors
    /// Returns an error for invalid names, an unreadable base table, or a table without `id`.
    pub async fn new(
        base: Arc<dyn Store>,
        target: Arc<dyn Store>,
        table: &str,
        call_timeout: Duration,
    ) -> Result<Self> {
        let table = validate_identifier(table)?.to_string();
        let columns = {
            let base = Arc::clone(&base);
            let owned = table.clone();
            run_blocking(call_timeout, "introspect_columns", move || base.columns(&owned))
                .await
                .with_context(|| format!("failed to introspect columns of {table}"))?
        };
        for column in &columns {
            validate_identifier(column)?;
        }
        if !columns.iter().any(|column| column == ID_COLUMN) {
            return Err(anyhow!("table {table} has no {ID_COLUMN} column"));
        }

        let column_list = columns.join(", ");
        let placeholders = (1..=columns.len()).map(|index| format!("?{index}")).collect::<Vec<_>>();
        let assignments = columns
            .iter()
            .filter(|column| column.as_str() != ID_COLUMN)
            .map(|column| format!("{column} = excluded.{column}"))
            .collect::<Vec<_>>();
        let conflict_action = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", assignments.join(", "))
        };

        let upsert_sql = format!(
            "INSERT INTO {table} ({column_list}) VALUES ({}) ON CONFLICT({ID_COLUMN}) {conflict_action}",
            placeholders.join(", ")
        );
        let select_sql = format!("SELECT {column_list} FROM {table} WHERE {ID_COLUMN} = ?1");
        let delete_sql = format!("DELETE FROM {table} WHERE {ID_COLUMN} = ?1");

        debug!(table = %table, columns = columns.len(), "fixer ready");
        Ok(Self {
            base,
            target,
            table,
            columns: columns.into(),
            call_timeout,
            select_sql: select_sql.into(),
            upsert_sql: upsert_sql.into(),
            delete_sql: delete_sql.into(),
        })
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// # Errors
    /// Returns any base or target error, including timeouts. Nothing is swallowed.
    pub async fn fix(&self, event: &InconsistencyEvent) -> Result<FixAction> {
        let record_id = event.record_id;
        let action = match event.kind {
            InconsistencyKind::TargetMissing | InconsistencyKind::NotEqual => {
                match self.read_base(record_id).await? {
                    Some(row) => {
                        self.upsert(&row).await?;
                        FixAction::Upserted
                    }
                    None => {
                        self.delete(record_id).await?;
                        FixAction::Deleted
                    }
                }
            }
            InconsistencyKind::BaseMissing => {
                self.delete(record_id).await?;
                FixAction::Deleted
            }
        };

        debug!(
            table = %self.table,
            record_id,
            kind = event.kind.as_str(),
            action = action.as_str(),
            "inconsistency repaired"
        );
        Ok(action)
    }

    async fn read_base(&self, record_id: i64) -> Result<Option<Row>> {
        let base = Arc::clone(&self.base);
        let sql = Arc::clone(&self.select_sql);
        run_blocking(self.call_timeout, "fixer_base_read", move || {
            base.query_row(&sql, &[SqlValue::from(record_id)])
        })
        .await
        .with_context(|| format!("failed to read base record {record_id}"))
    }

    async fn upsert(&self, row: &Row) -> Result<()> {
        let params: Vec<SqlValue> = self
            .columns
            .iter()
            .map(|column| row.get(column).map_or(SqlValue::Null, Clone::clone))
            .collect();
        let target = Arc::clone(&self.target);
        let sql = Arc::clone(&self.upsert_sql);
        run_blocking(self.call_timeout, "fixer_target_upsert", move || {
            target.execute(&sql, &params).map(|_| ())
        })
        .await
        .context("failed to upsert target record")
    }

    async fn delete(&self, record_id: i64) -> Result<()> {
        let target = Arc::clone(&self.target);
        let sql = Arc::clone(&self.delete_sql);
        run_blocking(self.call_timeout, "fixer_target_delete", move || {
            target.execute(&sql, &[SqlValue::from(record_id)]).map(|_| ())
        })
        .await
        .with_context(|| format!("failed to delete target record {record_id}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub consumer: String,
    /// Only events carrying this direction are repaired; others are acknowledged and skipped.
    pub direction: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub call_timeout: Duration,
    /// Failed fixes of one event before it is dead-lettered and acknowledged.
    pub max_fix_attempts: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer: DEFAULT_CONSUMER.to_string(),
            direction: DEFAULT_DIRECTION.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_millis(500),
            retry_backoff: Duration::from_secs(1),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_fix_attempts: DEFAULT_MAX_FIX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrainReport {
    pub polled: u64,
    pub upserted: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub last_acked_seq: Option<i64>,
}

impl DrainReport {
    #[must_use]
    pub fn fixed(&self) -> u64 {
        self.upserted + self.deleted
    }
}

enum BatchOutcome {
    Idle,
    Progressed,
    Stalled,
}

/// Subscribes a [`Fixer`] to the event bus with at-least-once semantics.
pub struct FixerConsumer {
    fixer: Fixer,
    source: Arc<dyn EventSource>,
    config: ConsumerConfig,
    /// `(seq, failed attempts)` of the event at the head of the queue.
    failing: Mutex<Option<(i64, u32)>>,
}

impl FixerConsumer {
    #[must_use]
    pub fn new(fixer: Fixer, source: Arc<dyn EventSource>, config: ConsumerConfig) -> Self {
        Self { fixer, source, config, failing: Mutex::new(None) }
    }

    #[must_use]
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Processes pending events until none remain.
    ///
    /// A failing event is retried after `retry_backoff` until `max_fix_attempts` is reached,
    /// then dead-lettered and acknowledged so later events are not blocked.
    ///
    /// # Errors
    /// Returns bus poll, ack and dead-letter errors. Each failed fix attempt is counted in
    /// [`DrainReport::failed`].
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        loop {
            match self.process_batch(&mut report).await? {
                BatchOutcome::Progressed => {}
                BatchOutcome::Idle => return Ok(report),
                BatchOutcome::Stalled => tokio::time::sleep(self.config.retry_backoff).await,
            }
        }
    }

    /// Polls and repairs until `cancel` flips to `true`.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> DrainReport {
        let mut report = DrainReport::default();
        info!(
            consumer = %self.config.consumer,
            direction = %self.config.direction,
            table = %self.fixer.table(),
            "fixer consumer started"
        );

        loop {
            if cancelled(&cancel) {
                break;
            }
            let wait = match self.process_batch(&mut report).await {
                Ok(BatchOutcome::Progressed) => continue,
                Ok(BatchOutcome::Idle) => self.config.poll_interval,
                Ok(BatchOutcome::Stalled) => self.config.retry_backoff,
                Err(err) => {
                    warn!(
                        consumer = %self.config.consumer,
                        error = %format!("{err:#}"),
                        "event bus call failed"
                    );
                    self.config.retry_backoff
                }
            };
            if pause(wait, &mut cancel).await {
                break;
            }
        }

        info!(consumer = %self.config.consumer, fixed = report.fixed(), "fixer consumer stopped");
        report
    }

    async fn process_batch(&self, report: &mut DrainReport) -> Result<BatchOutcome> {
        let source = Arc::clone(&self.source);
        let consumer = self.config.consumer.clone();
        let max = self.config.batch_size;
        let deliveries = run_blocking(self.config.call_timeout, "poll_events", move || {
            source.poll(&consumer, max)
        })
        .await?;

        if deliveries.is_empty() {
            return Ok(BatchOutcome::Idle);
        }
        report.polled += u64::try_from(deliveries.len()).unwrap_or(u64::MAX);

        for delivery in deliveries {
            if delivery.event.direction == self.config.direction {
                match self.fixer.fix(&delivery.event).await {
                    Ok(FixAction::Upserted) => report.upserted += 1,
                    Ok(FixAction::Deleted) => report.deleted += 1,
                    Err(err) => {
                        report.failed += 1;
                        let attempts = self.record_failure(delivery.seq);
                        let reason = format!("{err:#}");
                        if attempts < self.config.max_fix_attempts {
                            warn!(
                                seq = delivery.seq,
                                record_id = delivery.event.record_id,
                                kind = delivery.event.kind.as_str(),
                                attempts,
                                error = %reason,
                                "fix failed; event left for redelivery"
                            );
                            return Ok(BatchOutcome::Stalled);
                        }

                        error!(
                            seq = delivery.seq,
                            record_id = delivery.event.record_id,
                            kind = delivery.event.kind.as_str(),
                            attempts,
                            error = %reason,
                            "fix attempts exhausted; dead-lettering event"
                        );
                        let source = Arc::clone(&self.source);
                        let consumer = self.config.consumer.clone();
                        let parked = delivery.clone();
                        run_blocking(self.config.call_timeout, "dead_letter_event", move || {
                            source.dead_letter(&consumer, &parked, &reason)
                        })
                        .await?;
                        report.dead_lettered += 1;
                    }
                }
            } else {
                report.skipped += 1;
                debug!(
                    seq = delivery.seq,
                    direction = %delivery.event.direction,
                    "skipping event for another direction"
                );
            }

            let source = Arc::clone(&self.source);
            let consumer = self.config.consumer.clone();
            let seq = delivery.seq;
            run_blocking(self.config.call_timeout, "ack_event", move || source.ack(&consumer, seq))
                .await?;
            report.last_acked_seq = Some(seq);
        }

        Ok(BatchOutcome::Progressed)
    }

    /// Counts a failed fix of `seq` and returns its attempts so far.
    fn record_failure(&self, seq: i64) -> u32 {
        let mut failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        let attempts = match *failing {
            Some((current, attempts)) if current == seq => attempts.saturating_add(1),
            _ => 1,
        };
        *failing = Some((seq, attempts));
        attempts
    }
}
