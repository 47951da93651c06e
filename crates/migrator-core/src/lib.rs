//! Shared contracts for live table migration between a base store and a target store.
//!
//! The crate is synchronous and engine-agnostic. It defines:
//! - the [`Entity`] contract a migrated row type satisfies,
//! - the [`Store`]/[`StoreTx`] seam every physical store implements,
//! - the [`WritePolicy`] and its lock-free [`PolicyCell`],
//! - the [`DualWritePool`] that fans writes out according to the active policy,
//! - the [`InconsistencyEvent`] carried between validator and fixer, and the bus traits
//!   ([`EventProducer`], [`EventSource`]) that carry it.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Primary-key column every migrated table exposes.
pub const ID_COLUMN: &str = "id";

/// Default update-time column used for incremental scans.
pub const DEFAULT_UPDATE_TIME_COLUMN: &str = "utime";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigratorError {
    #[error("unknown write policy code: {0}")]
    UnknownPolicy(u8),
    #[error("unknown write policy name: {0}")]
    UnknownPolicyName(String),
    #[error("unknown inconsistency kind: {0}")]
    UnknownKind(String),
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("{0} cancelled")]
    Cancelled(String),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    values: BTreeMap<String, SqlValue>,
}

impl Row {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        self.values.insert(column.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column)
    }

    /// Reads an integer column.
    ///
    /// # Errors
    /// Returns [`MigratorError::Decode`] when the column is absent or not an integer.
    pub fn get_i64(&self, column: &str) -> Result<i64, MigratorError> {
        match self.values.get(column) {
            Some(SqlValue::Integer(value)) => Ok(*value),
            Some(other) => Err(MigratorError::Decode(format!(
                "column {column} is not an integer: {other:?}"
            ))),
            None => Err(MigratorError::Decode(format!("column {column} is missing"))),
        }
    }

    /// Reads a text column.
    ///
    /// # Errors
    /// Returns [`MigratorError::Decode`] when the column is absent or not text.
    pub fn get_text(&self, column: &str) -> Result<&str, MigratorError> {
        match self.values.get(column) {
            Some(SqlValue::Text(value)) => Ok(value.as_str()),
            Some(other) => Err(MigratorError::Decode(format!(
                "column {column} is not text: {other:?}"
            ))),
            None => Err(MigratorError::Decode(format!("column {column} is missing"))),
        }
    }

    /// # Errors
    /// Returns [`MigratorError::Decode`] when the `id` column is absent or not an integer.
    pub fn id(&self) -> Result<i64, MigratorError> {
        self.get_i64(ID_COLUMN)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, SqlValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, SqlValue)>>(iter: I) -> Self {
        Self { values: iter.into_iter().collect() }
    }
}

/// A row type that can take part in a migration.
///
/// `compare_to` decides value equality so implementors can ignore volatile columns.
pub trait Entity: Sized + Send + Sync + 'static {
    fn id(&self) -> i64;

    fn compare_to(&self, other: &Self) -> bool;

    #[allow(clippy::missing_errors_doc)]
    fn from_row(row: &Row) -> Result<Self, MigratorError>;
}

/// Shape-agnostic entity: identity from `id`, equality over every column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowEntity {
    id: i64,
    row: Row,
}

impl RowEntity {
    #[must_use]
    pub fn row(&self) -> &Row {
        &self.row
    }
}

impl Entity for RowEntity {
    fn id(&self) -> i64 {
        self.id
    }

    fn compare_to(&self, other: &Self) -> bool {
        self.row == other.row
    }

    fn from_row(row: &Row) -> Result<Self, MigratorError> {
        Ok(Self { id: row.id()?, row: row.clone() })
    }
}

/// Accepts plain SQL identifiers only; table and column names are spliced into statements.
///
/// # Errors
/// Returns [`MigratorError::InvalidIdentifier`] for empty names or names containing anything
/// other than ASCII letters, digits and `_` (and not starting with a digit).
pub fn validate_identifier(name: &str) -> Result<&str, MigratorError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|head| head.is_ascii_alphabetic() || head == '_');
    if valid_head && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        Ok(name)
    } else {
        Err(MigratorError::InvalidIdentifier(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Base,
    Target,
}

impl Side {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Target => "target",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    BaseOnly,
    BaseFirst,
    TargetFirst,
    TargetOnly,
}

impl WritePolicy {
    pub const ALL: [Self; 4] = [Self::BaseOnly, Self::BaseFirst, Self::TargetFirst, Self::TargetOnly];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BaseOnly => "base_only",
            Self::BaseFirst => "base_first",
            Self::TargetFirst => "target_first",
            Self::TargetOnly => "target_only",
        }
    }

    /// Parses canonical names and the legacy `SRC_*`/`DST_*` pattern names.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "base_only" | "SRC_ONLY" => Some(Self::BaseOnly),
            "base_first" | "SRC_FIRST" => Some(Self::BaseFirst),
            "target_first" | "DST_FIRST" => Some(Self::TargetFirst),
            "target_only" | "DST_ONLY" => Some(Self::TargetOnly),
            _ => None,
        }
    }

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::BaseOnly => 1,
            Self::BaseFirst => 2,
            Self::TargetFirst => 3,
            Self::TargetOnly => 4,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::BaseOnly),
            2 => Some(Self::BaseFirst),
            3 => Some(Self::TargetFirst),
            4 => Some(Self::TargetOnly),
            _ => None,
        }
    }

    /// Side whose result is returned to the caller; also the side that serves reads.
    #[must_use]
    pub fn primary(self) -> Side {
        match self {
            Self::BaseOnly | Self::BaseFirst => Side::Base,
            Self::TargetFirst | Self::TargetOnly => Side::Target,
        }
    }

    #[must_use]
    pub fn secondary(self) -> Option<Side> {
        match self {
            Self::BaseOnly | Self::TargetOnly => None,
            Self::BaseFirst => Some(Side::Target),
            Self::TargetFirst => Some(Side::Base),
        }
    }
}

impl Display for WritePolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WritePolicy {
    type Err = MigratorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| MigratorError::UnknownPolicyName(value.to_string()))
    }
}

/// Lock-free holder of the active [`WritePolicy`].
#[derive(Debug)]
pub struct PolicyCell {
    code: AtomicU8,
}

impl PolicyCell {
    #[must_use]
    pub fn new(policy: WritePolicy) -> Self {
        Self { code: AtomicU8::new(policy.code()) }
    }

    /// # Errors
    /// Returns [`MigratorError::UnknownPolicy`] when the stored code maps to no policy.
    pub fn load(&self) -> Result<WritePolicy, MigratorError> {
        let code = self.code.load(Ordering::Acquire);
        WritePolicy::from_code(code).ok_or(MigratorError::UnknownPolicy(code))
    }

    /// Stores `policy` and returns the previous raw code.
    pub fn store(&self, policy: WritePolicy) -> u8 {
        self.code.swap(policy.code(), Ordering::AcqRel)
    }

    /// Stores a raw code, e.g. one restored from persisted operator state.
    pub fn store_code(&self, code: u8) -> u8 {
        self.code.swap(code, Ordering::AcqRel)
    }
}

/// A physical relational store.
///
/// `query_row` returns `Ok(None)` when nothing matches; not-found is never an error.
pub trait Store: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, statement: &str, params: &[SqlValue]) -> Result<usize>;

    #[allow(clippy::missing_errors_doc)]
    fn query(&self, statement: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    #[allow(clippy::missing_errors_doc)]
    fn query_row(&self, statement: &str, params: &[SqlValue]) -> Result<Option<Row>>;

    /// Column names of `table`, available even when the table is empty.
    #[allow(clippy::missing_errors_doc)]
    fn columns(&self, table: &str) -> Result<Vec<String>>;

    #[allow(clippy::missing_errors_doc)]
    fn begin(&self) -> Result<Box<dyn StoreTx>>;
}

/// An open transaction. Dropping it without commit rolls it back.
pub trait StoreTx: Send {
    #[allow(clippy::missing_errors_doc)]
    fn execute(&mut self, statement: &str, params: &[SqlValue]) -> Result<usize>;

    #[allow(clippy::missing_errors_doc)]
    fn query(&mut self, statement: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    #[allow(clippy::missing_errors_doc)]
    fn query_row(&mut self, statement: &str, params: &[SqlValue]) -> Result<Option<Row>>;

    #[allow(clippy::missing_errors_doc)]
    fn commit(self: Box<Self>) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn rollback(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
pub struct DualWriteTelemetry {
    primary_writes: AtomicU64,
    secondary_writes: AtomicU64,
    secondary_failures: AtomicU64,
    secondary_begin_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[allow(clippy::struct_field_names)]
pub struct DualWriteTelemetrySnapshot {
    pub primary_writes: u64,
    pub secondary_writes: u64,
    pub secondary_failures: u64,
    pub secondary_begin_failures: u64,
}

impl DualWriteTelemetry {
    fn record_primary(&self) {
        self.primary_writes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_secondary(&self) {
        self.secondary_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// The single place a secondary-side failure is swallowed.
    fn record_secondary_failure(&self, policy: WritePolicy, operation: &str, err: &anyhow::Error) {
        self.secondary_failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            policy = policy.as_str(),
            side = policy.secondary().map_or("none", Side::as_str),
            operation,
            error = %format!("{err:#}"),
            "secondary write failed; primary result stands"
        );
    }

    fn record_secondary_begin_failure(&self, policy: WritePolicy, err: &anyhow::Error) {
        self.secondary_begin_failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            policy = policy.as_str(),
            side = policy.secondary().map_or("none", Side::as_str),
            error = %format!("{err:#}"),
            "secondary transaction failed to open; continuing with primary only"
        );
    }

    #[must_use]
    pub fn snapshot(&self) -> DualWriteTelemetrySnapshot {
        DualWriteTelemetrySnapshot {
            primary_writes: self.primary_writes.load(Ordering::Relaxed),
            secondary_writes: self.secondary_writes.load(Ordering::Relaxed),
            secondary_failures: self.secondary_failures.load(Ordering::Relaxed),
            secondary_begin_failures: self.secondary_begin_failures.load(Ordering::Relaxed),
        }
    }
}

/// Store facade that writes to base, target, or both according to the active policy.
///
/// The policy is loaded once per operation (or once per transaction at begin). Reads go to
/// the primary side only. No lock is held while either store is called.
#[derive(Clone)]
pub struct DualWritePool {
    base: Arc<dyn Store>,
    target: Arc<dyn Store>,
    policy: Arc<PolicyCell>,
    telemetry: Arc<DualWriteTelemetry>,
}

impl DualWritePool {
    #[must_use]
    pub fn new(base: Arc<dyn Store>, target: Arc<dyn Store>, initial: WritePolicy) -> Self {
        Self {
            base,
            target,
            policy: Arc::new(PolicyCell::new(initial)),
            telemetry: Arc::new(DualWriteTelemetry::default()),
        }
    }

    /// # Errors
    /// Returns [`MigratorError::UnknownPolicy`] when the cell holds an unmapped code.
    pub fn policy(&self) -> Result<WritePolicy, MigratorError> {
        self.policy.load()
    }

    /// Switches the policy for every operation started after this call.
    pub fn set_policy(&self, policy: WritePolicy) {
        let previous = self.policy.store(policy);
        info!(
            from = WritePolicy::from_code(previous).map_or("unknown", WritePolicy::as_str),
            to = policy.as_str(),
            "write policy switched"
        );
    }

    #[must_use]
    pub fn policy_cell(&self) -> Arc<PolicyCell> {
        Arc::clone(&self.policy)
    }

    #[must_use]
    pub fn base(&self) -> Arc<dyn Store> {
        Arc::clone(&self.base)
    }

    #[must_use]
    pub fn target(&self) -> Arc<dyn Store> {
        Arc::clone(&self.target)
    }

    #[must_use]
    pub fn telemetry(&self) -> DualWriteTelemetrySnapshot {
        self.telemetry.snapshot()
    }

    fn side(&self, side: Side) -> &Arc<dyn Store> {
        match side {
            Side::Base => &self.base,
            Side::Target => &self.target,
        }
    }

    /// Opens the transaction pair implied by the current policy, primary first.
    ///
    /// # Errors
    /// Returns an error when the policy is unknown or the primary transaction cannot be
    /// opened. A secondary open failure is logged and the transaction proceeds without it.
    pub fn begin_dual(&self) -> Result<DualTx> {
        let policy = self.policy()?;
        let primary = self
            .side(policy.primary())
            .begin()
            .with_context(|| format!("failed to begin {} transaction", policy.primary().as_str()))?;

        let secondary = match policy.secondary() {
            Some(side) => match self.side(side).begin() {
                Ok(tx) => Some(tx),
                Err(err) => {
                    self.telemetry.record_secondary_begin_failure(policy, &err);
                    None
                }
            },
            None => None,
        };

        debug!(policy = policy.as_str(), has_secondary = secondary.is_some(), "dual transaction opened");
        Ok(DualTx { policy, primary, secondary, telemetry: Arc::clone(&self.telemetry) })
    }
}

impl Store for DualWritePool {
    fn execute(&self, statement: &str, params: &[SqlValue]) -> Result<usize> {
        let policy = self.policy()?;
        let affected = self.side(policy.primary()).execute(statement, params)?;
        self.telemetry.record_primary();

        if let Some(secondary) = policy.secondary() {
            match self.side(secondary).execute(statement, params) {
                Ok(_) => self.telemetry.record_secondary(),
                Err(err) => self.telemetry.record_secondary_failure(policy, "execute", &err),
            }
        }

        Ok(affected)
    }

    fn query(&self, statement: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let policy = self.policy()?;
        self.side(policy.primary()).query(statement, params)
    }

    fn query_row(&self, statement: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        let policy = self.policy()?;
        self.side(policy.primary()).query_row(statement, params)
    }

    fn columns(&self, table: &str) -> Result<Vec<String>> {
        let policy = self.policy()?;
        self.side(policy.primary()).columns(table)
    }

    fn begin(&self) -> Result<Box<dyn StoreTx>> {
        Ok(Box::new(self.begin_dual()?))
    }
}

/// Transaction pair opened under one captured policy.
pub struct DualTx {
    policy: WritePolicy,
    primary: Box<dyn StoreTx>,
    secondary: Option<Box<dyn StoreTx>>,
    telemetry: Arc<DualWriteTelemetry>,
}

impl DualTx {
    #[must_use]
    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    #[must_use]
    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }
}

impl StoreTx for DualTx {
    fn execute(&mut self, statement: &str, params: &[SqlValue]) -> Result<usize> {
        let affected = self.primary.execute(statement, params)?;
        self.telemetry.record_primary();

        if let Some(secondary) = self.secondary.as_mut() {
            match secondary.execute(statement, params) {
                Ok(_) => self.telemetry.record_secondary(),
                Err(err) => self.telemetry.record_secondary_failure(self.policy, "tx_execute", &err),
            }
        }

        Ok(affected)
    }

    fn query(&mut self, statement: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.primary.query(statement, params)
    }

    fn query_row(&mut self, statement: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        self.primary.query_row(statement, params)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let Self { policy, primary, secondary, telemetry } = *self;
        // An uncommitted secondary is dropped here and rolled back by its store.
        primary.commit().context("primary commit failed")?;
        if let Some(secondary) = secondary {
            if let Err(err) = secondary.commit() {
                telemetry.record_secondary_failure(policy, "commit", &err);
            }
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        let Self { policy, primary, secondary, telemetry } = *self;
        primary.rollback().context("primary rollback failed")?;
        if let Some(secondary) = secondary {
            if let Err(err) = secondary.rollback() {
                telemetry.record_secondary_failure(policy, "rollback", &err);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyKind {
    TargetMissing,
    BaseMissing,
    #[serde(rename = "neq")]
    NotEqual,
}

impl InconsistencyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TargetMissing => "target_missing",
            Self::BaseMissing => "base_missing",
            Self::NotEqual => "neq",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "target_missing" => Some(Self::TargetMissing),
            "base_missing" => Some(Self::BaseMissing),
            "neq" => Some(Self::NotEqual),
            _ => None,
        }
    }
}

/// Default direction label: the legacy store acts as base.
pub const DEFAULT_DIRECTION: &str = "src";

/// Direction label for runs where the target has become the source of truth.
pub const REVERSED_DIRECTION: &str = "dst";

/// Orders a `(base, target)` pair so the store named by `direction` acts as base.
///
/// # Errors
/// Returns [`MigratorError::Validation`] for any label other than `src` or `dst`.
pub fn orient<T: ?Sized>(
    direction: &str,
    base: &Arc<T>,
    target: &Arc<T>,
) -> Result<(Arc<T>, Arc<T>), MigratorError> {
    match direction {
        DEFAULT_DIRECTION => Ok((Arc::clone(base), Arc::clone(target))),
        REVERSED_DIRECTION => Ok((Arc::clone(target), Arc::clone(base))),
        other => Err(MigratorError::Validation(format!(
            "unknown direction {other:?}; expected {DEFAULT_DIRECTION:?} or {REVERSED_DIRECTION:?}"
        ))),
    }
}

/// One detected divergence for one record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InconsistencyEvent {
    pub event_id: Ulid,
    pub record_id: i64,
    pub direction: String,
    pub kind: InconsistencyKind,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
}

impl InconsistencyEvent {
    #[must_use]
    pub fn new(record_id: i64, direction: impl Into<String>, kind: InconsistencyKind) -> Self {
        Self {
            event_id: Ulid::new(),
            record_id,
            direction: direction.into(),
            kind,
            detected_at: now_utc(),
        }
    }
}

/// Publishing half of the event bus.
pub trait EventProducer: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn produce(&self, event: &InconsistencyEvent) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub seq: i64,
    pub event: InconsistencyEvent,
}

/// Consuming half of the event bus. Delivery is at-least-once: anything not acknowledged
/// is delivered again.
pub trait EventSource: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn poll(&self, consumer: &str, max: usize) -> Result<Vec<Delivery>>;

    /// Marks every delivery up to and including `seq` as processed.
    #[allow(clippy::missing_errors_doc)]
    fn ack(&self, consumer: &str, seq: i64) -> Result<()>;

    /// Parks a delivery the consumer gave up on, so it can be inspected after the ack.
    #[allow(clippy::missing_errors_doc)]
    fn dead_letter(&self, consumer: &str, delivery: &Delivery, reason: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    Full,
    Incremental,
}

impl ValidationMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

/// Scan position of one validator direction.
///
/// Full mode orders by `id`; incremental mode orders by `(update_time, id)`. The keyset
/// position is `(watermark, last_id)`; with no `last_id` the scan starts at
/// `update_time >= watermark`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidatorCursor {
    pub mode: ValidationMode,
    pub offset: u64,
    pub watermark: i64,
    pub last_id: Option<i64>,
}

impl ValidatorCursor {
    #[must_use]
    pub fn full() -> Self {
        Self { mode: ValidationMode::Full, offset: 0, watermark: 0, last_id: None }
    }

    #[must_use]
    pub fn incremental(watermark: i64) -> Self {
        Self { mode: ValidationMode::Incremental, offset: 0, watermark, last_id: None }
    }

    /// Records that the row `(update_time, id)` has been visited.
    pub fn advance(&mut self, update_time: i64, id: i64) {
        self.offset += 1;
        self.last_id = Some(id);
        if self.mode == ValidationMode::Incremental {
            self.watermark = self.watermark.max(update_time);
        }
    }
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`MigratorError::Validation`] for malformed or non-UTC input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, MigratorError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| MigratorError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(MigratorError::Validation("timestamp MUST use UTC offset Z".to_string()));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`MigratorError::Validation`] if formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, MigratorError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| MigratorError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
