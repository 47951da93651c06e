#![allow(clippy::missing_errors_doc)]

//! SQLite adapters: a [`Store`] over one database file and a durable event-log bus.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use migrator_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, validate_identifier, Delivery, EventProducer,
    EventSource, InconsistencyEvent, InconsistencyKind, Row, SqlValue, Store, StoreTx,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info};
use ulid::Ulid;

const BUS_MIGRATIONS: [(i64, &str); 2] = [(1, SCHEMA_BUS_V1), (2, SCHEMA_BUS_V2)];

const SCHEMA_BUS_V1: &str = r"
CREATE TABLE IF NOT EXISTS inconsistency_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  topic TEXT NOT NULL,
  record_id INTEGER NOT NULL,
  direction TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('target_missing', 'base_missing', 'neq')),
  detected_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_inconsistency_events_no_update
BEFORE UPDATE ON inconsistency_events
BEGIN
  SELECT RAISE(FAIL, 'inconsistency_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_inconsistency_events_topic_seq
  ON inconsistency_events(topic, event_seq);

CREATE TABLE IF NOT EXISTS consumer_offsets (
  topic TEXT NOT NULL,
  consumer TEXT NOT NULL,
  acked_seq INTEGER NOT NULL CHECK (acked_seq >= 0),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (topic, consumer)
);
";

const SCHEMA_BUS_V2: &str = r"
CREATE TABLE IF NOT EXISTS dead_letters (
  topic TEXT NOT NULL,
  consumer TEXT NOT NULL,
  event_seq INTEGER NOT NULL,
  event_id TEXT NOT NULL,
  record_id INTEGER NOT NULL,
  direction TEXT NOT NULL,
  kind TEXT NOT NULL,
  reason TEXT NOT NULL,
  parked_at TEXT NOT NULL,
  PRIMARY KEY (topic, consumer, event_seq)
);

CREATE TABLE IF NOT EXISTS write_policy_state (
  topic TEXT PRIMARY KEY,
  policy_code INTEGER NOT NULL CHECK (policy_code BETWEEN 0 AND 255),
  updated_at TEXT NOT NULL
);
";

fn open_connection(path: &Path) -> Result<Connection> {
    if path.as_os_str() == ":memory:" {
        return Err(anyhow!(
            "in-memory sqlite is not supported: every call opens its own connection"
        ));
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

/// A [`Store`] over one SQLite file. Each call opens its own connection, so the store is
/// `Sync` and concurrent callers only contend inside SQLite.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Verifies the database can be opened and configured.
    pub fn open(path: &Path) -> Result<Self> {
        open_connection(path)?;
        Ok(Self { path: path.to_path_buf() })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        open_connection(&self.path)
    }
}

impl Store for SqliteStore {
    fn execute(&self, statement: &str, params: &[SqlValue]) -> Result<usize> {
        let conn = self.connect()?;
        execute_on(&conn, statement, params)
    }

    fn query(&self, statement: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let conn = self.connect()?;
        query_on(&conn, statement, params)
    }

    fn query_row(&self, statement: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        let conn = self.connect()?;
        query_row_on(&conn, statement, params)
    }

    fn columns(&self, table: &str) -> Result<Vec<String>> {
        let table = validate_identifier(table)?;
        let conn = self.connect()?;
        let stmt = conn
            .prepare(&format!("SELECT * FROM {table} LIMIT 0"))
            .with_context(|| format!("failed to inspect columns of {table}"))?;
        Ok(stmt.column_names().into_iter().map(str::to_string).collect())
    }

    fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let conn = self.connect()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .context("failed to start sqlite transaction")?;
        Ok(Box::new(SqliteTx { conn }))
    }
}

/// Open transaction on a dedicated connection. Closing the connection without `COMMIT`
/// rolls the transaction back, which is what happens when this value is dropped.
pub struct SqliteTx {
    conn: Connection,
}

impl StoreTx for SqliteTx {
    fn execute(&mut self, statement: &str, params: &[SqlValue]) -> Result<usize> {
        execute_on(&self.conn, statement, params)
    }

    fn query(&mut self, statement: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        query_on(&self.conn, statement, params)
    }

    fn query_row(&mut self, statement: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        query_row_on(&self.conn, statement, params)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .context("failed to commit sqlite transaction")
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .context("failed to roll back sqlite transaction")
    }
}

fn to_sql(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(value) => Value::Integer(*value),
        SqlValue::Real(value) => Value::Real(*value),
        SqlValue::Text(value) => Value::Text(value.clone()),
        SqlValue::Blob(value) => Value::Blob(value.clone()),
    }
}

fn from_sql(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(value) => SqlValue::Integer(value),
        Value::Real(value) => SqlValue::Real(value),
        Value::Text(value) => SqlValue::Text(value),
        Value::Blob(value) => SqlValue::Blob(value),
    }
}

fn execute_on(conn: &Connection, statement: &str, params: &[SqlValue]) -> Result<usize> {
    conn.execute(statement, params_from_iter(params.iter().map(to_sql)))
        .with_context(|| format!("failed to execute statement: {statement}"))
}

fn query_on(conn: &Connection, statement: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
    let mut stmt = conn
        .prepare(statement)
        .with_context(|| format!("failed to prepare query: {statement}"))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql)))?;

    let mut values = Vec::new();
    while let Some(row) = rows.next()? {
        values.push(decode_row(row, &names)?);
    }
    Ok(values)
}

fn query_row_on(conn: &Connection, statement: &str, params: &[SqlValue]) -> Result<Option<Row>> {
    let mut stmt = conn
        .prepare(statement)
        .with_context(|| format!("failed to prepare query: {statement}"))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql)))?;

    match rows.next()? {
        Some(row) => Ok(Some(decode_row(row, &names)?)),
        None => Ok(None),
    }
}

fn decode_row(row: &rusqlite::Row<'_>, names: &[String]) -> rusqlite::Result<Row> {
    let mut decoded = Row::new();
    for (index, name) in names.iter().enumerate() {
        decoded.insert(name.clone(), from_sql(row.get::<_, Value>(index)?));
    }
    Ok(decoded)
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ConsumerLag {
    pub topic: String,
    pub consumer: String,
    pub acked_seq: i64,
    pub latest_seq: i64,
    pub lag_events: i64,
}

/// A delivery a consumer gave up on after exhausting its attempts.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DeadLetter {
    pub consumer: String,
    pub seq: i64,
    pub record_id: i64,
    pub direction: String,
    pub kind: String,
    pub reason: String,
    pub parked_at: String,
}

/// Durable at-least-once event log keyed by topic, with per-consumer offsets.
#[derive(Debug, Clone)]
pub struct SqliteEventBus {
    path: PathBuf,
    topic: String,
}

impl SqliteEventBus {
    pub fn open(path: &Path, topic: &str) -> Result<Self> {
        if topic.trim().is_empty() {
            return Err(anyhow!("topic MUST be non-empty"));
        }
        open_connection(path)?;
        Ok(Self { path: path.to_path_buf(), topic: topic.to_string() })
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = open_connection(&self.path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        for (version, schema) in BUS_MIGRATIONS {
            conn.execute_batch(schema)
                .with_context(|| format!("failed to apply event bus schema v{version}"))?;

            let now = format_rfc3339(now_utc())?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                    params![version, now],
                )
                .context("failed to register event bus schema migration")?;
            if inserted > 0 {
                info!(path = %self.path.display(), version, "event bus schema applied");
            }
        }

        Ok(())
    }

    /// Persists the raw write-policy code for this topic.
    pub fn save_policy_code(&self, code: u8) -> Result<()> {
        let conn = open_connection(&self.path)?;
        conn.execute(
            "INSERT INTO write_policy_state(topic, policy_code, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(topic) DO UPDATE SET
               policy_code = excluded.policy_code,
               updated_at = excluded.updated_at",
            params![self.topic, code, format_rfc3339(now_utc())?],
        )
        .with_context(|| format!("failed to persist write policy code {code}"))?;
        Ok(())
    }

    /// The last persisted write-policy code for this topic, if any.
    pub fn load_policy_code(&self) -> Result<Option<u8>> {
        let conn = open_connection(&self.path)?;
        conn.query_row(
            "SELECT policy_code FROM write_policy_state WHERE topic = ?1",
            params![self.topic],
            |row| row.get::<_, u8>(0),
        )
        .optional()
        .context("failed to read persisted write policy")
    }

    pub fn list_dead_letters(&self, consumer: &str) -> Result<Vec<DeadLetter>> {
        let conn = open_connection(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT consumer, event_seq, record_id, direction, kind, reason, parked_at
             FROM dead_letters
             WHERE topic = ?1 AND consumer = ?2
             ORDER BY event_seq ASC",
        )?;
        let rows = stmt.query_map(params![self.topic, consumer], |row| {
            Ok(DeadLetter {
                consumer: row.get(0)?,
                seq: row.get(1)?,
                record_id: row.get(2)?,
                direction: row.get(3)?,
                kind: row.get(4)?,
                reason: row.get(5)?,
                parked_at: row.get(6)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Events of this topic with `event_seq >= from_seq`, oldest first.
    pub fn list_events(&self, from_seq: i64, limit: Option<usize>) -> Result<Vec<Delivery>> {
        let conn = open_connection(&self.path)?;
        let limit = limit.map_or(-1, |value| i64::try_from(value).unwrap_or(i64::MAX));
        let mut stmt = conn.prepare(
            "SELECT event_seq, event_id, record_id, direction, kind, detected_at
             FROM inconsistency_events
             WHERE topic = ?1 AND event_seq >= ?2
             ORDER BY event_seq ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![self.topic, from_seq, limit], decode_delivery)?;
        collect_rows(rows)
    }

    pub fn latest_seq(&self) -> Result<i64> {
        let conn = open_connection(&self.path)?;
        latest_seq(&conn, &self.topic)
    }

    pub fn consumer_lag(&self, consumer: &str) -> Result<ConsumerLag> {
        let conn = open_connection(&self.path)?;
        let acked_seq = acked_seq(&conn, &self.topic, consumer)?;
        let latest_seq = latest_seq(&conn, &self.topic)?;
        let lag_events = conn
            .query_row(
                "SELECT COUNT(*) FROM inconsistency_events WHERE topic = ?1 AND event_seq > ?2",
                params![self.topic, acked_seq],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count pending events")?;

        Ok(ConsumerLag {
            topic: self.topic.clone(),
            consumer: consumer.to_string(),
            acked_seq,
            latest_seq,
            lag_events,
        })
    }
}

impl EventProducer for SqliteEventBus {
    fn produce(&self, event: &InconsistencyEvent) -> Result<()> {
        let conn = open_connection(&self.path)?;
        conn.execute(
            "INSERT INTO inconsistency_events(
                event_id, topic, record_id, direction, kind, detected_at, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id.to_string(),
                self.topic,
                event.record_id,
                event.direction,
                event.kind.as_str(),
                format_rfc3339(event.detected_at)?,
                format_rfc3339(now_utc())?,
            ],
        )
        .context("failed to append inconsistency event")?;

        debug!(
            topic = %self.topic,
            record_id = event.record_id,
            kind = event.kind.as_str(),
            seq = conn.last_insert_rowid(),
            "inconsistency event produced"
        );
        Ok(())
    }
}

impl EventSource for SqliteEventBus {
    fn poll(&self, consumer: &str, max: usize) -> Result<Vec<Delivery>> {
        let conn = open_connection(&self.path)?;
        let from = acked_seq(&conn, &self.topic, consumer)?;
        let limit = i64::try_from(max).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT event_seq, event_id, record_id, direction, kind, detected_at
             FROM inconsistency_events
             WHERE topic = ?1 AND event_seq > ?2
             ORDER BY event_seq ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![self.topic, from, limit], decode_delivery)?;
        collect_rows(rows)
    }

    fn ack(&self, consumer: &str, seq: i64) -> Result<()> {
        if seq < 0 {
            return Err(anyhow!("ack sequence MUST be >= 0, got {seq}"));
        }
        let conn = open_connection(&self.path)?;
        conn.execute(
            "INSERT INTO consumer_offsets(topic, consumer, acked_seq, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(topic, consumer) DO UPDATE SET
               acked_seq = MAX(consumer_offsets.acked_seq, excluded.acked_seq),
               updated_at = excluded.updated_at",
            params![self.topic, consumer, seq, format_rfc3339(now_utc())?],
        )
        .with_context(|| format!("failed to ack seq {seq} for consumer {consumer}"))?;
        Ok(())
    }

    fn dead_letter(&self, consumer: &str, delivery: &Delivery, reason: &str) -> Result<()> {
        let conn = open_connection(&self.path)?;
        conn.execute(
            "INSERT OR REPLACE INTO dead_letters(
                topic, consumer, event_seq, event_id, record_id, direction, kind, reason, parked_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                self.topic,
                consumer,
                delivery.seq,
                delivery.event.event_id.to_string(),
                delivery.event.record_id,
                delivery.event.direction,
                delivery.event.kind.as_str(),
                reason,
                format_rfc3339(now_utc())?,
            ],
        )
        .with_context(|| format!("failed to dead-letter seq {} for consumer {consumer}", delivery.seq))?;
        Ok(())
    }
}

fn acked_seq(conn: &Connection, topic: &str, consumer: &str) -> Result<i64> {
    let value = conn
        .query_row(
            "SELECT acked_seq FROM consumer_offsets WHERE topic = ?1 AND consumer = ?2",
            params![topic, consumer],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .context("failed to read consumer offset")?;
    Ok(value.unwrap_or(0))
}

fn latest_seq(conn: &Connection, topic: &str) -> Result<i64> {
    let value = conn
        .query_row(
            "SELECT MAX(event_seq) FROM inconsistency_events WHERE topic = ?1",
            params![topic],
            |row| row.get::<_, Option<i64>>(0),
        )
        .context("failed to query latest event_seq")?;
    Ok(value.unwrap_or(0))
}

fn decode_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<Delivery> {
    let seq: i64 = row.get(0)?;
    let event_id_raw: String = row.get(1)?;
    let event_id = Ulid::from_string(&event_id_raw)
        .map_err(|err| invalid_data(1, format!("invalid event_id {event_id_raw}: {err}")))?;
    let record_id: i64 = row.get(2)?;
    let direction: String = row.get(3)?;
    let kind_raw: String = row.get(4)?;
    let kind = InconsistencyKind::parse(&kind_raw)
        .ok_or_else(|| invalid_data(4, format!("unknown kind: {kind_raw}")))?;
    let detected_raw: String = row.get(5)?;
    let detected_at = parse_rfc3339_utc(&detected_raw).map_err(|err| invalid_data(5, err.to_string()))?;

    Ok(Delivery {
        seq,
        event: InconsistencyEvent { event_id, record_id, direction, kind, detected_at },
    })
}

fn invalid_data(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use migrator_core::{DualWritePool, WritePolicy, DEFAULT_DIRECTION};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_db(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("migrator-{label}-{}.sqlite3", Ulid::new()))
    }

    fn fixture_store(label: &str) -> SqliteStore {
        let store = must(SqliteStore::open(&temp_db(label)));
        must(store.execute(
            "CREATE TABLE interactives (id INTEGER PRIMARY KEY, biz TEXT NOT NULL, utime INTEGER NOT NULL)",
            &[],
        ));
        store
    }

    fn fixture_bus(topic: &str) -> SqliteEventBus {
        let bus = must(SqliteEventBus::open(&temp_db("bus"), topic));
        must(bus.migrate());
        bus
    }

    fn ids(store: &SqliteStore) -> Vec<i64> {
        must(store.query("SELECT id FROM interactives ORDER BY id", &[]))
            .iter()
            .map(|row| match row.id() {
                Ok(id) => id,
                Err(err) => panic!("test failure: {err}"),
            })
            .collect()
    }

    #[test]
    fn store_round_trips_rows_and_reports_missing_as_none() {
        let store = fixture_store("rows");
        let inserted = must(store.execute(
            "INSERT INTO interactives(id, biz, utime) VALUES (?1, ?2, ?3)",
            &[SqlValue::from(1), SqlValue::from("article"), SqlValue::from(1_000)],
        ));
        assert_eq!(inserted, 1);

        let row = must(store.query_row("SELECT * FROM interactives WHERE id = ?1", &[SqlValue::from(1)]));
        let row = match row {
            Some(row) => row,
            None => panic!("expected row 1"),
        };
        assert_eq!(row.get_text("biz"), Ok("article"));
        assert_eq!(row.get_i64("utime"), Ok(1_000));

        let missing = must(store.query_row("SELECT * FROM interactives WHERE id = ?1", &[SqlValue::from(2)]));
        assert!(missing.is_none());
    }

    #[test]
    fn columns_are_available_on_empty_tables() {
        let store = fixture_store("columns");
        assert_eq!(must(store.columns("interactives")), vec!["id", "biz", "utime"]);
        assert!(store.columns("interactives; DROP TABLE interactives").is_err());
        assert!(store.columns("no_such_table").is_err());
    }

    #[test]
    fn in_memory_databases_are_rejected() {
        assert!(SqliteStore::open(Path::new(":memory:")).is_err());
    }

    #[test]
    fn transaction_commit_persists_and_drop_rolls_back() {
        let store = fixture_store("tx");

        let mut tx = must(store.begin());
        must(tx.execute("INSERT INTO interactives(id, biz, utime) VALUES (1, 'a', 1)", &[]));
        assert_eq!(must(tx.query("SELECT id FROM interactives", &[])).len(), 1);
        must(tx.commit());

        {
            let mut tx = must(store.begin());
            must(tx.execute("INSERT INTO interactives(id, biz, utime) VALUES (2, 'b', 2)", &[]));
        }

        let mut tx = must(store.begin());
        must(tx.execute("INSERT INTO interactives(id, biz, utime) VALUES (3, 'c', 3)", &[]));
        must(tx.rollback());

        assert_eq!(ids(&store), vec![1]);
    }

    #[test]
    fn pool_switch_from_base_only_to_base_first_reaches_target_for_new_writes_only() {
        let base = Arc::new(fixture_store("base"));
        let target = Arc::new(fixture_store("target"));
        let pool = DualWritePool::new(
            Arc::clone(&base) as Arc<dyn Store>,
            Arc::clone(&target) as Arc<dyn Store>,
            WritePolicy::BaseOnly,
        );

        must(pool.execute("INSERT INTO interactives(id, biz, utime) VALUES (5, 'x', 1)", &[]));
        assert_eq!(ids(&base), vec![5]);
        assert!(ids(&target).is_empty());

        pool.set_policy(WritePolicy::BaseFirst);
        let mut tx = must(pool.begin());
        must(tx.execute("INSERT INTO interactives(id, biz, utime) VALUES (6, 'y', 2)", &[]));
        must(tx.commit());

        assert_eq!(ids(&base), vec![5, 6]);
        assert_eq!(ids(&target), vec![6]);
    }

    #[test]
    fn pool_keeps_primary_write_when_target_rejects_it() {
        let base = Arc::new(fixture_store("base"));
        let target = Arc::new(must(SqliteStore::open(&temp_db("target-no-table"))));
        let pool = DualWritePool::new(
            Arc::clone(&base) as Arc<dyn Store>,
            Arc::clone(&target) as Arc<dyn Store>,
            WritePolicy::BaseFirst,
        );

        let affected = must(pool.execute("INSERT INTO interactives(id, biz, utime) VALUES (1, 'a', 1)", &[]));
        assert_eq!(affected, 1);
        assert_eq!(ids(&base), vec![1]);
        assert_eq!(pool.telemetry().secondary_failures, 1);
    }

    #[test]
    fn bus_redelivers_until_acked() {
        let bus = fixture_bus("migrator_interactives");
        for record_id in [2, 3, 4] {
            must(bus.produce(&InconsistencyEvent::new(record_id, DEFAULT_DIRECTION, InconsistencyKind::TargetMissing)));
        }

        let first = must(bus.poll("fixer", 2));
        assert_eq!(first.iter().map(|d| d.event.record_id).collect::<Vec<_>>(), vec![2, 3]);

        let again = must(bus.poll("fixer", 2));
        assert_eq!(again, first);

        must(bus.ack("fixer", first[0].seq));
        let after_ack = must(bus.poll("fixer", 10));
        assert_eq!(after_ack.iter().map(|d| d.event.record_id).collect::<Vec<_>>(), vec![3, 4]);

        let other_consumer = must(bus.poll("auditor", 10));
        assert_eq!(other_consumer.len(), 3);
    }

    #[test]
    fn bus_ack_never_moves_backward() {
        let bus = fixture_bus("migrator_interactives");
        for record_id in 1..=3 {
            must(bus.produce(&InconsistencyEvent::new(record_id, "src", InconsistencyKind::NotEqual)));
        }
        let deliveries = must(bus.poll("fixer", 10));
        must(bus.ack("fixer", deliveries[2].seq));
        must(bus.ack("fixer", deliveries[0].seq));

        assert!(must(bus.poll("fixer", 10)).is_empty());
        let lag = must(bus.consumer_lag("fixer"));
        assert_eq!(lag.acked_seq, deliveries[2].seq);
        assert_eq!(lag.lag_events, 0);
        assert!(bus.ack("fixer", -1).is_err());
    }

    #[test]
    fn bus_topics_are_isolated_and_events_preserve_fields() {
        let path = temp_db("topics");
        let interactives = must(SqliteEventBus::open(&path, "migrator_interactives"));
        must(interactives.migrate());
        must(interactives.migrate());
        let comments = must(SqliteEventBus::open(&path, "migrator_comments"));

        let event = InconsistencyEvent::new(42, "dst", InconsistencyKind::BaseMissing);
        must(interactives.produce(&event));

        assert!(must(comments.poll("fixer", 10)).is_empty());
        let listed = must(interactives.list_events(0, None));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].event.event_id, event.event_id);
        assert_eq!(listed[0].event.record_id, 42);
        assert_eq!(listed[0].event.direction, "dst");
        assert_eq!(listed[0].event.kind, InconsistencyKind::BaseMissing);
        assert_eq!(
            must(format_rfc3339(listed[0].event.detected_at).map_err(anyhow::Error::from)),
            must(format_rfc3339(event.detected_at).map_err(anyhow::Error::from))
        );

        let lag = must(interactives.consumer_lag("fixer"));
        assert_eq!(lag.lag_events, 1);
        assert_eq!(lag.latest_seq, listed[0].seq);
        assert_eq!(must(comments.latest_seq()), 0);
    }

    #[test]
    fn event_log_is_append_only() {
        let bus = fixture_bus("migrator_interactives");
        must(bus.produce(&InconsistencyEvent::new(1, "src", InconsistencyKind::NotEqual)));
        let conn = must(open_connection(&bus.path));
        let result = conn.execute("UPDATE inconsistency_events SET record_id = 9", []);
        assert!(result.is_err());
    }

    #[test]
    fn dead_letters_are_kept_per_consumer() {
        let bus = fixture_bus("migrator_interactives");
        must(bus.produce(&InconsistencyEvent::new(7, "src", InconsistencyKind::TargetMissing)));
        let delivery = must(bus.poll("fixer", 1)).remove(0);

        must(bus.dead_letter("fixer", &delivery, "CHECK constraint failed"));
        must(bus.dead_letter("fixer", &delivery, "CHECK constraint failed again"));

        let parked = must(bus.list_dead_letters("fixer"));
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].seq, delivery.seq);
        assert_eq!(parked[0].record_id, 7);
        assert_eq!(parked[0].kind, "target_missing");
        assert_eq!(parked[0].reason, "CHECK constraint failed again");
        assert!(must(bus.list_dead_letters("auditor")).is_empty());
    }

    #[test]
    fn policy_code_persists_per_topic() {
        let path = temp_db("policy");
        let interactives = must(SqliteEventBus::open(&path, "migrator_interactives"));
        must(interactives.migrate());
        let comments = must(SqliteEventBus::open(&path, "migrator_comments"));
        assert_eq!(must(interactives.load_policy_code()), None);

        must(interactives.save_policy_code(WritePolicy::BaseFirst.code()));
        must(interactives.save_policy_code(WritePolicy::TargetFirst.code()));

        let reopened = must(SqliteEventBus::open(&path, "migrator_interactives"));
        assert_eq!(must(reopened.load_policy_code()), Some(WritePolicy::TargetFirst.code()));
        assert_eq!(must(comments.load_policy_code()), None);
    }

    #[test]
    fn migrations_register_every_version_once() {
        let bus = fixture_bus("migrator_interactives");
        must(bus.migrate());
        let conn = must(open_connection(&bus.path));
        let versions: Vec<i64> = {
            let mut stmt = must(
                conn.prepare("SELECT version FROM schema_migrations ORDER BY version")
                    .map_err(anyhow::Error::from),
            );
            let rows =
                must(stmt.query_map([], |row| row.get(0)).map_err(anyhow::Error::from));
            must(collect_rows(rows))
        };
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn bus_requires_topic() {
        assert!(SqliteEventBus::open(&temp_db("no-topic"), "  ").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_offset_is_max_of_acks(acks in prop::collection::vec(0usize..6, 1..12)) {
            let bus = fixture_bus("migrator_prop");
            for record_id in 0..6 {
                must(bus.produce(&InconsistencyEvent::new(record_id, "src", InconsistencyKind::NotEqual)));
            }
            let seqs: Vec<i64> = must(bus.list_events(0, None)).iter().map(|d| d.seq).collect();

            let mut expected = 0;
            for index in &acks {
                must(bus.ack("fixer", seqs[*index]));
                expected = expected.max(seqs[*index]);
            }

            let lag = must(bus.consumer_lag("fixer"));
            prop_assert_eq!(lag.acked_seq, expected);
            let pending = must(bus.poll("fixer", 10));
            prop_assert!(pending.iter().all(|d| d.seq > expected));
        }
    }
}
