#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite persistence for the warehouse domain.
//!
//! Every mutating operation runs in one transaction that also appends its
//! audit row. Invariants that must survive a bypassed application layer
//! (append-only audit and stock moves, buffer purity, published-flow
//! immutability, monotonic run steps) are backed by triggers.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use warehouse_core::access::Principal;
use warehouse_core::audit::NewAuditEvent;
use warehouse_core::config::WarehouseSettings;
use warehouse_core::{format_rfc3339, now_utc, parse_rfc3339_utc, Quantity, WarehouseError};

mod audit;
mod flows;
mod genealogy;
mod inventory;
mod quality;
mod runs;

const WAREHOUSE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_WAREHOUSE_V1: &str = r"
CREATE TABLE IF NOT EXISTS audit_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  event_type TEXT NOT NULL,
  entity_type TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  user_id TEXT,
  old_state TEXT,
  new_state TEXT,
  metadata TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_audit_events_no_update
BEFORE UPDATE ON audit_events
BEGIN
  SELECT RAISE(FAIL, 'audit_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_audit_events_no_delete
BEFORE DELETE ON audit_events
BEGIN
  SELECT RAISE(FAIL, 'audit_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_audit_events_entity
  ON audit_events(entity_type, entity_id, id);
CREATE INDEX IF NOT EXISTS idx_audit_events_type
  ON audit_events(event_type, id);
CREATE INDEX IF NOT EXISTS idx_audit_events_user
  ON audit_events(user_id, id);

CREATE TABLE IF NOT EXISTS flow_definitions (
  id TEXT PRIMARY KEY,
  name_json TEXT NOT NULL CHECK (json_valid(name_json)),
  description TEXT,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS flow_versions (
  id TEXT PRIMARY KEY,
  flow_definition_id TEXT NOT NULL REFERENCES flow_definitions(id),
  version_num INTEGER NOT NULL CHECK (version_num >= 1),
  status TEXT NOT NULL CHECK (status IN ('DRAFT', 'REVIEW', 'PUBLISHED', 'DEPRECATED')),
  graph_schema TEXT NOT NULL CHECK (json_valid(graph_schema)),
  created_by TEXT NOT NULL,
  reviewed_by TEXT,
  published_at TEXT,
  published_by TEXT,
  created_at TEXT NOT NULL,
  UNIQUE (flow_definition_id, version_num)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_flow_versions_single_draft
  ON flow_versions(flow_definition_id) WHERE status = 'DRAFT';

CREATE TRIGGER IF NOT EXISTS trg_flow_versions_published_immutable
BEFORE UPDATE ON flow_versions
WHEN (OLD.status = 'PUBLISHED' AND NEW.status NOT IN ('PUBLISHED', 'DEPRECATED'))
  OR (OLD.status = 'DEPRECATED' AND NEW.status <> 'DEPRECATED')
  OR (OLD.status IN ('PUBLISHED', 'DEPRECATED') AND (
       NEW.graph_schema IS NOT OLD.graph_schema
    OR NEW.version_num IS NOT OLD.version_num
    OR NEW.flow_definition_id IS NOT OLD.flow_definition_id
    OR NEW.created_by IS NOT OLD.created_by
    OR NEW.reviewed_by IS NOT OLD.reviewed_by
    OR NEW.published_at IS NOT OLD.published_at
    OR NEW.published_by IS NOT OLD.published_by
    OR NEW.created_at IS NOT OLD.created_at))
BEGIN
  SELECT RAISE(FAIL, 'published flow versions are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_flow_versions_published_no_delete
BEFORE DELETE ON flow_versions
WHEN OLD.status IN ('PUBLISHED', 'DEPRECATED')
BEGIN
  SELECT RAISE(FAIL, 'published flow versions are immutable');
END;

CREATE TABLE IF NOT EXISTS production_runs (
  id TEXT PRIMARY KEY,
  run_code TEXT NOT NULL UNIQUE CHECK (
    run_code GLOB 'RUN-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9]-[A-Z][A-Z][A-Z][A-Z]-[0-9][0-9][0-9][0-9]'
  ),
  flow_version_id TEXT NOT NULL REFERENCES flow_versions(id),
  status TEXT NOT NULL CHECK (
    status IN ('IDLE', 'RUNNING', 'HOLD', 'COMPLETED', 'ABORTED', 'ARCHIVED')
  ),
  current_step_index INTEGER NOT NULL DEFAULT 0 CHECK (current_step_index BETWEEN 0 AND 10),
  idempotency_key TEXT NOT NULL UNIQUE,
  created_by TEXT NOT NULL,
  hold_reason TEXT,
  resume_resolution TEXT,
  abort_reason TEXT,
  started_at TEXT,
  completed_at TEXT,
  ended_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_production_runs_pinned_flow_version
BEFORE UPDATE OF flow_version_id ON production_runs
WHEN NEW.flow_version_id IS NOT OLD.flow_version_id
BEGIN
  SELECT RAISE(FAIL, 'production_runs.flow_version_id is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_production_runs_step_monotonic
BEFORE UPDATE OF current_step_index ON production_runs
WHEN NEW.current_step_index < OLD.current_step_index
BEGIN
  SELECT RAISE(FAIL, 'production_runs.current_step_index must not decrease');
END;

CREATE TRIGGER IF NOT EXISTS trg_production_runs_no_delete
BEFORE DELETE ON production_runs
BEGIN
  SELECT RAISE(FAIL, 'production_runs are archived, never deleted');
END;

CREATE INDEX IF NOT EXISTS idx_production_runs_status
  ON production_runs(status);

CREATE TABLE IF NOT EXISTS run_step_executions (
  id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL REFERENCES production_runs(id),
  step_index INTEGER NOT NULL CHECK (step_index BETWEEN 0 AND 10),
  node_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('PENDING', 'IN_PROGRESS', 'COMPLETED', 'SKIPPED')),
  operator_id TEXT,
  started_at TEXT,
  completed_at TEXT,
  created_at TEXT NOT NULL,
  UNIQUE (run_id, step_index)
);

CREATE TABLE IF NOT EXISTS lots (
  id TEXT PRIMARY KEY,
  lot_code TEXT NOT NULL UNIQUE,
  lot_type TEXT NOT NULL CHECK (lot_type IN (
    'RAW', 'DEB', 'BULK', 'MIX', 'SKW', 'SKW15', 'SKW30',
    'FRZ', 'FRZ15', 'FRZ30', 'FG', 'FG15', 'FG30', 'PAL', 'SHIP'
  )),
  status TEXT NOT NULL CHECK (status IN (
    'CREATED', 'QUARANTINE', 'RELEASED', 'HOLD', 'REJECTED', 'CONSUMED', 'FINISHED'
  )),
  production_run_id TEXT REFERENCES production_runs(id),
  step_index INTEGER CHECK (step_index IS NULL OR step_index BETWEEN 0 AND 10),
  weight_grams INTEGER CHECK (weight_grams IS NULL OR weight_grams >= 0),
  temperature_c REAL,
  operator_id TEXT,
  metadata TEXT NOT NULL DEFAULT '{}' CHECK (json_valid(metadata)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lots_run_step
  ON lots(production_run_id, step_index);

CREATE TABLE IF NOT EXISTS lot_genealogy (
  id TEXT PRIMARY KEY,
  parent_lot_id TEXT NOT NULL REFERENCES lots(id),
  child_lot_id TEXT NOT NULL REFERENCES lots(id),
  quantity_used_grams INTEGER CHECK (quantity_used_grams IS NULL OR quantity_used_grams > 0),
  created_at TEXT NOT NULL,
  CHECK (parent_lot_id <> child_lot_id)
);

CREATE INDEX IF NOT EXISTS idx_lot_genealogy_parent
  ON lot_genealogy(parent_lot_id);
CREATE INDEX IF NOT EXISTS idx_lot_genealogy_child
  ON lot_genealogy(child_lot_id);

CREATE TABLE IF NOT EXISTS genealogy_cache (
  cache_key TEXT PRIMARY KEY,
  lot_id TEXT NOT NULL REFERENCES lots(id),
  payload TEXT NOT NULL CHECK (json_valid(payload)),
  computed_at TEXT NOT NULL,
  expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS buffers (
  id TEXT PRIMARY KEY,
  buffer_code TEXT NOT NULL UNIQUE,
  buffer_type TEXT NOT NULL CHECK (buffer_type IN ('LK', 'MIX', 'SKW15', 'SKW30', 'FRZ', 'PAL')),
  allowed_lot_types TEXT NOT NULL CHECK (
    json_valid(allowed_lot_types) AND json_array_length(allowed_lot_types) > 0
  ),
  capacity_grams INTEGER NOT NULL CHECK (capacity_grams > 0),
  temp_min_c REAL NOT NULL,
  temp_max_c REAL NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (temp_min_c < temp_max_c)
);

CREATE TABLE IF NOT EXISTS inventory_items (
  id TEXT PRIMARY KEY,
  lot_id TEXT NOT NULL REFERENCES lots(id),
  buffer_id TEXT NOT NULL REFERENCES buffers(id),
  run_id TEXT REFERENCES production_runs(id),
  quantity_grams INTEGER NOT NULL CHECK (quantity_grams > 0),
  entered_at TEXT NOT NULL,
  exited_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_inventory_items_open
  ON inventory_items(lot_id, buffer_id) WHERE exited_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_inventory_items_buffer
  ON inventory_items(buffer_id, exited_at);

CREATE TRIGGER IF NOT EXISTS trg_inventory_items_buffer_purity_insert
BEFORE INSERT ON inventory_items
WHEN NOT EXISTS (
  SELECT 1
  FROM buffers b
  JOIN lots l ON l.id = NEW.lot_id
  JOIN json_each(b.allowed_lot_types) allowed ON allowed.value = l.lot_type
  WHERE b.id = NEW.buffer_id
)
BEGIN
  SELECT RAISE(FAIL, 'lot type not allowed in buffer');
END;

CREATE TRIGGER IF NOT EXISTS trg_inventory_items_buffer_purity_update
BEFORE UPDATE OF lot_id, buffer_id ON inventory_items
WHEN NOT EXISTS (
  SELECT 1
  FROM buffers b
  JOIN lots l ON l.id = NEW.lot_id
  JOIN json_each(b.allowed_lot_types) allowed ON allowed.value = l.lot_type
  WHERE b.id = NEW.buffer_id
)
BEGIN
  SELECT RAISE(FAIL, 'lot type not allowed in buffer');
END;

CREATE TABLE IF NOT EXISTS stock_moves (
  id TEXT PRIMARY KEY,
  lot_id TEXT NOT NULL REFERENCES lots(id),
  from_buffer_id TEXT REFERENCES buffers(id),
  to_buffer_id TEXT REFERENCES buffers(id),
  quantity_grams INTEGER NOT NULL CHECK (quantity_grams > 0),
  move_type TEXT NOT NULL CHECK (move_type IN ('RECEIVE', 'TRANSFER', 'CONSUME', 'SHIP')),
  operator_id TEXT,
  idempotency_key TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL,
  CHECK (from_buffer_id IS NOT NULL OR to_buffer_id IS NOT NULL)
);

CREATE TRIGGER IF NOT EXISTS trg_stock_moves_no_update
BEFORE UPDATE ON stock_moves
BEGIN
  SELECT RAISE(FAIL, 'stock_moves is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_stock_moves_no_delete
BEFORE DELETE ON stock_moves
BEGIN
  SELECT RAISE(FAIL, 'stock_moves is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_stock_moves_lot
  ON stock_moves(lot_id);

CREATE TABLE IF NOT EXISTS qc_inspections (
  id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL REFERENCES production_runs(id),
  lot_id TEXT NOT NULL REFERENCES lots(id),
  step_index INTEGER NOT NULL CHECK (step_index BETWEEN 0 AND 10),
  inspection_type TEXT NOT NULL,
  decision TEXT NOT NULL CHECK (decision IN ('PASS', 'HOLD', 'FAIL')),
  notes TEXT,
  is_ccp INTEGER NOT NULL DEFAULT 0 CHECK (is_ccp IN (0, 1)),
  inspector_id TEXT NOT NULL,
  idempotency_key TEXT NOT NULL UNIQUE,
  inspected_at TEXT NOT NULL,
  CHECK (decision = 'PASS' OR length(trim(coalesce(notes, ''))) >= 10)
);

CREATE INDEX IF NOT EXISTS idx_qc_inspections_run_step
  ON qc_inspections(run_id, step_index, lot_id);

CREATE TABLE IF NOT EXISTS qc_decisions (
  id TEXT PRIMARY KEY,
  lot_id TEXT REFERENCES lots(id),
  gate_id TEXT,
  decision TEXT NOT NULL CHECK (decision IN ('PASS', 'HOLD', 'FAIL')),
  notes TEXT,
  temperature_c REAL,
  digital_signature TEXT,
  decided_by TEXT NOT NULL,
  decided_at TEXT NOT NULL,
  CHECK (decision = 'PASS' OR length(trim(coalesce(notes, ''))) >= 10)
);

CREATE TABLE IF NOT EXISTS temperature_logs (
  id TEXT PRIMARY KEY,
  lot_id TEXT REFERENCES lots(id),
  buffer_id TEXT REFERENCES buffers(id),
  inspection_id TEXT REFERENCES qc_inspections(id),
  temperature_c REAL NOT NULL CHECK (temperature_c BETWEEN -50 AND 100),
  measurement_type TEXT NOT NULL CHECK (measurement_type IN ('SURFACE', 'CORE', 'AMBIENT')),
  is_violation INTEGER NOT NULL CHECK (is_violation IN (0, 1)),
  recorded_by TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_temperature_logs_lot
  ON temperature_logs(lot_id);
";

/// Knobs the store reads from [`WarehouseSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub site_code: String,
    pub genealogy_cache_ttl: Duration,
    pub deep_trace_max_depth: u8,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from(&WarehouseSettings::default())
    }
}

impl From<&WarehouseSettings> for StoreOptions {
    fn from(settings: &WarehouseSettings) -> Self {
        Self {
            site_code: settings.site_code.clone(),
            genealogy_cache_ttl: Duration::seconds(
                i64::try_from(settings.genealogy_cache_ttl_secs).unwrap_or(i64::MAX),
            ),
            deep_trace_max_depth: settings.deep_trace_max_depth,
        }
    }
}

/// Result of a mutation guarded by an idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Idempotent<T> {
    pub value: T,
    /// `true` when the key was already used and `value` is the prior result.
    pub replayed: bool,
}

impl<T> Idempotent<T> {
    fn fresh(value: T) -> Self {
        Self {
            value,
            replayed: false,
        }
    }

    fn replay(value: T) -> Self {
        Self {
            value,
            replayed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub migration_version: Option<i64>,
    pub expected_version: i64,
    pub up_to_date: bool,
}

/// Stable classification of a failed operation for error envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Failure {
    pub code: String,
    pub message: String,
}

/// Maps an operation error onto the warehouse error taxonomy.
///
/// Domain errors keep their own code. A constraint or trigger failure that
/// escaped the application checks becomes `storage_invariant`; everything
/// else is `internal`.
#[must_use]
pub fn classify_failure(err: &anyhow::Error) -> Failure {
    if let Some(domain) = err.downcast_ref::<WarehouseError>() {
        return Failure {
            code: domain.code().to_string(),
            message: domain.message().to_string(),
        };
    }
    for cause in err.chain() {
        if let Some(rusqlite::Error::SqliteFailure(inner, message)) =
            cause.downcast_ref::<rusqlite::Error>()
        {
            if inner.code == ErrorCode::ConstraintViolation {
                return Failure {
                    code: "storage_invariant".to_string(),
                    message: message.clone().unwrap_or_else(|| inner.to_string()),
                };
            }
        }
    }
    Failure {
        code: "internal".to_string(),
        message: format!("{err:#}"),
    }
}

pub struct SqliteWarehouseStore {
    conn: Connection,
    options: StoreOptions,
}

impl SqliteWarehouseStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            options: StoreOptions::default(),
        })
    }

    #[must_use]
    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_WAREHOUSE_V1)
            .context("failed to apply warehouse schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![WAREHOUSE_MIGRATION_VERSION, sql_timestamp(now_utc())?],
            )
            .context("failed to register warehouse schema migration")?;

        tracing::debug!(version = WAREHOUSE_MIGRATION_VERSION, "schema migrated");
        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let migration_version = if table_exists(&self.conn, "schema_migrations")? {
            self.conn
                .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                    row.get::<_, Option<i64>>(0)
                })
                .context("failed to read schema_migrations")?
        } else {
            None
        };
        Ok(SchemaStatus {
            migration_version,
            expected_version: WAREHOUSE_MIGRATION_VERSION,
            up_to_date: migration_version == Some(WAREHOUSE_MIGRATION_VERSION),
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Checks that `actor` may perform a write guarded by `permission`.
fn authorize(actor: &Principal, permission: warehouse_core::access::Permission) -> Result<()> {
    actor.authorize(permission)?;
    Ok(())
}

/// Takes the write lock up front so concurrent writers queue on `busy_timeout`
/// and read committed state once they hold it.
fn begin_write(conn: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

/// Appends one audit row on `conn`, normally an open transaction.
fn append_audit(conn: &Connection, event: &NewAuditEvent) -> Result<i64> {
    conn.execute(
        "INSERT INTO audit_events(
            event_type, entity_type, entity_id, user_id,
            old_state, new_state, metadata, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.event_type.as_str(),
            event.entity_type.as_str(),
            event.entity_id,
            event.user_id,
            event
                .old_state
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to serialize audit old_state")?,
            event
                .new_state
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to serialize audit new_state")?,
            serde_json::to_string(&event.metadata).context("failed to serialize audit metadata")?,
            sql_timestamp(now_utc())?,
        ],
    )
    .with_context(|| format!("failed to append {} audit event", event.event_type.as_str()))?;
    Ok(conn.last_insert_rowid())
}

fn sql_timestamp(value: OffsetDateTime) -> Result<String> {
    Ok(format_rfc3339(value)?)
}

fn sql_opt_timestamp(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(sql_timestamp).transpose()
}

fn is_unique_violation(err: &rusqlite::Error, column: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(inner, Some(message)) => {
            inner.code == ErrorCode::ConstraintViolation
                && message.starts_with("UNIQUE constraint failed")
                && message.contains(column)
        }
        _ => false,
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> anyhow::Error {
    WarehouseError::NotFound(format!("{what} {id} not found")).into()
}

fn column_error(idx: usize, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.into(),
        )),
    )
}

fn id_column<T>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    parse: fn(&str) -> Result<T, WarehouseError>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|err| column_error(idx, err.to_string()))
}

fn opt_id_column<T>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    parse: fn(&str) -> Result<T, WarehouseError>,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.as_deref()
        .map(|value| parse(value).map_err(|err| column_error(idx, err.to_string())))
        .transpose()
}

fn code_column<T>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
    name: &str,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| column_error(idx, format!("invalid {name}: {raw}")))
}

fn timestamp_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(idx)?;
    parse_rfc3339_utc(&raw).map_err(|err| column_error(idx, err.to_string()))
}

fn opt_timestamp_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = row.get(idx)?;
    raw.as_deref()
        .map(|value| parse_rfc3339_utc(value).map_err(|err| column_error(idx, err.to_string())))
        .transpose()
}

fn json_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|err| column_error(idx, format!("invalid JSON: {err}")))
}

fn opt_json_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.as_deref()
        .map(|value| {
            serde_json::from_str(value)
                .map_err(|err| column_error(idx, format!("invalid JSON: {err}")))
        })
        .transpose()
}

fn quantity_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Quantity> {
    Ok(Quantity::from_grams(row.get(idx)?))
}

fn opt_quantity_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Quantity>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(Quantity::from_grams))
}

fn step_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u8> {
    let raw: i64 = row.get(idx)?;
    u8::try_from(raw).map_err(|_| column_error(idx, format!("invalid step_index: {raw}")))
}

fn opt_step_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<u8>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|value| {
        u8::try_from(value).map_err(|_| column_error(idx, format!("invalid step_index: {value}")))
    })
    .transpose()
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
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

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::BTreeMap;

    use serde_json::json;
    use warehouse_core::access::{Principal, Role};
    use warehouse_core::flow::{FlowVersion, GraphSchema, NewFlow};
    use warehouse_core::inventory::{Buffer, BufferType, Lot, LotType, NewBuffer, NewLot};
    use warehouse_core::run::{NewRun, ProductionRun};
    use warehouse_core::{IdempotencyKey, Quantity, RunId};

    use super::{Result, SqliteWarehouseStore};

    pub fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    pub fn must_fail<T: std::fmt::Debug>(result: Result<T>) -> anyhow::Error {
        match result {
            Ok(value) => panic!("expected failure, got {value:?}"),
            Err(err) => err,
        }
    }

    pub fn failure_code<T: std::fmt::Debug>(result: Result<T>) -> String {
        super::classify_failure(&must_fail(result)).code
    }

    pub fn admin() -> Principal {
        Principal::new("u-admin", Role::Admin)
    }

    pub fn operator() -> Principal {
        Principal::new("u-operator", Role::Operator)
    }

    pub fn fixture_store() -> SqliteWarehouseStore {
        let store = must(SqliteWarehouseStore::open(std::path::Path::new(":memory:")));
        must(store.migrate());
        store
    }

    pub fn publishable_graph() -> GraphSchema {
        match serde_json::from_value(json!({
            "nodes": [
                {"id": "start", "position": {"x": 0, "y": 0},
                 "data": {"label": {"en": "Receive"}, "nodeType": "start"}},
                {"id": "end", "position": {"x": 100, "y": 0},
                 "data": {"label": {"en": "Ship"}, "nodeType": "end"}}
            ],
            "edges": [{"id": "e1", "source": "start", "target": "end"}]
        })) {
            Ok(graph) => graph,
            Err(err) => panic!("fixture graph must parse: {err}"),
        }
    }

    /// Creates a flow, fills its draft, and publishes v1.
    pub fn published_version(store: &mut SqliteWarehouseStore) -> FlowVersion {
        let created = must(store.create_flow(
            &admin(),
            &NewFlow {
                name: BTreeMap::from([("en".to_string(), "Doner line".to_string())]),
                description: None,
            },
        ));
        let draft = created.1;
        must(store.update_draft(&admin(), draft.id, &publishable_graph()));
        must(store.publish_version(&admin(), draft.id)).published_version
    }

    pub fn fixture_run(store: &mut SqliteWarehouseStore) -> ProductionRun {
        let version = published_version(store);
        must(store.create_run(
            &operator(),
            &NewRun {
                flow_version_id: version.id,
                idempotency_key: IdempotencyKey::generate(),
            },
        ))
        .value
    }

    pub fn fixture_lot(
        store: &mut SqliteWarehouseStore,
        code: &str,
        lot_type: LotType,
        run: Option<(RunId, u8)>,
    ) -> Lot {
        must(store.create_lot(
            &operator(),
            &NewLot {
                lot_code: code.to_string(),
                lot_type,
                production_run_id: run.map(|(id, _)| id),
                step_index: run.map(|(_, step)| step),
                weight_kg: Some(Quantity::from_kg(100)),
                temperature_c: None,
                metadata: json!({}),
            },
        ))
    }

    pub fn fixture_buffer(
        store: &mut SqliteWarehouseStore,
        code: &str,
        allowed: Vec<LotType>,
    ) -> Buffer {
        must(store.create_buffer(
            &operator(),
            &NewBuffer {
                buffer_code: code.to_string(),
                buffer_type: BufferType::Lk,
                allowed_lot_types: allowed,
                capacity_kg: Quantity::from_kg(1_000),
                temp_min_c: 0.0,
                temp_max_c: 4.0,
            },
        ))
    }
}
