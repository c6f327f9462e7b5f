use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use time::Date;
use warehouse_core::access::{Permission, Principal};
use warehouse_core::audit::{AuditEventType, EntityType, NewAuditEvent};
use warehouse_core::quality::Decision;
use warehouse_core::run::{
    plan_transition, step_node_id, GuardFacts, NewRun, OpenFinding, ProductionRun, RunCode,
    RunStatus, RunStepExecution, RunTransition, StepStatus,
};
use warehouse_core::{
    now_utc, FlowVersionId, IdempotencyKey, LotId, Page, RunId, StepExecutionId, WarehouseError,
};

use crate::flows::load_version;
use crate::{
    append_audit, authorize, begin_write, code_column, collect_rows, id_column, is_unique_violation,
    not_found, opt_timestamp_column, sql_opt_timestamp, sql_timestamp, step_column,
    timestamp_column, Idempotent, SqliteWarehouseStore,
};

const RUN_COLUMNS: &str = "id, run_code, flow_version_id, status, current_step_index,
    idempotency_key, created_by, hold_reason, resume_resolution, abort_reason,
    started_at, completed_at, ended_at, created_at, updated_at";

impl SqliteWarehouseStore {
    /// Creates an IDLE run pinned to a PUBLISHED flow version.
    ///
    /// A repeated idempotency key returns the run created the first time.
    pub fn create_run(&mut self, actor: &Principal, new: &NewRun) -> Result<Idempotent<ProductionRun>> {
        authorize(actor, Permission::CreateRuns)?;
        if let Some(existing) = find_run_by_key(&self.conn, new.idempotency_key)? {
            tracing::warn!(run_id = %existing.id, key = %new.idempotency_key, "replayed run creation");
            return Ok(Idempotent::replay(existing));
        }

        let tx = begin_write(&mut self.conn)
            .context("failed to start run creation transaction")?;
        if let Some(existing) = find_run_by_key(&tx, new.idempotency_key)? {
            tracing::warn!(run_id = %existing.id, "replayed run creation after key race");
            return Ok(Idempotent::replay(existing));
        }
        let version = load_version(&tx, new.flow_version_id)?;
        version.ensure_runnable()?;

        let now = now_utc();
        let run = ProductionRun {
            id: RunId::new(),
            run_code: next_run_code(&tx, now.date(), &self.options.site_code)?,
            flow_version_id: version.id,
            status: RunStatus::Idle,
            current_step_index: 0,
            idempotency_key: new.idempotency_key,
            created_by: actor.user_id.clone(),
            hold_reason: None,
            resume_resolution: None,
            abort_reason: None,
            started_at: None,
            completed_at: None,
            ended_at: None,
            created_at: now,
            updated_at: now,
        };

        let inserted = tx.execute(
            "INSERT INTO production_runs(
                id, run_code, flow_version_id, status, current_step_index,
                idempotency_key, created_by, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                run.id.to_string(),
                run.run_code.as_str(),
                run.flow_version_id.to_string(),
                run.status.as_str(),
                run.current_step_index,
                run.idempotency_key.to_string(),
                run.created_by,
                sql_timestamp(now)?,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err, "production_runs.idempotency_key") => {
                drop(tx);
                return replay_run(&self.conn, new.idempotency_key);
            }
            Err(err) => return Err(err).context("failed to insert production run"),
        }

        append_audit(
            &tx,
            &NewAuditEvent::new(AuditEventType::RunCreated, EntityType::ProductionRun, run.id)
                .by(&actor.user_id)
                .new_state(run.state_snapshot())
                .metadata(json!({
                    "run_code": run.run_code.as_str(),
                    "flow_version_id": run.flow_version_id.to_string(),
                    "flow_version_num": version.version_num,
                })),
        )?;
        tx.commit().context("failed to commit run creation")?;

        tracing::info!(run_id = %run.id, run_code = %run.run_code, "run created");
        Ok(Idempotent::fresh(run))
    }

    /// Applies one state-machine transition to a run.
    pub fn transition_run(
        &mut self,
        actor: &Principal,
        run_id: RunId,
        transition: &RunTransition,
    ) -> Result<ProductionRun> {
        let permission = match transition {
            RunTransition::Resume { .. } | RunTransition::Abort { .. } => Permission::ManageRuns,
            _ => Permission::CreateRuns,
        };
        authorize(actor, permission)?;

        let tx = begin_write(&mut self.conn)
            .context("failed to start run transition transaction")?;
        let run = load_run(&tx, run_id)?;
        let guards = match transition {
            RunTransition::Advance | RunTransition::Complete => guard_facts(&tx, &run)?,
            _ => GuardFacts::default(),
        };
        tracing::debug!(
            run_id = %run.id,
            transition = transition.name(),
            unresolved_at_step = guards.unresolved_at_step.len(),
            held_lots = guards.held_lots_at_step.len(),
            unresolved_in_run = guards.unresolved_in_run.len(),
            "evaluated run guards"
        );
        let plan = plan_transition(run.status, run.current_step_index, transition, &guards)?;

        let now = now_utc();
        let mut updated = run.clone();
        updated.status = plan.to_status;
        updated.current_step_index = plan.to_step;
        updated.updated_at = now;
        if plan.marks_started {
            updated.started_at = Some(now);
        }
        if plan.marks_completed {
            updated.completed_at = Some(now);
        }
        if plan.marks_ended {
            updated.ended_at = Some(now);
        }
        match transition {
            RunTransition::Hold { .. } => updated.hold_reason.clone_from(&plan.note),
            RunTransition::Resume { .. } => updated.resume_resolution.clone_from(&plan.note),
            RunTransition::Abort { .. } => updated.abort_reason.clone_from(&plan.note),
            RunTransition::Start | RunTransition::Advance | RunTransition::Complete => {}
        }

        if let Some(step) = plan.close_step {
            tx.execute(
                "UPDATE run_step_executions
                 SET status = ?3, completed_at = ?4
                 WHERE run_id = ?1 AND step_index = ?2",
                params![
                    run.id.to_string(),
                    step,
                    StepStatus::Completed.as_str(),
                    sql_timestamp(now)?,
                ],
            )
            .with_context(|| format!("failed to close step {step} of run {}", run.id))?;
        }
        if let Some(step) = plan.open_step {
            tx.execute(
                "INSERT INTO run_step_executions(
                    id, run_id, step_index, node_id, status, operator_id, started_at, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    StepExecutionId::new().to_string(),
                    run.id.to_string(),
                    step,
                    step_node_id(step),
                    StepStatus::InProgress.as_str(),
                    actor.user_id,
                    sql_timestamp(now)?,
                ],
            )
            .with_context(|| format!("failed to open step {step} of run {}", run.id))?;
        }

        tx.execute(
            "UPDATE production_runs
             SET status = ?2,
                 current_step_index = ?3,
                 hold_reason = ?4,
                 resume_resolution = ?5,
                 abort_reason = ?6,
                 started_at = ?7,
                 completed_at = ?8,
                 ended_at = ?9,
                 updated_at = ?10
             WHERE id = ?1",
            params![
                updated.id.to_string(),
                updated.status.as_str(),
                updated.current_step_index,
                updated.hold_reason,
                updated.resume_resolution,
                updated.abort_reason,
                sql_opt_timestamp(updated.started_at)?,
                sql_opt_timestamp(updated.completed_at)?,
                sql_opt_timestamp(updated.ended_at)?,
                sql_timestamp(now)?,
            ],
        )
        .with_context(|| format!("failed to update run {}", run.id))?;

        append_audit(
            &tx,
            &NewAuditEvent::new(plan.event_type, EntityType::ProductionRun, run.id)
                .by(&actor.user_id)
                .old_state(run.state_snapshot())
                .new_state(updated.state_snapshot())
                .metadata(json!({
                    "run_code": run.run_code.as_str(),
                    "transition": transition.name(),
                    "note": plan.note,
                })),
        )?;
        tx.commit()
            .with_context(|| format!("failed to commit {} of run {}", transition.name(), run.id))?;

        tracing::info!(
            run_id = %updated.id,
            transition = transition.name(),
            from = %plan.from_status,
            to = %plan.to_status,
            step = updated.current_step_index,
            "run transitioned"
        );
        Ok(updated)
    }

    pub fn get_run(&self, run_id: RunId) -> Result<ProductionRun> {
        load_run(&self.conn, run_id)
    }

    /// Runs newest first, optionally restricted to one status.
    pub fn list_runs(&self, status: Option<RunStatus>, page: Page) -> Result<Vec<ProductionRun>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS}
                 FROM production_runs
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY rowid DESC
                 LIMIT ?2 OFFSET ?3"
            ))
            .context("failed to prepare run listing")?;
        let rows = stmt
            .query_map(
                params![status.map(RunStatus::as_str), page.limit, page.offset],
                parse_run_row,
            )
            .context("failed to list runs")?;
        collect_rows(rows)
    }

    /// Step executions of a run in step order.
    pub fn list_step_executions(&self, run_id: RunId) -> Result<Vec<RunStepExecution>> {
        load_run(&self.conn, run_id)?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, step_index, node_id, status, operator_id,
                        started_at, completed_at, created_at
                 FROM run_step_executions
                 WHERE run_id = ?1
                 ORDER BY step_index ASC",
            )
            .context("failed to prepare step execution listing")?;
        let rows = stmt
            .query_map(params![run_id.to_string()], parse_step_row)
            .context("failed to list step executions")?;
        collect_rows(rows)
    }
}

pub(crate) fn find_run(conn: &Connection, run_id: RunId) -> Result<Option<ProductionRun>> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM production_runs WHERE id = ?1"),
        params![run_id.to_string()],
        parse_run_row,
    )
    .optional()
    .with_context(|| format!("failed to load run {run_id}"))
}

pub(crate) fn load_run(conn: &Connection, run_id: RunId) -> Result<ProductionRun> {
    find_run(conn, run_id)?.ok_or_else(|| not_found("Production run", run_id))
}

fn find_run_by_key(conn: &Connection, key: IdempotencyKey) -> Result<Option<ProductionRun>> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM production_runs WHERE idempotency_key = ?1"),
        params![key.to_string()],
        parse_run_row,
    )
    .optional()
    .context("failed to look up run by idempotency key")
}

fn replay_run(conn: &Connection, key: IdempotencyKey) -> Result<Idempotent<ProductionRun>> {
    let run = find_run_by_key(conn, key)?.ok_or_else(|| {
        anyhow::anyhow!("idempotency key {key} collided but no run carries it")
    })?;
    tracing::warn!(run_id = %run.id, key = %key, "replayed run creation after key race");
    Ok(Idempotent::replay(run))
}

/// Next free run code for `site` on `date`. Sequences restart every day.
fn next_run_code(conn: &Connection, date: Date, site: &str) -> Result<RunCode> {
    let prefix = RunCode::prefix(date, site);
    let latest: Option<String> = conn
        .query_row(
            "SELECT MAX(run_code) FROM production_runs WHERE run_code LIKE ?1",
            params![format!("{prefix}%")],
            |row| row.get(0),
        )
        .context("failed to read latest run code")?;
    let sequence = match latest {
        Some(code) => RunCode::parse(&code)?
            .sequence()
            .checked_add(1)
            .ok_or_else(|| WarehouseError::Conflict(format!("run codes exhausted for {prefix}")))?,
        None => 1,
    };
    Ok(RunCode::compose(date, site, sequence)?)
}

fn guard_facts(conn: &Connection, run: &ProductionRun) -> Result<GuardFacts> {
    let step = run.current_step_index;
    let unresolved_in_run = open_findings(conn, run.id)?;
    let unresolved_at_step = unresolved_in_run
        .iter()
        .filter(|finding| finding.step_index == step)
        .cloned()
        .collect();

    let mut stmt = conn
        .prepare(
            "SELECT lot_code FROM lots
             WHERE production_run_id = ?1 AND step_index = ?2 AND status = 'HOLD'
             ORDER BY lot_code",
        )
        .context("failed to prepare held-lot query")?;
    let rows = stmt
        .query_map(params![run.id.to_string(), step], |row| row.get::<_, String>(0))
        .context("failed to query held lots")?;
    let held_lots_at_step = collect_rows(rows)?;

    Ok(GuardFacts {
        unresolved_at_step,
        held_lots_at_step,
        unresolved_in_run,
    })
}

/// Lot/step pairs of a run whose most recent inspection is not a PASS.
fn open_findings(conn: &Connection, run_id: RunId) -> Result<Vec<OpenFinding>> {
    let mut stmt = conn
        .prepare(
            "SELECT q.lot_id, q.step_index, q.decision
             FROM qc_inspections q
             WHERE q.run_id = ?1
               AND q.decision <> 'PASS'
               AND q.rowid = (
                 SELECT MAX(latest.rowid)
                 FROM qc_inspections latest
                 WHERE latest.run_id = q.run_id
                   AND latest.lot_id = q.lot_id
                   AND latest.step_index = q.step_index
               )
             ORDER BY q.step_index, q.rowid",
        )
        .context("failed to prepare open QC finding query")?;
    let rows = stmt
        .query_map(params![run_id.to_string()], |row| {
            Ok(OpenFinding {
                lot_id: id_column(row, 0, LotId::parse)?,
                step_index: step_column(row, 1)?,
                decision: code_column(row, 2, Decision::parse, "decision")?,
            })
        })
        .context("failed to query open QC findings")?;
    collect_rows(rows)
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProductionRun> {
    let run_code: String = row.get(1)?;
    Ok(ProductionRun {
        id: id_column(row, 0, RunId::parse)?,
        run_code: RunCode::parse(&run_code)
            .map_err(|err| crate::column_error(1, err.to_string()))?,
        flow_version_id: id_column(row, 2, FlowVersionId::parse)?,
        status: code_column(row, 3, RunStatus::parse, "run status")?,
        current_step_index: step_column(row, 4)?,
        idempotency_key: id_column(row, 5, IdempotencyKey::parse)?,
        created_by: row.get(6)?,
        hold_reason: row.get(7)?,
        resume_resolution: row.get(8)?,
        abort_reason: row.get(9)?,
        started_at: opt_timestamp_column(row, 10)?,
        completed_at: opt_timestamp_column(row, 11)?,
        ended_at: opt_timestamp_column(row, 12)?,
        created_at: timestamp_column(row, 13)?,
        updated_at: timestamp_column(row, 14)?,
    })
}

fn parse_step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunStepExecution> {
    Ok(RunStepExecution {
        id: id_column(row, 0, StepExecutionId::parse)?,
        run_id: id_column(row, 1, RunId::parse)?,
        step_index: step_column(row, 2)?,
        node_id: row.get(3)?,
        status: code_column(row, 4, StepStatus::parse, "step status")?,
        operator_id: row.get(5)?,
        started_at: opt_timestamp_column(row, 6)?,
        completed_at: opt_timestamp_column(row, 7)?,
        created_at: timestamp_column(row, 8)?,
    })
}
