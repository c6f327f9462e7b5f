use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use warehouse_core::access::{Permission, Principal};
use warehouse_core::audit::{AuditEventType, EntityType, NewAuditEvent};
use warehouse_core::inventory::LotStatus;
use warehouse_core::quality::{
    Decision, InspectionFilter, MeasurementType, NewInspection, NewQcDecision,
    NewTemperatureReading, QcDecision, QcInspection, TemperatureFilter, TemperatureLog,
};
use warehouse_core::{
    now_utc, BufferId, IdempotencyKey, InspectionId, LotId, QcDecisionId, RunId,
    TemperatureLogId,
};

use crate::inventory::{load_buffer, load_lot, write_lot_status};
use crate::runs::load_run;
use crate::{
    append_audit, authorize, begin_write, bool_to_sql, code_column, collect_rows, id_column,
    is_unique_violation, not_found, opt_id_column, sql_timestamp, step_column, timestamp_column,
    Idempotent, SqliteWarehouseStore,
};

const INSPECTION_COLUMNS: &str = "id, run_id, lot_id, step_index, inspection_type, decision,
    notes, is_ccp, inspector_id, idempotency_key, inspected_at";

const TEMPERATURE_COLUMNS: &str = "id, lot_id, buffer_id, inspection_id, temperature_c,
    measurement_type, is_violation, recorded_by, recorded_at";

impl SqliteWarehouseStore {
    /// Records a step-indexed QC inspection.
    ///
    /// Inspections change no lot status; run guards read them instead.
    pub fn record_inspection(
        &mut self,
        actor: &Principal,
        new: &NewInspection,
    ) -> Result<Idempotent<QcInspection>> {
        authorize(actor, Permission::RecordQuality)?;
        if let Some(existing) = find_inspection_by_key(&self.conn, new.idempotency_key)? {
            tracing::warn!(inspection_id = %existing.id, key = %new.idempotency_key, "replayed inspection");
            return Ok(Idempotent::replay(existing));
        }
        new.validate()?;

        let tx = begin_write(&mut self.conn)
            .context("failed to start inspection transaction")?;
        if let Some(existing) = find_inspection_by_key(&tx, new.idempotency_key)? {
            tracing::warn!(inspection_id = %existing.id, "replayed inspection after key race");
            return Ok(Idempotent::replay(existing));
        }
        load_run(&tx, new.run_id)?;
        load_lot(&tx, new.lot_id)?;

        let inspection = QcInspection {
            id: InspectionId::new(),
            run_id: new.run_id,
            lot_id: new.lot_id,
            step_index: new.step_index,
            inspection_type: new.inspection_type.trim().to_string(),
            decision: new.decision,
            notes: trimmed(new.notes.as_deref()),
            is_ccp: new.is_ccp,
            inspector_id: actor.user_id.clone(),
            idempotency_key: new.idempotency_key,
            inspected_at: now_utc(),
        };
        let inserted = tx.execute(
            "INSERT INTO qc_inspections(
                id, run_id, lot_id, step_index, inspection_type, decision,
                notes, is_ccp, inspector_id, idempotency_key, inspected_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                inspection.id.to_string(),
                inspection.run_id.to_string(),
                inspection.lot_id.to_string(),
                inspection.step_index,
                inspection.inspection_type,
                inspection.decision.as_str(),
                inspection.notes,
                bool_to_sql(inspection.is_ccp),
                inspection.inspector_id,
                inspection.idempotency_key.to_string(),
                sql_timestamp(inspection.inspected_at)?,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err, "qc_inspections.idempotency_key") => {
                drop(tx);
                let existing = find_inspection_by_key(&self.conn, new.idempotency_key)?
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "idempotency key {} collided but no inspection carries it",
                            new.idempotency_key
                        )
                    })?;
                tracing::warn!(inspection_id = %existing.id, "replayed inspection after key race");
                return Ok(Idempotent::replay(existing));
            }
            Err(err) => return Err(err).context("failed to insert inspection"),
        }

        append_audit(
            &tx,
            &NewAuditEvent::new(
                AuditEventType::QcInspectionRecorded,
                EntityType::QcInspection,
                inspection.id,
            )
            .by(&actor.user_id)
            .new_state(json!({"decision": inspection.decision.as_str()}))
            .metadata(json!({
                "run_id": inspection.run_id.to_string(),
                "lot_id": inspection.lot_id.to_string(),
                "step_index": inspection.step_index,
                "inspection_type": inspection.inspection_type,
                "is_ccp": inspection.is_ccp,
            })),
        )?;
        tx.commit().context("failed to commit inspection")?;

        tracing::info!(
            inspection_id = %inspection.id,
            run_id = %inspection.run_id,
            step = inspection.step_index,
            decision = inspection.decision.as_str(),
            "inspection recorded"
        );
        Ok(Idempotent::fresh(inspection))
    }

    pub fn get_inspection(&self, inspection_id: InspectionId) -> Result<QcInspection> {
        load_inspection(&self.conn, inspection_id)
    }

    /// Inspections newest first.
    pub fn list_inspections(&self, filter: &InspectionFilter) -> Result<Vec<QcInspection>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {INSPECTION_COLUMNS} FROM qc_inspections
                 WHERE (?1 IS NULL OR run_id = ?1)
                   AND (?2 IS NULL OR lot_id = ?2)
                   AND (?3 IS NULL OR step_index = ?3)
                 ORDER BY rowid DESC
                 LIMIT ?4 OFFSET ?5"
            ))
            .context("failed to prepare inspection listing")?;
        let rows = stmt
            .query_map(
                params![
                    filter.run_id.map(|id| id.to_string()),
                    filter.lot_id.map(|id| id.to_string()),
                    filter.step_index,
                    filter.page.limit,
                    filter.page.offset,
                ],
                parse_inspection_row,
            )
            .context("failed to list inspections")?;
        collect_rows(rows)
    }

    /// Logs a temperature reading and applies the violation hold.
    ///
    /// A violating reading attached to a lot always writes a
    /// `TEMP_VIOLATION_HOLD` audit row in the same transaction. The lot itself
    /// moves to HOLD only from CREATED, QUARANTINE, or RELEASED.
    pub fn record_temperature(
        &mut self,
        actor: &Principal,
        reading: &NewTemperatureReading,
    ) -> Result<TemperatureLog> {
        authorize(actor, Permission::RecordQuality)?;
        reading.validate()?;

        let tx = begin_write(&mut self.conn)
            .context("failed to start temperature log transaction")?;
        let lot = reading
            .lot_id
            .map(|lot_id| load_lot(&tx, lot_id))
            .transpose()?;
        if let Some(buffer_id) = reading.buffer_id {
            load_buffer(&tx, buffer_id)?;
        }
        if let Some(inspection_id) = reading.inspection_id {
            load_inspection(&tx, inspection_id)?;
        }

        let now = now_utc();
        let log = TemperatureLog {
            id: TemperatureLogId::new(),
            lot_id: reading.lot_id,
            buffer_id: reading.buffer_id,
            inspection_id: reading.inspection_id,
            temperature_c: reading.temperature_c,
            measurement_type: reading.measurement_type,
            is_violation: reading.is_violation(),
            recorded_by: actor.user_id.clone(),
            recorded_at: now,
        };
        tx.execute(
            "INSERT INTO temperature_logs(
                id, lot_id, buffer_id, inspection_id, temperature_c,
                measurement_type, is_violation, recorded_by, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                log.id.to_string(),
                log.lot_id.map(|id| id.to_string()),
                log.buffer_id.map(|id| id.to_string()),
                log.inspection_id.map(|id| id.to_string()),
                log.temperature_c,
                log.measurement_type.as_str(),
                bool_to_sql(log.is_violation),
                log.recorded_by,
                sql_timestamp(now)?,
            ],
        )
        .context("failed to insert temperature log")?;
        append_audit(
            &tx,
            &NewAuditEvent::new(
                AuditEventType::TemperatureLogged,
                EntityType::TemperatureLog,
                log.id,
            )
            .by(&actor.user_id)
            .metadata(json!({
                "temperature_c": log.temperature_c,
                "measurement_type": log.measurement_type.as_str(),
                "is_violation": log.is_violation,
                "lot_id": log.lot_id.map(|id| id.to_string()),
            })),
        )?;

        if let (true, Some(lot)) = (log.is_violation, lot.as_ref()) {
            if lot.status.yields_to_temperature_hold() {
                write_lot_status(&tx, lot.id, LotStatus::Hold, now)?;
            }
            append_audit(
                &tx,
                &NewAuditEvent::new(AuditEventType::TempViolationHold, EntityType::Lot, lot.id)
                    .by(&actor.user_id)
                    .old_state(json!({"status": lot.status.as_str()}))
                    .new_state(json!({"status": LotStatus::Hold.as_str()}))
                    .metadata(json!({
                        "temperature_c": log.temperature_c,
                        "measurement_type": log.measurement_type.as_str(),
                        "threshold_violated": true,
                    })),
            )?;
            tracing::warn!(
                lot_id = %lot.id,
                lot_code = %lot.lot_code,
                temperature_c = log.temperature_c,
                measurement_type = log.measurement_type.as_str(),
                previous_status = %lot.status,
                "temperature violation placed lot on hold"
            );
        } else if log.is_violation {
            tracing::warn!(
                log_id = %log.id,
                temperature_c = log.temperature_c,
                measurement_type = log.measurement_type.as_str(),
                "temperature violation without lot"
            );
        }
        tx.commit().context("failed to commit temperature log")?;

        tracing::info!(log_id = %log.id, violation = log.is_violation, "temperature logged");
        Ok(log)
    }

    pub fn get_temperature_log(&self, log_id: TemperatureLogId) -> Result<TemperatureLog> {
        self.conn
            .query_row(
                &format!("SELECT {TEMPERATURE_COLUMNS} FROM temperature_logs WHERE id = ?1"),
                params![log_id.to_string()],
                parse_temperature_row,
            )
            .optional()
            .with_context(|| format!("failed to load temperature log {log_id}"))?
            .ok_or_else(|| not_found("Temperature log", log_id))
    }

    /// Temperature logs newest first.
    pub fn list_temperature_logs(&self, filter: &TemperatureFilter) -> Result<Vec<TemperatureLog>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TEMPERATURE_COLUMNS} FROM temperature_logs
                 WHERE (?1 IS NULL OR lot_id = ?1)
                   AND (?2 IS NULL OR buffer_id = ?2)
                   AND (?3 IS NULL OR inspection_id = ?3)
                   AND (?4 = 0 OR is_violation = 1)
                 ORDER BY rowid DESC
                 LIMIT ?5 OFFSET ?6"
            ))
            .context("failed to prepare temperature log listing")?;
        let rows = stmt
            .query_map(
                params![
                    filter.lot_id.map(|id| id.to_string()),
                    filter.buffer_id.map(|id| id.to_string()),
                    filter.inspection_id.map(|id| id.to_string()),
                    bool_to_sql(filter.violations_only),
                    filter.page.limit,
                    filter.page.offset,
                ],
                parse_temperature_row,
            )
            .context("failed to list temperature logs")?;
        collect_rows(rows)
    }

    /// Records a gate decision through the legacy decision surface.
    pub fn record_qc_decision(
        &mut self,
        actor: &Principal,
        new: &NewQcDecision,
    ) -> Result<QcDecision> {
        authorize(actor, Permission::RecordQuality)?;
        new.validate()?;

        let tx = begin_write(&mut self.conn)
            .context("failed to start QC decision transaction")?;
        if let Some(lot_id) = new.lot_id {
            load_lot(&tx, lot_id)?;
        }
        let decision = QcDecision {
            id: QcDecisionId::new(),
            lot_id: new.lot_id,
            gate_id: trimmed(new.gate_id.as_deref()),
            decision: new.decision,
            notes: trimmed(new.notes.as_deref()),
            temperature_c: new.temperature_c,
            digital_signature: new.digital_signature.clone(),
            decided_by: actor.user_id.clone(),
            decided_at: now_utc(),
        };
        tx.execute(
            "INSERT INTO qc_decisions(
                id, lot_id, gate_id, decision, notes, temperature_c,
                digital_signature, decided_by, decided_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                decision.id.to_string(),
                decision.lot_id.map(|id| id.to_string()),
                decision.gate_id,
                decision.decision.as_str(),
                decision.notes,
                decision.temperature_c,
                decision.digital_signature,
                decision.decided_by,
                sql_timestamp(decision.decided_at)?,
            ],
        )
        .context("failed to insert QC decision")?;
        append_audit(
            &tx,
            &NewAuditEvent::new(
                AuditEventType::QcDecisionRecorded,
                EntityType::QcDecision,
                decision.id,
            )
            .by(&actor.user_id)
            .new_state(json!({"decision": decision.decision.as_str()}))
            .metadata(json!({
                "lot_id": decision.lot_id.map(|id| id.to_string()),
                "gate_id": decision.gate_id,
                "signed": decision.digital_signature.is_some(),
            })),
        )?;
        tx.commit().context("failed to commit QC decision")?;

        tracing::info!(decision_id = %decision.id, decision = decision.decision.as_str(), "QC decision recorded");
        Ok(decision)
    }
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn load_inspection(conn: &Connection, inspection_id: InspectionId) -> Result<QcInspection> {
    conn.query_row(
        &format!("SELECT {INSPECTION_COLUMNS} FROM qc_inspections WHERE id = ?1"),
        params![inspection_id.to_string()],
        parse_inspection_row,
    )
    .optional()
    .with_context(|| format!("failed to load inspection {inspection_id}"))?
    .ok_or_else(|| not_found("QC inspection", inspection_id))
}

fn find_inspection_by_key(conn: &Connection, key: IdempotencyKey) -> Result<Option<QcInspection>> {
    conn.query_row(
        &format!("SELECT {INSPECTION_COLUMNS} FROM qc_inspections WHERE idempotency_key = ?1"),
        params![key.to_string()],
        parse_inspection_row,
    )
    .optional()
    .context("failed to look up inspection by idempotency key")
}

fn parse_inspection_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QcInspection> {
    Ok(QcInspection {
        id: id_column(row, 0, InspectionId::parse)?,
        run_id: id_column(row, 1, RunId::parse)?,
        lot_id: id_column(row, 2, LotId::parse)?,
        step_index: step_column(row, 3)?,
        inspection_type: row.get(4)?,
        decision: code_column(row, 5, Decision::parse, "decision")?,
        notes: row.get(6)?,
        is_ccp: row.get(7)?,
        inspector_id: row.get(8)?,
        idempotency_key: id_column(row, 9, IdempotencyKey::parse)?,
        inspected_at: timestamp_column(row, 10)?,
    })
}

fn parse_temperature_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TemperatureLog> {
    Ok(TemperatureLog {
        id: id_column(row, 0, TemperatureLogId::parse)?,
        lot_id: opt_id_column(row, 1, LotId::parse)?,
        buffer_id: opt_id_column(row, 2, BufferId::parse)?,
        inspection_id: opt_id_column(row, 3, InspectionId::parse)?,
        temperature_c: row.get(4)?,
        measurement_type: code_column(row, 5, MeasurementType::parse, "measurement type")?,
        is_violation: row.get(6)?,
        recorded_by: row.get(7)?,
        recorded_at: timestamp_column(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else, clippy::float_cmp, clippy::too_many_lines)]

    use warehouse_core::access::Role;
    use warehouse_core::audit::AuditFilter;
    use warehouse_core::inventory::{Lot, LotType};
    use warehouse_core::Page;

    use super::*;
    use crate::fixtures::{
        failure_code, fixture_lot, fixture_run, fixture_store, must, operator,
    };

    fn manager() -> Principal {
        Principal::new("u-manager", Role::Manager)
    }

    fn surface(lot: &Lot, temperature_c: f64) -> NewTemperatureReading {
        NewTemperatureReading {
            temperature_c,
            measurement_type: MeasurementType::Surface,
            lot_id: Some(lot.id),
            buffer_id: None,
            inspection_id: None,
        }
    }

    fn hold_events(store: &SqliteWarehouseStore, lot: &Lot) -> usize {
        must(store.list_audit_events(&AuditFilter {
            entity_type: Some(EntityType::Lot),
            entity_id: Some(lot.id.to_string()),
            event_type: Some(AuditEventType::TempViolationHold),
            ..AuditFilter::default()
        }))
        .len()
    }

    fn inspection(run_id: RunId, lot_id: LotId, decision: Decision, notes: Option<&str>) -> NewInspection {
        NewInspection {
            run_id,
            lot_id,
            step_index: 2,
            inspection_type: "core temperature".to_string(),
            decision,
            notes: notes.map(str::to_string),
            is_ccp: true,
            idempotency_key: IdempotencyKey::generate(),
        }
    }

    #[test]
    fn surface_violation_holds_released_lot_once() {
        let mut store = fixture_store();
        let lot = fixture_lot(&mut store, "LOT-TEMP-1", LotType::Raw, None);
        must(store.set_lot_status(&manager(), lot.id, LotStatus::Released));

        let log = must(store.record_temperature(&operator(), &surface(&lot, 5.5)));
        assert!(log.is_violation);
        assert_eq!(must(store.get_lot(lot.id)).status, LotStatus::Hold);
        assert_eq!(hold_events(&store, &lot), 1);

        let events = must(store.list_audit_events(&AuditFilter {
            event_type: Some(AuditEventType::TempViolationHold),
            ..AuditFilter::default()
        }));
        assert_eq!(events[0].old_state, Some(json!({"status": "RELEASED"})));
        assert_eq!(events[0].new_state, Some(json!({"status": "HOLD"})));
        assert_eq!(events[0].metadata["threshold_violated"], json!(true));
        assert_eq!(events[0].metadata["measurement_type"], json!("SURFACE"));
        assert_eq!(events[0].user_id.as_deref(), Some("u-operator"));
    }

    #[test]
    fn reading_within_threshold_changes_nothing() {
        let mut store = fixture_store();
        let lot = fixture_lot(&mut store, "LOT-TEMP-2", LotType::Raw, None);
        must(store.set_lot_status(&manager(), lot.id, LotStatus::Released));

        let log = must(store.record_temperature(&operator(), &surface(&lot, 3.5)));
        assert!(!log.is_violation);
        assert_eq!(must(store.get_lot(lot.id)).status, LotStatus::Released);
        assert_eq!(hold_events(&store, &lot), 0);

        let boundary = must(store.record_temperature(&operator(), &surface(&lot, 4.0)));
        assert!(!boundary.is_violation);
    }

    #[test]
    fn terminal_lots_keep_status_but_violation_is_audited() {
        let mut store = fixture_store();
        let lot = fixture_lot(&mut store, "LOT-TEMP-3", LotType::Raw, None);
        must(store.set_lot_status(&manager(), lot.id, LotStatus::Rejected));

        must(store.record_temperature(&operator(), &surface(&lot, 9.0)));
        assert_eq!(must(store.get_lot(lot.id)).status, LotStatus::Rejected);
        assert_eq!(hold_events(&store, &lot), 1);
    }

    #[test]
    fn frozen_core_threshold_is_minus_eighteen() {
        let mut store = fixture_store();
        let lot = fixture_lot(&mut store, "LOT-FRZ-1", LotType::Frz, None);
        let core = |temperature_c| NewTemperatureReading {
            temperature_c,
            measurement_type: MeasurementType::Core,
            lot_id: Some(lot.id),
            buffer_id: None,
            inspection_id: None,
        };
        assert!(!must(store.record_temperature(&operator(), &core(-20.0))).is_violation);
        assert!(must(store.record_temperature(&operator(), &core(-17.5))).is_violation);
        assert_eq!(must(store.get_lot(lot.id)).status, LotStatus::Hold);

        let violations = must(store.list_temperature_logs(&TemperatureFilter {
            lot_id: Some(lot.id),
            violations_only: true,
            ..TemperatureFilter::default()
        }));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].temperature_c, -17.5);
        assert_eq!(must(store.get_temperature_log(violations[0].id)).id, violations[0].id);
    }

    #[test]
    fn notes_rule_applies_to_inspections_and_decisions() {
        let mut store = fixture_store();
        let run = fixture_run(&mut store);
        let lot = fixture_lot(&mut store, "LOT-QC-1", LotType::Mix, Some((run.id, 2)));

        assert_eq!(
            failure_code(store.record_inspection(
                &operator(),
                &inspection(run.id, lot.id, Decision::Hold, None)
            )),
            "validation_error"
        );
        assert_eq!(
            failure_code(store.record_inspection(
                &operator(),
                &inspection(run.id, lot.id, Decision::Fail, Some("123456789"))
            )),
            "validation_error"
        );
        let recorded = must(store.record_inspection(
            &operator(),
            &inspection(run.id, lot.id, Decision::Fail, Some("1234567890")),
        ));
        assert_eq!(recorded.value.notes.as_deref(), Some("1234567890"));

        let legacy = NewQcDecision {
            lot_id: Some(lot.id),
            gate_id: Some("gate-3".to_string()),
            decision: Decision::Hold,
            notes: Some("short".to_string()),
            temperature_c: Some(3.0),
            digital_signature: None,
        };
        assert_eq!(
            failure_code(store.record_qc_decision(&operator(), &legacy)),
            "validation_error"
        );
        let accepted = must(store.record_qc_decision(
            &operator(),
            &NewQcDecision {
                notes: Some("metal detector flagged".to_string()),
                ..legacy
            },
        ));
        assert_eq!(accepted.decided_by, "u-operator");
        assert_eq!(must(store.get_lot(lot.id)).status, LotStatus::Created);
    }

    #[test]
    fn inspection_replays_by_key_and_lists_newest_first() {
        let mut store = fixture_store();
        let run = fixture_run(&mut store);
        let lot = fixture_lot(&mut store, "LOT-QC-2", LotType::Mix, Some((run.id, 2)));
        let first = inspection(run.id, lot.id, Decision::Pass, None);

        let recorded = must(store.record_inspection(&operator(), &first));
        let replay = must(store.record_inspection(&operator(), &first));
        assert!(replay.replayed);
        assert_eq!(replay.value.id, recorded.value.id);

        let second = must(store.record_inspection(
            &operator(),
            &inspection(run.id, lot.id, Decision::Hold, Some("needs a second look")),
        ));
        let listed = must(store.list_inspections(&InspectionFilter {
            run_id: Some(run.id),
            step_index: Some(2),
            page: Page::default(),
            ..InspectionFilter::default()
        }));
        assert_eq!(
            listed.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![second.value.id, recorded.value.id]
        );

        let viewer = Principal::new("u-viewer", Role::Viewer);
        assert_eq!(
            failure_code(store.record_inspection(
                &viewer,
                &inspection(run.id, lot.id, Decision::Pass, None)
            )),
            "forbidden"
        );
        assert_eq!(
            failure_code(store.get_inspection(InspectionId::new())),
            "not_found"
        );
    }

    #[test]
    fn storage_rejects_unnoted_hold_inspections() {
        let mut store = fixture_store();
        let run = fixture_run(&mut store);
        let lot = fixture_lot(&mut store, "LOT-QC-3", LotType::Mix, None);
        let raw = store.connection().execute(
            "INSERT INTO qc_inspections(
                id, run_id, lot_id, step_index, inspection_type, decision,
                inspector_id, idempotency_key, inspected_at
             ) VALUES (?1, ?2, ?3, 1, 'visual', 'HOLD', 'u', ?4, '2026-01-01T00:00:00Z')",
            params![
                InspectionId::new().to_string(),
                run.id.to_string(),
                lot.id.to_string(),
                IdempotencyKey::generate().to_string()
            ],
        );
        assert!(raw.is_err());
    }
}
