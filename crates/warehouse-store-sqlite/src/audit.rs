use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use warehouse_core::audit::{AuditEvent, AuditEventType, AuditFilter, EntityType};
use warehouse_core::Page;

use crate::{
    code_column, collect_rows, json_column, not_found, opt_json_column, timestamp_column,
    SqliteWarehouseStore,
};

const AUDIT_COLUMNS: &str = "id, event_type, entity_type, entity_id, user_id,
    old_state, new_state, metadata, created_at";

impl SqliteWarehouseStore {
    /// Audit events newest first.
    pub fn list_audit_events(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        filter.validate()?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_events
                 WHERE (?1 IS NULL OR entity_type = ?1)
                   AND (?2 IS NULL OR entity_id = ?2)
                   AND (?3 IS NULL OR event_type = ?3)
                   AND (?4 IS NULL OR user_id = ?4)
                 ORDER BY id DESC
                 LIMIT ?5 OFFSET ?6"
            ))
            .context("failed to prepare audit listing")?;
        let rows = stmt
            .query_map(
                params![
                    filter.entity_type.map(EntityType::as_str),
                    filter.entity_id.as_deref(),
                    filter.event_type.map(AuditEventType::as_str),
                    filter.user_id.as_deref(),
                    filter.page.limit,
                    filter.page.offset,
                ],
                parse_audit_row,
            )
            .context("failed to list audit events")?;
        collect_rows(rows)
    }

    pub fn get_audit_event(&self, event_id: i64) -> Result<AuditEvent> {
        self.conn
            .query_row(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_events WHERE id = ?1"),
                params![event_id],
                parse_audit_row,
            )
            .optional()
            .with_context(|| format!("failed to load audit event {event_id}"))?
            .ok_or_else(|| not_found("Audit event", event_id))
    }

    /// Chronological history of one entity, oldest first.
    pub fn entity_trail(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        limit: u32,
    ) -> Result<Vec<AuditEvent>> {
        let page = Page::new(Some(limit), None, Page::default().limit)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_events
                 WHERE entity_type = ?1 AND entity_id = ?2
                 ORDER BY id ASC
                 LIMIT ?3"
            ))
            .context("failed to prepare entity trail")?;
        let rows = stmt
            .query_map(
                params![entity_type.as_str(), entity_id, page.limit],
                parse_audit_row,
            )
            .with_context(|| format!("failed to load trail for {} {entity_id}", entity_type.as_str()))?;
        collect_rows(rows)
    }
}

fn parse_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
    Ok(AuditEvent {
        id: row.get(0)?,
        event_type: code_column(row, 1, AuditEventType::parse, "audit event type")?,
        entity_type: code_column(row, 2, EntityType::parse, "entity type")?,
        entity_id: row.get(3)?,
        user_id: row.get(4)?,
        old_state: opt_json_column(row, 5)?,
        new_state: opt_json_column(row, 6)?,
        metadata: json_column(row, 7)?,
        created_at: timestamp_column(row, 8)?,
    })
}
