use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use time::OffsetDateTime;
use warehouse_core::access::{Permission, Principal};
use warehouse_core::audit::{AuditEventType, EntityType, NewAuditEvent};
use warehouse_core::genealogy::{
    is_ancestor_or_self, reachable, resolve_depth, trace_cache_key, traverse, DeepTrace,
    Direction, GenealogyEdges, GenealogyLink, Lineage, LineageNode, NewGenealogyLink,
};
use warehouse_core::{now_utc, parse_rfc3339_utc, GenealogyLinkId, LotId, WarehouseError};

use crate::inventory::{find_lot_by_code, load_lot, load_lots};
use crate::{
    append_audit, authorize, begin_write, collect_rows, id_column, not_found, opt_quantity_column,
    sql_timestamp, timestamp_column, SqliteWarehouseStore,
};

const LINK_COLUMNS: &str = "id, parent_lot_id, child_lot_id, quantity_used_grams, created_at";

// Keeps each IN list well under SQLite's bound-parameter limit.
pub(crate) const FRONTIER_CHUNK: usize = 500;

/// Genealogy links read straight from `lot_genealogy`, one frontier per query.
struct SqliteEdges<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteEdges<'c> {
    fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn links_where(&self, column: &str, lot_ids: &[LotId]) -> Result<Vec<GenealogyLink>> {
        let mut links = Vec::new();
        for chunk in lot_ids.chunks(FRONTIER_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = self
                .conn
                .prepare(&format!(
                    "SELECT {LINK_COLUMNS} FROM lot_genealogy
                     WHERE {column} IN ({placeholders})
                     ORDER BY created_at ASC, rowid ASC"
                ))
                .context("failed to prepare genealogy frontier query")?;
            let rows = stmt
                .query_map(
                    params_from_iter(chunk.iter().map(ToString::to_string)),
                    parse_link_row,
                )
                .context("failed to query genealogy frontier")?;
            links.extend(collect_rows(rows)?);
        }
        Ok(links)
    }
}

impl GenealogyEdges for SqliteEdges<'_> {
    type Error = anyhow::Error;

    fn parent_links(&self, children: &[LotId]) -> Result<Vec<GenealogyLink>> {
        self.links_where("child_lot_id", children)
    }

    fn child_links(&self, parents: &[LotId]) -> Result<Vec<GenealogyLink>> {
        self.links_where("parent_lot_id", parents)
    }
}

impl SqliteWarehouseStore {
    /// Records that `child` was produced from `parent`.
    ///
    /// Rejects links that would close a cycle and drops cached deep traces of
    /// every lot whose lineage the new edge extends.
    pub fn link_lots(&mut self, actor: &Principal, link: &NewGenealogyLink) -> Result<GenealogyLink> {
        authorize(actor, Permission::CreateRuns)?;

        let tx = begin_write(&mut self.conn)
            .context("failed to start genealogy transaction")?;
        let parent = load_lot(&tx, link.parent_lot_id)?;
        let child = load_lot(&tx, link.child_lot_id)?;
        link.validate()?;

        let edges = SqliteEdges::new(&tx);
        if is_ancestor_or_self(&edges, parent.id, child.id)? {
            return Err(WarehouseError::Conflict(format!(
                "Linking {} -> {} would create a genealogy cycle",
                parent.lot_code, child.lot_code
            ))
            .into());
        }

        let created = GenealogyLink {
            id: GenealogyLinkId::new(),
            parent_lot_id: parent.id,
            child_lot_id: child.id,
            quantity_used_kg: link.quantity_used_kg,
            created_at: now_utc(),
        };
        tx.execute(
            "INSERT INTO lot_genealogy(id, parent_lot_id, child_lot_id, quantity_used_grams, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                created.id.to_string(),
                created.parent_lot_id.to_string(),
                created.child_lot_id.to_string(),
                created.quantity_used_kg.map(|quantity| quantity.grams()),
                sql_timestamp(created.created_at)?,
            ],
        )
        .context("failed to insert genealogy link")?;
        append_audit(
            &tx,
            &NewAuditEvent::new(
                AuditEventType::GenealogyLinked,
                EntityType::LotGenealogy,
                created.id,
            )
            .by(&actor.user_id)
            .new_state(json!({
                "parent_lot_id": created.parent_lot_id.to_string(),
                "child_lot_id": created.child_lot_id.to_string(),
                "quantity_used_kg": created.quantity_used_kg,
            }))
            .metadata(json!({
                "parent_lot_code": parent.lot_code,
                "child_lot_code": child.lot_code,
            })),
        )?;

        let mut affected = BTreeSet::from([parent.id, child.id]);
        affected.extend(reachable(&edges, parent.id, Direction::Backward)?);
        affected.extend(reachable(&edges, child.id, Direction::Forward)?);
        let affected: Vec<LotId> = affected.into_iter().collect();
        let invalidated = invalidate_traces(&tx, &affected)?;
        tx.commit().context("failed to commit genealogy link")?;

        tracing::info!(
            link_id = %created.id,
            parent = %parent.lot_code,
            child = %child.lot_code,
            invalidated_traces = invalidated,
            "lots linked"
        );
        Ok(created)
    }

    /// Ancestors of `lot_id`, one level by default.
    pub fn parents(&self, lot_id: LotId, depth: Option<u8>) -> Result<Lineage> {
        self.lineage(lot_id, Direction::Backward, depth)
    }

    /// Descendants of `lot_id`, one level by default.
    pub fn children(&self, lot_id: LotId, depth: Option<u8>) -> Result<Lineage> {
        self.lineage(lot_id, Direction::Forward, depth)
    }

    /// Ancestors and descendants together, three levels by default.
    pub fn tree(&self, lot_id: LotId, depth: Option<u8>) -> Result<Lineage> {
        self.lineage(lot_id, Direction::Both, depth)
    }

    /// Full trace for a lot code, served from the cache while it is fresh.
    pub fn deep_trace(&self, lot_code: &str, refresh: bool) -> Result<DeepTrace> {
        let lot = find_lot_by_code(&self.conn, lot_code)?
            .ok_or_else(|| not_found("Lot", lot_code.trim()))?;
        let cache_key = trace_cache_key(&lot.lot_code);
        let now = now_utc();

        if !refresh {
            if let Some(mut trace) = cached_trace(&self.conn, &cache_key, now)? {
                trace.cached = true;
                tracing::debug!(cache_key = %cache_key, "deep trace cache hit");
                return Ok(trace);
            }
        }

        let trace = DeepTrace::compute(
            &SqliteEdges::new(&self.conn),
            &lot,
            self.options.deep_trace_max_depth,
            now,
        )?;
        self.conn
            .execute(
                "INSERT INTO genealogy_cache(cache_key, lot_id, payload, computed_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(cache_key) DO UPDATE SET
                   lot_id = excluded.lot_id,
                   payload = excluded.payload,
                   computed_at = excluded.computed_at,
                   expires_at = excluded.expires_at",
                params![
                    cache_key,
                    lot.id.to_string(),
                    serde_json::to_string(&trace).context("failed to serialize deep trace")?,
                    sql_timestamp(now)?,
                    sql_timestamp(now + self.options.genealogy_cache_ttl)?,
                ],
            )
            .context("failed to store deep trace")?;

        tracing::info!(
            lot_code = %lot.lot_code,
            ancestors = trace.ancestor_count,
            descendants = trace.descendant_count,
            refresh,
            "deep trace recomputed"
        );
        Ok(trace)
    }

    fn lineage(&self, lot_id: LotId, direction: Direction, depth: Option<u8>) -> Result<Lineage> {
        let depth = resolve_depth(direction, depth)?;
        let lot = load_lot(&self.conn, lot_id)?;
        let graph = traverse(&SqliteEdges::new(&self.conn), lot.id, direction, depth)?;

        let ids: Vec<LotId> = graph.nodes.iter().map(|node| node.lot_id).collect();
        let mut lots: HashMap<LotId, _> = load_lots(&self.conn, &ids)?
            .into_iter()
            .map(|lot| (lot.id, lot))
            .collect();
        let nodes = graph
            .nodes
            .into_iter()
            .map(|node| {
                let lot = lots
                    .remove(&node.lot_id)
                    .ok_or_else(|| not_found("Lot", node.lot_id))?;
                Ok(LineageNode {
                    lot,
                    depth: node.depth,
                    direction: node.direction,
                    quantity_used_kg: node.quantity_used_kg,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Lineage {
            lot,
            direction,
            depth,
            nodes,
            links: graph.links,
        })
    }
}

fn cached_trace(conn: &Connection, cache_key: &str, now: OffsetDateTime) -> Result<Option<DeepTrace>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT payload, expires_at FROM genealogy_cache WHERE cache_key = ?1",
            params![cache_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .with_context(|| format!("failed to read cache entry {cache_key}"))?;
    let Some((payload, expires_at)) = row else {
        return Ok(None);
    };
    if parse_rfc3339_utc(&expires_at)? <= now {
        return Ok(None);
    }
    let trace = serde_json::from_str(&payload)
        .with_context(|| format!("cache entry {cache_key} holds an unreadable trace"))?;
    Ok(Some(trace))
}

fn invalidate_traces(conn: &Connection, lot_ids: &[LotId]) -> Result<usize> {
    let mut removed = 0;
    for chunk in lot_ids.chunks(FRONTIER_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        removed += conn
            .execute(
                &format!("DELETE FROM genealogy_cache WHERE lot_id IN ({placeholders})"),
                params_from_iter(chunk.iter().map(ToString::to_string)),
            )
            .context("failed to invalidate deep traces")?;
    }
    Ok(removed)
}

fn parse_link_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GenealogyLink> {
    Ok(GenealogyLink {
        id: id_column(row, 0, GenealogyLinkId::parse)?,
        parent_lot_id: id_column(row, 1, LotId::parse)?,
        child_lot_id: id_column(row, 2, LotId::parse)?,
        quantity_used_kg: opt_quantity_column(row, 3)?,
        created_at: timestamp_column(row, 4)?,
    })
}
