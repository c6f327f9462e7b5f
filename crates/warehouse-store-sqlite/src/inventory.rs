use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use time::OffsetDateTime;
use warehouse_core::access::{Permission, Principal};
use warehouse_core::audit::{AuditEventType, EntityType, NewAuditEvent};
use warehouse_core::inventory::{
    plan_withdrawal, Buffer, BufferSummary, BufferType, BufferUpdate, InventoryFilter,
    InventoryItem, Lot, LotStatus, LotType, MoveFilter, MoveRequest, MoveType, NewBuffer, NewLot,
    StockMove, Withdrawal,
};
use warehouse_core::{
    now_utc, BufferId, IdempotencyKey, InventoryItemId, LotId, Page, Quantity, RunId, StockMoveId,
    WarehouseError,
};

use crate::genealogy::FRONTIER_CHUNK;
use crate::runs::load_run;
use crate::{
    append_audit, authorize, begin_write, bool_to_sql, code_column, collect_rows, column_error,
    id_column, is_unique_violation, json_column, not_found, opt_id_column, opt_quantity_column,
    opt_step_column, opt_timestamp_column, quantity_column, sql_timestamp, timestamp_column,
    Idempotent, SqliteWarehouseStore,
};

const LOT_COLUMNS: &str = "id, lot_code, lot_type, status, production_run_id, step_index,
    weight_grams, temperature_c, operator_id, metadata, created_at, updated_at";

const BUFFER_COLUMNS: &str = "b.id, b.buffer_code, b.buffer_type, b.allowed_lot_types,
    b.capacity_grams, b.temp_min_c, b.temp_max_c, b.is_active, b.created_at, b.updated_at";

const ITEM_COLUMNS: &str = "id, lot_id, buffer_id, run_id, quantity_grams, entered_at, exited_at";

const MOVE_COLUMNS: &str = "id, lot_id, from_buffer_id, to_buffer_id, quantity_grams,
    move_type, operator_id, idempotency_key, created_at";

impl SqliteWarehouseStore {
    pub fn create_lot(&mut self, actor: &Principal, new: &NewLot) -> Result<Lot> {
        authorize(actor, Permission::CreateRuns)?;
        new.validate()?;

        let tx = begin_write(&mut self.conn)
            .context("failed to start lot creation transaction")?;
        if let Some(run_id) = new.production_run_id {
            load_run(&tx, run_id)?;
        }

        let now = now_utc();
        let lot = Lot {
            id: LotId::new(),
            lot_code: new.lot_code.trim().to_string(),
            lot_type: new.lot_type,
            status: LotStatus::Created,
            production_run_id: new.production_run_id,
            step_index: new.step_index,
            weight_kg: new.weight_kg,
            temperature_c: new.temperature_c,
            operator_id: Some(actor.user_id.clone()),
            metadata: new.metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        let inserted = tx.execute(
            "INSERT INTO lots(
                id, lot_code, lot_type, status, production_run_id, step_index,
                weight_grams, temperature_c, operator_id, metadata, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                lot.id.to_string(),
                lot.lot_code,
                lot.lot_type.as_str(),
                lot.status.as_str(),
                lot.production_run_id.map(|id| id.to_string()),
                lot.step_index,
                lot.weight_kg.map(Quantity::grams),
                lot.temperature_c,
                lot.operator_id,
                serde_json::to_string(&lot.metadata).context("failed to serialize lot metadata")?,
                sql_timestamp(now)?,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err, "lots.lot_code") => {
                return Err(WarehouseError::Conflict(format!(
                    "Lot code {} already exists",
                    lot.lot_code
                ))
                .into());
            }
            Err(err) => return Err(err).context("failed to insert lot"),
        }

        append_audit(
            &tx,
            &NewAuditEvent::new(AuditEventType::LotCreated, EntityType::Lot, lot.id)
                .by(&actor.user_id)
                .new_state(json!({"status": lot.status.as_str()}))
                .metadata(json!({
                    "lot_code": lot.lot_code,
                    "lot_type": lot.lot_type.as_str(),
                    "production_run_id": lot.production_run_id.map(|id| id.to_string()),
                })),
        )?;
        tx.commit().context("failed to commit lot creation")?;

        tracing::info!(lot_id = %lot.id, lot_code = %lot.lot_code, "lot created");
        Ok(lot)
    }

    /// Moves a lot along its status lifecycle.
    pub fn set_lot_status(
        &mut self,
        actor: &Principal,
        lot_id: LotId,
        status: LotStatus,
    ) -> Result<Lot> {
        authorize(actor, Permission::ManageRuns)?;
        let tx = begin_write(&mut self.conn)
            .context("failed to start lot status transaction")?;
        let mut lot = load_lot(&tx, lot_id)?;
        lot.status.ensure_transition(status)?;

        let now = now_utc();
        write_lot_status(&tx, lot.id, status, now)?;
        append_audit(
            &tx,
            &NewAuditEvent::new(AuditEventType::LotStatusChanged, EntityType::Lot, lot.id)
                .by(&actor.user_id)
                .old_state(json!({"status": lot.status.as_str()}))
                .new_state(json!({"status": status.as_str()})),
        )?;
        tx.commit().context("failed to commit lot status change")?;

        tracing::info!(lot_id = %lot.id, from = %lot.status, to = %status, "lot status changed");
        lot.status = status;
        lot.updated_at = now;
        Ok(lot)
    }

    pub fn get_lot(&self, lot_id: LotId) -> Result<Lot> {
        load_lot(&self.conn, lot_id)
    }

    pub fn get_lot_by_code(&self, lot_code: &str) -> Result<Lot> {
        find_lot_by_code(&self.conn, lot_code)?.ok_or_else(|| not_found("Lot", lot_code))
    }

    /// Lots newest first, optionally restricted to one run.
    pub fn list_lots(&self, run_id: Option<RunId>, page: Page) -> Result<Vec<Lot>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {LOT_COLUMNS} FROM lots
                 WHERE (?1 IS NULL OR production_run_id = ?1)
                 ORDER BY rowid DESC
                 LIMIT ?2 OFFSET ?3"
            ))
            .context("failed to prepare lot listing")?;
        let rows = stmt
            .query_map(
                params![run_id.map(|id| id.to_string()), page.limit, page.offset],
                parse_lot_row,
            )
            .context("failed to list lots")?;
        collect_rows(rows)
    }

    pub fn create_buffer(&mut self, actor: &Principal, new: &NewBuffer) -> Result<Buffer> {
        authorize(actor, Permission::CreateRuns)?;
        new.validate()?;

        let now = now_utc();
        let buffer = Buffer {
            id: BufferId::new(),
            buffer_code: new.buffer_code.trim().to_string(),
            buffer_type: new.buffer_type,
            allowed_lot_types: new.allowed_lot_types.clone(),
            capacity_kg: new.capacity_kg,
            temp_min_c: new.temp_min_c,
            temp_max_c: new.temp_max_c,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        let tx = begin_write(&mut self.conn)
            .context("failed to start buffer creation transaction")?;
        let inserted = tx.execute(
            "INSERT INTO buffers(
                id, buffer_code, buffer_type, allowed_lot_types, capacity_grams,
                temp_min_c, temp_max_c, is_active, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
            params![
                buffer.id.to_string(),
                buffer.buffer_code,
                buffer.buffer_type.as_str(),
                allowed_types_json(&buffer.allowed_lot_types)?,
                buffer.capacity_kg.grams(),
                buffer.temp_min_c,
                buffer.temp_max_c,
                sql_timestamp(now)?,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err, "buffers.buffer_code") => {
                return Err(WarehouseError::Conflict(format!(
                    "Buffer code {} already exists",
                    buffer.buffer_code
                ))
                .into());
            }
            Err(err) => return Err(err).context("failed to insert buffer"),
        }

        append_audit(
            &tx,
            &NewAuditEvent::new(AuditEventType::BufferCreated, EntityType::Buffer, buffer.id)
                .by(&actor.user_id)
                .new_state(buffer_snapshot(&buffer))
                .metadata(json!({"buffer_code": buffer.buffer_code})),
        )?;
        tx.commit().context("failed to commit buffer creation")?;

        tracing::info!(buffer_id = %buffer.id, buffer_code = %buffer.buffer_code, "buffer created");
        Ok(buffer)
    }

    pub fn update_buffer(
        &mut self,
        actor: &Principal,
        buffer_id: BufferId,
        update: &BufferUpdate,
    ) -> Result<Buffer> {
        authorize(actor, Permission::CreateRuns)?;
        if update.is_empty() {
            return Err(
                WarehouseError::Validation("no buffer fields to update".to_string()).into(),
            );
        }

        let tx = begin_write(&mut self.conn)
            .context("failed to start buffer update transaction")?;
        let current = load_buffer(&tx, buffer_id)?;
        let mut updated = update.apply(&current)?;
        updated.updated_at = now_utc();

        tx.execute(
            "UPDATE buffers
             SET capacity_grams = ?2, temp_min_c = ?3, temp_max_c = ?4, is_active = ?5,
                 updated_at = ?6
             WHERE id = ?1",
            params![
                updated.id.to_string(),
                updated.capacity_kg.grams(),
                updated.temp_min_c,
                updated.temp_max_c,
                bool_to_sql(updated.is_active),
                sql_timestamp(updated.updated_at)?,
            ],
        )
        .with_context(|| format!("failed to update buffer {buffer_id}"))?;
        append_audit(
            &tx,
            &NewAuditEvent::new(AuditEventType::BufferUpdated, EntityType::Buffer, buffer_id)
                .by(&actor.user_id)
                .old_state(buffer_snapshot(&current))
                .new_state(buffer_snapshot(&updated)),
        )?;
        tx.commit().context("failed to commit buffer update")?;

        tracing::info!(buffer_id = %buffer_id, "buffer updated");
        Ok(updated)
    }

    pub fn get_buffer(&self, buffer_id: BufferId) -> Result<Buffer> {
        load_buffer(&self.conn, buffer_id)
    }

    /// Active buffers with their current open quantity, ordered by code.
    pub fn list_buffers(&self, buffer_type: Option<BufferType>) -> Result<Vec<BufferSummary>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {BUFFER_COLUMNS},
                        COALESCE(SUM(i.quantity_grams), 0),
                        COUNT(i.id)
                 FROM buffers b
                 LEFT JOIN inventory_items i
                   ON i.buffer_id = b.id AND i.exited_at IS NULL
                 WHERE b.is_active = 1 AND (?1 IS NULL OR b.buffer_type = ?1)
                 GROUP BY b.id
                 ORDER BY b.buffer_code"
            ))
            .context("failed to prepare buffer listing")?;
        let rows = stmt
            .query_map(params![buffer_type.map(BufferType::as_str)], |row| {
                let count: i64 = row.get(11)?;
                Ok(BufferSummary {
                    buffer: parse_buffer_row(row)?,
                    current_quantity_kg: quantity_column(row, 10)?,
                    item_count: u32::try_from(count)
                        .map_err(|_| column_error(11, format!("invalid item count: {count}")))?,
                })
            })
            .context("failed to list buffers")?;
        collect_rows(rows)
    }

    /// Executes one receive, transfer, consume, or ship against the ledger.
    ///
    /// Checks run in order: idempotency replay, target buffer purity, then
    /// source quantity. Exactly one stock move is appended per committed call.
    pub fn move_stock(
        &mut self,
        actor: &Principal,
        request: &MoveRequest,
        idempotency_key: IdempotencyKey,
    ) -> Result<Idempotent<StockMove>> {
        authorize(actor, Permission::CreateRuns)?;
        if let Some(existing) = find_move_by_key(&self.conn, idempotency_key)? {
            tracing::warn!(move_id = %existing.id, key = %idempotency_key, "replayed stock move");
            return Ok(Idempotent::replay(existing));
        }
        request.validate()?;

        let tx = begin_write(&mut self.conn)
            .context("failed to start stock move transaction")?;
        if let Some(existing) = find_move_by_key(&tx, idempotency_key)? {
            tracing::warn!(move_id = %existing.id, "replayed stock move after key race");
            return Ok(Idempotent::replay(existing));
        }
        let lot = load_lot(&tx, request.lot_id())?;
        let quantity = request.quantity();

        if let Some(target_id) = request.target() {
            load_buffer(&tx, target_id)?.ensure_accepts(lot.lot_type)?;
        }
        let mut inherited_run = match request {
            MoveRequest::Receive { run_id, .. } => Some(load_run(&tx, *run_id)?.id),
            _ => None,
        };

        let now = now_utc();
        if let Some(source_id) = request.source() {
            load_buffer(&tx, source_id)?;
            let item = open_item(&tx, lot.id, source_id)?.ok_or_else(|| {
                WarehouseError::Validation("Lot not found in source buffer".to_string())
            })?;
            withdraw(&tx, &item, quantity, now)?;
            inherited_run = item.run_id;
        }
        if let Some(target_id) = request.target() {
            deposit(&tx, lot.id, target_id, inherited_run, quantity, now)?;
        }

        let stock_move = StockMove {
            id: StockMoveId::new(),
            lot_id: lot.id,
            from_buffer_id: request.source(),
            to_buffer_id: request.target(),
            quantity_kg: quantity,
            move_type: request.move_type(),
            operator_id: Some(actor.user_id.clone()),
            idempotency_key,
            created_at: now,
        };
        let inserted = tx.execute(
            "INSERT INTO stock_moves(
                id, lot_id, from_buffer_id, to_buffer_id, quantity_grams,
                move_type, operator_id, idempotency_key, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                stock_move.id.to_string(),
                stock_move.lot_id.to_string(),
                stock_move.from_buffer_id.map(|id| id.to_string()),
                stock_move.to_buffer_id.map(|id| id.to_string()),
                quantity.grams(),
                stock_move.move_type.as_str(),
                stock_move.operator_id,
                idempotency_key.to_string(),
                sql_timestamp(now)?,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err, "stock_moves.idempotency_key") => {
                drop(tx);
                let existing = find_move_by_key(&self.conn, idempotency_key)?.ok_or_else(|| {
                    anyhow::anyhow!("idempotency key {idempotency_key} collided but no move carries it")
                })?;
                tracing::warn!(move_id = %existing.id, "replayed stock move after key race");
                return Ok(Idempotent::replay(existing));
            }
            Err(err) => return Err(err).context("failed to insert stock move"),
        }

        append_audit(
            &tx,
            &NewAuditEvent::new(move_event(stock_move.move_type), EntityType::StockMove, stock_move.id)
                .by(&actor.user_id)
                .metadata(json!({
                    "lot_id": lot.id.to_string(),
                    "lot_code": lot.lot_code,
                    "from_buffer_id": stock_move.from_buffer_id.map(|id| id.to_string()),
                    "to_buffer_id": stock_move.to_buffer_id.map(|id| id.to_string()),
                    "quantity_kg": quantity.to_string(),
                })),
        )?;
        tx.commit().context("failed to commit stock move")?;

        tracing::info!(
            move_id = %stock_move.id,
            move_type = stock_move.move_type.as_str(),
            lot_id = %lot.id,
            quantity_kg = %quantity,
            "stock moved"
        );
        Ok(Idempotent::fresh(stock_move))
    }

    pub fn list_inventory(&self, filter: &InventoryFilter) -> Result<Vec<InventoryItem>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM inventory_items
                 WHERE (?1 IS NULL OR buffer_id = ?1)
                   AND (?2 IS NULL OR lot_id = ?2)
                   AND (?3 = 0 OR exited_at IS NULL)
                 ORDER BY rowid ASC"
            ))
            .context("failed to prepare inventory listing")?;
        let rows = stmt
            .query_map(
                params![
                    filter.buffer_id.map(|id| id.to_string()),
                    filter.lot_id.map(|id| id.to_string()),
                    bool_to_sql(filter.active_only),
                ],
                parse_item_row,
            )
            .context("failed to list inventory")?;
        collect_rows(rows)
    }

    /// Stock moves newest first.
    pub fn list_moves(&self, filter: &MoveFilter) -> Result<Vec<StockMove>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MOVE_COLUMNS} FROM stock_moves
                 WHERE (?1 IS NULL OR lot_id = ?1)
                   AND (?2 IS NULL OR from_buffer_id = ?2 OR to_buffer_id = ?2)
                   AND (?3 IS NULL OR move_type = ?3)
                 ORDER BY rowid DESC
                 LIMIT ?4 OFFSET ?5"
            ))
            .context("failed to prepare stock move listing")?;
        let rows = stmt
            .query_map(
                params![
                    filter.lot_id.map(|id| id.to_string()),
                    filter.buffer_id.map(|id| id.to_string()),
                    filter.move_type.map(MoveType::as_str),
                    filter.page.limit,
                    filter.page.offset,
                ],
                parse_move_row,
            )
            .context("failed to list stock moves")?;
        collect_rows(rows)
    }
}

pub(crate) fn load_lot(conn: &Connection, lot_id: LotId) -> Result<Lot> {
    conn.query_row(
        &format!("SELECT {LOT_COLUMNS} FROM lots WHERE id = ?1"),
        params![lot_id.to_string()],
        parse_lot_row,
    )
    .optional()
    .with_context(|| format!("failed to load lot {lot_id}"))?
    .ok_or_else(|| not_found("Lot", lot_id))
}

/// Loads every lot in `lot_ids`, one query per `FRONTIER_CHUNK` ids.
pub(crate) fn load_lots(conn: &Connection, lot_ids: &[LotId]) -> Result<Vec<Lot>> {
    let mut lots = Vec::with_capacity(lot_ids.len());
    for chunk in lot_ids.chunks(FRONTIER_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {LOT_COLUMNS} FROM lots WHERE id IN ({placeholders})"
            ))
            .context("failed to prepare lot batch lookup")?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(chunk.iter().map(ToString::to_string)),
                parse_lot_row,
            )
            .context("failed to load lot batch")?;
        lots.extend(collect_rows(rows)?);
    }
    Ok(lots)
}

pub(crate) fn find_lot_by_code(conn: &Connection, lot_code: &str) -> Result<Option<Lot>> {
    conn.query_row(
        &format!("SELECT {LOT_COLUMNS} FROM lots WHERE lot_code = ?1"),
        params![lot_code.trim()],
        parse_lot_row,
    )
    .optional()
    .with_context(|| format!("failed to load lot by code {lot_code}"))
}

pub(crate) fn write_lot_status(
    conn: &Connection,
    lot_id: LotId,
    status: LotStatus,
    now: OffsetDateTime,
) -> Result<()> {
    conn.execute(
        "UPDATE lots SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![lot_id.to_string(), status.as_str(), sql_timestamp(now)?],
    )
    .with_context(|| format!("failed to set lot {lot_id} to {status}"))?;
    Ok(())
}

pub(crate) fn load_buffer(conn: &Connection, buffer_id: BufferId) -> Result<Buffer> {
    conn.query_row(
        &format!("SELECT {BUFFER_COLUMNS} FROM buffers b WHERE b.id = ?1"),
        params![buffer_id.to_string()],
        parse_buffer_row,
    )
    .optional()
    .with_context(|| format!("failed to load buffer {buffer_id}"))?
    .ok_or_else(|| not_found("Buffer", buffer_id))
}

fn open_item(conn: &Connection, lot_id: LotId, buffer_id: BufferId) -> Result<Option<InventoryItem>> {
    conn.query_row(
        &format!(
            "SELECT {ITEM_COLUMNS} FROM inventory_items
             WHERE lot_id = ?1 AND buffer_id = ?2 AND exited_at IS NULL"
        ),
        params![lot_id.to_string(), buffer_id.to_string()],
        parse_item_row,
    )
    .optional()
    .context("failed to look up open inventory item")
}

/// Takes `quantity` out of `item`, closing it when drained.
fn withdraw(
    conn: &Connection,
    item: &InventoryItem,
    quantity: Quantity,
    now: OffsetDateTime,
) -> Result<()> {
    match plan_withdrawal(item.quantity_kg, quantity)? {
        Withdrawal::Partial { remaining } => conn.execute(
            "UPDATE inventory_items SET quantity_grams = ?2 WHERE id = ?1",
            params![item.id.to_string(), remaining.grams()],
        ),
        Withdrawal::Full => conn.execute(
            "UPDATE inventory_items SET exited_at = ?2 WHERE id = ?1",
            params![item.id.to_string(), sql_timestamp(now)?],
        ),
    }
    .with_context(|| format!("failed to withdraw from inventory item {}", item.id))?;
    Ok(())
}

/// Adds `quantity` to the open item for `(lot, buffer)`, opening one if needed.
fn deposit(
    conn: &Connection,
    lot_id: LotId,
    buffer_id: BufferId,
    run_id: Option<RunId>,
    quantity: Quantity,
    now: OffsetDateTime,
) -> Result<()> {
    if let Some(existing) = open_item(conn, lot_id, buffer_id)? {
        let total = existing
            .quantity_kg
            .checked_add(quantity)
            .ok_or_else(|| WarehouseError::Validation("quantity_kg overflows".to_string()))?;
        conn.execute(
            "UPDATE inventory_items SET quantity_grams = ?2 WHERE id = ?1",
            params![existing.id.to_string(), total.grams()],
        )
        .with_context(|| format!("failed to top up inventory item {}", existing.id))?;
        return Ok(());
    }
    conn.execute(
        "INSERT INTO inventory_items(id, lot_id, buffer_id, run_id, quantity_grams, entered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            InventoryItemId::new().to_string(),
            lot_id.to_string(),
            buffer_id.to_string(),
            run_id.map(|id| id.to_string()),
            quantity.grams(),
            sql_timestamp(now)?,
        ],
    )
    .context("failed to open inventory item")?;
    Ok(())
}

fn find_move_by_key(conn: &Connection, key: IdempotencyKey) -> Result<Option<StockMove>> {
    conn.query_row(
        &format!("SELECT {MOVE_COLUMNS} FROM stock_moves WHERE idempotency_key = ?1"),
        params![key.to_string()],
        parse_move_row,
    )
    .optional()
    .context("failed to look up stock move by idempotency key")
}

fn move_event(move_type: MoveType) -> AuditEventType {
    match move_type {
        MoveType::Receive => AuditEventType::InventoryReceived,
        MoveType::Transfer => AuditEventType::InventoryTransferred,
        MoveType::Consume => AuditEventType::InventoryConsumed,
        MoveType::Ship => AuditEventType::InventoryShipped,
    }
}

fn allowed_types_json(types: &[LotType]) -> Result<String> {
    serde_json::to_string(types).context("failed to serialize allowed lot types")
}

fn buffer_snapshot(buffer: &Buffer) -> serde_json::Value {
    json!({
        "capacity_kg": buffer.capacity_kg.to_string(),
        "temp_min_c": buffer.temp_min_c,
        "temp_max_c": buffer.temp_max_c,
        "is_active": buffer.is_active,
    })
}

fn parse_lot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lot> {
    Ok(Lot {
        id: id_column(row, 0, LotId::parse)?,
        lot_code: row.get(1)?,
        lot_type: code_column(row, 2, LotType::parse, "lot type")?,
        status: code_column(row, 3, LotStatus::parse, "lot status")?,
        production_run_id: opt_id_column(row, 4, RunId::parse)?,
        step_index: opt_step_column(row, 5)?,
        weight_kg: opt_quantity_column(row, 6)?,
        temperature_c: row.get(7)?,
        operator_id: row.get(8)?,
        metadata: json_column(row, 9)?,
        created_at: timestamp_column(row, 10)?,
        updated_at: timestamp_column(row, 11)?,
    })
}

fn parse_buffer_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Buffer> {
    let allowed: String = row.get(3)?;
    Ok(Buffer {
        id: id_column(row, 0, BufferId::parse)?,
        buffer_code: row.get(1)?,
        buffer_type: code_column(row, 2, BufferType::parse, "buffer type")?,
        allowed_lot_types: serde_json::from_str(&allowed)
            .map_err(|err| column_error(3, format!("invalid allowed_lot_types: {err}")))?,
        capacity_kg: quantity_column(row, 4)?,
        temp_min_c: row.get(5)?,
        temp_max_c: row.get(6)?,
        is_active: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
        updated_at: timestamp_column(row, 9)?,
    })
}

fn parse_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InventoryItem> {
    Ok(InventoryItem {
        id: id_column(row, 0, InventoryItemId::parse)?,
        lot_id: id_column(row, 1, LotId::parse)?,
        buffer_id: id_column(row, 2, BufferId::parse)?,
        run_id: opt_id_column(row, 3, RunId::parse)?,
        quantity_kg: quantity_column(row, 4)?,
        entered_at: timestamp_column(row, 5)?,
        exited_at: opt_timestamp_column(row, 6)?,
    })
}

fn parse_move_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StockMove> {
    Ok(StockMove {
        id: id_column(row, 0, StockMoveId::parse)?,
        lot_id: id_column(row, 1, LotId::parse)?,
        from_buffer_id: opt_id_column(row, 2, BufferId::parse)?,
        to_buffer_id: opt_id_column(row, 3, BufferId::parse)?,
        quantity_kg: quantity_column(row, 4)?,
        move_type: code_column(row, 5, MoveType::parse, "move type")?,
        operator_id: row.get(6)?,
        idempotency_key: id_column(row, 7, IdempotencyKey::parse)?,
        created_at: timestamp_column(row, 8)?,
    })
}
