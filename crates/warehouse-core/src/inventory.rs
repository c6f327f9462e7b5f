//! Lots, buffers, and the movement ledger.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    check_step_index, BufferId, IdempotencyKey, InventoryItemId, LotId, Page, Quantity, RunId,
    StockMoveId, WarehouseError,
};

const MAX_LOT_WEIGHT_KG: i64 = 10_000;
const MAX_BUFFER_CODE_CHARS: usize = 20;
const MAX_LOT_CODE_CHARS: usize = 100;
const BUFFER_TEMP_RANGE: (f64, f64) = (-50.0, 50.0);
const LOT_TEMP_RANGE: (f64, f64) = (-50.0, 100.0);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LotType {
    Raw,
    Deb,
    Bulk,
    Mix,
    Skw,
    Skw15,
    Skw30,
    Frz,
    Frz15,
    Frz30,
    Fg,
    Fg15,
    Fg30,
    Pal,
    Ship,
}

impl LotType {
    pub const ALL: [Self; 15] = [
        Self::Raw,
        Self::Deb,
        Self::Bulk,
        Self::Mix,
        Self::Skw,
        Self::Skw15,
        Self::Skw30,
        Self::Frz,
        Self::Frz15,
        Self::Frz30,
        Self::Fg,
        Self::Fg15,
        Self::Fg30,
        Self::Pal,
        Self::Ship,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::Deb => "DEB",
            Self::Bulk => "BULK",
            Self::Mix => "MIX",
            Self::Skw => "SKW",
            Self::Skw15 => "SKW15",
            Self::Skw30 => "SKW30",
            Self::Frz => "FRZ",
            Self::Frz15 => "FRZ15",
            Self::Frz30 => "FRZ30",
            Self::Fg => "FG",
            Self::Fg15 => "FG15",
            Self::Fg30 => "FG30",
            Self::Pal => "PAL",
            Self::Ship => "SHIP",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == value)
    }
}

impl Display for LotType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    Created,
    Quarantine,
    Released,
    Hold,
    Rejected,
    Consumed,
    Finished,
}

impl LotStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Quarantine => "QUARANTINE",
            Self::Released => "RELEASED",
            Self::Hold => "HOLD",
            Self::Rejected => "REJECTED",
            Self::Consumed => "CONSUMED",
            Self::Finished => "FINISHED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(Self::Created),
            "QUARANTINE" => Some(Self::Quarantine),
            "RELEASED" => Some(Self::Released),
            "HOLD" => Some(Self::Hold),
            "REJECTED" => Some(Self::Rejected),
            "CONSUMED" => Some(Self::Consumed),
            "FINISHED" => Some(Self::Finished),
            _ => None,
        }
    }

    /// Whether a temperature violation moves a lot in this status to HOLD.
    #[must_use]
    pub fn yields_to_temperature_hold(self) -> bool {
        matches!(self, Self::Released | Self::Quarantine | Self::Created)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Consumed | Self::Finished)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Created => matches!(
                next,
                Self::Quarantine | Self::Released | Self::Hold | Self::Rejected
            ),
            Self::Quarantine => matches!(next, Self::Released | Self::Hold | Self::Rejected),
            Self::Released => matches!(
                next,
                Self::Hold | Self::Consumed | Self::Finished | Self::Rejected
            ),
            Self::Hold => matches!(next, Self::Released | Self::Quarantine | Self::Rejected),
            Self::Rejected | Self::Consumed | Self::Finished => false,
        }
    }

    /// Checks a requested lot status change against the lifecycle table.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Precondition`] for an illegal change.
    pub fn ensure_transition(self, next: Self) -> Result<(), WarehouseError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(WarehouseError::Precondition(format!(
            "Cannot change lot status from {} to {}",
            self.as_str(),
            next.as_str()
        )))
    }
}

impl Display for LotStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lot {
    pub id: LotId,
    pub lot_code: String,
    pub lot_type: LotType,
    pub status: LotStatus,
    pub production_run_id: Option<RunId>,
    pub step_index: Option<u8>,
    pub weight_kg: Option<Quantity>,
    pub temperature_c: Option<f64>,
    pub operator_id: Option<String>,
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewLot {
    pub lot_code: String,
    pub lot_type: LotType,
    pub production_run_id: Option<RunId>,
    pub step_index: Option<u8>,
    pub weight_kg: Option<Quantity>,
    pub temperature_c: Option<f64>,
    pub metadata: Value,
}

impl NewLot {
    /// Validates lot creation input.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] for a blank or oversized code,
    /// out-of-range step/weight/temperature, or non-object metadata.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        let code_len = self.lot_code.trim().chars().count();
        if code_len == 0 || code_len > MAX_LOT_CODE_CHARS {
            return Err(WarehouseError::Validation(format!(
                "lot_code MUST be 1..={MAX_LOT_CODE_CHARS} characters"
            )));
        }
        if let Some(step_index) = self.step_index {
            check_step_index("step_index", step_index)?;
        }
        if let Some(weight) = self.weight_kg {
            if weight.grams() < 0 || weight > Quantity::from_kg(MAX_LOT_WEIGHT_KG) {
                return Err(WarehouseError::Validation(format!(
                    "weight_kg MUST be in [0, {MAX_LOT_WEIGHT_KG}]"
                )));
            }
        }
        if let Some(temperature) = self.temperature_c {
            check_range("temperature_c", temperature, LOT_TEMP_RANGE)?;
        }
        if !self.metadata.is_object() {
            return Err(WarehouseError::Validation(
                "metadata MUST be a JSON object".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum BufferType {
    Lk,
    Mix,
    Skw15,
    Skw30,
    Frz,
    Pal,
}

impl BufferType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lk => "LK",
            Self::Mix => "MIX",
            Self::Skw15 => "SKW15",
            Self::Skw30 => "SKW30",
            Self::Frz => "FRZ",
            Self::Pal => "PAL",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LK" => Some(Self::Lk),
            "MIX" => Some(Self::Mix),
            "SKW15" => Some(Self::Skw15),
            "SKW30" => Some(Self::Skw30),
            "FRZ" => Some(Self::Frz),
            "PAL" => Some(Self::Pal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Buffer {
    pub id: BufferId,
    pub buffer_code: String,
    pub buffer_type: BufferType,
    pub allowed_lot_types: Vec<LotType>,
    pub capacity_kg: Quantity,
    pub temp_min_c: f64,
    pub temp_max_c: f64,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Buffer {
    /// Checks that this buffer can take a lot of `lot_type` right now.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Precondition`] for an inactive buffer and
    /// [`WarehouseError::Validation`] when the purity rule rejects the type.
    pub fn ensure_accepts(&self, lot_type: LotType) -> Result<(), WarehouseError> {
        if !self.is_active {
            return Err(WarehouseError::Precondition(
                "Buffer is not active".to_string(),
            ));
        }
        if !self.allowed_lot_types.contains(&lot_type) {
            let allowed = self
                .allowed_lot_types
                .iter()
                .map(|value| value.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(WarehouseError::Validation(format!(
                "Lot type {lot_type} not allowed in this buffer. Allowed types: {allowed}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewBuffer {
    pub buffer_code: String,
    pub buffer_type: BufferType,
    pub allowed_lot_types: Vec<LotType>,
    pub capacity_kg: Quantity,
    pub temp_min_c: f64,
    pub temp_max_c: f64,
}

impl NewBuffer {
    /// Validates buffer creation input.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] when the code, lot types,
    /// capacity, or temperature envelope are invalid.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        let code_len = self.buffer_code.trim().chars().count();
        if code_len == 0 || code_len > MAX_BUFFER_CODE_CHARS {
            return Err(WarehouseError::Validation(format!(
                "buffer_code MUST be 1..={MAX_BUFFER_CODE_CHARS} characters"
            )));
        }
        if self.allowed_lot_types.is_empty() {
            return Err(WarehouseError::Validation(
                "allowed_lot_types MUST contain at least one lot type".to_string(),
            ));
        }
        if !self.capacity_kg.is_positive() {
            return Err(WarehouseError::Validation(
                "capacity_kg MUST be > 0".to_string(),
            ));
        }
        check_envelope(self.temp_min_c, self.temp_max_c)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BufferUpdate {
    pub capacity_kg: Option<Quantity>,
    pub temp_min_c: Option<f64>,
    pub temp_max_c: Option<f64>,
    pub is_active: Option<bool>,
}

impl BufferUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capacity_kg.is_none()
            && self.temp_min_c.is_none()
            && self.temp_max_c.is_none()
            && self.is_active.is_none()
    }

    /// Applies the update to `buffer` and revalidates the result.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] when the resulting capacity or
    /// temperature envelope is invalid.
    pub fn apply(&self, buffer: &Buffer) -> Result<Buffer, WarehouseError> {
        let mut updated = buffer.clone();
        if let Some(capacity) = self.capacity_kg {
            if !capacity.is_positive() {
                return Err(WarehouseError::Validation(
                    "capacity_kg MUST be > 0".to_string(),
                ));
            }
            updated.capacity_kg = capacity;
        }
        if let Some(min) = self.temp_min_c {
            updated.temp_min_c = min;
        }
        if let Some(max) = self.temp_max_c {
            updated.temp_max_c = max;
        }
        if let Some(active) = self.is_active {
            updated.is_active = active;
        }
        check_envelope(updated.temp_min_c, updated.temp_max_c)?;
        Ok(updated)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BufferSummary {
    pub buffer: Buffer,
    pub current_quantity_kg: Quantity,
    pub item_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryItem {
    pub id: InventoryItemId,
    pub lot_id: LotId,
    pub buffer_id: BufferId,
    pub run_id: Option<RunId>,
    pub quantity_kg: Quantity,
    #[serde(with = "time::serde::rfc3339")]
    pub entered_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub exited_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoveType {
    Receive,
    Transfer,
    Consume,
    Ship,
}

impl MoveType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Receive => "RECEIVE",
            Self::Transfer => "TRANSFER",
            Self::Consume => "CONSUME",
            Self::Ship => "SHIP",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RECEIVE" => Some(Self::Receive),
            "TRANSFER" => Some(Self::Transfer),
            "CONSUME" => Some(Self::Consume),
            "SHIP" => Some(Self::Ship),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockMove {
    pub id: StockMoveId,
    pub lot_id: LotId,
    pub from_buffer_id: Option<BufferId>,
    pub to_buffer_id: Option<BufferId>,
    pub quantity_kg: Quantity,
    pub move_type: MoveType,
    pub operator_id: Option<String>,
    pub idempotency_key: IdempotencyKey,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "move_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoveRequest {
    Receive {
        lot_id: LotId,
        to_buffer_id: BufferId,
        run_id: RunId,
        quantity_kg: Quantity,
    },
    Transfer {
        lot_id: LotId,
        from_buffer_id: BufferId,
        to_buffer_id: BufferId,
        quantity_kg: Quantity,
    },
    Consume {
        lot_id: LotId,
        from_buffer_id: BufferId,
        quantity_kg: Quantity,
    },
    Ship {
        lot_id: LotId,
        from_buffer_id: BufferId,
        quantity_kg: Quantity,
    },
}

impl MoveRequest {
    #[must_use]
    pub fn move_type(&self) -> MoveType {
        match self {
            Self::Receive { .. } => MoveType::Receive,
            Self::Transfer { .. } => MoveType::Transfer,
            Self::Consume { .. } => MoveType::Consume,
            Self::Ship { .. } => MoveType::Ship,
        }
    }

    #[must_use]
    pub fn lot_id(&self) -> LotId {
        match self {
            Self::Receive { lot_id, .. }
            | Self::Transfer { lot_id, .. }
            | Self::Consume { lot_id, .. }
            | Self::Ship { lot_id, .. } => *lot_id,
        }
    }

    #[must_use]
    pub fn quantity(&self) -> Quantity {
        match self {
            Self::Receive { quantity_kg, .. }
            | Self::Transfer { quantity_kg, .. }
            | Self::Consume { quantity_kg, .. }
            | Self::Ship { quantity_kg, .. } => *quantity_kg,
        }
    }

    #[must_use]
    pub fn source(&self) -> Option<BufferId> {
        match self {
            Self::Receive { .. } => None,
            Self::Transfer { from_buffer_id, .. }
            | Self::Consume { from_buffer_id, .. }
            | Self::Ship { from_buffer_id, .. } => Some(*from_buffer_id),
        }
    }

    #[must_use]
    pub fn target(&self) -> Option<BufferId> {
        match self {
            Self::Receive { to_buffer_id, .. } | Self::Transfer { to_buffer_id, .. } => {
                Some(*to_buffer_id)
            }
            Self::Consume { .. } | Self::Ship { .. } => None,
        }
    }

    /// Validates shape-level move rules.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] for a non-positive quantity or a
    /// transfer into its own source buffer.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        if !self.quantity().is_positive() {
            return Err(WarehouseError::Validation(
                "quantity_kg MUST be > 0".to_string(),
            ));
        }
        if let Self::Transfer {
            from_buffer_id,
            to_buffer_id,
            ..
        } = self
        {
            if from_buffer_id == to_buffer_id {
                return Err(WarehouseError::Validation(
                    "transfer source and target buffers MUST differ".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// How a withdrawal leaves the source inventory item.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Withdrawal {
    /// Item stays open with the remaining quantity.
    Partial { remaining: Quantity },
    /// Item is drained and closed.
    Full,
}

/// Plans taking `requested` from an item holding `available`.
///
/// # Errors
/// Returns [`WarehouseError::Validation`] when `requested` exceeds
/// `available`.
pub fn plan_withdrawal(
    available: Quantity,
    requested: Quantity,
) -> Result<Withdrawal, WarehouseError> {
    match available.checked_sub(requested) {
        Some(remaining) if remaining.is_positive() => Ok(Withdrawal::Partial { remaining }),
        Some(remaining) if remaining == Quantity::ZERO => Ok(Withdrawal::Full),
        _ => Err(WarehouseError::Validation(format!(
            "Insufficient quantity. Available: {available} kg"
        ))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryFilter {
    pub buffer_id: Option<BufferId>,
    pub lot_id: Option<LotId>,
    pub active_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveFilter {
    pub lot_id: Option<LotId>,
    pub buffer_id: Option<BufferId>,
    pub move_type: Option<MoveType>,
    pub page: Page,
}

fn check_range(field: &str, value: f64, (min, max): (f64, f64)) -> Result<(), WarehouseError> {
    if !value.is_finite() || value < min || value > max {
        return Err(WarehouseError::Validation(format!(
            "{field} MUST be in [{min}, {max}]"
        )));
    }
    Ok(())
}

fn check_envelope(min: f64, max: f64) -> Result<(), WarehouseError> {
    check_range("temp_min_c", min, BUFFER_TEMP_RANGE)?;
    check_range("temp_max_c", max, BUFFER_TEMP_RANGE)?;
    if min >= max {
        return Err(WarehouseError::Validation(
            "Minimum temperature must be less than maximum temperature".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_utc;

    fn fixture_buffer() -> Buffer {
        Buffer {
            id: BufferId::new(),
            buffer_code: "FRZ-01".to_string(),
            buffer_type: BufferType::Frz,
            allowed_lot_types: vec![LotType::Frz15, LotType::Frz30],
            capacity_kg: Quantity::from_kg(500),
            temp_min_c: -25.0,
            temp_max_c: -18.0,
            is_active: true,
            created_at: now_utc(),
            updated_at: now_utc(),
        }
    }

    fn fixture_new_buffer() -> NewBuffer {
        NewBuffer {
            buffer_code: "LK-01".to_string(),
            buffer_type: BufferType::Lk,
            allowed_lot_types: vec![LotType::Raw],
            capacity_kg: Quantity::from_kg(1_000),
            temp_min_c: 0.0,
            temp_max_c: 4.0,
        }
    }

    #[test]
    fn purity_rule_names_allowed_types() {
        let buffer = fixture_buffer();
        assert!(buffer.ensure_accepts(LotType::Frz15).is_ok());
        let err = match buffer.ensure_accepts(LotType::Raw) {
            Ok(()) => panic!("RAW must not enter a freezer buffer"),
            Err(err) => err,
        };
        assert_eq!(
            err.message(),
            "Lot type RAW not allowed in this buffer. Allowed types: FRZ15, FRZ30"
        );
    }

    #[test]
    fn inactive_buffer_rejects_everything() {
        let mut buffer = fixture_buffer();
        buffer.is_active = false;
        assert!(matches!(
            buffer.ensure_accepts(LotType::Frz15),
            Err(WarehouseError::Precondition(_))
        ));
    }

    #[test]
    fn withdrawal_is_partial_full_or_insufficient() {
        let available = Quantity::from_kg(50);
        assert_eq!(
            plan_withdrawal(available, Quantity::from_kg(20)).ok(),
            Some(Withdrawal::Partial {
                remaining: Quantity::from_kg(30)
            })
        );
        assert_eq!(
            plan_withdrawal(available, available).ok(),
            Some(Withdrawal::Full)
        );
        let err = match plan_withdrawal(available, Quantity::from_kg(51)) {
            Ok(value) => panic!("expected insufficient quantity, got {value:?}"),
            Err(err) => err,
        };
        assert_eq!(err.message(), "Insufficient quantity. Available: 50.000 kg");
    }

    #[test]
    fn buffer_envelope_and_capacity_are_validated() {
        assert!(fixture_new_buffer().validate().is_ok());

        let mut inverted = fixture_new_buffer();
        inverted.temp_min_c = 4.0;
        inverted.temp_max_c = 4.0;
        assert!(inverted.validate().is_err());

        let mut empty_types = fixture_new_buffer();
        empty_types.allowed_lot_types.clear();
        assert!(empty_types.validate().is_err());

        let mut cold = fixture_new_buffer();
        cold.temp_min_c = -60.0;
        assert!(cold.validate().is_err());

        let update = BufferUpdate {
            temp_min_c: Some(-10.0),
            ..BufferUpdate::default()
        };
        assert!(update.apply(&fixture_buffer()).is_err());
    }

    #[test]
    fn transfer_into_same_buffer_is_rejected() {
        let buffer_id = BufferId::new();
        let request = MoveRequest::Transfer {
            lot_id: LotId::new(),
            from_buffer_id: buffer_id,
            to_buffer_id: buffer_id,
            quantity_kg: Quantity::from_kg(1),
        };
        assert!(request.validate().is_err());
        assert_eq!(request.move_type(), MoveType::Transfer);
        assert_eq!(request.source(), Some(buffer_id));
    }

    #[test]
    fn lot_lifecycle_table_is_enforced() {
        assert!(LotStatus::Created.can_transition_to(LotStatus::Released));
        assert!(LotStatus::Hold.can_transition_to(LotStatus::Released));
        assert!(!LotStatus::Consumed.can_transition_to(LotStatus::Released));
        assert!(!LotStatus::Released.can_transition_to(LotStatus::Created));
        assert!(LotStatus::Released.yields_to_temperature_hold());
        assert!(!LotStatus::Hold.yields_to_temperature_hold());
        assert!(!LotStatus::Finished.yields_to_temperature_hold());
    }

    #[test]
    fn lot_type_codes_round_trip() {
        for lot_type in LotType::ALL {
            assert_eq!(LotType::parse(lot_type.as_str()), Some(lot_type));
        }
        assert_eq!(LotType::parse("raw"), None);
    }
}
