//! Append-only audit records emitted by every state change.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{Page, WarehouseError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    RunCreated,
    RunStarted,
    RunStepAdvanced,
    RunHeld,
    RunResumed,
    RunCompleted,
    RunAborted,
    LotCreated,
    LotStatusChanged,
    GenealogyLinked,
    BufferCreated,
    BufferUpdated,
    InventoryReceived,
    InventoryTransferred,
    InventoryConsumed,
    InventoryShipped,
    QcInspectionRecorded,
    QcDecisionRecorded,
    TemperatureLogged,
    TempViolationHold,
    FlowCreated,
    FlowVersionUpdated,
    FlowVersionSubmitted,
    FlowVersionPublished,
    FlowVersionForked,
    FlowVersionDeprecated,
}

impl AuditEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunCreated => "RUN_CREATED",
            Self::RunStarted => "RUN_STARTED",
            Self::RunStepAdvanced => "RUN_STEP_ADVANCED",
            Self::RunHeld => "RUN_HELD",
            Self::RunResumed => "RUN_RESUMED",
            Self::RunCompleted => "RUN_COMPLETED",
            Self::RunAborted => "RUN_ABORTED",
            Self::LotCreated => "LOT_CREATED",
            Self::LotStatusChanged => "LOT_STATUS_CHANGED",
            Self::GenealogyLinked => "GENEALOGY_LINKED",
            Self::BufferCreated => "BUFFER_CREATED",
            Self::BufferUpdated => "BUFFER_UPDATED",
            Self::InventoryReceived => "INVENTORY_RECEIVED",
            Self::InventoryTransferred => "INVENTORY_TRANSFERRED",
            Self::InventoryConsumed => "INVENTORY_CONSUMED",
            Self::InventoryShipped => "INVENTORY_SHIPPED",
            Self::QcInspectionRecorded => "QC_INSPECTION_RECORDED",
            Self::QcDecisionRecorded => "QC_DECISION_RECORDED",
            Self::TemperatureLogged => "TEMPERATURE_LOGGED",
            Self::TempViolationHold => "TEMP_VIOLATION_HOLD",
            Self::FlowCreated => "FLOW_CREATED",
            Self::FlowVersionUpdated => "FLOW_VERSION_UPDATED",
            Self::FlowVersionSubmitted => "FLOW_VERSION_SUBMITTED",
            Self::FlowVersionPublished => "FLOW_VERSION_PUBLISHED",
            Self::FlowVersionForked => "FLOW_VERSION_FORKED",
            Self::FlowVersionDeprecated => "FLOW_VERSION_DEPRECATED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUN_CREATED" => Some(Self::RunCreated),
            "RUN_STARTED" => Some(Self::RunStarted),
            "RUN_STEP_ADVANCED" => Some(Self::RunStepAdvanced),
            "RUN_HELD" => Some(Self::RunHeld),
            "RUN_RESUMED" => Some(Self::RunResumed),
            "RUN_COMPLETED" => Some(Self::RunCompleted),
            "RUN_ABORTED" => Some(Self::RunAborted),
            "LOT_CREATED" => Some(Self::LotCreated),
            "LOT_STATUS_CHANGED" => Some(Self::LotStatusChanged),
            "GENEALOGY_LINKED" => Some(Self::GenealogyLinked),
            "BUFFER_CREATED" => Some(Self::BufferCreated),
            "BUFFER_UPDATED" => Some(Self::BufferUpdated),
            "INVENTORY_RECEIVED" => Some(Self::InventoryReceived),
            "INVENTORY_TRANSFERRED" => Some(Self::InventoryTransferred),
            "INVENTORY_CONSUMED" => Some(Self::InventoryConsumed),
            "INVENTORY_SHIPPED" => Some(Self::InventoryShipped),
            "QC_INSPECTION_RECORDED" => Some(Self::QcInspectionRecorded),
            "QC_DECISION_RECORDED" => Some(Self::QcDecisionRecorded),
            "TEMPERATURE_LOGGED" => Some(Self::TemperatureLogged),
            "TEMP_VIOLATION_HOLD" => Some(Self::TempViolationHold),
            "FLOW_CREATED" => Some(Self::FlowCreated),
            "FLOW_VERSION_UPDATED" => Some(Self::FlowVersionUpdated),
            "FLOW_VERSION_SUBMITTED" => Some(Self::FlowVersionSubmitted),
            "FLOW_VERSION_PUBLISHED" => Some(Self::FlowVersionPublished),
            "FLOW_VERSION_FORKED" => Some(Self::FlowVersionForked),
            "FLOW_VERSION_DEPRECATED" => Some(Self::FlowVersionDeprecated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    ProductionRun,
    Lot,
    LotGenealogy,
    Buffer,
    StockMove,
    QcInspection,
    QcDecision,
    TemperatureLog,
    FlowDefinition,
    FlowVersion,
}

impl EntityType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProductionRun => "production_run",
            Self::Lot => "lot",
            Self::LotGenealogy => "lot_genealogy",
            Self::Buffer => "buffer",
            Self::StockMove => "stock_move",
            Self::QcInspection => "qc_inspection",
            Self::QcDecision => "qc_decision",
            Self::TemperatureLog => "temperature_log",
            Self::FlowDefinition => "flow_definition",
            Self::FlowVersion => "flow_version",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "production_run" => Some(Self::ProductionRun),
            "lot" => Some(Self::Lot),
            "lot_genealogy" => Some(Self::LotGenealogy),
            "buffer" => Some(Self::Buffer),
            "stock_move" => Some(Self::StockMove),
            "qc_inspection" => Some(Self::QcInspection),
            "qc_decision" => Some(Self::QcDecision),
            "temperature_log" => Some(Self::TemperatureLog),
            "flow_definition" => Some(Self::FlowDefinition),
            "flow_version" => Some(Self::FlowVersion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: i64,
    pub event_type: AuditEventType,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub user_id: Option<String>,
    pub old_state: Option<Value>,
    pub new_state: Option<Value>,
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Audit row to append alongside the mutation it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEvent {
    pub event_type: AuditEventType,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub user_id: Option<String>,
    pub old_state: Option<Value>,
    pub new_state: Option<Value>,
    pub metadata: Value,
}

impl NewAuditEvent {
    #[must_use]
    pub fn new(
        event_type: AuditEventType,
        entity_type: EntityType,
        entity_id: impl ToString,
    ) -> Self {
        Self {
            event_type,
            entity_type,
            entity_id: entity_id.to_string(),
            user_id: None,
            old_state: None,
            new_state: None,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }

    #[must_use]
    pub fn by(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    #[must_use]
    pub fn old_state(mut self, state: Value) -> Self {
        self.old_state = Some(state);
        self
    }

    #[must_use]
    pub fn new_state(mut self, state: Value) -> Self {
        self.new_state = Some(state);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub event_type: Option<AuditEventType>,
    pub user_id: Option<String>,
    pub page: Page,
}

impl AuditFilter {
    /// Validates the filter window.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] when an entity id is given
    /// without its entity type.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        if self.entity_id.is_some() && self.entity_type.is_none() {
            return Err(WarehouseError::Validation(
                "entity_id filter requires entity_type".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_codes_round_trip() {
        for event_type in [
            AuditEventType::RunCreated,
            AuditEventType::RunStepAdvanced,
            AuditEventType::TempViolationHold,
            AuditEventType::FlowVersionDeprecated,
        ] {
            assert_eq!(AuditEventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(AuditEventType::TempViolationHold.as_str(), "TEMP_VIOLATION_HOLD");
        assert_eq!(AuditEventType::parse("temp_violation_hold"), None);
    }

    #[test]
    fn builder_defaults_metadata_to_empty_object() {
        let event = NewAuditEvent::new(AuditEventType::LotCreated, EntityType::Lot, "lot-1")
            .by("u-1")
            .new_state(json!({"status": "CREATED"}));
        assert_eq!(event.metadata, json!({}));
        assert_eq!(event.user_id.as_deref(), Some("u-1"));
        assert!(event.old_state.is_none());
    }

    #[test]
    fn entity_id_filter_needs_entity_type() {
        let filter = AuditFilter {
            entity_id: Some("x".to_string()),
            ..AuditFilter::default()
        };
        assert!(filter.validate().is_err());
    }
}
