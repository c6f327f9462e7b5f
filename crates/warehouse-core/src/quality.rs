//! QC inspections, legacy gate decisions, and temperature readings.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    check_step_index, check_text_len, BufferId, IdempotencyKey, InspectionId, LotId, Page,
    QcDecisionId, RunId, TemperatureLogId, WarehouseError,
};

const NOTES_MIN_CHARS: usize = 10;
const NOTES_MAX_CHARS: usize = 2_000;
const INSPECTION_TYPE_MAX_CHARS: usize = 30;
const SIGNATURE_MAX_CHARS: usize = 500;
const READING_RANGE: (f64, f64) = (-50.0, 100.0);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Pass,
    Hold,
    Fail,
}

impl Decision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Hold => "HOLD",
            Self::Fail => "FAIL",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PASS" => Some(Self::Pass),
            "HOLD" => Some(Self::Hold),
            "FAIL" => Some(Self::Fail),
            _ => None,
        }
    }

    #[must_use]
    pub fn requires_notes(self) -> bool {
        matches!(self, Self::Hold | Self::Fail)
    }
}

impl Display for Decision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared notes rule for inspections and legacy decisions.
///
/// # Errors
/// Returns [`WarehouseError::Validation`] when a HOLD/FAIL decision has no
/// notes or fewer than 10 trimmed characters, or notes exceed 2000.
pub fn validate_decision_notes(
    decision: Decision,
    notes: Option<&str>,
) -> Result<(), WarehouseError> {
    match notes {
        Some(notes) if decision.requires_notes() => {
            if notes.trim().chars().count() < NOTES_MIN_CHARS {
                return Err(WarehouseError::Validation(format!(
                    "Notes are required for HOLD/FAIL decisions (min {NOTES_MIN_CHARS} characters)"
                )));
            }
            check_text_len("notes", notes, 0, NOTES_MAX_CHARS)
        }
        Some(notes) => check_text_len("notes", notes, 0, NOTES_MAX_CHARS),
        None if decision.requires_notes() => Err(WarehouseError::Validation(format!(
            "Notes are required for HOLD/FAIL decisions (min {NOTES_MIN_CHARS} characters)"
        ))),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewInspection {
    pub run_id: RunId,
    pub lot_id: LotId,
    pub step_index: u8,
    pub inspection_type: String,
    pub decision: Decision,
    pub notes: Option<String>,
    pub is_ccp: bool,
    pub idempotency_key: IdempotencyKey,
}

impl NewInspection {
    /// Validates inspection input before it reaches storage.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] for a bad step, inspection
    /// type, or notes.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        check_step_index("step_index", self.step_index)?;
        check_text_len(
            "inspection_type",
            &self.inspection_type,
            1,
            INSPECTION_TYPE_MAX_CHARS,
        )?;
        validate_decision_notes(self.decision, self.notes.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QcInspection {
    pub id: InspectionId,
    pub run_id: RunId,
    pub lot_id: LotId,
    pub step_index: u8,
    pub inspection_type: String,
    pub decision: Decision,
    pub notes: Option<String>,
    pub is_ccp: bool,
    pub inspector_id: String,
    pub idempotency_key: IdempotencyKey,
    #[serde(with = "time::serde::rfc3339")]
    pub inspected_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectionFilter {
    pub run_id: Option<RunId>,
    pub lot_id: Option<LotId>,
    pub step_index: Option<u8>,
    pub page: Page,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeasurementType {
    Surface,
    Core,
    Ambient,
}

impl MeasurementType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Surface => "SURFACE",
            Self::Core => "CORE",
            Self::Ambient => "AMBIENT",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SURFACE" => Some(Self::Surface),
            "CORE" => Some(Self::Core),
            "AMBIENT" => Some(Self::Ambient),
            _ => None,
        }
    }

    /// Highest compliant reading in degrees Celsius.
    #[must_use]
    pub fn threshold_c(self) -> f64 {
        match self {
            Self::Surface => 4.0,
            Self::Core | Self::Ambient => -18.0,
        }
    }

    #[must_use]
    pub fn is_violation(self, temperature_c: f64) -> bool {
        temperature_c > self.threshold_c()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTemperatureReading {
    pub temperature_c: f64,
    pub measurement_type: MeasurementType,
    pub lot_id: Option<LotId>,
    pub buffer_id: Option<BufferId>,
    pub inspection_id: Option<InspectionId>,
}

impl NewTemperatureReading {
    /// Validates the reading range.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] for a non-finite reading or one
    /// outside [-50, 100].
    pub fn validate(&self) -> Result<(), WarehouseError> {
        let (min, max) = READING_RANGE;
        if !self.temperature_c.is_finite()
            || self.temperature_c < min
            || self.temperature_c > max
        {
            return Err(WarehouseError::Validation(format!(
                "temperature_c MUST be in [{min}, {max}]"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_violation(&self) -> bool {
        self.measurement_type.is_violation(self.temperature_c)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemperatureLog {
    pub id: TemperatureLogId,
    pub lot_id: Option<LotId>,
    pub buffer_id: Option<BufferId>,
    pub inspection_id: Option<InspectionId>,
    pub temperature_c: f64,
    pub measurement_type: MeasurementType,
    pub is_violation: bool,
    pub recorded_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemperatureFilter {
    pub lot_id: Option<LotId>,
    pub buffer_id: Option<BufferId>,
    pub inspection_id: Option<InspectionId>,
    pub violations_only: bool,
    pub page: Page,
}

/// Gate decision recorded through the pre-inspection QC surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewQcDecision {
    pub lot_id: Option<LotId>,
    pub gate_id: Option<String>,
    pub decision: Decision,
    pub notes: Option<String>,
    pub temperature_c: Option<f64>,
    pub digital_signature: Option<String>,
}

impl NewQcDecision {
    /// Validates a legacy decision.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] for the notes rule, a bad
    /// temperature, or an oversized signature.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        validate_decision_notes(self.decision, self.notes.as_deref())?;
        if let Some(temperature) = self.temperature_c {
            let (min, max) = READING_RANGE;
            if !temperature.is_finite() || temperature < min || temperature > max {
                return Err(WarehouseError::Validation(format!(
                    "temperature_c MUST be in [{min}, {max}]"
                )));
            }
        }
        if let Some(signature) = self.digital_signature.as_deref() {
            check_text_len("digital_signature", signature, 1, SIGNATURE_MAX_CHARS)?;
        }
        if let Some(gate) = self.gate_id.as_deref() {
            check_text_len("gate_id", gate, 1, 100)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QcDecision {
    pub id: QcDecisionId,
    pub lot_id: Option<LotId>,
    pub gate_id: Option<String>,
    pub decision: Decision,
    pub notes: Option<String>,
    pub temperature_c: Option<f64>,
    pub digital_signature: Option<String>,
    pub decided_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub decided_at: OffsetDateTime,
}
