//! Domain model for the production warehouse backend.
//!
//! Everything in this crate is pure: records, validated inputs, the run
//! transition planner, genealogy traversal over an edge-source trait, and the
//! flow-graph checks. Persistence lives in `warehouse-store-sqlite`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;
use uuid::Uuid;

pub mod access;
pub mod audit;
pub mod config;
pub mod flow;
pub mod genealogy;
pub mod inventory;
pub mod quality;
pub mod run;

mod quantity;

pub use quantity::Quantity;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WarehouseError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl WarehouseError {
    /// Stable machine-readable code for error envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Precondition(_) => "precondition_failed",
            Self::Validation(_) => "validation_error",
            Self::Conflict(_) => "conflict",
            Self::Forbidden(_) => "forbidden",
            Self::Configuration(_) => "configuration_error",
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(message)
            | Self::Precondition(message)
            | Self::Validation(message)
            | Self::Conflict(message)
            | Self::Forbidden(message)
            | Self::Configuration(message) => message,
        }
    }
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses a ULID string into this identifier.
            ///
            /// # Errors
            /// Returns [`WarehouseError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> Result<Self, WarehouseError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    WarehouseError::Validation(format!(
                        "invalid {} `{raw}`: {err}",
                        stringify!($name)
                    ))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(RunId);
entity_id!(StepExecutionId);
entity_id!(LotId);
entity_id!(GenealogyLinkId);
entity_id!(BufferId);
entity_id!(InventoryItemId);
entity_id!(StockMoveId);
entity_id!(InspectionId);
entity_id!(TemperatureLogId);
entity_id!(QcDecisionId);
entity_id!(FlowDefinitionId);
entity_id!(FlowVersionId);

/// Client-supplied token that deduplicates a mutating request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IdempotencyKey(pub Uuid);

impl IdempotencyKey {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a UUID idempotency key.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] when `raw` is not a UUID.
    pub fn parse(raw: &str) -> Result<Self, WarehouseError> {
        Uuid::parse_str(raw.trim()).map(Self).map_err(|err| {
            WarehouseError::Validation(format!("idempotency key MUST be a UUID: {err}"))
        })
    }
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Bounded list window shared by every list query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub const MAX_LIMIT: u32 = 500;

    /// Builds a page, falling back to `default_limit` when no limit is given.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] when the limit is outside
    /// `1..=500`.
    pub fn new(
        limit: Option<u32>,
        offset: Option<u32>,
        default_limit: u32,
    ) -> Result<Self, WarehouseError> {
        let limit = limit.unwrap_or(default_limit);
        if limit == 0 || limit > Self::MAX_LIMIT {
            return Err(WarehouseError::Validation(format!(
                "limit MUST be in [1, {}]",
                Self::MAX_LIMIT
            )));
        }
        Ok(Self {
            limit,
            offset: offset.unwrap_or(0),
        })
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Checks the trimmed character count of free text against `min..=max`.
pub(crate) fn check_text_len(
    field: &str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), WarehouseError> {
    let count = value.trim().chars().count();
    if count < min {
        return Err(WarehouseError::Validation(format!(
            "{field} MUST be at least {min} characters"
        )));
    }
    if count > max {
        return Err(WarehouseError::Validation(format!(
            "{field} MUST be at most {max} characters"
        )));
    }
    Ok(())
}

pub(crate) fn check_step_index(field: &str, value: u8) -> Result<(), WarehouseError> {
    if value > run::FINAL_STEP_INDEX {
        return Err(WarehouseError::Validation(format!(
            "{field} MUST be in [0, {}]",
            run::FINAL_STEP_INDEX
        )));
    }
    Ok(())
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`WarehouseError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, WarehouseError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| WarehouseError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(WarehouseError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`WarehouseError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, WarehouseError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            WarehouseError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(WarehouseError::NotFound(String::new()).code(), "not_found");
        assert_eq!(
            WarehouseError::Precondition(String::new()).code(),
            "precondition_failed"
        );
        assert_eq!(
            WarehouseError::Validation(String::new()).code(),
            "validation_error"
        );
        assert_eq!(WarehouseError::Conflict(String::new()).code(), "conflict");
        assert_eq!(WarehouseError::Forbidden(String::new()).code(), "forbidden");
        assert_eq!(
            WarehouseError::Configuration(String::new()).code(),
            "configuration_error"
        );
    }

    #[test]
    fn idempotency_key_requires_uuid() {
        let key = must_ok(IdempotencyKey::parse("7c9e6679-7425-40de-944b-e07fc1f90ae7"));
        assert_eq!(key.to_string(), "7c9e6679-7425-40de-944b-e07fc1f90ae7");
        assert!(matches!(
            IdempotencyKey::parse("not-a-key"),
            Err(WarehouseError::Validation(_))
        ));
    }

    #[test]
    fn entity_ids_round_trip_through_text() {
        let id = RunId::new();
        let parsed = must_ok(RunId::parse(&id.to_string()));
        assert_eq!(id, parsed);
        assert!(LotId::parse("lot-1").is_err());
    }

    #[test]
    fn page_bounds_are_enforced() {
        let page = must_ok(Page::new(None, None, 50));
        assert_eq!(page.limit, 50);
        assert_eq!(page.offset, 0);
        assert!(Page::new(Some(0), None, 50).is_err());
        assert!(Page::new(Some(501), None, 50).is_err());
        assert_eq!(must_ok(Page::new(Some(500), Some(20), 50)).offset, 20);
    }

    #[test]
    fn text_length_counts_trimmed_characters() {
        assert!(check_text_len("notes", "   123456789   ", 10, 50).is_err());
        assert!(check_text_len("notes", "1234567890", 10, 50).is_ok());
        assert!(check_text_len("notes", &"x".repeat(51), 10, 50).is_err());
    }

    #[test]
    fn timestamps_must_be_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        let parsed = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
    }
}
