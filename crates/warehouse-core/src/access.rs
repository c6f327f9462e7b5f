//! Roles and the closed set of permission predicates checked before writes.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::WarehouseError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Manager,
    Auditor,
    Operator,
    Viewer,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Manager => "MANAGER",
            Self::Auditor => "AUDITOR",
            Self::Operator => "OPERATOR",
            Self::Viewer => "VIEWER",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ADMIN" => Some(Self::Admin),
            "MANAGER" => Some(Self::Manager),
            "AUDITOR" => Some(Self::Auditor),
            "OPERATOR" => Some(Self::Operator),
            "VIEWER" => Some(Self::Viewer),
            _ => None,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Run lifecycle (except resume/abort), lots, buffers, inventory moves.
    CreateRuns,
    /// Resume, abort, and lot status changes.
    ManageRuns,
    /// Inspections, legacy decisions, temperature logs.
    RecordQuality,
    EditFlows,
    PublishFlows,
}

impl Permission {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateRuns => "create_runs",
            Self::ManageRuns => "manage_runs",
            Self::RecordQuality => "record_quality",
            Self::EditFlows => "edit_flows",
            Self::PublishFlows => "publish_flows",
        }
    }

    #[must_use]
    pub fn allows(self, role: Role) -> bool {
        match self {
            Self::CreateRuns | Self::EditFlows => {
                matches!(role, Role::Admin | Role::Manager | Role::Operator)
            }
            Self::ManageRuns | Self::PublishFlows => matches!(role, Role::Admin | Role::Manager),
            Self::RecordQuality => matches!(
                role,
                Role::Admin | Role::Manager | Role::Auditor | Role::Operator
            ),
        }
    }
}

/// Authenticated caller as resolved by the identity collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

impl Principal {
    #[must_use]
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    /// Checks that this principal's role grants `permission`.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Forbidden`] when the role lacks the permission
    /// and [`WarehouseError::Validation`] for a blank user id.
    pub fn authorize(&self, permission: Permission) -> Result<(), WarehouseError> {
        if self.user_id.trim().is_empty() {
            return Err(WarehouseError::Validation(
                "principal user_id MUST be provided".to_string(),
            ));
        }
        if !permission.allows(self.role) {
            return Err(WarehouseError::Forbidden(format!(
                "role {} lacks permission {}",
                self.role,
                permission.as_str()
            )));
        }
        Ok(())
    }
}
