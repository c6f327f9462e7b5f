//! Flow definitions, their versioned process graphs, and the
//! DRAFT -> REVIEW -> PUBLISHED -> DEPRECATED lifecycle.

use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::{FlowDefinitionId, FlowVersionId, WarehouseError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Draft,
    Review,
    Published,
    Deprecated,
}

impl FlowStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Review => "REVIEW",
            Self::Published => "PUBLISHED",
            Self::Deprecated => "DEPRECATED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DRAFT" => Some(Self::Draft),
            "REVIEW" => Some(Self::Review),
            "PUBLISHED" => Some(Self::Published),
            "DEPRECATED" => Some(Self::Deprecated),
            _ => None,
        }
    }
}

impl Display for FlowStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Process,
    QcGate,
    Buffer,
    Group,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeData {
    /// Localized label, e.g. `{"hu": "..", "en": ".."}`.
    pub label: BTreeMap<String, String>,
    #[serde(rename = "nodeType")]
    pub node_type: NodeType,
    #[serde(default)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type", default = "default_node_component")]
    pub component: String,
    pub position: Position,
    pub data: NodeData,
    #[serde(rename = "parentId", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Editor-owned keys (`extent`, `measured`, sizes) kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_node_component() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            zoom: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphSchema {
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    #[serde(default)]
    pub viewport: Viewport,
}

impl GraphSchema {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Checks that every edge endpoint and every declared parent names a node
    /// in this graph.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] naming the first dangling
    /// reference.
    pub fn validate_references(&self) -> Result<(), WarehouseError> {
        let node_ids: HashSet<&str> = self.nodes.iter().map(|node| node.id.as_str()).collect();
        for edge in &self.edges {
            if !node_ids.contains(edge.source.as_str()) {
                return Err(WarehouseError::Validation(format!(
                    "Edge {} references non-existent source: {}",
                    edge.id, edge.source
                )));
            }
            if !node_ids.contains(edge.target.as_str()) {
                return Err(WarehouseError::Validation(format!(
                    "Edge {} references non-existent target: {}",
                    edge.id, edge.target
                )));
            }
        }
        for node in &self.nodes {
            if let Some(parent) = node.parent_id.as_deref() {
                if !node_ids.contains(parent) {
                    return Err(WarehouseError::Validation(format!(
                        "Node {} references non-existent parent: {parent}",
                        node.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Publish-time structure check: references first, then start/end nodes.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] for dangling references or a
    /// missing start or end node.
    pub fn validate_publishable(&self) -> Result<(), WarehouseError> {
        self.validate_references()?;
        if !self.has_node_type(NodeType::Start) {
            return Err(WarehouseError::Validation(
                "Cannot publish: Flow must have at least one START node".to_string(),
            ));
        }
        if !self.has_node_type(NodeType::End) {
            return Err(WarehouseError::Validation(
                "Cannot publish: Flow must have at least one END node".to_string(),
            ));
        }
        Ok(())
    }

    fn has_node_type(&self, node_type: NodeType) -> bool {
        self.nodes.iter().any(|node| node.data.node_type == node_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDefinition {
    pub id: FlowDefinitionId,
    pub name: BTreeMap<String, String>,
    pub description: Option<String>,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewFlow {
    pub name: BTreeMap<String, String>,
    pub description: Option<String>,
}

impl NewFlow {
    /// # Errors
    /// Returns [`WarehouseError::Validation`] when the name map is empty or
    /// holds a blank label.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        if self.name.is_empty() {
            return Err(WarehouseError::Validation(
                "flow name MUST contain at least one localized label".to_string(),
            ));
        }
        if let Some((locale, _)) = self.name.iter().find(|(_, label)| label.trim().is_empty()) {
            return Err(WarehouseError::Validation(format!(
                "flow name for locale `{locale}` MUST NOT be blank"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowVersion {
    pub id: FlowVersionId,
    pub flow_definition_id: FlowDefinitionId,
    pub version_num: u32,
    pub status: FlowStatus,
    pub graph_schema: GraphSchema,
    pub created_by: String,
    pub reviewed_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
    pub published_by: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl FlowVersion {
    /// # Errors
    /// Returns [`WarehouseError::Forbidden`] unless the version is a DRAFT.
    pub fn ensure_editable(&self) -> Result<(), WarehouseError> {
        if self.status != FlowStatus::Draft {
            return Err(WarehouseError::Forbidden(format!(
                "Cannot edit {} version. Only DRAFT versions can be modified.",
                self.status
            )));
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`WarehouseError::Precondition`] unless the version is a DRAFT.
    pub fn ensure_submittable(&self) -> Result<(), WarehouseError> {
        if self.status != FlowStatus::Draft {
            return Err(WarehouseError::Precondition(format!(
                "Cannot submit {} version for review. Must be DRAFT.",
                self.status
            )));
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`WarehouseError::Precondition`] unless the version is DRAFT
    /// or REVIEW, and [`WarehouseError::Validation`] when the graph is not
    /// publishable.
    pub fn ensure_publishable(&self) -> Result<(), WarehouseError> {
        if !matches!(self.status, FlowStatus::Draft | FlowStatus::Review) {
            return Err(WarehouseError::Precondition(format!(
                "Cannot publish {} version. Only DRAFT or REVIEW versions can be published.",
                self.status
            )));
        }
        self.graph_schema.validate_publishable()
    }

    /// # Errors
    /// Returns [`WarehouseError::Precondition`] unless the version is
    /// PUBLISHED.
    pub fn ensure_deprecatable(&self) -> Result<(), WarehouseError> {
        if self.status != FlowStatus::Published {
            return Err(WarehouseError::Precondition(format!(
                "Cannot deprecate {} version. Must be PUBLISHED.",
                self.status
            )));
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`WarehouseError::Precondition`] unless the version is
    /// PUBLISHED.
    pub fn ensure_runnable(&self) -> Result<(), WarehouseError> {
        if self.status != FlowStatus::Published {
            return Err(WarehouseError::Precondition(format!(
                "Flow version must be PUBLISHED to start a run. Current status: {}",
                self.status
            )));
        }
        Ok(())
    }
}

/// Rejects forking while another draft is open.
///
/// # Errors
/// Returns [`WarehouseError::Conflict`] naming the existing draft.
pub fn ensure_no_open_draft(existing_draft: Option<u32>) -> Result<(), WarehouseError> {
    match existing_draft {
        Some(version_num) => Err(WarehouseError::Conflict(format!(
            "A draft version (v{version_num}) already exists. Edit that or deprecate it first."
        ))),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowSummary {
    pub flow: FlowDefinition,
    pub latest_version_num: Option<u32>,
    pub latest_status: Option<FlowStatus>,
    pub published_version_num: Option<u32>,
    pub version_count: u32,
}

/// Result of a publish: the frozen version plus the auto-created draft.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishOutcome {
    pub published_version: FlowVersion,
    pub new_draft: Option<FlowVersion>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_utc;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_graph() -> GraphSchema {
        must(serde_json::from_value(json!({
            "nodes": [
                {"id": "lane", "type": "swimlane", "position": {"x": 0, "y": 0},
                 "data": {"label": {"en": "Lane"}, "nodeType": "group"}},
                {"id": "start", "position": {"x": 10, "y": 10}, "parentId": "lane",
                 "data": {"label": {"en": "Start"}, "nodeType": "start"}},
                {"id": "qc", "position": {"x": 20, "y": 10}, "extent": "parent",
                 "data": {"label": {"en": "QC"}, "nodeType": "qc_gate", "config": {"ccp": true}}},
                {"id": "end", "position": {"x": 30, "y": 10},
                 "data": {"label": {"en": "End"}, "nodeType": "end"}}
            ],
            "edges": [
                {"id": "e1", "source": "start", "target": "qc", "animated": true},
                {"id": "e2", "source": "qc", "target": "end"}
            ]
        })))
    }

    fn fixture_version(status: FlowStatus) -> FlowVersion {
        FlowVersion {
            id: FlowVersionId::new(),
            flow_definition_id: FlowDefinitionId::new(),
            version_num: 1,
            status,
            graph_schema: fixture_graph(),
            created_by: "u-1".to_string(),
            reviewed_by: None,
            published_at: None,
            published_by: None,
            created_at: now_utc(),
        }
    }

    #[test]
    fn graph_preserves_editor_keys() {
        let graph = fixture_graph();
        assert_eq!(graph.viewport, Viewport::default());
        assert_eq!(graph.nodes[2].extra.get("extent"), Some(&json!("parent")));
        assert_eq!(graph.edges[0].extra.get("animated"), Some(&json!(true)));
        let encoded = must(serde_json::to_value(&graph));
        assert_eq!(encoded["nodes"][1]["parentId"], json!("lane"));
        assert_eq!(encoded["nodes"][1]["type"], json!("default"));
        assert_eq!(encoded["nodes"][0]["type"], json!("swimlane"));
        assert!(encoded["nodes"][0].get("parentId").is_none());
    }

    #[test]
    fn publishable_graph_needs_start_and_end() {
        assert!(fixture_graph().validate_publishable().is_ok());

        let mut no_end = fixture_graph();
        no_end.edges.pop();
        no_end.nodes.pop();
        let err = no_end.validate_publishable().err();
        assert_eq!(
            err.map(|err| err.message().to_string()),
            Some("Cannot publish: Flow must have at least one END node".to_string())
        );

        assert!(GraphSchema::empty().validate_publishable().is_err());
    }

    #[test]
    fn dangling_references_are_reported_before_node_checks() {
        let mut graph = fixture_graph();
        graph.nodes.retain(|node| node.data.node_type != NodeType::Start);
        let err = graph.validate_publishable().err();
        assert!(err
            .map(|err| err.message().contains("non-existent source: start"))
            .unwrap_or(false));

        let mut orphan = fixture_graph();
        orphan.nodes[1].parent_id = Some("missing".to_string());
        assert!(orphan.validate_references().is_err());
    }

    #[test]
    fn lifecycle_checks_use_distinct_error_kinds() {
        let published = fixture_version(FlowStatus::Published);
        assert!(matches!(
            published.ensure_editable(),
            Err(WarehouseError::Forbidden(_))
        ));
        assert!(published.ensure_runnable().is_ok());
        assert!(published.ensure_deprecatable().is_ok());
        assert!(matches!(
            published.ensure_publishable(),
            Err(WarehouseError::Precondition(_))
        ));

        let review = fixture_version(FlowStatus::Review);
        assert!(review.ensure_publishable().is_ok());
        assert!(review.ensure_submittable().is_err());
        let err = review.ensure_runnable().err();
        assert_eq!(
            err.map(|err| err.message().to_string()),
            Some("Flow version must be PUBLISHED to start a run. Current status: REVIEW".to_string())
        );

        assert!(matches!(
            ensure_no_open_draft(Some(3)),
            Err(WarehouseError::Conflict(_))
        ));
    }

    #[test]
    fn new_flow_requires_a_label() {
        let flow = NewFlow {
            name: BTreeMap::new(),
            description: None,
        };
        assert!(flow.validate().is_err());
        let flow = NewFlow {
            name: BTreeMap::from([("en".to_string(), "Kebab line".to_string())]),
            description: None,
        };
        assert!(flow.validate().is_ok());
    }
}
