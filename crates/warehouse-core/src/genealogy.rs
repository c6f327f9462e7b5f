//! Lot lineage and its level-by-level breadth-first traversal.
//!
//! Traversal never issues one query per node: each iteration asks the edge
//! source for every link touching the current frontier, so the number of
//! round trips is bounded by the requested depth.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::inventory::Lot;
use crate::{GenealogyLinkId, LotId, Quantity, WarehouseError};

pub const MAX_SINGLE_DIRECTION_DEPTH: u8 = 10;
pub const MAX_TREE_DEPTH: u8 = 5;
pub const DEFAULT_SINGLE_DIRECTION_DEPTH: u8 = 1;
pub const DEFAULT_TREE_DEPTH: u8 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenealogyLink {
    pub id: GenealogyLinkId,
    pub parent_lot_id: LotId,
    pub child_lot_id: LotId,
    pub quantity_used_kg: Option<Quantity>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewGenealogyLink {
    pub parent_lot_id: LotId,
    pub child_lot_id: LotId,
    pub quantity_used_kg: Option<Quantity>,
}

impl NewGenealogyLink {
    /// # Errors
    /// Returns [`WarehouseError::Validation`] for a self link or a
    /// non-positive quantity.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        if self.parent_lot_id == self.child_lot_id {
            return Err(WarehouseError::Validation(
                "A lot cannot be its own parent".to_string(),
            ));
        }
        if let Some(quantity) = self.quantity_used_kg {
            if !quantity.is_positive() {
                return Err(WarehouseError::Validation(
                    "quantity_used_kg MUST be > 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Towards parents (ancestors).
    Backward,
    /// Towards children (descendants).
    Forward,
    Both,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backward => "backward",
            Self::Forward => "forward",
            Self::Both => "both",
        }
    }

    #[must_use]
    pub fn max_depth(self) -> u8 {
        match self {
            Self::Backward | Self::Forward => MAX_SINGLE_DIRECTION_DEPTH,
            Self::Both => MAX_TREE_DEPTH,
        }
    }

    #[must_use]
    pub fn default_depth(self) -> u8 {
        match self {
            Self::Backward | Self::Forward => DEFAULT_SINGLE_DIRECTION_DEPTH,
            Self::Both => DEFAULT_TREE_DEPTH,
        }
    }

    fn walks_backward(self) -> bool {
        matches!(self, Self::Backward | Self::Both)
    }

    fn walks_forward(self) -> bool {
        matches!(self, Self::Forward | Self::Both)
    }
}

/// Resolves an optional requested depth against the bounds of `direction`.
///
/// # Errors
/// Returns [`WarehouseError::Validation`] when the depth is out of range.
pub fn resolve_depth(direction: Direction, requested: Option<u8>) -> Result<u8, WarehouseError> {
    let depth = requested.unwrap_or_else(|| direction.default_depth());
    let max = direction.max_depth();
    if depth == 0 || depth > max {
        let suffix = if direction == Direction::Both {
            " for full tree queries"
        } else {
            ""
        };
        return Err(WarehouseError::Validation(format!(
            "Depth must be between 1 and {max}{suffix}"
        )));
    }
    Ok(depth)
}

/// Source of genealogy links, queried one frontier at a time.
pub trait GenealogyEdges {
    type Error;

    /// Links whose child is in `children`.
    ///
    /// # Errors
    /// Propagates failures from the underlying edge store.
    fn parent_links(&self, children: &[LotId]) -> Result<Vec<GenealogyLink>, Self::Error>;

    /// Links whose parent is in `parents`.
    ///
    /// # Errors
    /// Propagates failures from the underlying edge store.
    fn child_links(&self, parents: &[LotId]) -> Result<Vec<GenealogyLink>, Self::Error>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceNode {
    pub lot_id: LotId,
    pub depth: u8,
    pub direction: Direction,
    pub quantity_used_kg: Option<Quantity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenealogyGraph {
    pub root: LotId,
    pub direction: Direction,
    pub depth: u8,
    pub nodes: Vec<TraceNode>,
    pub links: Vec<GenealogyLink>,
}

impl GenealogyGraph {
    pub fn ancestors(&self) -> impl Iterator<Item = &TraceNode> {
        self.nodes
            .iter()
            .filter(|node| node.direction == Direction::Backward)
    }

    pub fn descendants(&self) -> impl Iterator<Item = &TraceNode> {
        self.nodes
            .iter()
            .filter(|node| node.direction == Direction::Forward)
    }
}

/// Breadth-first walk from `root` up to `max_depth` levels.
///
/// Both directions share one visited set but keep independent frontiers.
/// Links are deduplicated by `(parent, child)`.
///
/// # Errors
/// Propagates edge-source failures.
pub fn traverse<E: GenealogyEdges>(
    edges: &E,
    root: LotId,
    direction: Direction,
    max_depth: u8,
) -> Result<GenealogyGraph, E::Error> {
    let mut visited = HashSet::from([root]);
    let mut seen_links = HashSet::new();
    let mut nodes = Vec::new();
    let mut links = Vec::new();

    let mut backward = if direction.walks_backward() {
        vec![root]
    } else {
        Vec::new()
    };
    let mut forward = if direction.walks_forward() {
        vec![root]
    } else {
        Vec::new()
    };

    for depth in 1..=max_depth {
        if backward.is_empty() && forward.is_empty() {
            break;
        }

        if !backward.is_empty() {
            let mut next = Vec::new();
            for link in edges.parent_links(&backward)? {
                let parent = link.parent_lot_id;
                if visited.insert(parent) {
                    nodes.push(TraceNode {
                        lot_id: parent,
                        depth,
                        direction: Direction::Backward,
                        quantity_used_kg: link.quantity_used_kg,
                    });
                    next.push(parent);
                }
                if seen_links.insert((link.parent_lot_id, link.child_lot_id)) {
                    links.push(link);
                }
            }
            backward = next;
        }

        if !forward.is_empty() {
            let mut next = Vec::new();
            for link in edges.child_links(&forward)? {
                let child = link.child_lot_id;
                if visited.insert(child) {
                    nodes.push(TraceNode {
                        lot_id: child,
                        depth,
                        direction: Direction::Forward,
                        quantity_used_kg: link.quantity_used_kg,
                    });
                    next.push(child);
                }
                if seen_links.insert((link.parent_lot_id, link.child_lot_id)) {
                    links.push(link);
                }
            }
            forward = next;
        }
    }

    Ok(GenealogyGraph {
        root,
        direction,
        depth: max_depth,
        nodes,
        links,
    })
}

/// Whether `candidate` is `lot` itself or one of its ancestors.
///
/// Linking `parent -> child` closes a cycle exactly when `child` is an
/// ancestor of `parent`. The walk terminates on the visited set.
///
/// # Errors
/// Propagates edge-source failures.
pub fn is_ancestor_or_self<E: GenealogyEdges>(
    edges: &E,
    lot: LotId,
    candidate: LotId,
) -> Result<bool, E::Error> {
    if lot == candidate {
        return Ok(true);
    }
    let mut visited = HashSet::from([lot]);
    let mut frontier = vec![lot];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for link in edges.parent_links(&frontier)? {
            if link.parent_lot_id == candidate {
                return Ok(true);
            }
            if visited.insert(link.parent_lot_id) {
                next.push(link.parent_lot_id);
            }
        }
        frontier = next;
    }
    Ok(false)
}

/// Every lot within `MAX_SINGLE_DIRECTION_DEPTH` levels of `root` in
/// `direction`, which bounds every cached trace.
///
/// # Errors
/// Propagates edge-source failures.
pub fn reachable<E: GenealogyEdges>(
    edges: &E,
    root: LotId,
    direction: Direction,
) -> Result<Vec<LotId>, E::Error> {
    let graph = traverse(edges, root, direction, MAX_SINGLE_DIRECTION_DEPTH)?;
    Ok(graph.nodes.into_iter().map(|node| node.lot_id).collect())
}

#[must_use]
pub fn trace_cache_key(lot_code: &str) -> String {
    format!("traceability:{lot_code}")
}

/// Full upstream/downstream trace for one lot, cacheable by lot code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeepTrace {
    pub lot_id: LotId,
    pub lot_code: String,
    pub ancestors: Vec<TraceNode>,
    pub descendants: Vec<TraceNode>,
    pub ancestor_count: usize,
    pub descendant_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
    #[serde(default)]
    pub cached: bool,
}

impl DeepTrace {
    /// Computes a deep trace for `lot` capped at `max_depth` levels.
    ///
    /// # Errors
    /// Propagates edge-source failures.
    pub fn compute<E: GenealogyEdges>(
        edges: &E,
        lot: &Lot,
        max_depth: u8,
        computed_at: OffsetDateTime,
    ) -> Result<Self, E::Error> {
        let ancestors = traverse(edges, lot.id, Direction::Backward, max_depth)?.nodes;
        let descendants = traverse(edges, lot.id, Direction::Forward, max_depth)?.nodes;
        Ok(Self {
            lot_id: lot.id,
            lot_code: lot.lot_code.clone(),
            ancestor_count: ancestors.len(),
            descendant_count: descendants.len(),
            ancestors,
            descendants,
            computed_at,
            cached: false,
        })
    }
}

/// Traversal node hydrated with its lot record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineageNode {
    pub lot: Lot,
    pub depth: u8,
    pub direction: Direction,
    pub quantity_used_kg: Option<Quantity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lineage {
    pub lot: Lot,
    pub direction: Direction,
    pub depth: u8,
    pub nodes: Vec<LineageNode>,
    pub links: Vec<GenealogyLink>,
}
