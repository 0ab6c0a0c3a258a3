use std::cmp::Ordering;
use std::fmt;

use crate::tree::NodeId;

/// The kinds of constraint a node can contribute to the fit.
///
/// An exhaustive sum type: adding a kind forces every projection dispatch
/// to handle it at compile time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstraintKind {
    /// Track-helix measurement of a final-state particle.
    Track,
    /// 4-momentum balance between a composite and its daughters.
    Kinematic,
    /// Consistency of a composite's vertex with its mother and decay length.
    Geometric,
    /// Invariant-mass pin of a composite.
    Mass,
    /// External prior fixing a node's 4-momentum to the beam's.
    Beam,
    /// Pin of a composite's decay length to its nominal value.
    Lifetime,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintKind::Track => "track",
            ConstraintKind::Kinematic => "kinematic",
            ConstraintKind::Geometric => "geometric",
            ConstraintKind::Mass => "mass",
            ConstraintKind::Beam => "beam",
            ConstraintKind::Lifetime => "lifetime",
        };
        write!(f, "{name}")
    }
}

/// A purely descriptive (node, kind, depth, dimension) tuple collected from
/// the tree before the fit; it never owns data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Constraint {
    pub node: NodeId,
    pub kind: ConstraintKind,
    /// Depth of the node in the tree; deeper constraints are filtered first
    /// so that daughters are in shape before their mothers.
    pub depth: i32,
    /// Number of residual rows this constraint produces.
    pub dim: usize,
}

impl Constraint {
    pub fn new(node: NodeId, kind: ConstraintKind, depth: i32, dim: usize) -> Self {
        Self {
            node,
            kind,
            depth,
            dim,
        }
    }
}

impl PartialOrd for Constraint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Constraint {
    fn cmp(&self, other: &Self) -> Ordering {
        // deepest first; ties broken by kind so that measurements come
        // before the balance constraints that consume them
        other
            .depth
            .cmp(&self.depth)
            .then(self.kind.cmp(&other.kind))
            .then(self.node.cmp(&other.node))
    }
}
