use indexmap::IndexSet;
use nalgebra::{Matrix4, Vector4};
use serde::{Deserialize, Serialize};

/// Tree-wide fit configuration, owned by the caller and shared by reference
/// across every node of a decay tree.
///
/// PDG membership is always tested on `|pdg|`, so one entry covers particle
/// and antiparticle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstraintConfiguration {
    /// |PDG| codes whose composite nodes get a mass constraint.
    pub mass_constraint_pdg: IndexSet<i32>,
    /// |PDG| code of the particle whose 4-momentum is pinned to the beam.
    pub beam_constraint_pdg: Option<i32>,
    /// Beam 4-momentum (px, py, pz, E) used by the beam constraint.
    pub beam_mom_e: Vector4<f64>,
    /// Covariance of [`beam_mom_e`](Self::beam_mom_e).
    pub beam_covariance: Matrix4<f64>,
    /// |PDG| codes forced to share their mother's vertex (manual mode).
    pub fixed_to_mother_vertex_pdg: IndexSet<i32>,
    /// |PDG| codes given a geometric constraint (manual mode).
    pub geo_constraint_pdg: IndexSet<i32>,
    /// When set, vertex sharing is decided per node from its
    /// strongly-decaying-resonance flag instead of the PDG lists above.
    pub automatic_vertex_constraining: bool,
    /// 2 or 3: dimensionality of the geometric constraint applied to the
    /// head-of-tree particle species.
    pub origin_dimension: usize,
    /// |PDG| code identifying the tree's root for the 2D/3D decision.
    pub head_of_tree_pdg: i32,
    /// Magnetic field along z in Tesla.
    pub field_tesla: f64,
}

impl Default for ConstraintConfiguration {
    fn default() -> Self {
        Self {
            mass_constraint_pdg: IndexSet::new(),
            beam_constraint_pdg: None,
            beam_mom_e: Vector4::zeros(),
            beam_covariance: Matrix4::identity(),
            fixed_to_mother_vertex_pdg: IndexSet::new(),
            geo_constraint_pdg: IndexSet::new(),
            automatic_vertex_constraining: true,
            origin_dimension: 3,
            head_of_tree_pdg: 0,
            field_tesla: 1.5,
        }
    }
}

impl ConstraintConfiguration {
    pub fn has_mass_constraint(&self, pdg: i32) -> bool {
        self.mass_constraint_pdg.contains(&pdg.abs())
    }

    pub fn has_beam_constraint(&self, pdg: i32) -> bool {
        self.beam_constraint_pdg == Some(pdg.abs())
    }

    pub fn is_fixed_to_mother_vertex(&self, pdg: i32) -> bool {
        self.fixed_to_mother_vertex_pdg.contains(&pdg.abs())
    }

    pub fn wants_geo_constraint(&self, pdg: i32) -> bool {
        self.geo_constraint_pdg.contains(&pdg.abs())
    }

    pub fn is_head_of_tree(&self, pdg: i32) -> bool {
        pdg.abs() == self.head_of_tree_pdg
    }
}
