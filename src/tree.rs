use log::{debug, warn};
use nalgebra::Vector3;

use crate::candidate::{Candidate, TrackFit, V0Fit};
use crate::config::ConstraintConfiguration;
use crate::constraint::{Constraint, ConstraintKind};
use crate::fitparams::{ErrCode, FitParams, Projection};
use crate::helix::{
    helix_from_vertex_jacobian, helix_poca, helix_poca_point, phidomain, vertex_from_helix,
    C_LIGHT,
};
use crate::{ArborError, ArborResult};

/// Variance seeds for the initial (deliberately loose) covariance.
const SEED_VAR_POS: f64 = 400.0; // (20 cm)^2
const SEED_VAR_TAU: f64 = 1000.0;
const SEED_VAR_MOM: f64 = 100.0; // (10 GeV)^2

/// Below this transverse displacement the momentum rotation of a charged
/// daughter over its flight length is not worth linearizing (1 um).
const POS_PRECISION: f64 = 1e-4;

/// Identifier of a node inside its [`DecayTree`]'s arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// Constraint membership of one node, evaluated once at construction from
/// the configuration and the node's PDG code; never re-evaluated later.
#[derive(Copy, Clone, Debug, Default)]
struct ConstraintPolicy {
    mass_constraint: bool,
    beam_constraint: bool,
    lifetime_constraint: bool,
    is_conversion: bool,
    shares_vertex: bool,
    geo_constraint: bool,
}

impl ConstraintPolicy {
    fn for_composite(
        candidate: &Candidate,
        has_mother: bool,
        config: &ConstraintConfiguration,
    ) -> Self {
        let shares_vertex = if config.automatic_vertex_constraining {
            candidate.is_strong_resonance && has_mother
        } else {
            config.is_fixed_to_mother_vertex(candidate.pdg) && has_mother
        };
        let geo_constraint = if config.automatic_vertex_constraining {
            has_mother && !shares_vertex
        } else {
            config.wants_geo_constraint(candidate.pdg) && has_mother && !shares_vertex
        };
        Self {
            mass_constraint: config.has_mass_constraint(candidate.pdg),
            beam_constraint: config.has_beam_constraint(candidate.pdg),
            lifetime_constraint: candidate.decay_length.is_some(),
            is_conversion: candidate.pdg == 22 && candidate.daughters.len() == 2,
            shares_vertex,
            geo_constraint,
        }
    }
}

#[derive(Clone, Debug)]
enum NodeKind {
    /// Charged final-state particle wrapping a track measurement.
    Track { fit: TrackFit },
    /// Composite particle owning daughter nodes.
    Composite {
        v0: Option<V0Fit>,
        vertex_hint: Option<Vector3<f64>>,
    },
}

#[derive(Clone, Debug)]
struct Node {
    pdg: i32,
    mass: f64,
    charge: i32,
    decay_length: Option<f64>,
    kind: NodeKind,
    mother: Option<NodeId>,
    daughters: Vec<NodeId>,
    depth: i32,
    policy: ConstraintPolicy,
    /// First slot of this node's contiguous range in the global state.
    offset: usize,
    /// Number of slots owned, one of {4, 7, 8}.
    dim: usize,
}

impl Node {
    fn is_track(&self) -> bool {
        matches!(self.kind, NodeKind::Track { .. })
    }

    /// Whether this node owns position slots of its own.
    fn owns_position(&self) -> bool {
        match self.kind {
            NodeKind::Track { .. } => false,
            NodeKind::Composite { .. } => !self.policy.shares_vertex,
        }
    }

    fn has_energy(&self) -> bool {
        !self.is_track()
    }

    /// State dimension from the layout flags alone.
    fn state_dim(&self) -> usize {
        match self.kind {
            // tau + 3-momentum
            NodeKind::Track { .. } => 4,
            NodeKind::Composite { .. } => {
                if self.policy.shares_vertex {
                    4 // 4-momentum only
                } else if self.policy.geo_constraint {
                    8 // position + tau + 4-momentum
                } else {
                    7 // position + 4-momentum (head of tree)
                }
            }
        }
    }
}

/// A decay tree laid out over one global state vector.
///
/// Nodes live in an arena and refer to each other by [`NodeId`]; a node's
/// mother link is a plain back-reference used only for index queries.
#[derive(Clone, Debug)]
pub struct DecayTree {
    nodes: Vec<Node>,
    head: NodeId,
    config: ConstraintConfiguration,
    dim: usize,
}

impl DecayTree {
    /// Build the tree mirroring the candidate's daughter structure and
    /// assign every node its state-vector range.
    pub fn new(candidate: &Candidate, config: &ConstraintConfiguration) -> ArborResult<Self> {
        if candidate.is_final_state() {
            return Err(ArborError::Construction {
                reason: format!(
                    "head particle {} has no daughters to fit a vertex from",
                    candidate.pdg
                ),
            });
        }
        let mut tree = Self {
            nodes: Vec::new(),
            head: NodeId(0),
            config: config.clone(),
            dim: 0,
        };
        let head = tree.add_candidate(candidate, None, 0)?;
        tree.head = head;
        let mut offset = 0;
        tree.assign_indices(head, &mut offset);
        tree.dim = offset;
        Ok(tree)
    }

    fn add_candidate(
        &mut self,
        candidate: &Candidate,
        mother: Option<NodeId>,
        depth: i32,
    ) -> ArborResult<NodeId> {
        let id = NodeId(self.nodes.len());
        let (kind, policy) = if candidate.is_final_state() {
            let fit = candidate.track.clone().ok_or_else(|| {
                ArborError::Construction {
                    reason: format!(
                        "final-state particle {} carries no track fit result",
                        candidate.pdg
                    ),
                }
            })?;
            if candidate.charge == 0 {
                return Err(ArborError::Construction {
                    reason: format!("final-state particle {} is neutral", candidate.pdg),
                });
            }
            (NodeKind::Track { fit }, ConstraintPolicy::default())
        } else {
            (
                NodeKind::Composite {
                    v0: candidate.v0.clone(),
                    vertex_hint: candidate.vertex_hint,
                },
                ConstraintPolicy::for_composite(candidate, mother.is_some(), &self.config),
            )
        };
        self.nodes.push(Node {
            pdg: candidate.pdg,
            mass: candidate.mass,
            charge: candidate.charge,
            decay_length: candidate.decay_length,
            kind,
            mother,
            daughters: Vec::new(),
            depth,
            policy,
            offset: 0,
            dim: 0,
        });
        for daughter in &candidate.daughters {
            let did = self.add_candidate(daughter, Some(id), depth + 1)?;
            self.nodes[id.0].daughters.push(did);
        }
        Ok(id)
    }

    /// Depth-first, daughters-first slot assignment; sibling ranges can
    /// never overlap by construction.
    fn assign_indices(&mut self, id: NodeId, offset: &mut usize) {
        let daughters = self.nodes[id.0].daughters.clone();
        for did in daughters {
            self.assign_indices(did, offset);
        }
        let dim = self.nodes[id.0].state_dim();
        self.nodes[id.0].offset = *offset;
        self.nodes[id.0].dim = dim;
        *offset += dim;
    }

    pub fn head(&self) -> NodeId {
        self.head
    }

    /// Total state dimension (sum of all node dimensions).
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn config(&self) -> &ConstraintConfiguration {
        &self.config
    }

    pub fn daughters(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].daughters
    }

    pub fn mother(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].mother
    }

    pub fn pdg(&self, id: NodeId) -> i32 {
        self.nodes[id.0].pdg
    }

    /// Nominal (PDG) mass of the node's hypothesis.
    pub fn mass(&self, id: NodeId) -> f64 {
        self.nodes[id.0].mass
    }

    /// First node (depth-first) with the given PDG code.
    pub fn find(&self, pdg: i32) -> Option<NodeId> {
        self.walk(self.head).find(|&id| self.nodes[id.0].pdg == pdg)
    }

    /// Depth-first iterator over the subtree rooted at `id`.
    fn walk(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut stack = vec![id];
        std::iter::from_fn(move || {
            let next = stack.pop()?;
            for &did in self.nodes[next.0].daughters.iter().rev() {
                stack.push(did);
            }
            Some(next)
        })
    }

    /// Number of state slots owned by `id` (4, 7 or 8).
    pub fn node_dim(&self, id: NodeId) -> usize {
        self.nodes[id.0].dim
    }

    /// Index of the position block this node's vertex lives in; nodes that
    /// share their mother's vertex (and all track leaves) borrow hers.
    pub fn pos_index(&self, id: NodeId) -> Option<usize> {
        let node = &self.nodes[id.0];
        if node.owns_position() {
            Some(node.offset)
        } else {
            node.mother.and_then(|m| self.pos_index(m))
        }
    }

    /// Index of the decay-length slot, when the node owns one.
    pub fn tau_index(&self, id: NodeId) -> Option<usize> {
        let node = &self.nodes[id.0];
        match node.kind {
            NodeKind::Track { .. } => Some(node.offset),
            NodeKind::Composite { .. } => {
                if node.policy.geo_constraint && !node.policy.shares_vertex {
                    Some(node.offset + 3)
                } else {
                    None
                }
            }
        }
    }

    /// Index of the first momentum slot.
    pub fn mom_index(&self, id: NodeId) -> usize {
        let node = &self.nodes[id.0];
        match node.kind {
            NodeKind::Track { .. } => node.offset + 1,
            NodeKind::Composite { .. } => node.offset + node.dim - 4,
        }
    }

    /// Whether the node carries an explicit energy slot (4-momentum) rather
    /// than a 3-momentum plus PDG mass.
    pub fn has_energy(&self, id: NodeId) -> bool {
        self.nodes[id.0].has_energy()
    }

    fn bz(&self) -> f64 {
        self.config.field_tesla
    }

    /// All descendants whose trajectories pass through the position block at
    /// `pos_index` (daughters, plus the daughters of vertex-sharing chains).
    pub fn collect_vertex_daughters(&self, id: NodeId, pos_index: usize) -> Vec<NodeId> {
        let mut list = Vec::new();
        self.collect_vertex_daughters_into(id, pos_index, &mut list);
        list
    }

    fn collect_vertex_daughters_into(&self, id: NodeId, pos_index: usize, list: &mut Vec<NodeId>) {
        for &did in &self.nodes[id.0].daughters {
            list.push(did);
            if self.pos_index(did) == Some(pos_index) {
                self.collect_vertex_daughters_into(did, pos_index, list);
            }
        }
    }

    // ----------------------------------------------------------------
    // staged initialization
    // ----------------------------------------------------------------

    /// Stage 1 of the initialization protocol, entered at the head of the
    /// tree: recurse daughters-first, seed every owned vertex, then set the
    /// daughters' mother-dependent state and sum up momenta.
    pub fn init_motherless_particle(&self, id: NodeId, fitparams: &mut FitParams) -> ErrCode {
        let node = &self.nodes[id.0];
        let mut status = ErrCode::SUCCESS;
        match node.kind {
            NodeKind::Track { ref fit } => {
                // seed flight length at the perigee; momentum follows in
                // stage 2 once the production vertex is known
                let tau_index = self.tau_index(id).expect("tracks own a flight length");
                *fitparams.par_mut(tau_index) = 0.0;
                let (_, momentum, _) = vertex_from_helix(&fit.helix, 0.0, self.bz());
                let mom_index = self.mom_index(id);
                fitparams
                    .par_slice_mut(mom_index, 3)
                    .copy_from_slice(momentum.as_slice());
            }
            NodeKind::Composite { .. } => {
                for &did in &node.daughters {
                    status |= self.init_motherless_particle(did, fitparams);
                }
                if node.owns_position() {
                    status |= self.seed_vertex(id, fitparams);
                }
                for &did in &node.daughters {
                    status |= self.init_particle_with_mother(did, fitparams);
                }
                status |= self.init_momentum(id, fitparams);
            }
        }
        status
    }

    /// Seed an owned vertex. Priority: an already-known vertex (previous fit
    /// or V0), then the POCA of the two leading-pT track daughters, then the
    /// mother's position, then the origin.
    fn seed_vertex(&self, id: NodeId, fitparams: &mut FitParams) -> ErrCode {
        let node = &self.nodes[id.0];
        let pos_index = self.pos_index(id).expect("caller checked owns_position");

        // a daughter recursion may already have filled these slots
        if fitparams.par_slice(pos_index, 3).iter().any(|x| *x != 0.0) {
            return ErrCode::SUCCESS;
        }

        let (v0, vertex_hint) = match &node.kind {
            NodeKind::Composite { v0, vertex_hint } => (v0.as_ref(), vertex_hint.as_ref()),
            NodeKind::Track { .. } => unreachable!("tracks own no position"),
        };

        if let Some(vtx) = vertex_hint {
            if vtx.norm() != 0.0 {
                debug!("seeding {} from existing vertex {vtx:?}", node.pdg);
                fitparams
                    .par_slice_mut(pos_index, 3)
                    .copy_from_slice(vtx.as_slice());
                return ErrCode::SUCCESS;
            }
        }

        let all_daughters = self.collect_vertex_daughters(id, pos_index);
        let mut trk_daughters: Vec<NodeId> = all_daughters
            .iter()
            .copied()
            .filter(|&d| self.nodes[d.0].is_track())
            .collect();
        let vtx_daughters: Vec<NodeId> = all_daughters
            .iter()
            .copied()
            .filter(|&d| {
                self.nodes[d.0].owns_position()
                    && self
                        .pos_index(d)
                        .map_or(false, |pi| fitparams.par(pi) != 0.0)
            })
            .collect();

        let mut status = ErrCode::SUCCESS;

        // an upstream V0 fit beats everything, provided at least two track
        // daughters can take their flight lengths from it
        if let Some(v0) = v0 {
            if trk_daughters.len() >= 2 && v0.vertex.norm() != 0.0 {
                fitparams
                    .par_slice_mut(pos_index, 3)
                    .copy_from_slice(v0.vertex.as_slice());
                for &did in &trk_daughters {
                    let NodeKind::Track { ref fit } = self.nodes[did.0].kind else {
                        unreachable!()
                    };
                    let (flt, _) = helix_poca_point(&fit.helix, &v0.vertex);
                    let tau_index = self.tau_index(did).expect("tracks own a flight length");
                    *fitparams.par_mut(tau_index) = flt;
                }
                return status;
            }
            status |= ErrCode::MISSING_ASSOCIATION;
            warn!(
                "V0 vertex on {} unusable ({} track daughters); falling back to POCA seeding",
                node.pdg,
                trk_daughters.len()
            );
        }

        if trk_daughters.len() >= 2 {
            if trk_daughters.len() > 2 {
                trk_daughters.sort_by(|&a, &b| {
                    self.track_pt(b)
                        .partial_cmp(&self.track_pt(a))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            let NodeKind::Track { fit: ref fit1 } = self.nodes[trk_daughters[0].0].kind else {
                unreachable!()
            };
            let NodeKind::Track { fit: ref fit2 } = self.nodes[trk_daughters[1].0].kind else {
                unreachable!()
            };
            let poca = helix_poca(&fit1.helix, &fit2.helix, node.policy.is_conversion);
            fitparams
                .par_slice_mut(pos_index, 3)
                .copy_from_slice(poca.point.as_slice());
            let tau1 = self.tau_index(trk_daughters[0]).expect("track");
            let tau2 = self.tau_index(trk_daughters[1]).expect("track");
            *fitparams.par_mut(tau1) = poca.flt1;
            *fitparams.par_mut(tau2) = poca.flt2;
            return status;
        }

        if trk_daughters.len() + vtx_daughters.len() >= 2 {
            // not enough charged tracks from this vertex; a trajectory-based
            // multi-poca seed would go here
            warn!(
                "vertex of {} has {} tracks and {} vertexed composites; seeding from composites",
                node.pdg,
                trk_daughters.len(),
                vtx_daughters.len()
            );
            let mut seed = Vector3::zeros();
            for &did in &vtx_daughters {
                let dpi = self.pos_index(did).expect("owns a position");
                seed += Vector3::from_iterator(fitparams.par_slice(dpi, 3).iter().copied());
            }
            seed /= vtx_daughters.len() as f64;
            fitparams
                .par_slice_mut(pos_index, 3)
                .copy_from_slice(seed.as_slice());
            return status;
        }

        if let Some(mother) = node.mother {
            if let Some(mother_pos) = self.pos_index(mother) {
                // dimension-limited copy: a 2D origin keeps z at zero
                let ncopy = self.config.origin_dimension.min(3);
                for row in 0..ncopy {
                    *fitparams.par_mut(pos_index + row) = fitparams.par(mother_pos + row);
                }
                return status;
            }
        }

        warn!(
            "there are not sufficient geometric constraints to seed {}; \
             perhaps you should add a beam constraint",
            node.pdg
        );
        status | ErrCode::BAD_SETUP
    }

    fn track_pt(&self, id: NodeId) -> f64 {
        match self.nodes[id.0].kind {
            NodeKind::Track { ref fit } => (C_LIGHT * self.bz() / fit.helix.omega).abs(),
            NodeKind::Composite { .. } => 0.0,
        }
    }

    /// Stage 2: mother-dependent initialization, called once per node by
    /// the mother's stage-1 pass.
    pub fn init_particle_with_mother(&self, id: NodeId, fitparams: &mut FitParams) -> ErrCode {
        let node = &self.nodes[id.0];
        match node.kind {
            NodeKind::Track { ref fit } => {
                let tau_index = self.tau_index(id).expect("tracks own a flight length");
                let mother = node.mother.expect("tracks always have a mother");
                if let Some(mother_pos) = self.pos_index(mother) {
                    let vtx =
                        Vector3::from_iterator(fitparams.par_slice(mother_pos, 3).iter().copied());
                    if fitparams.par(tau_index) == 0.0 && vtx.norm() != 0.0 {
                        let (flt, _) = helix_poca_point(&fit.helix, &vtx);
                        *fitparams.par_mut(tau_index) = flt;
                    }
                }
                // momentum at the current flight length
                let (_, momentum, _) =
                    vertex_from_helix(&fit.helix, fitparams.par(tau_index), self.bz());
                let mom_index = self.mom_index(id);
                fitparams
                    .par_slice_mut(mom_index, 3)
                    .copy_from_slice(momentum.as_slice());
                ErrCode::SUCCESS
            }
            NodeKind::Composite { .. } => {
                if node.owns_position() {
                    if let Some(mother) = node.mother {
                        let pos_index = self.pos_index(id).expect("owns a position");
                        let still_origin =
                            fitparams.par_slice(pos_index, 3).iter().all(|x| *x == 0.0);
                        if still_origin {
                            if let Some(mother_pos) = self.pos_index(mother) {
                                for row in 0..3 {
                                    *fitparams.par_mut(pos_index + row) =
                                        fitparams.par(mother_pos + row);
                                }
                            }
                        }
                    }
                }
                self.init_tau(id, fitparams)
            }
        }
    }

    /// Seed an owned decay-length slot from the current positions: the
    /// distance from the mother's vertex projected on the momentum.
    fn init_tau(&self, id: NodeId, fitparams: &mut FitParams) -> ErrCode {
        let Some(tau_index) = self.tau_index(id) else {
            return ErrCode::SUCCESS;
        };
        let node = &self.nodes[id.0];
        let (Some(mother), Some(pos_index)) = (node.mother, self.pos_index(id)) else {
            return ErrCode::SUCCESS;
        };
        let Some(mother_pos) = self.pos_index(mother) else {
            return ErrCode::SUCCESS;
        };
        let mom_index = self.mom_index(id);
        let mom = Vector3::from_iterator(fitparams.par_slice(mom_index, 3).iter().copied());
        let mag = mom.norm();
        if mag == 0.0 {
            *fitparams.par_mut(tau_index) = 0.0;
            return ErrCode::SUCCESS;
        }
        let mut flight = 0.0;
        for row in 0..3 {
            flight += (fitparams.par(pos_index + row) - fitparams.par(mother_pos + row))
                * mom[row]
                / mag;
        }
        *fitparams.par_mut(tau_index) = flight;
        ErrCode::SUCCESS
    }

    /// Stage 3: zero the momentum slots and add up the daughters, filling in
    /// the energy of daughters parameterized without one.
    pub fn init_momentum(&self, id: NodeId, fitparams: &mut FitParams) -> ErrCode {
        let mom_index = self.mom_index(id);
        for row in 0..4 {
            *fitparams.par_mut(mom_index + row) = 0.0;
        }
        for &did in &self.nodes[id.0].daughters {
            let dau_mom = self.mom_index(did);
            let maxrow = if self.has_energy(did) { 4 } else { 3 };
            let mut e2 = 0.0;
            for row in 0..maxrow {
                let px = fitparams.par(dau_mom + row);
                e2 += px * px;
                *fitparams.par_mut(mom_index + row) += px;
            }
            if maxrow == 3 {
                let mass = self.nodes[did.0].mass;
                *fitparams.par_mut(mom_index + 3) += (e2 + mass * mass).sqrt();
            }
        }
        ErrCode::SUCCESS
    }

    /// Stage 4: the diagonal large-uncertainty covariance seed for the whole
    /// tree, in state order.
    pub fn covariance_seed(&self) -> nalgebra::DVector<f64> {
        let mut seed = nalgebra::DVector::zeros(self.dim);
        for id in self.walk(self.head) {
            let node = &self.nodes[id.0];
            if node.owns_position() {
                let pos = self.pos_index(id).expect("owns a position");
                for row in 0..3 {
                    seed[pos + row] = SEED_VAR_POS;
                }
            }
            if let Some(tau) = self.tau_index(id) {
                seed[tau] = SEED_VAR_TAU;
            }
            let mom = self.mom_index(id);
            let nmom = if node.has_energy() { 4 } else { 3 };
            for row in 0..nmom {
                seed[mom + row] = SEED_VAR_MOM;
            }
        }
        seed
    }

    // ----------------------------------------------------------------
    // constraint collection and projection
    // ----------------------------------------------------------------

    /// Collect every applicable constraint of the whole tree, daughters
    /// before mothers; the returned list sorts deepest-first.
    pub fn constraints(&self) -> Vec<Constraint> {
        let mut list = Vec::new();
        self.add_to_constraint_list(self.head, &mut list);
        list.sort();
        list
    }

    fn add_to_constraint_list(&self, id: NodeId, list: &mut Vec<Constraint>) {
        let node = &self.nodes[id.0];
        for &did in &node.daughters {
            self.add_to_constraint_list(did, list);
        }
        let depth = node.depth;
        match node.kind {
            NodeKind::Track { .. } => {
                list.push(Constraint::new(id, ConstraintKind::Track, depth, 6));
            }
            NodeKind::Composite { .. } => {
                if self.tau_index(id).is_some() && node.policy.lifetime_constraint {
                    list.push(Constraint::new(id, ConstraintKind::Lifetime, depth, 1));
                }
                list.push(Constraint::new(id, ConstraintKind::Kinematic, depth, 4));
                if node.policy.geo_constraint && self.tau_index(id).is_some() {
                    list.push(Constraint::new(
                        id,
                        ConstraintKind::Geometric,
                        depth,
                        self.geo_dim(id),
                    ));
                }
                if node.policy.mass_constraint {
                    list.push(Constraint::new(id, ConstraintKind::Mass, depth, 1));
                }
                if node.policy.beam_constraint {
                    list.push(Constraint::new(id, ConstraintKind::Beam, depth, 4));
                }
            }
        }
    }

    fn geo_dim(&self, id: NodeId) -> usize {
        if self.config.origin_dimension == 2 && self.config.is_head_of_tree(self.nodes[id.0].pdg) {
            2
        } else {
            3
        }
    }

    /// Linearize one constraint against the current state. The dispatch is
    /// an exhaustive match: a new constraint kind cannot be forgotten here.
    pub fn project_constraint(
        &self,
        constraint: &Constraint,
        fitparams: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        match constraint.kind {
            ConstraintKind::Track => self.project_track_constraint(constraint.node, fitparams, projection),
            ConstraintKind::Kinematic => {
                self.project_kine_constraint(constraint.node, fitparams, projection)
            }
            ConstraintKind::Geometric => {
                self.project_geo_constraint(constraint.node, fitparams, projection)
            }
            ConstraintKind::Mass => self.project_mass_constraint(constraint.node, fitparams, projection),
            ConstraintKind::Beam => self.project_beam_constraint(constraint.node, fitparams, projection),
            ConstraintKind::Lifetime => {
                self.project_lifetime_constraint(constraint.node, fitparams, projection)
            }
        }
    }

    /// Track measurement: predicted perigee parameters from the production
    /// vertex and momentum against the measured ones, plus one noiseless row
    /// tying the flight-length slot to the predicted arc length.
    fn project_track_constraint(
        &self,
        id: NodeId,
        fitparams: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        let node = &self.nodes[id.0];
        let NodeKind::Track { ref fit } = node.kind else {
            return ErrCode::BAD_SETUP;
        };
        let Some(pos_index) = self.pos_index(id) else {
            return ErrCode::BAD_SETUP;
        };
        let mom_index = self.mom_index(id);
        let tau_index = self.tau_index(id).expect("tracks own a flight length");

        let position = Vector3::from_iterator(fitparams.par_slice(pos_index, 3).iter().copied());
        let momentum = Vector3::from_iterator(fitparams.par_slice(mom_index, 3).iter().copied());
        let (predicted, arclen, jacobian) =
            helix_from_vertex_jacobian(&position, &momentum, node.charge, self.bz());

        let measured = [
            fit.helix.d0,
            fit.helix.phi0,
            fit.helix.omega,
            fit.helix.z0,
            fit.helix.tan_lambda,
        ];
        let predicted = [
            predicted.d0,
            predicted.phi0,
            predicted.omega,
            predicted.z0,
            predicted.tan_lambda,
        ];
        for row in 0..5 {
            let mut residual = predicted[row] - measured[row];
            if row == 1 {
                residual = phidomain(residual);
            }
            *projection.r_mut(row) = residual;
            for col in 0..3 {
                *projection.h_mut(row, pos_index + col) = jacobian[(row, col)];
                *projection.h_mut(row, mom_index + col) = jacobian[(row, col + 3)];
            }
            for col in 0..5 {
                *projection.v_mut(row, col) = fit.covariance[(row, col)];
            }
        }
        // flight-length row: tie the state slot to the predicted arc length
        *projection.r_mut(5) = fitparams.par(tau_index) - arclen;
        *projection.h_mut(5, tau_index) = 1.0;
        for col in 0..3 {
            *projection.h_mut(5, pos_index + col) = -jacobian[(5, col)];
            *projection.h_mut(5, mom_index + col) = -jacobian[(5, col + 3)];
        }
        ErrCode::SUCCESS
    }

    /// 4-momentum balance: four constraints filtered as one.
    fn project_kine_constraint(
        &self,
        id: NodeId,
        fitparams: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        let mom_index = self.mom_index(id);
        for row in 0..4 {
            *projection.r_mut(row) = fitparams.par(mom_index + row);
            *projection.h_mut(row, mom_index + row) = 1.0;
        }

        for &did in &self.nodes[id.0].daughters {
            let dau = &self.nodes[did.0];
            let dau_mom = self.mom_index(did);
            let dau_tau = self.tau_index(did);
            let maxrow = if dau.has_energy() { 4 } else { 3 };
            let mut e2 = dau.mass * dau.mass;
            for row in 0..maxrow {
                let px = fitparams.par(dau_mom + row);
                e2 += px * px;
                *projection.r_mut(row) -= px;
                *projection.h_mut(row, dau_mom + row) = -1.0;
            }

            if maxrow == 3 {
                // energy of daughters parameterized with p3 and PDG mass
                let energy = e2.sqrt();
                *projection.r_mut(3) -= energy;
                for col in 0..3 {
                    let px = fitparams.par(dau_mom + col);
                    *projection.h_mut(3, dau_mom + col) = -px / energy;
                }
            } else if let Some(dau_tau) = dau_tau {
                if dau.charge != 0 {
                    // the momentum of a charged daughter rotates in the
                    // field over its flight; tau is a 3D length in cm, so
                    // the turning angle is q*c*Bz*tau / |p|
                    let tau = fitparams.par(dau_tau);
                    let px0 = fitparams.par(dau_mom);
                    let py0 = fitparams.par(dau_mom + 1);
                    let pz0 = fitparams.par(dau_mom + 2);
                    let pt0 = px0.hypot(py0);
                    let p_mag = (px0 * px0 + py0 * py0 + pz0 * pz0).sqrt();
                    if p_mag > 0.0 {
                        let aq = C_LIGHT * self.bz() * dau.charge as f64;
                        let alpha = aq * tau / p_mag;
                        // skip when the transverse displacement over the
                        // turn stays below resolution
                        if (pt0 / p_mag * tau * alpha).abs() > POS_PRECISION {
                            let sina = alpha.sin();
                            let cosa = alpha.cos();
                            let px = px0 * cosa - py0 * sina;
                            let py = py0 * cosa + px0 * sina;
                            *projection.r_mut(0) += px0 - px;
                            *projection.r_mut(1) += py0 - py;
                            *projection.h_mut(0, dau_mom) += 1.0 - cosa;
                            *projection.h_mut(0, dau_mom + 1) += sina;
                            *projection.h_mut(0, dau_tau) += py * aq / p_mag;
                            *projection.h_mut(1, dau_mom) += -sina;
                            *projection.h_mut(1, dau_mom + 1) += 1.0 - cosa;
                            *projection.h_mut(1, dau_tau) += -px * aq / p_mag;
                            // the angle itself runs against |p|
                            for col in 0..3 {
                                let dalpha =
                                    -alpha * fitparams.par(dau_mom + col) / (p_mag * p_mag);
                                *projection.h_mut(0, dau_mom + col) += py * dalpha;
                                *projection.h_mut(1, dau_mom + col) += -px * dalpha;
                            }
                        }
                    }
                }
            }
        }
        ErrCode::SUCCESS
    }

    /// Vertex consistency: the node's vertex must sit at the mother's vertex
    /// displaced by the decay length along the momentum direction.
    fn project_geo_constraint(
        &self,
        id: NodeId,
        fitparams: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        let node = &self.nodes[id.0];
        let Some(mother) = node.mother else {
            return ErrCode::BAD_SETUP;
        };
        let (Some(pos_index), Some(mother_pos), Some(tau_index)) =
            (self.pos_index(id), self.pos_index(mother), self.tau_index(id))
        else {
            return ErrCode::BAD_SETUP;
        };
        let mom_index = self.mom_index(id);
        let tau = fitparams.par(tau_index);
        let mom = Vector3::from_iterator(fitparams.par_slice(mom_index, 3).iter().copied());
        let mag = mom.norm();
        if mag == 0.0 {
            return ErrCode::DIVERGING;
        }
        let dim = self.geo_dim(id);
        for row in 0..dim {
            let px = mom[row];
            *projection.r_mut(row) =
                fitparams.par(mother_pos + row) + tau * px / mag - fitparams.par(pos_index + row);
            *projection.h_mut(row, mother_pos + row) = 1.0;
            *projection.h_mut(row, pos_index + row) = -1.0;
            *projection.h_mut(row, tau_index) = px / mag;
            for col in 0..3 {
                let delta = if row == col { 1.0 } else { 0.0 };
                *projection.h_mut(row, mom_index + col) =
                    tau * (delta / mag - px * mom[col] / (mag * mag * mag));
            }
        }
        ErrCode::SUCCESS
    }

    /// Invariant-mass pin: r = (E^2 - p^2) - m^2.
    fn project_mass_constraint(
        &self,
        id: NodeId,
        fitparams: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        let node = &self.nodes[id.0];
        let mom_index = self.mom_index(id);
        let px = fitparams.par(mom_index);
        let py = fitparams.par(mom_index + 1);
        let pz = fitparams.par(mom_index + 2);
        let e = fitparams.par(mom_index + 3);
        *projection.r_mut(0) = e * e - px * px - py * py - pz * pz - node.mass * node.mass;
        *projection.h_mut(0, mom_index) = -2.0 * px;
        *projection.h_mut(0, mom_index + 1) = -2.0 * py;
        *projection.h_mut(0, mom_index + 2) = -2.0 * pz;
        *projection.h_mut(0, mom_index + 3) = 2.0 * e;
        ErrCode::SUCCESS
    }

    /// Beam prior: fix the node's 4-momentum to the configured beam
    /// 4-momentum within the beam covariance.
    fn project_beam_constraint(
        &self,
        id: NodeId,
        fitparams: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        let mom_index = self.mom_index(id);
        for row in 0..4 {
            *projection.r_mut(row) = self.config.beam_mom_e[row] - fitparams.par(mom_index + row);
            *projection.h_mut(row, mom_index + row) = -1.0;
            for col in 0..4 {
                *projection.v_mut(row, col) = self.config.beam_covariance[(row, col)];
            }
        }
        ErrCode::SUCCESS
    }

    /// Decay-length pin to the nominal value, with the nominal value squared
    /// as its variance.
    fn project_lifetime_constraint(
        &self,
        id: NodeId,
        fitparams: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        let node = &self.nodes[id.0];
        let (Some(tau_index), Some(nominal)) = (self.tau_index(id), node.decay_length) else {
            return ErrCode::BAD_SETUP;
        };
        *projection.r_mut(0) = fitparams.par(tau_index) - nominal;
        *projection.h_mut(0, tau_index) = 1.0;
        *projection.v_mut(0, 0) = nominal * nominal;
        ErrCode::SUCCESS
    }

    /// Post-fit cleanup: momentum sums are not exactly conserved at the end
    /// of fits that include mass constraints; re-force every composite's
    /// momentum slots to the daughter sum, bottom-up.
    pub fn force_p4_sum(&self, id: NodeId, fitparams: &mut FitParams) {
        let node = &self.nodes[id.0];
        for &did in &node.daughters {
            self.force_p4_sum(did, fitparams);
        }
        if node.is_track() {
            return;
        }
        let mom_index = self.mom_index(id);
        let mut projection = Projection::new(4, fitparams.dim());
        self.project_kine_constraint(id, fitparams, &mut projection);
        for row in 0..4 {
            *fitparams.par_mut(mom_index + row) -= projection.r(row);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Candidate, TrackFit};
    use crate::helix::helix_from_vertex;
    use approx::assert_relative_eq;
    use nalgebra::Matrix5;

    const BZ: f64 = 1.5;
    const PION_MASS: f64 = 0.13957;
    const KAON_MASS: f64 = 0.493677;

    fn track_from(vertex: &Vector3<f64>, momentum: &Vector3<f64>, pdg: i32, mass: f64) -> Candidate {
        let charge = if pdg > 0 { 1 } else { -1 };
        let (helix, _) = helix_from_vertex(vertex, momentum, charge, BZ);
        Candidate::track(
            pdg,
            mass,
            charge,
            TrackFit {
                helix,
                covariance: Matrix5::identity() * 1e-6,
            },
        )
    }

    /// D0 -> K- pi+ pi0-less two-prong plus a bachelor pion on the B side is
    /// overkill here; a plain three-body composite does the job.
    fn three_body() -> (Candidate, Vector3<f64>, [Vector3<f64>; 3]) {
        let vertex = Vector3::new(0.25, -0.1, 0.35);
        let momenta = [
            Vector3::new(0.9, 0.2, 0.3),
            Vector3::new(-0.2, 0.8, -0.1),
            Vector3::new(0.4, -0.5, 0.6),
        ];
        let d0 = Candidate::composite(
            421,
            1.86484,
            0,
            vec![
                track_from(&vertex, &momenta[0], -321, KAON_MASS),
                track_from(&vertex, &momenta[1], 211, PION_MASS),
                track_from(&vertex, &momenta[2], 211, PION_MASS),
            ],
        );
        (d0, vertex, momenta)
    }

    #[test]
    fn test_dim_invariant() {
        // head: 7 slots; plain daughters-of-head tracks: 4 each
        let (d0, _, _) = three_body();
        let config = ConstraintConfiguration::default();
        let tree = DecayTree::new(&d0, &config).unwrap();
        let head = tree.head();
        assert_eq!(tree.node_dim(head), 7);
        for &did in tree.daughters(head) {
            assert_eq!(tree.node_dim(did), 4);
        }
        assert_eq!(tree.dim(), 7 + 3 * 4);
    }

    #[test]
    fn test_dim_of_constrained_and_sharing_composites() {
        let vertex = Vector3::new(0.1, 0.0, 0.2);
        let p1 = Vector3::new(0.7, 0.1, 0.2);
        let p2 = Vector3::new(-0.1, 0.6, -0.2);
        let kshort = Candidate::composite(
            310,
            0.49761,
            0,
            vec![
                track_from(&vertex, &p1, 211, PION_MASS),
                track_from(&vertex, &p2, -211, PION_MASS),
            ],
        );
        let rho = Candidate::composite(
            113,
            0.77526,
            0,
            vec![
                track_from(&vertex, &p1, 211, PION_MASS),
                track_from(&vertex, &p2, -211, PION_MASS),
            ],
        )
        .as_resonance();
        let b0 = Candidate::composite(511, 5.27966, 0, vec![kshort, rho]);
        let config = ConstraintConfiguration::default();
        let tree = DecayTree::new(&b0, &config).unwrap();

        let head = tree.head();
        let ks = tree.find(310).unwrap();
        let rho = tree.find(113).unwrap();
        assert_eq!(tree.node_dim(head), 7); // position + 4-momentum
        assert_eq!(tree.node_dim(ks), 8); // own vertex, tau, 4-momentum
        assert_eq!(tree.node_dim(rho), 4); // borrows the B vertex
        assert_eq!(tree.pos_index(rho), tree.pos_index(head));
        assert!(tree.tau_index(rho).is_none());
        assert!(tree.tau_index(ks).is_some());
        assert!(tree.tau_index(head).is_none());
    }

    #[test]
    fn test_sibling_ranges_never_overlap() {
        let (d0, _, _) = three_body();
        let config = ConstraintConfiguration::default();
        let tree = DecayTree::new(&d0, &config).unwrap();
        let head = tree.head();
        let mut claimed = vec![false; tree.dim()];
        for id in std::iter::once(head).chain(tree.daughters(head).iter().copied()) {
            let node = &tree.nodes[id.0];
            for slot in node.offset..node.offset + node.dim {
                assert!(!claimed[slot], "slot {slot} claimed twice");
                claimed[slot] = true;
            }
        }
        assert!(claimed.iter().all(|c| *c), "layout left holes");
    }

    #[test]
    fn test_leaf_without_track_is_a_construction_error() {
        let trackless = Candidate {
            pdg: 211,
            mass: PION_MASS,
            charge: 1,
            decay_length: None,
            is_strong_resonance: false,
            daughters: Vec::new(),
            track: None,
            v0: None,
            vertex_hint: None,
        };
        let bad = Candidate::composite(421, 1.86484, 0, vec![trackless.clone(), trackless]);
        let config = ConstraintConfiguration::default();
        assert!(matches!(
            DecayTree::new(&bad, &config),
            Err(ArborError::Construction { .. })
        ));
    }

    #[test]
    fn test_three_body_seeding() {
        // after stage 1 the composite's vertex must sit at the POCA of the
        // two leading-pT daughters and its 4-momentum must be the exact sum
        // of the daughters'
        let (d0, vertex, _) = three_body();
        let config = ConstraintConfiguration::default();
        let tree = DecayTree::new(&d0, &config).unwrap();
        let mut fitparams = FitParams::new(tree.dim());
        let status = tree.init_motherless_particle(tree.head(), &mut fitparams);
        assert!(status.is_success());

        let head = tree.head();
        let pos = tree.pos_index(head).unwrap();
        // all three tracks emanate from the same point, so the POCA of any
        // two reproduces the generating vertex
        for row in 0..3 {
            assert_relative_eq!(fitparams.par(pos + row), vertex[row], epsilon = 1e-6);
        }

        let mom = tree.mom_index(head);
        let mut expected = [0.0; 4];
        for &did in tree.daughters(head) {
            let dmom = tree.mom_index(did);
            let mut e2 = tree.nodes[did.0].mass.powi(2);
            for row in 0..3 {
                let px = fitparams.par(dmom + row);
                expected[row] += px;
                e2 += px * px;
            }
            expected[3] += e2.sqrt();
        }
        for row in 0..4 {
            assert_relative_eq!(fitparams.par(mom + row), expected[row], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_kinematic_residual_vanishes_on_exact_sum() {
        let (d0, _, _) = three_body();
        let config = ConstraintConfiguration::default();
        let tree = DecayTree::new(&d0, &config).unwrap();
        let mut fitparams = FitParams::new(tree.dim());
        tree.init_motherless_particle(tree.head(), &mut fitparams);

        let mut projection = Projection::new(4, tree.dim());
        let status = tree.project_kine_constraint(tree.head(), &fitparams, &mut projection);
        assert!(status.is_success());
        for row in 0..4 {
            assert_relative_eq!(projection.r(row), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_v0_seeding_beats_poca() {
        let vertex = Vector3::new(0.5, 0.4, -0.2);
        let p1 = Vector3::new(0.8, 0.1, 0.2);
        let p2 = Vector3::new(-0.2, 0.7, -0.3);
        let v0_vertex = Vector3::new(0.5001, 0.4001, -0.2001);
        let ks = Candidate::composite(
            310,
            0.49761,
            0,
            vec![
                track_from(&vertex, &p1, 211, PION_MASS),
                track_from(&vertex, &p2, -211, PION_MASS),
            ],
        )
        .with_v0(V0Fit { vertex: v0_vertex });
        let config = ConstraintConfiguration::default();
        let tree = DecayTree::new(&ks, &config).unwrap();
        let mut fitparams = FitParams::new(tree.dim());
        tree.init_motherless_particle(tree.head(), &mut fitparams);
        let pos = tree.pos_index(tree.head()).unwrap();
        for row in 0..3 {
            assert_relative_eq!(fitparams.par(pos + row), v0_vertex[row], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_constraint_list_is_depth_ordered() {
        let vertex = Vector3::new(0.1, 0.0, 0.2);
        let p1 = Vector3::new(0.7, 0.1, 0.2);
        let p2 = Vector3::new(-0.1, 0.6, -0.2);
        let ks = Candidate::composite(
            310,
            0.49761,
            0,
            vec![
                track_from(&vertex, &p1, 211, PION_MASS),
                track_from(&vertex, &p2, -211, PION_MASS),
            ],
        );
        let b0 = Candidate::composite(
            511,
            5.27966,
            0,
            vec![ks, track_from(&vertex, &p1, 211, PION_MASS)],
        );
        let config = ConstraintConfiguration::default();
        let tree = DecayTree::new(&b0, &config).unwrap();
        let constraints = tree.constraints();
        let depths: Vec<i32> = constraints.iter().map(|c| c.depth).collect();
        let mut sorted = depths.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(depths, sorted, "constraints must come deepest first");
        // the K short owns a vertex below the B, so it gets a geometric
        // constraint; the B (head) does not
        assert!(constraints
            .iter()
            .any(|c| c.kind == ConstraintKind::Geometric));
        let head_geo = constraints
            .iter()
            .filter(|c| c.kind == ConstraintKind::Geometric && c.node == tree.head())
            .count();
        assert_eq!(head_geo, 0);
    }

    #[test]
    fn test_force_p4_sum_restores_balance() {
        let (d0, _, _) = three_body();
        let config = ConstraintConfiguration::default();
        let tree = DecayTree::new(&d0, &config).unwrap();
        let mut fitparams = FitParams::new(tree.dim());
        tree.init_motherless_particle(tree.head(), &mut fitparams);

        // knock the composite momentum off balance, then restore it
        let mom = tree.mom_index(tree.head());
        *fitparams.par_mut(mom) += 0.05;
        *fitparams.par_mut(mom + 3) -= 0.02;
        tree.force_p4_sum(tree.head(), &mut fitparams);

        let mut projection = Projection::new(4, tree.dim());
        tree.project_kine_constraint(tree.head(), &fitparams, &mut projection);
        for row in 0..4 {
            assert_relative_eq!(projection.r(row), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_mass_constraint_projection() {
        let (d0, _, _) = three_body();
        let mut config = ConstraintConfiguration::default();
        config.mass_constraint_pdg.insert(421);
        let tree = DecayTree::new(&d0, &config).unwrap();
        let mut fitparams = FitParams::new(tree.dim());
        tree.init_motherless_particle(tree.head(), &mut fitparams);

        let mut projection = Projection::new(1, tree.dim());
        tree.project_mass_constraint(tree.head(), &fitparams, &mut projection);
        let mom = tree.mom_index(tree.head());
        let (px, py, pz, e) = (
            fitparams.par(mom),
            fitparams.par(mom + 1),
            fitparams.par(mom + 2),
            fitparams.par(mom + 3),
        );
        let expected = e * e - px * px - py * py - pz * pz - 1.86484_f64.powi(2);
        assert_relative_eq!(projection.r(0), expected, epsilon = 1e-12);
        assert_relative_eq!(projection.h(0, mom + 3), 2.0 * e);
    }

    #[test]
    fn test_charged_composite_momentum_rotation() {
        // a charged composite flying tau cm turns its transverse momentum
        // by q*c*Bz*tau/|p|; the balance residual must encode the same
        // angle the helix propagation produces over that flight
        let d_vertex = Vector3::new(1.0, 0.4, 0.6);
        let dplus = Candidate::composite(
            411,
            1.86962,
            1,
            vec![
                track_from(&d_vertex, &Vector3::new(1.0, 0.3, 0.5), 211, PION_MASS),
                track_from(&d_vertex, &Vector3::new(0.9, -0.2, 0.6), 211, PION_MASS),
                track_from(&d_vertex, &Vector3::new(0.6, -0.1, 0.55), -321, KAON_MASS),
            ],
        );
        let b_vertex = Vector3::new(0.1, 0.05, 0.0);
        let bachelor = track_from(&b_vertex, &Vector3::new(-0.4, 0.3, 0.2), -211, PION_MASS);
        let b0 = Candidate::composite(511, 5.27966, 0, vec![dplus, bachelor]);

        let config = ConstraintConfiguration::default();
        let tree = DecayTree::new(&b0, &config).unwrap();
        let head = tree.head();
        let d = tree.find(411).unwrap();
        let pi = tree.find(-211).unwrap();

        // hand-assembled state: exact 4-momentum balance, so the residual
        // reduces to the rotation terms alone
        let p_d = Vector3::new(2.5, 0.0, 1.658312395);
        let p_pi = Vector3::new(-0.4, 0.3, 0.2);
        let tau = 1.0;
        let mut fitparams = FitParams::new(tree.dim());
        let dm = tree.mom_index(d);
        fitparams
            .par_slice_mut(dm, 3)
            .copy_from_slice(p_d.as_slice());
        *fitparams.par_mut(dm + 3) = (p_d.norm_squared() + 1.86962_f64.powi(2)).sqrt();
        *fitparams.par_mut(tree.tau_index(d).unwrap()) = tau;
        let bm = tree.mom_index(pi);
        fitparams
            .par_slice_mut(bm, 3)
            .copy_from_slice(p_pi.as_slice());
        let hm = tree.mom_index(head);
        for row in 0..3 {
            *fitparams.par_mut(hm + row) = fitparams.par(dm + row) + fitparams.par(bm + row);
        }
        *fitparams.par_mut(hm + 3) = fitparams.par(dm + 3)
            + (p_pi.norm_squared() + PION_MASS * PION_MASS).sqrt();

        let mut projection = Projection::new(4, tree.dim());
        tree.project_kine_constraint(head, &fitparams, &mut projection);

        // pz and E do not rotate
        assert_relative_eq!(projection.r(2), 0.0, epsilon = 1e-12);
        assert_relative_eq!(projection.r(3), 0.0, epsilon = 1e-12);

        let encoded = (-projection.r(1)).atan2(p_d.x - projection.r(0));
        let expected = C_LIGHT * BZ * tau / p_d.norm();
        assert_relative_eq!(encoded, expected, epsilon = 1e-12);

        // the same flight length on the helix itself
        let (helix, l0) = helix_from_vertex(&Vector3::zeros(), &p_d, 1, BZ);
        let arc = tau * p_d.x.hypot(p_d.y) / p_d.norm();
        let (_, rotated, _) = vertex_from_helix(&helix, l0 + arc, BZ);
        let turned = phidomain(rotated.y.atan2(rotated.x) - p_d.y.atan2(p_d.x));
        assert_relative_eq!(encoded, turned, epsilon = 1e-12);
    }

    #[test]
    fn test_lifetime_constraint_projection() {
        let vertex = Vector3::new(0.3, 0.1, 0.2);
        let ks = Candidate::composite(
            310,
            0.49761,
            0,
            vec![
                track_from(&vertex, &Vector3::new(0.5, 0.1, 0.2), 211, PION_MASS),
                track_from(&vertex, &Vector3::new(0.1, -0.4, 0.3), -211, PION_MASS),
            ],
        )
        .with_decay_length(2.0);
        let b0 = Candidate::composite(511, 5.27966, 0, vec![ks]);
        let config = ConstraintConfiguration::default();
        let tree = DecayTree::new(&b0, &config).unwrap();
        let ks_id = tree.find(310).unwrap();
        let tau_index = tree.tau_index(ks_id).unwrap();

        let mut fitparams = FitParams::new(tree.dim());
        *fitparams.par_mut(tau_index) = 1.7;
        let mut projection = Projection::new(1, tree.dim());
        let status = tree.project_lifetime_constraint(ks_id, &fitparams, &mut projection);
        assert!(status.is_success());
        assert_relative_eq!(projection.r(0), -0.3, epsilon = 1e-12);
        assert_relative_eq!(projection.h(0, tau_index), 1.0);
        assert_relative_eq!(projection.noise()[(0, 0)], 4.0);

        // and it gets scheduled exactly once
        let lifetimes = tree
            .constraints()
            .iter()
            .filter(|c| c.kind == ConstraintKind::Lifetime)
            .count();
        assert_eq!(lifetimes, 1);
    }

    #[test]
    fn test_degenerate_v0_vertex_is_flagged_not_fatal() {
        let vertex = Vector3::new(0.4, -0.2, 0.8);
        let p1 = Vector3::new(0.6, 0.15, 0.2);
        let p2 = Vector3::new(0.1, -0.5, 0.3);
        let ks = Candidate::composite(
            310,
            0.49761,
            0,
            vec![
                track_from(&vertex, &p1, 211, PION_MASS),
                track_from(&vertex, &p2, -211, PION_MASS),
            ],
        )
        .with_v0(V0Fit {
            vertex: Vector3::zeros(),
        });
        let config = ConstraintConfiguration::default();
        let tree = DecayTree::new(&ks, &config).unwrap();
        let mut fitparams = FitParams::new(tree.dim());
        let status = tree.init_motherless_particle(tree.head(), &mut fitparams);

        assert!(status.contains(ErrCode::MISSING_ASSOCIATION));
        assert!(!status.contains(ErrCode::BAD_SETUP));
        // seeding fell back to the poca of the two tracks
        let pos = tree.pos_index(tree.head()).unwrap();
        for row in 0..3 {
            assert_relative_eq!(fitparams.par(pos + row), vertex[row], epsilon = 1e-6);
        }
    }
}
