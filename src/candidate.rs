use nalgebra::{Matrix5, Vector3};
use serde::{Deserialize, Serialize};

use crate::helix::Helix;

/// A reconstructed charged-track measurement attached to a final-state
/// candidate: perigee helix parameters plus their 5x5 covariance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackFit {
    pub helix: Helix,
    pub covariance: Matrix5<f64>,
}

/// A two-prong pre-fit vertex (for example from a displaced-decay finder)
/// used as a seeding shortcut for the composite that owns it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct V0Fit {
    pub vertex: Vector3<f64>,
}

/// A decay candidate handed to the fitter: the external input surface.
///
/// The caller supplies particle properties (PDG code, mass, charge, nominal
/// decay length) directly; the fitter carries no particle database.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Candidate {
    /// PDG code of this particle.
    pub pdg: i32,
    /// Nominal (PDG) mass in GeV.
    pub mass: f64,
    /// Electric charge in units of e.
    pub charge: i32,
    /// Nominal decay length in cm, used by the lifetime constraint.
    pub decay_length: Option<f64>,
    /// True for strongly-decaying resonances whose decay vertex is
    /// experimentally indistinguishable from their mother's; drives vertex
    /// sharing in automatic mode.
    pub is_strong_resonance: bool,
    /// Ordered daughter candidates; empty for final-state particles.
    pub daughters: Vec<Candidate>,
    /// Track measurement; required for charged final-state particles.
    pub track: Option<TrackFit>,
    /// Optional pre-fit vertex for this composite.
    pub v0: Option<V0Fit>,
    /// Optional previously-fitted vertex position, honored during seeding
    /// before any other strategy is tried.
    pub vertex_hint: Option<Vector3<f64>>,
}

impl Candidate {
    /// A final-state charged particle with an attached track fit.
    pub fn track(pdg: i32, mass: f64, charge: i32, track: TrackFit) -> Self {
        Self {
            pdg,
            mass,
            charge,
            decay_length: None,
            is_strong_resonance: false,
            daughters: Vec::new(),
            track: Some(track),
            v0: None,
            vertex_hint: None,
        }
    }

    /// A composite particle decaying into the given daughters.
    pub fn composite(pdg: i32, mass: f64, charge: i32, daughters: Vec<Candidate>) -> Self {
        Self {
            pdg,
            mass,
            charge,
            decay_length: None,
            is_strong_resonance: false,
            daughters,
            track: None,
            v0: None,
            vertex_hint: None,
        }
    }

    pub fn with_v0(mut self, v0: V0Fit) -> Self {
        self.v0 = Some(v0);
        self
    }

    pub fn with_decay_length(mut self, decay_length: f64) -> Self {
        self.decay_length = Some(decay_length);
        self
    }

    pub fn as_resonance(mut self) -> Self {
        self.is_strong_resonance = true;
        self
    }

    pub fn is_final_state(&self) -> bool {
        self.daughters.is_empty()
    }

    /// Number of charged final-state particles in this candidate's subtree.
    pub fn n_final_charged(&self) -> usize {
        if self.is_final_state() {
            usize::from(self.charge != 0)
        } else {
            self.daughters.iter().map(Candidate::n_final_charged).sum()
        }
    }
}
