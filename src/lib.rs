//! # arbor
//!
//! `arbor` fits a particle decay tree with a progressive Kalman filter: every
//! node of the tree contributes unknowns (vertex position, momentum, decay
//! length) to one global state vector, and contributes algebraic constraints
//! (track measurements, 4-momentum balance, vertex geometry, mass, beam,
//! lifetime) that are linearized and filtered until the fit converges.
//!
//! The crate is a library with no I/O surface: the caller hands over a
//! [`Candidate`] describing the decay (PDG codes, daughters, helix fit
//! results for charged tracks) and a [`ConstraintConfiguration`], and reads
//! vertices, momenta and covariances back from the [`FitResult`].
//!
//! Units throughout: momenta and energies in GeV, lengths in cm, magnetic
//! field in Tesla.
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use thiserror::Error;

/// Decay-candidate input types: the external surface of the fitter.
pub mod candidate;
/// The tree-wide constraint configuration shared by every node.
pub mod config;
/// Constraint descriptors and their ordering.
pub mod constraint;
/// The fit driver: progressive Kalman filtering over the constraint list.
pub mod fit;
/// The global state vector, covariance and per-constraint projections.
pub mod fitparams;
/// Helix geometry: track/vertex conversions, Jacobians and POCA solvers.
pub mod helix;
/// The decay tree: node layout, initialization and constraint projections.
pub mod tree;

pub use crate::candidate::{Candidate, TrackFit, V0Fit};
pub use crate::config::ConstraintConfiguration;
pub use crate::constraint::{Constraint, ConstraintKind};
pub use crate::fit::{FitResult, FitStatus, NodeResult, TreeFitter};
pub use crate::fitparams::{ErrCode, FitParams, Projection};
pub use crate::helix::Helix;
pub use crate::tree::{DecayTree, NodeId};

pub type ArborResult<T> = Result<T, ArborError>;

/// The error type used by all `arbor` methods.
///
/// Errors abort at most the current candidate's fit; a failed candidate never
/// takes the process down with it.
#[derive(Error, Debug, Clone)]
pub enum ArborError {
    /// A malformed candidate was passed to the tree builder (for example a
    /// final-state particle without an associated track fit).
    #[error("Cannot build a decay tree: {reason}")]
    Construction {
        /// What was wrong with the candidate
        reason: String,
    },
    /// A NaN or infinity showed up in a residual, Jacobian or covariance
    /// during the fit of this candidate.
    #[error("Numerical failure while filtering a {kind} constraint at iteration {iteration}")]
    NumericalFailure {
        /// The constraint kind whose projection went non-finite
        kind: ConstraintKind,
        /// The outer fit iteration in which it happened
        iteration: usize,
    },
    /// The decay tree carries too few geometric handles to fit (no tracks,
    /// no pre-fit vertices, no beam constraint).
    #[error("Insufficient geometric constraints to fit this decay tree")]
    InsufficientConstraints,
    /// A custom fallback error for conditions too infrequent to warrant
    /// their own category.
    #[error("{0}")]
    Custom(String),
}
