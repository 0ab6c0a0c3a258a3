use indexmap::IndexMap;
use log::debug;
use nalgebra::{DMatrix, Matrix3, Matrix4, Vector3, Vector4};

use crate::candidate::Candidate;
use crate::config::ConstraintConfiguration;
use crate::constraint::{Constraint, ConstraintKind};
use crate::fitparams::{ErrCode, FitParams, Projection};
use crate::tree::{DecayTree, NodeId};
use crate::{ArborError, ArborResult};

/// Default cap on outer linearization iterations.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;
/// Default convergence tolerance on the chi-square change per degree of
/// freedom between outer iterations.
pub const DEFAULT_CHI_SQUARE_TOLERANCE: f64 = 0.01;
/// Inner relinearization passes for the mass projection. Its residual is
/// quadratic in the momentum slots, so a single linearized gain step
/// overshoots; a short Newton loop against the pre-update covariance lands
/// on the constraint surface instead.
const MASS_RELINEARIZATIONS: usize = 5;
/// Residual magnitude (GeV^2) the relinearization loop treats as
/// on-surface.
const MASS_RESIDUAL_TOLERANCE: f64 = 1e-9;

/// How a fit ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FitStatus {
    /// The chi-square change between outer iterations fell below tolerance.
    Converged,
    /// The iteration cap was reached first; the returned state is the last
    /// filtered one and is usually still usable.
    MaxIterations,
}

/// Fitted quantities of one node, extracted from the global state.
#[derive(Clone, Debug)]
pub struct NodeResult {
    pub pdg: i32,
    /// Decay vertex; for nodes that share their mother's vertex this is the
    /// mother's.
    pub vertex: Vector3<f64>,
    pub vertex_covariance: Matrix3<f64>,
    /// 4-momentum as (px, py, pz, E).
    pub momentum: Vector4<f64>,
    pub momentum_covariance: Matrix4<f64>,
    /// Decay length and its variance, for nodes that own one.
    pub decay_length: Option<(f64, f64)>,
}

impl NodeResult {
    pub fn invariant_mass(&self) -> f64 {
        let p = &self.momentum;
        (p[3] * p[3] - p[0] * p[0] - p[1] * p[1] - p[2] * p[2])
            .max(0.0)
            .sqrt()
    }
}

/// The outcome of a converged (or capped) fit.
#[derive(Clone, Debug)]
pub struct FitResult {
    pub status: FitStatus,
    pub chi_squared: f64,
    pub ndf: usize,
    /// Outer iterations actually run.
    pub iterations: usize,
    nodes: IndexMap<NodeId, NodeResult>,
}

impl FitResult {
    pub fn node(&self, id: NodeId) -> &NodeResult {
        &self.nodes[&id]
    }

    /// First node (in tree order) with the given PDG code.
    pub fn find(&self, pdg: i32) -> Option<&NodeResult> {
        self.nodes.values().find(|n| n.pdg == pdg)
    }

    pub fn chi_squared_per_ndf(&self) -> f64 {
        self.chi_squared / self.ndf.max(1) as f64
    }
}

/// The fit driver: owns the tree, the global state and the constraint list,
/// and runs the progressive Kalman filter over them.
///
/// ```
/// # use arbor::{Candidate, ConstraintConfiguration, TreeFitter};
/// # fn doc(d0: Candidate) -> arbor::ArborResult<()> {
/// let config = ConstraintConfiguration::default();
/// let mut fitter = TreeFitter::new(&d0, &config)?;
/// let result = fitter.fit()?;
/// println!("vertex: {}", result.node(fitter.tree().head()).vertex);
/// # Ok(())
/// # }
/// ```
pub struct TreeFitter {
    tree: DecayTree,
    fitparams: FitParams,
    constraints: Vec<Constraint>,
    ndf: usize,
    max_iterations: usize,
    chi_square_tolerance: f64,
}

impl TreeFitter {
    /// Build the tree, lay out the state and collect the constraint list.
    ///
    /// Fails with [`ArborError::InsufficientConstraints`] when the
    /// constraints do not outnumber the unknowns.
    pub fn new(candidate: &Candidate, config: &ConstraintConfiguration) -> ArborResult<Self> {
        let tree = DecayTree::new(candidate, config)?;
        let constraints = tree.constraints();
        let rows: usize = constraints.iter().map(|c| c.dim).sum();
        if rows <= tree.dim() {
            return Err(ArborError::InsufficientConstraints);
        }
        let ndf = rows - tree.dim();
        let fitparams = FitParams::new(tree.dim());
        Ok(Self {
            tree,
            fitparams,
            constraints,
            ndf,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            chi_square_tolerance: DEFAULT_CHI_SQUARE_TOLERANCE,
        })
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_chi_square_tolerance(mut self, tolerance: f64) -> Self {
        self.chi_square_tolerance = tolerance;
        self
    }

    pub fn tree(&self) -> &DecayTree {
        &self.tree
    }

    /// The global state; mostly useful for inspection in tests.
    pub fn fitparams(&self) -> &FitParams {
        &self.fitparams
    }

    /// Run the fit: seed the state, then filter the full constraint list
    /// once per outer iteration with a freshly loosened covariance, until
    /// the chi-square stabilizes.
    pub fn fit(&mut self) -> ArborResult<FitResult> {
        let head = self.tree.head();
        let status = self
            .tree
            .init_motherless_particle(head, &mut self.fitparams);
        // a missing association downgrades the seed but the fit can still
        // run; only a setup failure is fatal
        if status.contains(ErrCode::BAD_SETUP) {
            return Err(ArborError::InsufficientConstraints);
        }
        if !self.fitparams.is_finite() {
            return Err(ArborError::NumericalFailure {
                kind: self.constraints[0].kind,
                iteration: 0,
            });
        }

        let seed = self.tree.covariance_seed();
        let mut previous_chi_squared = f64::MAX;
        let mut fit_status = FitStatus::MaxIterations;
        let mut iterations = 0;

        for iteration in 0..self.max_iterations {
            iterations = iteration + 1;
            // relinearize from scratch: keep the state, drop the covariance
            self.fitparams.reset_covariance(&seed);

            for index in 0..self.constraints.len() {
                let constraint = self.constraints[index];
                self.filter_constraint(&constraint, iteration)?;
            }

            let chi_squared = self.fitparams.chi_squared();
            let delta = (previous_chi_squared - chi_squared).abs();
            debug!(
                "iteration {iteration}: chi2 = {chi_squared:.6}, delta = {delta:.6}"
            );
            if delta < self.chi_square_tolerance * self.ndf.max(1) as f64 {
                fit_status = FitStatus::Converged;
                break;
            }
            previous_chi_squared = chi_squared;
        }

        // momentum sums drift once mass or beam constraints pull on them
        self.tree.force_p4_sum(head, &mut self.fitparams);

        Ok(self.extract(fit_status, iterations))
    }

    /// One Kalman filter step for one constraint.
    ///
    /// The covariance shrinks in Joseph form, which keeps it symmetric
    /// positive semi-definite through long chains of noiseless updates. The
    /// mass constraint additionally relinearizes its quadratic residual a
    /// few times about the moved state, with the gain anchored to the
    /// pre-update covariance, before the covariance is shrunk.
    fn filter_constraint(&mut self, constraint: &Constraint, iteration: usize) -> ArborResult<()> {
        let numerical_failure = || ArborError::NumericalFailure {
            kind: constraint.kind,
            iteration,
        };
        let dim = self.tree.dim();

        let mut projection = Projection::new(constraint.dim, dim);
        let status = self
            .tree
            .project_constraint(constraint, &self.fitparams, &mut projection);
        if status.is_failure() || !projection.is_finite() {
            return Err(numerical_failure());
        }

        let prior_state = self.fitparams.state().clone();
        let prior_cov = self.fitparams.cov().clone();

        let mut h = projection.jacobian().clone();
        let mut cov_h_t = &prior_cov * h.transpose();
        let residual_cov = &h * &cov_h_t + projection.noise();
        let residual_cov_inv = invert_spd(&residual_cov).ok_or_else(numerical_failure)?;
        let chi_squared =
            (projection.residual().transpose() * &residual_cov_inv * projection.residual())[(0, 0)];

        let mut gain = &cov_h_t * &residual_cov_inv;
        let filtered = &prior_state - &gain * projection.residual();
        self.fitparams.state_mut().copy_from(&filtered);

        if constraint.kind == ConstraintKind::Mass {
            for _ in 0..MASS_RELINEARIZATIONS {
                let mut relinearized = Projection::new(constraint.dim, dim);
                self.tree
                    .project_constraint(constraint, &self.fitparams, &mut relinearized);
                if !relinearized.is_finite() {
                    return Err(numerical_failure());
                }
                if relinearized.residual().amax() < MASS_RESIDUAL_TOLERANCE {
                    break;
                }
                h = relinearized.jacobian().clone();
                cov_h_t = &prior_cov * h.transpose();
                let residual_cov = &h * &cov_h_t + relinearized.noise();
                let residual_cov_inv = invert_spd(&residual_cov).ok_or_else(numerical_failure)?;
                gain = &cov_h_t * &residual_cov_inv;
                // the residual referred back to the pre-update state
                let referred =
                    relinearized.residual() + &h * (&prior_state - self.fitparams.state());
                let filtered = &prior_state - &gain * &referred;
                self.fitparams.state_mut().copy_from(&filtered);
            }
        }

        let identity = DMatrix::<f64>::identity(dim, dim);
        let shrink = &identity - &gain * &h;
        let updated_cov = &shrink * &prior_cov * shrink.transpose()
            + &gain * projection.noise() * gain.transpose();
        self.fitparams.cov_mut().copy_from(&updated_cov);
        self.fitparams.add_chi_squared(chi_squared, constraint.dim);

        if !self.fitparams.is_finite() {
            return Err(numerical_failure());
        }
        Ok(())
    }

    fn extract(&self, status: FitStatus, iterations: usize) -> FitResult {
        let mut nodes = IndexMap::new();
        let mut stack = vec![self.tree.head()];
        while let Some(id) = stack.pop() {
            for &did in self.tree.daughters(id).iter().rev() {
                stack.push(did);
            }
            nodes.insert(id, self.extract_node(id));
        }
        FitResult {
            status,
            chi_squared: self.fitparams.chi_squared(),
            ndf: self.ndf,
            iterations,
            nodes,
        }
    }

    fn extract_node(&self, id: NodeId) -> NodeResult {
        let fitparams = &self.fitparams;
        let tree = &self.tree;

        let mut vertex = Vector3::zeros();
        let mut vertex_covariance = Matrix3::zeros();
        if let Some(pos) = tree.pos_index(id) {
            for row in 0..3 {
                vertex[row] = fitparams.par(pos + row);
                for col in 0..3 {
                    vertex_covariance[(row, col)] = fitparams.cov_entry(pos + row, pos + col);
                }
            }
        }

        let mom = tree.mom_index(id);
        let (momentum, momentum_covariance) = if tree.has_energy(id) {
            let mut p4 = Vector4::zeros();
            let mut cov4 = Matrix4::zeros();
            for row in 0..4 {
                p4[row] = fitparams.par(mom + row);
                for col in 0..4 {
                    cov4[(row, col)] = fitparams.cov_entry(mom + row, mom + col);
                }
            }
            (p4, cov4)
        } else {
            // 3-momentum plus PDG mass; propagate to (p, E) with dE/dp = p/E
            let mass = tree.mass(id);
            let p3 = Vector3::from_iterator(fitparams.par_slice(mom, 3).iter().copied());
            let energy = (p3.norm_squared() + mass * mass).sqrt();
            let p4 = Vector4::new(p3[0], p3[1], p3[2], energy);
            let mut jac = Matrix4::zeros();
            let mut cov3 = Matrix3::zeros();
            for row in 0..3 {
                jac[(row, row)] = 1.0;
                jac[(3, row)] = p3[row] / energy;
                for col in 0..3 {
                    cov3[(row, col)] = fitparams.cov_entry(mom + row, mom + col);
                }
            }
            let mut padded = Matrix4::zeros();
            padded.fixed_view_mut::<3, 3>(0, 0).copy_from(&cov3);
            (p4, jac * padded * jac.transpose())
        };

        let decay_length = tree
            .tau_index(id)
            .map(|tau| (fitparams.par(tau), fitparams.cov_entry(tau, tau)));

        NodeResult {
            pdg: tree.pdg(id),
            vertex,
            vertex_covariance,
            momentum,
            momentum_covariance,
            decay_length,
        }
    }
}

/// Invert a symmetric positive-definite matrix, falling back to a general
/// LU decomposition when the Cholesky factorization fails on a residual
/// covariance that is only semi-definite.
fn invert_spd(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if let Some(cholesky) = matrix.clone().cholesky() {
        return Some(cholesky.inverse());
    }
    // a residual covariance with a non-positive diagonal has lost its
    // meaning; inverting it would blow the gain up instead of failing
    if matrix.diagonal().iter().any(|d| *d <= 0.0) {
        return None;
    }
    matrix.clone().try_inverse()
}
