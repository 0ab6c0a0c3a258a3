use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut};
use std::ops::{BitOr, BitOrAssign};

/// Accumulating status carried through the initialization and projection
/// recursion: sub-call statuses are OR-ed together, so a composite
/// operation's failure state is the union of its children's. Success is the
/// identity element. This never crosses the public fit boundary; the driver
/// turns terminal failures into [`ArborError`](crate::ArborError).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrCode(u32);

impl ErrCode {
    pub const SUCCESS: ErrCode = ErrCode(0);
    /// The tree carries too few geometric handles to seed a vertex.
    pub const BAD_SETUP: ErrCode = ErrCode(1);
    /// A projection or conversion went numerically sour.
    pub const DIVERGING: ErrCode = ErrCode(2);
    /// An association lookup (V0, track fit result) came up empty.
    pub const MISSING_ASSOCIATION: ErrCode = ErrCode(4);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    pub fn is_failure(&self) -> bool {
        self.0 != 0
    }

    pub fn contains(&self, other: ErrCode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ErrCode {
    type Output = ErrCode;
    fn bitor(self, rhs: ErrCode) -> ErrCode {
        ErrCode(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrCode {
    fn bitor_assign(&mut self, rhs: ErrCode) {
        self.0 |= rhs.0;
    }
}

/// The global fit state: one growable vector of unknowns segmented by node,
/// plus the matching covariance matrix.
///
/// Nodes address their slots through `(index, length)` handles assigned at
/// tree construction; no pointers into the buffer exist anywhere. Handles
/// are trusted in release builds and bounds-checked in debug builds.
#[derive(Clone, Debug)]
pub struct FitParams {
    par: DVector<f64>,
    cov: DMatrix<f64>,
    chi_squared: f64,
    ndf: usize,
}

impl FitParams {
    /// Create a zeroed state of the given dimension.
    pub fn new(dim: usize) -> Self {
        Self {
            par: DVector::zeros(dim),
            cov: DMatrix::zeros(dim, dim),
            chi_squared: 0.0,
            ndf: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.par.len()
    }

    pub fn par(&self, index: usize) -> f64 {
        self.par[index]
    }

    pub fn par_mut(&mut self, index: usize) -> &mut f64 {
        &mut self.par[index]
    }

    /// Read-only slice of `len` state entries starting at `index`.
    pub fn par_slice(&self, index: usize, len: usize) -> DVectorView<'_, f64> {
        debug_assert!(index + len <= self.par.len());
        self.par.rows(index, len)
    }

    /// Mutable slice of `len` state entries starting at `index`.
    pub fn par_slice_mut(&mut self, index: usize, len: usize) -> DVectorViewMut<'_, f64> {
        debug_assert!(index + len <= self.par.len());
        self.par.rows_mut(index, len)
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.par
    }

    pub fn state_mut(&mut self) -> &mut DVector<f64> {
        &mut self.par
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    pub fn cov_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.cov
    }

    pub fn cov_entry(&self, row: usize, col: usize) -> f64 {
        self.cov[(row, col)]
    }

    pub fn set_cov_entry(&mut self, row: usize, col: usize, value: f64) {
        self.cov[(row, col)] = value;
    }

    /// Reset the covariance to a scaled diagonal seed, wiping correlations.
    pub fn reset_covariance(&mut self, diagonal: &DVector<f64>) {
        debug_assert_eq!(diagonal.len(), self.dim());
        self.cov.fill(0.0);
        for (i, v) in diagonal.iter().enumerate() {
            self.cov[(i, i)] = *v;
        }
        self.chi_squared = 0.0;
        self.ndf = 0;
    }

    pub fn chi_squared(&self) -> f64 {
        self.chi_squared
    }

    pub fn ndf(&self) -> usize {
        self.ndf
    }

    pub fn add_chi_squared(&mut self, chi_squared: f64, ndf: usize) {
        self.chi_squared += chi_squared;
        self.ndf += ndf;
    }

    /// True if every state and covariance entry is finite.
    pub fn is_finite(&self) -> bool {
        self.par.iter().all(|x| x.is_finite()) && self.cov.iter().all(|x| x.is_finite())
    }
}

/// One linearized constraint against the global state: a residual vector, a
/// dense Jacobian block (rows = constraint dimension, columns = full state
/// dimension) and a measurement covariance block. A fresh instance is
/// created each time a constraint is linearized and discarded after the
/// state update.
#[derive(Clone, Debug)]
pub struct Projection {
    residual: DVector<f64>,
    h: DMatrix<f64>,
    v: DMatrix<f64>,
}

impl Projection {
    pub fn new(constraint_dim: usize, state_dim: usize) -> Self {
        Self {
            residual: DVector::zeros(constraint_dim),
            h: DMatrix::zeros(constraint_dim, state_dim),
            v: DMatrix::zeros(constraint_dim, constraint_dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.residual.len()
    }

    pub fn r(&self, row: usize) -> f64 {
        self.residual[row]
    }

    pub fn r_mut(&mut self, row: usize) -> &mut f64 {
        &mut self.residual[row]
    }

    pub fn residual(&self) -> &DVector<f64> {
        &self.residual
    }

    pub fn h(&self, row: usize, col: usize) -> f64 {
        self.h[(row, col)]
    }

    pub fn h_mut(&mut self, row: usize, col: usize) -> &mut f64 {
        &mut self.h[(row, col)]
    }

    pub fn jacobian(&self) -> &DMatrix<f64> {
        &self.h
    }

    pub fn v_mut(&mut self, row: usize, col: usize) -> &mut f64 {
        &mut self.v[(row, col)]
    }

    pub fn noise(&self) -> &DMatrix<f64> {
        &self.v
    }

    /// True if every residual, Jacobian and noise entry is finite.
    pub fn is_finite(&self) -> bool {
        self.residual.iter().all(|x| x.is_finite())
            && self.h.iter().all(|x| x.is_finite())
            && self.v.iter().all(|x| x.is_finite())
    }
}
