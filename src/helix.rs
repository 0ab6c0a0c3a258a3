use nalgebra::{SMatrix, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Speed of light in the unit system of the fit (momenta in GeV, lengths in
/// cm, field in Tesla): `pt [GeV] = C_LIGHT * Bz [T] * radius [cm]`.
pub const C_LIGHT: f64 = 0.00299792458;

/// A charged-particle trajectory in a uniform magnetic field along z,
/// parameterized at the point of closest approach to the z-axis (the
/// perigee).
///
/// The five parameters follow the usual perigee convention:
/// - `d0`: signed transverse impact parameter; the perigee sits at
///   `(-d0 sin(phi0), d0 cos(phi0))`,
/// - `phi0`: azimuth of the transverse momentum at the perigee,
/// - `omega`: signed curvature, `omega = q * C_LIGHT * Bz / pt`. For
///   `Bz > 0` the sign of `omega` equals the sign of the charge; note that
///   some other experiments use the opposite convention,
/// - `z0`: z position of the perigee,
/// - `tan_lambda`: dip angle tangent, `pz / pt`.
///
/// A point on the trajectory is addressed by the 2D arc length `l` measured
/// from the perigee.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Helix {
    pub d0: f64,
    pub phi0: f64,
    pub omega: f64,
    pub z0: f64,
    pub tan_lambda: f64,
}

impl Helix {
    pub fn new(d0: f64, phi0: f64, omega: f64, z0: f64, tan_lambda: f64) -> Self {
        Self {
            d0,
            phi0,
            omega,
            z0,
            tan_lambda,
        }
    }

    /// Sign of the particle charge (assuming `Bz > 0`).
    pub fn charge_sign(&self) -> i32 {
        if self.omega >= 0.0 {
            1
        } else {
            -1
        }
    }

    /// Center of the circular projection in the xy plane.
    fn center(&self) -> (f64, f64) {
        let rho = self.d0 + 1.0 / self.omega;
        (-rho * self.phi0.sin(), rho * self.phi0.cos())
    }

    /// Track azimuth at a given xy point on the circle, from the angle of
    /// the point as seen from the circle center.
    fn phi_at_position_angle(&self, psi: f64) -> f64 {
        if self.omega > 0.0 {
            psi + PI / 2.0
        } else {
            psi - PI / 2.0
        }
    }

    /// z coordinate at 2D arc length `l`.
    fn z_at(&self, l: f64) -> f64 {
        self.z0 + self.tan_lambda * l
    }
}

/// Wrap an angle into the interval (-pi, pi].
pub fn phidomain(phi: f64) -> f64 {
    let mut rc = phi;
    while rc <= -PI {
        rc += 2.0 * PI;
    }
    while rc > PI {
        rc -= 2.0 * PI;
    }
    rc
}

/// Convert a helix plus a 2D flight length into a vertex position and
/// momentum. Returns `(position, momentum, charge)`.
pub fn vertex_from_helix(helix: &Helix, l: f64, bz: f64) -> (Vector3<f64>, Vector3<f64>, i32) {
    let charge = helix.charge_sign();
    let aq = charge as f64 * C_LIGHT * bz;
    let pt = aq / helix.omega;
    let chi = helix.omega * l;
    let phi = helix.phi0 + chi;

    let x = (phi.sin() - helix.phi0.sin()) / helix.omega - helix.d0 * helix.phi0.sin();
    let y = -(phi.cos() - helix.phi0.cos()) / helix.omega + helix.d0 * helix.phi0.cos();
    let z = helix.z_at(l);

    let position = Vector3::new(x, y, z);
    let momentum = Vector3::new(pt * phi.cos(), pt * phi.sin(), pt * helix.tan_lambda);
    (position, momentum, charge)
}

/// Convert a vertex position and momentum into helix parameters plus the 2D
/// flight length from the perigee to the vertex.
///
/// `charge` must be nonzero; neutral trajectories are not helices.
pub fn helix_from_vertex(
    position: &Vector3<f64>,
    momentum: &Vector3<f64>,
    charge: i32,
    bz: f64,
) -> (Helix, f64) {
    debug_assert!(charge != 0, "neutral particles have no helix");
    let aq = charge as f64 * C_LIGHT * bz;
    let px = momentum.x;
    let py = momentum.y;
    let pt = px.hypot(py);

    let omega = aq / pt;
    let tan_lambda = momentum.z / pt;

    // px + aq*y and py - aq*x are conserved along the trajectory; evaluated
    // at the perigee they give (pt + aq*d0) * (cos(phi0), sin(phi0)).
    let a = px + aq * position.y;
    let b = py - aq * position.x;
    let pt0 = a.hypot(b);
    let phi0 = b.atan2(a);
    let d0 = (pt0 - pt) / aq;

    let phi = py.atan2(px);
    let chi = phidomain(phi - phi0);
    let l = chi / omega;
    let z0 = position.z - tan_lambda * l;

    (Helix::new(d0, phi0, omega, z0, tan_lambda), l)
}

/// Like [`helix_from_vertex`], but additionally returns the 6x6 analytic
/// Jacobian of `(d0, phi0, omega, z0, tan_lambda, l)` with respect to
/// `(x, y, z, px, py, pz)`. Callers that only need the helix parameters
/// should use [`helix_from_vertex`] and skip the derivative work.
pub fn helix_from_vertex_jacobian(
    position: &Vector3<f64>,
    momentum: &Vector3<f64>,
    charge: i32,
    bz: f64,
) -> (Helix, f64, SMatrix<f64, 6, 6>) {
    let (helix, l) = helix_from_vertex(position, momentum, charge, bz);

    let aq = charge as f64 * C_LIGHT * bz;
    let px = momentum.x;
    let py = momentum.y;
    let pz = momentum.z;
    let pt = px.hypot(py);
    let pt2 = pt * pt;
    let pt3 = pt2 * pt;

    let a = px + aq * position.y;
    let b = py - aq * position.x;
    let pt02 = a * a + b * b;
    let pt0 = pt02.sqrt();

    let omega = helix.omega;
    let chi = omega * l;

    let mut jac = SMatrix::<f64, 6, 6>::zeros();

    // row 0: d0 = (pt0 - pt) / aq
    jac[(0, 0)] = -b / pt0;
    jac[(0, 1)] = a / pt0;
    jac[(0, 3)] = (a / pt0 - px / pt) / aq;
    jac[(0, 4)] = (b / pt0 - py / pt) / aq;

    // row 1: phi0 = atan2(b, a)
    jac[(1, 0)] = -aq * a / pt02;
    jac[(1, 1)] = -aq * b / pt02;
    jac[(1, 3)] = -b / pt02;
    jac[(1, 4)] = a / pt02;

    // row 2: omega = aq / pt
    jac[(2, 3)] = -aq * px / pt3;
    jac[(2, 4)] = -aq * py / pt3;

    // row 4: tan_lambda = pz / pt
    jac[(4, 3)] = -pz * px / pt3;
    jac[(4, 4)] = -pz * py / pt3;
    jac[(4, 5)] = 1.0 / pt;

    // row 5: l = (phi - phi0) / omega, with phi = atan2(py, px); the 2*pi
    // wrap offset is locally constant and drops out of the derivative.
    let dphi_dpx = -py / pt2;
    let dphi_dpy = px / pt2;
    jac[(5, 0)] = -jac[(1, 0)] / omega;
    jac[(5, 1)] = -jac[(1, 1)] / omega;
    jac[(5, 3)] = (dphi_dpx - jac[(1, 3)]) / omega - chi / (omega * omega) * jac[(2, 3)];
    jac[(5, 4)] = (dphi_dpy - jac[(1, 4)]) / omega - chi / (omega * omega) * jac[(2, 4)];

    // row 3: z0 = z - tan_lambda * l
    let tanl = helix.tan_lambda;
    for col in 0..6 {
        jac[(3, col)] = -l * jac[(4, col)] - tanl * jac[(5, col)];
    }
    jac[(3, 2)] += 1.0;

    (helix, l, jac)
}

/// Finite-difference step for [`helix_from_vertex_numerical`]. Inherited
/// constant; no particular optimality is claimed for it.
const NUMERIC_DELTA: f64 = 1e-5;

/// Numerical cross-check of [`helix_from_vertex_jacobian`]: the same
/// outputs, with the Jacobian computed by central differences.
pub fn helix_from_vertex_numerical(
    position: &Vector3<f64>,
    momentum: &Vector3<f64>,
    charge: i32,
    bz: f64,
) -> (Helix, f64, SMatrix<f64, 6, 6>) {
    let (helix, l) = helix_from_vertex(position, momentum, charge, bz);
    let mut jac = SMatrix::<f64, 6, 6>::zeros();

    let pack = |pos: &Vector3<f64>, mom: &Vector3<f64>| -> [f64; 6] {
        let (h, fl) = helix_from_vertex(pos, mom, charge, bz);
        [h.d0, h.phi0, h.omega, h.z0, h.tan_lambda, fl]
    };

    for col in 0..6 {
        let mut pos_up = *position;
        let mut mom_up = *momentum;
        let mut pos_dn = *position;
        let mut mom_dn = *momentum;
        if col < 3 {
            pos_up[col] += NUMERIC_DELTA;
            pos_dn[col] -= NUMERIC_DELTA;
        } else {
            mom_up[col - 3] += NUMERIC_DELTA;
            mom_dn[col - 3] -= NUMERIC_DELTA;
        }
        let up = pack(&pos_up, &mom_up);
        let dn = pack(&pos_dn, &mom_dn);
        for row in 0..6 {
            let mut diff = up[row] - dn[row];
            // phi0 can jump across the branch cut under a small variation
            if row == 1 {
                diff = phidomain(diff);
            }
            jac[(row, col)] = diff / (2.0 * NUMERIC_DELTA);
        }
    }

    (helix, l, jac)
}

/// Result of a point-of-closest-approach search between two helices.
#[derive(Copy, Clone, Debug)]
pub struct PocaResult {
    /// 2D flight length along the first helix
    pub flt1: f64,
    /// 2D flight length along the second helix
    pub flt2: f64,
    /// Midpoint between the two closest trajectory points
    pub point: Vector3<f64>,
    /// 3D distance of closest approach
    pub doca: f64,
}

/// Wrap counts scanned when resolving the z ambiguity of an xy solution.
/// Several turns of a low-pt helix can pass near the same xy point; this
/// bounded scan is a heuristic, not provably exhaustive for all topologies.
const Z_WRAP_RANGE: std::ops::RangeInclusive<i32> = -1..=3;

/// Arc length and z of the best wrap candidate for a helix passing through
/// the xy point at position angle `psi` around its circle center, judged
/// against a target z.
fn best_wrap(helix: &Helix, psi: f64, z_target: f64) -> (f64, f64) {
    let phi = helix.phi_at_position_angle(psi);
    let chi0 = phidomain(phi - helix.phi0);
    let mut best = (chi0 / helix.omega, helix.z_at(chi0 / helix.omega));
    for n in Z_WRAP_RANGE {
        let l = (chi0 + 2.0 * PI * n as f64) / helix.omega;
        let z = helix.z_at(l);
        if (z - z_target).abs() < (best.1 - z_target).abs() {
            best = (l, z);
        }
    }
    best
}

/// Closest xy candidates on the two circles, as position angles seen from
/// each center plus the xy points themselves.
fn xy_candidates(helix1: &Helix, helix2: &Helix, parallel: bool) -> Vec<([f64; 2], [f64; 2])> {
    let (cx1, cy1) = helix1.center();
    let (cx2, cy2) = helix2.center();
    let r1 = (1.0 / helix1.omega).abs();
    let r2 = (1.0 / helix2.omega).abs();

    let dx = cx2 - cx1;
    let dy = cy2 - cy1;
    let d = dx.hypot(dy);

    if d < 1e-9 {
        // concentric circles: any azimuth is as good as another, take the
        // perigee of the first helix as the reference point
        let psi = (helix1.d0 * helix1.phi0.cos() - cy1)
            .atan2(-helix1.d0 * helix1.phi0.sin() - cx1);
        let p1 = [cx1 + r1 * psi.cos(), cy1 + r1 * psi.sin()];
        let p2 = [cx2 + r2 * psi.cos(), cy2 + r2 * psi.sin()];
        return vec![(p1, p2)];
    }

    let phi_cc = dy.atan2(dx);
    let intersecting = r1 + r2 >= d && d + r1 >= r2 && d + r2 >= r1;

    if intersecting && !parallel {
        // two intersection points from the law of cosines on the chord
        // between the circle centers
        let cos_a = ((d * d + r1 * r1 - r2 * r2) / (2.0 * d * r1)).clamp(-1.0, 1.0);
        let alpha = cos_a.acos();
        [phi_cc + alpha, phi_cc - alpha]
            .into_iter()
            .map(|psi| {
                let p = [cx1 + r1 * psi.cos(), cy1 + r1 * psi.sin()];
                (p, p)
            })
            .collect()
    } else {
        // separated (or deliberately treated as parallel) circles: closest
        // points along the line connecting the centers
        let ux = dx / d;
        let uy = dy / d;
        let p1 = [cx1 + r1 * ux, cy1 + r1 * uy];
        let dx21 = p1[0] - cx2;
        let dy21 = p1[1] - cy2;
        let n2 = dx21.hypot(dy21).max(1e-12);
        let p2 = [cx2 + r2 * dx21 / n2, cy2 + r2 * dy21 / n2];
        vec![(p1, p2)]
    }
}

/// Point of closest approach between two helices.
///
/// The intersecting-circle case yields two xy solutions; for each, the z
/// ambiguity (several 2*pi turns mapping to the same xy point) is resolved
/// by a bounded wrap scan, and the solution minimizing `|z1 - z2|` wins.
/// With `parallel = true` (photon-conversion vertices) the two-solution
/// branch is skipped and the circles are treated as tangent.
pub fn helix_poca(helix1: &Helix, helix2: &Helix, parallel: bool) -> PocaResult {
    let (cx1, cy1) = helix1.center();
    let (cx2, cy2) = helix2.center();

    let mut best: Option<PocaResult> = None;
    for (p1, p2) in xy_candidates(helix1, helix2, parallel) {
        let psi1 = (p1[1] - cy1).atan2(p1[0] - cx1);
        let psi2 = (p2[1] - cy2).atan2(p2[0] - cx2);

        // resolve the wrap pair minimizing |z1 - z2|: scan helix1 wraps and
        // pick the best helix2 wrap for each
        let mut cand: Option<(f64, f64, f64, f64)> = None;
        let phi1 = helix1.phi_at_position_angle(psi1);
        let chi1 = phidomain(phi1 - helix1.phi0);
        for n in Z_WRAP_RANGE {
            let l1 = (chi1 + 2.0 * PI * n as f64) / helix1.omega;
            let z1 = helix1.z_at(l1);
            let (l2, z2) = best_wrap(helix2, psi2, z1);
            let better = match cand {
                Some((_, bz1, _, bz2)) => (z1 - z2).abs() < (bz1 - bz2).abs(),
                None => true,
            };
            if better {
                cand = Some((l1, z1, l2, z2));
            }
        }
        let (l1, z1, l2, z2) = cand.expect("wrap scan always yields a candidate");

        let pnt1 = Vector3::new(p1[0], p1[1], z1);
        let pnt2 = Vector3::new(p2[0], p2[1], z2);
        let result = PocaResult {
            flt1: l1,
            flt2: l2,
            point: 0.5 * (pnt1 + pnt2),
            doca: (pnt1 - pnt2).norm(),
        };
        // both xy solutions coincide in the transverse plane within each
        // candidate, so the smaller doca is also the smaller |z1 - z2|
        if best.map_or(true, |b| result.doca < b.doca) {
            best = Some(result);
        }
    }
    best.expect("at least one xy candidate exists")
}

/// Point of closest approach of a helix to a fixed point. Returns the 2D
/// flight length and the 3D distance.
pub fn helix_poca_point(helix: &Helix, point: &Vector3<f64>) -> (f64, f64) {
    let (cx, cy) = helix.center();
    let r = (1.0 / helix.omega).abs();
    let dx = point.x - cx;
    let dy = point.y - cy;
    let psi = dy.atan2(dx);
    let on_circle = Vector3::new(cx + r * psi.cos(), cy + r * psi.sin(), 0.0);

    let (l, z) = best_wrap(helix, psi, point.z);
    let trk = Vector3::new(on_circle.x, on_circle.y, z);
    (l, (trk - point).norm())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const BZ: f64 = 1.5;

    fn random_state(rng: &mut fastrand::Rng) -> (Vector3<f64>, Vector3<f64>, i32) {
        let position = Vector3::new(
            rng.f64() - 0.5,
            rng.f64() - 0.5,
            2.0 * (rng.f64() - 0.5),
        );
        let momentum = Vector3::new(
            0.3 + rng.f64(),
            0.3 + rng.f64(),
            2.0 * (rng.f64() - 0.5),
        );
        let charge = if rng.bool() { 1 } else { -1 };
        (position, momentum, charge)
    }

    #[test]
    fn test_vertex_helix_round_trip() {
        let mut rng = fastrand::Rng::with_seed(20240815);
        for _ in 0..100 {
            let (position, momentum, charge) = random_state(&mut rng);
            let (helix, l) = helix_from_vertex(&position, &momentum, charge, BZ);
            let (pos2, mom2, charge2) = vertex_from_helix(&helix, l, BZ);
            assert_eq!(charge, charge2);
            for i in 0..3 {
                assert_relative_eq!(position[i], pos2[i], epsilon = 1e-9, max_relative = 1e-9);
                assert_relative_eq!(momentum[i], mom2[i], epsilon = 1e-9, max_relative = 1e-9);
            }
        }
    }

    #[test]
    fn test_analytic_jacobian_matches_numerical() {
        let mut rng = fastrand::Rng::with_seed(777);
        for _ in 0..50 {
            let (position, momentum, charge) = random_state(&mut rng);
            let (h_a, l_a, jac_a) = helix_from_vertex_jacobian(&position, &momentum, charge, BZ);
            let (h_n, l_n, jac_n) = helix_from_vertex_numerical(&position, &momentum, charge, BZ);
            assert_relative_eq!(h_a.d0, h_n.d0);
            assert_relative_eq!(l_a, l_n);
            for row in 0..6 {
                for col in 0..6 {
                    assert_relative_eq!(jac_a[(row, col)], jac_n[(row, col)], epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn test_charge_sign_convention() {
        let position = Vector3::new(0.1, -0.2, 0.3);
        let momentum = Vector3::new(0.8, 0.5, 0.4);
        let (plus, _) = helix_from_vertex(&position, &momentum, 1, BZ);
        let (minus, _) = helix_from_vertex(&position, &momentum, -1, BZ);
        assert!(plus.omega > 0.0);
        assert!(minus.omega < 0.0);
        assert_eq!(plus.charge_sign(), 1);
        assert_eq!(minus.charge_sign(), -1);
    }

    #[test]
    fn test_poca_identical_helices() {
        let position = Vector3::new(0.2, 0.1, -0.3);
        let momentum = Vector3::new(0.6, -0.9, 0.2);
        let (helix, _) = helix_from_vertex(&position, &momentum, 1, BZ);
        let poca = helix_poca(&helix, &helix, false);
        assert!(poca.doca.abs() < 1e-9, "doca = {}", poca.doca);
    }

    #[test]
    fn test_poca_symmetry() {
        let vtx = Vector3::new(0.4, -0.1, 0.25);
        let (h1, _) = helix_from_vertex(&vtx, &Vector3::new(0.9, 0.3, 0.1), 1, BZ);
        let (h2, _) = helix_from_vertex(&vtx, &Vector3::new(-0.4, 0.8, -0.3), -1, BZ);
        let fwd = helix_poca(&h1, &h2, false);
        let rev = helix_poca(&h2, &h1, false);
        assert_relative_eq!(fwd.doca, rev.doca, epsilon = 1e-9);
        assert_relative_eq!(fwd.flt1, rev.flt2, epsilon = 1e-9);
        assert_relative_eq!(fwd.flt2, rev.flt1, epsilon = 1e-9);
        for i in 0..3 {
            assert_relative_eq!(fwd.point[i], rev.point[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn test_poca_finds_common_vertex() {
        // two tracks built to emanate from the same space point must have a
        // POCA at that point with zero distance
        let vtx = Vector3::new(0.3, 0.2, -0.4);
        let (h1, _) = helix_from_vertex(&vtx, &Vector3::new(1.1, 0.2, 0.3), 1, BZ);
        let (h2, _) = helix_from_vertex(&vtx, &Vector3::new(-0.3, 1.0, -0.2), -1, BZ);
        let poca = helix_poca(&h1, &h2, false);
        assert!(poca.doca < 1e-6, "doca = {}", poca.doca);
        for i in 0..3 {
            assert_relative_eq!(poca.point[i], vtx[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_poca_point_on_trajectory() {
        let vtx = Vector3::new(-0.2, 0.5, 0.1);
        let momentum = Vector3::new(0.7, 0.4, -0.6);
        let (helix, l_vtx) = helix_from_vertex(&vtx, &momentum, -1, BZ);
        let (l, doca) = helix_poca_point(&helix, &vtx);
        assert!(doca < 1e-9, "doca = {doca}");
        assert_relative_eq!(l, l_vtx, epsilon = 1e-9);
    }

    #[test]
    fn test_phidomain() {
        for k in -20..=20 {
            let x = 0.37 * k as f64;
            let wrapped = phidomain(x);
            assert!(wrapped > -PI && wrapped <= PI, "{x} -> {wrapped}");
            assert_relative_eq!(phidomain(wrapped), wrapped);
            let turns = (x - wrapped) / (2.0 * PI);
            assert_relative_eq!(turns, turns.round(), epsilon = 1e-12);
        }
        assert_relative_eq!(phidomain(PI), PI);
        assert_relative_eq!(phidomain(-PI), PI);
    }
}
