//! Grassmann manifold primitives.
//!
//! Points of Gr(r, n) are n×r matrices with orthonormal columns. Everything
//! here is invariant under a change of basis Y → YQ with Q orthogonal, except
//! where a tangent vector is returned: tangent vectors live at a specific base
//! representative.

use std::cmp::Ordering;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::{Error, Result};

/// Smallest singular value of XᵀY accepted by the log map.
pub const SINGULAR_TOL: f64 = 1e-12;

const ORTHONORMAL_RTOL: f64 = 1e-5;
const ORTHONORMAL_ATOL: f64 = 1e-8;

// =============================================================================
// Decomposition helpers
// =============================================================================

/// Fail with [`Error::NonFinite`] if `m` holds a NaN or an infinity.
pub(crate) fn ensure_finite(m: &DMatrix<f64>, what: &'static str) -> Result<()> {
    if m.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(Error::NonFinite(what))
    }
}

/// Thin SVD `m = U diag(s) Vᵀ` with singular values in descending order.
///
/// Returns `(U, s, V)`, not `Vᵀ`.
pub(crate) fn thin_svd(m: &DMatrix<f64>) -> Result<(DMatrix<f64>, DVector<f64>, DMatrix<f64>)> {
    ensure_finite(m, "svd input")?;
    let svd = m.clone().svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(Error::NonFinite("svd factors")),
    };
    let s = svd.singular_values;

    let mut order: Vec<usize> = (0..s.len()).collect();
    order.sort_by(|&a, &b| s[b].partial_cmp(&s[a]).unwrap_or(Ordering::Equal));

    let u_sorted = DMatrix::from_fn(u.nrows(), order.len(), |i, j| u[(i, order[j])]);
    let v_sorted = DMatrix::from_fn(v_t.ncols(), order.len(), |i, j| v_t[(order[j], i)]);
    let s_sorted = DVector::from_iterator(order.len(), order.iter().map(|&j| s[j]));
    Ok((u_sorted, s_sorted, v_sorted))
}

// =============================================================================
// Orthonormality
// =============================================================================

/// Whether `YᵀY` is the identity, with `allclose`-style tolerances.
pub fn is_orthonormal(y: &DMatrix<f64>) -> bool {
    let gram = y.transpose() * y;
    gram.iter().enumerate().all(|(idx, &g)| {
        let (i, j) = (idx % gram.nrows(), idx / gram.nrows());
        let target = if i == j { 1.0 } else { 0.0 };
        (g - target).abs() <= ORTHONORMAL_ATOL + ORTHONORMAL_RTOL * target
    })
}

/// Project a full-column-rank basis back onto the Grassmannian via thin QR.
pub fn orthonormalize(y: &DMatrix<f64>) -> DMatrix<f64> {
    let r = y.ncols().min(y.nrows());
    y.clone().qr().q().columns(0, r).into_owned()
}

/// Random point of Gr(r, n): uniform entries in [-0.5, 0.5), orthonormalized.
pub fn random_point<R: Rng + ?Sized>(n: usize, r: usize, rng: &mut R) -> Result<DMatrix<f64>> {
    if r == 0 || r > n {
        return Err(Error::InvalidParameter(format!(
            "subspace dimension {r} must be in 1..={n}"
        )));
    }
    let uniform = Uniform::new(-0.5, 0.5);
    let raw = DMatrix::from_fn(n, r, |_, _| uniform.sample(rng));
    Ok(orthonormalize(&raw))
}

// =============================================================================
// Log / Exp
// =============================================================================

/// Logarithm map: the tangent vector at `x` pointing to `y`.
///
/// Computes `(I - XXᵀ) Y (XᵀY)⁻¹ = U S Vᵀ` and returns `U arctan(S) Vᵀ`.
///
/// # Errors
///
/// - [`Error::DimensionMismatch`] unless `x` and `y` have the same shape.
/// - [`Error::SingularConfiguration`] when XᵀY is (numerically) singular,
///   i.e. some principal angle between `x` and `y` is π/2.
///
/// # Example
///
/// ```rust
/// use flagirls::{exp_map, log_map};
/// use nalgebra::DMatrix;
///
/// let x = DMatrix::from_column_slice(2, 1, &[1.0, 0.0]);
/// let y = DMatrix::from_column_slice(2, 1, &[0.6, 0.8]);
///
/// let t = log_map(&x, &y).unwrap();
/// // The tangent length is the angle between the lines.
/// assert!((t.norm() - 0.8f64.atan2(0.6)).abs() < 1e-12);
///
/// let back = exp_map(&x, &t).unwrap();
/// assert!((back[(1, 0)].abs() - 0.8).abs() < 1e-12);
/// ```
pub fn log_map(x: &DMatrix<f64>, y: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if x.nrows() != y.nrows() {
        return Err(Error::DimensionMismatch(x.nrows(), y.nrows()));
    }
    if x.ncols() != y.ncols() {
        return Err(Error::DimensionMismatch(x.ncols(), y.ncols()));
    }

    let xty = x.transpose() * y;
    ensure_finite(&xty, "log map")?;
    let smallest = xty.singular_values().min();
    if smallest < SINGULAR_TOL {
        return Err(Error::SingularConfiguration);
    }
    let inv = xty.clone().try_inverse().ok_or(Error::SingularConfiguration)?;

    let residual = (y - x * &xty) * inv;
    ensure_finite(&residual, "log map")?;

    let (u, s, v) = thin_svd(&residual)?;
    let theta = s.map(f64::atan);
    let tangent = u * DMatrix::from_diagonal(&theta) * v.transpose();
    ensure_finite(&tangent, "log map")?;
    Ok(tangent)
}

/// Exponential map: follow the geodesic from `x` in direction `tangent`.
///
/// With `tangent = U S Vᵀ`, returns `X V cos(S) + U sin(S)`, a basis of the
/// endpoint (rotated by V relative to the textbook formula, which spans the
/// same subspace).
pub fn exp_map(x: &DMatrix<f64>, tangent: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if x.nrows() != tangent.nrows() {
        return Err(Error::DimensionMismatch(x.nrows(), tangent.nrows()));
    }
    if x.ncols() != tangent.ncols() {
        return Err(Error::DimensionMismatch(x.ncols(), tangent.ncols()));
    }

    let (u, s, v) = thin_svd(tangent)?;
    let cos = DMatrix::from_diagonal(&s.map(f64::cos));
    let sin = DMatrix::from_diagonal(&s.map(f64::sin));
    let y = x * v * cos + u * sin;
    ensure_finite(&y, "exp map")?;
    Ok(y)
}

/// Step from `y` along `tangent` and restore orthonormal columns if the
/// result drifted.
pub(crate) fn retract(y: &DMatrix<f64>, tangent: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let next = exp_map(y, tangent)?;
    Ok(if is_orthonormal(&next) {
        next
    } else {
        orthonormalize(&next)
    })
}

// =============================================================================
// Distances
// =============================================================================

/// Principal angles between span(x) and span(y), ascending.
///
/// There are min(kₓ, k_y) of them; singular values of XᵀY are clipped to
/// [-1, 1] before the arccosine.
pub fn principal_angles(x: &DMatrix<f64>, y: &DMatrix<f64>) -> Result<Vec<f64>> {
    if x.nrows() != y.nrows() {
        return Err(Error::DimensionMismatch(x.nrows(), y.nrows()));
    }
    let product = x.transpose() * y;
    ensure_finite(&product, "principal angles")?;

    let mut angles: Vec<f64> = product
        .singular_values()
        .iter()
        .map(|&s| s.clamp(-1.0, 1.0).acos())
        .collect();
    angles.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    Ok(angles)
}

/// Geodesic distance ‖θ‖₂ between two subspaces.
///
/// Lines use the scalar form `arccos(sqrt(clamp((xᵀy)², 0, 1)))`.
///
/// # Example
///
/// ```rust
/// use flagirls::distance;
/// use nalgebra::DMatrix;
///
/// let x = DMatrix::from_column_slice(2, 1, &[1.0, 0.0]);
/// let y = DMatrix::from_column_slice(2, 1, &[0.0, 1.0]);
/// let d = distance(&x, &y).unwrap();
/// assert!((d - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
/// ```
pub fn distance(x: &DMatrix<f64>, y: &DMatrix<f64>) -> Result<f64> {
    if x.nrows() != y.nrows() {
        return Err(Error::DimensionMismatch(x.nrows(), y.nrows()));
    }
    if x.ncols() == 1 && y.ncols() == 1 {
        let cos = x.dot(y);
        if !cos.is_finite() {
            return Err(Error::NonFinite("distance"));
        }
        return Ok((cos * cos).clamp(0.0, 1.0).sqrt().acos());
    }

    let angles = principal_angles(x, y)?;
    Ok(angles.iter().map(|a| a * a).sum::<f64>().sqrt())
}
