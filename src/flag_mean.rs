//! Flag mean: the closed-form center of a collection of subspaces.
//!
//! Stacking the bases into X = [x₁ | x₂ | …] and taking the r leading left
//! singular vectors of X minimizes Σ sin²θ over the data. This is the only
//! closed-form center in the crate and the inner step of FlagIRLS.

use std::borrow::Borrow;

use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, Uniform};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::manifold::{ensure_finite, orthonormalize, thin_svd};
use crate::{ambient_dim, Error, Result};

/// Relative change below which a PLS direction counts as converged.
const PLS_TOL: f64 = 1e-9;

/// Engine used to solve the (weighted) flag-mean problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum FlagMeanMethod {
    /// Exact thin SVD of the stacked bases.
    #[default]
    Svd,
    /// Experimental alternating partial least squares, one direction at a time.
    Pls { max_iters: usize },
}

/// Horizontally concatenate the bases into one n×Σkᵢ matrix.
pub fn stack<D: Borrow<DMatrix<f64>>>(data: &[D]) -> Result<DMatrix<f64>> {
    let n = ambient_dim(data)?;
    let total: usize = data.iter().map(|x| x.borrow().ncols()).sum();

    let mut big = DMatrix::zeros(n, total);
    let mut offset = 0;
    for x in data {
        let x: &DMatrix<f64> = x.borrow();
        big.columns_mut(offset, x.ncols()).copy_from(x);
        offset += x.ncols();
    }
    Ok(big)
}

fn check_rank(big: &DMatrix<f64>, r: usize) -> Result<()> {
    let available = big.nrows().min(big.ncols());
    if r == 0 || r > available {
        return Err(Error::RankDeficient { rank: r, available });
    }
    Ok(())
}

/// Flag mean of rank `r`.
///
/// # Errors
///
/// - [`Error::EmptyInput`] / [`Error::DimensionMismatch`] for malformed data.
/// - [`Error::RankDeficient`] unless 1 ≤ r ≤ min(n, Σkᵢ).
///
/// # Example
///
/// ```rust
/// use flagirls::flag_mean;
/// use nalgebra::DMatrix;
///
/// let s = std::f64::consts::FRAC_1_SQRT_2;
/// let data = vec![
///     DMatrix::from_column_slice(2, 1, &[1.0, 0.0]),
///     DMatrix::from_column_slice(2, 1, &[s, s]),
/// ];
///
/// let mean = flag_mean(&data, 1).unwrap();
/// // The bisector of 0 and π/4.
/// let angle = mean[(1, 0)].atan2(mean[(0, 0)]).rem_euclid(std::f64::consts::PI);
/// assert!((angle - std::f64::consts::PI / 8.0).abs() < 1e-10);
/// ```
pub fn flag_mean<D: Borrow<DMatrix<f64>>>(data: &[D], r: usize) -> Result<DMatrix<f64>> {
    let big = stack(data)?;
    check_rank(&big, r)?;

    let (u, s, _) = thin_svd(&big)?;
    trace!(
        "flag mean: n={}, columns={}, leading singular values {:?}",
        big.nrows(),
        big.ncols(),
        s.iter().take(r).collect::<Vec<_>>()
    );
    Ok(u.columns(0, r).into_owned())
}

/// Flag mean by alternating partial least squares (NIPALS) with deflation.
///
/// Each direction starts from a random vector and alternates
/// v = Xᵀu / ‖Xᵀu‖, u = Xv until u stabilizes, then its rank-one component is
/// removed from X. Converges to the same subspace as [`flag_mean`] when the
/// leading singular values are well separated, but gives no guarantee
/// otherwise; prefer the SVD path.
pub fn flag_mean_pls<R: Rng + ?Sized>(
    data: &[DMatrix<f64>],
    r: usize,
    max_iters: usize,
    rng: &mut R,
) -> Result<DMatrix<f64>> {
    let mut big = stack(data)?;
    check_rank(&big, r)?;
    ensure_finite(&big, "pls input")?;

    let n = big.nrows();
    let uniform = Uniform::new(-0.5, 0.5);
    let mut mean = DMatrix::zeros(n, r);

    for j in 0..r {
        let mut u = DVector::from_fn(n, |_, _| uniform.sample(rng));
        let mut converged = false;

        for step in 0..max_iters.max(1) {
            let xtu = big.transpose() * &u;
            let norm = xtu.norm();
            if norm == 0.0 {
                return Err(Error::RankDeficient { rank: r, available: j });
            }
            let v = xtu / norm;
            let u_new = &big * v;

            let scale = u_new.norm_squared().max(f64::MIN_POSITIVE);
            let change = (&u - &u_new).norm_squared() / scale;
            u = u_new;
            if change < PLS_TOL {
                trace!("pls direction {} converged after {} steps", j, step + 1);
                converged = true;
                break;
            }
        }
        if !converged {
            debug!("pls direction {} hit the iteration cap ({})", j, max_iters);
        }

        let norm = u.norm();
        if !(norm > 0.0) {
            return Err(Error::RankDeficient { rank: r, available: j });
        }
        let unit = u / norm;
        // Deflate: remove the found direction from every column.
        let projection = &unit * (unit.transpose() * &big);
        big -= projection;
        mean.set_column(j, &unit);
    }

    ensure_finite(&mean, "pls flag mean")?;
    Ok(orthonormalize(&mean))
}

/// Dispatch on [`FlagMeanMethod`].
pub(crate) fn flag_mean_with<R: Rng + ?Sized>(
    data: &[DMatrix<f64>],
    r: usize,
    method: FlagMeanMethod,
    rng: &mut R,
) -> Result<DMatrix<f64>> {
    match method {
        FlagMeanMethod::Svd => flag_mean(data, r),
        FlagMeanMethod::Pls { max_iters } => flag_mean_pls(data, r, max_iters, rng),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::is_orthonormal;
    use crate::objective::{objective_value, Objective};
    use crate::test_util::{line, projector_gap, random_points};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[test]
    fn test_stack_shape() {
        let data = vec![DMatrix::<f64>::identity(5, 2), DMatrix::identity(5, 3)];
        let big = stack(&data).unwrap();
        assert_eq!(big.shape(), (5, 5));
        assert_eq!(big[(1, 1)], 1.0);
        assert_eq!(big[(2, 4)], 1.0);
    }

    #[test]
    fn test_flag_mean_orthonormal() {
        let data = random_points(6, 7, 2, 12);
        let mean = flag_mean(&data, 3).unwrap();
        assert_eq!(mean.shape(), (7, 3));
        assert!(is_orthonormal(&mean));
    }

    #[test]
    fn test_flag_mean_order_invariant() {
        let mut data = random_points(8, 6, 2, 31);
        let before = flag_mean(&data, 2).unwrap();
        data.shuffle(&mut StdRng::seed_from_u64(1));
        let after = flag_mean(&data, 2).unwrap();
        assert!(projector_gap(&before, &after) < 1e-10);
    }

    #[test]
    fn test_flag_mean_of_repeated_point() {
        let pts = random_points(1, 5, 2, 77);
        let data = vec![pts[0].clone(); 10];
        let mean = flag_mean(&data, 2).unwrap();
        assert!(projector_gap(&mean, &pts[0]) < 1e-10);
        for o in [Objective::Sine, Objective::SineSquared, Objective::ManifoldMedian] {
            assert!(objective_value(&data, &mean, o).unwrap() < 1e-5);
        }
    }

    #[test]
    fn test_flag_mean_minimizes_sine_squared() {
        let data = random_points(5, 4, 1, 8);
        let mean = flag_mean(&data, 1).unwrap();
        let best = objective_value(&data, &mean, Objective::SineSquared).unwrap();
        for x in &data {
            let other = objective_value(&data, x, Objective::SineSquared).unwrap();
            assert!(best <= other + 1e-12);
        }
    }

    #[test]
    fn test_flag_mean_heterogeneous_dims() {
        let data = vec![
            DMatrix::<f64>::identity(4, 2),
            line(&[1.0, 0.0, 0.0, 0.0]),
            line(&[0.0, 1.0, 0.0, 0.0]),
        ];
        let mean = flag_mean(&data, 2).unwrap();
        assert!(projector_gap(&mean, &DMatrix::identity(4, 2)) < 1e-10);
    }

    #[test]
    fn test_flag_mean_rank_checks() {
        let data = vec![line(&[1.0, 0.0, 0.0])];
        assert_eq!(
            flag_mean(&data, 2),
            Err(Error::RankDeficient { rank: 2, available: 1 })
        );
        assert!(flag_mean(&data, 0).is_err());
        assert_eq!(flag_mean::<DMatrix<f64>>(&[], 1), Err(Error::EmptyInput));
    }

    #[test]
    fn test_pls_matches_svd_on_separated_spectrum() {
        // Lines concentrated around e₁, with a weaker spread along e₂.
        let data = vec![
            line(&[1.0, 0.2, 0.0]),
            line(&[1.0, -0.1, 0.05]),
            line(&[1.0, 0.3, -0.05]),
            line(&[0.9, 0.0, 0.1]),
        ];
        let svd = flag_mean(&data, 2).unwrap();
        let pls = flag_mean_pls(&data, 2, 5000, &mut StdRng::seed_from_u64(3)).unwrap();
        assert!(is_orthonormal(&pls));
        assert!(projector_gap(&svd, &pls) < 1e-6);
    }

    #[test]
    fn test_pls_directions_are_distinct() {
        let data = random_points(6, 5, 2, 60);
        let pls = flag_mean_pls(&data, 3, 5000, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(pls.shape(), (5, 3));
        assert!(is_orthonormal(&pls));
    }
}
