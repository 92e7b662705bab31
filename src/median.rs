//! Geodesic (L2) median by Weiszfeld iteration on the manifold.
//!
//! Works for subspaces of any dimension r, unlike the geodesic FlagIRLS
//! weights which are only exact for lines. Each step moves the center along
//!
//! v = Σ log_Y(xᵢ) / dᵢ  ÷  Σ 1 / dᵢ
//!
//! scaled by a fixed step size. Points closer than [`COINCIDENT_TOL`] are left
//! out of a step: their direction is undefined and their weight unbounded.

use log::{debug, trace};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::irls::{initialize, Init};
use crate::manifold::{distance, log_map, retract};
use crate::{ambient_dim, Error, Optimized, Result};

/// Points within this geodesic distance of the center are skipped.
pub const COINCIDENT_TOL: f64 = 1e-4;

/// Stop once the summed distance changes by less than this.
pub const MEDIAN_TOL: f64 = 1e-6;

/// Parameters for [`median`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MedianParams {
    pub rank: usize,
    /// Fraction of the Weiszfeld direction taken per step.
    pub step_size: f64,
    pub max_iters: usize,
    pub seed: u64,
    /// Start from a seeded random data point instead of a random basis.
    pub init_from_data_point: bool,
}

impl MedianParams {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            step_size: 1.0,
            max_iters: 100,
            seed: 0,
            init_from_data_point: false,
        }
    }

    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_init_from_data_point(mut self, yes: bool) -> Self {
        self.init_from_data_point = yes;
        self
    }
}

fn distances(data: &[DMatrix<f64>], y: &DMatrix<f64>) -> Result<Vec<f64>> {
    data.iter().map(|x| distance(x, y)).collect()
}

/// Geodesic median of `data` (all points must have `rank` columns).
///
/// The trace holds Σ d(xᵢ, Y) for the initial center and after every step.
///
/// # Errors
///
/// - [`Error::DimensionMismatch`] if a point does not have `rank` columns.
/// - [`Error::InvalidParameter`] unless the step size is finite and positive.
/// - [`Error::SingularConfiguration`] if a data point is orthogonal to the
///   current center, where the log map is undefined.
///
/// # Example
///
/// ```rust
/// use flagirls::{median, MedianParams};
/// use nalgebra::DMatrix;
///
/// let line = |a: f64| DMatrix::from_column_slice(2, 1, &[a.cos(), a.sin()]);
/// let data = vec![line(0.0), line(0.1), line(0.2), line(1.2)];
///
/// let result = median(&data, &MedianParams::new(1).with_init_from_data_point(true)).unwrap();
/// let angle = result.center[(1, 0)].atan2(result.center[(0, 0)]).rem_euclid(std::f64::consts::PI);
/// // The 1-D median of the angles is anywhere in [0.1, 0.2].
/// assert!(angle > 0.09 && angle < 0.21);
/// ```
pub fn median(data: &[DMatrix<f64>], params: &MedianParams) -> Result<Optimized> {
    let n = ambient_dim(data)?;
    if let Some(x) = data.iter().find(|x| x.ncols() != params.rank) {
        return Err(Error::DimensionMismatch(params.rank, x.ncols()));
    }
    if !(params.step_size.is_finite() && params.step_size > 0.0) {
        return Err(Error::InvalidParameter(format!(
            "step size {} must be positive",
            params.step_size
        )));
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let init = if params.init_from_data_point {
        Init::DataPoint
    } else {
        Init::Random
    };
    let mut y = initialize(data, params.rank, &init, &mut rng)?;

    let mut dists = distances(data, &y)?;
    let mut trace = vec![dists.iter().sum::<f64>()];

    for iter in 0..params.max_iters {
        let mut inverse_sum = 0.0;
        let mut log_sum = DMatrix::zeros(n, params.rank);
        let mut contributing = 0usize;

        for (i, (x, &d)) in data.iter().zip(&dists).enumerate() {
            if d > COINCIDENT_TOL {
                inverse_sum += 1.0 / d;
                log_sum += log_map(&y, x)? / d;
                contributing += 1;
            } else {
                debug!("median center coincides with data point {}", i);
            }
        }

        if contributing == 0 {
            debug!("median center coincides with every data point");
            break;
        }

        let direction = log_sum / inverse_sum;
        y = retract(&y, &(direction * params.step_size))?;

        dists = distances(data, &y)?;
        let total: f64 = dists.iter().sum();
        let change = (trace[trace.len() - 1] - total).abs();
        trace.push(total);
        trace!("median iter {}: Σd = {:.6e}", iter + 1, total);

        if change < MEDIAN_TOL {
            break;
        }
    }

    Ok(Optimized { center: y, trace })
}
