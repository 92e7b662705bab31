//! FlagIRLS: iteratively reweighted flag means.
//!
//! Each iteration weights every data basis by α = (term + ε)^(-1/4) at the
//! current center and replaces the center by the flag mean of the weighted
//! bases. The weighted flag mean minimizes a quadratic surrogate of the chosen
//! objective in closed form, so there is no step size to tune.
//!
//! The loop keeps the best iterate it has seen under the stopping objective.
//! A final step that makes things worse is discarded together with its trace
//! entry.

use std::borrow::Borrow;

use log::{debug, trace};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

use crate::flag_mean::{flag_mean_with, FlagMeanMethod};
use crate::manifold::{ensure_finite, is_orthonormal, orthonormalize, random_point};
use crate::objective::{irls_weight, objective_value, sin_sq, Objective};
use crate::{ambient_dim, Error, Optimized, Result};

/// Additive guard inside the weight root.
pub const IRLS_EPS: f64 = 1e-7;

/// Minimum improvement between consecutive iterates to keep going.
pub const IRLS_TOL: f64 = 1e-12;

/// Steps moving the center by less than this (in Σ sin²θ) reached a fixed point.
const STATIONARY_TOL: f64 = 1e-12;

/// Starting point of an iterative solver.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Init {
    /// Seeded random orthonormal basis.
    #[default]
    Random,
    /// Seeded random pick among the data points. The pick must have `rank` columns.
    DataPoint,
    /// Caller-supplied basis with `rank` columns.
    Given(DMatrix<f64>),
}

/// Build the initial center for `init`.
pub(crate) fn initialize<D: Borrow<DMatrix<f64>>, R: Rng + ?Sized>(
    data: &[D],
    rank: usize,
    init: &Init,
    rng: &mut R,
) -> Result<DMatrix<f64>> {
    let n = ambient_dim(data)?;
    let y = match init {
        Init::Random => return random_point(n, rank, rng),
        Init::DataPoint => data[rng.gen_range(0..data.len())].borrow().clone(),
        Init::Given(y) => y.clone(),
    };
    if y.nrows() != n {
        return Err(Error::DimensionMismatch(n, y.nrows()));
    }
    if y.ncols() != rank {
        return Err(Error::DimensionMismatch(rank, y.ncols()));
    }
    ensure_finite(&y, "initial center")?;
    Ok(if is_orthonormal(&y) { y } else { orthonormalize(&y) })
}

/// Parameters for [`irls`].
#[derive(Debug, Clone, PartialEq)]
pub struct IrlsParams {
    /// Dimension r of the center.
    pub rank: usize,
    /// Maximum number of reweighting steps.
    pub max_iters: usize,
    /// Objective whose weights drive the iteration.
    pub objective: Objective,
    /// Objective recorded in the trace and used to stop.
    pub stop_objective: Objective,
    pub init: Init,
    pub seed: u64,
    /// Reweight a random subset of this many points per step.
    pub sample_size: Option<usize>,
    pub method: FlagMeanMethod,
    pub eps: f64,
}

impl IrlsParams {
    /// Defaults: 100 iterations, stop on the fitted objective, random start, seed 0.
    pub fn new(rank: usize, objective: Objective) -> Self {
        Self {
            rank,
            max_iters: 100,
            objective,
            stop_objective: objective,
            init: Init::Random,
            seed: 0,
            sample_size: None,
            method: FlagMeanMethod::Svd,
            eps: IRLS_EPS,
        }
    }

    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn with_stop_objective(mut self, stop_objective: Objective) -> Self {
        self.stop_objective = stop_objective;
        self
    }

    pub fn with_init(mut self, init: Init) -> Self {
        self.init = init;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = Some(sample_size);
        self
    }

    pub fn with_method(mut self, method: FlagMeanMethod) -> Self {
        self.method = method;
        self
    }
}

/// Scale every basis in `data` by its FlagIRLS weight at `y`.
fn reweight(
    data: &[&DMatrix<f64>],
    y: &DMatrix<f64>,
    objective: Objective,
    eps: f64,
) -> Result<Vec<DMatrix<f64>>> {
    data.iter()
        .map(|x| Ok(*x * irls_weight(objective, x, y, eps)?))
        .collect()
}

/// Run FlagIRLS on `data`.
///
/// Stops after `max_iters` steps, as soon as a step improves the stopping
/// objective by no more than [`IRLS_TOL`] (improvement means a decrease, or an
/// increase for [`Objective::Cosine`]), or when the center stops moving.
/// Returns the best iterate and the trace up to it, so the trace is monotone in
/// the optimizing direction.
///
/// # Example
///
/// ```rust
/// use flagirls::{irls, IrlsParams, Objective};
/// use nalgebra::DMatrix;
///
/// let point = DMatrix::from_column_slice(3, 1, &[0.0, 0.6, 0.8]);
/// let data = vec![point.clone(); 10];
///
/// let result = irls(&data, &IrlsParams::new(1, Objective::Sine).with_seed(3)).unwrap();
/// assert!(result.iterations() <= 2);
/// assert!(result.trace.last().unwrap().abs() < 1e-6);
/// ```
pub fn irls<D: Borrow<DMatrix<f64>>>(data: &[D], params: &IrlsParams) -> Result<Optimized> {
    ambient_dim(data)?;
    if let Some(size) = params.sample_size {
        if size == 0 || size > data.len() {
            return Err(Error::InvalidParameter(format!(
                "sample size {size} must be in 1..={}",
                data.len()
            )));
        }
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let stop = params.stop_objective;

    let mut y = initialize(data, params.rank, &params.init, &mut rng)?;
    let initial = objective_value(data, &y, stop)?;
    let mut trace = vec![initial];
    let mut best = (0usize, y.clone(), initial);

    for iter in 1..=params.max_iters {
        let batch: Vec<&DMatrix<f64>> = match params.sample_size {
            Some(size) => index::sample(&mut rng, data.len(), size)
                .into_iter()
                .map(|i| data[i].borrow())
                .collect(),
            None => data.iter().map(Borrow::borrow).collect(),
        };

        let weighted = reweight(&batch, &y, params.objective, params.eps)?;
        let mut next = flag_mean_with(&weighted, params.rank, params.method, &mut rng)?;
        if !is_orthonormal(&next) {
            next = orthonormalize(&next);
        }
        let moved = sin_sq(&y, &next);
        y = next;

        let err = objective_value(data, &y, stop)?;
        let previous = trace[trace.len() - 1];
        let improvement = stop.improvement(previous, err);
        trace.push(err);
        trace!("irls iter {}: {} = {:.6e} (Δ {:.3e})", iter, stop, err, improvement);

        if stop.is_better(err, best.2) {
            best = (iter, y.clone(), err);
        }
        if improvement <= IRLS_TOL || moved <= STATIONARY_TOL {
            debug!("irls stopped after {} iterations", iter);
            break;
        }
    }

    let (best_iter, center, _) = best;
    if best_iter + 1 < trace.len() {
        debug!(
            "irls discarding {} non-improving step(s)",
            trace.len() - best_iter - 1
        );
    }
    trace.truncate(best_iter + 1);
    Ok(Optimized { center, trace })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{line, projector_gap, random_points};

    fn noisy_lines() -> Vec<DMatrix<f64>> {
        vec![
            line(&[1.0, 0.1, 0.0, 0.0]),
            line(&[1.0, -0.1, 0.05, 0.0]),
            line(&[1.0, 0.0, -0.1, 0.1]),
            line(&[1.0, 0.05, 0.0, -0.1]),
            line(&[0.0, 0.0, 1.0, 0.0]),
            line(&[0.0, 0.0, 0.0, 1.0]),
        ]
    }

    fn assert_monotone(objective: Objective, trace: &[f64]) {
        for w in trace.windows(2) {
            assert!(
                objective.improvement(w[0], w[1]) >= -1e-12,
                "{objective}: {trace:?}"
            );
        }
    }

    #[test]
    fn test_repeated_point_converges_fast() {
        let point = line(&[0.3, -0.2, 0.9, 0.1]);
        let data = vec![point.clone(); 10];
        for o in [
            Objective::Cosine,
            Objective::Sine,
            Objective::SineSquared,
            Objective::Geodesic,
            Objective::ManifoldMedian,
        ] {
            let result = irls(&data, &IrlsParams::new(1, o).with_seed(5)).unwrap();
            assert!(result.iterations() <= 2, "{o}: {:?}", result.trace);
            assert!(projector_gap(&result.center, &point) < 1e-10, "{o}");
            let last = *result.trace.last().unwrap();
            if o == Objective::Cosine {
                assert!((last - 10.0).abs() < 1e-8);
            } else {
                assert!(last < 1e-4, "{o}: {last}");
            }
        }
    }

    #[test]
    fn test_trace_monotone_all_objectives() {
        let data = noisy_lines();
        for o in Objective::ALL {
            let result = irls(&data, &IrlsParams::new(1, o).with_seed(2).with_max_iters(50)).unwrap();
            assert_monotone(o, &result.trace);
            let initial = result.trace[0];
            let last = *result.trace.last().unwrap();
            assert!(!o.is_better(initial, last), "{o}: {initial} vs {last}");
        }
    }

    #[test]
    fn test_sine_median_resists_outliers() {
        let x_axis = line(&[1.0, 0.0, 0.0]);
        let data = vec![
            x_axis.clone(),
            x_axis.clone(),
            x_axis.clone(),
            line(&[1.0, 1.0, 0.0]),
            line(&[1.0, 0.0, 1.0]),
        ];
        let mean = crate::flag_mean::flag_mean(&data, 1).unwrap();
        let median = irls(
            &data,
            &IrlsParams::new(1, Objective::Sine).with_init(Init::Given(mean.clone())),
        )
        .unwrap();
        assert!(projector_gap(&mean, &x_axis) > 1e-2);
        assert!(projector_gap(&median.center, &x_axis) < 1e-3);
    }

    #[test]
    fn test_seed_reproducible() {
        let data = random_points(12, 6, 2, 14);
        let params = IrlsParams::new(2, Objective::Sine).with_seed(42).with_max_iters(20);
        let a = irls(&data, &params).unwrap();
        let b = irls(&data, &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_stochastic_reproducible_and_monotone_trace() {
        let data = random_points(20, 5, 2, 3);
        let params = IrlsParams::new(2, Objective::Sine)
            .with_seed(8)
            .with_sample_size(10)
            .with_max_iters(15);
        let a = irls(&data, &params).unwrap();
        let b = irls(&data, &params).unwrap();
        assert_eq!(a, b);
        // The returned iterate is never worse than where it started.
        assert!(a.trace.last().unwrap() <= &a.trace[0]);
    }

    #[test]
    fn test_sample_size_validated() {
        let data = random_points(3, 4, 1, 0);
        let params = IrlsParams::new(1, Objective::Sine).with_sample_size(4);
        assert!(matches!(irls(&data, &params), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_max_iters_zero_returns_init() {
        let data = random_points(4, 4, 2, 6);
        let result = irls(
            &data,
            &IrlsParams::new(2, Objective::Sine)
                .with_init(Init::Given(data[1].clone()))
                .with_max_iters(0),
        )
        .unwrap();
        assert_eq!(result.trace.len(), 1);
        assert_eq!(result.center, data[1]);
    }

    #[test]
    fn test_data_point_init() {
        let data = random_points(5, 6, 2, 19);
        let result = irls(
            &data,
            &IrlsParams::new(2, Objective::Cosine)
                .with_init(Init::DataPoint)
                .with_max_iters(0),
        )
        .unwrap();
        assert!(data.iter().any(|x| x == &result.center));
    }

    #[test]
    fn test_given_init_shape_checked() {
        let data = random_points(3, 4, 2, 1);
        let params = IrlsParams::new(2, Objective::Sine)
            .with_init(Init::Given(DMatrix::identity(4, 1)));
        assert_eq!(irls(&data, &params), Err(Error::DimensionMismatch(2, 1)));
    }

    #[test]
    fn test_heterogeneous_inputs() {
        let data = vec![
            DMatrix::<f64>::identity(4, 2),
            line(&[1.0, 0.1, 0.0, 0.0]),
            line(&[0.1, 1.0, 0.0, 0.0]),
        ];
        let result = irls(&data, &IrlsParams::new(2, Objective::Sine).with_seed(1)).unwrap();
        assert!(projector_gap(&result.center, &DMatrix::identity(4, 2)) < 1e-3);
    }

    #[test]
    fn test_stop_objective_differs() {
        let data = noisy_lines();
        let result = irls(
            &data,
            &IrlsParams::new(1, Objective::Sine).with_stop_objective(Objective::Geodesic),
        )
        .unwrap();
        assert_monotone(Objective::Geodesic, &result.trace);
    }

    #[test]
    fn test_pls_engine() {
        let data = noisy_lines();
        let params = IrlsParams::new(1, Objective::Sine)
            .with_seed(4)
            .with_method(FlagMeanMethod::Pls { max_iters: 2000 });
        let result = irls(&data, &params).unwrap();
        assert!(is_orthonormal(&result.center));
        assert_monotone(Objective::Sine, &result.trace);
    }

    #[test]
    fn test_geodesic_weights_reject_planes() {
        let data = random_points(4, 5, 2, 17);
        let params = IrlsParams::new(2, Objective::Geodesic).with_stop_objective(Objective::Sine);
        assert_eq!(irls(&data, &params), Err(Error::RequiresLines));
    }

    #[test]
    fn test_borrowed_points_match_owned() {
        let data = noisy_lines();
        let refs: Vec<&DMatrix<f64>> = data.iter().collect();
        let params = IrlsParams::new(1, Objective::Sine).with_seed(6);
        assert_eq!(irls(&refs, &params).unwrap(), irls(&data, &params).unwrap());
    }
}
