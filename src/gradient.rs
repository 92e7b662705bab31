//! Riemannian gradient descent on the Grassmannian.
//!
//! Uses the FlagIRLS weights to build F = Σ αᵢ² xᵢxᵢᵀY, projects it onto the
//! tangent space at Y and retracts with the exponential map. F points towards
//! larger Σ αᵢ² tr(Yᵀxᵢxᵢᵀy), which lowers every sine-type objective and raises
//! the cosine one, so the same step serves all objectives.
//!
//! There is no line search and no stopping rule besides the iteration count;
//! individual steps may overshoot.

use log::trace;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::flag_mean::stack;
use crate::irls::{initialize, Init, IRLS_EPS};
use crate::manifold::retract;
use crate::objective::{irls_weight, objective_value, Objective};
use crate::{ambient_dim, Error, Optimized, Result};

/// Parameters for [`gradient_descent`].
#[derive(Debug, Clone, PartialEq)]
pub struct GradientParams {
    pub rank: usize,
    /// Step length along the projected gradient.
    pub step_size: f64,
    pub iters: usize,
    pub objective: Objective,
    pub init: Init,
    pub seed: u64,
    pub eps: f64,
}

impl GradientParams {
    pub fn new(rank: usize, objective: Objective) -> Self {
        Self {
            rank,
            step_size: 0.01,
            iters: 100,
            objective,
            init: Init::Random,
            seed: 0,
            eps: IRLS_EPS,
        }
    }

    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn with_iters(mut self, iters: usize) -> Self {
        self.iters = iters;
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
}

/// Euclidean direction F = X Xᵀ Y for the weighted stack X = [α₁x₁ | α₂x₂ | …].
pub(crate) fn weighted_direction(
    data: &[DMatrix<f64>],
    y: &DMatrix<f64>,
    objective: Objective,
    eps: f64,
) -> Result<DMatrix<f64>> {
    let weighted = data
        .iter()
        .map(|x| Ok(x * irls_weight(objective, x, y, eps)?))
        .collect::<Result<Vec<_>>>()?;
    let big = stack(&weighted)?;
    Ok(&big * (big.transpose() * y))
}

/// Run `iters` steps of Riemannian gradient descent.
///
/// The trace holds the objective at the initial point and after every step.
pub fn gradient_descent(data: &[DMatrix<f64>], params: &GradientParams) -> Result<Optimized> {
    ambient_dim(data)?;
    if !(params.step_size.is_finite() && params.step_size > 0.0) {
        return Err(Error::InvalidParameter(format!(
            "step size {} must be positive",
            params.step_size
        )));
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut y = initialize(data, params.rank, &params.init, &mut rng)?;
    let mut trace = vec![objective_value(data, &y, params.objective)?];

    for iter in 0..params.iters {
        let f = weighted_direction(data, &y, params.objective, params.eps)?;
        // (I - YYᵀ) F without forming the n×n projector.
        let g = &f - &y * (y.transpose() * &f);

        y = retract(&y, &(g * params.step_size))?;

        let err = objective_value(data, &y, params.objective)?;
        trace!("gradient step {}: {} = {:.6e}", iter + 1, params.objective, err);
        trace.push(err);
    }

    Ok(Optimized { center: y, trace })
}
