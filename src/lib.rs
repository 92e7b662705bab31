//! # flagirls
//!
//! Robust centers of subspaces on the Grassmann manifold, and LBG clustering
//! built on top of them.
//!
//! ## Why "FlagIRLS"?
//!
//! The **flag mean** of a collection of subspaces is the subspace spanned by
//! the leading left singular vectors of their stacked bases. It minimizes the
//! summed *squared* sine distance, so like an arithmetic mean it is pulled
//! around by outliers.
//!
//! **FlagIRLS** (iteratively reweighted least squares over flag means) scales
//! every basis by a per-point weight derived from the current center and takes
//! the flag mean again. Each step solves a reweighted quadratic surrogate in
//! closed form, so no step size is needed, and the fixed point approximates an
//! L1-type center: the sine median, the maximum-cosine center or the geodesic
//! median.
//!
//! ## Intuition
//!
//! A point of Gr(r, n) is an r-dimensional subspace of Rⁿ, represented here by
//! an n×r matrix with orthonormal columns. Two subspaces are compared through
//! their principal angles θᵢ, the arccosines of the singular values of XᵀY.
//! The geodesic distance is ‖θ‖₂, the chordal (sine) distance is ‖sin θ‖₂.
//!
//! ## Key Functions
//!
//! | Function | Purpose |
//! |----------|---------|
//! | [`log_map`] / [`exp_map`] | Move between the manifold and a tangent space |
//! | [`distance`] | Geodesic distance ‖θ‖₂ |
//! | [`objective_value`] | Aggregate error of a center under an [`Objective`] |
//! | [`flag_mean`] | Closed-form flag mean via SVD |
//! | [`irls`] | FlagIRLS fixed-point optimizer |
//! | [`gradient_descent`] | Riemannian gradient descent |
//! | [`median`] | Weiszfeld-style geodesic median |
//! | [`lbg`] | Lloyd/LBG clustering of subspaces |
//! | [`cluster_purity`] | Agreement of a clustering with ground-truth labels |
//!
//! ## Quick Start
//!
//! ```rust
//! use flagirls::{irls, Init, IrlsParams, Objective};
//! use nalgebra::DMatrix;
//!
//! // Three lines in R³ close to the x-axis and one outlier on the z-axis.
//! let line = |v: [f64; 3]| {
//!     let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
//!     DMatrix::from_column_slice(3, 1, &[v[0] / norm, v[1] / norm, v[2] / norm])
//! };
//! let data = vec![
//!     line([1.0, 0.1, 0.0]),
//!     line([1.0, -0.1, 0.0]),
//!     line([1.0, 0.0, 0.1]),
//!     line([0.0, 0.0, 1.0]),
//! ];
//!
//! let params = IrlsParams::new(1, Objective::Sine).with_init(Init::Given(data[0].clone()));
//! let median = irls(&data, &params).unwrap();
//! // The sine median stays with the majority.
//! assert!(median.center[(0, 0)].abs() > 0.9);
//! ```
//!
//! ## What Can Go Wrong
//!
//! 1. **Orthogonal configurations**: the log map needs XᵀY invertible. A
//!    principal angle of π/2 yields [`Error::SingularConfiguration`].
//! 2. **Coincident points**: sine and geodesic weights blow up when the center
//!    sits on a data point. FlagIRLS adds ε = 1e-7 under the root; the median
//!    solver skips such points for the step.
//! 3. **Rank**: a flag mean of rank r needs at least r stacked columns.
//! 4. **Geodesic objective**: only defined here for lines (r = kᵢ = 1).
//! 5. **Cluster collapse**: LBG drops clusters that lose all their points.
//!
//! ## References
//!
//! - Mankovich et al. (2022). "The Flag Median and FlagIRLS" (CVPR)
//! - Draper et al. (2014). "A flag representation for finite collections of subspaces"
//! - Edelman, Arias & Smith (1998). "The Geometry of Algorithms with Orthogonality Constraints"
//! - Linde, Buzo & Gray (1980). "An Algorithm for Vector Quantizer Design"

use std::borrow::Borrow;

use nalgebra::DMatrix;
use thiserror::Error;

pub mod flag_mean;
pub mod gradient;
pub mod irls;
pub mod lbg;
pub mod manifold;
pub mod median;
pub mod objective;

pub use flag_mean::{flag_mean, flag_mean_pls, stack, FlagMeanMethod};
pub use gradient::{gradient_descent, GradientParams};
pub use irls::{irls, Init, IrlsParams};
pub use lbg::{
    assign, cluster_purity, distance_matrix, lbg, lbg_from, Assignment, Clustering, LbgParams,
    Purity,
};
pub use manifold::{
    distance, exp_map, is_orthonormal, log_map, orthonormalize, principal_angles, random_point,
};
pub use median::{median, MedianParams};
pub use objective::{irls_weight, objective_value, Objective};

/// Errors for subspace operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("empty input")]
    EmptyInput,

    #[error("dimension mismatch: {0} vs {1}")]
    DimensionMismatch(usize, usize),

    #[error("cannot extract rank {rank}: only {available} directions available")]
    RankDeficient { rank: usize, available: usize },

    #[error("singular configuration: XᵀY is not invertible (principal angle of π/2)")]
    SingularConfiguration,

    #[error("non-finite values in {0}")]
    NonFinite(&'static str),

    #[error("geodesic objective requires one-dimensional subspaces")]
    RequiresLines,

    #[error("unknown objective `{name}`, expected one of: {valid}")]
    UnknownObjective { name: String, valid: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Result of an iterative center computation.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimized {
    /// The returned center, n×r with orthonormal columns.
    pub center: DMatrix<f64>,
    /// Objective value of every iterate, starting with the initial one.
    pub trace: Vec<f64>,
}

impl Optimized {
    /// Number of update steps behind the returned center.
    pub fn iterations(&self) -> usize {
        self.trace.len().saturating_sub(1)
    }
}

/// Check that `data` is non-empty and every basis lives in the same Rⁿ.
///
/// Returns the ambient dimension n.
pub(crate) fn ambient_dim<D: Borrow<DMatrix<f64>>>(data: &[D]) -> Result<usize> {
    let first: &DMatrix<f64> = data.first().ok_or(Error::EmptyInput)?.borrow();
    let n = first.nrows();
    for x in data {
        let x: &DMatrix<f64> = x.borrow();
        if x.nrows() != n {
            return Err(Error::DimensionMismatch(n, x.nrows()));
        }
    }
    Ok(n)
}
