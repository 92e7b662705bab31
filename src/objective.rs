//! Objective functions comparing a candidate center with a set of subspaces.
//!
//! Every objective has a per-point term and a matching FlagIRLS weight. The two
//! are kept together on [`Objective`] so a solver can never pair the error of
//! one objective with the weights of another by accident.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use nalgebra::DMatrix;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::manifold::distance;
use crate::{Error, Result};

/// Which center to compute, and how to score it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Objective {
    /// Maximum cosine: maximize Σ sqrt(tr(Yᵀxxᵀy)).
    Cosine,
    /// Sine median: minimize Σ sqrt(r - tr(Yᵀxxᵀy)).
    Sine,
    /// Flag mean: minimize Σ (r - tr(Yᵀxxᵀy)).
    SineSquared,
    /// Geodesic median of lines: minimize Σ θ. Only for r = kᵢ = 1.
    Geodesic,
    /// Manifold (L2) median: minimize Σ ‖θ‖₂ for any r.
    ManifoldMedian,
}

impl Objective {
    pub const ALL: [Objective; 5] = [
        Objective::Cosine,
        Objective::Sine,
        Objective::SineSquared,
        Objective::Geodesic,
        Objective::ManifoldMedian,
    ];

    /// Canonical name, as accepted by [`FromStr`].
    pub fn name(self) -> &'static str {
        match self {
            Objective::Cosine => "cosine",
            Objective::Sine => "sine",
            Objective::SineSquared => "sinesq",
            Objective::Geodesic => "geodesic",
            Objective::ManifoldMedian => "l2_med",
        }
    }

    /// Cosine is the only objective that is maximized.
    pub fn maximizes(self) -> bool {
        matches!(self, Objective::Cosine)
    }

    /// Signed progress from `previous` to `current`; positive is better.
    pub fn improvement(self, previous: f64, current: f64) -> f64 {
        if self.maximizes() {
            current - previous
        } else {
            previous - current
        }
    }

    /// Whether `candidate` strictly beats `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        self.improvement(incumbent, candidate) > 0.0
    }

    /// The distance this objective uses to compare one point with one center.
    ///
    /// Cosine is a similarity, so it falls back to the sine distance.
    pub fn induced_distance(self) -> Objective {
        match self {
            Objective::Cosine => Objective::Sine,
            other => other,
        }
    }

    /// Contribution of the single data point `x` to the error of center `y`.
    pub fn term(self, x: &DMatrix<f64>, y: &DMatrix<f64>) -> Result<f64> {
        if x.nrows() != y.nrows() {
            return Err(Error::DimensionMismatch(y.nrows(), x.nrows()));
        }
        let value = match self {
            Objective::Cosine => cos_sq(x, y).sqrt(),
            Objective::Sine => sin_sq(x, y).sqrt(),
            Objective::SineSquared => sin_sq(x, y),
            Objective::Geodesic => {
                if x.ncols() != 1 || y.ncols() != 1 {
                    return Err(Error::RequiresLines);
                }
                cos_sq(x, y).clamp(0.0, 1.0).sqrt().acos()
            }
            Objective::ManifoldMedian => distance(x, y)?,
        };
        if value.is_finite() {
            Ok(value)
        } else {
            Err(Error::NonFinite("objective term"))
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Objective {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" | "max-cosine" => Ok(Objective::Cosine),
            "sine" | "sine-median" => Ok(Objective::Sine),
            "sinesq" | "sine-squared" | "flag-mean" => Ok(Objective::SineSquared),
            "geodesic" => Ok(Objective::Geodesic),
            "l2_med" | "manifold-median" => Ok(Objective::ManifoldMedian),
            _ => Err(Error::UnknownObjective {
                name: s.to_string(),
                valid: Objective::ALL
                    .iter()
                    .map(|o| o.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }
}

/// tr(Yᵀ x xᵀ Y) = ‖xᵀY‖²_F, the sum of squared cosines of the principal angles.
pub(crate) fn cos_sq(x: &DMatrix<f64>, y: &DMatrix<f64>) -> f64 {
    (x.transpose() * y).norm_squared()
}

/// min(r, k) - tr(Yᵀ x xᵀ Y), clamped at zero against round-off.
pub(crate) fn sin_sq(x: &DMatrix<f64>, y: &DMatrix<f64>) -> f64 {
    let r = y.ncols().min(x.ncols()) as f64;
    (r - cos_sq(x, y)).max(0.0)
}

/// Aggregate error of center `y` over `data`.
///
/// # Example
///
/// ```rust
/// use flagirls::{objective_value, Objective};
/// use nalgebra::DMatrix;
///
/// let x_axis = DMatrix::from_column_slice(2, 1, &[1.0, 0.0]);
/// let y_axis = DMatrix::from_column_slice(2, 1, &[0.0, 1.0]);
/// let data = vec![x_axis.clone(), y_axis];
///
/// let sine = objective_value(&data, &x_axis, Objective::Sine).unwrap();
/// assert!((sine - 1.0).abs() < 1e-12);
/// let cosine = objective_value(&data, &x_axis, Objective::Cosine).unwrap();
/// assert!((cosine - 1.0).abs() < 1e-12);
/// ```
pub fn objective_value<D: Borrow<DMatrix<f64>>>(
    data: &[D],
    y: &DMatrix<f64>,
    objective: Objective,
) -> Result<f64> {
    data.iter()
        .map(|x| objective.term(x.borrow(), y))
        .sum::<Result<f64>>()
}

/// FlagIRLS weight α for data point `x` at the current center `y`.
///
/// Each basis is scaled by α, so its contribution to the stacked flag-mean
/// problem is weighted by α². With ε guarding the root:
///
/// | objective | α |
/// |-----------|---|
/// | Cosine | (cos² + ε)^(-1/4) |
/// | Sine | (sin² + ε)^(-1/4) |
/// | SineSquared | 1 |
/// | Geodesic | (sin² cos² + ε)^(-1/4) |
/// | ManifoldMedian | (d² + ε)^(-1/4) |
///
/// The geodesic weight is only defined for lines and fails with
/// [`Error::RequiresLines`] otherwise.
pub fn irls_weight(objective: Objective, x: &DMatrix<f64>, y: &DMatrix<f64>, eps: f64) -> Result<f64> {
    if x.nrows() != y.nrows() {
        return Err(Error::DimensionMismatch(y.nrows(), x.nrows()));
    }
    let base = match objective {
        Objective::Cosine => cos_sq(x, y),
        Objective::Sine => sin_sq(x, y),
        Objective::SineSquared => return Ok(1.0),
        Objective::Geodesic => {
            if x.ncols() != 1 || y.ncols() != 1 {
                return Err(Error::RequiresLines);
            }
            sin_sq(x, y) * cos_sq(x, y)
        }
        Objective::ManifoldMedian => distance(x, y)?.powi(2),
    };
    let alpha = (base + eps).powf(-0.25);
    if alpha.is_finite() {
        Ok(alpha)
    } else {
        Err(Error::NonFinite("irls weight"))
    }
}
