//! LBG / Lloyd clustering of subspaces, and cluster purity.
//!
//! The loop alternates two steps until the total distortion settles:
//!
//! 1. assign every point to its nearest center (a full distance matrix is
//!    rebuilt each time),
//! 2. replace every center by the flag mean (sine-squared objective) or the
//!    FlagIRLS center (any other objective) of its cluster.
//!
//! Clusters that lose all their points are dropped, so the number of centers
//! can only shrink.

use std::collections::HashMap;
use std::hash::Hash;

use log::{debug, info, warn};
use nalgebra::DMatrix;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::flag_mean::flag_mean;
use crate::irls::{irls, IrlsParams};
use crate::objective::{sin_sq, Objective};
use crate::{ambient_dim, Error, Result};

/// Distortion below which the clustering counts as exact.
pub const DISTORTION_FLOOR: f64 = 1e-11;

/// Initial centers closer than this in sin² span the same subspace.
const DUPLICATE_TOL: f64 = 1e-12;

/// Distance used to assign points to centers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Assignment {
    /// Sine distance whatever the clustering objective.
    #[default]
    Sine,
    /// The objective's own induced distance, see [`Objective::induced_distance`].
    Induced,
}

impl Assignment {
    pub fn metric(self, objective: Objective) -> Objective {
        match self {
            Assignment::Sine => Objective::Sine,
            Assignment::Induced => objective.induced_distance(),
        }
    }
}

/// How per-cluster majority agreement is averaged by [`cluster_purity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Purity {
    /// Mean over non-empty clusters of the majority-label fraction.
    #[default]
    PerCluster,
    /// Fraction of all points carrying their cluster's majority label.
    PerPoint,
}

/// Parameters for [`lbg`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LbgParams {
    /// Stop once the relative distortion change is at most this.
    pub epsilon: f64,
    pub num_centers: usize,
    /// Dimension r of the recomputed centers.
    pub rank: usize,
    pub objective: Objective,
    /// FlagIRLS iterations per center update.
    pub center_iters: usize,
    pub seed: u64,
    /// Cap on assign/re-center rounds.
    pub max_iters: usize,
    pub assignment: Assignment,
}

impl LbgParams {
    pub fn new(num_centers: usize, rank: usize, objective: Objective) -> Self {
        Self {
            epsilon: 1e-5,
            num_centers,
            rank,
            objective,
            center_iters: 10,
            seed: 1,
            max_iters: 100,
            assignment: Assignment::Sine,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_center_iters(mut self, center_iters: usize) -> Self {
        self.center_iters = center_iters;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn with_assignment(mut self, assignment: Assignment) -> Self {
        self.assignment = assignment;
        self
    }
}

/// Output of [`lbg`].
#[derive(Debug, Clone, PartialEq)]
pub struct Clustering {
    pub centers: Vec<DMatrix<f64>>,
    /// Relative distortion change of every round.
    pub errors: Vec<f64>,
    /// Total distortion at the initial centers and after every round.
    pub distortions: Vec<f64>,
    /// Index into `centers` for every data point.
    pub assignments: Vec<usize>,
}

/// Distance matrix D[i, j] between center i and point j.
pub fn distance_matrix(
    points: &[DMatrix<f64>],
    centers: &[DMatrix<f64>],
    metric: Objective,
) -> Result<Array2<f64>> {
    let mut d = Array2::zeros((centers.len(), points.len()));
    for (i, c) in centers.iter().enumerate() {
        for (j, x) in points.iter().enumerate() {
            d[[i, j]] = metric.term(c, x)?;
        }
    }
    Ok(d)
}

/// Index of the nearest center for every point; ties go to the lower index.
pub fn assign(d: &Array2<f64>) -> Vec<usize> {
    d.columns()
        .into_iter()
        .map(|col| {
            let mut best = 0;
            for (i, &v) in col.iter().enumerate() {
                if v < col[best] {
                    best = i;
                }
            }
            best
        })
        .collect()
}

fn distortion(d: &Array2<f64>, assignments: &[usize]) -> f64 {
    assignments
        .iter()
        .enumerate()
        .map(|(j, &i)| d[[i, j]])
        .sum()
}

/// Recompute one center from its cluster members.
fn recenter(members: &[&DMatrix<f64>], params: &LbgParams) -> Result<DMatrix<f64>> {
    match params.objective {
        Objective::SineSquared => flag_mean(members, params.rank),
        objective => {
            let fit = IrlsParams::new(params.rank, objective)
                .with_max_iters(params.center_iters)
                .with_seed(params.seed);
            Ok(irls(members, &fit)?.center)
        }
    }
}

/// Pick `k` starting centers among the data points in seeded random order.
///
/// Points spanning a subspace already chosen are passed over; they are only
/// used, in the same order, when `data` has fewer than `k` distinct subspaces.
fn initial_centers<R: Rng + ?Sized>(
    data: &[DMatrix<f64>],
    k: usize,
    rng: &mut R,
) -> Vec<DMatrix<f64>> {
    let mut centers: Vec<DMatrix<f64>> = Vec::with_capacity(k);
    let mut repeats = Vec::new();
    for i in index::sample(rng, data.len(), data.len()) {
        if centers.len() == k {
            break;
        }
        let x = &data[i];
        let seen = centers
            .iter()
            .any(|c| c.ncols() == x.ncols() && sin_sq(c, x) <= DUPLICATE_TOL);
        if seen {
            repeats.push(i);
        } else {
            centers.push(x.clone());
        }
    }

    if centers.len() < k {
        debug!(
            "lbg: only {} distinct subspaces for {} centers, reusing points",
            centers.len(),
            k
        );
        let mut repeats = repeats.into_iter();
        while centers.len() < k {
            let i = repeats
                .next()
                .unwrap_or_else(|| rng.gen_range(0..data.len()));
            centers.push(data[i].clone());
        }
    }
    centers
}

/// Cluster `data` with `num_centers` seeded random data points as the start.
///
/// The starting points are drawn without replacement and span distinct
/// subspaces whenever the data allows it.
///
/// # Example
///
/// ```rust
/// use flagirls::{lbg, LbgParams, Objective};
/// use nalgebra::DMatrix;
///
/// let line = |a: f64| DMatrix::from_column_slice(2, 1, &[a.cos(), a.sin()]);
/// let data = vec![line(0.0), line(0.05), line(1.5), line(1.55)];
///
/// let result = lbg(&data, &LbgParams::new(1, 1, Objective::Sine)).unwrap();
/// assert_eq!(result.centers.len(), 1);
/// assert_eq!(result.assignments, vec![0; 4]);
/// ```
pub fn lbg(data: &[DMatrix<f64>], params: &LbgParams) -> Result<Clustering> {
    ambient_dim(data)?;
    if params.num_centers == 0 {
        return Err(Error::InvalidParameter("at least one center is required".into()));
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let centers = initial_centers(data, params.num_centers, &mut rng);
    lbg_from(data, centers, params)
}

/// Cluster `data` starting from caller-supplied centers.
///
/// `params.num_centers` and `params.seed` only matter for [`lbg`]'s
/// initialization; the seed is still passed on to FlagIRLS.
pub fn lbg_from(
    data: &[DMatrix<f64>],
    mut centers: Vec<DMatrix<f64>>,
    params: &LbgParams,
) -> Result<Clustering> {
    ambient_dim(data)?;
    if centers.is_empty() {
        return Err(Error::InvalidParameter("at least one center is required".into()));
    }
    if !(params.epsilon >= 0.0) {
        return Err(Error::InvalidParameter(format!(
            "epsilon {} must be non-negative",
            params.epsilon
        )));
    }

    let metric = params.assignment.metric(params.objective);
    let mut d = distance_matrix(data, &centers, metric)?;
    let mut assignments = assign(&d);
    let mut current = distortion(&d, &assignments);

    let mut distortions = vec![current];
    let mut errors = Vec::new();
    info!(
        "lbg: {} points, {} centers, objective {}, assignment by {}",
        data.len(),
        centers.len(),
        params.objective,
        metric
    );

    for round in 0..params.max_iters {
        let previous = current;

        let mut next = Vec::with_capacity(centers.len());
        for c in 0..centers.len() {
            let members: Vec<&DMatrix<f64>> = assignments
                .iter()
                .zip(data)
                .filter(|(a, _)| **a == c)
                .map(|(_, x)| x)
                .collect();
            if members.is_empty() {
                warn!("lbg round {}: dropping empty cluster {}", round + 1, c);
                continue;
            }
            next.push(recenter(&members, params)?);
        }
        centers = next;

        d = distance_matrix(data, &centers, metric)?;
        assignments = assign(&d);
        current = distortion(&d, &assignments);
        distortions.push(current);

        let error = if current < DISTORTION_FLOOR {
            0.0
        } else {
            (current - previous).abs() / previous.max(f64::MIN_POSITIVE)
        };
        errors.push(error);
        debug!(
            "lbg round {}: distortion {:.6e}, relative change {:.3e}, {} centers",
            round + 1,
            current,
            error,
            centers.len()
        );

        if error <= params.epsilon {
            break;
        }
    }

    info!(
        "lbg finished after {} rounds with distortion {:.6e}",
        errors.len(),
        current
    );
    Ok(Clustering {
        centers,
        errors,
        distortions,
        assignments,
    })
}

/// Agreement between a clustering and ground-truth `labels`, in [0, 1].
///
/// Points are assigned to their nearest center under `metric`; each non-empty
/// cluster is scored by the share of its majority label.
pub fn cluster_purity<L: Eq + Hash>(
    data: &[DMatrix<f64>],
    centers: &[DMatrix<f64>],
    labels: &[L],
    metric: Objective,
    weighting: Purity,
) -> Result<f64> {
    ambient_dim(data)?;
    if centers.is_empty() {
        return Err(Error::EmptyInput);
    }
    if labels.len() != data.len() {
        return Err(Error::DimensionMismatch(data.len(), labels.len()));
    }

    let assignments = assign(&distance_matrix(data, centers, metric)?);

    let mut majority_total = 0usize;
    let mut fraction_sum = 0.0;
    let mut non_empty = 0usize;
    for c in 0..centers.len() {
        let mut counts: HashMap<&L, usize> = HashMap::new();
        let mut size = 0usize;
        for (label, _) in labels.iter().zip(&assignments).filter(|(_, a)| **a == c) {
            *counts.entry(label).or_insert(0) += 1;
            size += 1;
        }
        if size == 0 {
            continue;
        }
        let majority = counts.values().copied().max().unwrap_or(0);
        majority_total += majority;
        fraction_sum += majority as f64 / size as f64;
        non_empty += 1;
    }

    Ok(match weighting {
        Purity::PerCluster => fraction_sum / non_empty as f64,
        Purity::PerPoint => majority_total as f64 / data.len() as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::test_util::{line, projector_gap, random_points};

    fn axes_data() -> Vec<DMatrix<f64>> {
        let x = line(&[1.0, 0.0]);
        let y = line(&[0.0, 1.0]);
        vec![x.clone(), x, y.clone(), y]
    }

    #[test]
    fn test_distance_matrix_shape_and_values() {
        let data = axes_data();
        let centers = vec![line(&[1.0, 0.0])];
        let d = distance_matrix(&data, &centers, Objective::Sine).unwrap();
        assert_eq!(d.shape(), &[1, 4]);
        assert!(d[[0, 0]] < 1e-7);
        assert_abs_diff_eq!(d[[0, 2]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_assign_picks_minimum() {
        let d = ndarray::array![[0.5, 0.1, 0.9], [0.2, 0.3, 0.9]];
        assert_eq!(assign(&d), vec![1, 0, 0]);
    }

    #[test]
    fn test_two_axes_scenario() {
        let data = axes_data();
        let params = LbgParams::new(2, 1, Objective::Sine);
        let result = lbg_from(&data, vec![data[0].clone(), data[2].clone()], &params).unwrap();

        assert_eq!(result.centers.len(), 2);
        assert_eq!(result.assignments, vec![0, 0, 1, 1]);
        assert!(projector_gap(&result.centers[0], &line(&[1.0, 0.0])) < 1e-10);
        assert!(projector_gap(&result.centers[1], &line(&[0.0, 1.0])) < 1e-10);

        let labels = ["x", "x", "y", "y"];
        let purity =
            cluster_purity(&data, &result.centers, &labels, Objective::Sine, Purity::PerCluster)
                .unwrap();
        assert_abs_diff_eq!(purity, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_two_axes_from_random_start() {
        let data = axes_data();
        let labels = [0, 0, 1, 1];
        for seed in 0..50 {
            let params = LbgParams::new(2, 1, Objective::Sine).with_seed(seed);
            let result = lbg(&data, &params).unwrap();
            assert_eq!(result.centers.len(), 2, "seed {seed}");
            for weighting in [Purity::PerCluster, Purity::PerPoint] {
                let purity =
                    cluster_purity(&data, &result.centers, &labels, Objective::Sine, weighting)
                        .unwrap();
                assert_abs_diff_eq!(purity, 1.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_initial_centers_distinct() {
        let data = axes_data();
        for seed in 0..20 {
            let centers = initial_centers(&data, 2, &mut StdRng::seed_from_u64(seed));
            assert!(sin_sq(&centers[0], &centers[1]) > 0.5, "seed {seed}");
        }
    }

    #[test]
    fn test_initial_centers_reuse_when_short() {
        let data = axes_data();
        let centers = initial_centers(&data, 4, &mut StdRng::seed_from_u64(3));
        assert_eq!(centers.len(), 4);
        // Both axes come first, the repeats after.
        assert!(sin_sq(&centers[0], &centers[1]) > 0.5);

        let many = initial_centers(&data, 6, &mut StdRng::seed_from_u64(3));
        assert_eq!(many.len(), 6);
    }

    #[test]
    fn test_distortion_non_increasing() {
        let mut data = Vec::new();
        for i in 0..5 {
            let a = 0.02 * i as f64;
            data.push(line(&[a.cos(), a.sin(), 0.0]));
            data.push(line(&[0.0, a.cos(), a.sin()]));
            data.push(line(&[a.sin(), 0.0, a.cos()]));
        }
        // Start every center on the edge of its group.
        let start = vec![data[0].clone(), data[1].clone(), data[2].clone()];
        for objective in [Objective::Sine, Objective::SineSquared, Objective::Cosine] {
            let params = LbgParams::new(3, 1, objective).with_epsilon(1e-8);
            let result = lbg_from(&data, start.clone(), &params).unwrap();
            assert_eq!(result.centers.len(), 3);
            for w in result.distortions.windows(2) {
                assert!(w[1] <= w[0] + 1e-9, "{objective}: {:?}", result.distortions);
            }
            assert!(result.distortions.last().unwrap() < &result.distortions[0]);
            assert_eq!(result.errors.len() + 1, result.distortions.len());
        }
    }

    #[test]
    fn test_empty_cluster_dropped() {
        let data = axes_data();
        // Two identical starting centers: the second never wins a point.
        let params = LbgParams::new(2, 1, Objective::Sine);
        let result = lbg_from(&data, vec![data[0].clone(), data[0].clone()], &params).unwrap();
        assert_eq!(result.centers.len(), 1);
        assert!(result.assignments.iter().all(|&a| a == 0));
    }

    #[test]
    fn test_flag_mean_centers() {
        let data = random_points(9, 5, 2, 3);
        let params = LbgParams::new(3, 2, Objective::SineSquared).with_seed(2);
        let result = lbg(&data, &params).unwrap();
        assert!(!result.centers.is_empty() && result.centers.len() <= 3);
        for c in &result.centers {
            assert_eq!(c.shape(), (5, 2));
        }
        assert!(result.assignments.iter().all(|&a| a < result.centers.len()));
    }

    #[test]
    fn test_seeded_reproducible() {
        let data = random_points(10, 4, 1, 8);
        let params = LbgParams::new(3, 1, Objective::Cosine).with_seed(7);
        assert_eq!(lbg(&data, &params).unwrap(), lbg(&data, &params).unwrap());
    }

    #[test]
    fn test_induced_assignment() {
        let data = axes_data();
        let params = LbgParams::new(2, 1, Objective::ManifoldMedian)
            .with_assignment(Assignment::Induced);
        let result = lbg_from(&data, vec![data[0].clone(), data[2].clone()], &params).unwrap();
        assert_eq!(result.assignments, vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_invalid_params() {
        let data = axes_data();
        assert!(lbg(&data, &LbgParams::new(0, 1, Objective::Sine)).is_err());
        assert!(lbg_from(&data, vec![], &LbgParams::new(1, 1, Objective::Sine)).is_err());
    }

    #[test]
    fn test_purity_mixed_clusters() {
        let data = axes_data();
        let centers = vec![line(&[1.0, 0.0]), line(&[0.0, 1.0])];
        let labels = ['a', 'b', 'a', 'a'];
        let per_cluster =
            cluster_purity(&data, &centers, &labels, Objective::Sine, Purity::PerCluster).unwrap();
        assert_abs_diff_eq!(per_cluster, 0.75, epsilon = 1e-12);
        let per_point =
            cluster_purity(&data, &centers, &labels, Objective::Sine, Purity::PerPoint).unwrap();
        assert_abs_diff_eq!(per_point, 0.75, epsilon = 1e-12);
    }

    #[test]
    fn test_purity_label_length_checked() {
        let data = axes_data();
        let centers = vec![line(&[1.0, 0.0])];
        assert_eq!(
            cluster_purity(&data, &centers, &[1, 2], Objective::Sine, Purity::PerCluster),
            Err(Error::DimensionMismatch(4, 2))
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_params_serde_round_trip() {
        let params = LbgParams::new(4, 2, Objective::ManifoldMedian)
            .with_epsilon(1e-7)
            .with_seed(11)
            .with_assignment(Assignment::Induced);
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"manifold-median\""));
        assert!(json.contains("\"induced\""));
        let back: LbgParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
