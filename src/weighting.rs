//! Weighting/Covariance Engine: GMM weighting matrices, moment covariances `S`, and
//! asymptotic parameter covariances.
//!
//! Equation blocks are passed as parallel lists of residuals and instruments (demand
//! first, then supply), so the same code serves single- and two-equation problems.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{BlpError, Result};
use crate::linalg;
use crate::moments::product_moments;

/// Estimator of the moment covariance matrix `S`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceType {
    /// Heteroscedasticity-robust: `S = N^-1 sum_j g_j g_j'`.
    #[default]
    Robust,
    /// Cluster-robust: `S = N^-1 sum_c q_c q_c'` with `q_c = sum_{j in c} g_j`.
    Clustered,
    /// Homoscedastic: block `(a, b)` is `sigma_ab Z_a' Z_b / N`.
    Unadjusted,
}

/// Initial 2SLS weighting matrix: `blockdiag(Z_a' Z_a)^-1`, with an identity block for
/// `micro` micro moments.
pub fn initial_weighting(instruments: &[&DMatrix<f64>], micro: usize) -> Result<DMatrix<f64>> {
    let products: Vec<DMatrix<f64>> = instruments.iter().map(|z| z.tr_mul(z)).collect();
    let blocks: Vec<&DMatrix<f64>> = products.iter().collect();
    let stacked = linalg::block_diagonal(&blocks);
    let inverse = linalg::invert_spd(&stacked, "2SLS weighting matrix Z'Z")?;
    let identity = DMatrix::identity(micro, micro);
    Ok(linalg::block_diagonal(&[&inverse, &identity]))
}

/// Estimates `S` for the instrument moments.
///
/// `clusters` assigns each product a cluster index and is required for
/// [`CovarianceType::Clustered`]. Centering subtracts the sample mean of `g_j` first
/// and does not apply to the unadjusted estimator.
pub fn moment_covariances(
    residuals: &[&DVector<f64>],
    instruments: &[&DMatrix<f64>],
    kind: CovarianceType,
    clusters: Option<&[usize]>,
    center: bool,
) -> Result<DMatrix<f64>> {
    if residuals.len() != instruments.len() {
        return Err(BlpError::dimension_mismatch(
            "residual blocks",
            instruments.len(),
            residuals.len(),
        ));
    }
    let n = residuals.first().map_or(0, |u| u.len());
    if n == 0 {
        return Err(BlpError::dimension_mismatch("moment observations", 1, 0));
    }
    let scale = n as f64;

    match kind {
        CovarianceType::Unadjusted => {
            let sizes: Vec<usize> = instruments.iter().map(|z| z.ncols()).collect();
            let total: usize = sizes.iter().sum();
            let mut covariances = DMatrix::zeros(total, total);
            let mut row = 0;
            for a in 0..instruments.len() {
                let mut col = 0;
                for b in 0..instruments.len() {
                    let sigma = residuals[a].dot(residuals[b]) / scale;
                    let block = instruments[a].tr_mul(instruments[b]) * (sigma / scale);
                    covariances
                        .view_mut((row, col), (sizes[a], sizes[b]))
                        .copy_from(&block);
                    col += sizes[b];
                }
                row += sizes[a];
            }
            Ok(covariances)
        }
        CovarianceType::Robust => {
            let g = contributions(residuals, instruments, center);
            Ok(g.tr_mul(&g) / scale)
        }
        CovarianceType::Clustered => {
            let clusters =
                clusters.ok_or_else(|| BlpError::missing_component("clustering_ids"))?;
            if clusters.len() != n {
                return Err(BlpError::dimension_mismatch("clustering ids", n, clusters.len()));
            }
            let g = contributions(residuals, instruments, center);
            let count = clusters.iter().max().map_or(0, |c| c + 1);
            let mut sums = DMatrix::zeros(count, g.ncols());
            for (j, cluster) in clusters.iter().enumerate() {
                let mut row = sums.row_mut(*cluster);
                row += g.row(j);
            }
            Ok(sums.tr_mul(&sums) / scale)
        }
    }
}

/// Moment contributions, optionally demeaned column by column.
fn contributions(
    residuals: &[&DVector<f64>],
    instruments: &[&DMatrix<f64>],
    center: bool,
) -> DMatrix<f64> {
    let mut g = product_moments(residuals, instruments);
    if center {
        let mean = g.row_mean();
        for mut row in g.row_iter_mut() {
            row -= &mean;
        }
    }
    g
}

/// Full `S`: instrument moment covariances with the micro block on the diagonal.
pub fn with_micro_block(
    instrument_covariances: &DMatrix<f64>,
    micro: Option<&DMatrix<f64>>,
) -> DMatrix<f64> {
    match micro {
        Some(micro) if micro.nrows() > 0 => {
            linalg::block_diagonal(&[instrument_covariances, micro])
        }
        _ => instrument_covariances.clone(),
    }
}

/// Optimal weighting matrix `W = S^-1`.
pub fn weighting_from_covariances(covariances: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    linalg::invert_spd(covariances, "moment covariances S")
}

/// Asymptotic covariance of the parameters.
///
/// The sandwich `(G'WG)^-1 G'WSWG (G'WG)^-1` in general; `(G'WG)^-1` when `optimal`
/// (`W` is exactly `S^-1`).
pub fn parameter_covariances(
    jacobian: &DMatrix<f64>,
    weighting: &DMatrix<f64>,
    covariances: &DMatrix<f64>,
    optimal: bool,
) -> Result<DMatrix<f64>> {
    let gw = jacobian.tr_mul(weighting);
    let bread = linalg::invert_spd(&(&gw * jacobian), "G'WG")?;
    if optimal {
        return Ok(bread);
    }
    let meat = &gw * covariances * gw.transpose();
    Ok(&bread * meat * &bread)
}

/// Standard errors `sqrt(diag(Var) / N)`; negative variances yield `NaN`.
pub fn standard_errors(covariances: &DMatrix<f64>, observations: usize) -> DVector<f64> {
    let n = observations as f64;
    covariances.diagonal().map(|v| (v / n).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn demand() -> (DVector<f64>, DMatrix<f64>) {
        let u = DVector::from_vec(vec![0.4, -0.1, 0.3, -0.5, 0.2]);
        let z = DMatrix::from_row_slice(
            5,
            2,
            &[1.0, 0.2, 1.0, -0.7, 1.0, 1.3, 1.0, 0.1, 1.0, -0.4],
        );
        (u, z)
    }

    #[test]
    fn singleton_clusters_match_robust_and_one_cluster_is_the_outer_product() {
        let (u, z) = demand();
        let clustered = |ids: &[usize], center| {
            moment_covariances(&[&u], &[&z], CovarianceType::Clustered, Some(ids), center).unwrap()
        };
        let robust = moment_covariances(&[&u], &[&z], CovarianceType::Robust, None, false).unwrap();
        let singletons: Vec<usize> = (0..5).collect();
        assert_relative_eq!(robust, clustered(&singletons, false), epsilon = 1e-14);

        let single = vec![0usize; 5];
        let pooled = clustered(&single, false);
        let mean = z.tr_mul(&u) / 5.0;
        assert_relative_eq!(pooled, &mean * mean.transpose() * 5.0, epsilon = 1e-14);

        let centered = clustered(&single, true);
        assert_relative_eq!(centered, DMatrix::zeros(2, 2), epsilon = 1e-14);
    }

    #[test]
    fn clustered_requires_cluster_ids() {
        let (u, z) = demand();
        let result = moment_covariances(&[&u], &[&z], CovarianceType::Clustered, None, false);
        assert!(matches!(result, Err(BlpError::MissingComponent { .. })));
    }

    #[test]
    fn unadjusted_blocks_scale_instrument_cross_products() {
        let (u, z) = demand();
        let omega = DVector::from_vec(vec![0.1, 0.1, -0.2, 0.0, 0.3]);
        let zs = DMatrix::from_element(5, 1, 1.0);
        let kind = CovarianceType::Unadjusted;
        let s = moment_covariances(&[&u, &omega], &[&z, &zs], kind, None, false).unwrap();
        assert_eq!(s.shape(), (3, 3));
        let sigma_ds = u.dot(&omega) / 5.0;
        assert_relative_eq!(s[(0, 2)], sigma_ds * 5.0 / 5.0, epsilon = 1e-14);
        let sigma_dd = u.dot(&u) / 5.0;
        let expected = sigma_dd * z.column(1).norm_squared() / 5.0;
        assert_relative_eq!(s[(1, 1)], expected, epsilon = 1e-14);

        let centered = moment_covariances(&[&u, &omega], &[&z, &zs], kind, None, true).unwrap();
        assert_relative_eq!(centered, s, epsilon = 1e-14);
    }

    #[test]
    fn initial_weighting_is_block_diagonal_with_micro_identity() {
        let (_, z) = demand();
        let zs = DMatrix::from_element(5, 1, 2.0);
        let w = initial_weighting(&[&z, &zs], 2).unwrap();
        assert_eq!(w.shape(), (5, 5));
        assert_relative_eq!(w[(2, 2)], 1.0 / 20.0, epsilon = 1e-14);
        assert_eq!(w[(0, 2)], 0.0);
        assert_eq!(w[(3, 3)], 1.0);
        let ztz = z.tr_mul(&z);
        assert_relative_eq!(
            w.view((0, 0), (2, 2)) * ztz,
            DMatrix::identity(2, 2),
            epsilon = 1e-12
        );

        let collinear = DMatrix::from_fn(5, 2, |j, _| j as f64);
        assert!(matches!(
            initial_weighting(&[&collinear], 0),
            Err(BlpError::SingularMatrix { .. })
        ));
    }

    #[test]
    fn sandwich_collapses_when_weighting_is_optimal() {
        let g = DMatrix::from_row_slice(3, 2, &[1.0, 0.5, -0.3, 2.0, 0.7, 0.1]);
        let s = DMatrix::from_row_slice(3, 3, &[2.0, 0.3, 0.1, 0.3, 1.0, 0.2, 0.1, 0.2, 1.5]);
        let w = weighting_from_covariances(&s).unwrap();
        let sandwich = parameter_covariances(&g, &w, &s, false).unwrap();
        let optimal = parameter_covariances(&g, &w, &s, true).unwrap();
        assert_relative_eq!(sandwich, optimal, epsilon = 1e-10);

        let errors = standard_errors(&optimal, 4);
        assert_relative_eq!(errors[0], (optimal[(0, 0)] / 4.0).sqrt(), epsilon = 1e-14);
    }
}
