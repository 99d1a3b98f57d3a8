//! Layout of the nonlinear parameter vector `theta`.
//!
//! `Sigma` (Cholesky root of the taste covariance), `Pi` (demographic interactions), and
//! `rho` (nesting parameters) are configured as full matrices/vectors. Zero entries are
//! fixed at zero, nonzero entries are starting values for elements of `theta`, and
//! entries whose lower and upper bounds coincide are fixed at that value. Elements of
//! `beta` and `gamma` are concentrated out unless given a starting value.
//!
//! `theta` is ordered as: active `Sigma` entries (column-major), active `Pi` entries
//! (column-major), active `rho` entries, `beta` entries, `gamma` entries.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{BlpError, Result};

/// Default upper bound on nesting parameters; values at or above one are inconsistent
/// with utility maximization.
pub const DEFAULT_RHO_UPPER_BOUND: f64 = 0.99;

/// Which triangle of `Sigma` may hold free entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Triangular {
    /// Entries below the diagonal must be zero.
    #[default]
    Upper,
    /// Entries above the diagonal must be zero.
    Lower,
}

/// Lower and upper bounds with the same shape as the parameter they bound.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatrixBounds {
    pub lower: DMatrix<f64>,
    pub upper: DMatrix<f64>,
}

/// User-facing configuration of the parameters, before compilation into a layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterConfig {
    /// `K2 x K2` Cholesky root; empty when there are no random coefficients.
    pub sigma: DMatrix<f64>,
    /// `K2 x D` demographic interactions; empty without demographics.
    pub pi: DMatrix<f64>,
    /// Nesting parameters: empty, a single shared value, or one per nesting group.
    pub rho: DVector<f64>,
    /// Demand-side linear parameters placed in `theta` (`Some`) or concentrated out (`None`).
    /// An empty vector concentrates out every element.
    pub beta: Vec<Option<f64>>,
    /// Supply-side linear parameters, following the same convention as `beta`.
    pub gamma: Vec<Option<f64>>,
    pub triangular: Triangular,
    pub sigma_bounds: Option<MatrixBounds>,
    pub pi_bounds: Option<MatrixBounds>,
    /// Bounds for `rho` stored as single-column matrices.
    pub rho_bounds: Option<MatrixBounds>,
    pub beta_bounds: Option<MatrixBounds>,
    pub gamma_bounds: Option<MatrixBounds>,
}

impl Default for ParameterConfig {
    fn default() -> Self {
        Self {
            sigma: DMatrix::zeros(0, 0),
            pi: DMatrix::zeros(0, 0),
            rho: DVector::zeros(0),
            beta: Vec::new(),
            gamma: Vec::new(),
            triangular: Triangular::Upper,
            sigma_bounds: None,
            pi_bounds: None,
            rho_bounds: None,
            beta_bounds: None,
            gamma_bounds: None,
        }
    }
}

impl ParameterConfig {
    /// Starts a configuration for a model with no nonlinear parameters (plain logit).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sigma(mut self, sigma: DMatrix<f64>) -> Self {
        self.sigma = sigma;
        self
    }

    pub fn pi(mut self, pi: DMatrix<f64>) -> Self {
        self.pi = pi;
        self
    }

    pub fn rho(mut self, rho: DVector<f64>) -> Self {
        self.rho = rho;
        self
    }

    pub fn beta(mut self, beta: Vec<Option<f64>>) -> Self {
        self.beta = beta;
        self
    }

    pub fn gamma(mut self, gamma: Vec<Option<f64>>) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn triangular(mut self, triangular: Triangular) -> Self {
        self.triangular = triangular;
        self
    }

    pub fn sigma_bounds(mut self, lower: DMatrix<f64>, upper: DMatrix<f64>) -> Self {
        self.sigma_bounds = Some(MatrixBounds { lower, upper });
        self
    }

    pub fn pi_bounds(mut self, lower: DMatrix<f64>, upper: DMatrix<f64>) -> Self {
        self.pi_bounds = Some(MatrixBounds { lower, upper });
        self
    }

    pub fn rho_bounds(mut self, lower: DVector<f64>, upper: DVector<f64>) -> Self {
        let rows = lower.len();
        self.rho_bounds = Some(MatrixBounds {
            lower: DMatrix::from_column_slice(rows, 1, lower.as_slice()),
            upper: DMatrix::from_column_slice(upper.len(), 1, upper.as_slice()),
        });
        self
    }

    pub fn beta_bounds(mut self, lower: DVector<f64>, upper: DVector<f64>) -> Self {
        self.beta_bounds = Some(MatrixBounds {
            lower: DMatrix::from_column_slice(lower.len(), 1, lower.as_slice()),
            upper: DMatrix::from_column_slice(upper.len(), 1, upper.as_slice()),
        });
        self
    }

    pub fn gamma_bounds(mut self, lower: DVector<f64>, upper: DVector<f64>) -> Self {
        self.gamma_bounds = Some(MatrixBounds {
            lower: DMatrix::from_column_slice(lower.len(), 1, lower.as_slice()),
            upper: DMatrix::from_column_slice(upper.len(), 1, upper.as_slice()),
        });
        self
    }
}

/// Identifies what a single element of `theta` controls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterKind {
    Sigma { row: usize, col: usize },
    Pi { row: usize, col: usize },
    /// `group` is `None` when a single `rho` is shared by every nesting group.
    Rho { group: Option<usize> },
    Beta { index: usize },
    Gamma { index: usize },
}

/// The four model variants, distinguished only by which parameters are present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelVariant {
    Logit,
    NestedLogit,
    RandomCoefficients,
    RandomCoefficientsNested,
}

/// Full parameter values implied by a particular `theta`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterValues {
    pub sigma: DMatrix<f64>,
    pub pi: DMatrix<f64>,
    /// One entry per nesting group (a shared `rho` is broadcast).
    pub rho: DVector<f64>,
    /// Concentrated-out entries hold zero until the linear IV step fills them in.
    pub beta: DVector<f64>,
    pub gamma: DVector<f64>,
}

impl ParameterValues {
    /// Whether any random coefficient (`Sigma` or `Pi` entry) is nonzero.
    pub fn has_random_coefficients(&self) -> bool {
        self.sigma.iter().any(|v| *v != 0.0) || self.pi.iter().any(|v| *v != 0.0)
    }

    /// Whether any nesting parameter is nonzero.
    pub fn has_nesting(&self) -> bool {
        self.rho.iter().any(|v| *v != 0.0)
    }

    /// Checks that every nesting parameter lies in `[0, 1)`.
    pub fn validate_rho(&self) -> Result<()> {
        for (index, value) in self.rho.iter().enumerate() {
            if !(0.0..1.0).contains(value) {
                return Err(BlpError::NestingParameterOutOfRange {
                    index,
                    value: *value,
                });
            }
        }
        Ok(())
    }
}

/// Compiled parameter layout: which entries are free, their bounds, and fixed values.
#[derive(Clone, Debug)]
pub struct Parameters {
    kinds: Vec<ParameterKind>,
    start: DVector<f64>,
    lower: DVector<f64>,
    upper: DVector<f64>,
    fixed: ParameterValues,
    concentrated_beta: Vec<usize>,
    concentrated_gamma: Vec<usize>,
    shared_rho: bool,
}

impl Parameters {
    /// Validates `config` against the problem dimensions and compiles the layout.
    ///
    /// `k1`, `k2`, `k3` are the column counts of `X1`, `X2`, `X3`; `demographics` is the
    /// number of demographic variables and `groups` the number of nesting groups.
    pub fn new(
        config: &ParameterConfig,
        k1: usize,
        k2: usize,
        k3: usize,
        demographics: usize,
        groups: usize,
    ) -> Result<Self> {
        let sigma = if config.sigma.is_empty() {
            DMatrix::zeros(k2, k2)
        } else {
            config.sigma.clone()
        };
        if sigma.nrows() != k2 || sigma.ncols() != k2 {
            return Err(BlpError::dimension_mismatch("sigma dimension", k2, sigma.nrows()));
        }
        let pi = if config.pi.is_empty() {
            DMatrix::zeros(k2, demographics)
        } else {
            config.pi.clone()
        };
        if pi.nrows() != k2 || pi.ncols() != demographics {
            return Err(BlpError::dimension_mismatch(
                "pi columns",
                demographics,
                pi.ncols(),
            ));
        }
        let shared_rho = config.rho.len() == 1 && groups > 0;
        if groups == 0 && config.rho.iter().any(|v| *v != 0.0) {
            return Err(BlpError::invalid_configuration(
                "rho was specified but products have no nesting ids",
            ));
        }
        let rho_length = config.rho.len();
        if groups > 0 && rho_length > 1 && rho_length != groups {
            return Err(BlpError::dimension_mismatch("rho length", groups, config.rho.len()));
        }
        let rho_config = if groups == 0 || config.rho.is_empty() {
            DVector::zeros(0)
        } else {
            config.rho.clone()
        };
        let beta = expand_linear(&config.beta, k1, "beta length")?;
        let gamma = expand_linear(&config.gamma, k3, "gamma length")?;

        let unbounded = |_: usize, _: usize| (f64::NEG_INFINITY, f64::INFINITY);
        let sigma_bounds =
            resolve_bounds(config.sigma_bounds.as_ref(), k2, k2, "sigma bounds", |r, c| {
                if r == c {
                    (0.0, f64::INFINITY)
                } else {
                    (f64::NEG_INFINITY, f64::INFINITY)
                }
            })?;
        let pi_bounds =
            resolve_bounds(config.pi_bounds.as_ref(), k2, demographics, "pi bounds", unbounded)?;
        let rho_bounds = resolve_bounds(
            config.rho_bounds.as_ref(),
            rho_config.len(),
            1,
            "rho bounds",
            |_, _| (0.0, DEFAULT_RHO_UPPER_BOUND),
        )?;
        let beta_bounds =
            resolve_bounds(config.beta_bounds.as_ref(), k1, 1, "beta bounds", unbounded)?;
        let gamma_bounds =
            resolve_bounds(config.gamma_bounds.as_ref(), k3, 1, "gamma bounds", unbounded)?;

        let mut free = FreeParameters::default();
        let mut fixed_sigma = DMatrix::zeros(k2, k2);
        let mut fixed_pi = DMatrix::zeros(k2, demographics);

        for col in 0..k2 {
            for row in 0..k2 {
                let value = sigma[(row, col)];
                if value == 0.0 {
                    continue;
                }
                let forbidden = match config.triangular {
                    Triangular::Upper => row > col,
                    Triangular::Lower => row < col,
                };
                if forbidden {
                    return Err(BlpError::invalid_configuration(format!(
                        "sigma[({row}, {col})] lies outside the {:?} triangle",
                        config.triangular
                    )));
                }
                let (lb, ub) = (sigma_bounds.lower[(row, col)], sigma_bounds.upper[(row, col)]);
                if lb == ub {
                    fixed_sigma[(row, col)] = lb;
                    continue;
                }
                free.push(ParameterKind::Sigma { row, col }, value, (lb, ub))?;
            }
        }

        for col in 0..demographics {
            for row in 0..k2 {
                let value = pi[(row, col)];
                if value == 0.0 {
                    continue;
                }
                let (lb, ub) = (pi_bounds.lower[(row, col)], pi_bounds.upper[(row, col)]);
                if lb == ub {
                    fixed_pi[(row, col)] = lb;
                    continue;
                }
                free.push(ParameterKind::Pi { row, col }, value, (lb, ub))?;
            }
        }

        let mut fixed_rho = DVector::zeros(groups);
        for (index, value) in rho_config.iter().enumerate() {
            if *value == 0.0 {
                continue;
            }
            let (lb, ub) = (rho_bounds.lower[(index, 0)], rho_bounds.upper[(index, 0)]);
            if lb == ub {
                if shared_rho {
                    fixed_rho.fill(lb);
                } else {
                    fixed_rho[index] = lb;
                }
                continue;
            }
            let group = if shared_rho { None } else { Some(index) };
            free.push(ParameterKind::Rho { group }, *value, (lb, ub))?;
        }

        let mut fixed_beta = DVector::zeros(k1);
        let mut concentrated_beta = Vec::new();
        for (index, entry) in beta.iter().enumerate() {
            match entry {
                None => concentrated_beta.push(index),
                Some(value) if *value == 0.0 => {}
                Some(value) => {
                    let (lb, ub) = (beta_bounds.lower[(index, 0)], beta_bounds.upper[(index, 0)]);
                    if lb == ub {
                        fixed_beta[index] = lb;
                        continue;
                    }
                    free.push(ParameterKind::Beta { index }, *value, (lb, ub))?;
                }
            }
        }

        let mut fixed_gamma = DVector::zeros(k3);
        let mut concentrated_gamma = Vec::new();
        for (index, entry) in gamma.iter().enumerate() {
            match entry {
                None => concentrated_gamma.push(index),
                Some(value) if *value == 0.0 => {}
                Some(value) => {
                    let (lb, ub) =
                        (gamma_bounds.lower[(index, 0)], gamma_bounds.upper[(index, 0)]);
                    if lb == ub {
                        fixed_gamma[index] = lb;
                        continue;
                    }
                    free.push(ParameterKind::Gamma { index }, *value, (lb, ub))?;
                }
            }
        }

        Ok(Self {
            kinds: free.kinds,
            start: DVector::from_vec(free.start),
            lower: DVector::from_vec(free.lower),
            upper: DVector::from_vec(free.upper),
            fixed: ParameterValues {
                sigma: fixed_sigma,
                pi: fixed_pi,
                rho: fixed_rho,
                beta: fixed_beta,
                gamma: fixed_gamma,
            },
            concentrated_beta,
            concentrated_gamma,
            shared_rho,
        })
    }

    /// Number of elements in `theta` (`P`).
    pub fn count(&self) -> usize {
        self.kinds.len()
    }

    /// What each element of `theta` controls.
    pub fn kinds(&self) -> &[ParameterKind] {
        &self.kinds
    }

    /// Starting values taken from the configuration.
    pub fn start(&self) -> &DVector<f64> {
        &self.start
    }

    /// Lower bounds of `theta`.
    pub fn lower_bounds(&self) -> &DVector<f64> {
        &self.lower
    }

    /// Upper bounds of `theta`.
    pub fn upper_bounds(&self) -> &DVector<f64> {
        &self.upper
    }

    /// Indices of `beta` estimated by the linear IV step.
    pub fn concentrated_beta(&self) -> &[usize] {
        &self.concentrated_beta
    }

    /// Indices of `gamma` estimated by the linear IV step.
    pub fn concentrated_gamma(&self) -> &[usize] {
        &self.concentrated_gamma
    }

    /// Whether `beta[index]` is an element of `theta`.
    pub fn beta_in_theta(&self, index: usize) -> bool {
        self.kinds
            .iter()
            .any(|kind| matches!(kind, ParameterKind::Beta { index: i } if *i == index))
    }

    /// Identifies the model variant implied by the configured (fixed and free) parameters.
    pub fn variant(&self) -> ModelVariant {
        let random = self.fixed.has_random_coefficients()
            || self
                .kinds
                .iter()
                .any(|k| matches!(k, ParameterKind::Sigma { .. } | ParameterKind::Pi { .. }));
        let nested = self.fixed.has_nesting()
            || self.kinds.iter().any(|k| matches!(k, ParameterKind::Rho { .. }));
        match (random, nested) {
            (false, false) => ModelVariant::Logit,
            (false, true) => ModelVariant::NestedLogit,
            (true, false) => ModelVariant::RandomCoefficients,
            (true, true) => ModelVariant::RandomCoefficientsNested,
        }
    }

    /// Rejects `theta` values outside their bounds, or of the wrong length.
    pub fn check_bounds(&self, theta: &DVector<f64>) -> Result<()> {
        if theta.len() != self.count() {
            return Err(BlpError::dimension_mismatch("theta length", self.count(), theta.len()));
        }
        for (index, value) in theta.iter().enumerate() {
            let (lower, upper) = (self.lower[index], self.upper[index]);
            if !value.is_finite() || *value < lower || *value > upper {
                return Err(BlpError::ThetaOutOfBounds {
                    index,
                    value: *value,
                    lower,
                    upper,
                });
            }
        }
        Ok(())
    }

    /// Expands `theta` into full parameter values, validating bounds and nesting domain.
    pub fn expand(&self, theta: &DVector<f64>) -> Result<ParameterValues> {
        self.check_bounds(theta)?;
        let mut values = self.fixed.clone();
        for (kind, value) in self.kinds.iter().zip(theta.iter()) {
            match *kind {
                ParameterKind::Sigma { row, col } => values.sigma[(row, col)] = *value,
                ParameterKind::Pi { row, col } => values.pi[(row, col)] = *value,
                ParameterKind::Rho { group: None } => values.rho.fill(*value),
                ParameterKind::Rho { group: Some(g) } => values.rho[g] = *value,
                ParameterKind::Beta { index } => values.beta[index] = *value,
                ParameterKind::Gamma { index } => values.gamma[index] = *value,
            }
        }
        values.validate_rho()?;
        Ok(values)
    }

    /// Extracts `theta` from full parameter values.
    pub fn compress(&self, values: &ParameterValues) -> DVector<f64> {
        DVector::from_iterator(
            self.kinds.len(),
            self.kinds.iter().map(|kind| match *kind {
                ParameterKind::Sigma { row, col } => values.sigma[(row, col)],
                ParameterKind::Pi { row, col } => values.pi[(row, col)],
                ParameterKind::Rho { group: None } => values.rho.get(0).copied().unwrap_or(0.0),
                ParameterKind::Rho { group: Some(g) } => values.rho[g],
                ParameterKind::Beta { index } => values.beta[index],
                ParameterKind::Gamma { index } => values.gamma[index],
            }),
        )
    }

    /// Whether a single `rho` is shared by all nesting groups.
    pub fn shared_rho(&self) -> bool {
        self.shared_rho
    }
}

fn expand_linear(
    config: &[Option<f64>],
    size: usize,
    context: &'static str,
) -> Result<Vec<Option<f64>>> {
    if config.is_empty() {
        return Ok(vec![None; size]);
    }
    if config.len() != size {
        return Err(BlpError::dimension_mismatch(context, size, config.len()));
    }
    Ok(config.to_vec())
}

fn resolve_bounds<F>(
    bounds: Option<&MatrixBounds>,
    rows: usize,
    cols: usize,
    context: &'static str,
    default: F,
) -> Result<MatrixBounds>
where
    F: Fn(usize, usize) -> (f64, f64),
{
    match bounds {
        Some(bounds) => {
            for matrix in [&bounds.lower, &bounds.upper] {
                if matrix.nrows() != rows || matrix.ncols() != cols {
                    return Err(BlpError::dimension_mismatch(context, rows * cols, matrix.len()));
                }
            }
            let mut resolved = bounds.clone();
            resolved.lower.apply(|v| {
                if v.is_nan() {
                    *v = f64::NEG_INFINITY
                }
            });
            resolved.upper.apply(|v| {
                if v.is_nan() {
                    *v = f64::INFINITY
                }
            });
            Ok(resolved)
        }
        None => Ok(MatrixBounds {
            lower: DMatrix::from_fn(rows, cols, |r, c| default(r, c).0),
            upper: DMatrix::from_fn(rows, cols, |r, c| default(r, c).1),
        }),
    }
}

/// Free parameters in `theta` order.
#[derive(Default)]
struct FreeParameters {
    kinds: Vec<ParameterKind>,
    start: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl FreeParameters {
    fn push(&mut self, kind: ParameterKind, value: f64, (lb, ub): (f64, f64)) -> Result<()> {
        if lb > ub || value < lb || value > ub {
            return Err(BlpError::invalid_configuration(format!(
                "starting value {value} of {kind:?} is outside its bounds [{lb}, {ub}]"
            )));
        }
        self.kinds.push(kind);
        self.start.push(value);
        self.lower.push(lb);
        self.upper.push(ub);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_sigma_pi_and_shared_rho() {
        let sigma = DMatrix::from_row_slice(2, 2, &[0.5, 0.1, 0.0, 0.0]);
        let pi = DMatrix::from_row_slice(2, 1, &[0.0, 2.0]);
        let config = ParameterConfig::new()
            .sigma(sigma)
            .pi(pi)
            .rho(DVector::from_vec(vec![0.3]));
        let parameters = Parameters::new(&config, 2, 2, 0, 1, 3).unwrap();

        assert_eq!(parameters.count(), 4);
        assert_eq!(
            parameters.kinds(),
            &[
                ParameterKind::Sigma { row: 0, col: 0 },
                ParameterKind::Sigma { row: 0, col: 1 },
                ParameterKind::Pi { row: 1, col: 0 },
                ParameterKind::Rho { group: None },
            ]
        );
        assert_eq!(parameters.variant(), ModelVariant::RandomCoefficientsNested);
        assert_eq!(parameters.lower_bounds()[0], 0.0);
        assert_eq!(parameters.upper_bounds()[3], DEFAULT_RHO_UPPER_BOUND);

        let theta = DVector::from_vec(vec![0.7, -0.2, 1.5, 0.4]);
        let values = parameters.expand(&theta).unwrap();
        assert_eq!(values.sigma[(0, 1)], -0.2);
        assert_eq!(values.pi[(1, 0)], 1.5);
        assert_eq!(values.rho.as_slice(), &[0.4, 0.4, 0.4]);
        assert_eq!(parameters.compress(&values), theta);
        assert_eq!(parameters.concentrated_beta(), &[0, 1]);
    }

    #[test]
    fn rejects_entries_outside_triangle_and_bounds() {
        let sigma = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.3, 1.0]);
        let upper = Parameters::new(&ParameterConfig::new().sigma(sigma.clone()), 1, 2, 0, 0, 0);
        assert!(matches!(upper, Err(BlpError::InvalidConfiguration { .. })));

        let lower = Parameters::new(
            &ParameterConfig::new()
                .sigma(sigma)
                .triangular(Triangular::Lower),
            1,
            2,
            0,
            0,
            0,
        )
        .unwrap();
        assert_eq!(lower.count(), 3);

        let theta = DVector::from_vec(vec![-1.0, 0.3, 1.0]);
        assert!(matches!(
            lower.expand(&theta),
            Err(BlpError::ThetaOutOfBounds { index: 0, .. })
        ));
    }

    #[test]
    fn equal_bounds_fix_values_and_linear_parameters_enter_theta() {
        let sigma = DMatrix::from_row_slice(1, 1, &[2.0]);
        let config = ParameterConfig::new()
            .sigma(sigma)
            .sigma_bounds(DMatrix::from_element(1, 1, 2.0), DMatrix::from_element(1, 1, 2.0))
            .beta(vec![None, Some(-1.0)]);
        let parameters = Parameters::new(&config, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(parameters.kinds(), &[ParameterKind::Beta { index: 1 }]);
        assert_eq!(parameters.variant(), ModelVariant::RandomCoefficients);
        assert!(parameters.beta_in_theta(1));

        let values = parameters.expand(&DVector::from_vec(vec![-3.0])).unwrap();
        assert_eq!(values.sigma[(0, 0)], 2.0);
        assert_eq!(values.beta[1], -3.0);
    }

    #[test]
    fn rho_at_one_is_a_domain_error() {
        let config = ParameterConfig::new()
            .rho(DVector::from_vec(vec![0.5, 0.5]))
            .rho_bounds(DVector::from_vec(vec![0.0, 0.0]), DVector::from_vec(vec![1.0, 1.0]));
        let parameters = Parameters::new(&config, 1, 0, 0, 0, 2).unwrap();
        assert_eq!(parameters.variant(), ModelVariant::NestedLogit);
        let result = parameters.expand(&DVector::from_vec(vec![0.5, 1.0]));
        assert!(matches!(
            result,
            Err(BlpError::NestingParameterOutOfRange { index: 1, .. })
        ));
    }
}
