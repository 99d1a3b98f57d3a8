//! Configuration structures for problem solving and GMM estimation.
//!
//! Every structure implements `Default` with documented values and `serde` traits, so
//! a configuration can be written to or read from JSON (or any serde format) by the
//! caller. Fields omitted from a serialized configuration take their defaults.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

pub use crate::cache::DeltaBehavior;
pub use crate::solving::{ContractionOptions, HybridNewton, PriceIterationOptions};
pub use crate::supply::{CostsOptions, CostsType};
pub use crate::weighting::CovarianceType;

/// Objective value reported for failed evaluations under [`ErrorBehavior::Punish`], and
/// under [`ErrorBehavior::Revert`] before any evaluation has succeeded.
pub const DEFAULT_PUNISHMENT: f64 = 1e10;

/// What the objective reports to the optimizer when an evaluation fails.
///
/// Failed evaluations are flagged to the optimizer, which never reports convergence
/// at such a point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ErrorBehavior {
    /// Return `value` with a zero gradient so the optimizer backs away.
    Punish { value: f64 },
    /// Return the last successful objective value times `scale` and its gradient.
    Revert { scale: f64 },
    /// Return [`BlpError::EvaluationFailed`](crate::error::BlpError::EvaluationFailed).
    Raise,
}

impl Default for ErrorBehavior {
    fn default() -> Self {
        Self::Punish {
            value: DEFAULT_PUNISHMENT,
        }
    }
}

/// Number of GMM steps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GmmMethod {
    /// Estimate once with the initial weighting matrix.
    OneStep,
    /// Re-estimate with `W = S^-1` computed from the first-step residuals.
    #[default]
    TwoStep,
}

impl GmmMethod {
    pub fn steps(self) -> usize {
        match self {
            Self::OneStep => 1,
            Self::TwoStep => 2,
        }
    }
}

/// Controls the GMM steps and the weighting and covariance estimators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmmOptions {
    pub method: GmmMethod,
    /// Initial weighting matrix; the 2SLS weighting matrix when `None`.
    pub initial_weighting: Option<DMatrix<f64>>,
    /// Estimator of `S` used to update `W` between steps.
    pub weighting_type: CovarianceType,
    /// Estimator of `S` used for standard errors.
    pub se_type: CovarianceType,
    /// Center moments before computing `S` for weighting updates.
    pub center_moments: bool,
    /// Added to the micro moment block of `S`.
    pub extra_micro_covariances: Option<DMatrix<f64>>,
    /// Compute the finite-difference Hessian of the objective at the final estimates.
    pub compute_hessian: bool,
}

impl Default for GmmOptions {
    fn default() -> Self {
        Self {
            method: GmmMethod::TwoStep,
            initial_weighting: None,
            weighting_type: CovarianceType::Robust,
            se_type: CovarianceType::Robust,
            center_moments: true,
            extra_micro_covariances: None,
            compute_hessian: true,
        }
    }
}

/// Aggregated configuration used when solving a [`Problem`](crate::Problem).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProblemOptions {
    /// Configuration for the contraction mapping that recovers mean utilities.
    pub contraction: ContractionOptions,
    /// Configuration for equilibrium price iteration in post-estimation.
    pub prices: PriceIterationOptions,
    pub costs: CostsOptions,
    pub gmm: GmmOptions,
    pub error_behavior: ErrorBehavior,
    pub delta_behavior: DeltaBehavior,
}

impl ProblemOptions {
    /// Override the contraction settings while preserving other defaults.
    pub fn with_contraction(mut self, contraction: ContractionOptions) -> Self {
        self.contraction = contraction;
        self
    }

    pub fn with_prices(mut self, prices: PriceIterationOptions) -> Self {
        self.prices = prices;
        self
    }

    pub fn with_costs(mut self, costs: CostsOptions) -> Self {
        self.costs = costs;
        self
    }

    /// Override the GMM configuration as a whole.
    pub fn with_gmm(mut self, gmm: GmmOptions) -> Self {
        self.gmm = gmm;
        self
    }

    pub fn with_method(mut self, method: GmmMethod) -> Self {
        self.gmm.method = method;
        self
    }

    /// Use a fixed initial weighting matrix instead of the 2SLS one.
    pub fn with_initial_weighting(mut self, weighting: DMatrix<f64>) -> Self {
        self.gmm.initial_weighting = Some(weighting);
        self
    }

    pub fn with_weighting_type(mut self, weighting_type: CovarianceType) -> Self {
        self.gmm.weighting_type = weighting_type;
        self
    }

    pub fn with_se_type(mut self, se_type: CovarianceType) -> Self {
        self.gmm.se_type = se_type;
        self
    }

    pub fn with_center_moments(mut self, center: bool) -> Self {
        self.gmm.center_moments = center;
        self
    }

    pub fn with_extra_micro_covariances(mut self, covariances: DMatrix<f64>) -> Self {
        self.gmm.extra_micro_covariances = Some(covariances);
        self
    }

    pub fn with_compute_hessian(mut self, compute: bool) -> Self {
        self.gmm.compute_hessian = compute;
        self
    }

    pub fn with_error_behavior(mut self, behavior: ErrorBehavior) -> Self {
        self.error_behavior = behavior;
        self
    }

    pub fn with_delta_behavior(mut self, behavior: DeltaBehavior) -> Self {
        self.delta_behavior = behavior;
        self
    }
}
