//! Fixed-point solver configuration and diagnostics shared by the delta and price solvers.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Configuration for the BLP fixed-point contraction that recovers mean utilities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractionOptions {
    /// Supremum norm tolerance on the `delta` update.
    pub tolerance: f64,
    /// Maximum number of iterations allowed before aborting.
    pub max_iterations: usize,
    /// Damping factor applied to the log-share update (1.0 is standard BLP).
    pub damping: f64,
    /// Lower bound enforced on predicted shares to avoid taking `ln(0)`.
    pub minimum_share: f64,
    /// Switch to Newton steps once the contraction stalls; disabled when `None`.
    pub hybrid: Option<HybridNewton>,
}

impl Default for ContractionOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-14,
            max_iterations: 1_000,
            damping: 1.0,
            minimum_share: 1e-300,
            hybrid: None,
        }
    }
}

impl ContractionOptions {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_hybrid(mut self, hybrid: HybridNewton) -> Self {
        self.hybrid = Some(hybrid);
        self
    }
}

/// When the contraction counts as stalled.
///
/// After `warmup` contraction iterations, any iteration whose update shrinks by less than
/// `stall_ratio` relative to the previous one is replaced by a Newton step on
/// `s(delta) = S`. A singular share Jacobian falls back to the contraction step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridNewton {
    pub warmup: usize,
    pub stall_ratio: f64,
}

impl Default for HybridNewton {
    fn default() -> Self {
        Self {
            warmup: 10,
            stall_ratio: 0.9,
        }
    }
}

/// Diagnostics returned alongside the contracted mean utilities.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractionSummary {
    /// Number of iterations performed (zero for closed-form solutions).
    pub iterations: usize,
    /// Maximum absolute change observed in the final iteration.
    pub max_gap: f64,
    /// How many of the iterations were Newton steps.
    pub newton_steps: usize,
    /// Whether the solution came from the fallback starting values.
    pub restarted: bool,
}

/// Configuration for the zeta-markup contraction that recovers equilibrium prices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceIterationOptions {
    /// Tolerance on the supremum norm of `Lambda (p - c - zeta)`.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for PriceIterationOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-12,
            max_iterations: 1_000,
        }
    }
}

impl PriceIterationOptions {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// Diagnostics from one market's price contraction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSummary {
    pub iterations: usize,
    /// Norm of the first-order-condition residual at termination.
    pub residual: f64,
}

/// Supremum norm that treats any non-finite entry as infinite.
pub(crate) fn sup_norm(vector: &DVector<f64>) -> f64 {
    vector.iter().fold(0.0f64, |norm, value| {
        if value.is_finite() {
            norm.max(value.abs())
        } else {
            f64::INFINITY
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sup_norm_flags_non_finite_entries() {
        assert_eq!(sup_norm(&DVector::from_vec(vec![0.5, -2.0])), 2.0);
        assert_eq!(sup_norm(&DVector::from_vec(vec![0.5, f64::NAN])), f64::INFINITY);
    }

    #[test]
    fn partial_configuration_fills_defaults() {
        let options: ContractionOptions =
            serde_json::from_str(r#"{"tolerance": 1e-10, "hybrid": {"warmup": 3}}"#).unwrap();
        assert_eq!(options.tolerance, 1e-10);
        assert_eq!(options.max_iterations, 1_000);
        assert_eq!(
            options.hybrid,
            Some(HybridNewton {
                warmup: 3,
                stall_ratio: 0.9
            })
        );
    }
}
