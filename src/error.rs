use thiserror::Error;

/// Unified error type for `blpgmm` operations.
#[derive(Debug, Error)]
pub enum BlpError {
    /// An input or intermediate array has the wrong length or shape.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    /// A market's products are split across more than one block.
    #[error(
        "market identifiers must appear in contiguous blocks; market `{market_id}` is split"
    )]
    NonContiguousMarket { market_id: String },

    /// Observed shares must be strictly positive.
    #[error("product share at index {index} must be positive, found {share}")]
    NonPositiveShare { index: usize, share: f64 },

    /// Inside shares of a market sum to one or more.
    #[error("outside share for market `{market_id}` must be positive, found {share}")]
    NonPositiveOutsideShare { market_id: String, share: f64 },

    /// Agent weights of a market are non-positive or do not sum to one.
    #[error(
        "weights in market `{market_id}` must be strictly positive and sum to one (slack {slack})"
    )]
    InvalidWeights { market_id: String, slack: f64 },

    /// Raised when an ownership matrix is not symmetric with a unit diagonal.
    #[error("ownership matrix for market `{market_id}` is invalid: {reason}")]
    InvalidOwnership {
        market_id: String,
        reason: &'static str,
    },

    /// Raised when a configuration is inconsistent with the data it will be applied to.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// Raised when linear algebra operations encounter a singular or near-singular system.
    #[error(
        "matrix in {context} is singular or near-singular (condition number {condition_number:e})"
    )]
    SingularMatrix {
        context: &'static str,
        /// Ratio of the largest to the smallest singular value; infinite for exact singularity.
        condition_number: f64,
    },

    /// Raised when the mean utility contraction fails to meet the tolerance.
    #[error(
        "delta contraction in market `{market_id}` did not converge after {iterations} \
         iterations; last max gap {max_gap}"
    )]
    ContractionDidNotConverge {
        market_id: String,
        iterations: usize,
        /// Sup norm of the final update.
        max_gap: f64,
    },

    /// Raised when the zeta-markup price contraction fails to meet the tolerance.
    #[error(
        "price contraction in market `{market_id}` did not converge after {iterations} \
         iterations; last FOC norm {max_gap}"
    )]
    PriceContractionDidNotConverge {
        market_id: String,
        iterations: usize,
        max_gap: f64,
    },

    /// Raised when a nesting parameter leaves `[0, 1)`, where the inclusive value is
    /// undefined.
    #[error("nesting parameter {index} must lie in [0, 1), found {value}")]
    NestingParameterOutOfRange { index: usize, value: f64 },

    /// Raised when log-linear costs meet a non-positive marginal cost that was not clipped.
    #[error(
        "marginal cost of product {index} must be positive under log-linear costs, found {value}"
    )]
    NonPositiveCosts { index: usize, value: f64 },

    /// Raised when the optimizer proposes a parameter outside its bounds.
    #[error("theta[{index}] = {value} lies outside its bounds [{lower}, {upper}]")]
    ThetaOutOfBounds {
        index: usize,
        value: f64,
        lower: f64,
        upper: f64,
    },

    /// Raised when numerical routines produce NaN or infinities.
    #[error("encountered a non-finite value during {context}")]
    NumericalError { context: &'static str },

    /// A required input (agents, prices, firm ids, a price column) is absent.
    #[error("missing required component: {component}")]
    MissingComponent { component: &'static str },

    /// Raised at the optimizer boundary when evaluation errors are configured to propagate.
    #[error("objective evaluation failed: {source}")]
    EvaluationFailed {
        #[source]
        source: Box<BlpError>,
    },
}

/// Coarse classification of [`BlpError`] used to decide on recovery policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A delta or price contraction ran out of iterations.
    NonConvergence,
    /// A matrix that had to be inverted was singular or near-singular.
    SingularMatrix,
    /// A value left the domain of a formula (nesting parameters, log costs, bounds).
    Domain,
    /// Inputs or configuration are inconsistent; fatal at setup.
    Configuration,
    /// An objective evaluation failed and the failure was escalated.
    Evaluation,
}

impl BlpError {
    /// Shorthand for [`BlpError::DimensionMismatch`].
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Shorthand for [`BlpError::SingularMatrix`].
    pub fn singular(context: &'static str, condition_number: f64) -> Self {
        Self::SingularMatrix {
            context,
            condition_number,
        }
    }

    /// Shorthand for [`BlpError::MissingComponent`].
    pub fn missing_component(component: &'static str) -> Self {
        Self::MissingComponent { component }
    }

    /// Helper for configuration errors that carry a formatted reason.
    pub fn invalid_configuration<S: Into<String>>(reason: S) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    /// Classifies the error for callers that apply per-kind policies.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ContractionDidNotConverge { .. }
            | Self::PriceContractionDidNotConverge { .. } => ErrorKind::NonConvergence,
            Self::SingularMatrix { .. } => ErrorKind::SingularMatrix,
            Self::NestingParameterOutOfRange { .. }
            | Self::NonPositiveCosts { .. }
            | Self::ThetaOutOfBounds { .. }
            | Self::NumericalError { .. } => ErrorKind::Domain,
            Self::EvaluationFailed { .. } => ErrorKind::Evaluation,
            Self::DimensionMismatch { .. }
            | Self::NonContiguousMarket { .. }
            | Self::NonPositiveShare { .. }
            | Self::NonPositiveOutsideShare { .. }
            | Self::InvalidWeights { .. }
            | Self::InvalidOwnership { .. }
            | Self::InvalidConfiguration { .. }
            | Self::MissingComponent { .. } => ErrorKind::Configuration,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BlpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        let err = BlpError::singular("X'ZWZ'X", 1e17);
        assert_eq!(err.kind(), ErrorKind::SingularMatrix);
        assert!(err.to_string().contains("X'ZWZ'X"));

        let err = BlpError::NestingParameterOutOfRange {
            index: 0,
            value: 1.0,
        };
        assert_eq!(err.kind(), ErrorKind::Domain);

        let err = BlpError::ContractionDidNotConverge {
            market_id: "m1".into(),
            iterations: 10,
            max_gap: 0.1,
        };
        assert_eq!(err.kind(), ErrorKind::NonConvergence);
        assert_eq!(
            BlpError::missing_component("X1").kind(),
            ErrorKind::Configuration
        );
    }
}
