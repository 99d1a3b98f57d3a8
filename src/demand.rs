//! Demand-side primitives: the BLP contraction mapping and the implicit `delta` Jacobian.

use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::error::{BlpError, Result};
use crate::linalg;
use crate::market::Market;
use crate::parameters::ParameterKind;
use crate::shares::{AgentUtilities, ChoiceState};
use crate::solving::{sup_norm, ContractionOptions, ContractionSummary};

/// Mean utilities that reproduce observed shares in one market.
#[derive(Clone, Debug)]
pub struct DeltaSolution {
    pub delta: DVector<f64>,
    pub summary: ContractionSummary,
}

/// Closed-form (nested) logit mean utilities:
/// `log s_j - log s_0 - rho_j (log s_j - log s_h(j))`.
pub fn logit_delta(market: &Market, product_rho: &DVector<f64>) -> DVector<f64> {
    let outside = market.outside_share().ln();
    let within = market.observed_group_shares();
    DVector::from_iterator(
        market.product_count(),
        market.shares.iter().enumerate().map(|(j, share)| {
            let log_share = share.ln();
            log_share - outside - product_rho[j] * (log_share - within[j].ln())
        }),
    )
}

/// Solves `s(delta) = S` for one market.
///
/// Without agent heterogeneity the closed form is returned directly. Otherwise the
/// contraction starts from `start` (or the closed form), and one restart from a fallback
/// guess is attempted before reporting non-convergence.
pub fn solve_delta(
    market: &Market,
    utility: &AgentUtilities,
    start: Option<&DVector<f64>>,
    options: &ContractionOptions,
) -> Result<DeltaSolution> {
    let closed_form = logit_delta(market, &utility.rho);
    if utility.mu.iter().all(|value| *value == 0.0) {
        return Ok(DeltaSolution {
            delta: closed_form,
            summary: ContractionSummary::default(),
        });
    }

    let (initial, fallback) = match start {
        Some(start)
            if start.len() == market.product_count() && start.iter().all(|v| v.is_finite()) =>
        {
            (start.clone(), closed_form)
        }
        _ => {
            let zeros = DVector::zeros(market.product_count());
            (closed_form, zeros)
        }
    };

    match contract(market, utility, initial, options) {
        Ok(solution) => Ok(solution),
        Err(error) if error.kind() != crate::error::ErrorKind::Configuration => {
            warn!(
                "delta contraction failed in market {} ({error}); restarting from fallback values",
                market.id()
            );
            let mut solution = contract(market, utility, fallback, options)?;
            solution.summary.restarted = true;
            Ok(solution)
        }
        Err(error) => Err(error),
    }
}

fn contract(
    market: &Market,
    utility: &AgentUtilities,
    mut delta: DVector<f64>,
    options: &ContractionOptions,
) -> Result<DeltaSolution> {
    let log_observed = market.shares.map(f64::ln);
    let scale = utility.rho.map(|rho| options.damping * (1.0 - rho));
    let mut previous_gap = f64::INFINITY;
    let mut max_gap = f64::INFINITY;
    let mut newton_steps = 0usize;

    for iteration in 1..=options.max_iterations {
        let state = ChoiceState::new(market, utility, &delta)?;
        let predicted = state.shares();
        let log_predicted = predicted.map(|s| s.max(options.minimum_share).ln());
        let mut step = (&log_observed - log_predicted).component_mul(&scale);

        if let Some(hybrid) = &options.hybrid {
            let stalled =
                iteration > hybrid.warmup && sup_norm(&step) > hybrid.stall_ratio * previous_gap;
            if stalled {
                let residual = &market.shares - predicted;
                let jacobian = state.delta_jacobian();
                if let Ok(newton) = linalg::solve_vector(&jacobian, &residual, "share Jacobian") {
                    step = newton;
                    newton_steps += 1;
                }
            }
        }

        max_gap = sup_norm(&step);
        if !max_gap.is_finite() {
            return Err(BlpError::NumericalError {
                context: "delta contraction",
            });
        }
        delta += step;
        if max_gap < options.tolerance {
            return Ok(DeltaSolution {
                delta,
                summary: ContractionSummary {
                    iterations: iteration,
                    max_gap,
                    newton_steps,
                    restarted: false,
                },
            });
        }
        previous_gap = max_gap;
    }

    Err(BlpError::ContractionDidNotConverge {
        market_id: market.id().to_string(),
        iterations: options.max_iterations,
        max_gap,
    })
}

/// `d delta / d theta = -(d s / d delta)^-1 d s / d theta` by the implicit function theorem.
pub fn delta_by_theta(state: &ChoiceState<'_>, kinds: &[ParameterKind]) -> Result<DMatrix<f64>> {
    let by_theta = state.theta_jacobian(kinds);
    if by_theta.iter().all(|v| *v == 0.0) {
        return Ok(by_theta);
    }
    let solved = linalg::solve(&state.delta_jacobian(), &by_theta, "share Jacobian")?;
    Ok(-solved)
}

/// `d xi / d theta`: the `delta` Jacobian, less `X1` columns for linear parameters in `theta`.
pub fn xi_by_theta(
    market: &Market,
    d_delta: &DMatrix<f64>,
    kinds: &[ParameterKind],
) -> DMatrix<f64> {
    let mut jacobian = d_delta.clone();
    for (p, kind) in kinds.iter().enumerate() {
        if let ParameterKind::Beta { index } = kind {
            jacobian.set_column(p, &(-market.x1.column(*index)));
        }
    }
    jacobian
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ProductDataBuilder;
    use crate::market::fixtures;
    use crate::parameters::ParameterValues;
    use crate::solving::HybridNewton;
    use approx::assert_relative_eq;

    fn options() -> ContractionOptions {
        ContractionOptions::default().with_tolerance(1e-12)
    }

    fn three_product_market() -> Market {
        let data = ProductDataBuilder::new(
            vec!["m".to_string(); 3],
            DVector::from_vec(vec![0.5, 0.3, 0.1]),
        )
        .x1(DMatrix::from_element(3, 1, 1.0))
        .build()
        .unwrap();
        Market::new(&data, None, 0).unwrap()
    }

    fn logit_values() -> ParameterValues {
        ParameterValues {
            sigma: DMatrix::zeros(0, 0),
            pi: DMatrix::zeros(0, 0),
            rho: DVector::zeros(0),
            beta: DVector::zeros(1),
            gamma: DVector::zeros(0),
        }
    }

    #[test]
    fn pure_logit_uses_the_closed_form() {
        let market = three_product_market();
        let utility = AgentUtilities::new(&market, &logit_values()).unwrap();
        let solution = solve_delta(&market, &utility, None, &options()).unwrap();
        assert_eq!(solution.summary.iterations, 0);
        let expected = DVector::from_vec(vec![5.0f64.ln(), 3.0f64.ln(), 0.0]);
        assert_relative_eq!(solution.delta, expected, epsilon = 1e-12);
        assert_relative_eq!(solution.delta[0], 1.609, epsilon = 1e-3);
        assert_relative_eq!(solution.delta[1], 1.099, epsilon = 1e-3);

        let state = ChoiceState::new(&market, &utility, &solution.delta).unwrap();
        assert_relative_eq!(state.shares().clone(), market.shares().clone(), epsilon = 1e-14);
    }

    #[test]
    fn random_coefficients_contraction_reproduces_shares_and_is_idempotent() {
        for nested in [false, true] {
            let market = fixtures::market(nested);
            let values = fixtures::values(nested);
            let utility = AgentUtilities::new(&market, &values).unwrap();
            let solution = solve_delta(&market, &utility, None, &options()).unwrap();
            assert!(solution.summary.iterations > 1);

            let state = ChoiceState::new(&market, &utility, &solution.delta).unwrap();
            assert_relative_eq!(state.shares().clone(), market.shares().clone(), epsilon = 1e-11);

            let again = solve_delta(&market, &utility, Some(&solution.delta), &options()).unwrap();
            assert!(again.summary.iterations <= 1);
            assert_relative_eq!(again.delta, solution.delta, epsilon = 1e-11);
        }
    }

    #[test]
    fn hybrid_newton_reaches_the_same_fixed_point() {
        let market = fixtures::market(true);
        let values = fixtures::values(true);
        let utility = AgentUtilities::new(&market, &values).unwrap();
        let plain = solve_delta(&market, &utility, None, &options()).unwrap();
        let hybrid = options().with_hybrid(HybridNewton {
            warmup: 1,
            stall_ratio: 0.0,
        });
        let newton = solve_delta(&market, &utility, None, &hybrid).unwrap();
        assert!(newton.summary.newton_steps > 0);
        assert!(newton.summary.iterations < plain.summary.iterations);
        assert_relative_eq!(newton.delta, plain.delta, epsilon = 1e-10);
    }

    #[test]
    fn exhausted_iterations_report_non_convergence() {
        let market = fixtures::market(false);
        let values = fixtures::values(false);
        let utility = AgentUtilities::new(&market, &values).unwrap();
        let tight = options().with_max_iterations(2);
        match solve_delta(&market, &utility, None, &tight) {
            Err(BlpError::ContractionDidNotConverge {
                market_id,
                iterations,
                ..
            }) => {
                assert_eq!(market_id, "t");
                assert_eq!(iterations, 2);
            }
            other => panic!("expected non-convergence, got {other:?}"),
        }
    }

    #[test]
    fn delta_by_theta_matches_finite_differences() {
        let market = fixtures::market(true);
        let values = fixtures::values(true);
        let kinds = [
            ParameterKind::Sigma { row: 0, col: 0 },
            ParameterKind::Pi { row: 1, col: 0 },
            ParameterKind::Rho { group: Some(1) },
        ];
        let utility = AgentUtilities::new(&market, &values).unwrap();
        let solution = solve_delta(&market, &utility, None, &options()).unwrap();
        let state = ChoiceState::new(&market, &utility, &solution.delta).unwrap();
        let analytic = delta_by_theta(&state, &kinds).unwrap();

        let step = 1e-5;
        for (p, kind) in kinds.iter().enumerate() {
            let solve_at = |h: f64| {
                let mut shifted = values.clone();
                match *kind {
                    ParameterKind::Sigma { row, col } => shifted.sigma[(row, col)] += h,
                    ParameterKind::Pi { row, col } => shifted.pi[(row, col)] += h,
                    ParameterKind::Rho { group: Some(g) } => shifted.rho[g] += h,
                    _ => unreachable!(),
                }
                let utility = AgentUtilities::new(&market, &shifted).unwrap();
                solve_delta(&market, &utility, Some(&solution.delta), &options())
                    .unwrap()
                    .delta
            };
            let numeric = (solve_at(step) - solve_at(-step)) / (2.0 * step);
            assert_relative_eq!(analytic.column(p).into_owned(), numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn xi_by_theta_subtracts_linear_characteristics() {
        let market = fixtures::market(false);
        let kinds = [ParameterKind::Sigma { row: 0, col: 0 }, ParameterKind::Beta { index: 1 }];
        let d_delta = DMatrix::from_element(4, 2, 0.25);
        let jacobian = xi_by_theta(&market, &d_delta, &kinds);
        assert_eq!(jacobian[(0, 0)], 0.25);
        assert_eq!(jacobian[(2, 1)], -fixtures::PRICES[2]);
    }
}
