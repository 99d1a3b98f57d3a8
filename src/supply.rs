//! Supply side: markups implied by Bertrand-Nash pricing, marginal costs, and the
//! Jacobian of the cost-side structural error `omega`.
//!
//! With `Delta = -O .* (d s / d p)'`, markups solve `Delta eta = s` and costs are
//! `c = p - eta`. Costs enter the supply equation linearly or in logs:
//! `c~ = X3 gamma + omega`.

use log::warn;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{BlpError, Result};
use crate::linalg;
use crate::market::Market;
use crate::parameters::ParameterKind;
use crate::shares::ChoiceState;

/// Functional form of marginal costs in the supply equation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostsType {
    /// `c = X3 gamma + omega`.
    #[default]
    Linear,
    /// `log c = X3 gamma + omega`.
    Log,
}

/// How marginal costs are transformed and bounded before entering the supply equation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostsOptions {
    pub costs_type: CostsType,
    /// Costs below this value are clipped to it.
    pub lower_bound: Option<f64>,
    /// Costs above this value are clipped to it.
    pub upper_bound: Option<f64>,
}

impl CostsOptions {
    pub fn log() -> Self {
        Self {
            costs_type: CostsType::Log,
            ..Self::default()
        }
    }

    pub fn with_bounds(mut self, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.lower_bound = lower;
        self.upper_bound = upper;
        self
    }
}

/// Markups and marginal costs for one market.
#[derive(Clone, Debug)]
pub struct MarketCosts {
    /// Markups `eta = p - c` before clipping.
    pub eta: DVector<f64>,
    /// Marginal costs after clipping.
    pub costs: DVector<f64>,
    /// `c` or `log c`, depending on the costs type.
    pub transformed: DVector<f64>,
    pub clipped: Vec<bool>,
    /// `Delta = -O .* (d s / d p)'`.
    capital_delta: DMatrix<f64>,
}

impl MarketCosts {
    pub fn clipped_count(&self) -> usize {
        self.clipped.iter().filter(|c| **c).count()
    }
}

/// Markups `eta = Delta^-1 s` at the probabilities in `state`.
pub fn compute_eta(state: &ChoiceState<'_>, alpha: f64) -> Result<(DVector<f64>, DMatrix<f64>)> {
    let market = state.market();
    let jacobian = state.price_jacobian(alpha);
    let capital_delta = -market.ownership.component_mul(&jacobian.transpose());
    let eta = linalg::solve_vector(&capital_delta, state.shares(), "markup matrix Delta")?;
    Ok((eta, capital_delta))
}

/// Marginal costs implied by observed prices, clipped and transformed per `options`.
pub fn compute_costs(
    state: &ChoiceState<'_>,
    alpha: f64,
    options: &CostsOptions,
) -> Result<MarketCosts> {
    let market = state.market();
    let (eta, capital_delta) = compute_eta(state, alpha)?;
    let mut costs = &market.prices - &eta;
    let mut clipped = vec![false; costs.len()];
    for (j, cost) in costs.iter_mut().enumerate() {
        if let Some(lower) = options.lower_bound {
            if *cost < lower {
                *cost = lower;
                clipped[j] = true;
            }
        }
        if let Some(upper) = options.upper_bound {
            if *cost > upper {
                *cost = upper;
                clipped[j] = true;
            }
        }
    }
    let transformed = match options.costs_type {
        CostsType::Linear => costs.clone(),
        CostsType::Log => {
            if let Some((index, value)) = costs.iter().enumerate().find(|(_, c)| **c <= 0.0) {
                return Err(BlpError::NonPositiveCosts {
                    index: market.products().start + index,
                    value: *value,
                });
            }
            costs.map(f64::ln)
        }
    };
    let count = clipped.iter().filter(|c| **c).count();
    if count > 0 {
        warn!("clipped {count} marginal costs in market {}", market.id());
    }
    Ok(MarketCosts {
        eta,
        costs,
        transformed,
        clipped,
        capital_delta,
    })
}

/// `d omega / d theta` (`J x P`) given the total `delta` Jacobian `d_delta`.
///
/// `d eta = Delta^-1 (O .* dJ') eta`, where `dJ` is the directional derivative of the
/// price Jacobian along each parameter. Rows of clipped costs are zero.
pub fn omega_by_theta(
    state: &ChoiceState<'_>,
    alpha: f64,
    costs: &MarketCosts,
    d_delta: &DMatrix<f64>,
    kinds: &[ParameterKind],
    options: &CostsOptions,
) -> Result<DMatrix<f64>> {
    let market = state.market();
    let j = market.product_count();
    let mut jacobian = DMatrix::zeros(j, kinds.len());
    for (p, kind) in kinds.iter().enumerate() {
        if let ParameterKind::Gamma { index } = kind {
            jacobian.set_column(p, &(-market.x3.column(*index)));
            continue;
        }
        let direction = d_delta.column(p).into_owned();
        let tangent = state.price_jacobian_tangent(alpha, &direction, kind);
        if tangent.iter().all(|v| *v == 0.0) {
            continue;
        }
        let rhs = market.ownership.component_mul(&tangent.transpose()) * &costs.eta;
        let d_eta = linalg::solve_vector(&costs.capital_delta, &rhs, "markup matrix Delta")?;
        let mut column = match options.costs_type {
            CostsType::Linear => -d_eta,
            CostsType::Log => -d_eta.component_div(&costs.costs),
        };
        for (row, clipped) in costs.clipped.iter().enumerate() {
            if *clipped {
                column[row] = 0.0;
            }
        }
        jacobian.set_column(p, &column);
    }
    Ok(jacobian)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ProductDataBuilder;
    use crate::demand::{delta_by_theta, solve_delta};
    use crate::market::fixtures;
    use crate::parameters::ParameterValues;
    use crate::shares::AgentUtilities;
    use crate::solving::ContractionOptions;
    use approx::assert_relative_eq;

    fn monopolist() -> Market {
        let data = ProductDataBuilder::new(vec!["m".to_string()], DVector::from_vec(vec![0.4]))
            .prices(DVector::from_vec(vec![2.0]))
            .x1(DMatrix::from_row_slice(1, 2, &[1.0, 2.0]))
            .x1_price_column(1)
            .build()
            .unwrap();
        Market::new(&data, None, 0).unwrap()
    }

    fn logit_values(alpha: f64) -> ParameterValues {
        ParameterValues {
            sigma: DMatrix::zeros(0, 0),
            pi: DMatrix::zeros(0, 0),
            rho: DVector::zeros(0),
            beta: DVector::from_vec(vec![1.0, alpha]),
            gamma: DVector::zeros(0),
        }
    }

    #[test]
    fn monopolist_markup_matches_logit_formula() {
        let market = monopolist();
        let utility = AgentUtilities::new(&market, &logit_values(-1.5)).unwrap();
        let delta = solve_delta(&market, &utility, None, &ContractionOptions::default())
            .unwrap()
            .delta;
        let state = ChoiceState::new(&market, &utility, &delta).unwrap();
        let costs = compute_costs(&state, -1.5, &CostsOptions::default()).unwrap();
        let expected = -1.0 / (-1.5 * (1.0 - 0.4));
        assert_relative_eq!(costs.eta[0], expected, epsilon = 1e-12);
        assert_relative_eq!(costs.costs[0], 2.0 - expected, epsilon = 1e-12);
    }

    fn costs_at(
        values: &ParameterValues,
        options: &CostsOptions,
        start: &DVector<f64>,
    ) -> DVector<f64> {
        let market = fixtures::market(true);
        let utility = AgentUtilities::new(&market, values).unwrap();
        let tight = ContractionOptions::default().with_tolerance(1e-13);
        let delta = solve_delta(&market, &utility, Some(start), &tight).unwrap().delta;
        let state = ChoiceState::new(&market, &utility, &delta).unwrap();
        compute_costs(&state, values.beta[1], options).unwrap().transformed
    }

    #[test]
    fn omega_by_theta_matches_finite_differences() {
        let market = fixtures::market(true);
        let values = fixtures::values(true);
        let kinds = [
            ParameterKind::Sigma { row: 1, col: 0 },
            ParameterKind::Pi { row: 0, col: 0 },
            ParameterKind::Rho { group: Some(0) },
            ParameterKind::Beta { index: 1 },
            ParameterKind::Gamma { index: 1 },
        ];
        for options in [CostsOptions::default(), CostsOptions::log()] {
            let utility = AgentUtilities::new(&market, &values).unwrap();
            let tight = ContractionOptions::default().with_tolerance(1e-13);
            let delta = solve_delta(&market, &utility, None, &tight).unwrap().delta;
            let state = ChoiceState::new(&market, &utility, &delta).unwrap();
            let costs = compute_costs(&state, values.beta[1], &options).unwrap();
            assert!(costs.costs.iter().all(|c| *c > 0.0));
            let d_delta = delta_by_theta(&state, &kinds).unwrap();
            let analytic =
                omega_by_theta(&state, values.beta[1], &costs, &d_delta, &kinds, &options)
                    .unwrap();

            let step = 1e-5;
            for (p, kind) in kinds.iter().enumerate() {
                let numeric = match *kind {
                    ParameterKind::Gamma { index } => -market.x3.column(index),
                    _ => {
                        let shift = |h: f64| {
                            let mut shifted = values.clone();
                            match *kind {
                                ParameterKind::Sigma { row, col } => shifted.sigma[(row, col)] += h,
                                ParameterKind::Pi { row, col } => shifted.pi[(row, col)] += h,
                                ParameterKind::Rho { group: Some(g) } => shifted.rho[g] += h,
                                ParameterKind::Beta { index } => shifted.beta[index] += h,
                                _ => unreachable!(),
                            }
                            costs_at(&shifted, &options, &delta)
                        };
                        (shift(step) - shift(-step)) / (2.0 * step)
                    }
                };
                assert_relative_eq!(analytic.column(p).into_owned(), numeric, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn clipped_costs_have_zero_jacobian_rows() {
        let market = fixtures::market(false);
        let values = fixtures::values(false);
        let utility = AgentUtilities::new(&market, &values).unwrap();
        let delta = solve_delta(&market, &utility, None, &ContractionOptions::default())
            .unwrap()
            .delta;
        let state = ChoiceState::new(&market, &utility, &delta).unwrap();
        let unbounded = compute_costs(&state, values.beta[1], &CostsOptions::default()).unwrap();
        let floor = unbounded.costs.max() - 1e-9;
        let options = CostsOptions::default().with_bounds(Some(floor), None);
        let costs = compute_costs(&state, values.beta[1], &options).unwrap();
        assert_eq!(costs.clipped_count(), 3);
        assert!(costs.costs.iter().all(|c| *c >= floor));

        let kinds = [ParameterKind::Sigma { row: 0, col: 0 }];
        let d_delta = delta_by_theta(&state, &kinds).unwrap();
        let jacobian =
            omega_by_theta(&state, values.beta[1], &costs, &d_delta, &kinds, &options).unwrap();
        for (row, clipped) in costs.clipped.iter().enumerate() {
            if *clipped {
                assert_eq!(jacobian[(row, 0)], 0.0);
            } else {
                assert!(jacobian[(row, 0)] != 0.0);
            }
        }
    }

    #[test]
    fn log_costs_reject_non_positive_values() {
        let market = monopolist();
        let utility = AgentUtilities::new(&market, &logit_values(-0.1)).unwrap();
        let delta = solve_delta(&market, &utility, None, &ContractionOptions::default())
            .unwrap()
            .delta;
        let state = ChoiceState::new(&market, &utility, &delta).unwrap();
        let result = compute_costs(&state, -0.1, &CostsOptions::log());
        assert!(matches!(result, Err(BlpError::NonPositiveCosts { index: 0, .. })));

        let floored = CostsOptions::log().with_bounds(Some(1e-3), None);
        let costs = compute_costs(&state, -0.1, &floored).unwrap();
        assert_eq!(costs.clipped_count(), 1);
        assert_relative_eq!(costs.transformed[0], 1e-3f64.ln());
    }
}
