//! Price Solver: Bertrand-Nash equilibrium prices via the zeta-markup contraction.
//!
//! With `d s / d p = diag(Lambda) - Gamma`, the first-order conditions rearrange to
//! `p - c = zeta(p) = Lambda^-1 [(O .* Gamma)' (p - c) - s]`, and `p <- c + zeta(p)` is
//! iterated until `|| Lambda (p - c - zeta) ||_inf` falls below tolerance.

use log::warn;
use nalgebra::DVector;
use rayon::prelude::*;

use crate::data::ProductData;
use crate::error::{BlpError, Result};
use crate::integration::AgentData;
use crate::market::Market;
use crate::parameters::ParameterValues;
use crate::shares::{AgentUtilities, ChoiceState};
use crate::solving::{sup_norm, PriceIterationOptions, PriceSummary};

/// Equilibrium outcome in one market.
#[derive(Clone, Debug)]
pub struct PriceSolution {
    pub prices: DVector<f64>,
    pub shares: DVector<f64>,
    /// Mean utilities at the equilibrium prices.
    pub delta: DVector<f64>,
    pub summary: PriceSummary,
}

/// Mean price coefficient: the `X1` price entry of `beta`, zero without one.
pub fn mean_price_coefficient(market: &Market, values: &ParameterValues) -> f64 {
    market
        .x1_price_column
        .and_then(|column| values.beta.get(column).copied())
        .unwrap_or(0.0)
}

/// Solves for equilibrium prices given `xi` and marginal costs.
///
/// Mean utilities are `X1(p) beta + xi`, so both `X1` and `X2` price columns move with
/// the iterate. Iteration starts at `start`, or at the market's prices when omitted.
pub fn solve_prices(
    market: &Market,
    values: &ParameterValues,
    xi: &DVector<f64>,
    costs: &DVector<f64>,
    start: Option<&DVector<f64>>,
    options: &PriceIterationOptions,
) -> Result<PriceSolution> {
    let j = market.product_count();
    for (context, vector) in [("xi length", xi), ("costs length", costs)] {
        if vector.len() != j {
            return Err(BlpError::dimension_mismatch(context, j, vector.len()));
        }
    }
    if market.x1_price_column.is_none() && market.x2_price_column.is_none() {
        return Err(BlpError::missing_component("price column"));
    }
    let alpha = mean_price_coefficient(market, values);
    let mut prices = start.cloned().unwrap_or_else(|| market.prices.clone());
    let mut residual = f64::INFINITY;

    for iteration in 1..=options.max_iterations {
        let current = market.with_prices(&prices);
        let delta = &current.x1 * &values.beta + xi;
        let utility = AgentUtilities::new(&current, values)?;
        let state = ChoiceState::new(&current, &utility, &delta)?;
        let (lambda, gamma) = state.lambda_gamma(&state.price_slopes(alpha));
        if lambda.iter().any(|l| *l == 0.0 || !l.is_finite()) {
            return Err(BlpError::NumericalError {
                context: "price contraction Lambda",
            });
        }

        let margin = &prices - costs;
        let pulled = current.ownership.component_mul(&gamma).transpose() * &margin - state.shares();
        let zeta = pulled.component_div(&lambda);
        residual = sup_norm(&lambda.component_mul(&(&margin - &zeta)));
        if !residual.is_finite() {
            return Err(BlpError::NumericalError {
                context: "price contraction",
            });
        }
        if residual < options.tolerance {
            return Ok(PriceSolution {
                prices,
                shares: state.shares().clone(),
                delta,
                summary: PriceSummary {
                    iterations: iteration,
                    residual,
                },
            });
        }
        prices = costs + zeta;
    }

    warn!(
        "price contraction did not converge in market {} after {} iterations",
        market.id(),
        options.max_iterations
    );
    Err(BlpError::PriceContractionDidNotConverge {
        market_id: market.id().to_string(),
        iterations: options.max_iterations,
        max_gap: residual,
    })
}

/// Solves every market in parallel; `xi` and `costs` are stacked over all products.
pub fn solve_all_prices(
    markets: &[Market],
    values: &ParameterValues,
    xi: &DVector<f64>,
    costs: &DVector<f64>,
    options: &PriceIterationOptions,
) -> Result<Vec<PriceSolution>> {
    markets
        .par_iter()
        .map(|market| {
            let range = market.products();
            let xi = xi.rows(range.start, range.len()).into_owned();
            let costs = costs.rows(range.start, range.len()).into_owned();
            solve_prices(market, values, &xi, &costs, None, options)
        })
        .collect()
}

/// Simulates equilibrium prices and shares for every market of `data` from structural
/// primitives. Prices in `data` only serve as starting values.
pub fn simulate_equilibrium(
    data: &ProductData,
    agents: Option<&AgentData>,
    values: &ParameterValues,
    xi: &DVector<f64>,
    costs: &DVector<f64>,
    options: &PriceIterationOptions,
) -> Result<Vec<PriceSolution>> {
    let n = data.product_count();
    for (context, vector) in [("xi length", xi), ("costs length", costs)] {
        if vector.len() != n {
            return Err(BlpError::dimension_mismatch(context, n, vector.len()));
        }
    }
    let markets = Market::all(data, agents)?;
    solve_all_prices(&markets, values, xi, costs, options)
}
