//! Estimation results, standard errors, hypothesis tests, and post-estimation
//! outputs (elasticities, markups, costs, counterfactual prices).
//!
//! The full parameter vector used for covariances is `theta` followed by the
//! concentrated elements of `beta` and then of `gamma`, each in index order.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::error::{BlpError, Result};
use crate::estimation::{Evaluation, Problem};
use crate::linalg;
use crate::market::{ownership_from_firms, Market};
use crate::optimization::{projected_gradient, OptimizationOutcome};
use crate::parameters::{ParameterKind, ParameterValues};
use crate::pricing::{mean_price_coefficient, solve_prices, PriceSolution};
use crate::shares::{AgentUtilities, ChoiceState};
use crate::solving::{sup_norm, ContractionSummary};
use crate::supply::{compute_costs, MarketCosts};
use crate::weighting::{self, CovarianceType};

/// Outcome of the final GMM step.
#[derive(Clone, Debug)]
pub struct ProblemResults {
    /// Number of GMM steps performed.
    pub step: usize,
    pub theta: DVector<f64>,
    pub sigma: DMatrix<f64>,
    pub pi: DMatrix<f64>,
    pub rho: DVector<f64>,
    pub beta: DVector<f64>,
    pub gamma: DVector<f64>,
    /// Standard errors with the shapes of the parameters; `NaN` where not estimated.
    pub sigma_se: DMatrix<f64>,
    pub pi_se: DMatrix<f64>,
    pub rho_se: DVector<f64>,
    pub beta_se: DVector<f64>,
    pub gamma_se: DVector<f64>,
    /// Asymptotic covariance of the full parameter vector.
    pub parameter_covariances: DMatrix<f64>,
    pub objective: f64,
    pub gradient: DVector<f64>,
    pub projected_gradient_norm: f64,
    /// Finite-difference Hessian of the objective with respect to `theta`; `NaN` when
    /// not computed.
    pub hessian: DMatrix<f64>,
    /// Smallest and largest eigenvalues of `hessian`, when it is finite.
    pub hessian_eigenvalues: Option<(f64, f64)>,
    pub converged: bool,
    pub optimization_iterations: usize,
    pub optimization_evaluations: usize,
    /// Weighting matrix of the final step.
    pub weighting: DMatrix<f64>,
    /// `S^-1` at the final estimates, for a further step.
    pub updated_weighting: DMatrix<f64>,
    /// `S` used for the standard errors.
    pub moment_covariances: DMatrix<f64>,
    pub moments: DVector<f64>,
    /// Mean moment Jacobian over the full parameter vector.
    pub moments_jacobian: DMatrix<f64>,
    pub delta: DVector<f64>,
    pub xi: DVector<f64>,
    pub omega: DVector<f64>,
    /// Transformed marginal costs `c~` entering the supply equation.
    pub tilde_costs: DVector<f64>,
    pub clipped_costs: usize,
    pub contractions: Vec<ContractionSummary>,
    /// Smallest and largest eigenvalues of `d s / d delta` per market.
    pub eigenvalues: Vec<Option<(f64, f64)>>,
    /// Hansen's overidentification statistic `q / N`.
    pub hansen_j: f64,
    values: ParameterValues,
}

impl ProblemResults {
    pub(crate) fn new(
        problem: &Problem,
        evaluation: Evaluation,
        outcome: OptimizationOutcome,
        weighting: DMatrix<f64>,
        updated_weighting: DMatrix<f64>,
        step: usize,
    ) -> Result<Self> {
        let parameters = problem.parameters();
        let n = problem.data().product_count();
        let se_type = problem.options().gmm.se_type;

        let jacobian = full_jacobian(problem, &evaluation);
        let covariances = problem.moment_covariances(&evaluation, se_type, false)?;
        let parameter_covariances = match se_type {
            // The first step's weighting matrix is not scaled like S^-1.
            CovarianceType::Unadjusted if step == 1 => {
                let optimal = weighting::weighting_from_covariances(&covariances)?;
                weighting::parameter_covariances(&jacobian, &optimal, &covariances, true)?
            }
            CovarianceType::Unadjusted => {
                weighting::parameter_covariances(&jacobian, &weighting, &covariances, true)?
            }
            _ => weighting::parameter_covariances(&jacobian, &weighting, &covariances, false)?,
        };
        let errors = weighting::standard_errors(&parameter_covariances, n);

        let p = parameters.count();
        let hessian = if problem.options().gmm.compute_hessian && p > 0 {
            problem.hessian(&evaluation.theta, &weighting)
        } else {
            DMatrix::from_element(p, p, f64::NAN)
        };
        let hessian_eigenvalues = (p > 0 && hessian.iter().all(|v| v.is_finite()))
            .then(|| linalg::eigenvalue_range(&hessian));

        let values = evaluation.values;
        let (rows, cols) = values.sigma.shape();
        let mut sigma_se = DMatrix::from_element(rows, cols, f64::NAN);
        let mut pi_se = DMatrix::from_element(values.pi.nrows(), values.pi.ncols(), f64::NAN);
        let mut rho_se = DVector::from_element(values.rho.len(), f64::NAN);
        let mut beta_se = DVector::from_element(values.beta.len(), f64::NAN);
        let mut gamma_se = DVector::from_element(values.gamma.len(), f64::NAN);
        for (p, kind) in parameters.kinds().iter().enumerate() {
            match *kind {
                ParameterKind::Sigma { row, col } => sigma_se[(row, col)] = errors[p],
                ParameterKind::Pi { row, col } => pi_se[(row, col)] = errors[p],
                ParameterKind::Rho { group: None } => rho_se.fill(errors[p]),
                ParameterKind::Rho { group: Some(g) } => rho_se[g] = errors[p],
                ParameterKind::Beta { index } => beta_se[index] = errors[p],
                ParameterKind::Gamma { index } => gamma_se[index] = errors[p],
            }
        }
        let mut offset = parameters.count();
        for index in parameters.concentrated_beta() {
            beta_se[*index] = errors[offset];
            offset += 1;
        }
        if problem.has_supply() {
            for index in parameters.concentrated_gamma() {
                gamma_se[*index] = errors[offset];
                offset += 1;
            }
        }

        let projected_gradient_norm = sup_norm(&projected_gradient(
            &evaluation.theta,
            &evaluation.gradient,
            parameters.lower_bounds(),
            parameters.upper_bounds(),
        ));
        let clipped_costs = evaluation.stacked.clipped_count();

        Ok(Self {
            step,
            theta: evaluation.theta,
            sigma: values.sigma.clone(),
            pi: values.pi.clone(),
            rho: values.rho.clone(),
            beta: values.beta.clone(),
            gamma: values.gamma.clone(),
            sigma_se,
            pi_se,
            rho_se,
            beta_se,
            gamma_se,
            parameter_covariances,
            objective: evaluation.objective,
            gradient: evaluation.gradient,
            projected_gradient_norm,
            hessian,
            hessian_eigenvalues,
            converged: outcome.converged,
            optimization_iterations: outcome.iterations,
            optimization_evaluations: outcome.evaluations,
            weighting,
            updated_weighting,
            moment_covariances: covariances,
            moments: evaluation.moments.mean,
            moments_jacobian: jacobian,
            delta: evaluation.stacked.delta,
            xi: evaluation.xi,
            omega: evaluation.omega,
            tilde_costs: evaluation.stacked.tilde_costs,
            clipped_costs,
            contractions: evaluation.stacked.contractions,
            eigenvalues: evaluation.stacked.eigenvalues,
            hansen_j: evaluation.objective / n as f64,
            values,
        })
    }

    /// Estimated parameter values, with concentrated linear parameters filled in.
    pub fn values(&self) -> &ParameterValues {
        &self.values
    }

    /// Wald statistic `N r' (R V R')^-1 r` for restrictions `r(theta) = 0` with Jacobian
    /// `R` over the full parameter vector. Asymptotically chi-squared with `len(r)`
    /// degrees of freedom.
    pub fn wald_test(&self, restrictions: &DVector<f64>, jacobian: &DMatrix<f64>) -> Result<f64> {
        let parameters = self.parameter_covariances.nrows();
        if jacobian.ncols() != parameters {
            return Err(BlpError::dimension_mismatch(
                "restriction Jacobian columns",
                parameters,
                jacobian.ncols(),
            ));
        }
        if jacobian.nrows() != restrictions.len() {
            return Err(BlpError::dimension_mismatch(
                "restriction Jacobian rows",
                restrictions.len(),
                jacobian.nrows(),
            ));
        }
        let middle = jacobian * &self.parameter_covariances * jacobian.transpose();
        let solved = linalg::solve_vector(&middle, restrictions, "restriction covariances R V R'")?;
        Ok(self.delta.len() as f64 * restrictions.dot(&solved))
    }

    /// Distance statistic `(q_r - q_u) / N`, with these results as the restricted model.
    ///
    /// Both models should be estimated with the same optimal weighting matrix. The
    /// statistic is asymptotically chi-squared with as many degrees of freedom as there
    /// are restrictions.
    pub fn distance_test(&self, unrestricted: &ProblemResults) -> Result<f64> {
        let n = self.delta.len();
        if unrestricted.delta.len() != n {
            return Err(BlpError::dimension_mismatch(
                "unrestricted observations",
                n,
                unrestricted.delta.len(),
            ));
        }
        Ok((self.objective - unrestricted.objective) / n as f64)
    }

    /// Lagrange multiplier statistic `N (G' W g)' V (G' W g)` at these restricted
    /// estimates, with `g` and `G` the mean moments and their Jacobian over the full
    /// parameter vector.
    pub fn lm_test(&self) -> f64 {
        let score = self.moments_jacobian.tr_mul(&(&self.weighting * &self.moments));
        let n = self.delta.len() as f64;
        n * score.dot(&(&self.parameter_covariances * &score))
    }

    fn state_inputs(&self, market: &Market) -> Result<(AgentUtilities, DVector<f64>)> {
        let range = market.products();
        let utility = AgentUtilities::new(market, &self.values)?;
        let delta = self.delta.rows(range.start, range.len()).into_owned();
        Ok((utility, delta))
    }

    /// Price elasticities `e_jk = (d s_j / d p_k) p_k / s_j` in one market.
    pub fn compute_elasticities(&self, problem: &Problem, market: usize) -> Result<DMatrix<f64>> {
        let count = problem.markets().len();
        let market = problem
            .markets()
            .get(market)
            .ok_or_else(|| BlpError::dimension_mismatch("market index", count, market))?;
        let (utility, delta) = self.state_inputs(market)?;
        let state = ChoiceState::new(market, &utility, &delta)?;
        let jacobian = state.price_jacobian(mean_price_coefficient(market, &self.values));
        let shares = state.shares();
        let prices = market.prices();
        Ok(DMatrix::from_fn(jacobian.nrows(), jacobian.ncols(), |j, k| {
            jacobian[(j, k)] * prices[k] / shares[j]
        }))
    }

    fn market_costs(&self, problem: &Problem) -> Result<Vec<MarketCosts>> {
        if problem.data().prices().is_none() {
            return Err(BlpError::missing_component("prices"));
        }
        problem
            .markets()
            .par_iter()
            .map(|market| {
                let (utility, delta) = self.state_inputs(market)?;
                let state = ChoiceState::new(market, &utility, &delta)?;
                let alpha = mean_price_coefficient(market, &self.values);
                compute_costs(&state, alpha, &problem.options().costs)
            })
            .collect()
    }

    /// Marginal costs implied by observed prices, after clipping.
    pub fn compute_costs(&self, problem: &Problem) -> Result<DVector<f64>> {
        let costs = self.market_costs(problem)?;
        Ok(stack(costs.iter().map(|c| &c.costs), self.delta.len()))
    }

    /// Bertrand-Nash markups `p - c` implied by observed prices.
    pub fn compute_markups(&self, problem: &Problem) -> Result<DVector<f64>> {
        let costs = self.market_costs(problem)?;
        Ok(stack(costs.iter().map(|c| &c.eta), self.delta.len()))
    }

    /// Equilibrium prices under the estimates, holding `xi` fixed.
    ///
    /// `firm_ids` replaces the ownership structure (e.g. a merger) and `costs` the
    /// marginal costs; both default to the observed ones. Solutions are warm-started
    /// from the previous counterfactual in each market.
    pub fn compute_prices(
        &self,
        problem: &Problem,
        firm_ids: Option<&[String]>,
        costs: Option<&DVector<f64>>,
    ) -> Result<Vec<PriceSolution>> {
        let n = self.delta.len();
        if let Some(ids) = firm_ids {
            if ids.len() != n {
                return Err(BlpError::dimension_mismatch("counterfactual firm ids", n, ids.len()));
            }
        }
        let costs = match costs {
            Some(costs) if costs.len() != n => {
                return Err(BlpError::dimension_mismatch("counterfactual costs", n, costs.len()))
            }
            Some(costs) => costs.clone(),
            None => self.compute_costs(problem)?,
        };
        let cache = problem.cache();
        let options = &problem.options().prices;

        problem
            .markets()
            .par_iter()
            .map(|market| -> Result<PriceSolution> {
                let range = market.products();
                let altered;
                let market = match firm_ids {
                    Some(ids) => {
                        let ownership = ownership_from_firms(&ids[range.clone()]);
                        altered = market.with_ownership(ownership)?;
                        &altered
                    }
                    None => market,
                };
                let xi = self.xi.rows(range.start, range.len()).into_owned();
                let costs = costs.rows(range.start, range.len()).into_owned();
                let start = cache.price_start(market.index());
                let solution =
                    solve_prices(market, &self.values, &xi, &costs, start.as_ref(), options)?;
                cache.store_prices(market.index(), &solution.prices);
                Ok(solution)
            })
            .collect()
    }
}

/// Mean moment Jacobian over the full parameter vector, appending the `-X1` and `-X3`
/// columns of concentrated linear parameters.
fn full_jacobian(problem: &Problem, evaluation: &Evaluation) -> DMatrix<f64> {
    let parameters = problem.parameters();
    let data = problem.data();
    let moments = &evaluation.moments;
    let n = data.product_count() as f64;
    let beta = parameters.concentrated_beta();
    let gamma: &[usize] = if problem.has_supply() { parameters.concentrated_gamma() } else { &[] };
    let p = parameters.count();

    let mut jacobian = DMatrix::zeros(moments.mean.len(), p + beta.len() + gamma.len());
    jacobian.columns_mut(0, p).copy_from(&moments.jacobian);
    for (k, index) in beta.iter().enumerate() {
        let column = data.demand_instruments().tr_mul(&data.x1().column(*index)) / -n;
        jacobian.view_mut((0, p + k), (moments.demand, 1)).copy_from(&column);
    }
    for (k, index) in gamma.iter().enumerate() {
        let column = data.supply_instruments().tr_mul(&data.x3().column(*index)) / -n;
        jacobian
            .view_mut((moments.demand, p + beta.len() + k), (moments.supply, 1))
            .copy_from(&column);
    }
    jacobian
}

fn stack<'a>(parts: impl Iterator<Item = &'a DVector<f64>>, size: usize) -> DVector<f64> {
    let mut stacked = DVector::zeros(size);
    let mut start = 0;
    for part in parts {
        stacked.rows_mut(start, part.len()).copy_from(part);
        start += part.len();
    }
    stacked
}
