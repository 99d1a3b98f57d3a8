//! High-level estimation pipeline: the GMM objective, its gradient, and multi-step GMM.
//!
//! For a proposed `theta` every market is solved in parallel (mean utilities, the
//! implicit `delta` Jacobian, implied costs, micro moment contributions), results are
//! stacked in market order, the linear parameters that are not part of `theta` are
//! concentrated out by IV-GMM, and the objective `q = N^2 g' W g` and its gradient
//! `2 N^2 G' W g` are formed.

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::cache::WarmStartCache;
use crate::data::ProductData;
use crate::demand::{delta_by_theta, solve_delta, xi_by_theta};
use crate::error::{BlpError, Result};
use crate::integration::AgentData;
use crate::linalg;
use crate::market::Market;
use crate::micro::{self, MicroMoment};
use crate::moments::{self, EquationBlock, MarketContribution, Moments, Stacked};
use crate::optimization::{Lbfgs, Objective, ObjectiveValue, Optimizer};
use crate::options::{ErrorBehavior, ProblemOptions, DEFAULT_PUNISHMENT};
use crate::parameters::{ModelVariant, ParameterConfig, ParameterValues, Parameters};
use crate::pricing::mean_price_coefficient;
use crate::results::ProblemResults;
use crate::shares::{AgentUtilities, ChoiceState};
use crate::supply::{compute_costs, omega_by_theta};
use crate::weighting::{self, CovarianceType};

/// Builder for [`Problem`].
#[derive(Clone, Debug, Default)]
pub struct ProblemBuilder {
    products: Option<ProductData>,
    agents: Option<AgentData>,
    parameters: ParameterConfig,
    micro_moments: Vec<MicroMoment>,
    options: ProblemOptions,
}

impl ProblemBuilder {
    pub fn products(mut self, products: ProductData) -> Self {
        self.products = Some(products);
        self
    }

    /// Agent nodes, weights, and demographics. Required with random coefficients.
    pub fn agents(mut self, agents: AgentData) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn parameters(mut self, parameters: ParameterConfig) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn micro_moments(mut self, moments: Vec<MicroMoment>) -> Self {
        self.micro_moments = moments;
        self
    }

    pub fn options(mut self, options: ProblemOptions) -> Self {
        self.options = options;
        self
    }

    /// Validates the configuration against the data and slices the markets.
    pub fn build(self) -> Result<Problem> {
        let data = self.products.ok_or_else(|| BlpError::missing_component("product data"))?;
        let demographics = self.agents.as_ref().map_or(0, AgentData::demographics_dim);
        let parameters = Parameters::new(
            &self.parameters,
            data.linear_dim(),
            data.nonlinear_dim(),
            data.cost_dim(),
            demographics,
            data.nesting_group_count(),
        )?;

        let random = matches!(
            parameters.variant(),
            ModelVariant::RandomCoefficients | ModelVariant::RandomCoefficientsNested
        );
        if random && self.agents.is_none() {
            return Err(BlpError::missing_component("agent data"));
        }
        if let Some(agents) = &self.agents {
            for segment in data.partition().markets() {
                if random && agents.market_range(segment.id()).is_none() {
                    return Err(BlpError::invalid_configuration(format!(
                        "market `{}` has no agents",
                        segment.id()
                    )));
                }
            }
        }

        let supply = data.has_supply();
        if supply {
            match data.x1_price_column() {
                Some(column) if parameters.concentrated_beta().contains(&column) => {
                    return Err(BlpError::invalid_configuration(
                        "the price coefficient in beta must be part of theta when there is a \
                         supply side",
                    ));
                }
                None if data.x2_price_column().is_none() => {
                    return Err(BlpError::missing_component("price column"));
                }
                _ => {}
            }
        }

        let md = data.demand_instrument_dim();
        let ms = if supply { data.supply_instrument_dim() } else { 0 };
        if md < parameters.concentrated_beta().len() {
            return Err(BlpError::invalid_configuration(format!(
                "{md} demand instruments cannot identify {} concentrated linear parameters",
                parameters.concentrated_beta().len()
            )));
        }
        if supply && ms < parameters.concentrated_gamma().len() {
            return Err(BlpError::invalid_configuration(format!(
                "{ms} supply instruments cannot identify {} concentrated cost parameters",
                parameters.concentrated_gamma().len()
            )));
        }
        let estimated = parameters.count()
            + parameters.concentrated_beta().len()
            + if supply { parameters.concentrated_gamma().len() } else { 0 };
        let moment_count = md + ms + self.micro_moments.len();
        if moment_count < estimated {
            return Err(BlpError::invalid_configuration(format!(
                "{moment_count} moments cannot identify {estimated} parameters"
            )));
        }

        micro::validate_moments(&self.micro_moments, demographics, data.nonlinear_dim())?;
        if !self.micro_moments.is_empty() && self.agents.is_none() {
            return Err(BlpError::missing_component("agent data"));
        }
        let gmm = &self.options.gmm;
        if let Some(extra) = &gmm.extra_micro_covariances {
            let mm = self.micro_moments.len();
            if extra.nrows() != mm || extra.ncols() != mm {
                return Err(BlpError::dimension_mismatch(
                    "extra micro covariances",
                    mm,
                    extra.nrows(),
                ));
            }
        }
        if let Some(initial) = &gmm.initial_weighting {
            if initial.nrows() != moment_count || initial.ncols() != moment_count {
                return Err(BlpError::dimension_mismatch(
                    "initial weighting matrix",
                    moment_count,
                    initial.nrows(),
                ));
            }
        }
        let clustered = gmm.weighting_type == CovarianceType::Clustered
            || gmm.se_type == CovarianceType::Clustered;
        if clustered && data.clustering().is_none() {
            return Err(BlpError::missing_component("clustering_ids"));
        }
        if self.options.costs.costs_type == crate::supply::CostsType::Log
            && self.options.costs.lower_bound.is_some_and(|bound| bound <= 0.0)
        {
            return Err(BlpError::invalid_configuration(
                "the lower bound on log-linear costs must be positive",
            ));
        }

        let markets = Market::all(&data, self.agents.as_ref())?;
        let cache = WarmStartCache::new(markets.len());
        Ok(Problem {
            data,
            agents: self.agents,
            markets,
            parameters,
            micro_moments: self.micro_moments,
            options: self.options,
            cache,
        })
    }
}

/// A validated estimation problem.
#[derive(Clone, Debug)]
pub struct Problem {
    data: ProductData,
    agents: Option<AgentData>,
    markets: Vec<Market>,
    parameters: Parameters,
    micro_moments: Vec<MicroMoment>,
    options: ProblemOptions,
    cache: WarmStartCache,
}

/// Everything computed at one `theta`.
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub theta: DVector<f64>,
    /// Parameter values with concentrated linear parameters filled in.
    pub values: ParameterValues,
    pub objective: f64,
    pub gradient: DVector<f64>,
    pub xi: DVector<f64>,
    /// Empty without a supply side.
    pub omega: DVector<f64>,
    pub moments: Moments,
    pub stacked: Stacked,
}

impl Problem {
    pub fn builder() -> ProblemBuilder {
        ProblemBuilder::default()
    }

    /// Accessor for product data.
    pub fn data(&self) -> &ProductData {
        &self.data
    }

    pub fn agents(&self) -> Option<&AgentData> {
        self.agents.as_ref()
    }

    pub fn markets(&self) -> &[Market] {
        &self.markets
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn micro_moments(&self) -> &[MicroMoment] {
        &self.micro_moments
    }

    pub fn options(&self) -> &ProblemOptions {
        &self.options
    }

    pub fn cache(&self) -> &WarmStartCache {
        &self.cache
    }

    pub fn has_supply(&self) -> bool {
        self.data.has_supply()
    }

    /// Total number of moments `M`.
    pub fn moment_count(&self) -> usize {
        self.instruments().iter().map(|z| z.ncols()).sum::<usize>() + self.micro_moments.len()
    }

    /// Instrument matrices of the active equations, demand first.
    pub(crate) fn instruments(&self) -> Vec<&DMatrix<f64>> {
        let mut instruments = vec![self.data.demand_instruments()];
        if self.has_supply() {
            instruments.push(self.data.supply_instruments());
        }
        instruments
    }

    /// The configured initial weighting matrix, or the 2SLS one.
    pub fn initial_weighting(&self) -> Result<DMatrix<f64>> {
        match &self.options.gmm.initial_weighting {
            Some(weighting) => Ok(weighting.clone()),
            None => weighting::initial_weighting(&self.instruments(), self.micro_moments.len()),
        }
    }

    /// Solves one market at `values`: mean utilities and all derivatives.
    fn contribute(
        &self,
        market: &Market,
        values: &ParameterValues,
        diagnostics: bool,
    ) -> Result<MarketContribution> {
        let kinds = self.parameters.kinds();
        let utility = AgentUtilities::new(market, values)?;
        let start = self.cache.delta_start(market.index(), self.options.delta_behavior);
        let solution = solve_delta(market, &utility, start.as_ref(), &self.options.contraction)?;
        self.cache.store_delta(market.index(), &solution.delta);

        let state = ChoiceState::new(market, &utility, &solution.delta)?;
        let d_delta = delta_by_theta(&state, kinds)?;
        let xi_jacobian = xi_by_theta(market, &d_delta, kinds);

        let (tilde_costs, omega_jacobian, clipped) = if self.has_supply() {
            let alpha = mean_price_coefficient(market, values);
            let costs = compute_costs(&state, alpha, &self.options.costs)?;
            let jacobian =
                omega_by_theta(&state, alpha, &costs, &d_delta, kinds, &self.options.costs)?;
            (Some(costs.transformed), Some(jacobian), costs.clipped)
        } else {
            (None, None, vec![false; market.product_count()])
        };

        let micro = (!self.micro_moments.is_empty())
            .then(|| micro::market_micro(&state, &self.micro_moments, Some(&d_delta), kinds));
        let eigenvalues = diagnostics.then(|| linalg::eigenvalue_range(&state.delta_jacobian()));

        Ok(MarketContribution {
            delta: solution.delta,
            xi_jacobian: Some(xi_jacobian),
            tilde_costs,
            omega_jacobian,
            clipped,
            micro,
            contraction: solution.summary,
            eigenvalues,
        })
    }

    /// Evaluates the GMM objective and its gradient at `theta` under `weighting`.
    ///
    /// With `diagnostics`, the extreme eigenvalues of each market's share Jacobian are
    /// also computed.
    pub fn evaluate(
        &self,
        theta: &DVector<f64>,
        weighting: &DMatrix<f64>,
        diagnostics: bool,
    ) -> Result<Evaluation> {
        let mut values = self.parameters.expand(theta)?;
        let m = self.moment_count();
        if weighting.nrows() != m || weighting.ncols() != m {
            return Err(BlpError::dimension_mismatch("weighting matrix", m, weighting.nrows()));
        }

        let contributions = self
            .markets
            .par_iter()
            .map(|market| self.contribute(market, &values, diagnostics))
            .collect::<Result<Vec<_>>>()?;
        let stacked = moments::stack(
            contributions,
            self.data.product_count(),
            self.parameters.count(),
            self.has_supply(),
            &self.micro_moments,
        )?;

        let (xi, omega) = self.concentrate(&stacked, &mut values, weighting)?;
        let demand_instruments = self.data.demand_instruments();
        let supply_instruments = self.data.supply_instruments();
        let moments = moments::assemble(
            EquationBlock {
                instruments: demand_instruments,
                residuals: &xi,
                jacobian: &stacked.xi_jacobian,
            },
            self.has_supply().then_some(EquationBlock {
                instruments: supply_instruments,
                residuals: &omega,
                jacobian: &stacked.omega_jacobian,
            }),
            stacked.micro.as_ref().map(|micro| (&micro.moments, &micro.jacobian)),
        );

        let n = self.data.product_count() as f64;
        let weighted = weighting * &moments.mean;
        let objective = n * n * moments.mean.dot(&weighted);
        let gradient = moments.jacobian.tr_mul(&weighted) * (2.0 * n * n);
        if !objective.is_finite() || gradient.iter().any(|v| !v.is_finite()) {
            return Err(BlpError::NumericalError {
                context: "GMM objective",
            });
        }
        debug!(
            "objective {objective:.6e}, gradient norm {:.6e}, {} contraction iterations",
            gradient.amax(),
            stacked.total_iterations()
        );

        Ok(Evaluation {
            theta: theta.clone(),
            values,
            objective,
            gradient,
            xi,
            omega,
            moments,
            stacked,
        })
    }

    /// Concentrates out linear parameters that are not in `theta` by IV-GMM, filling
    /// them into `values`, and returns the structural errors `(xi, omega)`.
    fn concentrate(
        &self,
        stacked: &Stacked,
        values: &mut ParameterValues,
        weighting: &DMatrix<f64>,
    ) -> Result<(DVector<f64>, DVector<f64>)> {
        let x1 = self.data.x1();
        let x3 = self.data.x3();
        let zd = self.data.demand_instruments();
        let zs = self.data.supply_instruments();
        let supply = self.has_supply();

        let y_demand = &stacked.delta - x1 * &values.beta;
        let y_supply = if supply {
            &stacked.tilde_costs - x3 * &values.gamma
        } else {
            DVector::zeros(0)
        };

        let beta_columns = self.parameters.concentrated_beta();
        let gamma_columns: &[usize] = if supply {
            self.parameters.concentrated_gamma()
        } else {
            &[]
        };
        if beta_columns.is_empty() && gamma_columns.is_empty() {
            return Ok((y_demand, y_supply));
        }

        let x_demand = x1.select_columns(beta_columns);
        let x_supply = x3.select_columns(gamma_columns);
        let zx_demand = zd.tr_mul(&x_demand);
        let zy_demand = zd.tr_mul(&y_demand);
        let (zx, zy) = if supply {
            let zx_supply = zs.tr_mul(&x_supply);
            let mut zy = DVector::zeros(zd.ncols() + zs.ncols());
            zy.rows_mut(0, zd.ncols()).copy_from(&zy_demand);
            zy.rows_mut(zd.ncols(), zs.ncols()).copy_from(&zs.tr_mul(&y_supply));
            (linalg::block_diagonal(&[&zx_demand, &zx_supply]), zy)
        } else {
            (zx_demand, zy_demand)
        };

        let products = zx.nrows();
        let w = weighting.view((0, 0), (products, products));
        let xzw = zx.tr_mul(&w);
        let estimates = linalg::solve_vector(&(&xzw * &zx), &(&xzw * &zy), "X'ZWZ'X")?;

        let (beta_hat, gamma_hat) = (
            estimates.rows(0, beta_columns.len()).into_owned(),
            estimates.rows(beta_columns.len(), gamma_columns.len()).into_owned(),
        );
        for (k, column) in beta_columns.iter().enumerate() {
            values.beta[*column] = beta_hat[k];
        }
        for (k, column) in gamma_columns.iter().enumerate() {
            values.gamma[*column] = gamma_hat[k];
        }
        let xi = y_demand - x_demand * beta_hat;
        let omega = if supply { y_supply - x_supply * gamma_hat } else { y_supply };
        Ok((xi, omega))
    }

    /// Estimates `S` at an evaluation: instrument moments plus the micro block.
    pub fn moment_covariances(
        &self,
        evaluation: &Evaluation,
        kind: CovarianceType,
        center: bool,
    ) -> Result<DMatrix<f64>> {
        let mut residuals = vec![&evaluation.xi];
        if self.has_supply() {
            residuals.push(&evaluation.omega);
        }
        let clusters = self.data.clustering().map(|grouping| grouping.indices());
        let instruments = self.instruments();
        let products =
            weighting::moment_covariances(&residuals, &instruments, kind, clusters, center)?;
        let micro = evaluation.stacked.micro.as_ref().map(|micro| {
            match &self.options.gmm.extra_micro_covariances {
                Some(extra) => &micro.covariances + extra,
                None => micro.covariances.clone(),
            }
        });
        Ok(weighting::with_micro_block(&products, micro.as_ref()))
    }

    /// The objective under a fixed weighting matrix, as seen by an optimizer.
    pub fn objective(&self, weighting: DMatrix<f64>) -> GmmObjective<'_> {
        GmmObjective {
            problem: self,
            weighting,
            evaluations: 0,
            failures: 0,
            last_good: None,
        }
    }

    /// Central finite-difference Hessian of the objective at `theta`, built from
    /// analytic gradients and symmetrized. Columns whose perturbed evaluations fail
    /// are `NaN`.
    pub fn hessian(&self, theta: &DVector<f64>, weighting: &DMatrix<f64>) -> DMatrix<f64> {
        let p = theta.len();
        let change = f64::EPSILON.sqrt();
        let mut hessian = DMatrix::from_element(p, p, f64::NAN);
        for k in 0..p {
            let mut forward = theta.clone();
            let mut backward = theta.clone();
            forward[k] += change / 2.0;
            backward[k] -= change / 2.0;
            let up = self.evaluate(&forward, weighting, false);
            let down = self.evaluate(&backward, weighting, false);
            match (up, down) {
                (Ok(up), Ok(down)) => {
                    hessian.set_column(k, &((up.gradient - down.gradient) / change));
                }
                (Err(error), _) | (_, Err(error)) => {
                    warn!("Hessian column {k} could not be computed: {error}");
                }
            }
        }
        (&hessian + hessian.transpose()) / 2.0
    }

    /// Runs one- or two-step GMM with the default optimizer.
    pub fn solve(&self) -> Result<ProblemResults> {
        self.solve_with(&Lbfgs::default())
    }

    /// Runs one- or two-step GMM, minimizing each step's objective with `optimizer`.
    ///
    /// The first step's contractions start from the closed-form logit `delta`; each
    /// later step starts from the previous step's final `delta`.
    pub fn solve_with(&self, optimizer: &dyn Optimizer) -> Result<ProblemResults> {
        let steps = self.options.gmm.method.steps();
        let mut weighting = self.initial_weighting()?;
        let mut theta = self.parameters.start().clone();
        let mut step = 1;
        self.cache.clear();
        loop {
            info!(
                "GMM step {step} of {steps}: optimizing over {} parameters",
                self.parameters.count()
            );
            let mut objective = self.objective(weighting.clone());
            let outcome = optimizer.minimize(
                &mut objective,
                &theta,
                self.parameters.lower_bounds(),
                self.parameters.upper_bounds(),
            )?;
            info!(
                "GMM step {step} finished after {} iterations and {} evaluations ({} failed)",
                outcome.iterations, objective.evaluations, objective.failures
            );
            info!(
                "GMM step {step}: objective {:.6e}, converged {} ({})",
                outcome.value, outcome.converged, outcome.message
            );

            let evaluation = self.evaluate(&outcome.theta, &weighting, true)?;
            let covariances = self.moment_covariances(
                &evaluation,
                self.options.gmm.weighting_type,
                self.options.gmm.center_moments,
            )?;
            let updated = weighting::weighting_from_covariances(&covariances)?;
            if step == steps {
                return ProblemResults::new(self, evaluation, outcome, weighting, updated, step);
            }
            for market in &self.markets {
                let range = market.products();
                let delta = evaluation.stacked.delta.rows(range.start, range.len()).into_owned();
                self.cache.begin_step(market.index(), delta);
            }
            theta = outcome.theta;
            weighting = updated;
            step += 1;
        }
    }
}

/// The GMM objective under a fixed weighting matrix, applying the configured error
/// behaviour to failed evaluations.
#[derive(Debug)]
pub struct GmmObjective<'a> {
    problem: &'a Problem,
    weighting: DMatrix<f64>,
    evaluations: usize,
    failures: usize,
    last_good: Option<ObjectiveValue>,
}

impl GmmObjective<'_> {
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Evaluations that failed.
    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn weighting(&self) -> &DMatrix<f64> {
        &self.weighting
    }
}

impl Objective for GmmObjective<'_> {
    fn evaluate(&mut self, theta: &DVector<f64>) -> Result<ObjectiveValue> {
        self.evaluations += 1;
        let error = match self.problem.evaluate(theta, &self.weighting, false) {
            Ok(evaluation) => {
                let value = ObjectiveValue::new(evaluation.objective, evaluation.gradient);
                self.last_good = Some(value.clone());
                return Ok(value);
            }
            Err(error) => error,
        };
        self.failures += 1;
        match self.problem.options.error_behavior {
            ErrorBehavior::Punish { value } => {
                warn!("objective evaluation failed ({error}); punishing with {value:e}");
                Ok(ObjectiveValue::failed(value, DVector::zeros(theta.len())))
            }
            ErrorBehavior::Revert { scale } => {
                let (value, gradient) = match &self.last_good {
                    Some(last) => (last.value * scale, last.gradient.clone()),
                    None => (DEFAULT_PUNISHMENT * scale, DVector::zeros(theta.len())),
                };
                warn!("objective evaluation failed ({error}); reverting to {value:e}");
                Ok(ObjectiveValue::failed(value, gradient))
            }
            ErrorBehavior::Raise => Err(BlpError::EvaluationFailed {
                source: Box::new(error),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::data::ProductDataBuilder;
    use crate::options::GmmMethod;

    fn logit_data() -> ProductData {
        let market_ids = vec!["m1".to_string(), "m1".to_string()];
        let shares = DVector::from_vec(vec![0.2, 0.3]);
        let x1 = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 2.0]);
        ProductDataBuilder::new(market_ids, shares).x1(x1).build().unwrap()
    }

    #[test]
    fn just_identified_logit_fits_exactly() {
        let problem = Problem::builder()
            .products(logit_data())
            .options(ProblemOptions::default().with_method(GmmMethod::OneStep))
            .build()
            .unwrap();
        let evaluation = problem
            .evaluate(&DVector::zeros(0), &problem.initial_weighting().unwrap(), false)
            .unwrap();

        let outside = 0.5_f64;
        assert_relative_eq!(evaluation.stacked.delta[0], (0.2_f64 / outside).ln(), epsilon = 1e-12);
        assert_relative_eq!(evaluation.objective, 0.0, epsilon = 1e-20);
        let slope = (0.3_f64 / 0.2).ln();
        assert_relative_eq!(evaluation.values.beta[1], slope, epsilon = 1e-12);
        assert_relative_eq!(evaluation.values.beta[0], (0.4_f64).ln() - slope, epsilon = 1e-12);
    }

    #[test]
    fn setup_rejects_inconsistent_configurations() {
        let random = ParameterConfig::new().sigma(DMatrix::from_element(1, 1, 1.0));
        let shares = DVector::from_vec(vec![0.2, 0.3]);
        let data = ProductDataBuilder::new(vec!["m".to_string(); 2], shares)
            .x1(DMatrix::from_row_slice(2, 1, &[1.0, 1.0]))
            .x2(DMatrix::from_row_slice(2, 1, &[0.5, 1.5]))
            .build()
            .unwrap();
        let missing_agents = Problem::builder().products(data.clone()).parameters(random).build();
        assert!(matches!(missing_agents, Err(BlpError::MissingComponent { .. })));

        let clustered = Problem::builder()
            .products(data)
            .options(ProblemOptions::default().with_se_type(CovarianceType::Clustered))
            .build();
        assert!(matches!(clustered, Err(BlpError::MissingComponent { .. })));
    }

    fn bounded_logit() -> (ProductData, ParameterConfig) {
        let shares = DVector::from_vec(vec![0.2, 0.3]);
        let data = ProductDataBuilder::new(vec!["m".to_string(); 2], shares)
            .x1(DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 1.0, 1.5]))
            .demand_instruments(DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 1.0, 1.5]))
            .build()
            .unwrap();
        let config = ParameterConfig::new().beta(vec![None, Some(-1.0)]).beta_bounds(
            DVector::from_vec(vec![f64::NEG_INFINITY, -2.0]),
            DVector::from_vec(vec![f64::INFINITY, 0.0]),
        );
        (data, config)
    }

    #[test]
    fn failed_evaluations_follow_the_error_behavior() {
        let (data, config) = bounded_logit();
        let punishing = Problem::builder()
            .products(data.clone())
            .parameters(config.clone())
            .build()
            .unwrap();
        let weighting = punishing.initial_weighting().unwrap();
        let mut objective = punishing.objective(weighting.clone());
        let value = objective.evaluate(&DVector::from_vec(vec![3.0])).unwrap();
        assert_eq!(value.value, 1e10);
        assert_eq!(value.gradient[0], 0.0);
        assert!(value.failed);
        assert_eq!(objective.failures(), 1);

        let raising = Problem::builder()
            .products(data)
            .parameters(config)
            .options(ProblemOptions::default().with_error_behavior(ErrorBehavior::Raise))
            .build()
            .unwrap();
        let mut objective = raising.objective(weighting);
        match objective.evaluate(&DVector::from_vec(vec![3.0])) {
            Err(BlpError::EvaluationFailed { source }) => {
                assert!(matches!(*source, BlpError::ThetaOutOfBounds { index: 0, .. }))
            }
            other => panic!("expected an evaluation failure, got {other:?}"),
        }
    }

    #[test]
    fn reverting_reuses_the_last_successful_evaluation() {
        let (data, config) = bounded_logit();
        let options =
            ProblemOptions::default().with_error_behavior(ErrorBehavior::Revert { scale: 2.0 });
        let problem = Problem::builder()
            .products(data)
            .parameters(config)
            .options(options)
            .build()
            .unwrap();
        let mut objective = problem.objective(problem.initial_weighting().unwrap());

        let before_any = objective.evaluate(&DVector::from_vec(vec![3.0])).unwrap();
        assert!(before_any.failed);
        assert_eq!(before_any.value, 2.0 * DEFAULT_PUNISHMENT);

        let good = objective.evaluate(&DVector::from_vec(vec![-1.0])).unwrap();
        assert!(!good.failed);
        let reverted = objective.evaluate(&DVector::from_vec(vec![3.0])).unwrap();
        assert!(reverted.failed);
        assert_eq!(reverted.value, 2.0 * good.value);
        assert_eq!(reverted.gradient, good.gradient);
        assert_eq!((objective.evaluations(), objective.failures()), (3, 2));
    }

    #[test]
    fn hessian_is_finite_inside_the_box_and_nan_across_a_bound() {
        let (data, config) = bounded_logit();
        let problem = Problem::builder().products(data).parameters(config).build().unwrap();
        let weighting = problem.initial_weighting().unwrap();
        let theta = DVector::from_vec(vec![-1.0]);
        let hessian = problem.hessian(&theta, &weighting);
        assert_eq!(hessian.shape(), (1, 1));
        assert!(hessian[(0, 0)].is_finite() && hessian[(0, 0)] >= 0.0);

        let at_bound = problem.hessian(&DVector::from_vec(vec![0.0]), &weighting);
        assert!(at_bound[(0, 0)].is_nan());
    }
}
