//! Share Engine: agent choice probabilities and their analytic derivatives.
//!
//! Every model variant runs through the same nested formulation. Without nesting each
//! product is its own group with a nesting parameter of zero, which collapses the
//! two-stage probabilities to the multinomial logit. Agent utility is
//! `V_ij = delta_j + mu_ij` with `mu_ij = x2_j' (Sigma nu_i + Pi d_i)`.

use nalgebra::{DMatrix, DVector};

use crate::error::{BlpError, Result};
use crate::market::Market;
use crate::parameters::{ParameterKind, ParameterValues};

/// The `delta`-invariant part of utility for one market at one parameter value.
#[derive(Clone, Debug)]
pub struct AgentUtilities {
    /// Random taste coefficients `Sigma nu_i + Pi d_i` (`K2 x I`).
    pub(crate) tastes: DMatrix<f64>,
    /// `mu_ij` (`J x I`).
    pub(crate) mu: DMatrix<f64>,
    /// Nesting parameter of every product.
    pub(crate) rho: DVector<f64>,
    /// Nesting parameter of every local group.
    pub(crate) group_rho: Vec<f64>,
}

impl AgentUtilities {
    /// Computes agent tastes for `market`, rejecting nesting parameters outside `[0, 1)`.
    ///
    /// An empty `pi` means no demographic interactions; otherwise it must have one
    /// column per demographic.
    pub fn new(market: &Market, values: &ParameterValues) -> Result<Self> {
        let k2 = market.x2.ncols();
        let agents = market.agent_count();
        let mut tastes = DMatrix::zeros(k2, agents);
        if k2 > 0 {
            if values.sigma.shape() != (k2, market.nodes.ncols()) {
                return Err(BlpError::dimension_mismatch(
                    "sigma columns",
                    market.nodes.ncols(),
                    values.sigma.ncols(),
                ));
            }
            tastes += &values.sigma * market.nodes.transpose();
            if values.pi.ncols() > 0 {
                if values.pi.ncols() != market.demographics.ncols() {
                    return Err(BlpError::dimension_mismatch(
                        "pi columns",
                        market.demographics.ncols(),
                        values.pi.ncols(),
                    ));
                }
                if values.pi.nrows() != k2 {
                    return Err(BlpError::dimension_mismatch("pi rows", k2, values.pi.nrows()));
                }
                tastes += &values.pi * market.demographics.transpose();
            }
        }
        let mu = &market.x2 * &tastes;

        if market.is_nested() {
            for global in &market.group_rho {
                let value = values.rho.get(*global).copied().unwrap_or(0.0);
                if !(0.0..1.0).contains(&value) {
                    return Err(BlpError::NestingParameterOutOfRange {
                        index: *global,
                        value,
                    });
                }
            }
        }
        let rho = market.product_rho(&values.rho);
        let mut group_rho = vec![0.0; market.group_count()];
        for (j, g) in market.groups.iter().enumerate() {
            group_rho[*g] = rho[j];
        }
        Ok(Self {
            tastes,
            mu,
            rho,
            group_rho,
        })
    }
}

/// Agent-level probabilities at one `delta`, and the derivatives built from them.
#[derive(Clone, Debug)]
pub struct ChoiceState<'a> {
    market: &'a Market,
    utility: &'a AgentUtilities,
    /// `u_ij = V_ij / (1 - rho_j)`.
    scaled: DMatrix<f64>,
    probabilities: DMatrix<f64>,
    /// Within-group probabilities `s_ij / s_ih(j)`.
    conditionals: DMatrix<f64>,
    group_probabilities: DMatrix<f64>,
    /// `log sum_{k in g} exp(u_ik)`.
    log_sums: DMatrix<f64>,
    shares: DVector<f64>,
}

/// Change in one agent's probabilities along a utility direction.
#[derive(Clone, Debug)]
pub(crate) struct AgentTangent {
    pub(crate) probabilities: DVector<f64>,
    pub(crate) conditionals: DVector<f64>,
}

impl<'a> ChoiceState<'a> {
    /// Evaluates choice probabilities at `delta`.
    pub fn new(
        market: &'a Market,
        utility: &'a AgentUtilities,
        delta: &DVector<f64>,
    ) -> Result<Self> {
        let j = market.product_count();
        if delta.len() != j {
            return Err(BlpError::dimension_mismatch("delta length", j, delta.len()));
        }
        let agents = market.agent_count();
        let groups = market.group_count();

        let mut scaled = utility.mu.clone();
        let mut probabilities = DMatrix::zeros(j, agents);
        let mut conditionals = DMatrix::zeros(j, agents);
        let mut group_probabilities = DMatrix::zeros(groups, agents);
        let mut log_sums = DMatrix::zeros(groups, agents);
        let mut maxima = vec![f64::NEG_INFINITY; groups];
        let mut sums = vec![0.0; groups];
        let mut inclusive = vec![0.0; groups];

        for i in 0..agents {
            maxima.fill(f64::NEG_INFINITY);
            sums.fill(0.0);
            for k in 0..j {
                let u = (delta[k] + utility.mu[(k, i)]) / (1.0 - utility.rho[k]);
                scaled[(k, i)] = u;
                let g = market.groups[k];
                maxima[g] = maxima[g].max(u);
            }
            for k in 0..j {
                let g = market.groups[k];
                sums[g] += (scaled[(k, i)] - maxima[g]).exp();
            }
            let mut top = 0.0f64;
            for g in 0..groups {
                log_sums[(g, i)] = maxima[g] + sums[g].ln();
                inclusive[g] = (1.0 - utility.group_rho[g]) * log_sums[(g, i)];
                top = top.max(inclusive[g]);
            }
            let denominator = (-top).exp() + inclusive.iter().map(|v| (v - top).exp()).sum::<f64>();
            for g in 0..groups {
                group_probabilities[(g, i)] = (inclusive[g] - top).exp() / denominator;
            }
            for k in 0..j {
                let g = market.groups[k];
                let conditional = (scaled[(k, i)] - log_sums[(g, i)]).exp();
                conditionals[(k, i)] = conditional;
                probabilities[(k, i)] = conditional * group_probabilities[(g, i)];
            }
        }

        if probabilities.iter().any(|v| !v.is_finite()) {
            return Err(BlpError::NumericalError {
                context: "choice probabilities",
            });
        }
        let shares = &probabilities * &market.weights;
        Ok(Self {
            market,
            utility,
            scaled,
            probabilities,
            conditionals,
            group_probabilities,
            log_sums,
            shares,
        })
    }

    /// Predicted market shares `sum_i w_i s_ij`.
    pub fn shares(&self) -> &DVector<f64> {
        &self.shares
    }

    /// Agent choice probabilities (`J x I`).
    pub fn probabilities(&self) -> &DMatrix<f64> {
        &self.probabilities
    }

    pub fn market(&self) -> &Market {
        self.market
    }

    /// `d s / d delta` (`J x J`).
    pub fn delta_jacobian(&self) -> DMatrix<f64> {
        let ones = DVector::from_element(self.market.agent_count(), 1.0);
        let (lambda, gamma) = self.lambda_gamma(&ones);
        DMatrix::from_diagonal(&lambda) - gamma
    }

    /// `d s / d theta` holding `delta` fixed (`J x P`). Linear parameters have zero columns.
    pub fn theta_jacobian(&self, kinds: &[ParameterKind]) -> DMatrix<f64> {
        let j = self.market.product_count();
        let mut jacobian = DMatrix::zeros(j, kinds.len());
        let zero = DVector::zeros(j);
        for (p, kind) in kinds.iter().enumerate() {
            if matches!(kind, ParameterKind::Beta { .. } | ParameterKind::Gamma { .. }) {
                continue;
            }
            let mut column = DVector::zeros(j);
            for i in 0..self.market.agent_count() {
                let (dv, dr) = self.agent_direction(i, kind, &zero);
                let tangent = self.agent_tangent(i, &dv, &dr);
                column.axpy(self.market.weights[i], &tangent.probabilities, 1.0);
            }
            jacobian.set_column(p, &column);
        }
        jacobian
    }

    /// Per-agent derivative of utility with respect to own price, `alpha + tastes_i[price]`.
    pub fn price_slopes(&self, alpha: f64) -> DVector<f64> {
        let agents = self.market.agent_count();
        match self.market.x2_price_column {
            Some(column) => DVector::from_iterator(
                agents,
                (0..agents).map(|i| alpha + self.utility.tastes[(column, i)]),
            ),
            None => DVector::from_element(agents, alpha),
        }
    }

    /// The decomposition `d s / d p = diag(Lambda) - Gamma` at the given utility-price slopes.
    pub fn lambda_gamma(&self, slopes: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
        let j = self.market.product_count();
        let mut weighted = self.probabilities.clone();
        for (i, mut column) in weighted.column_iter_mut().enumerate() {
            column *= self.market.weights[i] * slopes[i];
        }
        let lambda = DVector::from_iterator(
            j,
            (0..j).map(|k| weighted.row(k).sum() / (1.0 - self.utility.rho[k])),
        );
        let mut gamma = &weighted * self.probabilities.transpose();
        if self.market.is_nested() {
            let within = &weighted * self.conditionals.transpose();
            for r in 0..j {
                let ratio = self.utility.rho[r] / (1.0 - self.utility.rho[r]);
                for c in 0..j {
                    if self.market.groups[r] == self.market.groups[c] {
                        gamma[(r, c)] += ratio * within[(r, c)];
                    }
                }
            }
        }
        (lambda, gamma)
    }

    /// `d s / d p` (`J x J`) given the mean price coefficient `alpha`.
    pub fn price_jacobian(&self, alpha: f64) -> DMatrix<f64> {
        let (lambda, gamma) = self.lambda_gamma(&self.price_slopes(alpha));
        DMatrix::from_diagonal(&lambda) - gamma
    }

    /// Directional derivative of [`price_jacobian`](Self::price_jacobian) with respect to
    /// the parameter `kind`, where `d_delta` is the total change of `delta` along that
    /// parameter.
    pub fn price_jacobian_tangent(
        &self,
        alpha: f64,
        d_delta: &DVector<f64>,
        kind: &ParameterKind,
    ) -> DMatrix<f64> {
        let j = self.market.product_count();
        let slopes = self.price_slopes(alpha);
        let price_column = self.market.x2_price_column;
        let x1_price_column = self.market.x1_price_column;
        let mut tangent = DMatrix::zeros(j, j);
        for i in 0..self.market.agent_count() {
            let d_slope = match *kind {
                ParameterKind::Beta { index } if Some(index) == x1_price_column => 1.0,
                ParameterKind::Sigma { row, col } if Some(row) == price_column => {
                    self.market.nodes[(i, col)]
                }
                ParameterKind::Pi { row, col } if Some(row) == price_column => {
                    self.market.demographics[(i, col)]
                }
                _ => 0.0,
            };
            let (dv, dr) = self.agent_direction(i, kind, d_delta);
            let change = self.agent_tangent(i, &dv, &dr);
            let s = self.probabilities.column(i);
            let c = self.conditionals.column(i);
            let weight = self.market.weights[i];
            for r in 0..j {
                let rho = self.utility.rho[r];
                let d_rho = dr[r];
                for k in 0..j {
                    let same = self.market.groups[r] == self.market.groups[k];
                    let mut base = -s[k];
                    let mut d_base = -change.probabilities[k];
                    if r == k {
                        base += 1.0 / (1.0 - rho);
                        d_base += d_rho / (1.0 - rho).powi(2);
                    }
                    if same {
                        base -= rho / (1.0 - rho) * c[k];
                        d_base -= d_rho / (1.0 - rho).powi(2) * c[k]
                            + rho / (1.0 - rho) * change.conditionals[k];
                    }
                    let agent = s[r] * base;
                    let d_agent = change.probabilities[r] * base + s[r] * d_base;
                    tangent[(r, k)] += weight * (d_slope * agent + slopes[i] * d_agent);
                }
            }
        }
        tangent
    }

    /// Utility and nesting-parameter directions for agent `i` along `kind`, with `d_delta`
    /// added to the utility direction.
    pub(crate) fn agent_direction(
        &self,
        i: usize,
        kind: &ParameterKind,
        d_delta: &DVector<f64>,
    ) -> (DVector<f64>, DVector<f64>) {
        let market = self.market;
        let j = market.product_count();
        let mut dv = d_delta.clone();
        let mut dr = DVector::zeros(j);
        match *kind {
            ParameterKind::Sigma { row, col } => {
                let node = market.nodes[(i, col)];
                dv.axpy(node, &market.x2.column(row), 1.0);
            }
            ParameterKind::Pi { row, col } => {
                let demographic = market.demographics[(i, col)];
                dv.axpy(demographic, &market.x2.column(row), 1.0);
            }
            ParameterKind::Rho { group } if market.is_nested() => {
                for k in 0..j {
                    let global = market.group_rho[market.groups[k]];
                    if group.map_or(true, |g| g == global) {
                        dr[k] = 1.0;
                    }
                }
            }
            _ => {}
        }
        (dv, dr)
    }

    /// Change of agent `i`'s probabilities given utility changes `dv` and nesting parameter
    /// changes `dr` (both per product).
    pub(crate) fn agent_tangent(
        &self,
        i: usize,
        dv: &DVector<f64>,
        dr: &DVector<f64>,
    ) -> AgentTangent {
        let market = self.market;
        let j = market.product_count();
        let groups = market.group_count();
        let mut du = DVector::zeros(j);
        let mut d_log_sums = vec![0.0; groups];
        let mut group_dr = vec![0.0; groups];
        for k in 0..j {
            let g = market.groups[k];
            du[k] = (dv[k] + self.scaled[(k, i)] * dr[k]) / (1.0 - self.utility.rho[k]);
            d_log_sums[g] += self.conditionals[(k, i)] * du[k];
            group_dr[g] = dr[k];
        }
        let mut d_inclusive = vec![0.0; groups];
        let mut average = 0.0;
        for g in 0..groups {
            d_inclusive[g] = -group_dr[g] * self.log_sums[(g, i)]
                + (1.0 - self.utility.group_rho[g]) * d_log_sums[g];
            average += self.group_probabilities[(g, i)] * d_inclusive[g];
        }
        let mut probabilities = DVector::zeros(j);
        let mut conditionals = DVector::zeros(j);
        for k in 0..j {
            let g = market.groups[k];
            let d_log_conditional = du[k] - d_log_sums[g];
            conditionals[k] = self.conditionals[(k, i)] * d_log_conditional;
            probabilities[k] =
                self.probabilities[(k, i)] * (d_log_conditional + d_inclusive[g] - average);
        }
        AgentTangent {
            probabilities,
            conditionals,
        }
    }
}

/// Convenience wrapper: predicted shares at `delta` and `values`.
pub fn predict_shares(
    market: &Market,
    values: &ParameterValues,
    delta: &DVector<f64>,
) -> Result<DVector<f64>> {
    let utility = AgentUtilities::new(market, values)?;
    let state = ChoiceState::new(market, &utility, delta)?;
    Ok(state.shares().clone())
}
