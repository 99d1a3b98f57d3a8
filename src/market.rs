//! The market unit: one market's products, ownership, nesting structure, and agents,
//! copied into contiguous buffers so every per-market computation is self-contained.

use std::ops::Range;

use nalgebra::{DMatrix, DVector};

use crate::data::ProductData;
use crate::error::{BlpError, Result};
use crate::integration::AgentData;

const OWNERSHIP_TOLERANCE: f64 = 1e-12;

/// Read-only per-market data used by the share, delta, and price solvers.
#[derive(Clone, Debug)]
pub struct Market {
    index: usize,
    id: String,
    products: Range<usize>,
    pub(crate) shares: DVector<f64>,
    pub(crate) prices: DVector<f64>,
    pub(crate) x1: DMatrix<f64>,
    pub(crate) x2: DMatrix<f64>,
    pub(crate) x3: DMatrix<f64>,
    pub(crate) x1_price_column: Option<usize>,
    pub(crate) x2_price_column: Option<usize>,
    pub(crate) ownership: DMatrix<f64>,
    /// Local nesting group of each product; each product is its own group without nesting.
    pub(crate) groups: Vec<usize>,
    /// Global nesting group (index into `rho`) of each local group; empty without nesting.
    pub(crate) group_rho: Vec<usize>,
    pub(crate) weights: DVector<f64>,
    pub(crate) nodes: DMatrix<f64>,
    pub(crate) demographics: DMatrix<f64>,
}

impl Market {
    /// Slices market `index` out of the product and agent data.
    ///
    /// Markets without agents receive a single representative agent with unit weight,
    /// which is only valid when there are no random coefficients.
    pub fn new(data: &ProductData, agents: Option<&AgentData>, index: usize) -> Result<Self> {
        let segment = data.partition().segment(index);
        let range = segment.range();
        let j = range.len();
        let k2 = data.nonlinear_dim();

        let rows = |m: &DMatrix<f64>| m.rows(range.start, j).into_owned();
        let shares = data.shares().rows(range.start, j).into_owned();
        let prices = data
            .prices()
            .map(|p| p.rows(range.start, j).into_owned())
            .unwrap_or_else(|| DVector::zeros(j));

        let ownership = match (data.ownership(), data.firm_ids()) {
            (Some(rows), _) => {
                let ownership = rows.view((range.start, 0), (j, j)).into_owned();
                validate_ownership(segment.id(), &ownership)?;
                ownership
            }
            (None, Some(firms)) => ownership_from_firms(&firms[range.clone()]),
            (None, None) => DMatrix::identity(j, j),
        };

        let (groups, group_rho) = match data.nesting() {
            Some(nesting) => {
                let mut group_rho: Vec<usize> = Vec::new();
                let groups = nesting.indices()[range.clone()]
                    .iter()
                    .map(|global| match group_rho.iter().position(|g| g == global) {
                        Some(local) => local,
                        None => {
                            group_rho.push(*global);
                            group_rho.len() - 1
                        }
                    })
                    .collect();
                (groups, group_rho)
            }
            None => ((0..j).collect(), Vec::new()),
        };

        let located = agents.and_then(|a| a.market_range(segment.id()).map(|r| (a, r)));
        let (weights, nodes, demographics) = match located {
            Some((agents, agent_range)) => {
                if agents.dimension() < k2 {
                    return Err(BlpError::dimension_mismatch(
                        "agent node columns",
                        k2,
                        agents.dimension(),
                    ));
                }
                let count = agent_range.len();
                (
                    agents.weights().rows(agent_range.start, count).into_owned(),
                    agents
                        .nodes()
                        .view((agent_range.start, 0), (count, k2))
                        .into_owned(),
                    agents
                        .demographics()
                        .rows(agent_range.start, count)
                        .into_owned(),
                )
            }
            None => {
                let demographics_dim = agents.map_or(0, AgentData::demographics_dim);
                (
                    DVector::from_element(1, 1.0),
                    DMatrix::zeros(1, k2),
                    DMatrix::zeros(1, demographics_dim),
                )
            }
        };

        Ok(Self {
            index,
            id: segment.id().to_string(),
            products: range.clone(),
            shares,
            prices,
            x1: rows(data.x1()),
            x2: rows(data.x2()),
            x3: rows(data.x3()),
            x1_price_column: data.x1_price_column(),
            x2_price_column: data.x2_price_column(),
            ownership,
            groups,
            group_rho,
            weights,
            nodes,
            demographics,
        })
    }

    /// Builds every market of `data`.
    pub fn all(data: &ProductData, agents: Option<&AgentData>) -> Result<Vec<Self>> {
        (0..data.partition().market_count())
            .map(|t| Self::new(data, agents, t))
            .collect()
    }

    /// Position of the market in the partition.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Market identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Global product indices of this market.
    pub fn products(&self) -> Range<usize> {
        self.products.clone()
    }

    /// Number of products (`J_t`).
    pub fn product_count(&self) -> usize {
        self.shares.len()
    }

    /// Number of agents (`I_t`).
    pub fn agent_count(&self) -> usize {
        self.weights.len()
    }

    /// Observed shares.
    pub fn shares(&self) -> &DVector<f64> {
        &self.shares
    }

    /// Observed outside share `1 - sum_j s_j`.
    pub fn outside_share(&self) -> f64 {
        1.0 - self.shares.sum()
    }

    /// Prices (zeros when none were supplied).
    pub fn prices(&self) -> &DVector<f64> {
        &self.prices
    }

    /// Ownership matrix `O` (`J x J`).
    pub fn ownership(&self) -> &DMatrix<f64> {
        &self.ownership
    }

    /// Integration weights of this market's agents.
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    /// Whether products are grouped into nests.
    pub fn is_nested(&self) -> bool {
        !self.group_rho.is_empty()
    }

    /// Number of local groups (products themselves without nesting).
    pub fn group_count(&self) -> usize {
        if self.is_nested() {
            self.group_rho.len()
        } else {
            self.product_count()
        }
    }

    /// Per-product nesting parameter given one `rho` per global nesting group.
    pub fn product_rho(&self, rho: &DVector<f64>) -> DVector<f64> {
        if !self.is_nested() || rho.is_empty() {
            return DVector::zeros(self.product_count());
        }
        DVector::from_iterator(
            self.product_count(),
            self.groups.iter().map(|g| rho[self.group_rho[*g]]),
        )
    }

    /// Observed within-group shares `s_j / s_h(j)`.
    pub fn observed_group_shares(&self) -> DVector<f64> {
        let mut totals = vec![0.0; self.group_count()];
        for (j, g) in self.groups.iter().enumerate() {
            totals[*g] += self.shares[j];
        }
        DVector::from_iterator(self.product_count(), self.groups.iter().map(|g| totals[*g]))
    }

    /// Copy of this market evaluated at different prices; price columns of `X1` and `X2`
    /// are updated alongside.
    pub fn with_prices(&self, prices: &DVector<f64>) -> Self {
        let mut market = self.clone();
        market.prices.copy_from(prices);
        if let Some(column) = self.x1_price_column {
            market.x1.set_column(column, prices);
        }
        if let Some(column) = self.x2_price_column {
            market.x2.set_column(column, prices);
        }
        market
    }

    /// Copy of this market with a different ownership matrix (e.g. a merger counterfactual).
    pub fn with_ownership(&self, ownership: DMatrix<f64>) -> Result<Self> {
        let j = self.product_count();
        if ownership.shape() != (j, j) {
            return Err(BlpError::dimension_mismatch("ownership shape", j, ownership.nrows()));
        }
        validate_ownership(&self.id, &ownership)?;
        let mut market = self.clone();
        market.ownership = ownership;
        Ok(market)
    }
}

/// Standard ownership matrix: `O[j, k] = 1` iff products `j` and `k` share a firm.
pub fn ownership_from_firms(firm_ids: &[String]) -> DMatrix<f64> {
    let j = firm_ids.len();
    DMatrix::from_fn(j, j, |r, c| if firm_ids[r] == firm_ids[c] { 1.0 } else { 0.0 })
}

fn validate_ownership(market_id: &str, ownership: &DMatrix<f64>) -> Result<()> {
    let invalid = |reason| BlpError::InvalidOwnership {
        market_id: market_id.to_string(),
        reason,
    };
    for j in 0..ownership.nrows() {
        if (ownership[(j, j)] - 1.0).abs() > OWNERSHIP_TOLERANCE {
            return Err(invalid("diagonal entries must equal one"));
        }
        for k in 0..j {
            if (ownership[(j, k)] - ownership[(k, j)]).abs() > OWNERSHIP_TOLERANCE {
                return Err(invalid("matrix must be symmetric"));
            }
            if !(0.0..=1.0).contains(&ownership[(j, k)]) {
                return Err(invalid("entries must lie in [0, 1]"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ProductDataBuilder;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn slices_products_agents_and_nests() {
        let data = ProductDataBuilder::new(
            ids(&["a", "a", "a", "b"]),
            DVector::from_vec(vec![0.2, 0.1, 0.3, 0.5]),
        )
        .x1(DMatrix::from_element(4, 1, 1.0))
        .x2(DMatrix::from_row_slice(4, 1, &[1.0, 2.0, 3.0, 4.0]))
        .firm_ids(ids(&["f", "g", "f", "f"]))
        .nesting_ids(ids(&["y", "x", "y", "x"]))
        .build()
        .unwrap();
        let agents = AgentData::standard_normal_for(data.partition(), 5, 2, 3).unwrap();
        let markets = Market::all(&data, Some(&agents)).unwrap();

        assert_eq!(markets.len(), 2);
        let a = &markets[0];
        assert_eq!(a.product_count(), 3);
        assert_eq!(a.agent_count(), 5);
        assert_eq!(a.nodes.ncols(), 1);
        assert_eq!(a.ownership[(0, 2)], 1.0);
        assert_eq!(a.ownership[(0, 1)], 0.0);
        assert_eq!(a.groups, vec![0, 1, 0]);
        assert_eq!(a.group_rho, vec![1, 0]);
        let rho = a.product_rho(&DVector::from_vec(vec![0.1, 0.7]));
        assert_eq!(rho.as_slice(), &[0.7, 0.1, 0.7]);
        let within = a.observed_group_shares();
        assert!((within[0] - 0.5).abs() < 1e-12);
        assert!((a.outside_share() - 0.4).abs() < 1e-12);
        assert_eq!(markets[1].products(), 3..4);
    }

    #[test]
    fn rejects_asymmetric_ownership() {
        let market_ids = ids(&["a", "a"]);
        let data = ProductDataBuilder::new(market_ids, DVector::from_vec(vec![0.2, 0.1]))
            .x1(DMatrix::from_element(2, 1, 1.0))
            .ownership(DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]))
            .build()
            .unwrap();
        assert!(matches!(
            Market::new(&data, None, 0),
            Err(BlpError::InvalidOwnership { .. })
        ));
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use nalgebra::{DMatrix, DVector};

    use super::Market;
    use crate::data::ProductDataBuilder;
    use crate::integration::AgentData;
    use crate::parameters::ParameterValues;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    pub(crate) const PRICES: [f64; 4] = [1.0, 1.5, 0.8, 2.0];

    /// Four products in two nests, prices in both `X1` and `X2`, two tastes and one
    /// demographic over six agents.
    pub(crate) fn market(nested: bool) -> Market {
        let characteristic = [0.3, -0.4, 1.1, 0.6];
        let prices = DVector::from_row_slice(&PRICES);
        let x1 = DMatrix::from_fn(4, 3, |j, k| match k {
            0 => 1.0,
            1 => PRICES[j],
            _ => characteristic[j],
        });
        let x2 = DMatrix::from_fn(4, 2, |j, k| if k == 0 { characteristic[j] } else { PRICES[j] });
        let x3 = DMatrix::from_fn(4, 2, |j, k| if k == 0 { 1.0 } else { characteristic[j] });
        let mut builder = ProductDataBuilder::new(
            ids(&["t", "t", "t", "t"]),
            DVector::from_vec(vec![0.15, 0.1, 0.2, 0.25]),
        )
        .prices(prices)
        .x1(x1)
        .x1_price_column(1)
        .x2(x2)
        .x2_price_column(1)
        .x3(x3)
        .firm_ids(ids(&["a", "a", "b", "c"]));
        if nested {
            builder = builder.nesting_ids(ids(&["h1", "h1", "h2", "h2"]));
        }
        let data = builder.build().unwrap();

        let nodes = DMatrix::from_row_slice(
            6,
            2,
            &[0.5, -1.2, -0.3, 0.8, 1.4, 0.1, -0.9, -0.4, 0.2, 1.7, -1.6, 0.6],
        );
        let demographics = DMatrix::from_row_slice(6, 1, &[0.4, -0.7, 1.2, 0.0, -1.1, 0.5]);
        let agents = AgentData::new(
            ids(&["t"; 6]),
            DVector::from_element(6, 1.0 / 6.0),
            nodes,
            demographics,
        )
        .unwrap();
        Market::new(&data, Some(&agents), 0).unwrap()
    }

    pub(crate) fn values(nested: bool) -> ParameterValues {
        ParameterValues {
            sigma: DMatrix::from_row_slice(2, 2, &[0.5, 0.1, 0.0, 0.3]),
            pi: DMatrix::from_row_slice(2, 1, &[0.2, -0.1]),
            rho: if nested {
                DVector::from_vec(vec![0.4, 0.2])
            } else {
                DVector::zeros(0)
            },
            beta: DVector::from_vec(vec![1.0, -2.0, 0.5]),
            gamma: DVector::from_vec(vec![0.5, 0.2]),
        }
    }
}
