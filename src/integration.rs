//! Agent-level integration data: nodes, weights, and demographics per market.
//!
//! Node and weight construction is usually done by the caller (quadrature rules, Halton
//! draws, survey samples). [`AgentData::standard_normal`] covers the common Monte Carlo
//! case for convenience.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::data::MarketPartition;
use crate::error::{BlpError, Result};

const WEIGHT_SLACK: f64 = 1e-8;

/// Represents simulated consumer heterogeneity used in BLP demand estimation.
///
/// Agents are stored in contiguous per-market blocks, mirroring product data.
#[derive(Clone, Debug)]
pub struct AgentData {
    market_ids: Vec<String>,
    weights: DVector<f64>,
    nodes: DMatrix<f64>,
    demographics: DMatrix<f64>,
    ranges: HashMap<String, std::ops::Range<usize>>,
}

impl AgentData {
    /// Builds agent data from market ids, integration weights, nodes, and demographics.
    ///
    /// Weights must be positive and sum to one within every market.
    pub fn new(
        market_ids: Vec<String>,
        weights: DVector<f64>,
        nodes: DMatrix<f64>,
        demographics: DMatrix<f64>,
    ) -> Result<Self> {
        let n = market_ids.len();
        if n == 0 {
            return Err(BlpError::dimension_mismatch("agent count", 1, 0));
        }
        if weights.len() != n {
            return Err(BlpError::dimension_mismatch("agent weights", n, weights.len()));
        }
        if nodes.nrows() != n {
            return Err(BlpError::dimension_mismatch("agent nodes", n, nodes.nrows()));
        }
        if demographics.nrows() != n {
            return Err(BlpError::dimension_mismatch(
                "agent demographics",
                n,
                demographics.nrows(),
            ));
        }

        let mut ranges: HashMap<String, std::ops::Range<usize>> = HashMap::new();
        let mut start = 0usize;
        while start < n {
            let market_id = market_ids[start].clone();
            let mut end = start + 1;
            while end < n && market_ids[end] == market_id {
                end += 1;
            }
            if ranges.contains_key(&market_id) {
                return Err(BlpError::NonContiguousMarket { market_id });
            }

            let mut sum = 0.0;
            for weight in weights.rows(start, end - start).iter() {
                if *weight <= 0.0 || !weight.is_finite() {
                    return Err(BlpError::InvalidWeights {
                        market_id,
                        slack: *weight,
                    });
                }
                sum += weight;
            }
            let slack = (sum - 1.0).abs();
            if slack > WEIGHT_SLACK {
                return Err(BlpError::InvalidWeights { market_id, slack });
            }

            ranges.insert(market_id, start..end);
            start = end;
        }

        Ok(Self {
            market_ids,
            weights,
            nodes,
            demographics,
            ranges,
        })
    }

    /// Generates standard normal nodes with uniform weights, replicated for every market.
    ///
    /// Each market receives its own independent draws. No demographics are attached.
    pub fn standard_normal(
        market_ids: &[String],
        draws: usize,
        dimension: usize,
        seed: u64,
    ) -> Result<Self> {
        if draws == 0 {
            return Err(BlpError::dimension_mismatch("simulation draws", 1, 0));
        }
        let mut rng = SmallRng::seed_from_u64(seed);
        let total = market_ids.len() * draws;
        let mut ids = Vec::with_capacity(total);
        let mut values = Vec::with_capacity(total * dimension);
        for market_id in market_ids {
            for _ in 0..draws {
                ids.push(market_id.clone());
                for _ in 0..dimension {
                    values.push(StandardNormal.sample(&mut rng));
                }
            }
        }
        let nodes = DMatrix::from_row_slice(total, dimension, &values);
        let weights = DVector::from_element(total, 1.0 / draws as f64);
        Self::new(ids, weights, nodes, DMatrix::zeros(total, 0))
    }

    /// Generates Monte Carlo agents for every market in `partition`.
    pub fn standard_normal_for(
        partition: &MarketPartition,
        draws: usize,
        dimension: usize,
        seed: u64,
    ) -> Result<Self> {
        let ids: Vec<String> = partition.markets().map(|m| m.id().to_string()).collect();
        Self::standard_normal(&ids, draws, dimension, seed)
    }

    /// Total number of agents.
    pub fn agent_count(&self) -> usize {
        self.weights.len()
    }

    /// Dimension of the integration nodes (`nu`).
    pub fn dimension(&self) -> usize {
        self.nodes.ncols()
    }

    /// Number of demographic variables (`d`).
    pub fn demographics_dim(&self) -> usize {
        self.demographics.ncols()
    }

    /// Returns a view of the node matrix.
    pub fn nodes(&self) -> &DMatrix<f64> {
        &self.nodes
    }

    /// Returns a view of the demographics matrix.
    pub fn demographics(&self) -> &DMatrix<f64> {
        &self.demographics
    }

    /// Returns the associated integration weights (normalized to sum to one per market).
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    /// Market identifier of each agent.
    pub fn market_ids(&self) -> &[String] {
        &self.market_ids
    }

    /// Rows belonging to `market_id`, if that market has agents.
    pub fn market_range(&self, market_id: &str) -> Option<std::ops::Range<usize>> {
        self.ranges.get(market_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_normal_generates_expected_shapes() {
        let markets = vec!["a".to_string(), "b".to_string()];
        let agents = AgentData::standard_normal(&markets, 128, 2, 7).unwrap();
        assert_eq!(agents.agent_count(), 256);
        assert_eq!(agents.dimension(), 2);
        assert_eq!(agents.demographics_dim(), 0);
        let range = agents.market_range("b").unwrap();
        assert_eq!(range, 128..256);
        let weights_sum: f64 = agents.weights.rows(range.start, range.len()).sum();
        assert!((weights_sum - 1.0).abs() < 1e-10);
    }

    #[test]
    fn rejects_weights_that_do_not_sum_to_one() {
        let ids = vec!["m".to_string(), "m".to_string()];
        let result = AgentData::new(
            ids,
            DVector::from_vec(vec![0.5, 0.4]),
            DMatrix::zeros(2, 1),
            DMatrix::zeros(2, 0),
        );
        assert!(matches!(result, Err(BlpError::InvalidWeights { .. })));
    }
}
