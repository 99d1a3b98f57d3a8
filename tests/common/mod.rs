#![allow(dead_code)]

use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// Products per synthetic market.
pub const PRODUCTS: usize = 4;

/// Exogenous draws for a panel of synthetic markets.
pub struct Draws {
    pub market_ids: Vec<String>,
    /// Observed product characteristic.
    pub x: DVector<f64>,
    /// Cost shifter excluded from demand.
    pub w: DVector<f64>,
    pub xi: DVector<f64>,
    /// Prices correlated with `xi`.
    pub prices: DVector<f64>,
    pub firm_ids: Vec<String>,
    pub nesting_ids: Vec<String>,
}

pub fn draws(markets: usize, seed: u64) -> Draws {
    let mut rng = SmallRng::seed_from_u64(seed);
    let n = markets * PRODUCTS;
    let mut normal = || -> f64 { StandardNormal.sample(&mut rng) };
    let x = DVector::from_fn(n, |_, _| normal());
    let w = DVector::from_fn(n, |_, _| normal());
    let xi = DVector::from_fn(n, |_, _| 0.1 * normal());
    let noise = DVector::from_fn(n, |_, _| 0.2 * normal());
    let prices = DVector::from_fn(n, |j, _| (1.5 + 0.5 * w[j] + 0.3 * xi[j] + noise[j]).max(0.2));

    let mut market_ids = Vec::with_capacity(n);
    let mut firm_ids = Vec::with_capacity(n);
    let mut nesting_ids = Vec::with_capacity(n);
    for t in 0..markets {
        for j in 0..PRODUCTS {
            market_ids.push(format!("t{t}"));
            firm_ids.push(format!("f{}", j % 2));
            nesting_ids.push(format!("h{}", j / 2));
        }
    }
    Draws {
        market_ids,
        x,
        w,
        xi,
        prices,
        firm_ids,
        nesting_ids,
    }
}

/// Standard normal nodes shared by every market, with equal weights.
pub fn nodes(agents: usize, dimension: usize, seed: u64) -> DMatrix<f64> {
    let mut rng = SmallRng::seed_from_u64(seed);
    DMatrix::from_fn(agents, dimension, |_, _| rng.sample(StandardNormal))
}

/// Repeats `block` once per market and labels the rows.
pub fn replicate(block: &DMatrix<f64>, markets: usize) -> (Vec<String>, DMatrix<f64>) {
    let rows = block.nrows();
    let ids = (0..markets)
        .flat_map(|t| std::iter::repeat(format!("t{t}")).take(rows))
        .collect();
    let stacked = DMatrix::from_fn(rows * markets, block.ncols(), |r, c| block[(r % rows, c)]);
    (ids, stacked)
}

/// Random coefficients logit shares in contiguous markets of `PRODUCTS` products:
/// utility `delta_j + sum_k nodes[i, k] * sigma[k] * x2[j, k]`, equal agent weights.
pub fn rc_shares(
    delta: &DVector<f64>,
    x2: &DMatrix<f64>,
    sigma: &[f64],
    nodes: &DMatrix<f64>,
) -> DVector<f64> {
    let n = delta.len();
    let agents = nodes.nrows();
    let mut shares = DVector::zeros(n);
    for start in (0..n).step_by(PRODUCTS) {
        for i in 0..agents {
            let exp: Vec<f64> = (start..start + PRODUCTS)
                .map(|j| {
                    let mu: f64 = (0..sigma.len())
                        .map(|k| nodes[(i, k)] * sigma[k] * x2[(j, k)])
                        .sum();
                    (delta[j] + mu).exp()
                })
                .collect();
            let denominator = 1.0 + exp.iter().sum::<f64>();
            for (offset, value) in exp.iter().enumerate() {
                shares[start + offset] += value / denominator / agents as f64;
            }
        }
    }
    shares
}

/// Sum of a characteristic over the other products in the same market.
pub fn rival_sums(x: &DVector<f64>) -> DVector<f64> {
    DVector::from_fn(x.len(), |j, _| {
        let start = j - j % PRODUCTS;
        (start..start + PRODUCTS).filter(|k| *k != j).map(|k| x[k]).sum()
    })
}

/// Columns side by side.
pub fn columns(columns: &[DVector<f64>]) -> DMatrix<f64> {
    DMatrix::from_columns(columns)
}
