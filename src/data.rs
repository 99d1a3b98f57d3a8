//! Product data: observed shares, design matrices, and the market partition.
//!
//! The design matrices (`X1`, `X2`, `X3`, `ZD`, `ZS`) arrive fully formed from whatever
//! formulation layer the caller uses; this module only validates their shapes and
//! the market structure, and records which columns hold prices.

use std::collections::{BTreeSet, HashSet};

use nalgebra::{DMatrix, DVector};

use crate::error::{BlpError, Result};

/// Validated product-level inputs, stacked over markets in contiguous blocks.
#[derive(Clone, Debug)]
pub struct ProductData {
    market_ids: Vec<String>,
    shares: DVector<f64>,
    prices: Option<DVector<f64>>,
    x1: DMatrix<f64>,
    x2: DMatrix<f64>,
    x3: DMatrix<f64>,
    x1_price_column: Option<usize>,
    x2_price_column: Option<usize>,
    demand_instruments: DMatrix<f64>,
    supply_instruments: DMatrix<f64>,
    firm_ids: Option<Vec<String>>,
    ownership: Option<DMatrix<f64>>,
    nesting: Option<Grouping>,
    clustering: Option<Grouping>,
    partition: MarketPartition,
}

impl ProductData {
    /// Number of products across all markets.
    pub fn product_count(&self) -> usize {
        self.shares.len()
    }

    /// Number of linear characteristics (`X1`).
    pub fn linear_dim(&self) -> usize {
        self.x1.ncols()
    }

    /// Number of nonlinear characteristics (`X2`).
    pub fn nonlinear_dim(&self) -> usize {
        self.x2.ncols()
    }

    /// Number of cost characteristics (`X3`); zero when no supply side is modeled.
    pub fn cost_dim(&self) -> usize {
        self.x3.ncols()
    }

    /// Number of demand-side instruments.
    pub fn demand_instrument_dim(&self) -> usize {
        self.demand_instruments.ncols()
    }

    /// Number of supply-side instruments.
    pub fn supply_instrument_dim(&self) -> usize {
        self.supply_instruments.ncols()
    }

    /// Whether a supply side (`X3`) was supplied.
    pub fn has_supply(&self) -> bool {
        self.x3.ncols() > 0
    }

    /// Returns a read-only view of the linear characteristics matrix (`X1`).
    pub fn x1(&self) -> &DMatrix<f64> {
        &self.x1
    }

    /// Returns a read-only view of the nonlinear characteristics matrix (`X2`).
    pub fn x2(&self) -> &DMatrix<f64> {
        &self.x2
    }

    /// Returns a read-only view of the cost characteristics matrix (`X3`).
    pub fn x3(&self) -> &DMatrix<f64> {
        &self.x3
    }

    /// Column of `X1` holding prices, if any.
    pub fn x1_price_column(&self) -> Option<usize> {
        self.x1_price_column
    }

    /// Column of `X2` holding prices, if any.
    pub fn x2_price_column(&self) -> Option<usize> {
        self.x2_price_column
    }

    /// Returns a read-only view of the demand-side instrument matrix (`ZD`).
    pub fn demand_instruments(&self) -> &DMatrix<f64> {
        &self.demand_instruments
    }

    /// Returns a read-only view of the supply-side instrument matrix (`ZS`).
    pub fn supply_instruments(&self) -> &DMatrix<f64> {
        &self.supply_instruments
    }

    /// Returns a read-only view of product market shares.
    pub fn shares(&self) -> &DVector<f64> {
        &self.shares
    }

    /// Product prices, if supplied.
    pub fn prices(&self) -> Option<&DVector<f64>> {
        self.prices.as_ref()
    }

    /// Firm identifiers, if supplied.
    pub fn firm_ids(&self) -> Option<&[String]> {
        self.firm_ids.as_deref()
    }

    /// Custom ownership rows (`N x max J_t`), if supplied.
    pub fn ownership(&self) -> Option<&DMatrix<f64>> {
        self.ownership.as_ref()
    }

    /// Nesting group structure, if supplied.
    pub fn nesting(&self) -> Option<&Grouping> {
        self.nesting.as_ref()
    }

    /// Number of distinct nesting groups (`H`), zero without nesting.
    pub fn nesting_group_count(&self) -> usize {
        self.nesting.as_ref().map_or(0, Grouping::group_count)
    }

    /// Clustering structure used by clustered covariance estimators, if supplied.
    pub fn clustering(&self) -> Option<&Grouping> {
        self.clustering.as_ref()
    }

    /// Provides access to the precomputed market partition.
    pub fn partition(&self) -> &MarketPartition {
        &self.partition
    }

    /// Market identifier of every product.
    pub fn market_ids(&self) -> &[String] {
        &self.market_ids
    }
}

/// Assignment of products to a sorted set of group labels (nests or clusters).
#[derive(Clone, Debug)]
pub struct Grouping {
    labels: Vec<String>,
    index: Vec<usize>,
}

impl Grouping {
    fn new(ids: &[String]) -> Self {
        let labels: Vec<String> = ids
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index = ids
            .iter()
            .map(|id| labels.binary_search(id).unwrap_or_else(|position| position))
            .collect();
        Self { labels, index }
    }

    /// Sorted unique group labels.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Number of distinct groups.
    pub fn group_count(&self) -> usize {
        self.labels.len()
    }

    /// Group index (into [`labels`](Self::labels)) of every product.
    pub fn indices(&self) -> &[usize] {
        &self.index
    }
}

/// Builder that validates dimensions and market structure before constructing [`ProductData`].
#[derive(Debug)]
pub struct ProductDataBuilder {
    market_ids: Vec<String>,
    shares: DVector<f64>,
    prices: Option<DVector<f64>>,
    x1: Option<DMatrix<f64>>,
    x2: Option<DMatrix<f64>>,
    x3: Option<DMatrix<f64>>,
    x1_price_column: Option<usize>,
    x2_price_column: Option<usize>,
    demand_instruments: Option<DMatrix<f64>>,
    supply_instruments: Option<DMatrix<f64>>,
    firm_ids: Option<Vec<String>>,
    ownership: Option<DMatrix<f64>>,
    nesting_ids: Option<Vec<String>>,
    clustering_ids: Option<Vec<String>>,
}

impl ProductDataBuilder {
    /// Start building product data from market identifiers and observed shares.
    pub fn new(market_ids: Vec<String>, shares: DVector<f64>) -> Self {
        Self {
            market_ids,
            shares,
            prices: None,
            x1: None,
            x2: None,
            x3: None,
            x1_price_column: None,
            x2_price_column: None,
            demand_instruments: None,
            supply_instruments: None,
            firm_ids: None,
            ownership: None,
            nesting_ids: None,
            clustering_ids: None,
        }
    }

    /// Sets product prices.
    pub fn prices(mut self, prices: DVector<f64>) -> Self {
        self.prices = Some(prices);
        self
    }

    /// Sets the linear characteristics matrix (`X1`).
    pub fn x1(mut self, matrix: DMatrix<f64>) -> Self {
        self.x1 = Some(matrix);
        self
    }

    /// Sets the nonlinear characteristics matrix (`X2`).
    pub fn x2(mut self, matrix: DMatrix<f64>) -> Self {
        self.x2 = Some(matrix);
        self
    }

    /// Sets the cost characteristics matrix (`X3`), which turns on the supply side.
    pub fn x3(mut self, matrix: DMatrix<f64>) -> Self {
        self.x3 = Some(matrix);
        self
    }

    /// Marks a column of `X1` as prices.
    pub fn x1_price_column(mut self, column: usize) -> Self {
        self.x1_price_column = Some(column);
        self
    }

    /// Marks a column of `X2` as prices.
    pub fn x2_price_column(mut self, column: usize) -> Self {
        self.x2_price_column = Some(column);
        self
    }

    /// Sets the demand-side instrument matrix (`ZD`).
    pub fn demand_instruments(mut self, matrix: DMatrix<f64>) -> Self {
        self.demand_instruments = Some(matrix);
        self
    }

    /// Alias of [`demand_instruments`](Self::demand_instruments).
    pub fn instruments(self, matrix: DMatrix<f64>) -> Self {
        self.demand_instruments(matrix)
    }

    /// Sets the supply-side instrument matrix (`ZS`).
    pub fn supply_instruments(mut self, matrix: DMatrix<f64>) -> Self {
        self.supply_instruments = Some(matrix);
        self
    }

    /// Sets firm identifiers used to build standard ownership matrices.
    pub fn firm_ids(mut self, ids: Vec<String>) -> Self {
        self.firm_ids = Some(ids);
        self
    }

    /// Sets custom ownership rows: row `j` holds product `j`'s ownership of the products
    /// in its market, left-aligned and padded with anything beyond `J_t`.
    pub fn ownership(mut self, matrix: DMatrix<f64>) -> Self {
        self.ownership = Some(matrix);
        self
    }

    /// Sets nesting group identifiers.
    pub fn nesting_ids(mut self, ids: Vec<String>) -> Self {
        self.nesting_ids = Some(ids);
        self
    }

    /// Sets clustering identifiers for clustered covariance estimators.
    pub fn clustering_ids(mut self, ids: Vec<String>) -> Self {
        self.clustering_ids = Some(ids);
        self
    }

    /// Finalizes construction after validating shapes and market structure.
    pub fn build(self) -> Result<ProductData> {
        let n = self.market_ids.len();
        if self.shares.len() != n {
            return Err(BlpError::dimension_mismatch(
                "shares length",
                n,
                self.shares.len(),
            ));
        }

        for (index, share) in self.shares.iter().enumerate() {
            if *share <= 0.0 {
                return Err(BlpError::NonPositiveShare {
                    index,
                    share: *share,
                });
            }
        }

        let x1 = self.x1.ok_or_else(|| BlpError::missing_component("X1"))?;
        if x1.nrows() != n {
            return Err(BlpError::dimension_mismatch("X1 rows", n, x1.nrows()));
        }

        let x2 = self.x2.unwrap_or_else(|| DMatrix::zeros(n, 0));
        if x2.nrows() != n {
            return Err(BlpError::dimension_mismatch("X2 rows", n, x2.nrows()));
        }

        let x3 = self.x3.unwrap_or_else(|| DMatrix::zeros(n, 0));
        if x3.nrows() != n {
            return Err(BlpError::dimension_mismatch("X3 rows", n, x3.nrows()));
        }

        if let Some(prices) = &self.prices {
            if prices.len() != n {
                return Err(BlpError::dimension_mismatch("prices length", n, prices.len()));
            }
        }
        check_price_column(&x1, self.x1_price_column, self.prices.as_ref(), "X1")?;
        check_price_column(&x2, self.x2_price_column, self.prices.as_ref(), "X2")?;

        let demand_instruments = self.demand_instruments.unwrap_or_else(|| x1.clone());
        if demand_instruments.nrows() != n {
            return Err(BlpError::dimension_mismatch(
                "ZD rows",
                n,
                demand_instruments.nrows(),
            ));
        }

        let supply_instruments = self.supply_instruments.unwrap_or_else(|| x3.clone());
        if supply_instruments.nrows() != n {
            return Err(BlpError::dimension_mismatch(
                "ZS rows",
                n,
                supply_instruments.nrows(),
            ));
        }

        if x3.ncols() > 0 {
            if self.prices.is_none() {
                return Err(BlpError::missing_component("prices"));
            }
            if self.firm_ids.is_none() && self.ownership.is_none() {
                return Err(BlpError::missing_component("firm_ids"));
            }
            if supply_instruments.ncols() == 0 {
                return Err(BlpError::missing_component("ZS"));
            }
        }

        for (name, ids) in [
            ("firm_ids length", &self.firm_ids),
            ("nesting_ids length", &self.nesting_ids),
            ("clustering_ids length", &self.clustering_ids),
        ] {
            if let Some(ids) = ids {
                if ids.len() != n {
                    return Err(BlpError::dimension_mismatch(name, n, ids.len()));
                }
            }
        }
        if let Some(ownership) = &self.ownership {
            if ownership.nrows() != n {
                return Err(BlpError::dimension_mismatch(
                    "ownership rows",
                    n,
                    ownership.nrows(),
                ));
            }
        }

        let partition = MarketPartition::new(&self.market_ids, &self.shares)?;
        if let Some(ownership) = &self.ownership {
            let widest = partition
                .markets()
                .map(MarketSegment::product_count)
                .max()
                .unwrap_or(0);
            if ownership.ncols() < widest {
                return Err(BlpError::dimension_mismatch(
                    "ownership columns",
                    widest,
                    ownership.ncols(),
                ));
            }
        }

        Ok(ProductData {
            market_ids: self.market_ids,
            shares: self.shares,
            prices: self.prices,
            x1,
            x2,
            x3,
            x1_price_column: self.x1_price_column,
            x2_price_column: self.x2_price_column,
            demand_instruments,
            supply_instruments,
            firm_ids: self.firm_ids,
            ownership: self.ownership,
            nesting: self.nesting_ids.as_deref().map(Grouping::new),
            clustering: self.clustering_ids.as_deref().map(Grouping::new),
            partition,
        })
    }
}

fn check_price_column(
    matrix: &DMatrix<f64>,
    column: Option<usize>,
    prices: Option<&DVector<f64>>,
    name: &str,
) -> Result<()> {
    let Some(column) = column else {
        return Ok(());
    };
    if column >= matrix.ncols() {
        return Err(BlpError::invalid_configuration(format!(
            "{name} price column {column} is out of range for {} columns",
            matrix.ncols()
        )));
    }
    let prices = prices.ok_or_else(|| BlpError::missing_component("prices"))?;
    let gap = (matrix.column(column) - prices).amax();
    if gap > 1e-10 {
        return Err(BlpError::invalid_configuration(format!(
            "{name} price column {column} differs from prices by up to {gap}"
        )));
    }
    Ok(())
}

/// Contiguous market blocks of the stacked product arrays.
#[derive(Clone, Debug)]
pub struct MarketPartition {
    markets: Vec<MarketSegment>,
}

impl MarketPartition {
    /// Splits `market_ids` into runs, rejecting a market that reappears after another
    /// one and any market whose inside shares leave no room for the outside good.
    fn new(market_ids: &[String], shares: &DVector<f64>) -> Result<Self> {
        let mut markets: Vec<MarketSegment> = Vec::new();
        let mut closed = HashSet::new();

        for (j, id) in market_ids.iter().enumerate() {
            if !shares[j].is_finite() {
                return Err(BlpError::NumericalError {
                    context: "share validation",
                });
            }
            match markets.last_mut() {
                Some(current) if current.market_id == *id => {
                    current.end = j + 1;
                    current.outside_share -= shares[j];
                }
                _ => {
                    if let Some(previous) = markets.last() {
                        closed.insert(previous.market_id.clone());
                    }
                    if closed.contains(id) {
                        return Err(BlpError::NonContiguousMarket { market_id: id.clone() });
                    }
                    markets.push(MarketSegment {
                        market_id: id.clone(),
                        start: j,
                        end: j + 1,
                        outside_share: 1.0 - shares[j],
                    });
                }
            }
        }

        if let Some(segment) = markets.iter().find(|m| m.outside_share <= 0.0) {
            return Err(BlpError::NonPositiveOutsideShare {
                market_id: segment.market_id.clone(),
                share: segment.outside_share,
            });
        }
        Ok(Self { markets })
    }

    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    pub fn markets(&self) -> impl Iterator<Item = &MarketSegment> {
        self.markets.iter()
    }

    /// The `index`-th market in data order.
    pub fn segment(&self, index: usize) -> &MarketSegment {
        &self.markets[index]
    }
}

/// One market's block of products.
#[derive(Clone, Debug)]
pub struct MarketSegment {
    market_id: String,
    pub(crate) start: usize,
    /// Exclusive.
    pub(crate) end: usize,
    /// `1 - sum_j s_j` over the market's products.
    pub outside_share: f64,
}

impl MarketSegment {
    pub fn id(&self) -> &str {
        &self.market_id
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    pub fn product_count(&self) -> usize {
        self.end - self.start
    }
}
