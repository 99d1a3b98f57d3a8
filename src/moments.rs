//! Moment Assembler: stacks per-market results into product-level arrays and forms
//! the averaged moments `g_bar` with their Jacobian `G_bar`.
//!
//! `g_bar = [ZD' xi / N; ZS' omega / N; micro]`. Market results are stacked in market
//! order after all parallel work has finished, so the output does not depend on
//! scheduling.

use nalgebra::{DMatrix, DVector};

use crate::error::{BlpError, Result};
use crate::micro::{self, MarketMicro, MicroAggregate, MicroMoment};
use crate::solving::ContractionSummary;

/// Everything one market contributes to an objective evaluation.
#[derive(Clone, Debug)]
pub struct MarketContribution {
    pub delta: DVector<f64>,
    /// `d delta / d theta` including the `-X1` columns of linear parameters in `theta`.
    pub xi_jacobian: Option<DMatrix<f64>>,
    /// Transformed marginal costs `c~`, when there is a supply side.
    pub tilde_costs: Option<DVector<f64>>,
    pub omega_jacobian: Option<DMatrix<f64>>,
    pub clipped: Vec<bool>,
    pub micro: Option<MarketMicro>,
    pub contraction: ContractionSummary,
    /// Smallest and largest eigenvalues of `d s / d delta`.
    pub eigenvalues: Option<(f64, f64)>,
}

/// Product-level arrays stacked over all markets.
#[derive(Clone, Debug)]
pub struct Stacked {
    pub delta: DVector<f64>,
    pub xi_jacobian: DMatrix<f64>,
    pub tilde_costs: DVector<f64>,
    pub omega_jacobian: DMatrix<f64>,
    pub clipped: Vec<bool>,
    pub micro: Option<MicroAggregate>,
    pub contractions: Vec<ContractionSummary>,
    pub eigenvalues: Vec<Option<(f64, f64)>>,
}

impl Stacked {
    /// Total contraction iterations across markets.
    pub fn total_iterations(&self) -> usize {
        self.contractions.iter().map(|c| c.iterations).sum()
    }

    pub fn clipped_count(&self) -> usize {
        self.clipped.iter().filter(|c| **c).count()
    }
}

/// Stacks market contributions; `products` is `N` and `parameters` is `P`.
pub fn stack(
    contributions: Vec<MarketContribution>,
    products: usize,
    parameters: usize,
    supply: bool,
    micro_moments: &[MicroMoment],
) -> Result<Stacked> {
    let mut delta = DVector::zeros(products);
    let mut xi_jacobian = DMatrix::zeros(products, parameters);
    let mut tilde_costs = DVector::zeros(if supply { products } else { 0 });
    let mut omega_jacobian = DMatrix::zeros(if supply { products } else { 0 }, parameters);
    let mut clipped = vec![false; products];
    let mut micro_parts = Vec::new();
    let mut contractions = Vec::with_capacity(contributions.len());
    let mut eigenvalues = Vec::with_capacity(contributions.len());

    let mut start = 0usize;
    for contribution in contributions {
        let j = contribution.delta.len();
        if start + j > products {
            return Err(BlpError::dimension_mismatch("stacked products", products, start + j));
        }
        delta.rows_mut(start, j).copy_from(&contribution.delta);
        if let Some(jacobian) = &contribution.xi_jacobian {
            xi_jacobian.rows_mut(start, j).copy_from(jacobian);
        }
        if supply {
            let costs = contribution
                .tilde_costs
                .as_ref()
                .ok_or_else(|| BlpError::missing_component("marginal costs"))?;
            tilde_costs.rows_mut(start, j).copy_from(costs);
            if let Some(jacobian) = &contribution.omega_jacobian {
                omega_jacobian.rows_mut(start, j).copy_from(jacobian);
            }
            for (offset, flag) in contribution.clipped.iter().enumerate() {
                clipped[start + offset] = *flag;
            }
        }
        if let Some(part) = contribution.micro {
            micro_parts.push(part);
        }
        contractions.push(contribution.contraction);
        eigenvalues.push(contribution.eigenvalues);
        start += j;
    }
    if start != products {
        return Err(BlpError::dimension_mismatch("stacked products", products, start));
    }

    let micro = if micro_moments.is_empty() {
        None
    } else {
        Some(micro::aggregate(micro_moments, &micro_parts, parameters)?)
    };

    Ok(Stacked {
        delta,
        xi_jacobian,
        tilde_costs,
        omega_jacobian,
        clipped,
        micro,
        contractions,
        eigenvalues,
    })
}

/// Averaged moments and their Jacobian, partitioned into demand, supply, and micro blocks.
#[derive(Clone, Debug)]
pub struct Moments {
    pub mean: DVector<f64>,
    pub jacobian: DMatrix<f64>,
    pub demand: usize,
    pub supply: usize,
    pub micro: usize,
}

/// Inputs to [`assemble`] for one equation.
#[derive(Clone, Copy, Debug)]
pub struct EquationBlock<'a> {
    pub instruments: &'a DMatrix<f64>,
    pub residuals: &'a DVector<f64>,
    /// Derivative of the residuals with respect to the columns of interest.
    pub jacobian: &'a DMatrix<f64>,
}

/// Forms `g_bar` and `G_bar` from demand, optional supply, and optional micro blocks.
pub fn assemble(
    demand: EquationBlock<'_>,
    supply: Option<EquationBlock<'_>>,
    micro: Option<(&DVector<f64>, &DMatrix<f64>)>,
) -> Moments {
    let n = demand.residuals.len() as f64;
    let columns = demand.jacobian.ncols();
    let demand_mean = demand.instruments.tr_mul(demand.residuals) / n;
    let demand_jacobian = demand.instruments.tr_mul(demand.jacobian) / n;
    let (supply_mean, supply_jacobian) = match supply {
        Some(block) => (
            block.instruments.tr_mul(block.residuals) / n,
            block.instruments.tr_mul(block.jacobian) / n,
        ),
        None => (DVector::zeros(0), DMatrix::zeros(0, columns)),
    };
    let (micro_mean, micro_jacobian) = match micro {
        Some((mean, jacobian)) => (mean.clone(), jacobian.clone()),
        None => (DVector::zeros(0), DMatrix::zeros(0, columns)),
    };

    let (md, ms, mm) = (demand_mean.len(), supply_mean.len(), micro_mean.len());
    let mut mean = DVector::zeros(md + ms + mm);
    mean.rows_mut(0, md).copy_from(&demand_mean);
    mean.rows_mut(md, ms).copy_from(&supply_mean);
    mean.rows_mut(md + ms, mm).copy_from(&micro_mean);
    let mut jacobian = DMatrix::zeros(md + ms + mm, columns);
    jacobian.rows_mut(0, md).copy_from(&demand_jacobian);
    jacobian.rows_mut(md, ms).copy_from(&supply_jacobian);
    jacobian.rows_mut(md + ms, mm).copy_from(&micro_jacobian);

    Moments {
        mean,
        jacobian,
        demand: md,
        supply: ms,
        micro: mm,
    }
}

/// Product-level moment contributions `g_j = [ZD_j xi_j, ZS_j omega_j]`, one row per
/// product. Equation blocks are stacked horizontally in the order given.
pub fn product_moments(
    residuals: &[&DVector<f64>],
    instruments: &[&DMatrix<f64>],
) -> DMatrix<f64> {
    let n = residuals.first().map_or(0, |u| u.len());
    let columns: usize = instruments.iter().map(|z| z.ncols()).sum();
    let mut g = DMatrix::zeros(n, columns);
    let mut offset = 0;
    for (u, z) in residuals.iter().zip(instruments) {
        for k in 0..z.ncols() {
            g.column_mut(offset + k).copy_from(&z.column(k).component_mul(u));
        }
        offset += z.ncols();
    }
    g
}
