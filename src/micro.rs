//! Micro moments: agent-level expectations matched to survey statistics.
//!
//! Each moment pairs an observed value with an agent-level function `m_i` whose
//! weighted mean is computed in every market where the moment applies. The moment is
//! `value - mean_t sum_i w_i m_i`, averaged over its relevant markets only.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{BlpError, Result};
use crate::parameters::ParameterKind;
use crate::shares::ChoiceState;

/// Agent-level function averaged by a micro moment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MicroMomentKind {
    /// `m_i = d_i[demographic] * sum_j s_ij x2_j[characteristic]`: the expected
    /// characteristic of the chosen product interacted with a demographic, with the
    /// outside good contributing zero.
    DemographicCharacteristic {
        demographic: usize,
        characteristic: usize,
    },
    /// `m_i = d_i[demographic] * sum_j s_ij`: a demographic interacted with the
    /// probability of buying any inside good.
    DemographicInsideShare { demographic: usize },
}

/// One micro moment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MicroMoment {
    pub name: String,
    pub kind: MicroMomentKind,
    /// Observed value of the expectation.
    pub value: f64,
    /// Markets the statistic was collected in; every market when `None`.
    pub market_ids: Option<Vec<String>>,
}

impl MicroMoment {
    pub fn new(name: impl Into<String>, kind: MicroMomentKind, value: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            market_ids: None,
        }
    }

    pub fn in_markets(mut self, market_ids: Vec<String>) -> Self {
        self.market_ids = Some(market_ids);
        self
    }

    pub fn applies_to(&self, market_id: &str) -> bool {
        self.market_ids
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|id| id == market_id))
    }

    fn validate(&self, demographics: usize, characteristics: usize) -> Result<()> {
        let (demographic, characteristic) = match self.kind {
            MicroMomentKind::DemographicCharacteristic {
                demographic,
                characteristic,
            } => (demographic, Some(characteristic)),
            MicroMomentKind::DemographicInsideShare { demographic } => (demographic, None),
        };
        if demographic >= demographics {
            return Err(BlpError::invalid_configuration(format!(
                "micro moment {} uses demographic {demographic} but agents have {demographics}",
                self.name
            )));
        }
        if let Some(characteristic) = characteristic {
            if characteristic >= characteristics {
                return Err(BlpError::invalid_configuration(format!(
                    "micro moment {} uses X2 column {characteristic} but X2 has {characteristics}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Product-level weights `a_j` so that `m_i = d_il sum_j s_ij a_j`.
    fn product_weights(&self, state: &ChoiceState<'_>) -> DVector<f64> {
        let market = state.market();
        match self.kind {
            MicroMomentKind::DemographicCharacteristic { characteristic, .. } => {
                market.x2.column(characteristic).into_owned()
            }
            MicroMomentKind::DemographicInsideShare { .. } => {
                DVector::from_element(market.product_count(), 1.0)
            }
        }
    }

    fn demographic(&self) -> usize {
        match self.kind {
            MicroMomentKind::DemographicCharacteristic { demographic, .. }
            | MicroMomentKind::DemographicInsideShare { demographic } => demographic,
        }
    }
}

/// Checks every moment against the agent and `X2` dimensions.
pub fn validate_moments(
    moments: &[MicroMoment],
    demographics: usize,
    characteristics: usize,
) -> Result<()> {
    moments
        .iter()
        .try_for_each(|moment| moment.validate(demographics, characteristics))
}

/// Micro moment contributions of one market.
#[derive(Clone, Debug)]
pub struct MarketMicro {
    /// Weighted agent mean of each moment's function, for relevant moments.
    pub means: Vec<Option<f64>>,
    /// Total derivative of each mean with respect to `theta` (`M_M x P`).
    pub jacobian: DMatrix<f64>,
    /// Weighted agent covariances of the functions, zero for irrelevant pairs.
    pub covariances: DMatrix<f64>,
}

/// Computes one market's contributions. `d_delta` is the total `delta` Jacobian.
pub fn market_micro(
    state: &ChoiceState<'_>,
    moments: &[MicroMoment],
    d_delta: Option<&DMatrix<f64>>,
    kinds: &[ParameterKind],
) -> MarketMicro {
    let market = state.market();
    let agents = market.agent_count();
    let count = moments.len();
    let mut means = vec![None; count];
    let mut jacobian = DMatrix::zeros(count, kinds.len());
    let mut functions = DMatrix::zeros(count, agents);

    for (m, moment) in moments.iter().enumerate() {
        if !moment.applies_to(market.id()) {
            continue;
        }
        let weights = moment.product_weights(state);
        let demographic = moment.demographic();
        let demographics = market.demographics.column(demographic);
        let values = state.probabilities().tr_mul(&weights).component_mul(&demographics);
        functions.set_row(m, &values.transpose());
        means[m] = Some(values.dot(&market.weights));

        if let Some(d_delta) = d_delta {
            for (p, kind) in kinds.iter().enumerate() {
                let direction = d_delta.column(p).into_owned();
                let mut total = 0.0;
                for i in 0..agents {
                    let (dv, dr) = state.agent_direction(i, kind, &direction);
                    let tangent = state.agent_tangent(i, &dv, &dr);
                    total +=
                        market.weights[i] * demographics[i] * tangent.probabilities.dot(&weights);
                }
                jacobian[(m, p)] = total;
            }
        }
    }

    let mut covariances = DMatrix::zeros(count, count);
    for m in 0..count {
        let Some(mean_m) = means[m] else { continue };
        for n in 0..=m {
            let Some(mean_n) = means[n] else { continue };
            let value: f64 = (0..agents)
                .map(|i| {
                    market.weights[i] * (functions[(m, i)] - mean_m) * (functions[(n, i)] - mean_n)
                })
                .sum();
            covariances[(m, n)] = value;
            covariances[(n, m)] = value;
        }
    }

    MarketMicro {
        means,
        jacobian,
        covariances,
    }
}

/// Micro moments averaged across their relevant markets.
#[derive(Clone, Debug)]
pub struct MicroAggregate {
    /// `value - mean model expectation` for every moment.
    pub moments: DVector<f64>,
    pub jacobian: DMatrix<f64>,
    /// Covariances averaged over markets in which both moments apply.
    pub covariances: DMatrix<f64>,
}

/// Averages market contributions; each moment must apply to at least one market.
pub fn aggregate(
    moments: &[MicroMoment],
    markets: &[MarketMicro],
    parameters: usize,
) -> Result<MicroAggregate> {
    let count = moments.len();
    let mut values = DVector::zeros(count);
    let mut jacobian = DMatrix::zeros(count, parameters);
    let mut covariances = DMatrix::zeros(count, count);
    let mut market_counts = vec![0usize; count];
    let mut pair_counts = DMatrix::<f64>::zeros(count, count);

    for market in markets {
        for m in 0..count {
            if let Some(mean) = market.means[m] {
                market_counts[m] += 1;
                values[m] += mean;
                let mut row = jacobian.row_mut(m);
                row += market.jacobian.row(m);
                for n in 0..count {
                    if market.means[n].is_some() {
                        pair_counts[(m, n)] += 1.0;
                        covariances[(m, n)] += market.covariances[(m, n)];
                    }
                }
            }
        }
    }

    for (m, moment) in moments.iter().enumerate() {
        if market_counts[m] == 0 {
            return Err(BlpError::invalid_configuration(format!(
                "micro moment {} does not apply to any market",
                moment.name
            )));
        }
        let markets = market_counts[m] as f64;
        values[m] = moment.value - values[m] / markets;
        let mut row = jacobian.row_mut(m);
        row /= -markets;
        for n in 0..count {
            if pair_counts[(m, n)] > 0.0 {
                covariances[(m, n)] /= pair_counts[(m, n)];
            }
        }
    }

    Ok(MicroAggregate {
        moments: values,
        jacobian,
        covariances,
    })
}
