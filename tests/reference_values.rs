use approx::assert_relative_eq;
use blpgmm::data::ProductDataBuilder;
use blpgmm::integration::AgentData;
use blpgmm::market::Market;
use blpgmm::shares::{AgentUtilities, ChoiceState};
use blpgmm::{ParameterConfig, Problem};
use nalgebra::{DMatrix, DVector};

/// Closed-form logit mean utilities `ln s_j - ln s_0` for two small markets.
#[test]
fn logit_delta_matches_closed_form_reference() {
    let market_ids = vec!["0".to_string(), "0".to_string(), "1".to_string()];
    let shares = DVector::from_vec(vec![0.3, 0.2, 0.4]);
    let x1 = DMatrix::from_row_slice(3, 2, &[1.0, 10.0, 1.0, 15.0, 1.0, 12.0]);

    let data = ProductDataBuilder::new(market_ids, shares.clone())
        .x1(x1.clone())
        .demand_instruments(x1)
        .build()
        .unwrap();
    let problem = Problem::builder()
        .products(data.clone())
        .parameters(ParameterConfig::new())
        .build()
        .unwrap();

    let weighting = problem.initial_weighting().unwrap();
    let evaluation = problem.evaluate(&DVector::zeros(0), &weighting, false).unwrap();
    let expected = DVector::from_vec(vec![
        -0.510_825_623_765_990_7,
        -0.916_290_731_874_155,
        -0.405_465_108_108_164_4,
    ]);
    assert_relative_eq!(evaluation.stacked.delta, expected, epsilon = 1e-12);

    // Exactly identified: residuals are orthogonal to the instruments.
    assert!(evaluation.objective.abs() < 1e-10);

    for market in Market::all(&data, None).unwrap() {
        let range = market.products();
        let delta = evaluation.stacked.delta.rows(range.start, range.len()).into_owned();
        let utility = AgentUtilities::new(&market, &evaluation.values).unwrap();
        let state = ChoiceState::new(&market, &utility, &delta).unwrap();
        assert_relative_eq!(state.shares().clone(), market.shares().clone(), epsilon = 1e-12);
    }
}

#[test]
fn monte_carlo_second_moment_is_unity() {
    let agents = AgentData::standard_normal(&["m".to_string()], 50_000, 1, 42).unwrap();
    let moment: f64 = agents
        .nodes()
        .column(0)
        .iter()
        .zip(agents.weights().iter())
        .map(|(node, weight)| weight * node * node)
        .sum();
    assert_relative_eq!(moment, 1.0, epsilon = 3e-2);
}

#[test]
fn integration_weights_sum_to_one_in_every_market() {
    let ids = vec!["a".to_string(), "b".to_string()];
    let agents = AgentData::standard_normal(&ids, 1_000, 3, 7).unwrap();
    for id in &ids {
        let range = agents.market_range(id).unwrap();
        let total: f64 = agents.weights().rows(range.start, range.len()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
    }
}
