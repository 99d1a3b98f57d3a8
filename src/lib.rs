//! GMM estimation of random coefficients (nested) logit demand, in the tradition of
//! Berry, Levinsohn, and Pakes (1995), with an optional Bertrand-Nash supply side.
//!
//! The crate covers the numerical core of BLP estimation:
//!
//! - per-market data and agent draws (`data`, `integration`, `market` modules),
//! - market shares and their analytic derivatives for the logit, nested logit, and
//!   random coefficients variants (`shares`),
//! - the mean utility contraction and its implicit Jacobian (`demand`),
//! - implied marginal costs and the zeta-markup price contraction (`supply`, `pricing`),
//! - moment assembly, weighting matrices, and one- or two-step GMM (`moments`,
//!   `weighting`, `estimation`), and
//! - standard errors and post-estimation outputs (`results`).
//!
//! Formula parsing, fixed effect absorption, and integration rules are left to the
//! caller: design matrices arrive as `nalgebra` matrices, and agents as nodes,
//! weights, and demographics per market.
//!
//! # Quick start
//!
//! ```no_run
//! use blpgmm::data::ProductDataBuilder;
//! use blpgmm::integration::AgentData;
//! use blpgmm::{ParameterConfig, Problem, ProblemOptions};
//! use nalgebra::{DMatrix, DVector};
//!
//! // Two markets with N = 3 products, one linear and one random characteristic.
//! let market_ids = vec!["m1".to_string(), "m1".to_string(), "m2".to_string()];
//! let shares = DVector::from_vec(vec![0.3, 0.2, 0.4]);
//! let x1 = DMatrix::from_row_slice(3, 2, &[1.0, 10.0, 1.0, 15.0, 1.0, 12.0]);
//! let x2 = DMatrix::from_row_slice(3, 1, &[10.0, 15.0, 12.0]);
//! let instruments = DMatrix::from_row_slice(
//!     3,
//!     3,
//!     &[1.0, 10.0, 2.0, 1.0, 15.0, 1.0, 1.0, 12.0, 3.0],
//! );
//!
//! let products = ProductDataBuilder::new(market_ids, shares)
//!     .x1(x1)
//!     .x2(x2)
//!     .demand_instruments(instruments)
//!     .build()
//!     .expect("validated product data");
//! let agents = AgentData::standard_normal_for(products.partition(), 200, 1, 1234)
//!     .expect("simulated agents");
//!
//! let problem = Problem::builder()
//!     .products(products)
//!     .agents(agents)
//!     .parameters(ParameterConfig::new().sigma(DMatrix::from_element(1, 1, 0.5)))
//!     .options(ProblemOptions::default())
//!     .build()
//!     .expect("well-formed problem");
//!
//! let results = problem.solve().expect("estimated");
//! println!("sigma = {}, beta = {}", results.sigma, results.beta);
//! ```

pub mod cache;
pub mod data;
pub mod demand;
pub mod error;
pub mod estimation;
pub mod integration;
pub mod linalg;
pub mod market;
pub mod micro;
pub mod moments;
pub mod optimization;
pub mod options;
pub mod parameters;
pub mod pricing;
pub mod results;
pub mod shares;
pub mod solving;
pub mod supply;
pub mod weighting;

pub use error::{BlpError, ErrorKind, Result};
pub use estimation::{Evaluation, GmmObjective, Problem, ProblemBuilder};
pub use micro::{MicroMoment, MicroMomentKind};
pub use optimization::{
    Lbfgs, Objective, ObjectiveValue, OptimizationOutcome, Optimizer, Return,
};
pub use options::{
    CostsOptions, CostsType, CovarianceType, DeltaBehavior, ErrorBehavior, GmmMethod, GmmOptions,
    ProblemOptions,
};
pub use parameters::{ParameterConfig, ParameterValues};
pub use results::ProblemResults;
pub use solving::{ContractionOptions, ContractionSummary, PriceIterationOptions};
