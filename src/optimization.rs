//! Optimizer interface for the GMM objective.
//!
//! The estimator only needs a minimizer of a smooth objective over box constraints
//! that consumes objective values and analytic gradients. [`Lbfgs`] runs `argmin`'s
//! L-BFGS with a More-Thuente line search on unbounded coordinates that map onto the
//! box; [`Return`] evaluates the starting values only, which is how a fixed `theta`
//! is "estimated" (e.g. to compute standard errors).

use std::cell::{Cell, RefCell};

use argmin::core::{
    CostFunction, Error as ArgminError, Executor, Gradient, State, TerminationReason,
    TerminationStatus,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use log::{debug, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{BlpError, Result};

/// Objective value and gradient at one point.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectiveValue {
    pub value: f64,
    pub gradient: DVector<f64>,
    /// The evaluation failed and `value` is a stand-in (punished or reverted).
    pub failed: bool,
}

impl ObjectiveValue {
    pub fn new(value: f64, gradient: DVector<f64>) -> Self {
        Self {
            value,
            gradient,
            failed: false,
        }
    }

    /// A stand-in for an evaluation that failed. Optimizers never report convergence
    /// at such a point.
    pub fn failed(value: f64, gradient: DVector<f64>) -> Self {
        Self {
            value,
            gradient,
            failed: true,
        }
    }
}

/// A function the optimizer can query for values and gradients.
pub trait Objective {
    fn evaluate(&mut self, theta: &DVector<f64>) -> Result<ObjectiveValue>;
}

/// Canonical optimizer output.
#[derive(Clone, Debug)]
pub struct OptimizationOutcome {
    pub theta: DVector<f64>,
    pub value: f64,
    pub gradient: DVector<f64>,
    pub iterations: usize,
    pub evaluations: usize,
    pub converged: bool,
    pub message: String,
}

/// Minimizes an [`Objective`] subject to `lower <= theta <= upper`.
pub trait Optimizer {
    fn minimize(
        &self,
        objective: &mut dyn Objective,
        start: &DVector<f64>,
        lower: &DVector<f64>,
        upper: &DVector<f64>,
    ) -> Result<OptimizationOutcome>;
}

/// Clamps `theta` into the box.
pub fn project(theta: &DVector<f64>, lower: &DVector<f64>, upper: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(
        theta.len(),
        theta
            .iter()
            .zip(lower.iter().zip(upper.iter()))
            .map(|(value, (lower, upper))| value.max(*lower).min(*upper)),
    )
}

/// The gradient with components that point out of the box at an active bound removed.
pub fn projected_gradient(
    theta: &DVector<f64>,
    gradient: &DVector<f64>,
    lower: &DVector<f64>,
    upper: &DVector<f64>,
) -> DVector<f64> {
    theta - project(&(theta - gradient), lower, upper)
}

fn check_dimensions(
    start: &DVector<f64>,
    lower: &DVector<f64>,
    upper: &DVector<f64>,
) -> Result<()> {
    for (context, bound) in [("lower bounds", lower), ("upper bounds", upper)] {
        if bound.len() != start.len() {
            return Err(BlpError::dimension_mismatch(context, start.len(), bound.len()));
        }
    }
    Ok(())
}

/// Evaluates the objective at the (projected) starting values and stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Return;

impl Optimizer for Return {
    fn minimize(
        &self,
        objective: &mut dyn Objective,
        start: &DVector<f64>,
        lower: &DVector<f64>,
        upper: &DVector<f64>,
    ) -> Result<OptimizationOutcome> {
        check_dimensions(start, lower, upper)?;
        let theta = project(start, lower, upper);
        let ObjectiveValue {
            value,
            gradient,
            failed,
        } = objective.evaluate(&theta)?;
        let message = if failed {
            "objective evaluation failed at the starting values"
        } else {
            "returned the starting values"
        };
        Ok(OptimizationOutcome {
            theta,
            value,
            gradient,
            iterations: 0,
            evaluations: 1,
            converged: !failed,
            message: message.to_string(),
        })
    }
}

/// Relative distance kept from a finite bound when mapping a start onto unbounded
/// coordinates.
const INTERIOR: f64 = 1e-10;

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn softplus(z: f64) -> f64 {
    if z > 20.0 {
        z
    } else {
        z.exp().ln_1p()
    }
}

fn softplus_inverse(x: f64) -> f64 {
    if x > 20.0 {
        x
    } else {
        x.exp_m1().ln()
    }
}

/// How one element of `theta` maps to an unbounded coordinate `z`.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Coordinate {
    Free,
    Fixed(f64),
    /// `theta = lower + softplus(z)`.
    Lower(f64),
    /// `theta = upper - softplus(z)`.
    Upper(f64),
    /// `theta = lower + (upper - lower) sigmoid(z)`.
    Interval(f64, f64),
}

impl Coordinate {
    fn new(lower: f64, upper: f64) -> Self {
        match (lower.is_finite(), upper.is_finite()) {
            (true, true) if upper <= lower => Self::Fixed(lower),
            (true, true) => Self::Interval(lower, upper),
            (true, false) => Self::Lower(lower),
            (false, true) => Self::Upper(upper),
            (false, false) => Self::Free,
        }
    }

    fn unbound(self, theta: f64) -> f64 {
        let margin = |bound: f64| INTERIOR * bound.abs().max(1.0);
        match self {
            Self::Free => theta,
            Self::Fixed(_) => 0.0,
            Self::Lower(lower) => softplus_inverse((theta - lower).max(margin(lower))),
            Self::Upper(upper) => softplus_inverse((upper - theta).max(margin(upper))),
            Self::Interval(lower, upper) => {
                let t = ((theta - lower) / (upper - lower)).clamp(INTERIOR, 1.0 - INTERIOR);
                (t / (1.0 - t)).ln()
            }
        }
    }

    fn bound(self, z: f64) -> f64 {
        match self {
            Self::Free => z,
            Self::Fixed(value) => value,
            Self::Lower(lower) => lower + softplus(z),
            Self::Upper(upper) => upper - softplus(z),
            Self::Interval(lower, upper) => lower + (upper - lower) * sigmoid(z),
        }
    }

    /// `d theta / d z`.
    fn slope(self, z: f64) -> f64 {
        match self {
            Self::Free => 1.0,
            Self::Fixed(_) => 0.0,
            Self::Lower(_) => sigmoid(z),
            Self::Upper(_) => -sigmoid(z),
            Self::Interval(lower, upper) => {
                let s = sigmoid(z);
                (upper - lower) * s * (1.0 - s)
            }
        }
    }
}

/// Evaluation bookkeeping for one run: the wrapped objective, the coordinate map,
/// and the most recent point (argmin asks for cost and gradient separately).
struct Tracker<'o> {
    objective: RefCell<&'o mut dyn Objective>,
    coordinates: Vec<Coordinate>,
    last: RefCell<Option<(Vec<f64>, ObjectiveValue)>>,
    best: RefCell<Option<Vec<f64>>>,
    best_value: Cell<f64>,
    evaluations: Cell<usize>,
    error: RefCell<Option<BlpError>>,
}

impl<'o> Tracker<'o> {
    fn new(objective: &'o mut dyn Objective, lower: &DVector<f64>, upper: &DVector<f64>) -> Self {
        Self {
            objective: RefCell::new(objective),
            coordinates: lower
                .iter()
                .zip(upper.iter())
                .map(|(lower, upper)| Coordinate::new(*lower, *upper))
                .collect(),
            last: RefCell::new(None),
            best: RefCell::new(None),
            best_value: Cell::new(f64::INFINITY),
            evaluations: Cell::new(0),
            error: RefCell::new(None),
        }
    }

    fn unbound(&self, theta: &DVector<f64>) -> Vec<f64> {
        self.coordinates
            .iter()
            .zip(theta.iter())
            .map(|(coordinate, value)| coordinate.unbound(*value))
            .collect()
    }

    fn theta(&self, z: &[f64]) -> DVector<f64> {
        DVector::from_iterator(
            z.len(),
            self.coordinates.iter().zip(z).map(|(coordinate, z)| coordinate.bound(*z)),
        )
    }

    fn at(&self, z: &[f64]) -> Result<ObjectiveValue> {
        if let Some((point, value)) = self.last.borrow().as_ref() {
            if point.as_slice() == z {
                return Ok(value.clone());
            }
        }
        let value = self.objective.borrow_mut().evaluate(&self.theta(z))?;
        self.evaluations.set(self.evaluations.get() + 1);
        if !value.failed && value.value < self.best_value.get() {
            self.best_value.set(value.value);
            *self.best.borrow_mut() = Some(z.to_vec());
        }
        *self.last.borrow_mut() = Some((z.to_vec(), value.clone()));
        Ok(value)
    }

    /// Like [`Tracker::at`], but keeps an objective error aside so it can be returned
    /// unchanged once argmin unwinds.
    fn at_or_stash(&self, z: &[f64]) -> std::result::Result<ObjectiveValue, ArgminError> {
        self.at(z).map_err(|error| {
            let message = error.to_string();
            *self.error.borrow_mut() = Some(error);
            ArgminError::msg(message)
        })
    }

    fn outcome(
        &self,
        z: &[f64],
        iterations: usize,
        converged: bool,
        message: String,
    ) -> Result<OptimizationOutcome> {
        let value = self.at(z)?;
        let converged = converged && !value.failed;
        Ok(OptimizationOutcome {
            theta: self.theta(z),
            value: value.value,
            gradient: value.gradient,
            iterations,
            evaluations: self.evaluations.get(),
            converged,
            message,
        })
    }
}

/// Exposes a [`Tracker`] to argmin as a problem over unbounded coordinates.
struct ArgminAdapter<'t, 'o> {
    tracker: &'t Tracker<'o>,
}

impl CostFunction for ArgminAdapter<'_, '_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, z: &Self::Param) -> std::result::Result<Self::Output, ArgminError> {
        Ok(self.tracker.at_or_stash(z)?.value)
    }
}

impl Gradient for ArgminAdapter<'_, '_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    /// Chain rule through the coordinate map: `d q / d z = (d q / d theta) (d theta / d z)`.
    fn gradient(&self, z: &Self::Param) -> std::result::Result<Self::Gradient, ArgminError> {
        let value = self.tracker.at_or_stash(z)?;
        Ok(self
            .tracker
            .coordinates
            .iter()
            .zip(z.iter().zip(value.gradient.iter()))
            .map(|(coordinate, (z, gradient))| gradient * coordinate.slope(*z))
            .collect())
    }
}

type MoreThuente = MoreThuenteLineSearch<Vec<f64>, Vec<f64>, f64>;
type LbfgsSolver = LBFGS<MoreThuente, Vec<f64>, Vec<f64>, f64>;

/// L-BFGS with a More-Thuente line search, run by `argmin`.
///
/// Bounds are handled by reparameterization: each bounded element of `theta` is a
/// softplus (one finite bound) or logistic (two finite bounds) function of an
/// unbounded coordinate, so every trial point is feasible. Tolerances apply to the
/// unbounded coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lbfgs {
    pub max_iterations: u64,
    /// Stop once the L2 norm of the gradient falls below this.
    pub gradient_tolerance: f64,
    /// Stop once the objective changes by less than this between iterations.
    pub cost_tolerance: f64,
    /// Number of curvature pairs kept.
    pub memory: usize,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self {
            max_iterations: 1_000,
            gradient_tolerance: 1e-8,
            cost_tolerance: f64::EPSILON,
            memory: 7,
        }
    }
}

impl Lbfgs {
    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.gradient_tolerance = tolerance;
        self
    }

    fn solver(&self) -> Result<LbfgsSolver> {
        LBFGS::new(MoreThuente::new(), self.memory)
            .with_tolerance_grad(self.gradient_tolerance)
            .and_then(|solver| solver.with_tolerance_cost(self.cost_tolerance))
            .map_err(|error| BlpError::invalid_configuration(format!("L-BFGS settings: {error}")))
    }
}

impl Optimizer for Lbfgs {
    fn minimize(
        &self,
        objective: &mut dyn Objective,
        start: &DVector<f64>,
        lower: &DVector<f64>,
        upper: &DVector<f64>,
    ) -> Result<OptimizationOutcome> {
        check_dimensions(start, lower, upper)?;
        let solver = self.solver()?;
        let tracker = Tracker::new(objective, lower, upper);
        let z0 = tracker.unbound(start);

        if start.is_empty() {
            return tracker.outcome(&z0, 0, true, "no parameters to optimize".to_string());
        }
        if tracker.at(&z0)?.failed {
            warn!("objective evaluation failed at the starting values; not optimizing");
            let message = "objective evaluation failed at the starting values".to_string();
            return tracker.outcome(&z0, 0, false, message);
        }

        let executor = Executor::new(ArgminAdapter { tracker: &tracker }, solver)
            .configure(|state| state.param(z0.clone()).max_iters(self.max_iterations));
        match executor.run() {
            Ok(result) => {
                let mut state = result.state().clone();
                let iterations = state.get_iter() as usize;
                let status = state.get_termination_status().clone();
                let converged = matches!(
                    status,
                    TerminationStatus::Terminated(TerminationReason::SolverConverged)
                );
                let best = state.take_best_param().unwrap_or(z0);
                debug!("L-BFGS finished after {iterations} iterations: {status}");
                tracker.outcome(&best, iterations, converged, status.to_string())
            }
            Err(error) => {
                if let Some(error) = tracker.error.borrow_mut().take() {
                    return Err(error);
                }
                warn!("L-BFGS stopped early: {error}");
                let best = tracker.best.borrow().clone().unwrap_or(z0);
                tracker.outcome(&best, 0, false, format!("stopped early: {error}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solving::sup_norm;
    use approx::assert_relative_eq;

    /// `(x - 3)^2 + 10 (y + 1)^2`.
    struct Quadratic {
        calls: usize,
    }

    impl Objective for Quadratic {
        fn evaluate(&mut self, theta: &DVector<f64>) -> Result<ObjectiveValue> {
            self.calls += 1;
            let (x, y) = (theta[0], theta[1]);
            Ok(ObjectiveValue::new(
                (x - 3.0).powi(2) + 10.0 * (y + 1.0).powi(2),
                DVector::from_vec(vec![2.0 * (x - 3.0), 20.0 * (y + 1.0)]),
            ))
        }
    }

    /// Fails everywhere, the way a punished objective does.
    struct Infeasible;

    impl Objective for Infeasible {
        fn evaluate(&mut self, theta: &DVector<f64>) -> Result<ObjectiveValue> {
            Ok(ObjectiveValue::failed(1e10, DVector::zeros(theta.len())))
        }
    }

    #[test]
    fn finds_the_unconstrained_minimum() {
        let mut objective = Quadratic { calls: 0 };
        let bounds = DVector::from_element(2, f64::INFINITY);
        let outcome = Lbfgs::default()
            .minimize(&mut objective, &DVector::zeros(2), &-bounds.clone(), &bounds)
            .unwrap();
        assert!(outcome.converged, "{}", outcome.message);
        assert_relative_eq!(outcome.theta[0], 3.0, epsilon = 1e-6);
        assert_relative_eq!(outcome.theta[1], -1.0, epsilon = 1e-6);
        assert_eq!(outcome.evaluations, objective.calls);
    }

    #[test]
    fn approaches_an_active_bound_from_inside() {
        let mut objective = Quadratic { calls: 0 };
        let lower = DVector::from_vec(vec![f64::NEG_INFINITY, 0.0]);
        let upper = DVector::from_vec(vec![2.0, f64::INFINITY]);
        let outcome = Lbfgs::default()
            .minimize(&mut objective, &DVector::from_vec(vec![0.0, 1.0]), &lower, &upper)
            .unwrap();
        assert!(outcome.theta[0] <= 2.0 && outcome.theta[1] >= 0.0);
        assert_relative_eq!(outcome.theta[0], 2.0, epsilon = 1e-5);
        assert_relative_eq!(outcome.theta[1], 0.0, epsilon = 1e-5);
        let projected = projected_gradient(&outcome.theta, &outcome.gradient, &lower, &upper);
        assert!(sup_norm(&projected) < 1e-4);
    }

    #[test]
    fn interval_coordinates_round_trip_and_respect_the_box() {
        for coordinate in [
            Coordinate::Free,
            Coordinate::Lower(-1.0),
            Coordinate::Upper(2.0),
            Coordinate::Interval(0.0, 0.99),
        ] {
            let theta = 0.4;
            let z = coordinate.unbound(theta);
            assert_relative_eq!(coordinate.bound(z), theta, epsilon = 1e-12);
            let h = 1e-6;
            let numeric = (coordinate.bound(z + h) - coordinate.bound(z - h)) / (2.0 * h);
            assert_relative_eq!(coordinate.slope(z), numeric, epsilon = 1e-8);
        }
        let rho = Coordinate::new(0.0, 0.99);
        assert!(rho.bound(-800.0) >= 0.0 && rho.bound(800.0) <= 0.99);
        assert!(rho.unbound(0.99).is_finite());
        assert_eq!(Coordinate::new(0.5, 0.5).bound(3.0), 0.5);
    }

    #[test]
    fn failed_starting_values_never_count_as_converged() {
        let bounds = DVector::from_element(2, f64::INFINITY);
        let start = DVector::from_vec(vec![0.5, 0.5]);
        let outcome = Lbfgs::default()
            .minimize(&mut Infeasible, &start, &-bounds.clone(), &bounds)
            .unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.value, 1e10);
        assert_eq!(outcome.iterations, 0);

        let outcome = Return.minimize(&mut Infeasible, &start, &-bounds.clone(), &bounds).unwrap();
        assert!(!outcome.converged);
    }

    #[test]
    fn objective_errors_pass_through_unchanged() {
        struct Broken;
        impl Objective for Broken {
            fn evaluate(&mut self, _: &DVector<f64>) -> Result<ObjectiveValue> {
                Err(BlpError::NumericalError { context: "test" })
            }
        }
        let bounds = DVector::from_element(1, f64::INFINITY);
        let start = DVector::zeros(1);
        let result = Lbfgs::default().minimize(&mut Broken, &start, &-bounds.clone(), &bounds);
        assert!(matches!(result, Err(BlpError::NumericalError { context: "test" })));
    }

    #[test]
    fn return_evaluates_once() {
        let mut objective = Quadratic { calls: 0 };
        let bounds = DVector::from_element(2, 5.0);
        let outcome = Return
            .minimize(&mut objective, &DVector::from_vec(vec![9.0, 0.0]), &-bounds.clone(), &bounds)
            .unwrap();
        assert_eq!(outcome.theta[0], 5.0);
        assert_eq!(outcome.value, 4.0 + 10.0);
        assert_eq!(objective.calls, 1);
        assert!(outcome.converged);
    }
}
