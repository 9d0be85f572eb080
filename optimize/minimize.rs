//! Deterministic minimization: a single BFGS search and the multi-start
//! screen built on top of it.

use super::bounds::{Bound, BoundTransform};
use super::{Minimizer, OptimizeError, check_start, walltime_budget};

use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::time::Instant;
use wolfe_bfgs::{Bfgs, BfgsError, BfgsSolution};

/// Objective value handed to the line search in place of a non-finite one,
/// so that it backs off instead of aborting.
const DIVERGENCE_PENALTY: f64 = 1e10;

/// Largest lattice the start screen will evaluate.
const MAX_LATTICE_POINTS: usize = 100_000;

/// How candidate start points are generated before the local searches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StartStrategy {
    /// Only the caller's initial point.
    Initial,
    /// A full grid with `points_per_dim` cell centres along every coordinate.
    Lattice { points_per_dim: usize },
    /// Uniform draws inside the search window of every coordinate.
    Random { candidates: usize },
}

/// Settings for [`minimize_bounded_start`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartConfig {
    pub strategy: StartStrategy,
    /// Number of best-screened candidates that get a full local search.
    pub n_starts: usize,
    /// Gradient-norm tolerance of each local search.
    pub tolerance: f64,
    /// Iteration cap of each local search.
    pub max_iterations: usize,
    /// Wall-clock budget for the screen and every local search. Once it runs
    /// out the objective is no longer called and the best point so far is
    /// returned with `converged = false`.
    pub walltime_secs: Option<f64>,
}

impl Default for StartConfig {
    fn default() -> Self {
        Self {
            strategy: StartStrategy::Random { candidates: 32 },
            n_starts: 2,
            tolerance: 1e-6,
            max_iterations: 200,
            walltime_secs: None,
        }
    }
}

impl StartConfig {
    fn validate(&self) -> Result<(), OptimizeError> {
        if self.n_starts == 0 {
            return Err(OptimizeError::InvalidConfig(
                "at least one local search is required".to_string(),
            ));
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(OptimizeError::InvalidConfig(format!(
                "tolerance must be positive and finite, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(OptimizeError::InvalidConfig(
                "max_iterations must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a deterministic minimization, in the caller's coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Minimum {
    pub x: Array1<f64>,
    pub value: f64,
    /// The start point of the local search that produced `x`.
    pub start: Array1<f64>,
    pub iterations: usize,
    pub evaluations: usize,
    /// False when the search stopped on its iteration cap, a failed line
    /// search or the wall-clock budget; `x` is still the best point evaluated.
    pub converged: bool,
}

/// One BFGS search with a Wolfe line search, run in unconstrained
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalBfgs {
    pub tolerance: f64,
    pub max_iterations: usize,
    deadline: Option<Instant>,
}

impl Default for LocalBfgs {
    fn default() -> Self {
        Self::new(1e-6, 200)
    }
}

impl LocalBfgs {
    pub fn new(tolerance: f64, max_iterations: usize) -> Self {
        Self {
            tolerance,
            max_iterations,
            deadline: None,
        }
    }

    /// Stops calling the objective once `deadline` has passed.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Book-keeping shared with the BFGS cost closure.
struct SearchState<'a> {
    objective: &'a mut dyn FnMut(ArrayView1<f64>) -> (f64, Array1<f64>),
    best: Option<(f64, Array1<f64>)>,
    evaluations: usize,
    non_finite: usize,
    shape_error: Option<OptimizeError>,
    deadline: Option<Instant>,
    expired: bool,
}

impl SearchState<'_> {
    fn evaluate(&mut self, transform: &BoundTransform, z: &Array1<f64>) -> (f64, Array1<f64>) {
        // Out of time: a flat landscape at the best value ends the search
        // without further objective calls.
        if let Some((best, _)) = &self.best {
            if self.expired || past(self.deadline) {
                self.expired = true;
                return (*best, Array1::zeros(z.len()));
            }
        }
        let x = transform.to_bounded(z.view());
        let (value, grad) = (self.objective)(x.view());
        self.evaluations += 1;

        if grad.len() != x.len() {
            self.shape_error.get_or_insert(OptimizeError::ShapeMismatch {
                context: "objective gradient",
                expected: x.len(),
                found: grad.len(),
            });
            return (DIVERGENCE_PENALTY, Array1::zeros(z.len()));
        }
        if !value.is_finite() || grad.iter().any(|g| !g.is_finite()) {
            self.non_finite += 1;
            log::debug!("Non-finite objective {value} at evaluation {}", self.evaluations);
            return (DIVERGENCE_PENALTY, Array1::zeros(z.len()));
        }

        if self.best.as_ref().is_none_or(|(best, _)| value < *best) {
            self.best = Some((value, x));
        }
        (value, transform.chain_gradient(z.view(), grad.view()))
    }
}

impl Minimizer for LocalBfgs {
    fn minimize(
        &mut self,
        objective: &mut dyn FnMut(ArrayView1<f64>) -> (f64, Array1<f64>),
        x0: ArrayView1<f64>,
        bounds: &[Bound],
    ) -> Result<Minimum, OptimizeError> {
        check_start(x0, bounds)?;

        if x0.is_empty() {
            let (value, _) = objective(x0);
            if !value.is_finite() {
                return Err(OptimizeError::NumericDivergence {
                    detail: format!("objective {value} with no free parameters"),
                });
            }
            return Ok(Minimum {
                x: x0.to_owned(),
                value,
                start: x0.to_owned(),
                iterations: 0,
                evaluations: 1,
                converged: true,
            });
        }

        let transform = BoundTransform::new(bounds);
        let z0 = transform.to_unconstrained(x0);
        let state = RefCell::new(SearchState {
            objective,
            best: None,
            evaluations: 0,
            non_finite: 0,
            shape_error: None,
            deadline: self.deadline,
            expired: false,
        });

        let cost_and_grad =
            |z: &Array1<f64>| -> (f64, Array1<f64>) { state.borrow_mut().evaluate(&transform, z) };

        let outcome = Bfgs::new(z0, cost_and_grad)
            .with_tolerance(self.tolerance)
            .with_max_iterations(self.max_iterations)
            .run();

        let (iterations, converged) = match outcome {
            Ok(BfgsSolution { iterations, .. }) => (iterations, true),
            Err(BfgsError::LineSearchFailed { last_solution, .. })
            | Err(BfgsError::MaxIterationsReached { last_solution }) => {
                log::debug!(
                    "BFGS stopped before convergence after {} iterations",
                    last_solution.iterations
                );
                (last_solution.iterations, false)
            }
            Err(e) => {
                log::debug!("BFGS stopped before convergence: {e}");
                (0, false)
            }
        };

        let state = state.into_inner();
        let converged = converged && !state.expired;
        if state.expired {
            log::debug!("Wall-clock budget ran out during a local search");
        }
        if let Some(e) = state.shape_error {
            return Err(e);
        }
        if state.non_finite > 0 {
            log::debug!(
                "{} of {} evaluations were non-finite and penalized",
                state.non_finite,
                state.evaluations
            );
        }
        match state.best {
            Some((value, x)) => Ok(Minimum {
                x,
                value,
                start: x0.to_owned(),
                iterations,
                evaluations: state.evaluations,
                converged,
            }),
            None => Err(OptimizeError::NumericDivergence {
                detail: format!(
                    "all {} evaluations from this start were non-finite",
                    state.evaluations
                ),
            }),
        }
    }
}

/// Screens candidate starts by objective value and refines the best few with
/// [`LocalBfgs`].
pub struct MultiStart<'r, R: Rng + ?Sized> {
    local: LocalBfgs,
    config: StartConfig,
    rng: &'r mut R,
}

impl<'r, R: Rng + ?Sized> MultiStart<'r, R> {
    pub fn new(config: StartConfig, rng: &'r mut R) -> Self {
        Self {
            local: LocalBfgs::new(config.tolerance, config.max_iterations),
            config,
            rng,
        }
    }

    fn candidates(
        &mut self,
        x0: ArrayView1<f64>,
        bounds: &[Bound],
    ) -> Result<Vec<Array1<f64>>, OptimizeError> {
        let mut candidates = vec![x0.to_owned()];
        match self.config.strategy {
            StartStrategy::Initial => {}
            StartStrategy::Lattice { points_per_dim } => {
                candidates.extend(candidate_start_points_lattice(x0, bounds, points_per_dim)?);
            }
            StartStrategy::Random { candidates: count } => {
                candidates.extend(candidate_start_points_random(
                    x0,
                    bounds,
                    count,
                    &mut *self.rng,
                )?);
            }
        }
        Ok(candidates)
    }
}

impl<R: Rng + ?Sized> Minimizer for MultiStart<'_, R> {
    fn minimize(
        &mut self,
        objective: &mut dyn FnMut(ArrayView1<f64>) -> (f64, Array1<f64>),
        x0: ArrayView1<f64>,
        bounds: &[Bound],
    ) -> Result<Minimum, OptimizeError> {
        self.config.validate()?;
        check_start(x0, bounds)?;
        let budget = walltime_budget(self.config.walltime_secs)?;
        let started = Instant::now();
        let deadline = budget.and_then(|b| started.checked_add(b));

        let candidates = self.candidates(x0, bounds)?;
        let mut out_of_time = false;
        let mut n_candidates = 0;
        let mut screened: Vec<(f64, Array1<f64>)> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            // x0 is always screened, whatever the budget.
            if n_candidates > 0 && past(deadline) {
                log::info!("Wall-clock budget exhausted after screening {n_candidates} starts");
                out_of_time = true;
                break;
            }
            n_candidates += 1;
            let (value, _) = objective(candidate.view());
            if value.is_finite() {
                screened.push((value, candidate));
            }
        }
        if screened.is_empty() {
            return Err(OptimizeError::NumericDivergence {
                detail: format!("all {n_candidates} candidate start points were non-finite"),
            });
        }
        screened.sort_by(|a, b| a.0.total_cmp(&b.0));
        log::debug!(
            "Screened {} candidate starts ({} finite); best start value {:.6e}",
            n_candidates,
            screened.len(),
            screened[0].0
        );

        let mut local = self.local.with_deadline(deadline);
        let mut best: Option<Minimum> = None;
        let mut evaluations = n_candidates;
        for (rank, (start_value, start)) in
            screened.into_iter().take(self.config.n_starts).enumerate()
        {
            if rank > 0 && past(deadline) {
                log::info!("Wall-clock budget exhausted after {rank} local searches");
                out_of_time = true;
                break;
            }
            match local.minimize(&mut *objective, start.view(), bounds) {
                Ok(found) => {
                    log::debug!(
                        "Local search {rank}: {start_value:.6e} -> {:.6e} in {} iterations",
                        found.value,
                        found.iterations
                    );
                    evaluations += found.evaluations;
                    if best.as_ref().is_none_or(|b| found.value < b.value) {
                        best = Some(found);
                    }
                }
                Err(OptimizeError::NumericDivergence { detail }) => {
                    log::debug!("Local search {rank} diverged: {detail}");
                }
                Err(e) => return Err(e),
            }
        }

        best.map(|mut found| {
            found.evaluations = evaluations;
            found.converged &= !out_of_time;
            found
        })
        .ok_or_else(|| OptimizeError::NumericDivergence {
            detail: "every local search diverged".to_string(),
        })
    }
}

/// Minimizes `objective` inside `bounds`, starting from the best of the
/// candidates that `config.strategy` produces around `x0`.
pub fn minimize_bounded_start<F, R>(
    mut objective: F,
    x0: ArrayView1<f64>,
    bounds: &[Bound],
    config: &StartConfig,
    rng: &mut R,
) -> Result<Minimum, OptimizeError>
where
    F: FnMut(ArrayView1<f64>) -> (f64, Array1<f64>),
    R: Rng + ?Sized,
{
    MultiStart::new(config.clone(), rng).minimize(&mut objective, x0, bounds)
}

/// Grid of start points: `points_per_dim` cell centres along the search
/// window of each coordinate, every combination taken.
pub fn candidate_start_points_lattice(
    x0: ArrayView1<f64>,
    bounds: &[Bound],
    points_per_dim: usize,
) -> Result<Vec<Array1<f64>>, OptimizeError> {
    check_start(x0, bounds)?;
    if points_per_dim == 0 {
        return Err(OptimizeError::InvalidConfig(
            "a lattice needs at least one point per dimension".to_string(),
        ));
    }
    let total = (points_per_dim as f64).powi(bounds.len() as i32);
    if total > MAX_LATTICE_POINTS as f64 {
        return Err(OptimizeError::InvalidConfig(format!(
            "a lattice of {points_per_dim}^{} points exceeds the limit of {MAX_LATTICE_POINTS}",
            bounds.len()
        )));
    }
    if bounds.is_empty() {
        return Ok(vec![Array1::zeros(0)]);
    }

    let step = 1.0 / points_per_dim as f64;
    let axes: Vec<Vec<f64>> = bounds
        .iter()
        .zip(x0.iter())
        .map(|(bound, &x)| {
            let (lo, hi) = bound.search_interval(x);
            (0..points_per_dim)
                .map(|i| bound.to_bounded(lo + (hi - lo) * (i as f64 + 0.5) * step))
                .collect()
        })
        .collect();

    Ok(axes
        .into_iter()
        .multi_cartesian_product()
        .map(Array1::from_vec)
        .collect())
}

/// `count` start points drawn uniformly over the search window of each
/// coordinate (log-uniform for one-sided bounds).
pub fn candidate_start_points_random<R: Rng + ?Sized>(
    x0: ArrayView1<f64>,
    bounds: &[Bound],
    count: usize,
    rng: &mut R,
) -> Result<Vec<Array1<f64>>, OptimizeError> {
    check_start(x0, bounds)?;
    let windows: Vec<(f64, f64)> = bounds
        .iter()
        .zip(x0.iter())
        .map(|(bound, &x)| bound.search_interval(x))
        .collect();

    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let mut point = Array1::zeros(bounds.len());
        for (slot, (bound, &(lo, hi))) in point.iter_mut().zip(bounds.iter().zip(&windows)) {
            let z = if hi > lo { rng.gen_range(lo..hi) } else { lo };
            *slot = bound.to_bounded(z);
        }
        points.push(point);
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::cell::Cell;

    fn shifted_quadratic(x: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let target = array![1.5, -0.5];
        let diff = &x - &target;
        (diff.dot(&diff), 2.0 * diff)
    }

    fn rosenbrock(x: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let (a, b) = (x[0], x[1]);
        let value = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
        let grad = array![
            -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
            200.0 * (b - a * a)
        ];
        (value, grad)
    }

    #[test]
    fn zero_walltime_stops_after_the_initial_point() {
        let calls = Cell::new(0usize);
        let mut objective = |x: ArrayView1<f64>| {
            calls.set(calls.get() + 1);
            rosenbrock(x)
        };
        let config = StartConfig {
            strategy: StartStrategy::Random { candidates: 32 },
            n_starts: 3,
            walltime_secs: Some(0.0),
            ..StartConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(11);
        let found = MultiStart::new(config, &mut rng)
            .minimize(&mut objective, array![-1.2, 1.0].view(), &[Bound::unbounded(); 2])
            .unwrap();

        // The screen evaluates x0 and the single local search evaluates its
        // start once before the budget is noticed.
        assert!(calls.get() <= 3, "{} objective calls after the budget ran out", calls.get());
        assert_eq!(found.evaluations, calls.get());
        assert!(!found.converged);
        assert_abs_diff_eq!(found.x[0], -1.2);
        assert_abs_diff_eq!(found.x[1], 1.0);
    }

    #[test]
    fn passed_deadline_leaves_a_local_search_unconverged() {
        let mut calls = 0usize;
        let mut objective = |x: ArrayView1<f64>| {
            calls += 1;
            shifted_quadratic(x)
        };
        let found = LocalBfgs::default()
            .with_deadline(Some(Instant::now()))
            .minimize(&mut objective, array![0.0, 0.0].view(), &[Bound::unbounded(); 2])
            .unwrap();
        assert_eq!(calls, 1);
        assert!(!found.converged);
        assert_abs_diff_eq!(found.value, 2.5);
    }

    #[test]
    fn iteration_cap_reports_the_iterations_actually_taken() {
        let mut objective = rosenbrock;
        let found = LocalBfgs::new(1e-10, 2)
            .minimize(&mut objective, array![-1.2, 1.0].view(), &[Bound::unbounded(); 2])
            .unwrap();
        assert!(!found.converged);
        assert!(found.iterations <= 2, "{} iterations under a cap of 2", found.iterations);
        assert!(found.value < 24.2, "value {} did not improve on the start", found.value);
    }

    #[test]
    fn local_search_finds_unconstrained_minimum() {
        let bounds = vec![Bound::unbounded(); 2];
        let mut objective = shifted_quadratic;
        let found = LocalBfgs::default()
            .minimize(&mut objective, array![0.0, 0.0].view(), &bounds)
            .unwrap();
        assert_abs_diff_eq!(found.x[0], 1.5, epsilon = 1e-4);
        assert_abs_diff_eq!(found.x[1], -0.5, epsilon = 1e-4);
        assert!(found.value < 1e-7);
    }

    #[test]
    fn bounded_search_stops_at_the_active_bound() {
        let bounds = vec![Bound::between(-1.0, 1.0).unwrap(), Bound::positive()];
        let found = minimize_bounded_start(
            shifted_quadratic,
            array![0.0, 1.0].view(),
            &bounds,
            &StartConfig::default(),
            &mut StdRng::seed_from_u64(3),
        )
        .unwrap();
        assert!(found.x[0] <= 1.0 && found.x[0] > 0.99, "x0 = {}", found.x[0]);
        assert!(found.x[1] > 0.0 && found.x[1] < 1e-2, "x1 = {}", found.x[1]);
    }

    #[test]
    fn start_outside_bounds_is_rejected() {
        let bounds = vec![Bound::between(0.0, 1.0).unwrap(), Bound::unbounded()];
        let err = minimize_bounded_start(
            shifted_quadratic,
            array![2.0, 0.0].view(),
            &bounds,
            &StartConfig::default(),
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap_err();
        assert!(matches!(err, OptimizeError::BoundViolation { index: 0, .. }));
    }

    #[test]
    fn all_divergent_starts_are_an_error() {
        let bounds = vec![Bound::unbounded()];
        let err = minimize_bounded_start(
            |x: ArrayView1<f64>| (f64::NAN, x.to_owned()),
            array![0.0].view(),
            &bounds,
            &StartConfig::default(),
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap_err();
        assert!(matches!(err, OptimizeError::NumericDivergence { .. }));
    }

    #[test]
    fn multi_start_escapes_a_poor_local_minimum() {
        // Double well with the deeper basin at x = 2.
        let objective = |x: ArrayView1<f64>| {
            let v = x[0];
            let f = (v * v - 4.0).powi(2) / 4.0 - 0.5 * v;
            let g = v * (v * v - 4.0) - 0.5;
            (f, array![g])
        };
        let bounds = vec![Bound::between(-3.0, 3.0).unwrap()];
        let config = StartConfig {
            strategy: StartStrategy::Lattice { points_per_dim: 9 },
            n_starts: 3,
            ..StartConfig::default()
        };
        let found = minimize_bounded_start(
            objective,
            array![-2.0].view(),
            &bounds,
            &config,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
        assert!(found.x[0] > 1.5, "stuck in the shallow basin at {}", found.x[0]);
    }

    #[test]
    fn random_screen_is_deterministic_for_a_seed() {
        let bounds = vec![Bound::positive(), Bound::between(-1.0, 4.0).unwrap()];
        let x0 = array![0.5, 0.0];
        let first =
            candidate_start_points_random(x0.view(), &bounds, 16, &mut StdRng::seed_from_u64(11))
                .unwrap();
        let second =
            candidate_start_points_random(x0.view(), &bounds, 16, &mut StdRng::seed_from_u64(11))
                .unwrap();
        assert_eq!(first, second);
        for point in &first {
            assert!(point[0] > 0.0);
            assert!((-1.0..=4.0).contains(&point[1]));
        }
    }

    #[test]
    fn lattice_covers_every_combination_inside_bounds() {
        let bounds = vec![Bound::between(0.0, 1.0).unwrap(), Bound::positive()];
        let points =
            candidate_start_points_lattice(array![0.5, 1.0].view(), &bounds, 3).unwrap();
        assert_eq!(points.len(), 9);
        for p in &points {
            assert!(p[0] > 0.0 && p[0] < 1.0);
            assert!(p[1] > 0.0);
        }

        let too_many = vec![Bound::unbounded(); 40];
        assert!(matches!(
            candidate_start_points_lattice(Array1::zeros(40).view(), &too_many, 3),
            Err(OptimizeError::InvalidConfig(_))
        ));
    }
}
