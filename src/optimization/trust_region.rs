//! Bounded trust-region Levenberg-Marquardt with robust loss.
//!
//! Each iteration solves the damped normal equations
//! `(JᵀJ + D / radius) δ = -g` with `D = diag(JᵀJ)` clamped to `[1e-6, 1e32]`, projects
//! `x + δ` back into the box and judges the projected step by the ratio of actual
//! to predicted cost decrease. With non-monotonic steps enabled the ratio is also
//! measured against a reference cost a few iterations back, so the solver may
//! cross small ridges in the density surface.
//!
//! Residuals and Jacobians are evaluated in fixed-size chunks on the installed
//! rayon pool and summed in chunk order, which keeps every result bitwise
//! identical whatever the worker count.

use std::time::Instant;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::camera::CalibrationError;
use crate::optimization::loss::RobustLoss;
use crate::optimization::problem::{MultiSceneProblem, EVALUATION_CHUNK};
use crate::optimization::summary::{IterationRecord, SolverSummary, TerminationReason};
use crate::optimization::{
    build_thread_pool, check_initial_parameters, CalibrationSolver, SolveOutcome, SolverBackend,
    SolverOptions,
};

const MIN_LM_DIAGONAL: f64 = 1e-6;
const MAX_LM_DIAGONAL: f64 = 1e32;
const MIN_TRUST_REGION_RADIUS: f64 = 1e-32;
const MAX_TRUST_REGION_RADIUS: f64 = 1e16;
/// Steps with a smaller actual/predicted decrease ratio are rejected.
const MIN_RELATIVE_DECREASE: f64 = 1e-3;

/// Native solver, the default backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustRegionSolver;

impl CalibrationSolver for TrustRegionSolver {
    fn backend(&self) -> SolverBackend {
        SolverBackend::TrustRegion
    }

    fn solve(
        &self,
        problem: &MultiSceneProblem,
        initial: &[f64],
        options: &SolverOptions,
    ) -> Result<SolveOutcome, CalibrationError> {
        check_initial_parameters(problem, initial)?;
        let pool = build_thread_pool(options.num_threads)?;
        let start = Instant::now();

        let mut outcome = pool.install(|| Minimizer::new(problem, options).run(initial));

        outcome.summary.num_threads = pool.current_num_threads();
        outcome.summary.solve_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        Ok(outcome)
    }
}

/// Gauss-Newton model of the robustified cost at the current point.
#[derive(Debug, Clone)]
struct NormalEquations {
    cost: f64,
    jtj: DMatrix<f64>,
    gradient: DVector<f64>,
}

impl NormalEquations {
    fn zeros(n: usize) -> Self {
        Self {
            cost: 0.0,
            jtj: DMatrix::zeros(n, n),
            gradient: DVector::zeros(n),
        }
    }

    fn accumulate(&mut self, other: &Self) {
        self.cost += other.cost;
        self.jtj += &other.jtj;
        self.gradient += &other.gradient;
    }
}

/// Robustified normal equations at `x`, or `None` if any residual or Jacobian entry
/// is not finite.
///
/// Each term is reweighted with `sqrt(rho'(s))` before it is accumulated.
fn linearize(
    problem: &MultiSceneProblem,
    x: &DVector<f64>,
    loss: RobustLoss,
) -> Option<NormalEquations> {
    let n = x.len();
    let partials: Vec<Option<NormalEquations>> = problem
        .terms()
        .par_chunks(EVALUATION_CHUNK)
        .map(|chunk| {
            let mut acc = NormalEquations::zeros(n);
            for term in chunk {
                let (r, j) = term.linearize(x);
                if !r.iter().chain(j.iter()).all(|v| v.is_finite()) {
                    return None;
                }
                let (rho, weight) = loss.rho_and_weight(r.norm_squared());
                let scale = weight.sqrt();
                let jw = j * scale;
                let rw = r * scale;
                acc.cost += rho;
                acc.jtj += jw.tr_mul(&jw);
                acc.gradient += jw.tr_mul(&rw);
            }
            Some(acc)
        })
        .collect();

    let mut total = NormalEquations::zeros(n);
    for partial in partials {
        total.accumulate(&partial?);
    }
    total.cost *= 0.5;
    Some(total)
}

/// Bookkeeping for the non-monotonic acceptance test.
#[derive(Debug, Clone)]
struct StepEvaluator {
    reference_cost: f64,
    minimum_cost: f64,
    candidate_cost: f64,
    accumulated_reference_model_change: f64,
    accumulated_candidate_model_change: f64,
    consecutive_nonmonotonic_steps: usize,
    max_consecutive_nonmonotonic_steps: usize,
}

impl StepEvaluator {
    fn new(initial_cost: f64, max_consecutive_nonmonotonic_steps: usize) -> Self {
        Self {
            reference_cost: initial_cost,
            minimum_cost: initial_cost,
            candidate_cost: initial_cost,
            accumulated_reference_model_change: 0.0,
            accumulated_candidate_model_change: 0.0,
            consecutive_nonmonotonic_steps: 0,
            max_consecutive_nonmonotonic_steps,
        }
    }

    /// Decrease ratio measured against the reference cost.
    fn historical_relative_decrease(&self, trial_cost: f64, model_change: f64) -> f64 {
        (self.reference_cost - trial_cost) / (self.accumulated_reference_model_change + model_change)
    }

    fn step_accepted(&mut self, cost: f64, model_change: f64) {
        self.accumulated_candidate_model_change += model_change;
        self.accumulated_reference_model_change += model_change;
        if cost < self.minimum_cost {
            self.minimum_cost = cost;
            self.consecutive_nonmonotonic_steps = 0;
            self.candidate_cost = cost;
            self.accumulated_candidate_model_change = 0.0;
        } else {
            self.consecutive_nonmonotonic_steps += 1;
            if cost > self.candidate_cost {
                self.candidate_cost = cost;
                self.accumulated_candidate_model_change = 0.0;
            }
        }
        if self.consecutive_nonmonotonic_steps == self.max_consecutive_nonmonotonic_steps {
            self.reference_cost = self.candidate_cost;
            self.accumulated_reference_model_change = self.accumulated_candidate_model_change;
        }
    }
}

struct Minimizer<'a> {
    problem: &'a MultiSceneProblem,
    options: &'a SolverOptions,
    loss: RobustLoss,
    /// `false` for parameters whose bounds coincide.
    free: Vec<bool>,
    history: Vec<IterationRecord>,
    successful_steps: usize,
    unsuccessful_steps: usize,
}

/// Current point and the lowest-cost point seen so far.
struct Iterate {
    x: DVector<f64>,
    cost: f64,
    best_x: DVector<f64>,
    best_cost: f64,
}

impl<'a> Minimizer<'a> {
    fn new(problem: &'a MultiSceneProblem, options: &'a SolverOptions) -> Self {
        let bounds = problem.bounds();
        Self {
            problem,
            options,
            loss: options.loss(),
            free: (0..bounds.len()).map(|i| !bounds.is_fixed(i)).collect(),
            history: Vec::new(),
            successful_steps: 0,
            unsuccessful_steps: 0,
        }
    }

    fn run(mut self, initial: &[f64]) -> SolveOutcome {
        let x = DVector::from_column_slice(initial);
        info!(
            "Trust-region LM: {} parameters ({} free), {} residual blocks",
            x.len(),
            self.free.iter().filter(|f| **f).count(),
            self.problem.num_residual_terms()
        );

        let Some(mut lin) = self.linearize(&x) else {
            warn!("Residuals or Jacobian are not finite at the initial parameters");
            let cost = self.problem.cost(initial, self.loss);
            let state = Iterate {
                best_x: x.clone(),
                x,
                cost,
                best_cost: cost,
            };
            return self.finish(
                state,
                cost,
                0,
                TerminationReason::NumericalFailure,
                "Residuals or Jacobian not finite at the initial parameters",
            );
        };

        let initial_cost = lin.cost;
        let mut state = Iterate {
            best_x: x.clone(),
            x,
            cost: initial_cost,
            best_cost: initial_cost,
        };
        let mut radius = self.options.initial_trust_region_radius;
        let mut decrease_factor = 2.0;
        let mut evaluator =
            StepEvaluator::new(initial_cost, self.options.max_consecutive_nonmonotonic_steps);
        let mut gradient_norm = self.projected_gradient_norm(&state.x, &lin.gradient);

        if gradient_norm <= self.options.gradient_tolerance {
            return self.finish(
                state,
                initial_cost,
                0,
                TerminationReason::Converged,
                "Gradient tolerance reached",
            );
        }

        for iteration in 1..=self.options.max_iterations {
            let Some(step) = self.compute_step(&state.x, &lin, radius) else {
                debug!("Iteration {iteration}: linear solve failed, shrinking trust region");
                self.unsuccessful_steps += 1;
                radius /= decrease_factor;
                decrease_factor *= 2.0;
                self.record(iteration, state.cost, 0.0, gradient_norm, 0.0, radius, 0.0, false);
                if radius < MIN_TRUST_REGION_RADIUS {
                    return self.finish(
                        state,
                        initial_cost,
                        iteration,
                        TerminationReason::Converged,
                        "Trust region radius below minimum",
                    );
                }
                continue;
            };

            let step_norm = step.norm();
            let x_norm = state.x.norm();
            let parameter_tolerance = self.options.parameter_tolerance;
            if step_norm <= parameter_tolerance * (x_norm + parameter_tolerance) {
                self.record(iteration, state.cost, 0.0, gradient_norm, step_norm, radius, 0.0, false);
                return self.finish(
                    state,
                    initial_cost,
                    iteration,
                    TerminationReason::Converged,
                    "Parameter tolerance reached",
                );
            }

            let trial = &state.x + &step;
            let model_change = -(lin.gradient.dot(&step) + 0.5 * step.dot(&(&lin.jtj * &step)));
            let trial_cost = self.problem.cost(trial.as_slice(), self.loss);

            let relative_decrease = if !trial_cost.is_finite() {
                warn!("Iteration {iteration}: trial cost is not finite, step rejected");
                f64::NEG_INFINITY
            } else if model_change <= 0.0 {
                f64::NEG_INFINITY
            } else {
                let monotonic = (state.cost - trial_cost) / model_change;
                if self.options.use_nonmonotonic_steps {
                    monotonic.max(evaluator.historical_relative_decrease(trial_cost, model_change))
                } else {
                    monotonic
                }
            };

            if relative_decrease <= MIN_RELATIVE_DECREASE {
                self.unsuccessful_steps += 1;
                radius /= decrease_factor;
                decrease_factor *= 2.0;
                self.record(
                    iteration,
                    state.cost,
                    0.0,
                    gradient_norm,
                    step_norm,
                    radius,
                    relative_decrease,
                    false,
                );
                if radius < MIN_TRUST_REGION_RADIUS {
                    return self.finish(
                        state,
                        initial_cost,
                        iteration,
                        TerminationReason::Converged,
                        "Trust region radius below minimum",
                    );
                }
                continue;
            }

            // Accepted.
            let cost_change = state.cost - trial_cost;
            let function_tolerance_reached =
                cost_change.abs() <= self.options.function_tolerance * state.cost;
            self.successful_steps += 1;
            radius = (radius
                / (1.0_f64 / 3.0).max(1.0 - (2.0 * relative_decrease - 1.0).powi(3)))
            .min(MAX_TRUST_REGION_RADIUS);
            decrease_factor = 2.0;
            evaluator.step_accepted(trial_cost, model_change);

            state.x = trial;
            state.cost = trial_cost;
            if trial_cost < state.best_cost {
                state.best_cost = trial_cost;
                state.best_x = state.x.clone();
            }

            lin = match self.linearize(&state.x) {
                Some(lin) => lin,
                None => {
                    warn!("Iteration {iteration}: residuals or Jacobian not finite at the accepted point");
                    self.record(
                        iteration,
                        state.cost,
                        cost_change,
                        f64::NAN,
                        step_norm,
                        radius,
                        relative_decrease,
                        true,
                    );
                    return self.finish(
                        state,
                        initial_cost,
                        iteration,
                        TerminationReason::NumericalFailure,
                        "Residuals or Jacobian not finite at a linearisation point",
                    );
                }
            };
            gradient_norm = self.projected_gradient_norm(&state.x, &lin.gradient);
            self.record(
                iteration,
                state.cost,
                cost_change,
                gradient_norm,
                step_norm,
                radius,
                relative_decrease,
                true,
            );

            if function_tolerance_reached {
                return self.finish(
                    state,
                    initial_cost,
                    iteration,
                    TerminationReason::Converged,
                    "Function tolerance reached",
                );
            }
            if gradient_norm <= self.options.gradient_tolerance {
                return self.finish(
                    state,
                    initial_cost,
                    iteration,
                    TerminationReason::Converged,
                    "Gradient tolerance reached",
                );
            }
        }

        let iterations = self.options.max_iterations;
        self.finish(
            state,
            initial_cost,
            iterations,
            TerminationReason::NoConvergence,
            "Maximum number of iterations reached",
        )
    }

    /// Linearises at `x` with fixed parameters removed from the system.
    fn linearize(&self, x: &DVector<f64>) -> Option<NormalEquations> {
        let mut lin = linearize(self.problem, x, self.loss)?;
        for (i, free) in self.free.iter().enumerate() {
            if !free {
                lin.jtj.row_mut(i).fill(0.0);
                lin.jtj.column_mut(i).fill(0.0);
                lin.gradient[i] = 0.0;
            }
        }
        Some(lin)
    }

    /// Solves the damped system and projects the step onto the bounds.
    fn compute_step(
        &self,
        x: &DVector<f64>,
        lin: &NormalEquations,
        radius: f64,
    ) -> Option<DVector<f64>> {
        let n = x.len();
        let mut lhs = lin.jtj.clone();
        for i in 0..n {
            if self.free[i] {
                let d = lin.jtj[(i, i)].clamp(MIN_LM_DIAGONAL, MAX_LM_DIAGONAL);
                lhs[(i, i)] += d / radius;
            } else {
                lhs[(i, i)] = 1.0;
            }
        }
        let delta = lhs.cholesky()?.solve(&(-&lin.gradient));
        if !delta.iter().all(|v| v.is_finite()) {
            return None;
        }

        let bounds = self.problem.bounds();
        Some(DVector::from_iterator(
            n,
            (0..n).map(|i| {
                if self.free[i] {
                    bounds.project(i, x[i] + delta[i]) - x[i]
                } else {
                    0.0
                }
            }),
        ))
    }

    /// `max_i |x_i - P(x_i - g_i)|` over free parameters, `P` the box projection.
    fn projected_gradient_norm(&self, x: &DVector<f64>, gradient: &DVector<f64>) -> f64 {
        let bounds = self.problem.bounds();
        (0..x.len())
            .filter(|&i| self.free[i])
            .map(|i| (x[i] - bounds.project(i, x[i] - gradient[i])).abs())
            .fold(0.0, f64::max)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        iteration: usize,
        cost: f64,
        cost_change: f64,
        gradient_max_norm: f64,
        step_norm: f64,
        trust_region_radius: f64,
        relative_decrease: f64,
        step_accepted: bool,
    ) {
        let line = format!(
            "{:>4}: cost {:.6e}, change {:.2e}, |g| {:.2e}, |step| {:.2e}, ratio {:.2e}, radius {:.2e}{}",
            iteration,
            cost,
            cost_change,
            gradient_max_norm,
            step_norm,
            relative_decrease,
            trust_region_radius,
            if step_accepted { "" } else { " (rejected)" }
        );
        if self.options.verbose {
            info!("{line}");
        } else {
            debug!("{line}");
        }
        self.history.push(IterationRecord {
            iteration,
            cost,
            cost_change,
            gradient_max_norm,
            step_norm,
            trust_region_radius,
            relative_decrease,
            step_accepted,
        });
    }

    fn finish(
        self,
        state: Iterate,
        initial_cost: f64,
        iterations: usize,
        termination: TerminationReason,
        message: &str,
    ) -> SolveOutcome {
        // Non-monotonic steps may end above the best point; hand back the best one.
        let (parameters, final_cost) = if state.best_cost <= state.cost || !state.cost.is_finite()
        {
            (state.best_x, state.best_cost)
        } else {
            (state.x, state.cost)
        };
        match termination {
            TerminationReason::Converged => info!("Trust-region LM converged: {message}"),
            TerminationReason::NoConvergence | TerminationReason::NumericalFailure => {
                warn!("Trust-region LM stopped: {message}")
            }
        }
        SolveOutcome {
            parameters: parameters.as_slice().to_vec(),
            summary: SolverSummary {
                backend: SolverBackend::TrustRegion,
                termination,
                message: message.to_string(),
                iterations: Some(iterations),
                successful_steps: self.successful_steps,
                unsuccessful_steps: self.unsuccessful_steps,
                initial_cost,
                final_cost,
                num_parameters: self.problem.num_params(),
                num_residual_blocks: self.problem.num_residual_terms(),
                num_residuals: self.problem.num_residuals(),
                num_threads: 0,
                solve_time_ms: 0.0,
                history: self.history,
            },
        }
    }
}
