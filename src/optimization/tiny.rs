//! Backend running the problem through `tiny_solver`'s Levenberg-Marquardt.
//!
//! The two parameter blocks become the variables `"rotation"` and `"tail"`, each
//! edge point one two-dimensional residual block with a Huber loss. `tiny_solver`
//! does not expose its iteration count or the reason it stopped, so the summary
//! reports costs only: the run counts as converged when the final cost is finite
//! and not above the initial one.

use std::collections::HashMap;
use std::time::Instant;

use log::{info, warn};
use nalgebra::DVector;
use tiny_solver::loss_functions::{HuberLoss, Loss};
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use crate::camera::{CalibrationError, ROTATION_DIM};
use crate::optimization::loss::RobustLoss;
use crate::optimization::problem::{block_index, MultiSceneProblem, ROTATION_BLOCK, TAIL_BLOCK};
use crate::optimization::residual::EdgeAlignmentCost;
use crate::optimization::summary::{SolverSummary, TerminationReason};
use crate::optimization::{
    build_thread_pool, check_initial_parameters, CalibrationSolver, SolveOutcome, SolverBackend,
    SolverOptions,
};

/// `tiny_solver` Levenberg-Marquardt backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct TinySolverBackend;

impl TinySolverBackend {
    fn build_problem(problem: &MultiSceneProblem, loss: RobustLoss) -> tiny_solver::Problem {
        let mut tiny = tiny_solver::Problem::new();
        for term in problem.terms() {
            let loss: Option<Box<dyn Loss + Send>> = match loss {
                RobustLoss::Trivial => None,
                RobustLoss::Huber { threshold } => Some(Box::new(HuberLoss::new(threshold))),
            };
            tiny.add_residual_block(
                EdgeAlignmentCost::RESIDUAL_DIM,
                &[ROTATION_BLOCK, TAIL_BLOCK],
                Box::new(term.clone()),
                loss,
            );
        }

        let bounds = problem.bounds();
        for i in 0..problem.num_params() {
            let index = block_index(i);
            if bounds.is_fixed(i) {
                tiny.fix_variable(index.block_name(), index.offset());
            } else {
                tiny.set_variable_bounds(
                    index.block_name(),
                    index.offset(),
                    bounds.lower[i],
                    bounds.upper[i],
                );
            }
        }
        tiny
    }
}

impl CalibrationSolver for TinySolverBackend {
    fn backend(&self) -> SolverBackend {
        SolverBackend::TinySolver
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
        let loss = options.loss();

        let initial_cost = pool.install(|| problem.cost(initial, loss));
        let summary = |termination, message: &str, final_cost| SolverSummary {
            backend: SolverBackend::TinySolver,
            termination,
            message: message.to_string(),
            iterations: None,
            successful_steps: 0,
            unsuccessful_steps: 0,
            initial_cost,
            final_cost,
            num_parameters: problem.num_params(),
            num_residual_blocks: problem.num_residual_terms(),
            num_residuals: problem.num_residuals(),
            num_threads: pool.current_num_threads(),
            solve_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            history: Vec::new(),
        };

        if !initial_cost.is_finite() {
            warn!("tiny-solver: cost is not finite at the initial parameters");
            return Ok(SolveOutcome {
                parameters: initial.to_vec(),
                summary: summary(
                    TerminationReason::NumericalFailure,
                    "Residuals not finite at the initial parameters",
                    initial_cost,
                ),
            });
        }

        let tiny = Self::build_problem(problem, loss);
        let mut initial_values = HashMap::new();
        initial_values.insert(
            ROTATION_BLOCK.to_string(),
            DVector::from_column_slice(&initial[..ROTATION_DIM]),
        );
        initial_values.insert(
            TAIL_BLOCK.to_string(),
            DVector::from_column_slice(&initial[ROTATION_DIM..]),
        );

        let optimizer_options = OptimizerOptions {
            max_iteration: options.max_iterations,
            verbosity_level: usize::from(options.verbose),
            min_rel_error_decrease_threshold: options.function_tolerance,
            ..OptimizerOptions::default()
        };

        info!(
            "Starting tiny-solver Levenberg-Marquardt over {} residual blocks",
            problem.num_residual_terms()
        );
        let optimizer = LevenbergMarquardtOptimizer::default();
        let result =
            pool.install(|| optimizer.optimize(&tiny, &initial_values, Some(optimizer_options)));

        let bounds = problem.bounds();
        let optimized = result.and_then(|values| {
            let rotation = values.get(ROTATION_BLOCK)?;
            let tail = values.get(TAIL_BLOCK)?;
            Some(
                rotation
                    .iter()
                    .chain(tail.iter())
                    .enumerate()
                    .map(|(i, v)| bounds.project(i, *v))
                    .collect::<Vec<f64>>(),
            )
        });
        let Some(parameters) = optimized else {
            warn!("tiny-solver returned no solution");
            return Ok(SolveOutcome {
                parameters: initial.to_vec(),
                summary: summary(
                    TerminationReason::NumericalFailure,
                    "tiny-solver returned no solution",
                    initial_cost,
                ),
            });
        };

        let final_cost = pool.install(|| problem.cost(&parameters, loss));
        let outcome = if final_cost.is_finite() && final_cost <= initial_cost {
            info!("tiny-solver finished, cost {initial_cost:.6e} -> {final_cost:.6e}");
            SolveOutcome {
                parameters,
                summary: summary(
                    TerminationReason::Converged,
                    "tiny-solver stopped with a non-increasing cost",
                    final_cost,
                ),
            }
        } else {
            warn!("tiny-solver did not reduce the cost ({initial_cost:.6e} -> {final_cost:.6e})");
            SolveOutcome {
                parameters: initial.to_vec(),
                summary: summary(
                    TerminationReason::NoConvergence,
                    "tiny-solver did not reduce the cost",
                    initial_cost,
                ),
            }
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{ImageSize, PolynomialAnchor, PolynomialLayout};
    use crate::density::DensityField;
    use crate::optimization::problem::{Bounds, ProblemBuilder};
    use crate::scene::Scene;
    use nalgebra::{Matrix2, Vector3};

    fn initial() -> Vec<f64> {
        vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 47.0, 47.0, 10.0, 0.0, 0.0]
    }

    fn problem(points: Vec<Vector3<f64>>) -> MultiSceneProblem {
        let density = DensityField::from_fn(101, 101, 1.0, |r, c| {
            let dr = r as f64 - 50.0;
            let dc = c as f64 - 50.0;
            (-(dr * dr + dc * dc) / 50.0).exp()
        })
        .unwrap();
        let scene = Scene::new("bump", points, density, ImageSize::new(100, 100));
        let mut lower = initial();
        let mut upper = initial();
        for i in [6, 7] {
            lower[i] = 40.0;
            upper[i] = 60.0;
        }
        let mut builder = ProblemBuilder::new(
            PolynomialLayout::Odd,
            &Matrix2::identity(),
            PolynomialAnchor::default(),
        )
        .unwrap();
        builder.add_scene(&scene).unwrap();
        builder.build(Bounds::new(lower, upper)).unwrap()
    }

    #[test]
    fn test_tiny_solver_never_increases_cost() {
        let points = vec![
            Vector3::new(0.1, 0.1, 1.0),
            Vector3::new(-0.1, 0.1, 1.0),
            Vector3::new(0.1, -0.1, 1.0),
            Vector3::new(-0.1, -0.1, 1.0),
        ];
        let problem = problem(points);
        let options = SolverOptions {
            backend: SolverBackend::TinySolver,
            num_threads: 1,
            ..SolverOptions::default()
        };
        let outcome = TinySolverBackend.solve(&problem, &initial(), &options).unwrap();
        let summary = &outcome.summary;
        assert_eq!(summary.iterations, None);
        assert!(summary.final_cost <= summary.initial_cost);
        assert_eq!(outcome.parameters.len(), 11);
        for i in [6, 7] {
            assert!((40.0..=60.0).contains(&outcome.parameters[i]));
        }
    }

    #[test]
    fn test_tiny_solver_reports_non_finite_start() {
        let problem = problem(vec![Vector3::new(0.0, 0.0, 1.0)]);
        let options = SolverOptions {
            num_threads: 1,
            ..SolverOptions::default()
        };
        let outcome = TinySolverBackend.solve(&problem, &initial(), &options).unwrap();
        assert_eq!(outcome.summary.termination, TerminationReason::NumericalFailure);
        assert_eq!(outcome.parameters, initial());
    }

    #[test]
    fn test_tiny_solver_rejects_infeasible_start() {
        let problem = problem(vec![Vector3::new(0.1, 0.1, 1.0)]);
        let mut start = initial();
        start[7] = 61.0;
        let options = SolverOptions {
            num_threads: 1,
            ..SolverOptions::default()
        };
        assert!(matches!(
            TinySolverBackend.solve(&problem, &start, &options),
            Err(CalibrationError::InfeasibleInitialValue { name, .. }) if name == "v0"
        ));
    }
}
