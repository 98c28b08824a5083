//! The `optimization` module builds and solves the joint calibration problem.
//!
//! A calibration run minimises, over one shared parameter vector, the robustified
//! edge-alignment residuals of every LiDAR edge point of every scene. The module is
//! organised bottom-up:
//!
//! * [`residual`]: the per-point [`EdgeAlignmentCost`]
//! * [`problem`]: the [`MultiSceneProblem`] assembled from scenes and bounds
//! * [`trust_region`] and [`tiny`]: two interchangeable solvers behind the
//!   [`CalibrationSolver`] trait
//! * [`result`]: the [`CalibrationResult`] handed back to the caller
//!
//! [`calibrate`] wires validation, assembly, solve and reporting together.

use log::info;
use serde::{Deserialize, Serialize};

pub mod loss;
pub mod problem;
pub mod residual;
pub mod result;
pub mod summary;
pub mod tiny;
pub mod trust_region;

pub use loss::RobustLoss;
pub use problem::{block_index, BlockIndex, Bounds, MultiSceneProblem, ProblemBuilder};
pub use residual::{EdgeAlignmentCost, ResidualModel};
pub use result::CalibrationResult;
pub use summary::{IterationRecord, SolverSummary, TerminationReason};
pub use tiny::TinySolverBackend;
pub use trust_region::TrustRegionSolver;

use crate::camera::CalibrationError;
use crate::config::{default_parameter_names, CalibrationConfig};
use crate::scene::Scene;

/// Which solver runs the problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverBackend {
    /// Native bounded trust-region Levenberg-Marquardt with full diagnostics.
    #[default]
    TrustRegion,
    /// `tiny_solver` Levenberg-Marquardt.
    TinySolver,
}

impl SolverBackend {
    pub fn solver(self) -> Box<dyn CalibrationSolver> {
        match self {
            SolverBackend::TrustRegion => Box::new(TrustRegionSolver),
            SolverBackend::TinySolver => Box::new(TinySolverBackend),
        }
    }
}

/// Solver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub backend: SolverBackend,
    pub max_iterations: usize,
    /// Stop when `|cost change| <= function_tolerance * cost`.
    pub function_tolerance: f64,
    /// Stop when the max-norm of the projected gradient falls below this.
    pub gradient_tolerance: f64,
    /// Stop when `|step| <= parameter_tolerance * (|x| + parameter_tolerance)`.
    pub parameter_tolerance: f64,
    /// Huber threshold. Zero or less switches the robust loss off.
    pub huber_threshold: f64,
    pub use_nonmonotonic_steps: bool,
    pub max_consecutive_nonmonotonic_steps: usize,
    pub initial_trust_region_radius: f64,
    /// Worker threads for residual evaluation, 0 for one per core.
    pub num_threads: usize,
    /// Log every iteration at info level.
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            backend: SolverBackend::default(),
            max_iterations: 100,
            function_tolerance: 1e-7,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-8,
            huber_threshold: 0.05,
            use_nonmonotonic_steps: true,
            max_consecutive_nonmonotonic_steps: 5,
            initial_trust_region_radius: 1e4,
            num_threads: 12,
            verbose: false,
        }
    }
}

impl SolverOptions {
    pub fn loss(&self) -> RobustLoss {
        if self.huber_threshold > 0.0 {
            RobustLoss::Huber {
                threshold: self.huber_threshold,
            }
        } else {
            RobustLoss::Trivial
        }
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        let positive = [
            ("function_tolerance", self.function_tolerance),
            ("gradient_tolerance", self.gradient_tolerance),
            ("parameter_tolerance", self.parameter_tolerance),
            ("initial_trust_region_radius", self.initial_trust_region_radius),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(CalibrationError::InvalidParams(format!(
                    "solver option {name} must be positive, got {value}"
                )));
            }
        }
        if !self.huber_threshold.is_finite() {
            return Err(CalibrationError::InvalidParams(
                "solver option huber_threshold must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Final parameters of a solve and how it went.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub parameters: Vec<f64>,
    pub summary: SolverSummary,
}

/// A solver for [`MultiSceneProblem`]s.
///
/// Implementations keep every parameter inside the problem bounds and hold
/// parameters with coinciding bounds constant. Numerical trouble is reported
/// through [`TerminationReason`], never as an error.
pub trait CalibrationSolver {
    fn backend(&self) -> SolverBackend;

    /// Minimises the problem cost starting from `initial`.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InvalidParams`] if `initial` does not match the problem
    /// * [`CalibrationError::InfeasibleInitialValue`] if `initial` lies outside the bounds
    /// * [`CalibrationError::ThreadPool`] if the worker pool cannot be created
    fn solve(
        &self,
        problem: &MultiSceneProblem,
        initial: &[f64],
        options: &SolverOptions,
    ) -> Result<SolveOutcome, CalibrationError>;
}

/// Dedicated pool so the configured worker count does not leak into the global pool.
pub(crate) fn build_thread_pool(num_threads: usize) -> Result<rayon::ThreadPool, CalibrationError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map_err(|e| CalibrationError::ThreadPool(e.to_string()))
}

pub(crate) fn check_initial_parameters(
    problem: &MultiSceneProblem,
    initial: &[f64],
) -> Result<(), CalibrationError> {
    if initial.len() != problem.num_params() {
        return Err(CalibrationError::InvalidParams(format!(
            "expected {} initial parameters, got {}",
            problem.num_params(),
            initial.len()
        )));
    }
    problem
        .bounds()
        .check_feasible(&default_parameter_names(problem.layout()), initial)
}

/// Runs a full calibration: validation, assembly, solve and reporting.
///
/// # Arguments
///
/// * `config` - Parameters, bounds, model settings and solver options
/// * `scenes` - Captures to align, in the order their residuals are registered
///
/// # Returns
///
/// The [`CalibrationResult`]; non-convergence and numerical failure are reported
/// in its summary rather than as an error.
pub fn calibrate(
    config: &CalibrationConfig,
    scenes: &[Scene],
) -> Result<CalibrationResult, CalibrationError> {
    let problem = MultiSceneProblem::from_config(config, scenes)?;
    let solver = config.solver.backend.solver();
    info!(
        "Calibrating {} parameters over {} scenes ({} residual blocks) with {:?}",
        problem.num_params(),
        problem.num_scenes(),
        problem.num_residual_terms(),
        solver.backend()
    );

    let outcome = solver.solve(&problem, &config.parameters.initial, &config.solver)?;
    let result = CalibrationResult::new(config, outcome)?;
    info!("{}", result.summary.brief_report());
    Ok(result)
}
