//! Solver diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::optimization::SolverBackend;

/// Why a solve stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// A function, gradient or parameter tolerance was met.
    Converged,
    /// The iteration limit was reached first.
    NoConvergence,
    /// The residuals or Jacobian were not finite at a linearisation point.
    NumericalFailure,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Converged => "CONVERGENCE",
            TerminationReason::NoConvergence => "NO_CONVERGENCE",
            TerminationReason::NumericalFailure => "NUMERICAL_FAILURE",
        }
    }
}

/// State of the trust-region solver after one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Cost at the current point after this iteration.
    pub cost: f64,
    /// Decrease of the cost achieved by the trial step, zero if rejected.
    pub cost_change: f64,
    /// Max-norm of the projected gradient.
    pub gradient_max_norm: f64,
    pub step_norm: f64,
    pub trust_region_radius: f64,
    /// Actual over predicted decrease of the trial step.
    pub relative_decrease: f64,
    pub step_accepted: bool,
}

/// Summary of a finished solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSummary {
    pub backend: SolverBackend,
    pub termination: TerminationReason,
    pub message: String,
    /// Iterations performed. Unknown for backends that do not report it.
    pub iterations: Option<usize>,
    pub successful_steps: usize,
    pub unsuccessful_steps: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub num_parameters: usize,
    pub num_residual_blocks: usize,
    pub num_residuals: usize,
    pub num_threads: usize,
    /// Wall time of the solve in milliseconds
    pub solve_time_ms: f64,
    pub history: Vec<IterationRecord>,
}

impl SolverSummary {
    pub fn is_converged(&self) -> bool {
        self.termination == TerminationReason::Converged
    }

    /// One-line outcome.
    pub fn brief_report(&self) -> String {
        let iterations = self
            .iterations
            .map_or_else(|| "n/a".to_string(), |n| n.to_string());
        format!(
            "{:?}, Initial cost: {:.6e}, Final cost: {:.6e}, Iterations: {}, Termination: {}",
            self.backend,
            self.initial_cost,
            self.final_cost,
            iterations,
            self.termination.as_str()
        )
    }

    /// Multi-line report with problem size, costs, the iteration table and timing.
    pub fn full_report(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SolverSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Solver Summary ({:?})", self.backend)?;
        writeln!(f)?;
        writeln!(f, "{:<28}{:>12}", "Parameters", self.num_parameters)?;
        writeln!(f, "{:<28}{:>12}", "Residual blocks", self.num_residual_blocks)?;
        writeln!(f, "{:<28}{:>12}", "Residuals", self.num_residuals)?;
        writeln!(f, "{:<28}{:>12}", "Threads", self.num_threads)?;
        writeln!(f)?;
        writeln!(f, "{:<28}{:>20.6e}", "Initial cost", self.initial_cost)?;
        writeln!(f, "{:<28}{:>20.6e}", "Final cost", self.final_cost)?;
        writeln!(
            f,
            "{:<28}{:>20.6e}",
            "Change",
            self.initial_cost - self.final_cost
        )?;
        writeln!(f)?;
        match self.iterations {
            Some(n) => writeln!(f, "{:<28}{:>12}", "Iterations", n)?,
            None => writeln!(f, "{:<28}{:>12}", "Iterations", "n/a")?,
        }
        writeln!(f, "{:<28}{:>12}", "Successful steps", self.successful_steps)?;
        writeln!(f, "{:<28}{:>12}", "Unsuccessful steps", self.unsuccessful_steps)?;

        if !self.history.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "{:>4} {:>14} {:>11} {:>11} {:>11} {:>10} {:>10}",
                "iter", "cost", "cost_change", "|gradient|", "|step|", "tr_radius", "tr_ratio"
            )?;
            for r in &self.history {
                writeln!(
                    f,
                    "{:>4} {:>14.6e} {:>11.2e} {:>11.2e} {:>11.2e} {:>10.2e} {:>10.2e}",
                    r.iteration,
                    r.cost,
                    r.cost_change,
                    r.gradient_max_norm,
                    r.step_norm,
                    r.trust_region_radius,
                    r.relative_decrease
                )?;
            }
        }

        writeln!(f)?;
        writeln!(f, "{:<28}{:>12.3}", "Solve time (ms)", self.solve_time_ms)?;
        writeln!(
            f,
            "Termination: {} ({})",
            self.termination.as_str(),
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(iterations: Option<usize>) -> SolverSummary {
        SolverSummary {
            backend: SolverBackend::TrustRegion,
            termination: TerminationReason::Converged,
            message: "Function tolerance reached".to_string(),
            iterations,
            successful_steps: 3,
            unsuccessful_steps: 1,
            initial_cost: 10.0,
            final_cost: 0.5,
            num_parameters: 12,
            num_residual_blocks: 4,
            num_residuals: 8,
            num_threads: 2,
            solve_time_ms: 1.5,
            history: vec![IterationRecord {
                iteration: 1,
                cost: 0.5,
                cost_change: 9.5,
                gradient_max_norm: 1e-3,
                step_norm: 0.2,
                trust_region_radius: 3e4,
                relative_decrease: 0.9,
                step_accepted: true,
            }],
        }
    }

    #[test]
    fn test_full_report_contents() {
        let report = summary(Some(4)).full_report();
        assert_eq!(report, format!("{}", summary(Some(4))));
        assert!(report.contains("Residual blocks"));
        assert!(report.contains("CONVERGENCE"));
        assert!(report.contains("Function tolerance reached"));
        assert!(report.contains("tr_radius"));
    }

    #[test]
    fn test_missing_iteration_count_is_reported() {
        let s = summary(None);
        assert!(s.brief_report().contains("Iterations: n/a"));
        assert!(s.full_report().contains("n/a"));
        assert!(s.is_converged());
    }

    #[test]
    fn test_summary_serializes() {
        let json = serde_json::to_string(&summary(Some(1))).unwrap();
        assert!(json.contains("\"termination\":\"converged\""));
        assert!(json.contains("\"backend\":\"trust_region\""));
    }
}
