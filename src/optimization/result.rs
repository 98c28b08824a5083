use std::fs;
use std::io::Write;

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

use crate::camera::{CalibrationError, FisheyePolyModel, PolynomialLayout};
use crate::config::CalibrationConfig;
use crate::optimization::summary::SolverSummary;
use crate::optimization::SolveOutcome;
use crate::scene::Scene;

/// Outcome of a calibration run: named initial and final parameters plus diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub names: Vec<String>,
    pub initial: Vec<f64>,
    /// Final parameters, in the order of `names`.
    pub parameters: Vec<f64>,
    pub layout: PolynomialLayout,
    /// Row-major forward distortion matrix the run used.
    pub distortion: [f64; 4],
    pub summary: SolverSummary,
}

impl CalibrationResult {
    pub fn new(config: &CalibrationConfig, outcome: SolveOutcome) -> Result<Self, CalibrationError> {
        if outcome.parameters.len() != config.parameters.names.len() {
            return Err(CalibrationError::InvalidParams(format!(
                "solver returned {} parameters for {} names",
                outcome.parameters.len(),
                config.parameters.names.len()
            )));
        }
        Ok(Self {
            names: config.parameters.names.clone(),
            initial: config.parameters.initial.clone(),
            parameters: outcome.parameters,
            layout: config.polynomial,
            distortion: config.distortion,
            summary: outcome.summary,
        })
    }

    pub fn is_converged(&self) -> bool {
        self.summary.is_converged()
    }

    /// `(name, final value)` pairs in parameter order.
    pub fn named_parameters(&self) -> Vec<(&str, f64)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.parameters.iter().copied())
            .collect()
    }

    /// Final value of the parameter called `name`.
    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.parameters[i])
    }

    /// Projection model at the final parameters.
    pub fn model(&self) -> Result<FisheyePolyModel, CalibrationError> {
        FisheyePolyModel::new(
            self.layout,
            &self.parameters,
            &Matrix2::from_row_slice(&self.distortion),
        )
    }

    /// Reprojects the scene's edge points with the final parameters.
    ///
    /// Points on the optical axis have no projection and are skipped.
    pub fn reproject(&self, scene: &Scene) -> Result<Vec<Vector2<f64>>, CalibrationError> {
        Ok(self.model()?.project_points(&scene.edge_points))
    }

    pub fn save_to_json(&self, path: &str) -> Result<(), CalibrationError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    pub fn load_from_json(path: &str) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::ImageSize;
    use crate::config::ParameterSet;
    use crate::density::DensityField;
    use crate::optimization::summary::TerminationReason;
    use crate::optimization::SolverBackend;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn outcome(parameters: Vec<f64>) -> SolveOutcome {
        SolveOutcome {
            parameters,
            summary: SolverSummary {
                backend: SolverBackend::TrustRegion,
                termination: TerminationReason::Converged,
                message: "Function tolerance reached".to_string(),
                iterations: Some(5),
                successful_steps: 4,
                unsuccessful_steps: 1,
                initial_cost: 2.0,
                final_cost: 1.0,
                num_parameters: 11,
                num_residual_blocks: 2,
                num_residuals: 4,
                num_threads: 1,
                solve_time_ms: 0.1,
                history: Vec::new(),
            },
        }
    }

    fn config() -> CalibrationConfig {
        let initial = vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 50.0, 50.0, 10.0, 0.0, 0.0];
        CalibrationConfig::new(
            PolynomialLayout::Odd,
            ParameterSet::unbounded(PolynomialLayout::Odd, initial),
        )
    }

    #[test]
    fn test_named_parameters_follow_order() {
        let mut final_params = config().parameters.initial;
        final_params[6] = 51.5;
        let result = CalibrationResult::new(&config(), outcome(final_params)).unwrap();
        let named = result.named_parameters();
        assert_eq!(named.len(), 11);
        assert_eq!(named[0], ("rx", 0.0));
        assert_eq!(named[6], ("u0", 51.5));
        assert_eq!(result.parameter("v0"), Some(50.0));
        assert_eq!(result.parameter("missing"), None);
        assert!(result.is_converged());
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        assert!(CalibrationResult::new(&config(), outcome(vec![0.0; 3])).is_err());
    }

    #[test]
    fn test_reproject_skips_on_axis_points() {
        let result = CalibrationResult::new(&config(), outcome(config().parameters.initial)).unwrap();
        let density = DensityField::new(2, 2, vec![1.0; 4], 1.0).unwrap();
        let scene = Scene::new(
            "s",
            vec![Vector3::new(0.1, 0.0, 1.0), Vector3::new(0.0, 0.0, 1.0)],
            density,
            ImageSize::new(100, 100),
        );
        let projected = result.reproject(&scene).unwrap();
        assert_eq!(projected.len(), 1);
        let theta = 0.1f64.atan();
        assert_relative_eq!(projected[0].x, 50.0 - 10.0 * theta, epsilon = 1e-9);
        assert_relative_eq!(projected[0].y, 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = std::env::temp_dir().join("lidar_fisheye_calib_result_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("result.json");
        let path = path.to_str().unwrap();

        let result = CalibrationResult::new(&config(), outcome(config().parameters.initial)).unwrap();
        result.save_to_json(path).unwrap();
        let loaded = CalibrationResult::load_from_json(path).unwrap();
        assert_eq!(loaded.names, result.names);
        assert_eq!(loaded.parameters, result.parameters);
        assert_eq!(loaded.summary.termination, TerminationReason::Converged);
    }
}
