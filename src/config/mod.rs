//! Calibration run configuration.
//!
//! A [`CalibrationConfig`] gathers everything a run needs besides the scenes
//! themselves. It round-trips through YAML:
//!
//! ```yaml
//! parameters:
//!   names: [rx, ry, rz, tx, ty, tz, u0, v0, a0, a1, a3, a5]
//!   initial: [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1024.0, 1224.0, 0.0, 616.0, -4.0, 0.0]
//!   lower: [...]
//!   upper: [...]
//! distortion: [1.0, 0.0, 0.0, 1.0]
//! polynomial: sparse
//! weighting: relative_size
//! solver:
//!   max_iterations: 100
//!   num_threads: 12
//! ```
//!
//! Fields other than `parameters` fall back to their defaults when omitted.

use std::fs;
use std::io::Write;

use log::info;
use nalgebra::Matrix2;
use serde::{Deserialize, Serialize};

use crate::camera::{validation, CalibrationError, PolynomialAnchor, PolynomialLayout};
use crate::optimization::{Bounds, SolverOptions};
use crate::scene::{SceneWeighting, REFERENCE_POINT_COUNT};

/// Flattened parameter vector with names and box bounds, index-aligned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub names: Vec<String>,
    pub initial: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl ParameterSet {
    /// Unbounded parameters with the default names of `layout`.
    pub fn unbounded(layout: PolynomialLayout, initial: Vec<f64>) -> Self {
        let n = initial.len();
        Self {
            names: default_parameter_names(layout),
            initial,
            lower: vec![f64::NEG_INFINITY; n],
            upper: vec![f64::INFINITY; n],
        }
    }
}

/// `rx, ry, rz, tx, ty, tz, u0, v0` followed by the free polynomial terms of `layout`.
pub fn default_parameter_names(layout: PolynomialLayout) -> Vec<String> {
    let coefficients: &[&str] = match layout {
        PolynomialLayout::Odd => &["a1", "a3", "a5"],
        PolynomialLayout::Sparse => &["a0", "a1", "a3", "a5"],
        PolynomialLayout::Dense => &["a0", "a1", "a2", "a3", "a4"],
    };
    ["rx", "ry", "rz", "tx", "ty", "tz", "u0", "v0"]
        .iter()
        .chain(coefficients)
        .map(|s| s.to_string())
        .collect()
}

fn identity_distortion() -> [f64; 4] {
    [1.0, 0.0, 0.0, 1.0]
}

fn default_reference_count() -> f64 {
    REFERENCE_POINT_COUNT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub parameters: ParameterSet,
    /// Affine distortion matrix `[c, d; e, 1]`, row-major.
    #[serde(default = "identity_distortion")]
    pub distortion: [f64; 4],
    #[serde(default)]
    pub polynomial: PolynomialLayout,
    #[serde(default)]
    pub anchor: PolynomialAnchor,
    #[serde(default)]
    pub weighting: SceneWeighting,
    #[serde(default = "default_reference_count")]
    pub reference_point_count: f64,
    #[serde(default)]
    pub solver: SolverOptions,
}

impl CalibrationConfig {
    /// Config with defaults for everything but the parameter set.
    pub fn new(polynomial: PolynomialLayout, parameters: ParameterSet) -> Self {
        Self {
            parameters,
            distortion: identity_distortion(),
            polynomial,
            anchor: PolynomialAnchor::default(),
            weighting: SceneWeighting::default(),
            reference_point_count: REFERENCE_POINT_COUNT,
            solver: SolverOptions::default(),
        }
    }

    pub fn load_from_yaml(path: &str) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path)?;
        let config: CalibrationConfig = serde_yaml::from_str(&contents)?;
        info!("Loaded calibration config from {path}");
        Ok(config)
    }

    pub fn save_to_yaml(&self, path: &str) -> Result<(), CalibrationError> {
        let yaml_string = serde_yaml::to_string(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }

    pub fn distortion_matrix(&self) -> Matrix2<f64> {
        Matrix2::from_row_slice(&self.distortion)
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.parameters.lower.clone(), self.parameters.upper.clone())
    }

    /// Runs every configuration check, before anything is assembled.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InvalidParams`] for a parameter count that does not fit
    ///   the layout, a name count that does not match, non-finite values or invalid
    ///   solver settings
    /// * [`CalibrationError::BoundsLengthMismatch`] for misaligned bounds
    /// * [`CalibrationError::SingularDistortion`] if the distortion matrix has no inverse
    /// * [`CalibrationError::InfeasibleInitialValue`] if an initial value lies outside its bounds
    pub fn validate(&self) -> Result<(), CalibrationError> {
        let params = &self.parameters;
        let expected = self.polynomial.num_params();
        if params.initial.len() != expected {
            return Err(CalibrationError::InvalidParams(format!(
                "{:?} layout expects {} parameters, got {}",
                self.polynomial,
                expected,
                params.initial.len()
            )));
        }
        if params.names.len() != params.initial.len() {
            return Err(CalibrationError::InvalidParams(format!(
                "{} names given for {} parameters",
                params.names.len(),
                params.initial.len()
            )));
        }
        validation::validate_bounds_len(expected, &params.lower, &params.upper)?;
        validation::validate_finite("initial", &params.initial)?;
        validation::validate_finite("distortion", &self.distortion)?;
        if self.distortion_matrix().try_inverse().is_none() {
            return Err(CalibrationError::SingularDistortion);
        }
        if !(self.reference_point_count.is_finite() && self.reference_point_count > 0.0) {
            return Err(CalibrationError::InvalidParams(format!(
                "reference point count must be positive, got {}",
                self.reference_point_count
            )));
        }
        self.solver.validate()?;
        self.bounds().check_feasible(&params.names, &params.initial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::SolverBackend;

    fn sparse_config() -> CalibrationConfig {
        let initial = vec![
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1024.0, 1224.0, 0.0, 616.0, -4.0, 0.0,
        ];
        let mut parameters = ParameterSet::unbounded(PolynomialLayout::Sparse, initial);
        parameters.lower[6] = 1000.0;
        parameters.upper[6] = 1050.0;
        CalibrationConfig::new(PolynomialLayout::Sparse, parameters)
    }

    #[test]
    fn test_default_names_match_layouts() {
        for layout in [
            PolynomialLayout::Odd,
            PolynomialLayout::Sparse,
            PolynomialLayout::Dense,
        ] {
            assert_eq!(default_parameter_names(layout).len(), layout.num_params());
        }
        assert_eq!(default_parameter_names(PolynomialLayout::Sparse)[8], "a0");
    }

    #[test]
    fn test_valid_config() {
        assert!(sparse_config().validate().is_ok());
    }

    #[test]
    fn test_bounds_length_mismatch() {
        let mut config = sparse_config();
        config.parameters.upper.pop();
        assert!(matches!(
            config.validate(),
            Err(CalibrationError::BoundsLengthMismatch {
                expected: 12,
                lower: 12,
                upper: 11
            })
        ));
    }

    #[test]
    fn test_name_count_mismatch() {
        let mut config = sparse_config();
        config.parameters.names.pop();
        assert!(matches!(
            config.validate(),
            Err(CalibrationError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_layout_mismatch() {
        let mut config = sparse_config();
        config.polynomial = PolynomialLayout::Dense;
        assert!(matches!(
            config.validate(),
            Err(CalibrationError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_singular_distortion() {
        let mut config = sparse_config();
        config.distortion = [1.0, 1.0, 1.0, 1.0];
        assert!(matches!(
            config.validate(),
            Err(CalibrationError::SingularDistortion)
        ));
    }

    #[test]
    fn test_infeasible_initial_value() {
        let mut config = sparse_config();
        config.parameters.initial[6] = 900.0;
        match config.validate() {
            Err(CalibrationError::InfeasibleInitialValue { name, value, .. }) => {
                assert_eq!(name, "u0");
                assert_eq!(value, 900.0);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_distortion_is_row_major() {
        let mut config = sparse_config();
        config.distortion = [1.0, 2.0, 3.0, 1.0];
        let m = config.distortion_matrix();
        assert_eq!(m[(0, 1)], 2.0);
        assert_eq!(m[(1, 0)], 3.0);
    }

    #[test]
    fn test_yaml_defaults() {
        let yaml = "\
parameters:
  names: [a, b, c, d, e, f, g, h, i, j, k]
  initial: [0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1]
  lower: [-1, -1, -1, -1, -1, -1, 0, 0, 0, 0, 0]
  upper: [1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2]
polynomial: odd
solver:
  backend: tiny_solver
";
        let config: CalibrationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.polynomial, PolynomialLayout::Odd);
        assert_eq!(config.distortion, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.reference_point_count, 30000.0);
        assert_eq!(config.weighting, SceneWeighting::RelativeSize);
        assert_eq!(config.solver.backend, SolverBackend::TinySolver);
        assert_eq!(config.solver.max_iterations, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_round_trip_through_file() {
        let dir = std::env::temp_dir().join("lidar_fisheye_calib_config_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        let path = path.to_str().unwrap();

        let mut config = sparse_config();
        config.parameters.lower = vec![-10.0; 12];
        config.parameters.upper = vec![2000.0; 12];
        config.save_to_yaml(path).unwrap();
        let loaded = CalibrationConfig::load_from_yaml(path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            CalibrationConfig::load_from_yaml("/nonexistent/calib.yaml"),
            Err(CalibrationError::IOError(_))
        ));
    }
}
