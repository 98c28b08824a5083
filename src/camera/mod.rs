//! Camera-side types shared by the projection model and the optimizer.
//!
//! The only camera model handled here is the angle-polynomial fisheye described in
//! [`fisheye_poly`]. This module also hosts the crate-wide [`CalibrationError`].

use serde::{Deserialize, Serialize};

pub mod fisheye_poly;

pub use fisheye_poly::{
    FisheyePolyModel, PolynomialAnchor, PolynomialLayout, Projection, ROTATION_DIM,
    TAIL_FIXED_DIM,
};

/// Size of the original camera image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

impl ImageSize {
    pub fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Invalid calibration parameters: {0}")]
    InvalidParams(String),
    #[error("Bounds do not match the parameter vector: expected {expected}, got {lower} lower and {upper} upper bounds")]
    BoundsLengthMismatch {
        expected: usize,
        lower: usize,
        upper: usize,
    },
    #[error("At least one scene is required")]
    NoScenes,
    #[error("Scene '{0}' has no edge points")]
    EmptyScene(String),
    #[error("Invalid density field: {0}")]
    InvalidDensityField(String),
    #[error("Distortion matrix is singular")]
    SingularDistortion,
    #[error("Initial value of '{name}' ({value}) lies outside [{lower}, {upper}]")]
    InfeasibleInitialValue {
        name: String,
        value: f64,
        lower: f64,
        upper: f64,
    },
    #[error("Point lies on the optical axis, planar radius is zero")]
    PointOnOpticalAxis,
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("JSON error: {0}")]
    JsonError(String),
    #[error("CSV error: {0}")]
    CsvError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CalibrationError {
    fn from(err: serde_yaml::Error) -> Self {
        CalibrationError::YamlError(err.to_string())
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        CalibrationError::JsonError(err.to_string())
    }
}

impl From<csv::Error> for CalibrationError {
    fn from(err: csv::Error) -> Self {
        CalibrationError::CsvError(err.to_string())
    }
}

/// Common validation functions for calibration inputs
pub mod validation {
    use super::*;

    /// Checks that both bound arrays line up with a parameter vector of `expected` entries.
    ///
    /// The ordering `lower[i] <= upper[i]` is the caller's responsibility and is not checked.
    pub fn validate_bounds_len(
        expected: usize,
        lower: &[f64],
        upper: &[f64],
    ) -> Result<(), CalibrationError> {
        if lower.len() != expected || upper.len() != expected {
            return Err(CalibrationError::BoundsLengthMismatch {
                expected,
                lower: lower.len(),
                upper: upper.len(),
            });
        }
        Ok(())
    }

    pub fn validate_image_size(size: &ImageSize) -> Result<(), CalibrationError> {
        if size.height == 0 || size.width == 0 {
            return Err(CalibrationError::InvalidParams(format!(
                "image size must be positive, got {}x{}",
                size.height, size.width
            )));
        }
        Ok(())
    }

    pub fn validate_finite(name: &str, values: &[f64]) -> Result<(), CalibrationError> {
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(CalibrationError::InvalidParams(format!(
                "{name}[{idx}] is not finite"
            )));
        }
        Ok(())
    }
}
