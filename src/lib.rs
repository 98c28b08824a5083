//! LiDAR Fisheye Calibration Library
//!
//! Joint calibration of the extrinsic pose between a LiDAR and a fisheye camera
//! together with the camera's angle-polynomial intrinsics. Edge points extracted
//! from LiDAR scans are projected into the image and pulled towards high values of
//! the camera's edge-density field. Several scenes are solved jointly over one
//! shared parameter vector.
//!
//! The crate provides:
//! - the angle-polynomial fisheye projection model
//! - edge-density fields with a differentiable bicubic surface
//! - the multi-scene problem and two bounded robust solvers, a native
//!   trust-region Levenberg-Marquardt and the tiny-solver framework
//! - YAML configuration, JSON results and CSV reprojection exports

pub mod camera;
pub mod config;
pub mod density;
pub mod geometry;
pub mod optimization;
pub mod scene;
pub mod util;

// Re-export commonly used types
pub use camera::{CalibrationError, FisheyePolyModel, ImageSize, PolynomialAnchor, PolynomialLayout};
pub use config::{CalibrationConfig, ParameterSet};
pub use density::{BicubicInterpolator, DensityField};
pub use optimization::{
    calibrate, CalibrationResult, CalibrationSolver, MultiSceneProblem, SolverBackend,
    SolverOptions, SolverSummary, TerminationReason,
};
pub use scene::{Scene, SceneWeighting};
