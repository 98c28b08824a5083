//! Calibration scenes and the per-scene resources the residuals share.
//!
//! Every scene is one capture of the rig: LiDAR edge points in the sensor frame
//! and the edge-density field of the matching camera image. Before any residual is
//! built, each scene is turned into a [`SceneResources`] holding its interpolator,
//! reference density and weight. Residual terms keep an `Arc` to those resources, so
//! the density grid is never copied and outlives every evaluation.

use std::sync::Arc;

use log::debug;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::camera::{validation, CalibrationError, ImageSize};
use crate::density::{BicubicInterpolator, DensityField};

/// Edge-point count a scene is normalised against.
pub const REFERENCE_POINT_COUNT: f64 = 30000.0;

/// How a scene's edge-point count turns into the per-point residual weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneWeighting {
    /// Weight `count / reference`: residuals scale with the scene's relative size.
    #[default]
    RelativeSize,
    /// Weight `reference / count`: larger scenes are down-weighted per point.
    InverseRelativeSize,
}

impl SceneWeighting {
    pub fn weight(self, point_count: usize, reference_count: f64) -> f64 {
        let relative = relative_size(point_count, reference_count);
        match self {
            SceneWeighting::RelativeSize => relative,
            SceneWeighting::InverseRelativeSize => 1.0 / relative,
        }
    }
}

/// `point_count / reference_count`
pub fn relative_size(point_count: usize, reference_count: f64) -> f64 {
    point_count as f64 / reference_count
}

/// One calibration capture.
#[derive(Debug, Clone)]
pub struct Scene {
    pub name: String,
    /// Edge points in the LiDAR frame.
    pub edge_points: Vec<Vector3<f64>>,
    pub density: Arc<DensityField>,
    /// Size of the original camera image.
    pub image_size: ImageSize,
}

impl Scene {
    pub fn new(
        name: impl Into<String>,
        edge_points: Vec<Vector3<f64>>,
        density: DensityField,
        image_size: ImageSize,
    ) -> Self {
        Self {
            name: name.into(),
            edge_points,
            density: Arc::new(density),
            image_size,
        }
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.edge_points.is_empty() {
            return Err(CalibrationError::EmptyScene(self.name.clone()));
        }
        validation::validate_image_size(&self.image_size)?;
        if let Some(idx) = self
            .edge_points
            .iter()
            .position(|p| !p.iter().all(|v| v.is_finite()))
        {
            return Err(CalibrationError::InvalidParams(format!(
                "scene '{}': edge point {idx} is not finite",
                self.name
            )));
        }
        Ok(())
    }
}

/// Read-only per-scene data every residual of that scene refers to.
#[derive(Debug)]
pub struct SceneResources {
    pub name: String,
    pub interpolator: BicubicInterpolator,
    /// `max(density) / (0.125 * bandwidth)`
    pub reference_value: f64,
    /// Per-point residual weight.
    pub weight: f64,
    pub image_size: ImageSize,
}

impl SceneResources {
    /// Validates `scene` and derives its shared resources.
    pub fn build(
        scene: &Scene,
        weighting: SceneWeighting,
        reference_count: f64,
    ) -> Result<Arc<Self>, CalibrationError> {
        scene.validate()?;
        if !(reference_count.is_finite() && reference_count > 0.0) {
            return Err(CalibrationError::InvalidParams(format!(
                "reference point count must be positive, got {reference_count}"
            )));
        }
        let reference_value = scene.density.reference_value();
        let weight = weighting.weight(scene.edge_points.len(), reference_count);
        debug!(
            "Scene '{}': {} edge points, reference value {:.6}, weight {:.6}",
            scene.name,
            scene.edge_points.len(),
            reference_value,
            weight
        );
        Ok(Arc::new(Self {
            name: scene.name.clone(),
            interpolator: BicubicInterpolator::new(Arc::clone(&scene.density)),
            reference_value,
            weight,
            image_size: scene.image_size,
        }))
    }
}
