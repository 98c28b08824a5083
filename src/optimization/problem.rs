//! Assembly of the joint multi-scene problem.
//!
//! Every edge point of every scene becomes one [`EdgeAlignmentCost`], registered in
//! scene order and then point order. All terms share the same rotation and tail
//! parameter blocks. Bounds are given over the flattened parameter vector and
//! mapped onto the blocks with [`block_index`].

use std::sync::Arc;

use log::debug;
use nalgebra::Matrix2;
use rayon::prelude::*;

use crate::camera::{validation, CalibrationError, PolynomialAnchor, PolynomialLayout, ROTATION_DIM};
use crate::config::CalibrationConfig;
use crate::optimization::loss::RobustLoss;
use crate::optimization::residual::{EdgeAlignmentCost, ResidualModel};
use crate::scene::{Scene, SceneResources, SceneWeighting, REFERENCE_POINT_COUNT};

/// Number of residual terms evaluated by one parallel task.
///
/// Partial sums are combined in chunk order, so the result does not depend on the
/// number of worker threads.
pub const EVALUATION_CHUNK: usize = 256;

/// Name of the rotation block in block-structured backends.
pub const ROTATION_BLOCK: &str = "rotation";
/// Name of the tail block in block-structured backends.
pub const TAIL_BLOCK: &str = "tail";

/// Location of a flattened parameter inside the two blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockIndex {
    Rotation(usize),
    Tail(usize),
}

impl BlockIndex {
    pub fn block_name(self) -> &'static str {
        match self {
            BlockIndex::Rotation(_) => ROTATION_BLOCK,
            BlockIndex::Tail(_) => TAIL_BLOCK,
        }
    }

    pub fn offset(self) -> usize {
        match self {
            BlockIndex::Rotation(i) | BlockIndex::Tail(i) => i,
        }
    }
}

/// Maps flattened index `i` to the rotation block when `i < 3`, else to tail index `i - 3`.
pub fn block_index(i: usize) -> BlockIndex {
    if i < ROTATION_DIM {
        BlockIndex::Rotation(i)
    } else {
        BlockIndex::Tail(i - ROTATION_DIM)
    }
}

/// Box constraints over the flattened parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Bounds {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Self {
        Self { lower, upper }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    /// A parameter whose bounds coincide is held constant.
    pub fn is_fixed(&self, i: usize) -> bool {
        self.lower[i] == self.upper[i]
    }

    /// Projects `value` onto `[lower[i], upper[i]]`.
    pub fn project(&self, i: usize, value: f64) -> f64 {
        value.max(self.lower[i]).min(self.upper[i])
    }

    /// Checks that every value lies inside its bounds.
    pub fn check_feasible(&self, names: &[String], values: &[f64]) -> Result<(), CalibrationError> {
        for (i, &value) in values.iter().enumerate() {
            let (lower, upper) = (self.lower[i], self.upper[i]);
            if !(lower <= value && value <= upper) {
                return Err(CalibrationError::InfeasibleInitialValue {
                    name: names.get(i).cloned().unwrap_or_else(|| format!("p{i}")),
                    value,
                    lower,
                    upper,
                });
            }
        }
        Ok(())
    }
}

/// Incrementally collects scenes into a [`MultiSceneProblem`].
#[derive(Debug)]
pub struct ProblemBuilder {
    model: Arc<ResidualModel>,
    weighting: SceneWeighting,
    reference_count: f64,
    scenes: Vec<Arc<SceneResources>>,
    terms: Vec<EdgeAlignmentCost>,
}

impl ProblemBuilder {
    /// Starts a problem for the given layout. The distortion matrix is inverted here, once.
    pub fn new(
        layout: PolynomialLayout,
        distortion: &Matrix2<f64>,
        anchor: PolynomialAnchor,
    ) -> Result<Self, CalibrationError> {
        Ok(Self {
            model: Arc::new(ResidualModel::new(layout, distortion, anchor)?),
            weighting: SceneWeighting::default(),
            reference_count: REFERENCE_POINT_COUNT,
            scenes: Vec::new(),
            terms: Vec::new(),
        })
    }

    pub fn with_weighting(mut self, weighting: SceneWeighting, reference_count: f64) -> Self {
        self.weighting = weighting;
        self.reference_count = reference_count;
        self
    }

    /// Builds the scene's shared resources and registers one term per edge point.
    pub fn add_scene(&mut self, scene: &Scene) -> Result<&mut Self, CalibrationError> {
        let resources = SceneResources::build(scene, self.weighting, self.reference_count)?;
        self.terms.extend(scene.edge_points.iter().map(|point| {
            EdgeAlignmentCost::new(*point, Arc::clone(&resources), Arc::clone(&self.model))
        }));
        debug!(
            "Registered {} residual terms for scene '{}'",
            scene.edge_points.len(),
            scene.name
        );
        self.scenes.push(resources);
        Ok(self)
    }

    /// Finishes assembly.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::NoScenes`] if no scene was added
    /// * [`CalibrationError::BoundsLengthMismatch`] if the bounds do not match the layout
    pub fn build(self, bounds: Bounds) -> Result<MultiSceneProblem, CalibrationError> {
        if self.scenes.is_empty() {
            return Err(CalibrationError::NoScenes);
        }
        validation::validate_bounds_len(self.model.layout.num_params(), &bounds.lower, &bounds.upper)?;
        Ok(MultiSceneProblem {
            model: self.model,
            scenes: self.scenes,
            terms: self.terms,
            bounds,
        })
    }
}

/// All residual terms of a calibration run over one shared parameter vector.
#[derive(Debug, Clone)]
pub struct MultiSceneProblem {
    model: Arc<ResidualModel>,
    scenes: Vec<Arc<SceneResources>>,
    terms: Vec<EdgeAlignmentCost>,
    bounds: Bounds,
}

impl MultiSceneProblem {
    /// Validates `config`, then builds every scene and its residual terms.
    pub fn from_config(
        config: &CalibrationConfig,
        scenes: &[Scene],
    ) -> Result<Self, CalibrationError> {
        config.validate()?;
        if scenes.is_empty() {
            return Err(CalibrationError::NoScenes);
        }
        let mut builder =
            ProblemBuilder::new(config.polynomial, &config.distortion_matrix(), config.anchor)?
                .with_weighting(config.weighting, config.reference_point_count);
        for scene in scenes {
            builder.add_scene(scene)?;
        }
        let problem = builder.build(config.bounds())?;
        debug!(
            "Assembled problem: {} scenes, {} residual terms, {} parameters",
            problem.num_scenes(),
            problem.num_residual_terms(),
            problem.num_params()
        );
        Ok(problem)
    }

    pub fn layout(&self) -> PolynomialLayout {
        self.model.layout
    }

    pub fn model(&self) -> &ResidualModel {
        &self.model
    }

    pub fn scenes(&self) -> &[Arc<SceneResources>] {
        &self.scenes
    }

    pub fn terms(&self) -> &[EdgeAlignmentCost] {
        &self.terms
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn num_scenes(&self) -> usize {
        self.scenes.len()
    }

    pub fn num_params(&self) -> usize {
        self.model.layout.num_params()
    }

    pub fn num_residual_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn num_residuals(&self) -> usize {
        self.terms.len() * EdgeAlignmentCost::RESIDUAL_DIM
    }

    /// `0.5 * sum(rho(|r_i|^2))` at `params`. Non-finite residuals give a non-finite cost.
    pub fn cost(&self, params: &[f64], loss: RobustLoss) -> f64 {
        let partials: Vec<f64> = self
            .terms
            .par_chunks(EVALUATION_CHUNK)
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|term| loss.rho(term.evaluate(params).norm_squared()))
                    .sum::<f64>()
            })
            .collect();
        0.5 * partials.iter().sum::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::ImageSize;
    use crate::density::DensityField;
    use nalgebra::Vector3;

    fn scene(name: &str, points: usize) -> Scene {
        let density = DensityField::new(8, 8, vec![1.0; 64], 1.0).unwrap();
        let edge_points = (0..points)
            .map(|i| Vector3::new(0.1 + i as f64 * 0.01, 0.2, 1.0))
            .collect();
        Scene::new(name, edge_points, density, ImageSize::new(8, 8))
    }

    fn open_bounds(n: usize) -> Bounds {
        Bounds::new(vec![f64::NEG_INFINITY; n], vec![f64::INFINITY; n])
    }

    fn builder() -> ProblemBuilder {
        ProblemBuilder::new(
            PolynomialLayout::Sparse,
            &Matrix2::identity(),
            PolynomialAnchor::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_block_index_mapping() {
        assert_eq!(block_index(0), BlockIndex::Rotation(0));
        assert_eq!(block_index(2), BlockIndex::Rotation(2));
        assert_eq!(block_index(3), BlockIndex::Tail(0));
        assert_eq!(block_index(11), BlockIndex::Tail(8));
        assert_eq!(block_index(5).block_name(), TAIL_BLOCK);
        assert_eq!(block_index(1).block_name(), ROTATION_BLOCK);
    }

    #[test]
    fn test_terms_follow_scene_then_point_order() {
        let mut b = builder();
        b.add_scene(&scene("a", 3)).unwrap();
        b.add_scene(&scene("b", 2)).unwrap();
        let problem = b.build(open_bounds(12)).unwrap();

        assert_eq!(problem.num_scenes(), 2);
        assert_eq!(problem.num_residual_terms(), 5);
        assert_eq!(problem.num_residuals(), 10);
        let names: Vec<&str> = problem.terms().iter().map(|t| t.scene().name.as_str()).collect();
        assert_eq!(names, ["a", "a", "a", "b", "b"]);
        assert!(problem.terms()[1].point().x > problem.terms()[0].point().x);
    }

    #[test]
    fn test_no_scenes_is_rejected() {
        assert!(matches!(
            builder().build(open_bounds(12)),
            Err(CalibrationError::NoScenes)
        ));
    }

    #[test]
    fn test_bounds_length_fails_fast() {
        let mut b = builder();
        b.add_scene(&scene("a", 1)).unwrap();
        assert!(matches!(
            b.build(open_bounds(11)),
            Err(CalibrationError::BoundsLengthMismatch { expected: 12, .. })
        ));
    }

    #[test]
    fn test_singular_distortion_is_rejected() {
        assert!(matches!(
            ProblemBuilder::new(
                PolynomialLayout::Sparse,
                &Matrix2::new(1.0, 2.0, 2.0, 4.0),
                PolynomialAnchor::default()
            ),
            Err(CalibrationError::SingularDistortion)
        ));
    }

    #[test]
    fn test_bounds_helpers() {
        let bounds = Bounds::new(vec![0.0, 1.0], vec![2.0, 1.0]);
        assert!(!bounds.is_fixed(0));
        assert!(bounds.is_fixed(1));
        assert_eq!(bounds.project(0, 5.0), 2.0);
        assert_eq!(bounds.project(0, -1.0), 0.0);

        let names = vec!["a".to_string(), "b".to_string()];
        assert!(bounds.check_feasible(&names, &[1.0, 1.0]).is_ok());
        match bounds.check_feasible(&names, &[3.0, 1.0]) {
            Err(CalibrationError::InfeasibleInitialValue { name, value, .. }) => {
                assert_eq!(name, "a");
                assert_eq!(value, 3.0);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_cost_is_independent_of_thread_count() {
        let mut b = builder();
        b.add_scene(&scene("a", 700)).unwrap();
        let problem = b.build(open_bounds(12)).unwrap();
        let params = [
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 4.0, 4.0, 0.0, 3.0, 0.0, 0.0,
        ];
        let loss = RobustLoss::default();
        let single = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap()
            .install(|| problem.cost(&params, loss));
        let many = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap()
            .install(|| problem.cost(&params, loss));
        assert!(single.is_finite());
        assert_eq!(single.to_bits(), many.to_bits());
    }
}
