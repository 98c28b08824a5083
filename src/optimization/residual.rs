//! Edge-alignment residual for a single LiDAR edge point.
//!
//! The point is projected with the current parameters, the scene's edge-density
//! surface is sampled at the predicted pixel and the sample is compared against the
//! scene's reference density, lowered by a radial falloff term. A tiny penalty
//! keeps the projection polynomial close to a known radius at a wide incidence angle.
//!
//! The same generic code serves three callers: plain `f64` evaluation, the
//! `num-dual` Jacobian used by the trust-region solver and `tiny_solver`'s own
//! automatic differentiation through [`Factor`].

use std::sync::Arc;

use nalgebra::{convert, DMatrix, DVector, Matrix2, RealField, SVector, Vector2, Vector3};
use num_dual::{jacobian, DualDVec64, DualSVec64};
use tiny_solver::factors::Factor;

use crate::camera::fisheye_poly::project_generic;
use crate::camera::{CalibrationError, PolynomialAnchor, PolynomialLayout, ROTATION_DIM};
use crate::scene::SceneResources;

/// Model constants shared by every residual of a problem.
#[derive(Debug, Clone)]
pub struct ResidualModel {
    pub layout: PolynomialLayout,
    /// Inverse of the affine distortion matrix, computed once.
    pub inv_distortion: Matrix2<f64>,
    pub anchor: PolynomialAnchor,
}

impl ResidualModel {
    /// # Errors
    ///
    /// [`CalibrationError::SingularDistortion`] if `distortion` cannot be inverted.
    pub fn new(
        layout: PolynomialLayout,
        distortion: &Matrix2<f64>,
        anchor: PolynomialAnchor,
    ) -> Result<Self, CalibrationError> {
        let inv_distortion = distortion
            .try_inverse()
            .ok_or(CalibrationError::SingularDistortion)?;
        Ok(Self {
            layout,
            inv_distortion,
            anchor,
        })
    }
}

/// Residual of one edge point against its scene's density field.
///
/// Both output components carry the same value.
#[derive(Debug, Clone)]
pub struct EdgeAlignmentCost {
    point: Vector3<f64>,
    scene: Arc<SceneResources>,
    model: Arc<ResidualModel>,
}

impl EdgeAlignmentCost {
    pub const RESIDUAL_DIM: usize = 2;

    pub fn new(point: Vector3<f64>, scene: Arc<SceneResources>, model: Arc<ResidualModel>) -> Self {
        Self {
            point,
            scene,
            model,
        }
    }

    pub fn point(&self) -> &Vector3<f64> {
        &self.point
    }

    pub fn scene(&self) -> &SceneResources {
        &self.scene
    }

    /// Evaluates the weighted residual for the given parameter blocks.
    pub fn residual<T: RealField>(&self, rotation: &[T], tail: &[T]) -> Vector2<T> {
        let projection = project_generic(
            rotation,
            tail,
            &self.point,
            self.model.layout,
            &self.model.inv_distortion,
        );
        let sampled = self
            .scene
            .interpolator
            .evaluate(projection.pixel[0].clone(), projection.pixel[1].clone());

        let reference: T = convert(self.scene.reference_value);
        let height: T = convert(f64::from(self.scene.image_size.height));
        let falloff = T::one() - projection.radius * convert::<f64, T>(0.5) / height;
        let penalty = self.model.anchor.penalty(&projection.coefficients);

        let value = convert::<f64, T>(self.scene.weight) * (reference * falloff - sampled + penalty);
        Vector2::new(value.clone(), value)
    }

    /// Residual at a flattened parameter vector.
    pub fn evaluate(&self, params: &[f64]) -> Vector2<f64> {
        let (rotation, tail) = params.split_at(ROTATION_DIM);
        self.residual(rotation, tail)
    }

    /// Residual and its `2 x N` Jacobian with respect to the flattened parameters.
    ///
    /// The three layout sizes differentiate with stack-allocated dual numbers.
    pub fn linearize(&self, params: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
        match params.len() {
            11 => self.linearize_fixed::<11>(params),
            12 => self.linearize_fixed::<12>(params),
            13 => self.linearize_fixed::<13>(params),
            _ => self.linearize_dynamic(params),
        }
    }

    fn linearize_fixed<const N: usize>(
        &self,
        params: &DVector<f64>,
    ) -> (DVector<f64>, DMatrix<f64>) {
        let x = SVector::<f64, N>::from_column_slice(params.as_slice());
        let (r, j) = jacobian(
            |x: SVector<DualSVec64<N>, N>| {
                let (rotation, tail) = x.as_slice().split_at(ROTATION_DIM);
                self.residual(rotation, tail)
            },
            x,
        );
        (
            DVector::from_column_slice(r.as_slice()),
            DMatrix::from_column_slice(Self::RESIDUAL_DIM, N, j.as_slice()),
        )
    }

    fn linearize_dynamic(&self, params: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
        jacobian(
            |x: DVector<DualDVec64>| {
                let (rotation, tail) = x.as_slice().split_at(ROTATION_DIM);
                let r = self.residual(rotation, tail);
                DVector::from_column_slice(r.as_slice())
            },
            params.clone(),
        )
    }
}

impl<T: RealField> Factor<T> for EdgeAlignmentCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let r = self.residual(params[0].as_slice(), params[1].as_slice());
        DVector::from_column_slice(r.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::ImageSize;
    use crate::density::DensityField;
    use crate::scene::{Scene, SceneWeighting, REFERENCE_POINT_COUNT};
    use approx::assert_relative_eq;

    fn gaussian_field() -> DensityField {
        DensityField::from_fn(101, 101, 1.0, |r, c| {
            let dr = r as f64 - 50.0;
            let dc = c as f64 - 50.0;
            (-(dr * dr + dc * dc) / 50.0).exp()
        })
        .unwrap()
    }

    fn cost_for(point: Vector3<f64>, point_count: usize) -> EdgeAlignmentCost {
        weighted_cost_for(point, point_count, SceneWeighting::default())
    }

    fn weighted_cost_for(
        point: Vector3<f64>,
        point_count: usize,
        weighting: SceneWeighting,
    ) -> EdgeAlignmentCost {
        let scene = Scene::new(
            "bump",
            vec![point; point_count],
            gaussian_field(),
            ImageSize::new(100, 100),
        );
        let resources =
            SceneResources::build(&scene, weighting, REFERENCE_POINT_COUNT).unwrap();
        let model = ResidualModel::new(
            PolynomialLayout::Odd,
            &Matrix2::identity(),
            PolynomialAnchor::default(),
        )
        .unwrap();
        EdgeAlignmentCost::new(point, resources, Arc::new(model))
    }

    fn params(u0: f64, v0: f64) -> Vec<f64> {
        vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, u0, v0, 10.0, 0.0, 0.0]
    }

    #[test]
    fn test_components_are_identical() {
        let cost = cost_for(Vector3::new(0.1, 0.1, 1.0), 30000);
        let r = cost.evaluate(&params(50.0, 50.0));
        assert_eq!(r.x, r.y);
        assert!(r.x.is_finite());
    }

    #[test]
    fn test_residual_is_smallest_on_the_peak() {
        let cost = cost_for(Vector3::new(0.1, 0.1, 1.0), 30000);
        // The point lands about one pixel above-left of the principal point.
        let on_peak = cost.evaluate(&params(51.0, 51.0)).x;
        let off_peak = cost.evaluate(&params(45.0, 47.0)).x;
        assert!(on_peak < off_peak);
    }

    #[test]
    fn test_residual_matches_closed_form() {
        let point = Vector3::new(0.1, 0.1, 1.0);
        let cost = cost_for(point, 30000);
        let p = params(50.0, 50.0);
        let r = cost.evaluate(&p).x;

        let field = gaussian_field();
        let projection = FisheyeCheck::project(&p, &point);
        let sampled = cost.scene().interpolator.evaluate(projection.0, projection.1);
        let reference = field.reference_value();
        let theta = (0.1f64.hypot(0.1)).atan2(1.0);
        let radius = 10.0 * theta;
        let anchor = PolynomialAnchor::default();
        let penalty = anchor.weight * (anchor.radius - 10.0 * anchor.theta_deg.to_radians()).abs();
        let expected = reference * (1.0 - radius * 0.5 / 100.0) - sampled + penalty;
        assert_relative_eq!(r, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_double_count_doubles_the_residual() {
        let point = Vector3::new(0.1, 0.1, 1.0);
        let reference = cost_for(point, 30000).evaluate(&params(50.0, 50.0)).x;
        let doubled = cost_for(point, 60000).evaluate(&params(50.0, 50.0)).x;
        assert_relative_eq!(doubled, 2.0 * reference, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_weighting_halves_the_residual_for_double_count() {
        let point = Vector3::new(0.1, 0.1, 1.0);
        let inverse = SceneWeighting::InverseRelativeSize;
        let reference = weighted_cost_for(point, 30000, inverse)
            .evaluate(&params(50.0, 50.0))
            .x;
        let doubled = weighted_cost_for(point, 60000, inverse)
            .evaluate(&params(50.0, 50.0))
            .x;
        assert_relative_eq!(doubled, 0.5 * reference, epsilon = 1e-12);
    }

    #[test]
    fn test_on_axis_point_is_not_finite() {
        let cost = cost_for(Vector3::new(0.0, 0.0, 1.0), 10);
        let r = cost.evaluate(&params(50.0, 50.0));
        assert!(!r.x.is_finite());
    }

    #[test]
    fn test_jacobian_matches_finite_differences() {
        let cost = cost_for(Vector3::new(0.1, -0.05, 1.0), 30000);
        let p = DVector::from_vec(vec![
            0.01, -0.02, 0.03, 0.001, -0.002, 0.01, 48.3, 51.7, 10.0, 0.5, -0.1,
        ]);
        let (r, j) = cost.linearize(&p);
        assert_eq!(r.len(), 2);
        assert_eq!(j.shape(), (2, 11));
        assert_relative_eq!(r[0], cost.evaluate(p.as_slice()).x, epsilon = 1e-12);

        let h = 1e-6;
        for k in 0..p.len() {
            let mut plus = p.clone();
            let mut minus = p.clone();
            plus[k] += h;
            minus[k] -= h;
            let fd = (cost.evaluate(plus.as_slice()).x - cost.evaluate(minus.as_slice()).x)
                / (2.0 * h);
            assert_relative_eq!(j[(0, k)], fd, epsilon = 1e-5, max_relative = 1e-4);
            assert_eq!(j[(0, k)], j[(1, k)]);
        }
    }

    #[test]
    fn test_fixed_size_jacobian_matches_dynamic() {
        let point = Vector3::new(-0.15, 0.08, 1.0);
        for (layout, tail) in [
            (PolynomialLayout::Odd, vec![10.0, 0.3, -0.01]),
            (PolynomialLayout::Sparse, vec![0.2, 10.0, 0.3, -0.01]),
            (PolynomialLayout::Dense, vec![0.2, 10.0, 0.05, 0.3, -0.02]),
        ] {
            let scene = Scene::new(
                "bump",
                vec![point; 30000],
                gaussian_field(),
                ImageSize::new(100, 100),
            );
            let resources =
                SceneResources::build(&scene, SceneWeighting::default(), REFERENCE_POINT_COUNT)
                    .unwrap();
            let model =
                ResidualModel::new(layout, &Matrix2::identity(), PolynomialAnchor::default())
                    .unwrap();
            let cost = EdgeAlignmentCost::new(point, resources, Arc::new(model));

            let mut p = vec![0.01, -0.02, 0.03, 0.001, -0.002, 0.01, 48.3, 51.7];
            p.extend(tail);
            let p = DVector::from_vec(p);
            assert_eq!(p.len(), layout.num_params());

            let (r_fixed, j_fixed) = cost.linearize(&p);
            let (r_dynamic, j_dynamic) = cost.linearize_dynamic(&p);
            assert_eq!(j_fixed.shape(), (2, layout.num_params()));
            assert_relative_eq!(r_fixed, r_dynamic, epsilon = 1e-12);
            assert_relative_eq!(j_fixed, j_dynamic, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_factor_matches_direct_evaluation() {
        let cost = cost_for(Vector3::new(0.2, 0.1, 1.0), 30000);
        let p = params(49.0, 52.0);
        let blocks = [
            DVector::from_column_slice(&p[..3]),
            DVector::from_column_slice(&p[3..]),
        ];
        let r = cost.residual_func(&blocks);
        assert_eq!(r.len(), EdgeAlignmentCost::RESIDUAL_DIM);
        assert_eq!(r[0], cost.evaluate(&p).x);
    }

    struct FisheyeCheck;

    impl FisheyeCheck {
        /// Hand projection for an identity pose and `r(theta) = 10 * theta`.
        fn project(p: &[f64], point: &Vector3<f64>) -> (f64, f64) {
            let theta = point.x.hypot(point.y).atan2(point.z);
            let radius = 10.0 * theta;
            let planar = point.x.hypot(point.y);
            (
                -radius * point.x / planar + p[6],
                -radius * point.y / planar + p[7],
            )
        }
    }
}
