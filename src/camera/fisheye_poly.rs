//! Angle-polynomial fisheye projection.
//!
//! A LiDAR point `P` is moved into the camera frame with
//! `P' = Rz(q2)·Ry(q1)·Rx(q0)·P + t`. Its incidence angle `theta` is mapped to an
//! image radius by the degree-five polynomial
//! `a0 + a1·theta + a2·theta² + a3·theta³ + a4·theta⁴ + a5·theta⁵`, the radius is laid
//! along the (negated) planar direction of `P'`, corrected with the inverse affine
//! distortion matrix and finally shifted by the principal point.
//!
//! Parameters are split into two blocks:
//!
//! * rotation: `[q0, q1, q2]`
//! * tail: `[tx, ty, tz, u0, v0, c0, c1, ...]` where the free polynomial coefficients
//!   `c*` are scattered into `a0..a5` according to [`PolynomialLayout`].
//!
//! All projection functions are generic over [`RealField`] so that the same code
//! runs on `f64` and on dual numbers during automatic differentiation. The planar
//! radius division is intentionally unguarded: points on the optical axis produce
//! NaN, which the solver treats as a rejected evaluation.

use nalgebra::{convert, ComplexField, Matrix2, Matrix3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::camera::CalibrationError;
use crate::geometry::{euler_rotation, incidence_angle, planar_radius, transform_point};

/// Length of the rotation block.
pub const ROTATION_DIM: usize = 3;
/// Translation and principal point lead the tail block.
pub const TAIL_FIXED_DIM: usize = 5;

/// Which of the six polynomial slots `a0..a5` are free parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolynomialLayout {
    /// Odd terms only: `[0, c0, 0, c1, 0, c2]`.
    Odd,
    /// Constant plus odd terms: `[c0, c1, 0, c2, 0, c3]`.
    #[default]
    Sparse,
    /// Terms up to fourth order: `[c0, c1, c2, c3, c4, 0]`.
    Dense,
}

impl PolynomialLayout {
    /// Number of free polynomial coefficients.
    pub fn num_coefficients(self) -> usize {
        match self {
            PolynomialLayout::Odd => 3,
            PolynomialLayout::Sparse => 4,
            PolynomialLayout::Dense => 5,
        }
    }

    /// Length of the tail block.
    pub fn tail_dim(self) -> usize {
        TAIL_FIXED_DIM + self.num_coefficients()
    }

    /// Length of the flattened parameter vector.
    pub fn num_params(self) -> usize {
        ROTATION_DIM + self.tail_dim()
    }

    /// Scatters the free coefficients into `a0..a5`, zero-filling unused slots.
    ///
    /// `coefficients` must hold exactly [`Self::num_coefficients`] values.
    pub fn expand<T: RealField>(self, coefficients: &[T]) -> [T; 6] {
        let c = |i: usize| coefficients[i].clone();
        match self {
            PolynomialLayout::Odd => [T::zero(), c(0), T::zero(), c(1), T::zero(), c(2)],
            PolynomialLayout::Sparse => [c(0), c(1), T::zero(), c(2), T::zero(), c(3)],
            PolynomialLayout::Dense => [c(0), c(1), c(2), c(3), c(4), T::zero()],
        }
    }
}

/// Evaluates `a0 + a1·x + ... + a5·x⁵` with Horner's scheme.
pub fn evaluate_polynomial<T: RealField>(coefficients: &[T; 6], x: T) -> T {
    coefficients
        .iter()
        .rev()
        .fold(T::zero(), |acc, a| acc * x.clone() + a.clone())
}

/// Soft constraint pinning the polynomial value at a reference incidence angle.
///
/// Keeps the polynomial from extrapolating without bound at large angles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolynomialAnchor {
    /// Reference incidence angle in degrees.
    pub theta_deg: f64,
    /// Expected image radius at `theta_deg`, in pixels.
    pub radius: f64,
    pub weight: f64,
}

impl Default for PolynomialAnchor {
    fn default() -> Self {
        Self {
            theta_deg: 99.5,
            radius: 1071.0,
            weight: 1e-8,
        }
    }
}

impl PolynomialAnchor {
    /// `weight * |radius - sum(a_i * theta_ref^i)|`
    pub fn penalty<T: RealField>(&self, coefficients: &[T; 6]) -> T {
        let theta = self.theta_deg.to_radians();
        let mut deviation: T = convert(self.radius);
        for (i, a) in coefficients.iter().enumerate() {
            deviation -= a.clone() * convert::<f64, T>(theta.powi(i as i32));
        }
        convert::<f64, T>(self.weight) * ComplexField::abs(deviation)
    }
}

/// Intermediate quantities of one projection.
#[derive(Debug, Clone)]
pub struct Projection<T: RealField> {
    /// Predicted pixel, `(row, col)` order of the density grid.
    pub pixel: Vector2<T>,
    /// Incidence angle of the transformed point.
    pub theta: T,
    /// Polynomial image radius at `theta`.
    pub radius: T,
    /// Expanded coefficients `a0..a5`.
    pub coefficients: [T; 6],
}

/// Projects a LiDAR point with the given rotation and tail blocks.
///
/// No guard is applied to the planar radius or the incidence angle.
pub fn project_generic<T: RealField>(
    rotation: &[T],
    tail: &[T],
    point: &Vector3<f64>,
    layout: PolynomialLayout,
    inv_distortion: &Matrix2<f64>,
) -> Projection<T> {
    let coefficients = layout.expand(&tail[TAIL_FIXED_DIM..]);
    let p_cam = transform_point(rotation, &tail[0..3], point);

    let theta = incidence_angle(&p_cam);
    let radius = evaluate_polynomial(&coefficients, theta.clone());

    let r = planar_radius(&p_cam);
    let undistorted = Vector2::new(
        -radius.clone() * p_cam.x.clone() / r.clone(),
        -radius.clone() * p_cam.y.clone() / r,
    );
    let principal = Vector2::new(tail[3].clone(), tail[4].clone());
    let pixel = inv_distortion.map(convert::<f64, T>) * undistorted + principal;

    Projection {
        pixel,
        theta,
        radius,
        coefficients,
    }
}

/// The fisheye model evaluated at fixed `f64` parameters.
///
/// Used to reproject edge points once the optimizer has finished.
#[derive(Debug, Clone, PartialEq)]
pub struct FisheyePolyModel {
    pub layout: PolynomialLayout,
    rotation: [f64; ROTATION_DIM],
    tail: Vec<f64>,
    inv_distortion: Matrix2<f64>,
}

impl FisheyePolyModel {
    /// Creates a model from a flattened parameter vector and the forward distortion matrix.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InvalidParams`] if `params` does not match `layout`
    /// * [`CalibrationError::SingularDistortion`] if `distortion` has no inverse
    pub fn new(
        layout: PolynomialLayout,
        params: &[f64],
        distortion: &Matrix2<f64>,
    ) -> Result<Self, CalibrationError> {
        if params.len() != layout.num_params() {
            return Err(CalibrationError::InvalidParams(format!(
                "{:?} layout expects {} parameters, got {}",
                layout,
                layout.num_params(),
                params.len()
            )));
        }
        let inv_distortion = distortion
            .try_inverse()
            .ok_or(CalibrationError::SingularDistortion)?;
        Ok(Self {
            layout,
            rotation: [params[0], params[1], params[2]],
            tail: params[ROTATION_DIM..].to_vec(),
            inv_distortion,
        })
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        euler_rotation(&self.rotation).into_inner()
    }

    pub fn translation(&self) -> Vector3<f64> {
        Vector3::new(self.tail[0], self.tail[1], self.tail[2])
    }

    pub fn principal_point(&self) -> Vector2<f64> {
        Vector2::new(self.tail[3], self.tail[4])
    }

    /// Expanded polynomial coefficients `a0..a5`.
    pub fn coefficients(&self) -> [f64; 6] {
        self.layout.expand(&self.tail[TAIL_FIXED_DIM..])
    }

    /// Moves a LiDAR point into the camera frame.
    pub fn transform(&self, point: &Vector3<f64>) -> Vector3<f64> {
        transform_point(&self.rotation, &self.tail[0..3], point)
    }

    /// Projects a LiDAR point to `(row, col)` pixel coordinates.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::PointOnOpticalAxis`] when the transformed point has zero
    /// planar radius.
    pub fn project(&self, point: &Vector3<f64>) -> Result<Vector2<f64>, CalibrationError> {
        if planar_radius(&self.transform(point)) <= 0.0 {
            return Err(CalibrationError::PointOnOpticalAxis);
        }
        Ok(self.project_unchecked(point).pixel)
    }

    /// Projection without the optical-axis check, exactly as the residual sees it.
    pub fn project_unchecked(&self, point: &Vector3<f64>) -> Projection<f64> {
        project_generic(
            &self.rotation,
            &self.tail,
            point,
            self.layout,
            &self.inv_distortion,
        )
    }

    /// Projects every point, skipping those on the optical axis.
    pub fn project_points(&self, points: &[Vector3<f64>]) -> Vec<Vector2<f64>> {
        points.iter().filter_map(|p| self.project(p).ok()).collect()
    }
}
