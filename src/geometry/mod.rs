use nalgebra::{convert, RealField, Rotation3, Vector3};

/// Builds `Rz(angles[2]) * Ry(angles[1]) * Rx(angles[0])`.
///
/// # Arguments
///
/// * `angles` - At least three rotation angles in radians, x first
///
/// # Returns
///
/// The composed rotation
pub fn euler_rotation<T: RealField>(angles: &[T]) -> Rotation3<T> {
    Rotation3::from_euler_angles(angles[0].clone(), angles[1].clone(), angles[2].clone())
}

/// Lifts a LiDAR point into the scalar type used by the caller.
pub fn lift_point<T: RealField>(point: &Vector3<f64>) -> Vector3<T> {
    Vector3::new(convert(point.x), convert(point.y), convert(point.z))
}

/// Applies `R * point + t` with `R` from [`euler_rotation`].
pub fn transform_point<T: RealField>(
    angles: &[T],
    translation: &[T],
    point: &Vector3<f64>,
) -> Vector3<T> {
    let t = Vector3::new(
        translation[0].clone(),
        translation[1].clone(),
        translation[2].clone(),
    );
    euler_rotation(angles) * lift_point::<T>(point) + t
}

/// Angle between `point` and the optical axis `+z`, in `[0, pi]`.
///
/// The zero vector yields NaN.
pub fn incidence_angle<T: RealField>(point: &Vector3<T>) -> T {
    (point.z.clone() / point.norm()).acos()
}

/// Distance of `point` from the optical axis.
pub fn planar_radius<T: RealField>(point: &Vector3<T>) -> T {
    (point.x.clone() * point.x.clone() + point.y.clone() * point.y.clone()).sqrt()
}
