//! Edge-density fields and the bicubic surface the residuals sample.
//!
//! A [`DensityField`] is the smoothed 2D histogram of camera edge pixels, produced
//! upstream by kernel density estimation with a known bandwidth. It is stored
//! row-major and never changes once built. A [`BicubicInterpolator`] wraps a
//! shared handle to the field and evaluates a Catmull-Rom surface over it at real
//! coordinates.

use std::sync::Arc;

use nalgebra::{convert, RealField};

use crate::camera::CalibrationError;

/// Row-major grid of non-negative edge densities.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityField {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
    bandwidth: f64,
}

impl DensityField {
    /// Wraps a row-major density grid.
    ///
    /// # Arguments
    ///
    /// * `rows` - Number of grid rows
    /// * `cols` - Number of grid columns
    /// * `data` - `rows * cols` non-negative values, row-major
    /// * `bandwidth` - Kernel bandwidth the grid was estimated with
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InvalidDensityField`] if the grid is empty, its size does not
    /// match `data`, a value is negative or not finite, or the bandwidth is not positive.
    pub fn new(
        rows: usize,
        cols: usize,
        data: Vec<f64>,
        bandwidth: f64,
    ) -> Result<Self, CalibrationError> {
        if rows == 0 || cols == 0 {
            return Err(CalibrationError::InvalidDensityField(format!(
                "grid must be non-empty, got {rows}x{cols}"
            )));
        }
        if data.len() != rows * cols {
            return Err(CalibrationError::InvalidDensityField(format!(
                "expected {} values for a {rows}x{cols} grid, got {}",
                rows * cols,
                data.len()
            )));
        }
        if !(bandwidth.is_finite() && bandwidth > 0.0) {
            return Err(CalibrationError::InvalidDensityField(format!(
                "bandwidth must be positive, got {bandwidth}"
            )));
        }
        if let Some(idx) = data.iter().position(|v| !v.is_finite() || *v < 0.0) {
            return Err(CalibrationError::InvalidDensityField(format!(
                "value at row {}, col {} is {}",
                idx / cols,
                idx % cols,
                data[idx]
            )));
        }
        Ok(Self {
            rows,
            cols,
            data,
            bandwidth,
        })
    }

    /// Builds a grid by evaluating `f(row, col)` at every node.
    pub fn from_fn<F>(
        rows: usize,
        cols: usize,
        bandwidth: f64,
        f: F,
    ) -> Result<Self, CalibrationError>
    where
        F: Fn(usize, usize) -> f64,
    {
        let data = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .map(|(r, c)| f(r, c))
            .collect();
        Self::new(rows, cols, data, bandwidth)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Grid value with both indices clamped into range.
    pub fn value(&self, row: isize, col: isize) -> f64 {
        let r = row.clamp(0, self.rows as isize - 1) as usize;
        let c = col.clamp(0, self.cols as isize - 1) as usize;
        self.data[r * self.cols + c]
    }

    pub fn max_value(&self) -> f64 {
        self.data.iter().copied().fold(0.0, f64::max)
    }

    /// Density level the residual compares projections against,
    /// `max / (0.125 * bandwidth)`.
    pub fn reference_value(&self) -> f64 {
        self.max_value() / (0.125 * self.bandwidth)
    }
}

/// Catmull-Rom bicubic surface over a shared [`DensityField`].
///
/// Queries outside the grid read clamped edge samples, so the surface flattens out
/// beyond the border instead of failing.
#[derive(Debug, Clone)]
pub struct BicubicInterpolator {
    field: Arc<DensityField>,
}

impl BicubicInterpolator {
    pub fn new(field: Arc<DensityField>) -> Self {
        Self { field }
    }

    pub fn field(&self) -> &DensityField {
        &self.field
    }

    /// Evaluates the surface at a real `(row, col)` coordinate.
    ///
    /// Generic over the scalar so that derivatives flow through when `T` is a dual
    /// number. NaN coordinates give NaN.
    pub fn evaluate<T: RealField>(&self, row: T, col: T) -> T {
        let field = &*self.field;
        let r0 = cell_index(&row, field.rows);
        let c0 = cell_index(&col, field.cols);
        let tr = row - convert::<f64, T>(r0 as f64);
        let tc = col - convert::<f64, T>(c0 as f64);

        let row_values: [T; 4] = std::array::from_fn(|i| {
            let r = r0 + i as isize - 1;
            let samples: [T; 4] =
                std::array::from_fn(|j| convert(field.value(r, c0 + j as isize - 1)));
            catmull_rom(samples, tc.clone())
        });
        catmull_rom(row_values, tr)
    }
}

/// Largest integer `k` with `k <= x`, restricted to `[-2, len + 1]`.
///
/// Outside that range every sample of the 4x4 stencil is clamped to the border,
/// so restricting the cell does not change the surface.
fn cell_index<T: RealField>(x: &T, len: usize) -> isize {
    let at = |k: isize| convert::<f64, T>(k as f64);
    let mut lo: isize = -2;
    let mut hi: isize = len as isize + 1;
    if at(hi) <= *x {
        return hi;
    }
    if !(at(lo) <= *x) {
        return lo;
    }
    // Invariant: at(lo) <= x < at(hi)
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if at(mid) <= *x {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Cubic Hermite spline through `p[1]` and `p[2]` with Catmull-Rom tangents,
/// evaluated at `x` in `[0, 1)`.
fn catmull_rom<T: RealField>(p: [T; 4], x: T) -> T {
    let [p0, p1, p2, p3] = p;
    let half: T = convert(0.5);
    let a = half.clone()
        * (-p0.clone() + convert::<f64, T>(3.0) * p1.clone() - convert::<f64, T>(3.0) * p2.clone()
            + p3.clone());
    let b = half.clone()
        * (convert::<f64, T>(2.0) * p0.clone() - convert::<f64, T>(5.0) * p1.clone()
            + convert::<f64, T>(4.0) * p2.clone()
            - p3);
    let c = half * (p2 - p0);
    p1 + x.clone() * (c + x.clone() * (b + x * a))
}
