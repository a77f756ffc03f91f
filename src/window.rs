//! Bead windows
//!
//! A [Window] is the sub-volume around a bead center, corrected for the
//! background level and normalized to a unit maximum.

use nalgebra::Vector3;
use ndarray::{s, Array3};

use crate::{config::WindowShape, peaks::Candidate, volume::Volume};

#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    #[error("window {half_extent:?} around {center:?} exceeds the volume bounds {shape:?}")]
    OutOfBounds {
        center: Candidate,
        half_extent: [usize; 3],
        shape: [usize; 3],
    },
    #[error("window half-extents {0:?} must be at least one voxel")]
    Empty([usize; 3]),
}

/// Checks that the window around `center` lies within `shape` on all three axes
pub fn inside(shape: [usize; 3], center: &Candidate, window: &WindowShape) -> bool {
    center
        .iter()
        .zip(window.0.iter())
        .zip(shape.iter())
        .all(|((&c, &w), &n)| c >= w && c + w <= n)
}

/// Baseline corrected and normalized bead sub-volume
#[derive(Debug, Clone)]
pub struct Window {
    pub data: Array3<f64>,
    /// mean of the 8 raw corner voxels
    pub baseline: f64,
}
impl Window {
    /// Extracts the window of half-extents `window` centered on `center`
    ///
    /// The baseline is removed and the data is divided by its maximum.
    /// A window with a non-positive maximum after baseline removal is left
    /// unnormalized.
    pub fn extract(
        volume: &Volume,
        center: &Candidate,
        window: &WindowShape,
    ) -> Result<Self, WindowError> {
        if window.0.contains(&0) {
            return Err(WindowError::Empty(window.0));
        }
        let (nz, ny, nx) = volume.dim();
        let shape = [nz, ny, nx];
        if !inside(shape, center, window) {
            return Err(WindowError::OutOfBounds {
                center: *center,
                half_extent: window.0,
                shape,
            });
        }
        let [z, y, x] = *center;
        let [wz, wy, wx] = window.0;
        let mut data = volume
            .slice(s![z - wz..z + wz, y - wy..y + wy, x - wx..x + wx])
            .to_owned();
        let baseline = corners(&data).iter().sum::<f64>() / 8f64;
        data -= baseline;
        let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max > 0f64 && max.is_finite() {
            data /= max;
        } else {
            log::warn!("degenerate window at {:?} (max: {})", center, max);
        }
        Ok(Self { data, baseline })
    }
    pub fn dims(&self) -> [usize; 3] {
        let (nz, ny, nx) = self.data.dim();
        [nz, ny, nx]
    }
    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

/// A retained bead: its center, raw peak intensity and window
#[derive(Debug, Clone)]
pub struct Bead {
    pub center: Candidate,
    /// raw volume intensity at the center
    pub max: f64,
    pub window: Window,
}
impl Bead {
    pub fn extract(
        volume: &Volume,
        center: &Candidate,
        window: &WindowShape,
    ) -> Result<Self, WindowError> {
        let window = Window::extract(volume, center, window)?;
        Ok(Self {
            center: *center,
            max: volume[*center],
            window,
        })
    }
}

fn corners(data: &Array3<f64>) -> [f64; 8] {
    let (nz, ny, nx) = data.dim();
    let (z, y, x) = (nz - 1, ny - 1, nx - 1);
    [
        data[[0, 0, 0]],
        data[[0, 0, x]],
        data[[0, y, 0]],
        data[[0, y, x]],
        data[[z, 0, 0]],
        data[[z, 0, x]],
        data[[z, y, 0]],
        data[[z, y, x]],
    ]
}

/// `n` evenly spaced samples over `[-n/2, n/2]`
pub fn linspace(n: usize) -> Vec<f64> {
    let half = n as f64 / 2f64;
    match n {
        0 => vec![],
        1 => vec![-half],
        _ => {
            let step = 2f64 * half / (n - 1) as f64;
            (0..n).map(|i| -half + i as f64 * step).collect()
        }
    }
}

/// Window centered sample coordinates
///
/// Points are stored as `(x, y, z)` vectors in the window raster order.
#[derive(Debug, Clone)]
pub struct CoordinateGrid {
    dims: [usize; 3],
    points: Vec<Vector3<f64>>,
}
impl CoordinateGrid {
    /// Grid over a window of `[z, y, x]` voxel counts
    pub fn new(dims: [usize; 3]) -> Self {
        let [nz, ny, nx] = dims;
        let (z, y, x) = (linspace(nz), linspace(ny), linspace(nx));
        let points = z
            .iter()
            .flat_map(|&zi| {
                let x = &x;
                y.iter()
                    .flat_map(move |&yi| x.iter().map(move |&xi| Vector3::new(xi, yi, zi)))
            })
            .collect();
        Self { dims, points }
    }
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }
    /// Half-extents of the grid `[z, y, x]`
    pub fn half_extents(&self) -> [f64; 3] {
        self.dims.map(|n| n as f64 / 2f64)
    }
    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }
    pub fn len(&self) -> usize {
        self.points.len()
    }
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_is_closed() {
        let window = WindowShape([2, 3, 4]);
        let shape = [10, 10, 10];
        assert!(inside(shape, &[2, 3, 4], &window));
        assert!(inside(shape, &[8, 7, 6], &window));
        assert!(!inside(shape, &[1, 3, 4], &window));
        assert!(!inside(shape, &[8, 7, 7], &window));
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let volume = Volume::zeros((10, 10, 10));
        let err = Window::extract(&volume, &[1, 5, 5], &WindowShape([2, 2, 2]));
        assert!(matches!(err, Err(WindowError::OutOfBounds { .. })));
        let err = Bead::extract(&volume, &[5, 5, 12], &WindowShape([2, 2, 2]));
        assert!(matches!(err, Err(WindowError::OutOfBounds { .. })));
    }

    #[test]
    fn zero_extent_is_an_error() {
        let volume = Volume::zeros((10, 10, 10));
        let err = Window::extract(&volume, &[5, 5, 5], &WindowShape([2, 0, 2]));
        assert!(matches!(err, Err(WindowError::Empty([2, 0, 2]))));
        let err = Bead::extract(&volume, &[5, 5, 5], &WindowShape([0, 0, 0]));
        assert!(matches!(err, Err(WindowError::Empty(_))));
    }

    #[test]
    fn baseline_and_normalization() -> Result<(), WindowError> {
        let volume = Volume::from_shape_fn((12, 12, 12), |(z, y, x)| {
            let r2 = (z as f64 - 6.).powi(2) + (y as f64 - 6.).powi(2) + (x as f64 - 6.).powi(2);
            10f64 + 50f64 * (-0.5 * r2 / 2f64).exp()
        });
        let window = Window::extract(&volume, &[6, 6, 6], &WindowShape([4, 4, 4]))?;
        assert_eq!(window.dims(), [8, 8, 8]);
        assert!((window.max() - 1f64).abs() < 1e-12);
        assert!(window.baseline > 10f64 && window.baseline < 10.1);
        assert!((window.data[[4, 4, 4]] - 1f64).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn flat_window_is_left_unnormalized() -> Result<(), WindowError> {
        let volume = Volume::from_elem((10, 10, 10), 3f64);
        let window = Window::extract(&volume, &[5, 5, 5], &WindowShape([2, 2, 2]))?;
        assert!(window.data.iter().all(|&v| v == 0f64));
        Ok(())
    }

    #[test]
    fn grid() {
        assert_eq!(linspace(5), vec![-2.5, -1.25, 0., 1.25, 2.5]);
        let grid = CoordinateGrid::new([2, 3, 4]);
        assert_eq!(grid.len(), 24);
        assert_eq!(grid.points()[0], Vector3::new(-2., -1.5, -1.));
        assert_eq!(grid.points()[1], Vector3::new(-2. + 4. / 3., -1.5, -1.));
        assert!((grid.points()[23] - Vector3::new(2., 1.5, 1.)).norm() < 1e-12);
    }
}
