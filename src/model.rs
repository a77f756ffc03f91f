//! Rotated anisotropic 3D Gaussian
//!
//! The sample coordinates are rotated about x, then about y and finally about z
//! before evaluating
//! `offset + amplitude * exp(-((x-xo)²/2sx² + (y-yo)²/2sy² + (z-zo)²/2sz²))`.

use nalgebra::{Matrix3, Vector3};

use crate::window::CoordinateGrid;

/// Number of model parameters
pub const N_PARAMS: usize = 11;

/// Gaussian model parameters, vectors are ordered `[x, y, z]`
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GaussianParams {
    pub center: [f64; 3],
    pub sigma: [f64; 3],
    pub amplitude: f64,
    pub offset: f64,
    /// rotation angles [rad] about the x, y and z axes
    pub rotation: [f64; 3],
}
impl GaussianParams {
    /// Parameters as `[xo, yo, zo, sx, sy, sz, amplitude, offset, rotx, roty, rotz]`
    pub fn to_array(&self) -> [f64; N_PARAMS] {
        let [xo, yo, zo] = self.center;
        let [sx, sy, sz] = self.sigma;
        let [rx, ry, rz] = self.rotation;
        [xo, yo, zo, sx, sy, sz, self.amplitude, self.offset, rx, ry, rz]
    }
    /// Inverse of [GaussianParams::to_array]
    pub fn from_slice(p: &[f64]) -> Self {
        Self {
            center: [p[0], p[1], p[2]],
            sigma: [p[3], p[4], p[5]],
            amplitude: p[6],
            offset: p[7],
            rotation: [p[8], p[9], p[10]],
        }
    }
}

/// Rotations about x, y and z, in order of application
pub fn rotations(angles: [f64; 3]) -> [Matrix3<f64>; 3] {
    let [rx, ry, rz] = angles;
    let (sx, cx) = rx.sin_cos();
    let (sy, cy) = ry.sin_cos();
    let (sz, cz) = rz.sin_cos();
    [
        Matrix3::new(1., 0., 0., 0., cx, sx, 0., -sx, cx),
        Matrix3::new(cy, 0., -sy, 0., 1., 0., sy, 0., cy),
        Matrix3::new(cz, sz, 0., -sz, cz, 0., 0., 0., 1.),
    ]
}

/// Applies the rotations one after the other
pub fn rotate(point: &Vector3<f64>, rotations: &[Matrix3<f64>; 3]) -> Vector3<f64> {
    rotations.iter().fold(*point, |p, r| r * p)
}

/// Model value at a single (unrotated) sample point
pub fn value(params: &GaussianParams, point: &Vector3<f64>) -> f64 {
    value_rotated(params, &rotate(point, &rotations(params.rotation)))
}

fn value_rotated(params: &GaussianParams, p: &Vector3<f64>) -> f64 {
    let arg: f64 = p
        .iter()
        .zip(params.center.iter().zip(params.sigma.iter()))
        .map(|(&q, (&c, &s))| (q - c).powi(2) / (2f64 * s * s))
        .sum();
    params.offset + params.amplitude * (-arg).exp()
}

/// Model evaluated at every grid point, in the grid raster order
pub fn evaluate(params: &GaussianParams, grid: &CoordinateGrid) -> Vec<f64> {
    let rotations = rotations(params.rotation);
    grid.points()
        .iter()
        .map(|point| value_rotated(params, &rotate(point, &rotations)))
        .collect()
}
