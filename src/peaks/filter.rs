//! Separable filters with edge-replicate boundaries

use ndarray::{Array3, ArrayView1, ArrayViewMut1, Axis, Zip};

/// Gaussian kernel truncated at 4 sigma, normalized to unit sum
pub fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (4f64 * sigma + 0.5) as i64;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-0.5 * (i * i) as f64 / (sigma * sigma)).exp())
        .collect();
    let sum: f64 = kernel.iter().sum();
    kernel.into_iter().map(|k| k / sum).collect()
}

fn clamp(i: i64, n: usize) -> usize {
    i.clamp(0, n as i64 - 1) as usize
}

fn convolve_lane(src: ArrayView1<f64>, mut dst: ArrayViewMut1<f64>, kernel: &[f64]) {
    let n = src.len();
    let radius = (kernel.len() / 2) as i64;
    for (i, d) in dst.iter_mut().enumerate() {
        *d = kernel
            .iter()
            .enumerate()
            .map(|(k, w)| w * src[clamp(i as i64 + k as i64 - radius, n)])
            .sum();
    }
}

fn max_lane(src: ArrayView1<f64>, mut dst: ArrayViewMut1<f64>, radius: i64) {
    let n = src.len();
    for (i, d) in dst.iter_mut().enumerate() {
        *d = (-radius..=radius)
            .map(|k| src[clamp(i as i64 + k, n)])
            .fold(f64::NEG_INFINITY, f64::max);
    }
}

fn along_axes<F>(data: &Array3<f64>, f: F) -> Array3<f64>
where
    F: Fn(ArrayView1<f64>, ArrayViewMut1<f64>),
{
    (0..3).fold(data.clone(), |src, axis| {
        let mut dst = Array3::<f64>::zeros(src.raw_dim());
        Zip::from(src.lanes(Axis(axis)))
            .and(dst.lanes_mut(Axis(axis)))
            .for_each(|s, d| f(s, d));
        dst
    })
}

/// Isotropic Gaussian smoothing
pub fn gaussian(data: &Array3<f64>, sigma: f64) -> Array3<f64> {
    if sigma <= 0f64 {
        return data.clone();
    }
    let kernel = gaussian_kernel(sigma);
    along_axes(data, |s, d| convolve_lane(s, d, &kernel))
}

/// Maximum over the `(2 radius + 1)³` cube centered on each voxel
pub fn maximum(data: &Array3<f64>, radius: usize) -> Array3<f64> {
    along_axes(data, |s, d| max_lane(s, d, radius as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel() {
        let kernel = gaussian_kernel(1f64);
        assert_eq!(kernel.len(), 9);
        assert!((kernel.iter().sum::<f64>() - 1f64).abs() < 1e-12);
        assert!(kernel[4] > kernel[3] && (kernel[3] - kernel[5]).abs() < 1e-15);
    }

    #[test]
    fn smoothing_preserves_constant() {
        let data = Array3::from_elem((5, 6, 7), 3f64);
        let smoothed = gaussian(&data, 1f64);
        assert!(smoothed.iter().all(|&x| (x - 3f64).abs() < 1e-12));
    }

    #[test]
    fn smoothing_preserves_mass_away_from_edges() {
        let mut data = Array3::<f64>::zeros((21, 21, 21));
        data[[10, 10, 10]] = 1f64;
        let smoothed = gaussian(&data, 1f64);
        assert!((smoothed.sum() - 1f64).abs() < 1e-9);
        assert_eq!(
            smoothed
                .indexed_iter()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(idx, _)| idx),
            Some((10, 10, 10))
        );
    }

    #[test]
    fn maximum_filter() {
        let mut data = Array3::<f64>::zeros((9, 9, 9));
        data[[0, 0, 0]] = 2f64;
        let max = maximum(&data, 3);
        assert_eq!(max[[3, 3, 3]], 2f64);
        assert_eq!(max[[4, 0, 0]], 0f64);
    }
}
