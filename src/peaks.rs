//! Bead candidates detection
//!
//! The volume is smoothed with a Gaussian filter and candidates are the local
//! maxima of the smoothed volume above a threshold relative to its maximum.

use std::time::Instant;

use itertools::{Itertools, MinMaxResult};
use ndarray::{Array3, Axis};

use crate::{
    volume::{Mip, Volume},
    PipelineOptions,
};

pub mod filter;

/// Voxel coordinates `[z, y, x]` of a bead candidate
pub type Candidate = [usize; 3];

/// Peak detection output
#[derive(Debug, Clone)]
pub struct Peaks {
    /// local maxima, brightest first
    pub centers: Vec<Candidate>,
    /// smoothed volume maximum intensity projection along z
    pub mip: Mip,
}

/// Local maxima of `data`
///
/// A voxel is a maximum if it is equal to the largest value within the cube of
/// half-width `min_distance` around it, if it is brighter than
/// `max(min(data), thresh * max(data))` and if it lies at least `min_distance`
/// voxels away from any border. Maxima closer than `min_distance` (Chebyshev
/// distance) to a brighter one are discarded.
pub fn local_maxima(data: &Array3<f64>, min_distance: usize, thresh: f64) -> Vec<Candidate> {
    let (lo, hi) = match data.iter().copied().minmax_by(|a, b| a.total_cmp(b)) {
        MinMaxResult::MinMax(lo, hi) => (lo, hi),
        _ => return vec![],
    };
    if lo == hi {
        return vec![];
    }
    let floor = lo.max(thresh * hi);
    let max_filtered = filter::maximum(data, min_distance);
    let shape = data.shape();
    let inner = |idx: &[usize]| {
        idx.iter()
            .zip(shape)
            .all(|(&i, &n)| i >= min_distance && i + min_distance < n)
    };

    let mut peaks: Vec<(f64, Candidate)> = data
        .indexed_iter()
        .filter(|&((z, y, x), &v)| {
            v > floor && v == max_filtered[[z, y, x]] && inner(&[z, y, x])
        })
        .map(|((z, y, x), &v)| (v, [z, y, x]))
        .collect();
    // stable: ties stay in raster order
    peaks.sort_by(|a, b| b.0.total_cmp(&a.0));

    let reach = min_distance.saturating_sub(1);
    let mut taken = Array3::<bool>::from_elem(data.raw_dim(), false);
    let mut centers = Vec::with_capacity(peaks.len());
    for (_, center) in peaks {
        if taken[center] {
            continue;
        }
        let [z, y, x] = center;
        let range = |c: usize, n: usize| c.saturating_sub(reach)..(c + reach + 1).min(n);
        for zz in range(z, shape[0]) {
            for yy in range(y, shape[1]) {
                for xx in range(x, shape[2]) {
                    taken[[zz, yy, xx]] = true;
                }
            }
        }
        centers.push(center);
    }
    centers
}

/// Finds the bead candidates of a volume
pub fn find(volume: &Volume, thresh: f64, options: &PipelineOptions) -> Peaks {
    log::info!("Applying smoothing filter and localizing beads...");
    let now = Instant::now();
    let smoothed = filter::gaussian(volume, options.smoothing_sigma);
    let centers = local_maxima(&smoothed, options.min_peak_distance, thresh);
    log::info!(
        "Found {} candidates in {:.3}s",
        centers.len(),
        now.elapsed().as_secs_f64()
    );
    let mip = smoothed.fold_axis(Axis(0), f64::NEG_INFINITY, |&m, &v| m.max(v));
    Peaks { centers, mip }
}
