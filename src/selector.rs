//! Bead candidates selection
//!
//! Candidates are subsampled to at most `maxBeads`, then any candidate with a
//! lateral neighbor within the minimum separation is rejected, and finally
//! candidates whose window would not fit in the volume are dropped.
//! The axial coordinate is ignored by the separation test: beads stacked along
//! z at the same (y,x) location are still ambiguous targets.

use std::time::Instant;

use rand::{rngs::StdRng, seq::index, Rng, SeedableRng};
use rstar::{primitives::GeomWithData, RTree};

use crate::{
    config::{Axis, WindowShape},
    peaks::Candidate,
    window::inside,
    ImagingConfig, PipelineOptions,
};

type LateralPoint = GeomWithData<[f64; 2], usize>;

/// Draws at most `max_beads` candidates uniformly without replacement
///
/// The drawn candidates keep their input order. The candidates are returned
/// untouched if there are no more than `max_beads`.
pub fn subsample<R: Rng + ?Sized>(
    candidates: Vec<Candidate>,
    max_beads: usize,
    rng: &mut R,
) -> Vec<Candidate> {
    if candidates.len() <= max_beads {
        return candidates;
    }
    let mut indices = index::sample(rng, candidates.len(), max_beads).into_vec();
    indices.sort_unstable();
    indices.into_iter().map(|i| candidates[i]).collect()
}

/// Candidates lateral coordinates [micron]
fn lateral_um(candidates: &[Candidate], config: &ImagingConfig) -> Vec<LateralPoint> {
    candidates
        .iter()
        .enumerate()
        .map(|(i, &[_, y, x])| {
            GeomWithData::new(
                [
                    y as f64 / config.px_per_um(Axis::Y),
                    x as f64 / config.px_per_um(Axis::X),
                ],
                i,
            )
        })
        .collect()
}

/// Keeps the candidates without any lateral neighbor within `min_separation_um`
///
/// A candidate is never compared with itself; with a single candidate
/// there is no neighbor and it is kept.
pub fn isolated(
    candidates: &[Candidate],
    config: &ImagingConfig,
    min_separation_um: f64,
) -> Vec<Candidate> {
    let points = lateral_um(candidates, config);
    let tree = RTree::bulk_load(points.clone());
    // slightly wider search radius, the inclusive test is done below
    let search_radius_2 = (min_separation_um * (1f64 + 1e-9)).powi(2);
    points
        .iter()
        .filter(|point| {
            let [y, x] = *point.geom();
            !tree
                .locate_within_distance([y, x], search_radius_2)
                .filter(|other| other.data != point.data)
                .any(|other| {
                    let [oy, ox] = *other.geom();
                    (y - oy).hypot(x - ox) <= min_separation_um
                })
        })
        .map(|point| candidates[point.data])
        .collect()
}

/// Selects the candidates that will be fitted
///
/// The selected candidates are a subset of `candidates` in input order.
pub fn select<R: Rng + ?Sized>(
    candidates: Vec<Candidate>,
    shape: [usize; 3],
    window: WindowShape,
    config: &ImagingConfig,
    options: &PipelineOptions,
    rng: &mut R,
) -> Vec<Candidate> {
    log::info!("Filtering found beads...");
    let now = Instant::now();
    log::info!(
        "Found {} beads, randomly choosing no more than {}",
        candidates.len(),
        config.max_beads
    );
    let candidates = subsample(candidates, config.max_beads, rng);
    let candidates = isolated(&candidates, config, options.min_separation_um);
    log::debug!("{} isolated beads", candidates.len());
    let kept: Vec<_> = candidates
        .into_iter()
        .filter(|center| inside(shape, center, &window))
        .collect();
    log::info!(
        "Filtered to {} beads in {:.3}s",
        kept.len(),
        now.elapsed().as_secs_f64()
    );
    kept
}

/// Random generator for [select], seeded from the options if a seed is given
pub fn rng(options: &PipelineOptions) -> StdRng {
    match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}
