/*!
# Bead PSF

Point spread function measurement from 3D images of sub-resolution beads.

The pipeline:
 1. smooths the volume and finds the local maxima above a relative threshold ([peaks]),
 2. subsamples the candidates and keeps the laterally isolated ones whose window fits in the volume ([selector]),
 3. extracts a baseline corrected and normalized window around each bead ([window]),
 4. fits a rotated anisotropic Gaussian to each window and converts the widths into FWHM ([fit]).

```no_run
use bead_psf::{compute, volume, ImagingConfig, PipelineOptions};

# fn main() -> Result<(), Box<dyn std::error::Error>> {
let volume = volume::load("beads.npy")?;
let config = ImagingConfig::from_pickle("config.pkl")?;
let (table, _mip) = compute(&volume, &config, &PipelineOptions::default().seed(7))?;
table.summary();
table.to_csv("psf.csv")?;
# Ok(())
# }
```
*/

use std::time::Instant;

use rand::Rng;

pub mod config;
pub mod error;
pub mod fit;
pub mod model;
pub mod peaks;
pub mod selector;
pub mod table;
pub mod volume;
pub mod window;

pub use config::{Axis, ConfigError, ImagingConfig, PipelineOptions, WindowShape};
pub use error::Error;
pub use fit::{FitResult, NonConvergence, PsfFit, PsfFitter};
pub use model::GaussianParams;
pub use table::{BeadRecord, ResultTable};
pub use volume::{Mip, Volume};
pub use window::{Bead, Window, WindowError};

/// Measures the PSF of all the selected beads of a volume
///
/// Returns the result table and the maximum intensity projection of the
/// smoothed volume. Only an invalid configuration or a bead window
/// outside the volume stops the pipeline, a bead fit that fails is
/// recorded in its row.
pub fn compute(
    volume: &Volume,
    config: &ImagingConfig,
    options: &PipelineOptions,
) -> Result<(ResultTable, Mip), Error> {
    let mut rng = selector::rng(options);
    compute_with_rng(volume, config, options, &mut rng)
}

/// Same as [compute] with the bead subsampling drawn from `rng`
pub fn compute_with_rng<R: Rng + ?Sized>(
    volume: &Volume,
    config: &ImagingConfig,
    options: &PipelineOptions,
    rng: &mut R,
) -> Result<(ResultTable, Mip), Error> {
    config.validate()?;
    let now = Instant::now();
    let (nz, ny, nx) = volume.dim();
    log::info!("Processing volume ({}, {}, {})", nz, ny, nx);

    let peaks::Peaks { centers, mip } = peaks::find(volume, config.thresh, options);
    let window = config.window_shape();
    let centers = selector::select(centers, [nz, ny, nx], window, config, options, rng);
    if centers.is_empty() {
        log::warn!("no bead left to fit");
        return Ok((ResultTable::default(), mip));
    }

    log::info!("Extracting {} bead windows...", centers.len());
    let beads = centers
        .iter()
        .map(|center| {
            Bead::extract(volume, center, &window).map_err(|e| {
                log::error!("{}", e);
                e
            })
        })
        .collect::<Result<Vec<_>, WindowError>>()?;

    log::info!("Fitting {} beads...", beads.len());
    let fitter = PsfFitter::new(config, window.dims(), options);
    let fits = fitter.fit_all(&beads, options.progress);
    let table = ResultTable::new(beads, fits);
    log::info!(
        "{} beads fitted ({} failed) in {:.3}s",
        table.len(),
        table.failed().count(),
        now.elapsed().as_secs_f64()
    );
    Ok((table, mip))
}
