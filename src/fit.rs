/*!
# PSF fitting

Each bead window is fitted with a rotated anisotropic 3D Gaussian
(see [model](crate::model)) using a bounded Levenberg-Marquardt solver.
The fitted sigmas are converted into full widths at half maximum in microns.

A fit that does not converge is not an error of the pipeline: the bead keeps
a [NonConvergence] in place of its [PsfFit].
*/

use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use nalgebra::{DMatrix, DVector};
use ndarray::Array3;
use rayon::prelude::*;

use crate::{
    config::Axis,
    model::{self, GaussianParams, N_PARAMS},
    window::{Bead, CoordinateGrid},
    ImagingConfig, PipelineOptions,
};

pub mod solver;
pub use solver::{Bounds, LevenbergMarquardt, SolverError};

/// Reasons for a bead fit to be discarded
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NonConvergence {
    #[error("solver did not converge within {0} iterations")]
    MaxIterations(usize),
    #[error("window maximum is not positive")]
    DegenerateWindow,
    #[error("Gaussian model is not finite")]
    NonFinite,
    #[error("window shape {found:?} does not match the fitter grid {expected:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        found: [usize; 3],
    },
}
impl From<SolverError> for NonConvergence {
    fn from(value: SolverError) -> Self {
        match value {
            SolverError::MaxIterations(n) => NonConvergence::MaxIterations(n),
            SolverError::NonFinite => NonConvergence::NonFinite,
        }
    }
}

/// Converged bead fit
#[derive(Debug, Clone)]
pub struct PsfFit {
    /// full widths at half maximum [micron], `[x, y, z]`
    pub fwhm: [f64; 3],
    /// rotation angles [rad], `[x, y, z]`
    pub rotation: [f64; 3],
    pub params: GaussianParams,
    pub iterations: usize,
    /// fitted parameters covariance, see [GaussianParams::to_array] for the ordering
    pub covariance: Option<DMatrix<f64>>,
}

/// Outcome of a bead fit
pub type FitResult = Result<PsfFit, NonConvergence>;

/// Bead windows fitter
///
/// All the windows share the same shape, hence the same coordinate grid,
/// initial guess and bounds.
#[derive(Debug, Clone)]
pub struct PsfFitter {
    grid: CoordinateGrid,
    initial_guess: GaussianParams,
    bounds: Bounds,
    solver: LevenbergMarquardt,
    config: ImagingConfig,
}
impl PsfFitter {
    /// Fitter for windows of `[z, y, x]` voxel counts `dims`
    pub fn new(config: &ImagingConfig, dims: [usize; 3], options: &PipelineOptions) -> Self {
        let grid = CoordinateGrid::new(dims);
        let [hz, hy, hx] = grid.half_extents();
        let [nz, ny, nx] = dims.map(|n| n as f64);
        let rot = options.rotation_bound;
        let initial_guess = GaussianParams {
            center: [0f64; 3],
            sigma: [
                config.initial_sigma(Axis::X),
                config.initial_sigma(Axis::Y),
                config.initial_sigma(Axis::Z),
            ],
            amplitude: 1f64,
            offset: 0f64,
            rotation: [0f64; 3],
        };
        let lower = [-hx, -hy, -hz, 0.1, 0.1, 0.1, 0.5, -0.1, -rot, -rot, -rot];
        let upper = [hx, hy, hz, nx, ny, nz, 1.1, 0.1, rot, rot, rot];
        Self {
            grid,
            initial_guess,
            bounds: Bounds::new(&lower, &upper),
            solver: LevenbergMarquardt::default().max_iterations(options.max_iterations),
            config: config.clone(),
        }
    }
    pub fn initial_guess(&self) -> &GaussianParams {
        &self.initial_guess
    }
    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }
    pub fn grid(&self) -> &CoordinateGrid {
        &self.grid
    }
    /// Fits the Gaussian model to a window
    pub fn fit(&self, window: &Array3<f64>) -> FitResult {
        let (nz, ny, nx) = window.dim();
        if [nz, ny, nx] != self.grid.dims() {
            return Err(NonConvergence::ShapeMismatch {
                expected: self.grid.dims(),
                found: [nz, ny, nx],
            });
        }
        let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !(max > 0f64 && max.is_finite()) {
            return Err(NonConvergence::DegenerateWindow);
        }
        let data = DVector::from_iterator(window.len(), window.iter().map(|v| v / max));
        let model = |p: &DVector<f64>| {
            DVector::from_vec(model::evaluate(
                &GaussianParams::from_slice(p.as_slice()),
                &self.grid,
            ))
        };
        let p0 = DVector::from_column_slice(&self.initial_guess.to_array());
        let solution = self.solver.minimize(model, &data, &p0, &self.bounds)?;
        debug_assert_eq!(solution.params.len(), N_PARAMS);

        let params = GaussianParams::from_slice(solution.params.as_slice());
        let [sx, sy, sz] = params.sigma;
        Ok(PsfFit {
            fwhm: [
                self.config.fwhm_from_sigma(sx, Axis::X),
                self.config.fwhm_from_sigma(sy, Axis::Y),
                self.config.fwhm_from_sigma(sz, Axis::Z),
            ],
            rotation: params.rotation,
            params,
            iterations: solution.iterations,
            covariance: solution.covariance,
        })
    }
    /// Fits all the beads, in parallel, preserving the bead order
    pub fn fit_all(&self, beads: &[Bead], progress: bool) -> Vec<FitResult> {
        let pb = if progress {
            let pb = ProgressBar::new(beads.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb.set_message("Fitting beads");
            pb
        } else {
            ProgressBar::hidden()
        };
        let fits: Vec<_> = beads
            .par_iter()
            .progress_with(pb.clone())
            .map(|bead| {
                let fit = self.fit(&bead.window.data);
                if let Err(e) = &fit {
                    log::warn!("bead at {:?}: {}", bead.center, e);
                }
                fit
            })
            .collect();
        pb.finish_with_message("Beads fitted");
        fits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::fwhm_factor, peaks::Candidate, window::Window};

    fn config() -> ImagingConfig {
        ImagingConfig::new(10f64, 5f64, 500f64, 1f64, [1.2, 0.8, 0.8], 0.2, 0.5)
    }

    fn synthetic(fitter: &PsfFitter, params: &GaussianParams) -> Array3<f64> {
        let [nz, ny, nx] = fitter.grid().dims();
        Array3::from_shape_vec((nz, ny, nx), model::evaluate(params, fitter.grid()))
            .expect("grid and window shapes match")
    }

    #[test]
    fn bounds_and_initial_guess() {
        let cfg = config();
        let dims = cfg.window_shape().dims();
        assert_eq!(dims, [12, 16, 16]);
        let fitter = PsfFitter::new(&cfg, dims, &PipelineOptions::default());
        let b = fitter.bounds();
        assert_eq!(b.lower[0], -8.);
        assert_eq!(b.upper[2], 6.);
        assert_eq!(b.upper[5], 12.);
        assert!((b.upper[8] - 5f64.to_radians()).abs() < 1e-15);
        let guess = fitter.initial_guess();
        assert_eq!(guess.sigma[0], guess.sigma[1]);
        assert!(guess.sigma[2] < guess.sigma[0]);
    }

    #[test]
    fn recover_synthetic_psf() -> Result<(), NonConvergence> {
        let cfg = ImagingConfig::new(10f64, 5f64, 500f64, 1f64, [2.4, 0.8, 0.8], 0.2, 0.5);
        let fitter = PsfFitter::new(&cfg, cfg.window_shape().dims(), &PipelineOptions::default());
        let truth = GaussianParams {
            center: [0.; 3],
            sigma: [2., 2., 3.],
            amplitude: 1.,
            offset: 0.,
            rotation: [0.; 3],
        };
        let fit = fitter.fit(&synthetic(&fitter, &truth))?;
        let fwhm_lat = 4. * 2. * fwhm_factor() / 10.;
        let fwhm_ax = 4. * 3. * fwhm_factor() / 5.;
        assert!((fit.fwhm[0] - fwhm_lat).abs() < 1e-4 * fwhm_lat, "{:?}", fit.fwhm);
        assert!((fit.fwhm[1] - fwhm_lat).abs() < 1e-4 * fwhm_lat, "{:?}", fit.fwhm);
        assert!((fit.fwhm[2] - fwhm_ax).abs() < 1e-4 * fwhm_ax, "{:?}", fit.fwhm);
        assert!(fit.rotation.iter().all(|r| r.abs() < 1e-3));
        Ok(())
    }

    #[test]
    fn recover_shifted_rotated_psf() -> Result<(), NonConvergence> {
        let cfg = ImagingConfig::new(10f64, 5f64, 500f64, 1f64, [2.4, 0.8, 0.8], 0.2, 0.5);
        let fitter = PsfFitter::new(&cfg, cfg.window_shape().dims(), &PipelineOptions::default());
        let truth = GaussianParams {
            center: [0.7, -0.4, 1.1],
            sigma: [1.8, 2.4, 3.5],
            amplitude: 0.9,
            offset: 0.02,
            rotation: [0.03, -0.05, 0.06],
        };
        let fit = fitter.fit(&synthetic(&fitter, &truth))?;
        // the window is normalized to its maximum sample before fitting
        let ratio = fit.params.offset / fit.params.amplitude;
        assert!((ratio - truth.offset / truth.amplitude).abs() < 1e-4);
        for (fitted, expected) in fit.params.sigma.iter().zip(truth.sigma.iter()) {
            assert!((fitted - expected).abs() < 1e-3, "{:?}", fit.params);
        }
        for (fitted, expected) in fit.params.center.iter().zip(truth.center.iter()) {
            assert!((fitted - expected).abs() < 1e-3, "{:?}", fit.params);
        }
        for (fitted, expected) in fit.rotation.iter().zip(truth.rotation.iter()) {
            assert!((fitted - expected).abs() < 1e-3, "{:?}", fit.params);
        }
        assert!(fit.covariance.is_some());
        Ok(())
    }

    #[test]
    fn flat_window_fails() {
        let cfg = config();
        let dims = cfg.window_shape().dims();
        let fitter = PsfFitter::new(&cfg, dims, &PipelineOptions::default());
        let [nz, ny, nx] = dims;
        let fit = fitter.fit(&Array3::zeros((nz, ny, nx)));
        assert_eq!(fit.err(), Some(NonConvergence::DegenerateWindow));
    }

    #[test]
    fn mismatched_window_fails() {
        let cfg = config();
        let fitter = PsfFitter::new(&cfg, cfg.window_shape().dims(), &PipelineOptions::default());
        let fit = fitter.fit(&Array3::from_elem((12, 16, 15), 1f64));
        assert_eq!(
            fit.err(),
            Some(NonConvergence::ShapeMismatch {
                expected: [12, 16, 16],
                found: [12, 16, 15],
            })
        );
    }

    #[test]
    fn failed_bead_does_not_affect_the_others() {
        let cfg = ImagingConfig::new(10f64, 5f64, 500f64, 1f64, [2.4, 0.8, 0.8], 0.2, 0.5);
        let fitter = PsfFitter::new(&cfg, cfg.window_shape().dims(), &PipelineOptions::default());
        let round = |sigma: [f64; 3]| GaussianParams {
            center: [0.; 3],
            sigma,
            amplitude: 1.,
            offset: 0.,
            rotation: [0.; 3],
        };
        let bead = |center: Candidate, data: Array3<f64>| Bead {
            center,
            max: 1.,
            window: Window {
                data,
                baseline: 0.,
            },
        };
        let [nz, ny, nx] = fitter.grid().dims();
        let beads = vec![
            bead([20, 20, 20], synthetic(&fitter, &round([2., 2., 3.]))),
            bead([20, 20, 60], Array3::zeros((nz, ny, nx))),
            bead([20, 60, 20], synthetic(&fitter, &round([1.5, 1.5, 2.5]))),
        ];
        let fits = fitter.fit_all(&beads, false);
        assert_eq!(fits.len(), 3);
        let first = fits[0].as_ref().expect("first bead converges");
        assert!((first.params.sigma[0] - 2.).abs() < 1e-3, "{:?}", first.params);
        assert_eq!(fits[1].as_ref().err(), Some(&NonConvergence::DegenerateWindow));
        let last = fits[2].as_ref().expect("last bead converges");
        assert!((last.params.sigma[2] - 2.5).abs() < 1e-3, "{:?}", last.params);
    }

    #[test]
    fn iteration_budget_exhausted() {
        let cfg = config();
        let dims = cfg.window_shape().dims();
        let options = PipelineOptions::default().max_iterations(1);
        let fitter = PsfFitter::new(&cfg, dims, &options);
        let truth = GaussianParams {
            center: [2., -1., 1.],
            sigma: [3., 3., 4.],
            amplitude: 1.,
            offset: 0.,
            rotation: [0.; 3],
        };
        let fit = fitter.fit(&synthetic(&fitter, &truth));
        assert_eq!(fit.err(), Some(NonConvergence::MaxIterations(1)));
    }
}
