use std::{fs::File, io, path::Path};

use serde::{Deserialize, Serialize};

/// Default cap on the number of candidate beads kept for fitting
pub const MAX_BEADS: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`{field}` must be a finite positive number, found {value}")]
    NonPositive { field: &'static str, value: f64 },
    #[error("`thresh` must be in (0,1), found {0}")]
    Threshold(f64),
    #[error("`bead_size` must be a finite non-negative number, found {0}")]
    BeadSize(f64),
    #[error("`maxBeads` must be at least 1")]
    MaxBeads,
    #[error("window along the {0} axis rounds to zero voxels")]
    EmptyWindow(Axis),
    #[error("failed to open config file {1:?}")]
    Io(#[source] io::Error, std::path::PathBuf),
    #[error("failed to decode pickled config")]
    Pickle(#[from] serde_pickle::Error),
}
type Result<T> = std::result::Result<T, ConfigError>;

/// Volume axes, in storage order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Z,
    Y,
    X,
}
impl Axis {
    pub fn index(&self) -> usize {
        match self {
            Axis::Z => 0,
            Axis::Y => 1,
            Axis::X => 2,
        }
    }
}
impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::Z => write!(f, "axial (z)"),
            Axis::Y => write!(f, "lateral (y)"),
            Axis::X => write!(f, "lateral (x)"),
        }
    }
}

/// `sqrt(-0.5 ln 0.5)`, the sigma to half-width-at-half-maximum ratio over 2
pub fn fwhm_factor() -> f64 {
    (-0.5 * 0.5f64.ln()).sqrt()
}

/// Optical and acquisition constants of a bead volume
///
/// Field names follow the acquisition metadata (`pxPerUmLat`, `NA`, ...)
/// so that a pickled acquisition dictionary deserializes as is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImagingConfig {
    /// lateral sampling [pixel/micron]
    #[serde(rename = "pxPerUmLat")]
    pub px_per_um_lat: f64,
    /// axial sampling [pixel/micron]
    #[serde(rename = "pxPerUmAx")]
    pub px_per_um_ax: f64,
    /// emission wavelength [nm]
    pub wavelength: f64,
    /// numerical aperture
    #[serde(rename = "NA")]
    pub na: f64,
    /// window size [micron] as `[axial, lateral, lateral]`
    #[serde(rename = "windowUm")]
    pub window_um: [f64; 3],
    /// peak detection threshold relative to the smoothed volume maximum
    pub thresh: f64,
    /// nominal bead size added to the diffraction limited sigma guess
    pub bead_size: f64,
    #[serde(rename = "maxBeads", default = "default_max_beads")]
    pub max_beads: usize,
}
fn default_max_beads() -> usize {
    MAX_BEADS
}

impl ImagingConfig {
    pub fn new(
        px_per_um_lat: f64,
        px_per_um_ax: f64,
        wavelength: f64,
        na: f64,
        window_um: [f64; 3],
        thresh: f64,
        bead_size: f64,
    ) -> Self {
        Self {
            px_per_um_lat,
            px_per_um_ax,
            wavelength,
            na,
            window_um,
            thresh,
            bead_size,
            max_beads: MAX_BEADS,
        }
    }
    pub fn max_beads(self, max_beads: usize) -> Self {
        Self { max_beads, ..self }
    }
    /// Loads a pickled configuration dictionary and validates it
    pub fn from_pickle<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(&path)
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;
        let config: Self = serde_pickle::from_reader(&mut file, Default::default())?;
        config.validate()?;
        Ok(config)
    }
    /// Checks that every field describes a usable geometry
    pub fn validate(&self) -> Result<()> {
        let positive = |field: &'static str, value: f64| {
            if value.is_finite() && value > 0f64 {
                Ok(())
            } else {
                Err(ConfigError::NonPositive { field, value })
            }
        };
        positive("pxPerUmLat", self.px_per_um_lat)?;
        positive("pxPerUmAx", self.px_per_um_ax)?;
        positive("wavelength", self.wavelength)?;
        positive("NA", self.na)?;
        for &w in &self.window_um {
            positive("windowUm", w)?;
        }
        if !(self.thresh > 0f64 && self.thresh < 1f64) {
            return Err(ConfigError::Threshold(self.thresh));
        }
        if !(self.bead_size.is_finite() && self.bead_size >= 0f64) {
            return Err(ConfigError::BeadSize(self.bead_size));
        }
        if self.max_beads == 0 {
            return Err(ConfigError::MaxBeads);
        }
        let shape = self.window_shape();
        for axis in [Axis::Z, Axis::Y, Axis::X] {
            if shape.half_extent(axis) == 0 {
                return Err(ConfigError::EmptyWindow(axis));
            }
        }
        Ok(())
    }
    /// Sampling [pixel/micron] along `axis`
    pub fn px_per_um(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Z => self.px_per_um_ax,
            Axis::Y | Axis::X => self.px_per_um_lat,
        }
    }
    /// Window half-extents in voxels
    pub fn window_shape(&self) -> WindowShape {
        let half = |axis: Axis| (self.window_um[axis.index()] * self.px_per_um(axis)).round() as usize;
        WindowShape([half(Axis::Z), half(Axis::Y), half(Axis::X)])
    }
    /// Diffraction limited sigma estimate plus the nominal bead size, in voxels
    pub fn initial_sigma(&self, axis: Axis) -> f64 {
        let diffraction_limit_um = self.wavelength / 1000f64 / (2f64 * self.na);
        diffraction_limit_um * self.px_per_um(axis) / (4f64 * fwhm_factor()) + self.bead_size
    }
    /// Full width at half maximum [micron] of a Gaussian of width `sigma` voxels
    pub fn fwhm_from_sigma(&self, sigma: f64, axis: Axis) -> f64 {
        (4f64 * sigma * fwhm_factor()).abs() / self.px_per_um(axis)
    }
}

/// Window half-extents in voxels, ordered `[z, y, x]`
///
/// An extracted window spans `2 * half_extent` voxels along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowShape(pub [usize; 3]);
impl WindowShape {
    pub fn half_extent(&self, axis: Axis) -> usize {
        self.0[axis.index()]
    }
    /// Window voxel counts `[z, y, x]`
    pub fn dims(&self) -> [usize; 3] {
        let [z, y, x] = self.0;
        [2 * z, 2 * y, 2 * x]
    }
}

/// Pipeline constants
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Gaussian smoothing sigma [voxel] applied before peak detection
    pub smoothing_sigma: f64,
    /// minimum separation [voxel] between local maxima
    pub min_peak_distance: usize,
    /// beads with a lateral neighbor closer than this [micron] are rejected
    pub min_separation_um: f64,
    /// symmetric bound [rad] on each fitted rotation angle
    pub rotation_bound: f64,
    /// solver iteration budget per bead
    pub max_iterations: usize,
    /// seed of the bead subsampling generator
    pub seed: Option<u64>,
    pub progress: bool,
}
impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            smoothing_sigma: 1f64,
            min_peak_distance: 3,
            min_separation_um: 3f64,
            rotation_bound: 5f64.to_radians(),
            max_iterations: 200,
            seed: None,
            progress: true,
        }
    }
}
impl PipelineOptions {
    pub fn seed(self, seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..self
        }
    }
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }
    pub fn progress(self, progress: bool) -> Self {
        Self { progress, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ImagingConfig {
        ImagingConfig::new(10f64, 5f64, 500f64, 1f64, [2f64, 1f64, 1f64], 0.2, 0.5)
    }

    #[test]
    fn window_shape() {
        let shape = config().window_shape();
        assert_eq!(shape, WindowShape([10, 10, 10]));
        assert_eq!(shape.dims(), [20, 20, 20]);
    }

    #[test]
    fn reject_non_positive_pitch() {
        let mut cfg = config();
        cfg.px_per_um_lat = 0f64;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonPositive {
                field: "pxPerUmLat",
                ..
            })
        ));
        cfg.px_per_um_lat = -1f64;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reject_threshold() {
        let mut cfg = config();
        cfg.thresh = 1f64;
        assert!(matches!(cfg.validate(), Err(ConfigError::Threshold(_))));
        cfg.thresh = 0f64;
        assert!(matches!(cfg.validate(), Err(ConfigError::Threshold(_))));
    }

    #[test]
    fn reject_empty_window() {
        let mut cfg = config();
        cfg.window_um = [2f64, 0.01, 1f64];
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::EmptyWindow(Axis::Y))
        ));
    }

    #[test]
    fn fwhm() {
        let cfg = config();
        let fwhm = cfg.fwhm_from_sigma(2f64, Axis::X);
        assert!((fwhm - 2f64 * (2f64 * 2f64.ln()).sqrt() * 2f64 / 10f64).abs() < 1e-12);
        assert!((cfg.fwhm_from_sigma(-2f64, Axis::X) - fwhm).abs() < 1e-15);
    }

    #[test]
    fn initial_sigma() {
        let cfg = config();
        let expected = 0.25 * 10f64 / (4f64 * fwhm_factor()) + 0.5;
        assert!((cfg.initial_sigma(Axis::Y) - expected).abs() < 1e-12);
    }

    #[test]
    fn pickle_round_trip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let cfg = config().max_beads(42);
        let path = std::env::temp_dir().join("bead_psf_config_round_trip.pkl");
        let mut file = File::create(&path)?;
        serde_pickle::to_writer(&mut file, &cfg, Default::default())?;
        drop(file);
        assert_eq!(ImagingConfig::from_pickle(&path)?, cfg);
        Ok(())
    }
}
