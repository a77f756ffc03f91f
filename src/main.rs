use std::{fs, path::PathBuf};

use anyhow::{bail, Context};
use bead_psf::{compute, volume, ImagingConfig, PipelineOptions};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "bead-psf",
    about = "Point spread function measurements from a 3D bead volume"
)]
struct Opt {
    /// Path to the bead volume (.npy, `[z, y, x]`)
    #[structopt(parse(from_os_str))]
    volume: PathBuf,
    /// Pickled imaging configuration
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
    /// Lateral sampling [pixel/micron]
    #[structopt(long)]
    px_per_um_lat: Option<f64>,
    /// Axial sampling [pixel/micron]
    #[structopt(long)]
    px_per_um_ax: Option<f64>,
    /// Emission wavelength [nm]
    #[structopt(long)]
    wavelength: Option<f64>,
    /// Numerical aperture
    #[structopt(long)]
    na: Option<f64>,
    /// Window size [micron]: axial lateral lateral
    #[structopt(long, number_of_values = 3)]
    window_um: Option<Vec<f64>>,
    /// Peak detection threshold relative to the volume maximum
    #[structopt(long)]
    thresh: Option<f64>,
    /// Nominal bead size added to the initial sigma guess
    #[structopt(long, default_value = "0")]
    bead_size: f64,
    /// Maximum number of candidate beads
    #[structopt(long)]
    max_beads: Option<usize>,
    /// Bead subsampling seed
    #[structopt(long)]
    seed: Option<u64>,
    /// Solver iteration budget per bead
    #[structopt(long, default_value = "200")]
    max_iterations: usize,
    /// Output directory
    #[structopt(short, long, default_value = ".", parse(from_os_str))]
    output: PathBuf,
    /// Also pickle the full table, bead windows included
    #[structopt(long)]
    pickle: bool,
    /// Hide the progress bar
    #[structopt(long)]
    no_progress: bool,
}
impl Opt {
    fn imaging_config(&self) -> anyhow::Result<ImagingConfig> {
        let config = match &self.config {
            Some(path) => ImagingConfig::from_pickle(path)
                .with_context(|| format!("failed to load config from {:?}", path))?,
            None => {
                let (
                    Some(px_per_um_lat),
                    Some(px_per_um_ax),
                    Some(wavelength),
                    Some(na),
                    Some(window_um),
                    Some(thresh),
                ) = (
                    self.px_per_um_lat,
                    self.px_per_um_ax,
                    self.wavelength,
                    self.na,
                    self.window_um.as_ref(),
                    self.thresh,
                )
                else {
                    bail!("either --config or all of --px-per-um-lat, --px-per-um-ax, --wavelength, --na, --window-um and --thresh are required");
                };
                ImagingConfig::new(
                    px_per_um_lat,
                    px_per_um_ax,
                    wavelength,
                    na,
                    [window_um[0], window_um[1], window_um[2]],
                    thresh,
                    self.bead_size,
                )
            }
        };
        Ok(match self.max_beads {
            Some(max_beads) => config.max_beads(max_beads),
            None => config,
        })
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let config = opt.imaging_config()?;
    let mut options = PipelineOptions::default()
        .max_iterations(opt.max_iterations)
        .progress(!opt.no_progress);
    if let Some(seed) = opt.seed {
        options = options.seed(seed);
    }

    log::info!("Loading {:?}...", opt.volume);
    let volume = volume::load(&opt.volume)?;
    let (table, mip) = compute(&volume, &config, &options)?;

    fs::create_dir_all(&opt.output)
        .with_context(|| format!("failed to create {:?}", opt.output))?;
    table.to_csv(opt.output.join("psf.csv"))?;
    volume::save_mip(&mip, opt.output.join("mip.npy"))?;
    if opt.pickle {
        table.to_pickle(opt.output.join("psf.pkl"))?;
    }
    table.summary();

    Ok(())
}
