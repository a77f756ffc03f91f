use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use bead_psf::{compute, volume, ImagingConfig, PipelineOptions};
use glob::glob;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "psf-batch", about = "Bead PSF measurements over a set of volumes")]
struct Opt {
    /// Volumes glob pattern, e.g. 'data/*.npy'
    #[structopt(short, long)]
    pattern: String,
    /// Pickled imaging configuration shared by all the volumes
    #[structopt(short, long, parse(from_os_str))]
    config: PathBuf,
    /// Bead subsampling seed
    #[structopt(long)]
    seed: Option<u64>,
    /// Also pickle the full tables
    #[structopt(long)]
    pickle: bool,
}

/// `<stem>_psf` folder next to the volume
fn output_dir(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}_psf", stem))
}

fn process(
    path: &Path,
    config: &ImagingConfig,
    options: &PipelineOptions,
    pickle: bool,
) -> anyhow::Result<(usize, usize)> {
    let volume = volume::load(path)?;
    let (table, mip) = compute(&volume, config, options)?;
    let output = output_dir(path);
    fs::create_dir_all(&output).with_context(|| format!("failed to create {:?}", output))?;
    table.to_csv(output.join("psf.csv"))?;
    volume::save_mip(&mip, output.join("mip.npy"))?;
    if pickle {
        table.to_pickle(output.join("psf.pkl"))?;
    }
    Ok((table.len(), table.failed().count()))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let config = ImagingConfig::from_pickle(&opt.config)
        .with_context(|| format!("failed to load config from {:?}", opt.config))?;
    let mut options = PipelineOptions::default().progress(false);
    if let Some(seed) = opt.seed {
        options = options.seed(seed);
    }

    let data_paths: Vec<PathBuf> = glob(&opt.pattern)?.collect::<Result<_, _>>()?;
    log::info!("{} volumes matching {}", data_paths.len(), opt.pattern);

    let pb = ProgressBar::new(data_paths.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    let reports: Vec<_> = data_paths
        .par_iter()
        .progress_with(pb.clone())
        .map(|path| {
            let report = process(path, &config, &options, opt.pickle);
            if let Err(e) = &report {
                log::error!("{:?}: {:#}", path, e);
            }
            (path, report)
        })
        .collect();
    pb.finish();

    println!("SUMMARY:");
    for (path, report) in &reports {
        match report {
            Ok((n, n_failed)) => println!(
                " - {:?}: {} beads ({} failed fits) -> {:?}",
                path,
                n,
                n_failed,
                output_dir(path)
            ),
            Err(e) => println!(" - {:?}: FAILED ({:#})", path, e),
        }
    }
    let n_failed = reports.iter().filter(|(_, r)| r.is_err()).count();
    if n_failed > 0 {
        log::warn!("{}/{} volumes failed", n_failed, reports.len());
    }

    Ok(())
}
