use std::{fs::File, io, ops::Deref, path::Path};

use serde::Serialize;

use crate::{
    fit::{FitResult, NonConvergence, PsfFit},
    peaks::Candidate,
    window::{Bead, Window},
};

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("failed to write CSV table")]
    Csv(#[from] csv::Error),
    #[error("failed to pickle table")]
    Pickle(#[from] serde_pickle::Error),
    #[error("failed to create {1:?}")]
    Io(#[source] io::Error, std::path::PathBuf),
}
type Result<T> = std::result::Result<T, TableError>;

/// One bead of the result table
#[derive(Debug, Clone)]
pub struct BeadRecord {
    pub fit: FitResult,
    /// raw intensity at the bead center
    pub max: f64,
    /// bead center `[z, y, x]` [voxel]
    pub center: Candidate,
    pub bead: Window,
}
impl BeadRecord {
    pub fn fwhm(&self) -> Option<[f64; 3]> {
        self.fit.as_ref().ok().map(|fit| fit.fwhm)
    }
    pub fn rotation(&self) -> Option<[f64; 3]> {
        self.fit.as_ref().ok().map(|fit| fit.rotation)
    }
}

/// Flat table row, failed fits leave the fit columns empty
#[derive(Debug, Serialize)]
struct Row {
    #[serde(rename = "FWHM_x")]
    fwhm_x: Option<f64>,
    #[serde(rename = "FWHM_y")]
    fwhm_y: Option<f64>,
    #[serde(rename = "FWHM_z")]
    fwhm_z: Option<f64>,
    rotx: Option<f64>,
    roty: Option<f64>,
    rotz: Option<f64>,
    #[serde(rename = "Max")]
    max: f64,
    x_center: usize,
    y_center: usize,
    z_center: usize,
}
impl From<&BeadRecord> for Row {
    fn from(record: &BeadRecord) -> Self {
        let [fwhm_x, fwhm_y, fwhm_z] = record.fwhm().map_or([None; 3], |v| v.map(Some));
        let [rotx, roty, rotz] = record.rotation().map_or([None; 3], |v| v.map(Some));
        let [z_center, y_center, x_center] = record.center;
        Self {
            fwhm_x,
            fwhm_y,
            fwhm_z,
            rotx,
            roty,
            rotz,
            max: record.max,
            x_center,
            y_center,
            z_center,
        }
    }
}

/// Pickled row, with the bead window and the failure reason
#[derive(Debug, Serialize)]
struct PickleRow {
    #[serde(flatten)]
    row: Row,
    error: Option<String>,
    bead_shape: [usize; 3],
    bead: Vec<f64>,
}

/// PSF measurements, one row per bead in bead order
#[derive(Debug, Default, Clone)]
pub struct ResultTable(Vec<BeadRecord>);
impl Deref for ResultTable {
    type Target = Vec<BeadRecord>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl ResultTable {
    /// Pairs beads with their fits, both in bead order
    pub fn new(beads: Vec<Bead>, fits: Vec<FitResult>) -> Self {
        debug_assert_eq!(beads.len(), fits.len());
        Self(
            beads
                .into_iter()
                .zip(fits)
                .map(|(bead, fit)| BeadRecord {
                    fit,
                    max: bead.max,
                    center: bead.center,
                    bead: bead.window,
                })
                .collect(),
        )
    }
    /// Converged fits
    pub fn converged(&self) -> impl Iterator<Item = &PsfFit> {
        self.iter().filter_map(|record| record.fit.as_ref().ok())
    }
    /// Failed fits with their bead center
    pub fn failed(&self) -> impl Iterator<Item = (&Candidate, &NonConvergence)> {
        self.iter()
            .filter_map(|record| record.fit.as_ref().err().map(|e| (&record.center, e)))
    }
    /// FWHM mean and standard deviation [micron] over the converged fits, `[x, y, z]`
    pub fn fwhm_stats(&self) -> Option<[(f64, f64); 3]> {
        let fwhms: Vec<_> = self.converged().map(|fit| fit.fwhm).collect();
        if fwhms.is_empty() {
            return None;
        }
        let n = fwhms.len() as f64;
        Some([0, 1, 2].map(|i| {
            let mean = fwhms.iter().map(|f| f[i]).sum::<f64>() / n;
            let std = (fwhms.iter().map(|f| (f[i] - mean).powi(2)).sum::<f64>() / n).sqrt();
            (mean, std)
        }))
    }
    pub fn summary(&self) {
        println!("SUMMARY:");
        println!(" - # of beads: {}", self.len());
        println!(" - # of failed fits: {}", self.failed().count());
        if let Some(stats) = self.fwhm_stats() {
            println!(" - FWHM [micron]:");
            println!("    {:^4}: ({:^12}, {:^12})", "AXIS", "MEAN", "STD");
            for (axis, (mean, std)) in ["x", "y", "z"].iter().zip(stats) {
                println!("  - {:4}: ({:>12.4}, {:>12.4})", axis, mean, std);
            }
        }
    }
    /// Writes the table to a CSV file, without the bead windows
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        for record in self.iter() {
            wtr.serialize(Row::from(record))?;
        }
        wtr.flush()
            .map_err(|e| TableError::Csv(csv::Error::from(e)))?;
        Ok(())
    }
    /// Pickles the table including the bead windows
    pub fn to_pickle<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file =
            File::create(&path).map_err(|e| TableError::Io(e, path.as_ref().to_path_buf()))?;
        let rows: Vec<_> = self
            .iter()
            .map(|record| PickleRow {
                row: Row::from(record),
                error: record.fit.as_ref().err().map(|e| e.to_string()),
                bead_shape: record.bead.dims(),
                bead: record.bead.data.iter().copied().collect(),
            })
            .collect();
        serde_pickle::to_writer(&mut file, &rows, Default::default())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GaussianParams;
    use ndarray::Array3;

    fn table() -> ResultTable {
        let window = Window {
            data: Array3::zeros((2, 2, 2)),
            baseline: 0f64,
        };
        let beads = vec![
            Bead {
                center: [3, 4, 5],
                max: 100f64,
                window: window.clone(),
            },
            Bead {
                center: [6, 7, 8],
                max: 50f64,
                window,
            },
        ];
        let fit = PsfFit {
            fwhm: [0.3, 0.5, 1.2],
            rotation: [0.01, 0.02, 0.03],
            params: GaussianParams::from_slice(&[0f64; 11]),
            iterations: 12,
            covariance: None,
        };
        ResultTable::new(beads, vec![Ok(fit), Err(NonConvergence::MaxIterations(200))])
    }

    #[test]
    fn rows_follow_bead_order() {
        let table = table();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].center, [3, 4, 5]);
        assert_eq!(table[1].fwhm(), None);
        assert_eq!(table.failed().count(), 1);
        let stats = table.fwhm_stats().unwrap();
        assert_eq!(stats[2], (1.2, 0.));
    }

    #[test]
    fn csv_leaves_failed_fits_empty() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let path = std::env::temp_dir().join("bead_psf_table.csv");
        table().to_csv(&path)?;
        let contents = std::fs::read_to_string(&path)?;
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(
            lines[0],
            "FWHM_x,FWHM_y,FWHM_z,rotx,roty,rotz,Max,x_center,y_center,z_center"
        );
        assert_eq!(lines[1], "0.3,0.5,1.2,0.01,0.02,0.03,100.0,5,4,3");
        assert_eq!(lines[2], ",,,,,,50.0,8,7,6");
        Ok(())
    }

    #[test]
    fn pickle() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let path = std::env::temp_dir().join("bead_psf_table.pkl");
        table().to_pickle(&path)?;
        assert!(std::fs::metadata(&path)?.len() > 0);
        Ok(())
    }
}
