//! Bead volumes and their `.npy` persistence
//!
//! A [Volume] is a dense `(z, y, x)` array of intensities. Volumes are read
//! from NumPy `.npy` files in C order, whatever their numeric type.

use std::{
    fs::{self, File},
    io::{self, BufWriter},
    path::{Path, PathBuf},
};

use ndarray::{Array2, Array3};
use npyz::{NpyFile, Order, WriteOptions, WriterBuilder};

/// 3D intensity volume, axes `(z, y, x)`
pub type Volume = Array3<f64>;
/// Maximum intensity projection along the axial axis, axes `(y, x)`
pub type Mip = Array2<f64>;

#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("failed to read {1:?}")]
    Io(#[source] io::Error, PathBuf),
    #[error("failed to decode npy data in {1:?}")]
    Npy(#[source] io::Error, PathBuf),
    #[error("expected a 3D array, found shape {0:?}")]
    Shape(Vec<u64>),
    #[error("only C ordered arrays are supported")]
    Order,
    #[error("failed to write {1:?}")]
    Write(#[source] io::Error, PathBuf),
}
type Result<T> = std::result::Result<T, VolumeError>;

fn decode(bytes: &[u8]) -> io::Result<Vec<f64>> {
    macro_rules! try_as {
        ($($t:ty),*) => {
            $(
                if let Ok(data) = NpyFile::new(bytes)?.into_vec::<$t>() {
                    return Ok(data.into_iter().map(|x| x as f64).collect());
                }
            )*
        };
    }
    if let Ok(data) = NpyFile::new(bytes)?.into_vec::<f64>() {
        return Ok(data);
    }
    try_as!(f32, u16, u8, i16, i32, u32, i64, u64);
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "unsupported npy element type",
    ))
}

/// Loads a 3D volume from a `.npy` file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let path = path.as_ref();
    log::info!("Loading {:?}...", path);
    let bytes = fs::read(path).map_err(|e| VolumeError::Io(e, path.to_path_buf()))?;
    let npy = NpyFile::new(&bytes[..]).map_err(|e| VolumeError::Npy(e, path.to_path_buf()))?;
    let shape = npy.shape().to_vec();
    if npy.order() != Order::C {
        return Err(VolumeError::Order);
    }
    let dims = match shape.as_slice() {
        &[nz, ny, nx] => (nz as usize, ny as usize, nx as usize),
        _ => return Err(VolumeError::Shape(shape)),
    };
    let data = decode(&bytes).map_err(|e| VolumeError::Npy(e, path.to_path_buf()))?;
    Array3::from_shape_vec(dims, data).map_err(|_| VolumeError::Shape(shape))
}

/// Writes a 2D array to a `.npy` file
pub fn save_mip<P: AsRef<Path>>(mip: &Mip, path: P) -> Result<()> {
    let path = path.as_ref();
    let to_err = |e: io::Error| VolumeError::Write(e, path.to_path_buf());
    let file = File::create(path).map_err(to_err)?;
    let (ny, nx) = mip.dim();
    let mut writer = WriteOptions::new()
        .default_dtype()
        .shape(&[ny as u64, nx as u64])
        .writer(BufWriter::new(file))
        .begin_nd()
        .map_err(to_err)?;
    writer.extend(mip.iter().copied()).map_err(to_err)?;
    writer.finish().map_err(to_err)?;
    Ok(())
}
