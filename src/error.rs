use crate::{config::ConfigError, table::TableError, volume::VolumeError, window::WindowError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid imaging configuration")]
    Config(#[from] ConfigError),
    #[error("invalid bead window")]
    Window(#[from] WindowError),
    #[error("error in the `volume` module")]
    Volume(#[from] VolumeError),
    #[error("error in the `table` module")]
    Table(#[from] TableError),
}
