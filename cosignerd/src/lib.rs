pub mod commands;
pub mod config;
pub mod database;
pub mod datadir;
pub mod locks;

pub use cosigner;
pub use miniscript;

use crate::{
    commands::CosignerControl,
    config::Config,
    database::{jsonfile::JsonFileDatabase, DatabaseError},
    datadir::DataDirectory,
};

use std::{error, fmt, io, panic, path, sync};

pub fn setup_panic_hook() {
    panic::set_hook(Box::new(move |panic_info| {
        let file = panic_info
            .location()
            .map(|l| l.file())
            .unwrap_or_else(|| "'unknown'");
        let line = panic_info
            .location()
            .map(|l| l.line().to_string())
            .unwrap_or_else(|| "'unknown'".to_string());

        let bt = backtrace::Backtrace::new();
        let info = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned());
        log::error!(
            "panic occurred at line {} of file {}: {:?}\n{:?}",
            line,
            file,
            info,
            bt
        );
    }));
}

#[derive(Debug, Clone)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}-dev", self.major, self.minor)
    }
}

pub const VERSION: Version = Version { major: 0, minor: 1 };

#[derive(Debug)]
pub enum StartupError {
    DefaultDataDirNotFound,
    DatadirCreation(path::PathBuf, io::Error),
    Database(DatabaseError),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::DefaultDataDirNotFound => write!(
                f,
                "No data directory was specified and a default path could not be determined for this platform."
            ),
            Self::DatadirCreation(dir_path, e) => write!(
                f,
                "Could not create data directory at '{}': '{}'", dir_path.display(), e
            ),
            Self::Database(e) => write!(f, "Error initializing database: '{}'.", e),
        }
    }
}

impl error::Error for StartupError {}

impl From<DatabaseError> for StartupError {
    fn from(e: DatabaseError) -> Self {
        Self::Database(e)
    }
}

impl CosignerControl {
    /// Set up the data directory and open the stored entities for the configured network.
    pub fn from_config(config: &Config) -> Result<CosignerControl, StartupError> {
        let data_dir = DataDirectory::new(
            config
                .data_dir()
                .ok_or(StartupError::DefaultDataDirNotFound)?,
        );
        if !data_dir.exists() {
            log::info!(
                "Creating data directory at '{}'.",
                data_dir.path().display()
            );
            data_dir
                .init()
                .map_err(|e| StartupError::DatadirCreation(data_dir.path().to_path_buf(), e))?;
        }

        let db = JsonFileDatabase::new(data_dir, config.network)?;
        log::debug!("Operating on network '{}'.", config.network);
        Ok(CosignerControl::new(config.network, sync::Arc::new(db)))
    }
}
