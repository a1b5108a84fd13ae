use crate::locks::EntityId;

use std::path::{Path, PathBuf};

use miniscript::bitcoin::Network;

/// The on-disk layout of the data directory: `<datadir>/<network>/{keys,wallets,psbts}/`, with one
/// `<name>.json` file per stored entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDirectory(PathBuf);

impl DataDirectory {
    pub fn new(p: PathBuf) -> Self {
        DataDirectory(p)
    }
}

impl DataDirectory {
    pub fn exists(&self) -> bool {
        self.0.as_path().exists()
    }
    pub fn init(&self) -> Result<(), std::io::Error> {
        create_private_dir(self.path())
    }
    pub fn path(&self) -> &Path {
        self.0.as_path()
    }
    pub fn network_directory(&self, network: Network) -> PathBuf {
        let mut dir = self.0.clone();
        dir.push(network.to_string());
        dir
    }
    /// The directory entities of this kind are stored in.
    pub fn entities_directory(&self, network: Network, kind: &str) -> PathBuf {
        let mut dir = self.network_directory(network);
        dir.push(format!("{}s", kind));
        dir
    }
    pub fn entity_file_path(&self, network: Network, id: &EntityId) -> PathBuf {
        let mut path = self.entities_directory(network, id.kind());
        path.push(format!("{}.json", id.name()));
        path
    }
    /// Create the directories for all kinds of entities on this network.
    pub fn init_network(&self, network: Network) -> Result<(), std::io::Error> {
        for kind in &["key", "wallet", "psbt"] {
            create_private_dir(&self.entities_directory(network, kind))?;
        }
        Ok(())
    }
}

// Private keys are stored in there.
fn create_private_dir(path: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    return {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700).recursive(true).create(path)
    };

    // TODO: permissions on Windows..
    #[cfg(not(unix))]
    return { std::fs::create_dir_all(path) };
}
