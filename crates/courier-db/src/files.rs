use anyhow::{Result, bail};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use crate::store::FileStore;

/// On-disk blob storage for shared files.
///
/// Each blob is stored as a single flat file at `{dir}/{locator}`, where the
/// locator is a freshly generated UUID.
pub struct DiskFileStore {
    dir: PathBuf,
}

impl DiskFileStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        info!("File storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// Path to the blob for a given locator. Rejects anything that isn't a UUID.
    fn file_path(&self, locator: &str) -> Result<PathBuf> {
        let Ok(id) = Uuid::parse_str(locator) else {
            bail!("Invalid file locator '{}'", locator);
        };
        Ok(self.dir.join(id.to_string()))
    }
}

impl FileStore for DiskFileStore {
    fn save(&self, bytes: &[u8]) -> Result<String> {
        let locator = Uuid::new_v4().to_string();
        let path = self.file_path(&locator)?;
        fs::write(&path, bytes)?;
        Ok(locator)
    }

    fn load(&self, locator: &str) -> Result<Option<Vec<u8>>> {
        let Ok(path) = self.file_path(locator) else {
            return Ok(None);
        };
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
