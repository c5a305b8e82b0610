use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, instrument, warn};

use crate::error::SyncError;
use crate::model::Key;

/// Exclusive handle over the managed zone file directory.
///
/// Only `claim` creates one and it cannot be cloned, so the session that
/// holds it is the single writer. Other processes writing into the same
/// directory are unsupported.
///
/// Layout:
/// ```text
/// {path}/
///   {key}        # zone file content, one file per key
/// ```
///
/// Writes overwrite in place; a crash mid-write may leave a truncated file
/// until the next bootstrap rewrites it.
#[derive(Debug)]
pub struct ZonefileDir {
    path: PathBuf,
}

impl ZonefileDir {
    /// Create the directory if needed and take ownership of it.
    #[instrument(skip_all, level = "debug", fields(path = %path.as_ref().display()))]
    pub async fn claim(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref().to_path_buf();
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(SyncError::local(
                    "creating directory for",
                    &path,
                    std::io::Error::new(ErrorKind::AlreadyExists, "path exists and is not a directory"),
                ))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&path)
                    .await
                    .map_err(|e| SyncError::local("creating directory for", &path, e))?;
                debug!("Created zonefiles directory {}", path.display());
            }
            Err(e) => return Err(SyncError::local("inspecting directory for", &path, e)),
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_path(&self, key: &str) -> Result<PathBuf, SyncError> {
        validate_key(key)?;
        Ok(self.path.join(key))
    }

    /// Names of the zone files currently present. Sub-directories are skipped.
    pub async fn list(&self) -> Result<BTreeSet<Key>, SyncError> {
        let mut entries = fs::read_dir(&self.path)
            .await
            .map_err(|e| SyncError::local("listing", &self.path, e))?;

        let mut names = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::local("listing", &self.path, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| SyncError::local("listing", entry.path(), e))?;
            if file_type.is_dir() {
                debug!("Ignoring sub-directory {}", entry.path().display());
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => {
                    names.insert(name);
                }
                Err(raw) => {
                    // No store key can name it, so it is never reconciled.
                    warn!("Ignoring non UTF-8 file name {:?}", raw);
                }
            }
        }
        Ok(names)
    }

    pub async fn read(&self, key: &str) -> Result<String, SyncError> {
        let path = self.file_path(key)?;
        fs::read_to_string(&path)
            .await
            .map_err(|e| SyncError::local("reading", path, e))
    }

    /// Create or overwrite the zone file for `key`.
    #[instrument(skip(self, content), level = "debug", fields(content_len = content.len()))]
    pub async fn write(&self, key: &str, content: &str) -> Result<(), SyncError> {
        let path = self.file_path(key)?;
        fs::write(&path, content)
            .await
            .map_err(|e| SyncError::local("upserting", &path, e))?;
        debug!("Upserted zonefile {}", path.display());
        Ok(())
    }

    /// Remove the zone file for `key`. Fails if it does not exist.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, key: &str) -> Result<(), SyncError> {
        let path = self.file_path(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| SyncError::local("deleting", &path, e))?;
        debug!("Deleted zonefile {}", path.display());
        Ok(())
    }

    /// Write every upsert, then remove every deletion.
    ///
    /// Stops at the first failure; changes already applied are kept.
    #[instrument(skip_all, level = "debug", fields(upserts = upserts.len(), deletions = deletions.len()))]
    pub async fn apply_batch(
        &self,
        upserts: &BTreeMap<Key, String>,
        deletions: &BTreeSet<Key>,
    ) -> Result<(), SyncError> {
        for (key, content) in upserts {
            self.write(key, content).await?;
        }
        for key in deletions {
            self.delete(key).await?;
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), SyncError> {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\', '\0']);
    if invalid {
        return Err(SyncError::InvalidKey(key.to_string()));
    }
    Ok(())
}
