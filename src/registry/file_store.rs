use std::path::{Path, PathBuf};
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::store::{RegistrySnapshot, SiteStore, StoreError, StoreResult, SNAPSHOT_VERSION};

/// JSON document store.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash leaves either the old or the new document, never a torn one.
pub struct JsonFileStore {
    path: PathBuf,
    // serializes read-compare-write within this process
    io_lock: Mutex<()>,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        Ok(Self {
            path,
            io_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_snapshot(&self) -> StoreResult<RegistrySnapshot> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RegistrySnapshot::default()),
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(RegistrySnapshot::default());
        }

        let snapshot: RegistrySnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "{} has layout version {}, newest supported is {}",
                self.path.display(),
                snapshot.version,
                SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }

    async fn write_snapshot(&self, snapshot: &RegistrySnapshot) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        debug!("Wrote registry revision {} to {}", snapshot.revision, self.path.display());
        Ok(())
    }
}

#[async_trait]
impl SiteStore for JsonFileStore {
    async fn load(&self) -> StoreResult<RegistrySnapshot> {
        let _guard = self.io_lock.lock().await;
        self.read_snapshot().await
    }

    async fn compare_and_swap(&self, expected_revision: u64, snapshot: &RegistrySnapshot) -> StoreResult<bool> {
        let _guard = self.io_lock.lock().await;
        let current = self.read_snapshot().await?;
        if current.revision != expected_revision {
            return Ok(false);
        }
        self.write_snapshot(snapshot).await?;
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
