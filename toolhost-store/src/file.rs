//! File-backed store persisting a single JSON object.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{KeyValueStore, StoreError, StoreResult};

/// Durable [`KeyValueStore`] writing the whole document on every mutation.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// target, so a crash never leaves a half-written document behind.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<Map<String, Value>>,
}

impl FileStore {
    /// Opens (or creates) a store at the provided path.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors and returns [`StoreError::Corrupt`] when the file
    /// exists but does not hold a JSON object.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let state = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Map::new(),
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes)? {
                Value::Object(map) => map,
                _ => {
                    return Err(StoreError::Corrupt {
                        path: path.display().to_string(),
                        reason: "top-level value is not an object".into(),
                    });
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(err.into()),
        };

        debug!(path = %path.display(), keys = state.len(), "opened file store");

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Returns the underlying path of the store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, state: &Map<String, Value>) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.state.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        let mut guard = self.state.lock().await;
        guard.insert(key.to_owned(), value);
        self.flush(&guard).await
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let mut guard = self.state.lock().await;
        if guard.remove(key).is_some() {
            self.flush(&guard).await?;
        }
        Ok(())
    }
}
