use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("Stored content not found: {0}")]
    NotFound(String),

    #[error("Invalid content key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A blob fetched from the content store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredContent {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub name: String,
}

/// Read access to uploaded binary sources.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<StoredContent, ContentError>;
}

/// Content store backed by a directory; keys are relative paths under the root.
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, ContentError> {
        let invalid = |reason: &str| ContentError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        if key.trim().is_empty() {
            return Err(invalid("empty key"));
        }
        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => return Err(invalid("parent directory reference")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("absolute path"))
                }
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn fetch(&self, key: &str) -> Result<StoredContent, ContentError> {
        let path = self.resolve(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContentError::NotFound(key.to_string()))
            }
            Err(e) => return Err(ContentError::Io { path, source: e }),
        };
        let mime = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.to_string());
        Ok(StoredContent { bytes, mime, name })
    }
}
