//! Filesystem-backed object storage.
//!
//! Objects are files under a configured root directory. GET responses
//! stream the open file; content types derive from the key's extension,
//! since a bare filesystem keeps no object metadata.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};
use tokio::fs;
use tracing::debug;

use crate::response::Response;
use crate::storage::{
    content_type_for, normalize_key, ListedObject, ObjectBackend, StorageError,
};

/// Objects as files under a root directory.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Backend rooted at `root`. The directory is created lazily on the
    /// first write.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(normalize_key(key)?))
    }
}

#[async_trait]
impl ObjectBackend for FilesystemBackend {
    async fn get(&self, key: &str) -> Result<Response, StorageError> {
        let path = self.path_for(key)?;
        match fs::File::open(&path).await {
            Ok(file) => {
                let meta = file
                    .metadata()
                    .await
                    .map_err(|source| StorageError::Io {
                        key: key.to_string(),
                        source,
                    })?;
                if meta.is_dir() {
                    return Ok(not_found(key));
                }
                Ok(Response::stream(
                    StatusCode::OK,
                    content_type_for(key),
                    Some(meta.len()),
                    Box::pin(file),
                ))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(not_found(key)),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn head(&self, key: &str) -> Result<Response, StorageError> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                let mut res = Response::empty(StatusCode::OK);
                res.set_header("Content-Type", content_type_for(key));
                res.set_content_length(meta.len());
                Ok(res)
            }
            Ok(_) => Ok(not_found(key)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(not_found(key)),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn put(
        &self,
        key: &str,
        _headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    key: key.to_string(),
                    source,
                })?;
        }
        fs::write(&path, &body)
            .await
            .map_err(|source| StorageError::Io {
                key: key.to_string(),
                source,
            })?;
        debug!(key, bytes = body.len(), "stored object");
        Ok(Response::empty(StatusCode::OK))
    }

    async fn delete(&self, key: &str) -> Result<Response, StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(Response::empty(StatusCode::OK)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(not_found(key)),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<ListedObject>, StorageError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let walk_prefix = prefix.clone();
        // Directory walks are blocking work.
        let entries = tokio::task::spawn_blocking(move || walk(&root, &walk_prefix))
            .await
            .map_err(|e| StorageError::Io {
                key: prefix.clone(),
                source: std::io::Error::other(e),
            })?
            .map_err(|source| StorageError::Io {
                key: prefix,
                source,
            })?;
        Ok(entries)
    }
}

fn not_found(key: &str) -> Response {
    Response::error(StatusCode::NOT_FOUND, format!("object '{key}' not found"))
}

fn walk(root: &Path, prefix: &str) -> std::io::Result<Vec<ListedObject>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let key = rel.to_string_lossy().replace('\\', "/");
            if !key.starts_with(prefix) {
                continue;
            }
            let meta = entry.metadata()?;
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            out.push(ListedObject {
                key,
                size: meta.len(),
                last_modified: modified,
            });
        }
    }
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}
