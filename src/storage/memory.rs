//! In-memory object storage.
//!
//! Objects live in a sorted map in process memory, so listings come back
//! in S3's lexicographic order for free. Not persistent; serves small
//! deployments and every storage-facing test in the crate.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use tokio::sync::RwLock;

use crate::response::Response;
use crate::storage::{content_type_for, normalize_key, ListedObject, ObjectBackend, StorageError};

#[derive(Clone)]
struct StoredObject {
    content_type: String,
    bytes: Bytes,
    modified: DateTime<Utc>,
}

/// Objects in a shared in-process map.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
}

impl MemoryBackend {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing the HTTP surface. Test helper.
    pub async fn insert(&self, key: &str, content_type: &str, bytes: Bytes) {
        let rel = key.trim_start_matches('/').to_string();
        self.objects.write().await.insert(
            rel,
            StoredObject {
                content_type: content_type.to_string(),
                bytes,
                modified: Utc::now(),
            },
        );
    }

    /// Whether an object exists. Test helper.
    pub async fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .await
            .contains_key(key.trim_start_matches('/'))
    }

    /// Number of stored objects. Test helper.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether the store is empty. Test helper.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Response, StorageError> {
        let rel = normalize_key(key)?;
        match self.objects.read().await.get(rel) {
            Some(stored) => Ok(Response::buffer(
                StatusCode::OK,
                &stored.content_type,
                stored.bytes.clone(),
            )),
            None => Ok(not_found(key)),
        }
    }

    async fn head(&self, key: &str) -> Result<Response, StorageError> {
        let rel = normalize_key(key)?;
        match self.objects.read().await.get(rel) {
            Some(stored) => {
                let mut res = Response::empty(StatusCode::OK);
                res.set_header("Content-Type", &stored.content_type);
                res.set_content_length(stored.bytes.len() as u64);
                Ok(res)
            }
            None => Ok(not_found(key)),
        }
    }

    async fn put(
        &self,
        key: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, StorageError> {
        let rel = normalize_key(key)?.to_string();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_else(|| content_type_for(key))
            .to_string();
        self.objects.write().await.insert(
            rel,
            StoredObject {
                content_type,
                bytes: body,
                modified: Utc::now(),
            },
        );
        Ok(Response::empty(StatusCode::OK))
    }

    async fn delete(&self, key: &str) -> Result<Response, StorageError> {
        let rel = normalize_key(key)?;
        match self.objects.write().await.remove(rel) {
            Some(_) => Ok(Response::empty(StatusCode::OK)),
            None => Ok(not_found(key)),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<ListedObject>, StorageError> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| ListedObject {
                key: key.clone(),
                size: stored.bytes.len() as u64,
                last_modified: stored.modified,
            })
            .collect())
    }
}

fn not_found(key: &str) -> Response {
    Response::error(StatusCode::NOT_FOUND, format!("object '{key}' not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_preserves_content_type_header() {
        let backend = MemoryBackend::new();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "image/webp".parse().unwrap());
        backend
            .put("/img.bin", &headers, Bytes::from_static(b"webp"))
            .await
            .unwrap();

        let res = backend.get("/img.bin").await.unwrap();
        assert_eq!(res.content_type(), Some("image/webp"));
    }

    #[tokio::test]
    async fn get_falls_back_to_extension_content_type() {
        let backend = MemoryBackend::new();
        backend
            .put("/img.png", &HeaderMap::new(), Bytes::from_static(b"png"))
            .await
            .unwrap();
        let res = backend.get("/img.png").await.unwrap();
        assert_eq!(res.content_type(), Some("image/png"));
    }

    #[tokio::test]
    async fn concurrent_gets_see_independent_buffers() {
        let backend = MemoryBackend::new();
        backend.insert("/k.jpg", "image/jpeg", Bytes::from_static(b"abc")).await;
        let a = backend.get("/k.jpg").await.unwrap();
        let b = backend.get("/k.jpg").await.unwrap();
        assert_eq!(
            a.into_bytes().await.unwrap(),
            b.into_bytes().await.unwrap()
        );
    }

    #[tokio::test]
    async fn scan_honours_prefix_ranges() {
        let backend = MemoryBackend::new();
        for key in ["/a.jpg", "/photos/1.jpg", "/photos/2.jpg", "/z.jpg"] {
            backend.insert(key, "image/jpeg", Bytes::from_static(b"x")).await;
        }
        let all = backend.scan("").await.unwrap();
        assert_eq!(all.len(), 4);
        let photos = backend.scan("photos/").await.unwrap();
        let keys: Vec<&str> = photos.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["photos/1.jpg", "photos/2.jpg"]);
    }
}
