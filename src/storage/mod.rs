//! Object storage backends and the per-bucket dispatcher.
//!
//! Backends implement [`ObjectBackend`]; real failures propagate as
//! [`StorageError`] inside the backend layer, but the dispatcher that the
//! coordinator talks to translates everything into [`Response`] values:
//! 404 is a value, 5xx carries the error. Each bucket owns two targets,
//! `basic` for uploaded originals and `transform` for derived artifacts.

pub mod filesystem;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use http::{HeaderMap, StatusCode};
use snafu::Snafu;
use tracing::warn;

use crate::config::{AppConfig, BackendConfig};
use crate::object::{DerivedObject, StorageTarget};
use crate::response::Response;

pub use filesystem::FilesystemBackend;
pub use memory::MemoryBackend;

/// Errors from backend operations. The dispatcher converts these into
/// 5xx responses; they never cross the coordinator boundary as errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// An underlying I/O operation failed.
    #[snafu(display("i/o failure for key '{key}': {source}"))]
    Io { key: String, source: std::io::Error },

    /// The key cannot be mapped onto the backend (traversal, empty).
    #[snafu(display("'{key}' is not a valid storage key"))]
    InvalidKey { key: String },
}

/// S3-style listing parameters.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct ListOptions {
    pub max_keys: usize,
    pub delimiter: String,
    pub prefix: String,
    pub marker: String,
}

/// One stored object surfaced by a listing scan.
#[derive(Debug, Clone)]
pub struct ListedObject {
    /// Key without the leading slash, S3 style.
    pub key: String,
    /// Payload size in bytes.
    pub size: u64,
    /// Last modification time.
    pub last_modified: DateTime<Utc>,
}

/// One storage backend holding a bucket target's objects.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Fetch an object. Missing objects are 404 responses, not errors.
    async fn get(&self, key: &str) -> Result<Response, StorageError>;

    /// Fetch object metadata without the body.
    async fn head(&self, key: &str) -> Result<Response, StorageError>;

    /// Store an object.
    async fn put(
        &self,
        key: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, StorageError>;

    /// Remove an object.
    async fn delete(&self, key: &str) -> Result<Response, StorageError>;

    /// All objects under `prefix`, sorted by key.
    async fn scan(&self, prefix: &str) -> Result<Vec<ListedObject>, StorageError>;
}

struct BucketBackends {
    basic: Arc<dyn ObjectBackend>,
    transform: Arc<dyn ObjectBackend>,
}

/// Routes object operations to the right bucket target and translates
/// backend failures into response values.
pub struct StorageDispatcher {
    buckets: HashMap<String, BucketBackends>,
}

impl StorageDispatcher {
    /// Build all backends named in the configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut buckets = HashMap::new();
        for (name, bucket) in &config.buckets {
            let basic = build_backend(&bucket.storage.basic);
            let transform = match &bucket.storage.transform {
                Some(cfg) => build_backend(cfg),
                None => basic.clone(),
            };
            buckets.insert(name.clone(), BucketBackends { basic, transform });
        }
        Self { buckets }
    }

    /// Empty dispatcher for programmatic assembly.
    pub fn empty() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }

    /// Register a bucket's backends explicitly. Used by tests and
    /// embedders that construct backends themselves.
    pub fn insert_bucket(
        &mut self,
        name: impl Into<String>,
        basic: Arc<dyn ObjectBackend>,
        transform: Arc<dyn ObjectBackend>,
    ) {
        self.buckets
            .insert(name.into(), BucketBackends { basic, transform });
    }

    fn backend_for(&self, obj: &DerivedObject) -> Result<&Arc<dyn ObjectBackend>, Response> {
        let Some(bucket) = self.buckets.get(&obj.bucket) else {
            return Err(Response::error(
                StatusCode::NOT_FOUND,
                format!("bucket '{}' not found", obj.bucket),
            ));
        };
        Ok(match obj.storage_target {
            StorageTarget::Basic => &bucket.basic,
            StorageTarget::Transform => &bucket.transform,
        })
    }

    pub async fn get(&self, obj: &DerivedObject) -> Response {
        match self.backend_for(obj) {
            Ok(backend) => to_response(backend.get(&obj.key).await, obj),
            Err(res) => res,
        }
    }

    pub async fn head(&self, obj: &DerivedObject) -> Response {
        match self.backend_for(obj) {
            Ok(backend) => to_response(backend.head(&obj.key).await, obj),
            Err(res) => res,
        }
    }

    pub async fn set(&self, obj: &DerivedObject, headers: &HeaderMap, body: Bytes) -> Response {
        match self.backend_for(obj) {
            Ok(backend) => to_response(backend.put(&obj.key, headers, body).await, obj),
            Err(res) => res,
        }
    }

    pub async fn delete(&self, obj: &DerivedObject) -> Response {
        match self.backend_for(obj) {
            Ok(backend) => to_response(backend.delete(&obj.key).await, obj),
            Err(res) => res,
        }
    }

    /// S3-style bucket listing rendered as XML.
    pub async fn list(&self, obj: &DerivedObject, opts: &ListOptions) -> Response {
        let Some(bucket) = self.buckets.get(&obj.bucket) else {
            return Response::error(
                StatusCode::NOT_FOUND,
                format!("bucket '{}' not found", obj.bucket),
            );
        };
        match bucket.basic.scan(&opts.prefix).await {
            Ok(objects) => render_listing(&obj.bucket, opts, objects),
            Err(e) => {
                warn!(bucket = %obj.bucket, error = %e, "bucket scan failed");
                Response::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

fn build_backend(config: &BackendConfig) -> Arc<dyn ObjectBackend> {
    match config {
        BackendConfig::Filesystem { root_path } => {
            Arc::new(FilesystemBackend::new(root_path.clone()))
        }
        BackendConfig::Memory => Arc::new(MemoryBackend::new()),
    }
}

fn to_response(result: Result<Response, StorageError>, obj: &DerivedObject) -> Response {
    match result {
        Ok(res) => res,
        Err(StorageError::InvalidKey { key }) => {
            Response::error(StatusCode::BAD_REQUEST, format!("invalid key '{key}'"))
        }
        Err(e) => {
            warn!(bucket = %obj.bucket, key = %obj.key, error = %e, "storage operation failed");
            Response::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Apply marker/delimiter/max-keys to a sorted scan and render the
/// S3 `ListBucketResult` document.
fn render_listing(bucket: &str, opts: &ListOptions, objects: Vec<ListedObject>) -> Response {
    let mut contents: Vec<&ListedObject> = Vec::new();
    let mut common_prefixes: Vec<String> = Vec::new();
    let mut truncated = false;

    for object in &objects {
        if !opts.marker.is_empty() && object.key.as_str() <= opts.marker.as_str() {
            continue;
        }
        if contents.len() + common_prefixes.len() >= opts.max_keys {
            truncated = true;
            break;
        }
        if !opts.delimiter.is_empty() {
            let remainder = object.key.strip_prefix(&opts.prefix).unwrap_or(&object.key);
            if let Some(idx) = remainder.find(&opts.delimiter) {
                let prefix =
                    format!("{}{}", opts.prefix, &remainder[..idx + opts.delimiter.len()]);
                if common_prefixes.last() != Some(&prefix) {
                    common_prefixes.push(prefix);
                }
                continue;
            }
        }
        contents.push(object);
    }

    let mut xml = String::with_capacity(512);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    xml.push_str("<ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">");
    xml.push_str(&format!("<Name>{}</Name>", xml_escape(bucket)));
    xml.push_str(&format!("<Prefix>{}</Prefix>", xml_escape(&opts.prefix)));
    xml.push_str(&format!("<Marker>{}</Marker>", xml_escape(&opts.marker)));
    xml.push_str(&format!("<MaxKeys>{}</MaxKeys>", opts.max_keys));
    xml.push_str(&format!("<IsTruncated>{truncated}</IsTruncated>"));
    for object in contents {
        xml.push_str("<Contents>");
        xml.push_str(&format!("<Key>{}</Key>", xml_escape(&object.key)));
        xml.push_str(&format!(
            "<LastModified>{}</LastModified>",
            object
                .last_modified
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
        xml.push_str(&format!("<Size>{}</Size>", object.size));
        xml.push_str("</Contents>");
    }
    for prefix in &common_prefixes {
        xml.push_str(&format!(
            "<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>",
            xml_escape(prefix)
        ));
    }
    xml.push_str("</ListBucketResult>");

    Response::text(StatusCode::OK, "application/xml", xml)
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Content type derived from a key's file extension.
pub(crate) fn content_type_for(key: &str) -> &'static str {
    let ext = key.rsplit('.').next().unwrap_or_default();
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "xml" => "application/xml",
        "json" => "application/json",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Validate and normalise a storage key into a relative path.
pub(crate) fn normalize_key(key: &str) -> Result<&str, StorageError> {
    let rel = key.trim_start_matches('/');
    if rel.is_empty()
        || rel
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return InvalidKeySnafu { key }.fail();
    }
    Ok(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listed(key: &str) -> ListedObject {
        ListedObject {
            key: key.to_string(),
            size: 1,
            last_modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn listing_groups_by_delimiter() {
        let opts = ListOptions {
            max_keys: 1000,
            delimiter: "/".to_string(),
            prefix: String::new(),
            marker: String::new(),
        };
        let objects = vec![
            listed("a.jpg"),
            listed("photos/1.jpg"),
            listed("photos/2.jpg"),
            listed("z.jpg"),
        ];
        let res = render_listing("demo", &opts, objects);
        let xml = String::from_utf8(res.into_bytes().await.unwrap().to_vec()).unwrap();
        assert!(xml.contains("<Key>a.jpg</Key>"));
        assert!(xml.contains("<CommonPrefixes><Prefix>photos/</Prefix></CommonPrefixes>"));
        // Grouped keys do not appear as Contents.
        assert!(!xml.contains("<Key>photos/1.jpg</Key>"));
    }

    #[tokio::test]
    async fn listing_respects_marker_and_max_keys() {
        let opts = ListOptions {
            max_keys: 1,
            delimiter: String::new(),
            prefix: String::new(),
            marker: "a.jpg".to_string(),
        };
        let objects = vec![listed("a.jpg"), listed("b.jpg"), listed("c.jpg")];
        let res = render_listing("demo", &opts, objects);
        let xml = String::from_utf8(res.into_bytes().await.unwrap().to_vec()).unwrap();
        assert!(!xml.contains("<Key>a.jpg</Key>"));
        assert!(xml.contains("<Key>b.jpg</Key>"));
        assert!(!xml.contains("<Key>c.jpg</Key>"));
        assert!(xml.contains("<IsTruncated>true</IsTruncated>"));
    }

    #[test]
    fn keys_are_normalised_and_validated() {
        assert_eq!(normalize_key("/img.jpg").unwrap(), "img.jpg");
        assert_eq!(normalize_key("/a/b/c.png").unwrap(), "a/b/c.png");
        assert!(normalize_key("/").is_err());
        assert!(normalize_key("/../secret").is_err());
        assert!(normalize_key("/a//b").is_err());
    }

    #[test]
    fn content_types_follow_extensions() {
        assert_eq!(content_type_for("/img.JPG"), "image/jpeg");
        assert_eq!(content_type_for("/img.webp"), "image/webp");
        assert_eq!(content_type_for("/data.bin"), "application/octet-stream");
    }
}
