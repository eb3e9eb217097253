//! Centralized application configuration
//!
//! Loads the gateway configuration from a TOML file named on the command
//! line: the server block (timeouts, queue and cache bounds, placeholder),
//! header override rules keyed by status code, and per-bucket transform
//! strategies with their storage backends.

pub mod error;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

use crate::object::Transform;

pub use error::ConfigError;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Header overrides applied to responses by status code.
    #[serde(default)]
    pub headers: Vec<HeaderRule>,
    /// Buckets served by this gateway, keyed by name.
    #[serde(default)]
    pub buckets: HashMap<String, BucketConfig>,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::InvalidValue {
                key: "config_file".to_string(),
                value: path.as_ref().display().to_string(),
                reason: format!("Failed to read file: {}", e),
            })?;

        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::InvalidValue {
                key: "config_file".to_string(),
                value: path.as_ref().display().to_string(),
                reason: format!("Failed to parse TOML: {}", e),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.request_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                key: "server.request_timeout".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.server.cache_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "server.cache_size".to_string(),
                value: "0".to_string(),
                reason: "must hold at least one entry".to_string(),
            });
        }
        if self.server.throttle_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "server.throttle_limit".to_string(),
                value: "0".to_string(),
                reason: "must allow at least one engine pass".to_string(),
            });
        }
        for (name, bucket) in &self.buckets {
            if let Some(tc) = &bucket.transform {
                if matches!(tc.kind, TransformKind::Preset | TransformKind::PresetsQuery)
                    && tc.presets.is_empty()
                {
                    return Err(ConfigError::MissingRequired {
                        key: format!("buckets.{name}.transform.presets"),
                        hint: "preset strategies need at least one named preset".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Read the configured placeholder image, if any.
    ///
    /// The bytes are loaded once at startup; the configured path doubles
    /// as the placeholder cache-key prefix.
    pub fn load_placeholder(&self) -> Result<Option<PlaceholderSource>, ConfigError> {
        let Some(path) = &self.server.placeholder else {
            return Ok(None);
        };
        let bytes = std::fs::read(path).map_err(|e| ConfigError::InvalidValue {
            key: "server.placeholder".to_string(),
            value: path.display().to_string(),
            reason: format!("Failed to read placeholder image: {}", e),
        })?;
        let content_type = image::guess_format(&bytes)
            .map(|f| f.to_mime_type())
            .unwrap_or("application/octet-stream");
        Ok(Some(PlaceholderSource {
            source: path.display().to_string(),
            content_type: content_type.to_string(),
            bytes: Bytes::from(bytes),
        }))
    }
}

/// Server block: network binding and the coordination bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener on.
    pub listen: String,
    /// Whole-request processing timeout in seconds.
    pub request_timeout: u64,
    /// Length of the bounded dispatch queue.
    pub queue_len: usize,
    /// Maximum entries in the in-process response cache.
    pub cache_size: usize,
    /// Maximum concurrent engine passes.
    pub throttle_limit: usize,
    /// Path to the placeholder image rendered on errors.
    pub placeholder: Option<PathBuf>,
    /// Suppress placeholders and surface raw errors.
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            request_timeout: 70,
            queue_len: 10,
            cache_size: 50,
            throttle_limit: 8,
            placeholder: None,
            debug: false,
        }
    }
}

impl ServerConfig {
    /// Whole-request deadline.
    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// How long a collapsed waiter follows the owner before computing on
    /// its own: one second less than the request timeout, floored at one
    /// second.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.saturating_sub(1).max(1))
    }
}

/// Placeholder image loaded at startup.
#[derive(Debug, Clone)]
pub struct PlaceholderSource {
    /// Configured path, used as the placeholder cache-key prefix.
    pub source: String,
    /// MIME type sniffed from the bytes.
    pub content_type: String,
    /// The raw image bytes.
    pub bytes: Bytes,
}

/// Header values forced onto responses with matching status codes.
#[derive(Debug, Clone, Deserialize)]
#[allow(missing_docs)]
pub struct HeaderRule {
    pub status_codes: Vec<u16>,
    pub values: HashMap<String, String>,
}

/// Per-bucket configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    /// Transform strategy; buckets without one serve objects verbatim.
    #[serde(default)]
    pub transform: Option<TransformConfig>,
    /// Storage targets for the bucket.
    pub storage: StorageConfig,
}

/// How URLs map onto transform chains for a bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformConfig {
    /// URL parsing strategy for the bucket.
    pub kind: TransformKind,
    /// Verify the parent exists before serving a cached child.
    #[serde(default)]
    pub check_parent: bool,
    /// Named transform chains addressed by path segment.
    #[serde(default)]
    pub presets: HashMap<String, PresetConfig>,
}

/// URL parsing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TransformKind {
    /// Named presets addressed by path segment.
    #[serde(rename = "preset")]
    Preset,
    /// Transform parameters in the query string.
    #[serde(rename = "query")]
    Query,
    /// Try preset first; fall back to query when the path names no preset.
    #[serde(rename = "presets-query")]
    PresetsQuery,
}

/// A named, server-side-defined transform chain.
#[derive(Debug, Clone, Deserialize)]
pub struct PresetConfig {
    /// Operations applied in order.
    pub operations: Vec<Transform>,
}

/// The two storage targets of a bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend holding uploaded originals.
    pub basic: BackendConfig,
    /// Backend holding derived artifacts; defaults to `basic` when absent.
    #[serde(default)]
    pub transform: Option<BackendConfig>,
}

impl StorageConfig {
    /// In-memory storage for both targets. Used by tests and examples.
    pub fn memory() -> Self {
        Self {
            basic: BackendConfig::Memory,
            transform: Some(BackendConfig::Memory),
        }
    }
}

/// One storage backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Objects are files under a root directory.
    Filesystem { root_path: PathBuf },
    /// Objects live in process memory. Not persistent.
    Memory,
}
