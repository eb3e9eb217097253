//! URL-to-object parsing.
//!
//! Maps a request path and query string onto a [`DerivedObject`] and its
//! parent chain. Buckets select one of three strategies: `preset` (a named
//! transform chain addressed by path segment), `query` (transform
//! parameters in the query string), or `presets-query`, which tries the
//! preset form first and falls back to query parsing when the path names
//! no preset.

use std::collections::HashMap;

use snafu::Snafu;

use crate::config::{AppConfig, TransformConfig, TransformKind};
use crate::object::transform::{Gravity, OutputFormat, Transform, TransformChain};
use crate::object::{DerivedObject, StorageTarget};

/// Errors surfaced while mapping a URL onto an object.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(missing_docs)]
pub enum ParseError {
    #[snafu(display("bucket '{bucket}' is not configured"))]
    UnknownBucket { bucket: String },

    #[snafu(display("path '{path}' is not a valid object key"))]
    InvalidPath { path: String },

    #[snafu(display("invalid value '{value}' for parameter '{param}'"))]
    InvalidParam { param: String, value: String },

    #[snafu(display("operation '{operation}' requires parameter '{param}'"))]
    MissingParam { operation: String, param: String },

    #[snafu(display("unknown operation '{operation}'"))]
    UnknownOperation { operation: String },
}

/// Parse a request path + query string into a [`DerivedObject`].
///
/// `path` is the URL path including the leading slash; the first segment
/// is the bucket. An empty remainder yields a bucket-level object (empty
/// key) which the coordinator routes to the S3-style listing.
pub fn parse_request(
    config: &AppConfig,
    path: &str,
    query: &str,
) -> Result<DerivedObject, ParseError> {
    let trimmed = path.trim_start_matches('/');
    if trimmed
        .split('/')
        .any(|segment| segment == ".." || segment == ".")
    {
        return InvalidPathSnafu { path }.fail();
    }

    let (bucket, rest) = match trimmed.split_once('/') {
        Some((bucket, rest)) => (bucket, rest.trim_end_matches('/')),
        None => (trimmed, ""),
    };

    if bucket.is_empty() {
        // Service-level request (`GET /?location`).
        return Ok(DerivedObject::plain("", ""));
    }

    let bucket_config = config
        .buckets
        .get(bucket)
        .ok_or_else(|| ParseError::UnknownBucket {
            bucket: bucket.to_string(),
        })?;

    if rest.is_empty() {
        // Bucket-level request: listing.
        return Ok(DerivedObject::plain(bucket, ""));
    }

    let key = format!("/{rest}");
    let params = QueryParams::parse(query);
    let debug = config.server.debug || params.flag("debug");

    let object = match &bucket_config.transform {
        None => DerivedObject::plain(bucket, key),
        Some(tc) => match tc.kind {
            TransformKind::Preset => {
                try_preset(bucket, rest, tc, debug)?.unwrap_or_else(|| DerivedObject::plain(bucket, key))
            }
            TransformKind::Query => from_query(bucket, &key, tc, &params, debug)?,
            TransformKind::PresetsQuery => match try_preset(bucket, rest, tc, debug)? {
                Some(object) => object,
                None => from_query(bucket, &key, tc, &params, debug)?,
            },
        },
    };

    let mut object = object;
    object.debug = debug;
    Ok(object)
}

/// Path-addressed preset: `/{bucket}/{preset}/{parent...}`.
///
/// Returns `Ok(None)` when the first segment names no configured preset,
/// so `presets-query` buckets can fall back to query parsing.
fn try_preset(
    bucket: &str,
    rest: &str,
    tc: &TransformConfig,
    debug: bool,
) -> Result<Option<DerivedObject>, ParseError> {
    let Some((preset_name, parent_path)) = rest.split_once('/') else {
        return Ok(None);
    };
    let Some(preset) = tc.presets.get(preset_name) else {
        return Ok(None);
    };
    if parent_path.is_empty() {
        return Ok(None);
    }

    let chain = TransformChain::new(preset.operations.clone());
    let parent = DerivedObject::plain(bucket, format!("/{parent_path}"));
    Ok(Some(derived(
        bucket,
        format!("/{rest}"),
        chain,
        parent,
        tc.check_parent,
        debug,
    )))
}

/// Query-addressed transforms: `?operation=resize&width=200...`.
fn from_query(
    bucket: &str,
    key: &str,
    tc: &TransformConfig,
    params: &QueryParams,
    debug: bool,
) -> Result<DerivedObject, ParseError> {
    let chain = parse_transforms(params)?;
    if chain.is_empty() {
        return Ok(DerivedObject::plain(bucket, key));
    }

    let derived_key = format!("{key}-{:016x}", chain.hash64());
    let parent = DerivedObject::plain(bucket, key);
    Ok(derived(
        bucket,
        derived_key,
        chain,
        parent,
        tc.check_parent,
        debug,
    ))
}

fn derived(
    bucket: &str,
    key: String,
    transforms: TransformChain,
    parent: DerivedObject,
    check_parent: bool,
    debug: bool,
) -> DerivedObject {
    DerivedObject {
        bucket: bucket.to_string(),
        key,
        storage_target: StorageTarget::Transform,
        transforms,
        parent: Some(Box::new(parent)),
        check_parent,
        debug,
    }
}

/// Decoded query string: single-valued parameters plus the ordered list of
/// `operation` values.
struct QueryParams {
    values: HashMap<String, String>,
    operations: Vec<String>,
}

impl QueryParams {
    fn parse(query: &str) -> Self {
        let mut values = HashMap::new();
        let mut operations = Vec::new();
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if name == "operation" {
                operations.push(value.into_owned());
            } else {
                values.insert(name.into_owned(), value.into_owned());
            }
        }
        Self { values, operations }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some("1") | Some("true"))
    }

    fn u32_param(&self, operation: &str, name: &str) -> Result<u32, ParseError> {
        let value = self.get(name).ok_or_else(|| ParseError::MissingParam {
            operation: operation.to_string(),
            param: name.to_string(),
        })?;
        value.parse().map_err(|_| ParseError::InvalidParam {
            param: name.to_string(),
            value: value.to_string(),
        })
    }

    fn opt_u32_param(&self, name: &str) -> Result<Option<u32>, ParseError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| ParseError::InvalidParam {
                    param: name.to_string(),
                    value: value.to_string(),
                }),
        }
    }

    fn f32_param(&self, operation: &str, name: &str) -> Result<f32, ParseError> {
        let value = self.get(name).ok_or_else(|| ParseError::MissingParam {
            operation: operation.to_string(),
            param: name.to_string(),
        })?;
        value.parse().map_err(|_| ParseError::InvalidParam {
            param: name.to_string(),
            value: value.to_string(),
        })
    }
}

fn parse_transforms(params: &QueryParams) -> Result<TransformChain, ParseError> {
    let mut ops: Vec<Transform> = Vec::new();

    let operations: Vec<&str> = if params.operations.is_empty() {
        // Bare `?width=...` or `?height=...` is an implicit resize.
        if params.get("width").is_some() || params.get("height").is_some() {
            vec!["resize"]
        } else {
            Vec::new()
        }
    } else {
        params.operations.iter().map(String::as_str).collect()
    };

    for operation in operations {
        let transform = match operation {
            "resize" => {
                let width = params.opt_u32_param("width")?;
                let height = params.opt_u32_param("height")?;
                if width.is_none() && height.is_none() {
                    return MissingParamSnafu {
                        operation: "resize",
                        param: "width",
                    }
                    .fail();
                }
                Transform::Resize { width, height }
            }
            "crop" => Transform::Crop {
                width: params.u32_param("crop", "width")?,
                height: params.u32_param("crop", "height")?,
                gravity: match params.get("gravity") {
                    None => Gravity::default(),
                    Some("center") => Gravity::Center,
                    Some("north") => Gravity::North,
                    Some("south") => Gravity::South,
                    Some("east") => Gravity::East,
                    Some("west") => Gravity::West,
                    Some(other) => {
                        return InvalidParamSnafu {
                            param: "gravity",
                            value: other,
                        }
                        .fail();
                    }
                },
            },
            "extract" => Transform::Extract {
                x: params.u32_param("extract", "x")?,
                y: params.u32_param("extract", "y")?,
                width: params.u32_param("extract", "width")?,
                height: params.u32_param("extract", "height")?,
            },
            "rotate" => Transform::Rotate {
                angle: params.u32_param("rotate", "angle")? as u16,
            },
            "blur" => Transform::Blur {
                sigma: params.f32_param("blur", "sigma")?,
            },
            "grayscale" => Transform::Grayscale,
            "resizeCropAuto" => Transform::ResizeCropAuto {
                width: params.u32_param("resizeCropAuto", "width")?,
                height: params.u32_param("resizeCropAuto", "height")?,
            },
            "watermark" => Transform::Watermark {
                image: params
                    .get("image")
                    .ok_or_else(|| ParseError::MissingParam {
                        operation: "watermark".to_string(),
                        param: "image".to_string(),
                    })?
                    .to_string(),
                position: params.get("position").unwrap_or("bottom-right").to_string(),
                opacity: match params.get("opacity") {
                    None => 1.0,
                    Some(_) => params.f32_param("watermark", "opacity")?,
                },
            },
            other => {
                return UnknownOperationSnafu { operation: other }.fail();
            }
        };
        ops.push(transform);
    }

    if params.flag("grayscale") && !ops.iter().any(|t| matches!(t, Transform::Grayscale)) {
        ops.push(Transform::Grayscale);
    }

    if let Some(format) = params.get("format") {
        let format = OutputFormat::parse(format).ok_or_else(|| ParseError::InvalidParam {
            param: "format".to_string(),
            value: format.to_string(),
        })?;
        ops.push(Transform::Format { format });
    }

    Ok(TransformChain::new(ops))
}
