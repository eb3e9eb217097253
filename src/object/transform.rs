//! Image transform operations and ordered chains.
//!
//! A [`TransformChain`] is the ordered list of operations one derived
//! object applies to its parent. Chains carry a 64-bit fingerprint used
//! for derived keys and placeholder cache keys, so identical chains on
//! different originals share placeholder renders.

use std::fmt;
use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

/// Crop anchor within the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Gravity {
    #[default]
    Center,
    North,
    South,
    East,
    West,
}

impl fmt::Display for Gravity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Gravity::Center => "center",
            Gravity::North => "north",
            Gravity::South => "south",
            Gravity::East => "east",
            Gravity::West => "west",
        };
        f.write_str(s)
    }
}

/// Output encoding for format conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
}

impl OutputFormat {
    /// MIME type of the encoded payload.
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
        }
    }

    /// Parse a format name as it appears in URLs and config.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "jpeg" | "jpg" => Some(OutputFormat::Jpeg),
            "png" => Some(OutputFormat::Png),
            "webp" => Some(OutputFormat::Webp),
            _ => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
        };
        f.write_str(s)
    }
}

/// One image operation with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Transform {
    /// Rotate clockwise by a multiple of 90 degrees.
    Rotate { angle: u16 },
    /// Gaussian blur.
    Blur { sigma: f32 },
    /// Drop color information.
    Grayscale,
    /// Fit within the given box, preserving aspect ratio. At least one
    /// dimension must be present.
    Resize {
        #[serde(default)]
        width: Option<u32>,
        #[serde(default)]
        height: Option<u32>,
    },
    /// Cut a window of the given size anchored by gravity.
    Crop {
        width: u32,
        height: u32,
        #[serde(default)]
        gravity: Gravity,
    },
    /// Cut an explicit window.
    Extract { x: u32, y: u32, width: u32, height: u32 },
    /// Resize to fill the box, then center-crop to exactly the box.
    ResizeCropAuto { width: u32, height: u32 },
    /// Overlay another image.
    Watermark {
        image: String,
        #[serde(default = "default_watermark_position")]
        position: String,
        #[serde(default = "default_watermark_opacity")]
        opacity: f32,
    },
    /// Re-encode to the given format.
    Format { format: OutputFormat },
}

fn default_watermark_position() -> String {
    "bottom-right".to_string()
}

fn default_watermark_opacity() -> f32 {
    1.0
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Rotate { angle } => write!(f, "rotate({angle})"),
            Transform::Blur { sigma } => write!(f, "blur({sigma})"),
            Transform::Grayscale => write!(f, "grayscale"),
            Transform::Resize { width, height } => write!(
                f,
                "resize({},{})",
                width.map(|w| w.to_string()).unwrap_or_default(),
                height.map(|h| h.to_string()).unwrap_or_default(),
            ),
            Transform::Crop {
                width,
                height,
                gravity,
            } => write!(f, "crop({width},{height},{gravity})"),
            Transform::Extract { x, y, width, height } => {
                write!(f, "extract({x},{y},{width},{height})")
            }
            Transform::ResizeCropAuto { width, height } => {
                write!(f, "resizeCropAuto({width},{height})")
            }
            Transform::Watermark {
                image,
                position,
                opacity,
            } => write!(f, "watermark({image},{position},{opacity})"),
            Transform::Format { format } => write!(f, "format({format})"),
        }
    }
}

/// Ordered list of operations applied to one parent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformChain {
    ops: Vec<Transform>,
}

impl TransformChain {
    /// Chain over the given operations, in application order.
    pub fn new(ops: Vec<Transform>) -> Self {
        Self { ops }
    }

    /// Chain with no operations.
    pub fn empty() -> Self {
        Self { ops: Vec::new() }
    }

    /// Whether the chain has no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// The operations, in application order.
    pub fn ops(&self) -> &[Transform] {
        &self.ops
    }

    /// Canonical textual form, stable across runs. The fingerprint and the
    /// derived-key suffix both hash this.
    pub fn canonical(&self) -> String {
        let parts: Vec<String> = self.ops.iter().map(|t| t.to_string()).collect();
        parts.join("|")
    }

    /// 64-bit fingerprint of the ordered chain.
    pub fn hash64(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.canonical().hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for TransformChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}
