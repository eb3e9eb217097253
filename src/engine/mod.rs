//! The image engine contract and the default kernel implementation.
//!
//! The coordinator only depends on the [`ImageEngine`] trait: one pass
//! consumes the input response's stream exactly once and yields a buffered
//! response with the encoded result. [`KernelEngine`] implements the
//! operations over the `image` crate; tests substitute scripted engines.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::object::{DerivedObject, Gravity, OutputFormat, Transform, TransformChain};
use crate::response::{Response, ResponseError};

/// Errors from one engine pass. The coordinator maps all of them to a
/// 400 response and the placeholder path.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EngineError {
    /// The input stream could not be read.
    #[snafu(display("failed to read input: {source}"))]
    Read { source: ResponseError },

    /// The input bytes are not a decodable image.
    #[snafu(display("failed to decode input image: {source}"))]
    Decode { source: image::ImageError },

    /// Encoding the result failed.
    #[snafu(display("failed to encode result: {source}"))]
    Encode { source: image::ImageError },

    /// A transform's parameters are outside what the kernels support.
    #[snafu(display("unsupported transform: {detail}"))]
    Unsupported { detail: String },

    /// An extract window lies outside the image.
    #[snafu(display("invalid window: {detail}"))]
    InvalidWindow { detail: String },

    /// The watermark source could not be loaded.
    #[snafu(display("failed to load watermark '{image}': {source}"))]
    Watermark {
        image: String,
        source: std::io::Error,
    },

    /// The blocking task failed.
    #[snafu(display("engine task failed: {message}"))]
    Internal { message: String },
}

/// One-shot image processing over an input response.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// Apply `chains` (parent-to-child order) to `input`'s bytes.
    ///
    /// The input stream is consumed exactly once; the result is always a
    /// buffered, copyable response.
    async fn process(
        &self,
        obj: &DerivedObject,
        input: Response,
        chains: &[TransformChain],
    ) -> Result<Response, EngineError>;
}

/// Default engine backed by the `image` crate.
///
/// Decoding, transforming and encoding are CPU-bound, so each pass runs
/// on the blocking pool.
#[derive(Default)]
pub struct KernelEngine;

impl KernelEngine {
    /// The kernel engine is stateless.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ImageEngine for KernelEngine {
    async fn process(
        &self,
        obj: &DerivedObject,
        input: Response,
        chains: &[TransformChain],
    ) -> Result<Response, EngineError> {
        let key = obj.key.clone();
        let ops: Vec<Transform> = chains
            .iter()
            .flat_map(|chain| chain.ops().iter().cloned())
            .collect();
        debug!(key = %key, ops = ops.len(), "engine pass starting");

        let bytes = input.into_bytes().await.context(ReadSnafu)?;
        let rendered = tokio::task::spawn_blocking(move || render(&bytes, &ops))
            .await
            .map_err(|e| EngineError::Internal {
                message: e.to_string(),
            })??;

        debug!(key = %key, bytes = rendered.bytes.len(), "engine pass finished");
        Ok(Response::buffer(
            StatusCode::OK,
            rendered.format.content_type(),
            rendered.bytes,
        ))
    }
}

struct Rendered {
    bytes: Bytes,
    format: OutputFormat,
}

fn render(bytes: &[u8], ops: &[Transform]) -> Result<Rendered, EngineError> {
    let input_format = image::guess_format(bytes).ok();
    let mut img = image::load_from_memory(bytes).context(DecodeSnafu)?;
    let mut output = output_format_for(input_format);

    for op in ops {
        match op {
            Transform::Rotate { angle } => {
                img = match angle % 360 {
                    0 => img,
                    90 => img.rotate90(),
                    180 => img.rotate180(),
                    270 => img.rotate270(),
                    other => {
                        return UnsupportedSnafu {
                            detail: format!("rotate angle {other} (must be a multiple of 90)"),
                        }
                        .fail();
                    }
                };
            }
            Transform::Blur { sigma } => {
                img = img.blur(*sigma);
            }
            Transform::Grayscale => {
                img = img.grayscale();
            }
            Transform::Resize { width, height } => {
                let w = width.unwrap_or(u32::MAX);
                let h = height.unwrap_or(u32::MAX);
                img = img.resize(w, h, FilterType::Lanczos3);
            }
            Transform::Crop {
                width,
                height,
                gravity,
            } => {
                let w = (*width).min(img.width());
                let h = (*height).min(img.height());
                let (x, y) = crop_origin(img.width(), img.height(), w, h, *gravity);
                img = img.crop_imm(x, y, w, h);
            }
            Transform::Extract { x, y, width, height } => {
                if *x >= img.width() || *y >= img.height() {
                    return InvalidWindowSnafu {
                        detail: format!(
                            "extract origin ({x},{y}) outside {}x{}",
                            img.width(),
                            img.height()
                        ),
                    }
                    .fail();
                }
                let w = (*width).min(img.width() - x);
                let h = (*height).min(img.height() - y);
                img = img.crop_imm(*x, *y, w, h);
            }
            Transform::ResizeCropAuto { width, height } => {
                img = img.resize_to_fill(*width, *height, FilterType::Lanczos3);
            }
            Transform::Watermark {
                image: source,
                position,
                opacity,
            } => {
                img = apply_watermark(img, source, position, *opacity)?;
            }
            Transform::Format { format } => {
                output = *format;
            }
        }
    }

    let mut out = Cursor::new(Vec::new());
    let format = match output {
        OutputFormat::Jpeg => ImageFormat::Jpeg,
        OutputFormat::Png => ImageFormat::Png,
        OutputFormat::Webp => ImageFormat::WebP,
    };
    // JPEG has no alpha channel.
    if format == ImageFormat::Jpeg {
        img = DynamicImage::ImageRgb8(img.to_rgb8());
    }
    img.write_to(&mut out, format).context(EncodeSnafu)?;

    Ok(Rendered {
        bytes: Bytes::from(out.into_inner()),
        format: output,
    })
}

fn output_format_for(input: Option<ImageFormat>) -> OutputFormat {
    match input {
        Some(ImageFormat::Png) => OutputFormat::Png,
        Some(ImageFormat::WebP) => OutputFormat::Webp,
        _ => OutputFormat::Jpeg,
    }
}

fn crop_origin(ow: u32, oh: u32, w: u32, h: u32, gravity: Gravity) -> (u32, u32) {
    let cx = (ow - w) / 2;
    let cy = (oh - h) / 2;
    match gravity {
        Gravity::Center => (cx, cy),
        Gravity::North => (cx, 0),
        Gravity::South => (cx, oh - h),
        Gravity::East => (ow - w, cy),
        Gravity::West => (0, cy),
    }
}

fn apply_watermark(
    mut base: DynamicImage,
    source: &str,
    position: &str,
    opacity: f32,
) -> Result<DynamicImage, EngineError> {
    let bytes = std::fs::read(source).map_err(|e| EngineError::Watermark {
        image: source.to_string(),
        source: e,
    })?;
    let overlay_img = image::load_from_memory(&bytes).context(DecodeSnafu)?;

    let mut overlay_rgba = overlay_img.to_rgba8();
    if opacity < 1.0 {
        let factor = opacity.clamp(0.0, 1.0);
        for pixel in overlay_rgba.pixels_mut() {
            pixel[3] = (pixel[3] as f32 * factor) as u8;
        }
    }

    let (bw, bh) = (base.width(), base.height());
    let (ww, wh) = (overlay_rgba.width(), overlay_rgba.height());
    let (x, y) = match position {
        "top-left" => (0, 0),
        "top-right" => (bw.saturating_sub(ww), 0),
        "bottom-left" => (0, bh.saturating_sub(wh)),
        "center" => (
            bw.saturating_sub(ww) / 2,
            bh.saturating_sub(wh) / 2,
        ),
        // The parser defaults to bottom-right; unknown strings land here
        // too rather than failing the whole pass.
        _ => (bw.saturating_sub(ww), bh.saturating_sub(wh)),
    };

    image::imageops::overlay(&mut base, &overlay_rgba, x as i64, y as i64);
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::TransformChain;

    fn png_bytes(width: u32, height: u32) -> Bytes {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            width,
            height,
            image::Rgba([120, 30, 200, 255]),
        ));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        Bytes::from(out.into_inner())
    }

    fn input(width: u32, height: u32) -> Response {
        Response::buffer(StatusCode::OK, "image/png", png_bytes(width, height))
    }

    fn chain(ops: Vec<Transform>) -> Vec<TransformChain> {
        vec![TransformChain::new(ops)]
    }

    async fn dims_of(res: Response) -> (u32, u32) {
        let bytes = res.into_bytes().await.unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        (img.width(), img.height())
    }

    fn obj() -> DerivedObject {
        DerivedObject::plain("demo", "/img.png")
    }

    #[tokio::test]
    async fn resize_preserves_aspect_ratio() {
        let engine = KernelEngine::new();
        let res = engine
            .process(
                &obj(),
                input(200, 100),
                &chain(vec![Transform::Resize {
                    width: Some(100),
                    height: None,
                }]),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.content_type(), Some("image/png"));
        assert_eq!(dims_of(res).await, (100, 50));
    }

    #[tokio::test]
    async fn resize_crop_auto_fills_the_box() {
        let engine = KernelEngine::new();
        let res = engine
            .process(
                &obj(),
                input(300, 100),
                &chain(vec![Transform::ResizeCropAuto {
                    width: 50,
                    height: 50,
                }]),
            )
            .await
            .unwrap();
        assert_eq!(dims_of(res).await, (50, 50));
    }

    #[tokio::test]
    async fn rotate_swaps_dimensions() {
        let engine = KernelEngine::new();
        let res = engine
            .process(
                &obj(),
                input(200, 100),
                &chain(vec![Transform::Rotate { angle: 90 }]),
            )
            .await
            .unwrap();
        assert_eq!(dims_of(res).await, (100, 200));
    }

    #[tokio::test]
    async fn odd_rotation_is_unsupported() {
        let engine = KernelEngine::new();
        let err = engine
            .process(
                &obj(),
                input(10, 10),
                &chain(vec![Transform::Rotate { angle: 45 }]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn format_conversion_changes_content_type() {
        let engine = KernelEngine::new();
        let res = engine
            .process(
                &obj(),
                input(10, 10),
                &chain(vec![Transform::Format {
                    format: OutputFormat::Jpeg,
                }]),
            )
            .await
            .unwrap();
        assert_eq!(res.content_type(), Some("image/jpeg"));
        let bytes = res.into_bytes().await.unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
    }

    #[tokio::test]
    async fn chains_apply_in_order() {
        let engine = KernelEngine::new();
        // Crop to the top strip, then rotate: order matters for the
        // resulting dimensions.
        let chains = vec![
            TransformChain::new(vec![Transform::Crop {
                width: 200,
                height: 40,
                gravity: Gravity::North,
            }]),
            TransformChain::new(vec![Transform::Rotate { angle: 90 }]),
        ];
        let res = engine.process(&obj(), input(200, 100), &chains).await.unwrap();
        assert_eq!(dims_of(res).await, (40, 200));
    }

    #[tokio::test]
    async fn garbage_input_fails_to_decode() {
        let engine = KernelEngine::new();
        let garbage = Response::buffer(
            StatusCode::OK,
            "image/jpeg",
            Bytes::from_static(b"not an image"),
        );
        let err = engine
            .process(&obj(), garbage, &chain(vec![Transform::Grayscale]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Decode { .. }));
    }

    #[tokio::test]
    async fn extract_outside_bounds_is_rejected() {
        let engine = KernelEngine::new();
        let err = engine
            .process(
                &obj(),
                input(10, 10),
                &chain(vec![Transform::Extract {
                    x: 50,
                    y: 0,
                    width: 5,
                    height: 5,
                }]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidWindow { .. }));
    }
}
