//! Decode, resize and re-encode pipeline.
//!
//! The pipeline is pure over bytes: fetching and retry orchestration live in
//! the proxy engine. Animated sources (GIF/APNG/MP4) pass through untouched
//! for aspect-preserving requests, since resizing them would drop motion.

use crate::config::ProxyStoreConfig;
use crate::error::Error;
use crate::sniff;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::metadata::Orientation;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageDecoder, ImageEncoder};
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;

pub const JPEG_QUALITY: u8 = 80;
pub const WEBP_QUALITY: f32 = 80.0;
pub const AVIF_QUALITY: u8 = 50;
pub const AVIF_EFFORT: u8 = 4;

/// Exact-fill-with-crop vs. aspect-preserving bounded resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    Cover,
    Fit,
}

impl fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingMode::Cover => write!(f, "Cover"),
            ScalingMode::Fit => write!(f, "Fit"),
        }
    }
}

/// Requested output encoding. `Match` keeps the decoded format, with SVG
/// rasterized to PNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Match,
    Jpeg,
    Png,
    Webp,
    Avif,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Match => write!(f, "Match"),
            OutputFormat::Jpeg => write!(f, "JPEG"),
            OutputFormat::Png => write!(f, "PNG"),
            OutputFormat::Webp => write!(f, "WEBP"),
            OutputFormat::Avif => write!(f, "AVIF"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOptions {
    /// `None` means unspecified; callers normalize `0` to `None`.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mode: ScalingMode,
    pub format: OutputFormat,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            mode: ScalingMode::Fit,
            format: OutputFormat::Match,
        }
    }
}

/// Cache-bypass request flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheFlags {
    pub ignorecache: bool,
    pub invalidate: bool,
    pub refetch: bool,
}

impl CacheFlags {
    pub fn bypass(&self) -> bool {
        self.ignorecache || self.invalidate || self.refetch
    }
}

fn flag(query: &HashMap<String, String>, name: &str) -> bool {
    matches!(query.get(name).map(String::as_str), Some("1") | Some("true"))
}

fn dimension(query: &HashMap<String, String>, name: &str) -> Result<Option<u32>, Error> {
    match query.get(name) {
        None => Ok(None),
        Some(raw) => {
            let value: u32 = raw.parse().map_err(|_| Error::InvalidParam(name.into()))?;
            Ok(if value == 0 { None } else { Some(value) })
        }
    }
}

impl TransformOptions {
    /// Parse `width`/`height`/`mode`/`format` plus the cache-bypass flags
    /// from a query map. `0` dimensions mean unspecified.
    pub fn from_query(query: &HashMap<String, String>) -> Result<(Self, CacheFlags), Error> {
        let width = dimension(query, "width")?;
        let height = dimension(query, "height")?;
        let mode = match query.get("mode").map(|m| m.to_ascii_lowercase()) {
            None => ScalingMode::Fit,
            Some(m) => match m.as_str() {
                "cover" => ScalingMode::Cover,
                "fit" => ScalingMode::Fit,
                _ => return Err(Error::InvalidParam("mode".into())),
            },
        };
        let format = match query.get("format").map(|f| f.to_ascii_lowercase()) {
            None => OutputFormat::Match,
            Some(f) => match f.as_str() {
                "match" => OutputFormat::Match,
                "jpeg" | "jpg" => OutputFormat::Jpeg,
                "png" => OutputFormat::Png,
                "webp" => OutputFormat::Webp,
                "avif" => OutputFormat::Avif,
                _ => return Err(Error::InvalidParam("format".into())),
            },
        };
        let flags = CacheFlags {
            ignorecache: flag(query, "ignorecache"),
            invalidate: flag(query, "invalidate"),
            refetch: flag(query, "refetch"),
        };
        Ok((
            Self {
                width,
                height,
                mode,
                format,
            },
            flags,
        ))
    }
}

pub struct TransformOutput {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// Clamp requested dimensions per the proxy store policy: explicit sizes are
/// capped at the custom maximum, an unconstrained request is capped at the
/// default maximum only when the original exceeds it.
pub fn plan_dimensions(
    orig_w: u32,
    orig_h: u32,
    opts: &TransformOptions,
    limits: &ProxyStoreConfig,
) -> (Option<u32>, Option<u32>) {
    let mut w = opts.width.map(|w| w.min(limits.max_custom_image_width));
    let mut h = opts.height.map(|h| h.min(limits.max_custom_image_height));
    if w.is_none() && h.is_none() {
        if orig_w > limits.max_image_width {
            w = Some(limits.max_image_width);
        }
        if orig_h > limits.max_image_height {
            h = Some(limits.max_image_height);
        }
    }
    (w, h)
}

/// Decode bytes into pixels with EXIF rotation applied.
fn decode_oriented(bytes: &[u8]) -> Result<DynamicImage, Error> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| Error::InvalidImage(e.to_string()))?;
    let mut decoder = reader
        .into_decoder()
        .map_err(|e| Error::InvalidImage(e.to_string()))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut img =
        DynamicImage::from_decoder(decoder).map_err(|e| Error::InvalidImage(e.to_string()))?;
    img.apply_orientation(orientation);
    Ok(img)
}

fn decoded_format(bytes: &[u8]) -> Option<image::ImageFormat> {
    image::guess_format(bytes).ok()
}

/// Rasterize an SVG document onto a PNG canvas at its intrinsic size.
fn rasterize_svg(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    use resvg::{tiny_skia, usvg};

    let options = usvg::Options::default();
    let mut fontdb = usvg::fontdb::Database::new();
    fontdb.load_system_fonts();
    let mut tree =
        usvg::Tree::from_data(bytes, &options).map_err(|e| Error::InvalidImage(e.to_string()))?;
    tree.postprocess(Default::default(), &fontdb);
    let mut pixmap = tiny_skia::Pixmap::new(tree.size.width() as u32, tree.size.height() as u32)
        .ok_or_else(|| Error::InvalidImage("svg has no drawable area".into()))?;
    resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());
    pixmap
        .encode_png()
        .map_err(|e| Error::InvalidImage(e.to_string()))
}

fn resize(
    img: DynamicImage,
    w: Option<u32>,
    h: Option<u32>,
    mode: ScalingMode,
    limits: &ProxyStoreConfig,
) -> DynamicImage {
    let (orig_w, orig_h) = img.dimensions();
    match mode {
        ScalingMode::Cover => {
            // Cover needs both dimensions; derive the missing one from the
            // source aspect ratio.
            let (tw, th) = match (w, h) {
                (Some(w), Some(h)) => (w, h),
                (Some(w), None) => (w, scale_dim(orig_h, w, orig_w)),
                (None, Some(h)) => (scale_dim(orig_w, h, orig_h), h),
                (None, None) => (limits.max_image_width, limits.max_image_height),
            };
            img.resize_to_fill(tw.max(1), th.max(1), image::imageops::FilterType::Lanczos3)
        }
        ScalingMode::Fit => {
            let (tw, th) = match (w, h) {
                (Some(w), Some(h)) => (w, h),
                (Some(w), None) => (w, u32::MAX),
                (None, Some(h)) => (u32::MAX, h),
                (None, None) => return img,
            };
            if orig_w <= tw && orig_h <= th {
                // Fit never enlarges.
                return img;
            }
            img.resize(tw.max(1), th.max(1), image::imageops::FilterType::Lanczos3)
        }
    }
}

fn scale_dim(side: u32, num: u32, den: u32) -> u32 {
    if den == 0 {
        return side.max(1);
    }
    ((side as u64 * num as u64) / den as u64).max(1) as u32
}

fn encode(img: &DynamicImage, format: OutputFormat) -> Result<TransformOutput, Error> {
    let mut out = Vec::new();
    let content_type = match format {
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
                .write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(|e| Error::InvalidImage(e.to_string()))?;
            "image/jpeg"
        }
        OutputFormat::Png => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            PngEncoder::new_with_quality(&mut out, CompressionType::Best, FilterType::Adaptive)
                .write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| Error::InvalidImage(e.to_string()))?;
            "image/png"
        }
        OutputFormat::Webp => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            let encoder = webp::Encoder::from_rgba(rgba.as_raw(), w, h);
            out.extend_from_slice(&encoder.encode(WEBP_QUALITY));
            "image/webp"
        }
        OutputFormat::Avif => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            AvifEncoder::new_with_speed_quality(&mut out, AVIF_EFFORT, AVIF_QUALITY)
                .write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| Error::InvalidImage(e.to_string()))?;
            "image/avif"
        }
        OutputFormat::Match => unreachable!("Match is resolved before encoding"),
    };
    Ok(TransformOutput {
        bytes: out,
        content_type,
    })
}

/// Resolve `Match` to a concrete encoder for the decoded source format.
/// Formats we only decode (GIF, BMP) come back as PNG.
fn match_format(source: Option<image::ImageFormat>) -> OutputFormat {
    match source {
        Some(image::ImageFormat::Jpeg) => OutputFormat::Jpeg,
        Some(image::ImageFormat::WebP) => OutputFormat::Webp,
        Some(image::ImageFormat::Avif) => OutputFormat::Avif,
        _ => OutputFormat::Png,
    }
}

/// Whether the source should be returned unmodified: animated containers
/// under an aspect-preserving request keep their motion.
pub fn is_passthrough(content_type: &str, opts: &TransformOptions) -> bool {
    matches!(content_type, "image/gif" | "image/apng" | "video/mp4")
        && opts.mode == ScalingMode::Fit
        && matches!(
            opts.format,
            OutputFormat::Match | OutputFormat::Webp | OutputFormat::Avif
        )
}

/// Run the full pipeline over raw bytes.
///
/// Errors are `InvalidImage`; the caller decides whether to retry through
/// the upstream fallback ladder.
pub fn transform(
    bytes: &[u8],
    opts: &TransformOptions,
    limits: &ProxyStoreConfig,
) -> Result<TransformOutput, Error> {
    let sniffed = sniff::content_type(bytes);
    if let Some(ct) = sniffed {
        if is_passthrough(ct, opts) {
            return Ok(TransformOutput {
                bytes: bytes.to_vec(),
                content_type: ct,
            });
        }
    }

    // SVG is rasterized up front, then flows through the raster pipeline.
    let raster;
    let working: &[u8] = if matches!(sniffed, Some("image/svg+xml")) {
        raster = rasterize_svg(bytes)?;
        &raster
    } else {
        bytes
    };

    let source_format = decoded_format(working);
    let img = decode_oriented(working)?;
    let (orig_w, orig_h) = img.dimensions();
    let (w, h) = plan_dimensions(orig_w, orig_h, opts, limits);
    let resized = resize(img, w, h, opts.mode, limits);

    let format = match opts.format {
        OutputFormat::Match => match_format(source_format),
        other => other,
    };
    encode(&resized, format)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ProxyStoreConfig {
        ProxyStoreConfig::default()
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::new_rgba8(w, h);
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn plan_caps_custom_dimensions() {
        let opts = TransformOptions {
            width: Some(20_000),
            height: Some(9_000),
            ..Default::default()
        };
        assert_eq!(
            plan_dimensions(100, 100, &opts, &limits()),
            (Some(8000), Some(8000))
        );
    }

    #[test]
    fn plan_clamps_oversize_originals_only_when_unconstrained() {
        let opts = TransformOptions::default();
        assert_eq!(
            plan_dimensions(4000, 500, &opts, &limits()),
            (Some(1280), None)
        );
        assert_eq!(plan_dimensions(800, 600, &opts, &limits()), (None, None));
        // one explicit dimension leaves the other to the codec
        let opts = TransformOptions {
            height: Some(500),
            ..Default::default()
        };
        assert_eq!(
            plan_dimensions(4000, 4000, &opts, &limits()),
            (None, Some(500))
        );
    }

    #[test]
    fn fit_never_enlarges() {
        let img = DynamicImage::new_rgb8(100, 50);
        let out = resize(img, Some(400), Some(400), ScalingMode::Fit, &limits());
        assert_eq!(out.dimensions(), (100, 50));
    }

    #[test]
    fn fit_bounds_preserving_aspect() {
        let img = DynamicImage::new_rgb8(800, 400);
        let out = resize(img, Some(400), None, ScalingMode::Fit, &limits());
        assert_eq!(out.dimensions(), (400, 200));
    }

    #[test]
    fn cover_fills_exactly() {
        let img = DynamicImage::new_rgb8(800, 400);
        let out = resize(img, Some(128), Some(128), ScalingMode::Cover, &limits());
        assert_eq!(out.dimensions(), (128, 128));
    }

    #[test]
    fn transform_encodes_requested_format() {
        let src = png_bytes(64, 64);
        let opts = TransformOptions {
            format: OutputFormat::Jpeg,
            ..Default::default()
        };
        let out = transform(&src, &opts, &limits()).unwrap();
        assert_eq!(out.content_type, "image/jpeg");
        assert!(!out.bytes.is_empty());
    }

    #[test]
    fn transform_match_keeps_png() {
        let src = png_bytes(32, 32);
        let out = transform(&src, &TransformOptions::default(), &limits()).unwrap();
        assert_eq!(out.content_type, "image/png");
    }

    #[test]
    fn gif_passes_through_for_fit_match() {
        let gif = b"GIF89a".to_vec();
        let opts = TransformOptions::default();
        assert!(is_passthrough("image/gif", &opts));
        let out = transform(&gif, &opts, &limits()).unwrap();
        assert_eq!(out.bytes, gif);
        assert_eq!(out.content_type, "image/gif");
    }

    #[test]
    fn gif_is_not_passthrough_under_cover_or_forced_format() {
        let opts = TransformOptions {
            mode: ScalingMode::Cover,
            ..Default::default()
        };
        assert!(!is_passthrough("image/gif", &opts));
        let opts = TransformOptions {
            format: OutputFormat::Jpeg,
            ..Default::default()
        };
        assert!(!is_passthrough("image/gif", &opts));
    }

    #[test]
    fn svg_becomes_png() {
        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="10"><rect width="10" height="10" fill="red"/></svg>"#;
        let out = transform(svg, &TransformOptions::default(), &limits()).unwrap();
        assert_eq!(out.content_type, "image/png");
        assert!(!out.bytes.is_empty());
    }

    #[test]
    fn garbage_is_invalid_image() {
        let err = transform(b"not an image", &TransformOptions::default(), &limits());
        assert!(matches!(err, Err(Error::InvalidImage(_))));
    }

    #[test]
    fn query_parsing_normalizes_zero_and_aliases() {
        let mut q = HashMap::new();
        q.insert("width".to_string(), "0".to_string());
        q.insert("height".to_string(), "500".to_string());
        q.insert("format".to_string(), "jpg".to_string());
        q.insert("mode".to_string(), "cover".to_string());
        q.insert("refetch".to_string(), "1".to_string());
        let (opts, flags) = TransformOptions::from_query(&q).unwrap();
        assert_eq!(opts.width, None);
        assert_eq!(opts.height, Some(500));
        assert_eq!(opts.format, OutputFormat::Jpeg);
        assert_eq!(opts.mode, ScalingMode::Cover);
        assert!(flags.refetch && flags.bypass());

        let mut q = HashMap::new();
        q.insert("width".to_string(), "abc".to_string());
        assert!(matches!(
            TransformOptions::from_query(&q),
            Err(Error::InvalidParam(_))
        ));
    }
}
