use imagehoster::config::ProxyStoreConfig;
use imagehoster::transform::{
    transform, OutputFormat, ScalingMode, TransformOptions,
};

fn limits() -> ProxyStoreConfig {
    ProxyStoreConfig::default()
}

fn png_of(w: u32, h: u32) -> Vec<u8> {
    let img = image::DynamicImage::new_rgb8(w, h);
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

fn dims_of(bytes: &[u8]) -> (u32, u32) {
    let img = image::load_from_memory(bytes).unwrap();
    use image::GenericImageView;
    img.dimensions()
}

#[test]
fn zero_dimensions_pass_original_through_unscaled() {
    let src = png_of(320, 200);
    let opts = TransformOptions::default(); // width 0, height 0 normalize to None
    let out = transform(&src, &opts, &limits()).unwrap();
    assert_eq!(dims_of(&out.bytes), (320, 200));
}

#[test]
fn height_only_resizes_with_auto_width() {
    let src = png_of(1000, 500);
    let opts = TransformOptions {
        height: Some(250),
        ..Default::default()
    };
    let out = transform(&src, &opts, &limits()).unwrap();
    assert_eq!(dims_of(&out.bytes), (500, 250));
}

#[test]
fn oversize_requests_clamp_to_custom_cap() {
    let src = png_of(64, 64);
    let mut limits = limits();
    limits.max_custom_image_width = 100;
    limits.max_custom_image_height = 100;
    let opts = TransformOptions {
        width: Some(20_000),
        height: Some(20_000),
        mode: ScalingMode::Cover,
        format: OutputFormat::Png,
    };
    // clamped to the custom cap, not rejected
    let out = transform(&src, &opts, &limits).unwrap();
    assert_eq!(dims_of(&out.bytes), (100, 100));
}

#[test]
fn unconstrained_large_originals_shrink_to_default_cap() {
    let src = png_of(2560, 100);
    let out = transform(&src, &TransformOptions::default(), &limits()).unwrap();
    let (w, _) = dims_of(&out.bytes);
    assert_eq!(w, 1280);
}

#[test]
fn cover_crops_to_exact_box() {
    let src = png_of(400, 100);
    let opts = TransformOptions {
        width: Some(64),
        height: Some(64),
        mode: ScalingMode::Cover,
        format: OutputFormat::Jpeg,
    };
    let out = transform(&src, &opts, &limits()).unwrap();
    assert_eq!(out.content_type, "image/jpeg");
    assert_eq!(dims_of(&out.bytes), (64, 64));
}

#[test]
fn forced_webp_encodes_webp() {
    let src = png_of(32, 32);
    let opts = TransformOptions {
        format: OutputFormat::Webp,
        ..Default::default()
    };
    let out = transform(&src, &opts, &limits()).unwrap();
    assert_eq!(out.content_type, "image/webp");
    assert_eq!(&out.bytes[..4], b"RIFF");
}

#[test]
fn animated_gif_survives_fit_requests_untouched() {
    // a real single-frame gif header is enough: passthrough never decodes
    let gif = b"GIF89a\x01\x00\x01\x00\x00\x00\x00;".to_vec();
    let opts = TransformOptions {
        width: Some(100),
        ..Default::default()
    };
    let out = transform(&gif, &opts, &limits()).unwrap();
    assert_eq!(out.bytes, gif);
    assert_eq!(out.content_type, "image/gif");
}
