//! Content negotiation over the `Accept` header.

/// Case-insensitive substring test; header formatting around the MIME type
/// (q-values, spacing) is deliberately ignored.
fn accepts(header: Option<&str>, mime: &str) -> bool {
    header
        .map(|h| h.to_ascii_lowercase().contains(mime))
        .unwrap_or(false)
}

pub fn supports_webp(accept: Option<&str>) -> bool {
    accepts(accept, "image/webp")
}

pub fn supports_avif(accept: Option<&str>) -> bool {
    accepts(accept, "image/avif")
}
