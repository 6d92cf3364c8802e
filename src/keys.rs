//! Content-hash keys, base58 URL tokens and URL canonicalization.
//!
//! Keys are multihash-framed digests in base58:
//! uploads are `D` + sha2-256 over the bytes, proxied remotes are
//! `U` + sha1 over the canonical URL string. Proxy URL tokens encode the
//! raw URL bytes with the identity code so they round-trip losslessly.

use crate::error::Error;
use crate::transform::{OutputFormat, ScalingMode, TransformOptions};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use url::Url;

const MH_IDENTITY: u8 = 0x00;
const MH_SHA1: u8 = 0x11;
const MH_SHA2_256: u8 = 0x12;

/// How many nested `/p/` or `/0x0/` layers we are willing to peel off.
const MAX_PROXY_DEPTH: usize = 4;

/// Ordered domain replacements, applied as prefix rewrites.
const DOMAIN_REPLACEMENTS: &[(&str, &str)] = &[
    (
        "https://img.3speakcontent.online/",
        "https://img.3speakcontent.co/",
    ),
    ("https://img.inleo.io/D", "https://img.leopedia.io/D"),
];

/// Per-domain path replacements: (host prefix, needle, replacement).
const PATH_REPLACEMENTS: &[(&str, &str, &str)] = &[(
    "https://img.3speakcontent.co/",
    "/post.png",
    "/thumbnails/default.png",
)];

const ESTEEM_HOST: &str = "https://img.esteem.ws/";
const ESTEEM_WRAP: &str = "https://steemitimages.com/0x0/";

fn varint_encode(mut n: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn varint_decode(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in buf.iter().enumerate().take(9) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

fn multihash(code: u8, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 4);
    framed.push(code);
    varint_encode(payload.len() as u64, &mut framed);
    framed.extend_from_slice(payload);
    framed
}

/// Base58 of the identity-framed UTF-8 bytes of `s`.
pub fn base58_enc(s: &str) -> String {
    bs58::encode(multihash(MH_IDENTITY, s.as_bytes())).into_string()
}

/// Inverse of [`base58_enc`]. Non-base58 input, a non-identity hash code,
/// a length mismatch or non-UTF-8 payload all fail the decode.
pub fn base58_dec(token: &str) -> Result<String, Error> {
    let raw = bs58::decode(token)
        .into_vec()
        .map_err(|_| Error::InvalidProxyUrl)?;
    let (&code, rest) = raw.split_first().ok_or(Error::InvalidProxyUrl)?;
    if code != MH_IDENTITY {
        return Err(Error::InvalidProxyUrl);
    }
    let (len, consumed) = varint_decode(rest).ok_or(Error::InvalidProxyUrl)?;
    let payload = &rest[consumed..];
    if payload.len() as u64 != len {
        return Err(Error::InvalidProxyUrl);
    }
    String::from_utf8(payload.to_vec()).map_err(|_| Error::InvalidProxyUrl)
}

/// Upload key: `D` + base58(multihash(sha2-256, bytes)). Deterministic in
/// the bytes, so re-uploads land on the same key.
pub fn upload_key(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("D{}", bs58::encode(multihash(MH_SHA2_256, &digest)).into_string())
}

/// Proxy original key: `U` + base58(multihash(sha1, url string)).
pub fn remote_key(url: &Url) -> String {
    let digest = Sha1::digest(url.as_str().as_bytes());
    format!("U{}", bs58::encode(multihash(MH_SHA1, &digest)).into_string())
}

/// Compound key for a transformed artifact.
///
/// `Fit`/`Match` keeps the legacy compact `{orig}_{W}x{H}` form (zeroes for
/// unspecified dimensions); stored artifacts already use it. Every other
/// combination spells out mode and format and appends only the dimensions
/// that were set.
pub fn image_key(orig_key: &str, opts: &TransformOptions) -> String {
    match (opts.mode, opts.format) {
        (ScalingMode::Fit, OutputFormat::Match) => format!(
            "{}_{}x{}",
            orig_key,
            opts.width.unwrap_or(0),
            opts.height.unwrap_or(0)
        ),
        (mode, format) => {
            let mut key = format!("{}_{}_{}", orig_key, mode, format);
            if let Some(w) = opts.width {
                key.push_str(&format!("_{}", w));
            }
            if let Some(h) = opts.height {
                key.push_str(&format!("_{}", h));
            }
            key
        }
    }
}

/// Apply the domain and path replacement tables. Idempotent.
pub fn canonicalize(url: &Url) -> Url {
    let mut s = url.to_string();
    for (from, to) in DOMAIN_REPLACEMENTS {
        if let Some(rest) = s.strip_prefix(from) {
            s = format!("{}{}", to, rest);
        }
    }
    // Path replacement matches against the post-replacement domain.
    for (host, needle, replacement) in PATH_REPLACEMENTS {
        if s.starts_with(host) && s.contains(needle) {
            s = s.replacen(needle, replacement, 1);
        }
    }
    if s.contains(ESTEEM_HOST) && !s.starts_with(ESTEEM_WRAP) {
        s = format!("{}{}", ESTEEM_WRAP, s);
    }
    Url::parse(&s).unwrap_or_else(|_| url.clone())
}

fn try_parse_proxied(token: &str) -> Option<Url> {
    let token = token.split('.').next().unwrap_or_default();
    let decoded = base58_dec(token).ok()?;
    let trimmed = decoded.trim_end_matches('/');
    let url = Url::parse(trimmed).ok()?;
    match url.scheme() {
        "http" | "https" => Some(url),
        _ => None,
    }
}

/// Decode a `/p/:url` token. Deliberately soft-fails to the configured
/// fallback image instead of erroring; the proxy path prefers serving
/// *something* over a 400.
pub fn parse_proxied_url(token: &str, fallback: &Url) -> Url {
    try_parse_proxied(token).unwrap_or_else(|| fallback.clone())
}

/// Parse an absolute http(s) URL or fail with `InvalidProxyUrl`.
pub fn parse_plain_url(s: &str) -> Result<Url, Error> {
    let url = Url::parse(s.trim_end_matches('/')).map_err(|_| Error::InvalidProxyUrl)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(Error::InvalidProxyUrl),
    }
}

/// Exact match for the `{service_url}/0x0` sentinel.
pub fn is_empty_image_url(s: &str, base_url: &str) -> bool {
    s == format!("{}/0x0", base_url)
}

/// Prefix match for `{service_url}/0x0/`.
pub fn starts_with_empty_image_prefix(s: &str, base_url: &str) -> bool {
    s.starts_with(&format!("{}/0x0/", base_url))
}

/// Peel nested self-references: a proxied URL pointing back at our own
/// `/p/<token>` or `/0x0/<url>` is unwrapped until it points elsewhere,
/// bounded to keep pathological input from looping.
pub fn unwrap_proxy_layers(mut url: Url, base_url: &str) -> Url {
    let p_prefix = format!("{}/p/", base_url);
    for _ in 0..MAX_PROXY_DEPTH {
        let s = url.to_string();
        if let Some(rest) = s.strip_prefix(&p_prefix) {
            let token = rest.split(['?', '#']).next().unwrap_or_default();
            match try_parse_proxied(token) {
                Some(inner) => url = inner,
                None => break,
            }
        } else if starts_with_empty_image_prefix(&s, base_url) {
            let inner = &s[base_url.len() + "/0x0/".len()..];
            match Url::parse(inner) {
                Ok(inner) => url = inner,
                Err(_) => break,
            }
        } else {
            break;
        }
    }
    url
}

/// Drop the cache-bypass query parameters so they never reach the orig key.
pub fn strip_cache_params(url: &Url) -> Url {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !matches!(k.as_ref(), "ignorecache" | "invalidate" | "refetch"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut out = url.clone();
    if retained.is_empty() {
        out.set_query(None);
    } else {
        let query: String = retained
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        out.set_query(Some(&query));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(
        w: Option<u32>,
        h: Option<u32>,
        mode: ScalingMode,
        format: OutputFormat,
    ) -> TransformOptions {
        TransformOptions {
            width: w,
            height: h,
            mode,
            format,
        }
    }

    #[test]
    fn base58_round_trips() {
        for s in ["https://example.com/a.jpg", "", "ünïcode", "x".repeat(200).as_str()] {
            assert_eq!(base58_dec(&base58_enc(s)).unwrap(), s);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(base58_dec("not-base58-0OIl").is_err());
        // sha2-256 framed digests are not invertible tokens
        let digest_token = upload_key(b"hello");
        assert!(base58_dec(&digest_token[1..]).is_err());
    }

    #[test]
    fn upload_key_is_deterministic() {
        assert_eq!(upload_key(b"abc"), upload_key(b"abc"));
        assert_ne!(upload_key(b"abc"), upload_key(b"abd"));
        assert!(upload_key(b"abc").starts_with('D'));
    }

    #[test]
    fn proxied_url_round_trips() {
        let fallback = Url::parse("https://images.example.com/fallback.png").unwrap();
        let url = Url::parse("https://example.com/images/cat.jpg").unwrap();
        let token = base58_enc(url.as_str());
        assert_eq!(parse_proxied_url(&token, &fallback), url);
        // extension suffix appended by the legacy redirect is ignored
        assert_eq!(parse_proxied_url(&format!("{}.png", token), &fallback), url);
    }

    #[test]
    fn proxied_url_soft_fails() {
        let fallback = Url::parse("https://images.example.com/fallback.png").unwrap();
        assert_eq!(parse_proxied_url("!!!", &fallback), fallback);
        assert_eq!(
            parse_proxied_url(&base58_enc("not a url"), &fallback),
            fallback
        );
    }

    #[test]
    fn image_key_legacy_form() {
        let o = "Uabc";
        assert_eq!(
            image_key(o, &opts(Some(100), Some(200), ScalingMode::Fit, OutputFormat::Match)),
            "Uabc_100x200"
        );
        assert_eq!(
            image_key(o, &opts(None, None, ScalingMode::Fit, OutputFormat::Match)),
            "Uabc_0x0"
        );
    }

    #[test]
    fn image_key_expanded_form() {
        let o = "Uabc";
        assert_eq!(
            image_key(o, &opts(Some(100), None, ScalingMode::Cover, OutputFormat::Webp)),
            "Uabc_Cover_WEBP_100"
        );
        assert_eq!(
            image_key(o, &opts(None, Some(240), ScalingMode::Fit, OutputFormat::Avif)),
            "Uabc_Fit_AVIF_240"
        );
        assert_eq!(
            image_key(o, &opts(None, None, ScalingMode::Cover, OutputFormat::Match)),
            "Uabc_Cover_Match"
        );
        assert_eq!(
            image_key(o, &opts(Some(1), Some(2), ScalingMode::Fit, OutputFormat::Jpeg)),
            "Uabc_Fit_JPEG_1_2"
        );
    }

    #[test]
    fn canonicalize_applies_tables_in_order() {
        let url = Url::parse("https://img.3speakcontent.online/post.png").unwrap();
        assert_eq!(
            canonicalize(&url).as_str(),
            "https://img.3speakcontent.co/thumbnails/default.png"
        );
        let url = Url::parse("https://img.inleo.io/Dabc/file.jpg").unwrap();
        assert_eq!(
            canonicalize(&url).as_str(),
            "https://img.leopedia.io/Dabc/file.jpg"
        );
    }

    #[test]
    fn canonicalize_wraps_esteem() {
        let url = Url::parse("https://img.esteem.ws/abc.jpg").unwrap();
        let once = canonicalize(&url);
        assert_eq!(once.as_str(), "https://steemitimages.com/0x0/https://img.esteem.ws/abc.jpg");
        assert_eq!(canonicalize(&once), once);
    }

    #[test]
    fn canonicalize_is_idempotent() {
        for raw in [
            "https://example.com/a.jpg",
            "https://img.3speakcontent.online/post.png",
            "https://img.esteem.ws/abc.jpg",
        ] {
            let url = Url::parse(raw).unwrap();
            let once = canonicalize(&url);
            assert_eq!(canonicalize(&once), once);
        }
    }

    #[test]
    fn unwraps_nested_proxy_urls() {
        let base = "https://images.example.com";
        let target = Url::parse("https://example.com/cat.jpg").unwrap();
        let once = Url::parse(&format!("{}/p/{}", base, base58_enc(target.as_str()))).unwrap();
        let twice = Url::parse(&format!("{}/p/{}", base, base58_enc(once.as_str()))).unwrap();
        assert_eq!(unwrap_proxy_layers(twice, base), target);

        let zeroed = Url::parse(&format!("{}/0x0/https://example.com/cat.jpg", base)).unwrap();
        assert_eq!(unwrap_proxy_layers(zeroed, base), target);
    }

    #[test]
    fn empty_image_sentinels() {
        let base = "https://images.example.com";
        assert!(is_empty_image_url("https://images.example.com/0x0", base));
        assert!(!is_empty_image_url("https://images.example.com/0x0/x", base));
        assert!(starts_with_empty_image_prefix(
            "https://images.example.com/0x0/https://a/b.png",
            base
        ));
    }

    #[test]
    fn strip_cache_params_is_idempotent() {
        let url =
            Url::parse("https://example.com/a.jpg?width=10&ignorecache=1&refetch=1&invalidate=1")
                .unwrap();
        let stripped = strip_cache_params(&url);
        assert_eq!(stripped.as_str(), "https://example.com/a.jpg?width=10");
        assert_eq!(strip_cache_params(&stripped), stripped);
    }
}
