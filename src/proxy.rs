//! Transform cache engine: maps `(orig key, options)` to a stored artifact
//! and fills misses through the fetch + transcode pipeline.
//!
//! Duplicate concurrent misses may each do the work; writes are idempotent
//! per key so the race is wasteful but correct.

use crate::error::Error;
use crate::fetch::{FetchOptions, DEFAULT_FETCH_TIMEOUT};
use crate::keys;
use crate::sniff;
use crate::store::{BlobStore, StoreError};
use crate::transform::{self, CacheFlags, TransformOptions};
use crate::AppState;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use url::Url;

const SNIFF_WINDOW: usize = 16 * 1024;

const CACHE_IMMUTABLE: &str = "public,max-age=31536000,immutable";
const CACHE_FRESH: &str = "public,max-age=3600,stale-while-revalidate=86400";
const CACHE_SHORT: &str = "public,max-age=600";
const CACHE_BYPASS: &str = "no-cache,must-revalidate";

/// A fully resolved proxy request: canonical target plus transform options.
pub struct ProxyRequest {
    pub url: Url,
    /// Base58 token of the target, used for the `/p/` mirror candidates
    /// and the CDN purge URL.
    pub token: String,
    pub opts: TransformOptions,
    pub flags: CacheFlags,
    /// Forces the short cache TTL, e.g. for blacklist substitutions.
    pub short_ttl: bool,
    pub user_agent: Option<String>,
    pub if_none_match: Option<String>,
}

enum Origin {
    /// The target is one of our own upload keys; bytes come from the
    /// upload store directly instead of a self-HTTP round trip.
    Upload(String),
    Remote(String),
}

impl Origin {
    fn key(&self) -> &str {
        match self {
            Origin::Upload(k) | Origin::Remote(k) => k,
        }
    }
}

fn classify(url: &Url, base_url: &str) -> Origin {
    if let Some(rest) = url.as_str().strip_prefix(&format!("{}/", base_url)) {
        let first = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if first.len() > 1 && first.starts_with('D') {
            return Origin::Upload(first.to_string());
        }
    }
    Origin::Remote(keys::remote_key(&keys::strip_cache_params(url)))
}

fn sniffed_type(bytes: &[u8]) -> &'static str {
    sniff::content_type(&bytes[..bytes.len().min(SNIFF_WINDOW)])
        .unwrap_or("application/octet-stream")
}

fn image_response(bytes: Bytes, content_type: &str, etag: &str, cache_control: &str) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(ct) = HeaderValue::from_str(content_type) {
        headers.insert(header::CONTENT_TYPE, ct);
    }
    if let Ok(tag) = HeaderValue::from_str(etag) {
        headers.insert(header::ETAG, tag);
    }
    headers.insert(header::VARY, HeaderValue::from_static("Accept"));
    if let Ok(cc) = HeaderValue::from_str(cache_control) {
        headers.insert(header::CACHE_CONTROL, cc);
    }
    (StatusCode::OK, headers, Body::from(bytes)).into_response()
}

fn not_modified(etag: &str) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(tag) = HeaderValue::from_str(etag) {
        headers.insert(header::ETAG, tag);
    }
    headers.insert(header::VARY, HeaderValue::from_static("Accept"));
    (StatusCode::NOT_MODIFIED, headers).into_response()
}

async fn evict_quietly(store: &dyn BlobStore, key: &str) {
    if let Err(e) = store.remove(key).await {
        tracing::warn!(store = store.name(), key, error = %e, "evict failed");
    }
}

/// Read a cached original and validate it still looks like an image we
/// accept; corrupt or foreign entries are evicted and treated as a miss.
async fn read_cached_original(store: &dyn BlobStore, key: &str) -> Option<Bytes> {
    match store.read(key).await {
        Ok(bytes) => {
            let content_type = sniffed_type(&bytes);
            if sniff::is_accepted_type(content_type) || content_type == "video/mp4" {
                Some(Bytes::from(bytes))
            } else {
                tracing::info!(key, content_type, "evicting non-image original");
                evict_quietly(store, key).await;
                None
            }
        }
        Err(StoreError::NotFound(_)) => None,
        Err(e) => {
            tracing::warn!(store = store.name(), key, error = %e, "original read failed");
            None
        }
    }
}

/// Serve a transformed image per the cache protocol: conditional request,
/// explicit eviction, artifact hit, original hit, full miss.
pub async fn respond(state: &AppState, req: ProxyRequest) -> Result<Response, Error> {
    let base_url = state.cfg.base_url();
    let origin = classify(&req.url, base_url);
    let orig_key = origin.key().to_string();
    let image_key = keys::image_key(&orig_key, &req.opts);
    let etag = format!("W/\"{}\"", image_key);
    let bypass = req.flags.bypass();

    if !bypass {
        if let Some(inm) = &req.if_none_match {
            if inm.contains(etag.as_str()) {
                return Ok(not_modified(&etag));
            }
        }
    }

    let public_url = format!("{}/p/{}", base_url, req.token);
    if req.flags.refetch {
        evict_quietly(state.proxy_store.as_ref(), &image_key).await;
        if let Origin::Remote(key) = &origin {
            evict_quietly(state.proxy_store.as_ref(), key).await;
        }
        state.purge.purge(&public_url).await;
    } else if req.flags.invalidate {
        state.purge.purge(&public_url).await;
    }

    // Artifact hit: canonical response for this image key.
    if !bypass {
        match state.proxy_store.read(&image_key).await {
            Ok(bytes) => {
                let bytes = Bytes::from(bytes);
                let content_type = sniffed_type(&bytes);
                return Ok(image_response(bytes, content_type, &etag, CACHE_IMMUTABLE));
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(key = %image_key, error = %e, "artifact read failed, rebuilding");
                evict_quietly(state.proxy_store.as_ref(), &image_key).await;
            }
        }
    }

    // Original: cached store copy, or the mirror ladder.
    let fetch_opts = FetchOptions {
        timeout: DEFAULT_FETCH_TIMEOUT,
        skip_urls: Vec::new(),
        user_agent: req.user_agent.clone(),
    };
    let mut is_fallback = false;
    let mut from_cache = false;
    let orig_bytes: Bytes = match &origin {
        Origin::Upload(key) => match state.upload_store.read(key).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(StoreError::NotFound(_)) => return Err(Error::NotFound),
            Err(e) => return Err(Error::InternalError(e.to_string())),
        },
        Origin::Remote(key) => {
            let cached = if bypass {
                None
            } else {
                read_cached_original(state.proxy_store.as_ref(), key).await
            };
            match cached {
                Some(bytes) => {
                    from_cache = true;
                    bytes
                }
                None => {
                    let fetched = state
                        .fetcher
                        .fetch(
                            req.url.as_str(),
                            &req.token,
                            &state.cfg.default_avatar,
                            &fetch_opts,
                        )
                        .await?;
                    is_fallback = fetched.is_fallback;
                    // Write the original first so concurrent misses can reuse it.
                    if !is_fallback && fetched.bytes.len() as u64 <= state.cfg.max_image_size {
                        if let Err(e) = state.proxy_store.write(key, &fetched.bytes).await {
                            tracing::warn!(key = %key, error = %e, "original write failed");
                        }
                    }
                    fetched.bytes
                }
            }
        }
    };

    // Transcode, with one ladder retry skipping the source that produced
    // undecodable bytes.
    let output = match transform::transform(&orig_bytes, &req.opts, &state.cfg.proxy_store) {
        Ok(output) => output,
        Err(err) => {
            if from_cache {
                evict_quietly(state.proxy_store.as_ref(), &orig_key).await;
            }
            if matches!(origin, Origin::Upload(_)) {
                return Err(err);
            }
            let retry_opts = FetchOptions {
                skip_urls: vec![req.url.to_string()],
                ..fetch_opts
            };
            let retried = state
                .fetcher
                .fetch(
                    req.url.as_str(),
                    &req.token,
                    &state.cfg.default_avatar,
                    &retry_opts,
                )
                .await
                .map_err(|_| Error::InvalidImage(err.to_string()))?;
            is_fallback = true;
            transform::transform(&retried.bytes, &req.opts, &state.cfg.proxy_store)
                .map_err(|_| Error::InvalidImage(err.to_string()))?
        }
    };

    if !is_fallback {
        if let Err(e) = state.proxy_store.write(&image_key, &output.bytes).await {
            tracing::warn!(key = %image_key, error = %e, "artifact write failed");
        }
    }

    let cache_control = if bypass {
        CACHE_BYPASS
    } else if is_fallback || req.short_ttl {
        CACHE_SHORT
    } else {
        CACHE_FRESH
    };
    Ok(image_response(
        Bytes::from(output.bytes),
        output.content_type,
        &etag,
        cache_control,
    ))
}
