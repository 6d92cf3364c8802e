//! HTTP endpoint glue. Handlers stay thin: parse, admit, delegate to the
//! proxy engine or the stores, shape the response.

use crate::accept::{supports_avif, supports_webp};
use crate::error::Error;
use crate::keys;
use crate::proxy::{self, ProxyRequest};
use crate::rpc;
use crate::signature::{self, Credentials};
use crate::sniff;
use crate::store::StoreError;
use crate::transform::{CacheFlags, OutputFormat, ScalingMode, TransformOptions};
use crate::AppState;
use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use url::Url;

const COVER_WIDTH: u32 = 1344;
const COVER_HEIGHT: u32 = 240;
const AVATAR_SMALL: u32 = 64;
const AVATAR_MEDIUM: u32 = 128;
const AVATAR_LARGE: u32 = 512;

/// Mirrors consulted when an upload key misses locally.
const SERVE_MIRRORS: &[&str] = &["https://images.hive.blog", "https://steemitimages.com"];

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn accept_header(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, header::ACCEPT)
}

/// `GET /`, `/healthcheck`, `/.well-known/healthcheck.json`
pub async fn health() -> Response {
    let date = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    let body = json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "date": date,
    });
    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn legacy_dims(segment: &str) -> Option<(u32, u32)> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"^(\d+)x(\d+)$").expect("dims regex"));
    let caps = re.captures(segment)?;
    let w = caps[1].parse().ok()?;
    let h = caps[2].parse().ok()?;
    Some((w, h))
}

fn moved_permanently(location: String) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(loc) = HeaderValue::from_str(&location) {
        headers.insert(header::LOCATION, loc);
    }
    (StatusCode::MOVED_PERMANENTLY, headers).into_response()
}

/// `/:W x :H/:url` family: encode the raw target and bounce the client to
/// the canonical `/p/` form.
fn legacy_redirect(w: u32, h: u32, raw_url: &str) -> Response {
    let token = keys::base58_enc(raw_url);
    moved_permanently(format!(
        "/p/{}.png?format=match&mode=fit&width={}&height={}",
        token, w, h
    ))
}

/// Multi-segment legacy resize URLs (`/500x300/https://…`) land in the
/// router fallback since the target spans path segments.
pub async fn legacy_resize_fallback(uri: Uri) -> Result<Response, Error> {
    let path = uri.path().trim_start_matches('/');
    if let Some((dims, rest)) = path.split_once('/') {
        if let Some((w, h)) = legacy_dims(dims) {
            if !rest.is_empty() {
                return Ok(legacy_redirect(w, h, rest));
            }
        }
    }
    Err(Error::NotFound)
}

/// `GET /webp/*`: historical prefix, now a plain redirect.
pub async fn webp_redirect(uri: Uri) -> Response {
    let rest = uri
        .path()
        .strip_prefix("/webp")
        .filter(|p| !p.is_empty())
        .unwrap_or("/");
    let location = match uri.query() {
        Some(q) => format!("{}?{}", rest, q),
        None => rest.to_string(),
    };
    moved_permanently(location)
}

async fn serve_upload_key(
    state: &AppState,
    hash: &str,
    if_none_match: Option<&str>,
) -> Result<Response, Error> {
    match state.upload_store.read(hash).await {
        Ok(bytes) => {
            let etag = format!("\"{}\"", hash);
            if let Some(inm) = if_none_match {
                if inm.contains(etag.as_str()) {
                    let mut headers = HeaderMap::new();
                    if let Ok(tag) = HeaderValue::from_str(&etag) {
                        headers.insert(header::ETAG, tag);
                    }
                    return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
                }
            }
            let content_type = sniff::content_type(&bytes[..bytes.len().min(512)])
                .unwrap_or("application/octet-stream");
            let mut headers = HeaderMap::new();
            if let Ok(ct) = HeaderValue::from_str(content_type) {
                headers.insert(header::CONTENT_TYPE, ct);
            }
            if let Ok(tag) = HeaderValue::from_str(&etag) {
                headers.insert(header::ETAG, tag);
            }
            headers.insert(header::VARY, HeaderValue::from_static("Accept"));
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("public,max-age=31536000,immutable"),
            );
            Ok((StatusCode::OK, headers, Body::from(bytes)).into_response())
        }
        Err(StoreError::NotFound(_)) => {
            // Miss: write-through from the mirror CDNs, but still 404 so the
            // client retries through /p/. Intentional, not a bug.
            for mirror in SERVE_MIRRORS {
                let url = format!("{}/{}", mirror, hash);
                match state
                    .fetcher
                    .fetch_one(&url, crate::fetch::DEFAULT_FETCH_TIMEOUT, None)
                    .await
                {
                    Ok(bytes) => {
                        if let Err(e) = state.upload_store.write(hash, &bytes).await {
                            tracing::warn!(key = hash, error = %e, "mirror write-through failed");
                        }
                        break;
                    }
                    Err(reason) => {
                        tracing::debug!(url = %url, %reason, "mirror miss");
                    }
                }
            }
            Err(Error::NotFound)
        }
        Err(e) => Err(Error::InternalError(e.to_string())),
    }
}

/// `GET /:hash` serves upload-store bytes.
pub async fn serve_file(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    if legacy_dims(&hash).is_some() {
        return Err(Error::NotFound);
    }
    serve_upload_key(&state, &hash, header_str(&headers, header::IF_NONE_MATCH)).await
}

/// `GET /:hash/:filename`. The filename is cosmetic; a `WxH` first segment
/// flips this into the legacy resize redirect instead.
pub async fn serve_file_named(
    State(state): State<Arc<AppState>>,
    Path((hash, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    if let Some((w, h)) = legacy_dims(&hash) {
        return Ok(legacy_redirect(w, h, &filename));
    }
    serve_upload_key(&state, &hash, header_str(&headers, header::IF_NONE_MATCH)).await
}

/// Resolve `format=match` against the caller's `Accept` header: AVIF when
/// supported, else WEBP, else keep the source format.
fn negotiate(format: OutputFormat, accept: Option<&str>) -> OutputFormat {
    if format != OutputFormat::Match {
        return format;
    }
    if supports_avif(accept) {
        OutputFormat::Avif
    } else if supports_webp(accept) {
        OutputFormat::Webp
    } else {
        OutputFormat::Match
    }
}

/// `GET /p/:url`
pub async fn proxy_image(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let (mut opts, flags) = TransformOptions::from_query(&query)?;
    opts.format = negotiate(opts.format, accept_header(&headers));

    let base_url = state.cfg.base_url();
    let mut url = keys::parse_proxied_url(&token, &state.default_avatar_url);
    url = keys::unwrap_proxy_layers(url, base_url);
    url = keys::canonicalize(&url);

    let mut short_ttl = false;
    if keys::is_empty_image_url(url.as_str(), base_url)
        || state.blacklist.is_image_blacklisted(url.as_str())
    {
        url = state.default_avatar_url.clone();
        short_ttl = true;
    }

    respond_with(state.as_ref(), url, opts, flags, short_ttl, &headers).await
}

fn avatar_size(size: Option<&str>) -> Result<u32, Error> {
    match size {
        None | Some("medium") => Ok(AVATAR_MEDIUM),
        Some("small") => Ok(AVATAR_SMALL),
        Some("large") => Ok(AVATAR_LARGE),
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| Error::InvalidParam("size".into())),
    }
}

async fn profile_for(state: &AppState, username: &str) -> Result<rpc::Profile, Error> {
    if !rpc::is_valid_account_name(username) {
        return Err(Error::NoSuchAccount(username.to_string()));
    }
    state
        .directory
        .profile(username)
        .await?
        .ok_or_else(|| Error::NoSuchAccount(username.to_string()))
}

/// Resolve a profile-supplied image URL, treating absent, empty-sentinel,
/// unparseable and blacklisted values as "use the default".
fn resolve_profile_url(
    state: &AppState,
    username: &str,
    configured: Option<&str>,
    default_url: &Url,
) -> (Url, bool) {
    let base_url = state.cfg.base_url();
    if state.blacklist.is_account_blacklisted(username) {
        return (default_url.clone(), true);
    }
    let candidate = match configured {
        Some(s) if !keys::is_empty_image_url(s, base_url) => s,
        _ => return (default_url.clone(), false),
    };
    match keys::parse_plain_url(candidate) {
        Ok(url) => {
            let url = keys::canonicalize(&keys::unwrap_proxy_layers(url, base_url));
            if state.blacklist.is_image_blacklisted(url.as_str()) {
                (default_url.clone(), true)
            } else {
                (url, false)
            }
        }
        Err(_) => (default_url.clone(), false),
    }
}

async fn respond_with(
    state: &AppState,
    url: Url,
    opts: TransformOptions,
    flags: CacheFlags,
    short_ttl: bool,
    headers: &HeaderMap,
) -> Result<Response, Error> {
    let request = ProxyRequest {
        token: keys::base58_enc(url.as_str()),
        url,
        opts,
        flags,
        short_ttl,
        user_agent: header_str(headers, header::USER_AGENT).map(str::to_string),
        if_none_match: header_str(headers, header::IF_NONE_MATCH).map(str::to_string),
    };
    proxy::respond(state, request).await
}

/// `GET /u/:username/avatar`
pub async fn avatar(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    serve_avatar(state, username, None, query, headers).await
}

/// `GET /u/:username/avatar/:size`
pub async fn avatar_sized(
    State(state): State<Arc<AppState>>,
    Path((username, size)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    serve_avatar(state, username, Some(size), query, headers).await
}

async fn serve_avatar(
    state: Arc<AppState>,
    username: String,
    size: Option<String>,
    query: HashMap<String, String>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let size = avatar_size(size.as_deref())?;
    let profile = profile_for(&state, &username).await?;
    let (url, short_ttl) = resolve_profile_url(
        &state,
        &username,
        profile.profile_image(),
        &state.default_avatar_url,
    );

    let (_, flags) = TransformOptions::from_query(&query)?;
    let accept = accept_header(&headers);
    let opts = TransformOptions {
        width: Some(size),
        height: Some(size),
        mode: ScalingMode::Cover,
        format: if supports_webp(accept) {
            OutputFormat::Webp
        } else {
            OutputFormat::Match
        },
    };
    respond_with(state.as_ref(), url, opts, flags, short_ttl, &headers).await
}

/// `GET /u/:username/cover`
pub async fn cover(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let profile = profile_for(&state, &username).await?;
    let (url, short_ttl) = resolve_profile_url(
        &state,
        &username,
        profile.cover_image(),
        &state.default_cover_url,
    );

    let (_, flags) = TransformOptions::from_query(&query)?;
    let accept = accept_header(&headers);
    let opts = TransformOptions {
        width: Some(COVER_WIDTH),
        height: Some(COVER_HEIGHT),
        mode: ScalingMode::Fit,
        format: if supports_avif(accept) {
            OutputFormat::Avif
        } else if supports_webp(accept) {
            OutputFormat::Webp
        } else {
            OutputFormat::Match
        },
    };
    respond_with(state.as_ref(), url, opts, flags, short_ttl, &headers).await
}

/// `POST /:username/:signature`
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Path((username, sig_param)): Path<(String, String)>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, Error> {
    let credentials = signature::parse_credentials(&sig_param)?;
    if let Credentials::Token(token) = &credentials {
        if token.author() != username {
            return Err(Error::InvalidSignature);
        }
    }
    handle_upload(&state, &username, credentials, &headers, multipart).await
}

/// `POST /hs/:accesstoken`. The token carries its own author.
pub async fn upload_hs(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, Error> {
    let token = signature::decode_token(&token)?;
    let username = token.author().to_string();
    handle_upload(
        &state,
        &username,
        Credentials::Token(token),
        &headers,
        multipart,
    )
    .await
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" | "image/svg" => "svg",
        "image/bmp" => "bmp",
        "image/avif" => "avif",
        _ => "png",
    }
}

async fn first_file_part(multipart: &mut Multipart) -> Result<(Vec<u8>, Option<String>), Error> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(format!("invalid multipart: {}", e)))?
    {
        if field.file_name().is_none() && field.content_type().is_none() {
            continue;
        }
        let name = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| Error::BadRequest(format!("invalid multipart: {}", e)))?;
        return Ok((bytes.to_vec(), name));
    }
    Err(Error::FileMissing)
}

async fn handle_upload(
    state: &AppState,
    username: &str,
    credentials: Credentials,
    headers: &HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, Error> {
    let limit = state.cfg.max_image_size;
    let declared: u64 = header_str(headers, header::CONTENT_LENGTH)
        .and_then(|v| v.parse().ok())
        .ok_or(Error::LengthRequired)?;
    if declared > limit {
        return Err(Error::PayloadTooLarge { limit });
    }

    let (bytes, filename) = first_file_part(&mut multipart).await?;
    if bytes.is_empty() {
        return Err(Error::FileMissing);
    }
    if bytes.len() as u64 > limit {
        return Err(Error::PayloadTooLarge { limit });
    }
    let content_type = sniff::content_type(&bytes)
        .filter(|ct| sniff::is_accepted_type(ct))
        .ok_or_else(|| Error::InvalidImage("unsupported content type".into()))?;

    // Admission checks run in order (account, signature, blacklist, quota,
    // reputation), all before any store write.
    if !rpc::is_valid_account_name(username) {
        return Err(Error::NoSuchAccount(username.to_string()));
    }
    let account = state
        .directory
        .account(username)
        .await?
        .ok_or_else(|| Error::NoSuchAccount(username.to_string()))?;
    match &credentials {
        Credentials::Direct(sig) => signature::verify_direct(sig, &bytes, &account)?,
        Credentials::Token(token) => {
            signature::verify_token(token, &account, &state.cfg.upload_limits)?
        }
    }
    if state.blacklist.is_account_blacklisted(username) {
        return Err(Error::Blacklisted);
    }
    let quota = state.limiter.check(username).await;
    if !quota.allowed {
        return Err(Error::QoutaExceeded { reset: quota.reset });
    }
    let reputation = state
        .directory
        .profile(username)
        .await?
        .map(|p| p.reputation)
        .unwrap_or(0.0);
    if reputation < state.cfg.upload_limits.reputation {
        return Err(Error::Deplorable);
    }

    let key = keys::upload_key(&bytes);
    // Quota is spent by now; a failed write does not refund it.
    state
        .upload_store
        .write(&key, &bytes)
        .await
        .map_err(|e| Error::InternalError(e.to_string()))?;

    let filename = filename
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("image.{}", extension_for(content_type)));
    tracing::info!(account = username, key = %key, size = bytes.len(), "upload accepted");
    let url = format!("{}/{}/{}", state.cfg.base_url(), key, filename);
    Ok(Json(json!({ "url": url })).into_response())
}
