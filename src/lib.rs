pub mod accept;
pub mod blacklist;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fetch;
pub mod handlers;
pub mod keys;
pub mod limits;
pub mod proxy;
pub mod purge;
pub mod rpc;
pub mod signature;
pub mod sniff;
pub mod store;
pub mod transform;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::collections::HashSet;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use url::Url;

pub use config::Config;
pub use error::{Error, Result};

use blacklist::Blacklist;
use fetch::Fetcher;
use limits::{MemoryLimiter, RateLimiter, RedisLimiter};
use purge::CdnPurge;
use rpc::{Directory, RpcDirectory};
use store::BlobStore;

/// Process-wide singletons handed to handlers by reference; everything here
/// outlives any request.
pub struct AppState {
    pub cfg: Config,
    pub upload_store: Arc<dyn BlobStore>,
    pub proxy_store: Arc<dyn BlobStore>,
    pub blacklist: Arc<Blacklist>,
    pub fetcher: Fetcher,
    pub directory: Arc<dyn Directory>,
    pub limiter: Arc<dyn RateLimiter>,
    pub purge: Arc<CdnPurge>,
    pub default_avatar_url: Url,
    pub default_cover_url: Url,
}

impl AppState {
    /// Wire up all collaborators from config.
    pub async fn build(cfg: Config) -> Result<Arc<Self>> {
        let fetcher = Fetcher::new();
        let client = fetcher.client().clone();

        let upload_store = store::open(&cfg.upload_store, "upload")
            .await
            .map_err(|e| Error::InternalError(e.to_string()))?;
        let proxy_store = store::open(&cfg.proxy_store.store, "proxy")
            .await
            .map_err(|e| Error::InternalError(e.to_string()))?;

        let load_seed = |path: &Option<std::path::PathBuf>| -> HashSet<String> {
            match path {
                Some(path) => match blacklist::load_seed(path) {
                    Ok(set) => set,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "seed load failed");
                        HashSet::new()
                    }
                },
                None => HashSet::new(),
            }
        };
        let image_seed = load_seed(&cfg.blacklist.images_seed);
        let account_seed = load_seed(&cfg.blacklist.accounts_seed);
        let blacklist = Arc::new(Blacklist::seeded(image_seed.clone(), account_seed.clone()));
        blacklist::spawn_refresher(
            blacklist.clone(),
            cfg.blacklist.clone(),
            client.clone(),
            image_seed,
            account_seed,
        );

        let directory: Arc<dyn Directory> =
            Arc::new(RpcDirectory::new(client.clone(), cfg.rpc_node.clone()));

        let limiter: Arc<dyn RateLimiter> = match &cfg.redis_url {
            Some(url) => {
                match RedisLimiter::connect(url, cfg.upload_limits.duration, cfg.upload_limits.max)
                    .await
                {
                    Ok(limiter) => Arc::new(limiter),
                    Err(e) => {
                        tracing::warn!(error = %e, "redis unavailable, using in-process limiter");
                        Arc::new(MemoryLimiter::new(
                            cfg.upload_limits.duration,
                            cfg.upload_limits.max,
                        ))
                    }
                }
            }
            None => Arc::new(MemoryLimiter::new(
                cfg.upload_limits.duration,
                cfg.upload_limits.max,
            )),
        };

        let purge = Arc::new(CdnPurge::new(
            client,
            cfg.cloudflare_token.clone(),
            cfg.cloudflare_zone.clone(),
        ));

        let default_avatar_url = Url::parse(&cfg.default_avatar)
            .map_err(|e| Error::InternalError(format!("default_avatar: {}", e)))?;
        let default_cover_url = Url::parse(&cfg.default_cover)
            .map_err(|e| Error::InternalError(format!("default_cover: {}", e)))?;

        Ok(Arc::new(Self {
            cfg,
            upload_store,
            proxy_store,
            blacklist,
            fetcher,
            directory,
            limiter,
            purge,
            default_avatar_url,
            default_cover_url,
        }))
    }

    /// Assemble a state from explicit collaborators; used by tests to swap
    /// in memory stores and a stubbed chain directory.
    pub fn from_parts(
        cfg: Config,
        upload_store: Arc<dyn BlobStore>,
        proxy_store: Arc<dyn BlobStore>,
        blacklist: Arc<Blacklist>,
        fetcher: Fetcher,
        directory: Arc<dyn Directory>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Arc<Self> {
        let default_avatar_url = Url::parse(&cfg.default_avatar).expect("default_avatar url");
        let default_cover_url = Url::parse(&cfg.default_cover).expect("default_cover url");
        let purge = Arc::new(CdnPurge::new(
            fetcher.client().clone(),
            cfg.cloudflare_token.clone(),
            cfg.cloudflare_zone.clone(),
        ));
        Arc::new(Self {
            cfg,
            upload_store,
            proxy_store,
            blacklist,
            fetcher,
            directory,
            limiter,
            purge,
            default_avatar_url,
            default_cover_url,
        })
    }
}

/// The public URL surface. Overlapping legacy routes (`/:W x :H/:url` with
/// a multi-segment target) are resolved in the fallback.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.cfg.max_image_size as usize + 1024 * 1024;
    Router::new()
        .route("/", get(handlers::health))
        .route("/healthcheck", get(handlers::health))
        .route("/.well-known/healthcheck.json", get(handlers::health))
        .route("/p/:url", get(handlers::proxy_image))
        .route("/u/:username/avatar", get(handlers::avatar))
        .route("/u/:username/avatar/:size", get(handlers::avatar_sized))
        .route("/u/:username/cover", get(handlers::cover))
        .route("/hs/:token", post(handlers::upload_hs))
        .route("/webp/*rest", get(handlers::webp_redirect))
        .route("/:hash", get(handlers::serve_file))
        .route(
            "/:hash/:filename",
            get(handlers::serve_file_named).post(handlers::upload),
        )
        .fallback(handlers::legacy_resize_fallback)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
