//! DMCA / abuse blacklist: a static seed unioned with periodically
//! refreshed remote sets. Lookups are synchronous over an atomically
//! swapped snapshot; the refresher never blocks a request.

use crate::config::BlacklistConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const MAX_FAIL_COUNT: u32 = 5;

/// Remote or seed file payload: either a bare JSON list or wrapped under a
/// `blacklist` field.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BlacklistFile {
    Entries(Vec<String>),
    Wrapped { blacklist: Vec<String> },
}

impl BlacklistFile {
    fn into_entries(self) -> Vec<String> {
        match self {
            BlacklistFile::Entries(entries) => entries,
            BlacklistFile::Wrapped { blacklist } => blacklist,
        }
    }
}

fn normalize(entry: &str) -> String {
    entry.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn parse_body(body: &str) -> Vec<String> {
    match serde_json::from_str::<BlacklistFile>(body) {
        Ok(file) => file.into_entries(),
        // some blacklist endpoints serve newline-separated plain text
        Err(_) => body.lines().map(str::to_string).collect(),
    }
}

pub struct Blacklist {
    images: RwLock<Arc<HashSet<String>>>,
    accounts: RwLock<Arc<HashSet<String>>>,
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new()
    }
}

impl Blacklist {
    pub fn new() -> Self {
        Self {
            images: RwLock::new(Arc::new(HashSet::new())),
            accounts: RwLock::new(Arc::new(HashSet::new())),
        }
    }

    /// Build with fixed contents; used by tests and as the seed snapshot.
    pub fn seeded(images: HashSet<String>, accounts: HashSet<String>) -> Self {
        let normalized = |set: HashSet<String>| {
            Arc::new(set.iter().map(|e| normalize(e)).collect::<HashSet<_>>())
        };
        Self {
            images: RwLock::new(normalized(images)),
            accounts: RwLock::new(normalized(accounts)),
        }
    }

    pub fn is_image_blacklisted(&self, url: &str) -> bool {
        self.images
            .read()
            .expect("blacklist lock")
            .contains(&normalize(url))
    }

    pub fn is_account_blacklisted(&self, name: &str) -> bool {
        self.accounts
            .read()
            .expect("blacklist lock")
            .contains(&normalize(name))
    }

    fn swap(&self, images: HashSet<String>, accounts: HashSet<String>) {
        *self.images.write().expect("blacklist lock") = Arc::new(images);
        *self.accounts.write().expect("blacklist lock") = Arc::new(accounts);
    }
}

/// Read a seed file (JSON list, or newline text) into a normalized set.
pub fn load_seed(path: &std::path::Path) -> std::io::Result<HashSet<String>> {
    let body = std::fs::read_to_string(path)?;
    Ok(parse_body(&body).iter().map(|e| normalize(e)).collect())
}

async fn fetch_set(
    client: &reqwest::Client,
    url: &str,
) -> Result<HashSet<String>, reqwest::Error> {
    let body = client
        .get(url)
        .timeout(Duration::from_secs(10))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(parse_body(&body).iter().map(|e| normalize(e)).collect())
}

/// Background refresh loop. Remote sets are unioned with the seed; on
/// failure the last good snapshot keeps serving and the refresher backs
/// off after `MAX_FAIL_COUNT` consecutive misses.
pub fn spawn_refresher(
    blacklist: Arc<Blacklist>,
    cfg: BlacklistConfig,
    client: reqwest::Client,
    image_seed: HashSet<String>,
    account_seed: HashSet<String>,
) {
    if cfg.images_url.is_none() && cfg.accounts_url.is_none() {
        return;
    }
    tokio::spawn(async move {
        let ttl = Duration::from_millis(cfg.cache_ttl.max(1_000));
        let mut fails: u32 = 0;
        loop {
            let mut ok = true;
            let mut images = image_seed.clone();
            let mut accounts = account_seed.clone();
            if let Some(url) = &cfg.images_url {
                match fetch_set(&client, url).await {
                    Ok(set) => images.extend(set),
                    Err(e) => {
                        tracing::warn!(url = %url, error = %e, "image blacklist refresh failed");
                        ok = false;
                    }
                }
            }
            if let Some(url) = &cfg.accounts_url {
                match fetch_set(&client, url).await {
                    Ok(set) => accounts.extend(set),
                    Err(e) => {
                        tracing::warn!(url = %url, error = %e, "account blacklist refresh failed");
                        ok = false;
                    }
                }
            }
            if ok {
                fails = 0;
                tracing::debug!(
                    images = images.len(),
                    accounts = accounts.len(),
                    "blacklist refreshed"
                );
                blacklist.swap(images, accounts);
            } else {
                fails += 1;
            }
            let sleep = if fails >= MAX_FAIL_COUNT { ttl * 3 } else { ttl };
            tokio::time::sleep(sleep).await;
        }
    });
}
