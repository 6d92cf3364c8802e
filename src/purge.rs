//! Best-effort CDN purge. Eviction correctness never depends on this; a
//! failed purge only means the edge serves stale bytes until TTL.

use serde_json::json;

pub struct CdnPurge {
    client: reqwest::Client,
    token: Option<String>,
    zone: Option<String>,
}

impl CdnPurge {
    pub fn new(client: reqwest::Client, token: Option<String>, zone: Option<String>) -> Self {
        Self {
            client,
            token,
            zone,
        }
    }

    pub fn enabled(&self) -> bool {
        self.token.is_some() && self.zone.is_some()
    }

    pub async fn purge(&self, url: &str) {
        let (Some(token), Some(zone)) = (&self.token, &self.zone) else {
            return;
        };
        let endpoint = format!(
            "https://api.cloudflare.com/client/v4/zones/{}/purge_cache",
            zone
        );
        let result = self
            .client
            .post(&endpoint)
            .bearer_auth(token)
            .json(&json!({ "files": [url] }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(url, "cdn purge ok");
            }
            Ok(resp) => {
                tracing::warn!(url, status = %resp.status(), "cdn purge rejected");
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "cdn purge failed");
            }
        }
    }
}
