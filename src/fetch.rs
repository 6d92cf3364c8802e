//! Upstream fetch with an ordered mirror ladder.
//!
//! Candidates are tried strictly in order, one at a time; parallel fan-out
//! would defeat the mirror preference and amplify load on every mirror.

use crate::error::Error;
use bytes::Bytes;
use std::time::Duration;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_USER_AGENT: &str = concat!("imagehoster/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    /// Candidates to skip, e.g. a source that already served corrupt bytes.
    pub skip_urls: Vec<String>,
    /// Forwarded from the requesting client when present.
    pub user_agent: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            skip_urls: Vec::new(),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct Fetched {
    pub bytes: Bytes,
    /// True when the bytes came from the configured default image rather
    /// than any real mirror; such responses get a short cache TTL.
    pub is_fallback: bool,
}

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .connect_timeout(DEFAULT_FETCH_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client }
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Mirror ladder for a proxied image: the raw URL first, then the
    /// public mirrors by preference, then mirrors of the encoded form.
    fn candidates(url_string: &str, url_params: &str) -> Vec<String> {
        vec![
            url_string.to_string(),
            format!("https://images.hive.blog/0x0/{}", url_string),
            format!("https://steemitimages.com/0x0/{}", url_string),
            format!("https://wsrv.nl/?url={}", url_string),
            format!("https://img.leopedia.io/0x0/{}", url_string),
            format!("https://images.hive.blog/p/{}", url_params),
            format!("https://steemitimages.com/p/{}", url_params),
        ]
    }

    /// Single GET with the ladder's acceptance rule: 2xx and a non-empty
    /// body. Everything else is reported as an error string.
    pub async fn fetch_one(
        &self,
        url: &str,
        timeout: Duration,
        user_agent: Option<&str>,
    ) -> Result<Bytes, String> {
        let resp = self
            .client
            .get(url)
            .header(
                reqwest::header::USER_AGENT,
                user_agent.unwrap_or(DEFAULT_USER_AGENT),
            )
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("upstream status {}", status));
        }
        let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
        if bytes.is_empty() {
            return Err("empty body".to_string());
        }
        Ok(bytes)
    }

    /// Walk the ladder, then the default image, then give up.
    pub async fn fetch(
        &self,
        url_string: &str,
        url_params: &str,
        default_url: &str,
        opts: &FetchOptions,
    ) -> Result<Fetched, Error> {
        for candidate in Self::candidates(url_string, url_params) {
            if opts.skip_urls.iter().any(|s| s == &candidate) {
                continue;
            }
            match self
                .fetch_one(&candidate, opts.timeout, opts.user_agent.as_deref())
                .await
            {
                Ok(bytes) => {
                    tracing::debug!(url = %candidate, len = bytes.len(), "fetched upstream");
                    return Ok(Fetched {
                        bytes,
                        is_fallback: false,
                    });
                }
                Err(reason) => {
                    tracing::debug!(url = %candidate, %reason, "upstream candidate failed");
                }
            }
        }
        match self
            .fetch_one(default_url, opts.timeout, opts.user_agent.as_deref())
            .await
        {
            Ok(bytes) => {
                tracing::info!(url = %url_string, "all mirrors failed, serving default image");
                Ok(Fetched {
                    bytes,
                    is_fallback: true,
                })
            }
            Err(reason) => {
                tracing::warn!(url = %url_string, %reason, "default image fetch failed");
                Err(Error::InvalidImage("all fallbacks failed".into()))
            }
        }
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_order_is_fixed() {
        let c = Fetcher::candidates("https://x/y.jpg", "Ztoken");
        assert_eq!(c[0], "https://x/y.jpg");
        assert_eq!(c[1], "https://images.hive.blog/0x0/https://x/y.jpg");
        assert_eq!(c[2], "https://steemitimages.com/0x0/https://x/y.jpg");
        assert_eq!(c[3], "https://wsrv.nl/?url=https://x/y.jpg");
        assert_eq!(c[4], "https://img.leopedia.io/0x0/https://x/y.jpg");
        assert_eq!(c[5], "https://images.hive.blog/p/Ztoken");
        assert_eq!(c[6], "https://steemitimages.com/p/Ztoken");
    }
}
