//! Chain RPC consumer. The core only needs two reads: account authorities
//! (for signature checks) and profiles (avatar/cover source, reputation).
//! Both are cached for 30 seconds; calls fail over across the configured
//! node list.

use crate::error::Error;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

const RPC_TIMEOUT: Duration = Duration::from_secs(2);
const FAILOVER_THRESHOLD: u32 = 2;
const CACHE_TTL: Duration = Duration::from_secs(30);
const CACHE_CAPACITY: u64 = 10_000;

/// `^[a-z][a-z0-9-\.]*$`
pub fn is_valid_account_name(name: &str) -> bool {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"^[a-z][a-z0-9\-.]*$").expect("account regex"));
    re.is_match(name)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Authority {
    pub weight_threshold: u32,
    #[serde(default)]
    pub account_auths: Vec<(String, u16)>,
    #[serde(default)]
    pub key_auths: Vec<(String, u16)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub name: String,
    pub owner: Authority,
    pub active: Authority,
    pub posting: Authority,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileImages {
    #[serde(default)]
    pub profile_image: Option<String>,
    #[serde(default)]
    pub cover_image: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileMetadata {
    #[serde(default)]
    pub profile: ProfileImages,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub name: String,
    /// Already normalized by the bridge API; compared directly against
    /// `upload_limits.reputation`.
    #[serde(default)]
    pub reputation: f64,
    #[serde(default)]
    pub metadata: Option<ProfileMetadata>,
}

impl Profile {
    pub fn profile_image(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.profile.profile_image.as_deref())
            .filter(|s| !s.is_empty())
    }

    pub fn cover_image(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.profile.cover_image.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// The two chain reads the service consumes, behind a trait so tests can
/// stub the chain out.
#[async_trait::async_trait]
pub trait Directory: Send + Sync {
    async fn account(&self, name: &str) -> Result<Option<Account>, Error>;
    async fn profile(&self, name: &str) -> Result<Option<Profile>, Error>;
}

enum CallError {
    Transport(String),
    /// The node answered with a JSON-RPC error object.
    Rpc(String),
}

pub struct RpcDirectory {
    client: reqwest::Client,
    nodes: Vec<String>,
    primary: AtomicUsize,
    failures: AtomicU32,
    accounts: moka::future::Cache<String, Option<Account>>,
    profiles: moka::future::Cache<String, Option<Profile>>,
}

impl RpcDirectory {
    pub fn new(client: reqwest::Client, nodes: Vec<String>) -> Self {
        Self {
            client,
            nodes,
            primary: AtomicUsize::new(0),
            failures: AtomicU32::new(0),
            accounts: moka::future::Cache::builder()
                .time_to_live(CACHE_TTL)
                .max_capacity(CACHE_CAPACITY)
                .build(),
            profiles: moka::future::Cache::builder()
                .time_to_live(CACHE_TTL)
                .max_capacity(CACHE_CAPACITY)
                .build(),
        }
    }

    async fn call_node(
        &self,
        node: &str,
        method: &str,
        params: &Value,
    ) -> Result<Value, CallError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(node)
            .json(&body)
            .timeout(RPC_TIMEOUT)
            .send()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;
        if let Some(err) = payload.get("error") {
            return Err(CallError::Rpc(err.to_string()));
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Try nodes starting from the current primary; after
    /// `FAILOVER_THRESHOLD` consecutive transport failures the primary
    /// rotates so later calls skip the dead node.
    async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        let start = self.primary.load(Ordering::Relaxed);
        let count = self.nodes.len();
        let mut last = CallError::Transport("no rpc nodes configured".into());
        for i in 0..count {
            let idx = (start + i) % count;
            match self.call_node(&self.nodes[idx], method, &params).await {
                Ok(value) => {
                    self.failures.store(0, Ordering::Relaxed);
                    self.primary.store(idx, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(CallError::Rpc(err)) => return Err(CallError::Rpc(err)),
                Err(CallError::Transport(err)) => {
                    tracing::warn!(node = %self.nodes[idx], error = %err, "rpc node failed");
                    let failed = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if failed >= FAILOVER_THRESHOLD {
                        self.primary
                            .store((idx + 1) % count, Ordering::Relaxed);
                        self.failures.store(0, Ordering::Relaxed);
                    }
                    last = CallError::Transport(err);
                }
            }
        }
        Err(last)
    }
}

#[async_trait::async_trait]
impl Directory for RpcDirectory {
    async fn account(&self, name: &str) -> Result<Option<Account>, Error> {
        if let Some(cached) = self.accounts.get(name).await {
            return Ok(cached);
        }
        let result = self
            .call("condenser_api.get_accounts", json!([[name]]))
            .await
            .map_err(|e| match e {
                CallError::Transport(msg) | CallError::Rpc(msg) => Error::UpstreamError(msg),
            })?;
        let account = result
            .as_array()
            .and_then(|list| list.first().cloned())
            .and_then(|raw| serde_json::from_value::<Account>(raw).ok());
        self.accounts
            .insert(name.to_string(), account.clone())
            .await;
        Ok(account)
    }

    async fn profile(&self, name: &str) -> Result<Option<Profile>, Error> {
        if let Some(cached) = self.profiles.get(name).await {
            return Ok(cached);
        }
        let profile = match self
            .call("bridge.get_profile", json!({ "account": name }))
            .await
        {
            Ok(result) => serde_json::from_value::<Profile>(result).ok(),
            // the bridge signals unknown accounts with an rpc error
            Err(CallError::Rpc(_)) => None,
            Err(CallError::Transport(msg)) => return Err(Error::UpstreamError(msg)),
        };
        self.profiles
            .insert(name.to_string(), profile.clone())
            .await;
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_name_shape() {
        assert!(is_valid_account_name("alice"));
        assert!(is_valid_account_name("a1-b.c"));
        assert!(!is_valid_account_name("Alice"));
        assert!(!is_valid_account_name("1abc"));
        assert!(!is_valid_account_name(""));
        assert!(!is_valid_account_name("with space"));
    }

    #[test]
    fn account_deserializes_from_condenser_shape() {
        let raw = json!({
            "name": "alice",
            "owner": { "weight_threshold": 1, "account_auths": [], "key_auths": [["STMkey", 1]] },
            "active": { "weight_threshold": 1, "account_auths": [["app", 1]], "key_auths": [] },
            "posting": { "weight_threshold": 1, "account_auths": [], "key_auths": [["STMkey", 1]] }
        });
        let account: Account = serde_json::from_value(raw).unwrap();
        assert_eq!(account.name, "alice");
        assert_eq!(account.posting.key_auths[0].0, "STMkey");
        assert_eq!(account.active.account_auths[0], ("app".to_string(), 1));
    }

    #[test]
    fn profile_reads_nested_metadata() {
        let raw = json!({
            "name": "alice",
            "reputation": 68.4,
            "metadata": { "profile": { "profile_image": "https://x/a.png", "cover_image": "" } }
        });
        let profile: Profile = serde_json::from_value(raw).unwrap();
        assert_eq!(profile.profile_image(), Some("https://x/a.png"));
        assert_eq!(profile.cover_image(), None);
        assert!(profile.reputation > 68.0);
    }
}
