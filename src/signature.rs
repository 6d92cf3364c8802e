//! Signed-upload admission.
//!
//! Two credential shapes arrive in the URL: a hex compact recoverable
//! signature over `sha256("ImageSigningChallenge" ‖ bytes)`, or an OAuth
//! token (signed JSON carrying its own authors and signatures) in a
//! base64url variant with a custom glyph map.

use crate::config::UploadLimits;
use crate::crypto::{sha256, PrivateKey, Signature};
use crate::error::Error;
use crate::rpc::{Account, Authority};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

pub const SIGNING_CHALLENGE: &[u8] = b"ImageSigningChallenge";

const TOKEN_TYPES: &[&str] = &["login", "posting", "offline", "code", "refresh"];

#[derive(Debug)]
pub enum Credentials {
    Direct(Signature),
    Token(UploadToken),
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadToken {
    pub signed_message: Value,
    pub authors: Vec<String>,
    pub signatures: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// Classify the `:signature` path parameter.
///
/// The historical `stndt` test backdoor is permanently rejected.
pub fn parse_credentials(param: &str) -> Result<Credentials, Error> {
    if param.starts_with("stndt") {
        return Err(Error::InvalidSignature);
    }
    if let Some(token) = param
        .strip_prefix("hivesigner")
        .or_else(|| param.strip_prefix("hive"))
    {
        return decode_token(token).map(Credentials::Token);
    }
    Signature::from_hex(param).map(Credentials::Direct)
}

/// Decode an access token: the charset maps `_ - .` back to `/ + =`, the
/// payload is JSON with a typed message, authors and signatures.
pub fn decode_token(token: &str) -> Result<UploadToken, Error> {
    let mapped: String = token
        .chars()
        .map(|c| match c {
            '_' => '/',
            '-' => '+',
            '.' => '=',
            other => other,
        })
        .collect();
    let raw = base64::engine::general_purpose::STANDARD
        .decode(mapped)
        .map_err(|_| Error::InvalidSignature)?;
    let token: UploadToken =
        serde_json::from_slice(&raw).map_err(|_| Error::InvalidSignature)?;

    let kind = token
        .signed_message
        .get("type")
        .and_then(Value::as_str)
        .ok_or(Error::InvalidSignature)?;
    if !TOKEN_TYPES.contains(&kind) {
        return Err(Error::InvalidSignature);
    }
    if token.signed_message.get("app").is_none() {
        return Err(Error::InvalidSignature);
    }
    if token.authors.is_empty() || token.signatures.is_empty() {
        return Err(Error::InvalidSignature);
    }
    Ok(token)
}

impl UploadToken {
    pub fn author(&self) -> &str {
        &self.authors[0]
    }

    /// Digest over the canonical JSON of `{signed_message, authors,
    /// timestamp}`, field order fixed, timestamp omitted when absent.
    pub fn digest(&self) -> [u8; 32] {
        let mut payload = serde_json::Map::new();
        payload.insert("signed_message".to_string(), self.signed_message.clone());
        payload.insert("authors".to_string(), Value::from(self.authors.clone()));
        if let Some(ts) = &self.timestamp {
            payload.insert("timestamp".to_string(), ts.clone());
        }
        let canonical = serde_json::to_vec(&Value::Object(payload)).unwrap_or_default();
        sha256(&canonical)
    }
}

fn key_in_authority(authority: &Authority, key: &str, check_weight: bool) -> bool {
    authority.key_auths.iter().any(|(k, weight)| {
        k == key && (!check_weight || u32::from(*weight) >= authority.weight_threshold)
    })
}

/// Mode A: recover the signer from the challenge digest and require a
/// sufficiently weighted posting or active key.
pub fn verify_direct(sig: &Signature, bytes: &[u8], account: &Account) -> Result<(), Error> {
    let mut challenge = Vec::with_capacity(SIGNING_CHALLENGE.len() + bytes.len());
    challenge.extend_from_slice(SIGNING_CHALLENGE);
    challenge.extend_from_slice(bytes);
    let digest = sha256(&challenge);
    let key = sig.recover(&digest)?.to_string();
    for authority in [&account.posting, &account.active] {
        if key_in_authority(authority, &key, true) {
            return Ok(());
        }
    }
    Err(Error::InvalidSignature)
}

/// Mode B: the token is accepted when the broadcaster's key signed it,
/// when the app account sits in the author's authority chain, or when any
/// of the author's own keys signed it.
pub fn verify_token(
    token: &UploadToken,
    account: &Account,
    limits: &UploadLimits,
) -> Result<(), Error> {
    let digest = token.digest();
    let app_key = limits
        .app_posting_wif
        .as_deref()
        .and_then(|wif| PrivateKey::from_wif(wif).ok())
        .map(|k| k.public_key());

    for sig_hex in &token.signatures {
        let Ok(sig) = Signature::from_hex(sig_hex) else {
            continue;
        };
        let Ok(recovered) = sig.recover(&digest) else {
            continue;
        };
        if let Some(app_key) = &app_key {
            if recovered == *app_key {
                return Ok(());
            }
        }
        let key = recovered.to_string();
        for authority in [&account.posting, &account.active, &account.owner] {
            if key_in_authority(authority, &key, false) {
                return Ok(());
            }
        }
    }

    if let Some(app) = &limits.app_account {
        for authority in [&account.posting, &account.active, &account.owner] {
            if authority.account_auths.iter().any(|(name, _)| name == app) {
                return Ok(());
            }
        }
    }

    Err(Error::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wif_for(fill: u8) -> String {
        let mut body = vec![0x80];
        body.extend_from_slice(&[fill; 32]);
        let checksum = sha256(&sha256(&body));
        body.extend_from_slice(&checksum[..4]);
        bs58::encode(body).into_string()
    }

    fn test_key(fill: u8) -> PrivateKey {
        PrivateKey::from_wif(&wif_for(fill)).unwrap()
    }

    fn account_with_posting_key(key: &str) -> Account {
        let empty = Authority {
            weight_threshold: 1,
            account_auths: vec![],
            key_auths: vec![],
        };
        Account {
            name: "alice".into(),
            owner: empty.clone(),
            active: empty.clone(),
            posting: Authority {
                weight_threshold: 1,
                account_auths: vec![],
                key_auths: vec![(key.to_string(), 1)],
            },
        }
    }

    fn encode_token(payload: &Value) -> String {
        let b64 = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(payload).unwrap());
        b64.chars()
            .map(|c| match c {
                '/' => '_',
                '+' => '-',
                '=' => '.',
                other => other,
            })
            .collect()
    }

    #[test]
    fn stndt_backdoor_stays_closed() {
        assert!(matches!(
            parse_credentials("stndt123456"),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn direct_signature_admits_posting_key() {
        let key = test_key(0x21);
        let bytes = b"image bytes";
        let mut challenge = SIGNING_CHALLENGE.to_vec();
        challenge.extend_from_slice(bytes);
        let sig = key.sign(&sha256(&challenge));
        let account = account_with_posting_key(&key.public_key().to_string());

        let creds = parse_credentials(&sig.to_hex()).unwrap();
        let Credentials::Direct(sig) = creds else {
            panic!("expected direct credentials");
        };
        verify_direct(&sig, bytes, &account).unwrap();
        // signature over different bytes fails
        assert!(verify_direct(&sig, b"other bytes", &account).is_err());
    }

    #[test]
    fn direct_signature_respects_weight_threshold() {
        let key = test_key(0x22);
        let bytes = b"image";
        let mut challenge = SIGNING_CHALLENGE.to_vec();
        challenge.extend_from_slice(bytes);
        let sig = key.sign(&sha256(&challenge));
        let mut account = account_with_posting_key(&key.public_key().to_string());
        account.posting.weight_threshold = 2;
        assert!(verify_direct(&sig, bytes, &account).is_err());
    }

    #[test]
    fn token_decodes_through_custom_charset() {
        let payload = json!({
            "signed_message": { "type": "posting", "app": "example.app" },
            "authors": ["alice"],
            "signatures": ["00"],
            "timestamp": 1_700_000_000,
        });
        let token = decode_token(&encode_token(&payload)).unwrap();
        assert_eq!(token.author(), "alice");

        let bad_type = json!({
            "signed_message": { "type": "transfer", "app": "example.app" },
            "authors": ["alice"],
            "signatures": ["00"],
        });
        assert!(decode_token(&encode_token(&bad_type)).is_err());

        let no_app = json!({
            "signed_message": { "type": "posting" },
            "authors": ["alice"],
            "signatures": ["00"],
        });
        assert!(decode_token(&encode_token(&no_app)).is_err());
    }

    #[test]
    fn token_accepts_author_key_signature() {
        let key = test_key(0x23);
        let mut token = UploadToken {
            signed_message: json!({ "type": "login", "app": "example.app" }),
            authors: vec!["alice".into()],
            signatures: vec![],
            timestamp: Some(json!(1_700_000_000)),
        };
        let sig = key.sign(&token.digest());
        token.signatures.push(sig.to_hex());

        let account = account_with_posting_key(&key.public_key().to_string());
        let limits = UploadLimits::default();
        verify_token(&token, &account, &limits).unwrap();
    }

    #[test]
    fn token_accepts_app_key_or_account_authority() {
        let app_key = test_key(0x24);
        let mut token = UploadToken {
            signed_message: json!({ "type": "posting", "app": "example.app" }),
            authors: vec!["alice".into()],
            signatures: vec![],
            timestamp: None,
        };
        token.signatures.push(app_key.sign(&token.digest()).to_hex());

        let account = account_with_posting_key("STMunrelated");
        let mut limits = UploadLimits::default();
        limits.app_posting_wif = Some(wif_for(0x24));
        verify_token(&token, &account, &limits).unwrap();

        // account-authority path: no valid signature, but the app account
        // sits in the author's posting authority
        let token = UploadToken {
            signed_message: json!({ "type": "posting", "app": "example.app" }),
            authors: vec!["alice".into()],
            signatures: vec!["zz".into()],
            timestamp: None,
        };
        let mut account = account_with_posting_key("STMunrelated");
        account.posting.account_auths.push(("example".into(), 1));
        let mut limits = UploadLimits::default();
        limits.app_account = Some("example".into());
        verify_token(&token, &account, &limits).unwrap();

        // nothing matches
        let limits = UploadLimits::default();
        assert!(verify_token(&token, &account_with_posting_key("STMx"), &limits).is_err());
    }
}
