use base64::Engine;
use imagehoster::crypto::{sha256, PrivateKey, Signature};
use imagehoster::signature::{decode_token, parse_credentials, Credentials, SIGNING_CHALLENGE};
use serde_json::json;

fn wif_for(fill: u8) -> String {
    let mut body = vec![0x80];
    body.extend_from_slice(&[fill; 32]);
    let checksum = sha256(&sha256(&body));
    body.extend_from_slice(&checksum[..4]);
    bs58::encode(body).into_string()
}

fn encode_token(payload: &serde_json::Value) -> String {
    base64::engine::general_purpose::STANDARD
        .encode(serde_json::to_vec(payload).unwrap())
        .chars()
        .map(|c| match c {
            '/' => '_',
            '+' => '-',
            '=' => '.',
            other => other,
        })
        .collect()
}

fn token_payload() -> serde_json::Value {
    json!({
        "signed_message": { "type": "login", "app": "example.app" },
        "authors": ["alice"],
        "signatures": ["00"],
        "timestamp": 1_700_000_000,
    })
}

#[test]
fn hex_signatures_classify_as_direct() {
    let key = PrivateKey::from_wif(&wif_for(0x31)).unwrap();
    let digest = sha256(SIGNING_CHALLENGE);
    let hex = key.sign(&digest).to_hex();
    match parse_credentials(&hex).unwrap() {
        Credentials::Direct(sig) => {
            assert_eq!(sig.recover(&digest).unwrap(), key.public_key());
        }
        Credentials::Token(_) => panic!("expected direct credentials"),
    }
}

#[test]
fn hive_and_hivesigner_prefixes_classify_as_token() {
    let encoded = encode_token(&token_payload());
    for prefix in ["hive", "hivesigner"] {
        match parse_credentials(&format!("{}{}", prefix, encoded)).unwrap() {
            Credentials::Token(token) => assert_eq!(token.author(), "alice"),
            Credentials::Direct(_) => panic!("expected token credentials"),
        }
    }
}

#[test]
fn malformed_credentials_are_invalid_signature() {
    for garbage in ["", "zz", "hive!!!", "stndtanything", "deadbeef"] {
        assert!(parse_credentials(garbage).is_err(), "{:?} parsed", garbage);
    }
}

#[test]
fn token_digest_is_stable_across_decode() {
    let encoded = encode_token(&token_payload());
    let a = decode_token(&encoded).unwrap();
    let b = decode_token(&encoded).unwrap();
    assert_eq!(a.digest(), b.digest());
}

#[test]
fn token_signature_verifies_against_signer() {
    let key = PrivateKey::from_wif(&wif_for(0x32)).unwrap();
    let mut token = decode_token(&encode_token(&token_payload())).unwrap();
    let sig = key.sign(&token.digest());
    token.signatures = vec![sig.to_hex()];

    let parsed = Signature::from_hex(&token.signatures[0]).unwrap();
    assert!(parsed.verify(&token.digest(), &key.public_key()));
}
