//! secp256k1 keys and signatures in the graphene serialization: `STM`
//! base58 public keys with a RIPEMD-160/4 checksum, WIF secret keys, and
//! 65-byte compact recoverable signatures carried as hex.

use crate::error::Error;
use ripemd::Ripemd160;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;

pub const ADDRESS_PREFIX: &str = "STM";

/// Recovery flag bias: 27 for the compact scheme + 4 for compressed keys.
const COMPACT_FLAG_BASE: u8 = 31;

fn secp() -> &'static Secp256k1<secp256k1::All> {
    static SECP: OnceLock<Secp256k1<secp256k1::All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(secp256k1::PublicKey);

impl PublicKey {
    /// Parse an `STM…` key, verifying the RIPEMD-160 checksum.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let body = s
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or(Error::InvalidSignature)?;
        let raw = bs58::decode(body)
            .into_vec()
            .map_err(|_| Error::InvalidSignature)?;
        if raw.len() != 37 {
            return Err(Error::InvalidSignature);
        }
        let (key, checksum) = raw.split_at(33);
        let digest = Ripemd160::digest(key);
        if digest[..4] != checksum[..] {
            return Err(Error::InvalidSignature);
        }
        secp256k1::PublicKey::from_slice(key)
            .map(Self)
            .map_err(|_| Error::InvalidSignature)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.0.serialize();
        let checksum = Ripemd160::digest(key);
        let mut raw = Vec::with_capacity(37);
        raw.extend_from_slice(&key);
        raw.extend_from_slice(&checksum[..4]);
        write!(f, "{}{}", ADDRESS_PREFIX, bs58::encode(raw).into_string())
    }
}

#[derive(Debug, Clone)]
pub struct PrivateKey(SecretKey);

impl PrivateKey {
    /// Parse a WIF-encoded secret key (0x80 prefix, double-SHA-256/4
    /// checksum).
    pub fn from_wif(wif: &str) -> Result<Self, Error> {
        let raw = bs58::decode(wif)
            .into_vec()
            .map_err(|_| Error::InvalidSignature)?;
        if raw.len() != 37 || raw[0] != 0x80 {
            return Err(Error::InvalidSignature);
        }
        let (body, checksum) = raw.split_at(33);
        let expected = sha256(&sha256(body));
        if expected[..4] != checksum[..] {
            return Err(Error::InvalidSignature);
        }
        SecretKey::from_slice(&body[1..])
            .map(Self)
            .map_err(|_| Error::InvalidSignature)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(secp256k1::PublicKey::from_secret_key(secp(), &self.0))
    }

    pub fn sign(&self, digest: &[u8; 32]) -> Signature {
        let msg = Message::from_digest(*digest);
        Signature(secp().sign_ecdsa_recoverable(&msg, &self.0))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Signature(RecoverableSignature);

impl Signature {
    /// 130 hex chars: one recovery-flag byte then the 64-byte compact body.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let raw = hex::decode(s).map_err(|_| Error::InvalidSignature)?;
        if raw.len() != 65 {
            return Err(Error::InvalidSignature);
        }
        let flag = raw[0]
            .checked_sub(COMPACT_FLAG_BASE)
            .ok_or(Error::InvalidSignature)?;
        let recid =
            RecoveryId::from_i32(i32::from(flag)).map_err(|_| Error::InvalidSignature)?;
        RecoverableSignature::from_compact(&raw[1..], recid)
            .map(Self)
            .map_err(|_| Error::InvalidSignature)
    }

    pub fn to_hex(&self) -> String {
        let (recid, body) = self.0.serialize_compact();
        let mut raw = Vec::with_capacity(65);
        raw.push(recid.to_i32() as u8 + COMPACT_FLAG_BASE);
        raw.extend_from_slice(&body);
        hex::encode(raw)
    }

    pub fn recover(&self, digest: &[u8; 32]) -> Result<PublicKey, Error> {
        let msg = Message::from_digest(*digest);
        secp()
            .recover_ecdsa(&msg, &self.0)
            .map(PublicKey)
            .map_err(|_| Error::InvalidSignature)
    }

    pub fn verify(&self, digest: &[u8; 32], key: &PublicKey) -> bool {
        self.recover(digest).map(|k| k == *key).unwrap_or(false)
    }
}
