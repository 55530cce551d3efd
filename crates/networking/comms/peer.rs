//! Peer identity.
//!
//! A kernel's peer id is the hex SHA-256 of its compressed secp256k1 public
//! key, so the same key seed always yields the same id and the id fits in a
//! URL without disclosing the key.

use crate::error::CommsError;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn from_hex(text: &str) -> Result<PeerId, CommsError> {
        if text.len() != 64 || !text.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CommsError::InvalidUrl(text.to_string()));
        }
        Ok(PeerId(text.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct PeerIdentity {
    secret: SecretKey,
    public: PublicKey,
    peer_id: PeerId,
}

impl PeerIdentity {
    /// Deterministic identity from a seed. The seed is hashed down to a
    /// scalar first, so any byte string works.
    pub fn from_seed(seed: &[u8]) -> Result<PeerIdentity, CommsError> {
        let scalar = Sha256::digest(seed);
        let secret = SecretKey::from_slice(&scalar)
            .map_err(|err| CommsError::BadKeySeed(err.to_string()))?;
        Ok(Self::from_secret(secret))
    }

    /// Fresh random identity.
    pub fn random() -> PeerIdentity {
        let secret = SecretKey::new(&mut rand::thread_rng());
        Self::from_secret(secret)
    }

    fn from_secret(secret: SecretKey) -> PeerIdentity {
        let public = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
        let digest = Sha256::digest(public.serialize());
        PeerIdentity {
            secret,
            public,
            peer_id: PeerId(hex::encode(digest)),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}
