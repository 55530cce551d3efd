//! OCAP URLs: `ocap:<peerId>/<token>`.
//!
//! The token is a random 128-bit nonce; the issuing kernel binds it to a
//! kref in its store. The URL itself carries no authority beyond knowledge
//! of the token.

use crate::error::CommsError;
use crate::peer::PeerId;
use rand::RngCore;
use std::fmt::{self, Display};
use std::str::FromStr;

pub const URL_SCHEME: &str = "ocap:";

const TOKEN_BYTES: usize = 16;

/// Random capability token, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcapUrl {
    pub peer: PeerId,
    pub token: String,
}

impl OcapUrl {
    pub fn new(peer: PeerId, token: String) -> OcapUrl {
        OcapUrl { peer, token }
    }
}

impl Display for OcapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{URL_SCHEME}{}/{}", self.peer, self.token)
    }
}

impl FromStr for OcapUrl {
    type Err = CommsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| CommsError::InvalidUrl(s.to_string()))?;
        let (peer_text, token) = rest
            .split_once('/')
            .ok_or_else(|| CommsError::InvalidUrl(s.to_string()))?;
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CommsError::InvalidUrl(s.to_string()));
        }
        Ok(OcapUrl {
            peer: PeerId::from_hex(peer_text).map_err(|_| CommsError::InvalidUrl(s.to_string()))?,
            token: token.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerIdentity;

    #[test]
    fn url_round_trips() {
        let identity = PeerIdentity::from_seed(b"issuer").expect("identity");
        let url = OcapUrl::new(identity.peer_id().clone(), generate_token());
        let text = url.to_string();
        assert!(text.starts_with("ocap:"));
        let parsed: OcapUrl = text.parse().expect("parse");
        assert_eq!(parsed, url);
    }

    #[test]
    fn malformed_urls_are_rejected() {
        for text in [
            "",
            "http://example.com",
            "ocap:short/aabb",
            "ocap:missing-token",
        ] {
            assert!(text.parse::<OcapUrl>().is_err(), "{text} should not parse");
        }
    }

    #[test]
    fn tokens_are_long_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
