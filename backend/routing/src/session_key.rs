//! Session key: the stable string naming one conversation thread of an agent.
//!
//! Channel traffic is keyed by `channel:<hash of peer>` so that raw peer
//! identifiers (phone numbers, handles) never appear in keys or lock names.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Key used when a message carries neither an explicit key nor a peer.
pub const MAIN_SESSION_KEY: &str = "main";

/// The (channel, peer) origin of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub channel: String,
    pub peer: String,
}

impl SessionKey {
    pub fn new(channel: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            peer: peer.into(),
        }
    }

    /// First 8 bytes of SHA-256(peer), hex encoded.
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.peer.as_bytes());
        hex::encode(&digest[..8])
    }

    /// The session key string: `channel:<peer hash>`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.channel, self.hash())
    }

    /// Thread id shared by every agent talking to this peer on this channel.
    pub fn thread_id(&self) -> String {
        format!("{}:{}", self.channel, self.peer)
    }

    /// Resolve the key for an inbound message: explicit key, then
    /// channel + peer, then [`MAIN_SESSION_KEY`].
    pub fn resolve(explicit: Option<&str>, channel: Option<&str>, peer: Option<&str>) -> String {
        if let Some(key) = explicit.filter(|k| !k.is_empty()) {
            return key.to_string();
        }
        match (channel, peer) {
            (Some(c), Some(p)) => Self::new(c, p).key(),
            _ => MAIN_SESSION_KEY.to_string(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}
