//! Node identity: session keys, device UUIDs and enrollment secrets.

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

/// Minimum length of a configured node key secret, in bytes.
pub const MIN_NODE_KEY_SECRET_LEN: usize = 32;

/// Issues node session keys.
///
/// A key is `hex(HMAC-SHA256(secret, uuid || nanos || nonce))`, so it is
/// unguessable without the server secret and never repeats across
/// re-enrollments of the same device.
#[derive(Clone)]
pub struct NodeKeyGenerator {
    mac: HmacSha256,
}

impl NodeKeyGenerator {
    /// Create a generator from a configured secret.
    pub fn new(secret: &[u8]) -> crate::Result<Self> {
        if secret.len() < MIN_NODE_KEY_SECRET_LEN {
            return Err(crate::Error::InvalidNodeKeySecret(format!(
                "secret must be at least {MIN_NODE_KEY_SECRET_LEN} bytes, got {}",
                secret.len()
            )));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| crate::Error::InvalidNodeKeySecret(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Create a generator with a random per-process secret.
    pub fn random() -> crate::Result<Self> {
        let mut secret = [0u8; MIN_NODE_KEY_SECRET_LEN];
        rand::rng().fill_bytes(&mut secret);
        Self::new(&secret)
    }

    /// Issue a new lowercase hex session key for a device UUID.
    pub fn generate(&self, uuid: &str) -> String {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let mut nonce = [0u8; 16];
        rand::rng().fill_bytes(&mut nonce);

        let mut mac = self.mac.clone();
        mac.update(uuid.as_bytes());
        mac.update(&nanos.to_be_bytes());
        mac.update(&nonce);
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for NodeKeyGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeyGenerator")
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// Normalize a node key presented by an agent.
pub fn normalize_node_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

/// Normalize a device UUID reported by an agent.
pub fn normalize_uuid(uuid: &str) -> String {
    uuid.trim().to_ascii_uppercase()
}

/// Compare an enrollment secret presented by an agent with the expected one.
///
/// Both sides are trimmed; the comparison itself is constant time.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    let provided = provided.trim().as_bytes();
    let expected = expected.trim().as_bytes();
    if expected.is_empty() {
        return false;
    }
    provided.ct_eq(expected).into()
}

/// Protocol channel through which a node contacted the server.
///
/// Each channel has its own "last contact" timestamp on the node record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeChannel {
    Config,
    Log,
    QueryRead,
    QueryWrite,
    Carve,
}

impl NodeChannel {
    pub const ALL: [NodeChannel; 5] = [
        Self::Config,
        Self::Log,
        Self::QueryRead,
        Self::QueryWrite,
        Self::Carve,
    ];

    /// Column on the node record holding this channel's last contact time.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Config => "last_config",
            Self::Log => "last_log",
            Self::QueryRead => "last_query_read",
            Self::QueryWrite => "last_query_write",
            Self::Carve => "last_carve",
        }
    }

    fn bit(&self) -> u8 {
        match self {
            Self::Config => 1,
            Self::Log => 1 << 1,
            Self::QueryRead => 1 << 2,
            Self::QueryWrite => 1 << 3,
            Self::Carve => 1 << 4,
        }
    }
}

/// A small set of [`NodeChannel`]s.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelSet(u8);

impl ChannelSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, channel: NodeChannel) {
        self.0 |= channel.bit();
    }

    pub fn contains(&self, channel: NodeChannel) -> bool {
        self.0 & channel.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = NodeChannel> {
        NodeChannel::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl From<NodeChannel> for ChannelSet {
    fn from(channel: NodeChannel) -> Self {
        let mut set = ChannelSet::empty();
        set.insert(channel);
        set
    }
}
