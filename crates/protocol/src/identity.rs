use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use serde::{Deserialize, Serialize};

/// Length in bytes of an agent public key (libsodium sign keypair public half).
pub const AGENT_PUB_KEY_LEN: usize = 32;

/// Opaque peer identity. Ordering and equality are defined over the base64
/// (no-pad, standard alphabet) textual encoding, per the room anchor's
/// canonical representation -- not over the raw bytes. For keys of equal
/// length the two orderings agree byte-for-byte, but comparing the encoded
/// form keeps this type honest about what "lexicographic" means on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentPubKey([u8; AGENT_PUB_KEY_LEN]);

impl AgentPubKey {
    pub fn new(bytes: [u8; AGENT_PUB_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AGENT_PUB_KEY_LEN] {
        &self.0
    }

    fn encoded(&self) -> String {
        STANDARD_NO_PAD.encode(self.0)
    }
}

impl fmt::Display for AgentPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded())
    }
}

impl fmt::Debug for AgentPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentPubKey({})", self.encoded())
    }
}

impl PartialOrd for AgentPubKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AgentPubKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.encoded().cmp(&other.encoded())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentPubKeyError {
    #[error("invalid base64 agent public key: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("agent public key must be {AGENT_PUB_KEY_LEN} bytes, got {0}")]
    Length(usize),
}

impl FromStr for AgentPubKey {
    type Err = AgentPubKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = STANDARD_NO_PAD.decode(s)?;
        let len = bytes.len();
        let array: [u8; AGENT_PUB_KEY_LEN] =
            bytes.try_into().map_err(|_| AgentPubKeyError::Length(len))?;
        Ok(Self(array))
    }
}

impl TryFrom<String> for AgentPubKey {
    type Error = AgentPubKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgentPubKey> for String {
    fn from(value: AgentPubKey) -> Self {
        value.encoded()
    }
}
