//! Wire frames. Every datagram carries exactly one JSON-encoded [`Frame`].

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::common::messages::Message;

/// Largest datagram we are willing to read.
pub const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Unencrypted application payload.
    Plain { message: Message },

    /// Ephemeral X25519 public key. `reply` is set on the responder's answer
    /// so the initiator can tell an answer from a fresh initiation.
    KeyExchange {
        #[serde(with = "base64_bytes")]
        public_key: Vec<u8>,
        reply: bool,
    },

    /// AES-256-GCM sealed application payload (ciphertext includes the tag).
    Sealed {
        #[serde(with = "base64_bytes")]
        nonce: Vec<u8>,
        #[serde(with = "base64_bytes")]
        ciphertext: Vec<u8>,
    },
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
