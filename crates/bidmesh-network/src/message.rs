//! Directory and mesh-link protocol messages

use crate::error::{NetworkError, NetworkResult};
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Messages on the directory channel, discriminated by `mode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum DirectoryMessage {
    /// Node → directory: announce a node
    NewPeer {
        /// Announced identity
        identity: Identity,
        /// Address where the node accepts mesh links
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// Directory → node: the full registry
    PublicKeys {
        /// Registered identities, in insertion order
        identities: Vec<Identity>,
        /// Known mesh endpoints of registered identities
        #[serde(default)]
        endpoints: BTreeMap<Identity, String>,
        /// Snapshot version, increasing with every registry change
        #[serde(default)]
        version: u64,
    },

    /// Node → directory: replace the registry
    UpdatedPeerList {
        /// Identities still believed reachable
        identities: Vec<Identity>,
    },
}

#[derive(Deserialize)]
struct Discriminant {
    #[serde(alias = "kind")]
    mode: Option<String>,
}

/// Tell an unknown discriminant apart from a malformed record
fn classify_error(raw: &[u8], err: serde_json::Error) -> NetworkError {
    match serde_json::from_slice::<Discriminant>(raw) {
        Ok(Discriminant { mode: Some(mode) }) if err.to_string().contains("unknown variant") => {
            NetworkError::UnknownDiscriminant(mode)
        }
        _ => NetworkError::InvalidMessage(err.to_string()),
    }
}

impl DirectoryMessage {
    /// Parse a directory frame
    pub fn decode(raw: &[u8]) -> NetworkResult<Self> {
        serde_json::from_slice(raw).map_err(|e| classify_error(raw, e))
    }

    /// Discriminant of this message, as sent on the wire
    pub fn mode(&self) -> &'static str {
        match self {
            DirectoryMessage::NewPeer { .. } => "new-peer",
            DirectoryMessage::PublicKeys { .. } => "public-keys",
            DirectoryMessage::UpdatedPeerList { .. } => "updated-peer-list",
        }
    }
}

/// Frames exchanged on a mesh link, discriminated by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LinkFrame {
    /// Handshake opener: who I claim to be and a challenge for you
    Hello {
        /// Claimed identity
        identity: Identity,
        /// Random challenge, hex
        nonce: String,
    },

    /// Handshake answer: signature over the peer's challenge
    Proof {
        /// Hex signature
        signature: String,
    },

    /// Invoke a named remote operation
    Request {
        /// Correlation id
        id: u64,
        /// Operation name
        op: String,
        /// Identity the caller claims to act for
        caller: Identity,
        /// Operation payload
        payload: Value,
    },

    /// Result of a request
    Response {
        /// Correlation id
        id: u64,
        /// Whether the operation succeeded
        ok: bool,
        /// Result value on success
        #[serde(default)]
        value: Value,
        /// Error text on failure
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl LinkFrame {
    /// Parse a link frame
    pub fn decode(raw: &[u8]) -> NetworkResult<Self> {
        serde_json::from_slice(raw).map_err(|e| classify_error(raw, e))
    }

    /// Successful response
    pub fn ok(id: u64, value: Value) -> Self {
        LinkFrame::Response {
            id,
            ok: true,
            value,
            error: None,
        }
    }

    /// Failed response
    pub fn err(id: u64, error: impl Into<String>) -> Self {
        LinkFrame::Response {
            id,
            ok: false,
            value: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Message signed during the handshake: binds the challenge to the signer
pub fn proof_message(nonce: &str, signer: &Identity) -> Vec<u8> {
    format!("bidmesh-link-v1:{}:{}", nonce, signer).into_bytes()
}
