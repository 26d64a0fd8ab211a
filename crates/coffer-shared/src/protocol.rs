//! Records written to a safe's replica.
//!
//! Everything a replica stores is one of these envelopes, bincode-encoded.
//! Envelopes whose payload needs self-describing values (metadata maps,
//! statement parameters) carry that payload as sealed JSON.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::KDF_CONTEXT_GROUP_CHAIN;
use crate::error::ProtocolError;
use crate::types::{GroupName, IdentityId, MessageId};

/// Binary (bincode) encoding shared by all replica envelopes.
pub trait Wire: Serialize + DeserializeOwned {
    fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Identity of a safe, signed by its founder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafeManifest {
    pub url: String,
    pub description: String,
    pub quota_bytes: u64,
    pub creator: IdentityId,
    pub created_at: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl SafeManifest {
    /// Bytes covered by the founder signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.url.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.description.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.quota_bytes.to_le_bytes());
        buf.extend_from_slice(self.creator.as_str().as_bytes());
        buf.extend_from_slice(&self.created_at.timestamp_micros().to_le_bytes());
        buf
    }
}

impl Wire for SafeManifest {}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GroupAction {
    Grant,
    Revoke,
    Curse,
    Endorse,
}

impl GroupAction {
    /// Numeric codes used at the boundary: grant 0, revoke 1, curse 2, endorse 3.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Grant),
            1 => Some(Self::Revoke),
            2 => Some(Self::Curse),
            3 => Some(Self::Endorse),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Grant => 0,
            Self::Revoke => 1,
            Self::Curse => 2,
            Self::Endorse => 3,
        }
    }

    /// Whether applying this action produces a new key version.
    pub fn rotates_key(&self) -> bool {
        matches!(self, Self::Grant | Self::Revoke)
    }
}

/// One signed entry of a safe's group change log. A single entry applies
/// the same action to a batch of users, each with its role or weight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupChange {
    pub group: GroupName,
    pub action: GroupAction,
    pub users: Vec<(IdentityId, i64)>,
    pub timestamp: i64,
    pub signer: IdentityId,
    pub signature: Vec<u8>,
}

impl GroupChange {
    /// Bytes covered by the signature, chained to the previous entry's hash.
    pub fn signing_bytes(&self, previous: &[u8; 32]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(previous);
        buf.extend_from_slice(self.group.as_str().as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.action.code().to_le_bytes());
        for (user, value) in &self.users {
            buf.extend_from_slice(user.as_str().as_bytes());
            buf.push(0);
            buf.extend_from_slice(&value.to_le_bytes());
        }
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(self.signer.as_str().as_bytes());
        buf
    }

    /// Hash linking the next entry to this one.
    pub fn link_hash(&self, previous: &[u8; 32]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_GROUP_CHAIN);
        hasher.update(&self.signing_bytes(previous));
        hasher.update(&self.signature);
        *hasher.finalize().as_bytes()
    }
}

/// The whole change log, stored as one replica object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupChain {
    pub changes: Vec<GroupChange>,
}

impl Wire for GroupChain {}

/// One key version of a group, sealed separately for every member that
/// held membership when the version was produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEnvelope {
    pub group: GroupName,
    pub version: u32,
    pub sealer: IdentityId,
    pub sealed: Vec<(IdentityId, Vec<u8>)>,
    pub created_at: DateTime<Utc>,
}

impl KeyEnvelope {
    pub fn seal_label(group: &GroupName, version: u32) -> Vec<u8> {
        format!("{}#{}", group, version).into_bytes()
    }
}

impl Wire for KeyEnvelope {}

/// Ciphertext tagged with the key that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedRecord {
    pub group: GroupName,
    pub key_version: u32,
    /// Set when the payload uses a pairwise key instead of the group key.
    pub private_to: Option<IdentityId>,
    pub author: IdentityId,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SealedRecord {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 96);
        buf.extend_from_slice(self.group.as_str().as_bytes());
        buf.extend_from_slice(&self.key_version.to_le_bytes());
        if let Some(to) = &self.private_to {
            buf.extend_from_slice(to.as_str().as_bytes());
        }
        buf.extend_from_slice(self.author.as_str().as_bytes());
        buf.extend_from_slice(blake3::hash(&self.data).as_bytes());
        buf
    }
}

impl Wire for SealedRecord {}

/// Message as stored in a replica log; the body is sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: MessageId,
    pub sender: IdentityId,
    pub recipient: String,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub body: Vec<u8>,
    pub has_attachment: bool,
    pub signature: Vec<u8>,
}

impl MessageEnvelope {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.body.len() + 128);
        buf.extend_from_slice(&self.id.0.to_le_bytes());
        buf.extend_from_slice(self.sender.as_str().as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.recipient.as_bytes());
        buf.extend_from_slice(&self.key_version.to_le_bytes());
        buf.extend_from_slice(&self.created_at.timestamp_micros().to_le_bytes());
        buf.extend_from_slice(blake3::hash(&self.body).as_bytes());
        buf.push(self.has_attachment as u8);
        buf
    }
}

impl Wire for MessageEnvelope {}

/// Plaintext of a message body before sealing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageBody {
    pub text: Option<String>,
    pub data: Option<Vec<u8>>,
    pub file_name: Option<String>,
}

impl Wire for MessageBody {}

/// Write a length-prefixed frame (u64 little-endian length, then bytes).
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Read one frame; returns the payload and the remaining bytes.
pub fn decode_frame(data: &[u8]) -> Result<(&[u8], &[u8]), ProtocolError> {
    if data.len() < 8 {
        return Err(ProtocolError::TruncatedFrame {
            expected: 8,
            actual: data.len(),
        });
    }
    let (prefix, rest) = data.split_at(8);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(prefix);
    let len = u64::from_le_bytes(len_bytes) as usize;
    if rest.len() < len {
        return Err(ProtocolError::TruncatedFrame {
            expected: len,
            actual: rest.len(),
        });
    }
    Ok(rest.split_at(len))
}
