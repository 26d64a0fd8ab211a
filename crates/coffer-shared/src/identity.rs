//! User identities.
//!
//! An identity is two keypairs: X25519 for key agreement (sealing group keys,
//! pairwise message keys) and Ed25519 for signatures. The public halves are
//! concatenated and base64url-encoded into the fingerprint, so the id
//! `<nick>.<fingerprint>` is enough to encrypt to and verify a principal.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{KDF_CONTEXT_CATALOG_KEY, KDF_CONTEXT_SEAL_KEY, PUBKEY_SIZE, SECRET_KEY_SIZE};
use crate::crypto::{self, SymmetricKey};
use crate::error::{CryptoError, IdentityError};
use crate::types::IdentityId;

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct PrivateMaterial {
    crypt: [u8; SECRET_KEY_SIZE],
    sign: [u8; SECRET_KEY_SIZE],
}

impl PrivateMaterial {
    fn encode(&self) -> String {
        let mut bytes = [0u8; SECRET_KEY_SIZE * 2];
        bytes[..SECRET_KEY_SIZE].copy_from_slice(&self.crypt);
        bytes[SECRET_KEY_SIZE..].copy_from_slice(&self.sign);
        let encoded = URL_SAFE_NO_PAD.encode(bytes);
        bytes.zeroize();
        encoded
    }

    fn decode(encoded: &str) -> Result<Self, IdentityError> {
        let mut bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|_| IdentityError::MalformedKey)?;
        if bytes.len() != SECRET_KEY_SIZE * 2 {
            bytes.zeroize();
            return Err(IdentityError::MalformedKey);
        }
        let mut material = Self {
            crypt: [0u8; SECRET_KEY_SIZE],
            sign: [0u8; SECRET_KEY_SIZE],
        };
        material.crypt.copy_from_slice(&bytes[..SECRET_KEY_SIZE]);
        material.sign.copy_from_slice(&bytes[SECRET_KEY_SIZE..]);
        bytes.zeroize();
        Ok(material)
    }

    fn fingerprint(&self) -> String {
        let crypt_public = PublicKey::from(&StaticSecret::from(self.crypt));
        let sign_public = SigningKey::from_bytes(&self.sign).verifying_key();
        let mut bytes = [0u8; PUBKEY_SIZE * 2];
        bytes[..PUBKEY_SIZE].copy_from_slice(crypt_public.as_bytes());
        bytes[PUBKEY_SIZE..].copy_from_slice(sign_public.as_bytes());
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

/// Public keys recovered from an identity id.
#[derive(Debug, Clone)]
pub struct PublicKeys {
    pub crypt: PublicKey,
    pub sign: VerifyingKey,
}

impl PublicKeys {
    pub fn from_id(id: &IdentityId) -> Result<Self, IdentityError> {
        let (nick, fingerprint) = id
            .as_str()
            .split_once('.')
            .ok_or_else(|| IdentityError::MalformedId(id.to_string()))?;
        validate_nick(nick)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(fingerprint)
            .map_err(|_| IdentityError::MalformedId(id.to_string()))?;
        if bytes.len() != PUBKEY_SIZE * 2 {
            return Err(IdentityError::MalformedId(id.to_string()));
        }

        let mut crypt = [0u8; PUBKEY_SIZE];
        crypt.copy_from_slice(&bytes[..PUBKEY_SIZE]);
        let mut sign = [0u8; PUBKEY_SIZE];
        sign.copy_from_slice(&bytes[PUBKEY_SIZE..]);

        Ok(Self {
            crypt: PublicKey::from(crypt),
            sign: VerifyingKey::from_bytes(&sign).map_err(|_| IdentityError::InvalidKeyBytes)?,
        })
    }
}

/// A principal. Public-only identities (no private material) can be
/// encrypted to and verified, but cannot sign or unseal.
#[derive(Clone)]
pub struct Identity {
    id: IdentityId,
    private: Option<PrivateMaterial>,
}

/// Serializable format for exporting an identity across the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: IdentityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
}

impl Identity {
    /// Generate a fresh identity with the given nick.
    pub fn create(nick: &str) -> Result<Self, IdentityError> {
        validate_nick(nick)?;
        let mut crypt = [0u8; SECRET_KEY_SIZE];
        OsRng.fill_bytes(&mut crypt);
        let sign = SigningKey::generate(&mut OsRng).to_bytes();

        let private = PrivateMaterial { crypt, sign };
        crypt.zeroize();
        let id = IdentityId(format!("{nick}.{}", private.fingerprint()));
        Ok(Self {
            id,
            private: Some(private),
        })
    }

    /// Rebuild an identity from exported private material. Deterministic.
    pub fn from_private(nick: &str, private_material: &str) -> Result<Self, IdentityError> {
        validate_nick(nick)?;
        let private = PrivateMaterial::decode(private_material)?;
        let id = IdentityId(format!("{nick}.{}", private.fingerprint()));
        Ok(Self {
            id,
            private: Some(private),
        })
    }

    /// A public-only identity; fails when the id does not carry valid keys.
    pub fn public_only(id: &IdentityId) -> Result<Self, IdentityError> {
        PublicKeys::from_id(id)?;
        Ok(Self {
            id: id.clone(),
            private: None,
        })
    }

    pub fn from_record(record: &IdentityRecord) -> Result<Self, IdentityError> {
        match &record.private {
            Some(private) => {
                let identity = Self::from_private(record.id.nick(), private)?;
                if identity.id != record.id {
                    return Err(IdentityError::MalformedKey);
                }
                Ok(identity)
            }
            None => Self::public_only(&record.id),
        }
    }

    pub fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            id: self.id.clone(),
            private: self.private_material(),
        }
    }

    pub fn id(&self) -> &IdentityId {
        &self.id
    }

    pub fn nick(&self) -> &str {
        self.id.nick()
    }

    pub fn has_private(&self) -> bool {
        self.private.is_some()
    }

    /// Base64url private material, `None` for public-only identities.
    pub fn private_material(&self) -> Option<String> {
        self.private.as_ref().map(PrivateMaterial::encode)
    }

    /// Same principal, private material stripped.
    pub fn public(&self) -> Self {
        Self {
            id: self.id.clone(),
            private: None,
        }
    }

    fn material(&self) -> Result<&PrivateMaterial, IdentityError> {
        self.private.as_ref().ok_or(IdentityError::MalformedKey)
    }

    /// Sign a message; returns the 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, IdentityError> {
        let signing_key = SigningKey::from_bytes(&self.material()?.sign);
        Ok(signing_key.sign(message).to_bytes().to_vec())
    }

    /// Symmetric key shared between this identity and `peer`. Both sides
    /// derive the same key for the same label.
    pub fn pairwise_key(&self, peer: &IdentityId, label: &[u8]) -> Result<SymmetricKey, IdentityError> {
        let peer_keys = PublicKeys::from_id(peer)?;
        let secret = StaticSecret::from(self.material()?.crypt);
        let shared = secret.diffie_hellman(&peer_keys.crypt);

        let (low, high) = if self.id <= *peer {
            (&self.id, peer)
        } else {
            (peer, &self.id)
        };
        let mut context = Vec::with_capacity(low.0.len() + high.0.len() + label.len() + 2);
        context.extend_from_slice(low.0.as_bytes());
        context.push(0);
        context.extend_from_slice(high.0.as_bytes());
        context.push(0);
        context.extend_from_slice(label);

        Ok(crypto::derive_pairwise_key(shared.as_bytes(), &context))
    }

    /// Encrypt `secret` so that only `recipient` (and this identity) can open it.
    pub fn seal_for(
        &self,
        recipient: &IdentityId,
        label: &[u8],
        secret: &[u8],
    ) -> Result<Vec<u8>, IdentityError> {
        let key = self.seal_key(recipient, label)?;
        crypto::encrypt(&key, secret).map_err(|_| IdentityError::InvalidKeyBytes)
    }

    pub fn unseal_from(
        &self,
        sealer: &IdentityId,
        label: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .seal_key(sealer, label)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        crypto::decrypt(&key, sealed)
    }

    // sealing keys never collide with message keys for the same label
    fn seal_key(&self, peer: &IdentityId, label: &[u8]) -> Result<SymmetricKey, IdentityError> {
        let pairwise = self.pairwise_key(peer, label)?;
        Ok(crypto::derive_key(KDF_CONTEXT_SEAL_KEY, &[&pairwise]))
    }

    /// Key used to protect this identity's data at rest in a local catalog.
    pub fn derive_catalog_key(&self) -> Result<SymmetricKey, IdentityError> {
        let material = self.material()?;
        Ok(crypto::derive_key(
            KDF_CONTEXT_CATALOG_KEY,
            &[&material.crypt, &material.sign],
        ))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id.short())
            .field("private", &self.private.is_some())
            .finish()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Identity {}

/// Verify a signature made by the identity `signer`.
pub fn verify_signature(
    signer: &IdentityId,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let keys = PublicKeys::from_id(signer).map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    keys.sign
        .verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

fn validate_nick(nick: &str) -> Result<(), IdentityError> {
    if nick.is_empty() || nick.contains('.') || nick.contains('/') || nick.contains(char::is_whitespace) {
        return Err(IdentityError::InvalidNick(nick.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_id_format() {
        let id = Identity::create("alice").unwrap();
        assert!(id.id().as_str().starts_with("alice."));
        assert_eq!(id.nick(), "alice");
        assert!(PublicKeys::from_id(id.id()).is_ok());
    }

    #[test]
    fn test_identity_roundtrip_through_private() {
        let id = Identity::create("bob").unwrap();
        let private = id.private_material().unwrap();
        let restored = Identity::from_private("bob", &private).unwrap();
        assert_eq!(id.id(), restored.id());
    }

    #[test]
    fn test_from_private_rejects_garbage() {
        assert!(matches!(
            Identity::from_private("bob", "not-base64!"),
            Err(IdentityError::MalformedKey)
        ));
        assert!(matches!(
            Identity::from_private("bob", "QUJD"),
            Err(IdentityError::MalformedKey)
        ));
    }

    #[test]
    fn test_invalid_nick_rejected() {
        assert!(Identity::create("").is_err());
        assert!(Identity::create("a.b").is_err());
        assert!(Identity::create("a/b").is_err());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::create("carol").unwrap();
        let signature = id.sign(b"payload").unwrap();

        assert!(verify_signature(id.id(), b"payload", &signature).is_ok());
        assert!(verify_signature(id.id(), b"tampered", &signature).is_err());
    }

    #[test]
    fn test_public_only_cannot_sign() {
        let id = Identity::create("dave").unwrap();
        let public = id.public();
        assert!(!public.has_private());
        assert!(public.private_material().is_none());
        assert!(public.sign(b"x").is_err());
        assert_eq!(public, id);
    }

    #[test]
    fn test_pairwise_key_symmetric() {
        let a = Identity::create("a").unwrap();
        let b = Identity::create("b").unwrap();
        let ab = a.pairwise_key(b.id(), b"label").unwrap();
        let ba = b.pairwise_key(a.id(), b"label").unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_seal_unseal() {
        let a = Identity::create("a").unwrap();
        let b = Identity::create("b").unwrap();
        let c = Identity::create("c").unwrap();

        let sealed = a.seal_for(b.id(), b"ctx", b"group-key").unwrap();
        assert_eq!(b.unseal_from(a.id(), b"ctx", &sealed).unwrap(), b"group-key");
        assert!(c.unseal_from(a.id(), b"ctx", &sealed).is_err());
    }

    #[test]
    fn test_record_roundtrip() {
        let id = Identity::create("erin").unwrap();
        let json = serde_json::to_string(&id.to_record()).unwrap();
        let record: IdentityRecord = serde_json::from_str(&json).unwrap();
        let restored = Identity::from_record(&record).unwrap();
        assert_eq!(restored, id);
        assert!(restored.has_private());
    }
}
