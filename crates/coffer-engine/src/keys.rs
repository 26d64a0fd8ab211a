//! Group key material.
//!
//! Every key version of a group is a random symmetric key, sealed by the
//! identity that produced it for each member of that version and written to
//! `keys/<group>/<version>`. Keys an identity has opened are retained in its
//! catalog, encrypted with a key derived from the identity, so versions it
//! once held stay readable after it loses access to newer ones.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use zeroize::Zeroizing;

use coffer_shared::crypto::{self, SymmetricKey};
use coffer_shared::protocol::{KeyEnvelope, Wire};
use coffer_shared::{GroupName, Identity, IdentityId};
use coffer_store::Replica;

use crate::catalog::Catalog;
use crate::error::{EngineError, Result};

pub fn envelope_path(group: &GroupName, version: u32) -> String {
    format!("keys/{}/{}", group, version)
}

/// Seal a fresh key version for every member.
pub fn seal_envelope(
    sealer: &Identity,
    group: &GroupName,
    version: u32,
    members: &BTreeSet<IdentityId>,
    key: &SymmetricKey,
) -> Result<KeyEnvelope> {
    let label = KeyEnvelope::seal_label(group, version);
    let mut sealed = Vec::with_capacity(members.len());
    for member in members {
        sealed.push((member.clone(), sealer.seal_for(member, &label, key)?));
    }
    Ok(KeyEnvelope {
        group: group.clone(),
        version,
        sealer: sealer.id().clone(),
        sealed,
        created_at: Utc::now(),
    })
}

/// Recover the key sealed for `identity`. The envelope must come from the
/// identity recorded as the version's producer.
pub fn open_envelope(
    identity: &Identity,
    envelope: &KeyEnvelope,
    expected_sealer: &IdentityId,
) -> Result<SymmetricKey> {
    if &envelope.sealer != expected_sealer {
        return Err(EngineError::malformed(format!(
            "key {}#{} sealed by an unexpected identity",
            envelope.group, envelope.version
        )));
    }
    let sealed = envelope
        .sealed
        .iter()
        .find(|(member, _)| member == identity.id())
        .map(|(_, sealed)| sealed)
        .ok_or_else(|| {
            EngineError::denied(format!(
                "no key {}#{} for {}",
                envelope.group,
                envelope.version,
                identity.id().short()
            ))
        })?;

    let label = KeyEnvelope::seal_label(&envelope.group, envelope.version);
    let plain = Zeroizing::new(identity.unseal_from(&envelope.sealer, &label, sealed)?);
    to_key(&plain)
}

pub fn write_envelope(replica: &dyn Replica, envelope: &KeyEnvelope) -> Result<()> {
    replica.write(
        &envelope_path(&envelope.group, envelope.version),
        &envelope.to_bytes()?,
    )?;
    Ok(())
}

pub fn read_envelope(replica: &dyn Replica, group: &GroupName, version: u32) -> Result<KeyEnvelope> {
    let data = replica.read(&envelope_path(group, version))?;
    Ok(KeyEnvelope::from_bytes(&data)?)
}

/// Keep an opened key in the identity's catalog.
pub fn retain(
    catalog: &Catalog,
    identity: &Identity,
    safe_url: &str,
    group: &GroupName,
    version: u32,
    key: &SymmetricKey,
) -> Result<()> {
    let catalog_key = Zeroizing::new(identity.derive_catalog_key()?);
    let sealed = crypto::encrypt(&catalog_key, key)?;
    catalog
        .db()?
        .store_group_key(safe_url, group, version, identity.id(), &sealed)?;
    Ok(())
}

/// Keys retained for a group, oldest first. Rows that no longer decrypt are
/// skipped.
pub fn retained(
    catalog: &Catalog,
    identity: &Identity,
    safe_url: &str,
    group: &GroupName,
) -> Result<Vec<(u32, SymmetricKey)>> {
    let catalog_key = Zeroizing::new(identity.derive_catalog_key()?);
    let rows = catalog.db()?.list_group_keys(safe_url, group, identity.id())?;

    let mut keys = Vec::with_capacity(rows.len());
    for (version, sealed) in rows {
        match crypto::decrypt(&catalog_key, &sealed) {
            Ok(plain) => {
                let plain = Zeroizing::new(plain);
                keys.push((version, to_key(&plain)?));
            }
            Err(_) => tracing::warn!(%group, version, "retained key does not decrypt, skipping"),
        }
    }
    Ok(keys)
}

fn to_key(bytes: &[u8]) -> Result<SymmetricKey> {
    SymmetricKey::try_from(bytes).map_err(|_| EngineError::malformed("key has wrong length"))
}

/// In-memory cache of opened keys, wiped on drop.
#[derive(Default)]
pub struct KeyRing {
    keys: HashMap<(GroupName, u32), Zeroizing<SymmetricKey>>,
}

impl KeyRing {
    pub fn get(&self, group: &GroupName, version: u32) -> Option<SymmetricKey> {
        self.keys.get(&(group.clone(), version)).map(|k| **k)
    }

    pub fn insert(&mut self, group: &GroupName, version: u32, key: SymmetricKey) {
        self.keys.insert((group.clone(), version), Zeroizing::new(key));
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
