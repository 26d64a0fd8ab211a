//! Safes: an identity's session on a replicated, encrypted container.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffer_shared::constants::{ADMIN_GROUP, USERS_GROUP};
use coffer_shared::crypto::{generate_symmetric_key, SymmetricKey};
use coffer_shared::identity::{verify_signature, PublicKeys};
use coffer_shared::protocol::{GroupAction, GroupChain, GroupChange, SafeManifest, Wire};
use coffer_shared::{GroupName, Identity, IdentityId};
use coffer_store::{open_replica, Replica, SafeRecord};

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::group::{GroupSnapshot, GroupState, Role};
use crate::keys::{self, KeyRing};

const MANIFEST: &str = "manifest";
const CHAIN: &str = "groups/chain";

/// Settings given when creating a safe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SafeSettings {
    pub description: String,
    /// Zero means unlimited.
    pub quota_bytes: u64,
}

/// Public configuration of an open safe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SafeConfig {
    pub url: String,
    pub description: String,
    pub quota_bytes: u64,
    pub creator: IdentityId,
    pub created_at: DateTime<Utc>,
    /// Founder signature over the manifest, hex-encoded.
    pub signature: String,
}

struct SafeState {
    groups: GroupState,
    chain_len: usize,
    refreshed: Option<Instant>,
    keys: KeyRing,
}

pub struct Safe {
    url: String,
    replica: Arc<dyn Replica>,
    catalog: Arc<Catalog>,
    identity: Identity,
    manifest: SafeManifest,
    config: Arc<EngineConfig>,
    state: Mutex<SafeState>,
    closed: AtomicBool,
}

impl Safe {
    /// Create a safe at `url` founded by `founder`. The founder is seeded as
    /// admin of the `admin` and `users` groups.
    pub fn create(
        catalog: Arc<Catalog>,
        founder: &Identity,
        url: &str,
        settings: &SafeSettings,
        config: Arc<EngineConfig>,
    ) -> Result<Self> {
        catalog.ensure_open()?;
        if !founder.has_private() {
            return Err(EngineError::denied("founder needs a private key"));
        }
        let replica = open_replica(url)?;

        let mut manifest = SafeManifest {
            url: url.to_string(),
            description: settings.description.clone(),
            quota_bytes: settings.quota_bytes,
            creator: founder.id().clone(),
            created_at: Utc::now(),
            signature: Vec::new(),
        };
        manifest.signature = founder.sign(&manifest.signing_bytes())?;
        if !replica.create_new(MANIFEST, &manifest.to_bytes()?)? {
            return Err(EngineError::AlreadyExists(format!("safe {url}")));
        }

        let seeded = Self::new(catalog.clone(), founder.clone(), replica.clone(), manifest, config)
            .and_then(|safe| {
                safe.record()?;
                for group in [ADMIN_GROUP, USERS_GROUP] {
                    safe.update_group(group, GroupAction::Grant, &[(founder.id().clone(), Role::Admin.value())])?;
                }
                Ok(safe)
            });
        let safe = match seeded {
            Ok(safe) => safe,
            Err(e) => {
                discard_created(replica.as_ref(), &catalog);
                return Err(e);
            }
        };

        tracing::info!(url, founder = %founder.id().short(), "safe created");
        Ok(safe)
    }

    /// Open an existing safe. The identity must belong to at least one group.
    pub fn open(
        catalog: Arc<Catalog>,
        identity: &Identity,
        url: &str,
        config: Arc<EngineConfig>,
    ) -> Result<Self> {
        catalog.ensure_open()?;
        if !identity.has_private() {
            return Err(EngineError::denied("opening a safe needs a private key"));
        }
        let replica = open_replica(url)?;

        let data = replica.read(MANIFEST).map_err(|e| match e {
            coffer_store::ReplicaError::NotFound(_) => EngineError::not_found(format!("safe {url}")),
            other => other.into(),
        })?;
        let manifest = SafeManifest::from_bytes(&data)?;
        verify_signature(&manifest.creator, &manifest.signing_bytes(), &manifest.signature)
            .map_err(|_| EngineError::malformed(format!("manifest of {url} has a bad signature")))?;

        let safe = Self::new(catalog, identity.clone(), replica, manifest, config)?;
        {
            let mut state = safe.state.lock()?;
            safe.refresh_locked(&mut state, true)?;
            if !state.groups.can_open(identity.id()) {
                return Err(EngineError::denied(format!(
                    "{} is not a member of {url}",
                    identity.id().short()
                )));
            }
        }
        safe.record()?;

        tracing::info!(url, identity = %identity.id().short(), "safe opened");
        Ok(safe)
    }

    fn new(
        catalog: Arc<Catalog>,
        identity: Identity,
        replica: Arc<dyn Replica>,
        manifest: SafeManifest,
        config: Arc<EngineConfig>,
    ) -> Result<Self> {
        let url = replica.url().to_string();
        catalog.save_identity(&identity)?;
        catalog.remember(&manifest.creator)?;

        Ok(Self {
            url,
            replica,
            state: Mutex::new(SafeState {
                groups: GroupState::new(&manifest.creator),
                chain_len: 0,
                refreshed: None,
                keys: KeyRing::default(),
            }),
            catalog,
            identity,
            manifest,
            config,
            closed: AtomicBool::new(false),
        })
    }

    // Known safes only list sessions that got past the membership check.
    fn record(&self) -> Result<()> {
        self.catalog.db()?.upsert_safe(&SafeRecord {
            url: self.url.clone(),
            description: self.manifest.description.clone(),
            quota_bytes: self.manifest.quota_bytes,
            creator: self.manifest.creator.clone(),
            signature: hex::encode(&self.manifest.signature),
            created_at: self.manifest.created_at,
            opened_at: Some(Utc::now()),
        })?;
        Ok(())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn replica(&self) -> &dyn Replica {
        self.replica.as_ref()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config(&self) -> SafeConfig {
        SafeConfig {
            url: self.url.clone(),
            description: self.manifest.description.clone(),
            quota_bytes: self.manifest.quota_bytes,
            creator: self.manifest.creator.clone(),
            created_at: self.manifest.created_at,
            signature: hex::encode(&self.manifest.signature),
        }
    }

    /// Path-safe digest of the url, used for local directories.
    pub fn local_key(&self) -> String {
        hex::encode(&blake3::hash(self.url.as_bytes()).as_bytes()[..12])
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.catalog.is_closed()
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::Aborted);
        }
        Ok(())
    }

    /// Mark closed and wipe cached keys. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.keys.clear();
        }
        tracing::debug!(url = %self.url, "safe closed");
    }

    fn lock(&self) -> Result<MutexGuard<'_, SafeState>> {
        self.ensure_open()?;
        Ok(self.state.lock()?)
    }

    // -- groups -------------------------------------------------------------

    fn read_chain(&self) -> Result<GroupChain> {
        match self.replica.read(CHAIN) {
            Ok(data) => Ok(GroupChain::from_bytes(&data)?),
            Err(coffer_store::ReplicaError::NotFound(_)) => Ok(GroupChain::default()),
            Err(e) => Err(e.into()),
        }
    }

    // Replay the change log when it grew. `force` ignores the sync period.
    fn refresh_locked(&self, state: &mut SafeState, force: bool) -> Result<()> {
        let period = self.catalog.options().sync_period;
        let due = force
            || period.is_zero()
            || state.refreshed.map(|at| at.elapsed() >= period).unwrap_or(true);
        if !due {
            return Ok(());
        }

        let chain = self.read_chain()?;
        state.refreshed = Some(Instant::now());
        if chain.changes.len() == state.chain_len {
            return Ok(());
        }

        state.groups = GroupState::replay(&self.manifest.creator, &chain);
        state.chain_len = chain.changes.len();
        for group in state.groups.groups() {
            for member in group.members.keys() {
                self.catalog.remember(member)?;
            }
        }
        tracing::debug!(url = %self.url, changes = state.chain_len, "group state refreshed");
        Ok(())
    }

    /// Re-read group state from the replica now.
    pub fn refresh(&self) -> Result<()> {
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, true)
    }

    /// Apply a signed group change. Grants and revokes produce a new key
    /// version sealed for the group's members after the change.
    pub fn update_group(&self, group: &str, action: GroupAction, users: &[(IdentityId, i64)]) -> Result<()> {
        let group = GroupName::new(group)
            .ok_or_else(|| EngineError::malformed(format!("invalid group name '{group}'")))?;
        for (user, _) in users {
            PublicKeys::from_id(user)?;
        }

        let mut state = self.lock()?;
        self.refresh_locked(&mut state, true)?;
        state.groups.check(self.identity.id(), &group, action, users)?;

        let mut change = GroupChange {
            group: group.clone(),
            action,
            users: users.to_vec(),
            timestamp: Utc::now().timestamp_micros(),
            signer: self.identity.id().clone(),
            signature: Vec::new(),
        };
        change.signature = self.identity.sign(&change.signing_bytes(state.groups.head()))?;

        let mut next = state.groups.clone();
        next.apply(&change)?;

        // the envelope lands before the change that references it
        let mut new_key = None;
        if action.rotates_key() {
            let produced = next
                .group(&group)
                .and_then(|g| g.versions.last())
                .ok_or_else(|| EngineError::not_found(format!("group {group}")))?;
            let key = generate_symmetric_key();
            let envelope =
                keys::seal_envelope(&self.identity, &group, produced.version, &produced.members, &key)?;
            keys::write_envelope(self.replica.as_ref(), &envelope)?;
            if produced.members.contains(self.identity.id()) {
                new_key = Some((produced.version, key));
            }
        }

        let mut chain = self.read_chain()?;
        if chain.changes.len() != state.chain_len {
            return Err(EngineError::SyncConflict(format!(
                "group log of {} changed concurrently",
                self.url
            )));
        }
        chain.changes.push(change);
        self.replica.write(CHAIN, &chain.to_bytes()?)?;

        state.groups = next;
        state.chain_len = chain.changes.len();
        for (user, _) in users {
            self.catalog.remember(user)?;
        }
        if let Some((version, key)) = new_key {
            keys::retain(&self.catalog, &self.identity, &self.url, &group, version, &key)?;
            state.keys.insert(&group, version, key);
        }
        // the key set may have changed; rescan on the next listing
        self.catalog.invalidate(&self.url, &crate::fs::index_area(self.identity.id()))?;

        tracing::info!(
            url = %self.url,
            %group,
            action = ?action,
            users = users.len(),
            "group updated"
        );
        Ok(())
    }

    /// Membership snapshot of every group.
    pub fn groups(&self) -> Result<Vec<GroupSnapshot>> {
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, false)?;
        Ok(state.groups.snapshot())
    }

    /// Key chain of a group, oldest first. Versions the caller cannot
    /// derive are zero keys; the chain is padded with zero keys at the front
    /// up to `min_length` entries.
    pub fn get_keys(&self, group: &str, min_length: usize) -> Result<Vec<SymmetricKey>> {
        let group_name = GroupName::new(group)
            .ok_or_else(|| EngineError::malformed(format!("invalid group name '{group}'")))?;
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, false)?;

        let latest = state
            .groups
            .group(&group_name)
            .filter(|g| g.members.contains_key(self.identity.id()))
            .map(|g| g.key_version())
            .ok_or_else(|| EngineError::not_found(format!("group {group} for {}", self.identity.id().short())))?;

        let mut chain = Vec::with_capacity(latest as usize);
        for version in 1..=latest {
            match self.key_locked(&mut state, &group_name, version) {
                Ok(key) => chain.push(key),
                Err(EngineError::AccessDenied(_)) => chain.push([0u8; 32]),
                Err(e) => return Err(e),
            }
        }
        if chain.len() < min_length {
            let mut padded = vec![[0u8; 32]; min_length - chain.len()];
            padded.extend(chain);
            chain = padded;
        }
        Ok(chain)
    }

    // -- keys ---------------------------------------------------------------

    fn key_locked(&self, state: &mut SafeState, group: &GroupName, version: u32) -> Result<SymmetricKey> {
        if let Some(key) = state.keys.get(group, version) {
            return Ok(key);
        }
        for (retained_version, key) in keys::retained(&self.catalog, &self.identity, &self.url, group)? {
            state.keys.insert(group, retained_version, key);
        }
        if let Some(key) = state.keys.get(group, version) {
            return Ok(key);
        }

        if state.groups.group(group).and_then(|g| g.version(version)).is_none() {
            self.refresh_locked(state, true)?;
        }
        let sealer = state
            .groups
            .group(group)
            .and_then(|g| g.version(version))
            .map(|v| v.sealer.clone())
            .ok_or_else(|| EngineError::not_found(format!("key {group}#{version}")))?;

        let envelope = keys::read_envelope(self.replica.as_ref(), group, version)?;
        let key = keys::open_envelope(&self.identity, &envelope, &sealer)?;
        keys::retain(&self.catalog, &self.identity, &self.url, group, version, &key)?;
        state.keys.insert(group, version, key);
        tracing::debug!(url = %self.url, %group, version, "group key opened");
        Ok(key)
    }

    /// Key of a specific version, from cache, catalog or replica.
    pub fn key(&self, group: &GroupName, version: u32) -> Result<SymmetricKey> {
        let mut state = self.lock()?;
        self.key_locked(&mut state, group, version)
    }

    /// Newest key version of a group.
    pub fn newest_key(&self, group: &GroupName) -> Result<(u32, SymmetricKey)> {
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, false)?;
        let version = state
            .groups
            .group(group)
            .map(|g| g.key_version())
            .filter(|v| *v > 0)
            .ok_or_else(|| EngineError::not_found(format!("group {group}")))?;
        let key = self.key_locked(&mut state, group, version)?;
        Ok((version, key))
    }

    // -- access checks --------------------------------------------------------

    /// Writer or admin, and not cursed, in `group`.
    pub fn check_write(&self, group: &GroupName) -> Result<()> {
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, false)?;
        let id = self.identity.id();
        let member = state
            .groups
            .group(group)
            .and_then(|g| g.member(id))
            .ok_or_else(|| EngineError::denied(format!("{} is not in group {group}", id.short())))?;
        if member.cursed {
            return Err(EngineError::denied(format!("{} is cursed in group {group}", id.short())));
        }
        if member.role < Role::Writer {
            return Err(EngineError::denied(format!("{} cannot write to group {group}", id.short())));
        }
        Ok(())
    }

    /// Current member of `group`, any role.
    pub fn check_member(&self, group: &GroupName) -> Result<()> {
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, false)?;
        if state.groups.role(self.identity.id(), group).is_none() {
            return Err(EngineError::denied(format!(
                "{} is not in group {group}",
                self.identity.id().short()
            )));
        }
        Ok(())
    }

    /// Whether `id` is cursed in `group`, or in any group when `group` is
    /// `None`.
    pub fn is_cursed(&self, id: &IdentityId, group: Option<&GroupName>) -> Result<bool> {
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, false)?;
        Ok(match group {
            Some(group) => state.groups.is_cursed(id, group),
            None => state.groups.groups().any(|g| g.member(id).map(|m| m.cursed).unwrap_or(false)),
        })
    }

    /// Cursed members per group.
    pub fn cursed(&self) -> Result<BTreeMap<GroupName, Vec<IdentityId>>> {
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, false)?;
        Ok(state
            .groups
            .groups()
            .map(|g| {
                let cursed = g
                    .members
                    .iter()
                    .filter(|(_, m)| m.cursed)
                    .map(|(id, _)| id.clone())
                    .collect();
                (g.name.clone(), cursed)
            })
            .collect())
    }

    /// Key versions sealed for the identity, per group.
    pub fn readable_versions(&self) -> Result<Vec<(GroupName, u32)>> {
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, false)?;
        let id = self.identity.id();
        Ok(state
            .groups
            .groups()
            .flat_map(|g| {
                g.versions
                    .iter()
                    .filter(|v| v.members.contains(id))
                    .map(move |v| (g.name.clone(), v.version))
            })
            .collect())
    }

    /// Groups the identity is currently a member of.
    pub fn memberships(&self) -> Result<Vec<GroupName>> {
        let mut state = self.lock()?;
        self.refresh_locked(&mut state, false)?;
        Ok(state.groups.memberships(self.identity.id()))
    }
}

// Undo a half-created safe so the url can be created again.
fn discard_created(replica: &dyn Replica, catalog: &Catalog) {
    let mut names = vec![CHAIN.to_string()];
    for group in [ADMIN_GROUP, USERS_GROUP] {
        names.push(keys::envelope_path(&GroupName(group.into()), 1));
    }
    names.push(MANIFEST.to_string());
    for name in names {
        if let Err(e) = replica.delete(&name) {
            if !matches!(e, coffer_store::ReplicaError::NotFound(_)) {
                tracing::warn!(url = replica.url(), name, error = %e, "cleanup after failed create");
            }
        }
    }
    match catalog.db() {
        Ok(db) => {
            if let Err(e) = db.delete_safe(replica.url()) {
                tracing::warn!(url = replica.url(), error = %e, "cleanup after failed create");
            }
        }
        Err(e) => tracing::warn!(url = replica.url(), error = %e, "cleanup after failed create"),
    }
}
