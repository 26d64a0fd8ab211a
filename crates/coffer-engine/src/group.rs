//! Group membership state.
//!
//! A safe's groups are the replay of its signed, hash-chained change log.
//! Every entry is verified against the chain head and authorized against
//! the state produced by the entries before it; entries that fail either
//! check are skipped. Grants and revokes open a new key version whose
//! member set is frozen at that point.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use coffer_shared::constants::ADMIN_GROUP;
use coffer_shared::identity::verify_signature;
use coffer_shared::protocol::{GroupAction, GroupChain, GroupChange};
use coffer_shared::{GroupName, IdentityId};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Writer,
    Admin,
}

impl Role {
    /// Integer roles used by `grant`: 1 reader, 2 writer, 3 admin.
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Reader),
            2 => Some(Self::Writer),
            3 => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            Self::Reader => 1,
            Self::Writer => 2,
            Self::Admin => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub role: Role,
    /// Set by `curse`: the member keeps reading but cannot write.
    pub cursed: bool,
    /// Net weight of endorsements minus curses.
    pub trust: i64,
}

/// Membership frozen when a key version was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVersion {
    pub version: u32,
    /// Identity that produced and sealed this version.
    pub sealer: IdentityId,
    pub members: BTreeSet<IdentityId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: GroupName,
    pub members: BTreeMap<IdentityId, Member>,
    pub versions: Vec<KeyVersion>,
}

impl Group {
    fn new(name: GroupName) -> Self {
        Self {
            name,
            members: BTreeMap::new(),
            versions: Vec::new(),
        }
    }

    /// Newest key version, 0 before the first grant.
    pub fn key_version(&self) -> u32 {
        self.versions.len() as u32
    }

    pub fn version(&self, version: u32) -> Option<&KeyVersion> {
        version
            .checked_sub(1)
            .and_then(|i| self.versions.get(i as usize))
    }

    pub fn member(&self, id: &IdentityId) -> Option<&Member> {
        self.members.get(id)
    }

    fn rotate(&mut self, sealer: &IdentityId) {
        let version = self.key_version() + 1;
        self.versions.push(KeyVersion {
            version,
            sealer: sealer.clone(),
            members: self.members.keys().cloned().collect(),
        });
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            name: self.name.clone(),
            members: self.members.clone(),
            key_version: self.key_version(),
        }
    }
}

/// Membership and roles of a group, without key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub name: GroupName,
    pub members: BTreeMap<IdentityId, Member>,
    pub key_version: u32,
}

#[derive(Debug, Clone)]
pub struct GroupState {
    founder: IdentityId,
    groups: BTreeMap<GroupName, Group>,
    head: [u8; 32],
    applied: usize,
}

impl GroupState {
    pub fn new(founder: &IdentityId) -> Self {
        Self {
            founder: founder.clone(),
            groups: BTreeMap::new(),
            head: [0u8; 32],
            applied: 0,
        }
    }

    /// Rebuild the state from a full change log.
    pub fn replay(founder: &IdentityId, chain: &GroupChain) -> Self {
        let mut state = Self::new(founder);
        for (index, change) in chain.changes.iter().enumerate() {
            if let Err(e) = state.apply(change) {
                tracing::warn!(
                    index,
                    group = %change.group,
                    signer = %change.signer.short(),
                    error = %e,
                    "skipping group change"
                );
            }
        }
        state
    }

    /// Hash the next change must be signed against.
    pub fn head(&self) -> &[u8; 32] {
        &self.head
    }

    /// Number of changes applied.
    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn group(&self, name: &GroupName) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn role(&self, id: &IdentityId, group: &GroupName) -> Option<Role> {
        self.group(group).and_then(|g| g.member(id)).map(|m| m.role)
    }

    pub fn is_cursed(&self, id: &IdentityId, group: &GroupName) -> bool {
        self.group(group)
            .and_then(|g| g.member(id))
            .map(|m| m.cursed)
            .unwrap_or(false)
    }

    /// Member of at least one group, i.e. allowed to open the safe.
    pub fn can_open(&self, id: &IdentityId) -> bool {
        self.groups.values().any(|g| g.members.contains_key(id))
    }

    /// Groups the identity currently belongs to.
    pub fn memberships(&self, id: &IdentityId) -> Vec<GroupName> {
        self.groups
            .values()
            .filter(|g| g.members.contains_key(id))
            .map(|g| g.name.clone())
            .collect()
    }

    /// Administrative right over `group`: an uncursed admin of the `admin`
    /// group or of `group` itself. While the `admin` group is empty only the
    /// founder holds it.
    pub fn can_administer(&self, id: &IdentityId, group: &GroupName) -> bool {
        let admin_group = GroupName(ADMIN_GROUP.to_string());
        let bootstrapping = self
            .group(&admin_group)
            .map(|g| g.members.is_empty())
            .unwrap_or(true);
        if bootstrapping {
            return *id == self.founder;
        }

        let is_admin_of = |name: &GroupName| {
            self.group(name)
                .and_then(|g| g.member(id))
                .map(|m| m.role == Role::Admin && !m.cursed)
                .unwrap_or(false)
        };
        is_admin_of(&admin_group) || is_admin_of(group)
    }

    /// Check that `signer` may apply `action` to `users` in `group`.
    pub fn check(
        &self,
        signer: &IdentityId,
        group: &GroupName,
        action: GroupAction,
        users: &[(IdentityId, i64)],
    ) -> Result<()> {
        if users.is_empty() {
            return Err(EngineError::malformed("no users given"));
        }
        if !self.can_administer(signer, group) {
            return Err(EngineError::denied(format!(
                "{} is not an administrator of {group}",
                signer.short()
            )));
        }

        match action {
            GroupAction::Grant => {
                for (user, value) in users {
                    if Role::from_value(*value).is_none() {
                        return Err(EngineError::malformed(format!(
                            "invalid role {value} for {}",
                            user.short()
                        )));
                    }
                }
            }
            GroupAction::Revoke | GroupAction::Curse | GroupAction::Endorse => {
                let existing = self
                    .group(group)
                    .ok_or_else(|| EngineError::not_found(format!("group {group}")))?;
                for (user, _) in users {
                    if !existing.members.contains_key(user) {
                        return Err(EngineError::not_found(format!(
                            "{} in group {group}",
                            user.short()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Verify, authorize and apply one change.
    pub fn apply(&mut self, change: &GroupChange) -> Result<()> {
        verify_signature(
            &change.signer,
            &change.signing_bytes(&self.head),
            &change.signature,
        )
        .map_err(|_| EngineError::malformed("bad signature on group change"))?;
        self.check(&change.signer, &change.group, change.action, &change.users)?;

        let group = self
            .groups
            .entry(change.group.clone())
            .or_insert_with(|| Group::new(change.group.clone()));

        match change.action {
            GroupAction::Grant => {
                for (user, value) in &change.users {
                    let role = Role::from_value(*value)
                        .ok_or_else(|| EngineError::malformed(format!("invalid role {value}")))?;
                    group
                        .members
                        .entry(user.clone())
                        .and_modify(|m| m.role = role)
                        .or_insert(Member {
                            role,
                            cursed: false,
                            trust: 0,
                        });
                }
                group.rotate(&change.signer);
            }
            GroupAction::Revoke => {
                for (user, _) in &change.users {
                    group.members.remove(user);
                }
                group.rotate(&change.signer);
            }
            GroupAction::Curse => {
                for (user, weight) in &change.users {
                    if let Some(member) = group.members.get_mut(user) {
                        member.cursed = true;
                        member.trust = member.trust.saturating_sub(*weight);
                    }
                }
            }
            GroupAction::Endorse => {
                for (user, weight) in &change.users {
                    if let Some(member) = group.members.get_mut(user) {
                        member.cursed = false;
                        member.trust = member.trust.saturating_add(*weight);
                    }
                }
            }
        }

        self.head = change.link_hash(&self.head);
        self.applied += 1;
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        self.groups.values().map(Group::snapshot).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use coffer_shared::Identity;

    use super::*;

    pub(crate) fn signed(
        signer: &Identity,
        state: &GroupState,
        group: &str,
        action: GroupAction,
        users: &[(&Identity, i64)],
    ) -> GroupChange {
        let mut change = GroupChange {
            group: GroupName(group.to_string()),
            action,
            users: users.iter().map(|(u, v)| (u.id().clone(), *v)).collect(),
            timestamp: 1,
            signer: signer.id().clone(),
            signature: Vec::new(),
        };
        change.signature = signer.sign(&change.signing_bytes(state.head())).unwrap();
        change
    }

    fn founded() -> (Identity, GroupState) {
        let founder = Identity::create("founder").unwrap();
        let mut state = GroupState::new(founder.id());
        for group in [ADMIN_GROUP, "users"] {
            let change = signed(&founder, &state, group, GroupAction::Grant, &[(&founder, 3)]);
            state.apply(&change).unwrap();
        }
        (founder, state)
    }

    #[test]
    fn founder_bootstraps_admin() {
        let (founder, state) = founded();
        let admin = GroupName(ADMIN_GROUP.into());
        assert_eq!(state.role(founder.id(), &admin), Some(Role::Admin));
        assert_eq!(state.group(&admin).unwrap().key_version(), 1);
        assert!(state.can_open(founder.id()));
        assert_eq!(state.applied(), 2);
    }

    #[test]
    fn only_founder_may_bootstrap() {
        let founder = Identity::create("founder").unwrap();
        let intruder = Identity::create("intruder").unwrap();
        let mut state = GroupState::new(founder.id());
        let change = signed(&intruder, &state, ADMIN_GROUP, GroupAction::Grant, &[(&intruder, 3)]);
        assert!(matches!(state.apply(&change), Err(EngineError::AccessDenied(_))));
    }

    #[test]
    fn grant_and_revoke_rotate_keys() {
        let (founder, mut state) = founded();
        let alice = Identity::create("alice").unwrap();
        let g = GroupName("g".into());

        let grant = signed(&founder, &state, "g", GroupAction::Grant, &[(&alice, 1)]);
        state.apply(&grant).unwrap();
        let group = state.group(&g).unwrap();
        assert_eq!(group.key_version(), 1);
        assert!(group.version(1).unwrap().members.contains(alice.id()));

        let revoke = signed(&founder, &state, "g", GroupAction::Revoke, &[(&alice, 0)]);
        state.apply(&revoke).unwrap();
        let group = state.group(&g).unwrap();
        assert_eq!(group.key_version(), 2);
        assert!(!group.version(2).unwrap().members.contains(alice.id()));
        assert!(!state.can_open(alice.id()));
    }

    #[test]
    fn curse_and_endorse_keep_keys() {
        let (founder, mut state) = founded();
        let alice = Identity::create("alice").unwrap();
        let users = GroupName("users".into());
        state
            .apply(&signed(&founder, &state, "users", GroupAction::Grant, &[(&alice, 2)]))
            .unwrap();
        let version = state.group(&users).unwrap().key_version();

        state
            .apply(&signed(&founder, &state, "users", GroupAction::Curse, &[(&alice, 5)]))
            .unwrap();
        assert!(state.is_cursed(alice.id(), &users));
        assert_eq!(state.group(&users).unwrap().member(alice.id()).unwrap().trust, -5);

        state
            .apply(&signed(&founder, &state, "users", GroupAction::Endorse, &[(&alice, 7)]))
            .unwrap();
        let member = state.group(&users).unwrap().member(alice.id()).unwrap();
        assert!(!member.cursed);
        assert_eq!(member.trust, 2);
        assert_eq!(state.group(&users).unwrap().key_version(), version);
    }

    #[test]
    fn non_admin_cannot_mutate() {
        let (founder, mut state) = founded();
        let alice = Identity::create("alice").unwrap();
        let bob = Identity::create("bob").unwrap();
        state
            .apply(&signed(&founder, &state, "users", GroupAction::Grant, &[(&alice, 2)]))
            .unwrap();

        let change = signed(&alice, &state, "users", GroupAction::Grant, &[(&bob, 1)]);
        assert!(matches!(state.apply(&change), Err(EngineError::AccessDenied(_))));

        // group admins administer their own group only
        state
            .apply(&signed(&founder, &state, "team", GroupAction::Grant, &[(&alice, 3)]))
            .unwrap();
        assert!(state.can_administer(alice.id(), &GroupName("team".into())));
        assert!(!state.can_administer(alice.id(), &GroupName("users".into())));
    }

    #[test]
    fn invalid_roles_and_unknown_members() {
        let (founder, state) = founded();
        let alice = Identity::create("alice").unwrap();
        let g = GroupName("users".into());

        assert!(matches!(
            state.check(founder.id(), &g, GroupAction::Grant, &[(alice.id().clone(), 9)]),
            Err(EngineError::MalformedInput(_))
        ));
        assert!(matches!(
            state.check(founder.id(), &g, GroupAction::Revoke, &[(alice.id().clone(), 0)]),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            state.check(founder.id(), &GroupName("nope".into()), GroupAction::Curse, &[(alice.id().clone(), 1)]),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            state.check(founder.id(), &g, GroupAction::Grant, &[]),
            Err(EngineError::MalformedInput(_))
        ));
    }

    #[test]
    fn replay_skips_tampered_entries() {
        let (founder, mut state) = founded();
        let alice = Identity::create("alice").unwrap();
        let grant = signed(&founder, &state, "g", GroupAction::Grant, &[(&alice, 1)]);
        state.apply(&grant).unwrap();

        let first = signed(&founder, &GroupState::new(founder.id()), ADMIN_GROUP, GroupAction::Grant, &[(&founder, 3)]);
        let mut replayed_chain = GroupChain {
            changes: vec![first],
        };
        let second_state = GroupState::replay(founder.id(), &replayed_chain);
        assert_eq!(second_state.applied(), 1);

        let mut forged = signed(&founder, &second_state, "g", GroupAction::Grant, &[(&alice, 1)]);
        forged.users[0].1 = 3;
        replayed_chain.changes.push(forged);
        let replayed = GroupState::replay(founder.id(), &replayed_chain);
        assert_eq!(replayed.applied(), 1);
        assert!(replayed.group(&GroupName("g".into())).is_none());
    }
}
