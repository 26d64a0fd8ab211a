mod common;

use coffer_engine::{EngineError, FsView, GetOptions, PutOptions, Role};
use coffer_shared::protocol::GroupAction;
use coffer_shared::{GroupName, Identity};

use common::{mem_url, Member};

#[test]
fn identity_round_trips_through_private_material() {
    let identity = Identity::create("carol").unwrap();
    assert!(identity.id().as_str().starts_with("carol."));

    let private = identity.private_material().unwrap();
    let rebuilt = Identity::from_private("carol", &private).unwrap();
    assert_eq!(rebuilt.id(), identity.id());

    assert!(Identity::from_private("carol", "not-key-material").is_err());
}

#[test]
fn create_is_exclusive_and_open_needs_a_safe() {
    let founder = Member::new("founder");
    let url = mem_url();

    founder.create(&url).unwrap();
    assert!(matches!(founder.create(&url), Err(EngineError::AlreadyExists(_))));
    assert!(matches!(founder.open(&mem_url()), Err(EngineError::NotFound(_))));
}

#[test]
fn strangers_cannot_open() {
    let founder = Member::new("founder");
    let stranger = Member::new("stranger");
    let url = mem_url();
    founder.create(&url).unwrap();

    assert!(matches!(stranger.open(&url), Err(EngineError::AccessDenied(_))));
}

#[test]
fn grant_then_revoke_keeps_history_readable() {
    let founder = Member::new("founder");
    let alice = Member::new("alice");
    let url = mem_url();
    let safe = founder.create(&url).unwrap();

    safe.update_group(
        "g",
        GroupAction::Grant,
        &[(alice.identity.id().clone(), Role::Reader.value()), (founder.identity.id().clone(), 3)],
    )
    .unwrap();
    let founder_fs = FsView::new(safe.clone());
    let in_g = PutOptions {
        group: Some("g".into()),
        ..Default::default()
    };
    founder_fs.put_data("before.txt", b"history", &in_g).unwrap();

    let alice_safe = alice.open(&url).unwrap();
    let alice_fs = FsView::new(alice_safe.clone());
    let no_cache = GetOptions {
        no_cache: true,
        ..Default::default()
    };
    assert_eq!(alice_fs.get_data("before.txt", &no_cache).unwrap(), b"history");
    assert!(matches!(
        alice_fs.put_data("mine.txt", b"x", &in_g),
        Err(EngineError::AccessDenied(_))
    ));

    safe.update_group("g", GroupAction::Revoke, &[(alice.identity.id().clone(), 0)]).unwrap();
    founder_fs.put_data("after.txt", b"future", &in_g).unwrap();

    // a new session is refused
    assert!(matches!(alice.open(&url), Err(EngineError::AccessDenied(_))));

    // retained keys still open what was written before
    assert_eq!(alice_fs.get_data("before.txt", &no_cache).unwrap(), b"history");
    assert!(alice_fs.get_data("after.txt", &no_cache).is_err());
    assert_eq!(founder_fs.get_data("after.txt", &no_cache).unwrap(), b"future");
}

#[test]
fn group_snapshots_track_changes() {
    let founder = Member::new("founder");
    let bob = Member::new("bob");
    let url = mem_url();
    let safe = founder.create(&url).unwrap();

    safe.update_group("users", GroupAction::Grant, &[(bob.identity.id().clone(), 2)]).unwrap();
    let users = safe
        .groups()
        .unwrap()
        .into_iter()
        .find(|g| g.name.as_str() == "users")
        .unwrap();
    assert_eq!(users.key_version, 2);
    assert_eq!(users.members[bob.identity.id()].role, Role::Writer);

    safe.update_group("users", GroupAction::Curse, &[(bob.identity.id().clone(), 1)]).unwrap();
    let bob_safe = bob.open(&url).unwrap();
    let users_group = GroupName("users".into());
    assert!(bob_safe.is_cursed(bob.identity.id(), Some(&users_group)).unwrap());
    // cursing leaves keys alone
    assert_eq!(bob_safe.get_keys("users", 0).unwrap().len(), 2);

    assert!(matches!(
        safe.update_group("users", GroupAction::Grant, &[(bob.identity.id().clone(), 9)]),
        Err(EngineError::MalformedInput(_))
    ));
    assert!(matches!(
        bob_safe.update_group("users", GroupAction::Endorse, &[(bob.identity.id().clone(), 1)]),
        Err(EngineError::AccessDenied(_))
    ));
}
