mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use coffer_engine::{
    CommView, DbView, EngineConfig, EngineError, FileRange, FsView, GetOptions, ListOptions, Params, Payload,
    PutOptions, SafeSettings,
};
use coffer_shared::protocol::GroupAction;
use coffer_shared::BodyId;

use common::{mem_url, Member};

fn names(entries: &[coffer_engine::FileEntry]) -> Vec<String> {
    entries.iter().map(|e| e.name.clone()).collect()
}

#[test]
fn files_put_get_delete() {
    let founder = Member::new("founder");
    let fs = FsView::new(founder.create(&mem_url()).unwrap());

    let entry = fs.put_data("x.txt", b"hello", &PutOptions::default()).unwrap();
    assert_eq!(entry.size, 5);
    assert_eq!(entry.content_type, "text/plain");
    assert_eq!(fs.get_data("x.txt", &Default::default()).unwrap(), b"hello");

    fs.delete("x.txt").unwrap();
    assert!(names(&fs.list("", &ListOptions::default()).unwrap()).is_empty());
    assert!(matches!(fs.stat("x.txt"), Err(EngineError::NotFound(_))));

    let with_deleted = ListOptions {
        include_deleted: true,
        ..Default::default()
    };
    let listed = fs.list("", &with_deleted).unwrap();
    assert_eq!(names(&listed), vec!["x.txt"]);
    assert!(listed[0].deleted);
}

#[test]
fn listing_missing_directory_is_tolerant() {
    let founder = Member::new("founder");
    let fs = FsView::new(founder.create(&mem_url()).unwrap());

    assert!(fs.list("nowhere", &ListOptions::default()).unwrap().is_empty());
    let strict = ListOptions {
        error_if_not_exist: true,
        ..Default::default()
    };
    assert!(matches!(fs.list("nowhere", &strict), Err(EngineError::NotFound(_))));
}

#[test]
fn rename_keeps_body_and_tags() {
    let founder = Member::new("founder");
    let fs = FsView::new(founder.create(&mem_url()).unwrap());

    let tagged = PutOptions {
        tags: vec!["draft".into()],
        zip: true,
        ..Default::default()
    };
    let original = fs.put_data("docs/a.md", b"# title", &tagged).unwrap();
    let moved = fs.rename("docs/a.md", "docs/b.md").unwrap();
    assert_eq!(moved.body_id, original.body_id);
    assert_eq!(moved.tags, vec!["draft".to_string()]);
    assert_eq!(fs.get_data("docs/b.md", &Default::default()).unwrap(), b"# title");
    assert!(matches!(fs.stat("docs/a.md"), Err(EngineError::NotFound(_))));
}

#[test]
fn cursor_streams_every_row_once() {
    let founder = Member::new("founder");
    let safe = founder.create(&mem_url()).unwrap();
    let ddls = BTreeMap::from([(1, "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)".to_string())]);
    let db = DbView::open(safe, "users", &ddls).unwrap();

    for i in 0..4 {
        let params: Params = json!({"id": i, "body": format!("note {i}")})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(db.exec("INSERT INTO notes (id, body) VALUES (:id, :body)", &params).unwrap(), 1);
    }

    let cursor = db.query("SELECT id, body FROM notes ORDER BY id", &Params::new()).unwrap();
    let mut rows = Vec::new();
    while let Some(row) = cursor.next().unwrap() {
        rows.push(row);
    }
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[3].get("body"), Some(&json!("note 3")));
    assert!(cursor.next().unwrap().is_none());
    cursor.close();
}

#[test]
fn database_sync_replays_other_members() {
    let founder = Member::new("founder");
    let bob = Member::new("bob");
    let url = mem_url();
    let safe = founder.create(&url).unwrap();
    safe.update_group("users", GroupAction::Grant, &[(bob.identity.id().clone(), 2)]).unwrap();

    let ddls = BTreeMap::from([(1, "CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT)".to_string())]);
    let founder_db = DbView::open(safe, "users", &ddls).unwrap();
    let bob_db = DbView::open(bob.open(&url).unwrap(), "users", &ddls).unwrap();

    let params: Params = json!({"k": "color", "v": "blue"}).as_object().cloned().unwrap();
    founder_db.exec("INSERT INTO kv (k, v) VALUES (:k, :v)", &params).unwrap();
    assert_eq!(founder_db.sync().unwrap(), 0);
    assert_eq!(bob_db.sync().unwrap(), 1);
    assert_eq!(bob_db.sync().unwrap(), 0);

    let cursor = bob_db.query("SELECT v FROM kv WHERE k = 'color'", &Params::new()).unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().get("v"), Some(&json!("blue")));

    // the same insert again collides on the primary key
    bob_db.exec("INSERT INTO kv (k, v) VALUES ('shape', 'round')", &Params::new()).unwrap();
    founder_db.exec("INSERT INTO kv (k, v) VALUES ('shape', 'square')", &Params::new()).unwrap();
    bob_db.sync().unwrap();
    assert!(matches!(founder_db.sync(), Err(EngineError::SyncConflict(_))));
}

#[test]
fn broadcast_receive_and_rewind() {
    let founder = Member::new("founder");
    let bob = Member::new("bob");
    let url = mem_url();
    let safe = founder.create(&url).unwrap();
    safe.update_group("users", GroupAction::Grant, &[(bob.identity.id().clone(), 2)]).unwrap();

    let founder_comm = CommView::new(safe);
    let bob_comm = CommView::new(bob.open(&url).unwrap());

    let id = founder_comm.broadcast("users", &Payload::text("hi")).unwrap();

    for comm in [&founder_comm, &bob_comm] {
        let messages = comm.receive("").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].text.as_deref(), Some("hi"));
        assert_eq!(messages[0].sender, *founder.identity.id());
    }
    assert!(bob_comm.receive("").unwrap().is_empty());

    bob_comm.rewind("users", id).unwrap();
    let again = bob_comm.receive("users").unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].text.as_deref(), Some("hi"));

    assert!(matches!(
        founder_comm.broadcast("users", &Payload::default()),
        Err(EngineError::MalformedInput(_))
    ));
}

#[test]
fn direct_message_with_attachment() {
    let founder = Member::new("founder");
    let bob = Member::new("bob");
    let url = mem_url();
    let safe = founder.create(&url).unwrap();
    safe.update_group("users", GroupAction::Grant, &[(bob.identity.id().clone(), 1)]).unwrap();

    let founder_comm = CommView::new(safe);
    let bob_comm = CommView::new(bob.open(&url).unwrap());

    let source = founder.dir.path().join("report.csv");
    std::fs::write(&source, b"a,b\n1,2\n").unwrap();
    founder_comm.send(bob.identity.id(), &Payload::file(&source)).unwrap();
    founder_comm.send(bob.identity.id(), &Payload::text("see attached")).unwrap();

    let messages = bob_comm.receive(founder.identity.id().as_str()).unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[0].has_attachment);
    assert_eq!(messages[0].file_name.as_deref(), Some("report.csv"));

    let dest = bob.dir.path().join("downloads/report.csv");
    assert_eq!(bob_comm.download(&messages[0], &dest).unwrap(), 8);
    assert_eq!(std::fs::read(&dest).unwrap(), b"a,b\n1,2\n");
    assert!(matches!(
        bob_comm.download(&messages[1], &dest),
        Err(EngineError::NotFound(_))
    ));

    // direct messages are not part of the sender's own streams
    assert!(founder_comm.receive("").unwrap().is_empty());
}

fn in_group(group: &str) -> PutOptions {
    PutOptions {
        group: Some(group.into()),
        ..Default::default()
    }
}

#[test]
fn shared_catalog_hides_content_after_revoke() {
    let founder = Member::new("founder");
    let alice = founder.sharing("alice");
    let url = mem_url();
    let safe = founder.create(&url).unwrap();
    safe.update_group(
        "g",
        GroupAction::Grant,
        &[(alice.identity.id().clone(), 1), (founder.identity.id().clone(), 3)],
    )
    .unwrap();
    let founder_fs = FsView::new(safe.clone());
    founder_fs.put_data("before.txt", b"history", &in_group("g")).unwrap();

    let alice_safe = alice.open(&url).unwrap();
    let alice_fs = FsView::new(alice_safe.clone());
    assert_eq!(alice_fs.get_data("before.txt", &GetOptions::default()).unwrap(), b"history");

    safe.update_group("g", GroupAction::Revoke, &[(alice.identity.id().clone(), 0)]).unwrap();
    founder_fs.put_data("secret.txt", b"future", &in_group("g")).unwrap();
    // leaves the body in the catalog cache both identities use
    assert_eq!(founder_fs.get_data("secret.txt", &GetOptions::default()).unwrap(), b"future");
    assert_eq!(names(&founder_fs.list("", &ListOptions::default()).unwrap()), vec!["before.txt", "secret.txt"]);

    alice_safe.refresh().unwrap();
    assert_eq!(names(&alice_fs.list("", &ListOptions::default()).unwrap()), vec!["before.txt"]);
    assert!(matches!(alice_fs.stat("secret.txt"), Err(EngineError::NotFound(_))));
    assert!(matches!(
        alice_fs.get_data("secret.txt", &GetOptions::default()),
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(alice_fs.get_data("before.txt", &GetOptions::default()).unwrap(), b"history");
}

#[test]
fn quota_is_enforced_on_stored_bodies() {
    let founder = Member::new("founder");
    let settings = SafeSettings {
        description: String::new(),
        quota_bytes: 200,
    };
    let fs = FsView::new(founder.create_with(&mem_url(), &settings, common::config()).unwrap());

    fs.put_data("a.bin", &[1u8; 100], &PutOptions::default()).unwrap();
    assert!(matches!(
        fs.put_data("b.bin", &[2u8; 100], &PutOptions::default()),
        Err(EngineError::QuotaExceeded { quota: 200, .. })
    ));
    assert!(matches!(fs.stat("b.bin"), Err(EngineError::NotFound(_))));
}

#[test]
fn private_entries_reach_only_their_parties() {
    let founder = Member::new("founder");
    let bob = Member::new("bob");
    let carol = Member::new("carol");
    let url = mem_url();
    let safe = founder.create(&url).unwrap();
    safe.update_group(
        "users",
        GroupAction::Grant,
        &[(bob.identity.id().clone(), 1), (carol.identity.id().clone(), 1)],
    )
    .unwrap();

    let founder_fs = FsView::new(safe);
    let for_bob = PutOptions {
        private: Some(bob.identity.id().clone()),
        ..Default::default()
    };
    let entry = founder_fs.put_data("note.txt", b"for bob", &for_bob).unwrap();
    assert_eq!(entry.private_id.as_ref(), Some(bob.identity.id()));
    assert_eq!(founder_fs.get_data("note.txt", &GetOptions::default()).unwrap(), b"for bob");

    let bob_fs = FsView::new(bob.open(&url).unwrap());
    let listed = bob_fs.list("", &ListOptions::default()).unwrap();
    assert_eq!(names(&listed), vec!["note.txt"]);
    assert_eq!(listed[0].creator, *founder.identity.id());
    assert_eq!(bob_fs.get_data("note.txt", &GetOptions::default()).unwrap(), b"for bob");

    let carol_fs = FsView::new(carol.open(&url).unwrap());
    assert!(carol_fs.list("", &ListOptions::default()).unwrap().is_empty());
    assert!(matches!(
        carol_fs.get_data("note.txt", &GetOptions::default()),
        Err(EngineError::NotFound(_))
    ));
}

#[test]
fn replace_and_replace_id() {
    let founder = Member::new("founder");
    let fs = FsView::new(founder.create(&mem_url()).unwrap());
    let count = |fs: &FsView, name: &str| {
        fs.list("docs", &ListOptions::default())
            .unwrap()
            .iter()
            .filter(|e| e.name == name)
            .count()
    };

    let first = fs.put_data("docs/a.txt", b"one", &PutOptions::default()).unwrap();
    fs.put_data("docs/a.txt", b"two", &PutOptions::default()).unwrap();
    assert_eq!(count(&fs, "a.txt"), 2);

    let overwrite = PutOptions {
        replace_id: Some(first.id),
        ..Default::default()
    };
    let rewritten = fs.put_data("docs/a.txt", b"three", &overwrite).unwrap();
    assert_eq!(rewritten.id, first.id);
    assert_eq!(count(&fs, "a.txt"), 2);
    assert_eq!(fs.get_data("docs/a.txt", &GetOptions::default()).unwrap(), b"three");

    // an id only counts at its own path
    fs.put_data("docs/b.txt", b"b", &PutOptions::default()).unwrap();
    assert!(matches!(
        fs.put_data("docs/b.txt", b"stolen", &overwrite),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        fs.put_data("docs/a.txt", b"x", &PutOptions { replace_id: Some(42), ..Default::default() }),
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(fs.get_data("docs/a.txt", &GetOptions::default()).unwrap(), b"three");

    let replace = PutOptions {
        replace: true,
        ..Default::default()
    };
    fs.put_data("docs/a.txt", b"four", &replace).unwrap();
    assert_eq!(count(&fs, "a.txt"), 1);
    assert_eq!(count(&fs, "b.txt"), 1);
    assert_eq!(fs.get_data("docs/a.txt", &GetOptions::default()).unwrap(), b"four");
}

#[test]
fn replace_id_needs_write_access() {
    let founder = Member::new("founder");
    let bob = Member::new("bob");
    let url = mem_url();
    let safe = founder.create(&url).unwrap();
    safe.update_group(
        "g",
        GroupAction::Grant,
        &[(bob.identity.id().clone(), 1), (founder.identity.id().clone(), 3)],
    )
    .unwrap();
    safe.update_group("users", GroupAction::Grant, &[(bob.identity.id().clone(), 2)]).unwrap();
    let readonly = FsView::new(safe).put_data("shared.txt", b"theirs", &in_group("g")).unwrap();

    let bob_fs = FsView::new(bob.open(&url).unwrap());
    let overwrite = PutOptions {
        group: Some("users".into()),
        replace_id: Some(readonly.id),
        ..Default::default()
    };
    assert!(matches!(
        bob_fs.put_data("shared.txt", b"mine", &overwrite),
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(bob_fs.get_data("shared.txt", &GetOptions::default()).unwrap(), b"theirs");
}

#[test]
fn directories_inherit_their_group() {
    let founder = Member::new("founder");
    let safe = founder.create(&mem_url()).unwrap();
    safe.update_group("g", GroupAction::Grant, &[(founder.identity.id().clone(), 3)]).unwrap();
    let fs = FsView::new(safe);

    fs.put_data("team/plan.txt", b"plan", &in_group("g")).unwrap();
    let nested = fs.put_data("team/2024/q1/notes.txt", b"notes", &PutOptions::default()).unwrap();
    assert_eq!(nested.group.as_str(), "g");
    let sibling = fs.put_data("team/todo.txt", b"todo", &PutOptions::default()).unwrap();
    assert_eq!(sibling.group.as_str(), "g");

    let elsewhere = fs.put_data("misc/x.txt", b"x", &PutOptions::default()).unwrap();
    assert_eq!(elsewhere.group.as_str(), "users");
}

#[test]
fn ranges_come_from_the_filesystem_view() {
    let founder = Member::new("founder");
    let fs = FsView::new(founder.create(&mem_url()).unwrap());
    fs.put_data("greeting.txt", b"hello world", &PutOptions { zip: true, ..Default::default() })
        .unwrap();

    let range = |from, to| GetOptions {
        file_range: Some(FileRange { from, to }),
        ..Default::default()
    };
    assert_eq!(fs.get_data("greeting.txt", &range(6, 0)).unwrap(), b"world");
    assert_eq!(fs.get_data("greeting.txt", &range(0, 5)).unwrap(), b"hello");
    assert!(matches!(
        fs.get_data("greeting.txt", &range(20, 0)),
        Err(EngineError::MalformedInput(_))
    ));
}

#[test]
fn cache_serves_until_expiry_unless_bypassed() {
    let founder = Member::new("founder");
    let safe = founder.create(&mem_url()).unwrap();
    let fs = FsView::new(safe.clone());
    let cache_file = |body_id: u64| {
        founder
            .catalog
            .cache_dir()
            .join(safe.local_key())
            .join(BodyId(body_id).to_key())
    };
    let drop_body = |body_id: u64| {
        safe.replica()
            .delete(&format!("fs/bodies/{}", BodyId(body_id).to_key()))
            .unwrap();
    };

    let kept = fs.put_data("kept.txt", b"cached", &PutOptions::default()).unwrap();
    assert_eq!(fs.get_data("kept.txt", &GetOptions::default()).unwrap(), b"cached");
    assert!(cache_file(kept.body_id).exists());
    drop_body(kept.body_id);
    assert_eq!(fs.get_data("kept.txt", &GetOptions::default()).unwrap(), b"cached");
    let bypass = GetOptions {
        no_cache: true,
        ..Default::default()
    };
    assert!(matches!(fs.get_data("kept.txt", &bypass), Err(EngineError::NotFound(_))));

    let uncached = fs.put_data("uncached.txt", b"fresh", &PutOptions::default()).unwrap();
    let zero = GetOptions {
        cache_expire: Some(0),
        ..Default::default()
    };
    assert_eq!(fs.get_data("uncached.txt", &zero).unwrap(), b"fresh");
    assert!(!cache_file(uncached.body_id).exists());

    let brief = fs.put_data("brief.txt", b"short lived", &PutOptions::default()).unwrap();
    let one_second = GetOptions {
        cache_expire: Some(1),
        ..Default::default()
    };
    assert_eq!(fs.get_data("brief.txt", &one_second).unwrap(), b"short lived");
    assert!(cache_file(brief.body_id).exists());
    std::thread::sleep(Duration::from_millis(1200));
    drop_body(brief.body_id);
    assert!(matches!(
        fs.get_data("brief.txt", &GetOptions::default()),
        Err(EngineError::NotFound(_))
    ));
    assert!(!cache_file(brief.body_id).exists());
}

fn wait_for(fs: &FsView, id: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !fs.has_put_completed(id).unwrap() {
        assert!(Instant::now() < deadline, "queued put {id} never completed");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn queued_puts_complete_in_the_background() {
    let founder = Member::new("founder");
    let fs = FsView::new(founder.create(&mem_url()).unwrap());
    let queued = PutOptions {
        async_put: true,
        tags: vec!["bulk".into()],
        ..Default::default()
    };

    let preview = fs.put_data("later.txt", b"eventually", &queued).unwrap();
    assert_eq!(preview.size, 10);
    wait_for(&fs, preview.id);
    let stored = fs.stat("later.txt").unwrap();
    assert_eq!(stored.id, preview.id);
    assert_eq!(stored.tags, vec!["bulk".to_string()]);
    assert_eq!(fs.get_data("later.txt", &GetOptions::default()).unwrap(), b"eventually");

    let source = founder.dir.path().join("upload.csv");
    std::fs::write(&source, b"a,b\n").unwrap();
    let moved = PutOptions {
        async_put: true,
        delete_src: true,
        ..Default::default()
    };
    let preview = fs.put_file("data/upload.csv", &source, &moved).unwrap();
    wait_for(&fs, preview.id);
    assert!(!source.exists());
    assert_eq!(fs.get_data("data/upload.csv", &GetOptions::default()).unwrap(), b"a,b\n");

    assert!(matches!(
        fs.put_data("denied.txt", b"x", &PutOptions { group: Some("nope".into()), ..queued.clone() }),
        Err(EngineError::AccessDenied(_))
    ));
    fs.close();
}

#[test]
fn put_file_can_remove_its_source() {
    let founder = Member::new("founder");
    let fs = FsView::new(founder.create(&mem_url()).unwrap());
    let source = founder.dir.path().join("draft.md");
    std::fs::write(&source, b"# draft").unwrap();

    let kept = fs.put_file("kept.md", &source, &PutOptions::default()).unwrap();
    assert!(source.exists());
    assert_eq!(kept.source, source.to_string_lossy());

    let moved = PutOptions {
        delete_src: true,
        ..Default::default()
    };
    fs.put_file("moved.md", &source, &moved).unwrap();
    assert!(!source.exists());
    assert_eq!(fs.get_data("moved.md", &GetOptions::default()).unwrap(), b"# draft");
}

#[test]
fn sync_times_out() {
    let founder = Member::new("founder");
    let impatient = Arc::new(EngineConfig {
        sync_timeout: Duration::ZERO,
        ..Default::default()
    });
    let safe = founder.create_with(&mem_url(), &SafeSettings::default(), impatient).unwrap();
    let ddls = BTreeMap::from([(1, "CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT)".to_string())]);
    let db = DbView::open(safe, "users", &ddls).unwrap();

    db.exec("INSERT INTO kv (k, v) VALUES ('a', 'b')", &Params::new()).unwrap();
    assert!(matches!(db.sync(), Err(EngineError::Timeout(_))));
}

#[test]
fn counters_add_up_across_members() {
    let founder = Member::new("founder");
    let bob = Member::new("bob");
    let url = mem_url();
    let safe = founder.create(&url).unwrap();
    safe.update_group("users", GroupAction::Grant, &[(bob.identity.id().clone(), 2)]).unwrap();

    let founder_db = DbView::open(safe, "users", &BTreeMap::new()).unwrap();
    let bob_db = DbView::open(bob.open(&url).unwrap(), "users", &BTreeMap::new()).unwrap();
    assert_eq!(founder_db.get_counter("visits", "home").unwrap(), 0);

    founder_db.inc_counter("visits", "home", 2).unwrap();
    founder_db.inc_counter("visits", "home", 2).unwrap();
    founder_db.inc_counter("visits", "about", 1).unwrap();
    assert_eq!(founder_db.get_counter("visits", "home").unwrap(), 4);

    // both members increment before either syncs
    bob_db.inc_counter("visits", "home", 1).unwrap();
    founder_db.sync().unwrap();
    bob_db.sync().unwrap();
    founder_db.sync().unwrap();
    assert_eq!(bob_db.get_counter("visits", "home").unwrap(), 5);
    assert_eq!(founder_db.get_counter("visits", "home").unwrap(), 5);
    assert_eq!(bob_db.get_counter("Visits", "about").unwrap(), 1);

    assert!(matches!(
        founder_db.inc_counter("bad name", "k", 1),
        Err(EngineError::MalformedInput(_))
    ));
}

#[test]
fn sender_filter_covers_direct_and_broadcast() {
    let founder = Member::new("founder");
    let bob = Member::new("bob");
    let carol = Member::new("carol");
    let url = mem_url();
    let safe = founder.create(&url).unwrap();
    safe.update_group("users", GroupAction::Grant, &[(bob.identity.id().clone(), 2)]).unwrap();

    let founder_comm = CommView::new(safe);
    let bob_comm = CommView::new(bob.open(&url).unwrap());

    let broadcast = founder_comm.broadcast("users", &Payload::text("all")).unwrap();
    let direct = founder_comm.send(bob.identity.id(), &Payload::text("just you")).unwrap();

    let from_founder = bob_comm.receive(founder.identity.id().as_str()).unwrap();
    let ids: Vec<_> = from_founder.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![broadcast, direct]);
    assert!(bob_comm.receive("").unwrap().is_empty());

    // someone else's message holds back the founder's later ones
    let mine = bob_comm.broadcast("users", &Payload::text("me first")).unwrap();
    let theirs = founder_comm.broadcast("users", &Payload::text("then me")).unwrap();
    assert!(bob_comm.receive(founder.identity.id().as_str()).unwrap().is_empty());
    let ids: Vec<_> = bob_comm.receive("").unwrap().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![mine, theirs]);

    // the caller's own id rewinds every direct stream
    bob_comm.rewind(bob.identity.id().as_str(), direct).unwrap();
    let again = bob_comm.receive("").unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, direct);

    assert!(matches!(
        bob_comm.rewind(carol.identity.id().as_str(), direct),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(bob_comm.rewind("elsewhere", direct), Err(EngineError::NotFound(_))));
}
