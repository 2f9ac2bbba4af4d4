//! Two runners against one SQLite file coordinate through the lock table.

use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use schemalog::changelog::xml::parse_xml;
use schemalog::changelog::{ChangeLogParameters, MemorySource};
use schemalog::database::{Database, Dialect, SqliteDatabase};
use schemalog::lock::{DEFAULT_LOCK_TABLE, LockError, LockIdentity, LockService};
use schemalog::{ChangeLog, Engine, EngineError, RunReport, RunSettings, load_changelog};

const CHANGELOG: &str = r#"<databaseChangeLog>
    <changeSet id="1" author="alice"><sql>CREATE TABLE a (id INTEGER)</sql></changeSet>
    <changeSet id="2" author="alice"><sql>CREATE TABLE b (id INTEGER)</sql></changeSet>
    <changeSet id="3" author="alice"><sql>INSERT INTO a VALUES (1)</sql></changeSet>
</databaseChangeLog>"#;

fn settings(timeout: Duration) -> RunSettings {
    RunSettings {
        lock_timeout: timeout,
        lock_poll_interval: Duration::from_millis(20),
        ..RunSettings::default()
    }
}

fn changelog(settings: &RunSettings) -> ChangeLog {
    let source =
        MemorySource::new().with_file("main.xml", parse_xml(CHANGELOG, "main.xml").expect("xml"));
    load_changelog(
        &source,
        "main.xml",
        settings,
        Dialect::Sqlite,
        &mut ChangeLogParameters::new(),
    )
    .expect("build")
}

fn run_update(path: &Path, barrier: &Barrier) -> RunReport {
    let settings = settings(Duration::from_secs(30));
    let changelog = changelog(&settings);
    let mut db = SqliteDatabase::open(path).expect("open");
    barrier.wait();
    Engine::new(&mut db, &settings)
        .update(&changelog)
        .expect("update")
}

#[test]
fn test_concurrent_updates_apply_each_changeset_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("shared.db");
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || run_update(&path, &barrier))
        })
        .collect();
    let reports: Vec<RunReport> = handles
        .into_iter()
        .map(|h| h.join().expect("runner thread"))
        .collect();

    let applied: usize = reports.iter().map(|r| r.summary().applied).sum();
    let already_ran: usize = reports.iter().map(|r| r.summary().already_ran).sum();
    assert_eq!(applied, 3);
    assert_eq!(already_ran, 3);

    let mut db = SqliteDatabase::open(&path).expect("open");
    let rows = db
        .query("SELECT COUNT(*) FROM DATABASECHANGELOG")
        .expect("query");
    assert_eq!(rows[0].integer(0), Some(3));
    let rows = db.query("SELECT COUNT(*) FROM a").expect("query");
    assert_eq!(rows[0].integer(0), Some(1));

    let locks = Engine::new(&mut db, &settings(Duration::from_secs(1)))
        .list_locks()
        .expect("locks");
    assert!(locks.iter().all(|l| !l.locked));
}

#[test]
fn test_waiter_outlasts_busy_timeout_while_holder_is_mid_changeset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("busy.db");

    let mut holder_db = SqliteDatabase::open(&path).expect("open");
    let holder = LockService::new(DEFAULT_LOCK_TABLE, LockIdentity::new("holder"));
    holder.ensure_schema(&mut holder_db).expect("schema");
    assert!(holder.try_acquire(&mut holder_db).expect("acquire"));
    holder_db.begin().expect("begin");
    holder_db
        .execute("CREATE TABLE slow (id INTEGER)")
        .expect("create");

    let started = Arc::new(Barrier::new(2));
    let waiter_path = path.clone();
    let waiter_started = Arc::clone(&started);
    let waiter = thread::spawn(move || {
        let mut db = SqliteDatabase::open(&waiter_path)
            .expect("open")
            .with_busy_timeout(Duration::from_millis(50))
            .expect("busy timeout");
        let service = LockService::new(DEFAULT_LOCK_TABLE, LockIdentity::new("waiter"));
        waiter_started.wait();
        let acquired =
            service.acquire(&mut db, Duration::from_secs(20), Duration::from_millis(20));
        let held = acquired.is_ok() && service.has_lock(&mut db).expect("has_lock");
        (acquired, held)
    });

    started.wait();
    // Several busy timeouts elapse while the changeset transaction is open.
    thread::sleep(Duration::from_millis(400));
    holder_db.commit().expect("commit");
    assert!(holder.release(&mut holder_db).expect("release"));

    let (acquired, held) = waiter.join().expect("waiter thread");
    assert!(acquired.is_ok(), "waiter gave up: {:?}", acquired);
    assert!(held);
}

#[test]
fn test_held_lock_times_out_then_release_unblocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("held.db");

    let mut holder_db = SqliteDatabase::open(&path).expect("open");
    let holder = LockService::new(DEFAULT_LOCK_TABLE, LockIdentity::new("other-host#1#deadbeef"));
    holder.ensure_schema(&mut holder_db).expect("schema");
    assert!(holder.try_acquire(&mut holder_db).expect("acquire"));

    let settings = settings(Duration::from_millis(150));
    let changelog = changelog(&settings);
    let mut db = SqliteDatabase::open(&path).expect("open");

    let err = Engine::new(&mut db, &settings)
        .update(&changelog)
        .unwrap_err();
    match err {
        EngineError::Lock(LockError::Timeout { held_by, .. }) => {
            assert_eq!(held_by.as_deref(), Some("other-host#1#deadbeef"));
        }
        other => panic!("expected lock timeout, got {}", other),
    }
    assert!(!db.table_exists(None, "a").expect("table_exists"));

    // The failed runner must not have released someone else's lock.
    assert!(holder.has_lock(&mut holder_db).expect("has_lock"));

    Engine::new(&mut db, &settings)
        .release_locks()
        .expect("release");
    let report = Engine::new(&mut db, &settings)
        .update(&changelog)
        .expect("update");
    assert_eq!(report.summary().applied, 3);
}
