use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use tidesql::prelude::*;
use tidesql::{
    CoreConfig, HandleConfig, MigrationEvent, MigrationState, PoolConfig, QueueConfig, RetryPolicy,
};

fn core() -> Arc<Core> {
    Core::new(CoreConfig::default().migration(QueueConfig::new(
        Duration::from_millis(1),
        Duration::from_millis(20),
    )))
}

/// Handles give up on a locked file after 50ms, so contention reaches the
/// engine's own retry loop.
fn impatient_core() -> Arc<Core> {
    Core::new(CoreConfig::default().pool(PoolConfig::new(4).busy_timeout(50)))
}

/// A database holding `rows` rows in `old_t`, migrating into `t`.
fn seeded(rows: i64, batch: usize) -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::with_core(&core(), &dir.path().join("app.db").to_string_lossy());
    db.execute("CREATE TABLE old_t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
    if rows > 0 {
        db.execute_with(
            "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < ?1) \
             INSERT INTO old_t SELECT i, 'v' || i FROM n",
            &[Value::from(rows)],
        )
        .unwrap();
    }
    db.set_migration_settings(MigrationSettings::default().batch_size(batch))
        .unwrap();
    db.add_migration(MigrationBaseInfo::new("t", "old_t")).unwrap();
    (dir, db)
}

fn count(db: &Database, sql: &str) -> i64 {
    db.query_value(sql, &[])
        .unwrap()
        .and_then(|v| v.as_i64())
        .unwrap()
}

/// Count through the physical table, bypassing statement rewriting.
fn physical(db: &Database, table: &str) -> i64 {
    db.with_handle(Intent::Read, |handle| {
        handle.query_direct(&format!("SELECT count(*) FROM main.{table}"), &[])
    })
    .unwrap()
    .first()
    .and_then(|row| row.get(0))
    .and_then(Value::as_i64)
    .unwrap()
}

/// A second connection holding the write lock until the returned thread
/// finishes.
fn hold_write_lock(db: &Database, hold: Duration) -> thread::JoinHandle<()> {
    let blocker = Handle::open_with(HandleConfig::file(db.path())).unwrap();
    blocker.execute_raw("BEGIN IMMEDIATE").unwrap();
    thread::spawn(move || {
        thread::sleep(hold);
        blocker.execute_raw("COMMIT").unwrap();
    })
}

fn ids(db: &Database) -> Vec<i64> {
    db.query("SELECT id FROM t ORDER BY id", &[])
        .unwrap()
        .iter()
        .map(|row| row.get(0).and_then(Value::as_i64).unwrap())
        .collect()
}

#[test]
fn thousand_rows_move_in_ten_batches() {
    let (_dir, db) = seeded(1000, 100);
    let mut steps = 0;
    loop {
        let report = db.step_migration().unwrap().expect("work remains");
        steps += 1;
        assert_eq!(report.rows, 100);
        if steps == 5 {
            assert_eq!(count(&db, "SELECT count(*) FROM t"), 1000);
            assert_eq!(count(&db, "SELECT count(DISTINCT id) FROM t"), 1000);
            assert_eq!(db.migration_progress()[0].rows_migrated, 500);
        }
        if report.done {
            break;
        }
    }
    assert_eq!(steps, 10);
    assert!(db.is_migrated());
    assert!(db.step_migration().unwrap().is_none());
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 1000);
    assert_eq!(physical(&db, "old_t"), 0);
    let progress = db.migration_progress();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].state, MigrationState::Done);
    assert_eq!(progress[0].rows_migrated, 1000);
}

#[test]
fn writes_during_migration_land_exactly_once() {
    let (_dir, db) = seeded(10, 4);
    db.step_migration().unwrap();

    // Row 2 already moved, row 9 has not.
    assert_eq!(db.execute_with("UPDATE t SET v = 'x' WHERE id IN (2, 9)", &[]).unwrap(), 2);
    assert_eq!(db.execute_with("DELETE FROM t WHERE id = 3 OR id = 10", &[]).unwrap(), 2);
    db.execute_with("INSERT INTO t (id, v) VALUES (?1, ?2)", &[Value::from(11), Value::from("new")])
        .unwrap();
    let duplicate = db
        .execute_with("INSERT INTO t (id, v) VALUES (?1, 'dup')", &[Value::from(9)])
        .unwrap_err();
    assert!(duplicate.is_constraint(), "{duplicate}");

    while !db.step_migration().unwrap().is_none_or(|r| r.done) {}
    assert!(db.is_migrated());
    assert_eq!(ids(&db), vec![1, 2, 4, 5, 6, 7, 8, 9, 11]);
    let updated = db
        .query("SELECT id FROM t WHERE v = 'x' ORDER BY id", &[])
        .unwrap()
        .len();
    assert_eq!(updated, 2);
}

#[test]
fn concurrent_writer_and_migrator_agree() {
    let (_dir, db) = seeded(600, 25);

    let writer = {
        let db = db.clone();
        thread::spawn(move || {
            for id in 601..=700_i64 {
                db.execute_with("INSERT INTO t (id, v) VALUES (?1, 'w')", &[Value::from(id)])
                    .unwrap();
                db.execute_with("UPDATE t SET v = 'touched' WHERE id = ?1", &[Value::from(id - 600)])
                    .unwrap();
            }
        })
    };
    let migrator = {
        let db = db.clone();
        thread::spawn(move || {
            let mut batches = 0;
            while let Some(report) = db.step_migration().unwrap() {
                batches += 1;
                if report.done {
                    break;
                }
            }
            batches
        })
    };
    writer.join().unwrap();
    let batches = migrator.join().unwrap();

    assert!(batches >= 20, "only {batches} batches");
    assert!(db.is_migrated());
    assert_eq!(ids(&db), (1..=700).collect::<Vec<_>>());
    assert_eq!(count(&db, "SELECT count(*) FROM t WHERE v = 'touched'"), 100);
    assert_eq!(physical(&db, "old_t"), 0);
}

#[test]
fn background_queue_finishes_migration() {
    let (_dir, db) = seeded(300, 50);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    db.core().notifier().migration().set(
        "test",
        Some(Arc::new(move |event: &MigrationEvent| {
            sink.lock().unwrap().push(event.clone());
        })),
    );

    db.enable_auto_migration(true);
    let deadline = Instant::now() + Duration::from_secs(20);
    while events.lock().unwrap().len() < 6 {
        assert!(Instant::now() < deadline, "migration did not finish");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(db.is_migrated());
    assert_eq!(ids(&db).len(), 300);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 6);
    assert!(events.last().unwrap().done);
    assert!(events.iter().all(|e| e.table == "t"));
}

#[test]
fn paused_migration_resumes_on_request() {
    let (_dir, db) = seeded(10, 5);
    db.execute("CREATE TRIGGER no_copy BEFORE INSERT ON t BEGIN SELECT RAISE(ABORT, 'blocked'); END")
        .unwrap();
    assert!(db.step_migration().is_err());
    assert!(matches!(
        db.migration_progress()[0].state,
        MigrationState::Paused { .. }
    ));
    assert!(db.step_migration().unwrap().is_none());
    assert_eq!(ids(&db).len(), 10);

    db.execute("DROP TRIGGER no_copy").unwrap();
    assert!(db.resume_migration("t"));
    assert!(!db.resume_migration("t"));
    while !db.step_migration().unwrap().is_none_or(|r| r.done) {}
    assert!(db.is_migrated());
}

#[test]
fn migration_from_another_file_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let legacy_path = dir.path().join("legacy.db");
    let core = core();
    let legacy = Database::with_core(&core, &legacy_path.to_string_lossy());
    legacy.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)").unwrap();
    legacy
        .execute("INSERT INTO notes (body) VALUES ('a'), ('b'), ('c'), ('d')")
        .unwrap();

    let db = Database::with_core(&core, &dir.path().join("app.db").to_string_lossy());
    db.set_migration_settings(MigrationSettings::default().batch_size(2))
        .unwrap();
    db.add_migration(MigrationBaseInfo::new("notes", "notes").from_database(&legacy_path))
        .unwrap();
    db.step_migration().unwrap();

    // Fresh handles attach the legacy file again on first use.
    db.purge();
    assert_eq!(count(&db, "SELECT count(*) FROM notes"), 4);
    assert_eq!(count(&legacy, "SELECT count(*) FROM notes"), 2);

    while !db.step_migration().unwrap().is_none_or(|r| r.done) {}
    assert!(db.is_migrated());
    assert_eq!(count(&db, "SELECT count(*) FROM notes"), 4);
    assert_eq!(count(&legacy, "SELECT count(*) FROM notes"), 0);
}

#[test]
fn old_name_means_the_target_once_done() {
    let (_dir, db) = seeded(1000, 100);
    for _ in 0..4 {
        db.step_migration().unwrap();
    }
    assert_eq!(count(&db, "SELECT count(*) FROM old_t"), 1000);
    while !db.step_migration().unwrap().is_none_or(|r| r.done) {}
    assert!(db.is_migrated());

    assert_eq!(count(&db, "SELECT count(*) FROM old_t"), 1000);
    db.execute_with("INSERT INTO old_t (id, v) VALUES (?1, 'late')", &[Value::from(6000)])
        .unwrap();
    assert_eq!(count(&db, "SELECT count(*) FROM t WHERE id = 6000"), 1);
    assert_eq!(db.execute_with("UPDATE old_t SET v = 'renamed' WHERE id = 1", &[]).unwrap(), 1);
    assert_eq!(db.execute_with("DELETE FROM main.old_t WHERE id = 2", &[]).unwrap(), 1);
    let first = db.query_value("SELECT v FROM t WHERE id = 1", &[]).unwrap();
    assert_eq!(first, Some(Value::from("renamed")));
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 1000);
    assert_eq!(physical(&db, "old_t"), 0);
}

#[test]
fn moving_a_key_onto_another_row_fails() {
    let (_dir, db) = seeded(10, 4);
    db.step_migration().unwrap();

    // Row 2 has moved, row 9 has not: either direction would leave the same
    // key on both sides.
    let forward = db
        .execute_with("UPDATE t SET id = 9, v = 'moved' WHERE id = 2", &[])
        .unwrap_err();
    assert!(forward.is_constraint(), "{forward}");
    let backward = db.execute_with("UPDATE t SET id = 3 WHERE id = 9", &[]).unwrap_err();
    assert!(backward.is_constraint(), "{backward}");
    assert_eq!(ids(&db), (1..=10).collect::<Vec<_>>());
    assert_eq!(count(&db, "SELECT count(*) FROM t WHERE v = 'moved'"), 0);

    // Free keys are fine from either side.
    assert_eq!(db.execute_with("UPDATE t SET id = 50 WHERE id = 2", &[]).unwrap(), 1);
    assert_eq!(db.execute_with("UPDATE t SET id = 60 WHERE id = 9", &[]).unwrap(), 1);

    while !db.step_migration().unwrap().is_none_or(|r| r.done) {}
    assert_eq!(ids(&db), vec![1, 3, 4, 5, 6, 7, 8, 10, 50, 60]);
}

#[test]
fn handle_leased_before_registration_is_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::with_core(&core(), &dir.path().join("app.db").to_string_lossy());
    db.execute("CREATE TABLE old_t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
    db.execute("INSERT INTO old_t (v) VALUES ('a'), ('b'), ('c')").unwrap();

    let held = db.handle(Intent::Read).unwrap();
    db.add_migration(MigrationBaseInfo::new("t", "old_t")).unwrap();
    let seen = held.query_value("SELECT count(*) FROM t", &[]).unwrap();
    assert_eq!(seen, Some(Value::Integer(3)));
    drop(held);

    db.step_migration().unwrap();
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 3);
}

#[test]
fn busy_batches_retry_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::with_core(&impatient_core(), &dir.path().join("app.db").to_string_lossy());
    db.execute("CREATE TABLE old_t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
    db.execute("INSERT INTO old_t (v) VALUES ('a'), ('b'), ('c')").unwrap();
    let retry = RetryPolicy::default()
        .max_retries(10)
        .base_delay(Duration::from_millis(20));
    db.set_migration_settings(MigrationSettings::default().retry(retry))
        .unwrap();
    db.add_migration(MigrationBaseInfo::new("t", "old_t")).unwrap();

    let started = Instant::now();
    let blocker = hold_write_lock(&db, Duration::from_millis(300));
    let report = db.step_migration().unwrap().unwrap();
    blocker.join().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(report.rows, 3);
    assert!(report.done);
}

#[test]
fn busy_batch_stays_runnable() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::with_core(&impatient_core(), &dir.path().join("app.db").to_string_lossy());
    db.execute("CREATE TABLE old_t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
    db.execute("INSERT INTO old_t (v) VALUES ('a'), ('b')").unwrap();
    db.set_migration_settings(MigrationSettings::default().retry(RetryPolicy::none()))
        .unwrap();
    db.add_migration(MigrationBaseInfo::new("t", "old_t")).unwrap();

    let blocker = hold_write_lock(&db, Duration::from_millis(500));
    let err = db.step_migration().unwrap_err();
    assert!(err.is_retryable(), "{err}");
    assert_eq!(db.migration_progress()[0].state, MigrationState::Migrating);
    blocker.join().unwrap();

    let report = db.step_migration().unwrap().unwrap();
    assert_eq!(report.rows, 2);
    assert!(db.is_migrated());
}

#[test]
fn filtered_migration_through_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::with_core(&core(), &dir.path().join("app.db").to_string_lossy());
    db.execute("CREATE TABLE old_t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
    db.execute(
        "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 12) \
         INSERT INTO old_t SELECT i, CASE i % 2 WHEN 1 THEN 'keep' ELSE 'drop' END || i FROM n",
    )
    .unwrap();
    db.set_migration_settings(MigrationSettings::default().batch_size(2))
        .unwrap();
    db.add_migration(MigrationBaseInfo::new("t", "old_t").filter("v LIKE 'keep%'"))
        .unwrap();
    assert_eq!(db.step_migration().unwrap().unwrap().rows, 2);

    assert_eq!(count(&db, "SELECT count(*) FROM t"), 6);
    // Row 1 has moved, row 5 has not.
    assert_eq!(db.execute_with("UPDATE t SET v = v || '!' WHERE id IN (1, 5)", &[]).unwrap(), 2);
    // Row 2 is not part of the migration.
    assert_eq!(db.execute_with("UPDATE t SET v = 'x' WHERE id = 2", &[]).unwrap(), 0);
    assert_eq!(db.execute_with("DELETE FROM t WHERE id IN (3, 7)", &[]).unwrap(), 2);

    while !db.step_migration().unwrap().is_none_or(|r| r.done) {}
    assert_eq!(ids(&db), vec![1, 5, 9, 11]);
    assert_eq!(count(&db, "SELECT count(*) FROM t WHERE v LIKE '%!'"), 2);
    assert_eq!(physical(&db, "old_t"), 6);
    let untouched = db.with_handle(Intent::Read, |handle| {
        handle.query_direct("SELECT v FROM main.old_t WHERE id = 2", &[])
    });
    assert_eq!(untouched.unwrap()[0].get(0), Some(&Value::from("drop2")));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn every_partial_state_shows_each_row_once(
        rows in 1_i64..120,
        batch in 1_usize..40,
        steps in 0_usize..12,
        extra in proptest::collection::btree_set(121_i64..200, 0..5),
    ) {
        let (_dir, db) = seeded(rows, batch);
        for _ in 0..steps {
            if db.step_migration().unwrap().is_none_or(|r| r.done) {
                break;
            }
        }
        for id in &extra {
            db.execute_with("INSERT INTO t (id, v) VALUES (?1, 'extra')", &[Value::from(*id)]).unwrap();
        }
        let mut expected: Vec<i64> = (1..=rows).collect();
        expected.extend(extra.iter().copied());
        prop_assert_eq!(ids(&db), expected.clone());

        while !db.step_migration().unwrap().is_none_or(|r| r.done) {}
        prop_assert_eq!(ids(&db), expected);
        prop_assert_eq!(physical(&db, "old_t"), 0);
    }
}
