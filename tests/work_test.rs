//! Integration tests for the work database.

use serde_json::{Value, json};
use workdb::{Error, RecordId, Selection, Status, WorkDatabase};

fn test_db() -> WorkDatabase {
    WorkDatabase::in_memory().expect("failed to create in-memory store")
}

fn add_all(db: &mut WorkDatabase, inputs: &[Value]) -> Vec<RecordId> {
    db.with_transaction(|db| inputs.iter().map(|i| db.add(i.clone())).collect())
        .unwrap()
}

// ---------------------------------------------------------------------------
// Basic lifecycle: add → incomplete → update → export
// ---------------------------------------------------------------------------

#[test]
fn add_creates_pending_record() {
    let mut db = test_db();
    let ids = add_all(&mut db, &[json!({"key": "value"})]);

    let record = db.get(ids[0]).unwrap();
    assert_eq!(record.status(), Status::Pending);
    assert_eq!(Value::Object(record.input), json!({"key": "value"}));
    assert!(record.output.is_none());
    assert!(record.completed_at.is_none());
}

#[test]
fn squares_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = WorkDatabase::open(dir.path().join("work.db")).unwrap();

    db.begin().unwrap();
    for n in 0..5 {
        db.add(json!({"number": n})).unwrap();
    }
    db.commit().unwrap();

    let pending: Vec<_> = db.incomplete().unwrap().collect();
    let numbers: Vec<i64> = pending
        .iter()
        .map(|(_, input)| input["number"].as_i64().unwrap())
        .collect();
    assert_eq!(numbers, vec![0, 1, 2, 3, 4]);

    db.begin().unwrap();
    for (id, input) in pending {
        let n = input["number"].as_i64().unwrap();
        db.update(id, json!({"square": n * n})).unwrap();
    }
    db.commit().unwrap();

    assert_eq!(db.incomplete().unwrap().count(), 0);
    assert_eq!(db.completed_len().unwrap(), 5);

    let out = dir.path().join("out.jsonl");
    assert_eq!(db.write_jsonl(&out).unwrap(), 5);
    let contents = std::fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(
        lines,
        vec![
            r#"{"number":0,"square":0}"#,
            r#"{"number":1,"square":1}"#,
            r#"{"number":2,"square":4}"#,
            r#"{"number":3,"square":9}"#,
            r#"{"number":4,"square":16}"#,
        ]
    );
}

#[test]
fn update_while_iterating_incomplete() {
    let mut db = test_db();
    add_all(&mut db, &[json!({"n": 1}), json!({"n": 2})]);

    db.begin().unwrap();
    for (id, input) in db.incomplete().unwrap() {
        db.update(id, json!({"double": input["n"].as_i64().unwrap() * 2}))
            .unwrap();
    }
    db.commit().unwrap();

    assert_eq!(db.completed_len().unwrap(), 2);
}

#[test]
fn incomplete_skips_completed_records() {
    let mut db = test_db();
    let ids = add_all(&mut db, &[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    db.with_transaction(|db| db.update(ids[1], json!({"done": true})))
        .unwrap();

    let pending: Vec<RecordId> = db.incomplete().unwrap().map(|(id, _)| id).collect();
    assert_eq!(pending, vec![ids[0], ids[2]]);
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[test]
fn mutations_require_a_transaction() {
    let mut db = test_db();
    assert!(matches!(db.add(json!({"x": 1})), Err(Error::State(_))));
    assert!(matches!(
        db.update(RecordId(1), json!({"y": 1})),
        Err(Error::State(_))
    ));
    assert!(matches!(db.remove_duplicates(), Err(Error::State(_))));
}

#[test]
fn nested_begin_is_rejected() {
    let mut db = test_db();
    db.begin().unwrap();
    assert!(matches!(db.begin(), Err(Error::State(_))));
    assert!(db.in_transaction());
}

#[test]
fn store_is_reusable_after_a_failed_operation() {
    let mut db = test_db();
    db.begin().unwrap();
    assert!(db.update(RecordId(42), json!({"y": 1})).is_err());
    db.rollback().unwrap();

    add_all(&mut db, &[json!({"x": 1})]);
    assert_eq!(db.len().unwrap(), 1);
}

#[test]
fn with_transaction_rolls_back_on_error() {
    let mut db = test_db();
    let result: workdb::Result<()> = db.with_transaction(|db| {
        db.add(json!({"x": 1}))?;
        db.update(RecordId(999), json!({"y": 1}))
    });

    assert!(matches!(result, Err(Error::NotFound(RecordId(999)))));
    assert!(!db.in_transaction());
    assert_eq!(db.len().unwrap(), 0);
}

#[test]
fn adds_are_invisible_to_other_handles_until_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("work.db");
    let mut writer = WorkDatabase::open(&path).unwrap();
    let reader = WorkDatabase::open(&path).unwrap();

    writer.begin().unwrap();
    for n in 0..5 {
        writer.add(json!({"number": n})).unwrap();
    }
    // Read-your-writes inside the transaction.
    assert_eq!(writer.incomplete().unwrap().count(), 5);
    assert_eq!(reader.incomplete().unwrap().count(), 0);

    writer.commit().unwrap();
    assert_eq!(reader.incomplete().unwrap().count(), 5);
}

#[test]
fn incomplete_stays_consistent_while_another_handle_commits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("work.db");
    let mut writer = WorkDatabase::open(&path).unwrap();
    let reader = WorkDatabase::open(&path).unwrap();

    let handle = std::thread::spawn(move || {
        for n in 0..500 {
            writer
                .with_transaction(|db| db.add(json!({"n": n})))
                .unwrap();
        }
    });

    while !handle.is_finished() {
        let pending = reader.incomplete().unwrap().count();
        let counts = reader.counts().unwrap();
        assert!(pending <= 500);
        assert_eq!(counts.completed, 0);
        assert!(counts.total <= 500);
    }
    handle.join().unwrap();

    assert_eq!(reader.incomplete().unwrap().count(), 500);
    assert_eq!(reader.counts().unwrap().pending(), 500);
}

#[test]
fn concurrent_begin_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("work.db");
    let mut first = WorkDatabase::open(&path).unwrap();
    let mut second = WorkDatabase::open(&path).unwrap();

    first.begin().unwrap();
    assert!(matches!(second.begin(), Err(Error::State(_))));
    first.rollback().unwrap();
    assert!(second.begin().is_ok());
}

#[test]
fn closing_without_commit_discards_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("work.db");

    let mut db = WorkDatabase::open(&path).unwrap();
    add_all(&mut db, &[json!({"kept": true})]);
    db.begin().unwrap();
    db.add(json!({"kept": false})).unwrap();
    db.close().unwrap();

    let db = WorkDatabase::open(&path).unwrap();
    let inputs: Vec<Value> = db
        .records(Selection::All)
        .unwrap()
        .map(|r| Value::Object(r.input))
        .collect();
    assert_eq!(inputs, vec![json!({"kept": true})]);
}

#[test]
fn dropping_without_commit_discards_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("work.db");

    {
        let mut db = WorkDatabase::open(&path).unwrap();
        db.begin().unwrap();
        db.add(json!({"x": 1})).unwrap();
    }

    assert!(WorkDatabase::open(&path).unwrap().is_empty().unwrap());
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

#[test]
fn second_update_conflicts_and_keeps_first_output() {
    let mut db = test_db();
    let ids = add_all(&mut db, &[json!({"x": 1})]);

    db.begin().unwrap();
    db.update(ids[0], json!({"y": "first"})).unwrap();
    let err = db.update(ids[0], json!({"y": "second"})).unwrap_err();
    assert!(matches!(err, Error::Conflict(id) if id == ids[0]));
    db.commit().unwrap();

    let record = db.get(ids[0]).unwrap();
    assert_eq!(record.output.map(Value::Object), Some(json!({"y": "first"})));
    assert!(record.completed_at.is_some());
}

#[test]
fn update_unknown_id_is_not_found() {
    let mut db = test_db();
    db.begin().unwrap();
    assert!(matches!(
        db.update(RecordId(7), json!({"y": 1})),
        Err(Error::NotFound(RecordId(7)))
    ));
}

#[test]
fn update_outside_transaction_reports_state_before_payload() {
    let mut db = test_db();
    let ids = add_all(&mut db, &[json!({"x": 1})]);
    assert!(matches!(db.update(ids[0], json!("done")), Err(Error::State(_))));
}

#[test]
fn non_object_payloads_are_rejected() {
    let mut db = test_db();
    db.begin().unwrap();
    assert!(matches!(db.add(json!(5)), Err(Error::InvalidPayload(_))));
    let id = db.add(json!({"x": 1})).unwrap();
    assert!(matches!(
        db.update(id, json!("done")),
        Err(Error::InvalidPayload(_))
    ));
}

// ---------------------------------------------------------------------------
// Dedup
// ---------------------------------------------------------------------------

#[test]
fn remove_duplicates_keeps_first_inserted() {
    let mut db = test_db();
    let first = add_all(&mut db, &[json!({"x": 1})]);
    let second = add_all(&mut db, &[json!({"x": 1})]);

    let removed = db.with_transaction(|db| db.remove_duplicates()).unwrap();
    assert_eq!(removed, 1);

    let ids: Vec<RecordId> = db.records(Selection::All).unwrap().map(|r| r.id).collect();
    assert_eq!(ids, first);
    assert!(matches!(db.get(second[0]), Err(Error::NotFound(_))));
}

#[test]
fn dedup_ignores_key_order_and_keeps_distinct_inputs() {
    let mut db = test_db();
    let ids = add_all(
        &mut db,
        &[
            json!({"a": 1, "b": 2}),
            json!({"a": 2}),
            json!({"b": 2, "a": 1}),
            json!({"a": 2}),
            json!({"a": 3}),
        ],
    );

    let removed = db.with_transaction(|db| db.remove_duplicates()).unwrap();
    assert_eq!(removed, 2);

    let survivors: Vec<RecordId> = db.records(Selection::All).unwrap().map(|r| r.id).collect();
    assert_eq!(survivors, vec![ids[0], ids[1], ids[4]]);
}

#[test]
fn dedup_drops_later_completed_duplicate() {
    let mut db = test_db();
    let ids = add_all(&mut db, &[json!({"x": 1}), json!({"x": 1})]);
    db.with_transaction(|db| db.update(ids[1], json!({"y": 2})))
        .unwrap();

    let removed = db.with_transaction(|db| db.remove_duplicates()).unwrap();
    assert_eq!(removed, 1);

    let survivor = db.get(ids[0]).unwrap();
    assert_eq!(survivor.status(), Status::Pending);
    assert_eq!(db.completed_len().unwrap(), 0);
}

#[test]
fn dedup_keeps_completed_first_record() {
    let mut db = test_db();
    let ids = add_all(&mut db, &[json!({"x": 1}), json!({"x": 1})]);
    db.with_transaction(|db| db.update(ids[0], json!({"y": 2})))
        .unwrap();

    db.with_transaction(|db| db.remove_duplicates()).unwrap();

    assert!(db.get(ids[0]).unwrap().is_complete());
    assert_eq!(db.len().unwrap(), 1);
}

#[test]
fn dedup_removal_is_undone_by_rollback() {
    let mut db = test_db();
    add_all(&mut db, &[json!({"x": 1}), json!({"x": 1})]);

    db.begin().unwrap();
    assert_eq!(db.remove_duplicates().unwrap(), 1);
    db.rollback().unwrap();

    assert_eq!(db.len().unwrap(), 2);
}

#[test]
fn ids_are_not_reused_after_dedup() {
    let mut db = test_db();
    let ids = add_all(&mut db, &[json!({"x": 1}), json!({"x": 1})]);
    db.with_transaction(|db| db.remove_duplicates()).unwrap();

    let next = add_all(&mut db, &[json!({"x": 2})]);
    assert!(next[0] > ids[1]);
}
