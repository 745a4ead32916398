//! Crash and corruption recovery through the dual meta slots: torn meta
//! writes fall back to the previous snapshot, data pages written without a
//! meta handoff vanish on reopen.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use tempfile::tempdir;
use zatdb::schema::{Cardinality, Unique};
use zatdb::value::ValueTag;
use zatdb::{
    define_attribute, Database, EntityRef, Pager, PagerOptions, TxId, TxOp, Value, ZatError,
};

const PAGE: u64 = 4096;

fn scribble(path: &std::path::Path, offset: u64, len: usize) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&vec![0xBAu8; len]).unwrap();
    file.sync_all().unwrap();
}

fn seed_database(path: &std::path::Path) {
    let db = Database::open(path).unwrap();
    db.transact(&define_attribute(
        ":user/name",
        ValueTag::Str,
        Cardinality::One,
        Unique::None,
        false,
    ))
    .unwrap();
    assert_eq!(db.tx_id(), TxId(1));
}

#[test]
fn corrupting_newer_slot_recovers_previous_tx() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.zatdb");
    seed_database(&path);

    // Bootstrap committed into slot 0, tx 1 into slot 1. Tear slot 1.
    scribble(&path, PAGE + 16, 32);

    let db = Database::open(&path).unwrap();
    assert_eq!(db.tx_id(), TxId(0));
    assert!(db.schema().resolve_ident(":user/name").is_none());
    assert!(db.schema().resolve_ident(":db/ident").is_some());
}

#[test]
fn corrupting_both_slots_fails_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.zatdb");
    seed_database(&path);

    scribble(&path, 0, 92);
    scribble(&path, PAGE, 92);

    match Database::open(&path) {
        Err(ZatError::Corrupt(msg)) => assert_eq!(msg, "both meta slots invalid"),
        other => panic!("expected corruption error, got {other:?}"),
    }
}

#[test]
fn data_pages_without_meta_handoff_vanish_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.zatdb");
    seed_database(&path);

    // A transaction that died after writing its data pages but before the
    // meta write: pages appear past the committed next_page watermark and
    // nothing references them.
    let committed_next_page = {
        let pager = Pager::open(&path, PagerOptions::default()).unwrap();
        assert_eq!(pager.meta().tx_id, TxId(1));
        pager.meta().next_page.0
    };
    scribble(&path, committed_next_page * PAGE, (PAGE * 6) as usize);

    let db = Database::open(&path).unwrap();
    assert_eq!(db.tx_id(), TxId(1), "aborted tx is invisible");
    assert!(db.schema().resolve_ident(":user/name").is_some());

    // The next commit allocates from the committed watermark, overwriting
    // the orphaned region, and the database keeps working.
    let report = db
        .transact(&[TxOp::assert(
            EntityRef::Tempid("e"),
            ":user/name",
            Value::Str("post-crash"),
        )])
        .unwrap();
    assert_eq!(report.tx_id, TxId(2));
    drop(db);

    let pager = Pager::open(&path, PagerOptions::default()).unwrap();
    assert!(pager.meta().next_page.0 > committed_next_page);
    assert_eq!(pager.meta().tx_id, TxId(2));
}

#[test]
fn reopen_after_every_tx_is_consistent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("steps.zatdb");
    seed_database(&path);

    let mut expect_tx = 1u64;
    let mut entity = None;
    for round in 0..5u32 {
        let db = Database::open(&path).unwrap();
        assert_eq!(db.tx_id(), TxId(expect_tx));
        let name = format!("name-{round}");
        let report = match entity {
            None => {
                let r = db
                    .transact(&[TxOp::assert(
                        EntityRef::Tempid("e"),
                        ":user/name",
                        Value::Str(&name),
                    )])
                    .unwrap();
                entity = Some(r.tempids["e"]);
                r
            }
            Some(e) => db
                .transact(&[TxOp::assert(
                    EntityRef::Id(e),
                    ":user/name",
                    Value::Str(&name),
                )])
                .unwrap(),
        };
        expect_tx += 1;
        assert_eq!(report.tx_id, TxId(expect_tx));
    }

    let db = Database::open(&path).unwrap();
    let snap = db.snapshot().unwrap();
    let mut cursor = snap.entity_datoms(entity.unwrap()).unwrap();
    let entry = cursor.next().unwrap().expect("entity lost after reopens");
    let (_, _, v) = zatdb::index::decode_eav(entry.key).unwrap();
    assert_eq!(v, Value::Str("name-4"));
    assert!(cursor.next().unwrap().is_none());
}
