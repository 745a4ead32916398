//! Free-page recycling: reclaimed COW pages bound file growth, and live
//! reader snapshots gate reclamation without ever observing churn.

use std::cmp::Ordering;

use tempfile::tempdir;
use zatdb::schema::{Cardinality, Unique};
use zatdb::storage::free::{FreeDb, FreePageTracker};
use zatdb::types::{IndexId, PageId};
use zatdb::value::ValueTag;
use zatdb::{
    define_attribute, Database, EntityRef, Pager, PagerOptions, TxId, TxOp, Value,
};

fn bytes_cmp(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// One simulated transaction: reclaim what the previous commits freed, run
/// the tree operations, persist this round's freed pages.
fn commit_round(
    pager: &mut Pager,
    tree: &mut zatdb::Tree,
    freedb: &mut FreeDb,
    carry: &mut FreePageTracker,
    tx: u64,
    ops: impl FnOnce(&mut Pager, &mut zatdb::Tree, &mut FreePageTracker),
) {
    let mut tracker = carry.clone();
    freedb
        .reclaim(pager, TxId(tx.saturating_sub(1)), &mut tracker)
        .unwrap();
    ops(pager, tree, &mut tracker);
    let mut new_carry = FreePageTracker::new();
    freedb.record(pager, TxId(tx), &tracker, &mut new_carry).unwrap();
    *carry = new_carry;
}

#[test]
fn delete_and_reinsert_stays_under_watermark() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reuse.db");
    let mut pager = Pager::open(
        &path,
        PagerOptions {
            page_size: 512,
            create: true,
        },
    )
    .unwrap();
    let mut tree = zatdb::Tree::new(PageId(0), IndexId::Eav, bytes_cmp);
    let mut freedb = FreeDb::open(PageId(0));
    let mut carry = FreePageTracker::new();
    let mut tx = 0u64;

    let keys: Vec<Vec<u8>> = (0..200u32).map(|i| i.to_be_bytes().to_vec()).collect();

    // Build the tree across ten transactions.
    for chunk in keys.chunks(20) {
        tx += 1;
        commit_round(&mut pager, &mut tree, &mut freedb, &mut carry, tx, |p, t, tr| {
            for k in chunk {
                t.insert(p, tr, k, b"").unwrap();
            }
        });
    }

    // Delete every key across ten more transactions.
    for chunk in keys.chunks(20) {
        tx += 1;
        commit_round(&mut pager, &mut tree, &mut freedb, &mut carry, tx, |p, t, tr| {
            for k in chunk {
                assert!(t.delete(p, tr, k).unwrap());
            }
        });
    }
    assert_eq!(tree.verify(&pager).unwrap(), 0);

    let watermark = std::fs::metadata(&path).unwrap().len();

    // Re-insert the same keys; reclaimed pages must satisfy almost all of
    // the demand, leaving only FreeDB overhead on top of the watermark.
    for chunk in keys.chunks(20) {
        tx += 1;
        commit_round(&mut pager, &mut tree, &mut freedb, &mut carry, tx, |p, t, tr| {
            for k in chunk {
                t.insert(p, tr, k, b"").unwrap();
            }
        });
    }
    assert_eq!(tree.verify(&pager).unwrap(), 200);

    let after = std::fs::metadata(&path).unwrap().len();
    let slack = 80 * 512;
    assert!(
        after <= watermark + slack,
        "file grew from {watermark} to {after}"
    );
}

#[test]
fn update_churn_through_database_plateaus() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("churn.zatdb");
    let db = Database::open(&path).unwrap();
    db.transact(&define_attribute(
        ":user/name",
        ValueTag::Str,
        Cardinality::One,
        Unique::None,
        false,
    ))
    .unwrap();
    let report = db
        .transact(&[TxOp::assert(
            EntityRef::Tempid("e"),
            ":user/name",
            Value::Str("v0"),
        )])
        .unwrap();
    let e = report.tempids["e"];

    let update = |round: u32| {
        let value = format!("v{round}");
        db.transact(&[TxOp::assert(
            EntityRef::Id(e),
            ":user/name",
            Value::Str(&value),
        )])
        .unwrap();
    };

    for round in 1..=30u32 {
        update(round);
    }
    let size_a = std::fs::metadata(&path).unwrap().len();
    for round in 31..=90u32 {
        update(round);
    }
    let size_b = std::fs::metadata(&path).unwrap().len();

    // Each update COWs a handful of pages per index; without reclamation
    // sixty more transactions would add hundreds of pages.
    let slack = 120 * 4096;
    assert!(
        size_b <= size_a + slack,
        "churn grew file from {size_a} to {size_b}"
    );
}

#[test]
fn live_snapshot_never_observes_later_churn() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("gate.zatdb")).unwrap();
    db.transact(&define_attribute(
        ":user/name",
        ValueTag::Str,
        Cardinality::One,
        Unique::None,
        false,
    ))
    .unwrap();
    let report = db
        .transact(&[TxOp::assert(
            EntityRef::Tempid("e"),
            ":user/name",
            Value::Str("original"),
        )])
        .unwrap();
    let e = report.tempids["e"];

    let snap = db.snapshot().unwrap();
    let snap_tx = snap.tx_id();
    assert_eq!(db.active_readers(), 1);

    // Churn far past the snapshot. Its pages are gated by the reader slot
    // and must read back bit-identical afterwards.
    for round in 0..50u32 {
        let value = format!("later-{round}");
        db.transact(&[TxOp::assert(
            EntityRef::Id(e),
            ":user/name",
            Value::Str(&value),
        )])
        .unwrap();
    }
    assert!(db.tx_id() > snap_tx);

    let mut cursor = snap.entity_datoms(e).unwrap();
    let entry = cursor.next().unwrap().expect("snapshot lost its datom");
    let (_, _, v) = zatdb::index::decode_eav(entry.key).unwrap();
    assert_eq!(v, Value::Str("original"));
    assert!(cursor.next().unwrap().is_none());
    assert_eq!(snap.tx_id(), snap_tx);

    drop(snap);
    assert_eq!(db.active_readers(), 0);

    // With the reader gone the backlog becomes reclaimable again.
    db.transact(&[TxOp::assert(
        EntityRef::Id(e),
        ":user/name",
        Value::Str("final"),
    )])
    .unwrap();
}
