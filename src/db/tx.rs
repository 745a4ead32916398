//! The transaction pipeline: validate, resolve tempids, upsert, enforce
//! cardinality and uniqueness, then commit atomically through the meta-slot
//! protocol.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, trace};

use crate::db::readers::ReaderTable;
use crate::primitives::pager::{Meta, Pager};
use crate::storage::free::{FreeDb, FreePageTracker};
use crate::storage::index::{self, Datom, IndexManager, IndexRoots};
use crate::storage::schema::{
    Cardinality, SchemaCache, Unique, A_TX_INSTANT, LAST_BOOTSTRAP_ATTR,
};
use crate::storage::value::{self, Value, ValueTag};
use crate::storage::{btree::Tree, schema};
use crate::types::{
    EntityId, Partition, Result, TxId, ZatError, MAX_TX_DATOMS, MAX_TX_TEMPIDS,
};

/// Assertion or retraction.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Op {
    Assert,
    Retract,
}

/// How a transaction operation names its entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntityRef<'a> {
    /// An existing entity id.
    Id(EntityId),
    /// A placeholder resolved at commit; equal names within one
    /// transaction resolve to the same entity.
    Tempid(&'a str),
    /// The transaction entity itself.
    Tx,
}

/// One operation in a transaction.
#[derive(Clone, Debug)]
pub struct TxOp<'a> {
    pub op: Op,
    pub e: EntityRef<'a>,
    pub a: &'a str,
    pub v: Value<'a>,
}

impl<'a> TxOp<'a> {
    pub fn assert(e: EntityRef<'a>, a: &'a str, v: Value<'a>) -> Self {
        Self {
            op: Op::Assert,
            e,
            a,
            v,
        }
    }

    pub fn retract(e: EntityRef<'a>, a: &'a str, v: Value<'a>) -> Self {
        Self {
            op: Op::Retract,
            e,
            a,
            v,
        }
    }
}

/// What a committed transaction reports back.
#[derive(Clone, Debug)]
pub struct TxReport {
    pub tx_id: TxId,
    pub tempids: HashMap<String, EntityId>,
    /// Datoms written by this transaction, retraction records included.
    pub datom_count: usize,
}

pub(crate) struct TxOutcome {
    pub report: TxReport,
    pub touched_schema: bool,
}

/// Build the operations defining a new attribute under the tempid
/// `"db.attr"`.
pub fn define_attribute<'a>(
    ident: &'a str,
    value_type: ValueTag,
    cardinality: Cardinality,
    unique: Unique,
    indexed: bool,
) -> Vec<TxOp<'a>> {
    let e = EntityRef::Tempid("db.attr");
    let mut ops = vec![
        TxOp::assert(e, ":db/ident", Value::Keyword(ident)),
        TxOp::assert(
            e,
            ":db/valueType",
            Value::Keyword(schema::value_type_keyword(value_type)),
        ),
        TxOp::assert(
            e,
            ":db/cardinality",
            Value::Keyword(match cardinality {
                Cardinality::One => ":db.cardinality/one",
                Cardinality::Many => ":db.cardinality/many",
            }),
        ),
    ];
    match unique {
        Unique::None => {}
        Unique::Value => ops.push(TxOp::assert(
            e,
            ":db/unique",
            Value::Keyword(":db.unique/value"),
        )),
        Unique::Identity => ops.push(TxOp::assert(
            e,
            ":db/unique",
            Value::Keyword(":db.unique/identity"),
        )),
    }
    if indexed {
        ops.push(TxOp::assert(e, ":db/index", Value::Bool(true)));
    }
    ops
}

/// Schema facts the pipeline needs per resolved attribute.
#[derive(Copy, Clone, Debug)]
struct AttrFlags {
    id: EntityId,
    cardinality: Cardinality,
    unique: Unique,
    indexed: bool,
    is_ref: bool,
}

fn bump(written: &mut usize) -> Result<()> {
    if *written >= MAX_TX_DATOMS {
        return Err(ZatError::DatomOverflow);
    }
    *written += 1;
    Ok(())
}

/// Run one transaction to the committed state. On any error the pager's
/// in-memory meta, the carry tracker, and every tree root are left
/// untouched; the caller only has to roll back the allocation cursor.
pub(crate) fn run(
    pager: &mut Pager,
    carry: &mut FreePageTracker,
    readers: &ReaderTable,
    schema: &SchemaCache,
    ops: &[TxOp<'_>],
) -> Result<TxOutcome> {
    // 1. Validate attributes and types against the cache.
    let mut resolved: Vec<(&TxOp<'_>, AttrFlags)> = Vec::with_capacity(ops.len());
    for op in ops {
        let id = schema
            .resolve_ident(op.a)
            .ok_or_else(|| ZatError::UnknownAttribute(op.a.to_string()))?;
        let attr = schema
            .get_attr(id)
            .ok_or_else(|| ZatError::UnknownAttribute(op.a.to_string()))?;
        if !schema.validate_type(id, &op.v) {
            return Err(ZatError::TypeMismatch {
                attr: op.a.to_string(),
                expected: attr.value_type.name(),
                actual: op.v.tag().name(),
            });
        }
        resolved.push((
            op,
            AttrFlags {
                id,
                cardinality: attr.cardinality,
                unique: attr.unique,
                indexed: attr.ave_indexed(),
                is_ref: attr.is_ref(),
            },
        ));
    }

    let committed = pager.meta().clone();
    let new_tx = TxId(committed.tx_id.0 + 1);
    let tx_entity = EntityId::new(Partition::Tx, new_tx.0);

    // 2. Reclaim what no reader can still see, before allocating.
    let gate = readers.oldest().unwrap_or(committed.tx_id);
    let mut tracker = carry.clone();
    let mut freedb = FreeDb::open(committed.free_root);
    freedb.reclaim(pager, gate, &mut tracker)?;

    // 3. Allocate tempids: db partition when any op on the tempid touches a
    // bootstrap attribute, user partition otherwise.
    let mut order: Vec<&str> = Vec::new();
    let mut to_db: HashMap<&str, bool> = HashMap::new();
    for (op, flags) in &resolved {
        if let EntityRef::Tempid(name) = op.e {
            let entry = to_db.entry(name).or_insert_with(|| {
                order.push(name);
                false
            });
            *entry |= flags.id.0 <= LAST_BOOTSTRAP_ATTR;
        }
    }
    if order.len() > MAX_TX_TEMPIDS {
        return Err(ZatError::TempidOverflow);
    }
    let mut next_entity = committed.next_entity;
    let mut tempids: HashMap<String, EntityId> = HashMap::with_capacity(order.len());
    for name in &order {
        let partition = if to_db[name] {
            Partition::Db
        } else {
            Partition::User
        };
        tempids.insert((*name).to_string(), EntityId::new(partition, next_entity));
        next_entity += 1;
    }

    // 4. Unique-identity upsert: remap tempids onto existing entities.
    let mut indexes = IndexManager::open(IndexRoots {
        eav: committed.eav_root,
        ave: committed.ave_root,
        vae: committed.vae_root,
        txlog: committed.txlog_root,
    });
    for (op, flags) in &resolved {
        if op.op != Op::Assert || flags.unique != Unique::Identity {
            continue;
        }
        if let EntityRef::Tempid(name) = op.e {
            if let Some(existing) = probe_ave(pager, &indexes.ave, flags.id, &op.v)? {
                trace!(
                    target: "zatdb::tx",
                    tempid = name,
                    entity = existing.0,
                    "unique-identity upsert"
                );
                tempids.insert(name.to_string(), existing);
            }
        }
    }

    // 5. Write datoms in issue order.
    let mut written = 0usize;
    let mut touched_schema = false;
    for (op, flags) in &resolved {
        let e = match &op.e {
            EntityRef::Id(id) => *id,
            EntityRef::Tempid(name) => tempids[*name],
            EntityRef::Tx => tx_entity,
        };
        if e.is_db_partition() {
            touched_schema = true;
        }
        match op.op {
            Op::Assert => {
                if flags.unique == Unique::Value {
                    if let Some(holder) = probe_ave(pager, &indexes.ave, flags.id, &op.v)? {
                        if holder != e {
                            return Err(ZatError::UniqueValueConflict(op.a.to_string()));
                        }
                    }
                }
                match flags.cardinality {
                    Cardinality::One => {
                        if let Some(old_key) = first_eav_key(pager, &indexes.eav, e, flags.id)? {
                            let old_enc = old_key[16..].to_vec();
                            let mut new_enc = Vec::new();
                            value::encode(&op.v, &mut new_enc);
                            if value::compare_encoded(&old_enc, &new_enc) == Ordering::Equal {
                                // Idempotent re-assertion.
                                continue;
                            }
                            let old_v = value::decode(&old_enc)?;
                            bump(&mut written)?;
                            indexes.retract_datom(
                                pager,
                                &mut tracker,
                                &Datom {
                                    e,
                                    a: flags.id,
                                    v: old_v,
                                    tx: new_tx,
                                    added: false,
                                },
                                flags.indexed,
                                flags.is_ref,
                            )?;
                        }
                        bump(&mut written)?;
                        indexes.insert_datom(
                            pager,
                            &mut tracker,
                            &Datom {
                                e,
                                a: flags.id,
                                v: op.v,
                                tx: new_tx,
                                added: true,
                            },
                            flags.indexed,
                            flags.is_ref,
                        )?;
                    }
                    Cardinality::Many => {
                        bump(&mut written)?;
                        indexes.insert_datom(
                            pager,
                            &mut tracker,
                            &Datom {
                                e,
                                a: flags.id,
                                v: op.v,
                                tx: new_tx,
                                added: true,
                            },
                            flags.indexed,
                            flags.is_ref,
                        )?;
                    }
                }
            }
            Op::Retract => {
                let key = index::eav_key(e, flags.id, &op.v);
                if indexes.eav.contains(pager, &key)? {
                    bump(&mut written)?;
                    indexes.retract_datom(
                        pager,
                        &mut tracker,
                        &Datom {
                            e,
                            a: flags.id,
                            v: op.v,
                            tx: new_tx,
                            added: false,
                        },
                        flags.indexed,
                        flags.is_ref,
                    )?;
                }
            }
        }
    }

    // 6. Stamp the transaction entity.
    bump(&mut written)?;
    indexes.insert_datom(
        pager,
        &mut tracker,
        &Datom {
            e: tx_entity,
            a: A_TX_INSTANT,
            v: Value::Instant(Utc::now().timestamp_micros()),
            tx: new_tx,
            added: true,
        },
        false,
        false,
    )?;

    // 7. Persist this transaction's freed pages; the FreeDB's own orphans
    // carry forward into the next transaction.
    let mut new_carry = FreePageTracker::new();
    freedb.record(pager, new_tx, &tracker, &mut new_carry)?;

    // 8. Atomic handoff via the inactive meta slot.
    let roots = indexes.roots();
    pager.commit(Meta {
        page_size: committed.page_size,
        flags: 0,
        tx_id: new_tx,
        eav_root: roots.eav,
        ave_root: roots.ave,
        vae_root: roots.vae,
        txlog_root: roots.txlog,
        free_root: freedb.root(),
        next_entity,
        next_page: pager.next_page(),
        datom_count: committed.datom_count + written as u64,
    })?;
    *carry = new_carry;

    debug!(
        target: "zatdb::tx",
        tx = new_tx.0,
        datoms = written,
        tempids = tempids.len(),
        touched_schema,
        "transaction committed"
    );
    Ok(TxOutcome {
        report: TxReport {
            tx_id: new_tx,
            tempids,
            datom_count: written,
        },
        touched_schema,
    })
}

/// First entity holding `(a, v)` in AVE, if any.
fn probe_ave(
    pager: &Pager,
    ave: &Tree,
    a: EntityId,
    v: &Value<'_>,
) -> Result<Option<EntityId>> {
    if ave.is_empty() {
        return Ok(None);
    }
    let prefix = index::ave_prefix(a, v);
    let found = {
        let mut cursor = ave.seek(pager, &prefix)?;
        cursor.next()?.map(|entry| entry.key.to_vec())
    };
    let Some(key) = found else {
        return Ok(None);
    };
    let (ka, _, ke) = index::decode_ave(&key)?;
    if ka != a {
        return Ok(None);
    }
    let vlen = value::encoded_len(&key[8..])?;
    if key[8..8 + vlen] != prefix[8..] {
        return Ok(None);
    }
    Ok(Some(ke))
}

/// First `(e, a, *)` key in EAV, if any.
fn first_eav_key(
    pager: &Pager,
    eav: &Tree,
    e: EntityId,
    a: EntityId,
) -> Result<Option<Vec<u8>>> {
    if eav.is_empty() {
        return Ok(None);
    }
    let prefix = index::eav_prefix(e, a);
    let found = {
        let mut cursor = eav.seek(pager, &prefix)?;
        cursor.next()?.map(|entry| entry.key.to_vec())
    };
    let Some(key) = found else {
        return Ok(None);
    };
    if key.len() < 16 || key[..16] != prefix[..] {
        return Ok(None);
    }
    Ok(Some(key))
}
