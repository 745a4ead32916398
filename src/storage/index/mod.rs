//! The datom index family: EAV, AVE, VAE, and TxLog.
//!
//! Four independent COW B+ trees over composite big-endian keys with empty
//! values; the key carries all semantic content. Fixed-width components
//! compare bytewise; the encoded value component compares through the value
//! codec so variable-length payloads order semantically.

use std::cmp::Ordering;

use crate::primitives::pager::Pager;
use crate::storage::btree::Tree;
use crate::storage::free::FreePageTracker;
use crate::storage::value::{self, Value};
use crate::types::{EntityId, IndexId, PageId, Result, TxId, ZatError};

/// One immutable fact.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Datom<'a> {
    pub e: EntityId,
    pub a: EntityId,
    pub v: Value<'a>,
    pub tx: TxId,
    pub added: bool,
}

/// Root tuple of the four datom indexes, as persisted in a meta slot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexRoots {
    pub eav: PageId,
    pub ave: PageId,
    pub vae: PageId,
    pub txlog: PageId,
}

const OP_ASSERT: u8 = 1;
const OP_RETRACT: u8 = 0;

/// `[E:8][A:8][encoded V]`
pub fn eav_key(e: EntityId, a: EntityId, v: &Value<'_>) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + value::encoded_size(v));
    key.extend_from_slice(&e.0.to_be_bytes());
    key.extend_from_slice(&a.0.to_be_bytes());
    value::encode(v, &mut key);
    key
}

/// Prefix of every EAV key under `(e, a)`, for range probes.
pub fn eav_prefix(e: EntityId, a: EntityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&e.0.to_be_bytes());
    key.extend_from_slice(&a.0.to_be_bytes());
    key
}

/// `[A:8][encoded V][E:8]`
pub fn ave_key(a: EntityId, v: &Value<'_>, e: EntityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + value::encoded_size(v));
    key.extend_from_slice(&a.0.to_be_bytes());
    value::encode(v, &mut key);
    key.extend_from_slice(&e.0.to_be_bytes());
    key
}

/// Prefix of every AVE key under `(a, v)`, for uniqueness probes.
pub fn ave_prefix(a: EntityId, v: &Value<'_>) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + value::encoded_size(v));
    key.extend_from_slice(&a.0.to_be_bytes());
    value::encode(v, &mut key);
    key
}

/// `[V(ref):8][A:8][E:8]`
pub fn vae_key(v_ref: EntityId, a: EntityId, e: EntityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&v_ref.0.to_be_bytes());
    key.extend_from_slice(&a.0.to_be_bytes());
    key.extend_from_slice(&e.0.to_be_bytes());
    key
}

/// `[Tx:8][E:8][A:8][encoded V][Op:1]`
pub fn txlog_key(tx: TxId, e: EntityId, a: EntityId, v: &Value<'_>, added: bool) -> Vec<u8> {
    let mut key = Vec::with_capacity(25 + value::encoded_size(v));
    key.extend_from_slice(&tx.0.to_be_bytes());
    key.extend_from_slice(&e.0.to_be_bytes());
    key.extend_from_slice(&a.0.to_be_bytes());
    value::encode(v, &mut key);
    key.push(if added { OP_ASSERT } else { OP_RETRACT });
    key
}

/// Prefix of every TxLog key under `tx`.
pub fn txlog_prefix(tx: TxId) -> Vec<u8> {
    tx.0.to_be_bytes().to_vec()
}

fn read_entity(key: &[u8], off: usize) -> EntityId {
    EntityId(u64::from_be_bytes(key[off..off + 8].try_into().unwrap()))
}

/// Decompose an EAV key into `(entity, attribute, value)`.
pub fn decode_eav(key: &[u8]) -> Result<(EntityId, EntityId, Value<'_>)> {
    if key.len() < 17 {
        return Err(ZatError::Corrupt("eav key truncated"));
    }
    let v = value::decode(&key[16..])?;
    Ok((read_entity(key, 0), read_entity(key, 8), v))
}

/// Decompose an AVE key into `(attribute, value, entity)`.
pub fn decode_ave(key: &[u8]) -> Result<(EntityId, Value<'_>, EntityId)> {
    if key.len() < 9 {
        return Err(ZatError::Corrupt("ave key truncated"));
    }
    let v = value::decode(&key[8..])?;
    let vlen = value::encoded_len(&key[8..])?;
    if key.len() < 16 + vlen {
        return Err(ZatError::Corrupt("ave key truncated"));
    }
    Ok((read_entity(key, 0), v, read_entity(key, 8 + vlen)))
}

/// Decompose a VAE key into `(ref target, attribute, entity)`.
pub fn decode_vae(key: &[u8]) -> Result<(EntityId, EntityId, EntityId)> {
    if key.len() < 24 {
        return Err(ZatError::Corrupt("vae key truncated"));
    }
    Ok((
        read_entity(key, 0),
        read_entity(key, 8),
        read_entity(key, 16),
    ))
}

/// Decompose a TxLog key into a full datom.
pub fn decode_txlog(key: &[u8]) -> Result<Datom<'_>> {
    if key.len() < 25 {
        return Err(ZatError::Corrupt("txlog key truncated"));
    }
    let v = value::decode(&key[24..])?;
    let vlen = value::encoded_len(&key[24..])?;
    if key.len() < 25 + vlen {
        return Err(ZatError::Corrupt("txlog key truncated"));
    }
    Ok(Datom {
        tx: TxId(u64::from_be_bytes(key[0..8].try_into().unwrap())),
        e: read_entity(key, 8),
        a: read_entity(key, 16),
        v,
        added: key[24 + vlen] == OP_ASSERT,
    })
}

/// Compare a fixed-width big-endian prefix, then hand the remainder to the
/// value codec. Keys shorter than the fixed prefix (range-probe prefixes)
/// sort before their extensions.
fn cmp_fixed_then_value(a: &[u8], b: &[u8], fixed: usize) -> Ordering {
    let fa = &a[..a.len().min(fixed)];
    let fb = &b[..b.len().min(fixed)];
    match fa.cmp(fb) {
        Ordering::Equal if a.len() > fa.len() || b.len() > fb.len() => {
            value::compare_encoded(&a[fa.len()..], &b[fb.len()..])
        }
        other => other,
    }
}

fn cmp_value_then_tail(a: &[u8], b: &[u8]) -> Ordering {
    match value::compare_encoded(a, b) {
        Ordering::Equal => {
            let la = value::encoded_len(a).unwrap_or(a.len());
            let lb = value::encoded_len(b).unwrap_or(b.len());
            a[la.min(a.len())..].cmp(&b[lb.min(b.len())..])
        }
        other => other,
    }
}

pub fn eav_cmp(a: &[u8], b: &[u8]) -> Ordering {
    cmp_fixed_then_value(a, b, 16)
}

pub fn ave_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let fa = &a[..a.len().min(8)];
    let fb = &b[..b.len().min(8)];
    match fa.cmp(fb) {
        Ordering::Equal if a.len() > fa.len() || b.len() > fb.len() => {
            cmp_value_then_tail(&a[fa.len()..], &b[fb.len()..])
        }
        other => other,
    }
}

pub fn vae_cmp(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

pub fn txlog_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let fa = &a[..a.len().min(24)];
    let fb = &b[..b.len().min(24)];
    match fa.cmp(fb) {
        Ordering::Equal if a.len() > fa.len() || b.len() > fb.len() => {
            cmp_value_then_tail(&a[fa.len()..], &b[fb.len()..])
        }
        other => other,
    }
}

pub fn eav_tree(root: PageId) -> Tree {
    Tree::new(root, IndexId::Eav, eav_cmp)
}

pub fn ave_tree(root: PageId) -> Tree {
    Tree::new(root, IndexId::Ave, ave_cmp)
}

pub fn vae_tree(root: PageId) -> Tree {
    Tree::new(root, IndexId::Vae, vae_cmp)
}

pub fn txlog_tree(root: PageId) -> Tree {
    Tree::new(root, IndexId::TxLog, txlog_cmp)
}

/// The four trees of one uncommitted transaction, routing datoms per the
/// schema flags the caller resolves.
pub struct IndexManager {
    pub eav: Tree,
    pub ave: Tree,
    pub vae: Tree,
    pub txlog: Tree,
}

impl IndexManager {
    pub fn open(roots: IndexRoots) -> Self {
        Self {
            eav: eav_tree(roots.eav),
            ave: ave_tree(roots.ave),
            vae: vae_tree(roots.vae),
            txlog: txlog_tree(roots.txlog),
        }
    }

    pub fn roots(&self) -> IndexRoots {
        IndexRoots {
            eav: self.eav.root(),
            ave: self.ave.root(),
            vae: self.vae.root(),
            txlog: self.txlog.root(),
        }
    }

    /// Write an assertion: EAV and TxLog unconditionally, AVE when the
    /// attribute is indexed or unique, VAE when it is a ref.
    pub fn insert_datom(
        &mut self,
        pager: &mut Pager,
        tracker: &mut FreePageTracker,
        d: &Datom<'_>,
        indexed: bool,
        is_ref: bool,
    ) -> Result<()> {
        debug_assert!(d.added);
        self.eav
            .insert(pager, tracker, &eav_key(d.e, d.a, &d.v), b"")?;
        self.txlog
            .insert(pager, tracker, &txlog_key(d.tx, d.e, d.a, &d.v, true), b"")?;
        if indexed {
            self.ave
                .insert(pager, tracker, &ave_key(d.a, &d.v, d.e), b"")?;
        }
        if is_ref {
            if let Some(target) = d.v.as_ref_id() {
                self.vae
                    .insert(pager, tracker, &vae_key(target, d.a, d.e), b"")?;
            }
        }
        Ok(())
    }

    /// Remove a datom from the live indexes and log the retraction. The
    /// originating assertion stays in TxLog; history is never rewritten.
    pub fn retract_datom(
        &mut self,
        pager: &mut Pager,
        tracker: &mut FreePageTracker,
        d: &Datom<'_>,
        indexed: bool,
        is_ref: bool,
    ) -> Result<()> {
        self.eav.delete(pager, tracker, &eav_key(d.e, d.a, &d.v))?;
        if indexed {
            self.ave.delete(pager, tracker, &ave_key(d.a, &d.v, d.e))?;
        }
        if is_ref {
            if let Some(target) = d.v.as_ref_id() {
                self.vae.delete(pager, tracker, &vae_key(target, d.a, d.e))?;
            }
        }
        self.txlog
            .insert(pager, tracker, &txlog_key(d.tx, d.e, d.a, &d.v, false), b"")?;
        Ok(())
    }
}
