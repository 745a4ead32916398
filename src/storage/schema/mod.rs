//! Schema layer: the meta-schema bootstrap and the in-memory attribute
//! cache.
//!
//! Attribute entities live in the `db` partition and describe themselves
//! through eight reserved meta-attributes (entity ids 1..=8). The cache is a
//! read-only snapshot rebuilt by scanning every db-partition entity in the
//! primary index; it is reloaded after any transaction that touches one.

use std::collections::HashMap;

use tracing::debug;

use crate::primitives::pager::{PageSource, Pager};
use crate::storage::btree::Tree;
use crate::storage::free::FreePageTracker;
use crate::storage::index::{self, Datom, IndexManager};
use crate::storage::value::{Value, ValueTag};
use crate::types::{EntityId, Partition, Result, TxId, ZatError};

/// `:db/ident`
pub const A_IDENT: EntityId = EntityId(1);
/// `:db/valueType`
pub const A_VALUE_TYPE: EntityId = EntityId(2);
/// `:db/cardinality`
pub const A_CARDINALITY: EntityId = EntityId(3);
/// `:db/unique`
pub const A_UNIQUE: EntityId = EntityId(4);
/// `:db/index`
pub const A_INDEX: EntityId = EntityId(5);
/// `:db/isComponent`
pub const A_IS_COMPONENT: EntityId = EntityId(6);
/// `:db/doc`
pub const A_DOC: EntityId = EntityId(7);
/// `:db/txInstant`
pub const A_TX_INSTANT: EntityId = EntityId(8);

/// Entity ids at or below this are bootstrap meta-attributes.
pub const LAST_BOOTSTRAP_ATTR: u64 = 8;
/// First sequence number handed to user-created entities.
pub const FIRST_FREE_ENTITY: u64 = 9;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum Cardinality {
    #[default]
    One,
    Many,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum Unique {
    #[default]
    None,
    Value,
    Identity,
}

/// Cached schema state for one attribute entity.
#[derive(Clone, Debug)]
pub struct Attribute {
    pub id: EntityId,
    pub ident: String,
    pub value_type: ValueTag,
    pub cardinality: Cardinality,
    pub unique: Unique,
    pub indexed: bool,
    pub is_component: bool,
    pub doc: Option<String>,
}

impl Attribute {
    /// AVE holds an entry for this attribute's datoms.
    pub fn ave_indexed(&self) -> bool {
        self.indexed || self.unique != Unique::None
    }

    pub fn is_ref(&self) -> bool {
        self.value_type == ValueTag::Ref
    }
}

fn value_tag_from_keyword(kw: &str) -> Option<ValueTag> {
    Some(match kw {
        ":db.type/nil" => ValueTag::Nil,
        ":db.type/boolean" => ValueTag::Bool,
        ":db.type/long" => ValueTag::Int,
        ":db.type/double" => ValueTag::Float,
        ":db.type/string" => ValueTag::Str,
        ":db.type/keyword" => ValueTag::Keyword,
        ":db.type/ref" => ValueTag::Ref,
        ":db.type/instant" => ValueTag::Instant,
        ":db.type/uuid" => ValueTag::Uuid,
        ":db.type/bytes" => ValueTag::Bytes,
        _ => return None,
    })
}

/// Keyword spelling of a value type tag.
pub fn value_type_keyword(tag: ValueTag) -> &'static str {
    match tag {
        ValueTag::Nil => ":db.type/nil",
        ValueTag::Bool => ":db.type/boolean",
        ValueTag::Int => ":db.type/long",
        ValueTag::Float => ":db.type/double",
        ValueTag::Str => ":db.type/string",
        ValueTag::Keyword => ":db.type/keyword",
        ValueTag::Ref => ":db.type/ref",
        ValueTag::Instant => ":db.type/instant",
        ValueTag::Uuid => ":db.type/uuid",
        ValueTag::Bytes => ":db.type/bytes",
    }
}

/// Read-only snapshot of every attribute in the database.
#[derive(Debug, Default)]
pub struct SchemaCache {
    idents: HashMap<String, EntityId>,
    attrs: HashMap<u64, Attribute>,
}

impl SchemaCache {
    /// Rebuild the cache by scanning db-partition entities in EAV order.
    pub fn load<S: PageSource>(eav: &Tree, src: &S) -> Result<Self> {
        let mut cache = SchemaCache::default();
        let start = [0u8; 8];
        let end = EntityId::new(Partition::Tx, 0).0.to_be_bytes();
        let mut cursor = eav.range(src, &start, &end)?;
        let mut pending: Option<PendingAttr> = None;
        while let Some(entry) = cursor.next()? {
            let (e, a, v) = index::decode_eav(entry.key)?;
            match &mut pending {
                Some(p) if p.id == e => p.apply(a, &v)?,
                _ => {
                    if let Some(done) = pending.take() {
                        cache.install(done)?;
                    }
                    let mut p = PendingAttr::new(e);
                    p.apply(a, &v)?;
                    pending = Some(p);
                }
            }
        }
        if let Some(done) = pending.take() {
            cache.install(done)?;
        }
        debug!(
            target: "zatdb::schema",
            attrs = cache.attrs.len(),
            idents = cache.idents.len(),
            "schema cache loaded"
        );
        Ok(cache)
    }

    fn install(&mut self, pending: PendingAttr) -> Result<()> {
        let Some(ident) = pending.ident else {
            // Db-partition entity without an ident; nothing to resolve.
            return Ok(());
        };
        self.idents.insert(ident.clone(), pending.id);
        let Some(value_type) = pending.value_type else {
            // Ident-only entity (an enum value); resolvable but not an
            // attribute.
            return Ok(());
        };
        self.attrs.insert(
            pending.id.0,
            Attribute {
                id: pending.id,
                ident,
                value_type,
                cardinality: pending.cardinality,
                unique: pending.unique,
                indexed: pending.indexed,
                is_component: pending.is_component,
                doc: pending.doc,
            },
        );
        Ok(())
    }

    pub fn resolve_ident(&self, keyword: &str) -> Option<EntityId> {
        self.idents.get(keyword).copied()
    }

    pub fn get_attr(&self, id: EntityId) -> Option<&Attribute> {
        self.attrs.get(&id.0)
    }

    pub fn validate_type(&self, id: EntityId, v: &Value<'_>) -> bool {
        self.get_attr(id)
            .is_some_and(|attr| attr.value_type == v.tag())
    }

    pub fn is_indexed(&self, id: EntityId) -> bool {
        self.get_attr(id).is_some_and(Attribute::ave_indexed)
    }

    pub fn is_ref(&self, id: EntityId) -> bool {
        self.get_attr(id).is_some_and(Attribute::is_ref)
    }

    pub fn attr_count(&self) -> usize {
        self.attrs.len()
    }
}

struct PendingAttr {
    id: EntityId,
    ident: Option<String>,
    value_type: Option<ValueTag>,
    cardinality: Cardinality,
    unique: Unique,
    indexed: bool,
    is_component: bool,
    doc: Option<String>,
}

impl PendingAttr {
    fn new(id: EntityId) -> Self {
        Self {
            id,
            ident: None,
            value_type: None,
            cardinality: Cardinality::default(),
            unique: Unique::default(),
            indexed: false,
            is_component: false,
            doc: None,
        }
    }

    fn apply(&mut self, a: EntityId, v: &Value<'_>) -> Result<()> {
        match (a, v) {
            (A_IDENT, Value::Keyword(kw)) => self.ident = Some((*kw).to_string()),
            (A_VALUE_TYPE, Value::Keyword(kw)) => {
                self.value_type = Some(
                    value_tag_from_keyword(kw)
                        .ok_or(ZatError::Corrupt("unknown value type keyword"))?,
                );
            }
            (A_CARDINALITY, Value::Keyword(kw)) => {
                self.cardinality = match *kw {
                    ":db.cardinality/one" => Cardinality::One,
                    ":db.cardinality/many" => Cardinality::Many,
                    _ => return Err(ZatError::Corrupt("unknown cardinality keyword")),
                };
            }
            (A_UNIQUE, Value::Keyword(kw)) => {
                self.unique = match *kw {
                    ":db.unique/value" => Unique::Value,
                    ":db.unique/identity" => Unique::Identity,
                    _ => return Err(ZatError::Corrupt("unknown uniqueness keyword")),
                };
            }
            (A_INDEX, Value::Bool(flag)) => self.indexed = *flag,
            (A_IS_COMPONENT, Value::Bool(flag)) => self.is_component = *flag,
            (A_DOC, Value::Str(doc)) => self.doc = Some((*doc).to_string()),
            // Non-schema datoms on a db-partition entity are legal.
            _ => {}
        }
        Ok(())
    }
}

const BOOTSTRAP_ATTRS: [(EntityId, &str, ValueTag); 8] = [
    (A_IDENT, ":db/ident", ValueTag::Keyword),
    (A_VALUE_TYPE, ":db/valueType", ValueTag::Keyword),
    (A_CARDINALITY, ":db/cardinality", ValueTag::Keyword),
    (A_UNIQUE, ":db/unique", ValueTag::Keyword),
    (A_INDEX, ":db/index", ValueTag::Bool),
    (A_IS_COMPONENT, ":db/isComponent", ValueTag::Bool),
    (A_DOC, ":db/doc", ValueTag::Str),
    (A_TX_INSTANT, ":db/txInstant", ValueTag::Instant),
];

/// Install the self-describing meta-schema into fresh indexes. Returns the
/// number of datoms written; the caller sets `next_entity` to
/// [`FIRST_FREE_ENTITY`].
pub fn bootstrap(
    pager: &mut Pager,
    indexes: &mut IndexManager,
    tracker: &mut FreePageTracker,
) -> Result<usize> {
    let tx = TxId(0);
    let mut count = 0usize;
    for (id, ident, value_type) in BOOTSTRAP_ATTRS {
        let datoms = [
            (A_IDENT, Value::Keyword(ident)),
            (A_VALUE_TYPE, Value::Keyword(value_type_keyword(value_type))),
            (A_CARDINALITY, Value::Keyword(":db.cardinality/one")),
        ];
        for (a, v) in datoms {
            let datom = Datom {
                e: id,
                a,
                v,
                tx,
                added: true,
            };
            // :db/ident is unique-identity, so its datoms reach AVE for
            // upsert probes; nothing in the bootstrap is a ref.
            indexes.insert_datom(pager, tracker, &datom, a == A_IDENT, false)?;
            count += 1;
        }
    }
    let unique_ident = Datom {
        e: A_IDENT,
        a: A_UNIQUE,
        v: Value::Keyword(":db.unique/identity"),
        tx,
        added: true,
    };
    indexes.insert_datom(pager, tracker, &unique_ident, false, false)?;
    count += 1;
    debug!(target: "zatdb::schema", datoms = count, "meta-schema installed");
    Ok(count)
}
