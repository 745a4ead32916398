//! # ZatDB: embedded Datomic-style storage core
//!
//! ZatDB is a single-file database of immutable facts (datoms) stored in a
//! family of copy-on-write B+ trees. Commits hand off atomically through a
//! pair of checksummed meta pages instead of a write-ahead log, readers get
//! zero-copy MVCC snapshots backed by mmap, and freed pages are reclaimed
//! once no live snapshot can reach them.
//!
//! ## Quick start
//!
//! ```no_run
//! use zatdb::{Database, EntityRef, TxOp, Value};
//! use zatdb::schema::{Cardinality, Unique};
//! use zatdb::value::ValueTag;
//!
//! let db = Database::open("app.zatdb")?;
//!
//! // Define an attribute, then assert a fact with it.
//! db.transact(&zatdb::define_attribute(
//!     ":user/name",
//!     ValueTag::Str,
//!     Cardinality::One,
//!     Unique::None,
//!     false,
//! ))?;
//! let report = db.transact(&[TxOp::assert(
//!     EntityRef::Tempid("alice"),
//!     ":user/name",
//!     Value::Str("Alice"),
//! )])?;
//! let alice = report.tempids["alice"];
//!
//! // Read through a snapshot; later writes cannot disturb it.
//! let snap = db.snapshot()?;
//! let mut datoms = snap.entity_datoms(alice)?;
//! while let Some(entry) = datoms.next()? {
//!     let (e, a, v) = zatdb::index::decode_eav(entry.key)?;
//!     println!("{e} {a} {v:?}");
//! }
//! # Ok::<(), zatdb::ZatError>(())
//! ```
//!
//! ## Architecture
//!
//! - **`primitives`**: positioned file I/O, the page file manager with its
//!   mmap read view, and the dual-slot meta protocol.
//! - **`storage`**: the bytewise-sortable value codec, slotted pages, the
//!   COW B+ tree with stack-based cursors, free-page tracking, the
//!   EAV/AVE/VAE/TxLog index family, and the schema layer.
//! - **`db`**: the `Database` handle with single-writer transactions,
//!   reader slots, and published snapshots.

pub mod db;
pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;

pub use crate::db::tx::{define_attribute, EntityRef, Op, TxOp, TxReport};
pub use crate::db::{Database, Options, Snapshot};
pub use crate::primitives::pager::{PageSource, Pager, PagerOptions, PagerView};
pub use crate::storage::btree::{Cursor, CursorEntry, Tree, ValueRef};
pub use crate::storage::index::{self, Datom, IndexRoots};
pub use crate::storage::schema::{self, SchemaCache};
pub use crate::storage::value::{self, Value, ValueTag};
pub use crate::types::{EntityId, Partition, Result, TxId, ZatError};
