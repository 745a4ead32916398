//! The `Database` handle: open/create, transactions, and MVCC snapshots.
//!
//! One writer at a time (a process-local mutex) and up to `MAX_READERS`
//! concurrent snapshots. The dual meta-slot overwrite inside
//! [`Pager::commit`] is the single linearization point: a snapshot taken
//! before it sees the old root set, one taken after sees the new.

pub mod readers;
pub mod tx;

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::primitives::pager::{Meta, PageSource, Pager, PagerOptions, PagerView};
use crate::storage::btree::{Cursor, Tree};
use crate::storage::free::{FreeDb, FreePageTracker};
use crate::storage::index::{self, IndexManager, IndexRoots};
use crate::storage::page::KeyCmp;
use crate::storage::schema::{self, SchemaCache, FIRST_FREE_ENTITY};
use crate::types::{EntityId, IndexId, PageId, Result, TxId, DEFAULT_PAGE_SIZE};

use self::readers::{ReaderSlot, ReaderTable};
use self::tx::{TxOp, TxReport};

/// Open-time configuration.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Page size for newly created files; existing files keep theirs.
    pub page_size: u32,
    /// Create the file when missing.
    pub create: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            create: true,
        }
    }
}

/// Writer-side state, guarded by the writer mutex.
struct Writer {
    pager: Pager,
    /// FreeDB orphans from the previous commit, rolled into the next
    /// transaction's freed list.
    carry: FreePageTracker,
}

/// Reader-visible state published after each commit.
#[derive(Clone)]
struct Committed {
    view: PagerView,
    roots: IndexRoots,
    free_root: PageId,
    tx_id: TxId,
    datom_count: u64,
    schema: Arc<SchemaCache>,
}

/// An embedded, single-file datom store.
pub struct Database {
    writer: Mutex<Writer>,
    published: RwLock<Committed>,
    readers: Arc<ReaderTable>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) a database with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, Options::default())
    }

    pub fn open_with(path: impl AsRef<Path>, opts: Options) -> Result<Self> {
        let mut pager = Pager::open(
            path,
            PagerOptions {
                page_size: opts.page_size,
                create: opts.create,
            },
        )?;
        let mut carry = FreePageTracker::new();
        if pager.meta().tx_id.0 == 0 && pager.meta().eav_root.0 == 0 {
            carry = bootstrap(&mut pager)?;
        }

        let meta = pager.meta().clone();
        let schema = Arc::new(SchemaCache::load(
            &index::eav_tree(meta.eav_root),
            &pager,
        )?);
        let committed = Committed {
            view: pager.view(),
            roots: IndexRoots {
                eav: meta.eav_root,
                ave: meta.ave_root,
                vae: meta.vae_root,
                txlog: meta.txlog_root,
            },
            free_root: meta.free_root,
            tx_id: meta.tx_id,
            datom_count: meta.datom_count,
            schema,
        };
        debug!(
            target: "zatdb::db",
            tx = meta.tx_id.0,
            datoms = meta.datom_count,
            "database ready"
        );
        Ok(Self {
            writer: Mutex::new(Writer { pager, carry }),
            published: RwLock::new(committed),
            readers: Arc::new(ReaderTable::new()),
        })
    }

    /// Apply one transaction atomically. On error the database, in memory
    /// and on disk, is exactly as before the call.
    pub fn transact(&self, ops: &[TxOp<'_>]) -> Result<TxReport> {
        let mut writer = self.writer.lock();
        let w = &mut *writer;
        let schema = self.published.read().schema.clone();
        let checkpoint = w.pager.alloc_checkpoint();
        match tx::run(&mut w.pager, &mut w.carry, &self.readers, &schema, ops) {
            Ok(outcome) => {
                let meta = w.pager.meta().clone();
                let schema = if outcome.touched_schema {
                    Arc::new(SchemaCache::load(
                        &index::eav_tree(meta.eav_root),
                        &w.pager,
                    )?)
                } else {
                    schema
                };
                *self.published.write() = Committed {
                    view: w.pager.view(),
                    roots: IndexRoots {
                        eav: meta.eav_root,
                        ave: meta.ave_root,
                        vae: meta.vae_root,
                        txlog: meta.txlog_root,
                    },
                    free_root: meta.free_root,
                    tx_id: meta.tx_id,
                    datom_count: meta.datom_count,
                    schema,
                };
                Ok(outcome.report)
            }
            Err(err) => {
                w.pager.restore_alloc(checkpoint);
                Err(err)
            }
        }
    }

    /// Capture a read snapshot at the current committed transaction. The
    /// snapshot's pages cannot be reclaimed while it is alive.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let published = self.published.read();
        let slot = self.readers.acquire(published.tx_id)?;
        Ok(Snapshot {
            view: published.view.clone(),
            roots: published.roots,
            free_root: published.free_root,
            tx_id: published.tx_id,
            datom_count: published.datom_count,
            schema: published.schema.clone(),
            _slot: slot,
        })
    }

    /// Root tuple of the current committed transaction.
    pub fn current_roots(&self) -> IndexRoots {
        self.published.read().roots
    }

    pub fn tx_id(&self) -> TxId {
        self.published.read().tx_id
    }

    /// Total datoms written over the database's lifetime, retraction
    /// records included.
    pub fn datom_count(&self) -> u64 {
        self.published.read().datom_count
    }

    /// Read-only handle onto the current schema cache.
    pub fn schema(&self) -> Arc<SchemaCache> {
        self.published.read().schema.clone()
    }

    /// Live reader snapshots.
    pub fn active_readers(&self) -> usize {
        self.readers.active()
    }
}

/// Install the meta-schema into a fresh file and commit it as tx 0.
/// Returns the carry-forward tracker from persisting bootstrap orphans.
fn bootstrap(pager: &mut Pager) -> Result<FreePageTracker> {
    let mut indexes = IndexManager::open(IndexRoots::default());
    let mut tracker = FreePageTracker::new();
    let count = schema::bootstrap(pager, &mut indexes, &mut tracker)?;

    let mut freedb = FreeDb::open(PageId(0));
    let mut carry = FreePageTracker::new();
    freedb.record(pager, TxId(0), &tracker, &mut carry)?;

    let roots = indexes.roots();
    pager.commit_initial(Meta {
        page_size: 0, // stamped by the pager
        flags: 0,
        tx_id: TxId(0),
        eav_root: roots.eav,
        ave_root: roots.ave,
        vae_root: roots.vae,
        txlog_root: roots.txlog,
        free_root: freedb.root(),
        next_entity: FIRST_FREE_ENTITY,
        next_page: PageId(0), // stamped by the pager
        datom_count: count as u64,
    })?;
    Ok(carry)
}

/// A frozen root set at one committed transaction. All reads through a
/// snapshot are zero-copy into its pinned mmap generation and stay valid
/// for the snapshot's lifetime.
pub struct Snapshot {
    view: PagerView,
    roots: IndexRoots,
    free_root: PageId,
    tx_id: TxId,
    datom_count: u64,
    schema: Arc<SchemaCache>,
    _slot: ReaderSlot,
}

impl Snapshot {
    pub fn roots(&self) -> IndexRoots {
        self.roots
    }

    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    pub fn datom_count(&self) -> u64 {
        self.datom_count
    }

    pub fn schema(&self) -> &SchemaCache {
        &self.schema
    }

    pub fn free_root(&self) -> PageId {
        self.free_root
    }

    pub fn eav(&self) -> Tree {
        index::eav_tree(self.roots.eav)
    }

    pub fn ave(&self) -> Tree {
        index::ave_tree(self.roots.ave)
    }

    pub fn vae(&self) -> Tree {
        index::vae_tree(self.roots.vae)
    }

    pub fn txlog(&self) -> Tree {
        index::txlog_tree(self.roots.txlog)
    }

    /// Open a tree over an arbitrary root with a caller-chosen comparator;
    /// query layers use this for historical roots.
    pub fn open_tree(&self, root: PageId, index_id: IndexId, cmp: KeyCmp) -> Tree {
        Tree::new(root, index_id, cmp)
    }

    /// Cursor over every datom of `tx` in the log.
    pub fn tx_datoms(&self, tx: TxId) -> Result<Cursor<'_, Snapshot>> {
        let start = index::txlog_prefix(tx);
        let end = index::txlog_prefix(TxId(tx.0 + 1));
        self.txlog().range(self, &start, &end)
    }

    /// Cursor over every datom of entity `e`.
    pub fn entity_datoms(&self, e: EntityId) -> Result<Cursor<'_, Snapshot>> {
        let start = e.0.to_be_bytes();
        let end = (e.0 + 1).to_be_bytes();
        self.eav().range(self, &start, &end)
    }
}

impl PageSource for Snapshot {
    fn page(&self, id: PageId) -> Result<&[u8]> {
        self.view.page(id)
    }

    fn page_size(&self) -> usize {
        self.view.page_size()
    }
}
