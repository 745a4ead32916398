//! File manager: fixed-page file with an mmap read view and a positioned
//! write path.
//!
//! All reads go through a shared read-only map of the file. Writes use
//! `pwrite` outside the map; a write that lands inside the mapped range is
//! visible through the map immediately, while pages appended past the mapped
//! length become visible after [`Pager::refresh`] rebuilds the map. Snapshots
//! clone the `Arc<Mmap>`, so a refresh never invalidates a live reader view.

use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use tracing::{debug, trace};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::pager::meta::{self, Meta};
use crate::types::{PageId, Result, ZatError, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};

/// Read access to committed pages. Implemented by the writer-side [`Pager`]
/// and by the `Arc<Mmap>`-backed [`PagerView`] held by snapshots.
pub trait PageSource {
    /// Zero-copy slice of page `id`, valid while the source is borrowed.
    fn page(&self, id: PageId) -> Result<&[u8]>;
    fn page_size(&self) -> usize;
}

/// Open-time options.
#[derive(Clone, Copy, Debug)]
pub struct PagerOptions {
    /// Page size for newly created files. Ignored when opening an existing
    /// database, which keeps the size recorded in its meta.
    pub page_size: u32,
    /// Create the file if it does not exist.
    pub create: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            create: true,
        }
    }
}

/// Saved allocation state, restored when a transaction aborts.
#[derive(Clone, Debug)]
pub struct AllocCheckpoint {
    next_page: PageId,
    reuse: Vec<PageId>,
}

/// The writer-side file manager.
pub struct Pager {
    io: StdFileIo,
    page_size: usize,
    map: Arc<Mmap>,
    meta: Meta,
    active_slot: u8,
    next_page: PageId,
    reuse: Vec<PageId>,
}

fn map_file(io: &StdFileIo) -> Result<Arc<Mmap>> {
    // Safety: the database file is never truncated while mapped, and the map
    // is rebuilt (never resized in place) whenever the file grows.
    let map = unsafe { Mmap::map(io.file()).map_err(ZatError::from)? };
    Ok(Arc::new(map))
}

impl Pager {
    /// Open an existing database file, or create one per `opts`.
    pub fn open(path: impl AsRef<Path>, opts: PagerOptions) -> Result<Self> {
        let path = path.as_ref();
        let exists = path.exists();
        if !exists && !opts.create {
            return Err(ZatError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "database file does not exist",
            )));
        }
        let io = StdFileIo::open(path)?;
        if !exists || io.is_empty()? {
            Self::create(io, opts.page_size)
        } else {
            Self::load(io)
        }
    }

    fn create(io: StdFileIo, page_size: u32) -> Result<Self> {
        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(ZatError::Invalid("page size must be a power of two >= 512"));
        }
        let meta = Meta::initial(page_size);
        // Slot 0 carries tx 0; slot 1 stays zeroed until the first commit.
        io.set_len(2 * page_size as u64)?;
        meta::write_slot(&io, 0, &meta)?;
        io.sync_all()?;
        let map = map_file(&io)?;
        debug!(target: "zatdb::pager", page_size, "created database file");
        Ok(Self {
            io,
            page_size: page_size as usize,
            map,
            next_page: meta.next_page,
            meta,
            active_slot: 0,
            reuse: Vec::new(),
        })
    }

    fn load(io: StdFileIo) -> Result<Self> {
        let (active_slot, meta) = meta::load_active(&io)?;
        let map = map_file(&io)?;
        debug!(
            target: "zatdb::pager",
            slot = active_slot,
            tx = meta.tx_id.0,
            next_page = meta.next_page.0,
            "opened database file"
        );
        Ok(Self {
            io,
            page_size: meta.page_size as usize,
            map,
            next_page: meta.next_page,
            meta,
            active_slot,
            reuse: Vec::new(),
        })
    }

    /// Last committed meta record.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Next page id the allocator would hand out from the high-water mark.
    pub fn next_page(&self) -> PageId {
        self.next_page
    }

    /// Cheap clone of the current read view for a snapshot.
    pub fn view(&self) -> PagerView {
        PagerView {
            map: Arc::clone(&self.map),
            page_size: self.page_size,
        }
    }

    /// Allocate a page id: the reuse list first, then the monotonic cursor.
    pub fn alloc_page(&mut self) -> Result<PageId> {
        if let Some(id) = self.reuse.pop() {
            trace!(target: "zatdb::pager", page = id.0, "alloc reused page");
            return Ok(id);
        }
        let id = self.next_page;
        self.next_page = PageId(id.0 + 1);
        trace!(target: "zatdb::pager", page = id.0, "alloc fresh page");
        Ok(id)
    }

    /// Hand reclaimed page ids back to the allocator.
    pub fn push_reusable(&mut self, ids: impl IntoIterator<Item = PageId>) {
        self.reuse.extend(ids);
    }

    pub fn reusable_len(&self) -> usize {
        self.reuse.len()
    }

    /// Snapshot allocation state before a transaction mutates it.
    pub fn alloc_checkpoint(&self) -> AllocCheckpoint {
        AllocCheckpoint {
            next_page: self.next_page,
            reuse: self.reuse.clone(),
        }
    }

    /// Roll allocation state back after an aborted transaction.
    pub fn restore_alloc(&mut self, checkpoint: AllocCheckpoint) {
        self.next_page = checkpoint.next_page;
        self.reuse = checkpoint.reuse;
    }

    /// Write one whole page at its fixed offset, outside the mmap.
    pub fn write_page(&mut self, id: PageId, buf: &[u8]) -> Result<()> {
        if buf.len() != self.page_size {
            return Err(ZatError::Invalid("page buffer length != page size"));
        }
        self.io.write_at(id.0 * self.page_size as u64, buf)?;
        Ok(())
    }

    /// Rebuild the read view if the file has grown past the mapped length.
    pub fn refresh(&mut self) -> Result<()> {
        let file_len = self.io.len()?;
        if file_len > self.map.len() as u64 {
            self.map = map_file(&self.io)?;
            trace!(target: "zatdb::pager", len = file_len, "remapped file");
        }
        Ok(())
    }

    /// Flush all pending writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// First commit of a freshly created file: rewrites the active slot in
    /// place, keeping tx 0. A crash before this completes leaves a valid
    /// empty database that re-runs bootstrap on open.
    pub fn commit_initial(&mut self, mut new_meta: Meta) -> Result<()> {
        debug_assert_eq!(self.meta.tx_id.0, 0);
        new_meta.page_size = self.page_size as u32;
        new_meta.next_page = self.next_page;
        self.io.sync_all()?;
        meta::write_slot(&self.io, self.active_slot, &new_meta)?;
        self.io.sync_all()?;
        self.refresh()?;
        self.meta = new_meta;
        Ok(())
    }

    /// Atomic handoff: sync data pages, write the inactive meta slot, sync
    /// again, then refresh the read view. On success `new_meta` is the
    /// committed state.
    pub fn commit(&mut self, mut new_meta: Meta) -> Result<()> {
        debug_assert!(new_meta.tx_id > self.meta.tx_id);
        new_meta.page_size = self.page_size as u32;
        new_meta.next_page = self.next_page;
        self.io.sync_all()?;
        let target = 1 - self.active_slot;
        meta::write_slot(&self.io, target, &new_meta)?;
        self.io.sync_all()?;
        self.refresh()?;
        debug!(
            target: "zatdb::pager",
            slot = target,
            tx = new_meta.tx_id.0,
            next_page = new_meta.next_page.0,
            "committed meta"
        );
        self.active_slot = target;
        self.meta = new_meta;
        Ok(())
    }
}

impl PageSource for Pager {
    fn page(&self, id: PageId) -> Result<&[u8]> {
        page_slice(&self.map, self.page_size, id)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

/// Snapshot-side read view: an `Arc` clone of one generation of the map.
#[derive(Clone)]
pub struct PagerView {
    map: Arc<Mmap>,
    page_size: usize,
}

impl PageSource for PagerView {
    fn page(&self, id: PageId) -> Result<&[u8]> {
        page_slice(&self.map, self.page_size, id)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

fn page_slice(map: &Mmap, page_size: usize, id: PageId) -> Result<&[u8]> {
    let start = (id.0 as usize)
        .checked_mul(page_size)
        .ok_or(ZatError::Corrupt("page offset overflow"))?;
    let end = start + page_size;
    if end > map.len() {
        return Err(ZatError::Corrupt("page beyond mapped file"));
    }
    Ok(&map[start..end])
}
