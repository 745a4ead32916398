//! Free page tracking: per-transaction orphan list and the persistent FreeDB.
//!
//! COW replaces pages instead of mutating them; the replaced ids collect in
//! a [`FreePageTracker`] and are persisted at commit into the FreeDB, a B+
//! tree keyed by the freeing transaction id. The FreeDB is itself
//! copy-on-write, so recording a freed list orphans FreeDB pages; those are
//! captured by a carry-forward tracker and rolled into the next
//! transaction's list. The recursion terminates because a page id lives at
//! most once in the file and cannot be freed twice.

use smallvec::SmallVec;
use tracing::debug;

use crate::primitives::pager::{PageSource, Pager};
use crate::storage::btree::Tree;
use crate::storage::page;
use crate::types::{IndexId, PageId, Result, TxId, ZatError};

/// Inline capacity of a tracker; larger transactions spill to the heap.
pub const TRACKER_INLINE_PAGES: usize = 64;

/// In-memory list of page ids orphaned during one transaction.
#[derive(Clone, Debug, Default)]
pub struct FreePageTracker {
    pages: SmallVec<[PageId; TRACKER_INLINE_PAGES]>,
}

impl FreePageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: PageId) {
        self.pages.push(id);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> &[PageId] {
        &self.pages
    }

    /// Move every id out of `other` into this tracker.
    pub fn absorb(&mut self, other: &mut FreePageTracker) {
        self.pages.append(&mut other.pages);
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

fn free_key(tx: TxId) -> [u8; 8] {
    tx.0.to_be_bytes()
}

fn decode_free_key(key: &[u8]) -> Result<TxId> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| ZatError::Corrupt("freedb key is not 8 bytes"))?;
    Ok(TxId(u64::from_be_bytes(bytes)))
}

/// Length-prefixed page-id list: `[count:4][id:8]...`.
fn encode_page_list(pages: &[PageId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + pages.len() * 8);
    out.extend_from_slice(&(pages.len() as u32).to_be_bytes());
    for id in pages {
        out.extend_from_slice(&id.0.to_be_bytes());
    }
    out
}

fn decode_page_list(bytes: &[u8]) -> Result<Vec<PageId>> {
    if bytes.len() < 4 {
        return Err(ZatError::Corrupt("freedb value truncated"));
    }
    let count = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
    if bytes.len() != 4 + count * 8 {
        return Err(ZatError::Corrupt("freedb value length mismatch"));
    }
    let mut pages = Vec::with_capacity(count);
    for chunk in bytes[4..].chunks_exact(8) {
        pages.push(PageId(u64::from_be_bytes(chunk.try_into().unwrap())));
    }
    Ok(pages)
}

fn free_cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// The persistent tree mapping `tx_id -> [page_id]`, gate-kept by the
/// oldest active reader.
#[derive(Copy, Clone, Debug)]
pub struct FreeDb {
    tree: Tree,
}

impl FreeDb {
    pub fn open(root: PageId) -> Self {
        Self {
            tree: Tree::new(root, IndexId::Free, free_cmp),
        }
    }

    pub fn root(&self) -> PageId {
        self.tree.root()
    }

    /// Persist `freed` under `tx`. Pages the insert itself orphans are
    /// collected into `carry` for the next transaction.
    pub fn record(
        &mut self,
        pager: &mut Pager,
        tx: TxId,
        freed: &FreePageTracker,
        carry: &mut FreePageTracker,
    ) -> Result<()> {
        if freed.is_empty() {
            return Ok(());
        }
        let value = encode_page_list(freed.pages());
        self.tree.insert(pager, carry, &free_key(tx), &value)?;
        debug!(
            target: "zatdb::free",
            tx = tx.0,
            pages = freed.len(),
            carry = carry.len(),
            "recorded freed pages"
        );
        Ok(())
    }

    /// Reclaim every entry with `tx_id <= oldest`: the listed pages move to
    /// the pager's reuse list and the consumed entries are deleted. FreeDB
    /// pages orphaned by the deletes land in `carry`, same as inserts.
    ///
    /// Returns the number of page ids reclaimed.
    pub fn reclaim(
        &mut self,
        pager: &mut Pager,
        oldest: TxId,
        carry: &mut FreePageTracker,
    ) -> Result<usize> {
        if self.tree.is_empty() {
            return Ok(0);
        }
        pager.refresh()?;
        let mut consumed: Vec<(TxId, Vec<PageId>)> = Vec::new();
        {
            let mut cursor = self.tree.cursor_first(pager)?;
            while let Some(entry) = cursor.next()? {
                let tx = decode_free_key(entry.key)?;
                if tx > oldest {
                    break;
                }
                let value = entry.value.read(pager)?;
                consumed.push((tx, decode_page_list(&value)?));
            }
        }
        let mut total = 0usize;
        let mut stamp = vec![0u8; pager.page_size()];
        page::init_free(&mut stamp);
        for (tx, pages) in consumed {
            self.tree.delete(pager, carry, &free_key(tx))?;
            total += pages.len();
            // Stamp reclaimed pages so a dump of the file distinguishes
            // reusable slots from stale tree pages. They are unreachable
            // from the active meta, so the overwrite is crash-safe.
            for &id in &pages {
                pager.write_page(id, &stamp)?;
            }
            pager.push_reusable(pages);
        }
        if total > 0 {
            debug!(
                target: "zatdb::free",
                oldest = oldest.0,
                pages = total,
                "reclaimed freed pages"
            );
        }
        Ok(total)
    }
}
