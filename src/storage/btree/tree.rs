//! Copy-on-write B+ tree over the pager.
//!
//! A `Tree` is a root page id plus a key comparator; cloning one is O(1) and
//! two trees with different roots over the same file are independent
//! snapshots. Writes never mutate an existing page: the touched path is
//! copied into freshly allocated pages and the replaced ids are handed to
//! the free-page tracker. A failed write leaves `root` untouched so the
//! caller can abort its transaction cleanly.

use std::cmp::Ordering;

use tracing::trace;

use crate::primitives::pager::{PageSource, Pager};
use crate::storage::free::FreePageTracker;
use crate::storage::page::{self as page, KeyCmp, PageFull, ValueSlot};
use crate::types::{IndexId, PageId, PageType, Result, ZatError};

/// Value handle yielded by lookups and cursors. Inline values borrow the
/// page source; overflow values name their chain head.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueRef<'a> {
    Inline(&'a [u8]),
    Overflow { total_len: u32, head: PageId },
}

impl<'a> ValueRef<'a> {
    fn from_slot(slot: ValueSlot<'a>) -> Self {
        match slot {
            ValueSlot::Inline(v) => ValueRef::Inline(v),
            ValueSlot::Overflow { total_len, head } => ValueRef::Overflow { total_len, head },
        }
    }

    /// Inline bytes, or an error for out-of-line values.
    pub fn as_inline(&self) -> Result<&'a [u8]> {
        match self {
            ValueRef::Inline(v) => Ok(v),
            ValueRef::Overflow { .. } => Err(ZatError::Corrupt("unexpected overflow value")),
        }
    }

    /// Materialize the value, walking the overflow chain if needed.
    pub fn read(&self, src: &impl PageSource) -> Result<Vec<u8>> {
        match *self {
            ValueRef::Inline(v) => Ok(v.to_vec()),
            ValueRef::Overflow { total_len, head } => {
                let mut out = Vec::with_capacity(total_len as usize);
                let mut cur = head;
                while cur.0 != 0 {
                    let buf = src.page(cur)?;
                    if page::page_type(buf)? != PageType::Overflow {
                        return Err(ZatError::Corrupt("overflow chain links non-overflow page"));
                    }
                    out.extend_from_slice(page::overflow_data(buf)?);
                    cur = page::overflow_next(buf);
                }
                if out.len() != total_len as usize {
                    return Err(ZatError::Corrupt("overflow chain length mismatch"));
                }
                Ok(out)
            }
        }
    }
}

/// Result of rewriting one level of the descent path.
enum Propagate {
    Cow(PageId),
    Split {
        sep: Vec<u8>,
        left: PageId,
        right: PageId,
    },
}

#[derive(Copy, Clone, Debug)]
pub struct Tree {
    root: PageId,
    index_id: IndexId,
    cmp: KeyCmp,
}

/// Largest key a page of `page_size` accepts.
pub fn max_key_len(page_size: usize) -> usize {
    page_size / 16
}

/// Largest value stored inline; anything bigger goes to an overflow chain.
pub fn max_inline_value(page_size: usize) -> usize {
    page_size / 4
}

impl Tree {
    pub fn new(root: PageId, index_id: IndexId, cmp: KeyCmp) -> Self {
        Self {
            root,
            index_id,
            cmp,
        }
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    pub fn cmp(&self) -> KeyCmp {
        self.cmp
    }

    pub fn is_empty(&self) -> bool {
        self.root.0 == 0
    }

    /// Point lookup; reads are total and never mutate.
    pub fn lookup<'a, S: PageSource>(
        &self,
        src: &'a S,
        key: &[u8],
    ) -> Result<Option<ValueRef<'a>>> {
        if self.root.0 == 0 {
            return Ok(None);
        }
        let mut cur = self.root;
        loop {
            let buf = src.page(cur)?;
            match page::page_type(buf)? {
                PageType::Branch => {
                    let (child, _) = page::branch_find_child(buf, key, self.cmp)?;
                    cur = child;
                }
                PageType::Leaf => {
                    return Ok(match page::leaf_find_key(buf, key, self.cmp)? {
                        Some(idx) => {
                            Some(ValueRef::from_slot(page::leaf_entry(buf, idx)?.value))
                        }
                        None => None,
                    });
                }
                _ => return Err(ZatError::Corrupt("tree descent hit non-tree page")),
            }
        }
    }

    pub fn contains<S: PageSource>(&self, src: &S, key: &[u8]) -> Result<bool> {
        Ok(self.lookup(src, key)?.is_some())
    }

    /// Insert `(key, value)`. An existing entry under the same key is
    /// replaced (update semantics).
    pub fn insert(
        &mut self,
        pager: &mut Pager,
        tracker: &mut FreePageTracker,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let ps = pager.page_size();
        if key.is_empty() || key.len() > max_key_len(ps) {
            return Err(ZatError::Invalid("key length out of range for page size"));
        }
        pager.refresh()?;

        let value_slot = if value.len() > max_inline_value(ps) {
            let head = write_overflow_chain(pager, self.index_id, value)?;
            ValueSlot::Overflow {
                total_len: value.len() as u32,
                head,
            }
        } else {
            ValueSlot::Inline(value)
        };

        if self.root.0 == 0 {
            let mut buf = vec![0u8; ps];
            page::init_leaf(&mut buf, self.index_id.as_u8());
            page::leaf_insert_entry(&mut buf, 0, key, value_slot)
                .map_err(|_| ZatError::Invalid("entry does not fit an empty page"))?;
            let id = pager.alloc_page()?;
            pager.write_page(id, &buf)?;
            pager.refresh()?;
            self.root = id;
            return Ok(());
        }

        let (leaf_id, path) = self.descend(pager, key)?;
        let mut leaf_buf = pager.page(leaf_id)?.to_vec();
        if let Some(idx) = page::leaf_find_key(&leaf_buf, key, self.cmp)? {
            if let ValueSlot::Overflow { head, .. } = page::leaf_entry(&leaf_buf, idx)?.value {
                free_overflow_chain(pager, tracker, head)?;
            }
            page::leaf_remove_entry(&mut leaf_buf, idx);
        }
        let slot = page::leaf_search_point(&leaf_buf, key, self.cmp)?;
        let mut state = match page::leaf_insert_entry(&mut leaf_buf, slot, key, value_slot) {
            Ok(()) => {
                let id = pager.alloc_page()?;
                pager.write_page(id, &leaf_buf)?;
                Propagate::Cow(id)
            }
            Err(PageFull) => {
                let mut right_buf = vec![0u8; ps];
                let sep = page::leaf_split(&mut leaf_buf, &mut right_buf, key, self.cmp)?;
                let target = if self.compare(key, &sep) == Ordering::Less {
                    &mut leaf_buf
                } else {
                    &mut right_buf
                };
                let slot = page::leaf_search_point(target, key, self.cmp)?;
                page::leaf_insert_entry(target, slot, key, value_slot)
                    .map_err(|_| ZatError::Corrupt("entry does not fit after split"))?;
                let left_id = pager.alloc_page()?;
                let right_id = pager.alloc_page()?;
                pager.write_page(left_id, &leaf_buf)?;
                pager.write_page(right_id, &right_buf)?;
                trace!(
                    target: "zatdb::btree",
                    index = self.index_id.as_u8(),
                    left = left_id.0,
                    right = right_id.0,
                    "leaf split"
                );
                Propagate::Split {
                    sep,
                    left: left_id,
                    right: right_id,
                }
            }
        };
        tracker.push(leaf_id);

        state = self.propagate(pager, tracker, path, state)?;
        self.finish(pager, state)
    }

    /// Delete `key`. Returns false (with no page writes) when absent; sparse
    /// pages are tolerated, there is no merge-on-underflow.
    pub fn delete(
        &mut self,
        pager: &mut Pager,
        tracker: &mut FreePageTracker,
        key: &[u8],
    ) -> Result<bool> {
        if self.root.0 == 0 {
            return Ok(false);
        }
        pager.refresh()?;
        let (leaf_id, path) = self.descend(pager, key)?;
        let mut leaf_buf = pager.page(leaf_id)?.to_vec();
        let Some(idx) = page::leaf_find_key(&leaf_buf, key, self.cmp)? else {
            return Ok(false);
        };
        if let ValueSlot::Overflow { head, .. } = page::leaf_entry(&leaf_buf, idx)?.value {
            free_overflow_chain(pager, tracker, head)?;
        }
        page::leaf_remove_entry(&mut leaf_buf, idx);
        let id = pager.alloc_page()?;
        pager.write_page(id, &leaf_buf)?;
        tracker.push(leaf_id);

        let state = self.propagate(pager, tracker, path, Propagate::Cow(id))?;
        self.finish(pager, state)?;
        Ok(true)
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.cmp)(a, b)
    }

    /// Walk from the root to the leaf owning `key`, recording the branch
    /// pages and the child slot taken at each.
    fn descend(&self, pager: &Pager, key: &[u8]) -> Result<(PageId, Vec<(PageId, usize)>)> {
        let mut path = Vec::new();
        let mut cur = self.root;
        loop {
            let buf = pager.page(cur)?;
            match page::page_type(buf)? {
                PageType::Branch => {
                    let (child, idx) = page::branch_find_child(buf, key, self.cmp)?;
                    path.push((cur, idx));
                    cur = child;
                }
                PageType::Leaf => return Ok((cur, path)),
                _ => return Err(ZatError::Corrupt("tree descent hit non-tree page")),
            }
        }
    }

    /// Replay the recorded path upward, COWing each touched branch.
    fn propagate(
        &self,
        pager: &mut Pager,
        tracker: &mut FreePageTracker,
        path: Vec<(PageId, usize)>,
        mut state: Propagate,
    ) -> Result<Propagate> {
        for (branch_id, child_idx) in path.into_iter().rev() {
            let mut buf = pager.page(branch_id)?.to_vec();
            state = match state {
                Propagate::Cow(new_child) => {
                    page::branch_set_child(&mut buf, child_idx, new_child)?;
                    let id = pager.alloc_page()?;
                    pager.write_page(id, &buf)?;
                    Propagate::Cow(id)
                }
                Propagate::Split { sep, left, right } => {
                    // The slot we descended through now routes keys >= sep;
                    // the new entry in front of it routes the rest to `left`.
                    page::branch_set_child(&mut buf, child_idx, right)?;
                    match page::branch_insert_entry(&mut buf, child_idx, left, &sep) {
                        Ok(()) => {
                            let id = pager.alloc_page()?;
                            pager.write_page(id, &buf)?;
                            Propagate::Cow(id)
                        }
                        Err(PageFull) => {
                            let mut right_buf = vec![0u8; buf.len()];
                            let promoted =
                                page::branch_split(&mut buf, &mut right_buf, child_idx, left, &sep)?;
                            let left_id = pager.alloc_page()?;
                            let right_id = pager.alloc_page()?;
                            pager.write_page(left_id, &buf)?;
                            pager.write_page(right_id, &right_buf)?;
                            trace!(
                                target: "zatdb::btree",
                                index = self.index_id.as_u8(),
                                left = left_id.0,
                                right = right_id.0,
                                "branch split"
                            );
                            Propagate::Split {
                                sep: promoted,
                                left: left_id,
                                right: right_id,
                            }
                        }
                    }
                }
            };
            tracker.push(branch_id);
        }
        Ok(state)
    }

    /// Install the propagation result as the new root.
    fn finish(&mut self, pager: &mut Pager, state: Propagate) -> Result<()> {
        match state {
            Propagate::Cow(id) => {
                pager.refresh()?;
                self.root = id;
            }
            Propagate::Split { sep, left, right } => {
                let mut buf = vec![0u8; pager.page_size()];
                page::init_branch(&mut buf, self.index_id.as_u8(), right);
                page::branch_insert_entry(&mut buf, 0, left, &sep)
                    .map_err(|_| ZatError::Corrupt("separator does not fit a fresh branch"))?;
                let id = pager.alloc_page()?;
                pager.write_page(id, &buf)?;
                pager.refresh()?;
                trace!(
                    target: "zatdb::btree",
                    index = self.index_id.as_u8(),
                    root = id.0,
                    "tree height grew"
                );
                self.root = id;
            }
        }
        Ok(())
    }

    /// Integrity walk: checks page types, in-page key order, and that every
    /// key lies within the separator bounds inherited from the parent.
    /// Returns the number of leaf entries under the root.
    pub fn verify<S: PageSource>(&self, src: &S) -> Result<usize> {
        if self.root.0 == 0 {
            return Ok(0);
        }
        self.verify_page(src, self.root, None, None)
    }

    fn verify_page<S: PageSource>(
        &self,
        src: &S,
        id: PageId,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> Result<usize> {
        let buf = src.page(id)?;
        let in_bounds = |key: &[u8]| -> bool {
            lo.map_or(true, |lo| self.compare(key, lo) != Ordering::Less)
                && hi.map_or(true, |hi| self.compare(key, hi) == Ordering::Less)
        };
        match page::page_type(buf)? {
            PageType::Leaf => {
                let n = page::num_entries(buf);
                let mut prev: Option<&[u8]> = None;
                for idx in 0..n {
                    let key = page::leaf_key(buf, idx)?;
                    if !in_bounds(key) {
                        return Err(ZatError::Corrupt("leaf key outside separator bounds"));
                    }
                    if let Some(prev) = prev {
                        if self.compare(prev, key) != Ordering::Less {
                            return Err(ZatError::Corrupt("leaf keys out of order"));
                        }
                    }
                    prev = Some(key);
                }
                Ok(n)
            }
            PageType::Branch => {
                let n = page::num_entries(buf);
                if n == 0 {
                    return Err(ZatError::Corrupt("branch without separators"));
                }
                let mut total = 0usize;
                let mut lower = lo;
                for idx in 0..n {
                    let entry = page::branch_entry(buf, idx)?;
                    if !in_bounds(entry.key) {
                        return Err(ZatError::Corrupt("separator outside parent bounds"));
                    }
                    total += self.verify_page(src, entry.child, lower, Some(entry.key))?;
                    lower = Some(entry.key);
                }
                total += self.verify_page(src, page::branch_right_child(buf), lower, hi)?;
                Ok(total)
            }
            _ => Err(ZatError::Corrupt("tree verify hit non-tree page")),
        }
    }
}

/// Write `data` as a forward-linked overflow chain; returns the head page.
fn write_overflow_chain(pager: &mut Pager, index_id: IndexId, data: &[u8]) -> Result<PageId> {
    let ps = pager.page_size();
    let cap = page::overflow_capacity(ps);
    let chunks = data.len().div_ceil(cap).max(1);
    let mut next = PageId(0);
    let mut buf = vec![0u8; ps];
    // Built back-to-front so each page knows its successor.
    for chunk in (0..chunks).rev() {
        let start = chunk * cap;
        let end = (start + cap).min(data.len());
        page::init_overflow(&mut buf, index_id.as_u8(), &data[start..end], next);
        let id = pager.alloc_page()?;
        pager.write_page(id, &buf)?;
        next = id;
    }
    Ok(next)
}

/// Push every page of the chain rooted at `head` onto the tracker.
fn free_overflow_chain(
    pager: &mut Pager,
    tracker: &mut FreePageTracker,
    head: PageId,
) -> Result<()> {
    pager.refresh()?;
    let mut cur = head;
    while cur.0 != 0 {
        let next = {
            let buf = pager.page(cur)?;
            if page::page_type(buf)? != PageType::Overflow {
                return Err(ZatError::Corrupt("overflow chain links non-overflow page"));
            }
            page::overflow_next(buf)
        };
        tracker.push(cur);
        cur = next;
    }
    Ok(())
}

