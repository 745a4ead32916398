//! Stack-based tree iteration.
//!
//! The cursor carries its descent path and re-ascends at leaf boundaries
//! instead of chasing sibling pointers. Pages are immutable after their
//! single write, so a cursor over any historical root range-scans
//! correctly, not just one over the current root.

use std::cmp::Ordering;

use crate::primitives::pager::PageSource;
use crate::storage::btree::tree::{Tree, ValueRef};
use crate::storage::page;
use crate::types::{PageId, PageType, Result, ZatError};

/// One entry yielded by a cursor. Slices borrow the page source and stay
/// valid for the snapshot lifetime.
#[derive(Copy, Clone, Debug)]
pub struct CursorEntry<'a> {
    pub key: &'a [u8],
    pub value: ValueRef<'a>,
}

/// Forward/backward iterator over one tree root.
///
/// The cursor sits between entries: `next` yields the entry at the position
/// and moves right, `prev` yields the entry left of the position and moves
/// left. `prev` does not consult the exhausted flag, so a cursor that ran
/// off the end can immediately walk backwards.
pub struct Cursor<'a, S: PageSource> {
    tree: Tree,
    src: &'a S,
    /// Branch pages on the path to `leaf`, with the child index taken.
    stack: Vec<(PageId, usize)>,
    leaf: Option<&'a [u8]>,
    slot: usize,
    end_key: Option<Vec<u8>>,
    exhausted: bool,
}

impl<'a, S: PageSource> Cursor<'a, S> {
    pub(crate) fn new(tree: Tree, src: &'a S) -> Self {
        Self {
            tree,
            src,
            stack: Vec::new(),
            leaf: None,
            slot: 0,
            end_key: None,
            exhausted: false,
        }
    }

    /// Position at the first entry of the tree.
    pub(crate) fn seek_first(mut self) -> Result<Self> {
        if self.tree.root().0 != 0 {
            self.descend_edge(self.tree.root(), true)?;
        }
        Ok(self)
    }

    /// Position past the last entry; read backwards with [`Cursor::prev`].
    pub(crate) fn seek_last(mut self) -> Result<Self> {
        if self.tree.root().0 != 0 {
            self.descend_edge(self.tree.root(), false)?;
        }
        Ok(self)
    }

    /// Position at the lower bound of `key`.
    pub(crate) fn seek(mut self, key: &[u8]) -> Result<Self> {
        if self.tree.root().0 == 0 {
            return Ok(self);
        }
        let mut cur = self.tree.root();
        loop {
            let buf = self.src.page(cur)?;
            match page::page_type(buf)? {
                PageType::Branch => {
                    let (child, idx) = page::branch_find_child(buf, key, self.tree.cmp())?;
                    self.stack.push((cur, idx));
                    cur = child;
                }
                PageType::Leaf => {
                    self.leaf = Some(buf);
                    self.slot = page::leaf_search_point(buf, key, self.tree.cmp())?;
                    return Ok(self);
                }
                _ => return Err(ZatError::Corrupt("cursor descent hit non-tree page")),
            }
        }
    }

    /// Bound the cursor to the half-open range ending at `end`.
    pub(crate) fn until(mut self, end: &[u8]) -> Self {
        self.end_key = Some(end.to_vec());
        self
    }

    /// Advance forward; `None` once the range or tree is exhausted.
    pub fn next(&mut self) -> Result<Option<CursorEntry<'a>>> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            let Some(leaf) = self.leaf else {
                self.exhausted = true;
                return Ok(None);
            };
            if self.slot < page::num_entries(leaf) {
                let entry = page::leaf_entry(leaf, self.slot)?;
                if let Some(end) = &self.end_key {
                    if self.tree.cmp()(entry.key, end) != Ordering::Less {
                        self.exhausted = true;
                        return Ok(None);
                    }
                }
                self.slot += 1;
                return Ok(Some(CursorEntry {
                    key: entry.key,
                    value: value_ref(entry),
                }));
            }
            if !self.advance_leaf()? {
                self.exhausted = true;
                return Ok(None);
            }
        }
    }

    /// Step backward; `None` at the beginning of the tree.
    pub fn prev(&mut self) -> Result<Option<CursorEntry<'a>>> {
        loop {
            let Some(leaf) = self.leaf else {
                return Ok(None);
            };
            if self.slot > 0 {
                self.slot -= 1;
                self.exhausted = false;
                let entry = page::leaf_entry(leaf, self.slot)?;
                return Ok(Some(CursorEntry {
                    key: entry.key,
                    value: value_ref(entry),
                }));
            }
            if !self.retreat_leaf()? {
                return Ok(None);
            }
        }
    }

    /// Descend to the leftmost (`front == true`) or rightmost leaf under
    /// `from`, extending the stack.
    fn descend_edge(&mut self, from: PageId, front: bool) -> Result<()> {
        let mut cur = from;
        loop {
            let buf = self.src.page(cur)?;
            match page::page_type(buf)? {
                PageType::Branch => {
                    let idx = if front { 0 } else { page::num_entries(buf) };
                    self.stack.push((cur, idx));
                    cur = page::branch_child(buf, idx)?;
                }
                PageType::Leaf => {
                    self.leaf = Some(buf);
                    self.slot = if front { 0 } else { page::num_entries(buf) };
                    return Ok(());
                }
                _ => return Err(ZatError::Corrupt("cursor descent hit non-tree page")),
            }
        }
    }

    /// Re-ascend until a branch has a child to the right of the path, then
    /// descend to the leftmost leaf of that subtree. Leaves the position
    /// untouched when the path is already rightmost.
    fn advance_leaf(&mut self) -> Result<bool> {
        let mut depth = self.stack.len();
        while depth > 0 {
            let (pid, idx) = self.stack[depth - 1];
            let buf = self.src.page(pid)?;
            if idx < page::num_entries(buf) {
                self.stack.truncate(depth);
                self.stack[depth - 1].1 = idx + 1;
                let child = page::branch_child(buf, idx + 1)?;
                self.descend_edge(child, true)?;
                return Ok(true);
            }
            depth -= 1;
        }
        Ok(false)
    }

    /// Mirror of [`Cursor::advance_leaf`], moving one leaf to the left.
    fn retreat_leaf(&mut self) -> Result<bool> {
        let mut depth = self.stack.len();
        while depth > 0 {
            let (pid, idx) = self.stack[depth - 1];
            let buf = self.src.page(pid)?;
            if idx > 0 {
                self.stack.truncate(depth);
                self.stack[depth - 1].1 = idx - 1;
                let child = page::branch_child(buf, idx - 1)?;
                self.descend_edge(child, false)?;
                return Ok(true);
            }
            depth -= 1;
        }
        Ok(false)
    }
}

fn value_ref(entry: page::LeafEntry<'_>) -> ValueRef<'_> {
    match entry.value {
        page::ValueSlot::Inline(v) => ValueRef::Inline(v),
        page::ValueSlot::Overflow { total_len, head } => ValueRef::Overflow { total_len, head },
    }
}

impl Tree {
    /// Cursor positioned at the first entry.
    pub fn cursor_first<'a, S: PageSource>(&self, src: &'a S) -> Result<Cursor<'a, S>> {
        Cursor::new(*self, src).seek_first()
    }

    /// Cursor positioned past the last entry, for reverse scans.
    pub fn cursor_last<'a, S: PageSource>(&self, src: &'a S) -> Result<Cursor<'a, S>> {
        Cursor::new(*self, src).seek_last()
    }

    /// Cursor positioned at the lower bound of `key`.
    pub fn seek<'a, S: PageSource>(&self, src: &'a S, key: &[u8]) -> Result<Cursor<'a, S>> {
        Cursor::new(*self, src).seek(key)
    }

    /// Cursor over the half-open range `[start, end)`.
    pub fn range<'a, S: PageSource>(
        &self,
        src: &'a S,
        start: &[u8],
        end: &[u8],
    ) -> Result<Cursor<'a, S>> {
        Ok(Cursor::new(*self, src).seek(start)?.until(end))
    }
}
