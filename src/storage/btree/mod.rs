//! Copy-on-write B+ tree: tree operations and stack-based cursors.

mod cursor;
mod tree;

pub use cursor::{Cursor, CursorEntry};
pub use tree::{max_inline_value, max_key_len, Tree, ValueRef};
