//! Pager primitives: meta-slot protocol and the page file manager.

pub mod meta;
#[allow(clippy::module_inception)]
mod pager;

pub use meta::{Meta, META_LEN};
pub use pager::{AllocCheckpoint, PageSource, Pager, PagerOptions, PagerView};
