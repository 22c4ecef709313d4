pub mod core;

pub use crate::core::btree::{BPlusTree, TreeOptions, TreeStats};
pub use crate::core::buffer_pool::{BufferPool, BufferStats, PageStore};
pub use crate::core::errors::{Error, Result};
pub use crate::core::node::{KeyEntry, Node, PageHeader};
pub use crate::core::pager::{Metadata, Pager};
