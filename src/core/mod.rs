pub mod btree;
pub mod buffer_pool;
pub mod constants;
pub mod errors;
pub mod node;
pub mod pager;

pub use self::btree::{BPlusTree, TreeOptions, TreeStats};
pub use self::buffer_pool::{BufferPool, BufferStats, PageStore};
pub use self::constants::*;
pub use self::errors::{Error, Result};
pub use self::node::{KeyEntry, Node, PageHeader};
pub use self::pager::{Metadata, Pager};
