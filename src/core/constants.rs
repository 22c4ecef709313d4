
pub const PAGE_SIZE: usize = 4096;

/// Reserved prefix of the index file holding the tree metadata record.
pub const METADATA_SIZE: usize = 16384;

pub const KEY_SIZE: usize = 64;
pub const ROW_ID_SIZE: usize = 32;
pub const VALUE_SIZE: usize = 128;

/// Slot reserved for the encoded page header. The header itself encodes to
/// 20 bytes; entries start at this offset so the layout stays stable if the
/// header grows.
pub const PAGE_HEADER_SIZE: usize = 64;

pub const KEY_ENTRY_SIZE: usize = KEY_SIZE + ROW_ID_SIZE + VALUE_SIZE;

pub const PAGE_ID_SIZE: usize = std::mem::size_of::<PageId>();

pub const MAX_KEYS_PER_PAGE: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / KEY_ENTRY_SIZE;

/// Internal pages also persist `key_count + 1` child ids, which caps them one
/// key below the leaf fanout so the child array always fits in the page.
pub const MAX_INTERNAL_KEYS: usize =
    (PAGE_SIZE - PAGE_HEADER_SIZE - PAGE_ID_SIZE) / (KEY_ENTRY_SIZE + PAGE_ID_SIZE);

pub const MIN_KEYS: usize = MAX_KEYS_PER_PAGE / 2;

pub const MIN_INTERNAL_KEYS: usize = MAX_INTERNAL_KEYS / 2;

pub const DEFAULT_BUFFER_CAPACITY: usize = 100;

pub const MAX_BUFFER_CAPACITY: usize = 1000;

/// Allocator guard against runaway or corrupted page counters.
pub const MAX_PAGE_ID: PageId = 10_000_000;

/// Sentinel for "no page": absent parent, end of the leaf chain, empty child slot.
pub const NO_PAGE: PageId = -1;

pub type PageId = i32;
