
use crate::core::buffer_pool::PageStore;
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::node::Node;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Tree metadata persisted in the reserved prefix of the file: five
/// little-endian i32 fields in declaration order, zero-padded to
/// `METADATA_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub root_page_id: PageId,
    pub next_page_id: PageId,
    pub page_count: i32,
    pub split_count: i32,
    pub merge_count: i32,
}

impl Metadata {
    pub fn new() -> Self {
        Self {
            root_page_id: NO_PAGE,
            next_page_id: 1,
            page_count: 0,
            split_count: 0,
            merge_count: 0,
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8; METADATA_SIZE];
        let mut offset = 0;

        buf[offset..offset + 4].copy_from_slice(&self.root_page_id.to_le_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.next_page_id.to_le_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.page_count.to_le_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.split_count.to_le_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.merge_count.to_le_bytes());

        buf
    }

    fn deserialize(data: &[u8]) -> Self {
        let mut fields = [0i32; 5];
        for (i, field) in fields.iter_mut().enumerate() {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[i * 4..i * 4 + 4]);
            *field = i32::from_le_bytes(bytes);
        }

        Self {
            root_page_id: fields[0],
            next_page_id: fields[1],
            page_count: fields[2],
            split_count: fields[3],
            merge_count: fields[4],
        }
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the backing file and the page allocator. Page `i` lives at file
/// offset `METADATA_SIZE + i * PAGE_SIZE`; ids are dense and start at 1.
///
/// Per-page I/O failures degrade instead of propagating: a failed or short
/// read yields an empty clean page, a failed write is logged and dropped.
/// One bad page must not tear down the process.
pub struct Pager {
    file: File,
    pub meta: Metadata,
    write_count: u64,
    scratch: Vec<u8>,
}

impl Pager {
    pub fn open(path: &str) -> Result<Self> {
        let exists = Path::new(path).exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::OpenFailed {
                path: path.to_string(),
                details: e.to_string(),
            })?;

        let mut pager = Self {
            file,
            meta: Metadata::new(),
            write_count: 0,
            scratch: vec![0u8; PAGE_SIZE],
        };

        if exists {
            pager.load_metadata();
        } else {
            pager.save_metadata();
        }

        Ok(pager)
    }

    pub fn load_metadata(&mut self) {
        if let Err(e) = self.file.seek(SeekFrom::Start(0)) {
            log::error!("failed to seek to metadata: {}", e);
            self.meta = Metadata::new();
            return;
        }

        let mut buf = vec![0u8; METADATA_SIZE];
        if let Err(e) = self.file.read_exact(&mut buf) {
            log::warn!("failed to read metadata, reinitializing: {}", e);
            self.meta = Metadata::new();
            return;
        }

        let meta = Metadata::deserialize(&buf);
        if meta.next_page_id < 0 || meta.page_count < 0 {
            log::warn!(
                "invalid metadata (next_page_id={}, page_count={}), reinitializing",
                meta.next_page_id,
                meta.page_count
            );
            self.meta = Metadata::new();
            return;
        }

        self.meta = meta;
    }

    pub fn save_metadata(&mut self) {
        let data = self.meta.serialize();

        if let Err(e) = self.file.seek(SeekFrom::Start(0)) {
            log::error!("failed to seek to metadata: {}", e);
            return;
        }
        if let Err(e) = self.file.write_all(&data) {
            log::error!("failed to write metadata: {}", e);
            return;
        }
        if let Err(e) = self.file.sync_all() {
            log::error!("failed to sync metadata: {}", e);
        }
    }

    /// Read and decode one page. A read past the end of the file yields an
    /// empty clean leaf: allocated-but-unwritten pages are zero-filled.
    pub fn load(&mut self, page_id: PageId) -> Result<Node> {
        if page_id < 0 {
            return Err(Error::InvalidPageId(page_id));
        }

        let offset = METADATA_SIZE as u64 + page_id as u64 * PAGE_SIZE as u64;
        if let Err(e) = self.file.seek(SeekFrom::Start(offset)) {
            log::warn!("failed to seek to page {}: {}", page_id, e);
            return Ok(Node::new_leaf(page_id));
        }

        self.scratch.fill(0);
        let mut total = 0;
        while total < PAGE_SIZE {
            match self.file.read(&mut self.scratch[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("failed to read page {}: {}", page_id, e);
                    return Ok(Node::new_leaf(page_id));
                }
            }
        }

        if total < PAGE_SIZE {
            if total > 0 {
                log::debug!("partial read of page {}: {} bytes", page_id, total);
            }
            return Ok(Node::new_leaf(page_id));
        }

        match Node::deserialize(page_id, &self.scratch) {
            Ok(node) => Ok(node),
            Err(e) => {
                log::warn!("discarding unreadable page {}: {}", page_id, e);
                Ok(Node::new_leaf(page_id))
            }
        }
    }

    /// Write a page back if it is dirty. Invalid ids and I/O failures are
    /// logged no-ops.
    pub fn save(&mut self, node: &mut Node) {
        if !node.dirty {
            return;
        }

        let page_id = node.header.page_id;
        if page_id < 0 || page_id > MAX_PAGE_ID {
            log::error!("refusing to save page with invalid id {}", page_id);
            return;
        }

        node.serialize(&mut self.scratch);

        let offset = METADATA_SIZE as u64 + page_id as u64 * PAGE_SIZE as u64;
        if let Err(e) = self.file.seek(SeekFrom::Start(offset)) {
            log::error!("failed to seek to page {}: {}", page_id, e);
            return;
        }
        if let Err(e) = self.file.write_all(&self.scratch) {
            log::error!("failed to write page {}: {}", page_id, e);
            return;
        }
        if let Err(e) = self.file.flush() {
            log::error!("failed to flush page {}: {}", page_id, e);
            return;
        }

        node.dirty = false;
        self.write_count += 1;
    }

    /// Hand out the next page id and a fresh dirty node for it.
    pub fn allocate(&mut self, is_leaf: bool) -> Result<Node> {
        let page_id = self.meta.next_page_id;
        if page_id < 0 || page_id > MAX_PAGE_ID {
            log::error!("page id allocator out of range: {}", page_id);
            return Err(Error::InvalidPageId(page_id));
        }

        self.meta.next_page_id += 1;
        self.meta.page_count += 1;

        let mut node = if is_leaf {
            Node::new_leaf(page_id)
        } else {
            Node::new_internal(page_id)
        };
        node.dirty = true;
        Ok(node)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count
    }
}

impl PageStore for Pager {
    fn load_page(&mut self, page_id: PageId) -> Result<Node> {
        self.load(page_id)
    }

    fn save_page(&mut self, node: &mut Node) -> Result<()> {
        self.save(node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::KeyEntry;
    use std::fs;

    #[test]
    fn test_metadata_roundtrip() {
        let meta = Metadata {
            root_page_id: 7,
            next_page_id: 42,
            page_count: 12,
            split_count: 5,
            merge_count: 2,
        };

        let data = meta.serialize();
        assert_eq!(data.len(), METADATA_SIZE);
        assert_eq!(Metadata::deserialize(&data), meta);
    }

    #[test]
    fn test_fresh_pager() {
        let path = "/tmp/test_pager_fresh.db";
        let _ = fs::remove_file(path);

        let mut pager = Pager::open(path).unwrap();
        assert_eq!(pager.meta.root_page_id, NO_PAGE);
        assert_eq!(pager.meta.next_page_id, 1);
        assert_eq!(pager.meta.page_count, 0);

        let node = pager.allocate(true).unwrap();
        assert_eq!(node.header.page_id, 1);
        assert!(node.dirty);
        assert_eq!(pager.meta.next_page_id, 2);
        assert_eq!(pager.meta.page_count, 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_page_save_and_load() {
        let path = "/tmp/test_pager_roundtrip.db";
        let _ = fs::remove_file(path);

        let mut pager = Pager::open(path).unwrap();
        let mut node = pager.allocate(true).unwrap();
        node.insert_entry(KeyEntry::new("apple", "r0", "red fruit"), None);

        pager.save(&mut node);
        assert!(!node.dirty);
        assert_eq!(pager.write_count(), 1);

        let loaded = pager.load(node.header.page_id).unwrap();
        assert_eq!(loaded, node);
        assert_eq!(loaded.entries[0].value(), "red fruit");

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_save_skips_clean_pages() {
        let path = "/tmp/test_pager_clean_skip.db";
        let _ = fs::remove_file(path);

        let mut pager = Pager::open(path).unwrap();
        let mut node = pager.allocate(true).unwrap();
        pager.save(&mut node);
        pager.save(&mut node);
        assert_eq!(pager.write_count(), 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_load_unwritten_page_is_empty() {
        let path = "/tmp/test_pager_unwritten.db";
        let _ = fs::remove_file(path);

        let mut pager = Pager::open(path).unwrap();
        let node = pager.allocate(true).unwrap();

        // allocated but never saved: reads as an empty clean leaf
        let loaded = pager.load(node.header.page_id).unwrap();
        assert!(loaded.header.is_leaf);
        assert_eq!(loaded.key_count(), 0);
        assert!(!loaded.dirty);

        assert!(pager.load(-1).is_err());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_metadata_persists_across_reopen() {
        let path = "/tmp/test_pager_reopen.db";
        let _ = fs::remove_file(path);

        {
            let mut pager = Pager::open(path).unwrap();
            pager.allocate(true).unwrap();
            pager.allocate(true).unwrap();
            pager.meta.root_page_id = 1;
            pager.meta.split_count = 3;
            pager.save_metadata();
        }

        let pager = Pager::open(path).unwrap();
        assert_eq!(pager.meta.root_page_id, 1);
        assert_eq!(pager.meta.next_page_id, 3);
        assert_eq!(pager.meta.page_count, 2);
        assert_eq!(pager.meta.split_count, 3);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_invalid_metadata_reinitialized() {
        let path = "/tmp/test_pager_bad_meta.db";
        let _ = fs::remove_file(path);

        {
            let mut pager = Pager::open(path).unwrap();
            pager.meta.next_page_id = -5;
            pager.save_metadata();
        }

        let pager = Pager::open(path).unwrap();
        assert_eq!(pager.meta.next_page_id, 1);
        assert_eq!(pager.meta.root_page_id, NO_PAGE);

        let _ = fs::remove_file(path);
    }
}
