
use crate::core::buffer_pool::{BufferPool, BufferStats};
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::node::{clamp_key, KeyEntry, Node};
use crate::core::pager::Pager;
use fs2::FileExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};

#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// Declared for forward compatibility; must equal `PAGE_SIZE`.
    pub page_size: usize,
    /// Maximum resident pages. 0 falls back to the default, oversized values
    /// are clamped to `MAX_BUFFER_CAPACITY`.
    pub buffer_capacity: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeStats {
    pub height: i32,
    pub node_count: i32,
    pub split_count: i32,
    pub merge_count: i32,
    pub fill_factor: f64,
    pub file_write_count: u64,
}

/// Disk-backed B+ tree: point insert, lookup, and delete over fixed-slot
/// (key, rowId, value) entries, with all page traffic going through the
/// buffer pool.
///
/// Single-threaded by design; the advisory `.lock` file only keeps a second
/// *process* away from the index.
///
/// Nodes are cloned out of the pool, mutated, and written back with
/// `put_dirty` before the next page access; handles never outlive one
/// operation. Descents record their root-to-leaf path, and both the split
/// and the underflow cascade iterate over that path, so control flow never
/// leans on the stored `parent_id` hints.
pub struct BPlusTree {
    pager: Pager,
    buffer: BufferPool,
    _lock_file: File,
    closed: bool,
}

impl BPlusTree {
    pub fn open(path: &str, buffer_capacity: usize) -> Result<Self> {
        Self::open_with_options(
            path,
            TreeOptions {
                buffer_capacity,
                ..Default::default()
            },
        )
    }

    pub fn open_with_options(path: &str, options: TreeOptions) -> Result<Self> {
        if options.page_size != PAGE_SIZE {
            return Err(Error::InvalidPageSize);
        }

        let lock_path = format!("{}.lock", path);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(|e| Error::LockFailed {
                path: lock_path.clone(),
                details: e.to_string(),
            })?;
        lock_file
            .try_lock_exclusive()
            .map_err(|e| Error::LockFailed {
                path: lock_path,
                details: e.to_string(),
            })?;

        let pager = Pager::open(path)?;
        let buffer = BufferPool::new(options.buffer_capacity);

        Ok(Self {
            pager,
            buffer,
            _lock_file: lock_file,
            closed: false,
        })
    }

    /// Flush every dirty page, persist the metadata, and release the file.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.buffer.flush_all(&mut self.pager)?;
        self.pager.save_metadata();
        self.closed = true;
        Ok(())
    }

    /// Insert a (key, value, rowId) triple. An existing key is overwritten
    /// in place. Returns false only when a defensive guard aborted the
    /// operation.
    pub fn insert(&mut self, key: &str, value: &str, row_id: &str) -> Result<bool> {
        let entry = KeyEntry::new(key, row_id, value);

        if self.pager.meta.root_page_id == NO_PAGE {
            let mut root = self.pager.allocate(true)?;
            root.insert_entry(entry, None);
            let root_id = root.header.page_id;
            self.buffer.put_dirty(root_id, root, &mut self.pager)?;
            self.pager.meta.root_page_id = root_id;
            self.pager.save_metadata();
            return Ok(true);
        }

        let query = clamp_key(key);
        let (mut leaf, path) = match self.find_leaf(query)? {
            Some(found) => found,
            None => return Ok(false),
        };

        let pos = leaf.find_key(query);
        if pos < leaf.key_count() && leaf.entries[pos].key_bytes() == query {
            leaf.entries[pos] = entry;
            leaf.dirty = true;
            let leaf_id = leaf.header.page_id;
            self.buffer.put_dirty(leaf_id, leaf, &mut self.pager)?;
            return Ok(true);
        }

        leaf.insert_entry(entry, None);
        if leaf.is_overfull() {
            self.handle_overflow(leaf, path)?;
        } else {
            let leaf_id = leaf.header.page_id;
            self.buffer.put_dirty(leaf_id, leaf, &mut self.pager)?;
        }

        Ok(true)
    }

    /// Every matching entry's value in the target leaf. At most one entry
    /// matches today (inserts overwrite), but the shape leaves room for
    /// duplicate support.
    pub fn get(&mut self, key: &str) -> Result<Vec<Vec<String>>> {
        let query = clamp_key(key);
        let mut result = Vec::new();

        let (leaf, _path) = match self.find_leaf(query)? {
            Some(found) => found,
            None => return Ok(result),
        };

        for entry in &leaf.entries {
            if entry.key_bytes() == query {
                result.push(vec![entry.value()]);
            }
        }

        Ok(result)
    }

    /// Delete a key; false if it was absent.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        let query = clamp_key(key);
        let (mut leaf, path) = match self.find_leaf(query)? {
            Some(found) => found,
            None => return Ok(false),
        };

        let pos = leaf.find_key(query);
        if pos >= leaf.key_count() || leaf.entries[pos].key_bytes() != query {
            return Ok(false);
        }

        leaf.remove_entry(pos);
        let leaf_id = leaf.header.page_id;
        self.buffer.put_dirty(leaf_id, leaf.clone(), &mut self.pager)?;

        if leaf_id != self.pager.meta.root_page_id && leaf.key_count() < leaf.min_keys() {
            self.handle_underflow(leaf, path)?;
        }

        Ok(true)
    }

    pub fn stats(&mut self) -> Result<TreeStats> {
        if self.pager.meta.root_page_id == NO_PAGE {
            return Ok(TreeStats::default());
        }

        Ok(TreeStats {
            height: self.calculate_height()?,
            node_count: self.pager.meta.page_count,
            split_count: self.pager.meta.split_count,
            merge_count: self.pager.meta.merge_count,
            fill_factor: self.calculate_fill_factor()?,
            file_write_count: self.pager.write_count(),
        })
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Swap in a pool of the new size. Dirty pages are flushed first; the
    /// hit/miss counters start over.
    pub fn set_buffer_capacity(&mut self, capacity: usize) -> Result<()> {
        self.buffer.flush_all(&mut self.pager)?;
        self.buffer = BufferPool::new(capacity);
        Ok(())
    }

    /// Force every dirty page to disk; returns how many were written.
    pub fn flush_buffer(&mut self) -> Result<usize> {
        self.buffer.flush_all(&mut self.pager)
    }

    pub fn root_page_id(&self) -> PageId {
        self.pager.meta.root_page_id
    }

    pub fn next_page_id(&self) -> PageId {
        self.pager.meta.next_page_id
    }

    /// Descend from the root to the leaf owning `key`, recording the page
    /// ids along the way. The path is what the overflow and underflow
    /// cascades climb back up.
    fn find_leaf(&mut self, key: &[u8]) -> Result<Option<(Node, Vec<PageId>)>> {
        let root_id = self.pager.meta.root_page_id;
        if root_id == NO_PAGE {
            return Ok(None);
        }

        let mut current = match self.buffer.get(root_id, &mut self.pager)? {
            Some(node) => node,
            None => return Ok(None),
        };
        let mut path = vec![root_id];

        while !current.header.is_leaf {
            let mut pos = current.find_key(key);
            // an exact separator match routes right: the separator is the
            // smallest key of the right subtree
            if pos < current.key_count() && current.entries[pos].key_bytes() == key {
                pos += 1;
            }
            if current.children.is_empty() || pos >= current.children.len() {
                return Ok(None);
            }
            let child_id = current.children[pos];
            if child_id == NO_PAGE {
                return Ok(None);
            }
            current = match self.buffer.get(child_id, &mut self.pager)? {
                Some(node) => node,
                None => return Ok(None),
            };
            path.push(child_id);
        }

        Ok(Some((current, path)))
    }

    /// Split cascade. Each round splits one overfull node, hands the
    /// separator to the parent, and continues with the parent if the insert
    /// overfilled it in turn.
    fn handle_overflow(&mut self, mut node: Node, path: Vec<PageId>) -> Result<()> {
        let mut depth = path.len().saturating_sub(1);

        while node.is_overfull() {
            let mut sibling = self.pager.allocate(node.header.is_leaf)?;
            let promoted = node.split(&mut sibling);
            self.pager.meta.split_count += 1;

            // children handed to the new sibling point to it now
            if !sibling.header.is_leaf {
                let sibling_id = sibling.header.page_id;
                let moved: Vec<PageId> = sibling.children.clone();
                for child_id in moved {
                    if child_id == NO_PAGE {
                        continue;
                    }
                    if let Some(mut child) = self.buffer.get(child_id, &mut self.pager)? {
                        child.header.parent_id = sibling_id;
                        child.dirty = true;
                        self.buffer.put_dirty(child_id, child, &mut self.pager)?;
                    }
                }
            }

            if depth == 0 {
                // the root split: both halves hang under a fresh root
                let mut new_root = self.pager.allocate(false)?;
                let new_root_id = new_root.header.page_id;
                new_root.children.push(node.header.page_id);
                new_root.children.push(sibling.header.page_id);
                new_root.entries.push(promoted);
                new_root.header.key_count = 1;

                node.header.parent_id = new_root_id;
                sibling.header.parent_id = new_root_id;

                let node_id = node.header.page_id;
                let sibling_id = sibling.header.page_id;
                self.buffer.put_dirty(node_id, node, &mut self.pager)?;
                self.buffer.put_dirty(sibling_id, sibling, &mut self.pager)?;
                self.buffer.put_dirty(new_root_id, new_root, &mut self.pager)?;

                self.pager.meta.root_page_id = new_root_id;
                self.pager.save_metadata();
                return Ok(());
            }

            depth -= 1;
            let parent_id = path[depth];
            sibling.header.parent_id = parent_id;

            let node_id = node.header.page_id;
            let sibling_id = sibling.header.page_id;
            self.buffer.put_dirty(node_id, node, &mut self.pager)?;
            self.buffer.put_dirty(sibling_id, sibling, &mut self.pager)?;

            let mut parent = match self.buffer.get(parent_id, &mut self.pager)? {
                Some(parent) => parent,
                None => {
                    log::error!("missing parent page {} during split", parent_id);
                    return Ok(());
                }
            };
            parent.insert_entry(promoted, Some(sibling_id));
            self.buffer
                .put_dirty(parent_id, parent.clone(), &mut self.pager)?;
            node = parent;
        }

        Ok(())
    }

    /// Underflow cascade: borrow from a sibling that can spare a key,
    /// merge otherwise, and repeat on the parent when the merge leaves it
    /// short. The root is exempt from the minimum; an internal root that
    /// runs out of separators collapses into its only child.
    fn handle_underflow(&mut self, start: Node, path: Vec<PageId>) -> Result<()> {
        let mut node = start;
        let mut depth = path.len().saturating_sub(1);

        loop {
            if node.key_count() >= node.min_keys() {
                return Ok(());
            }

            if depth == 0 {
                if !node.header.is_leaf && node.key_count() == 0 {
                    let child_id = node.children.first().copied().unwrap_or(NO_PAGE);
                    if child_id != NO_PAGE {
                        if let Some(mut child) = self.buffer.get(child_id, &mut self.pager)? {
                            child.header.parent_id = NO_PAGE;
                            child.dirty = true;
                            self.buffer.put_dirty(child_id, child, &mut self.pager)?;
                        }
                        self.pager.meta.root_page_id = child_id;
                        self.pager.meta.page_count -= 1;
                        self.pager.save_metadata();
                    }
                }
                return Ok(());
            }

            let parent_id = path[depth - 1];
            let mut parent = match self.buffer.get(parent_id, &mut self.pager)? {
                Some(parent) => parent,
                None => return Ok(()),
            };

            let node_index = match parent
                .children
                .iter()
                .position(|&child| child == node.header.page_id)
            {
                Some(index) => index,
                None => {
                    log::warn!(
                        "page {} not found under parent {}; skipping underflow repair",
                        node.header.page_id,
                        parent_id
                    );
                    return Ok(());
                }
            };

            // borrow from the left sibling when it can spare a key
            if node_index > 0 {
                let left_id = parent.children[node_index - 1];
                if let Some(mut left) = self.buffer.get(left_id, &mut self.pager)? {
                    if left.key_count() > left.min_keys() {
                        self.redistribute_from_left(
                            &mut node,
                            &mut left,
                            &mut parent,
                            node_index - 1,
                        )?;
                        let node_id = node.header.page_id;
                        self.buffer.put_dirty(node_id, node, &mut self.pager)?;
                        self.buffer.put_dirty(left_id, left, &mut self.pager)?;
                        self.buffer.put_dirty(parent_id, parent, &mut self.pager)?;
                        return Ok(());
                    }
                }
            }

            // then from the right
            if node_index + 1 < parent.children.len() {
                let right_id = parent.children[node_index + 1];
                if let Some(mut right) = self.buffer.get(right_id, &mut self.pager)? {
                    if right.key_count() > right.min_keys() {
                        self.redistribute_from_right(
                            &mut node,
                            &mut right,
                            &mut parent,
                            node_index,
                        )?;
                        let node_id = node.header.page_id;
                        self.buffer.put_dirty(node_id, node, &mut self.pager)?;
                        self.buffer.put_dirty(right_id, right, &mut self.pager)?;
                        self.buffer.put_dirty(parent_id, parent, &mut self.pager)?;
                        return Ok(());
                    }
                }
            }

            // no sibling can spare a key: merge, preferring the left one
            let merged = if node_index > 0 {
                let left_id = parent.children[node_index - 1];
                match self.buffer.get(left_id, &mut self.pager)? {
                    Some(mut left) => {
                        self.merge_nodes(&mut left, &node, &mut parent, node_index - 1)?;
                        self.buffer.put_dirty(left_id, left, &mut self.pager)?;
                        true
                    }
                    None => false,
                }
            } else if node_index + 1 < parent.children.len() {
                let right_id = parent.children[node_index + 1];
                match self.buffer.get(right_id, &mut self.pager)? {
                    Some(right) => {
                        self.merge_nodes(&mut node, &right, &mut parent, node_index)?;
                        let node_id = node.header.page_id;
                        self.buffer
                            .put_dirty(node_id, node.clone(), &mut self.pager)?;
                        true
                    }
                    None => false,
                }
            } else {
                false
            };

            if !merged {
                return Ok(());
            }

            self.pager.meta.page_count -= 1;
            self.pager.meta.merge_count += 1;
            self.buffer
                .put_dirty(parent_id, parent.clone(), &mut self.pager)?;

            // the parent lost a separator and may now be short itself
            node = parent;
            depth -= 1;
        }
    }

    fn redistribute_from_left(
        &mut self,
        node: &mut Node,
        left: &mut Node,
        parent: &mut Node,
        separator_index: usize,
    ) -> Result<()> {
        if node.header.is_leaf {
            if let Some(entry) = left.entries.pop() {
                node.entries.insert(0, entry);
            }
            // the separator becomes the right-hand node's new first key
            if let Some(first) = node.entries.first().copied() {
                parent.entries[separator_index] = first;
            }
        } else {
            // the separator descends; the donor's last key ascends
            node.entries.insert(0, parent.entries[separator_index]);
            if let Some(entry) = left.entries.pop() {
                parent.entries[separator_index] = entry;
            }
            if let Some(child_id) = left.children.pop() {
                node.children.insert(0, child_id);
                self.reparent(child_id, node.header.page_id)?;
            }
        }

        left.header.key_count = left.entries.len() as i32;
        node.header.key_count = node.entries.len() as i32;
        node.dirty = true;
        left.dirty = true;
        parent.dirty = true;
        Ok(())
    }

    fn redistribute_from_right(
        &mut self,
        node: &mut Node,
        right: &mut Node,
        parent: &mut Node,
        separator_index: usize,
    ) -> Result<()> {
        if node.header.is_leaf {
            if !right.entries.is_empty() {
                node.entries.push(right.entries.remove(0));
            }
            if let Some(first) = right.entries.first().copied() {
                parent.entries[separator_index] = first;
            }
        } else {
            node.entries.push(parent.entries[separator_index]);
            if !right.entries.is_empty() {
                parent.entries[separator_index] = right.entries.remove(0);
            }
            if !right.children.is_empty() {
                let child_id = right.children.remove(0);
                node.children.push(child_id);
                self.reparent(child_id, node.header.page_id)?;
            }
        }

        right.header.key_count = right.entries.len() as i32;
        node.header.key_count = node.entries.len() as i32;
        node.dirty = true;
        right.dirty = true;
        parent.dirty = true;
        Ok(())
    }

    /// Fold `right` into `left` and drop the separating key (and the child
    /// pointer to `right`) from the parent.
    fn merge_nodes(
        &mut self,
        left: &mut Node,
        right: &Node,
        parent: &mut Node,
        separator_index: usize,
    ) -> Result<()> {
        if left.header.is_leaf {
            left.entries.extend(right.entries.iter().copied());
            left.header.next_leaf_id = right.header.next_leaf_id;
        } else {
            // the separator descends between the two halves
            left.entries.push(parent.entries[separator_index]);
            left.entries.extend(right.entries.iter().copied());

            let left_id = left.header.page_id;
            for &child_id in &right.children {
                left.children.push(child_id);
                self.reparent(child_id, left_id)?;
            }
        }

        left.header.key_count = left.entries.len() as i32;
        left.dirty = true;
        parent.remove_entry(separator_index);
        Ok(())
    }

    fn reparent(&mut self, child_id: PageId, parent_id: PageId) -> Result<()> {
        if child_id == NO_PAGE {
            return Ok(());
        }
        if let Some(mut child) = self.buffer.get(child_id, &mut self.pager)? {
            child.header.parent_id = parent_id;
            child.dirty = true;
            self.buffer.put_dirty(child_id, child, &mut self.pager)?;
        }
        Ok(())
    }

    /// Height of the tree, walking the leftmost spine from the root.
    fn calculate_height(&mut self) -> Result<i32> {
        let mut current = match self
            .buffer
            .get(self.pager.meta.root_page_id, &mut self.pager)?
        {
            Some(node) => node,
            None => return Ok(0),
        };

        let mut height = 0;
        while !current.header.is_leaf {
            height += 1;
            let child_id = current.children.first().copied().unwrap_or(NO_PAGE);
            if child_id == NO_PAGE {
                break;
            }
            current = match self.buffer.get(child_id, &mut self.pager)? {
                Some(node) => node,
                None => break,
            };
        }

        Ok(height + 1)
    }

    /// Breadth-first sum of key counts over visited capacity.
    fn calculate_fill_factor(&mut self) -> Result<f64> {
        if self.pager.meta.page_count == 0 || self.pager.meta.root_page_id == NO_PAGE {
            return Ok(0.0);
        }

        let mut total_keys = 0usize;
        let mut total_capacity = 0usize;
        let mut queue = VecDeque::new();
        queue.push_back(self.pager.meta.root_page_id);

        while let Some(page_id) = queue.pop_front() {
            let node = match self.buffer.get(page_id, &mut self.pager)? {
                Some(node) => node,
                None => continue,
            };

            total_keys += node.key_count();
            total_capacity += MAX_KEYS_PER_PAGE;

            if !node.header.is_leaf {
                for &child_id in &node.children {
                    if child_id != NO_PAGE {
                        queue.push_back(child_id);
                    }
                }
            }
        }

        if total_capacity > 0 {
            Ok(total_keys as f64 / total_capacity as f64)
        } else {
            Ok(0.0)
        }
    }
}

impl Drop for BPlusTree {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_inner() {
                log::error!("failed to flush index on drop: {}", e);
            }
        }
    }
}
