
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::node::Node;
use serde::Serialize;
use std::collections::HashMap;

/// Backing store the pool loads misses from and writes dirty frames back to.
/// The pager implements this; tests substitute an in-memory store.
pub trait PageStore {
    fn load_page(&mut self, page_id: PageId) -> Result<Node>;
    fn save_page(&mut self, node: &mut Node) -> Result<()>;
}

struct Frame {
    node: Node,
    dirty: bool,
    pinned: bool,
    prev: Option<usize>, // toward the MRU end
    next: Option<usize>, // toward the LRU end
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStats {
    pub total_pages: usize,
    pub dirty_pages: usize,
    pub pinned_pages: usize,
    pub max_size: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_ratio: f64,
}

/// Fixed-capacity cache of decoded pages with LRU eviction.
///
/// Eviction is two-phase: clean unpinned frames go first (no I/O), then the
/// least recent dirty unpinned frame is written back and dropped. If every
/// frame is pinned the capacity bound is soft: the pool logs a warning and
/// grows past it rather than losing the incoming page.
pub struct BufferPool {
    capacity: usize,
    map: HashMap<PageId, usize>, // page id -> slot in `frames`
    frames: Vec<Option<Frame>>,
    head: Option<usize>, // most recently used
    tail: Option<usize>, // least recently used
    free_slots: Vec<usize>,
    hits: u64,
    misses: u64,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_BUFFER_CAPACITY
        } else {
            capacity.min(MAX_BUFFER_CAPACITY)
        };

        Self {
            capacity,
            map: HashMap::new(),
            frames: Vec::new(),
            head: None,
            tail: None,
            free_slots: Vec::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Fetch a page, loading it through `store` on a miss. A negative id is
    /// never resident and never loaded.
    pub fn get(
        &mut self,
        page_id: PageId,
        store: &mut impl PageStore,
    ) -> Result<Option<Node>> {
        if page_id < 0 {
            return Ok(None);
        }

        if let Some(&idx) = self.map.get(&page_id) {
            self.hits += 1;
            self.move_to_front(idx);
            if let Some(frame) = &self.frames[idx] {
                return Ok(Some(frame.node.clone()));
            }
            return Ok(None);
        }

        self.misses += 1;
        let node = store.load_page(page_id)?;
        self.put_with(page_id, node.clone(), false, store)?;
        Ok(Some(node))
    }

    pub fn put(
        &mut self,
        page_id: PageId,
        node: Node,
        store: &mut impl PageStore,
    ) -> Result<()> {
        self.put_with(page_id, node, false, store)
    }

    /// Insert and mark dirty in one step, so the frame can never be observed
    /// resident but not yet dirty.
    pub fn put_dirty(
        &mut self,
        page_id: PageId,
        node: Node,
        store: &mut impl PageStore,
    ) -> Result<()> {
        self.put_with(page_id, node, true, store)
    }

    fn put_with(
        &mut self,
        page_id: PageId,
        mut node: Node,
        dirty: bool,
        store: &mut impl PageStore,
    ) -> Result<()> {
        let dirty = dirty || node.dirty;
        if dirty {
            node.dirty = true;
        }

        if let Some(&idx) = self.map.get(&page_id) {
            if let Some(frame) = self.frames[idx].as_mut() {
                // an unflushed frame stays dirty even when the replacement
                // image arrived through a plain put
                let was_dirty = frame.dirty;
                frame.node = node;
                frame.dirty = was_dirty || dirty;
                frame.node.dirty = frame.dirty;
            }
            self.move_to_front(idx);
            return Ok(());
        }

        while self.map.len() >= self.capacity {
            if !self.evict_one(store)? {
                log::warn!(
                    "buffer pool full ({} pages) and every frame is pinned; exceeding capacity",
                    self.map.len()
                );
                break;
            }
        }

        let idx = self.alloc_slot(Frame {
            node,
            dirty,
            pinned: false,
            prev: None,
            next: None,
        });
        self.map.insert(page_id, idx);
        self.push_front(idx);
        Ok(())
    }

    pub fn mark_dirty(&mut self, page_id: PageId) {
        if let Some(&idx) = self.map.get(&page_id) {
            if let Some(frame) = self.frames[idx].as_mut() {
                frame.dirty = true;
                frame.node.dirty = true;
            }
            self.move_to_front(idx);
        }
    }

    pub fn pin(&mut self, page_id: PageId) {
        if let Some(&idx) = self.map.get(&page_id) {
            if let Some(frame) = self.frames[idx].as_mut() {
                frame.pinned = true;
            }
            self.move_to_front(idx);
        }
    }

    pub fn unpin(&mut self, page_id: PageId) {
        if let Some(&idx) = self.map.get(&page_id) {
            if let Some(frame) = self.frames[idx].as_mut() {
                frame.pinned = false;
            }
        }
    }

    /// Write one page back if it is resident and dirty. Clean and absent
    /// pages count as flushed.
    pub fn flush_page(
        &mut self,
        page_id: PageId,
        store: &mut impl PageStore,
    ) -> Result<bool> {
        if let Some(&idx) = self.map.get(&page_id) {
            if let Some(frame) = self.frames[idx].as_mut() {
                if frame.dirty {
                    store.save_page(&mut frame.node)?;
                    frame.dirty = false;
                }
            }
        }
        Ok(true)
    }

    /// Write every dirty frame back; returns how many were flushed.
    pub fn flush_all(&mut self, store: &mut impl PageStore) -> Result<usize> {
        let mut flushed = 0;
        for slot in self.frames.iter_mut() {
            if let Some(frame) = slot {
                if frame.dirty {
                    store.save_page(&mut frame.node)?;
                    frame.dirty = false;
                    flushed += 1;
                }
            }
        }
        Ok(flushed)
    }

    /// Drop a page from the pool, flushing it first if dirty. Pinned pages
    /// are refused.
    pub fn remove(
        &mut self,
        page_id: PageId,
        store: &mut impl PageStore,
    ) -> Result<bool> {
        let idx = match self.map.get(&page_id) {
            Some(&idx) => idx,
            None => return Ok(false),
        };

        if let Some(frame) = self.frames[idx].as_mut() {
            if frame.pinned {
                return Ok(false);
            }
            if frame.dirty {
                store.save_page(&mut frame.node)?;
                frame.dirty = false;
            }
        }

        self.map.remove(&page_id);
        self.drop_slot(idx);
        Ok(true)
    }

    /// Flush everything, then drop every frame.
    pub fn clear(&mut self, store: &mut impl PageStore) -> Result<()> {
        self.flush_all(store)?;
        self.map.clear();
        self.frames.clear();
        self.free_slots.clear();
        self.head = None;
        self.tail = None;
        Ok(())
    }

    pub fn stats(&self) -> BufferStats {
        let mut stats = BufferStats {
            total_pages: self.map.len(),
            max_size: self.capacity,
            hit_count: self.hits,
            miss_count: self.misses,
            ..Default::default()
        };

        for frame in self.frames.iter().flatten() {
            if frame.dirty {
                stats.dirty_pages += 1;
            }
            if frame.pinned {
                stats.pinned_pages += 1;
            }
        }

        let total = self.hits + self.misses;
        if total > 0 {
            stats.hit_ratio = self.hits as f64 / total as f64;
        }

        stats
    }

    fn alloc_slot(&mut self, frame: Frame) -> usize {
        if let Some(idx) = self.free_slots.pop() {
            self.frames[idx] = Some(frame);
            idx
        } else {
            self.frames.push(Some(frame));
            self.frames.len() - 1
        }
    }

    fn push_front(&mut self, idx: usize) {
        if let Some(frame) = self.frames[idx].as_mut() {
            frame.prev = None;
            frame.next = self.head;
        }

        if let Some(old_head) = self.head {
            if let Some(frame) = self.frames[old_head].as_mut() {
                frame.prev = Some(idx);
            }
        }

        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = match &self.frames[idx] {
            Some(frame) => (frame.prev, frame.next),
            None => return,
        };

        if let Some(prev_idx) = prev {
            if let Some(frame) = self.frames[prev_idx].as_mut() {
                frame.next = next;
            }
        }
        if let Some(next_idx) = next {
            if let Some(frame) = self.frames[next_idx].as_mut() {
                frame.prev = prev;
            }
        }

        if self.head == Some(idx) {
            self.head = next;
        }
        if self.tail == Some(idx) {
            self.tail = prev;
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    fn drop_slot(&mut self, idx: usize) {
        self.detach(idx);
        self.frames[idx] = None;
        self.free_slots.push(idx);
    }

    /// Evict one frame, preferring a clean unpinned one (no I/O), falling
    /// back to flushing the least recent dirty unpinned frame. Returns false
    /// if every frame is pinned.
    fn evict_one(&mut self, store: &mut impl PageStore) -> Result<bool> {
        let mut current = self.tail;
        while let Some(idx) = current {
            let (page_id, prev, dirty, pinned) = match &self.frames[idx] {
                Some(f) => (f.node.header.page_id, f.prev, f.dirty, f.pinned),
                None => break,
            };
            if !pinned && !dirty {
                self.map.remove(&page_id);
                self.drop_slot(idx);
                return Ok(true);
            }
            current = prev;
        }

        let mut current = self.tail;
        while let Some(idx) = current {
            let (page_id, prev, dirty, pinned) = match &self.frames[idx] {
                Some(f) => (f.node.header.page_id, f.prev, f.dirty, f.pinned),
                None => break,
            };
            if !pinned && dirty {
                if let Some(frame) = self.frames[idx].as_mut() {
                    store.save_page(&mut frame.node)?;
                    frame.dirty = false;
                }
                self.map.remove(&page_id);
                self.drop_slot(idx);
                return Ok(true);
            }
            current = prev;
        }

        Ok(false)
    }
}
