//! # View Cache
//!
//! Stable storage is paged: instead of holding a whole hive image in
//! memory, fixed-size (16 KiB) *views* of the backing file are faulted in
//! on demand and recycled under memory pressure. The view cache owns those
//! windows and enforces the rules that make recycling safe:
//!
//! - a view with a nonzero use-count (cells currently being dereferenced
//!   through it) is never unmapped;
//! - a *pinned* view (dirty, or explicitly held while a cell inside it is
//!   mutated) is never an eviction candidate and is not on the LRU list;
//! - eviction picks the least-recently-used view among the unpinned,
//!   zero-use remainder, and is purely a cache-miss cost since stable
//!   data is backed by the file. Volatile storage has no backing and never
//!   goes through views at all.
//!
//! ## Addressing
//!
//! Views are identified by their window ordinal within *stable class
//! space*: view `k` covers class offsets `[k * VIEW_SIZE, (k+1) * VIEW_SIZE)`.
//! The hive layer translates window ordinals to file offsets (class offset
//! 0 sits just past the base block).
//!
//! ## Use/Pin Protocol
//!
//! 1. `get_or_map` returns a [`ViewRef`] with the use-count incremented
//! 2. the caller reads (or, holding exclusive hive access, writes) the bytes
//! 3. dropping the `ViewRef` decrements the use-count
//! 4. mutation marks the view dirty, which pins it until the next flush
//!
//! The mutable accessor hands out a slice derived from a raw pointer while
//! only the list mutex protects the entry table; this is the same contract
//! as the rest of the engine: storage mutation requires the hive writer
//! lock, so no two mutable borrows of the same view coexist.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::VIEW_SIZE;
use crate::hive::HiveError;

struct ViewSlot {
    view_no: u32,
    data: Box<[u8; VIEW_SIZE]>,
    use_count: u32,
    pinned: bool,
    dirty: bool,
    last_used: u64,
}

struct ViewList {
    slots: Vec<ViewSlot>,
    index: HashMap<u32, usize>,
}

/// Cache of mapped file windows for one hive's stable storage.
pub struct ViewCache {
    inner: Mutex<ViewList>,
    capacity: usize,
    tick: AtomicU64,
}

impl ViewCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "view cache needs at least one view");
        Self {
            inner: Mutex::new(ViewList {
                slots: Vec::with_capacity(capacity),
                index: HashMap::with_capacity(capacity),
            }),
            capacity,
            tick: AtomicU64::new(0),
        }
    }

    fn touch(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns a use-counted reference to the view covering `view_no`,
    /// faulting it in with `load` on a miss. Fails with
    /// [`HiveError::OutOfViews`] when the cache is full of pinned or
    /// in-use views, and with the loader's error when the fault-in fails.
    pub fn get_or_map<F>(&self, view_no: u32, load: F) -> Result<ViewRef<'_>>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let mut list = self.inner.lock();

        if let Some(&idx) = list.index.get(&view_no) {
            let slot = &mut list.slots[idx];
            slot.use_count += 1;
            slot.last_used = self.touch();
            return Ok(ViewRef {
                cache: self,
                view_no,
            });
        }

        if list.slots.len() >= self.capacity {
            self.evict_one(&mut list)?;
        }

        let mut data = Box::new([0u8; VIEW_SIZE]);
        load(data.as_mut_slice())?;

        let idx = list.slots.len();
        list.slots.push(ViewSlot {
            view_no,
            data,
            use_count: 1,
            pinned: false,
            dirty: false,
            last_used: self.touch(),
        });
        list.index.insert(view_no, idx);

        Ok(ViewRef {
            cache: self,
            view_no,
        })
    }

    fn evict_one(&self, list: &mut ViewList) -> Result<()> {
        let victim = list
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.pinned && s.use_count == 0)
            .min_by_key(|(_, s)| s.last_used)
            .map(|(i, _)| i);

        let Some(idx) = victim else {
            return Err(HiveError::OutOfViews.into());
        };

        debug_assert!(!list.slots[idx].dirty, "dirty view must be pinned");

        let removed = list.slots.swap_remove(idx);
        list.index.remove(&removed.view_no);
        if idx < list.slots.len() {
            let moved_no = list.slots[idx].view_no;
            list.index.insert(moved_no, idx);
        }
        Ok(())
    }

    /// Marks the view dirty and pins it until the next flush.
    pub fn mark_dirty(&self, view_no: u32) {
        let mut list = self.inner.lock();
        if let Some(&idx) = list.index.get(&view_no) {
            let slot = &mut list.slots[idx];
            slot.dirty = true;
            slot.pinned = true;
        }
    }

    pub fn pin(&self, view_no: u32) {
        let mut list = self.inner.lock();
        if let Some(&idx) = list.index.get(&view_no) {
            list.slots[idx].pinned = true;
        }
    }

    /// Unpins a view; with `becomes_clean` the dirty flag is dropped too
    /// and the view is immediately eviction-eligible.
    pub fn unpin(&self, view_no: u32, becomes_clean: bool) {
        let mut list = self.inner.lock();
        if let Some(&idx) = list.index.get(&view_no) {
            let slot = &mut list.slots[idx];
            slot.pinned = false;
            if becomes_clean {
                slot.dirty = false;
            } else {
                debug_assert!(!slot.dirty, "unpinning a view that is still dirty");
            }
        }
    }

    pub fn is_mapped(&self, view_no: u32) -> bool {
        self.inner.lock().index.contains_key(&view_no)
    }

    pub fn has_dirty(&self) -> bool {
        self.inner.lock().slots.iter().any(|s| s.dirty)
    }

    /// Drops the window for `view_no` if it can be dropped right now.
    /// Returns false when the window is pinned or in use; callers that
    /// rewrote the underlying bytes must then write through the view
    /// instead of around it.
    pub fn invalidate(&self, view_no: u32) -> bool {
        let mut list = self.inner.lock();
        let Some(&idx) = list.index.get(&view_no) else {
            return true;
        };
        if list.slots[idx].pinned || list.slots[idx].use_count > 0 {
            return false;
        }
        let removed = list.slots.swap_remove(idx);
        list.index.remove(&removed.view_no);
        if idx < list.slots.len() {
            let moved_no = list.slots[idx].view_no;
            list.index.insert(moved_no, idx);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes every dirty view through `write`, then unpins it clean.
    /// Returns the number of views written.
    pub fn flush_dirty<F>(&self, mut write: F) -> Result<usize>
    where
        F: FnMut(u32, &[u8]) -> Result<()>,
    {
        let mut list = self.inner.lock();
        let mut flushed = 0;

        for slot in list.slots.iter_mut() {
            if slot.dirty {
                write(slot.view_no, slot.data.as_slice())?;
                slot.dirty = false;
                slot.pinned = false;
                flushed += 1;
            }
        }

        Ok(flushed)
    }

    /// Drops every unpinned zero-use view; used when the backing bytes
    /// were rewritten wholesale (compaction) and cached windows are stale.
    pub fn invalidate_clean(&self) -> usize {
        let mut list = self.inner.lock();
        let mut dropped = 0;

        let mut idx = 0;
        while idx < list.slots.len() {
            if !list.slots[idx].pinned && list.slots[idx].use_count == 0 {
                let removed = list.slots.swap_remove(idx);
                list.index.remove(&removed.view_no);
                if idx < list.slots.len() {
                    let moved_no = list.slots[idx].view_no;
                    list.index.insert(moved_no, idx);
                }
                dropped += 1;
            } else {
                idx += 1;
            }
        }

        dropped
    }

    fn data_ptr(&self, view_no: u32) -> Option<(*mut u8, usize)> {
        let list = self.inner.lock();
        let idx = *list.index.get(&view_no)?;
        let slot = &list.slots[idx];
        debug_assert!(slot.use_count > 0, "view data access without use count");
        Some((slot.data.as_ptr() as *mut u8, VIEW_SIZE))
    }

    fn release(&self, view_no: u32) {
        let mut list = self.inner.lock();
        if let Some(&idx) = list.index.get(&view_no) {
            let slot = &mut list.slots[idx];
            debug_assert!(slot.use_count > 0, "view use count underflow");
            slot.use_count -= 1;
        }
    }
}

/// Use-counted handle to one mapped view. The view cannot be evicted
/// while this handle is alive.
pub struct ViewRef<'a> {
    cache: &'a ViewCache,
    view_no: u32,
}

impl std::fmt::Debug for ViewRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewRef")
            .field("view_no", &self.view_no)
            .finish_non_exhaustive()
    }
}

impl<'a> ViewRef<'a> {
    pub fn view_no(&self) -> u32 {
        self.view_no
    }

    pub fn data(&self) -> &[u8] {
        let (ptr, len) = self
            .cache
            .data_ptr(self.view_no)
            .expect("view not in cache"); // INVARIANT: ViewRef holds a use count
        // SAFETY: the slot's data is a Box<[u8; VIEW_SIZE]> that cannot be
        // evicted (use_count > 0 for the lifetime of this ViewRef) and the
        // box's heap allocation never moves. The returned slice is tied to
        // &self, and mutation elsewhere requires the hive writer lock the
        // caller already coordinates on.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    /// Mutable access; marks the view dirty (which pins it).
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.cache.mark_dirty(self.view_no);
        let (ptr, len) = self
            .cache
            .data_ptr(self.view_no)
            .expect("view not in cache"); // INVARIANT: ViewRef holds a use count
        // SAFETY: as in data(); &mut self guarantees this handle is the
        // only user of the slice, and storage mutation is serialized by
        // the hive writer lock at the layer above.
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }
}

impl Drop for ViewRef<'_> {
    fn drop(&mut self) {
        self.cache.release(self.view_no);
    }
}
