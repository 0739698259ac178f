//! # Page Slab Allocator
//!
//! Fixed-size object pool for the short-lived records the cache layer
//! churns through. Objects live in page-sized chunks carved into equal
//! slots; a free slot costs one list pop, and a fully vacated page is
//! handed back whole. When the page budget is exhausted the slab falls
//! back to direct boxed allocations, tagged in the handle so the free
//! path knows where the object came from.
//!
//! Handles are generation checked: freeing a slot bumps its generation,
//! so a stale handle misses instead of aliasing the slot's next tenant.
//! Generations survive page release; a recarved page index continues
//! where the old page left off.
//!
//! A single mutex guards the free list, the pages and the fallback
//! table. Every operation under it is O(1) except carving a fresh page,
//! which stays under the lock so two callers cannot carve the same page
//! index twice.

use parking_lot::Mutex;

use crate::config::SLAB_PAGE_SIZE;

/// A slab-issued object handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlabHandle {
    Slot {
        page: u32,
        slot: u32,
        generation: u32,
    },
    /// Boxed outside the page pool; not counted by conservation.
    Direct(u64),
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct Page<T> {
    slots: Box<[Slot<T>]>,
    free_in_page: usize,
}

struct SlabInner<T> {
    pages: Vec<Option<Page<T>>>,
    /// Starting generation for the next tenant of each page index.
    seeds: Vec<u32>,
    /// `(page, slot)` pairs ready for reuse.
    free: Vec<(u32, u32)>,
    fallback: hashbrown::HashMap<u64, Box<T>>,
    next_fallback: u64,
    live: usize,
}

/// Counters for invariant checks and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabStats {
    pub pages: usize,
    pub slots_per_page: usize,
    pub free_slots: usize,
    pub live: usize,
    pub direct: usize,
}

pub struct Slab<T> {
    inner: Mutex<SlabInner<T>>,
    slots_per_page: usize,
    page_budget: usize,
}

impl<T> Slab<T> {
    /// A slab that will carve at most `page_budget` pages before falling
    /// back to direct allocations.
    pub fn new(page_budget: usize) -> Self {
        let slots_per_page = (SLAB_PAGE_SIZE / size_of::<Slot<T>>()).max(1);
        Self {
            inner: Mutex::new(SlabInner {
                pages: Vec::new(),
                seeds: Vec::new(),
                free: Vec::new(),
                fallback: hashbrown::HashMap::new(),
                next_fallback: 0,
                live: 0,
            }),
            slots_per_page,
            page_budget,
        }
    }

    pub fn alloc(&self, value: T) -> SlabHandle {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.free.is_empty()
            && inner.pages.iter().flatten().count() < self.page_budget
        {
            self.carve_page(inner);
        }

        while let Some((page, slot)) = inner.free.pop() {
            let Some(p) = inner.pages.get_mut(page as usize).and_then(Option::as_mut) else {
                continue;
            };
            let s = &mut p.slots[slot as usize];
            if s.value.is_some() {
                continue;
            }
            let generation = s.generation;
            s.value = Some(value);
            p.free_in_page -= 1;
            inner.live += 1;
            return SlabHandle::Slot {
                page,
                slot,
                generation,
            };
        }

        let id = inner.next_fallback;
        inner.next_fallback += 1;
        inner.fallback.insert(id, Box::new(value));
        SlabHandle::Direct(id)
    }

    /// Returns the object if the handle was still live. A vacated page
    /// is released whole, its remaining slots pulled off the free list.
    pub fn free(&self, handle: SlabHandle) -> Option<T> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match handle {
            SlabHandle::Direct(id) => inner.fallback.remove(&id).map(|b| *b),
            SlabHandle::Slot {
                page,
                slot,
                generation,
            } => {
                let p = inner.pages.get_mut(page as usize)?.as_mut()?;
                let s = p.slots.get_mut(slot as usize)?;
                if s.generation != generation {
                    return None;
                }
                let value = s.value.take()?;
                s.generation = s.generation.wrapping_add(1);
                p.free_in_page += 1;
                let vacated = p.free_in_page == self.slots_per_page;
                let seed = if vacated {
                    p.slots
                        .iter()
                        .map(|s| s.generation)
                        .max()
                        .unwrap_or(0)
                        .wrapping_add(1)
                } else {
                    0
                };
                inner.live -= 1;

                if vacated {
                    inner.free.retain(|&(q, _)| q != page);
                    inner.pages[page as usize] = None;
                    inner.seeds[page as usize] = seed;
                } else {
                    inner.free.push((page, slot));
                }
                Some(value)
            }
        }
    }

    /// Runs `f` over the object behind a live handle.
    pub fn with<R>(&self, handle: SlabHandle, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.resolve(handle).map(f)
    }

    pub fn with_mut<R>(&self, handle: SlabHandle, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.resolve_mut(handle).map(f)
    }

    pub fn stats(&self) -> SlabStats {
        let inner = self.inner.lock();
        SlabStats {
            pages: inner.pages.iter().flatten().count(),
            slots_per_page: self.slots_per_page,
            free_slots: inner.free.len(),
            live: inner.live,
            direct: inner.fallback.len(),
        }
    }

    /// Full-scan sanity walk: the free list must hold no duplicates and
    /// reference only empty slots, and slot accounting must balance.
    pub fn verify(&self) -> bool {
        let inner = self.inner.lock();
        let mut seen = hashbrown::HashSet::new();
        for &(page, slot) in &inner.free {
            if !seen.insert((page, slot)) {
                return false;
            }
            let Some(Some(p)) = inner.pages.get(page as usize) else {
                return false;
            };
            if p.slots[slot as usize].value.is_some() {
                return false;
            }
        }
        let carved = inner.pages.iter().flatten().count() * self.slots_per_page;
        inner.free.len() + inner.live == carved
    }

    /// Carves one page, preferring a released index so the pages table
    /// does not grow without bound under churn.
    fn carve_page(&self, inner: &mut SlabInner<T>) {
        let idx = inner
            .pages
            .iter()
            .position(Option::is_none)
            .unwrap_or(inner.pages.len());
        if idx == inner.pages.len() {
            inner.pages.push(None);
            inner.seeds.push(0);
        }

        let seed = inner.seeds[idx];
        let mut slots = Vec::with_capacity(self.slots_per_page);
        for _ in 0..self.slots_per_page {
            slots.push(Slot {
                generation: seed,
                value: None,
            });
        }
        inner.pages[idx] = Some(Page {
            slots: slots.into_boxed_slice(),
            free_in_page: self.slots_per_page,
        });
        for slot in (0..self.slots_per_page as u32).rev() {
            inner.free.push((idx as u32, slot));
        }
    }
}

impl<T> SlabInner<T> {
    fn resolve(&self, handle: SlabHandle) -> Option<&T> {
        match handle {
            SlabHandle::Direct(id) => self.fallback.get(&id).map(|b| b.as_ref()),
            SlabHandle::Slot {
                page,
                slot,
                generation,
            } => {
                let s = self
                    .pages
                    .get(page as usize)?
                    .as_ref()?
                    .slots
                    .get(slot as usize)?;
                if s.generation != generation {
                    return None;
                }
                s.value.as_ref()
            }
        }
    }

    fn resolve_mut(&mut self, handle: SlabHandle) -> Option<&mut T> {
        match handle {
            SlabHandle::Direct(id) => self.fallback.get_mut(&id).map(|b| b.as_mut()),
            SlabHandle::Slot {
                page,
                slot,
                generation,
            } => {
                let s = self
                    .pages
                    .get_mut(page as usize)?
                    .as_mut()?
                    .slots
                    .get_mut(slot as usize)?;
                if s.generation != generation {
                    return None;
                }
                s.value.as_mut()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let slab: Slab<u64> = Slab::new(4);
        let h = slab.alloc(42);

        assert_eq!(slab.with(h, |v| *v), Some(42));
        assert_eq!(slab.free(h), Some(42));
        assert_eq!(slab.with(h, |v| *v), None);
        assert!(slab.verify());
    }

    #[test]
    fn stale_handles_miss_after_reuse() {
        let slab: Slab<u64> = Slab::new(1);
        let old = slab.alloc(1);
        slab.free(old);
        let new = slab.alloc(2);

        assert_eq!(slab.with(old, |v| *v), None);
        assert_eq!(slab.free(old), None);
        assert_eq!(slab.with(new, |v| *v), Some(2));
    }

    #[test]
    fn exhausted_budget_falls_back_to_direct() {
        let slab: Slab<u64> = Slab::new(1);
        let per_page = slab.stats().slots_per_page;
        let handles: Vec<_> = (0..per_page as u64).map(|i| slab.alloc(i)).collect();
        assert!(handles.iter().all(|h| matches!(h, SlabHandle::Slot { .. })));

        let overflow = slab.alloc(999);
        assert!(matches!(overflow, SlabHandle::Direct(_)));
        assert_eq!(slab.with(overflow, |v| *v), Some(999));
        assert_eq!(slab.stats().direct, 1);

        assert_eq!(slab.free(overflow), Some(999));
        assert_eq!(slab.stats().direct, 0);
        assert!(slab.verify());
    }

    #[test]
    fn vacated_page_is_released() {
        let slab: Slab<u64> = Slab::new(2);
        let handles: Vec<_> = (0..8u64).map(|i| slab.alloc(i)).collect();
        assert_eq!(slab.stats().pages, 1);

        for h in handles {
            slab.free(h);
        }

        assert_eq!(slab.stats().pages, 0);
        assert_eq!(slab.stats().free_slots, 0);
        assert!(slab.verify());
    }

    #[test]
    fn handles_from_a_released_page_never_alias_its_successor() {
        let slab: Slab<u64> = Slab::new(1);
        let old = slab.alloc(7);
        slab.free(old);
        // page 0 was released; this recarves it
        let new = slab.alloc(8);

        assert!(matches!(new, SlabHandle::Slot { page: 0, .. }));
        assert_eq!(slab.with(old, |v| *v), None);
        assert_eq!(slab.with(new, |v| *v), Some(8));
    }

    #[test]
    fn conservation_under_concurrent_churn() {
        use std::sync::Arc;

        let slab: Arc<Slab<u64>> = Arc::new(Slab::new(8));
        let mut threads = Vec::new();
        for t in 0..10u64 {
            let slab = Arc::clone(&slab);
            threads.push(std::thread::spawn(move || {
                let mut held = Vec::new();
                for i in 0..500u64 {
                    held.push(slab.alloc(t * 1000 + i));
                    if i % 3 == 0 {
                        let h = held.swap_remove(fastrand::usize(..held.len()));
                        assert!(slab.free(h).is_some());
                    }
                }
                for h in held {
                    assert!(slab.free(h).is_some());
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        let stats = slab.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.direct, 0);
        assert!(slab.verify());
    }
}
