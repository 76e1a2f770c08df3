//! C5: record id -> offset index cache.
//!
//! A small, fixed-capacity LRU of "where is this id's most recent
//! header" hints, modeled directly on ChibiOS's `mfs_cached_id_t`
//! intrusive doubly-linked list: slots live in a flat array and are
//! threaded together with indices rather than pointers, since there is
//! no allocator. Index 0 doubles as the identifier's "empty" sentinel
//! (application record ids are never 0, per spec.md's glossary) and as
//! the list's `NIL` link value via `u16::MAX`.
//!
//! The cache is purely an optimization: every lookup it serves is
//! re-validated against the actual on-flash header before use, and a
//! miss simply falls back to a full backward chain walk. Losing the
//! cache's contents (e.g. across a `stop`/`start` cycle) cannot corrupt
//! anything.

const NIL: u16 = u16::MAX;

#[derive(Clone, Copy)]
struct Slot {
    id: u32,
    offset: u32,
    size: u32,
    prev: u16,
    next: u16,
}

impl Slot {
    const EMPTY: Slot = Slot {
        id: 0,
        offset: 0,
        size: 0,
        prev: NIL,
        next: NIL,
    };
}

/// Fixed-capacity LRU cache mapping record id to its most recent
/// header's location. `N == 0` degrades every operation to a no-op,
/// matching spec.md's allowance for disabling the cache entirely.
pub struct IndexCache<const N: usize> {
    slots: [Slot; N],
    head: u16,
    tail: u16,
    len: u16,
}

/// Cached location of a record's most recent header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHit {
    pub offset: u32,
    pub size: u32,
}

impl<const N: usize> IndexCache<N> {
    pub fn new() -> Self {
        IndexCache {
            slots: [Slot::EMPTY; N],
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        for s in self.slots.iter_mut() {
            *s = Slot::EMPTY;
        }
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }

    /// Look up `id`, promoting it to most-recently-used on a hit.
    pub fn get(&mut self, id: u32) -> Option<CacheHit> {
        if N == 0 || id == 0 {
            return None;
        }
        let idx = self.find_slot(id)?;
        self.touch(idx);
        let slot = self.slots[idx as usize];
        Some(CacheHit {
            offset: slot.offset,
            size: slot.size,
        })
    }

    /// Record (or update) where `id`'s most recent header lives. A
    /// tombstone (`size == 0`) removes the id from the cache instead of
    /// caching a now-dead location.
    pub fn insert(&mut self, id: u32, offset: u32, size: u32) {
        if N == 0 || id == 0 {
            return;
        }
        if size == 0 {
            self.remove(id);
            return;
        }
        if let Some(idx) = self.find_slot(id) {
            self.slots[idx as usize].offset = offset;
            self.slots[idx as usize].size = size;
            self.touch(idx);
            return;
        }

        let idx = if (self.len as usize) < N {
            let idx = self.len;
            self.len += 1;
            idx
        } else {
            // Evict the least-recently-used slot (the tail).
            let victim = self.tail;
            self.unlink(victim);
            victim
        };

        self.slots[idx as usize] = Slot {
            id,
            offset,
            size,
            prev: NIL,
            next: NIL,
        };
        self.push_front(idx);
    }

    /// Drop `id` from the cache, e.g. after an erase.
    pub fn remove(&mut self, id: u32) {
        if N == 0 || id == 0 {
            return;
        }
        if let Some(idx) = self.find_slot(id) {
            self.unlink(idx);
            self.slots[idx as usize] = Slot::EMPTY;
        }
    }

    fn find_slot(&self, id: u32) -> Option<u16> {
        if N == 0 {
            return None;
        }
        (0..self.len).find(|&i| self.slots[i as usize].id == id)
    }

    fn touch(&mut self, idx: u16) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn push_front(&mut self, idx: u16) {
        self.slots[idx as usize].prev = NIL;
        self.slots[idx as usize].next = self.head;
        if self.head != NIL {
            self.slots[self.head as usize].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: u16) {
        let (prev, next) = (self.slots[idx as usize].prev, self.slots[idx as usize].next);
        if prev != NIL {
            self.slots[prev as usize].next = next;
        } else if self.head == idx {
            self.head = next;
        }
        if next != NIL {
            self.slots[next as usize].prev = prev;
        } else if self.tail == idx {
            self.tail = prev;
        }
        self.slots[idx as usize].prev = NIL;
        self.slots[idx as usize].next = NIL;
    }
}

impl<const N: usize> Default for IndexCache<N> {
    fn default() -> Self {
        Self::new()
    }
}
