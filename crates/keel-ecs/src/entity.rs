//! Stable entity handles.
//!
//! Archetype rows move when another row is swap-removed, so callers never
//! hold row indices. An [`Entity`] is a 64-bit handle packing a *generation*
//! in the high 32 bits and a slot *index* in the low 32 bits; the store maps
//! live handles to their current `(archetype, row)`. Deleting an entity bumps
//! the slot's generation, so old handles are detected as stale even after
//! the slot is reused.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A generational entity handle.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(u64);

impl Entity {
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self(u64::from(generation) << 32 | u64::from(index))
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Hands out [`Entity`] handles and recycles freed slots.
///
/// Freed slots queue FIFO so a single hot slot does not burn through its
/// generation counter.
#[derive(Debug, Clone, Default)]
pub struct EntityAllocator {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free: VecDeque<u32>,
    live: usize,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Entity {
        self.live += 1;
        match self.free.pop_front() {
            Some(index) => {
                let slot = index as usize;
                self.alive[slot] = true;
                Entity::new(index, self.generations[slot])
            }
            None => {
                let index = self.generations.len() as u32;
                self.generations.push(0);
                self.alive.push(true);
                Entity::new(index, 0)
            }
        }
    }

    /// Free `entity`'s slot. Returns `false` if the handle was already stale.
    pub fn free(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        let slot = entity.index() as usize;
        self.alive[slot] = false;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.free.push_back(entity.index());
        self.live -= 1;
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        let slot = entity.index() as usize;
        slot < self.generations.len()
            && self.alive[slot]
            && self.generations[slot] == entity.generation()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Capture slot generations and the free queue.
    pub fn to_snapshot(&self) -> AllocatorSnapshot {
        AllocatorSnapshot {
            generations: self.generations.clone(),
            free: self.free.iter().copied().collect(),
        }
    }

    /// Rebuild an allocator. Every slot not in the free queue is live.
    ///
    /// Returns `None` when the free queue names a slot twice or a slot that
    /// does not exist.
    pub fn from_snapshot(snapshot: &AllocatorSnapshot) -> Option<Self> {
        let mut alive = vec![true; snapshot.generations.len()];
        for &index in &snapshot.free {
            let slot = alive.get_mut(index as usize)?;
            if !*slot {
                return None;
            }
            *slot = false;
        }
        Some(Self {
            generations: snapshot.generations.clone(),
            live: alive.iter().filter(|&&a| a).count(),
            alive,
            free: snapshot.free.iter().copied().collect(),
        })
    }
}

/// Serializable allocator state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorSnapshot {
    pub generations: Vec<u32>,
    /// Free slots in reuse order.
    pub free: Vec<u32>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_slots() {
        let mut alloc = EntityAllocator::new();
        let handles: Vec<Entity> = (0..64).map(|_| alloc.allocate()).collect();
        let mut slots: Vec<u32> = handles.iter().map(|e| e.index()).collect();
        slots.dedup();
        assert_eq!(slots.len(), 64);
        assert_eq!(alloc.live_count(), 64);
    }

    #[test]
    fn freed_slot_is_reused_with_next_generation() {
        let mut alloc = EntityAllocator::new();
        let first = alloc.allocate();
        assert!(alloc.free(first));
        let second = alloc.allocate();
        assert_eq!(second.index(), first.index());
        assert_eq!(second.generation(), first.generation() + 1);
        assert!(!alloc.is_alive(first));
        assert!(alloc.is_alive(second));
    }

    #[test]
    fn free_rejects_stale_handles() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate();
        assert!(alloc.free(e));
        assert!(!alloc.free(e));
        assert_eq!(alloc.live_count(), 0);
    }

    #[test]
    fn free_queue_is_fifo() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        alloc.free(b);
        alloc.free(a);
        assert_eq!(alloc.allocate().index(), b.index());
        assert_eq!(alloc.allocate().index(), a.index());
    }

    #[test]
    fn snapshot_restores_live_set_and_reuse_order() {
        let mut alloc = EntityAllocator::new();
        let handles: Vec<Entity> = (0..4).map(|_| alloc.allocate()).collect();
        alloc.free(handles[2]);
        alloc.free(handles[0]);

        let mut restored = EntityAllocator::from_snapshot(&alloc.to_snapshot()).unwrap();
        assert_eq!(restored.live_count(), 2);
        assert!(restored.is_alive(handles[1]));
        assert!(!restored.is_alive(handles[2]));
        assert_eq!(restored.allocate(), alloc.allocate());
    }

    #[test]
    fn snapshot_with_duplicate_free_slot_is_rejected() {
        let snapshot = AllocatorSnapshot {
            generations: vec![0, 0],
            free: vec![1, 1],
        };
        assert!(EntityAllocator::from_snapshot(&snapshot).is_none());
    }

    #[test]
    fn raw_roundtrip_preserves_parts() {
        let e = Entity::new(9, 3);
        assert_eq!((e.index(), e.generation()), (9, 3));
        assert_eq!(Entity::from_raw(e.to_raw()), e);
        assert_eq!(e.to_string(), "9v3");
    }
}
