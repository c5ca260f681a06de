//! Bounded pool of hardware composer cache slots.
//!
//! Each [`CacheId`] admitted to the pool is bound to one [`HwcSlot`]. When the
//! pool is exhausted the least recently used binding is evicted and its slot
//! is handed to the newcomer, so resolution never fails.

use std::collections::HashMap;
use std::sync::Mutex;

use bitvec::prelude::{BitVec, Lsb0};
use buffer_protocol::{CacheId, HwcSlot, SlotResolution, SurfaceId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod erased;

pub use erased::{CacheErasedRecipient, ClientCacheNotifier};

/// Slot count of the buffer queue the hardware cache mirrors.
pub const DEFAULT_HWC_SLOT_CAPACITY: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HwcSlotAllocatorConfig {
    pub capacity: u32,
}

impl Default for HwcSlotAllocatorConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_HWC_SLOT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HwcSlotAllocatorCreateError {
    #[error("hwc slot capacity must be at least 1")]
    ZeroCapacity,
}

#[derive(Debug)]
struct SlotBinding {
    slot: HwcSlot,
    last_use: u64,
    owners: SmallVec<[SurfaceId; 2]>,
}

#[derive(Debug)]
struct SlotTable {
    capacity: u32,
    bindings: HashMap<CacheId, SlotBinding>,
    // LIFO: the most recently freed slot is reused first.
    free_slots: Vec<HwcSlot>,
    bound: BitVec<u64, Lsb0>,
    use_counter: u64,
}

impl SlotTable {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            bindings: HashMap::with_capacity(capacity as usize),
            free_slots: (0..capacity).rev().map(HwcSlot).collect(),
            bound: BitVec::repeat(false, capacity as usize),
            use_counter: 0,
        }
    }

    fn next_use(&mut self) -> u64 {
        self.use_counter = self
            .use_counter
            .checked_add(1)
            .expect("hwc slot use counter overflow");
        self.use_counter
    }

    fn resolve(&mut self, cache_id: CacheId, owner: Option<SurfaceId>) -> SlotResolution {
        let use_stamp = self.next_use();
        if let Some(binding) = self.bindings.get_mut(&cache_id) {
            binding.last_use = use_stamp;
            if let Some(owner) = owner {
                if !binding.owners.contains(&owner) {
                    binding.owners.push(owner);
                }
            }
            return SlotResolution {
                slot: binding.slot,
                cache_hit: true,
            };
        }

        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => self.evict_least_recently_used(),
        };
        self.bound.set(slot.index(), true);
        let mut owners = SmallVec::new();
        owners.extend(owner);
        self.bindings.insert(
            cache_id,
            SlotBinding {
                slot,
                last_use: use_stamp,
                owners,
            },
        );
        tracing::trace!(cache_id = %cache_id, slot = slot.0, "bound hwc slot");
        SlotResolution {
            slot,
            cache_hit: false,
        }
    }

    // The evicted slot goes straight to the caller, never through the free
    // stack.
    fn evict_least_recently_used(&mut self) -> HwcSlot {
        let victim = self
            .bindings
            .iter()
            .min_by_key(|(cache_id, binding)| (binding.last_use, **cache_id))
            .map(|(cache_id, _)| *cache_id)
            .expect("exhausted hwc slot table must hold bindings");
        let binding = self
            .bindings
            .remove(&victim)
            .expect("eviction victim must be bound");
        self.bound.set(binding.slot.index(), false);
        tracing::debug!(
            cache_id = %victim,
            slot = binding.slot.0,
            "evicted least recently used hwc slot"
        );
        binding.slot
    }

    fn erase(&mut self, cache_id: CacheId) -> Option<HwcSlot> {
        let binding = self.bindings.remove(&cache_id)?;
        self.bound.set(binding.slot.index(), false);
        self.free_slots.push(binding.slot);
        Some(binding.slot)
    }

    fn release_owner(&mut self, owner: SurfaceId) -> Vec<CacheId> {
        let mut orphaned = Vec::new();
        for (cache_id, binding) in &mut self.bindings {
            let Some(position) = binding.owners.iter().position(|id| *id == owner) else {
                continue;
            };
            binding.owners.swap_remove(position);
            if binding.owners.is_empty() {
                orphaned.push(*cache_id);
            }
        }
        orphaned.sort_unstable();
        for cache_id in &orphaned {
            self.erase(*cache_id);
        }
        orphaned
    }

    fn is_consistent(&self) -> bool {
        if self.bindings.len() + self.free_slots.len() != self.capacity as usize {
            return false;
        }
        if self.bound.count_ones() != self.bindings.len() {
            return false;
        }
        let mut seen: BitVec<u64, Lsb0> = BitVec::repeat(false, self.capacity as usize);
        let slots = self
            .bindings
            .values()
            .map(|binding| binding.slot)
            .chain(self.free_slots.iter().copied());
        for slot in slots {
            if slot.0 >= self.capacity || seen[slot.index()] {
                return false;
            }
            seen.set(slot.index(), true);
        }
        self.bindings
            .values()
            .all(|binding| self.bound[binding.slot.index()])
    }
}

#[derive(Debug)]
pub struct HwcSlotAllocator {
    capacity: u32,
    table: Mutex<SlotTable>,
}

impl HwcSlotAllocator {
    pub fn new(config: HwcSlotAllocatorConfig) -> Result<Self, HwcSlotAllocatorCreateError> {
        if config.capacity == 0 {
            return Err(HwcSlotAllocatorCreateError::ZeroCapacity);
        }
        Ok(Self {
            capacity: config.capacity,
            table: Mutex::new(SlotTable::new(config.capacity)),
        })
    }

    pub fn with_capacity(capacity: u32) -> Result<Self, HwcSlotAllocatorCreateError> {
        Self::new(HwcSlotAllocatorConfig { capacity })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn resolve_slot(&self, cache_id: CacheId) -> SlotResolution {
        let mut table = self.lock_table();
        let resolution = table.resolve(cache_id, None);
        debug_assert!(table.is_consistent());
        resolution
    }

    /// Like [`Self::resolve_slot`], and records `owner` as a user of the
    /// binding so [`Self::release_owner`] can reclaim it later.
    pub fn resolve_slot_for(&self, owner: SurfaceId, cache_id: CacheId) -> SlotResolution {
        let mut table = self.lock_table();
        let resolution = table.resolve(cache_id, Some(owner));
        debug_assert!(table.is_consistent());
        resolution
    }

    /// Drops the binding for `cache_id` and returns its slot to the free
    /// stack. Returns false when the id was not bound.
    pub fn erase(&self, cache_id: CacheId) -> bool {
        let mut table = self.lock_table();
        let erased = table.erase(cache_id);
        debug_assert!(table.is_consistent());
        if let Some(slot) = erased {
            tracing::trace!(cache_id = %cache_id, slot = slot.0, "erased hwc slot binding");
        }
        erased.is_some()
    }

    /// Removes `owner` from every binding it uses and erases the bindings no
    /// other surface still uses. Returns the erased ids in ascending order.
    pub fn release_owner(&self, owner: SurfaceId) -> Vec<CacheId> {
        let mut table = self.lock_table();
        let erased = table.release_owner(owner);
        debug_assert!(table.is_consistent());
        erased
    }

    pub fn slot_of(&self, cache_id: CacheId) -> Option<HwcSlot> {
        self.lock_table()
            .bindings
            .get(&cache_id)
            .map(|binding| binding.slot)
    }

    pub fn bound_count(&self) -> usize {
        self.lock_table().bindings.len()
    }

    pub fn free_count(&self) -> usize {
        self.lock_table().free_slots.len()
    }

    /// Checks that free and bound slots partition `[0, capacity)`.
    pub fn is_consistent(&self) -> bool {
        self.lock_table().is_consistent()
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, SlotTable> {
        self.table.lock().expect("hwc slot table lock poisoned")
    }
}
