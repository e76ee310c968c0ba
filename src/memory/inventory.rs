//! Fixed-capacity pool of buffer handles, each carved out of some [`MemoryMap`].
//!
//! Grounded on `doca-cpp`'s `core::BufferInventory`, which hands out refcounted
//! `doca_buf` objects from a preallocated pool shared across however many memory
//! maps the caller registers. Handles here carry an index plus a generation
//! counter rather than a pointer into a map, so a handle that outlives the map's
//! `stop()` is a stale index instead of a dangling reference.

use std::sync::{Arc, Mutex};

use crate::error::{RdmaError, Result};
use crate::memory::map::MemoryMap;

struct Slot {
    generation: u32,
    occupied: bool,
    map: Option<Arc<MemoryMap>>,
    addr: usize,
    len: usize,
    refcount: u32,
}

struct Inner {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

/// A capacity-bounded pool of buffer handles, parameterised only by `capacity`;
/// each allocation names the [`MemoryMap`] it carves its range out of.
pub struct BufferInventory {
    inner: Mutex<Inner>,
}

/// A weak, generation-checked reference to a slot in a [`BufferInventory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferHandle {
    index: usize,
    generation: u32,
}

impl BufferInventory {
    pub fn new(capacity: usize) -> BufferInventory {
        let slots = (0..capacity)
            .map(|_| Slot { generation: 0, occupied: false, map: None, addr: 0, len: 0, refcount: 0 })
            .collect();
        let free = (0..capacity).rev().collect();
        BufferInventory { inner: Mutex::new(Inner { slots, free }) }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().expect("inventory poisoned").slots.len()
    }

    pub fn in_use(&self) -> usize {
        let guard = self.inner.lock().expect("inventory poisoned");
        guard.slots.len() - guard.free.len()
    }

    fn alloc(&self, map: Arc<MemoryMap>, addr: usize, len: usize) -> Result<BufferHandle> {
        if addr + len > map.len() {
            return Err(RdmaError::config("buffer range exceeds memory map length"));
        }
        let mut guard = self.inner.lock().expect("inventory poisoned");
        let index = guard
            .free
            .pop()
            .ok_or_else(|| RdmaError::resource("buffer inventory exhausted"))?;
        let slot = &mut guard.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.occupied = true;
        slot.map = Some(map);
        slot.addr = addr;
        slot.len = len;
        slot.refcount = 1;
        Ok(BufferHandle { index, generation: slot.generation })
    }

    /// Allocates a handle over `[addr, addr+len)` of `map`, addressed directly.
    pub fn alloc_by_address(&self, map: Arc<MemoryMap>, addr: usize, len: usize) -> Result<BufferHandle> {
        self.alloc(map, addr, len)
    }

    /// Allocates a handle sized to `data` and copies `data` into `map` at `addr`
    /// before returning it.
    pub fn alloc_by_data(&self, map: Arc<MemoryMap>, addr: usize, data: &[u8]) -> Result<BufferHandle> {
        let handle = self.alloc(map.clone(), addr, data.len())?;
        if let Some(buf) = map.loopback_buf() {
            let mut guard = buf.lock().expect("loopback buffer poisoned");
            guard[addr..addr + data.len()].copy_from_slice(data);
        }
        Ok(handle)
    }

    fn slot(&self, handle: BufferHandle) -> Result<std::sync::MutexGuard<'_, Inner>> {
        let guard = self.inner.lock().expect("inventory poisoned");
        let slot = guard.slots.get(handle.index).ok_or_else(|| RdmaError::state("buffer handle out of range"))?;
        if !slot.occupied || slot.generation != handle.generation {
            return Err(RdmaError::state("buffer handle is stale"));
        }
        Ok(guard)
    }

    pub fn range(&self, handle: BufferHandle) -> Result<(usize, usize)> {
        let guard = self.slot(handle)?;
        let slot = &guard.slots[handle.index];
        Ok((slot.addr, slot.len))
    }

    pub fn map_of(&self, handle: BufferHandle) -> Result<Arc<MemoryMap>> {
        let guard = self.slot(handle)?;
        guard.slots[handle.index].map.clone().ok_or_else(|| RdmaError::state("handle has no map"))
    }

    /// Increments the refcount of a live handle, e.g. when a task retains it beyond
    /// the caller's own scope.
    pub fn retain(&self, handle: BufferHandle) -> Result<()> {
        let mut guard = self.slot(handle)?;
        guard.slots[handle.index].refcount += 1;
        Ok(())
    }

    /// Decrements the refcount, freeing the slot back to the pool once it reaches zero.
    pub fn release(&self, handle: BufferHandle) -> Result<()> {
        let mut guard = self.slot(handle)?;
        let slot = &mut guard.slots[handle.index];
        slot.refcount -= 1;
        if slot.refcount == 0 {
            slot.occupied = false;
            slot.map = None;
            guard.free.push(handle.index);
        }
        Ok(())
    }

    pub fn read(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        let (addr, len) = self.range(handle)?;
        let map = self.map_of(handle)?;
        let buf = map.loopback_buf().ok_or_else(|| RdmaError::state("handle has no local backing"))?;
        let guard = buf.lock().expect("loopback buffer poisoned");
        Ok(guard[addr..addr + len].to_vec())
    }

    /// True if any occupied slot still names `map`.
    pub(crate) fn is_referenced(&self, map: &Arc<MemoryMap>) -> bool {
        let guard = self.inner.lock().expect("inventory poisoned");
        guard.slots.iter().any(|s| s.occupied && s.map.as_ref().is_some_and(|m| Arc::ptr_eq(m, map)))
    }

    /// Stops `map`, refusing with [`RdmaError::resource`] while any handle allocated
    /// from it is still live — the `BufferInUse` guarantee the inventory makes to
    /// every memory map it hands out handles against. Takes `map` by value: the
    /// caller must own the only strong reference outside this inventory's slots,
    /// which for a map reached through an [`crate::rdma::buffer::RdmaBuffer`]
    /// means going through [`crate::rdma::buffer::RdmaBuffer::stop_map`] instead,
    /// since the buffer keeps its own cached clone.
    pub fn stop_map(&self, map: Arc<MemoryMap>) -> Result<()> {
        if self.is_referenced(&map) {
            return Err(RdmaError::resource("memory map has live buffer handles"));
        }
        match Arc::try_unwrap(map) {
            Ok(map) => map.stop(),
            Err(_) => Err(RdmaError::resource("memory map has live buffer handles")),
        }
    }
}

impl Default for BufferInventory {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::memory::AccessFlags;

    fn map(len: usize) -> Arc<MemoryMap> {
        let device = Device::open_first().unwrap();
        Arc::new(MemoryMap::start(&device, len, AccessFlags::LOCAL_READ_WRITE, None).unwrap())
    }

    #[test]
    fn alloc_and_release_returns_slot_to_pool() {
        let inv = BufferInventory::new(2);
        let m = map(4096);
        let a = inv.alloc_by_address(m.clone(), 0, 16).unwrap();
        let b = inv.alloc_by_address(m.clone(), 16, 16).unwrap();
        assert_eq!(inv.in_use(), 2);
        assert!(inv.alloc_by_address(m.clone(), 32, 16).is_err());
        inv.release(a).unwrap();
        assert_eq!(inv.in_use(), 1);
        let c = inv.alloc_by_address(m.clone(), 0, 8).unwrap();
        assert_ne!(a, c);
        inv.release(b).unwrap();
        inv.release(c).unwrap();
        assert_eq!(inv.in_use(), 0);
    }

    #[test]
    fn stale_handle_after_release_is_rejected() {
        let inv = BufferInventory::new(1);
        let handle = inv.alloc_by_address(map(64), 0, 8).unwrap();
        inv.release(handle).unwrap();
        assert!(inv.range(handle).is_err());
    }

    #[test]
    fn alloc_by_data_writes_through_to_backing_map() {
        let inv = BufferInventory::new(1);
        let handle = inv.alloc_by_data(map(64), 0, b"hello").unwrap();
        assert_eq!(inv.read(handle).unwrap(), b"hello");
    }

    #[test]
    fn alloc_rejects_range_past_map_length() {
        let inv = BufferInventory::new(4);
        assert!(inv.alloc_by_address(map(4096), 4090, 64).is_err());
    }

    #[test]
    fn handles_from_different_maps_coexist() {
        let inv = BufferInventory::new(4);
        let a = inv.alloc_by_address(map(64), 0, 8).unwrap();
        let b = inv.alloc_by_address(map(128), 0, 8).unwrap();
        assert!(inv.range(a).is_ok());
        assert!(inv.range(b).is_ok());
    }

    #[test]
    fn stop_map_is_rejected_while_a_handle_is_live() {
        let inv = BufferInventory::new(1);
        let m = map(64);
        let handle = inv.alloc_by_address(m.clone(), 0, 8).unwrap();
        assert!(inv.stop_map(m.clone()).is_err());
        inv.release(handle).unwrap();
        assert!(inv.stop_map(m).is_ok());
    }

    #[test]
    fn stop_map_succeeds_with_no_live_handles() {
        let inv = BufferInventory::new(1);
        let m = map(64);
        assert!(inv.stop_map(m).is_ok());
    }
}
