//! # RDMA buffer
//!
//! The application-facing buffer type: a byte range that starts out unmapped (the
//! application may read/write it directly) and can be mapped on demand, after which
//! it is pinned and the session layer serialises access to it through the endpoint
//! lock. Grounded on `doca-cpp`'s `rdma::RdmaBuffer`, which wraps either a local
//! `std::vector<uint8_t>` or a descriptor reconstructed from a peer.

use std::sync::{Arc, Mutex};

use crate::device::Device;
use crate::error::{RdmaError, Result};
use crate::memory::{AccessFlags, BufferInventory, MemoryMap};

enum Origin {
    /// Owns its bytes; mapping pins and registers them.
    Local { initial: Vec<u8> },
    /// Reconstructed from a peer's exported descriptor; mapping addresses the
    /// peer's memory rather than allocating new local storage.
    Remote { descriptor: Vec<u8> },
}

/// A byte range that is either local (this process's own memory) or remote
/// (addresses a peer's memory via a descriptor), mapped lazily.
pub struct RdmaBuffer {
    device: Device,
    len: usize,
    origin: Origin,
    map: Mutex<Option<Arc<MemoryMap>>>,
}

impl RdmaBuffer {
    /// A local buffer of `len` zeroed bytes.
    pub fn local(device: Device, len: usize) -> RdmaBuffer {
        RdmaBuffer { device, len, origin: Origin::Local { initial: vec![0u8; len] }, map: Mutex::new(None) }
    }

    /// A local buffer pre-filled with `data`.
    pub fn local_with(device: Device, data: Vec<u8>) -> RdmaBuffer {
        let len = data.len();
        RdmaBuffer { device, len, origin: Origin::Local { initial: data }, map: Mutex::new(None) }
    }

    /// Reconstructs a buffer addressing a peer's memory from an exported
    /// descriptor.
    pub fn remote(device: Device, descriptor: Vec<u8>) -> Result<RdmaBuffer> {
        let map = MemoryMap::from_export(&descriptor, &device)?;
        let len = map.len();
        Ok(RdmaBuffer {
            device,
            len,
            origin: Origin::Remote { descriptor },
            map: Mutex::new(Some(Arc::new(map))),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_mapped(&self) -> bool {
        self.map.lock().expect("buffer map mutex poisoned").is_some()
    }

    /// Pins the byte range under `permissions`, a no-op if already mapped.
    pub fn map(&self, permissions: AccessFlags) -> Result<Arc<MemoryMap>> {
        let mut guard = self.map.lock().expect("buffer map mutex poisoned");
        if let Some(map) = &*guard {
            return Ok(map.clone());
        }
        let map = match &self.origin {
            Origin::Local { initial } => {
                Arc::new(MemoryMap::start(&self.device, self.len, permissions, Some(initial))?)
            }
            Origin::Remote { .. } => {
                return Err(RdmaError::state("remote buffer is mapped at construction"));
            }
        };
        *guard = Some(map.clone());
        Ok(map)
    }

    pub fn memory_map(&self) -> Option<Arc<MemoryMap>> {
        self.map.lock().expect("buffer map mutex poisoned").clone()
    }

    /// Exports a descriptor for this buffer, mapping it first if unmapped.
    pub fn export_descriptor(&self, permissions: AccessFlags) -> Result<Vec<u8>> {
        let map = self.map(permissions)?;
        map.export_rdma()
    }

    /// Reads the byte range. Requires the buffer to already be mapped, or to be a
    /// local buffer that has not been mapped yet.
    pub fn read(&self) -> Result<Vec<u8>> {
        if let Some(map) = self.memory_map() {
            return map.read_local();
        }
        match &self.origin {
            Origin::Local { initial } => Ok(initial.clone()),
            Origin::Remote { .. } => Err(RdmaError::state("remote buffer was never mapped")),
        }
    }

    /// Writes the byte range. See [`RdmaBuffer::read`] for the unmapped case.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if let Some(map) = self.memory_map() {
            return map.write_local(data);
        }
        Err(RdmaError::state("cannot write an unmapped buffer directly; call map() first"))
    }

    /// Unpins the buffer's memory map through `inventory`, refusing while any
    /// handle allocated from it is still live. A no-op if never mapped.
    ///
    /// This buffer's own cached `Arc` would otherwise keep `inventory`'s
    /// liveness check from ever passing, since it holds a clone indefinitely
    /// once mapped — so the cache is cleared here as part of the same
    /// decision to stop, not left for the inventory to reason about alone.
    pub fn stop_map(&self, inventory: &BufferInventory) -> Result<()> {
        let mut guard = self.map.lock().expect("buffer map mutex poisoned");
        let Some(map) = guard.as_ref().cloned() else { return Ok(()) };
        if inventory.is_referenced(&map) {
            return Err(RdmaError::resource("memory map has live buffer handles"));
        }
        drop(map);
        let map = guard.take().expect("checked Some above");
        match Arc::try_unwrap(map) {
            Ok(inner) => inner.stop(),
            Err(arc) => {
                *guard = Some(arc);
                Err(RdmaError::resource("memory map has live buffer handles"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn local_buffer_round_trips_through_map() {
        let device = Device::open_first().unwrap();
        let buf = RdmaBuffer::local_with(device, vec![0x42; 16]);
        buf.map(AccessFlags::LOCAL_READ_WRITE).unwrap();
        assert_eq!(buf.read().unwrap(), vec![0x42; 16]);
        buf.write(&[0xAB; 16]).unwrap();
        assert_eq!(buf.read().unwrap(), vec![0xAB; 16]);
    }

    #[test]
    fn remote_buffer_reconstructs_from_descriptor() {
        let device = Device::open_first().unwrap();
        let local = RdmaBuffer::local_with(device.clone(), vec![0xCD; 32]);
        let descriptor = local.export_descriptor(AccessFlags::LOCAL_READ_WRITE | AccessFlags::RDMA_READ).unwrap();

        let remote = RdmaBuffer::remote(device, descriptor).unwrap();
        assert_eq!(remote.len(), 32);
        assert_eq!(remote.read().unwrap(), vec![0xCD; 32]);
    }

    #[test]
    fn stop_map_is_rejected_while_a_handle_is_live_then_succeeds_after_release() {
        let device = Device::open_first().unwrap();
        let buf = RdmaBuffer::local_with(device, vec![0; 16]);
        let map = buf.map(AccessFlags::LOCAL_READ_WRITE).unwrap();

        let inventory = BufferInventory::new(1);
        let handle = inventory.alloc_by_address(map, 0, 16).unwrap();

        assert!(buf.stop_map(&inventory).is_err());
        assert!(buf.is_mapped(), "a rejected stop must leave the buffer mapped");

        inventory.release(handle).unwrap();
        assert!(buf.stop_map(&inventory).is_ok());
        assert!(!buf.is_mapped());
    }

    #[test]
    fn stop_map_on_unmapped_buffer_is_a_no_op() {
        let device = Device::open_first().unwrap();
        let buf = RdmaBuffer::local(device, 16);
        let inventory = BufferInventory::new(1);
        assert!(buf.stop_map(&inventory).is_ok());
    }
}
