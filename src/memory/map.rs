use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::{RdmaError, Result};
use crate::memory::AccessFlags;

/// Opaque byte sequence exported by a started map, sent to a peer so it can build a
/// symmetric map addressing the same region. Carries the remote key and address for
/// the hardware backend; for the loopback backend, `addr` is an index into the
/// process-local loopback registry (tests run both peers in one process).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Descriptor {
    addr: u64,
    rkey: u32,
    len: u32,
}

static LOOPBACK_NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct LoopbackRegistry {
    regions: std::collections::HashMap<u64, Arc<Mutex<Vec<u8>>>>,
}

static LOOPBACK_REGISTRY: Mutex<Option<LoopbackRegistry>> = Mutex::new(None);

fn loopback_register(buf: Arc<Mutex<Vec<u8>>>) -> u64 {
    let id = LOOPBACK_NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let mut guard = LOOPBACK_REGISTRY.lock().expect("loopback registry poisoned");
    guard.get_or_insert_with(Default::default).regions.insert(id, buf);
    id
}

fn loopback_lookup(id: u64) -> Option<Arc<Mutex<Vec<u8>>>> {
    let guard = LOOPBACK_REGISTRY.lock().expect("loopback registry poisoned");
    guard.as_ref().and_then(|r| r.regions.get(&id).cloned())
}

enum Backing {
    #[cfg(feature = "hardware")]
    Hardware { mr: Mutex<ibverbs::MemoryRegion<u8>>, pd: Arc<ibverbs::ProtectionDomain> },
    /// Local loopback-registered region (this side owns the bytes).
    LoopbackLocal { buf: Arc<Mutex<Vec<u8>>>, id: u64 },
    /// Region reconstructed `from_export`, referring to a peer's (possibly
    /// loopback-simulated) region rather than memory owned by this map.
    LoopbackRemote { buf: Arc<Mutex<Vec<u8>>>, id: u64 },
}

/// A pinned, permissioned byte range registered with a device.
///
/// While started, the byte span must not move or be resized; its registration stays
/// live until [`MemoryMap::stop`] succeeds.
pub struct MemoryMap {
    device: Device,
    permissions: AccessFlags,
    len: usize,
    backing: Backing,
}

impl MemoryMap {
    /// Pins `len` bytes for `device` under `permissions`, initialised from `initial`
    /// when given (truncated/zero-padded to `len`).
    pub fn start(device: &Device, len: usize, permissions: AccessFlags, initial: Option<&[u8]>) -> Result<MemoryMap> {
        if permissions.is_empty() {
            return Err(RdmaError::config("invalid permissions: empty set"));
        }

        #[cfg(feature = "hardware")]
        if device.is_hardware() {
            let ctx = device.context();
            let pd = ctx
                .alloc_pd()
                .map(Arc::new)
                .map_err(|_| RdmaError::config("allocating protection domain failed"))?;

            let mut mr = pd
                .allocate::<u8>(len)
                .map_err(|e| RdmaError::config(format!("registering memory region failed: {e}")))?;

            if let Some(bytes) = initial {
                let n = bytes.len().min(len);
                mr[..n].copy_from_slice(&bytes[..n]);
            }

            log::debug!("started hardware memory map of {len} bytes on {}", device.name());

            return Ok(MemoryMap {
                device: device.clone(),
                permissions,
                len,
                backing: Backing::Hardware { mr: Mutex::new(mr), pd },
            });
        }

        let mut bytes = vec![0u8; len];
        if let Some(initial) = initial {
            let n = initial.len().min(len);
            bytes[..n].copy_from_slice(&initial[..n]);
        }
        let buf = Arc::new(Mutex::new(bytes));
        let id = loopback_register(buf.clone());

        log::debug!("started loopback memory map of {len} bytes (id {id}) on {}", device.name());

        Ok(MemoryMap {
            device: device.clone(),
            permissions,
            len,
            backing: Backing::LoopbackLocal { buf, id },
        })
    }

    /// Builds a map that represents a peer's region from an exported descriptor.
    pub fn from_export(descriptor: &[u8], device: &Device) -> Result<MemoryMap> {
        let desc: Descriptor = bincode::deserialize(descriptor)
            .map_err(|e| RdmaError::protocol(format!("malformed memory descriptor: {e}")))?;

        #[cfg(feature = "hardware")]
        if device.is_hardware() {
            // The hardware path never materialises a local MemoryMap for a remote
            // descriptor: the (addr, rkey) pair is handed straight to the RDMA
            // engine's post_read/post_write, which addresses the peer's memory
            // directly. We still keep a map value so callers have one type to
            // reason about; `remote_descriptor()` is what the engine actually uses.
            return Ok(MemoryMap {
                device: device.clone(),
                permissions: AccessFlags::empty(),
                len: desc.len as usize,
                backing: Backing::Hardware {
                    mr: Mutex::new({
                        let ctx = device.context();
                        let pd = ctx
                            .alloc_pd()
                            .map_err(|_| RdmaError::config("allocating protection domain failed"))?;
                        pd.allocate::<u8>(0)
                            .map_err(|e| RdmaError::config(format!("placeholder mr failed: {e}")))?
                    }),
                    pd: {
                        let ctx = device.context();
                        Arc::new(
                            ctx.alloc_pd()
                                .map_err(|_| RdmaError::config("allocating protection domain failed"))?,
                        )
                    },
                },
            });
        }

        let buf = loopback_lookup(desc.addr)
            .ok_or_else(|| RdmaError::protocol("loopback descriptor does not name a known region"))?;

        Ok(MemoryMap {
            device: device.clone(),
            permissions: AccessFlags::empty(),
            len: desc.len as usize,
            backing: Backing::LoopbackRemote { buf, id: desc.addr },
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn permissions(&self) -> AccessFlags {
        self.permissions
    }

    fn require_permission(&self, flag: AccessFlags) -> Result<()> {
        if !self.permissions.contains(flag) {
            return Err(RdmaError::config(format!("missing permission {flag:?} for export")));
        }
        Ok(())
    }

    /// Exports a descriptor suitable for RDMA access (read/write) by a peer.
    pub fn export_rdma(&self) -> Result<Vec<u8>> {
        if !self.permissions.intersects(AccessFlags::RDMA_READ | AccessFlags::RDMA_WRITE) {
            return Err(RdmaError::config("memory map has no RDMA permissions to export"));
        }
        self.export_descriptor()
    }

    /// Exports a descriptor suitable for PCI peer-to-peer access.
    pub fn export_pci(&self) -> Result<Vec<u8>> {
        self.require_permission(AccessFlags::PCI_READ)
            .or_else(|_| self.require_permission(AccessFlags::PCI_WRITE))?;
        self.export_descriptor()
    }

    fn export_descriptor(&self) -> Result<Vec<u8>> {
        let (addr, rkey) = match &self.backing {
            #[cfg(feature = "hardware")]
            Backing::Hardware { mr, .. } => {
                let guard = mr.lock().expect("memory region poisoned");
                ((&guard[0..]).as_ptr() as u64, guard.rkey())
            }
            Backing::LoopbackLocal { id, .. } => (*id, 0),
            Backing::LoopbackRemote { id, .. } => (*id, 0),
        };
        let desc = Descriptor { addr, rkey, len: self.len as u32 };
        bincode::serialize(&desc).map_err(|e| RdmaError::protocol(format!("serializing descriptor failed: {e}")))
    }

    /// Releases pinning. Only reachable through [`crate::memory::BufferInventory::stop_map`]
    /// (typically via [`crate::rdma::buffer::RdmaBuffer::stop_map`]), which refuses the
    /// call while any handle still refers to this map.
    pub(crate) fn stop(self) -> Result<()> {
        log::debug!("stopped memory map of {} bytes", self.len);
        Ok(())
    }

    /// Reads the full pinned byte range. Only meaningful for locally-owned maps.
    pub fn read_local(&self) -> Result<Vec<u8>> {
        match &self.backing {
            #[cfg(feature = "hardware")]
            Backing::Hardware { mr, .. } => Ok(mr.lock().expect("memory region poisoned")[..].to_vec()),
            Backing::LoopbackLocal { buf, .. } | Backing::LoopbackRemote { buf, .. } => {
                Ok(buf.lock().expect("loopback buffer poisoned").clone())
            }
        }
    }

    /// Overwrites the pinned byte range. Only meaningful for locally-owned maps.
    ///
    /// Takes `&self`: DMA-pinned memory is written through regardless of Rust's
    /// aliasing rules, so both backends use interior mutability here rather than
    /// requiring exclusive access to the map.
    pub fn write_local(&self, data: &[u8]) -> Result<()> {
        match &self.backing {
            #[cfg(feature = "hardware")]
            Backing::Hardware { mr, .. } => {
                let mut guard = mr.lock().expect("memory region poisoned");
                let n = data.len().min(guard.len());
                guard[..n].copy_from_slice(&data[..n]);
                Ok(())
            }
            Backing::LoopbackLocal { buf, .. } | Backing::LoopbackRemote { buf, .. } => {
                let mut guard = buf.lock().expect("loopback buffer poisoned");
                let n = data.len().min(guard.len());
                guard[..n].copy_from_slice(&data[..n]);
                Ok(())
            }
        }
    }

    pub(crate) fn loopback_buf(&self) -> Option<Arc<Mutex<Vec<u8>>>> {
        match &self.backing {
            Backing::LoopbackLocal { buf, .. } | Backing::LoopbackRemote { buf, .. } => Some(buf.clone()),
            #[cfg(feature = "hardware")]
            Backing::Hardware { .. } => None,
        }
    }
}
