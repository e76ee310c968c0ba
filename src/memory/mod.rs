//! # Memory map and buffer inventory
//!
//! Responsible for pinning a byte range for a device, enforcing a permission set,
//! minting descriptor byte sequences, and allocating transient hardware buffer
//! handles. Grounded on the teacher's `connection::rdma::RdmaServerConnector`, which
//! registers a memory region with `pd.allocate::<T>(size)` and exports an address/key
//! pair over a TCP handshake; generalised here into a permissioned, exportable
//! `MemoryMap` plus a capacity-bounded `BufferInventory`, per `doca-cpp`'s
//! `core::MemoryMap` / `core::BufferInventory` wrappers.

mod inventory;
mod map;

pub use inventory::{BufferHandle, BufferInventory};
pub use map::MemoryMap;

bitflags::bitflags! {
    /// Permission set a memory map is started with. Mirrors `doca::AccessFlags`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_READ    = 0b0000_0001;
        const LOCAL_WRITE   = 0b0000_0010;
        const RDMA_READ     = 0b0000_0100;
        const RDMA_WRITE    = 0b0000_1000;
        const RDMA_ATOMIC   = 0b0001_0000;
        const PCI_READ      = 0b0010_0000;
        const PCI_WRITE     = 0b0100_0000;
        const PCI_RELAXED   = 0b1000_0000;
    }
}

impl AccessFlags {
    pub const LOCAL_READ_WRITE: AccessFlags =
        AccessFlags::LOCAL_READ.union(AccessFlags::LOCAL_WRITE);
}
