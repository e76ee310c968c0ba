//! # Endpoints and the endpoint registry
//!
//! An endpoint is an immutable named unit of work: a path, an op kind, a device, a
//! pinned buffer and an application handler. Grounded on `doca-cpp`'s endpoint
//! configuration table and on the teacher's single hardcoded buffer-per-connection
//! model, generalised here into a registry keyed on `(path, op kind)` with a
//! per-path advisory lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::device::Device;
use crate::error::{RdmaError, Result};
use crate::memory::{AccessFlags, MemoryMap};
use crate::rdma::buffer::RdmaBuffer;
use crate::service::Service;

/// The four operation kinds an endpoint can be configured with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Send,
    Receive,
    Write,
    Read,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Send => "send",
            OpKind::Receive => "receive",
            OpKind::Write => "write",
            OpKind::Read => "read",
        }
    }

    /// Wire-format op kind byte, per the control protocol's request layout.
    pub fn wire_code(&self) -> u8 {
        match self {
            OpKind::Send => 1,
            OpKind::Receive => 2,
            OpKind::Write => 3,
            OpKind::Read => 4,
        }
    }

    pub fn from_wire_code(code: u8) -> Result<OpKind> {
        match code {
            1 => Ok(OpKind::Send),
            2 => Ok(OpKind::Receive),
            3 => Ok(OpKind::Write),
            4 => Ok(OpKind::Read),
            other => Err(RdmaError::protocol(format!("unknown op kind byte {other}"))),
        }
    }

    /// Permissions `map_all` registers the endpoint's buffer under, per the op-kind
    /// table in the endpoint registry design.
    pub fn permissions(&self) -> AccessFlags {
        match self {
            OpKind::Send | OpKind::Receive => AccessFlags::LOCAL_READ_WRITE,
            OpKind::Write => AccessFlags::LOCAL_READ_WRITE | AccessFlags::RDMA_WRITE,
            OpKind::Read => AccessFlags::LOCAL_READ_WRITE | AccessFlags::RDMA_READ,
        }
    }

    /// True for op kinds that are the *source* of the transfer — their buffer is
    /// read to produce outbound bytes, so the handler must fill it in before the
    /// RDMA operation runs. False for *sink* kinds, whose buffer is overwritten by
    /// the transfer and whose handler only has something meaningful to look at
    /// once it completes.
    pub fn handler_runs_before_transfer(&self) -> bool {
        matches!(self, OpKind::Send | OpKind::Read)
    }

    /// The op kind under which the *peer's* endpoint for the same path is
    /// registered. Send/receive are two-sided and named from each side's own
    /// point of view: a send endpoint here is matched by a receive endpoint
    /// there. Read/write are one-sided — both sides call it the same thing,
    /// since the direction is fixed by the operation itself (a read always pulls,
    /// a write always pushes) rather than by which side names it.
    pub fn peer_op(&self) -> OpKind {
        match self {
            OpKind::Send => OpKind::Receive,
            OpKind::Receive => OpKind::Send,
            OpKind::Write => OpKind::Write,
            OpKind::Read => OpKind::Read,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `endpoint-id = op-kind || "::" || path`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointId {
    pub path: String,
    pub op: OpKind,
}

impl EndpointId {
    pub fn new(path: impl Into<String>, op: OpKind) -> EndpointId {
        EndpointId { path: path.into(), op }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.op, self.path)
    }
}

/// An immutable, named unit of work: path + op kind + device + pinned buffer +
/// application handler. Two endpoints sharing a path but differing in op kind
/// share their buffer so a send on one peer matches a receive on the other.
pub struct Endpoint {
    id: EndpointId,
    size: usize,
    buffer: Arc<RdmaBuffer>,
    handler: Arc<dyn Service>,
}

impl Endpoint {
    pub fn new(path: impl Into<String>, op: OpKind, device: Device, size: usize, handler: Arc<dyn Service>) -> Endpoint {
        let buffer = Arc::new(RdmaBuffer::local(device, size));
        Endpoint { id: EndpointId::new(path, op), size, buffer, handler }
    }

    /// Builds an endpoint over an already-shared buffer, for paths where another
    /// op kind was registered first.
    pub fn with_buffer(id: EndpointId, size: usize, buffer: Arc<RdmaBuffer>, handler: Arc<dyn Service>) -> Endpoint {
        Endpoint { id, size, buffer, handler }
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.id.path
    }

    pub fn op(&self) -> OpKind {
        self.id.op
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn handler(&self) -> &Arc<dyn Service> {
        &self.handler
    }

    pub fn buffer(&self) -> &RdmaBuffer {
        &self.buffer
    }

    /// Clones the handle to this endpoint's buffer for submission to the executor,
    /// which requires owned `Arc<RdmaBuffer>` operands.
    pub fn buffer_arc(&self) -> Arc<RdmaBuffer> {
        self.buffer.clone()
    }

    /// Starts the backing memory map if not already started, with permissions
    /// derived from the op kind.
    pub fn ensure_mapped(&self) -> Result<Arc<MemoryMap>> {
        self.buffer.map(self.id.op.permissions())
    }

    pub fn map(&self) -> Option<Arc<MemoryMap>> {
        self.buffer.memory_map()
    }

    /// Runs the endpoint's handler against its pinned byte range: reads the range
    /// out, hands it to the handler, writes back whatever the handler left there.
    /// Called by the session layer at the phase appropriate to the op kind.
    pub fn invoke_handler(&self) -> Result<()> {
        self.ensure_mapped()?;
        let mut bytes = self.buffer.read()?;
        self.handler
            .call(&mut bytes)
            .map_err(|e| RdmaError::Service { endpoint: self.id.clone(), message: e.to_string() })?;
        self.buffer.write(&bytes)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("id", &self.id.to_string()).field("size", &self.size).finish()
    }
}

/// Maps endpoint-id to endpoint, plus a per-path advisory lock table.
pub struct EndpointRegistry {
    endpoints: Mutex<HashMap<EndpointId, Arc<Endpoint>>>,
    locks: Mutex<HashMap<String, ()>>,
}

impl EndpointRegistry {
    pub fn new() -> EndpointRegistry {
        EndpointRegistry { endpoints: Mutex::new(HashMap::new()), locks: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, endpoint: Endpoint) -> Result<()> {
        let mut guard = self.endpoints.lock().expect("registry poisoned");
        if guard.contains_key(&endpoint.id) {
            return Err(RdmaError::registry(format!("endpoint {} already registered", endpoint.id)));
        }
        guard.insert(endpoint.id.clone(), Arc::new(endpoint));
        Ok(())
    }

    /// Registers an endpoint for `(path, op)`, reusing the buffer of whatever
    /// other op kind is already registered on that path rather than allocating a
    /// fresh one — same path, one buffer, so a send on one endpoint and a receive
    /// on its sibling read and write the same bytes.
    pub fn register_endpoint(
        &self,
        path: impl Into<String>,
        op: OpKind,
        device: Device,
        size: usize,
        handler: Arc<dyn Service>,
    ) -> Result<()> {
        let path = path.into();
        let mut guard = self.endpoints.lock().expect("registry poisoned");
        let id = EndpointId::new(path.clone(), op);
        if guard.contains_key(&id) {
            return Err(RdmaError::registry(format!("endpoint {id} already registered")));
        }
        let sibling = guard.values().find(|e| e.path() == path);
        let endpoint = match sibling {
            Some(sibling) => Endpoint::with_buffer(id.clone(), size, sibling.buffer_arc(), handler),
            None => Endpoint::new(path, op, device, size, handler),
        };
        guard.insert(id, Arc::new(endpoint));
        Ok(())
    }

    pub fn get(&self, id: &EndpointId) -> Result<Arc<Endpoint>> {
        self.endpoints
            .lock()
            .expect("registry poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| RdmaError::registry(format!("no such endpoint: {id}")))
    }

    /// Non-blocking path-keyed lock acquisition. Returns `true` if acquired.
    pub fn try_lock(&self, path: &str) -> bool {
        let mut guard = self.locks.lock().expect("lock table poisoned");
        if guard.contains_key(path) {
            false
        } else {
            guard.insert(path.to_owned(), ());
            true
        }
    }

    pub fn unlock(&self, path: &str) {
        let mut guard = self.locks.lock().expect("lock table poisoned");
        if guard.remove(path).is_none() {
            log::warn!("unlock called on path {path} that was not held");
        }
    }

    /// Starts a memory map for every registered endpoint's buffer that isn't
    /// already mapped, with permissions derived from its op kind.
    pub fn map_all(&self, _device: &Device) -> Result<()> {
        let guard = self.endpoints.lock().expect("registry poisoned");
        for endpoint in guard.values() {
            endpoint.ensure_mapped()?;
        }
        Ok(())
    }

    pub fn iter(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.lock().expect("registry poisoned").values().cloned().collect()
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::service::FnService;

    fn endpoint(path: &str, op: OpKind) -> Endpoint {
        let device = Device::open_first().unwrap();
        Endpoint::new(path, op, device, 64, Arc::new(FnService::new(|_| Ok(()))))
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = EndpointRegistry::new();
        registry.register(endpoint("a", OpKind::Send)).unwrap();
        let err = registry.register(endpoint("a", OpKind::Send)).unwrap_err();
        assert!(matches!(err, RdmaError::Registry { .. }));
    }

    #[test]
    fn same_path_different_op_coexist() {
        let registry = EndpointRegistry::new();
        registry.register(endpoint("a", OpKind::Send)).unwrap();
        registry.register(endpoint("a", OpKind::Receive)).unwrap();
        assert!(registry.get(&EndpointId::new("a", OpKind::Send)).is_ok());
        assert!(registry.get(&EndpointId::new("a", OpKind::Receive)).is_ok());
    }

    #[test]
    fn register_endpoint_shares_buffer_across_op_kinds_on_one_path() {
        let registry = EndpointRegistry::new();
        let device = Device::open_first().unwrap();
        let handler = || Arc::new(FnService::new(|_: &mut [u8]| Ok(())));
        registry.register_endpoint("a", OpKind::Send, device.clone(), 64, handler()).unwrap();
        registry.register_endpoint("a", OpKind::Receive, device, 64, handler()).unwrap();

        let send = registry.get(&EndpointId::new("a", OpKind::Send)).unwrap();
        let receive = registry.get(&EndpointId::new("a", OpKind::Receive)).unwrap();
        assert!(Arc::ptr_eq(&send.buffer_arc(), &receive.buffer_arc()));
    }

    #[test]
    fn lock_is_keyed_on_path_not_op() {
        let registry = EndpointRegistry::new();
        registry.register(endpoint("a", OpKind::Write)).unwrap();
        registry.register(endpoint("a", OpKind::Read)).unwrap();
        assert!(registry.try_lock("a"));
        assert!(!registry.try_lock("a"));
        registry.unlock("a");
        assert!(registry.try_lock("a"));
    }

    #[test]
    fn get_missing_endpoint_fails() {
        let registry = EndpointRegistry::new();
        assert!(registry.get(&EndpointId::new("missing", OpKind::Send)).is_err());
    }
}
