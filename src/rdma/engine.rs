//! # RDMA engine
//!
//! Configures the RC transport, tracks the single connection an executor ever
//! holds, and executes submitted tasks. Grounded on `doca-cpp`'s
//! `internal::RdmaEngine`, which owns the DOCA RDMA context and installs the
//! connection/task callbacks the progress engine later drives.
//!
//! The `hardware` feature backs this with real verbs RC queue pairs. The default
//! build backs it with an in-process loopback transport: SEND/RECEIVE rendezvous
//! over channels registered in a process-global listener table, and READ/WRITE
//! operate directly on the shared byte buffer a remote [`MemoryMap`] descriptor
//! already resolves to (see `memory::map`'s loopback registry), since pinned
//! loopback memory is simply shared, not copied over a wire.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use crate::device::Device;
use crate::error::{RdmaError, Result};
use crate::rdma::buffer::RdmaBuffer;
use crate::rdma::connection::ConnectionId;
use crate::rdma::task::{Task, TaskKind, TaskTable};

static NEXT_CONN_ID: AtomicU32 = AtomicU32::new(1);

fn fresh_conn_id() -> ConnectionId {
    ConnectionId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
}

struct ConnectRequest {
    established_tx: mpsc::SyncSender<bool>,
    to_local_rx: mpsc::Receiver<Vec<u8>>,
    to_peer_tx: mpsc::Sender<Vec<u8>>,
}

struct PendingConnect {
    established_rx: mpsc::Receiver<bool>,
    to_local_rx: mpsc::Receiver<Vec<u8>>,
    to_peer_tx: mpsc::Sender<Vec<u8>>,
}

struct ActiveWire {
    to_local_rx: mpsc::Receiver<Vec<u8>>,
    to_peer_tx: mpsc::Sender<Vec<u8>>,
}

static LISTENERS: Mutex<Option<HashMap<String, mpsc::Sender<ConnectRequest>>>> = Mutex::new(None);

fn register_listener(addr: &str) -> mpsc::Receiver<ConnectRequest> {
    let (tx, rx) = mpsc::channel();
    LISTENERS.lock().expect("listener table poisoned").get_or_insert_with(HashMap::new).insert(addr.to_owned(), tx);
    rx
}

fn lookup_listener(addr: &str) -> Option<mpsc::Sender<ConnectRequest>> {
    LISTENERS.lock().expect("listener table poisoned").as_ref().and_then(|m| m.get(addr).cloned())
}

enum Inner {
    Loopback(LoopbackState),
    #[cfg(feature = "hardware")]
    Hardware(HardwareState),
}

struct LoopbackState {
    listen_rx: Option<mpsc::Receiver<ConnectRequest>>,
    pending_accept: HashMap<ConnectionId, ConnectRequest>,
    connecting: Option<(ConnectionId, PendingConnect)>,
    active: Option<(ConnectionId, ActiveWire)>,
    completed: VecDeque<usize>,
}

#[cfg(feature = "hardware")]
struct HardwareState {
    // Real builds would own the verbs QP, CQ and connection-manager identifiers
    // here. Left unimplemented: exercising this path requires an RDMA-capable NIC,
    // which this codebase never has access to.
    _device: Device,
}

/// Configures and drives RDMA transport for a single executor.
pub struct RdmaEngine {
    device: Device,
    inner: Inner,
}

impl RdmaEngine {
    pub fn new(device: Device) -> Result<RdmaEngine> {
        #[cfg(feature = "hardware")]
        if device.is_hardware() {
            return Ok(RdmaEngine { device: device.clone(), inner: Inner::Hardware(HardwareState { _device: device }) });
        }

        Ok(RdmaEngine {
            device,
            inner: Inner::Loopback(LoopbackState {
                listen_rx: None,
                pending_accept: HashMap::new(),
                connecting: None,
                active: None,
                completed: VecDeque::new(),
            }),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn listen(&mut self, addr: &str) -> Result<()> {
        match &mut self.inner {
            Inner::Loopback(state) => {
                state.listen_rx = Some(register_listener(addr));
                Ok(())
            }
            #[cfg(feature = "hardware")]
            Inner::Hardware(_) => Err(RdmaError::config("hardware RDMA CM listen not implemented")),
        }
    }

    /// Begins connecting to `addr`. Returns the new connection's id; the caller
    /// must poll [`RdmaEngine::poll_established`] until it resolves.
    pub fn connect(&mut self, addr: &str) -> Result<ConnectionId> {
        match &mut self.inner {
            Inner::Loopback(state) => {
                let listener = lookup_listener(addr)
                    .ok_or_else(|| RdmaError::connection(format!("no RDMA listener at {addr}")))?;
                let (to_peer_tx, to_local_rx_for_peer) = mpsc::channel();
                let (to_local_tx_for_peer, to_local_rx) = mpsc::channel();
                let (established_tx, established_rx) = mpsc::sync_channel(1);

                listener
                    .send(ConnectRequest {
                        established_tx,
                        to_local_rx: to_local_rx_for_peer,
                        to_peer_tx: to_local_tx_for_peer,
                    })
                    .map_err(|_| RdmaError::connection("listener is gone"))?;

                let id = fresh_conn_id();
                state.connecting = Some((id, PendingConnect { established_rx, to_local_rx, to_peer_tx }));
                Ok(id)
            }
            #[cfg(feature = "hardware")]
            Inner::Hardware(_) => Err(RdmaError::config("hardware RDMA CM connect not implemented")),
        }
    }

    /// Polls for a newly-arrived inbound connect request. Non-blocking.
    pub fn poll_requests(&mut self) -> Option<ConnectionId> {
        match &mut self.inner {
            Inner::Loopback(state) => {
                let req = state.listen_rx.as_ref()?.try_recv().ok()?;
                let id = fresh_conn_id();
                state.pending_accept.insert(id, req);
                Some(id)
            }
            #[cfg(feature = "hardware")]
            Inner::Hardware(_) => None,
        }
    }

    pub fn accept(&mut self, id: ConnectionId) -> Result<()> {
        match &mut self.inner {
            Inner::Loopback(state) => {
                let req = state
                    .pending_accept
                    .remove(&id)
                    .ok_or_else(|| RdmaError::state("accept on unknown connection"))?;
                let _ = req.established_tx.try_send(true);
                state.active = Some((id, ActiveWire { to_local_rx: req.to_local_rx, to_peer_tx: req.to_peer_tx }));
                Ok(())
            }
            #[cfg(feature = "hardware")]
            Inner::Hardware(_) => Ok(()),
        }
    }

    pub fn reject(&mut self, id: ConnectionId) -> Result<()> {
        match &mut self.inner {
            Inner::Loopback(state) => {
                if let Some(req) = state.pending_accept.remove(&id) {
                    let _ = req.established_tx.try_send(false);
                }
                Ok(())
            }
            #[cfg(feature = "hardware")]
            Inner::Hardware(_) => Ok(()),
        }
    }

    /// Polls whether a connect initiated with [`RdmaEngine::connect`] has resolved.
    /// `Some(true)` means established; `Some(false)` means rejected.
    pub fn poll_established(&mut self) -> Option<bool> {
        match &mut self.inner {
            Inner::Loopback(state) => {
                let (id, pending) = state.connecting.as_ref()?;
                let id = *id;
                match pending.established_rx.try_recv() {
                    Ok(accepted) => {
                        let (_, pending) = state.connecting.take().unwrap();
                        if accepted {
                            state.active =
                                Some((id, ActiveWire { to_local_rx: pending.to_local_rx, to_peer_tx: pending.to_peer_tx }));
                        }
                        Some(accepted)
                    }
                    Err(_) => None,
                }
            }
            #[cfg(feature = "hardware")]
            Inner::Hardware(_) => None,
        }
    }

    pub fn disconnect(&mut self) {
        match &mut self.inner {
            Inner::Loopback(state) => {
                state.active = None;
            }
            #[cfg(feature = "hardware")]
            Inner::Hardware(_) => {}
        }
    }

    pub fn active_connection(&self) -> Option<ConnectionId> {
        match &self.inner {
            Inner::Loopback(state) => state.active.as_ref().map(|(id, _)| *id),
            #[cfg(feature = "hardware")]
            Inner::Hardware(_) => None,
        }
    }

    /// Submits a task, executing it immediately for the loopback backend and
    /// enqueuing its result for the next [`RdmaEngine::progress`] call.
    ///
    /// `recv_timeout` bounds a `Receive` task's wait for the peer's send; it
    /// should track the caller's own completion deadline rather than a fixed
    /// constant, since this call runs inline on the worker thread and anything
    /// longer stalls every other queued operation behind it.
    pub fn submit(
        &mut self,
        table: &TaskTable,
        task: Task,
        local: &RdmaBuffer,
        remote: Option<&RdmaBuffer>,
        recv_timeout: Duration,
    ) -> Result<usize> {
        match &mut self.inner {
            Inner::Loopback(state) => {
                let index = table.submit(task)?;
                let result = Self::execute_loopback(state, table, index, local, remote, recv_timeout);
                let error = result.err().map(|e: RdmaError| e.to_string());
                table.complete(index, error)?;
                state.completed.push_back(index);
                Ok(index)
            }
            #[cfg(feature = "hardware")]
            Inner::Hardware(_) => Err(RdmaError::config("hardware task submission not implemented")),
        }
    }

    fn execute_loopback(
        state: &mut LoopbackState,
        table: &TaskTable,
        index: usize,
        local: &RdmaBuffer,
        remote: Option<&RdmaBuffer>,
        recv_timeout: Duration,
    ) -> Result<()> {
        let kind = table.kind_of(index)?;
        let wire = state.active.as_ref().map(|(_, w)| w);
        match kind {
            TaskKind::Send => {
                let bytes = local.read()?;
                wire.ok_or_else(|| RdmaError::connection("no active connection"))?
                    .to_peer_tx
                    .send(bytes)
                    .map_err(|_| RdmaError::connection("peer is gone"))
            }
            TaskKind::Receive => {
                let wire = wire.ok_or_else(|| RdmaError::connection("no active connection"))?;
                let bytes = wire
                    .to_local_rx
                    .recv_timeout(recv_timeout)
                    .map_err(|_| RdmaError::Timeout(recv_timeout))?;
                local.write(&bytes)
            }
            TaskKind::Read => {
                let remote = remote.ok_or_else(|| RdmaError::state("read task has no remote buffer"))?;
                let bytes = remote.read()?;
                local.write(&bytes)
            }
            TaskKind::Write => {
                let remote = remote.ok_or_else(|| RdmaError::state("write task has no remote buffer"))?;
                let bytes = local.read()?;
                remote.write(&bytes)
            }
        }
    }

    /// Drains up to `max` completed tasks, invoking `on_complete` for each.
    pub fn progress<F: FnMut(usize)>(&mut self, max: usize, mut on_complete: F) -> usize {
        match &mut self.inner {
            Inner::Loopback(state) => {
                let mut n = 0;
                while n < max {
                    match state.completed.pop_front() {
                        Some(index) => {
                            on_complete(index);
                            n += 1;
                        }
                        None => break,
                    }
                }
                n
            }
            #[cfg(feature = "hardware")]
            Inner::Hardware(_) => 0,
        }
    }
}

