//! # Executor
//!
//! The single thread-affine owner of one RDMA engine, its buffer inventory and at
//! most one active connection. External callers submit operations through a
//! thread-safe queue; a worker thread drains it and runs every RDMA callback.
//!
//! Grounded on `doca-cpp`'s `internal::RdmaExecutor`: the startup/shutdown
//! sequence, the connection callback policy (reject a second request, promote
//! requested to active on establishment, clear on failure/disconnect) and the
//! operation-execution steps (allocate buffer handles, submit a task, poll
//! `progress()` until the task cell leaves `submitted`) all follow its method
//! bodies, adapted to the RC transport this crate targets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::device::Device;
use crate::error::{RdmaError, Result};
use crate::memory::BufferInventory;
use crate::rdma::buffer::RdmaBuffer;
use crate::rdma::connection::{Connection, ConnectionId, ConnectionState};
use crate::rdma::engine::RdmaEngine;
use crate::rdma::task::{Task, TaskKind, TaskState, TaskTable};

/// Tunable timeouts, all advisory-overridable per the control-channel design.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub task_completion_timeout: Duration,
    pub connect_timeout: Duration,
    pub requested_state_timeout: Duration,
    pub context_start_timeout: Duration,
    pub buffer_inventory_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            task_completion_timeout: Duration::from_millis(5000),
            connect_timeout: Duration::from_millis(5000),
            requested_state_timeout: Duration::from_millis(5000),
            context_start_timeout: Duration::from_millis(5000),
            buffer_inventory_capacity: 64,
        }
    }
}

/// An RDMA operation submitted for execution by the worker thread.
pub enum Operation {
    Send(Arc<RdmaBuffer>),
    Receive(Arc<RdmaBuffer>),
    Read { local: Arc<RdmaBuffer>, remote: Arc<RdmaBuffer> },
    Write { local: Arc<RdmaBuffer>, remote: Arc<RdmaBuffer> },
}

impl Operation {
    fn kind(&self) -> TaskKind {
        match self {
            Operation::Send(_) => TaskKind::Send,
            Operation::Receive(_) => TaskKind::Receive,
            Operation::Read { .. } => TaskKind::Read,
            Operation::Write { .. } => TaskKind::Write,
        }
    }

    fn local(&self) -> &Arc<RdmaBuffer> {
        match self {
            Operation::Send(b) | Operation::Receive(b) => b,
            Operation::Read { local, .. } | Operation::Write { local, .. } => local,
        }
    }

    fn remote(&self) -> Option<&Arc<RdmaBuffer>> {
        match self {
            Operation::Send(_) | Operation::Receive(_) => None,
            Operation::Read { remote, .. } | Operation::Write { remote, .. } => Some(remote),
        }
    }
}

enum ControlMsg {
    Listen(String, mpsc::SyncSender<Result<()>>),
    Connect(String, mpsc::SyncSender<Result<()>>),
    Op(Operation, mpsc::SyncSender<Result<()>>),
    Shutdown,
}

struct Shared {
    queue: Mutex<VecDeque<ControlMsg>>,
    cond: Condvar,
    running: AtomicBool,
    active_connection: Mutex<Option<ConnectionId>>,
    connect_attempted: AtomicBool,
}

/// The executor API surface callers (sessions, demo binaries) interact with.
pub struct Executor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    /// Runs the startup sequence and spawns the worker thread.
    pub fn start(device: Device, config: ExecutorConfig) -> Result<Arc<Executor>> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            active_connection: Mutex::new(None),
            connect_attempted: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("rdma-executor".into())
            .spawn(move || worker_loop(device, config, worker_shared))
            .map_err(|e| RdmaError::config(format!("spawning executor worker failed: {e}")))?;

        log::debug!("executor started");

        Ok(Arc::new(Executor { shared, worker: Mutex::new(Some(handle)) }))
    }

    fn send(&self, make: impl FnOnce(mpsc::SyncSender<Result<()>>) -> ControlMsg) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(0);
        {
            let mut queue = self.shared.queue.lock().expect("executor queue poisoned");
            queue.push_back(make(tx));
            self.shared.cond.notify_one();
        }
        rx.recv().map_err(|_| RdmaError::Shutdown)?
    }

    pub fn listen(&self, addr: &str) -> Result<()> {
        self.send(|tx| ControlMsg::Listen(addr.to_owned(), tx))
    }

    pub fn connect(&self, addr: &str) -> Result<()> {
        self.shared.connect_attempted.store(true, Ordering::SeqCst);
        self.send(|tx| ControlMsg::Connect(addr.to_owned(), tx))
    }

    pub fn submit(&self, op: Operation) -> Result<()> {
        self.send(|tx| ControlMsg::Op(op, tx))
    }

    /// Blocks-by-polling until an active connection exists or `timeout` expires.
    pub fn wait_for_active_connection(&self, timeout: Duration) -> Result<ConnectionId> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(id) = *self.shared.active_connection.lock().expect("active connection mutex poisoned") {
                return Ok(id);
            }
            if Instant::now() >= deadline {
                return Err(RdmaError::Timeout(timeout));
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    pub fn active_connection(&self) -> Option<ConnectionId> {
        *self.shared.active_connection.lock().expect("active connection mutex poisoned")
    }

    /// Whether [`Executor::connect`] has ever been called, regardless of whether
    /// it has resolved yet. Distinguishes "never connected" from "connecting" so
    /// callers can fail fast on the former without racing the latter.
    pub fn connect_attempted(&self) -> bool {
        self.shared.connect_attempted.load(Ordering::SeqCst)
    }

    /// Shutdown sequence: stop the worker, drain and fail the remaining queue.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let mut queue = self.shared.queue.lock().expect("executor queue poisoned");
            queue.push_back(ControlMsg::Shutdown);
            self.shared.cond.notify_one();
        }
        if let Some(handle) = self.worker.lock().expect("worker mutex poisoned").take() {
            let _ = handle.join();
        }
        log::debug!("executor stopped");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

fn worker_loop(device: Device, config: ExecutorConfig, shared: Arc<Shared>) {
    let mut engine = match RdmaEngine::new(device) {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("executor failed to create RDMA engine: {e}");
            return;
        }
    };
    let inventory = BufferInventory::new(config.buffer_inventory_capacity);
    let task_table = TaskTable::new(config.buffer_inventory_capacity);
    let mut connection: Option<Connection> = None;
    let mut connecting_since: Option<Instant> = None;

    loop {
        poll_connection_events(&mut engine, &shared, &mut connection, &config);
        if let Some(started) = connecting_since {
            match engine.poll_established() {
                Some(true) => {
                    if let Some(id) = engine.active_connection() {
                        let mut conn = Connection::new(id);
                        conn.mark_requested();
                        conn.mark_active();
                        connection = Some(conn);
                        *shared.active_connection.lock().expect("active connection mutex poisoned") = Some(id);
                        log::debug!("connection {id:?} established (connector side)");
                    }
                    connecting_since = None;
                }
                Some(false) => {
                    log::warn!("connect request was rejected by the peer");
                    connecting_since = None;
                }
                None if started.elapsed() >= config.connect_timeout => {
                    log::warn!("connect attempt timed out");
                    connecting_since = None;
                }
                None => {}
            }
        }

        let msg = {
            let mut queue = shared.queue.lock().expect("executor queue poisoned");
            while queue.is_empty() && shared.running.load(Ordering::SeqCst) {
                let (guard, timeout) =
                    shared.cond.wait_timeout(queue, Duration::from_micros(200)).expect("executor queue poisoned");
                queue = guard;
                if timeout.timed_out() {
                    break;
                }
            }
            queue.pop_front()
        };

        let Some(msg) = msg else {
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            continue;
        };

        match msg {
            ControlMsg::Shutdown => {
                drain_queue_with_error(&shared);
                break;
            }
            ControlMsg::Listen(addr, reply) => {
                let result = engine.listen(&addr);
                let _ = reply.send(result);
            }
            ControlMsg::Connect(addr, reply) => {
                let result = engine.connect(&addr).map(|_| ());
                if result.is_ok() {
                    connecting_since = Some(Instant::now());
                }
                let _ = reply.send(result);
            }
            ControlMsg::Op(op, reply) => {
                let result = execute_operation(&mut engine, &inventory, &task_table, op, &config);
                let _ = reply.send(result);
            }
        }
    }

    drain_queue_with_error(&shared);
}

fn poll_connection_events(
    engine: &mut RdmaEngine,
    shared: &Arc<Shared>,
    connection: &mut Option<Connection>,
    config: &ExecutorConfig,
) {
    if let Some(id) = engine.poll_requests() {
        let busy = connection.as_ref().map(|c| c.state() != ConnectionState::Disconnected).unwrap_or(false);
        if busy {
            log::warn!("rejecting connection {id:?}: one is already active or pending");
            let _ = engine.reject(id);
        } else {
            let _ = engine.accept(id);
            let mut conn = Connection::new(id);
            conn.mark_requested();
            // The loopback transport establishes synchronously on accept; a
            // hardware CM would leave this at `Requested` until a later
            // `on_established` event.
            conn.mark_active();
            *connection = Some(conn);
            *shared.active_connection.lock().expect("active connection mutex poisoned") = Some(id);
            log::debug!("connection {id:?} established");
        }
    }

    if let Some(conn) = connection {
        if conn.requested_timed_out(config.requested_state_timeout) {
            log::warn!("connection {:?} dropped: stuck in requested state", conn.id());
            engine.disconnect();
            conn.mark_disconnected();
            *shared.active_connection.lock().expect("active connection mutex poisoned") = None;
        }
    }

    if engine.active_connection().is_none() {
        if let Some(conn) = connection {
            if conn.state() == ConnectionState::Active {
                conn.mark_disconnected();
                *shared.active_connection.lock().expect("active connection mutex poisoned") = None;
            }
        }
    }
}

fn drain_queue_with_error(shared: &Arc<Shared>) {
    let mut queue = shared.queue.lock().expect("executor queue poisoned");
    for msg in queue.drain(..) {
        match msg {
            ControlMsg::Listen(_, reply) | ControlMsg::Connect(_, reply) => {
                let _ = reply.send(Err(RdmaError::Shutdown));
            }
            ControlMsg::Op(_, reply) => {
                let _ = reply.send(Err(RdmaError::Shutdown));
            }
            ControlMsg::Shutdown => {}
        }
    }
}

fn execute_operation(
    engine: &mut RdmaEngine,
    inventory: &BufferInventory,
    task_table: &TaskTable,
    op: Operation,
    config: &ExecutorConfig,
) -> Result<()> {
    if engine.active_connection().is_none() {
        return Err(RdmaError::connection("no active connection"));
    }

    let local = op.local().clone();
    let remote = op.remote().cloned();
    let kind = op.kind();

    let local_map = local.map(crate::memory::AccessFlags::LOCAL_READ_WRITE)?;
    let local_handle = inventory.alloc_by_address(local_map.clone(), 0, local.len())?;
    let remote_handle = match &remote {
        Some(r) => Some(inventory.alloc_by_address(
            r.memory_map().ok_or_else(|| RdmaError::state("remote buffer is unmapped"))?,
            0,
            r.len(),
        )?),
        None => None,
    };

    let task = Task::new(kind, (0, local.len()), None);
    let index = engine.submit(task_table, task, &local, remote.as_deref(), config.task_completion_timeout)?;

    let deadline = Instant::now() + config.task_completion_timeout;
    let result = loop {
        engine.progress(16, |_| {});
        match task_table.state_of(index) {
            Ok(TaskState::Completed) => break Ok(()),
            Ok(TaskState::Error) => {
                let task = task_table.take(index)?;
                break Err(RdmaError::transfer(task.error.unwrap_or_default()));
            }
            Ok(_) if Instant::now() >= deadline => break Err(RdmaError::Timeout(config.task_completion_timeout)),
            Ok(_) => {
                std::thread::sleep(Duration::from_micros(10));
            }
            Err(e) => break Err(e),
        }
    };

    if result.is_ok() {
        let _ = task_table.take(index);
    }

    inventory.release(local_handle)?;
    if let Some(handle) = remote_handle {
        inventory.release(handle)?;
    }

    result
}
