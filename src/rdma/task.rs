//! RDMA task model and the stable-slot user-data table.
//!
//! Grounded on `doca-cpp`'s `internal::RdmaTask`, which stores a raw `this`
//! pointer as verbs work-request user data — a cyclic-ownership hazard this
//! implementation avoids by handing the provider a small integer index into a
//! per-engine table instead (see the Design Notes on task user-data).

use std::sync::Mutex;

use crate::error::{RdmaError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Send,
    Receive,
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Submitted,
    Completed,
    Error,
}

/// One in-flight or completed RDMA operation.
#[derive(Debug)]
pub struct Task {
    pub kind: TaskKind,
    pub state: TaskState,
    /// Offset and length of the local buffer range this task transfers.
    pub local_range: (usize, usize),
    /// For read/write: the peer's (addr, rkey) pair, taken off the exported
    /// descriptor. Unused for send/receive.
    pub remote: Option<(u64, u32)>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(kind: TaskKind, local_range: (usize, usize), remote: Option<(u64, u32)>) -> Task {
        Task { kind, state: TaskState::Idle, local_range, remote, error: None }
    }
}

/// A fixed-capacity table of slots, indexed by a stable `usize` handed to the
/// provider as work-request user data (`wr_id`). Never a pointer: a completion
/// callback firing after the engine moved on just sees a stale or reused slot,
/// never a dangling reference.
pub struct TaskTable {
    slots: Mutex<Vec<Option<Task>>>,
    free: Mutex<Vec<usize>>,
}

impl TaskTable {
    pub fn new(capacity: usize) -> TaskTable {
        TaskTable {
            slots: Mutex::new((0..capacity).map(|_| None).collect()),
            free: Mutex::new((0..capacity).rev().collect()),
        }
    }

    /// Installs `task` in a free slot and marks it submitted, returning the index
    /// to hand to the provider as user data.
    pub fn submit(&self, mut task: Task) -> Result<usize> {
        task.state = TaskState::Submitted;
        let index = self.free.lock().expect("task table poisoned").pop().ok_or_else(|| {
            RdmaError::resource("task table exhausted: too many operations in flight")
        })?;
        self.slots.lock().expect("task table poisoned")[index] = Some(task);
        Ok(index)
    }

    /// Marks the task at `index` completed or failed, depending on `error`.
    pub fn complete(&self, index: usize, error: Option<String>) -> Result<()> {
        let mut slots = self.slots.lock().expect("task table poisoned");
        let slot = slots.get_mut(index).and_then(|s| s.as_mut()).ok_or_else(|| {
            RdmaError::state(format!("completion for unknown task slot {index}"))
        })?;
        match error {
            Some(message) => {
                slot.state = TaskState::Error;
                slot.error = Some(message);
            }
            None => slot.state = TaskState::Completed,
        }
        Ok(())
    }

    /// Removes and returns a task once the caller has observed its terminal state,
    /// returning the slot to the free list.
    pub fn take(&self, index: usize) -> Result<Task> {
        let task = self
            .slots
            .lock()
            .expect("task table poisoned")
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| RdmaError::state(format!("no task at slot {index}")))?;
        self.free.lock().expect("task table poisoned").push(index);
        Ok(task)
    }

    pub fn kind_of(&self, index: usize) -> Result<TaskKind> {
        self.slots
            .lock()
            .expect("task table poisoned")
            .get(index)
            .and_then(|s| s.as_ref())
            .map(|t| t.kind)
            .ok_or_else(|| RdmaError::state(format!("no task at slot {index}")))
    }

    pub fn state_of(&self, index: usize) -> Result<TaskState> {
        self.slots
            .lock()
            .expect("task table poisoned")
            .get(index)
            .and_then(|s| s.as_ref())
            .map(|t| t.state)
            .ok_or_else(|| RdmaError::state(format!("no task at slot {index}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_complete_take_round_trip() {
        let table = TaskTable::new(2);
        let index = table.submit(Task::new(TaskKind::Send, (0, 16), None)).unwrap();
        assert_eq!(table.state_of(index).unwrap(), TaskState::Submitted);
        table.complete(index, None).unwrap();
        assert_eq!(table.state_of(index).unwrap(), TaskState::Completed);
        let task = table.take(index).unwrap();
        assert_eq!(task.kind, TaskKind::Send);
    }

    #[test]
    fn exhausted_table_rejects_submission() {
        let table = TaskTable::new(1);
        table.submit(Task::new(TaskKind::Send, (0, 1), None)).unwrap();
        assert!(table.submit(Task::new(TaskKind::Send, (0, 1), None)).is_err());
    }
}
