//! # RDMA transport
//!
//! The engine, connection and task types the [`crate::executor::Executor`] drives.
//! `buffer` is the application-facing buffer type endpoints and sessions pass
//! around; `engine`, `connection` and `task` are the executor's internal
//! machinery for talking to the transport.

pub mod buffer;
pub mod connection;
pub mod engine;
pub mod task;

pub use buffer::RdmaBuffer;
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use engine::RdmaEngine;
pub use task::{Task, TaskKind, TaskState, TaskTable};
