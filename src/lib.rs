//! # rdma-endpoints
//!
//! An endpoint-oriented RDMA runtime. Application code registers named
//! endpoints — a path, an op kind, a pinned buffer and a [`service::Service`]
//! handler — with an [`endpoint::EndpointRegistry`]. A single-threaded
//! [`executor::Executor`] drives an RC transport underneath; a TCP control
//! channel ([`protocol`], [`session`]) negotiates which endpoint a peer wants
//! processed before the RDMA transfer runs.
//!
//! Built without the `hardware` feature, every [`device::Device`] is a software
//! loopback stand-in: SEND/RECEIVE rendezvous over in-process channels and
//! READ/WRITE operate on memory the two sides already share, so the full
//! executor/session/protocol stack runs and is tested without an RDMA-capable
//! NIC. The `hardware` feature switches the same API onto real verbs RC queue
//! pairs.

pub mod client;
pub mod config;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod memory;
pub mod protocol;
pub mod rdma;
pub mod server;
pub mod service;
pub mod session;

pub use client::Client;
pub use device::Device;
pub use endpoint::{Endpoint, EndpointId, EndpointRegistry, OpKind};
pub use error::{RdmaError, Result};
pub use executor::{Executor, ExecutorConfig, Operation};
pub use server::Server;
pub use service::{FnService, Service};
