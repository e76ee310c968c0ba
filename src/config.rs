//! # Demo configuration
//!
//! Loads the endpoint set the demo binaries serve or drive from a JSON5 file.
//! Grounded on `mycrl-turn-rs`'s `config.rs`, which deserialises a plain struct
//! straight off disk with `serde_json5` rather than a dedicated builder API.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::device::Device;
use crate::endpoint::{EndpointRegistry, OpKind};
use crate::error::{RdmaError, Result};
use crate::service::FnService;

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKindConfig {
    Send,
    Receive,
    Write,
    Read,
}

impl From<OpKindConfig> for OpKind {
    fn from(v: OpKindConfig) -> OpKind {
        match v {
            OpKindConfig::Send => OpKind::Send,
            OpKindConfig::Receive => OpKind::Receive,
            OpKindConfig::Write => OpKind::Write,
            OpKindConfig::Read => OpKind::Read,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct EndpointConfig {
    pub path: String,
    pub op: OpKindConfig,
    pub size: usize,
}

/// One endpoint set, as read off disk by a demo binary.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub device: String,
    pub rdma_addr: String,
    pub control_addr: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RdmaError::config(format!("reading config file {}: {e}", path.display())))?;
        serde_json5::from_str(&text).map_err(|e| RdmaError::config(format!("parsing config file {}: {e}", path.display())))
    }

    /// Opens the configured device.
    pub fn open_device(&self) -> Result<Device> {
        Device::open(&self.device)
    }

    /// Registers every configured endpoint with a no-op handler. Demo binaries
    /// that need real application logic register endpoints by hand instead of
    /// calling this. Endpoints sharing a path share their buffer, so the
    /// configured order within a path decides which op kind's `size` wins.
    pub fn build_registry(&self, device: &Device) -> Result<EndpointRegistry> {
        let registry = EndpointRegistry::new();
        for ep in &self.endpoints {
            let handler = Arc::new(FnService::new(|_: &mut [u8]| Ok(())));
            registry.register_endpoint(ep.path.clone(), ep.op.into(), device.clone(), ep.size, handler)?;
        }
        Ok(registry)
    }
}
