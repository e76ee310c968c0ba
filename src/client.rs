//! Client facade: owns the endpoint registry and executor, connects the RDMA
//! transport up front, and drives one control-channel request per call.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::ToSocketAddrs;

use crate::device::Device;
use crate::endpoint::{EndpointId, EndpointRegistry};
use crate::error::Result;
use crate::executor::{Executor, ExecutorConfig};
use crate::session::client::{request_endpoint_processing, ClientTimeouts};

pub struct Client {
    registry: Arc<EndpointRegistry>,
    executor: Arc<Executor>,
}

impl Client {
    /// Maps every registered endpoint's buffer, starts the executor and begins
    /// connecting the RDMA transport to `rdma_addr`.
    pub fn start(device: Device, rdma_addr: &str, config: ExecutorConfig, registry: EndpointRegistry) -> Result<Client> {
        registry.map_all(&device)?;
        let executor = Executor::start(device, config)?;
        executor.connect(rdma_addr)?;
        Ok(Client { registry: Arc::new(registry), executor })
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Waits for the RDMA connection established in [`Client::start`].
    pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
        self.executor.wait_for_active_connection(timeout).map(|_| ())
    }

    /// Requests processing of the locally-registered endpoint `id` against the
    /// peer listening at `control_addr`.
    pub async fn request(&self, id: &EndpointId, control_addr: impl ToSocketAddrs, timeouts: ClientTimeouts) -> Result<()> {
        let endpoint = self.registry.get(id)?;
        request_endpoint_processing(&endpoint, control_addr, &self.executor, timeouts).await
    }
}
