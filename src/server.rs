//! Server facade: owns the endpoint registry and executor, listens on both the
//! RDMA transport and the TCP control channel, and spawns one session per
//! accepted connection.

use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};

use crate::device::Device;
use crate::endpoint::EndpointRegistry;
use crate::error::Result;
use crate::executor::{Executor, ExecutorConfig};
use crate::session::server::{serve_connection, SessionTimeouts};

pub struct Server {
    registry: Arc<EndpointRegistry>,
    executor: Arc<Executor>,
}

impl Server {
    /// Maps every registered endpoint's buffer, starts the executor and begins
    /// listening for inbound RDMA connections.
    pub fn start(device: Device, rdma_addr: &str, config: ExecutorConfig, registry: EndpointRegistry) -> Result<Server> {
        registry.map_all(&device)?;
        let executor = Executor::start(device, config)?;
        executor.listen(rdma_addr)?;
        Ok(Server { registry: Arc::new(registry), executor })
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Accepts control-channel connections until the socket errors out, spawning
    /// one session task per connection.
    pub async fn serve(&self, control_addr: impl ToSocketAddrs, timeouts: SessionTimeouts) -> Result<()> {
        let listener = TcpListener::bind(control_addr).await?;
        loop {
            let (socket, peer) = listener.accept().await?;
            log::info!("accepted control connection from {peer}");
            let registry = self.registry.clone();
            let executor = self.executor.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(socket, registry, executor, timeouts).await {
                    log::warn!("session with {peer} ended with an error: {e}");
                }
            });
        }
    }
}
