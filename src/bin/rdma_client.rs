use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use rdma_endpoints::config::Config;
use rdma_endpoints::executor::ExecutorConfig;
use rdma_endpoints::session::client::ClientTimeouts;
use rdma_endpoints::Client;

/// Drives the RDMA endpoints described by a JSON5 config file against a server.
#[derive(Parser)]
struct Args {
    /// Path to the endpoint-set config file.
    #[arg(long, default_value = "rdma_endpoints.json5")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    simple_logger::init_with_level(log::Level::Info)?;

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let device = config.open_device()?;
    let registry = config.build_registry(&device)?;
    let endpoint_ids: Vec<_> = registry.iter().into_iter().map(|ep| ep.id().clone()).collect();

    let client = Client::start(device, &config.rdma_addr, ExecutorConfig::default(), registry)?;
    client.wait_connected(Duration::from_secs(5))?;

    for id in &endpoint_ids {
        log::info!("requesting processing of endpoint {id}");
        client.request(id, &config.control_addr, ClientTimeouts::default()).await?;
        log::info!("endpoint {id} completed");
    }

    Ok(())
}
