use std::path::PathBuf;

use clap::Parser;

use rdma_endpoints::config::Config;
use rdma_endpoints::executor::ExecutorConfig;
use rdma_endpoints::server::Server;
use rdma_endpoints::session::server::SessionTimeouts;

/// Serves a set of RDMA endpoints described by a JSON5 config file.
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

    log::info!("serving {} endpoint(s) on {} (rdma: {})", registry.iter().len(), config.control_addr, config.rdma_addr);

    let server = Server::start(device, &config.rdma_addr, ExecutorConfig::default(), registry)?;
    server.serve(&config.control_addr, SessionTimeouts::default()).await?;
    Ok(())
}
