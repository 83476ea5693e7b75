use clap::{Arg, Command};
use tokio::net::TcpListener;
use tracing::info;

use chunkfs::config::{load_or_default, NodeConfig};
use chunkfs::logging::init_tracing;
use chunkfs::node_impl;
use chunkfs::node_service::NodeService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let matches = Command::new("Node")
        .version("1.0")
        .about("Starts a storage node")
        .arg(
            Arg::new("id")
                .value_name("NODE_ID")
                .help("Node identifier (e.g., node_1)")
                .required(true),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Listen port (derived from ports_start when omitted)"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .default_value("config.toml")
                .help("Path to the configuration file"),
        )
        .get_matches();

    let node_id = matches.get_one::<String>("id").expect("id is required");
    let config_path = matches
        .get_one::<String>("config")
        .expect("has a default value");

    // Load configuration
    let config = load_or_default(config_path);
    let _guard = init_tracing(node_id, &config.node.log_path, &config.common);

    let port = match matches.get_one::<String>("port") {
        Some(port) => port.parse()?,
        None => derive_port(&config.node, node_id),
    };

    let service = NodeService::new(
        node_id,
        port,
        &config.node,
        &config.master,
        config.common.clone(),
    )?;
    service.start_heartbeat_emitter();

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(node_id = %node_id, port = port, "node listening");

    node_impl::serve(service, listener).await;
    Ok(())
}

/// `node_1` gets `ports_start`, `node_2` the next port, and so on; ids
/// without a numeric suffix fall back to `ports_start`.
fn derive_port(node_config: &NodeConfig, node_id: &str) -> u16 {
    node_id
        .rsplit('_')
        .next()
        .and_then(|suffix| suffix.parse::<u16>().ok())
        .filter(|n| *n >= 1)
        .map(|n| node_config.ports_start + n - 1)
        .unwrap_or(node_config.ports_start)
}
