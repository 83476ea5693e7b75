use clap::{Arg, Command};
use tokio::net::TcpListener;
use tracing::info;

use chunkfs::config::load_or_default;
use chunkfs::logging::init_tracing;
use chunkfs::master_impl;
use chunkfs::master_service::MasterService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let matches = Command::new("Master")
        .version("1.0")
        .about("Starts the DFS master")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .default_value("config.toml")
                .help("Path to the configuration file"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .expect("has a default value");

    // Load configuration
    let config = load_or_default(config_path);
    let _guard = init_tracing("master", &config.master.log_path, &config.common);

    let service = MasterService::new(config.master.clone(), config.common.clone());
    service.start_failure_detector();

    let listener =
        TcpListener::bind((config.master.host.as_str(), config.master.port)).await?;
    info!(
        host = %config.master.host,
        port = config.master.port,
        "master listening"
    );

    master_impl::serve(service, listener).await;
    Ok(())
}
