use clap::{Arg, Command};
use std::path::Path;

use chunkfs::client::DfsClient;
use chunkfs::config::load_or_default;
use chunkfs::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("Client")
        .version("1.0")
        .about("DFS client: upload, download, list, delete, stats")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .default_value("config.toml")
                .help("Path to the configuration file"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("upload").about("Upload a local file").arg(
                Arg::new("path")
                    .value_name("PATH")
                    .help("Local file to upload")
                    .required(true),
            ),
        )
        .subcommand(
            Command::new("download")
                .about("Download a file")
                .arg(
                    Arg::new("filename")
                        .value_name("FILENAME")
                        .help("Name of the file in the DFS")
                        .required(true),
                )
                .arg(
                    Arg::new("dest")
                        .value_name("DEST")
                        .help("Local destination path")
                        .required(true),
                ),
        )
        .subcommand(Command::new("list").about("List stored files"))
        .subcommand(
            Command::new("delete").about("Delete a file").arg(
                Arg::new("filename")
                    .value_name("FILENAME")
                    .help("Name of the file in the DFS")
                    .required(true),
            ),
        )
        .subcommand(Command::new("stats").about("Show node registry stats"))
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .expect("has a default value");
    let config = load_or_default(config_path);
    let _guard = init_tracing("client", &config.client.log_path, &config.common);

    let client = DfsClient::new(&config.master, &config.common);

    match matches.subcommand() {
        Some(("upload", sub)) => {
            let path = sub.get_one::<String>("path").expect("path is required");
            let filename = client.upload_file(Path::new(path)).await?;
            println!("Uploaded '{}'", filename);
        }
        Some(("download", sub)) => {
            let filename = sub
                .get_one::<String>("filename")
                .expect("filename is required");
            let dest = sub.get_one::<String>("dest").expect("dest is required");
            client.download_file(filename, Path::new(dest)).await?;
            println!("Downloaded '{}' to '{}'", filename, dest);
        }
        Some(("list", _)) => {
            let files = client.list_files().await?;
            if files.is_empty() {
                println!("No files stored.");
            }
            for entry in files {
                println!("{}\t{} bytes\t{}", entry.filename, entry.size, entry.status);
            }
        }
        Some(("delete", sub)) => {
            let filename = sub
                .get_one::<String>("filename")
                .expect("filename is required");
            client.delete_file(filename).await?;
            println!("Deleted '{}'", filename);
        }
        Some(("stats", _)) => {
            let nodes = client.node_stats().await?;
            if nodes.is_empty() {
                println!("No nodes have reported yet.");
            }
            let mut node_ids: Vec<_> = nodes.keys().cloned().collect();
            node_ids.sort();
            for node_id in node_ids {
                let view = &nodes[&node_id];
                println!(
                    "{}\t{}:{}\t{:?}\tlast seen {:.1}s ago\tcpu {:.1}%\tram {:.1}%\tdisk {:.1}%",
                    node_id,
                    view.address.0,
                    view.address.1,
                    view.status,
                    view.last_seen_secs,
                    view.stats.cpu,
                    view.stats.ram_percent,
                    view.stats.disk_percent
                );
            }
        }
        _ => unreachable!("subcommand is required"),
    }

    Ok(())
}
