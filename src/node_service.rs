// Implements the internal logic of the storage node: on-disk chunk store
// and the periodic heartbeat emitter.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::config::{CommonConfig, MasterConfig, NodeConfig};
use crate::error::{DfsError, Result};
use crate::protocol::{self, sha256_hex, MasterRequest, NodeAddr};
use crate::stats::StatsSampler;

#[derive(Debug)]
pub struct NodeService {
    pub node_id: String,
    pub port: u16,
    pub storage_path: PathBuf,
    pub master_addr: NodeAddr,
    pub common_config: CommonConfig,
}

impl NodeService {
    pub fn new(
        node_id: &str,
        port: u16,
        node_config: &NodeConfig,
        master_config: &MasterConfig,
        common_config: CommonConfig,
    ) -> Result<Arc<Self>> {
        let storage_path = Path::new(&node_config.storage_root).join(node_id);
        std::fs::create_dir_all(&storage_path)?;

        info!(
            node_id = %node_id,
            port = port,
            storage = %storage_path.display(),
            "node initialized"
        );

        Ok(Arc::new(Self {
            node_id: node_id.to_string(),
            port,
            storage_path,
            master_addr: (master_config.host.clone(), master_config.port),
            common_config,
        }))
    }

    fn chunk_path(&self, chunk_id: &str) -> Result<PathBuf> {
        // Chunk ids are flat file names; anything that could escape the
        // storage directory is rejected.
        if chunk_id.is_empty()
            || chunk_id == "."
            || chunk_id == ".."
            || chunk_id.contains('/')
            || chunk_id.contains('\\')
        {
            return Err(DfsError::InvalidChunkId(chunk_id.to_string()));
        }
        Ok(self.storage_path.join(chunk_id))
    }

    pub async fn store_chunk(&self, chunk_id: &str, data: &[u8]) -> Result<String> {
        let path = self.chunk_path(chunk_id)?;
        tokio::fs::write(&path, data).await?;
        let checksum = sha256_hex(data);
        info!(
            chunk_id = %chunk_id,
            size = data.len(),
            checksum = %&checksum[..8],
            "stored chunk"
        );
        Ok(checksum)
    }

    pub async fn retrieve_chunk(&self, chunk_id: &str) -> Result<Vec<u8>> {
        let path = self.chunk_path(chunk_id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => {
                info!(chunk_id = %chunk_id, size = data.len(), "served chunk");
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DfsError::ChunkNotFound(chunk_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent delete. Returns whether the chunk file existed.
    pub async fn delete_chunk(&self, chunk_id: &str) -> Result<bool> {
        let path = self.chunk_path(chunk_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(chunk_id = %chunk_id, "deleted chunk");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Spawns the heartbeat emitter. Every tick opens a fresh connection to
    /// the master and sends liveness plus freshly sampled stats; no reply is
    /// read. Failures are logged and retried on the next tick.
    pub fn start_heartbeat_emitter(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut sampler = StatsSampler::new();
            let mut interval = time::interval(Duration::from_secs(
                service.common_config.heartbeat_interval,
            ));
            loop {
                interval.tick().await;

                let stats = sampler.sample(&service.storage_path);
                let request = MasterRequest::Heartbeat {
                    node_id: service.node_id.clone(),
                    port: service.port,
                    stats,
                };

                if let Err(e) = protocol::send_only(&service.master_addr, &request).await {
                    warn!(
                        node_id = %service.node_id,
                        master = ?service.master_addr,
                        error = %e,
                        "failed to send heartbeat"
                    );
                }
            }
        })
    }
}
