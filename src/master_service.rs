// Implements the internal logic of the MasterService struct: the node
// registry, the file/chunk namespace with durable metadata, the failure
// detector, and the replication engine.
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::{CommonConfig, MasterConfig};
use crate::error::Result;
use crate::protocol::{
    self, ChunkPlacement, DownloadReply, FileEntry, NodeAddr, NodeStats, NodeStatus, NodeView,
    StatsReply, Status, UploadInitReply,
};

/// Membership record for one storage node. Nodes are never removed; status
/// oscillates ONLINE/OFFLINE as heartbeats arrive and lapse.
#[derive(Clone, Debug)]
pub struct NodeRecord {
    pub address: NodeAddr,
    pub last_heartbeat: Instant,
    pub status: NodeStatus,
    pub stats: NodeStats,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub size: u64,
    pub chunks: Vec<String>, // Order defines the file's byte layout
}

/// Persisted snapshot of the namespace.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Metadata {
    files: HashMap<String, FileRecord>,
    chunk_locations: HashMap<String, Vec<String>>,
}

/// Everything the handlers mutate, guarded by one lock.
#[derive(Debug, Default)]
pub struct MasterState {
    pub nodes: HashMap<String, NodeRecord>,
    pub files: HashMap<String, FileRecord>,
    pub chunk_locations: HashMap<String, Vec<String>>,
}

#[derive(Debug)]
pub struct MasterService {
    pub state: RwLock<MasterState>,
    pub config: MasterConfig,
    pub common_config: CommonConfig,
}

impl MasterService {
    /// Creates the service, recovering any prior namespace from disk.
    pub fn new(config: MasterConfig, common_config: CommonConfig) -> Arc<Self> {
        let mut state = MasterState::default();
        match std::fs::read_to_string(&config.metadata_path) {
            Ok(content) => match serde_json::from_str::<Metadata>(&content) {
                Ok(metadata) => {
                    info!(files = metadata.files.len(), "loaded metadata");
                    state.files = metadata.files;
                    state.chunk_locations = metadata.chunk_locations;
                }
                Err(e) => {
                    error!(error = %e, "failed to parse metadata, starting empty");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!(error = %e, "failed to read metadata, starting empty");
            }
        }

        Arc::new(Self {
            state: RwLock::new(state),
            config,
            common_config,
        })
    }

    /// Serialises `{files, chunk_locations}` to the metadata path. Written
    /// to a temp file and renamed so a crash mid-save cannot corrupt the
    /// previous snapshot. Callers hold the state lock, so writes are serial.
    fn save_metadata(&self, state: &MasterState) -> Result<()> {
        let metadata = Metadata {
            files: state.files.clone(),
            chunk_locations: state.chunk_locations.clone(),
        };
        let json = serde_json::to_vec(&metadata)?;
        let tmp_path = format!("{}.tmp", self.config.metadata_path);
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.config.metadata_path)?;
        Ok(())
    }

    fn persist(&self, state: &MasterState) {
        if let Err(e) = self.save_metadata(state) {
            error!(error = %e, "failed to save metadata");
        }
    }

    /// Upserts the node record. A heartbeat re-admits a node that was
    /// previously marked OFFLINE.
    pub async fn handle_heartbeat(
        &self,
        node_id: String,
        host: String,
        port: u16,
        stats: NodeStats,
    ) {
        let mut state = self.state.write().await;
        let record = NodeRecord {
            address: (host, port),
            last_heartbeat: Instant::now(),
            status: NodeStatus::Online,
            stats,
        };
        if state.nodes.insert(node_id.clone(), record).is_none() {
            info!(node_id = %node_id, "node joined");
        }
    }

    pub async fn stats_snapshot(&self) -> StatsReply {
        let state = self.state.read().await;
        let now = Instant::now();
        let nodes = state
            .nodes
            .iter()
            .map(|(node_id, record)| {
                (
                    node_id.clone(),
                    NodeView {
                        address: record.address.clone(),
                        status: record.status,
                        last_seen_secs: now.duration_since(record.last_heartbeat).as_secs_f64(),
                        stats: record.stats.clone(),
                    },
                )
            })
            .collect();
        StatsReply {
            status: Status::Ok,
            nodes,
        }
    }

    /// Builds the placement plan for an upload: one chunk per block, each
    /// assigned `min(replication_factor, online)` distinct nodes sampled
    /// uniformly without replacement. Nothing is persisted yet; the file
    /// becomes visible only on UPLOAD_SUCCESS.
    pub async fn plan_upload(&self, filename: &str, filesize: u64) -> UploadInitReply {
        let state = self.state.read().await;
        let online: Vec<&NodeRecord> = state
            .nodes
            .values()
            .filter(|record| record.status == NodeStatus::Online)
            .collect();

        if online.is_empty() {
            return UploadInitReply::error("No online nodes");
        }

        let block_size = self.common_config.block_size;
        let num_chunks = (filesize + block_size - 1) / block_size;
        let replicas_per_chunk = self.common_config.replication_factor.min(online.len());

        let mut rng = rand::thread_rng();
        let mut chunks = Vec::with_capacity(num_chunks as usize);
        for index in 0..num_chunks {
            let chunk_id = format!("{}_chunk_{}_{:08x}", filename, index, rng.gen::<u32>());
            let nodes = online
                .choose_multiple(&mut rng, replicas_per_chunk)
                .map(|record| record.address.clone())
                .collect();
            chunks.push(ChunkPlacement { chunk_id, nodes });
        }

        info!(
            filename = %filename,
            filesize = filesize,
            num_chunks = num_chunks,
            "planned upload"
        );
        UploadInitReply::ok(chunks)
    }

    /// Commits an upload: resolves the echoed replica addresses back to node
    /// ids (addresses that no longer match any registered node are dropped),
    /// then installs the file record and chunk locations atomically.
    pub async fn commit_upload(
        &self,
        filename: String,
        filesize: u64,
        chunks_placed: Vec<ChunkPlacement>,
    ) {
        let mut state = self.state.write().await;

        let mut chunk_ids = Vec::with_capacity(chunks_placed.len());
        let mut resolved_locations = Vec::with_capacity(chunks_placed.len());
        for placement in &chunks_placed {
            let mut resolved: Vec<String> = Vec::new();
            for addr in &placement.nodes {
                let node_id = state
                    .nodes
                    .iter()
                    .find(|(_, record)| &record.address == addr)
                    .map(|(node_id, _)| node_id.clone());
                match node_id {
                    Some(node_id) if !resolved.contains(&node_id) => resolved.push(node_id),
                    Some(_) => {}
                    None => {
                        warn!(chunk_id = %placement.chunk_id, address = ?addr, "unresolvable replica address dropped");
                    }
                }
            }
            chunk_ids.push(placement.chunk_id.clone());
            resolved_locations.push((placement.chunk_id.clone(), resolved));
        }

        // Re-uploading an existing name replaces it wholesale: the previous
        // record's chunk entries go away with it.
        if let Some(previous) = state.files.remove(&filename) {
            for chunk_id in previous.chunks {
                state.chunk_locations.remove(&chunk_id);
            }
        }
        for (chunk_id, locations) in resolved_locations {
            state.chunk_locations.insert(chunk_id, locations);
        }
        state.files.insert(
            filename.clone(),
            FileRecord {
                size: filesize,
                chunks: chunk_ids,
            },
        );
        self.persist(&state);
        info!(filename = %filename, filesize = filesize, "file committed");
    }

    /// Resolves a file to its chunk list with the addresses of ONLINE
    /// replicas, in chunk order. Any chunk with zero live replicas fails
    /// the whole request.
    pub async fn plan_download(&self, filename: &str) -> DownloadReply {
        let state = self.state.read().await;
        let record = match state.files.get(filename) {
            Some(record) => record,
            None => return DownloadReply::error("File not found"),
        };

        let mut chunks = Vec::with_capacity(record.chunks.len());
        for chunk_id in &record.chunks {
            let locations = state
                .chunk_locations
                .get(chunk_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let alive: Vec<NodeAddr> = locations
                .iter()
                .filter_map(|node_id| {
                    state
                        .nodes
                        .get(node_id)
                        .filter(|record| record.status == NodeStatus::Online)
                        .map(|record| record.address.clone())
                })
                .collect();
            if alive.is_empty() {
                return DownloadReply::error("Data unavailable");
            }
            chunks.push(ChunkPlacement {
                chunk_id: chunk_id.clone(),
                nodes: alive,
            });
        }

        DownloadReply::ok(record.size, chunks)
    }

    pub async fn list_files(&self) -> Vec<FileEntry> {
        let state = self.state.read().await;
        state
            .files
            .iter()
            .map(|(filename, record)| FileEntry {
                filename: filename.clone(),
                size: record.size,
                status: "Available".to_string(),
            })
            .collect()
    }

    /// Atomically removes the file record and its chunk locations, persists,
    /// and returns the cleanup list of (chunk_id, ONLINE replica addresses)
    /// for best-effort node-side deletion. `None` if the file is unknown.
    pub async fn delete_file(&self, filename: &str) -> Option<Vec<(String, Vec<NodeAddr>)>> {
        let mut state = self.state.write().await;
        let record = state.files.remove(filename)?;

        let mut cleanup = Vec::with_capacity(record.chunks.len());
        for chunk_id in &record.chunks {
            if let Some(locations) = state.chunk_locations.remove(chunk_id) {
                let alive: Vec<NodeAddr> = locations
                    .iter()
                    .filter_map(|node_id| {
                        state
                            .nodes
                            .get(node_id)
                            .filter(|record| record.status == NodeStatus::Online)
                            .map(|record| record.address.clone())
                    })
                    .collect();
                cleanup.push((chunk_id.clone(), alive));
            }
        }
        self.persist(&state);
        info!(filename = %filename, "file deleted");
        Some(cleanup)
    }

    /// Starts the periodic failure detector. Each tick marks silent nodes
    /// OFFLINE, strips them from every chunk's location set, and schedules
    /// replication for the lost chunks.
    pub fn start_failure_detector(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(
                service.common_config.failure_check_interval.max(1),
            ));
            loop {
                ticker.tick().await;
                let failed = service.detect_timeouts().await;
                for node_id in failed {
                    service.handle_node_failure(&node_id).await;
                }
            }
        })
    }

    /// Marks ONLINE nodes whose heartbeats have lapsed as OFFLINE and
    /// returns their ids.
    pub async fn detect_timeouts(&self) -> Vec<String> {
        let timeout = Duration::from_secs(self.common_config.node_timeout);
        let now = Instant::now();
        let mut state = self.state.write().await;

        let mut failed = Vec::new();
        for (node_id, record) in state.nodes.iter_mut() {
            if record.status == NodeStatus::Online
                && now.duration_since(record.last_heartbeat) > timeout
            {
                warn!(node_id = %node_id, "node timed out, marking OFFLINE");
                record.status = NodeStatus::Offline;
                failed.push(node_id.clone());
            }
        }
        failed
    }

    /// Strips the failed node from every chunk location set it appears in
    /// and spawns one replication task per lost chunk.
    pub async fn handle_node_failure(self: &Arc<Self>, failed_node_id: &str) {
        info!(node_id = %failed_node_id, "starting replication for failed node");

        let lost_chunks: Vec<String> = {
            let mut state = self.state.write().await;
            state
                .chunk_locations
                .iter_mut()
                .filter_map(|(chunk_id, locations)| {
                    let position = locations.iter().position(|node_id| node_id == failed_node_id)?;
                    locations.remove(position);
                    Some(chunk_id.clone())
                })
                .collect()
        };

        for chunk_id in lost_chunks {
            let service = Arc::clone(self);
            tokio::spawn(async move {
                service.replicate_chunk(&chunk_id).await;
            });
        }
    }

    /// Copies one chunk from a surviving replica to a fresh node, raising
    /// the replica count by one. Further failures re-trigger it until the
    /// replication factor is restored.
    pub async fn replicate_chunk(&self, chunk_id: &str) {
        let (source_addr, dest_id, dest_addr) = {
            let state = self.state.read().await;
            let locations = match state.chunk_locations.get(chunk_id) {
                Some(locations) => locations,
                None => return, // Deleted since the failure was observed
            };

            let source = locations.iter().find(|node_id| {
                state
                    .nodes
                    .get(*node_id)
                    .map(|record| record.status == NodeStatus::Online)
                    .unwrap_or(false)
            });
            let source_id = match source {
                Some(source_id) => source_id,
                None => {
                    error!(chunk_id = %chunk_id, "DATA LOSS WARNING: no healthy replicas");
                    return;
                }
            };

            let candidates: Vec<&String> = state
                .nodes
                .iter()
                .filter(|(node_id, record)| {
                    record.status == NodeStatus::Online && !locations.contains(*node_id)
                })
                .map(|(node_id, _)| node_id)
                .collect();
            let dest_id = match candidates.choose(&mut rand::thread_rng()) {
                Some(dest_id) => (*dest_id).clone(),
                None => {
                    warn!(chunk_id = %chunk_id, "cannot replicate: no available destination nodes");
                    return;
                }
            };

            let source_addr = state.nodes[source_id].address.clone();
            let dest_addr = state.nodes[&dest_id].address.clone();
            (source_addr, dest_id, dest_addr)
        };

        info!(
            chunk_id = %chunk_id,
            source = ?source_addr,
            dest = %dest_id,
            "replicating chunk"
        );

        let data = match protocol::retrieve_chunk(&source_addr, chunk_id).await {
            Ok(data) => data,
            Err(e) => {
                error!(chunk_id = %chunk_id, error = %e, "replication fetch failed");
                return;
            }
        };
        if let Err(e) = protocol::store_chunk(&dest_addr, chunk_id, &data).await {
            error!(chunk_id = %chunk_id, error = %e, "replication push failed");
            return;
        }

        if self.commit_replica(chunk_id, &dest_id).await {
            info!(chunk_id = %chunk_id, dest = %dest_id, "replication successful");
        } else {
            debug!(chunk_id = %chunk_id, "chunk deleted during replication, dropping result");
        }
    }

    /// Records a freshly stored replica, provided the chunk still exists
    /// (it may have been deleted while the transfer was in flight).
    pub async fn commit_replica(&self, chunk_id: &str, dest_id: &str) -> bool {
        let mut state = self.state.write().await;
        let committed = match state.chunk_locations.get_mut(chunk_id) {
            Some(locations) => {
                if !locations.iter().any(|node_id| node_id == dest_id) {
                    locations.push(dest_id.to_string());
                }
                true
            }
            None => false,
        };
        if committed {
            self.persist(&state);
        }
        committed
    }
}
