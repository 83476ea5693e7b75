// Client-side operations: two-phase upload, chunked download, listing,
// deletion, and cluster stats, all over single-exchange connections.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::config::{CommonConfig, MasterConfig};
use crate::error::{DfsError, Result};
use crate::protocol::{
    self, Ack, ChunkPlacement, DownloadReply, FileEntry, ListFilesReply, MasterRequest, NodeAddr,
    NodeView, StatsReply, Status, UploadInitReply,
};

pub struct DfsClient {
    master_addr: NodeAddr,
    block_size: u64,
}

impl DfsClient {
    pub fn new(master_config: &MasterConfig, common_config: &CommonConfig) -> Self {
        Self {
            master_addr: (master_config.host.clone(), master_config.port),
            block_size: common_config.block_size,
        }
    }

    /// Two-phase upload: ask the master for a placement plan, push every
    /// block to its replicas (verifying the checksum each node reports),
    /// then commit. A chunk that no node accepted aborts before commit, so
    /// no partial file ever becomes visible.
    pub async fn upload_file(&self, path: &Path) -> Result<String> {
        let filename = path
            .file_name()
            .ok_or_else(|| DfsError::Config(format!("not a file path: {}", path.display())))?
            .to_string_lossy()
            .to_string();
        let filesize = tokio::fs::metadata(path).await?.len();

        info!(filename = %filename, filesize = filesize, "starting upload");

        let init: UploadInitReply = protocol::request_reply(
            &self.master_addr,
            &MasterRequest::UploadInit {
                filename: filename.clone(),
                filesize,
            },
        )
        .await?;
        if init.status != Status::Ok {
            return Err(DfsError::Remote(
                init.message.unwrap_or_else(|| "upload rejected".to_string()),
            ));
        }

        let mut file = File::open(path).await?;
        let mut chunks_placed = Vec::with_capacity(init.chunks.len());
        for (index, placement) in init.chunks.into_iter().enumerate() {
            let offset = index as u64 * self.block_size;
            let expected = (filesize - offset).min(self.block_size) as usize;
            let mut data = vec![0u8; expected];
            file.read_exact(&mut data).await?;
            let checksum = protocol::sha256_hex(&data);

            let mut placed_on = Vec::new();
            for addr in &placement.nodes {
                match protocol::store_chunk(addr, &placement.chunk_id, &data).await {
                    Ok(remote_checksum) if remote_checksum == checksum => {
                        info!(chunk_id = %placement.chunk_id, node = ?addr, "chunk stored");
                        placed_on.push(addr.clone());
                    }
                    Ok(_) => {
                        warn!(chunk_id = %placement.chunk_id, node = ?addr, "checksum mismatch, replica dropped");
                    }
                    Err(e) => {
                        warn!(chunk_id = %placement.chunk_id, node = ?addr, error = %e, "failed to store replica");
                    }
                }
            }

            if placed_on.is_empty() {
                return Err(DfsError::ChunkPlacementFailed(placement.chunk_id));
            }
            chunks_placed.push(ChunkPlacement {
                chunk_id: placement.chunk_id,
                nodes: placed_on,
            });
        }

        let ack: Ack = protocol::request_reply(
            &self.master_addr,
            &MasterRequest::UploadSuccess {
                filename: filename.clone(),
                filesize,
                chunks_placed,
            },
        )
        .await?;
        if !ack.is_ok() {
            return Err(DfsError::Remote(
                ack.message.unwrap_or_else(|| "commit failed".to_string()),
            ));
        }

        info!(filename = %filename, "upload complete");
        Ok(filename)
    }

    /// Downloads a file into `dest`. Bytes land in a `.part` sibling that is
    /// renamed onto `dest` only once every chunk arrived, so a failed
    /// download leaves no truncated output at the destination path.
    pub async fn download_file(&self, filename: &str, dest: &Path) -> Result<()> {
        let reply: DownloadReply = protocol::request_reply(
            &self.master_addr,
            &MasterRequest::DownloadReq {
                filename: filename.to_string(),
            },
        )
        .await?;
        if reply.status != Status::Ok {
            return Err(DfsError::Remote(
                reply
                    .message
                    .unwrap_or_else(|| "download rejected".to_string()),
            ));
        }

        let part_path = part_path_for(dest);
        let result = fetch_chunks(&reply.chunks, &part_path).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&part_path).await;
            return result;
        }
        tokio::fs::rename(&part_path, dest).await?;
        info!(filename = %filename, dest = %dest.display(), "download complete");
        Ok(())
    }

    pub async fn list_files(&self) -> Result<Vec<FileEntry>> {
        let reply: ListFilesReply =
            protocol::request_reply(&self.master_addr, &MasterRequest::ListFiles).await?;
        Ok(reply.files)
    }

    pub async fn delete_file(&self, filename: &str) -> Result<()> {
        let ack: Ack = protocol::request_reply(
            &self.master_addr,
            &MasterRequest::DeleteFile {
                filename: filename.to_string(),
            },
        )
        .await?;
        if ack.is_ok() {
            Ok(())
        } else {
            Err(DfsError::Remote(
                ack.message.unwrap_or_else(|| "delete failed".to_string()),
            ))
        }
    }

    pub async fn node_stats(&self) -> Result<HashMap<String, NodeView>> {
        let reply: StatsReply =
            protocol::request_reply(&self.master_addr, &MasterRequest::GetStats).await?;
        Ok(reply.nodes)
    }
}

fn part_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn fetch_chunks(chunks: &[ChunkPlacement], part_path: &Path) -> Result<()> {
    let mut out = File::create(part_path).await?;
    for placement in chunks {
        let mut fetched = None;
        for addr in &placement.nodes {
            match protocol::retrieve_chunk(addr, &placement.chunk_id).await {
                Ok(data) => {
                    info!(chunk_id = %placement.chunk_id, node = ?addr, "chunk retrieved");
                    fetched = Some(data);
                    break;
                }
                Err(e) => {
                    warn!(chunk_id = %placement.chunk_id, node = ?addr, error = %e, "failed to fetch replica");
                }
            }
        }
        let data = fetched.ok_or_else(|| DfsError::ChunkUnavailable(placement.chunk_id.clone()))?;
        out.write_all(&data).await?;
    }
    out.flush().await?;
    Ok(())
}
