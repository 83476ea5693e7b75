// Dispatches framed requests arriving at a storage node. One connection
// carries one exchange; the handler replies and the connection is closed.
use serde_json::Value;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, warn};

use crate::error::Result;
use crate::node_service::NodeService;
use crate::protocol::{
    read_frame, read_payload, write_frame, Ack, NodeRequest, RetrieveChunkReply, StoreChunkReply,
};

/// Accept loop: one spawned task per connection.
pub async fn serve(service: Arc<NodeService>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    handle_connection(service, stream).await;
                });
            }
            Err(e) => {
                error!(node_id = %service.node_id, error = %e, "accept failed");
            }
        }
    }
}

pub async fn handle_connection(service: Arc<NodeService>, mut stream: TcpStream) {
    if let Err(e) = dispatch(&service, &mut stream).await {
        warn!(node_id = %service.node_id, error = %e, "error handling connection");
    }
}

async fn dispatch(service: &NodeService, stream: &mut TcpStream) -> Result<()> {
    let value: Value = read_frame(stream).await?;
    let request: NodeRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(_) => {
            // Unknown command: log and close.
            warn!(node_id = %service.node_id, "unknown command");
            return Ok(());
        }
    };

    match request {
        NodeRequest::StoreChunk { chunk_id, size } => {
            handle_store_chunk(service, stream, &chunk_id, size).await
        }
        NodeRequest::RetrieveChunk { chunk_id } => {
            handle_retrieve_chunk(service, stream, &chunk_id).await
        }
        NodeRequest::DeleteChunk { chunk_id } => {
            handle_delete_chunk(service, stream, &chunk_id).await
        }
    }
}

async fn handle_store_chunk(
    service: &NodeService,
    stream: &mut TcpStream,
    chunk_id: &str,
    size: u64,
) -> Result<()> {
    let data = read_payload(stream, size).await?;
    match service.store_chunk(chunk_id, &data).await {
        Ok(checksum) => write_frame(stream, &StoreChunkReply::ok(checksum)).await,
        Err(e) => {
            error!(chunk_id = %chunk_id, error = %e, "failed to store chunk");
            write_frame(stream, &StoreChunkReply::error(e.to_string())).await
        }
    }
}

async fn handle_retrieve_chunk(
    service: &NodeService,
    stream: &mut TcpStream,
    chunk_id: &str,
) -> Result<()> {
    match service.retrieve_chunk(chunk_id).await {
        Ok(data) => {
            write_frame(stream, &RetrieveChunkReply::ok(data.len() as u64)).await?;
            stream.write_all(&data).await?;
            stream.flush().await?;
            Ok(())
        }
        Err(crate::error::DfsError::ChunkNotFound(_)) => {
            write_frame(stream, &RetrieveChunkReply::error("Chunk not found")).await
        }
        Err(e) => {
            error!(chunk_id = %chunk_id, error = %e, "failed to read chunk");
            write_frame(stream, &RetrieveChunkReply::error(e.to_string())).await
        }
    }
}

async fn handle_delete_chunk(
    service: &NodeService,
    stream: &mut TcpStream,
    chunk_id: &str,
) -> Result<()> {
    match service.delete_chunk(chunk_id).await {
        Ok(true) => write_frame(stream, &Ack::ok()).await,
        Ok(false) => write_frame(stream, &Ack::ok_with("Chunk not found")).await,
        Err(e) => {
            error!(chunk_id = %chunk_id, error = %e, "failed to delete chunk");
            write_frame(stream, &Ack::error(e.to_string())).await
        }
    }
}
