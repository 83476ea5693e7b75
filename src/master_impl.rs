// Routes framed requests arriving at the master to the corresponding
// MasterService operation. Every connection carries one exchange.
use serde_json::Value;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, warn};

use crate::error::Result;
use crate::master_service::MasterService;
use crate::protocol::{
    self, read_frame, write_frame, Ack, ListFilesReply, MasterRequest, NodeAddr, Status,
};

/// Accept loop: one spawned task per connection.
pub async fn serve(service: Arc<MasterService>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    handle_connection(service, stream).await;
                });
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
    }
}

pub async fn handle_connection(service: Arc<MasterService>, mut stream: TcpStream) {
    if let Err(e) = dispatch(&service, &mut stream).await {
        warn!(error = %e, "client handler error");
    }
}

async fn dispatch(service: &Arc<MasterService>, stream: &mut TcpStream) -> Result<()> {
    let peer = stream.peer_addr()?;
    let value: Value = read_frame(stream).await?;
    let request: MasterRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(_) => {
            write_frame(stream, &Ack::error("Unknown command")).await?;
            return Ok(());
        }
    };

    match request {
        MasterRequest::Heartbeat {
            node_id,
            port,
            stats,
        } => {
            // The node's address is its connection source plus the port it
            // reported listening on. No reply.
            service
                .handle_heartbeat(node_id, peer.ip().to_string(), port, stats)
                .await;
            Ok(())
        }
        MasterRequest::GetStats => {
            let reply = service.stats_snapshot().await;
            write_frame(stream, &reply).await
        }
        MasterRequest::UploadInit { filename, filesize } => {
            let reply = service.plan_upload(&filename, filesize).await;
            write_frame(stream, &reply).await
        }
        MasterRequest::UploadSuccess {
            filename,
            filesize,
            chunks_placed,
        } => {
            service.commit_upload(filename, filesize, chunks_placed).await;
            write_frame(stream, &Ack::ok()).await
        }
        MasterRequest::DownloadReq { filename } => {
            let reply = service.plan_download(&filename).await;
            write_frame(stream, &reply).await
        }
        MasterRequest::ListFiles => {
            let reply = ListFilesReply {
                status: Status::Ok,
                files: service.list_files().await,
            };
            write_frame(stream, &reply).await
        }
        MasterRequest::DeleteFile { filename } => match service.delete_file(&filename).await {
            Some(cleanup) => {
                // The client gets its OK as soon as the metadata mutation is
                // durable; node-side chunk removal is best effort.
                tokio::spawn(cleanup_chunks(cleanup));
                write_frame(stream, &Ack::ok()).await
            }
            None => write_frame(stream, &Ack::error("File not found")).await,
        },
    }
}

async fn cleanup_chunks(cleanup: Vec<(String, Vec<NodeAddr>)>) {
    for (chunk_id, addresses) in cleanup {
        for addr in addresses {
            if let Err(e) = protocol::delete_chunk(&addr, &chunk_id).await {
                warn!(
                    chunk_id = %chunk_id,
                    address = ?addr,
                    error = %e,
                    "failed to clean up chunk"
                );
            }
        }
    }
}
