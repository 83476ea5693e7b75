// Length-prefixed JSON framing and the typed request/response envelopes
// shared by master, node, and client. Every structured message is a 4-byte
// big-endian length followed by that many bytes of UTF-8 JSON; bulk chunk
// bodies are raw bytes following the envelope that announces their size.
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{DfsError, Result};

/// Upper bound on a single frame or announced chunk body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Host/port pair as it appears on the wire: `[host, port]`.
pub type NodeAddr = (String, u16);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "OFFLINE")]
    Offline,
}

/// Resource usage sampled by a node immediately before each heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeStats {
    pub cpu: f64,
    pub ram_percent: f64,
    pub ram_used: u64,
    pub disk_percent: f64,
    pub disk_free: u64,
}

/// One chunk and the replica addresses that hold (or should hold) it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChunkPlacement {
    pub chunk_id: String,
    pub nodes: Vec<NodeAddr>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MasterRequest {
    #[serde(rename = "HEARTBEAT")]
    Heartbeat {
        node_id: String,
        port: u16,
        stats: NodeStats,
    },
    #[serde(rename = "GET_STATS")]
    GetStats,
    #[serde(rename = "UPLOAD_INIT")]
    UploadInit { filename: String, filesize: u64 },
    #[serde(rename = "UPLOAD_SUCCESS")]
    UploadSuccess {
        filename: String,
        filesize: u64,
        chunks_placed: Vec<ChunkPlacement>,
    },
    #[serde(rename = "DOWNLOAD_REQ")]
    DownloadReq { filename: String },
    #[serde(rename = "LIST_FILES")]
    ListFiles,
    #[serde(rename = "DELETE_FILE")]
    DeleteFile { filename: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeRequest {
    #[serde(rename = "STORE_CHUNK")]
    StoreChunk { chunk_id: String, size: u64 },
    #[serde(rename = "RETRIEVE_CHUNK")]
    RetrieveChunk { chunk_id: String },
    #[serde(rename = "DELETE_CHUNK")]
    DeleteChunk { chunk_id: String },
}

/// Plain status reply, with an optional message on error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ack {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            message: None,
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadInitReply {
    pub status: Status,
    #[serde(default)]
    pub chunks: Vec<ChunkPlacement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl UploadInitReply {
    pub fn ok(chunks: Vec<ChunkPlacement>) -> Self {
        Self {
            status: Status::Ok,
            chunks,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            chunks: Vec::new(),
            message: Some(message.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadReply {
    pub status: Status,
    #[serde(default)]
    pub filesize: u64,
    #[serde(default)]
    pub chunks: Vec<ChunkPlacement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DownloadReply {
    pub fn ok(filesize: u64, chunks: Vec<ChunkPlacement>) -> Self {
        Self {
            status: Status::Ok,
            filesize,
            chunks,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            filesize: 0,
            chunks: Vec::new(),
            message: Some(message.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListFilesReply {
    pub status: Status,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// Registry snapshot entry returned by GET_STATS. The monotonic heartbeat
/// timestamp is reported as seconds elapsed since the last beat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeView {
    pub address: NodeAddr,
    pub status: NodeStatus,
    pub last_seen_secs: f64,
    pub stats: NodeStats,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsReply {
    pub status: Status,
    #[serde(default)]
    pub nodes: HashMap<String, NodeView>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreChunkReply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StoreChunkReply {
    pub fn ok(checksum: String) -> Self {
        Self {
            status: Status::Ok,
            checksum: Some(checksum),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            checksum: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrieveChunkReply {
    pub status: Status,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RetrieveChunkReply {
    pub fn ok(size: u64) -> Self {
        Self {
            status: Status::Ok,
            size,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            size: 0,
            message: Some(message.into()),
        }
    }
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(DfsError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

/// Send one framed JSON message: 4-byte big-endian length, then the body.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(DfsError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed JSON message. A short read means the peer closed the
/// connection and fails the exchange.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    read_exact_or_closed(reader, &mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DfsError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut body = vec![0u8; len];
    read_exact_or_closed(reader, &mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Read exactly `size` raw bytes following a JSON envelope.
pub async fn read_payload<R>(reader: &mut R, size: u64) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let size = size as usize;
    if size > MAX_FRAME_LEN {
        return Err(DfsError::FrameTooLarge {
            size,
            max: MAX_FRAME_LEN,
        });
    }
    let mut data = vec![0u8; size];
    read_exact_or_closed(reader, &mut data).await?;
    Ok(data)
}

pub async fn connect(addr: &NodeAddr) -> Result<TcpStream> {
    Ok(TcpStream::connect((addr.0.as_str(), addr.1)).await?)
}

/// One request-response exchange on a fresh connection.
pub async fn request_reply<Req, Reply>(addr: &NodeAddr, request: &Req) -> Result<Reply>
where
    Req: Serialize,
    Reply: DeserializeOwned,
{
    let mut stream = connect(addr).await?;
    write_frame(&mut stream, request).await?;
    read_frame(&mut stream).await
}

/// Fire-and-forget send (used for heartbeats, which get no reply).
pub async fn send_only<Req>(addr: &NodeAddr, request: &Req) -> Result<()>
where
    Req: Serialize,
{
    let mut stream = connect(addr).await?;
    write_frame(&mut stream, request).await
}

/// Push a chunk body to a node and return the checksum it computed.
pub async fn store_chunk(addr: &NodeAddr, chunk_id: &str, data: &[u8]) -> Result<String> {
    let mut stream = connect(addr).await?;
    write_frame(
        &mut stream,
        &NodeRequest::StoreChunk {
            chunk_id: chunk_id.to_string(),
            size: data.len() as u64,
        },
    )
    .await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    let reply: StoreChunkReply = read_frame(&mut stream).await?;
    match reply.status {
        Status::Ok => Ok(reply.checksum.unwrap_or_default()),
        Status::Error => Err(DfsError::Remote(
            reply.message.unwrap_or_else(|| "store failed".to_string()),
        )),
    }
}

/// Fetch a chunk body from a node.
pub async fn retrieve_chunk(addr: &NodeAddr, chunk_id: &str) -> Result<Vec<u8>> {
    let mut stream = connect(addr).await?;
    write_frame(
        &mut stream,
        &NodeRequest::RetrieveChunk {
            chunk_id: chunk_id.to_string(),
        },
    )
    .await?;
    let reply: RetrieveChunkReply = read_frame(&mut stream).await?;
    match reply.status {
        Status::Ok => read_payload(&mut stream, reply.size).await,
        Status::Error => Err(DfsError::Remote(
            reply
                .message
                .unwrap_or_else(|| "retrieve failed".to_string()),
        )),
    }
}

/// Ask a node to delete a chunk. Deleting an absent chunk still acks OK.
pub async fn delete_chunk(addr: &NodeAddr, chunk_id: &str) -> Result<Ack> {
    request_reply(
        addr,
        &NodeRequest::DeleteChunk {
            chunk_id: chunk_id.to_string(),
        },
    )
    .await
}

/// SHA-256 checksum of a byte buffer, hex-encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let request = MasterRequest::UploadInit {
            filename: "data.bin".to_string(),
            filesize: 2_500_000,
        };
        write_frame(&mut a, &request).await.unwrap();
        let value: Value = read_frame(&mut b).await.unwrap();
        assert_eq!(value["type"], "UPLOAD_INIT");
        assert_eq!(value["filename"], "data.bin");
        assert_eq!(value["filesize"], 2_500_000);
    }

    #[tokio::test]
    async fn test_short_read_is_connection_closed() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        // Announce 100 bytes but close after the prefix.
        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        drop(a);
        let result: Result<Value> = read_frame(&mut b).await;
        assert!(matches!(result, Err(DfsError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        let result: Result<Value> = read_frame(&mut b).await;
        assert!(matches!(result, Err(DfsError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_payload_follows_envelope() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let reply = RetrieveChunkReply::ok(5);
        write_frame(&mut a, &reply).await.unwrap();
        a.write_all(b"hello").await.unwrap();
        let got: RetrieveChunkReply = read_frame(&mut b).await.unwrap();
        assert_eq!(got.status, Status::Ok);
        let data = read_payload(&mut b, got.size).await.unwrap();
        assert_eq!(&data, b"hello");
    }

    #[test]
    fn test_unknown_type_does_not_decode() {
        let value = json!({"type": "BOGUS"});
        assert!(serde_json::from_value::<MasterRequest>(value).is_err());
    }

    #[test]
    fn test_address_wire_shape() {
        let placement = ChunkPlacement {
            chunk_id: "f_chunk_0_00c0ffee".to_string(),
            nodes: vec![("127.0.0.1".to_string(), 6000)],
        };
        let value = serde_json::to_value(&placement).unwrap();
        assert_eq!(value["nodes"][0], json!(["127.0.0.1", 6000]));
    }

    #[test]
    fn test_error_reply_shape() {
        let value = serde_json::to_value(Ack::error("Unknown command")).unwrap();
        assert_eq!(value, json!({"status": "ERROR", "message": "Unknown command"}));
    }

    #[test]
    fn test_sha256_hex() {
        // Well-known digest of the empty input.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
