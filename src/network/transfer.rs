//! Reliable File Transfer
//!
//! A TCP channel next to the membership socket. Frames carry the same
//! tag-first payloads as datagrams; the server routes them through its own
//! command table. Uploads are keyed by a transfer id so a client may retry
//! a send without the file being written twice.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{read_frame, read_message, write_message, MAX_FRAME_SIZE};
use crate::error::{Error, Result};
use crate::protocol::{
    BincodeCodec, Command, FileUploadAckMessage, FileUploadMessage, Packet, PayloadCodec,
};

/// Handles one command on the reliable channel
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Process a frame body and produce an optional reply
    async fn handle(&self, peer: SocketAddr, body: &[u8]) -> Result<Option<Packet>>;
}

/// Transfer ids remembered for deduplication
const MAX_COMPLETED_TRANSFERS: usize = 4096;

/// Completed uploads, oldest evicted first
#[derive(Debug, Default)]
struct CompletedTransfers {
    stored: HashMap<Uuid, u64>,
    order: VecDeque<Uuid>,
}

impl CompletedTransfers {
    fn get(&self, transfer_id: &Uuid) -> Option<u64> {
        self.stored.get(transfer_id).copied()
    }

    fn insert(&mut self, transfer_id: Uuid, stored_bytes: u64, capacity: usize) {
        if self.stored.insert(transfer_id, stored_bytes).is_some() {
            return;
        }
        self.order.push_back(transfer_id);
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.stored.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.stored.len()
    }
}

/// Decompress an LZ4 block whose size prefix must not exceed `limit`
fn decompress_bounded(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(Error::Transfer("compressed payload too short".into()));
    }
    let (prefix, block) = data.split_at(4);
    let size = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if size > limit {
        return Err(Error::Transfer(format!(
            "decompressed size {} exceeds limit {}",
            size, limit
        )));
    }

    lz4_flex::decompress(block, size)
        .map_err(|e| Error::Transfer(format!("decompression failed: {}", e)))
}

/// Stores uploaded files under a data directory
pub struct UploadHandler {
    data_dir: PathBuf,
    codec: BincodeCodec<FileUploadMessage>,
    completed: Mutex<CompletedTransfers>,
    capacity: usize,
}

impl UploadHandler {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::with_capacity(data_dir, MAX_COMPLETED_TRANSFERS)
    }

    /// Remember at most `capacity` transfer ids
    pub fn with_capacity(data_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            codec: BincodeCodec::new(Command::FileUpload),
            completed: Mutex::new(CompletedTransfers::default()),
            capacity: capacity.max(1),
        }
    }

    /// Target path for an upload: only the final component of the name
    fn target_path(&self, file_name: &str) -> Result<PathBuf> {
        let name = Path::new(file_name)
            .file_name()
            .ok_or_else(|| Error::Transfer(format!("invalid file name '{}'", file_name)))?;
        Ok(self.data_dir.join(name))
    }
}

#[async_trait]
impl FrameHandler for UploadHandler {
    async fn handle(&self, peer: SocketAddr, body: &[u8]) -> Result<Option<Packet>> {
        let upload = self.codec.decode(body)?;

        // Held across the write so a concurrent retry waits for the first copy
        let mut completed = self.completed.lock().await;
        if let Some(stored_bytes) = completed.get(&upload.transfer_id) {
            tracing::debug!("Duplicate upload {} from {}", upload.transfer_id, peer);
            return Ok(Some(Packet::FileUploadAck(FileUploadAckMessage {
                transfer_id: upload.transfer_id,
                stored_bytes,
                duplicate: true,
            })));
        }

        let data = if upload.compressed {
            decompress_bounded(&upload.data, MAX_FRAME_SIZE)?
        } else {
            upload.data
        };

        let path = self.target_path(&upload.file_name)?;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::write(&path, &data).await?;

        let stored_bytes = data.len() as u64;
        completed.insert(upload.transfer_id, stored_bytes, self.capacity);
        tracing::info!("Stored {} ({} bytes) from {}", path.display(), stored_bytes, peer);

        Ok(Some(Packet::FileUploadAck(FileUploadAckMessage {
            transfer_id: upload.transfer_id,
            stored_bytes,
            duplicate: false,
        })))
    }
}

/// TCP server for the reliable channel
pub struct TransferServer {
    listener: TcpListener,
    handlers: Arc<HashMap<Command, Arc<dyn FrameHandler>>>,
}

impl TransferServer {
    /// Bind the listener and register the upload handler
    pub async fn bind(bind_address: &str, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await.map_err(|e| Error::Bind {
            address: bind_address.to_string(),
            reason: e.to_string(),
        })?;

        let mut handlers: HashMap<Command, Arc<dyn FrameHandler>> = HashMap::new();
        handlers.insert(Command::FileUpload, Arc::new(UploadHandler::new(data_dir)));

        Ok(Self {
            listener,
            handlers: Arc::new(handlers),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Transfer server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer)) => {
                            let handlers = Arc::clone(&self.handlers);
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = cancel.cancelled() => {}
                                    result = handle_connection(socket, peer, handlers) => {
                                        if let Err(e) = result {
                                            tracing::warn!("Transfer connection from {} closed: {}", peer, e);
                                        }
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        tracing::info!("Transfer server stopped");
        Ok(())
    }
}

/// Serve frames from one connection until it closes
async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    handlers: Arc<HashMap<Command, Arc<dyn FrameHandler>>>,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let body = match read_frame(&mut reader).await {
            Ok(body) => body,
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };

        let tag = *body.first().ok_or(Error::EmptyPacket)?;
        let command = Command::from_tag(tag)?;
        let handler = handlers.get(&command).ok_or(Error::UnknownCommand(tag))?;

        tracing::trace!("{} from {} ({} bytes)", command, peer, body.len());
        if let Some(reply) = handler.handle(peer, &body).await? {
            write_message(&mut writer, &reply).await?;
        }
    }

    Ok(())
}

/// Client side of the reliable channel
#[derive(Debug, Clone)]
pub struct TransferClient {
    connect_timeout: Duration,
    request_timeout: Duration,
    retries: u32,
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

impl TransferClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
            retries: 3,
        }
    }

    /// Read `path` and upload it to `address`
    pub async fn upload_file(&self, address: &str, path: &Path, compress: bool) -> Result<FileUploadAckMessage> {
        let contents = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::Transfer(format!("invalid file name '{}'", path.display())))?
            .to_string();

        let data = if compress {
            lz4_flex::compress_prepend_size(&contents)
        } else {
            contents
        };

        self.send(
            address,
            FileUploadMessage {
                transfer_id: Uuid::new_v4(),
                file_name,
                compressed: compress,
                data,
            },
        )
        .await
    }

    /// Send an upload, retrying transient failures with the same transfer id
    pub async fn send(&self, address: &str, upload: FileUploadMessage) -> Result<FileUploadAckMessage> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(address, &upload).await {
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    tracing::warn!("Upload attempt {} to {} failed: {}, retrying", attempt, address, e);
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                result => return result,
            }
        }
    }

    async fn send_once(&self, address: &str, upload: &FileUploadMessage) -> Result<FileUploadAckMessage> {
        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
        };

        let exchange = async {
            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, &Packet::FileUpload(upload.clone())).await?;
            read_message(&mut reader).await
        };

        let reply = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| Error::ConnectionTimeout(address.to_string()))??;

        match reply {
            Packet::FileUploadAck(ack) if ack.transfer_id == upload.transfer_id => Ok(ack),
            Packet::FileUploadAck(ack) => Err(Error::Transfer(format!(
                "acknowledgement for unexpected transfer {}",
                ack.transfer_id
            ))),
            other => Err(Error::Transfer(format!(
                "unexpected reply {}",
                other.command()
            ))),
        }
    }
}
