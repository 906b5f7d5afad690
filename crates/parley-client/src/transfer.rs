//! Chunked file transfer with whole-file integrity check.
//!
//! One engine exists per remote peer and sits on top of that peer's
//! [`SecureChannel`]. Sending a file to N peers is N independent transfers.
//!
//! Sending: a metadata envelope goes first, then chunks in strictly
//! ascending index order, read from the source one chunk at a time. There
//! is no per-chunk acknowledgment; a short pause every few chunks keeps the
//! transport's buffers from filling up.
//!
//! Receiving: chunks are stored by their declared index, so arrival order
//! does not matter. When the last missing index arrives the payload is
//! reassembled, hashed and compared to the declared hash. The record is
//! dropped afterwards whatever the outcome.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use parley_shared::constants::DEFAULT_FILE_TYPE;
use parley_shared::crypto;
use parley_shared::error::ProtocolError;
use parley_shared::protocol::{FileChunkPayload, FileMetadata, PeerEnvelope};

use crate::channel::SecureChannel;
use crate::error::TransferError;

const HASH_READ_BUFFER: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Progress and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub file_id: String,
    pub file_name: String,
    pub done: u32,
    pub total: u32,
    pub direction: TransferDirection,
}

impl TransferProgress {
    /// Completed share in `0.0..=1.0`. A zero-chunk transfer is complete.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            f64::from(self.done) / f64::from(self.total)
        }
    }
}

/// A fully reassembled incoming file.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    /// Reassembled bytes hashed to the declared value.
    pub verified: bool,
    /// `None` when verification failed; unverified content is never handed out.
    pub data: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress(TransferProgress),
    Received(ReceivedFile),
}

// ---------------------------------------------------------------------------
// Outgoing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

/// A file ready to be offered to any number of peers. The content hash is
/// computed once, before any chunk leaves.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub hash: String,
    source: FileSource,
}

impl OutgoingFile {
    /// Stat and hash a file on disk without loading it whole.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let mut file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();

        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; HASH_READ_BUFFER];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(Self {
            file_name,
            file_type: DEFAULT_FILE_TYPE.to_string(),
            file_size,
            hash: hasher.finalize().to_hex().to_string(),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        Self {
            file_name: file_name.into(),
            file_type: DEFAULT_FILE_TYPE.to_string(),
            file_size: data.len() as u64,
            hash: crypto::content_hash(&data),
            source: FileSource::Memory(data),
        }
    }

    pub fn with_file_type(mut self, file_type: impl Into<String>) -> Self {
        self.file_type = file_type.into();
        self
    }

    pub fn source(&self) -> &FileSource {
        &self.source
    }

    pub fn total_chunks(&self, chunk_size: usize) -> Result<u32, TransferError> {
        let chunks = self.file_size.div_ceil(chunk_size as u64);
        u32::try_from(chunks).map_err(|_| TransferError::TooLarge(chunks))
    }

    async fn open(&self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        match &self.source {
            FileSource::Path(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
            FileSource::Memory(data) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
        }
    }
}

struct OutgoingTransfer {
    file_id: String,
    file_name: String,
    file_size: u64,
    total_chunks: u32,
    next_index: u32,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

/// One chunk ready to go out.
#[derive(Debug)]
pub struct OutgoingChunk {
    pub file_id: String,
    pub envelope: PeerEnvelope,
    pub progress: TransferProgress,
    /// Pause before the next chunk to this peer.
    pub pace: bool,
}

#[derive(Debug)]
pub enum OutgoingStep {
    Chunk(OutgoingChunk),
    /// The transfer was dropped; nothing more will be sent for it.
    Failed {
        file_id: String,
        file_name: String,
        error: TransferError,
    },
}

// ---------------------------------------------------------------------------
// Incoming
// ---------------------------------------------------------------------------

struct IncomingTransfer {
    meta: FileMetadata,
    chunks: BTreeMap<u32, Vec<u8>>,
}

impl IncomingTransfer {
    fn progress(&self) -> TransferProgress {
        TransferProgress {
            file_id: self.meta.file_id.clone(),
            file_name: self.meta.file_name.clone(),
            done: self.chunks.len() as u32,
            total: self.meta.total_chunks,
            direction: TransferDirection::Incoming,
        }
    }

    fn finish(self) -> ReceivedFile {
        let mut payload = Vec::with_capacity(self.chunks.values().map(Vec::len).sum());
        for chunk in self.chunks.into_values() {
            payload.extend_from_slice(&chunk);
        }

        let verified = crypto::content_hash(&payload) == self.meta.hash;
        if !verified {
            warn!(
                file_id = %self.meta.file_id,
                file_name = %self.meta.file_name,
                "File failed integrity check"
            );
        }

        ReceivedFile {
            file_id: self.meta.file_id,
            file_name: self.meta.file_name,
            file_type: self.meta.file_type,
            file_size: self.meta.file_size,
            verified,
            data: verified.then(|| Bytes::from(payload)),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct FileTransferEngine {
    chunk_size: usize,
    pace_every: u32,
    incoming: HashMap<String, IncomingTransfer>,
    outgoing: VecDeque<OutgoingTransfer>,
}

impl FileTransferEngine {
    pub fn new(chunk_size: usize, pace_every: u32) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            pace_every,
            incoming: HashMap::new(),
            outgoing: VecDeque::new(),
        }
    }

    /// Queue `file` under `file_id` and return the encrypted metadata
    /// envelope, which must be sent before any chunk from
    /// [`next_chunk`](Self::next_chunk).
    pub async fn start_send(
        &mut self,
        channel: &SecureChannel,
        file_id: &str,
        file: &OutgoingFile,
    ) -> Result<PeerEnvelope, TransferError> {
        let total_chunks = file.total_chunks(self.chunk_size)?;
        let meta = FileMetadata {
            file_id: file_id.to_string(),
            file_name: file.file_name.clone(),
            file_size: file.file_size,
            file_type: file.file_type.clone(),
            total_chunks,
            hash: file.hash.clone(),
        };
        let envelope = PeerEnvelope::EncryptedFileMetadata {
            data: channel.encrypt(&serde_json::to_vec(&meta).map_err(ProtocolError::from)?)?,
        };

        if total_chunks > 0 {
            self.outgoing.push_back(OutgoingTransfer {
                file_id: meta.file_id,
                file_name: meta.file_name,
                file_size: meta.file_size,
                total_chunks,
                next_index: 0,
                reader: file.open().await?,
            });
        }
        Ok(envelope)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Read, encrypt and return the next chunk of the oldest outgoing
    /// transfer. Files to one peer go out one after another.
    pub async fn next_chunk(&mut self, channel: &SecureChannel) -> Option<OutgoingStep> {
        let transfer = self.outgoing.front_mut()?;
        let index = transfer.next_index;

        match read_and_seal(channel, transfer, self.chunk_size).await {
            Ok(envelope) => {
                transfer.next_index += 1;
                let progress = TransferProgress {
                    file_id: transfer.file_id.clone(),
                    file_name: transfer.file_name.clone(),
                    done: transfer.next_index,
                    total: transfer.total_chunks,
                    direction: TransferDirection::Outgoing,
                };
                let file_id = transfer.file_id.clone();
                if transfer.next_index >= transfer.total_chunks {
                    self.outgoing.pop_front();
                    debug!(file_id = %file_id, "Outgoing transfer fully queued");
                }
                Some(OutgoingStep::Chunk(OutgoingChunk {
                    file_id,
                    envelope,
                    progress,
                    pace: self.pace_every > 0 && index % self.pace_every == 0,
                }))
            }
            Err(error) => {
                let failed = self.outgoing.pop_front()?;
                Some(OutgoingStep::Failed {
                    file_id: failed.file_id,
                    file_name: failed.file_name,
                    error,
                })
            }
        }
    }

    /// Stop sending `file_id`. Returns whether it was still queued.
    pub fn abort_outgoing(&mut self, file_id: &str) -> bool {
        let before = self.outgoing.len();
        self.outgoing.retain(|t| t.file_id != file_id);
        self.outgoing.len() != before
    }

    /// Decrypt an `encrypted-file-metadata` payload and open a record for it.
    /// A record with the same id is replaced. A zero-chunk file completes
    /// immediately.
    pub fn handle_metadata(
        &mut self,
        channel: &SecureChannel,
        data: &str,
    ) -> Result<TransferEvent, TransferError> {
        let plaintext = channel.decrypt(data)?;
        let meta: FileMetadata = serde_json::from_slice(&plaintext)
            .map_err(ProtocolError::from)?;

        let transfer = IncomingTransfer {
            meta,
            chunks: BTreeMap::new(),
        };
        if transfer.meta.total_chunks == 0 {
            return Ok(TransferEvent::Received(transfer.finish()));
        }

        let progress = transfer.progress();
        if self
            .incoming
            .insert(transfer.meta.file_id.clone(), transfer)
            .is_some()
        {
            debug!(file_id = %progress.file_id, "Metadata replaced an existing transfer");
        }
        Ok(TransferEvent::Progress(progress))
    }

    /// Decrypt an `encrypted-file-chunk` payload and store it by index.
    ///
    /// `Ok(None)` means the chunk was dropped: unknown file id, index out of
    /// range, or an index already held.
    pub fn handle_chunk(
        &mut self,
        channel: &SecureChannel,
        data: &str,
    ) -> Result<Option<TransferEvent>, TransferError> {
        let plaintext = channel.decrypt(data)?;
        let payload: FileChunkPayload = serde_json::from_slice(&plaintext)
            .map_err(ProtocolError::from)?;

        let Some(transfer) = self.incoming.get_mut(&payload.file_id) else {
            warn!(file_id = %payload.file_id, "Chunk for unknown file dropped");
            return Ok(None);
        };
        if payload.chunk_index >= transfer.meta.total_chunks {
            warn!(
                file_id = %payload.file_id,
                index = payload.chunk_index,
                total = transfer.meta.total_chunks,
                "Chunk index out of range"
            );
            return Ok(None);
        }
        if transfer.chunks.contains_key(&payload.chunk_index) {
            debug!(file_id = %payload.file_id, index = payload.chunk_index, "Duplicate chunk ignored");
            return Ok(None);
        }

        let bytes =
            crypto::from_base64(&payload.data).map_err(|_| TransferError::ChunkEncoding)?;
        transfer.chunks.insert(payload.chunk_index, bytes);

        if transfer.chunks.len() as u32 == transfer.meta.total_chunks {
            let Some(done) = self.incoming.remove(&payload.file_id) else {
                return Ok(None);
            };
            return Ok(Some(TransferEvent::Received(done.finish())));
        }
        Ok(Some(TransferEvent::Progress(transfer.progress())))
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }
}

async fn read_and_seal(
    channel: &SecureChannel,
    transfer: &mut OutgoingTransfer,
    chunk_size: usize,
) -> Result<PeerEnvelope, TransferError> {
    let offset = u64::from(transfer.next_index) * chunk_size as u64;
    let len = transfer.file_size.saturating_sub(offset).min(chunk_size as u64) as usize;

    // A source that shrank since hashing surfaces as UnexpectedEof.
    let mut buf = vec![0u8; len];
    transfer.reader.read_exact(&mut buf).await?;

    let payload = FileChunkPayload {
        file_id: transfer.file_id.clone(),
        chunk_index: transfer.next_index,
        data: crypto::to_base64(&buf),
    };
    let plaintext =
        serde_json::to_vec(&payload).map_err(ProtocolError::from)?;
    Ok(PeerEnvelope::EncryptedFileChunk {
        data: channel.encrypt(&plaintext)?,
    })
}
