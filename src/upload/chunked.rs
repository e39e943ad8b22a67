use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::files::api::{self, logical_name};
use crate::http::ApiClient;

pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One slice of the source file, tagged the way the backend reassembles it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Destination for chunk transfers.
pub trait ChunkSink {
    fn send_chunk(&self, chunk: Chunk) -> impl Future<Output = Result<()>> + Send;
}

impl ChunkSink for ApiClient {
    async fn send_chunk(&self, chunk: Chunk) -> Result<()> {
        api::upload_chunk(self, chunk.index, &chunk.file_name, chunk.bytes).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Idle,
    Uploading,
    Succeeded,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("no file selected")]
    NoFileSelected,
    #[error("could not open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not read chunk {index} of {}", path.display())]
    Read {
        path: PathBuf,
        index: u64,
        #[source]
        source: io::Error,
    },
    #[error("chunk {} of {total} was not accepted (index {index})", index + 1)]
    Chunk {
        index: u64,
        total: u64,
        #[source]
        source: BoxError,
    },
    #[error("upload of {} failed", path.display())]
    Single {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

impl UploadError {
    /// Index of the chunk that failed, when the failure happened mid-transfer.
    pub fn failed_chunk(&self) -> Option<u64> {
        match self {
            Self::Chunk { index, .. } | Self::Read { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Progress after each accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub status: UploadStatus,
    pub chunks_sent: u64,
    pub total_chunks: u64,
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl UploadProgress {
    /// Completed fraction in `0.0..=1.0`. An empty file counts as complete.
    pub fn fraction(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.chunks_sent as f64 / self.total_chunks as f64
    }

    pub fn percent(&self) -> u8 {
        (self.fraction() * 100.0).round() as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub file_name: String,
    pub total_bytes: u64,
    pub chunks: u64,
}

/// State of one transfer. Lives only for the duration of
/// [`ChunkedUploadManager::upload`]; a failed session is dropped, never
/// resumed.
struct UploadSession {
    source: File,
    path: PathBuf,
    file_name: String,
    total_size: u64,
    chunk_size: u64,
    next_chunk_index: u64,
    bytes_sent: u64,
    status: UploadStatus,
}

impl UploadSession {
    async fn open(path: &Path, chunk_size: u64) -> Result<Self, UploadError> {
        let open_error = |source| UploadError::Open {
            path: path.to_path_buf(),
            source,
        };
        let source = File::open(path).await.map_err(open_error)?;
        let total_size = source.metadata().await.map_err(open_error)?.len();
        Ok(Self {
            source,
            path: path.to_path_buf(),
            file_name: logical_name(path),
            total_size,
            chunk_size,
            next_chunk_index: 0,
            bytes_sent: 0,
            status: UploadStatus::Idle,
        })
    }

    fn total_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    fn progress(&self) -> UploadProgress {
        UploadProgress {
            status: self.status,
            chunks_sent: self.next_chunk_index,
            total_chunks: self.total_chunks(),
            bytes_sent: self.bytes_sent,
            total_bytes: self.total_size,
        }
    }

    /// Read `[index*chunk, min(size, (index+1)*chunk))` from the current
    /// position. Reads are sequential so no seeking is needed.
    async fn read_next(&mut self) -> Result<Chunk, UploadError> {
        let index = self.next_chunk_index;
        let start = index * self.chunk_size;
        let len = self.chunk_size.min(self.total_size - start);

        let mut bytes = Vec::with_capacity(len as usize);
        let read = (&mut self.source)
            .take(len)
            .read_to_end(&mut bytes)
            .await
            .map_err(|source| UploadError::Read {
                path: self.path.clone(),
                index,
                source,
            })?;
        if (read as u64) < len {
            return Err(UploadError::Read {
                path: self.path.clone(),
                index,
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "file shrank during upload"),
            });
        }

        Ok(Chunk {
            index,
            file_name: self.file_name.clone(),
            bytes,
        })
    }
}

/// Sends a file as fixed-size chunks, one at a time, stopping at the first
/// failure.
pub struct ChunkedUploadManager<K> {
    sink: K,
    chunk_size: u64,
}

impl<K: ChunkSink> ChunkedUploadManager<K> {
    /// A zero chunk size is treated as one byte.
    pub fn new(sink: K, chunk_size: u64) -> Self {
        Self {
            sink,
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn upload(
        &self,
        path: Option<&Path>,
        mut on_progress: impl FnMut(UploadProgress),
    ) -> Result<UploadReport, UploadError> {
        let path = path.ok_or(UploadError::NoFileSelected)?;
        let mut session = UploadSession::open(path, self.chunk_size).await?;
        let total = session.total_chunks();
        debug!(
            file = %session.file_name,
            size = session.total_size,
            chunks = total,
            "starting chunked upload"
        );

        session.status = UploadStatus::Uploading;
        on_progress(session.progress());

        while session.next_chunk_index < total {
            let chunk = match session.read_next().await {
                Ok(chunk) => chunk,
                Err(err) => {
                    session.status = UploadStatus::Failed;
                    on_progress(session.progress());
                    return Err(err);
                }
            };
            let index = chunk.index;
            let len = chunk.bytes.len() as u64;

            if let Err(err) = self.sink.send_chunk(chunk).await {
                warn!(index, total, error = %format!("{err:#}"), "chunk rejected; aborting upload");
                session.status = UploadStatus::Failed;
                on_progress(session.progress());
                return Err(UploadError::Chunk {
                    index,
                    total,
                    source: err.into(),
                });
            }

            session.next_chunk_index += 1;
            session.bytes_sent += len;
            debug!(index, sent = session.bytes_sent, "chunk accepted");
            on_progress(session.progress());
        }

        session.status = UploadStatus::Succeeded;
        on_progress(session.progress());
        Ok(UploadReport {
            file_name: session.file_name,
            total_bytes: session.total_size,
            chunks: total,
        })
    }
}
