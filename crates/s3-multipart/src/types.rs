use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{
    DEFAULT_CONCURRENT_PARTS, DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_SIZE,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY_MS,
};

/// Connection settings for one S3-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Host (and optional port) of the storage endpoint, without scheme.
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Plain HTTP when false; tests run against local mock servers.
    #[serde(default = "default_secure")]
    pub secure: bool,
}

fn default_secure() -> bool {
    true
}

/// Per-transfer tuning knobs. Range clamping happens in the caller's
/// configuration layer; the engine takes these values as given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunables {
    pub multipart_threshold: u64,
    pub part_size: u64,
    pub max_concurrent_parts: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Byte-rate ceiling for payload traffic, per transfer.
    pub speed_limit: Option<NonZeroU32>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            max_concurrent_parts: DEFAULT_CONCURRENT_PARTS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            speed_limit: None,
        }
    }
}

impl Tunables {
    pub(crate) fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_delay_ms)
    }
}

/// One uploaded part as it appears in CompleteMultipartUpload and in the
/// persisted journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatPayload {
    pub total: u64,
    pub resumable: bool,
    /// Set once a multipart upload id is known; lets the caller persist it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub upload_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub loaded: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUploadedPayload {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartDownloadedPayload {
    pub part_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
}

/// Events emitted by one running transfer. The names and payload shapes
/// cross the worker process boundary and must stay stable.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    FileStat(StatPayload),
    Progress(ProgressPayload),
    FilePartUploaded(PartUploadedPayload),
    FilePartDownloaded(PartDownloadedPayload),
    FileUploaded,
    FileDownloaded,
    Error(ErrorPayload),
}

impl TransferEvent {
    /// Wire name of this event.
    pub fn key(&self) -> &'static str {
        match self {
            TransferEvent::FileStat(_) => "fileStat",
            TransferEvent::Progress(_) => "progress",
            TransferEvent::FilePartUploaded(_) => "filePartUploaded",
            TransferEvent::FilePartDownloaded(_) => "filePartDownloaded",
            TransferEvent::FileUploaded => "fileUploaded",
            TransferEvent::FileDownloaded => "fileDownloaded",
            TransferEvent::Error(_) => "error",
        }
    }

    /// True for the events that end a transfer.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::FileUploaded | TransferEvent::FileDownloaded | TransferEvent::Error(_)
        )
    }
}

pub(crate) type EventSender = mpsc::UnboundedSender<TransferEvent>;

/// Control and observation handle for one running transfer.
pub struct TransferHandle {
    /// Event stream; closed after the terminal event.
    pub events: mpsc::UnboundedReceiver<TransferEvent>,
    stopped: Arc<AtomicBool>,
    abort_requested: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TransferHandle {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<TransferEvent>,
        stopped: Arc<AtomicBool>,
        abort_requested: Arc<AtomicBool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            stopped,
            abort_requested,
            task,
        }
    }

    /// Halts part scheduling. In-flight requests finish but their results
    /// are discarded; a started multipart upload is kept server-side so the
    /// transfer stays resumable.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Like [`stop`](Self::stop), but a started multipart upload is also
    /// aborted server-side.
    pub fn abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Waits for the transfer task to wind down.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}
