//! Multipart transfer engine for S3-compatible object storage.
//!
//! One call transfers one file: a single-shot PUT/GET below the multipart
//! threshold, bounded-parallel part transfers above it, with resumable part
//! state and fixed-delay retry per API call. Callers observe a transfer
//! through the event stream on its [`TransferHandle`].

mod download;
mod error;
mod ops;
mod plan;
mod progress;
mod retry;
mod sign;
mod throttle;
mod types;
mod upload;
mod xml;

pub use download::{download_file, DownloadRequest};
pub use error::TransferError;
pub use ops::{
    abort_multipart_upload, head_object, list_objects_page, put_empty_object, ObjectHead,
    ObjectPage, ObjectSummary,
};
pub use plan::{part_range, plan_parts, PartPlan};
pub use sign::encode_uri_path;
pub use types::{
    ErrorPayload, PartDownloadedPayload, PartUploadedPayload, ProgressPayload, S3Config,
    StatPayload, TransferEvent, TransferHandle, Tunables, UploadedPart,
};
pub use upload::{upload_file, UploadRequest};

/// Default multipart threshold: files at or above this size use multipart.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;
/// Lowest usable multipart threshold.
pub const MIN_MULTIPART_THRESHOLD: u64 = 4 * 1024 * 1024;
/// Highest usable threshold; a single PUT cannot exceed 5 GiB.
pub const MAX_MULTIPART_THRESHOLD: u64 = 5 * 1024 * 1024 * 1024;
/// Default part size: 8 MiB per chunk.
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;
/// Smallest part size accepted by the storage API.
pub const MIN_PART_SIZE: u64 = 4 * 1024 * 1024;
/// Largest part size accepted by the storage API.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;
/// Protocol limit on the number of parts in one multipart upload.
pub const MAX_PART_COUNT: u64 = 10_000;
/// Default number of concurrent part transfers per file.
pub const DEFAULT_CONCURRENT_PARTS: usize = 10;
/// Attempts per individual API call before the error is surfaced.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
/// Fixed delay between retry attempts, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
