//! Download engine: one ranged GET below the multipart threshold,
//! bounded-parallel ranged GETs above it, every part writing its own byte
//! range of one shared descriptor. Bytes land in a `.part` temp file,
//! preallocated and never truncated between parts, that is renamed over
//! the destination only after a full flush.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::error::TransferError;
use crate::ops::{self, read_ok, PRESIGN_EXPIRES};
use crate::plan::{part_range, plan_parts, PartPlan};
use crate::progress::spawn_progress_ticker;
use crate::retry::with_retry;
use crate::sign::presigned_url;
use crate::throttle::{self, SpeedLimiter};
use crate::types::{
    ErrorPayload, EventSender, PartDownloadedPayload, ProgressPayload, S3Config, StatPayload,
    TransferEvent, TransferHandle, Tunables,
};

/// Write buffer for sequential downloads (2 MB) - reduces I/O operations
const WRITE_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Inputs for one download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub bucket: String,
    pub key: String,
    /// Final destination; bytes land in `<file>.part` until finalized.
    pub file: PathBuf,
    /// Parts fully written by a previous run, keyed by part number.
    pub downloaded_parts: BTreeMap<u32, bool>,
}

/// Partial-file path used while a download is in flight.
pub fn temp_path(file: &Path) -> PathBuf {
    let mut temp = file.to_path_buf();
    if let Some(extension) = file.extension() {
        let mut ext = extension.to_os_string();
        ext.push(".part");
        temp.set_extension(ext);
    } else {
        temp.set_extension("part");
    }
    temp
}

/// Starts one download and returns its control handle.
pub fn download_file(
    client: Client,
    config: S3Config,
    tunables: Tunables,
    request: DownloadRequest,
) -> TransferHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let stopped = Arc::new(AtomicBool::new(false));
    let abort = Arc::new(AtomicBool::new(false));
    let task = {
        let stopped = Arc::clone(&stopped);
        let abort = Arc::clone(&abort);
        tokio::spawn(async move {
            let result = run_download(client, config, tunables, request, &tx, &stopped).await;
            match result {
                Ok(()) => {
                    let _ = tx.send(TransferEvent::FileDownloaded);
                }
                Err(TransferError::Stopped) if abort.load(Ordering::SeqCst) => {
                    let err = TransferError::Aborted;
                    let _ = tx.send(TransferEvent::Error(ErrorPayload {
                        message: err.to_string(),
                        code: err.code(),
                    }));
                }
                Err(err) => {
                    let _ = tx.send(TransferEvent::Error(ErrorPayload {
                        message: err.to_string(),
                        code: err.code(),
                    }));
                }
            }
        })
    };
    TransferHandle::new(rx, stopped, abort, task)
}

async fn run_download(
    client: Client,
    config: S3Config,
    tunables: Tunables,
    request: DownloadRequest,
    tx: &EventSender,
    stopped: &Arc<AtomicBool>,
) -> Result<(), TransferError> {
    let head = ops::head_object(&client, &config, &tunables, &request.bucket, &request.key).await?;
    let size = head.size;
    let resumable = size >= tunables.multipart_threshold;
    let _ = tx.send(TransferEvent::FileStat(StatPayload {
        total: size,
        resumable,
        upload_id: None,
    }));

    if let Some(parent) = request.file.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let temp = temp_path(&request.file);

    if resumable {
        download_multipart(&client, &config, &tunables, &request, size, &temp, tx, stopped).await?;
    } else {
        download_single(&client, &config, &tunables, &request, size, &temp, tx, stopped).await?;
    }

    // All bytes are on disk; the atomic rename is the verification step the
    // orchestrator observes between the final progress and fileDownloaded.
    tokio::fs::rename(&temp, &request.file)
        .await
        .map_err(|source| TransferError::Finalize {
            path: request.file.display().to_string(),
            source,
        })?;
    Ok(())
}

/// Streams the whole object with one ranged GET into the temp file.
#[allow(clippy::too_many_arguments)]
async fn download_single(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    request: &DownloadRequest,
    size: u64,
    temp: &Path,
    tx: &EventSender,
    stopped: &Arc<AtomicBool>,
) -> Result<(), TransferError> {
    let counters: Arc<Vec<AtomicU64>> = Arc::new(vec![AtomicU64::new(0)]);
    let ticker = spawn_progress_ticker(tx.clone(), Arc::clone(&counters), size);
    let limiter = throttle::speed_limiter(tunables.speed_limit);

    let url = presigned_url(
        config,
        "GET",
        &request.bucket,
        &request.key,
        PRESIGN_EXPIRES,
        &[],
    );
    let range = if size > 0 {
        Some(format!("bytes=0-{}", size - 1))
    } else {
        None
    };

    let result = with_retry(tunables.retry_attempts, tunables.retry_delay(), || {
        let client = client.clone();
        let url = url.clone();
        let range = range.clone();
        let limiter = limiter.clone();
        let counters = Arc::clone(&counters);
        let stopped = Arc::clone(stopped);
        let temp = temp.to_path_buf();
        async move {
            let mut builder = client.get(&url);
            if let Some(range) = range {
                builder = builder.header("Range", range);
            }
            let response = read_ok(builder.send().await?).await?;

            // A fresh attempt restarts the file from byte zero.
            counters[0].store(0, Ordering::SeqCst);
            let mut file = File::create(&temp).await?;
            let mut stream = response.bytes_stream();
            let mut write_buffer: Vec<u8> = Vec::with_capacity(WRITE_BUFFER_SIZE);
            while let Some(chunk) = stream.next().await {
                if stopped.load(Ordering::SeqCst) {
                    return Err(TransferError::Stopped);
                }
                let chunk = chunk?;
                throttle::admit(&limiter, chunk.len()).await;
                write_buffer.extend_from_slice(&chunk);
                counters[0].fetch_add(chunk.len() as u64, Ordering::SeqCst);
                if write_buffer.len() >= WRITE_BUFFER_SIZE {
                    file.write_all(&write_buffer).await?;
                    write_buffer.clear();
                }
            }
            if !write_buffer.is_empty() {
                file.write_all(&write_buffer).await?;
            }
            file.flush().await?;
            Ok(())
        }
    })
    .await;
    ticker.abort();
    result?;

    let _ = tx.send(TransferEvent::Progress(ProgressPayload {
        loaded: size,
        total: size,
    }));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn download_multipart(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    request: &DownloadRequest,
    size: u64,
    temp: &Path,
    tx: &EventSender,
    stopped: &Arc<AtomicBool>,
) -> Result<(), TransferError> {
    let plan = plan_parts(size, tunables.part_size);

    let done: BTreeSet<u32> = request
        .downloaded_parts
        .iter()
        .filter(|(_, &finished)| finished)
        .map(|(&number, _)| number)
        .filter(|&number| number >= 1 && number <= plan.part_count)
        .collect();
    let resuming = !done.is_empty();

    // The temp file is preallocated once and never truncated between parts;
    // every writer owns a disjoint byte range of the shared descriptor.
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(temp)
        .await?;
    let existing = file.metadata().await?.len();
    if existing < size || (!resuming && existing != size) {
        file.set_len(size).await?;
    }
    let file = Arc::new(Mutex::new(file));

    let counters: Arc<Vec<AtomicU64>> = Arc::new(
        (0..plan.part_count)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>(),
    );
    for &number in &done {
        let (start, end) = part_range(plan, number, size);
        counters[(number - 1) as usize].store(end - start, Ordering::SeqCst);
    }
    let ticker = spawn_progress_ticker(tx.clone(), Arc::clone(&counters), size);

    let limiter = throttle::speed_limiter(tunables.speed_limit);
    let fatal = Arc::new(AtomicBool::new(false));
    let first_error: Arc<Mutex<Option<TransferError>>> = Arc::new(Mutex::new(None));

    let semaphore = Arc::new(Semaphore::new(tunables.max_concurrent_parts.max(1)));
    let mut handles = Vec::new();
    for part_number in 1..=plan.part_count {
        if done.contains(&part_number) {
            continue;
        }
        if stopped.load(Ordering::SeqCst) || fatal.load(Ordering::SeqCst) {
            break;
        }
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };

        let client = client.clone();
        let config = config.clone();
        let tunables = tunables.clone();
        let bucket = request.bucket.clone();
        let key = request.key.clone();
        let file = Arc::clone(&file);
        let limiter = limiter.clone();
        let stopped = Arc::clone(stopped);
        let fatal = Arc::clone(&fatal);
        let first_error = Arc::clone(&first_error);
        let counters = Arc::clone(&counters);
        let tx = tx.clone();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            if stopped.load(Ordering::SeqCst) || fatal.load(Ordering::SeqCst) {
                return;
            }
            let counter = &counters[(part_number - 1) as usize];
            let result = download_one_part(
                &client, &config, &tunables, &bucket, &key, plan, part_number, size, &file,
                counter, &limiter, &stopped,
            )
            .await;
            match result {
                Ok(()) => {
                    if stopped.load(Ordering::SeqCst) || fatal.load(Ordering::SeqCst) {
                        return;
                    }
                    let _ = tx.send(TransferEvent::FilePartDownloaded(PartDownloadedPayload {
                        part_number,
                    }));
                }
                Err(err) => {
                    if !fatal.swap(true, Ordering::SeqCst) {
                        *first_error.lock().await = Some(err);
                    }
                }
            }
        });
        handles.push(handle);
    }
    for handle in handles {
        let _ = handle.await;
    }
    ticker.abort();

    if stopped.load(Ordering::SeqCst) {
        return Err(TransferError::Stopped);
    }
    if let Some(err) = first_error.lock().await.take() {
        return Err(err);
    }

    file.lock().await.flush().await?;
    let _ = tx.send(TransferEvent::Progress(ProgressPayload {
        loaded: size,
        total: size,
    }));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn download_one_part(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    bucket: &str,
    key: &str,
    plan: PartPlan,
    part_number: u32,
    size: u64,
    file: &Arc<Mutex<File>>,
    counter: &AtomicU64,
    limiter: &Option<Arc<SpeedLimiter>>,
    stopped: &Arc<AtomicBool>,
) -> Result<(), TransferError> {
    let (start, end) = part_range(plan, part_number, size);
    if end <= start {
        return Ok(());
    }
    let range = format!("bytes={}-{}", start, end - 1);
    let url = presigned_url(config, "GET", bucket, key, PRESIGN_EXPIRES, &[]);

    with_retry(tunables.retry_attempts, tunables.retry_delay(), || {
        let client = client.clone();
        let url = url.clone();
        let range = range.clone();
        let limiter = limiter.clone();
        let stopped = Arc::clone(stopped);
        let file = Arc::clone(file);
        async move {
            // A fresh attempt re-fetches the whole range.
            counter.store(0, Ordering::SeqCst);
            let response = read_ok(client.get(&url).header("Range", range).send().await?).await?;
            let mut stream = response.bytes_stream();
            let mut position = start;
            while let Some(chunk) = stream.next().await {
                if stopped.load(Ordering::SeqCst) {
                    return Err(TransferError::Stopped);
                }
                let chunk = chunk?;
                throttle::admit(&limiter, chunk.len()).await;
                {
                    let mut guard = file.lock().await;
                    guard.seek(SeekFrom::Start(position)).await?;
                    guard.write_all(&chunk).await?;
                }
                position += chunk.len() as u64;
                counter.fetch_add(chunk.len() as u64, Ordering::SeqCst);
            }
            if position != end {
                return Err(TransferError::BadResponse(format!(
                    "short read for part {}: got {} of {} bytes",
                    part_number,
                    position - start,
                    end - start
                )));
            }
            Ok(())
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn mock_config(server: &MockServer) -> S3Config {
        S3Config {
            endpoint: server.address().to_string(),
            region: "us-east-1".into(),
            access_key_id: "ak".into(),
            secret_access_key: "sk".into(),
            secure: false,
        }
    }

    fn small_tunables() -> Tunables {
        Tunables {
            multipart_threshold: 4_000,
            part_size: 1_000,
            max_concurrent_parts: 4,
            retry_attempts: 3,
            retry_delay_ms: 1,
            speed_limit: None,
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn mount_head(server: &MockServer, key: &str, len: usize) {
        // The body sets the Content-Length; the server never sends it for a
        // HEAD request.
        Mock::given(method("HEAD"))
            .and(path(format!("/b/{}", key)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; len])
                    .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
            )
            .mount(server)
            .await;
    }

    async fn collect(mut handle: TransferHandle) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn small_object_streams_through_one_ranged_get() {
        let server = MockServer::start().await;
        let content = body(3_000);
        mount_head(&server, "small.bin", content.len()).await;
        Mock::given(method("GET"))
            .and(path("/b/small.bin"))
            .and(header("Range", "bytes=0-2999"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(content.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("small.bin");
        let handle = download_file(
            Client::new(),
            mock_config(&server),
            small_tunables(),
            DownloadRequest {
                bucket: "b".into(),
                key: "small.bin".into(),
                file: dest.clone(),
                downloaded_parts: BTreeMap::new(),
            },
        );
        let events = collect(handle).await;

        assert!(matches!(events.last(), Some(TransferEvent::FileDownloaded)));
        let written = tokio::fs::read(&dest).await.expect("dest exists");
        assert_eq!(written, content);
        assert!(!temp_path(&dest).exists(), "temp file renamed away");
    }

    #[tokio::test]
    async fn large_object_downloads_ranged_parts_into_place() {
        let server = MockServer::start().await;
        let content = body(10_000);
        mount_head(&server, "big.bin", content.len()).await;
        for part in 0..10u64 {
            let start = part * 1_000;
            let end = start + 1_000;
            Mock::given(method("GET"))
                .and(path("/b/big.bin"))
                .and(header("Range", format!("bytes={}-{}", start, end - 1).as_str()))
                .respond_with(
                    ResponseTemplate::new(206)
                        .set_body_bytes(content[start as usize..end as usize].to_vec()),
                )
                .expect(1)
                .mount(&server)
                .await;
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("big.bin");
        let handle = download_file(
            Client::new(),
            mock_config(&server),
            small_tunables(),
            DownloadRequest {
                bucket: "b".into(),
                key: "big.bin".into(),
                file: dest.clone(),
                downloaded_parts: BTreeMap::new(),
            },
        );
        let events = collect(handle).await;

        assert!(matches!(events.last(), Some(TransferEvent::FileDownloaded)));
        let parts_done = events
            .iter()
            .filter(|e| matches!(e, TransferEvent::FilePartDownloaded(_)))
            .count();
        assert_eq!(parts_done, 10);
        let written = tokio::fs::read(&dest).await.expect("dest exists");
        assert_eq!(written, content);
    }

    #[tokio::test]
    async fn resume_issues_gets_only_for_missing_parts() {
        let server = MockServer::start().await;
        let content = body(5_000);
        mount_head(&server, "resume.bin", content.len()).await;
        // Only parts 3..=5 have mocks; a request for 1 or 2 would 404 and
        // fail the transfer.
        for part in 2..5u64 {
            let start = part * 1_000;
            let end = start + 1_000;
            Mock::given(method("GET"))
                .and(path("/b/resume.bin"))
                .and(header("Range", format!("bytes={}-{}", start, end - 1).as_str()))
                .respond_with(
                    ResponseTemplate::new(206)
                        .set_body_bytes(content[start as usize..end as usize].to_vec()),
                )
                .expect(1)
                .mount(&server)
                .await;
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("resume.bin");
        // Seed the temp file with the first two parts, as a prior run would
        // have left it.
        let temp = temp_path(&dest);
        let mut seeded = content.clone();
        seeded[2_000..].fill(0);
        tokio::fs::write(&temp, &seeded).await.expect("seed temp");

        let mut downloaded_parts = BTreeMap::new();
        downloaded_parts.insert(1, true);
        downloaded_parts.insert(2, true);
        let handle = download_file(
            Client::new(),
            mock_config(&server),
            small_tunables(),
            DownloadRequest {
                bucket: "b".into(),
                key: "resume.bin".into(),
                file: dest.clone(),
                downloaded_parts,
            },
        );
        let events = collect(handle).await;

        assert!(matches!(events.last(), Some(TransferEvent::FileDownloaded)));
        let parts_done: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::FilePartDownloaded(p) => Some(p.part_number),
                _ => None,
            })
            .collect();
        assert!(!parts_done.contains(&1) && !parts_done.contains(&2));
        let written = tokio::fs::read(&dest).await.expect("dest exists");
        assert_eq!(written, content);
    }

    #[tokio::test]
    async fn rename_failure_surfaces_as_finalize_error() {
        let server = MockServer::start().await;
        let content = body(1_000);
        mount_head(&server, "clash", content.len()).await;
        Mock::given(method("GET"))
            .and(path("/b/clash"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(content))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        // Destination is an occupied directory, so the final rename fails.
        let dest = dir.path().join("clash");
        tokio::fs::create_dir(&dest).await.expect("mkdir");
        tokio::fs::write(dest.join("occupant"), b"x")
            .await
            .expect("occupy");

        let handle = download_file(
            Client::new(),
            mock_config(&server),
            small_tunables(),
            DownloadRequest {
                bucket: "b".into(),
                key: "clash".into(),
                file: dest,
                downloaded_parts: BTreeMap::new(),
            },
        );
        let events = collect(handle).await;
        match events.last() {
            Some(TransferEvent::Error(payload)) => {
                assert_eq!(payload.code.as_deref(), Some("finalize"));
            }
            other => panic!("expected finalize error, got {:?}", other),
        }
    }
}
