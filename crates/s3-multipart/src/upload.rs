//! Upload engine: a single PUT below the multipart threshold,
//! bounded-parallel part uploads above it, with resume by server-side part
//! listing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use reqwest::Client;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::error::TransferError;
use crate::ops::{self, read_ok, PRESIGN_EXPIRES};
use crate::plan::{part_range, plan_parts, PartPlan};
use crate::progress::spawn_progress_ticker;
use crate::retry::with_retry;
use crate::sign::presigned_url;
use crate::throttle::{self, SpeedLimiter};
use crate::types::{
    ErrorPayload, EventSender, PartUploadedPayload, ProgressPayload, S3Config, StatPayload,
    TransferEvent, TransferHandle, Tunables, UploadedPart,
};
use crate::{MAX_PART_COUNT, MAX_PART_SIZE};

/// Inputs for one upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bucket: String,
    pub key: String,
    pub file: PathBuf,
    /// Existing multipart upload to resume, if any.
    pub upload_id: Option<String>,
    /// Journal-seeded parts. The server-side listing takes precedence; this
    /// map is only trusted when the listing itself cannot be fetched.
    pub parts: Vec<UploadedPart>,
}

/// Starts one upload and returns its control handle.
pub fn upload_file(
    client: Client,
    config: S3Config,
    tunables: Tunables,
    request: UploadRequest,
) -> TransferHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let stopped = Arc::new(AtomicBool::new(false));
    let abort = Arc::new(AtomicBool::new(false));
    let task = {
        let stopped = Arc::clone(&stopped);
        let abort = Arc::clone(&abort);
        tokio::spawn(async move {
            let result = run_upload(client, config, tunables, request, &tx, &stopped, &abort).await;
            match result {
                Ok(()) => {
                    let _ = tx.send(TransferEvent::FileUploaded);
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

async fn run_upload(
    client: Client,
    config: S3Config,
    tunables: Tunables,
    request: UploadRequest,
    tx: &EventSender,
    stopped: &Arc<AtomicBool>,
    abort: &Arc<AtomicBool>,
) -> Result<(), TransferError> {
    let meta = tokio::fs::metadata(&request.file).await?;
    let size = meta.len();
    if size > MAX_PART_COUNT * MAX_PART_SIZE {
        return Err(TransferError::ObjectTooLarge { size });
    }

    if size < tunables.multipart_threshold {
        let _ = tx.send(TransferEvent::FileStat(StatPayload {
            total: size,
            resumable: false,
            upload_id: None,
        }));
        upload_single(&client, &config, &tunables, &request, size, tx, stopped).await
    } else {
        upload_multipart(&client, &config, &tunables, &request, size, tx, stopped, abort).await
    }
}

/// Uploads the whole file with one PUT, reading it into memory first.
async fn upload_single(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    request: &UploadRequest,
    size: u64,
    tx: &EventSender,
    stopped: &Arc<AtomicBool>,
) -> Result<(), TransferError> {
    let buffer = tokio::fs::read(&request.file).await?;
    if stopped.load(Ordering::SeqCst) {
        return Err(TransferError::Stopped);
    }
    let _ = tx.send(TransferEvent::Progress(ProgressPayload {
        loaded: 0,
        total: size,
    }));

    let limiter = throttle::speed_limiter(tunables.speed_limit);
    throttle::admit(&limiter, buffer.len()).await;

    let url = presigned_url(
        config,
        "PUT",
        &request.bucket,
        &request.key,
        PRESIGN_EXPIRES,
        &[],
    );
    with_retry(tunables.retry_attempts, tunables.retry_delay(), || {
        let client = client.clone();
        let url = url.clone();
        let body = buffer.clone();
        async move {
            read_ok(client.put(&url).body(body).send().await?).await?;
            Ok(())
        }
    })
    .await?;

    if stopped.load(Ordering::SeqCst) {
        return Err(TransferError::Stopped);
    }
    let _ = tx.send(TransferEvent::Progress(ProgressPayload {
        loaded: size,
        total: size,
    }));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn upload_multipart(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    request: &UploadRequest,
    size: u64,
    tx: &EventSender,
    stopped: &Arc<AtomicBool>,
    abort: &Arc<AtomicBool>,
) -> Result<(), TransferError> {
    let plan = plan_parts(size, tunables.part_size);

    // Resolve the upload id and the server-side view of finished parts.
    let (upload_id, seeded) = match &request.upload_id {
        Some(id) => {
            match ops::list_parts(client, config, tunables, &request.bucket, &request.key, id)
                .await
            {
                Ok(parts) => (id.clone(), parts),
                Err(TransferError::Status { status: 404, .. }) => {
                    log::warn!("upload {} vanished server-side, starting over", id);
                    let fresh = ops::create_multipart_upload(
                        client,
                        config,
                        tunables,
                        &request.bucket,
                        &request.key,
                    )
                    .await?;
                    (fresh, Vec::new())
                }
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => {
                    log::warn!("part listing failed ({}), trusting journal parts", err);
                    (id.clone(), request.parts.clone())
                }
            }
        }
        None => {
            let fresh = ops::create_multipart_upload(
                client,
                config,
                tunables,
                &request.bucket,
                &request.key,
            )
            .await?;
            (fresh, Vec::new())
        }
    };

    let _ = tx.send(TransferEvent::FileStat(StatPayload {
        total: size,
        resumable: true,
        upload_id: Some(upload_id.clone()),
    }));

    let done: BTreeMap<u32, String> = seeded
        .into_iter()
        .filter(|p| p.part_number >= 1 && p.part_number <= plan.part_count)
        .map(|p| (p.part_number, p.etag))
        .collect();

    // Per-part offsets; the ticker re-sums these on every tick. Seeded
    // parts short-circuit without a network call but still count.
    let counters: Arc<Vec<AtomicU64>> = Arc::new(
        (0..plan.part_count)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>(),
    );
    for &number in done.keys() {
        let (start, end) = part_range(plan, number, size);
        counters[(number - 1) as usize].store(end - start, Ordering::SeqCst);
    }
    let ticker = spawn_progress_ticker(tx.clone(), Arc::clone(&counters), size);

    let limiter = throttle::speed_limiter(tunables.speed_limit);
    let fatal = Arc::new(AtomicBool::new(false));
    let first_error: Arc<Mutex<Option<TransferError>>> = Arc::new(Mutex::new(None));
    let completed: Arc<Mutex<Vec<UploadedPart>>> = Arc::new(Mutex::new(
        done.iter()
            .map(|(&part_number, etag)| UploadedPart {
                part_number,
                etag: etag.clone(),
            })
            .collect(),
    ));

    let semaphore = Arc::new(Semaphore::new(tunables.max_concurrent_parts.max(1)));
    let mut handles = Vec::new();
    for part_number in 1..=plan.part_count {
        if done.contains_key(&part_number) {
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
        let file = request.file.clone();
        let upload_id = upload_id.clone();
        let limiter = limiter.clone();
        let stopped = Arc::clone(stopped);
        let fatal = Arc::clone(&fatal);
        let first_error = Arc::clone(&first_error);
        let completed = Arc::clone(&completed);
        let counters = Arc::clone(&counters);
        let tx = tx.clone();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            if stopped.load(Ordering::SeqCst) || fatal.load(Ordering::SeqCst) {
                return;
            }
            let result = upload_one_part(
                &client, &config, &tunables, &bucket, &key, &file, &upload_id, plan,
                part_number, size, &limiter,
            )
            .await;
            match result {
                Ok(etag) => {
                    // Results of requests that outlived a stop are discarded.
                    if stopped.load(Ordering::SeqCst) || fatal.load(Ordering::SeqCst) {
                        return;
                    }
                    let (start, end) = part_range(plan, part_number, size);
                    counters[(part_number - 1) as usize].store(end - start, Ordering::SeqCst);
                    completed.lock().await.push(UploadedPart {
                        part_number,
                        etag: etag.clone(),
                    });
                    let _ = tx.send(TransferEvent::FilePartUploaded(PartUploadedPayload {
                        part_number,
                        etag,
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

    if abort.load(Ordering::SeqCst) {
        abort_quietly(client, config, tunables, request, &upload_id).await;
        return Err(TransferError::Aborted);
    }
    if stopped.load(Ordering::SeqCst) {
        return Err(TransferError::Stopped);
    }
    if let Some(err) = first_error.lock().await.take() {
        if !err.is_retryable() {
            abort_quietly(client, config, tunables, request, &upload_id).await;
        }
        return Err(err);
    }

    let mut parts = completed.lock().await.clone();
    parts.sort_by_key(|part| part.part_number);
    ops::complete_multipart_upload(
        client,
        config,
        tunables,
        &request.bucket,
        &request.key,
        &upload_id,
        &parts,
    )
    .await?;

    let _ = tx.send(TransferEvent::Progress(ProgressPayload {
        loaded: size,
        total: size,
    }));
    Ok(())
}

async fn abort_quietly(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    request: &UploadRequest,
    upload_id: &str,
) {
    if let Err(err) = ops::abort_multipart_upload(
        client,
        config,
        tunables,
        &request.bucket,
        &request.key,
        upload_id,
    )
    .await
    {
        log::warn!("abort-multipart-upload failed: {}", err);
    }
}

#[allow(clippy::too_many_arguments)]
async fn upload_one_part(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    bucket: &str,
    key: &str,
    file: &Path,
    upload_id: &str,
    plan: PartPlan,
    part_number: u32,
    size: u64,
    limiter: &Option<Arc<SpeedLimiter>>,
) -> Result<String, TransferError> {
    let (start, end) = part_range(plan, part_number, size);
    let len = (end - start) as usize;

    let mut handle = File::open(file).await?;
    handle.seek(SeekFrom::Start(start)).await?;
    let mut buffer = vec![0u8; len];
    handle.read_exact(&mut buffer).await?;

    throttle::admit(limiter, len).await;

    let number = part_number.to_string();
    let encoded_id = urlencoding::encode(upload_id).into_owned();
    let url = presigned_url(
        config,
        "PUT",
        bucket,
        key,
        PRESIGN_EXPIRES,
        &[("partNumber", &number), ("uploadId", &encoded_id)],
    );
    with_retry(tunables.retry_attempts, tunables.retry_delay(), || {
        let client = client.clone();
        let url = url.clone();
        let body = buffer.clone();
        async move {
            let response = read_ok(client.put(&url).body(body).send().await?).await?;
            response
                .headers()
                .get("ETag")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
                .ok_or(TransferError::MissingEtag(part_number))
        }
    })
    .await
}
