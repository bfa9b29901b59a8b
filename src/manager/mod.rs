//! Transfer manager: turns user intent into scheduled jobs, enforces the
//! global concurrency ceiling, and persists enough state to survive a
//! restart. One event-driven actor task owns all scheduling state; true
//! parallelism lives in the worker processes and their part pools.

mod enumerate;

pub use self::enumerate::RemoteEntry;
pub(crate) use self::enumerate::JobDraft;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use s3_multipart::{head_object, ErrorPayload, S3Config, TransferEvent, UploadedPart};

use crate::config::{JobTuning, TransferConfig};
use crate::job::{Fingerprint, JobStatus, TransferJob, TransferKind};
use crate::journal::{self, JournalStore};
use crate::worker::protocol::{JobSpec, StartData, TransferParams, WorkerOptions, READY_KEY};
use crate::worker::{BridgeEvent, WorkerBridge};

/// One event forwarded to the external collaborator (the UI layer).
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job: String,
    pub kind: JobEventKind,
}

#[derive(Debug, Clone)]
pub enum JobEventKind {
    Transfer(TransferEvent),
    /// The job's worker process is gone and reaped.
    Exit { code: Option<i32> },
}

/// Per-request settings carried into every job an enumeration creates:
/// endpoint/region overrides and per-job tuning.
#[derive(Debug, Clone, Default)]
pub struct JobOrigin {
    pub domain: Option<String>,
    pub region: Option<String>,
    pub tuning: Option<JobTuning>,
}

pub(crate) enum Command {
    AddUploads {
        paths: Vec<PathBuf>,
        bucket: String,
        prefix: String,
        origin: JobOrigin,
    },
    AddDownloads {
        bucket: String,
        entries: Vec<RemoteEntry>,
        dest: PathBuf,
        origin: JobOrigin,
    },
    CancelEnumeration,
    StartJob(String),
    StopJob(String),
    WaitJob(String),
    RemoveJob(String),
    ClearFinished,
    Jobs(oneshot::Sender<Vec<TransferJob>>),
    Drafted(JobDraft),
    Shutdown,
}

/// Handle to the manager actor.
pub struct TransferManager {
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl TransferManager {
    /// Starts the actor. Persisted journals load before the first command
    /// is processed; the returned receiver carries per-job events.
    pub fn start(
        config: TransferConfig,
        s3: S3Config,
    ) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let config = config.normalized();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (bridge_tx, bridge_rx) = mpsc::unbounded_channel();

        let journal = JournalStore::new(config.journal_dir.clone(), config.user.clone());
        let manager = Manager {
            config,
            s3,
            client: reqwest::Client::new(),
            journal,
            jobs: Vec::new(),
            bridges: HashMap::new(),
            out: out_tx,
            bridge_tx,
            cmd_tx: cmd_tx.clone(),
            enumeration_cancel: Arc::new(AtomicBool::new(false)),
        };
        let task = tokio::spawn(manager.run(cmd_rx, bridge_rx));
        (Self { tx: cmd_tx, task }, out_rx)
    }

    pub fn add_uploads(
        &self,
        paths: Vec<PathBuf>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        origin: JobOrigin,
    ) {
        let _ = self.tx.send(Command::AddUploads {
            paths,
            bucket: bucket.into(),
            prefix: prefix.into(),
            origin,
        });
    }

    pub fn add_downloads(
        &self,
        bucket: impl Into<String>,
        entries: Vec<RemoteEntry>,
        dest: impl Into<PathBuf>,
        origin: JobOrigin,
    ) {
        let _ = self.tx.send(Command::AddDownloads {
            bucket: bucket.into(),
            entries,
            dest: dest.into(),
            origin,
        });
    }

    /// Interrupts any in-flight enumeration.
    pub fn cancel_enumeration(&self) {
        let _ = self.tx.send(Command::CancelEnumeration);
    }

    pub fn start_job(&self, id: impl Into<String>) {
        let _ = self.tx.send(Command::StartJob(id.into()));
    }

    pub fn stop_job(&self, id: impl Into<String>) {
        let _ = self.tx.send(Command::StopJob(id.into()));
    }

    /// Requeues a failed/stopped job.
    pub fn wait_job(&self, id: impl Into<String>) {
        let _ = self.tx.send(Command::WaitJob(id.into()));
    }

    pub fn remove_job(&self, id: impl Into<String>) {
        let _ = self.tx.send(Command::RemoveJob(id.into()));
    }

    pub fn clear_finished(&self) {
        let _ = self.tx.send(Command::ClearFinished);
    }

    /// Snapshot of every job, in scheduling order.
    pub async fn jobs(&self) -> Vec<TransferJob> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Jobs(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Terminates every worker and stops the actor.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown);
        let _ = self.task.await;
    }
}

struct Manager {
    config: TransferConfig,
    s3: S3Config,
    client: reqwest::Client,
    journal: JournalStore,
    /// Insertion order doubles as scheduling order.
    jobs: Vec<TransferJob>,
    bridges: HashMap<String, WorkerBridge>,
    out: mpsc::UnboundedSender<JobEvent>,
    bridge_tx: mpsc::UnboundedSender<BridgeEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    enumeration_cancel: Arc<AtomicBool>,
}

impl Manager {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut bridge_rx: mpsc::UnboundedReceiver<BridgeEvent>,
    ) {
        self.load_journals().await;
        self.schedule().await;

        let mut sampler = tokio::time::interval(Duration::from_secs(1));
        sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                event = bridge_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_bridge_event(event).await;
                    }
                }
                _ = sampler.tick() => {
                    for job in &mut self.jobs {
                        job.sample();
                    }
                }
            }
        }
        for bridge in self.bridges.values_mut() {
            bridge.terminate();
        }
    }

    async fn load_journals(&mut self) {
        let uploads = self.journal.load_uploads().await;
        for (id, record) in &uploads {
            self.jobs.push(journal::upload_job(id, record));
        }
        let downloads = self.journal.load_downloads().await;
        for (id, record) in &downloads {
            self.jobs.push(journal::download_job(id, record));
        }
        if !self.jobs.is_empty() {
            log::info!("restored {} persisted jobs", self.jobs.len());
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddUploads {
                paths,
                bucket,
                prefix,
                origin,
            } => {
                let cancel = Arc::new(AtomicBool::new(false));
                self.enumeration_cancel = Arc::clone(&cancel);
                tokio::spawn(enumerate::enumerate_uploads(
                    self.client.clone(),
                    self.origin_s3(&origin),
                    self.config.tunables(origin.tuning.as_ref()),
                    paths,
                    bucket,
                    prefix,
                    self.config.skip_empty_directory,
                    origin,
                    cancel,
                    self.cmd_tx.clone(),
                ));
            }
            Command::AddDownloads {
                bucket,
                entries,
                dest,
                origin,
            } => {
                let cancel = Arc::new(AtomicBool::new(false));
                self.enumeration_cancel = Arc::clone(&cancel);
                tokio::spawn(enumerate::enumerate_downloads(
                    self.client.clone(),
                    self.origin_s3(&origin),
                    self.config.tunables(origin.tuning.as_ref()),
                    bucket,
                    entries,
                    dest,
                    self.config.overwrite_downloads,
                    origin,
                    cancel,
                    self.cmd_tx.clone(),
                ));
            }
            Command::CancelEnumeration => {
                self.enumeration_cancel.store(true, Ordering::SeqCst);
            }
            Command::Drafted(draft) => {
                let mut job = TransferJob::new(
                    draft.kind,
                    draft.local_path,
                    draft.bucket,
                    draft.key,
                    Fingerprint {
                        size: draft.size,
                        mtime: draft.mtime,
                    },
                    draft.origin.tuning.clone(),
                );
                job.domain = draft.origin.domain.clone();
                job.region = draft.origin.region.clone();
                log::debug!("job {}: {} {}", job.id, job.kind_label(), job.key);
                self.jobs.push(job);
                self.persist().await;
                self.schedule().await;
            }
            Command::StartJob(id) => {
                if let Some(job) = self.jobs.iter_mut().find(|j| j.id == id) {
                    if job.status.is_terminal() {
                        job.wait();
                    }
                    self.persist().await;
                    self.schedule().await;
                }
            }
            Command::StopJob(id) => {
                if let Some(job) = self.jobs.iter_mut().find(|j| j.id == id) {
                    if job.stop() {
                        if let Some(bridge) = self.bridges.get_mut(&id) {
                            bridge.terminate();
                        }
                        self.persist().await;
                    }
                }
            }
            Command::WaitJob(id) => {
                if let Some(job) = self.jobs.iter_mut().find(|j| j.id == id) {
                    job.wait();
                    self.persist().await;
                    self.schedule().await;
                }
            }
            Command::RemoveJob(id) => {
                if let Some(bridge) = self.bridges.get_mut(&id) {
                    bridge.terminate();
                }
                self.jobs.retain(|j| j.id != id);
                self.persist().await;
            }
            Command::ClearFinished => {
                self.jobs.retain(|j| j.status != JobStatus::Finished);
                self.persist().await;
            }
            Command::Jobs(reply) => {
                let _ = reply.send(self.jobs.clone());
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_bridge_event(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Reply(reply) => {
                if reply.key == READY_KEY {
                    log::debug!("worker for job {} is ready", reply.job);
                    return;
                }
                let Some(event) = reply.to_event() else {
                    log::warn!("job {}: unknown event key {}", reply.job, reply.key);
                    return;
                };
                let Some(job) = self.jobs.iter_mut().find(|j| j.id == reply.job) else {
                    return;
                };
                let outcome = job.apply_event(&event);
                if outcome == crate::job::EventOutcome::Ignored {
                    return;
                }
                let terminal = event.is_terminal();
                let _ = self.out.send(JobEvent {
                    job: reply.job.clone(),
                    kind: JobEventKind::Transfer(event),
                });
                if outcome == crate::job::EventOutcome::Changed {
                    self.persist().await;
                }
                if terminal {
                    // Always terminate and reap after a terminal event.
                    if let Some(bridge) = self.bridges.get_mut(&reply.job) {
                        bridge.terminate();
                    }
                }
            }
            BridgeEvent::Exited { job: job_id, code } => {
                self.bridges.remove(&job_id);
                if let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) {
                    if !job.status.is_terminal() {
                        let message = format!(
                            "worker exited unexpectedly (code {})",
                            code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
                        );
                        if job.fail(message.clone()) {
                            let _ = self.out.send(JobEvent {
                                job: job_id.clone(),
                                kind: JobEventKind::Transfer(TransferEvent::Error(ErrorPayload {
                                    message,
                                    code: None,
                                })),
                            });
                            self.persist().await;
                        }
                    }
                }
                let _ = self.out.send(JobEvent {
                    job: job_id,
                    kind: JobEventKind::Exit { code },
                });
                self.schedule().await;
            }
        }
    }

    /// Fills free slots in order: the first `waiting` job starts, after its
    /// resume state is reconciled against the source's current fingerprint.
    async fn schedule(&mut self) {
        while self.bridges.len() < self.config.max_concurrent_jobs {
            let Some(index) = self
                .jobs
                .iter()
                .position(|j| j.status == JobStatus::Waiting && !self.bridges.contains_key(&j.id))
            else {
                break;
            };
            if let Err(message) = self.launch(index).await {
                let id = self.jobs[index].id.clone();
                log::warn!("job {}: {}", id, message);
                if self.jobs[index].fail(message.clone()) {
                    let _ = self.out.send(JobEvent {
                        job: id,
                        kind: JobEventKind::Transfer(TransferEvent::Error(ErrorPayload {
                            message,
                            code: None,
                        })),
                    });
                }
                self.persist().await;
            }
        }
    }

    async fn launch(&mut self, index: usize) -> Result<(), String> {
        let (id, kind, local_path, bucket, key, tuning, job_s3) = {
            let job = &self.jobs[index];
            (
                job.id.clone(),
                job.kind,
                job.local_path.clone(),
                job.bucket.clone(),
                job.key.clone(),
                job.tuning.clone(),
                self.job_s3(job),
            )
        };
        let tunables = self.config.tunables(tuning.as_ref());

        // Reconcile cached progress against the live source; a mismatch
        // forces a full re-transfer.
        let current = match kind {
            TransferKind::Upload => {
                let meta = tokio::fs::metadata(&local_path)
                    .await
                    .map_err(|e| format!("failed to stat {}: {}", local_path.display(), e))?;
                let mtime = meta
                    .modified()
                    .map(|t| {
                        t.duration_since(std::time::UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_secs() as i64
                    })
                    .unwrap_or(0);
                Fingerprint {
                    size: meta.len(),
                    mtime,
                }
            }
            TransferKind::Download => {
                let head = head_object(&self.client, &job_s3, &tunables, &bucket, &key)
                    .await
                    .map_err(|e| format!("failed to stat remote object: {}", e))?;
                Fingerprint {
                    size: head.size,
                    mtime: head.mtime,
                }
            }
        };
        {
            let job = &mut self.jobs[index];
            if !self.config.resume_enabled || current != job.fingerprint {
                if job.upload_id.is_some() || !job.parts.is_empty() {
                    log::info!("job {}: source changed, discarding cached progress", id);
                }
                job.discard_resume_state(current);
            }
        }

        let start = {
            let job = &self.jobs[index];
            let parts: Vec<UploadedPart> = if kind == TransferKind::Upload {
                job.parts
                    .iter()
                    .filter_map(|(&part_number, record)| match (&record.etag, record.done) {
                        (Some(etag), true) => Some(UploadedPart {
                            part_number,
                            etag: etag.clone(),
                        }),
                        _ => None,
                    })
                    .collect()
            } else {
                Vec::new()
            };
            let downloaded_parts: BTreeMap<u32, bool> = if kind == TransferKind::Download {
                job.parts
                    .iter()
                    .filter(|(_, record)| record.done)
                    .map(|(&part_number, _)| (part_number, true))
                    .collect()
            } else {
                BTreeMap::new()
            };
            StartData {
                job: JobSpec {
                    id: id.clone(),
                    kind,
                },
                options: WorkerOptions {
                    s3: job_s3,
                    tunables,
                    debug: self.config.debug,
                },
                params: TransferParams {
                    bucket,
                    key,
                    local_path,
                    upload_id: job.upload_id.clone(),
                    parts,
                    downloaded_parts,
                },
            }
        };

        let program = self.worker_program()?;
        let bridge = WorkerBridge::spawn(&program, &start, self.bridge_tx.clone())
            .await
            .map_err(|e| format!("failed to spawn worker: {}", e))?;
        self.jobs[index].start();
        self.bridges.insert(id, bridge);
        self.persist().await;
        Ok(())
    }

    fn job_s3(&self, job: &TransferJob) -> S3Config {
        let mut s3 = self.s3.clone();
        if let Some(domain) = &job.domain {
            s3.endpoint = domain.clone();
        }
        if let Some(region) = &job.region {
            s3.region = region.clone();
        }
        s3
    }

    fn origin_s3(&self, origin: &JobOrigin) -> S3Config {
        let mut s3 = self.s3.clone();
        if let Some(domain) = &origin.domain {
            s3.endpoint = domain.clone();
        }
        if let Some(region) = &origin.region {
            s3.region = region.clone();
        }
        s3
    }

    fn worker_program(&self) -> Result<PathBuf, String> {
        if let Some(program) = &self.config.worker_program {
            return Ok(program.clone());
        }
        let exe = std::env::current_exe()
            .map_err(|e| format!("cannot locate current executable: {}", e))?;
        let name = format!("s3ferry-worker{}", std::env::consts::EXE_SUFFIX);
        let dir = exe.parent().map(Path::to_path_buf).unwrap_or_default();
        let candidate = dir.join(&name);
        if candidate.exists() {
            return Ok(candidate);
        }
        // Test executables run from one level below the bin directory.
        if let Some(parent) = dir.parent() {
            let candidate = parent.join(&name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Ok(dir.join(name))
    }

    /// Rewrites both journals wholesale; finished jobs drop out.
    async fn persist(&self) {
        let mut uploads = BTreeMap::new();
        let mut downloads = BTreeMap::new();
        for job in &self.jobs {
            if job.status == JobStatus::Finished {
                continue;
            }
            match job.kind {
                TransferKind::Upload => {
                    uploads.insert(job.id.clone(), journal::upload_record(job));
                }
                TransferKind::Download => {
                    downloads.insert(job.id.clone(), journal::download_record(job));
                }
            }
        }
        if let Err(err) = self.journal.save_uploads(&uploads).await {
            log::warn!("cannot write upload journal: {}", err);
        }
        if let Err(err) = self.journal.save_downloads(&downloads).await {
            log::warn!("cannot write download journal: {}", err);
        }
    }
}

impl TransferJob {
    fn kind_label(&self) -> &'static str {
        match self.kind {
            TransferKind::Upload => "upload",
            TransferKind::Download => "download",
        }
    }
}
