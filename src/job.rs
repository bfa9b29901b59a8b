//! One file transfer's lifecycle, independent of where the low-level work
//! executes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use s3_multipart::TransferEvent;

use crate::config::JobTuning;

/// Stall decay factor for the speed sampler; avoids UI jitter by bleeding
/// the displayed speed off instead of snapping it to zero.
const SPEED_DECAY: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Stopped,
    Verifying,
    Failed,
    Finished,
}

impl JobStatus {
    /// Terminal states stay put until an explicit restart.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Stopped | JobStatus::Failed | JobStatus::Finished
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Verifying => write!(f, "verifying"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Finished => write!(f, "finished"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub loaded: u64,
    pub total: u64,
}

/// Size/mtime pair used to decide whether cached resume progress is still
/// usable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime: i64,
}

/// One entry of the part map: `etag` present only for uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub etag: Option<String>,
    pub done: bool,
}

/// How an applied event affected the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Suppressed: the job already failed, or the transition is illegal.
    Ignored,
    /// Only the byte counter moved.
    Progress,
    /// Status or part state changed; worth persisting.
    Changed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferJob {
    pub id: String,
    pub kind: TransferKind,
    /// Local side of the transfer.
    pub local_path: PathBuf,
    pub bucket: String,
    pub key: String,
    /// Per-job endpoint override, when the job targets a non-default domain.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub region: Option<String>,
    pub status: JobStatus,
    pub progress: Progress,
    /// Bytes per second, decayed on stalls.
    pub speed: f64,
    /// Milliseconds, 0 when the speed is unknown.
    pub predicted_time_left: u64,
    pub resumable: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub upload_id: Option<String>,
    pub parts: BTreeMap<u32, PartRecord>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    /// Source fingerprint: the local file for uploads, the remote object
    /// for downloads.
    pub fingerprint: Fingerprint,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tuning: Option<JobTuning>,
    /// First error wins; set once per run, cleared by `wait`/`start`.
    #[serde(skip)]
    fatal: bool,
    #[serde(skip)]
    prev_loaded: u64,
}

/// Opaque id derived from wall-clock time plus randomness.
pub fn generate_job_id() -> String {
    format!(
        "{}-{}",
        Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4().simple()
    )
}

impl TransferJob {
    pub fn new(
        kind: TransferKind,
        local_path: PathBuf,
        bucket: String,
        key: String,
        fingerprint: Fingerprint,
        tuning: Option<JobTuning>,
    ) -> Self {
        Self {
            id: generate_job_id(),
            kind,
            local_path,
            bucket,
            key,
            domain: None,
            region: None,
            status: JobStatus::Waiting,
            progress: Progress {
                loaded: 0,
                total: fingerprint.size,
            },
            speed: 0.0,
            predicted_time_left: 0,
            resumable: false,
            upload_id: None,
            parts: BTreeMap::new(),
            message: None,
            fingerprint,
            started_at: None,
            ended_at: None,
            tuning,
            fatal: false,
            prev_loaded: 0,
        }
    }

    /// `waiting -> running`: records the start time and clears the previous
    /// error. Returns false for any other current state.
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Waiting {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.ended_at = None;
        self.message = None;
        self.fatal = false;
        self.prev_loaded = self.progress.loaded;
        true
    }

    /// `running -> stopped`. Does not cancel in-flight work itself; that is
    /// the worker bridge's job.
    pub fn stop(&mut self) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.status = JobStatus::Stopped;
        self.enter_terminal();
        true
    }

    /// Requeue from any state.
    pub fn wait(&mut self) {
        self.status = JobStatus::Waiting;
        self.fatal = false;
        self.message = None;
        self.ended_at = None;
        self.reset_sampler();
    }

    /// Records the first error; later ones are suppressed.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.fatal {
            return false;
        }
        self.fatal = true;
        self.status = JobStatus::Failed;
        self.message = Some(message.into());
        self.enter_terminal();
        true
    }

    /// `running -> verifying`, download only: all bytes received, the
    /// atomic rename is still outstanding.
    pub fn verify(&mut self) -> bool {
        if self.kind != TransferKind::Download || self.status != JobStatus::Running {
            return false;
        }
        self.status = JobStatus::Verifying;
        true
    }

    /// `running|verifying -> finished`.
    pub fn finish(&mut self) -> bool {
        if !matches!(self.status, JobStatus::Running | JobStatus::Verifying) {
            return false;
        }
        self.status = JobStatus::Finished;
        self.enter_terminal();
        true
    }

    fn enter_terminal(&mut self) {
        self.ended_at = Some(Utc::now());
        self.reset_sampler();
    }

    fn reset_sampler(&mut self) {
        self.speed = 0.0;
        self.predicted_time_left = 0;
        self.prev_loaded = self.progress.loaded;
    }

    /// One sampler tick, called once per second while running. A stalled
    /// tick decays the previous speed instead of zeroing it.
    pub fn sample(&mut self) {
        if self.status != JobStatus::Running {
            return;
        }
        let delta = self.progress.loaded.saturating_sub(self.prev_loaded);
        if delta == 0 {
            self.speed *= SPEED_DECAY;
        } else {
            self.speed = delta as f64;
        }
        self.prev_loaded = self.progress.loaded;

        let remaining = self.progress.total.saturating_sub(self.progress.loaded);
        self.predicted_time_left = if self.speed > 0.0 {
            (remaining as f64 / self.speed * 1000.0).ceil() as u64
        } else {
            0
        };
    }

    /// Applies one event relayed from the worker process.
    pub fn apply_event(&mut self, event: &TransferEvent) -> EventOutcome {
        if self.fatal {
            return EventOutcome::Ignored;
        }
        match event {
            TransferEvent::FileStat(stat) => {
                self.progress.total = stat.total;
                self.resumable = stat.resumable;
                if stat.upload_id.is_some() {
                    self.upload_id = stat.upload_id.clone();
                }
                EventOutcome::Changed
            }
            TransferEvent::Progress(progress) => {
                // loaded <= total once the total is known.
                self.progress.loaded = if progress.total > 0 {
                    progress.loaded.min(progress.total)
                } else {
                    progress.loaded
                };
                self.progress.total = progress.total;
                if self.kind == TransferKind::Download
                    && self.status == JobStatus::Running
                    && progress.total > 0
                    && progress.loaded >= progress.total
                {
                    self.verify();
                    return EventOutcome::Changed;
                }
                EventOutcome::Progress
            }
            TransferEvent::FilePartUploaded(part) => {
                self.parts.insert(
                    part.part_number,
                    PartRecord {
                        etag: Some(part.etag.clone()),
                        done: true,
                    },
                );
                EventOutcome::Changed
            }
            TransferEvent::FilePartDownloaded(part) => {
                self.parts.insert(
                    part.part_number,
                    PartRecord {
                        etag: None,
                        done: true,
                    },
                );
                EventOutcome::Changed
            }
            TransferEvent::FileUploaded | TransferEvent::FileDownloaded => {
                self.progress.loaded = self.progress.total;
                if self.finish() {
                    EventOutcome::Changed
                } else {
                    EventOutcome::Ignored
                }
            }
            TransferEvent::Error(payload) => {
                if self.fail(payload.message.clone()) {
                    EventOutcome::Changed
                } else {
                    EventOutcome::Ignored
                }
            }
        }
    }

    /// Clears cached resume state after a fingerprint mismatch; the next
    /// run re-transfers from byte zero.
    pub fn discard_resume_state(&mut self, fingerprint: Fingerprint) {
        self.upload_id = None;
        self.parts.clear();
        self.progress.loaded = 0;
        self.progress.total = fingerprint.size;
        self.prev_loaded = 0;
        self.fingerprint = fingerprint;
    }
}

#[cfg(test)]
mod tests {
    use s3_multipart::{ErrorPayload, ProgressPayload, StatPayload};

    use super::*;

    fn job(kind: TransferKind) -> TransferJob {
        TransferJob::new(
            kind,
            PathBuf::from("/tmp/file.bin"),
            "bucket".into(),
            "key".into(),
            Fingerprint {
                size: 1000,
                mtime: 42,
            },
            None,
        )
    }

    #[test]
    fn ids_are_unique_and_time_prefixed() {
        let a = generate_job_id();
        let b = generate_job_id();
        assert_ne!(a, b);
        assert!(a.split('-').next().is_some_and(|t| t.parse::<i64>().is_ok()));
    }

    #[test]
    fn running_is_only_entered_from_waiting() {
        let mut j = job(TransferKind::Upload);
        assert!(j.start());
        assert_eq!(j.status, JobStatus::Running);
        assert!(!j.start(), "running -> running is illegal");

        assert!(j.stop());
        assert!(!j.start(), "stopped -> running requires wait() first");
        j.wait();
        assert!(j.start());
    }

    #[test]
    fn finished_is_not_reentered_without_requeue() {
        let mut j = job(TransferKind::Upload);
        j.start();
        assert!(j.finish());
        assert!(!j.finish());
        assert!(!j.start());
        j.wait();
        assert!(j.start());
    }

    #[test]
    fn stop_zeroes_speed_and_eta() {
        let mut j = job(TransferKind::Upload);
        j.start();
        j.progress.loaded = 500;
        j.sample();
        assert!(j.speed > 0.0);
        j.stop();
        assert_eq!(j.speed, 0.0);
        assert_eq!(j.predicted_time_left, 0);
    }

    #[test]
    fn stalled_sampler_decays_instead_of_zeroing() {
        // Loaded sequence (0, 100, 100, 250) sampled once per second.
        let mut j = job(TransferKind::Upload);
        j.start();

        j.progress.loaded = 100;
        j.sample();
        assert_eq!(j.speed, 100.0);

        j.sample(); // stalled tick
        assert_eq!(j.speed, 80.0);

        j.progress.loaded = 250;
        j.sample();
        assert_eq!(j.speed, 150.0);
    }

    #[test]
    fn eta_is_ceiling_milliseconds_or_zero() {
        let mut j = job(TransferKind::Upload);
        j.start();
        j.progress.loaded = 400;
        j.sample(); // speed 400
        // 600 remaining at 400 B/s -> 1.5 s -> 1500 ms.
        assert_eq!(j.predicted_time_left, 1500);

        let mut stalled = job(TransferKind::Upload);
        stalled.start();
        stalled.sample();
        assert_eq!(stalled.speed, 0.0);
        assert_eq!(stalled.predicted_time_left, 0);
    }

    #[test]
    fn download_enters_verifying_once_all_bytes_arrive() {
        let mut j = job(TransferKind::Download);
        j.start();
        let outcome = j.apply_event(&TransferEvent::Progress(ProgressPayload {
            loaded: 1000,
            total: 1000,
        }));
        assert_eq!(outcome, EventOutcome::Changed);
        assert_eq!(j.status, JobStatus::Verifying);

        assert!(j.apply_event(&TransferEvent::FileDownloaded) == EventOutcome::Changed);
        assert_eq!(j.status, JobStatus::Finished);
    }

    #[test]
    fn uploads_never_enter_verifying() {
        let mut j = job(TransferKind::Upload);
        j.start();
        j.apply_event(&TransferEvent::Progress(ProgressPayload {
            loaded: 1000,
            total: 1000,
        }));
        assert_eq!(j.status, JobStatus::Running);
    }

    #[test]
    fn first_error_wins() {
        let mut j = job(TransferKind::Upload);
        j.start();
        let first = j.apply_event(&TransferEvent::Error(ErrorPayload {
            message: "boom".into(),
            code: None,
        }));
        assert_eq!(first, EventOutcome::Changed);
        let second = j.apply_event(&TransferEvent::Error(ErrorPayload {
            message: "later".into(),
            code: None,
        }));
        assert_eq!(second, EventOutcome::Ignored);
        assert_eq!(j.message.as_deref(), Some("boom"));

        // Everything after the fatal flag is suppressed too.
        let progress = j.apply_event(&TransferEvent::Progress(ProgressPayload {
            loaded: 10,
            total: 1000,
        }));
        assert_eq!(progress, EventOutcome::Ignored);
    }

    #[test]
    fn stat_event_records_upload_id() {
        let mut j = job(TransferKind::Upload);
        j.start();
        j.apply_event(&TransferEvent::FileStat(StatPayload {
            total: 1000,
            resumable: true,
            upload_id: Some("mp-1".into()),
        }));
        assert!(j.resumable);
        assert_eq!(j.upload_id.as_deref(), Some("mp-1"));
    }

    #[test]
    fn discard_resume_state_restarts_from_zero() {
        let mut j = job(TransferKind::Upload);
        j.upload_id = Some("mp-1".into());
        j.parts.insert(
            1,
            PartRecord {
                etag: Some("\"e\"".into()),
                done: true,
            },
        );
        j.progress.loaded = 500;

        let fresh = Fingerprint {
            size: 2000,
            mtime: 99,
        };
        j.discard_resume_state(fresh);
        assert!(j.upload_id.is_none());
        assert!(j.parts.is_empty());
        assert_eq!(j.progress.loaded, 0);
        assert_eq!(j.progress.total, 2000);
        assert_eq!(j.fingerprint, fresh);
    }
}
