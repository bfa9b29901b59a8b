//! On-disk progress journals: plain JSON maps keyed by job id, rewritten
//! wholesale on each change and replaced atomically through a temp file.
//! Absence or a parse failure of a journal means "nothing to resume".

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use s3_multipart::UploadedPart;

use crate::config::JobTuning;
use crate::job::{Fingerprint, JobStatus, PartRecord, Progress, TransferJob, TransferKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRef {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub loaded: u64,
    pub total: u64,
}

/// One persisted upload job: `upprog_<user>.json` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub from: PathRef,
    pub to: ObjectRef,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub region: Option<String>,
    pub size: u64,
    pub mtime: i64,
    pub prog: ProgressRecord,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    #[serde(rename = "uploadId", skip_serializing_if = "Option::is_none", default)]
    pub upload_id: Option<String>,
    /// Well-formed `{PartNumber, ETag}` entries only.
    pub parts: Vec<UploadedPart>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub overrides: Option<JobTuning>,
}

/// One persisted download job: `downprog_<user>.json` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub from: ObjectRef,
    pub to: PathRef,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub region: Option<String>,
    pub size: u64,
    pub mtime: i64,
    pub prog: ProgressRecord,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    /// Downloaded parts keyed by part number.
    pub parts: BTreeMap<u32, bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub overrides: Option<JobTuning>,
}

/// No worker survives a restart: anything persisted as in flight comes back
/// as waiting.
fn coerce_status(status: JobStatus) -> JobStatus {
    match status {
        JobStatus::Running | JobStatus::Verifying => JobStatus::Waiting,
        other => other,
    }
}

/// Projects one upload job into its journal record.
pub fn upload_record(job: &TransferJob) -> UploadRecord {
    UploadRecord {
        from: PathRef {
            path: job.local_path.clone(),
        },
        to: ObjectRef {
            bucket: job.bucket.clone(),
            key: job.key.clone(),
        },
        domain: job.domain.clone(),
        region: job.region.clone(),
        size: job.fingerprint.size,
        mtime: job.fingerprint.mtime,
        prog: ProgressRecord {
            loaded: job.progress.loaded,
            total: job.progress.total,
        },
        status: coerce_status(job.status),
        message: job.message.clone(),
        upload_id: job.upload_id.clone(),
        parts: job
            .parts
            .iter()
            .filter_map(|(&part_number, record)| match (&record.etag, record.done) {
                (Some(etag), true) => Some(UploadedPart {
                    part_number,
                    etag: etag.clone(),
                }),
                _ => None,
            })
            .collect(),
        overrides: job.tuning.clone(),
    }
}

/// Projects one download job into its journal record.
pub fn download_record(job: &TransferJob) -> DownloadRecord {
    DownloadRecord {
        from: ObjectRef {
            bucket: job.bucket.clone(),
            key: job.key.clone(),
        },
        to: PathRef {
            path: job.local_path.clone(),
        },
        domain: job.domain.clone(),
        region: job.region.clone(),
        size: job.fingerprint.size,
        mtime: job.fingerprint.mtime,
        prog: ProgressRecord {
            loaded: job.progress.loaded,
            total: job.progress.total,
        },
        status: coerce_status(job.status),
        message: job.message.clone(),
        parts: job
            .parts
            .iter()
            .filter(|(_, record)| record.done)
            .map(|(&part_number, _)| (part_number, true))
            .collect(),
        overrides: job.tuning.clone(),
    }
}

/// Rebuilds an upload job from its journal record.
pub fn upload_job(id: &str, record: &UploadRecord) -> TransferJob {
    let mut job = TransferJob::new(
        TransferKind::Upload,
        record.from.path.clone(),
        record.to.bucket.clone(),
        record.to.key.clone(),
        Fingerprint {
            size: record.size,
            mtime: record.mtime,
        },
        record.overrides.clone(),
    );
    job.id = id.to_string();
    job.domain = record.domain.clone();
    job.region = record.region.clone();
    job.status = coerce_status(record.status);
    job.progress = Progress {
        loaded: record.prog.loaded,
        total: record.prog.total,
    };
    job.message = record.message.clone();
    job.upload_id = record.upload_id.clone();
    job.resumable = record.upload_id.is_some();
    job.parts = record
        .parts
        .iter()
        .map(|part| {
            (
                part.part_number,
                PartRecord {
                    etag: Some(part.etag.clone()),
                    done: true,
                },
            )
        })
        .collect();
    job
}

/// Rebuilds a download job from its journal record.
pub fn download_job(id: &str, record: &DownloadRecord) -> TransferJob {
    let mut job = TransferJob::new(
        TransferKind::Download,
        record.to.path.clone(),
        record.from.bucket.clone(),
        record.from.key.clone(),
        Fingerprint {
            size: record.size,
            mtime: record.mtime,
        },
        record.overrides.clone(),
    );
    job.id = id.to_string();
    job.domain = record.domain.clone();
    job.region = record.region.clone();
    job.status = coerce_status(record.status);
    job.progress = Progress {
        loaded: record.prog.loaded,
        total: record.prog.total,
    };
    job.message = record.message.clone();
    job.resumable = !record.parts.is_empty();
    job.parts = record
        .parts
        .iter()
        .filter(|(_, &done)| done)
        .map(|(&part_number, _)| (part_number, PartRecord { etag: None, done: true }))
        .collect();
    job
}

/// Journal repository for one user identity.
#[derive(Debug, Clone)]
pub struct JournalStore {
    dir: PathBuf,
    user: String,
}

impl JournalStore {
    pub fn new(dir: impl Into<PathBuf>, user: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            user: user.into(),
        }
    }

    pub fn upload_path(&self) -> PathBuf {
        self.dir.join(format!("upprog_{}.json", self.user))
    }

    pub fn download_path(&self) -> PathBuf {
        self.dir.join(format!("downprog_{}.json", self.user))
    }

    pub async fn load_uploads(&self) -> BTreeMap<String, UploadRecord> {
        load_map(&self.upload_path()).await
    }

    pub async fn load_downloads(&self) -> BTreeMap<String, DownloadRecord> {
        load_map(&self.download_path()).await
    }

    pub async fn save_uploads(&self, records: &BTreeMap<String, UploadRecord>) -> io::Result<()> {
        atomic_write(&self.upload_path(), records).await
    }

    pub async fn save_downloads(
        &self,
        records: &BTreeMap<String, DownloadRecord>,
    ) -> io::Result<()> {
        atomic_write(&self.download_path(), records).await
    }
}

async fn load_map<T: serde::de::DeserializeOwned>(path: &Path) -> BTreeMap<String, T> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                log::warn!("cannot read journal {}: {}", path.display(), err);
            }
            return BTreeMap::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(map) => map,
        Err(err) => {
            log::warn!(
                "journal {} is unreadable, treating as empty: {}",
                path.display(),
                err
            );
            BTreeMap::new()
        }
    }
}

/// Replace-on-write: serialize next to the target, then rename over it.
async fn atomic_write<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec(value).map_err(io::Error::other)?;
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_fixture() -> TransferJob {
        let mut job = TransferJob::new(
            TransferKind::Upload,
            PathBuf::from("/data/movie.mkv"),
            "media".into(),
            "films/movie.mkv".into(),
            Fingerprint {
                size: 1_000_000,
                mtime: 1_700_000_000,
            },
            None,
        );
        job.id = "job-1".into();
        job.upload_id = Some("mp-7".into());
        job.parts.insert(
            1,
            PartRecord {
                etag: Some("\"e1\"".into()),
                done: true,
            },
        );
        // Malformed: done without an etag; must be filtered out.
        job.parts.insert(2, PartRecord { etag: None, done: true });
        // Not done; must be filtered out.
        job.parts.insert(
            3,
            PartRecord {
                etag: Some("\"e3\"".into()),
                done: false,
            },
        );
        job
    }

    #[test]
    fn snapshot_filters_malformed_parts_and_coerces_running() {
        let mut job = upload_fixture();
        job.start();
        assert_eq!(job.status, JobStatus::Running);

        let record = upload_record(&job);
        assert_eq!(record.status, JobStatus::Waiting);
        assert_eq!(record.parts.len(), 1);
        assert_eq!(record.parts[0].part_number, 1);
        assert_eq!(record.parts[0].etag, "\"e1\"");
    }

    #[test]
    fn journal_shape_matches_the_wire_format() {
        let record = upload_record(&upload_fixture());
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["uploadId"], "mp-7");
        assert_eq!(json["parts"][0]["PartNumber"], 1);
        assert_eq!(json["parts"][0]["ETag"], "\"e1\"");
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["from"]["path"], "/data/movie.mkv");
    }

    #[tokio::test]
    async fn roundtrip_through_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JournalStore::new(dir.path(), "alice");

        let job = upload_fixture();
        let mut records = BTreeMap::new();
        records.insert(job.id.clone(), upload_record(&job));
        store.save_uploads(&records).await.expect("save");

        assert!(store.upload_path().ends_with("upprog_alice.json"));
        let loaded = store.load_uploads().await;
        let record = loaded.get("job-1").expect("record present");
        let restored = upload_job("job-1", record);
        assert_eq!(restored.kind, TransferKind::Upload);
        assert_eq!(restored.upload_id.as_deref(), Some("mp-7"));
        assert_eq!(restored.fingerprint.size, 1_000_000);
        assert_eq!(restored.parts.len(), 1);
        assert!(restored.resumable);
    }

    #[tokio::test]
    async fn missing_or_corrupt_journals_mean_nothing_to_resume() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JournalStore::new(dir.path(), "bob");
        assert!(store.load_uploads().await.is_empty());

        tokio::fs::write(store.download_path(), b"{not json")
            .await
            .expect("write garbage");
        assert!(store.load_downloads().await.is_empty());
    }

    #[tokio::test]
    async fn saves_replace_the_journal_wholesale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JournalStore::new(dir.path(), "carol");

        let job = upload_fixture();
        let mut records = BTreeMap::new();
        records.insert(job.id.clone(), upload_record(&job));
        store.save_uploads(&records).await.expect("first save");

        store
            .save_uploads(&BTreeMap::new())
            .await
            .expect("second save");
        assert!(store.load_uploads().await.is_empty());
        // The temp file is renamed away, never left behind.
        let mut tmp = store.upload_path().as_os_str().to_os_string();
        tmp.push(".tmp");
        assert!(!PathBuf::from(tmp).exists());
    }

    #[test]
    fn download_records_keep_done_parts_by_number() {
        let mut job = TransferJob::new(
            TransferKind::Download,
            PathBuf::from("/dl/archive.tar"),
            "backups".into(),
            "2024/archive.tar".into(),
            Fingerprint {
                size: 5_000,
                mtime: 77,
            },
            None,
        );
        job.id = "job-2".into();
        job.parts.insert(1, PartRecord { etag: None, done: true });
        job.parts.insert(2, PartRecord { etag: None, done: false });

        let record = download_record(&job);
        assert_eq!(record.parts.len(), 1);
        assert_eq!(record.parts.get(&1), Some(&true));

        let restored = download_job("job-2", &record);
        assert_eq!(restored.kind, TransferKind::Download);
        assert_eq!(restored.parts.len(), 1);
        assert_eq!(restored.bucket, "backups");
        assert_eq!(restored.local_path, PathBuf::from("/dl/archive.tar"));
    }
}
