//! Work enumeration: local directory walks for uploads, prefix listings
//! for downloads. Yields incrementally through the manager's command
//! channel and checks a cooperative cancellation flag per entry.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use s3_multipart::{list_objects_page, put_empty_object, S3Config, Tunables};

use super::{Command, JobOrigin};
use crate::job::TransferKind;

/// One remote selection handed to the manager for download; folder markers
/// (keys ending in `/`) are expanded by listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub key: String,
    pub size: u64,
    pub mtime: i64,
}

impl RemoteEntry {
    pub fn is_folder(&self) -> bool {
        self.key.ends_with('/')
    }
}

/// One unit of work discovered during enumeration.
#[derive(Debug, Clone)]
pub(crate) struct JobDraft {
    pub kind: TransferKind,
    pub local_path: PathBuf,
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub mtime: i64,
    pub origin: JobOrigin,
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string())
}

fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        format!("{}{}", prefix, name)
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn mtime_of(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .map(|t| {
            t.duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64
        })
        .unwrap_or(0)
}

/// Replaces path-hostile characters so every listing entry maps to a
/// creatable local name on all platforms.
pub(crate) fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// First free `name`, `stem_1.ext`, `stem_2.ext`, ... inside `dir`.
pub(crate) fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let mut path = dir.join(filename);
    let mut counter = 1;
    while path.exists() {
        let stem = Path::new(filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());
        let extension = Path::new(filename)
            .extension()
            .map(|e| e.to_string_lossy().into_owned());
        let next = match &extension {
            Some(ext) => format!("{}_{}.{}", stem, counter, ext),
            None => format!("{}_{}", stem, counter),
        };
        path = dir.join(next);
        counter += 1;
    }
    path
}

/// Walks each input path, one draft per leaf file. Directories are walked
/// depth-first with an explicit stack; a remote directory marker is created
/// before descending, skipped for empty directories when configured.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn enumerate_uploads(
    client: Client,
    s3: S3Config,
    tunables: Tunables,
    paths: Vec<PathBuf>,
    bucket: String,
    prefix: String,
    skip_empty_directory: bool,
    origin: JobOrigin,
    cancel: Arc<AtomicBool>,
    sink: mpsc::UnboundedSender<Command>,
) {
    for path in paths {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) => {
                log::warn!("skipping {}: {}", path.display(), err);
                continue;
            }
        };
        if meta.is_dir() {
            let root_key = join_key(&prefix, &file_name_of(&path));
            walk_directory(
                &client,
                &s3,
                &tunables,
                &bucket,
                path,
                root_key,
                skip_empty_directory,
                &origin,
                &cancel,
                &sink,
            )
            .await;
        } else {
            let draft = JobDraft {
                kind: TransferKind::Upload,
                key: join_key(&prefix, &file_name_of(&path)),
                local_path: path,
                bucket: bucket.clone(),
                size: meta.len(),
                mtime: mtime_of(&meta),
                origin: origin.clone(),
            };
            if sink.send(Command::Drafted(draft)).is_err() {
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn walk_directory(
    client: &Client,
    s3: &S3Config,
    tunables: &Tunables,
    bucket: &str,
    root: PathBuf,
    root_key: String,
    skip_empty_directory: bool,
    origin: &JobOrigin,
    cancel: &Arc<AtomicBool>,
    sink: &mpsc::UnboundedSender<Command>,
) {
    let mut stack = vec![(root, root_key)];
    while let Some((dir, dir_key)) = stack.pop() {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("cannot read {}: {}", dir.display(), err);
                continue;
            }
        };
        let mut files = Vec::new();
        let mut subdirs = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    match entry.metadata().await {
                        Ok(meta) if meta.is_dir() => subdirs.push(path),
                        Ok(meta) => files.push((path, meta)),
                        Err(err) => log::warn!("cannot stat {}: {}", path.display(), err),
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log::warn!("cannot read {}: {}", dir.display(), err);
                    break;
                }
            }
        }

        let is_empty = files.is_empty() && subdirs.is_empty();
        if !(is_empty && skip_empty_directory) {
            let marker = format!("{}/", dir_key);
            if let Err(err) = put_empty_object(client, s3, tunables, bucket, &marker).await {
                log::warn!("failed to create directory marker {}: {}", marker, err);
            }
        }

        for (path, meta) in files {
            if cancel.load(Ordering::SeqCst) {
                return;
            }
            let draft = JobDraft {
                kind: TransferKind::Upload,
                key: join_key(&dir_key, &file_name_of(&path)),
                local_path: path,
                bucket: bucket.to_string(),
                size: meta.len(),
                mtime: mtime_of(&meta),
                origin: origin.clone(),
            };
            if sink.send(Command::Drafted(draft)).is_err() {
                return;
            }
        }
        for sub in subdirs {
            let key = join_key(&dir_key, &file_name_of(&sub));
            stack.push((sub, key));
        }
    }
}

/// Expands folder selections by paginating the bucket listing under their
/// prefix; plain objects become one draft each. Local directories are
/// created on demand with sanitized segments, and existing files get a
/// numeric suffix unless overwrite mode is on.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn enumerate_downloads(
    client: Client,
    s3: S3Config,
    tunables: Tunables,
    bucket: String,
    entries: Vec<RemoteEntry>,
    dest: PathBuf,
    overwrite: bool,
    origin: JobOrigin,
    cancel: Arc<AtomicBool>,
    sink: mpsc::UnboundedSender<Command>,
) {
    for entry in entries {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        if entry.is_folder() {
            let folder_name = sanitize_segment(last_segment(&entry.key));
            let base = dest.join(folder_name);
            let mut token: Option<String> = None;
            loop {
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                let page = match list_objects_page(
                    &client,
                    &s3,
                    &tunables,
                    &bucket,
                    &entry.key,
                    token.as_deref(),
                )
                .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        log::warn!("listing {} failed: {}", entry.key, err);
                        break;
                    }
                };
                for object in page.objects {
                    if cancel.load(Ordering::SeqCst) {
                        return;
                    }
                    if object.key.ends_with('/') {
                        continue; // directory markers
                    }
                    let Some(rel) = object.key.strip_prefix(&entry.key) else {
                        continue;
                    };
                    let local_path = match local_target(&base, rel, overwrite).await {
                        Ok(path) => path,
                        Err(err) => {
                            log::warn!("cannot prepare destination for {}: {}", object.key, err);
                            continue;
                        }
                    };
                    let draft = JobDraft {
                        kind: TransferKind::Download,
                        local_path,
                        bucket: bucket.clone(),
                        key: object.key,
                        size: object.size,
                        mtime: object.mtime,
                        origin: origin.clone(),
                    };
                    if sink.send(Command::Drafted(draft)).is_err() {
                        return;
                    }
                }
                token = page.next_token;
                if token.is_none() {
                    break;
                }
            }
        } else {
            let local_path = match local_target(&dest, last_segment(&entry.key), overwrite).await {
                Ok(path) => path,
                Err(err) => {
                    log::warn!("cannot prepare destination for {}: {}", entry.key, err);
                    continue;
                }
            };
            let draft = JobDraft {
                kind: TransferKind::Download,
                local_path,
                bucket: bucket.clone(),
                key: entry.key.clone(),
                size: entry.size,
                mtime: entry.mtime,
                origin: origin.clone(),
            };
            if sink.send(Command::Drafted(draft)).is_err() {
                return;
            }
        }
    }
}

fn last_segment(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Builds the local destination for `rel` under `base`, creating parent
/// directories and resolving name clashes.
async fn local_target(base: &Path, rel: &str, overwrite: bool) -> std::io::Result<PathBuf> {
    let mut dir = base.to_path_buf();
    let segments: Vec<&str> = rel.split('/').collect();
    let (name, parents) = segments.split_last().unwrap_or((&rel, &[]));
    for parent in parents {
        dir = dir.join(sanitize_segment(parent));
    }
    tokio::fs::create_dir_all(&dir).await?;
    let filename = sanitize_segment(name);
    if overwrite {
        Ok(dir.join(filename))
    } else {
        Ok(unique_path(&dir, &filename))
    }
}
