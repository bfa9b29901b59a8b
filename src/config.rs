//! User-facing settings consumed by the transfer core.

use std::num::NonZeroU32;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use s3_multipart::{
    Tunables, DEFAULT_CONCURRENT_PARTS, DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_SIZE,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY_MS, MAX_MULTIPART_THRESHOLD, MAX_PART_SIZE,
    MIN_MULTIPART_THRESHOLD, MIN_PART_SIZE,
};

/// Maximum number of jobs running at once by default.
pub const DEFAULT_CONCURRENT_JOBS: usize = 3;

/// Settings for the transfer core. Numeric knobs are clamped to the ranges
/// the storage API enforces via [`TransferConfig::normalized`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub multipart_threshold: u64,
    pub part_size: u64,
    /// Concurrent part requests within one job.
    pub max_concurrent_parts: usize,
    /// Concurrent running jobs; independent of the per-job part pool.
    pub max_concurrent_jobs: usize,
    /// Resume is an explicit opt-out, on by default.
    pub resume_enabled: bool,
    /// Byte-rate ceiling per running transfer.
    pub speed_limit: Option<NonZeroU32>,
    pub debug: bool,
    /// Skip creating remote directory markers for empty directories.
    pub skip_empty_directory: bool,
    /// Overwrite existing local files instead of appending a numeric suffix.
    pub overwrite_downloads: bool,
    /// Directory holding the progress journals.
    pub journal_dir: PathBuf,
    /// Journals are kept per user identity: `upprog_<user>.json`.
    pub user: String,
    /// Worker executable; defaults to `s3ferry-worker` beside the current one.
    pub worker_program: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            max_concurrent_parts: DEFAULT_CONCURRENT_PARTS,
            max_concurrent_jobs: DEFAULT_CONCURRENT_JOBS,
            resume_enabled: true,
            speed_limit: None,
            debug: false,
            skip_empty_directory: false,
            overwrite_downloads: false,
            journal_dir: PathBuf::from("."),
            user: "default".into(),
            worker_program: None,
        }
    }
}

impl TransferConfig {
    /// Returns a copy with every numeric knob clamped to its supported
    /// range. The max part count (10000) is fixed by the protocol and
    /// enforced inside the engine.
    pub fn normalized(&self) -> Self {
        let mut config = self.clone();
        config.multipart_threshold = config
            .multipart_threshold
            .clamp(MIN_MULTIPART_THRESHOLD, MAX_MULTIPART_THRESHOLD);
        config.part_size = config.part_size.clamp(MIN_PART_SIZE, MAX_PART_SIZE);
        config.max_concurrent_parts = config.max_concurrent_parts.max(1);
        config.max_concurrent_jobs = config.max_concurrent_jobs.max(1);
        config
    }

    /// Engine knobs for one job, honoring its per-job overrides.
    pub fn tunables(&self, overrides: Option<&JobTuning>) -> Tunables {
        let mut tunables = Tunables {
            multipart_threshold: self.multipart_threshold,
            part_size: self.part_size,
            max_concurrent_parts: self.max_concurrent_parts,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            speed_limit: self.speed_limit,
        };
        if let Some(tuning) = overrides {
            if let Some(threshold) = tuning.multipart_threshold {
                tunables.multipart_threshold =
                    threshold.clamp(MIN_MULTIPART_THRESHOLD, MAX_MULTIPART_THRESHOLD);
            }
            if let Some(part_size) = tuning.part_size {
                tunables.part_size = part_size.clamp(MIN_PART_SIZE, MAX_PART_SIZE);
            }
            if let Some(parts) = tuning.max_concurrent_parts {
                tunables.max_concurrent_parts = parts.max(1);
            }
        }
        tunables
    }
}

/// Per-job tuning overrides accepted at job creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTuning {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub multipart_threshold: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub part_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_concurrent_parts: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_clamps_to_api_ranges() {
        let config = TransferConfig {
            multipart_threshold: 1,
            part_size: 1,
            max_concurrent_parts: 0,
            max_concurrent_jobs: 0,
            ..TransferConfig::default()
        };
        let normalized = config.normalized();
        assert_eq!(normalized.multipart_threshold, MIN_MULTIPART_THRESHOLD);
        assert_eq!(normalized.part_size, MIN_PART_SIZE);
        assert_eq!(normalized.max_concurrent_parts, 1);
        assert_eq!(normalized.max_concurrent_jobs, 1);

        let config = TransferConfig {
            multipart_threshold: u64::MAX,
            ..TransferConfig::default()
        };
        assert_eq!(
            config.normalized().multipart_threshold,
            MAX_MULTIPART_THRESHOLD
        );
    }

    #[test]
    fn resume_defaults_on() {
        // Deliberate default: resume is an explicit opt-out.
        let config: TransferConfig = serde_json::from_str("{}").expect("defaults");
        assert!(config.resume_enabled);
    }

    #[test]
    fn overrides_take_effect_and_are_clamped() {
        let config = TransferConfig::default();
        let tuning = JobTuning {
            part_size: Some(1),
            max_concurrent_parts: Some(2),
            ..JobTuning::default()
        };
        let tunables = config.tunables(Some(&tuning));
        assert_eq!(tunables.part_size, MIN_PART_SIZE);
        assert_eq!(tunables.max_concurrent_parts, 2);
        assert_eq!(tunables.multipart_threshold, DEFAULT_MULTIPART_THRESHOLD);
    }
}
