//! Message shapes crossing the worker process boundary. One JSON message
//! per line: inbound `{"key":"start","data":{job, options, params}}` and
//! `{"key":"stop"}`, outbound `{job, key, data|error}`. These shapes are
//! load-bearing for interoperability; change them only with care.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use s3_multipart::{
    ErrorPayload, PartDownloadedPayload, PartUploadedPayload, ProgressPayload, S3Config,
    StatPayload, TransferEvent, Tunables, UploadedPart,
};

use crate::job::TransferKind;

/// Key of the readiness message a worker sends after it parses `start`.
pub const READY_KEY: &str = "ready";

/// Inbound control messages, written to the worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "key", rename_all = "lowercase")]
pub enum WorkerCommand {
    Start { data: Box<StartData> },
    Stop,
}

/// Everything a worker needs to run one job. Credentials travel here, after
/// the spawn, never on argv.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartData {
    pub job: JobSpec,
    pub options: WorkerOptions,
    pub params: TransferParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub kind: TransferKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOptions {
    pub s3: S3Config,
    pub tunables: Tunables,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferParams {
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
    #[serde(rename = "uploadId", skip_serializing_if = "Option::is_none", default)]
    pub upload_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub parts: Vec<UploadedPart>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub downloaded_parts: BTreeMap<u32, bool>,
}

/// Outbound messages: `{job, key, data|error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    pub job: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<Value>,
}

impl WorkerReply {
    /// Readiness/environment report, sent once per worker.
    pub fn ready(job: &str) -> Self {
        Self {
            job: job.to_string(),
            key: READY_KEY.to_string(),
            data: Some(serde_json::json!({
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
            })),
            error: None,
        }
    }

    /// Tags one transfer event with its owning job id.
    pub fn from_event(job: &str, event: &TransferEvent) -> Self {
        let (data, error) = match event {
            TransferEvent::FileStat(payload) => (serde_json::to_value(payload).ok(), None),
            TransferEvent::Progress(payload) => (serde_json::to_value(payload).ok(), None),
            TransferEvent::FilePartUploaded(payload) => (serde_json::to_value(payload).ok(), None),
            TransferEvent::FilePartDownloaded(payload) => {
                (serde_json::to_value(payload).ok(), None)
            }
            TransferEvent::FileUploaded | TransferEvent::FileDownloaded => (None, None),
            TransferEvent::Error(payload) => (None, serde_json::to_value(payload).ok()),
        };
        Self {
            job: job.to_string(),
            key: event.key().to_string(),
            data,
            error,
        }
    }

    /// Parses the reply back into a typed event; `None` for non-transfer
    /// keys such as `ready` and for unknown keys.
    pub fn to_event(&self) -> Option<TransferEvent> {
        match self.key.as_str() {
            "fileStat" => self
                .data
                .clone()
                .and_then(|v| serde_json::from_value::<StatPayload>(v).ok())
                .map(TransferEvent::FileStat),
            "progress" => self
                .data
                .clone()
                .and_then(|v| serde_json::from_value::<ProgressPayload>(v).ok())
                .map(TransferEvent::Progress),
            "filePartUploaded" => self
                .data
                .clone()
                .and_then(|v| serde_json::from_value::<PartUploadedPayload>(v).ok())
                .map(TransferEvent::FilePartUploaded),
            "filePartDownloaded" => self
                .data
                .clone()
                .and_then(|v| serde_json::from_value::<PartDownloadedPayload>(v).ok())
                .map(TransferEvent::FilePartDownloaded),
            "fileUploaded" => Some(TransferEvent::FileUploaded),
            "fileDownloaded" => Some(TransferEvent::FileDownloaded),
            "error" => {
                let payload = match &self.error {
                    Some(Value::String(message)) => ErrorPayload {
                        message: message.clone(),
                        code: None,
                    },
                    Some(value) => serde_json::from_value(value.clone()).unwrap_or(ErrorPayload {
                        message: value.to_string(),
                        code: None,
                    }),
                    None => ErrorPayload {
                        message: "unknown worker error".into(),
                        code: None,
                    },
                };
                Some(TransferEvent::Error(payload))
            }
            _ => None,
        }
    }
}
