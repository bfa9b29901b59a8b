use thiserror::Error;

/// Failure taxonomy for one transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("object size {size} exceeds the maximum multipart object size")]
    ObjectTooLarge { size: u64 },

    #[error("no etag returned for part {0}")]
    MissingEtag(u32),

    #[error("malformed response: {0}")]
    BadResponse(String),

    #[error("transfer stopped")]
    Stopped,

    #[error("transfer aborted")]
    Aborted,

    #[error("failed to finalize {path}: {source}")]
    Finalize {
        path: String,
        source: std::io::Error,
    },
}

impl TransferError {
    /// Transient failures are retried with a fixed delay per API call;
    /// everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            TransferError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Short machine-readable code forwarded with error events.
    pub fn code(&self) -> Option<String> {
        match self {
            TransferError::Status { status, .. } => Some(format!("status{}", status)),
            TransferError::ObjectTooLarge { .. } => Some("maxObjectSize".to_string()),
            TransferError::Stopped => Some("stopped".to_string()),
            TransferError::Aborted => Some("aborted".to_string()),
            TransferError::Finalize { .. } => Some("finalize".to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TransferError;

    #[test]
    fn server_errors_are_retryable() {
        let err = TransferError::Status {
            status: 503,
            body: "slow down".into(),
        };
        assert!(err.is_retryable());

        let err = TransferError::Status {
            status: 429,
            body: String::new(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let err = TransferError::Status {
            status: 404,
            body: "NoSuchUpload".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.code().as_deref(), Some("status404"));
    }

    #[test]
    fn local_errors_are_not_retryable() {
        let err = TransferError::Io(std::io::Error::other("disk full"));
        assert!(!err.is_retryable());
        assert!(err.code().is_none());

        let err = TransferError::ObjectTooLarge { size: u64::MAX };
        assert!(!err.is_retryable());
        assert_eq!(err.code().as_deref(), Some("maxObjectSize"));
    }
}
