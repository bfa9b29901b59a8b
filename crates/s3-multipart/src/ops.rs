//! Single-call operations against the storage API: presign, send, retry,
//! parse. The upload/download engines and the orchestrating layers share
//! these.

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::retry::with_retry;
use crate::sign::presigned_url;
use crate::types::{S3Config, Tunables, UploadedPart};
use crate::xml;

pub(crate) const PRESIGN_EXPIRES: u64 = 3600;

/// Result of a HEAD on one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectHead {
    pub size: u64,
    /// Last-Modified as seconds since the epoch, 0 when absent.
    pub mtime: i64,
    pub etag: Option<String>,
}

/// One entry of a bucket listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub mtime: i64,
}

/// One page of a bucket listing.
#[derive(Debug, Clone)]
pub struct ObjectPage {
    pub objects: Vec<ObjectSummary>,
    pub next_token: Option<String>,
}

pub(crate) async fn read_ok(
    response: reqwest::Response,
) -> Result<reqwest::Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransferError::Status {
        status: status.as_u16(),
        body,
    })
}

/// HEAD one object for its size/mtime fingerprint.
pub async fn head_object(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    bucket: &str,
    key: &str,
) -> Result<ObjectHead, TransferError> {
    let url = presigned_url(config, "HEAD", bucket, key, PRESIGN_EXPIRES, &[]);
    with_retry(tunables.retry_attempts, tunables.retry_delay(), || {
        let client = client.clone();
        let url = url.clone();
        async move {
            let response = read_ok(client.head(&url).send().await?).await?;
            let size = response
                .headers()
                .get("Content-Length")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .or(response.content_length())
                .unwrap_or(0);
            let mtime = response
                .headers()
                .get("Last-Modified")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
                .map(|t| t.timestamp())
                .unwrap_or(0);
            let etag = response
                .headers()
                .get("ETag")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            Ok(ObjectHead { size, mtime, etag })
        }
    })
    .await
}

/// One ListObjectsV2 page under `prefix`. Pass the previous page's
/// `next_token` to continue; `None` starts from the beginning.
pub async fn list_objects_page(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    bucket: &str,
    prefix: &str,
    token: Option<&str>,
) -> Result<ObjectPage, TransferError> {
    let encoded_prefix = urlencoding::encode(prefix).into_owned();
    let encoded_token = token.map(|t| urlencoding::encode(t).into_owned());
    let mut query: Vec<(&str, &str)> = vec![("list-type", "2"), ("prefix", &encoded_prefix)];
    if let Some(tok) = encoded_token.as_deref() {
        query.push(("continuation-token", tok));
    }
    let url = presigned_url(config, "GET", bucket, "", PRESIGN_EXPIRES, &query);
    let body = with_retry(tunables.retry_attempts, tunables.retry_delay(), || {
        let client = client.clone();
        let url = url.clone();
        async move {
            let response = read_ok(client.get(&url).send().await?).await?;
            Ok(response.text().await?)
        }
    })
    .await?;

    let mut objects = Vec::new();
    for entry in xml::all_tags(&body, "Contents") {
        let Some(key) = xml::first_tag(entry, "Key") else {
            continue;
        };
        let size = xml::first_tag(entry, "Size")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let mtime = xml::first_tag(entry, "LastModified")
            .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.timestamp())
            .unwrap_or(0);
        objects.push(ObjectSummary {
            key: xml::unescape(key),
            size,
            mtime,
        });
    }
    let truncated = xml::first_tag(&body, "IsTruncated") == Some("true");
    let next_token = if truncated {
        xml::first_tag(&body, "NextContinuationToken").map(|t| xml::unescape(t))
    } else {
        None
    };
    Ok(ObjectPage {
        objects,
        next_token,
    })
}

/// PUT a zero-byte object; used for remote directory markers.
pub async fn put_empty_object(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    bucket: &str,
    key: &str,
) -> Result<(), TransferError> {
    let url = presigned_url(config, "PUT", bucket, key, PRESIGN_EXPIRES, &[]);
    with_retry(tunables.retry_attempts, tunables.retry_delay(), || {
        let client = client.clone();
        let url = url.clone();
        async move {
            read_ok(client.put(&url).body(Vec::new()).send().await?).await?;
            Ok(())
        }
    })
    .await
}

/// Starts a multipart upload and returns its id.
pub(crate) async fn create_multipart_upload(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    bucket: &str,
    key: &str,
) -> Result<String, TransferError> {
    let url = presigned_url(config, "POST", bucket, key, PRESIGN_EXPIRES, &[("uploads", "")]);
    let body = with_retry(tunables.retry_attempts, tunables.retry_delay(), || {
        let client = client.clone();
        let url = url.clone();
        async move {
            let response = read_ok(client.post(&url).send().await?).await?;
            Ok(response.text().await?)
        }
    })
    .await?;
    xml::first_tag(&body, "UploadId")
        .map(|id| xml::unescape(id))
        .ok_or_else(|| TransferError::BadResponse("no UploadId in response".into()))
}

/// Lists the parts the server has already accepted for `upload_id`,
/// following part-number markers until exhausted.
pub(crate) async fn list_parts(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    bucket: &str,
    key: &str,
    upload_id: &str,
) -> Result<Vec<UploadedPart>, TransferError> {
    let encoded_id = urlencoding::encode(upload_id).into_owned();
    let mut parts = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let mut query: Vec<(&str, &str)> = vec![("uploadId", &encoded_id)];
        if let Some(m) = marker.as_deref() {
            query.push(("part-number-marker", m));
        }
        let url = presigned_url(config, "GET", bucket, key, PRESIGN_EXPIRES, &query);
        let body = with_retry(tunables.retry_attempts, tunables.retry_delay(), || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let response = read_ok(client.get(&url).send().await?).await?;
                Ok(response.text().await?)
            }
        })
        .await?;

        for entry in xml::all_tags(&body, "Part") {
            let number = xml::first_tag(entry, "PartNumber").and_then(|v| v.parse::<u32>().ok());
            let etag = xml::first_tag(entry, "ETag");
            if let (Some(part_number), Some(etag)) = (number, etag) {
                parts.push(UploadedPart {
                    part_number,
                    etag: xml::unescape(etag),
                });
            }
        }

        let truncated = xml::first_tag(&body, "IsTruncated") == Some("true");
        marker = xml::first_tag(&body, "NextPartNumberMarker").map(|m| m.to_string());
        if !truncated || marker.is_none() {
            return Ok(parts);
        }
    }
}

/// Finishes a multipart upload. `parts` must already be sorted by
/// ascending part number.
pub(crate) async fn complete_multipart_upload(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    bucket: &str,
    key: &str,
    upload_id: &str,
    parts: &[UploadedPart],
) -> Result<(), TransferError> {
    let encoded_id = urlencoding::encode(upload_id).into_owned();
    let url = presigned_url(
        config,
        "POST",
        bucket,
        key,
        PRESIGN_EXPIRES,
        &[("uploadId", &encoded_id)],
    );
    let parts_xml = parts
        .iter()
        .map(|part| {
            format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                part.part_number, part.etag
            )
        })
        .collect::<Vec<_>>()
        .join("");
    let body = format!(
        "<CompleteMultipartUpload>{}</CompleteMultipartUpload>",
        parts_xml
    );
    with_retry(tunables.retry_attempts, tunables.retry_delay(), || {
        let client = client.clone();
        let url = url.clone();
        let body = body.clone();
        async move {
            read_ok(
                client
                    .post(&url)
                    .header("Content-Type", "application/xml")
                    .body(body)
                    .send()
                    .await?,
            )
            .await?;
            Ok(())
        }
    })
    .await
}

/// Drops a started multipart upload server-side.
pub async fn abort_multipart_upload(
    client: &Client,
    config: &S3Config,
    tunables: &Tunables,
    bucket: &str,
    key: &str,
    upload_id: &str,
) -> Result<(), TransferError> {
    let encoded_id = urlencoding::encode(upload_id).into_owned();
    let url = presigned_url(
        config,
        "DELETE",
        bucket,
        key,
        PRESIGN_EXPIRES,
        &[("uploadId", &encoded_id)],
    );
    with_retry(tunables.retry_attempts, tunables.retry_delay(), || {
        let client = client.clone();
        let url = url.clone();
        async move {
            read_ok(client.delete(&url).send().await?).await?;
            Ok(())
        }
    })
    .await
}
