//! AWS Signature V4 presigned URLs, path-style addressing.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::types::S3Config;

type HmacSha256 = Hmac<Sha256>;

fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn get_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Encode URI path - encode each segment individually, keep / as separator
pub fn encode_uri_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Generate a presigned URL for one request against `bucket`/`key`.
///
/// `query_params` values must already be URL-encoded; they enter the
/// canonical query string verbatim.
pub(crate) fn presigned_url(
    config: &S3Config,
    method: &str,
    bucket: &str,
    key: &str,
    expires_in: u64,
    query_params: &[(&str, &str)],
) -> String {
    let now = Utc::now();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let region = config.region.as_str();
    let service = "s3";

    let host = config.endpoint.as_str();
    let canonical_uri = format!("/{}/{}", bucket, encode_uri_path(key));

    let credential_scope = format!("{}/{}/{}/aws4_request", date_stamp, region, service);

    // Build query string
    let mut query_parts: Vec<(String, String)> = vec![
        (
            "X-Amz-Algorithm".to_string(),
            "AWS4-HMAC-SHA256".to_string(),
        ),
        (
            "X-Amz-Credential".to_string(),
            urlencoding::encode(&format!("{}/{}", config.access_key_id, credential_scope))
                .to_string(),
        ),
        ("X-Amz-Date".to_string(), amz_date.clone()),
        ("X-Amz-Expires".to_string(), expires_in.to_string()),
        ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
    ];

    for (k, v) in query_params {
        query_parts.push((k.to_string(), v.to_string()));
    }

    query_parts.sort_by(|a, b| a.0.cmp(&b.0));
    let canonical_query_string = query_parts
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    // Canonical headers
    let canonical_headers = format!("host:{}\n", host);
    let signed_headers = "host";

    // For presigned URLs the payload is UNSIGNED-PAYLOAD
    let payload_hash = "UNSIGNED-PAYLOAD";

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_uri, canonical_query_string, canonical_headers, signed_headers,
        payload_hash
    );

    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        sha256_hash(canonical_request.as_bytes())
    );

    let signing_key = get_signing_key(&config.secret_access_key, &date_stamp, region, service);
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    let scheme = if config.secure { "https" } else { "http" };
    format!(
        "{}://{}{}?{}&X-Amz-Signature={}",
        scheme, host, canonical_uri, canonical_query_string, signature
    )
}
