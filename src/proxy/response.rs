use axum::{
    body::{Body, Bytes},
    http::{
        header::{CACHE_CONTROL, CONNECTION, ETAG},
        HeaderMap, HeaderName, HeaderValue,
    },
};
use futures::{stream, StreamExt};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Bytes of an upstream error body that are logged.
pub const ERROR_PREVIEW_BYTES: usize = 1024;

const ASSET_CACHE_CONTROL: &str = "public, max-age=86400";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// CORS belongs to the gateway; whatever the upstream says is dropped.
pub fn strip_cors(headers: &mut HeaderMap) {
    let cors: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("access-control-"))
        .cloned()
        .collect();
    for name in cors {
        headers.remove(name);
    }
}

/// Deterministic validator for an asset path.
#[must_use]
pub fn asset_etag(path: &str) -> String {
    format!("\"{:x}\"", Sha256::digest(path.as_bytes()))
}

pub fn apply_asset_caching(headers: &mut HeaderMap, path: &str) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(ASSET_CACHE_CONTROL));
    if let Ok(etag) = HeaderValue::from_str(&asset_etag(path)) {
        headers.insert(ETAG, etag);
    }
}

/// Build the client body for an upstream error response.
///
/// Up to [`ERROR_PREVIEW_BYTES`] are read and logged; the bytes already read
/// are replayed ahead of the rest of the stream so the client sees the full
/// body.
pub async fn logged_error_body(
    mut response: reqwest::Response,
    method: &str,
    url: &str,
) -> Body {
    let status = response.status();
    let mut buffered: Vec<Bytes> = Vec::new();
    let mut read = 0usize;
    let mut failed = false;

    while read < ERROR_PREVIEW_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                read += chunk.len();
                buffered.push(chunk);
            }
            Ok(None) => break,
            Err(err) => {
                warn!("Failed to read upstream error body: {err}");
                failed = true;
                break;
            }
        }
    }

    let preview: Vec<u8> = buffered
        .iter()
        .flat_map(|chunk| chunk.iter().copied())
        .take(ERROR_PREVIEW_BYTES)
        .collect();
    warn!(
        status = status.as_u16(),
        method,
        url,
        body = %String::from_utf8_lossy(&preview),
        "upstream returned an error response"
    );

    let head = stream::iter(buffered.into_iter().map(Ok::<Bytes, reqwest::Error>));
    if failed {
        return Body::from_stream(head);
    }
    Body::from_stream(head.chain(response.bytes_stream()))
}
