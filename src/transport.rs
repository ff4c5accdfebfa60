//! Transport adapter (§4.I): the only module that speaks HTTP. Kept behind
//! a trait so the fetcher and session manager can be exercised against an
//! in-memory double in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::Stream;
use reqwest::Client;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Outcome of a HEAD probe. `length` is `None` when the server didn't say
/// (including the 405/501 "method not supported" case, which is not an
/// error here).
#[derive(Debug, Clone)]
pub struct HeadInfo {
    pub status: u16,
    pub length: Option<u64>,
    pub headers: HashMap<String, String>,
}

/// A byte range to request, half-open on the upper end per HTTP's inclusive
/// semantics: `end_inclusive: None` means "to the end of the resource".
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub start: u64,
    pub end_inclusive: Option<u64>,
}

pub type BodyStream = std::pin::Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

pub struct GetResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: BodyStream,
}

/// Opaque token returned by `register_call`, used to cancel an in-flight
/// request early (a pause/stop arriving mid-fetch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(Uuid);

/// HTTP access as the rest of the engine sees it. A real implementation
/// wraps `reqwest`; tests use an in-memory double.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn head(&self, url: &str, headers: &HashMap<String, String>) -> Result<HeadInfo>;

    async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        range: Option<ByteRange>,
    ) -> Result<GetResponse>;

    fn register_call(&self, session_id: &str) -> CallId;
    fn cancel_all(&self, session_id: &str);
    fn forget_call(&self, session_id: &str, call: CallId);
}

/// `reqwest`-backed transport used in production.
pub struct ReqwestTransport {
    client: Client,
    in_flight: Mutex<HashMap<String, Vec<CallId>>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn header_map(headers: &HashMap<String, String>) -> reqwest::header::HeaderMap {
    let mut map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        if let (Ok(name), Ok(val)) = (
            reqwest::header::HeaderName::from_bytes(key.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            map.insert(name, val);
        }
    }
    map
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

fn range_header(range: ByteRange) -> String {
    match range.end_inclusive {
        Some(end) => format!("bytes={}-{}", range.start, end),
        None if range.start > 0 => format!("bytes={}-", range.start),
        None => String::new(),
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn head(&self, url: &str, headers: &HashMap<String, String>) -> Result<HeadInfo> {
        let response = self
            .client
            .head(url)
            .headers(header_map(headers))
            .send()
            .await
            .map_err(|e| EngineError::network(e.to_string()))?;

        let status = response.status().as_u16();

        // 405 Method Not Allowed / 501 Not Implemented: server doesn't
        // support HEAD, not a failure — caller falls back to unknown length.
        if status == 405 || status == 501 {
            return Ok(HeadInfo { status, length: None, headers: HashMap::new() });
        }

        if !response.status().is_success() {
            return Err(EngineError::from_status(status));
        }

        let length = response.content_length();
        let headers = collect_headers(response.headers());
        Ok(HeadInfo { status, length, headers })
    }

    async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        range: Option<ByteRange>,
    ) -> Result<GetResponse> {
        let mut builder = self.client.get(url).headers(header_map(headers));
        if let Some(range) = range {
            let value = range_header(range);
            if !value.is_empty() {
                builder = builder.header(reqwest::header::RANGE, value);
            }
        }

        let response = builder.send().await.map_err(|e| EngineError::network(e.to_string()))?;
        let status = response.status().as_u16();

        if !response.status().is_success() {
            return Err(EngineError::from_status(status));
        }

        let headers = collect_headers(response.headers());
        let body: BodyStream = Box::pin(response.bytes_stream());
        Ok(GetResponse { status, headers, body })
    }

    fn register_call(&self, session_id: &str) -> CallId {
        let id = CallId(Uuid::new_v4());
        self.in_flight.lock().unwrap().entry(session_id.to_string()).or_default().push(id);
        id
    }

    fn cancel_all(&self, session_id: &str) {
        // reqwest has no per-request cancellation handle once the future is
        // spawned; callers drop the future itself (see `session::run_with_retry`)
        // to abort in-flight bodies. This just clears our own bookkeeping.
        self.in_flight.lock().unwrap().remove(session_id);
    }

    fn forget_call(&self, session_id: &str, call: CallId) {
        if let Some(calls) = self.in_flight.lock().unwrap().get_mut(session_id) {
            calls.retain(|c| *c != call);
        }
    }
}

/// Parse `Content-Range: bytes start-end/total` into the total length, when
/// present and well-formed.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let slash = value.rsplit('/').next()?;
    if slash == "*" {
        return None;
    }
    slash.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_bounded() {
        let range = ByteRange { start: 10, end_inclusive: Some(99) };
        assert_eq!(range_header(range), "bytes=10-99");
    }

    #[test]
    fn range_header_unbounded_with_offset() {
        let range = ByteRange { start: 500, end_inclusive: None };
        assert_eq!(range_header(range), "bytes=500-");
    }

    #[test]
    fn range_header_unbounded_from_zero_is_omitted() {
        let range = ByteRange { start: 0, end_inclusive: None };
        assert_eq!(range_header(range), "");
    }

    #[test]
    fn content_range_total_parses() {
        assert_eq!(parse_content_range_total("bytes 0-999/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-999/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }
}
