//! Range fetcher (§4.E): runs one task per chunk plan, streaming the
//! response body straight into its slice of the target file via positional
//! writes so concurrent chunks never fight over a shared cursor.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use futures::StreamExt;
use tracing::{instrument, warn};

use crate::error::{EngineError, Result};
use crate::planner::{ChunkPlan, ChunkState};
use crate::progress::{Progress, ProgressAggregator};
use crate::transport::{ByteRange, Transport, parse_content_range_total};

/// A file opened once per download attempt and shared, read-only from the
/// fetcher's point of view beyond the fd itself, across every chunk task.
/// `write_at` never moves a shared cursor, so no external locking is
/// needed for concurrent writers at disjoint offsets.
pub struct SharedFile(File);

impl SharedFile {
    pub fn open(path: &std::path::Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        Ok(Self(file))
    }

    #[cfg(unix)]
    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<()> {
        self.0.write_all_at(data, offset)
    }

    #[cfg(not(unix))]
    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        // Windows lacks pwrite; fall back to seek+write. Safe here because
        // the engine only runs chunked concurrency behind `preferParallel`,
        // and each `SharedFile` handle is still only ever driven by tasks
        // coordinated through the same session, never two processes.
        let mut file = self.0.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    /// Current on-disk length, used to clamp stale resume state against a
    /// target file that was truncated or replaced outside the engine.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }
}

/// Callback invoked whenever a chunk's on-disk progress advances, so the
/// session manager can coalesce writes to the checkpoint store.
pub type ChunkStateSink = Arc<dyn Fn(ChunkState) + Send + Sync>;

/// Callback invoked whenever the aggregator decides a throttled progress
/// update should reach listeners.
pub type ProgressSink = Arc<dyn Fn(Progress) + Send + Sync>;

pub struct FetchChunkArgs<'a> {
    pub plan: ChunkPlan,
    pub url: &'a str,
    pub headers: &'a HashMap<String, String>,
    pub file: &'a SharedFile,
    pub transport: &'a dyn Transport,
    pub session_id: &'a str,
    pub progress: &'a ProgressAggregator,
    pub on_chunk_state: &'a ChunkStateSink,
    pub on_progress: &'a ProgressSink,
}

/// Fetch a single chunk plan to completion, returning once the stream ends
/// or fails. On success the caller's checkpoint already reflects the final
/// `ChunkState` via `on_chunk_state`.
#[instrument(skip_all, fields(index = args.plan.index, attempt_start = args.plan.resume_offset))]
pub async fn fetch_chunk(args: FetchChunkArgs<'_>) -> Result<()> {
    let FetchChunkArgs {
        plan,
        url,
        headers,
        file,
        transport,
        session_id,
        progress,
        on_chunk_state,
        on_progress,
    } = args;

    let range = ByteRange { start: plan.resume_offset, end_inclusive: plan.end_inclusive };
    let call = transport.register_call(session_id);

    let response = transport.get(url, headers, Some(range)).await;
    let response = match response {
        Ok(r) => r,
        Err(e) => {
            transport.forget_call(session_id, call);
            return Err(e);
        }
    };

    // A server that ignores Range entirely answers 200 instead of 206; the
    // body then starts at byte 0 of the *whole* resource regardless of what
    // we asked for. This chunk must restart from its own `start` and, since
    // every other chunk task is reading that same full body independently,
    // it must stop writing the instant it passes its own `end_inclusive` —
    // otherwise it keeps copying bytes that belong to later chunks.
    let server_honored_range = response.status == 206;
    let mut position = if server_honored_range { plan.resume_offset } else { plan.start };

    if plan.start == 0 && progress.total_bytes().is_none() {
        if let Some(total) = response
            .headers
            .get("content-range")
            .and_then(|v| parse_content_range_total(v))
            .or_else(|| response.headers.get("content-length").and_then(|v| v.parse().ok()))
        {
            progress.set_total_bytes_once(total);
        }
    }

    // Absolute offset, within the body as the server actually sent it, of
    // the next byte `stream.next()` will yield. Equal to `position` when the
    // server honored the Range header; starts at zero otherwise, since the
    // body is then the entire resource.
    let mut body_offset: u64 = if server_honored_range { plan.resume_offset } else { 0 };
    let end_exclusive = plan.end_inclusive.map(|e| e + 1);

    let mut stream = response.body;
    let mut last_err: Option<EngineError> = None;

    while let Some(next) = stream.next().await {
        let bytes = match next {
            Ok(b) => b,
            Err(e) => {
                last_err = Some(EngineError::network(e.to_string()));
                break;
            }
        };

        if bytes.is_empty() {
            continue;
        }

        let chunk_start = body_offset;
        let chunk_end = body_offset + bytes.len() as u64;
        body_offset = chunk_end;

        // Entirely before our slice: discard and keep reading.
        if chunk_end <= plan.start {
            continue;
        }
        // Entirely at or past our slice: nothing left to do.
        if let Some(end_exclusive) = end_exclusive {
            if chunk_start >= end_exclusive {
                break;
            }
        }

        let skip = plan.start.saturating_sub(chunk_start) as usize;
        let take_to = match end_exclusive {
            Some(end_exclusive) => ((end_exclusive - chunk_start) as usize).min(bytes.len()),
            None => bytes.len(),
        };
        let slice = &bytes[skip..take_to];

        if !slice.is_empty() {
            if let Err(e) = file.write_at(slice, position) {
                last_err = Some(EngineError::network(format!("write failed: {e}")));
                break;
            }

            let len = slice.len() as u64;
            position += len;

            if let Some(update) = progress.record(len) {
                on_progress(update);
            }

            on_chunk_state(ChunkState {
                index: plan.index,
                start: plan.start,
                end_inclusive: plan.end_inclusive,
                next_offset: position,
            });
        }

        if let Some(end_exclusive) = end_exclusive {
            if chunk_end >= end_exclusive {
                break;
            }
        }
    }

    transport.forget_call(session_id, call);

    if let Some(err) = last_err {
        warn!(index = plan.index, error = %err, "chunk fetch failed");
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{GetResponse, HeadInfo, ReqwestTransport};
    use tempfile::TempDir;

    #[test]
    fn shared_file_writes_do_not_clobber_disjoint_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::File::create(&path).unwrap().set_len(20).unwrap();

        let file = SharedFile::open(&path).unwrap();
        file.write_at(b"AAAAA", 0).unwrap();
        file.write_at(b"BBBBB", 10).unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents[0..5], b"AAAAA");
        assert_eq!(&contents[10..15], b"BBBBB");
    }

    /// A transport whose `get` always answers with the whole resource,
    /// unaligned to any chunk's own boundaries — standing in for a server
    /// that doesn't support `Range` at all. `register_call`/`forget_call`
    /// delegate to a real transport since they never touch the network.
    struct IgnoresRangeTransport {
        status: u16,
        body_chunks: Vec<&'static [u8]>,
        inner: ReqwestTransport,
    }

    #[async_trait::async_trait]
    impl Transport for IgnoresRangeTransport {
        async fn head(&self, _url: &str, _headers: &HashMap<String, String>) -> Result<HeadInfo> {
            unimplemented!("not exercised by this fixture")
        }

        async fn get(
            &self,
            _url: &str,
            _headers: &HashMap<String, String>,
            _range: Option<ByteRange>,
        ) -> Result<GetResponse> {
            let items: Vec<reqwest::Result<bytes::Bytes>> =
                self.body_chunks.iter().map(|c| Ok(bytes::Bytes::from(*c))).collect();
            Ok(GetResponse {
                status: self.status,
                headers: HashMap::new(),
                body: Box::pin(futures::stream::iter(items)),
            })
        }

        fn register_call(&self, session_id: &str) -> crate::transport::CallId {
            self.inner.register_call(session_id)
        }

        fn cancel_all(&self, session_id: &str) {
            self.inner.cancel_all(session_id)
        }

        fn forget_call(&self, session_id: &str, call: crate::transport::CallId) {
            self.inner.forget_call(session_id, call)
        }
    }

    #[tokio::test]
    async fn server_ignoring_range_writes_only_its_own_slice() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"XXXXXXXXXX").unwrap();

        let file = SharedFile::open(&path).unwrap();
        let transport = IgnoresRangeTransport {
            status: 200,
            body_chunks: vec![b"AB", b"CDE", b"FGH", b"IJ"],
            inner: ReqwestTransport::new(),
        };

        // This chunk owns bytes [3, 6) ("DEF") and carries stale resume
        // progress (5) from a prior attempt that the restart must ignore.
        let plan = ChunkPlan { index: 1, start: 3, end_inclusive: Some(5), resume_offset: 5 };
        let progress = ProgressAggregator::new(0, None);
        let on_chunk_state: ChunkStateSink = Arc::new(|_state| {});
        let on_progress: ProgressSink = Arc::new(|_update| {});

        fetch_chunk(FetchChunkArgs {
            plan,
            url: "http://example.com/a.bin",
            headers: &HashMap::new(),
            file: &file,
            transport: &transport,
            session_id: "session-1",
            progress: &progress,
            on_chunk_state: &on_chunk_state,
            on_progress: &on_progress,
        })
        .await
        .unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents, b"XXXDEFXXXX");
    }
}
