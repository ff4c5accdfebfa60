use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use downlink::{ChecksumAlgorithm, Engine, EngineConfig, Listener, Progress, Request};
use tracing::info;

struct StdoutListener;

impl Listener for StdoutListener {
    fn on_queued(&self, handle: &downlink::Handle) {
        info!(id = %handle.id, "queued");
    }

    fn on_started(&self, handle: &downlink::Handle) {
        info!(id = %handle.id, "started");
    }

    fn on_progress(&self, handle: &downlink::Handle, progress: Progress) {
        info!(
            id = %handle.id,
            downloaded = progress.downloaded_bytes,
            percent = ?progress.percent,
            bps = progress.bytes_per_second,
            "progress"
        );
    }

    fn on_retry(&self, handle: &downlink::Handle, attempt: u32) {
        info!(id = %handle.id, attempt, "retrying");
    }

    fn on_completed(&self, handle: &downlink::Handle) {
        info!(id = %handle.id, "completed");
    }

    fn on_failed(&self, handle: &downlink::Handle, error: &downlink::DownloadError) {
        info!(id = %handle.id, ?error, "failed");
    }

    fn on_cancelled(&self, handle: &downlink::Handle) {
        info!(id = %handle.id, "cancelled");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("downlink=info").init();

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(run())
}

async fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let url = args.next().context("usage: downlink <url> <file-name> [expected-sha256]")?;
    let file_name = args.next().context("usage: downlink <url> <file-name> [expected-sha256]")?;
    let expected_checksum = args.next();

    let listeners: Vec<Arc<dyn Listener>> = vec![Arc::new(StdoutListener)];
    let engine = Engine::new(EngineConfig::default(), listeners);

    let mut request = Request::new(url, file_name);
    if let Some(checksum) = expected_checksum {
        request = request.with_checksum(checksum, ChecksumAlgorithm::Sha256);
    }

    let preview = engine.preview_destination(&request)?;
    info!(?preview, "resolved destination");

    engine.enqueue(request)?;

    // The engine's retry driver runs on spawned tasks; give it room to
    // finish before the process (and its tokio runtime) exits.
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok(())
}
