//! Build log streaming
//!
//! [`BuildLog`] buffers everything a build prints, echoes it to stdout for the
//! operator, and ships it to the server from a background flush loop. The
//! buffer is swapped out under its lock, so writers never wait on the network.
//!
//! Lines starting with [`SECTION_MARKER`] switch the phase tag attached to
//! subsequent output. Tagged output goes through the structured log endpoint
//! while the server supports it; see [`LogTransport`].

use buildq_common::{ApiError, ApiResult, BuildQueueApi, LogMetadata, LogResponse, LogTarget};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{AgentError, AgentResult};

/// Prefix of the line a build script prints when entering a phase
pub const SECTION_MARKER: &str = "##[buildq:section] ";

/// Longest partial line kept for marker detection
const MAX_TRACKED_LINE: usize = 512;

/// Destination for a build's output transcript
pub trait OutputSink: Send + Sync {
    fn write(&self, data: &[u8]);

    fn write_str(&self, text: &str) {
        self.write(text.as_bytes());
    }

    /// Whether something outside the build asked for it to stop
    fn terminate_requested(&self) -> bool {
        false
    }
}

/// Log delivery shared by every build a worker runs.
///
/// Remembers, for the lifetime of the connection, whether the server lacks
/// the structured log endpoint.
pub struct LogTransport {
    api: Arc<dyn BuildQueueApi>,
    structured_disabled: AtomicBool,
    structured_succeeded: AtomicBool,
}

impl LogTransport {
    pub fn new(api: Arc<dyn BuildQueueApi>) -> Self {
        Self {
            api,
            structured_disabled: AtomicBool::new(false),
            structured_succeeded: AtomicBool::new(false),
        }
    }

    /// Whether structured logging is still in use
    pub fn is_structured(&self) -> bool {
        !self.structured_disabled.load(Ordering::SeqCst)
    }

    /// Deliver one piece of text, preferring the structured endpoint.
    ///
    /// The first `NotFound` from the structured endpoint downgrades to plain
    /// logging for good. If structured logging already worked during this
    /// run, `NotFound` means the job or worker is gone and is returned.
    pub async fn send(
        &self,
        target: &LogTarget,
        text: &str,
        section: Option<&str>,
    ) -> ApiResult<LogResponse> {
        if self.is_structured() {
            let mut metadata = LogMetadata::new();
            if let Some(section) = section {
                metadata.insert("section".to_string(), section.to_string());
            }

            match self
                .api
                .log_build_output_structured(target, text, &metadata)
                .await
            {
                Ok(response) => {
                    self.structured_succeeded.store(true, Ordering::SeqCst);
                    return Ok(response);
                }
                Err(ApiError::NotFound(msg)) => {
                    if self.structured_succeeded.load(Ordering::SeqCst) {
                        return Err(ApiError::NotFound(msg));
                    }
                    warn!("Server does not support structured build logs, falling back to plain logs");
                    self.structured_disabled.store(true, Ordering::SeqCst);
                }
                Err(e) => return Err(e),
            }
        }

        self.api.log_build_output(target, text).await
    }
}

/// Settings for a [`BuildLog`]
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub flush_interval: Duration,
    /// Copy output to this process's stdout
    pub echo: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(3),
            echo: true,
        }
    }
}

#[derive(Debug)]
struct Chunk {
    section: Option<String>,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Buffer {
    chunks: VecDeque<Chunk>,
    section: Option<String>,
    line: Vec<u8>,
}

impl Buffer {
    fn append(&mut self, data: &[u8]) {
        for piece in data.split_inclusive(|b| *b == b'\n') {
            if self.line.len() < MAX_TRACKED_LINE {
                self.line.extend_from_slice(piece);
            }
            if piece.ends_with(b"\n") {
                let line = std::mem::take(&mut self.line);
                if let Some(section) = parse_marker(&line) {
                    self.section = Some(section);
                }
            }
            self.push(piece);
        }
    }

    fn push(&mut self, piece: &[u8]) {
        match self.chunks.back_mut() {
            Some(last) if last.section == self.section => last.data.extend_from_slice(piece),
            _ => self.chunks.push_back(Chunk {
                section: self.section.clone(),
                data: piece.to_vec(),
            }),
        }
    }

    /// Take everything ready to send.
    ///
    /// Unless `complete`, a trailing partial UTF-8 character stays buffered
    /// until the rest of it is written.
    fn take(&mut self, complete: bool) -> VecDeque<Chunk> {
        let mut ready = std::mem::take(&mut self.chunks);
        if complete {
            return ready;
        }

        if let Some(last) = ready.back_mut() {
            let partial = partial_char_len(&last.data);
            if partial > 0 {
                let tail = last.data.split_off(last.data.len() - partial);
                self.chunks.push_back(Chunk {
                    section: last.section.clone(),
                    data: tail,
                });
                if last.data.is_empty() {
                    ready.pop_back();
                }
            }
        }
        ready
    }

    fn requeue(&mut self, unsent: VecDeque<Chunk>) {
        for chunk in unsent.into_iter().rev() {
            self.chunks.push_front(chunk);
        }
    }
}

/// Length of an unfinished multi-byte character at the end of `data`
fn partial_char_len(data: &[u8]) -> usize {
    let start = data.len().saturating_sub(3);
    (start..data.len())
        .find(|&i| {
            matches!(
                std::str::from_utf8(&data[i..]),
                Err(e) if e.valid_up_to() == 0 && e.error_len().is_none()
            )
        })
        .map_or(0, |i| data.len() - i)
}

fn parse_marker(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(line).ok()?;
    let name = line.strip_prefix(SECTION_MARKER)?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

struct Shared {
    transport: Arc<LogTransport>,
    target: LogTarget,
    echo: bool,
    buffer: Mutex<Buffer>,
    flush_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    closing: AtomicBool,
    terminate: AtomicBool,
}

impl Shared {
    fn buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn flush(&self, complete: bool) -> AgentResult<()> {
        let _guard = self.flush_lock.lock().await;

        let mut pending = self.buffer().take(complete);
        while let Some(chunk) = pending.pop_front() {
            let text = String::from_utf8_lossy(&chunk.data).into_owned();
            match self
                .transport
                .send(&self.target, &text, chunk.section.as_deref())
                .await
            {
                Ok(response) => {
                    if response.terminate_build && !self.terminate.swap(true, Ordering::SeqCst) {
                        info!(job_id = %self.target.job_id, "Server requested build termination");
                    }
                }
                Err(e) => {
                    pending.push_front(chunk);
                    self.buffer().requeue(pending);
                    if e.is_not_found() {
                        // The job is gone server-side; nothing left to build for
                        self.terminate.store(true, Ordering::SeqCst);
                    }
                    return Err(AgentError::Log(e.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Buffered, remotely flushed build log for one job
pub struct BuildLog {
    shared: Arc<Shared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BuildLog {
    /// Open the log and start its background flush loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(transport: Arc<LogTransport>, target: LogTarget, options: LogOptions) -> Self {
        let shared = Arc::new(Shared {
            transport,
            target,
            echo: options.echo,
            buffer: Mutex::new(Buffer::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            closing: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
        });

        let flusher = tokio::spawn(flush_loop(shared.clone(), options.flush_interval));

        Self {
            shared,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Deliver everything buffered so far
    pub async fn flush(&self) -> AgentResult<()> {
        self.shared.flush(false).await
    }

    /// Ask the running build to stop at its next output read
    pub fn request_termination(&self) {
        self.shared.terminate.store(true, Ordering::SeqCst);
    }

    /// Stop the flush loop and deliver whatever is left.
    ///
    /// Fails if buffered output still cannot be delivered.
    pub async fn close(&self) -> AgentResult<()> {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();

        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = flusher {
            if let Err(e) = handle.await {
                warn!(error = %e, "Log flush loop ended abnormally");
            }
        }

        // Retry anything the loop could not deliver
        self.shared.flush(true).await
    }
}

impl OutputSink for BuildLog {
    fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.shared.echo {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(data);
            let _ = stdout.flush();
        }
        self.shared.buffer().append(data);
    }

    fn terminate_requested(&self) -> bool {
        self.shared.terminate.load(Ordering::SeqCst)
    }
}

impl Drop for BuildLog {
    fn drop(&mut self) {
        // Let a detached flush loop deliver what it has and exit
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

async fn flush_loop(shared: Arc<Shared>, interval: Duration) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shared.wake.notified() => {}
        }

        if let Err(e) = shared.flush(false).await {
            warn!(job_id = %shared.target.job_id, error = %e, "Failed to flush build log");
        }

        if shared.closing.load(Ordering::SeqCst) {
            break;
        }
    }
}
