//! Supervised build execution
//!
//! [`supervise`] runs a command with stdout and stderr captured into an
//! [`OutputSink`] while two independent timers watch it:
//!
//! - the total timeout, measured from process start
//! - the I/O timeout, measured from the last byte read on either stream
//!
//! Readers publish the time of their last read through an atomic; timers only
//! read that timestamp and report a [`Termination`] over a channel. The first
//! cause to arrive wins, the process tree is killed, and exactly one
//! diagnostic line is written as the final chunk of the transcript.
//!
//! A worker shutting down cancels the [`CancellationToken`] instead of
//! dropping the future, so the tree is killed and reaped the same way.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::log_sink::OutputSink;
use crate::terminator::Terminator;

/// How long to keep reading in-flight output after a forced kill
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How often to look for a termination request while the build is silent
const CANCEL_POLL: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 8192;

/// Time limits for one build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum total run time
    pub timeout: Duration,
    /// Maximum time without any output
    pub iotimeout: Duration,
}

/// Why a supervised command stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The command exited on its own
    Exited,
    /// Total timeout elapsed
    Timeout,
    /// No output for longer than the I/O timeout
    IoTimeout,
    /// Stop requested through the output sink
    UserRequested,
    /// The worker itself is shutting down
    Shutdown,
}

impl Termination {
    /// Diagnostic written to the build log when the build is killed
    pub fn message(&self, limits: &Limits) -> Option<String> {
        match self {
            Termination::Exited => None,
            Termination::Timeout => Some(format!(
                "\nTimeout: build exceeded maximum build time of {} seconds\n",
                limits.timeout.as_secs()
            )),
            Termination::IoTimeout => Some(format!(
                "\nTimeout: No output from program for {} seconds\n\
                 Timeout: If you require a longer timeout you may set the 'iotimeout' variable in your build instructions\n",
                limits.iotimeout.as_secs()
            )),
            Termination::UserRequested => {
                Some("\nUser requested: terminating build\n".to_string())
            }
            Termination::Shutdown => {
                Some("\nWorker shutting down: terminating build\n".to_string())
            }
        }
    }
}

/// Result of a supervised run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Supervised {
    pub exit_code: i32,
    pub termination: Termination,
}

/// Run `command` to completion or until a limit is hit.
///
/// On a forced stop the process tree is handed to `terminator`, the child is
/// still waited for, and its (non-zero) exit code is returned. Cancelling
/// `shutdown` is one such forced stop.
pub async fn supervise(
    mut command: Command,
    sink: &dyn OutputSink,
    limits: Limits,
    terminator: &dyn Terminator,
    shutdown: &CancellationToken,
) -> AgentResult<Supervised> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| AgentError::Spawn {
        command: program.clone(),
        source,
    })?;
    let pid = child.id();
    debug!(pid = ?pid, %program, "Spawned build process");

    let started = Instant::now();
    let last_output = Arc::new(AtomicU64::new(0));

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(stdout, out_tx.clone(), started, last_output.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(stderr, out_tx.clone(), started, last_output.clone())));
    }
    drop(out_tx);

    let (cause_tx, mut cause_rx) = mpsc::channel::<Termination>(2);
    let timers = [
        tokio::spawn(total_timer(limits.timeout, cause_tx.clone())),
        tokio::spawn(idle_timer(limits.iotimeout, started, last_output, cause_tx)),
    ];

    let mut cancel_poll = tokio::time::interval(CANCEL_POLL);
    let mut streams_open = true;
    let outcome: Result<std::io::Result<ExitStatus>, Termination> = loop {
        tokio::select! {
            biased;
            Some(cause) = cause_rx.recv() => break Err(cause),
            _ = shutdown.cancelled() => break Err(Termination::Shutdown),
            chunk = out_rx.recv(), if streams_open => match chunk {
                Some(data) => {
                    sink.write(&data);
                    if sink.terminate_requested() {
                        break Err(Termination::UserRequested);
                    }
                }
                None => streams_open = false,
            },
            status = child.wait(), if !streams_open => break Ok(status),
            _ = cancel_poll.tick() => {
                if sink.terminate_requested() {
                    break Err(Termination::UserRequested);
                }
            }
        }
    };

    for timer in timers {
        timer.abort();
        let _ = timer.await;
    }

    let result = match outcome {
        Ok(status) => Supervised {
            exit_code: exit_code(status?),
            termination: Termination::Exited,
        },
        Err(cause) => {
            info!(pid = ?pid, termination = ?cause, "Stopping build");
            terminator.terminate(pid).await;
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Child already gone");
            }

            // Keep the transcript complete up to the kill
            let drained = tokio::time::timeout(DRAIN_GRACE, async {
                while let Some(data) = out_rx.recv().await {
                    sink.write(&data);
                }
            })
            .await;
            if drained.is_err() {
                warn!(pid = ?pid, "Output still open after kill; a descendant may have survived");
            }

            if let Some(message) = cause.message(&limits) {
                sink.write_str(&message);
            }

            let status = child.wait().await?;
            Supervised {
                exit_code: exit_code(status),
                termination: cause,
            }
        }
    };

    for reader in readers {
        reader.abort();
    }

    Ok(result)
}

async fn pump<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    started: Instant,
    last_output: Arc<AtomicU64>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                last_output.store(started.elapsed().as_millis() as u64, Ordering::SeqCst);
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output stream closed");
                break;
            }
        }
    }
}

async fn total_timer(timeout: Duration, tx: mpsc::Sender<Termination>) {
    tokio::time::sleep(timeout).await;
    let _ = tx.send(Termination::Timeout).await;
}

async fn idle_timer(
    iotimeout: Duration,
    started: Instant,
    last_output: Arc<AtomicU64>,
    tx: mpsc::Sender<Termination>,
) {
    loop {
        let last = Duration::from_millis(last_output.load(Ordering::SeqCst));
        let silent = started.elapsed().saturating_sub(last);
        if silent >= iotimeout {
            let _ = tx.send(Termination::IoTimeout).await;
            return;
        }
        tokio::time::sleep(iotimeout - silent).await;
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::terminator::ProcessTreeTerminator;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Transcript {
        data: Mutex<Vec<u8>>,
        stop_after_first_write: bool,
        stop: AtomicBool,
    }

    impl Transcript {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.data.lock().unwrap()).into_owned()
        }
    }

    impl OutputSink for Transcript {
        fn write(&self, data: &[u8]) {
            self.data.lock().unwrap().extend_from_slice(data);
            if self.stop_after_first_write {
                self.stop.store(true, Ordering::SeqCst);
            }
        }

        fn terminate_requested(&self) -> bool {
            self.stop.load(Ordering::SeqCst)
        }
    }

    fn bash(script: &str) -> Command {
        let mut command = Command::new("bash");
        command.args(["-c", script]);
        command
    }

    fn limits(timeout: u64, iotimeout: u64) -> Limits {
        Limits {
            timeout: Duration::from_secs(timeout),
            iotimeout: Duration::from_secs(iotimeout),
        }
    }

    #[tokio::test]
    async fn test_normal_exit_returns_real_code() {
        let sink = Transcript::default();
        let result = supervise(
            bash("echo out; echo err >&2; exit 3"),
            &sink,
            limits(30, 30),
            &ProcessTreeTerminator,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.termination, Termination::Exited);
        let text = sink.text();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
        assert!(!text.contains("Timeout"));
    }

    #[tokio::test]
    async fn test_silent_process_hits_iotimeout_only() {
        let sink = Transcript::default();
        let result = supervise(
            bash("while true; do echo tick; sleep 3; done"),
            &sink,
            limits(60, 1),
            &ProcessTreeTerminator,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.termination, Termination::IoTimeout);
        assert_ne!(result.exit_code, 0);
        let text = sink.text();
        assert_eq!(text.matches("No output from program for 1 seconds").count(), 1);
        assert!(!text.contains("exceeded maximum build time"));
        assert!(text.contains("iotimeout"));
    }

    #[tokio::test]
    async fn test_chatty_process_hits_total_timeout_only() {
        let sink = Transcript::default();
        let result = supervise(
            bash("while true; do echo tick; sleep 0.1; done"),
            &sink,
            limits(1, 10),
            &ProcessTreeTerminator,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.termination, Termination::Timeout);
        let text = sink.text();
        assert_eq!(
            text.matches("exceeded maximum build time of 1 seconds").count(),
            1
        );
        assert!(!text.contains("No output"));
        assert!(text.ends_with("exceeded maximum build time of 1 seconds\n"));
    }

    #[tokio::test]
    async fn test_termination_request_stops_build() {
        let sink = Transcript {
            stop_after_first_write: true,
            ..Default::default()
        };
        let started = std::time::Instant::now();
        let result = supervise(
            bash("echo starting; sleep 30"),
            &sink,
            limits(60, 60),
            &ProcessTreeTerminator,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.termination, Termination::UserRequested);
        assert!(started.elapsed() < Duration::from_secs(20));
        assert!(sink.text().ends_with("User requested: terminating build\n"));
    }

    #[tokio::test]
    async fn test_background_children_are_killed() {
        let sink = Transcript::default();
        let started = std::time::Instant::now();
        let result = supervise(
            bash("sleep 300 & echo started; wait"),
            &sink,
            limits(60, 1),
            &ProcessTreeTerminator,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.termination, Termination::IoTimeout);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_shutdown_kills_tree_and_waits() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let sink = Transcript::default();
        let shutdown = CancellationToken::new();

        let canceller = {
            let shutdown = shutdown.clone();
            let pid_file = pid_file.clone();
            tokio::spawn(async move {
                while !pid_file.exists() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                shutdown.cancel();
            })
        };

        let script = format!("sleep 300 & echo $! > {}; wait", pid_file.display());
        let result = supervise(
            bash(&script),
            &sink,
            limits(60, 60),
            &ProcessTreeTerminator,
            &shutdown,
        )
        .await
        .unwrap();
        canceller.await.unwrap();

        assert_eq!(result.termination, Termination::Shutdown);
        assert_ne!(result.exit_code, 0);
        assert!(sink.text().ends_with("Worker shutting down: terminating build\n"));

        let grandchild: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while crate::terminator::is_alive(grandchild) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!crate::terminator::is_alive(grandchild));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let sink = Transcript::default();
        let err = supervise(
            Command::new("/nonexistent/buildq-test-binary"),
            &sink,
            limits(5, 5),
            &ProcessTreeTerminator,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AgentError::Spawn { .. }));
    }
}
