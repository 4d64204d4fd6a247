// Copyright (c) The testwright Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Supervision of the external test-runner process.
//!
//! One executor supervises at most one child at a time. The child is spawned
//! through the platform shell, its stdout/stderr are streamed into
//! accumulators while also being forwarded live to an [`OutputSink`], and a
//! timeout arms a graceful-then-forced termination sequence. A failing test
//! suite exits nonzero and still resolves successfully -- only spawn failure
//! and a busy executor are errors.

use crate::errors::ExecuteError;
use bytes::BytesMut;
use camino::Utf8PathBuf;
use std::{
    io,
    pin::pin,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::Notify,
    time::Instant,
};
use tracing::{debug, warn};

/// How long a terminated child gets to exit before it is forcibly killed.
const GRACE_PERIOD: Duration = Duration::from_millis(2000);

/// How long to keep draining pipes after the child exits. Descendant
/// processes may inherit the pipe and never close it.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// The size of each buffered reader's buffer, and the size at which we grow
/// the accumulators. This is the (normal) page size on most systems.
const CHUNK_SIZE: usize = 4 * 1024;

/// Which stream a forwarded chunk came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputStream {
    /// The child's standard output.
    Stdout,
    /// The child's standard error.
    Stderr,
}

/// Receives output chunks as they arrive, for operator visibility.
///
/// Forwarding happens as a side effect of capture, not as a flush at the end
/// of the run.
pub trait OutputSink: Send {
    /// Called once per captured chunk, in arrival order.
    fn chunk(&mut self, stream: OutputStream, chunk: &[u8]);
}

/// A sink that discards all output.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn chunk(&mut self, _stream: OutputStream, _chunk: &[u8]) {}
}

/// A sink that mirrors all chunks to a writer, interleaved in arrival order.
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
}

impl<W: io::Write + Send> WriterSink<W> {
    /// Creates a sink that mirrors output to `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: io::Write + Send> OutputSink for WriterSink<W> {
    fn chunk(&mut self, _stream: OutputStream, chunk: &[u8]) {
        // Mirroring is best-effort; a broken pipe must not kill the run.
        let _ = self.writer.write_all(chunk);
        let _ = self.writer.flush();
    }
}

/// What to run and under which constraints.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    /// The full shell command line.
    pub command: String,
    /// Working directory for the child.
    pub cwd: Utf8PathBuf,
    /// After this long, the graceful-then-forced termination sequence starts.
    pub timeout: Duration,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Creates a spec with no extra environment.
    pub fn new(command: impl Into<String>, cwd: impl Into<Utf8PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            timeout,
            env: Vec::new(),
        }
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Everything captured from one completed run.
#[derive(Clone, Debug)]
pub struct CommandOutput {
    /// All stdout chunks, concatenated, lossily decoded.
    pub stdout: String,
    /// All stderr chunks, concatenated, lossily decoded.
    pub stderr: String,
    /// The exit code, if the OS reported one. A signal-killed child reports
    /// none; callers must not assume a specific code after cancellation.
    pub exit_code: Option<i32>,
    /// True if the timeout fired. Explicit cancellation does not set this.
    pub timed_out: bool,
}

/// Runs one external process at a time with streaming capture, a timeout and
/// explicit cancellation.
#[derive(Clone, Debug, Default)]
pub struct ProcessExecutor {
    // Non-None only while a run is active. This is the single handle through
    // which cancellation reaches the child.
    current: Arc<Mutex<Option<Arc<Notify>>>>,
}

/// Cancels the run currently active on the owning executor.
///
/// Cloneable and safe to trigger from another task.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    current: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl CancelHandle {
    /// Requests termination of the active run, if any.
    ///
    /// Idempotent: calling with no run in flight, or calling repeatedly, is a
    /// no-op.
    pub fn cancel(&self) {
        let guard = self
            .current
            .lock()
            .expect("executor cancel state lock poisoned");
        if let Some(notify) = guard.as_ref() {
            notify.notify_one();
        }
    }
}

impl ProcessExecutor {
    /// Creates an idle executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle that can cancel whichever run is active when
    /// triggered.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            current: Arc::clone(&self.current),
        }
    }

    /// Cancels the active run, if any. Equivalent to
    /// `self.cancel_handle().cancel()`.
    pub fn cancel(&self) {
        self.cancel_handle().cancel();
    }

    /// Spawns `spec` through the platform shell and supervises it to
    /// completion.
    ///
    /// Resolves successfully on nonzero exits, timeouts and cancellation; the
    /// only error paths are spawn failure and a second `run` while one is
    /// already active.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        sink: &mut dyn OutputSink,
    ) -> Result<CommandOutput, ExecuteError> {
        let cancel = {
            let mut guard = self
                .current
                .lock()
                .expect("executor cancel state lock poisoned");
            if guard.is_some() {
                return Err(ExecuteError::AlreadyInProgress);
            }
            let notify = Arc::new(Notify::new());
            *guard = Some(Arc::clone(&notify));
            notify
        };
        // Cleared on every exit path, including spawn failure.
        let _active = ActiveRunGuard {
            current: Arc::clone(&self.current),
        };

        let mut child = spawn_shell(spec).map_err(|error| ExecuteError::Spawn(Arc::new(error)))?;
        debug!(pid = ?child.id(), command = %spec.command, "spawned runner process");

        let mut acc = ChildAccumulator::new(&mut child);
        let mut sleep = pin!(tokio::time::sleep(spec.timeout));
        let mut phase = TerminatePhase::Running;
        let mut timed_out = false;

        let wait_res = loop {
            tokio::select! {
                () = acc.fill_buf(sink), if !acc.is_done() => {}
                res = child.wait() => break res,
                () = &mut sleep, if phase != TerminatePhase::Killed => {
                    match phase {
                        TerminatePhase::Running => {
                            debug!(timeout = ?spec.timeout, "runner timed out, terminating");
                            timed_out = true;
                            terminate_gracefully(&child);
                            sleep.as_mut().reset(Instant::now() + GRACE_PERIOD);
                            phase = TerminatePhase::Graceful;
                        }
                        TerminatePhase::Graceful => {
                            debug!("grace period elapsed, killing runner");
                            terminate_forcefully(&mut child);
                            phase = TerminatePhase::Killed;
                        }
                        TerminatePhase::Killed => unreachable!("branch disabled once killed"),
                    }
                }
                () = cancel.notified(), if phase == TerminatePhase::Running => {
                    debug!("runner cancelled, terminating");
                    terminate_gracefully(&child);
                    sleep.as_mut().reset(Instant::now() + GRACE_PERIOD);
                    phase = TerminatePhase::Graceful;
                }
            }
        };

        // Pick up whatever is still buffered in the pipes. Bounded because a
        // leaked descendant can hold the write end open indefinitely.
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, acc.drain(sink)).await;

        let exit_code = match wait_res {
            Ok(status) => status.code(),
            Err(error) => {
                warn!(%error, "failed to collect runner exit status");
                None
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&acc.stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&acc.stderr_buf).into_owned(),
            exit_code,
            timed_out,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TerminatePhase {
    Running,
    Graceful,
    Killed,
}

struct ActiveRunGuard {
    current: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        *self
            .current
            .lock()
            .expect("executor cancel state lock poisoned") = None;
    }
}

fn spawn_shell(spec: &CommandSpec) -> io::Result<Child> {
    let mut cmd = shell_command(&spec.command);
    cmd.current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    cmd.spawn()
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn shell_command(command_line: &str) -> Command {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(command_line);
            // A fresh process group, so termination signals reach the
            // shell's children as well.
            cmd.process_group(0);
            cmd
        }

        fn terminate_gracefully(child: &Child) {
            if let Some(pid) = child.id() {
                // Signal the whole process group. There is a race with the
                // child's own exit, so errors are ignored.
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGTERM);
                }
            }
        }

        fn terminate_forcefully(child: &mut Child) {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
            let _ = child.start_kill();
        }
    } else {
        fn shell_command(command_line: &str) -> Command {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command_line);
            cmd
        }

        // Windows has no graceful termination signal for console processes;
        // the graceful phase is a no-op and the forced phase terminates the
        // process object.
        fn terminate_gracefully(_child: &Child) {}

        fn terminate_forcefully(child: &mut Child) {
            let _ = child.start_kill();
        }
    }
}

/// A `BufReader` over an `AsyncRead` that tracks whether the stream has
/// reached EOF or errored.
struct FusedBufReader<R> {
    reader: BufReader<R>,
    done: bool,
}

impl<R: AsyncRead + Unpin> FusedBufReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(CHUNK_SIZE, reader),
            done: false,
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    /// Appends available data to `acc`, returning how many bytes arrived.
    /// EOF and read errors both fuse the reader and return 0.
    async fn fill_buf(&mut self, acc: &mut BytesMut) -> usize {
        if self.done {
            return 0;
        }
        match self.reader.fill_buf().await {
            Ok(buf) => {
                if buf.is_empty() {
                    self.done = true;
                }
                acc.extend_from_slice(buf);
                let len = buf.len();
                self.reader.consume(len);
                len
            }
            Err(error) => {
                warn!(%error, "error reading runner output");
                self.done = true;
                0
            }
        }
    }
}

/// A version of [`FusedBufReader::fill_buf`] that works with an
/// `Option<FusedBufReader>`.
async fn fill_buf_opt<R: AsyncRead + Unpin>(
    reader: Option<&mut FusedBufReader<R>>,
    acc: &mut BytesMut,
) -> usize {
    match reader {
        Some(reader) => reader.fill_buf(acc).await,
        None => 0,
    }
}

/// A version of [`FusedBufReader::is_done`] that works with an
/// `Option<FusedBufReader>`.
fn is_done_opt<R: AsyncRead + Unpin>(reader: &Option<FusedBufReader<R>>) -> bool {
    reader.as_ref().is_none_or(|r| r.is_done())
}

/// Accumulates both output streams of one child while forwarding chunks to
/// the live sink.
struct ChildAccumulator {
    stdout: Option<FusedBufReader<tokio::process::ChildStdout>>,
    stderr: Option<FusedBufReader<tokio::process::ChildStderr>>,
    stdout_buf: BytesMut,
    stderr_buf: BytesMut,
}

impl ChildAccumulator {
    fn new(child: &mut Child) -> Self {
        Self {
            stdout: child.stdout.take().map(FusedBufReader::new),
            stderr: child.stderr.take().map(FusedBufReader::new),
            stdout_buf: BytesMut::with_capacity(CHUNK_SIZE),
            stderr_buf: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    fn is_done(&self) -> bool {
        is_done_opt(&self.stdout) && is_done_opt(&self.stderr)
    }

    /// Waits until either stream makes progress, then forwards the newly
    /// captured tail to the sink. Cancel-safe, since the underlying
    /// [`AsyncBufReadExt::fill_buf`] is cancel-safe.
    async fn fill_buf(&mut self, sink: &mut dyn OutputSink) {
        let filled = {
            let Self {
                stdout,
                stderr,
                stdout_buf,
                stderr_buf,
            } = self;
            tokio::select! {
                n = fill_buf_opt(stdout.as_mut(), stdout_buf), if !is_done_opt(stdout) => {
                    Some((OutputStream::Stdout, n))
                }
                n = fill_buf_opt(stderr.as_mut(), stderr_buf), if !is_done_opt(stderr) => {
                    Some((OutputStream::Stderr, n))
                }
                // If both are done, do nothing.
                else => None,
            }
        };

        if let Some((stream, appended)) = filled
            && appended > 0
        {
            let buf = match stream {
                OutputStream::Stdout => &self.stdout_buf,
                OutputStream::Stderr => &self.stderr_buf,
            };
            sink.chunk(stream, &buf[buf.len() - appended..]);
        }
    }

    async fn drain(&mut self, sink: &mut dyn OutputSink) {
        while !self.is_done() {
            self.fill_buf(sink).await;
        }
    }
}
