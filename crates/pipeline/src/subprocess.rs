//! Child process management: spawn, feed stdin, capture output, complete.
//!
//! A [`Subprocess`] describes the command and what to do with its streams.
//! A [`Spawner`] starts it and returns a [`ProcessHandle`] for bookkeeping plus
//! a receiver that yields the [`Completion`] exactly once when the child
//! exits. Terminating a process through its handle kills and reaps it without
//! delivering a completion.
//!
//! [`TokioSpawner`] drives each child from a task on the current runtime, so
//! on a current-thread runtime all pipe I/O is multiplexed on one thread.

use std::{
    fmt,
    process::Stdio,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use {
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
        process::{Child, ChildStdin, Command},
        sync::{mpsc, oneshot},
        task::JoinHandle,
        time::Instant,
    },
    tracing::{debug, warn},
};

use crate::error::{Error, Result};

/// Default per-stream capture limit.
pub const DEFAULT_CAPTURE_LIMIT: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// How long captured streams may stay open after the child has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Identifier assigned to each started process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// Which output streams are buffered in memory. Uncaptured streams are
/// inherited from the parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capture {
    pub stdout: bool,
    pub stderr: bool,
}

impl Capture {
    pub const ALL: Self = Self {
        stdout: true,
        stderr: true,
    };
    pub const NONE: Self = Self {
        stdout: false,
        stderr: false,
    };
}

/// A command to run, with its environment, queued stdin and capture flags.
#[derive(Debug, Clone)]
pub struct Subprocess {
    argv: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<Vec<u8>>>,
    capture: Capture,
    timeout: Option<Duration>,
    capture_limit: usize,
}

impl Subprocess {
    pub fn new(argv: Vec<String>, capture: Capture) -> Self {
        Self {
            argv,
            env: Vec::new(),
            stdin: None,
            capture,
            timeout: None,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }

    /// `[shell, "-c", command]`.
    pub fn shell(shell: &str, command: &str, capture: Capture) -> Self {
        Self::new(
            vec![shell.to_string(), "-c".to_string(), command.to_string()],
            capture,
        )
    }

    /// Set an environment variable for this child only.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Kill the child if it has not exited after `timeout`. Output captured
    /// up to that point is still delivered.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Per-stream capture limit; output past it is read and discarded.
    #[must_use]
    pub fn with_capture_limit(mut self, limit: usize) -> Self {
        self.capture_limit = limit;
        self
    }

    /// Append bytes to write to the child's stdin once started.
    ///
    /// Chunks are written in queue order and stdin is closed after the last
    /// one. An empty chunk still makes stdin a pipe that gets closed; with
    /// nothing queued at all the child's stdin is `/dev/null`.
    pub fn queue_stdin(&mut self, bytes: impl Into<Vec<u8>>) {
        self.stdin.get_or_insert_with(Vec::new).push(bytes.into());
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn capture(&self) -> Capture {
        self.capture
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Queued stdin chunks, `None` when nothing was queued.
    pub fn stdin_chunks(&self) -> Option<&[Vec<u8>]> {
        self.stdin.as_deref()
    }

    /// All queued stdin bytes concatenated.
    pub fn stdin_bytes(&self) -> Vec<u8> {
        self.stdin.iter().flatten().flatten().copied().collect()
    }

    /// Human-readable command for logs and errors.
    pub fn command_line(&self) -> String {
        match self.argv.as_slice() {
            [_, flag, command] if flag == "-c" => command.clone(),
            argv => argv.join(" "),
        }
    }
}

/// Result of a process that ran to exit (or was killed by its timeout).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub id: ProcessId,
    /// Exit code, `None` when the child was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

impl Completion {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// A started process: the bookkeeping handle and its completion.
#[derive(Debug)]
pub struct Started {
    pub handle: ProcessHandle,
    /// Resolves once with the completion; errors if the process was
    /// terminated through its handle instead.
    pub completion: oneshot::Receiver<Completion>,
}

/// Bookkeeping handle for a live process.
///
/// Dropping the handle asks the process to stop; use [`ProcessHandle::terminate`]
/// to also wait until it has been reaped.
pub struct ProcessHandle {
    id: ProcessId,
    pid: Option<u32>,
    label: String,
    kill: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    /// `kill` is signalled to stop the process; `driver` is the task that owns
    /// it and finishes once the process has been reaped.
    pub fn new(
        id: ProcessId,
        pid: Option<u32>,
        label: impl Into<String>,
        kill: oneshot::Sender<()>,
        driver: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            pid,
            label: label.into(),
            kill: Some(kill),
            driver: Some(driver),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the owning task has finished (process exited and reaped).
    pub fn is_finished(&self) -> bool {
        self.driver.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Kill the process if it is still running and wait until it is reaped.
    /// Its completion is not delivered.
    pub async fn terminate(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if let Some(driver) = self.driver.take()
            && let Err(e) = driver.await
        {
            warn!(id = %self.id, error = %e, "process driver task failed");
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Ordered set of a session's live processes.
#[derive(Debug, Default)]
pub struct ProcessSet {
    handles: Vec<ProcessHandle>,
}

impl ProcessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: ProcessHandle) {
        self.handles.push(handle);
    }

    pub fn remove(&mut self, id: ProcessId) -> Option<ProcessHandle> {
        let idx = self.handles.iter().position(|h| h.id == id)?;
        Some(self.handles.remove(idx))
    }

    pub fn contains(&self, id: ProcessId) -> bool {
        self.handles.iter().any(|h| h.id == id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Ids in insertion order.
    pub fn ids(&self) -> Vec<ProcessId> {
        self.handles.iter().map(|h| h.id).collect()
    }

    /// Terminate and reap every process, oldest first.
    pub async fn terminate_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.terminate().await;
        }
    }
}

/// Starts subprocesses. Implemented by [`TokioSpawner`]; tests substitute
/// their own to exercise orchestration without real processes.
pub trait Spawner: Send + Sync {
    /// Start `process`. Must be called from within a Tokio runtime.
    fn start(&self, process: Subprocess) -> Result<Started>;
}

/// Spawns real child processes with `tokio::process`.
#[derive(Debug, Default)]
pub struct TokioSpawner {
    next_id: AtomicU64,
}

impl TokioSpawner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Spawner for TokioSpawner {
    fn start(&self, process: Subprocess) -> Result<Started> {
        let label = process.command_line();
        let Subprocess {
            argv,
            env,
            stdin,
            capture,
            timeout,
            capture_limit,
        } = process;
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::InvalidCommand {
                message: "empty argument vector".into(),
            });
        };

        let piped_or = |capture: bool| {
            if capture {
                Stdio::piped()
            } else {
                Stdio::inherit()
            }
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(piped_or(capture.stdout))
            .stderr(piped_or(capture.stderr))
            .kill_on_drop(true);
        // Captured children get their own process group so a kill reaches
        // anything they started. Children on the terminal stay in its
        // foreground group.
        let isolate = capture.stdout || capture.stderr;
        #[cfg(unix)]
        {
            if isolate {
                cmd.process_group(0);
            }
        }

        let child = cmd.spawn().map_err(|e| Error::spawn(label.clone(), e))?;

        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let pid = child.id();
        debug!(%id, ?pid, command = %label, "process started");

        let (done_tx, done_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let driver = tokio::spawn(drive(
            id,
            child,
            pid.filter(|_| isolate),
            stdin.unwrap_or_default(),
            timeout,
            capture_limit,
            kill_rx,
            done_tx,
        ));

        Ok(Started {
            handle: ProcessHandle::new(id, pid, label, kill_tx, driver),
            completion: done_rx,
        })
    }
}

enum Exit {
    Status(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Killed,
}

enum CaptureEvent {
    Data(Vec<u8>),
    Truncated,
}

/// A stream being read by its own task. Chunks arrive over the channel so
/// whatever was read is still available if the task has to be abandoned.
struct StreamCapture {
    events: mpsc::UnboundedReceiver<CaptureEvent>,
    task: JoinHandle<()>,
}

impl StreamCapture {
    fn start<R: AsyncRead + Unpin + Send + 'static>(reader: R, limit: usize) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(read_capped(reader, limit, tx));
        Self { events, task }
    }
}

/// Owns one child from start to reap.
#[allow(clippy::too_many_arguments)]
async fn drive(
    id: ProcessId,
    mut child: Child,
    pgid: Option<u32>,
    stdin: Vec<Vec<u8>>,
    timeout: Option<Duration>,
    capture_limit: usize,
    mut kill_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<Completion>,
) {
    let feeder = child
        .stdin
        .take()
        .map(|pipe| tokio::spawn(feed_stdin(id, pipe, stdin)));
    let stdout = child
        .stdout
        .take()
        .map(|s| StreamCapture::start(s, capture_limit));
    let stderr = child
        .stderr
        .take()
        .map(|s| StreamCapture::start(s, capture_limit));

    let exit = tokio::select! {
        _ = &mut kill_rx => Exit::Killed,
        exit = wait_with_timeout(&mut child, timeout) => exit,
    };

    let (exit_code, timed_out) = match exit {
        Exit::Killed => {
            kill_tree(id, &mut child, pgid).await;
            for capture in [stdout, stderr].into_iter().flatten() {
                capture.task.abort();
            }
            if let Some(feeder) = feeder {
                feeder.abort();
            }
            debug!(%id, "process terminated");
            return;
        },
        Exit::TimedOut => {
            warn!(%id, timeout_ms = timeout.map(|t| t.as_millis() as u64), "process timed out, killing");
            kill_tree(id, &mut child, pgid).await;
            (None, true)
        },
        Exit::Status(Ok(status)) => (status.code(), false),
        Exit::Status(Err(e)) => {
            warn!(%id, error = %e, "failed to wait for process");
            (None, false)
        },
    };

    if let Some(feeder) = feeder
        && !feeder.is_finished()
    {
        feeder.abort();
    }

    // Descendants may still hold the pipes open; only wait briefly for EOF.
    let deadline = Instant::now() + DRAIN_GRACE;
    let completion = Completion {
        id,
        exit_code,
        timed_out,
        stdout: collect_capture(id, "stdout", stdout, deadline).await,
        stderr: collect_capture(id, "stderr", stderr, deadline).await,
    };
    debug!(
        %id,
        ?exit_code,
        stdout_len = completion.stdout.as_ref().map_or(0, Vec::len),
        stderr_len = completion.stderr.as_ref().map_or(0, Vec::len),
        "process exited"
    );

    if done_tx.send(completion).is_err() {
        debug!(%id, "completion receiver dropped");
    }
}

/// Kill the child and, on unix, every process in its group.
async fn kill_tree(id: ProcessId, child: &mut Child, pgid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::{
            sys::signal::{Signal, killpg},
            unistd::Pid,
        };
        if let Some(pgid) = pgid.and_then(|p| i32::try_from(p).ok())
            && let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL)
        {
            debug!(%id, error = %e, "failed to signal process group");
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;

    if let Err(e) = child.kill().await {
        warn!(%id, error = %e, "failed to kill process");
    }
}

async fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> Exit {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => Exit::Status(status),
            Err(_) => Exit::TimedOut,
        },
        None => Exit::Status(child.wait().await),
    }
}

async fn feed_stdin(id: ProcessId, mut pipe: ChildStdin, chunks: Vec<Vec<u8>>) {
    for chunk in chunks {
        if let Err(e) = pipe.write_all(&chunk).await {
            debug!(%id, error = %e, "stdin closed before all input was written");
            return;
        }
    }
    if let Err(e) = pipe.shutdown().await {
        debug!(%id, error = %e, "failed to close stdin");
    }
}

/// Read to EOF, forwarding at most `limit` bytes. Output past the limit is
/// read and dropped, with a single `Truncated` event.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    tx: mpsc::UnboundedSender<CaptureEvent>,
) {
    let mut kept = 0usize;
    let mut truncated = false;
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "failed to read captured output");
                break;
            },
        };
        let take = n.min(limit.saturating_sub(kept));
        if take > 0 && tx.send(CaptureEvent::Data(chunk[..take].to_vec())).is_err() {
            break;
        }
        kept += take;
        if take < n && !truncated {
            truncated = true;
            if tx.send(CaptureEvent::Truncated).is_err() {
                break;
            }
        }
    }
}

async fn collect_capture(
    id: ProcessId,
    stream: &'static str,
    capture: Option<StreamCapture>,
    deadline: Instant,
) -> Option<Vec<u8>> {
    let StreamCapture { mut events, task } = capture?;
    let mut out = Vec::new();
    let mut truncated = false;
    let mut apply = |event: CaptureEvent| match event {
        CaptureEvent::Data(chunk) => out.extend_from_slice(&chunk),
        CaptureEvent::Truncated => truncated = true,
    };

    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => apply(event),
            Ok(None) => break,
            Err(_) => {
                debug!(%id, stream, "output still open after exit, abandoning reader");
                task.abort();
                events.close();
                while let Ok(event) = events.try_recv() {
                    apply(event);
                }
                break;
            },
        }
    }

    if truncated {
        warn!(%id, stream, kept = out.len(), "captured output truncated");
    }
    Some(out)
}
