//! A pooled handle around one long-lived interpreter process.
//!
//! The interpreter is started lazily on the first [`ProcessHandle::invoke`]
//! and reused across invocations until the handle is disposed. Each
//! invocation writes one wrapped command to stdin and reads stdout until the
//! invocation's sentinel line shows up.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use opsflow_core::config::InterpreterSettings;
use opsflow_core::db::unix_timestamp_millis;
use opsflow_core::text::{redact, strip_ansi};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::delimiter::BulkDelimiter;
use super::dialect::ScriptDialect;
use super::output::{OutputBuffer, Utf8Decoder};
use crate::pool::{DisposeError, Recyclable};

/// Placeholder message while a line is still arriving.
pub const RECEIVING_DATA: &str = "Receiving data...";

const READ_BUFFER_SIZE: usize = 8192;

const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Stderr lines kept for error messages; older lines are discarded.
const STDERR_TAIL_LINES: usize = 100;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InvocationStatus {
    NotStarted,
    Preparing,
    Running,
    Stopping,
    Stopped,
    Failed,
    Killed,
    Disposed,
}

impl InvocationStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Failed | Self::Killed | Self::Disposed
        )
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

/// A status transition or output notification from one handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationEvent {
    pub handle_id: u64,
    pub status: InvocationStatus,
    pub message: String,
    pub timestamp: i64,
}

/// Captured stdout of a successful invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvocationOutput {
    pub chunks: Vec<String>,
    pub exit_code: Option<i32>,
}

impl InvocationOutput {
    /// The last logical chunk.
    pub fn last(&self) -> Option<&str> {
        self.chunks.last().map(String::as_str)
    }

    pub fn text(&self) -> String {
        self.chunks.concat()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Process handle was disposed")]
    Disposed,

    #[error("Failed to start interpreter '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Interpreter I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Script exited with code {code}")]
    ScriptFailed {
        code: i32,
        stderr: String,
        output: Vec<String>,
    },

    #[error("Interpreter exited before the invocation finished")]
    InterpreterExited { stderr: String },
}

struct Interpreter {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    decoder: Utf8Decoder,
    stderr_task: JoinHandle<()>,
}

/// The most recent stderr lines of the current invocation.
#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push(&mut self, line: String) {
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn clear(&mut self) {
        self.lines.clear();
    }

    fn take(&mut self) -> String {
        Vec::from(std::mem::take(&mut self.lines)).join("\n")
    }
}

struct Shared {
    status: InvocationStatus,
    buffer: OutputBuffer,
    listeners: Vec<mpsc::UnboundedSender<InvocationEvent>>,
    /// Tokens whose sentinel has not been seen yet.
    tokens: HashSet<String>,
}

/// One pooled interpreter process.
pub struct ProcessHandle {
    id: u64,
    settings: Arc<InterpreterSettings>,
    dialect: ScriptDialect,
    delimiter: Arc<BulkDelimiter>,
    session: tokio::sync::Mutex<Option<Interpreter>>,
    shared: Mutex<Shared>,
    stderr: Arc<Mutex<StderrTail>>,
    /// Values masked in stderr before it is logged or kept.
    secrets: Arc<Mutex<Vec<String>>>,
    disposed: AtomicBool,
    kill_tx: watch::Sender<bool>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("program", &self.settings.program)
            .field("status", &self.status())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Resolves once the kill flag is raised.
async fn killed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|k| *k).await;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessHandle {
    pub fn new(settings: Arc<InterpreterSettings>, delimiter: Arc<BulkDelimiter>) -> Self {
        let (kill_tx, _) = watch::channel(false);
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            dialect: settings.dialect.into(),
            settings,
            delimiter,
            session: tokio::sync::Mutex::new(None),
            shared: Mutex::new(Shared {
                status: InvocationStatus::NotStarted,
                buffer: OutputBuffer::new(),
                listeners: Vec::new(),
                tokens: HashSet::new(),
            }),
            stderr: Arc::new(Mutex::new(StderrTail::default())),
            secrets: Arc::new(Mutex::new(Vec::new())),
            disposed: AtomicBool::new(false),
            kill_tx,
        }
    }

    /// A pool factory producing handles that share one settings block and
    /// delimiter.
    pub fn factory(
        settings: InterpreterSettings,
        delimiter: BulkDelimiter,
    ) -> impl Fn() -> anyhow::Result<Self> + Send + Sync + 'static {
        let settings = Arc::new(settings);
        let delimiter = Arc::new(delimiter);
        move || Ok(Self::new(Arc::clone(&settings), Arc::clone(&delimiter)))
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> InvocationStatus {
        lock(&self.shared).status
    }

    /// Register a listener for this handle's events. Listeners are dropped on
    /// [`reset`](Recyclable::reset).
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InvocationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared).listeners.push(tx);
        rx
    }

    /// Mask these values in interpreter stderr until the next
    /// [`reset`](Recyclable::reset).
    pub fn set_secrets<S: AsRef<str>>(&self, secrets: &[S]) {
        *lock(&self.secrets) = secrets.iter().map(|s| s.as_ref().to_string()).collect();
    }

    /// Snapshot of the current invocation's logical output chunks.
    pub fn output(&self) -> Vec<String> {
        lock(&self.shared).buffer.chunks().to_vec()
    }

    fn set_status(&self, status: InvocationStatus, message: impl Into<String>) {
        let mut shared = lock(&self.shared);
        shared.status = status;
        Self::emit(&mut shared, self.id, status, message.into());
    }

    fn emit(shared: &mut Shared, handle_id: u64, status: InvocationStatus, message: String) {
        let event = InvocationEvent {
            handle_id,
            status,
            message: strip_ansi(&message),
            timestamp: unix_timestamp_millis(),
        };
        shared
            .listeners
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn take_stderr(&self) -> String {
        lock(&self.stderr).take()
    }

    fn spawn(&self) -> Result<Interpreter, InvokeError> {
        let program = self.settings.program.display().to_string();
        let spawn_err = |source| InvokeError::Spawn {
            program: program.clone(),
            source,
        };

        let mut cmd = Command::new(&self.settings.program);
        cmd.args(&self.settings.args)
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(spawn_err)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err(std::io::Error::other("stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err(std::io::Error::other("stdout not captured")))?;

        let handle_id = self.id;
        let sink = Arc::clone(&self.stderr);
        let secrets = Arc::clone(&self.secrets);
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = redact(&line, lock(&secrets).as_slice());
                warn!(handle_id, "stderr: {}", line);
                lock(&sink).push(line);
            }
            debug!(handle_id, "stderr reader finished");
        });

        info!(handle_id, program = %program, pid = ?child.id(), "Interpreter started");

        Ok(Interpreter {
            child,
            stdin,
            stdout,
            decoder: Utf8Decoder::default(),
            stderr_task,
        })
    }

    /// Run one command and collect its output.
    ///
    /// Fails with [`InvokeError::Disposed`] if the handle is disposed before
    /// or during the invocation.
    pub async fn invoke(&self, command: &str) -> Result<InvocationOutput, InvokeError> {
        if self.is_disposed() {
            return Err(InvokeError::Disposed);
        }
        let mut kill_rx = self.kill_tx.subscribe();

        let mut session = tokio::select! {
            biased;
            () = killed(&mut kill_rx) => return Err(InvokeError::Disposed),
            session = self.session.lock() => session,
        };

        let token = BulkDelimiter::new_token();
        {
            let mut shared = lock(&self.shared);
            shared.buffer.clear();
            shared.tokens.insert(token.clone());
        }
        lock(&self.stderr).clear();
        self.set_status(InvocationStatus::Preparing, "Preparing");

        if session.is_none() {
            match self.spawn() {
                Ok(interpreter) => *session = Some(interpreter),
                Err(e) => {
                    self.set_status(InvocationStatus::Failed, e.to_string());
                    return Err(e);
                }
            }
        }
        let Some(interp) = session.as_mut() else {
            return Err(InvokeError::Disposed);
        };

        let wrapped = self.dialect.wrap_for_stdin(command, &token);
        let written = tokio::select! {
            biased;
            () = killed(&mut kill_rx) => None,
            r = async {
                interp.stdin.write_all(wrapped.as_bytes()).await?;
                interp.stdin.flush().await?;
                Ok::<_, std::io::Error>(())
            } => Some(r),
        };
        match written {
            None => return Err(self.abort_killed(&mut session).await),
            Some(Err(e)) => return Err(self.abort_broken(&mut session, Some(e)).await),
            Some(Ok(())) => {}
        }

        self.set_status(InvocationStatus::Running, "Running");
        debug!(handle_id = self.id, token = %token, "Command submitted");

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let Some(interp) = session.as_mut() else {
                return Err(InvokeError::Disposed);
            };
            let read = tokio::select! {
                biased;
                () = killed(&mut kill_rx) => None,
                r = interp.stdout.read(&mut buf) => Some(r),
            };
            let n = match read {
                None => return Err(self.abort_killed(&mut session).await),
                Some(Ok(0)) => return Err(self.abort_broken(&mut session, None).await),
                Some(Err(e)) => return Err(self.abort_broken(&mut session, Some(e)).await),
                Some(Ok(n)) => n,
            };
            let text = interp.decoder.decode(&buf[..n]);

            if let Some(code) = self.absorb(&text, &token) {
                return self.finish(&token, code);
            }
        }
    }

    /// Feed decoded stdout into the buffer and notify listeners. Returns the
    /// exit code once the sentinel for `token` has arrived.
    fn absorb(&self, text: &str, token: &str) -> Option<Option<i32>> {
        let mut shared = lock(&self.shared);
        shared.buffer.push(text);

        let mut finished = None;
        let mut produced = true;
        if !shared.buffer.is_fragment_pending()
            && let Some(chunk) = shared.buffer.pop_last()
        {
            let extraction = self.delimiter.extract(&chunk, token, &shared.tokens);
            produced = !extraction.text.is_empty();
            shared.buffer.push_chunk(extraction.text);
            finished = extraction.finished;
        }

        if produced {
            let message = if shared.buffer.is_fragment_pending() {
                RECEIVING_DATA.to_string()
            } else {
                shared.buffer.last_complete().unwrap_or_default().to_string()
            };
            Self::emit(&mut shared, self.id, InvocationStatus::Running, message);
        }
        finished
    }

    fn finish(&self, token: &str, code: Option<i32>) -> Result<InvocationOutput, InvokeError> {
        let output = {
            let mut shared = lock(&self.shared);
            shared.tokens.remove(token);
            shared.buffer.chunks().to_vec()
        };

        match code.unwrap_or(0) {
            0 => {
                self.set_status(InvocationStatus::Stopped, "Completed");
                Ok(InvocationOutput {
                    chunks: output,
                    exit_code: code,
                })
            }
            code => {
                self.set_status(InvocationStatus::Failed, format!("Exited with code {code}"));
                Err(InvokeError::ScriptFailed {
                    code,
                    stderr: self.take_stderr(),
                    output,
                })
            }
        }
    }

    /// The kill flag was raised mid-invocation: tear the process down now.
    async fn abort_killed(&self, session: &mut Option<Interpreter>) -> InvokeError {
        if let Some(mut interp) = session.take() {
            if let Err(e) = interp.child.kill().await {
                warn!(handle_id = self.id, error = %e, "Failed to kill interpreter");
            }
            interp.stderr_task.abort();
        }
        self.set_status(InvocationStatus::Killed, "Killed");
        info!(handle_id = self.id, "Invocation killed");
        InvokeError::Disposed
    }

    /// The interpreter went away. The handle cannot be reused.
    async fn abort_broken(
        &self,
        session: &mut Option<Interpreter>,
        io_error: Option<std::io::Error>,
    ) -> InvokeError {
        self.disposed.store(true, Ordering::SeqCst);
        if let Some(mut interp) = session.take() {
            let status = interp.child.wait().await;
            // Drain whatever stderr the process left behind.
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, interp.stderr_task).await;
            warn!(handle_id = self.id, ?status, "Interpreter exited unexpectedly");
        }
        let stderr = self.take_stderr();
        match io_error {
            Some(e) => {
                self.set_status(InvocationStatus::Failed, e.to_string());
                InvokeError::Io(e)
            }
            None => {
                self.set_status(InvocationStatus::Failed, "Interpreter exited");
                InvokeError::InterpreterExited { stderr }
            }
        }
    }

    async fn shutdown(&self, interp: Interpreter) -> Result<(), DisposeError> {
        let Interpreter {
            mut child,
            stdin,
            stderr_task,
            ..
        } = interp;
        // Closing stdin ends the interpreter's read loop.
        drop(stdin);
        let timeout = Duration::from_secs(self.settings.terminate_timeout_secs);
        let result = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(handle_id = self.id, ?status, "Interpreter exited gracefully");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(handle_id = self.id, error = %e, "Error waiting for interpreter");
                child.kill().await.ok();
                Err(DisposeError(e.to_string()))
            }
            Err(_) => {
                warn!(handle_id = self.id, "Timeout waiting for interpreter exit, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| DisposeError(e.to_string()))
            }
        };
        stderr_task.abort();
        result
    }
}

#[async_trait]
impl Recyclable for ProcessHandle {
    fn reset(&self) {
        let mut shared = lock(&self.shared);
        shared.buffer.clear();
        shared.listeners.clear();
        if !self.is_disposed() {
            shared.status = InvocationStatus::NotStarted;
        }
        drop(shared);
        lock(&self.stderr).clear();
        lock(&self.secrets).clear();
    }

    async fn dispose(&self) -> Result<(), DisposeError> {
        if self.disposed.swap(true, Ordering::SeqCst) && *self.kill_tx.borrow() {
            return Ok(());
        }
        if self.status() == InvocationStatus::Running {
            self.set_status(InvocationStatus::Stopping, "Stopping");
        }
        self.kill_tx.send_replace(true);

        let interp = self.session.lock().await.take();
        let result = match interp {
            Some(interp) => self.shutdown(interp).await,
            None => Ok(()),
        };

        self.set_status(InvocationStatus::Disposed, "Disposed");
        let mut shared = lock(&self.shared);
        shared.buffer.clear();
        shared.listeners.clear();
        shared.tokens.clear();
        drop(shared);
        info!(handle_id = self.id, "Process handle disposed");
        result
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn handle() -> ProcessHandle {
        ProcessHandle::new(
            Arc::new(InterpreterSettings::posix_shell()),
            Arc::new(BulkDelimiter::default()),
        )
    }

    #[tokio::test]
    async fn invoke_collects_output() {
        let h = handle();
        let out = h.invoke("echo one; echo two").await.unwrap();
        assert_eq!(out.text(), "one\ntwo\n");
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(h.status(), InvocationStatus::Stopped);
        assert!(h.status().is_terminal());
        h.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn interpreter_is_reused_between_invocations() {
        let h = handle();
        h.invoke("X=kept").await.unwrap();
        h.reset();
        assert_eq!(h.status(), InvocationStatus::NotStarted);
        assert!(!h.status().is_terminal());
        let out = h.invoke("echo $$").await.unwrap();
        let again = h.invoke("echo $$").await.unwrap();
        assert_eq!(out.last(), again.last());
        h.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn output_without_newline_is_kept() {
        let h = handle();
        let out = h.invoke("printf 'no newline'").await.unwrap();
        assert_eq!(out.text(), "no newline\n");
        h.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_script_failure() {
        let h = handle();
        let err = h.invoke("echo bad >&2; exit 3").await.unwrap_err();
        assert!(matches!(err, InvokeError::ScriptFailed { code: 3, .. }));
        assert_eq!(h.status(), InvocationStatus::Failed);
        assert!(!h.is_disposed());
        // The interpreter survives a failed script.
        assert!(h.invoke("true").await.is_ok());
        h.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn events_report_running_output() {
        let h = handle();
        let mut rx = h.subscribe();
        h.invoke("printf '\\033[31mred\\033[0m\\n'").await.unwrap();
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert_eq!(events[0].status, InvocationStatus::Preparing);
        assert!(
            events
                .iter()
                .any(|e| e.status == InvocationStatus::Running && e.message == "red\n")
        );
        assert_eq!(events.last().unwrap().status, InvocationStatus::Stopped);
        h.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn dispose_mid_invocation_rejects_invoke() {
        let h = Arc::new(handle());
        let runner = Arc::clone(&h);
        let task = tokio::spawn(async move { runner.invoke("sleep 5; echo late").await });
        tokio::time::sleep(Duration::from_millis(300)).await;

        h.dispose().await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(InvokeError::Disposed)));
        assert!(h.is_disposed());
        assert_eq!(h.status(), InvocationStatus::Disposed);
        assert!(h.status().is_terminal());
        assert!(matches!(h.invoke("true").await, Err(InvokeError::Disposed)));
    }

    #[derive(Clone, Default)]
    struct LogSink(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stderr_is_masked_in_logs_and_errors() {
        let sink = LogSink::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let h = handle();
        h.set_secrets(&["hunter2"]);
        let err = h
            .invoke("echo 'login pw=hunter2' >&2; sleep 0.3; exit 2")
            .await
            .unwrap_err();
        let InvokeError::ScriptFailed { stderr, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert!(!stderr.contains("hunter2"), "{stderr}");
        assert!(stderr.contains(opsflow_core::text::SECRET_MASK));

        let logs = String::from_utf8(lock(&sink.0).clone()).unwrap();
        assert!(logs.contains("stderr: login pw="), "{logs}");
        assert!(!logs.contains("hunter2"), "{logs}");

        // Secrets belong to one invocation.
        h.reset();
        let err = h.invoke("echo hunter2 >&2; sleep 0.3; exit 1").await.unwrap_err();
        let InvokeError::ScriptFailed { stderr, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(stderr, "hunter2");
        h.dispose().await.unwrap();
    }

    #[test]
    fn stderr_tail_keeps_latest_lines() {
        let mut tail = StderrTail::default();
        for i in 0..STDERR_TAIL_LINES + 5 {
            tail.push(format!("line {i}"));
        }
        assert_eq!(tail.lines.len(), STDERR_TAIL_LINES);
        assert_eq!(tail.lines.front().map(String::as_str), Some("line 5"));

        let text = tail.take();
        assert!(text.ends_with(&format!("line {}", STDERR_TAIL_LINES + 4)));
        assert!(tail.lines.is_empty());
    }

    #[tokio::test]
    async fn exiting_interpreter_marks_handle_disposed() {
        let h = handle();
        let err = h.invoke("kill -9 $$").await.unwrap_err();
        assert!(matches!(err, InvokeError::InterpreterExited { .. }));
        assert!(h.is_disposed());
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let settings = InterpreterSettings {
            program: "/nonexistent/interpreter".into(),
            ..InterpreterSettings::posix_shell()
        };
        let h = ProcessHandle::new(Arc::new(settings), Arc::new(BulkDelimiter::default()));
        assert!(matches!(
            h.invoke("true").await,
            Err(InvokeError::Spawn { .. })
        ));
        assert_eq!(h.status(), InvocationStatus::Failed);
    }

    #[tokio::test]
    async fn reset_clears_output_and_listeners() {
        let h = handle();
        let mut rx = h.subscribe();
        h.invoke("echo hi").await.unwrap();
        assert!(!h.output().is_empty());
        h.reset();
        assert!(h.output().is_empty());
        while rx.try_recv().is_ok() {}
        assert!(rx.recv().await.is_none());
        h.dispose().await.unwrap();
    }
}
