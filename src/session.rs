//! Per-connection session state, command dispatch, and subprocess
//! supervision.
//!
//! A `Session` is exclusively owned by its connection task, so none of
//! this needs locking. The session holds at most one foreground process
//! whose output streams back to the client, plus any number of
//! backgrounded processes that are only polled for liveness.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::protocol::{Code, Frame};

/// Reply sent for ARE_YOU_THERE.
pub const LIVENESS_REPLY: &str = "Poke me again! I dare you!!!\n";

/// How long the supervisor waits for in-flight reader chunks once a
/// process has been observed dead, so the terminal frame stays last.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Why PROCESS_EXECUTE could not produce a running subprocess.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Failed to start process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Process exited before it could be supervised")]
    EarlyExit,
}

/// Byte sink feeding a subprocess' stdin. Created lazily; bytes written
/// before the process starts queue up in the channel and flush once the
/// sink is attached. Dropping the sink closes the channel, which ends
/// the writer task and delivers EOF to the subprocess.
struct InputSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl InputSink {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }

    fn write(&self, data: &[u8]) {
        // A closed receiver means the writer task ended with the process.
        let _ = self.tx.send(data.to_vec());
    }

    fn attach(&mut self, mut stdin: ChildStdin) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if stdin.write_all(&chunk).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });
    }
}

/// A supervised foreground subprocess.
///
/// Lives from a successful spawn until its termination has been reported
/// (foreground) or until it is moved to the background set.
struct ProcessHandle {
    pid: u32,
    child: Child,
    started: Instant,
    stdout: mpsc::UnboundedReceiver<Vec<u8>>,
    stderr: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Streams a child pipe into an unbounded channel, chunk by chunk, so
/// the poll tick can drain whatever is available without blocking.
fn stream_chunks<R>(mut reader: R) -> mpsc::UnboundedReceiver<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // Send failure means the session stopped listening
                    // (process backgrounded or dropped).
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

pub struct Session {
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    foreground: Option<ProcessHandle>,
    background: HashMap<u32, Child>,
    stdin: Option<InputSink>,
    binary: String,
    timeout: Option<Duration>,
}

impl Session {
    pub fn new(config: &Config) -> Self {
        Self {
            cwd: None,
            env: BTreeMap::new(),
            foreground: None,
            background: HashMap::new(),
            stdin: None,
            binary: config.binary.clone(),
            timeout: config.timeout,
        }
    }

    /// True while the poll tick still has work: a foreground process or
    /// any backgrounded one is alive.
    pub fn has_live_processes(&self) -> bool {
        self.foreground.is_some() || !self.background.is_empty()
    }

    /// Dispatches one decoded frame against the session, returning the
    /// frames to send back to the client.
    pub fn handle(&mut self, frame: Frame) -> Vec<Frame> {
        debug!(command = frame.code.name(), "dispatching frame");
        let data = frame.data.unwrap_or_default();

        match frame.code {
            Code::SetCwd => self.set_cwd(&data),
            Code::SetEnv => self.set_env(&data),
            Code::GetEnv => vec![Frame::block(Code::ProcessStdout, self.env_json())],
            Code::ProcessExecute => self.execute(&data),
            Code::ProcessWrite => {
                self.write_stdin(&data);
                Vec::new()
            }
            Code::ProcessKill => {
                self.signal_foreground(Signal::SIGKILL);
                Vec::new()
            }
            Code::ProcessInterupt => {
                self.signal_foreground(Signal::SIGINT);
                Vec::new()
            }
            Code::ProcessSignal => {
                self.signal_by_number(&data);
                Vec::new()
            }
            Code::AbortOutput => self.abort_output(),
            Code::AreYouThere => vec![Frame::block(Code::ProcessStdout, LIVENESS_REPLY)],
            other => {
                debug!(command = other.name(), "ignoring unsupported command");
                Vec::new()
            }
        }
    }

    /// One supervisor tick: stream pending output, enforce the timeout,
    /// report termination, and prune exited background processes.
    pub async fn poll(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();

        if let Some(mut handle) = self.foreground.take() {
            drain_ready(&mut handle.stdout, Code::ProcessStdout, &mut out);
            drain_ready(&mut handle.stderr, Code::ProcessStderr, &mut out);

            match handle.child.try_wait() {
                Ok(Some(status)) => {
                    drain_remaining(&mut handle.stdout, Code::ProcessStdout, &mut out).await;
                    drain_remaining(&mut handle.stderr, Code::ProcessStderr, &mut out).await;
                    debug!(pid = handle.pid, ?status, "foreground process finished");
                    out.push(termination_frame(status));
                    // EOF for anything still holding the pipe, and the
                    // handle drops here: termination is reported once.
                    self.stdin = None;
                }
                Ok(None) => {
                    if let Some(timeout) = self.timeout {
                        if handle.started.elapsed() > timeout {
                            debug!(pid = handle.pid, "process exceeded timeout");
                            kill_pid(handle.pid, Signal::SIGKILL);
                        }
                    }
                    self.foreground = Some(handle);
                }
                Err(err) => {
                    warn!(pid = handle.pid, %err, "failed to poll foreground process");
                    self.foreground = Some(handle);
                }
            }
        }

        self.background.retain(|pid, child| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(pid = *pid, ?status, "background process finished");
                false
            }
            Err(err) => {
                warn!(pid = *pid, %err, "failed to poll background process");
                false
            }
        });

        out
    }

    /// Disconnect policy: the foreground process dies with its client;
    /// backgrounded processes keep running detached.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.foreground.take() {
            debug!(pid = handle.pid, "killing foreground process on disconnect");
            kill_pid(handle.pid, Signal::SIGKILL);
        }
        self.stdin = None;
        self.background.clear();
    }

    fn set_cwd(&mut self, data: &[u8]) -> Vec<Frame> {
        let path = String::from_utf8_lossy(data);
        let dir = PathBuf::from(path.as_ref());
        if dir.is_dir() {
            self.cwd = Some(dir);
            vec![Frame::block(Code::SetCwd, data.to_vec())]
        } else {
            vec![stderr_frame(format!(
                "The directory \"{path}\" doesn't exist!"
            ))]
        }
    }

    fn set_env(&mut self, data: &[u8]) -> Vec<Frame> {
        let text = String::from_utf8_lossy(data).into_owned();
        match parse_env_payload(&text) {
            Some(EnvUpdate::Replace(vars)) => {
                self.env = vars;
                vec![Frame::block(Code::SetEnv, self.env_json())]
            }
            Some(EnvUpdate::Merge(name, value)) => {
                match value {
                    Some(value) => {
                        self.env.insert(name, value);
                    }
                    None => {
                        self.env.remove(&name);
                    }
                }
                vec![Frame::block(Code::SetEnv, self.env_json())]
            }
            None => vec![stderr_frame(format!("Malformed env variable \"{text}\"!"))],
        }
    }

    fn env_json(&self) -> Vec<u8> {
        // BTreeMap keeps the object deterministic between calls.
        serde_json::to_vec(&self.env).unwrap_or_else(|_| b"{}".to_vec())
    }

    fn execute(&mut self, data: &[u8]) -> Vec<Frame> {
        if self.foreground.is_some() {
            return vec![stderr_frame("A process is already running!")];
        }
        let line = String::from_utf8_lossy(data).trim().to_owned();
        match self.spawn_process(&line) {
            Ok(pid) => vec![Frame::block(Code::ProcessExecute, pid.to_string())],
            Err(err) => {
                warn!(%err, command = %line, "failed to start process");
                vec![stderr_frame(err.to_string())]
            }
        }
    }

    fn spawn_process(&mut self, line: &str) -> Result<u32, SpawnError> {
        let line = self.substitute_binary(line);
        debug!(command = %line, "running command");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&line)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let pid = child.id().ok_or(SpawnError::EarlyExit)?;
        let stdout = stream_chunks(child.stdout.take().ok_or(SpawnError::EarlyExit)?);
        let stderr = stream_chunks(child.stderr.take().ok_or(SpawnError::EarlyExit)?);
        let stdin = child.stdin.take().ok_or(SpawnError::EarlyExit)?;

        self.stdin.get_or_insert_with(InputSink::new).attach(stdin);
        self.foreground = Some(ProcessHandle {
            pid,
            child,
            started: Instant::now(),
            stdout,
            stderr,
        });

        Ok(pid)
    }

    /// Rewrites a leading `php ` token to the configured interpreter
    /// binary when an override is in effect.
    fn substitute_binary(&self, line: &str) -> String {
        if self.binary != "php" {
            if let Some(rest) = line.strip_prefix("php ") {
                return format!("{} {}", self.binary, rest);
            }
        }
        line.to_owned()
    }

    fn write_stdin(&mut self, data: &[u8]) {
        self.stdin.get_or_insert_with(InputSink::new).write(data);
    }

    fn signal_foreground(&self, signal: Signal) {
        if let Some(handle) = &self.foreground {
            kill_pid(handle.pid, signal);
        }
    }

    fn signal_by_number(&self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        let Ok(number) = text.trim().parse::<i32>() else {
            warn!(payload = %text, "ignoring non-numeric signal");
            return;
        };
        match Signal::try_from(number) {
            Ok(signal) => self.signal_foreground(signal),
            Err(err) => warn!(number, %err, "ignoring unknown signal number"),
        }
    }

    fn abort_output(&mut self) -> Vec<Frame> {
        let Some(handle) = self.foreground.take() else {
            return Vec::new();
        };
        // Dropping the sink ends the writer task; the child sees EOF on
        // stdin. Its output readers wind down on their next send.
        self.stdin = None;
        self.background.insert(handle.pid, handle.child);
        vec![Frame::block(Code::AbortOutput, handle.pid.to_string())]
    }
}

fn stderr_frame(message: impl Into<Vec<u8>>) -> Frame {
    Frame::block(Code::ProcessStderr, message)
}

fn kill_pid(pid: u32, signal: Signal) {
    if let Err(err) = signal::kill(Pid::from_raw(pid as i32), signal) {
        warn!(pid, ?signal, %err, "failed to signal process");
    }
}

fn termination_frame(status: ExitStatus) -> Frame {
    use std::os::unix::process::ExitStatusExt;

    if let Some(signal) = status.signal() {
        Frame::block(Code::ProcessSignal, signal.to_string())
    } else {
        let code = status.code().unwrap_or_default();
        Frame::block(Code::ProcessExitcode, code.to_string())
    }
}

/// Drains whatever chunks are ready right now, without waiting.
fn drain_ready(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, code: Code, out: &mut Vec<Frame>) {
    while let Ok(chunk) = rx.try_recv() {
        out.push(Frame::block(code, chunk));
    }
}

/// Collects what the reader tasks still have in flight after the process
/// died. The channels close once the readers hit EOF; the grace deadline
/// bounds the whole drain, so a grandchild that inherited the pipe and
/// keeps writing cannot hold up the poll tick.
async fn drain_remaining(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, code: Code, out: &mut Vec<Frame>) {
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(chunk)) => out.push(Frame::block(code, chunk)),
            Ok(None) | Err(_) => break,
        }
    }
}

enum EnvUpdate {
    /// JSON object payload replaces the whole map.
    Replace(BTreeMap<String, String>),
    /// Single `name = value` pair; a `None` value removes the name.
    Merge(String, Option<String>),
}

fn parse_env_payload(text: &str) -> Option<EnvUpdate> {
    if text.is_empty() {
        return None;
    }

    if text.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let object = value.as_object()?;
        let mut vars = BTreeMap::new();
        for (name, value) in object {
            match value {
                serde_json::Value::String(s) => {
                    vars.insert(name.clone(), s.clone());
                }
                serde_json::Value::Null => {}
                other => {
                    vars.insert(name.clone(), other.to_string());
                }
            }
        }
        return Some(EnvUpdate::Replace(vars));
    }

    let (name, value) = text.split_once('=')?;
    let name = name.trim().to_owned();
    let value = value.trim();
    if value.eq_ignore_ascii_case("null") {
        return Some(EnvUpdate::Merge(name, None));
    }
    Some(EnvUpdate::Merge(name, Some(unquote(value))))
}

/// Strips matching double or single quotes, unescaping the quote
/// character, when the value is a single fully quoted string. Anything
/// else is taken verbatim.
fn unquote(value: &str) -> String {
    for quote in ['"', '\''] {
        if let Some(inner) = quoted_inner(value, quote) {
            return inner;
        }
    }
    value.to_owned()
}

/// Returns the unescaped contents when `value` is wrapped in `quote` and
/// every interior occurrence of the quote character is backslash-escaped.
fn quoted_inner(value: &str, quote: char) -> Option<String> {
    let inner = value.strip_prefix(quote)?.strip_suffix(quote)?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == quote {
            // Unescaped quote in the middle: not a single quoted string.
            return None;
        }
        if ch == '\\' {
            match chars.next() {
                Some(next) if next == quote => out.push(quote),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => return None,
            }
        } else {
            out.push(ch);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            host: "localhost".to_owned(),
            port: 0,
            debug: false,
            binary: "php".to_owned(),
            timeout: None,
            lock_file: std::env::temp_dir().join("php-remote-daemon-test.lock"),
        }
    }

    fn session() -> Session {
        Session::new(&test_config())
    }

    fn block(code: Code, data: &str) -> Frame {
        Frame::block(code, data.as_bytes().to_vec())
    }

    fn payload_string(frame: &Frame) -> String {
        String::from_utf8_lossy(frame.data.as_deref().unwrap_or_default()).into_owned()
    }

    /// Polls the session until the foreground process has been reported,
    /// collecting every emitted frame.
    async fn poll_to_completion(session: &mut Session) -> Vec<Frame> {
        let mut frames = Vec::new();
        for _ in 0..500 {
            frames.extend(session.poll().await);
            if session.foreground.is_none() {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process never finished; frames so far: {frames:?}");
    }

    #[tokio::test]
    async fn are_you_there_replies_with_fixed_string() {
        let mut session = session();
        let frames = session.handle(Frame::bare(Code::AreYouThere));
        assert_eq!(
            frames,
            vec![block(Code::ProcessStdout, LIVENESS_REPLY)]
        );
    }

    #[tokio::test]
    async fn set_cwd_accepts_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_owned();

        let mut session = session();
        let frames = session.handle(block(Code::SetCwd, &path));
        assert_eq!(frames, vec![block(Code::SetCwd, &path)]);
        assert_eq!(session.cwd, Some(PathBuf::from(&path)));
    }

    #[tokio::test]
    async fn set_cwd_rejects_missing_directory() {
        let mut session = session();
        let frames = session.handle(block(Code::SetCwd, "/no/such/dir/anywhere"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].code, Code::ProcessStderr);
        assert!(payload_string(&frames[0]).contains("doesn't exist"));
        assert_eq!(session.cwd, None);
    }

    #[tokio::test]
    async fn set_env_merges_single_pair() {
        let mut session = session();
        session.handle(block(Code::SetEnv, "FIRST=1"));
        let frames = session.handle(block(Code::SetEnv, "SECOND = two"));
        assert_eq!(
            frames,
            vec![block(Code::SetEnv, r#"{"FIRST":"1","SECOND":"two"}"#)]
        );
    }

    #[tokio::test]
    async fn set_env_unescapes_double_quoted_value() {
        let mut session = session();
        let frames = session.handle(block(Code::SetEnv, r#"GREETING = "Hello \"World\"!""#));
        assert_eq!(
            frames,
            vec![block(Code::SetEnv, r#"{"GREETING":"Hello \"World\"!"}"#)]
        );
    }

    #[tokio::test]
    async fn set_env_unescapes_single_quoted_value() {
        let mut session = session();
        let frames = session.handle(block(Code::SetEnv, r"NAME = 'Peter\'s World!'"));
        assert_eq!(
            frames,
            vec![block(Code::SetEnv, r#"{"NAME":"Peter's World!"}"#)]
        );
    }

    #[tokio::test]
    async fn set_env_null_removes_name() {
        let mut session = session();
        session.handle(block(Code::SetEnv, r#"{"KEEP":"yes","DROP":"no"}"#));
        let frames = session.handle(block(Code::SetEnv, "DROP=null"));
        assert_eq!(frames, vec![block(Code::SetEnv, r#"{"KEEP":"yes"}"#)]);
    }

    #[tokio::test]
    async fn set_env_json_replaces_whole_map() {
        let mut session = session();
        session.handle(block(Code::SetEnv, "OLD=value"));
        let frames = session.handle(block(Code::SetEnv, r#"{"NEW":"only"}"#));
        assert_eq!(frames, vec![block(Code::SetEnv, r#"{"NEW":"only"}"#)]);
    }

    #[tokio::test]
    async fn set_env_rejects_malformed_payloads() {
        let mut session = session();
        session.handle(block(Code::SetEnv, "KEEP=1"));

        for bad in ["", "{not json", "no equals sign"] {
            let frames = session.handle(block(Code::SetEnv, bad));
            assert_eq!(frames.len(), 1, "payload {bad:?}");
            assert_eq!(frames[0].code, Code::ProcessStderr);
            assert!(payload_string(&frames[0]).contains("Malformed env variable"));
        }

        // Map untouched by the failures above.
        let frames = session.handle(Frame::bare(Code::GetEnv));
        assert_eq!(frames, vec![block(Code::ProcessStdout, r#"{"KEEP":"1"}"#)]);
    }

    #[tokio::test]
    async fn get_env_is_idempotent() {
        let mut session = session();
        session.handle(block(Code::SetEnv, r#"{"B":"2","A":"1"}"#));
        let first = session.handle(Frame::bare(Code::GetEnv));
        let second = session.handle(Frame::bare(Code::GetEnv));
        assert_eq!(first, second);
        assert_eq!(first, vec![block(Code::ProcessStdout, r#"{"A":"1","B":"2"}"#)]);
    }

    #[tokio::test]
    async fn execute_streams_stdout_and_exit_code() {
        let mut session = session();
        let frames = session.handle(block(Code::ProcessExecute, "echo hello"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].code, Code::ProcessExecute);
        assert!(payload_string(&frames[0]).parse::<u32>().is_ok());

        let frames = poll_to_completion(&mut session).await;
        let stdout: Vec<u8> = frames
            .iter()
            .filter(|f| f.code == Code::ProcessStdout)
            .flat_map(|f| f.data.clone().unwrap_or_default())
            .collect();
        assert_eq!(stdout, b"hello\n");
        let last = frames.last().unwrap();
        assert_eq!(last.code, Code::ProcessExitcode);
        assert_eq!(payload_string(last), "0");
    }

    #[tokio::test]
    async fn stdin_written_before_execute_reaches_the_process() {
        let mut session = session();
        session.handle(block(Code::ProcessWrite, "buffered line\n"));
        session.handle(block(Code::ProcessExecute, "head -n 1"));

        let frames = poll_to_completion(&mut session).await;
        let stdout: Vec<u8> = frames
            .iter()
            .filter(|f| f.code == Code::ProcessStdout)
            .flat_map(|f| f.data.clone().unwrap_or_default())
            .collect();
        assert_eq!(stdout, b"buffered line\n");
        assert_eq!(frames.last().unwrap().code, Code::ProcessExitcode);
    }

    #[tokio::test]
    async fn execute_is_rejected_while_a_process_runs() {
        let mut session = session();
        session.handle(block(Code::ProcessExecute, "cat"));

        let frames = session.handle(block(Code::ProcessExecute, "echo nope"));
        assert_eq!(
            frames,
            vec![block(Code::ProcessStderr, "A process is already running!")]
        );

        session.handle(Frame::bare(Code::ProcessKill));
        poll_to_completion(&mut session).await;
    }

    #[tokio::test]
    async fn kill_reports_signal_and_no_exit_code() {
        let mut session = session();
        session.handle(block(Code::ProcessExecute, "cat"));
        session.handle(Frame::bare(Code::ProcessKill));

        let frames = poll_to_completion(&mut session).await;
        let last = frames.last().unwrap();
        assert_eq!(last.code, Code::ProcessSignal);
        assert_eq!(payload_string(last), (Signal::SIGKILL as i32).to_string());
        assert!(frames.iter().all(|f| f.code != Code::ProcessExitcode));
    }

    #[tokio::test]
    async fn interrupt_reports_signal_and_no_exit_code() {
        let mut session = session();
        session.handle(block(Code::ProcessExecute, "cat"));
        session.handle(Frame::bare(Code::ProcessInterupt));

        let frames = poll_to_completion(&mut session).await;
        let last = frames.last().unwrap();
        assert_eq!(last.code, Code::ProcessSignal);
        assert_eq!(payload_string(last), (Signal::SIGINT as i32).to_string());
        assert!(frames.iter().all(|f| f.code != Code::ProcessExitcode));
    }

    #[tokio::test]
    async fn numbered_signal_is_delivered() {
        let mut session = session();
        session.handle(block(Code::ProcessExecute, "cat"));
        session.handle(block(Code::ProcessSignal, "15"));

        let frames = poll_to_completion(&mut session).await;
        let last = frames.last().unwrap();
        assert_eq!(last.code, Code::ProcessSignal);
        assert_eq!(payload_string(last), "15");
    }

    #[tokio::test]
    async fn signals_without_a_foreground_process_are_ignored() {
        let mut session = session();
        assert!(session.handle(Frame::bare(Code::ProcessKill)).is_empty());
        assert!(session.handle(Frame::bare(Code::ProcessInterupt)).is_empty());
        assert!(session.handle(block(Code::ProcessSignal, "9")).is_empty());
        assert!(session.handle(Frame::bare(Code::AbortOutput)).is_empty());
    }

    #[tokio::test]
    async fn abort_output_backgrounds_the_process_silently() {
        let mut session = session();
        let exec = session.handle(block(Code::ProcessExecute, "sleep 0.2"));
        let pid = payload_string(&exec[0]);

        let frames = session.handle(Frame::bare(Code::AbortOutput));
        assert_eq!(frames, vec![block(Code::AbortOutput, &pid)]);
        assert!(session.has_live_processes());

        // The backgrounded process exits with no report at all.
        for _ in 0..500 {
            assert!(session.poll().await.is_empty());
            if !session.has_live_processes() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background process never pruned");
    }

    #[tokio::test]
    async fn poll_reports_exit_while_a_grandchild_holds_the_pipe() {
        let mut session = session();
        // The shell exits immediately but its backgrounded child inherits
        // the stdout pipe and keeps it busy, so the post-exit drain must
        // cut off on its deadline instead of chasing chunks forever.
        session.handle(block(
            Code::ProcessExecute,
            "(while true; do echo x; sleep 0.05; done) &",
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let frames =
            tokio::time::timeout(Duration::from_secs(3), poll_to_completion(&mut session))
                .await
                .expect("poll never reported termination");
        let last = frames.last().unwrap();
        assert_eq!(last.code, Code::ProcessExitcode);
        assert_eq!(payload_string(last), "0");
    }

    #[tokio::test]
    async fn spawn_failure_reports_stderr_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let mut session = session();
        session.handle(block(Code::SetCwd, path.to_str().unwrap()));
        drop(dir); // cwd vanishes before the spawn

        let frames = session.handle(block(Code::ProcessExecute, "echo hi"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].code, Code::ProcessStderr);
        assert!(payload_string(&frames[0]).contains("Failed to start process"));
        assert!(!session.has_live_processes());
    }

    #[tokio::test]
    async fn timeout_kills_a_runaway_process() {
        let mut config = test_config();
        config.timeout = Some(Duration::from_millis(100));
        let mut session = Session::new(&config);

        session.handle(block(Code::ProcessExecute, "sleep 30"));
        let frames = poll_to_completion(&mut session).await;
        let last = frames.last().unwrap();
        assert_eq!(last.code, Code::ProcessSignal);
        assert_eq!(payload_string(last), "9");
    }

    #[tokio::test]
    async fn php_prefix_is_substituted_with_the_configured_binary() {
        let mut config = test_config();
        config.binary = "/bin/echo".to_owned();
        let mut session = Session::new(&config);

        session.handle(block(Code::ProcessExecute, "php substituted"));
        let frames = poll_to_completion(&mut session).await;
        let stdout: Vec<u8> = frames
            .iter()
            .filter(|f| f.code == Code::ProcessStdout)
            .flat_map(|f| f.data.clone().unwrap_or_default())
            .collect();
        assert_eq!(stdout, b"substituted\n");
    }

    #[test]
    fn unquote_leaves_unmatched_quotes_verbatim() {
        assert_eq!(unquote("plain"), "plain");
        assert_eq!(unquote("\"open"), "\"open");
        assert_eq!(unquote("\"dangling\\\""), "\"dangling\\\"");
        assert_eq!(unquote("\"\""), "");
        assert_eq!(unquote("\"kept \\n escape\""), "kept \\n escape");
    }
}
