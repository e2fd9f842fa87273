//! Launching children and tracking their lifecycle.
//!
//! A launch is two steps:
//! - [`ProcessRunner::spawn`] starts the OS process and hands back a
//!   [`ProcessHandle`] that still owns the child's pipes.
//! - [`ProcessHandle::observe`] starts pumping whatever pipes are left to an
//!   observer and reports the exit once they are drained.
//!
//! [`ProcessRunner::launch`] does both at once. The split exists so a pipe
//! link can claim a child's stdout before anything reads from it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, trace, warn};

use super::exit::ExitResult;
use super::observer::ProcessObserver;
use super::spawn::{ProcessSpec, StreamKind, StreamMode};
use super::stdin::StdinWriter;
use crate::config::RunnerConfig;
use crate::error::{ProcessError, Result};

/// Runner-assigned identifier, unique per runner.
pub type HandleId = usize;

type ExitRx = watch::Receiver<Option<ExitResult>>;

/// Launches children and keeps the set the orchestrator waits on before
/// shutting down.
///
/// Cheap to clone; clones share the tracked set.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    config: RunnerConfig,
    next_id: AtomicUsize,
    tracked: Mutex<HashMap<HandleId, ExitRx>>,
}

impl Inner {
    fn tracked(&self) -> MutexGuard<'_, HashMap<HandleId, ExitRx>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                next_id: AtomicUsize::new(0),
                tracked: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    /// Start the OS process without attaching an observer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(&self, spec: &ProcessSpec) -> Result<ProcessHandle> {
        let mut cmd = spec.to_command(&self.inner.config)?;
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        let stdin = child.stdin.take().map(StdinWriter::new);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (detach_tx, detach_rx) = oneshot::channel();
        let reaped = Arc::new(AtomicBool::new(false));

        // Register before the watcher can possibly finish and deregister.
        let detached = spec.stream_mode == StreamMode::Detached;
        if !detached {
            self.inner.tracked().insert(id, exit_rx.clone());
        }

        tokio::spawn(watch_exit(
            child,
            id,
            exit_tx,
            detach_rx,
            Arc::clone(&reaped),
            Arc::clone(&self.inner),
        ));

        info!(
            id,
            pid = ?pid,
            program = %spec.display_name(),
            mode = ?spec.stream_mode,
            shell = spec.use_shell,
            "spawned process"
        );

        let mut handle = ProcessHandle {
            id,
            pid,
            program: spec.program.clone(),
            started_at: Utc::now(),
            chunk_size: self.inner.config.chunk_size.max(1),
            link_buffer: self.inner.config.link_buffer.max(1),
            stdin,
            stdout,
            stderr,
            exit: exit_rx,
            detach: Some(detach_tx),
            observed: false,
            reaped,
        };

        if detached {
            self.detach(&mut handle);
        }

        Ok(handle)
    }

    /// Spawn and observe in one step.
    ///
    /// A spawn failure is reported to `observer.on_error` and returned; the
    /// observer never sees an exit for it.
    pub fn launch<O: ProcessObserver>(
        &self,
        spec: &ProcessSpec,
        observer: O,
    ) -> Result<ProcessHandle> {
        let observer: Arc<dyn ProcessObserver> = Arc::new(observer);

        match self.spawn(spec) {
            Ok(mut handle) => {
                handle.observe_shared(observer)?;
                Ok(handle)
            }
            Err(err) => {
                warn!(program = %spec.program, error = %err, "launch failed");
                observer.on_error(&err);
                Err(err)
            }
        }
    }

    /// Stop tracking `handle`.
    ///
    /// The child keeps running; [`ProcessRunner::wait_all`] no longer waits
    /// for it and its exit is reported as unobserved.
    pub fn detach(&self, handle: &mut ProcessHandle) {
        self.inner.tracked().remove(&handle.id);
        if let Some(tx) = handle.detach.take() {
            let _ = tx.send(());
            debug!(id = handle.id, pid = ?handle.pid, "detached process");
        }
    }

    /// Number of handles still tracked.
    pub fn tracked(&self) -> usize {
        self.inner.tracked().len()
    }

    /// Wait for every tracked child to exit. Results are ordered by handle id.
    pub async fn wait_all(&self) -> Vec<(HandleId, ExitResult)> {
        let pending: Vec<(HandleId, ExitRx)> = self
            .inner
            .tracked()
            .iter()
            .map(|(id, rx)| (*id, rx.clone()))
            .collect();

        debug!(count = pending.len(), "waiting for tracked processes");

        let mut results = Vec::with_capacity(pending.len());
        for (id, mut rx) in pending {
            let result = wait_exit(&mut rx).await;
            self.inner.tracked().remove(&id);
            results.push((id, result));
        }

        results.sort_by_key(|(id, _)| *id);
        results
    }
}

/// A running (or finished) child.
///
/// Streams are present only in [`StreamMode::Piped`], and only until
/// something takes them.
#[derive(Debug)]
pub struct ProcessHandle {
    id: HandleId,
    pid: Option<u32>,
    program: String,
    started_at: DateTime<Utc>,
    chunk_size: usize,
    link_buffer: usize,
    stdin: Option<StdinWriter>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit: ExitRx,
    detach: Option<oneshot::Sender<()>>,
    observed: bool,
    reaped: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub const fn id(&self) -> HandleId {
        self.id
    }

    /// OS process id.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub const fn is_detached(&self) -> bool {
        self.detach.is_none()
    }

    pub(crate) const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) const fn link_buffer(&self) -> usize {
        self.link_buffer
    }

    /// Shared stdin writer, if stdin was piped.
    pub fn stdin_writer(&self) -> Option<StdinWriter> {
        self.stdin.clone()
    }

    /// Take the raw stdout pipe. Once taken, observers no longer see stdout.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take the raw stderr pipe. Once taken, observers no longer see stderr.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Whether an exit status has been observed.
    pub fn has_exited(&self) -> bool {
        self.exit
            .borrow()
            .as_ref()
            .is_some_and(ExitResult::is_observed)
    }

    /// The exit result, if one has been recorded yet.
    pub fn exit_result(&self) -> Option<ExitResult> {
        (*self.exit.borrow()).clone()
    }

    /// Write to the child's stdin.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let closed = ProcessError::StreamClosed {
            stream: StreamKind::Stdin,
        };
        if self.has_exited() {
            return Err(closed);
        }
        match self.stdin {
            Some(ref stdin) => stdin.write(bytes).await,
            None => Err(closed),
        }
    }

    /// Close stdin so the child sees EOF. No-op when stdin was not piped.
    pub async fn close_stdin(&self) {
        if let Some(ref stdin) = self.stdin {
            stdin.close().await;
        }
    }

    /// Resolve once the child has exited (or been detached).
    pub async fn wait(&self) -> ExitResult {
        wait_exit(&mut self.exit.clone()).await
    }

    /// Attach an observer. See [`ProcessHandle::observe_shared`].
    pub fn observe<O: ProcessObserver>(&mut self, observer: O) -> Result<()> {
        self.observe_shared(Arc::new(observer))
    }

    /// Start forwarding the remaining stdout/stderr chunks to `observer`, then
    /// deliver exactly one `on_exit` after both streams are drained and the
    /// child has terminated.
    pub fn observe_shared(&mut self, observer: Arc<dyn ProcessObserver>) -> Result<()> {
        if self.observed {
            return Err(ProcessError::AlreadyObserved);
        }
        self.observed = true;

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = self.stdout.take() {
            pumps.push(tokio::spawn(pump(
                stdout,
                StreamKind::Stdout,
                self.chunk_size,
                Arc::clone(&observer),
                self.id,
            )));
        }
        if let Some(stderr) = self.stderr.take() {
            pumps.push(tokio::spawn(pump(
                stderr,
                StreamKind::Stderr,
                self.chunk_size,
                Arc::clone(&observer),
                self.id,
            )));
        }

        let mut exit = self.exit.clone();
        tokio::spawn(async move {
            for p in pumps {
                let _ = p.await;
            }
            let result = wait_exit(&mut exit).await;
            observer.on_exit(&result);
        });

        Ok(())
    }

    /// Send `signal` to the child.
    ///
    /// Fails with `NotRunning` once the child has been reaped, detached or
    /// not, so a recycled pid is never signalled.
    #[cfg(unix)]
    pub fn terminate(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::unistd::Pid;

        let pid = self.pid.ok_or(ProcessError::NotRunning { pid: 0 })?;
        if self.has_exited() || self.reaped.load(Ordering::SeqCst) {
            return Err(ProcessError::NotRunning { pid });
        }
        let raw = i32::try_from(pid).map_err(|_| ProcessError::NotRunning { pid })?;

        debug!(id = self.id, pid, signal = %signal, "signalling process");
        nix::sys::signal::kill(Pid::from_raw(raw), signal)
            .map_err(|source| ProcessError::Signal { pid, source })
    }
}

async fn wait_exit(rx: &mut ExitRx) -> ExitResult {
    rx.wait_for(Option::is_some)
        .await
        .map(|r| (*r).clone().unwrap_or_default())
        .unwrap_or_default()
}

async fn watch_exit(
    mut child: Child,
    id: HandleId,
    exit_tx: watch::Sender<Option<ExitResult>>,
    detach_rx: oneshot::Receiver<()>,
    reaped: Arc<AtomicBool>,
    inner: Arc<Inner>,
) {
    let mut detached = false;
    let result = tokio::select! {
        biased;

        // A dropped sender disables this branch; only an explicit detach
        // stops the wait.
        Ok(()) = detach_rx => {
            detached = true;
            ExitResult::unobserved()
        }
        status = child.wait() => match status {
            Ok(status) => {
                let result = ExitResult::from(status);
                info!(
                    id,
                    code = ?result.code,
                    signal = ?result.signal,
                    "process exited"
                );
                result
            }
            Err(e) => {
                warn!(id, error = %e, "failed to wait for process");
                ExitResult::unobserved()
            }
        },
    };

    inner.tracked().remove(&id);
    exit_tx.send_replace(Some(result));

    // Detached children are still reaped here, so the handle knows when its
    // pid stops being ours.
    if detached {
        let status = child.wait().await;
        debug!(id, status = ?status, "detached process exited");
    }
    reaped.store(true, Ordering::SeqCst);
}

async fn pump<R>(
    mut reader: R,
    stream: StreamKind,
    chunk_size: usize,
    observer: Arc<dyn ProcessObserver>,
    id: HandleId,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => observer.on_data(stream, &buf[..n]),
            Err(e) => {
                warn!(id, %stream, error = %e, "stream read failed");
                observer.on_error(&ProcessError::Io(e));
                break;
            }
        }
    }
    trace!(id, %stream, "stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::process::{ChannelObserver, ProcessEvent};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    #[derive(Debug, Default)]
    struct Collected {
        stdout: Vec<Vec<u8>>,
        stderr: Vec<u8>,
        exits: Vec<ExitResult>,
        errors: Vec<ErrorKind>,
    }

    /// Drain until every observer clone is gone.
    async fn collect(mut rx: UnboundedReceiver<ProcessEvent>) -> Collected {
        let mut out = Collected::default();
        let drain = async {
            while let Some(event) = rx.recv().await {
                match event {
                    ProcessEvent::Data {
                        stream: StreamKind::Stdout,
                        bytes,
                    } => {
                        assert!(out.exits.is_empty(), "data after exit");
                        out.stdout.push(bytes);
                    }
                    ProcessEvent::Data { bytes, .. } => out.stderr.extend(bytes),
                    ProcessEvent::Exit(r) => out.exits.push(r),
                    ProcessEvent::Error { kind, .. } => out.errors.push(kind),
                }
            }
        };
        timeout(Duration::from_secs(10), drain)
            .await
            .expect("observer never finished");
        out
    }

    fn stdout_string(c: &Collected) -> String {
        String::from_utf8(c.stdout.concat()).unwrap()
    }

    #[tokio::test]
    async fn pwd_reports_directory_then_exit() {
        let dir = tempfile::tempdir().unwrap();
        let expected = std::fs::canonicalize(dir.path()).unwrap();

        let runner = ProcessRunner::default();
        let (observer, rx) = ChannelObserver::new();
        let _handle = runner
            .launch(&ProcessSpec::new("pwd").working_dir(dir.path()).piped(), observer)
            .unwrap();

        let got = collect(rx).await;
        assert_eq!(got.stdout.len(), 1);
        assert_eq!(stdout_string(&got), format!("{}\n", expected.display()));
        assert_eq!(
            got.exits,
            vec![ExitResult {
                code: Some(0),
                signal: None
            }]
        );
        assert!(got.errors.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_error_only() {
        let runner = ProcessRunner::default();
        let (observer, rx) = ChannelObserver::new();

        let err = runner
            .launch(&ProcessSpec::new("/no/such/binary").piped(), observer)
            .unwrap_err();
        assert!(err.is_spawn());

        let got = collect(rx).await;
        assert_eq!(got.errors, vec![ErrorKind::Spawn]);
        assert!(got.exits.is_empty());
        assert_eq!(runner.tracked(), 0);
    }

    #[tokio::test]
    async fn bad_working_dir_is_a_spawn_error() {
        let runner = ProcessRunner::default();
        let err = runner
            .spawn(&ProcessSpec::new("pwd").working_dir("/no/such/dir"))
            .unwrap_err();
        assert!(err.is_spawn());
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let runner = ProcessRunner::default();
        let (observer, rx) = ChannelObserver::new();
        runner
            .launch(&ProcessSpec::shell("exit 42").piped(), observer)
            .unwrap();

        let got = collect(rx).await;
        assert_eq!(got.exits.len(), 1);
        assert_eq!(got.exits[0].code, Some(42));
        assert_eq!(got.exits[0].signal, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_is_reported_once() {
        use nix::sys::signal::Signal;

        let runner = ProcessRunner::default();
        let (observer, rx) = ChannelObserver::new();
        let handle = runner
            .launch(&ProcessSpec::new("sleep").arg("30").piped(), observer)
            .unwrap();

        handle.terminate(Signal::SIGTERM).unwrap();

        let got = collect(rx).await;
        assert_eq!(
            got.exits,
            vec![ExitResult {
                code: None,
                signal: Some("SIGTERM".into())
            }]
        );
        assert!(handle.has_exited());
        assert!(matches!(
            handle.terminate(Signal::SIGTERM),
            Err(ProcessError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn stdin_round_trip_through_cat() {
        let runner = ProcessRunner::default();
        let (observer, rx) = ChannelObserver::new();
        let handle = runner
            .launch(&ProcessSpec::new("cat").piped(), observer)
            .unwrap();

        handle.write(b"hello ").await.unwrap();
        handle.write(b"world").await.unwrap();
        handle.close_stdin().await;

        let err = handle.write(b"late").await.unwrap_err();
        assert!(matches!(
            err,
            ProcessError::StreamClosed {
                stream: StreamKind::Stdin
            }
        ));

        let got = collect(rx).await;
        assert_eq!(stdout_string(&got), "hello world");
        assert!(got.exits[0].success());
    }

    #[tokio::test]
    async fn write_without_piped_stdin_fails() {
        let runner = ProcessRunner::default();
        let handle = runner.spawn(&ProcessSpec::new("true")).unwrap();

        let err = handle.write(b"x").await.unwrap_err();
        assert!(matches!(err, ProcessError::StreamClosed { .. }));
        assert!(handle.wait().await.success());
    }

    #[tokio::test]
    async fn stderr_and_env_reach_observer() {
        let runner = ProcessRunner::default();
        let (observer, rx) = ChannelObserver::new();
        runner
            .launch(
                &ProcessSpec::shell("echo \"$GREETING\"; echo oops >&2")
                    .env("GREETING", "abc123")
                    .piped(),
                observer,
            )
            .unwrap();

        let got = collect(rx).await;
        assert_eq!(stdout_string(&got), "abc123\n");
        assert_eq!(got.stderr, b"oops\n");
    }

    #[tokio::test]
    async fn shell_mode_runs_pipelines() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }

        let runner = ProcessRunner::default();
        let (observer, rx) = ChannelObserver::new();
        runner
            .launch(
                &ProcessSpec::shell("find . -type f | wc -l")
                    .working_dir(dir.path())
                    .piped(),
                observer,
            )
            .unwrap();

        let got = collect(rx).await;
        assert_eq!(stdout_string(&got).trim(), "3");
    }

    #[tokio::test]
    async fn observe_twice_is_rejected() {
        let runner = ProcessRunner::default();
        let mut handle = runner
            .spawn(&ProcessSpec::new("true").piped())
            .unwrap();

        handle.observe(crate::process::NullObserver).unwrap();
        assert!(matches!(
            handle.observe(crate::process::NullObserver),
            Err(ProcessError::AlreadyObserved)
        ));
    }

    #[tokio::test]
    async fn wait_all_waits_for_tracked_children() {
        let runner = ProcessRunner::default();
        let slow = runner.spawn(&ProcessSpec::new("sleep").arg("0.2")).unwrap();
        let fast = runner.spawn(&ProcessSpec::new("true")).unwrap();

        let results = timeout(Duration::from_secs(5), runner.wait_all())
            .await
            .unwrap();

        let ids: Vec<_> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![slow.id(), fast.id()]);
        assert!(results.iter().all(|(_, r)| r.success()));
        assert_eq!(runner.tracked(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detached_children_do_not_block_shutdown() {
        use nix::sys::signal::Signal;

        let runner = ProcessRunner::default();
        let handle = runner
            .spawn(&ProcessSpec::new("sleep").arg("30").detached())
            .unwrap();

        assert!(handle.is_detached());
        assert_eq!(runner.tracked(), 0);

        let results = timeout(Duration::from_secs(1), runner.wait_all())
            .await
            .expect("wait_all blocked on a detached child");
        assert!(results.is_empty());

        let result = timeout(Duration::from_secs(1), handle.wait()).await.unwrap();
        assert!(!result.is_observed());

        // Still running; clean up.
        handle.terminate(Signal::SIGKILL).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detached_child_is_not_signalled_after_exit() {
        use nix::sys::signal::Signal;

        let runner = ProcessRunner::default();
        let handle = runner
            .spawn(&ProcessSpec::new("true").detached())
            .unwrap();
        assert!(!handle.wait().await.is_observed());

        let mut refused = false;
        for _ in 0..100 {
            if matches!(
                handle.terminate(Signal::SIGTERM),
                Err(ProcessError::NotRunning { .. })
            ) {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refused, "terminate kept signalling a reaped pid");
        assert!(!handle.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detach_after_launch_stops_tracking() {
        use nix::sys::signal::Signal;

        let runner = ProcessRunner::default();
        let mut handle = runner
            .spawn(&ProcessSpec::new("sleep").arg("30"))
            .unwrap();
        assert_eq!(runner.tracked(), 1);

        runner.detach(&mut handle);
        assert_eq!(runner.tracked(), 0);
        assert_eq!(handle.wait().await, ExitResult::unobserved());

        handle.terminate(Signal::SIGKILL).unwrap();
    }
}
