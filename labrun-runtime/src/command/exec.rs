use super::builder::{Command, LineAction, Timeout};
use crate::errors::CommandError;
use crate::time::{pausable_sleep, stopwatch};
use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::Notify,
    task::JoinHandle,
};
use tracing::{debug, instrument, warn};

/// The base environment layer described in spec §4.A: "extra env (layered
/// over system env, then base env, then extras)". Guarded by a lock per
/// spec §5 ("Base environment map in the command executor: guarded by a
/// lock; snapshots returned to callers.").
#[derive(Debug, Default)]
pub struct CommandExecutor {
    base_env: Mutex<HashMap<String, String>>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_base_env(&self, key: impl Into<String>, value: impl Into<String>) {
        self.base_env
            .lock()
            .expect("base_env lock poisoned")
            .insert(key.into(), value.into());
    }

    pub fn base_env_snapshot(&self) -> HashMap<String, String> {
        self.base_env.lock().expect("base_env lock poisoned").clone()
    }

    /// Spawns `command`, returning a handle immediately. The command runs
    /// to completion on a background task; call [`CommandHandle::wait`] to
    /// observe the result.
    #[instrument(level = "debug", skip(self, command), fields(program = %command.program))]
    pub fn spawn(&self, command: Command) -> Result<CommandHandle, CommandError> {
        let base_env = self.base_env_snapshot();
        let kill = KillSwitch::new();
        let kill_for_task = kill.clone();

        let task: JoinHandle<Result<CommandResult, CommandError>> =
            tokio::spawn(async move { run_command(command, base_env, kill_for_task).await });

        Ok(CommandHandle {
            task: Some(task),
            kill,
        })
    }
}

/// A cooperative kill signal. Cloning shares the same underlying switch, so
/// the spawning side and the executing task observe the same state.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    notify: Arc<Notify>,
    killed: Arc<AtomicBool>,
}

impl KillSwitch {
    fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    async fn killed_signal(&self) {
        if self.is_killed() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Outcome of a successfully-waited-on command. Only produced when the exit
/// code is in the success set and no timeout fired; any other outcome is a
/// [`CommandError`].
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Whether the success-start predicate was ever satisfied.
    pub start_confirmed: bool,
}

/// A handle to a running (or completed) command.
pub struct CommandHandle {
    task: Option<JoinHandle<Result<CommandResult, CommandError>>>,
    kill: KillSwitch,
}

impl CommandHandle {
    /// Requests termination. Idempotent; safe to call more than once or
    /// after the command has already exited.
    pub fn kill(&self) {
        self.kill.kill();
    }

    /// Waits for the process to exit and both output streams to drain, per
    /// spec §4.A's `await()` contract. If this future is dropped before
    /// completing (the caller was itself interrupted), [`Drop`] below kills
    /// the child before the interrupt propagates further, per spec §7.
    pub async fn wait(mut self) -> Result<CommandResult, CommandError> {
        let task = self.task.take().expect("wait() called more than once");
        match task.await {
            Ok(result) => result,
            Err(join_error) => {
                if join_error.is_panic() {
                    std::panic::resume_unwind(join_error.into_panic());
                }
                Err(CommandError::Interrupted)
            }
        }
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        // If wait() never completed (including because the awaiting future
        // was itself cancelled), make sure the child is killed rather than
        // left running. Killing an already-exited process is a no-op.
        self.kill.kill();
    }
}

async fn run_command(
    command: Command,
    base_env: HashMap<String, String>,
    kill: KillSwitch,
) -> Result<CommandResult, CommandError> {
    let mut cmd = tokio::process::Command::new(&command.program);
    cmd.args(&command.args);
    if let Some(workdir) = &command.workdir {
        cmd.current_dir(workdir);
    }
    // Layering: system env (inherited by default), then base env, then
    // per-command extras.
    for (key, value) in &base_env {
        cmd.env(key, value);
    }
    for (key, value) in &command.extra_env {
        cmd.env(key, value);
    }

    cmd.stdin(if command.stdin_input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(if command.capture_stdout {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stderr(if command.redirect_stderr_to_stdout || !command.capture_stderr {
        Stdio::null()
    } else {
        Stdio::piped()
    });

    let mut child = cmd
        .spawn()
        .map_err(|error| CommandError::Spawn {
            program: command.program.clone(),
            error: Arc::new(error),
        })?;

    if let Some(input) = &command.stdin_input {
        if let Some(mut stdin) = child.stdin.take() {
            let input = input.clone();
            // Best-effort: a broken pipe here just means the child exited
            // early, which will be observed via the exit code below.
            let _ = stdin.write_all(&input).await;
            drop(stdin);
        }
    }

    let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

    let watch = stopwatch();
    let deadline_now = Instant::now();
    let mut timeout_sleep = command
        .timeout
        .map(|t| Box::pin(pausable_sleep(t.remaining_from(deadline_now))));
    let mut start_timeout_sleep = command
        .start_timeout
        .map(|d| Box::pin(pausable_sleep(d)));

    let mut start_confirmed = command.start_timeout.is_none();
    let mut stdout_done = stdout.is_none();
    let mut stderr_done = stderr.is_none();
    let mut stdout_lines = stdout;
    let mut stderr_lines = stderr;
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stop_requested = false;

    let exit_status = loop {
        tokio::select! {
            line = next_line(&mut stdout_lines), if !stdout_done => {
                match line {
                    Some(Ok(line)) => {
                        if !stdout_buf.is_empty() {
                            stdout_buf.push(b'\n');
                        }
                        stdout_buf.extend_from_slice(line.as_bytes());
                        if !start_confirmed && (command.success_start_predicate.0)(&line) {
                            start_confirmed = true;
                            start_timeout_sleep = None;
                        }
                        if let Some(cb) = &command.on_stdout_line {
                            match cb(&line) {
                                LineAction::Continue => {}
                                LineAction::Stop => stop_requested = true,
                                LineAction::KillCommand => kill.kill(),
                                LineAction::StopReadingOutput => stdout_done = true,
                            }
                        }
                    }
                    Some(Err(error)) => {
                        warn!(%error, "error reading stdout");
                        stdout_done = true;
                    }
                    None => stdout_done = true,
                }
            }
            line = next_line(&mut stderr_lines), if !stderr_done => {
                match line {
                    Some(Ok(line)) => {
                        if !stderr_buf.is_empty() {
                            stderr_buf.push(b'\n');
                        }
                        stderr_buf.extend_from_slice(line.as_bytes());
                        if !start_confirmed && (command.success_start_predicate.0)(&line) {
                            start_confirmed = true;
                            start_timeout_sleep = None;
                        }
                        if let Some(cb) = &command.on_stderr_line {
                            match cb(&line) {
                                LineAction::Continue => {}
                                LineAction::Stop => stop_requested = true,
                                LineAction::KillCommand => kill.kill(),
                                LineAction::StopReadingOutput => stderr_done = true,
                            }
                        }
                    }
                    Some(Err(error)) => {
                        warn!(%error, "error reading stderr");
                        stderr_done = true;
                    }
                    None => stderr_done = true,
                }
            }
            result = child.wait() => {
                break Some(result);
            }
            () = maybe_sleep(&mut start_timeout_sleep) => {
                debug!("start-timeout expired before a successful-start line was observed");
                let _ = child.start_kill();
                let _ = child.wait().await;
                if let Some(cb) = &command.on_timeout { cb(); }
                return Err(CommandError::StartTimeout {
                    limit: command.start_timeout.unwrap_or_default(),
                });
            }
            () = maybe_sleep(&mut timeout_sleep) => {
                if let Some(cb) = &command.on_timeout { cb(); }
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(CommandError::Timeout {
                    elapsed: watch.snapshot().active,
                    limit: command.timeout.map(|t| t.remaining_from(deadline_now)).unwrap_or_default(),
                });
            }
            () = kill.killed_signal() => {
                let _ = child.start_kill();
                break Some(child.wait().await);
            }
            else => {
                // All branches disabled (both streams drained, no timers,
                // already killed): nothing left to do but wait.
                break Some(child.wait().await);
            }
        }

        if stop_requested {
            stop_requested = false;
            // Stop reading further output but let the process exit on its
            // own; nothing else to do here since stdin was already closed
            // up front (no streaming-stdin support in this component).
        }
    };

    // Drain any output produced between the last read and process exit.
    while !stdout_done {
        match next_line(&mut stdout_lines).await {
            Some(Ok(line)) => {
                if !stdout_buf.is_empty() {
                    stdout_buf.push(b'\n');
                }
                stdout_buf.extend_from_slice(line.as_bytes());
            }
            _ => stdout_done = true,
        }
    }
    while !stderr_done {
        match next_line(&mut stderr_lines).await {
            Some(Ok(line)) => {
                if !stderr_buf.is_empty() {
                    stderr_buf.push(b'\n');
                }
                stderr_buf.extend_from_slice(line.as_bytes());
            }
            _ => stderr_done = true,
        }
    }

    if let Some(cb) = &command.on_exit {
        cb();
    }

    let exit_status = match exit_status {
        Some(Ok(status)) => status,
        Some(Err(error)) => return Err(CommandError::Io(Arc::new(error))),
        None => return Err(CommandError::Interrupted),
    };

    let code = exit_status.code();
    if !command
        .success_exit_codes
        .contains(&code.unwrap_or(i32::MIN))
    {
        return Err(CommandError::NonZeroExit {
            code,
            success_set: command.success_exit_codes.iter().copied().collect(),
        });
    }

    Ok(CommandResult {
        exit_code: code,
        stdout: stdout_buf,
        stderr: stderr_buf,
        start_confirmed,
    })
}

type Lines<R> = tokio::io::Lines<BufReader<R>>;

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> Option<std::io::Result<String>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await.transpose(),
        None => None,
    }
}

/// Awaits a possibly-absent pausable sleep; if absent, never resolves (so
/// the enclosing `select!` branch is simply never chosen).
async fn maybe_sleep(sleep: &mut Option<std::pin::Pin<Box<crate::time::PausableSleep>>>) {
    match sleep.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn base_env_snapshot_is_independent_of_later_mutation() {
        let executor = CommandExecutor::new();
        executor.set_base_env("A", "1");
        let snapshot = executor.base_env_snapshot();
        executor.set_base_env("A", "2");
        assert_eq!(snapshot.get("A"), Some(&"1".to_string()));
        assert_eq!(executor.base_env_snapshot().get("A"), Some(&"2".to_string()));
    }

    #[test]
    fn kill_switch_is_idempotent() {
        let kill = KillSwitch::new();
        assert!(!kill.is_killed());
        kill.kill();
        kill.kill();
        assert!(kill.is_killed());
    }
}
