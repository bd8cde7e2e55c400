use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

/// What a line callback asks the executor to do next, per spec §4.A: "Line
/// callbacks may request `stop` (close stdin path, mark process stopped),
/// `killCommand` (kill), or `stopReadingOutput` (detach consumer)."
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineAction {
    /// Keep going as normal.
    Continue,
    /// Close stdin and mark the process as having been asked to stop
    /// gracefully.
    Stop,
    /// Kill the process immediately.
    KillCommand,
    /// Detach this output stream's consumer; further lines are discarded.
    StopReadingOutput,
}

pub type LineCallback = Arc<dyn Fn(&str) -> LineAction + Send + Sync>;
pub type ExitCallback = Arc<dyn Fn() + Send + Sync>;

/// The timeout shape described in spec §4.A: "optional timeout (fixed
/// duration OR deadline OR both; effective remaining = min)".
#[derive(Clone, Copy, Debug)]
pub enum Timeout {
    Fixed(Duration),
    Deadline(Instant),
    Both(Duration, Instant),
}

impl Timeout {
    /// The remaining duration from `now`, taking the minimum of the fixed
    /// duration and the time left until the deadline.
    pub(super) fn remaining_from(self, now: Instant) -> Duration {
        match self {
            Timeout::Fixed(d) => d,
            Timeout::Deadline(deadline) => deadline.saturating_duration_since(now),
            Timeout::Both(d, deadline) => d.min(deadline.saturating_duration_since(now)),
        }
    }
}

/// Decides whether a line of output indicates the process has "started
/// successfully". Defaults to "any output line" per spec §4.A.
#[derive(Clone)]
pub struct SuccessStartPredicate(pub(super) Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl Default for SuccessStartPredicate {
    fn default() -> Self {
        // Default: any output line counts as a successful start.
        SuccessStartPredicate(Arc::new(|_line: &str| true))
    }
}

impl fmt::Debug for SuccessStartPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SuccessStartPredicate(..)")
    }
}

/// An immutable declarative description of a process to run.
///
/// Mirrors the teacher's immutable `Command`-builder-then-spawn pattern in
/// `test_command::spawn`, generalized per spec §4.A to any executable rather
/// than just a compiled test binary.
#[derive(Clone)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<camino::Utf8PathBuf>,
    pub extra_env: HashMap<String, String>,
    pub timeout: Option<Timeout>,
    pub start_timeout: Option<Duration>,
    pub success_start_predicate: SuccessStartPredicate,
    pub success_exit_codes: HashSet<i32>,
    pub stdin_input: Option<Vec<u8>>,
    pub on_stdout_line: Option<LineCallback>,
    pub on_stderr_line: Option<LineCallback>,
    pub on_timeout: Option<ExitCallback>,
    pub on_exit: Option<ExitCallback>,
    pub redirect_stderr_to_stdout: bool,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
}

impl Command {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            workdir: None,
            extra_env: HashMap::new(),
            timeout: None,
            start_timeout: None,
            success_start_predicate: SuccessStartPredicate::default(),
            // Default success exit-code set: {0}.
            success_exit_codes: [0].into_iter().collect(),
            stdin_input: None,
            on_stdout_line: None,
            on_stderr_line: None,
            on_timeout: None,
            on_exit: None,
            redirect_stderr_to_stdout: false,
            capture_stdout: true,
            capture_stderr: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = Some(start_timeout);
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<camino::Utf8PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin_input = Some(input.into());
        self
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("workdir", &self.workdir)
            .field("timeout", &self.timeout.is_some())
            .finish_non_exhaustive()
    }
}
