//! Error taxonomy for the lab orchestration runtime.
//!
//! Following the teacher's convention in `nextest-runner::errors`, each
//! subsystem gets its own `#[derive(Error)]` enum rather than one giant
//! catch-all, with `#[from]`/`#[source]` wiring where one subsystem's error
//! can surface through another's.

use labrun_metadata::{JobLocator, TestLocator};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

/// Errors from the Command Executor (spec §4.A).
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start command `{program}`")]
    Spawn {
        program: String,
        #[source]
        error: Arc<std::io::Error>,
    },

    #[error("command exited with code {code:?}, not in the success set {success_set:?}")]
    NonZeroExit {
        code: Option<i32>,
        success_set: Vec<i32>,
    },

    /// The overall or start-timeout deadline expired. Per spec §7, this is
    /// terminal: `await`/`get` must keep returning this even if the process
    /// later exits zero.
    #[error("command timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { elapsed: Duration, limit: Duration },

    #[error("command did not produce a successful-start line within {limit:?}")]
    StartTimeout { limit: Duration },

    #[error("an I/O error occurred while reading command output")]
    Io(#[source] Arc<std::io::Error>),

    #[error("command was interrupted")]
    Interrupted,
}

/// Errors from the Proxy Device Manager (spec §4.E).
///
/// `Clone` so that a lease failure can be broadcast to every clone of the
/// `Shared` lease future it came from.
#[derive(Debug, Clone, Error)]
pub enum LeaseError {
    #[error("job {0} was already added")]
    JobAlreadyAdded(JobLocator),

    #[error("job {0} is not known to the proxy device manager")]
    JobNotFound(JobLocator),

    #[error("test {0} was already added")]
    TestAlreadyAdded(TestLocator),

    #[error("test {0} is not known to the proxy device manager")]
    TestNotFound(TestLocator),

    #[error("devices of job {0} have already been released")]
    JobAlreadyReleased(JobLocator),

    #[error("lease for test {0} was cancelled")]
    Cancelled(TestLocator),

    #[error("no requirement was specified for sub-device index {0}")]
    MissingRequirement(u32),
}

/// Errors from the Job / Test Manager (spec §4.F).
#[derive(Debug, Error)]
pub enum JobManagerError {
    #[error("job {0} not found")]
    JobNotFound(JobLocator),

    #[error("job {0} already exists")]
    JobAlreadyExists(JobLocator),

    #[error("test {0} already exists")]
    TestAlreadyExists(TestLocator),

    #[error("test {0} not found")]
    TestNotFound(TestLocator),

    /// `startResolveJobFiles` after the job has been closed (spec §4.F
    /// invariant).
    #[error("job {0} is closed, no new file resolves are accepted")]
    JobClosed(JobLocator),

    #[error("failed to remove directory {path}")]
    DirectoryRemoval {
        path: camino::Utf8PathBuf,
        #[source]
        error: Arc<std::io::Error>,
    },
}

/// Errors from the Test Retry Policy Engine (spec §4.I).
#[derive(Debug, Error)]
pub enum RetryEngineError {
    #[error("foregoing test {0} referenced by FOREGOING_TEST_ID was not found")]
    ForegoingTestNotFound(labrun_metadata::TestId),

    #[error("extra allocation request for retry of {0} failed")]
    ExtraAllocationFailed(TestLocator, #[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors from the Master Syncer (spec §4.D).
#[derive(Debug, Error)]
pub enum MasterSyncError {
    #[error("sign-up RPC failed")]
    SignUpFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("heartbeat RPC failed")]
    HeartbeatFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("sign-out RPC failed for device {0}")]
    SignOutFailed(
        labrun_metadata::DeviceUuid,
        #[source] Box<dyn std::error::Error + Send + Sync>,
    ),
}

/// Errors from the Local-Device Test Runner Launcher (spec §4.G/4.H).
#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("test runner for {0} was already started")]
    AlreadyStarted(TestLocator),

    #[error("device reservation failed for test {0}")]
    ReservationFailed(TestLocator, #[source] Box<LeaseError>),

    #[error("barrier was broken because a participant was interrupted")]
    BarrierBroken,

    #[error("device disconnected before test start: {disconnected:?}")]
    DeviceDisconnectedBeforeTestStart { disconnected: Vec<labrun_metadata::DeviceUuid> },
}
