//! Test Runner abstraction (spec §4.G).
//!
//! Spec §9 calls out the original deep class hierarchy
//! (`TestRunner -> DirectTestRunner -> AbstractTestRunner`) and asks for it
//! to be flattened: "a `TestRunner` capability interface `{ start, kill,
//! isRunning, testExecutionUnit, allocation }` plus a strategy value for the
//! launcher (primary/secondary). No inheritance of state is required." This
//! module is exactly that: one trait, one enum.

use crate::errors::LauncherError;
use crate::proxy_device::ProxyDevices;
use futures::future::BoxFuture;
use labrun_metadata::{TestLocator, TestResult};
use std::time::Duration;

/// Which role a device executor plays in a multi-device test (spec §4.H).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Primary,
    Secondary,
}

/// The devices reserved for one test's execution.
#[derive(Clone, Debug)]
pub struct Allocation {
    pub devices: ProxyDevices,
}

/// Coarse failure-cause taxonomy from spec §7, attached to a
/// [`TestExecutionResult`] or [`crate::job_manager::TestExecutionUnit`] so
/// the retry engine (spec §4.I) can classify without re-deriving it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureCause {
    ClientError,
    CustomerIssue,
    InfraIssue,
    TransientIo,
    Timeout,
    Interrupt,
    /// The device allocator never attached a device to this attempt (spec
    /// §4.I step 3: "allocation error/fail").
    AllocationError,
    /// Sentinel for a drain-triggered forced cleanup (spec §4.I step 5,
    /// §7's drain-timeout class).
    DrainTimeout,
    /// A participant device disconnected after reservation but before the
    /// launcher's barrier released execution (spec §4.H scenario S3).
    DeviceDisconnectedBeforeTestStart,
}

/// What `execute()` produces: the result plus, for non-pass outcomes, the
/// cause the retry engine will classify.
#[derive(Clone, Debug)]
pub struct TestExecutionResult {
    pub result: TestResult,
    pub cause: Option<FailureCause>,
    pub message: Option<String>,
}

impl TestExecutionResult {
    pub fn pass() -> Self {
        Self {
            result: TestResult::Pass,
            cause: None,
            message: None,
        }
    }

    pub fn failed(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            result: TestResult::Fail,
            cause: Some(cause),
            message: Some(message.into()),
        }
    }

    pub fn errored(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            result: TestResult::Error,
            cause: Some(cause),
            message: Some(message.into()),
        }
    }
}

/// The flattened capability interface every test runner implements.
///
/// `start()` must be idempotent: a second call fails with
/// [`LauncherError::AlreadyStarted`] rather than re-running anything.
pub trait TestRunner: Send + Sync {
    fn test_execution_unit(&self) -> &TestLocator;

    fn allocation(&self) -> &Allocation;

    fn role(&self) -> Role;

    /// Idempotent start: records the start instant, runs `preExecute`
    /// (left to the implementer), then asks the launcher to reserve devices
    /// and run the test.
    fn start(&self) -> BoxFuture<'_, Result<TestExecutionResult, LauncherError>>;

    /// Forwards to the launcher's kill path; increments a kill counter.
    fn kill(&self, timeout: Duration);

    /// Liveness probe; see spec §4.H for the exact three-way decision this
    /// wraps when the runner is a [`crate::launcher::LocalDeviceTestRunnerLauncher`]
    /// participant.
    fn is_running(&self) -> bool;

    /// Best-effort hook called when the launcher guarantees `execute()`
    /// will never run for this unit (e.g. disconnect before start).
    fn finalize_test(&self, cause: FailureCause);

    /// Delivers one de-duplicated job-level file broadcast (spec §4.F
    /// `notifyJobFile`). Fire-and-forget; the job manager does not await a
    /// response.
    fn notify_job_file(&self, file: &crate::job_manager::JobFileUnit);

    /// Delivers one de-duplicated file addressed specifically to this test
    /// (spec §4.F `notifyTestFile`).
    fn notify_test_file(&self, file: &crate::job_manager::JobFileUnit);
}
