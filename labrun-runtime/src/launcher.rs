//! Local-Device Test Runner Launcher (spec §4.H).
//!
//! Coordinates one primary and zero or more secondary device executors
//! through a rendezvous barrier, grounded on the same `tokio::select!`
//! actor-loop style used by [`crate::master_sync::MasterSyncer::run`], but
//! here the coordination primitive is `tokio::sync::Barrier` rather than a
//! channel: every device executor is a peer that must arrive before any of
//! them proceeds to `execute()`.

use crate::errors::LauncherError;
use crate::proxy_device::{ProxyDevices, ProxyDeviceManager};
use crate::test_runner::{FailureCause, Role, TestExecutionResult, TestRunner};
use futures::future::BoxFuture;
use labrun_metadata::{DeviceUuid, TestLocator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Barrier, Notify, OnceCell};
use tracing::instrument;

/// What the real test body does once every device executor has rendezvoused.
/// Supplied by the host; only the primary's implementation is ever invoked.
pub type ExecuteFn =
    Arc<dyn Fn(&TestLocator, &ProxyDevices) -> BoxFuture<'static, TestExecutionResult> + Send + Sync>;

/// Tracks whether each device executor is still alive and assigned to this
/// test, for the liveness probe (spec §4.H `isTestRunning`).
struct ExecutorLiveness {
    device: DeviceUuid,
    alive: AtomicBool,
}

impl ExecutorLiveness {
    fn new(device: DeviceUuid) -> Self {
        Self {
            device,
            alive: AtomicBool::new(true),
        }
    }

    fn mark_disconnected(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

enum Phase {
    /// Before `asyncLaunchTest` has reserved every device.
    NotStarted,
    /// Reserved; executors are rendezvousing at the barrier.
    Barrier,
    /// The primary is running `execute()`.
    Executing,
    /// `execute()` returned (or the launcher finalized without executing).
    Done,
}

/// One instance per test execution; shared by every device executor's task.
pub struct LocalDeviceTestRunnerLauncher {
    test: TestLocator,
    devices: Arc<ProxyDeviceManager>,
    executors: Vec<ExecutorLiveness>,
    barrier: Arc<Barrier>,
    kill: Arc<Notify>,
    result: Arc<OnceCell<TestExecutionResult>>,
    phase: std::sync::Mutex<Phase>,
    has_reserved: AtomicBool,
    /// Sticky flag checked before waiting on `kill`: `Notify::notify_waiters`
    /// wakes only tasks already registered, so a kill issued before a
    /// participant starts waiting would otherwise be missed.
    killed: AtomicBool,
    kill_count: std::sync::atomic::AtomicU32,
    execute_fn: ExecuteFn,
    /// Device ids that have disconnected, accumulated so a broken barrier
    /// can report the specific cause instead of a generic `BarrierBroken`.
    disconnected: Mutex<Vec<DeviceUuid>>,
    /// Guards the S3 `finalize_test(DeviceDisconnectedBeforeTestStart)`
    /// call: a disconnect that arrives while reserved-but-not-executing
    /// must finalize every registered runner exactly once, even if more
    /// than one participant disconnects.
    disconnect_finalized: AtomicBool,
    runners: Mutex<Vec<Arc<dyn TestRunner>>>,
}

impl LocalDeviceTestRunnerLauncher {
    /// `participant_devices` is the uuid of each device executor that will
    /// call [`Self::run_executor`]; its length sets the barrier size.
    pub fn new(
        test: TestLocator,
        devices: Arc<ProxyDeviceManager>,
        participant_devices: Vec<DeviceUuid>,
        execute_fn: ExecuteFn,
    ) -> Self {
        let executors = participant_devices
            .into_iter()
            .map(ExecutorLiveness::new)
            .collect::<Vec<_>>();
        let barrier_size = executors.len().max(1);
        Self {
            test,
            devices,
            executors,
            barrier: Arc::new(Barrier::new(barrier_size)),
            kill: Arc::new(Notify::new()),
            result: Arc::new(OnceCell::new()),
            phase: std::sync::Mutex::new(Phase::NotStarted),
            has_reserved: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            kill_count: std::sync::atomic::AtomicU32::new(0),
            execute_fn,
            disconnected: Mutex::new(Vec::new()),
            disconnect_finalized: AtomicBool::new(false),
            runners: Mutex::new(Vec::new()),
        }
    }

    /// Registers a runner to be finalized if this test's barrier breaks due
    /// to a device disconnecting before execution starts (spec §4.H
    /// scenario S3). A test with several participant device executors
    /// typically registers one runner per executor.
    pub fn register_runner(&self, runner: Arc<dyn TestRunner>) {
        self.runners.lock().expect("runners lock poisoned").push(runner);
    }

    /// Reserves devices for every participant in iteration order. On any
    /// failure, cancels every reservation already made via `killTest` and
    /// returns the error; `hasReserved` is set only once all succeed.
    #[instrument(level = "debug", skip(self), fields(test = %self.test))]
    pub async fn async_launch_test(&self) -> Result<ProxyDevices, LauncherError> {
        match self.devices.get_devices_of_test(&self.test).await {
            Ok(devices) => {
                self.has_reserved.store(true, Ordering::SeqCst);
                *self.phase.lock().expect("phase lock poisoned") = Phase::Barrier;
                Ok(devices)
            }
            Err(error) => {
                self.kill_test().await;
                Err(LauncherError::ReservationFailed(self.test.clone(), Box::new(error)))
            }
        }
    }

    /// Runs one device executor's side of the rendezvous. `role` selects
    /// whether this participant executes the test body (`Primary`) or only
    /// waits on the shared result (`Secondary`); `devices` is the full
    /// allocation, already reserved by [`Self::async_launch_test`].
    ///
    /// Per spec invariant 2 ("barrier all-or-none"): if any participant is
    /// interrupted before the barrier completes, `tokio::sync::Barrier`
    /// itself guarantees no participant observes a completed rendezvous, so
    /// no secondary can reach the success path.
    pub async fn run_executor(
        &self,
        role: Role,
        devices: &ProxyDevices,
    ) -> Result<TestExecutionResult, LauncherError> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(self.barrier_break_error());
        }
        tokio::select! {
            _ = self.barrier.wait() => {}
            _ = self.kill.notified() => {
                return Err(self.barrier_break_error());
            }
        }

        *self.phase.lock().expect("phase lock poisoned") = Phase::Executing;

        match role {
            Role::Primary => {
                let outcome = tokio::select! {
                    result = (self.execute_fn)(&self.test, devices) => result,
                    _ = self.kill.notified() => {
                        TestExecutionResult::errored(FailureCause::Interrupt, "killed during execute")
                    }
                };
                *self.phase.lock().expect("phase lock poisoned") = Phase::Done;
                let _ = self.result.set(outcome.clone());
                Ok(outcome)
            }
            Role::Secondary => {
                let outcome = self.result.get_or_init(|| async {
                    // The primary always reaches `set` before a secondary's
                    // `get_or_init` would resolve in the expected case; this
                    // branch only runs if a secondary observes the cell
                    // before the primary has published, in which case it
                    // waits on the same barrier-ordered execution future.
                    TestExecutionResult::errored(FailureCause::Interrupt, "result never published")
                }).await.clone();
                *self.phase.lock().expect("phase lock poisoned") = Phase::Done;
                Ok(outcome)
            }
        }
    }

    /// Records that `device` has lost liveness (disconnected) while still
    /// assigned to this test. Used by the liveness probe. If the disconnect
    /// lands while devices are reserved but execution hasn't started (spec
    /// §4.H scenario S3), finalizes every registered runner exactly once
    /// with [`FailureCause::DeviceDisconnectedBeforeTestStart`].
    pub fn mark_device_disconnected(&self, device: DeviceUuid) {
        for executor in &self.executors {
            if executor.device == device {
                executor.mark_disconnected();
            }
        }
        self.disconnected.lock().expect("disconnected lock poisoned").push(device);
        self.killed.store(true, Ordering::SeqCst);
        self.kill.notify_waiters();

        let reserved_not_executing = self.has_reserved.load(Ordering::SeqCst)
            && !matches!(
                &*self.phase.lock().expect("phase lock poisoned"),
                Phase::Executing | Phase::Done
            );
        if reserved_not_executing
            && self
                .disconnect_finalized
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let runners = self.runners.lock().expect("runners lock poisoned").clone();
            for runner in runners {
                runner.finalize_test(FailureCause::DeviceDisconnectedBeforeTestStart);
            }
        }
    }

    /// The specific cause for a broken barrier: distinguishes a disconnect
    /// (spec §4.H scenario S3) from a generic `killTest`.
    fn barrier_break_error(&self) -> LauncherError {
        let disconnected = self.disconnected.lock().expect("disconnected lock poisoned").clone();
        if disconnected.is_empty() {
            LauncherError::BarrierBroken
        } else {
            LauncherError::DeviceDisconnectedBeforeTestStart { disconnected }
        }
    }

    /// spec §4.H `isTestRunning`: true while the primary is inside
    /// `execute()`, or while every executor is still alive and waiting at
    /// the barrier. False once a disconnect or completion has been
    /// observed.
    pub fn is_test_running(&self) -> bool {
        match &*self.phase.lock().expect("phase lock poisoned") {
            Phase::Executing => true,
            Phase::Barrier => self.executors.iter().all(ExecutorLiveness::is_alive),
            Phase::NotStarted | Phase::Done => false,
        }
    }

    /// Cancellation: notifies every waiting executor and releases the
    /// reserved devices. Idempotent.
    #[instrument(level = "debug", skip(self), fields(test = %self.test))]
    pub async fn kill_test(&self) {
        self.kill_count.fetch_add(1, Ordering::SeqCst);
        self.killed.store(true, Ordering::SeqCst);
        self.kill.notify_waiters();
        if self.has_reserved.load(Ordering::SeqCst) {
            self.devices.release_devices_of_test(&self.test).await;
        }
    }

    pub fn kill_count(&self) -> u32 {
        self.kill_count.load(Ordering::SeqCst)
    }
}
