//! Test Retry Policy Engine (spec §4.I).
//!
//! A pure-ish decision component over the ledger the job manager already
//! owns: given a test that just ended, decide whether to finalize it or add
//! a new attempt. Grounded on the same "host supplies the bits out of our
//! scope as a closure" idiom `proxy_device::LeaseFn` uses: the real driver's
//! "is this error id INFRA type" / "is this the Android package-manager
//! no-valid-uid error" classifications are supplied by the host rather than
//! guessed at here.

use crate::errors::RetryEngineError;
use crate::job_manager::{JobManager, TestExecutionUnit};
use crate::proxy_device::{DeviceRequirement, ProxyDeviceManager};
use crate::test_runner::FailureCause;
use labrun_metadata::{property_keys, JobId, RetryReason, TestId, TestResult};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

/// Whitelisted properties a retry attempt inherits verbatim from the
/// attempt it replaces (spec §4.I step 6).
const INHERITED_PROPERTY_KEYS: &[&str] =
    &[property_keys::DRAIN_TIMEOUT_RETRY_ATTEMPTS, property_keys::REPEAT_INDEX];

pub const MIN_JOB_REMAINING_TIME_FOR_INFRA_ERROR_EXTRA_RETRY: Duration = Duration::from_secs(5 * 60);
pub const MAX_TEST_DURATION_FOR_INFRA_ERROR_EXTRA_RETRY: Duration = Duration::from_secs(2 * 60 * 60);
pub const MAX_RETRY_ATTEMPTS_FOR_DRAIN_TIMEOUT: u32 = 5;

/// `retryLevel` from spec §4.I's retry config.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryLevel {
    All,
    Error,
    Fail,
}

impl RetryLevel {
    /// Whether `result` is excluded from retry consideration at this level
    /// (spec §4.I step 5: "ERROR-level excludes PASS/FAIL/SKIP; FAIL-level
    /// excludes PASS/SKIP").
    fn excludes(self, result: TestResult) -> bool {
        match self {
            RetryLevel::All => false,
            RetryLevel::Error => !matches!(result, TestResult::Error),
            RetryLevel::Fail => matches!(result, TestResult::Pass | TestResult::Skip),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub retry_level: RetryLevel,
    pub test_attempts: u32,
    /// Explicit repeat-run count, or `None` to fall back to
    /// `retry_level == All` treating `test_attempts` as the repeat count.
    pub repeat_runs: Option<u32>,
    pub container_mode: bool,
}

impl RetryConfig {
    fn effective_repeat_runs(&self) -> u32 {
        self.repeat_runs
            .unwrap_or(if self.retry_level == RetryLevel::All { self.test_attempts } else { 1 })
    }
}

/// Tracks a job's deadline for the "job remaining time" checks in steps 5
/// and 6.
#[derive(Clone, Copy, Debug)]
pub struct JobTimer {
    deadline: Instant,
}

impl JobTimer {
    pub fn starting_now(budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Host-supplied classifiers for driver-specific error taxonomy that is out
/// of scope here (spec §4.I step 5's "critical error id is INFRA type" and
/// step 6's "ANDROID_PKG_MNGR no-valid-uid error id").
pub struct RetryClassifiers {
    pub is_infra_issue_in_cause_chain: Box<dyn Fn(&TestExecutionUnit) -> bool + Send + Sync>,
    pub is_no_valid_uid_error: Box<dyn Fn(&TestExecutionUnit) -> bool + Send + Sync>,
}

pub enum RetryDecision {
    Finalized,
    RetryAdded { new_test_id: TestId, reason: RetryReason },
}

/// One instance coordinates retry decisions across every job it's told
/// about; per-job config and timers are stored internally so callers don't
/// have to thread them through every call.
pub struct RetryEngine {
    jobs: std::sync::Arc<JobManager>,
    devices: std::sync::Arc<ProxyDeviceManager>,
    classifiers: RetryClassifiers,
    configs: Mutex<HashMap<JobId, RetryConfig>>,
    timers: Mutex<HashMap<JobId, JobTimer>>,
}

impl RetryEngine {
    pub fn new(
        jobs: std::sync::Arc<JobManager>,
        devices: std::sync::Arc<ProxyDeviceManager>,
        classifiers: RetryClassifiers,
    ) -> Self {
        Self {
            jobs,
            devices,
            classifiers,
            configs: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a job's retry config and starts its timer. Must be called
    /// before any `on_test_ended` call for that job.
    pub fn register_job(&self, job_id: JobId, config: RetryConfig, job_budget: Duration) {
        self.timers
            .lock()
            .expect("timer map lock poisoned")
            .insert(job_id, JobTimer::starting_now(job_budget));
        self.configs.lock().expect("config map lock poisoned").insert(job_id, config);
    }

    /// Pre-pass at job start (spec §4.I): if `repeatRuns > 1`, creates N-1
    /// extra attempts per base test, each tagged with `REPEAT_INDEX` from
    /// 1..N. Returns the freshly created units (the caller is responsible
    /// for attaching runners and requesting their initial allocation).
    pub fn expand_repeat_runs(
        &self,
        job_id: JobId,
        base_test: &TestExecutionUnit,
    ) -> Result<Vec<TestExecutionUnit>, RetryEngineError> {
        let repeat_runs = {
            let configs = self.configs.lock().expect("config map lock poisoned");
            configs
                .get(&job_id)
                .map(RetryConfig::effective_repeat_runs)
                .unwrap_or(1)
        };
        let mut created = Vec::new();
        for index in 1..repeat_runs {
            let mut unit = TestExecutionUnit::new(job_id, base_test.name.clone());
            unit.properties.set(property_keys::REPEAT_INDEX, index.to_string());
            self.jobs
                .add_test_execution_unit(job_id, unit.clone())
                .map_err(|_| RetryEngineError::ForegoingTestNotFound(base_test.id))?;
            created.push(unit);
        }
        Ok(created)
    }

    /// The full decision procedure for one ended test (spec §4.I steps 1-7).
    #[instrument(level = "debug", skip(self), fields(job = %job_id, test = %test_id))]
    pub async fn on_test_ended(
        &self,
        job_id: JobId,
        test_id: TestId,
    ) -> Result<RetryDecision, RetryEngineError> {
        let config = self
            .configs
            .lock()
            .expect("config map lock poisoned")
            .get(&job_id)
            .cloned()
            .unwrap_or(RetryConfig {
                retry_level: RetryLevel::Fail,
                test_attempts: 1,
                repeat_runs: None,
                container_mode: false,
            });

        // Step 1: ALL-level jobs already enumerated every attempt up front.
        if config.retry_level == RetryLevel::All {
            self.finalize(job_id, test_id, None)?;
            return Ok(RetryDecision::Finalized);
        }

        let current = self
            .jobs
            .test_execution_unit(job_id, test_id)
            .map_err(|_| RetryEngineError::ForegoingTestNotFound(test_id))?;

        // Step 2: PASS-after-retry tagging. Walks the whole FOREGOING_TEST_ID
        // chain from `current` backward, tagging every non-PASS attempt
        // reachable through it, not just the immediate foregoing one (spec
        // invariant 6).
        if let Some(foregoing_id) = current
            .properties
            .get(property_keys::FOREGOING_TEST_ID)
            .and_then(|s| s.parse::<TestId>().ok())
        {
            if let Ok(foregoing) = self.jobs.test_execution_unit(job_id, foregoing_id) {
                if !foregoing.result.is_pass() && current.result.is_pass() {
                    let mut cursor = Some(foregoing_id);
                    while let Some(id) = cursor {
                        let Ok(unit) = self.jobs.test_execution_unit(job_id, id) else {
                            break;
                        };
                        if unit.result.is_pass() {
                            break;
                        }
                        self.jobs
                            .update_test_execution_unit(job_id, id, |unit| {
                                unit.properties.set_bool(property_keys::NONPASSING_BEFORE_RETRY_PASS, true);
                                unit.properties
                                    .set_bool(property_keys::VOLATILE_TEST_INFO_AFTER_TEST_ENDS, true);
                            })
                            .ok();
                        cursor = unit
                            .properties
                            .get(property_keys::FOREGOING_TEST_ID)
                            .and_then(|s| s.parse::<TestId>().ok());
                    }
                    self.finalize(job_id, test_id, Some(property_keys::PASS_AFTER_RETRY))?;
                    return Ok(RetryDecision::Finalized);
                }
            }
        }

        // Step 3: allocation error/fail never retries.
        if current.result_cause == Some(FailureCause::AllocationError) {
            self.finalize(job_id, test_id, None)?;
            return Ok(RetryDecision::Finalized);
        }

        // Step 4: count valid attempts of the same (name, REPEAT_INDEX) family.
        let repeat_index = current.properties.get(property_keys::REPEAT_INDEX).map(str::to_owned);
        let siblings = self
            .jobs
            .tests_of_job(job_id)
            .map_err(|_| RetryEngineError::ForegoingTestNotFound(test_id))?;
        let valid_attempts = siblings
            .iter()
            .filter(|t| t.name == current.name)
            .filter(|t| t.properties.get(property_keys::REPEAT_INDEX).map(str::to_owned) == repeat_index)
            .filter(|t| !is_known_transient(t))
            .count() as u32;

        let timer = self
            .timers
            .lock()
            .expect("timer map lock poisoned")
            .get(&job_id)
            .copied()
            .unwrap_or(JobTimer::starting_now(Duration::ZERO));

        let mut reason = None;
        if !timer.expired() && valid_attempts <= config.test_attempts {
            if valid_attempts < config.test_attempts {
                reason = self.pick_ordinary_reason(&config, &current);
            } else {
                reason = self.pick_infra_extra_retry_reason(&timer, &current);
            }
        }

        match reason {
            Some(reason) => {
                let new_test_id = self.add_retry_attempt(job_id, &current, valid_attempts, reason).await?;
                Ok(RetryDecision::RetryAdded { new_test_id, reason })
            }
            None => {
                self.finalize(job_id, test_id, None)?;
                Ok(RetryDecision::Finalized)
            }
        }
    }

    /// Step 5's first three "ordinary reason" checks, in priority order.
    fn pick_ordinary_reason(&self, config: &RetryConfig, current: &TestExecutionUnit) -> Option<RetryReason> {
        if config.container_mode
            && !matches!(current.result, TestResult::Pass)
            && !(current.result == TestResult::Error && current.result_cause == Some(FailureCause::ClientError))
        {
            return Some(RetryReason::PotentialContainerIssue);
        }

        if current.properties.contains_key(property_keys::UTP_MODE) {
            let forced_hybrid = current.properties.get_bool(property_keys::HYBRID_UTP_FORCIBLY_DISABLE);
            if !matches!(current.result, TestResult::Pass | TestResult::Skip) && !forced_hybrid {
                return Some(RetryReason::PotentialUtpIssue);
            }
        }

        if current.result_cause == Some(FailureCause::DrainTimeout) {
            let attempts: u32 = current
                .properties
                .get(property_keys::DRAIN_TIMEOUT_RETRY_ATTEMPTS)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            if attempts < MAX_RETRY_ATTEMPTS_FOR_DRAIN_TIMEOUT {
                return Some(RetryReason::DrainTimeoutError);
            }
        }

        if !config.retry_level.excludes(current.result) {
            return Some(RetryReason::TestResult(current.result));
        }

        None
    }

    /// Step 5's "exactly at the limit" branch: propose one extra retry for
    /// an infra issue, subject to the time-budget cancellation rules.
    fn pick_infra_extra_retry_reason(&self, timer: &JobTimer, current: &TestExecutionUnit) -> Option<RetryReason> {
        let is_infra = current.result_cause == Some(FailureCause::InfraIssue)
            || (self.classifiers.is_infra_issue_in_cause_chain)(current);
        if !is_infra {
            return None;
        }

        if timer.remaining() < MIN_JOB_REMAINING_TIME_FOR_INFRA_ERROR_EXTRA_RETRY {
            return None;
        }
        let Some(duration) = current.duration else {
            return None;
        };
        if duration >= MAX_TEST_DURATION_FOR_INFRA_ERROR_EXTRA_RETRY {
            return None;
        }
        if duration > timer.remaining() {
            return None;
        }
        Some(RetryReason::InfraIssueExtraRetry)
    }

    /// Step 6: construct and ledger a new attempt, apply mode-inheritance
    /// rules, and request its initial allocation (failure is logged, not
    /// fatal; a master reopener will retry).
    async fn add_retry_attempt(
        &self,
        job_id: JobId,
        foregoing: &TestExecutionUnit,
        valid_attempts: u32,
        reason: RetryReason,
    ) -> Result<TestId, RetryEngineError> {
        let mut properties = foregoing.properties.inherit_subset(INHERITED_PROPERTY_KEYS);
        properties.set(property_keys::FOREGOING_TEST_ID, foregoing.id.to_string());
        properties.set(property_keys::FOREGOING_TEST_RESULT, format!("{:?}", foregoing.result));
        properties.set(property_keys::RETRY_INDEX, valid_attempts.to_string());
        properties.set_bool(property_keys::IS_FINAL_ATTEMPT, false);

        let sandbox_mode = foregoing.properties.get_bool(property_keys::SANDBOX_MODE);
        if sandbox_mode {
            properties.set_bool(property_keys::RETRY_AFTER_SANDBOX_FAILS, true);
        } else {
            properties.set_bool(property_keys::SANDBOX_MODE, false);
        }

        let container_mode = foregoing.properties.get_bool(property_keys::CONTAINER_MODE);
        if container_mode {
            properties.set_bool(property_keys::RETRY_AFTER_CONTAINER_FAILS, true);
        } else {
            properties.set_bool(property_keys::CONTAINER_MODE, false);
        }

        let hybrid_explicit = !foregoing.properties.get_bool(property_keys::HYBRID_UTP_FORCIBLY_DISABLE)
            && foregoing.properties.contains_key(property_keys::UTP_MODE);
        if !hybrid_explicit {
            properties.set_bool(property_keys::HYBRID_UTP_FORCIBLY_DISABLE, true);
        }

        if reason == RetryReason::DrainTimeoutError {
            let attempts: u32 = properties
                .get(property_keys::DRAIN_TIMEOUT_RETRY_ATTEMPTS)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            properties.set(property_keys::DRAIN_TIMEOUT_RETRY_ATTEMPTS, (attempts + 1).to_string());
        }

        if (self.classifiers.is_no_valid_uid_error)(foregoing) {
            properties.set_bool(property_keys::RETRY_AFTER_NO_VALID_UID_ASSIGNED, true);
        }

        let mut new_unit = TestExecutionUnit::new(job_id, foregoing.name.clone());
        new_unit.properties = properties;
        let new_test_id = new_unit.id;
        self.jobs
            .add_test_execution_unit(job_id, new_unit.clone())
            .map_err(|_| RetryEngineError::ForegoingTestNotFound(foregoing.id))?;

        if let Err(error) = self.devices.lease_devices_of_test(&new_unit.locator, &[]) {
            warn!(%error, test = %new_unit.locator, "extra allocation for retry attempt failed, a master reopener will retry");
        }

        Ok(new_test_id)
    }

    fn finalize(&self, job_id: JobId, test_id: TestId, extra_flag: Option<&str>) -> Result<(), RetryEngineError> {
        self.jobs
            .update_test_execution_unit(job_id, test_id, |unit| {
                unit.properties.set_bool(property_keys::IS_FINAL_ATTEMPT, true);
                if let Some(flag) = extra_flag {
                    unit.properties.set_bool(flag, true);
                }
            })
            .map_err(|_| RetryEngineError::ForegoingTestNotFound(test_id))
    }
}

/// Whether `unit`'s own outcome is one of the transient classes step 5
/// already gives an automatic extra retry for (container-mode non-pass,
/// UTP-mode non-pass, drain-timeout), and so shouldn't itself consume the
/// ordinary retry budget counted in step 4.
fn is_known_transient(unit: &TestExecutionUnit) -> bool {
    if matches!(unit.result_cause, Some(FailureCause::DrainTimeout)) {
        return true;
    }
    if unit.properties.get_bool(property_keys::CONTAINER_MODE) && !unit.result.is_pass() {
        return true;
    }
    if unit.properties.contains_key(property_keys::UTP_MODE)
        && !matches!(unit.result, TestResult::Pass | TestResult::Skip)
    {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_manager::JobDirs;
    use labrun_metadata::JobLocator;

    fn engine() -> (RetryEngine, std::sync::Arc<JobManager>, JobId) {
        let jobs = std::sync::Arc::new(JobManager::new());
        let devices = std::sync::Arc::new(ProxyDeviceManager::new(
            std::sync::Arc::new(|req: &DeviceRequirement| {
                Ok(crate::proxy_device::LeasedDevice {
                    sub_device_index: req.sub_device_index,
                    physical_id: "d".into(),
                })
            }),
            true,
        ));
        let job_id = JobId::new_v4();
        jobs.add_job_if_absent(
            JobLocator { id: job_id, name: "j".into() },
            JobDirs { run: "/tmp".into(), tmp: "/tmp".into(), gen: None },
            false,
        );
        devices
            .lease_devices_of_job(&JobLocator { id: job_id, name: "j".into() }, &[], &HashMap::new())
            .unwrap();
        let classifiers = RetryClassifiers {
            is_infra_issue_in_cause_chain: Box::new(|_| false),
            is_no_valid_uid_error: Box::new(|_| false),
        };
        let engine = RetryEngine::new(jobs.clone(), devices, classifiers);
        (engine, jobs, job_id)
    }

    #[tokio::test]
    async fn passing_first_attempt_finalizes_without_retry() {
        let (engine, jobs, job_id) = engine();
        let mut unit = TestExecutionUnit::new(job_id, "t");
        unit.result = TestResult::Pass;
        jobs.add_test_execution_unit(job_id, unit.clone()).unwrap();
        engine.register_job(
            job_id,
            RetryConfig {
                retry_level: RetryLevel::Fail,
                test_attempts: 3,
                repeat_runs: None,
                container_mode: false,
            },
            Duration::from_secs(3600),
        );

        let decision = engine.on_test_ended(job_id, unit.id).await.unwrap();
        assert!(matches!(decision, RetryDecision::Finalized));
        let stored = jobs.test_execution_unit(job_id, unit.id).unwrap();
        assert!(stored.properties.get_bool(property_keys::IS_FINAL_ATTEMPT));
    }

    #[tokio::test]
    async fn failing_attempt_under_limit_adds_retry() {
        let (engine, jobs, job_id) = engine();
        let mut unit = TestExecutionUnit::new(job_id, "t");
        unit.result = TestResult::Fail;
        jobs.add_test_execution_unit(job_id, unit.clone()).unwrap();
        engine.register_job(
            job_id,
            RetryConfig {
                retry_level: RetryLevel::Fail,
                test_attempts: 3,
                repeat_runs: None,
                container_mode: false,
            },
            Duration::from_secs(3600),
        );

        let decision = engine.on_test_ended(job_id, unit.id).await.unwrap();
        match decision {
            RetryDecision::RetryAdded { new_test_id, reason } => {
                assert_eq!(reason, RetryReason::TestResult(TestResult::Fail));
                let new_unit = jobs.test_execution_unit(job_id, new_test_id).unwrap();
                assert_eq!(
                    new_unit.properties.get(property_keys::FOREGOING_TEST_ID),
                    Some(unit.id.to_string()).as_deref()
                );
            }
            RetryDecision::Finalized => panic!("expected a retry to be added"),
        }
    }

    #[tokio::test]
    async fn retry_budget_exhausted_finalizes_without_infra_issue() {
        let (engine, jobs, job_id) = engine();
        let mut unit = TestExecutionUnit::new(job_id, "t");
        unit.result = TestResult::Fail;
        jobs.add_test_execution_unit(job_id, unit.clone()).unwrap();
        engine.register_job(
            job_id,
            RetryConfig {
                retry_level: RetryLevel::Fail,
                test_attempts: 1,
                repeat_runs: None,
                container_mode: false,
            },
            Duration::from_secs(3600),
        );

        let decision = engine.on_test_ended(job_id, unit.id).await.unwrap();
        assert!(matches!(decision, RetryDecision::Finalized));
        let stored = jobs.test_execution_unit(job_id, unit.id).unwrap();
        assert!(stored.properties.get_bool(property_keys::IS_FINAL_ATTEMPT));
    }

    #[tokio::test]
    async fn pass_after_retry_tags_foregoing_attempt() {
        let (engine, jobs, job_id) = engine();
        let mut foregoing = TestExecutionUnit::new(job_id, "t");
        foregoing.result = TestResult::Fail;
        jobs.add_test_execution_unit(job_id, foregoing.clone()).unwrap();

        let mut retry_unit = TestExecutionUnit::new(job_id, "t");
        retry_unit.result = TestResult::Pass;
        retry_unit
            .properties
            .set(property_keys::FOREGOING_TEST_ID, foregoing.id.to_string());
        jobs.add_test_execution_unit(job_id, retry_unit.clone()).unwrap();

        engine.register_job(
            job_id,
            RetryConfig {
                retry_level: RetryLevel::Fail,
                test_attempts: 3,
                repeat_runs: None,
                container_mode: false,
            },
            Duration::from_secs(3600),
        );

        let decision = engine.on_test_ended(job_id, retry_unit.id).await.unwrap();
        assert!(matches!(decision, RetryDecision::Finalized));

        let stored_retry = jobs.test_execution_unit(job_id, retry_unit.id).unwrap();
        assert!(stored_retry.properties.get_bool(property_keys::PASS_AFTER_RETRY));

        let stored_foregoing = jobs.test_execution_unit(job_id, foregoing.id).unwrap();
        assert!(stored_foregoing.properties.get_bool(property_keys::NONPASSING_BEFORE_RETRY_PASS));
        assert!(stored_foregoing
            .properties
            .get_bool(property_keys::VOLATILE_TEST_INFO_AFTER_TEST_ENDS));
    }

    #[tokio::test]
    async fn pass_after_retry_tags_every_foregoing_attempt_in_the_chain() {
        let (engine, jobs, job_id) = engine();
        let mut first = TestExecutionUnit::new(job_id, "t");
        first.result = TestResult::Fail;
        jobs.add_test_execution_unit(job_id, first.clone()).unwrap();

        let mut second = TestExecutionUnit::new(job_id, "t");
        second.result = TestResult::Fail;
        second.properties.set(property_keys::FOREGOING_TEST_ID, first.id.to_string());
        jobs.add_test_execution_unit(job_id, second.clone()).unwrap();

        let mut third = TestExecutionUnit::new(job_id, "t");
        third.result = TestResult::Pass;
        third.properties.set(property_keys::FOREGOING_TEST_ID, second.id.to_string());
        jobs.add_test_execution_unit(job_id, third.clone()).unwrap();

        engine.register_job(
            job_id,
            RetryConfig {
                retry_level: RetryLevel::Fail,
                test_attempts: 3,
                repeat_runs: None,
                container_mode: false,
            },
            Duration::from_secs(3600),
        );

        let decision = engine.on_test_ended(job_id, third.id).await.unwrap();
        assert!(matches!(decision, RetryDecision::Finalized));

        for ancestor in [&first, &second] {
            let stored = jobs.test_execution_unit(job_id, ancestor.id).unwrap();
            assert!(
                stored.properties.get_bool(property_keys::NONPASSING_BEFORE_RETRY_PASS),
                "attempt {:?} should be tagged",
                ancestor.id
            );
            assert!(stored.properties.get_bool(property_keys::VOLATILE_TEST_INFO_AFTER_TEST_ENDS));
        }
    }

    #[tokio::test]
    async fn container_mode_failure_does_not_consume_retry_budget() {
        let (engine, jobs, job_id) = engine();
        let mut unit = TestExecutionUnit::new(job_id, "t");
        unit.result = TestResult::Error;
        unit.properties.set_bool(property_keys::CONTAINER_MODE, true);
        jobs.add_test_execution_unit(job_id, unit.clone()).unwrap();
        engine.register_job(
            job_id,
            RetryConfig {
                retry_level: RetryLevel::Fail,
                test_attempts: 1,
                repeat_runs: None,
                container_mode: true,
            },
            Duration::from_secs(3600),
        );

        let decision = engine.on_test_ended(job_id, unit.id).await.unwrap();
        match decision {
            RetryDecision::RetryAdded { new_test_id, reason } => {
                assert_eq!(reason, RetryReason::PotentialContainerIssue);
                let new_unit = jobs.test_execution_unit(job_id, new_test_id).unwrap();
                // The container-mode attempt was excluded from the valid-attempt
                // count, so the retry is still index 0, not 1.
                assert_eq!(new_unit.properties.get(property_keys::RETRY_INDEX), Some("0"));
            }
            RetryDecision::Finalized => panic!("container-mode attempt should not exhaust the retry budget"),
        }
    }
}
