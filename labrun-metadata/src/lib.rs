//! Structured ids, locators and small value types shared across the lab
//! orchestration runtime.
//!
//! This crate intentionally has no async runtime dependency: it holds the
//! vocabulary that `labrun-runtime` and any future client/master wire format
//! would agree on, analogous to how `nextest-metadata` sits below
//! `nextest-runner`.

mod ids;
mod properties;
mod status;

pub use ids::{DeviceKind, DeviceUuid, JobKind, JobId, RunKind, RunId, TestId, TestKind};
pub use properties::PropertyBag;
pub use status::{DeviceStatus, RetryReason, TestResult, TestStatus};

use std::fmt;

/// Identifies a job within the lab: stable across all tests and retries that
/// belong to it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct JobLocator {
    pub id: JobId,
    /// Opaque label supplied by the client, used only for logging.
    pub name: String,
}

impl fmt::Display for JobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Identifies a single test execution unit (one attempt) within a job.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TestLocator {
    pub job_id: JobId,
    pub test_id: TestId,
    pub name: String,
}

impl fmt::Display for TestLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}({})", self.job_id, self.name, self.test_id)
    }
}

/// Index of a sub-device within a multi-device test (0 is always the
/// primary).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize)]
pub struct SubDeviceIndex(pub u32);

impl SubDeviceIndex {
    pub const PRIMARY: SubDeviceIndex = SubDeviceIndex(0);

    pub fn is_primary(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SubDeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Well-known property keys used to carry retry metadata on a
/// [`PropertyBag`]. Mirrors the constant-string property keys the spec names
/// in §3 and §4.I.
pub mod property_keys {
    pub const FOREGOING_TEST_ID: &str = "FOREGOING_TEST_ID";
    pub const FOREGOING_TEST_RESULT: &str = "FOREGOING_TEST_RESULT";
    pub const RETRY_INDEX: &str = "RETRY_INDEX";
    pub const RETRY_REASON: &str = "RETRY_REASON";
    pub const IS_FINAL_ATTEMPT: &str = "IS_FINAL_ATTEMPT";
    pub const CONTAINER_MODE: &str = "CONTAINER_MODE";
    pub const SANDBOX_MODE: &str = "SANDBOX_MODE";
    pub const UTP_MODE: &str = "UTP_MODE";
    pub const HYBRID_UTP_FORCIBLY_DISABLE: &str = "HYBRID_UTP_FORCIBLY_DISABLE";
    pub const DRAIN_TIMEOUT_RETRY_ATTEMPTS: &str = "_DRAIN_TIMEOUT_RETRY_ATTEMPTS";
    pub const REPEAT_INDEX: &str = "REPEAT_INDEX";
    pub const NONPASSING_BEFORE_RETRY_PASS: &str = "NONPASSING_BEFORE_RETRY_PASS";
    pub const VOLATILE_TEST_INFO_AFTER_TEST_ENDS: &str = "VOLATILE_TEST_INFO_AFTER_TEST_ENDS";
    pub const PASS_AFTER_RETRY: &str = "PASS_AFTER_RETRY";
    pub const RETRY_AFTER_SANDBOX_FAILS: &str = "RETRY_AFTER_SANDBOX_FAILS";
    pub const RETRY_AFTER_CONTAINER_FAILS: &str = "RETRY_AFTER_CONTAINER_FAILS";
    pub const RETRY_AFTER_NO_VALID_UID_ASSIGNED: &str = "RETRY_AFTER_NO_VALID_UID_ASSIGNED";
}
