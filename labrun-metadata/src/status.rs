//! Small status/result enums from the data model in spec §3.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a `TestExecutionUnit`.
///
/// `NEW -> ASSIGNED -> RUNNING -> (DONE | SUSPENDED)`, enforced by the job
/// manager rather than by this enum itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TestStatus {
    New,
    Assigned,
    Running,
    Done,
    Suspended,
}

/// Terminal (or not-yet-terminal) result of a test attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TestResult {
    Unknown,
    Pass,
    Fail,
    Skip,
    Error,
}

impl TestResult {
    /// True for results the retry engine treats as "passing" for the
    /// purposes of §4.I step 2 and step 5's retry-level exclusions.
    pub fn is_pass(self) -> bool {
        matches!(self, TestResult::Pass)
    }

    pub fn is_terminal_non_pass(self) -> bool {
        matches!(self, TestResult::Fail | TestResult::Error | TestResult::Skip)
    }
}

/// Device status as reported by the Device Status Provider and published to
/// the master by the Master Syncer. See spec §3 and §4.D.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Idle,
    Busy,
    Init,
    Prepping,
    Dying,
    /// Draining: the device should receive no new work. Only ever produced
    /// by the drain-mode publish-time rewrite (never observed directly from
    /// the provider); see spec invariant 8.
    Lameduck,
}

impl DeviceStatus {
    /// Applies the one-way drain-mode rewrite described in spec §3/§4.D:
    /// "In draining mode, any IDLE observation is rewritten to LAMEDUCK at
    /// publish time only." Non-IDLE statuses are never rewritten
    /// (invariant 8).
    pub fn publish_with_drain(self, draining: bool) -> DeviceStatus {
        if draining && matches!(self, DeviceStatus::Idle) {
            DeviceStatus::Lameduck
        } else {
            self
        }
    }
}

/// Why a new test attempt was created. See spec §4.I step 5.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RetryReason {
    PotentialContainerIssue,
    PotentialUtpIssue,
    DrainTimeoutError,
    /// `TEST_<result>` in the spec: a plain retry-level-driven retry.
    TestResult(TestResult),
    InfraIssueExtraRetry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_rewrite_only_touches_idle() {
        assert_eq!(
            DeviceStatus::Idle.publish_with_drain(true),
            DeviceStatus::Lameduck
        );
        assert_eq!(
            DeviceStatus::Idle.publish_with_drain(false),
            DeviceStatus::Idle
        );
        for status in [
            DeviceStatus::Busy,
            DeviceStatus::Init,
            DeviceStatus::Prepping,
            DeviceStatus::Dying,
        ] {
            assert_eq!(status.publish_with_drain(true), status);
        }
    }
}
