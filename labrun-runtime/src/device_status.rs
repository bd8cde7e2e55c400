//! External collaborators consumed by the Master Syncer (spec §4.B/§4.C).
//!
//! These are interfaces only — concrete device detectors and the master RPC
//! wire format are out of scope. Core code only ever reads snapshots through
//! them; it never mutates a provider's internal device table.

use chrono::{DateTime, Local};
use futures::future::BoxFuture;
use labrun_metadata::DeviceUuid;

/// A device's status as observed by a provider at a point in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceStatusInfo {
    pub uuid: DeviceUuid,
    pub control_id: String,
    pub device_type: String,
    pub status: labrun_metadata::DeviceStatus,
}

/// Read-only access to locally-attached devices and their live status.
///
/// Grounded on the teacher's convention of modeling external capability
/// surfaces as plain traits (see `nextest-runner::reporter::events` consumer
/// traits) rather than reaching for dynamic dispatch frameworks.
pub trait DeviceStatusProvider: Send + Sync {
    /// All known devices, deduplicating any uuid the provider has been told
    /// is a duplicate via [`update_duplicated_uuid`](Self::update_duplicated_uuid).
    fn all_device_status_without_duplicated_uuid(
        &self,
        realtime_dispatch: bool,
    ) -> BoxFuture<'_, Vec<DeviceStatusInfo>>;

    fn device_and_status_info_by_control_id(
        &self,
        control_id: &str,
        device_type: &str,
    ) -> Option<DeviceStatusInfo>;

    fn device_and_status_info_by_uuid(&self, uuid: DeviceUuid) -> Option<DeviceStatusInfo>;

    /// Tells the provider that `uuid` has been observed as a duplicate so it
    /// can be excluded from future snapshots.
    fn update_duplicated_uuid(&self, uuid: DeviceUuid);
}

/// Response to `signUpLab`/`heartbeatLab`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignUpResult {
    pub duplicated_uuids: Vec<DeviceUuid>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatResult {
    pub sign_up_all: bool,
    pub outdated_uuids: Vec<DeviceUuid>,
}

/// The lab's RPC surface towards the remote master (spec §4.C, §6).
///
/// Calls may fail transiently; per spec §4.D, a failed call must never block
/// device-event handling, so every method here is fallible and callers are
/// expected to log-and-swallow rather than propagate.
pub trait MasterSyncClient: Send + Sync {
    fn sign_up_lab<'a>(
        &'a self,
        devices: &'a [DeviceStatusInfo],
    ) -> BoxFuture<'a, Result<SignUpResult, crate::errors::MasterSyncError>>;

    fn heartbeat_lab<'a>(
        &'a self,
        devices: &'a [(DeviceUuid, labrun_metadata::DeviceStatus, DateTime<Local>)],
    ) -> BoxFuture<'a, Result<HeartbeatResult, crate::errors::MasterSyncError>>;

    fn sign_out_device(
        &self,
        uuid: DeviceUuid,
    ) -> BoxFuture<'_, Result<(), crate::errors::MasterSyncError>>;
}
