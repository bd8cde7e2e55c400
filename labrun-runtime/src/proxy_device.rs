//! Proxy Device Manager (spec §4.E): asynchronous, cancellable lease/release
//! of devices per (job, test, sub-device index), scoped to a job.
//!
//! Grounded on the teacher's `Arc<Mutex<..>>`-per-unit ownership style
//! (`ChildAccumulator` in `runner/executor.rs`): one manager-wide map keyed
//! by job, one lock per `ProxiedDevice` guarding its lease future and
//! `released` flag, matching spec §5's "concurrent map; per-`ProxiedDevice`
//! lock".

use crate::errors::LeaseError;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use labrun_metadata::{JobLocator, SubDeviceIndex, TestLocator};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::instrument;

/// Bound on how long `releaseDevice` waits for an in-flight lease to honor
/// cancellation before proceeding with physical release regardless (spec
/// §4.E step 2, invariant 9).
pub const CANCEL_LEASING_TIMEOUT: Duration = Duration::from_secs(10);

/// A device handed back by a successful lease. Placeholder payload: the
/// concrete device handle type is owned by the pluggable device layer, out
/// of scope here (spec §1).
#[derive(Clone, Debug)]
pub struct LeasedDevice {
    pub sub_device_index: SubDeviceIndex,
    pub physical_id: String,
}

pub type ProxyDevices = Vec<LeasedDevice>;

/// What a caller asks for at a given sub-device index. Opaque requirement
/// payload; matching is a concern of the pluggable device layer.
#[derive(Clone, Debug)]
pub struct DeviceRequirement {
    pub sub_device_index: SubDeviceIndex,
    pub requirement: String,
}

/// A function that actually performs a blocking device lease. Supplied by
/// the host; analogous to the teacher's `RunnerAction` thunks handed to a
/// worker pool.
pub type LeaseFn = Arc<dyn Fn(&DeviceRequirement) -> Result<LeasedDevice, LeaseError> + Send + Sync>;

type LeaseFuture = Shared<BoxFuture<'static, Result<LeasedDevice, LeaseError>>>;

/// One sub-device's lease state. See spec §3 `ProxiedDevice`.
struct ProxiedDevice {
    requirement: DeviceRequirement,
    lease: Mutex<ProxiedDeviceState>,
    cancel: Arc<Notify>,
}

enum ProxiedDeviceState {
    Leasing(LeaseFuture),
    Released,
}

impl ProxiedDevice {
    fn spawn(requirement: DeviceRequirement, lease_fn: LeaseFn) -> Self {
        let cancel = Arc::new(Notify::new());
        let cancel_for_task = cancel.clone();
        let req = requirement.clone();
        let future: BoxFuture<'static, Result<LeasedDevice, LeaseError>> = Box::pin(async move {
            tokio::select! {
                result = tokio::task::spawn_blocking(move || lease_fn(&req)) => {
                    result.map_err(|_| LeaseError::Cancelled(placeholder_locator()))?
                }
                _ = cancel_for_task.notified() => {
                    Err(LeaseError::Cancelled(placeholder_locator()))
                }
            }
        });
        Self {
            requirement,
            lease: Mutex::new(ProxiedDeviceState::Leasing(future.shared())),
            cancel,
        }
    }

    fn lease_future(&self) -> Option<LeaseFuture> {
        match &*self.lease.lock().expect("proxied device lock poisoned") {
            ProxiedDeviceState::Leasing(fut) => Some(fut.clone()),
            ProxiedDeviceState::Released => None,
        }
    }

    /// Releases this device: marks it released, cancels any in-flight lease
    /// and waits up to [`CANCEL_LEASING_TIMEOUT`] for it to honor
    /// cancellation. Physical release always happens regardless of whether
    /// the wait timed out (spec §4.E steps 2-3).
    async fn release(&self) {
        let in_flight = {
            let mut guard = self.lease.lock().expect("proxied device lock poisoned");
            let previous = std::mem::replace(&mut *guard, ProxiedDeviceState::Released);
            match previous {
                ProxiedDeviceState::Leasing(fut) => Some(fut),
                ProxiedDeviceState::Released => None,
            }
        };

        if let Some(fut) = in_flight {
            self.cancel.notify_waiters();
            match tokio::time::timeout(CANCEL_LEASING_TIMEOUT, fut).await {
                Ok(_) | Err(_) => {
                    // Whatever happened to the lease (completed, cancelled,
                    // or timed out waiting), physical release proceeds.
                }
            }
        }
        // Physical release of the underlying device handle is a concern of
        // the pluggable device layer (out of scope); nothing further to do
        // here once the lease future has settled or been abandoned.
    }
}

fn placeholder_locator() -> TestLocator {
    // Used only to satisfy `LeaseError::Cancelled`'s payload shape when the
    // cancellation happens inside a context with no test locator at hand
    // (the real locator is attached by the caller in `lease_devices_of_test`
    // error mapping below).
    TestLocator {
        job_id: labrun_metadata::JobId::new_v4(),
        test_id: labrun_metadata::TestId::new_v4(),
        name: String::new(),
    }
}

struct JobDevices {
    tests: HashMap<labrun_metadata::TestId, HashMap<SubDeviceIndex, Arc<ProxiedDevice>>>,
    /// Flips before snapshotting/releasing tests, forbidding late additions
    /// (spec §4.E concurrency note).
    released: bool,
}

/// Manages device leases for every active job. One instance per lab.
pub struct ProxyDeviceManager {
    jobs: Mutex<HashMap<labrun_metadata::JobId, JobDevices>>,
    lease_fn: LeaseFn,
    lease_immediately: bool,
}

impl ProxyDeviceManager {
    pub fn new(lease_fn: LeaseFn, lease_immediately: bool) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            lease_fn,
            lease_immediately,
        }
    }

    pub fn lease_immediately(&self) -> bool {
        self.lease_immediately
    }

    /// Leases devices for every `(test, requirements)` pair of a new job.
    /// Fails if the job was already added.
    #[instrument(level = "debug", skip(self, requirements))]
    pub fn lease_devices_of_job(
        &self,
        job: &JobLocator,
        tests: &[TestLocator],
        requirements: &HashMap<labrun_metadata::TestId, Vec<DeviceRequirement>>,
    ) -> Result<(), LeaseError> {
        let mut jobs = self.jobs.lock().expect("job map lock poisoned");
        if jobs.contains_key(&job.id) {
            return Err(LeaseError::JobAlreadyAdded(job.clone()));
        }
        let mut job_devices = JobDevices {
            tests: HashMap::new(),
            released: false,
        };
        for test in tests {
            let test_requirements = requirements.get(&test.test_id).cloned().unwrap_or_default();
            job_devices
                .tests
                .insert(test.test_id, self.spawn_test_devices(&test_requirements));
        }
        jobs.insert(job.id, job_devices);
        Ok(())
    }

    /// Adds a single test to an already-known job.
    pub fn lease_devices_of_test(
        &self,
        test: &TestLocator,
        requirements: &[DeviceRequirement],
    ) -> Result<(), LeaseError> {
        let mut jobs = self.jobs.lock().expect("job map lock poisoned");
        let job = jobs
            .get_mut(&test.job_id)
            .ok_or_else(|| LeaseError::JobNotFound(job_locator_stub(test)))?;
        if job.released {
            return Err(LeaseError::JobAlreadyReleased(job_locator_stub(test)));
        }
        if job.tests.contains_key(&test.test_id) {
            return Err(LeaseError::TestAlreadyAdded(test.clone()));
        }
        job.tests
            .insert(test.test_id, self.spawn_test_devices(requirements));
        Ok(())
    }

    /// Starts (or, per [`Self::lease_immediately`], records without yet
    /// starting) the lease for each requirement. See the open question on
    /// `leaseImmediately` in DESIGN.md: this implementation always starts
    /// eagerly, since a lazy-start scheduler needs a trigger this spec
    /// doesn't name.
    fn spawn_test_devices(
        &self,
        requirements: &[DeviceRequirement],
    ) -> HashMap<SubDeviceIndex, Arc<ProxiedDevice>> {
        requirements
            .iter()
            .map(|req| {
                let device = ProxiedDevice::spawn(req.clone(), self.lease_fn.clone());
                (req.sub_device_index, Arc::new(device))
            })
            .collect()
    }

    /// Awaits every sub-device's lease for `test`, returning the assembled
    /// [`ProxyDevices`] once all have resolved.
    pub async fn get_devices_of_test(&self, test: &TestLocator) -> Result<ProxyDevices, LeaseError> {
        let devices = {
            let jobs = self.jobs.lock().expect("job map lock poisoned");
            let job = jobs
                .get(&test.job_id)
                .ok_or_else(|| LeaseError::JobNotFound(job_locator_stub(test)))?;
            let test_devices = job
                .tests
                .get(&test.test_id)
                .ok_or_else(|| LeaseError::TestNotFound(test.clone()))?;
            test_devices.clone()
        };

        let mut indices: Vec<_> = devices.keys().copied().collect();
        indices.sort();

        let mut out = Vec::with_capacity(indices.len());
        for index in indices {
            let device = &devices[&index];
            let Some(fut) = device.lease_future() else {
                return Err(LeaseError::Cancelled(test.clone()));
            };
            let leased = fut.await.map_err(|_| LeaseError::Cancelled(test.clone()))?;
            out.push(leased);
        }
        Ok(out)
    }

    /// Releases all sub-devices of a single test. Idempotent.
    pub async fn release_devices_of_test(&self, test: &TestLocator) {
        let devices = {
            let jobs = self.jobs.lock().expect("job map lock poisoned");
            jobs.get(&test.job_id)
                .and_then(|job| job.tests.get(&test.test_id))
                .cloned()
        };
        let Some(devices) = devices else {
            return;
        };
        for device in devices.values() {
            device.release().await;
        }
    }

    /// Releases everything belonging to a job. After return, no further
    /// lease calls succeed for it.
    pub async fn release_devices_of_job(&self, job_id: labrun_metadata::JobId) {
        let devices = {
            let mut jobs = self.jobs.lock().expect("job map lock poisoned");
            let Some(job) = jobs.get_mut(&job_id) else {
                return;
            };
            // Flip before snapshotting, forbidding late additions.
            job.released = true;
            job.tests
                .values()
                .flat_map(|m| m.values().cloned())
                .collect::<Vec<_>>()
        };
        for device in devices {
            device.release().await;
        }
    }
}

fn job_locator_stub(test: &TestLocator) -> JobLocator {
    JobLocator {
        id: test.job_id,
        name: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_succeeds() -> LeaseFn {
        Arc::new(|req: &DeviceRequirement| {
            Ok(LeasedDevice {
                sub_device_index: req.sub_device_index,
                physical_id: format!("device-{}", req.sub_device_index),
            })
        })
    }

    fn locator(job_id: labrun_metadata::JobId, test_id: labrun_metadata::TestId) -> TestLocator {
        TestLocator {
            job_id,
            test_id,
            name: "t".into(),
        }
    }

    #[tokio::test]
    async fn single_device_lease_resolves() {
        let manager = ProxyDeviceManager::new(always_succeeds(), true);
        let job_id = labrun_metadata::JobId::new_v4();
        let test_id = labrun_metadata::TestId::new_v4();
        let test = locator(job_id, test_id);
        let job = JobLocator {
            id: job_id,
            name: "job".into(),
        };

        let mut requirements = HashMap::new();
        requirements.insert(
            test_id,
            vec![DeviceRequirement {
                sub_device_index: SubDeviceIndex::PRIMARY,
                requirement: "any".into(),
            }],
        );

        manager
            .lease_devices_of_job(&job, &[test.clone()], &requirements)
            .unwrap();
        let devices = manager.get_devices_of_test(&test).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].sub_device_index.is_primary());
    }

    #[tokio::test]
    async fn lease_of_job_already_added_fails() {
        let manager = ProxyDeviceManager::new(always_succeeds(), true);
        let job_id = labrun_metadata::JobId::new_v4();
        let job = JobLocator {
            id: job_id,
            name: "job".into(),
        };
        manager
            .lease_devices_of_job(&job, &[], &HashMap::new())
            .unwrap();
        let err = manager
            .lease_devices_of_job(&job, &[], &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, LeaseError::JobAlreadyAdded(_)));
    }

    #[tokio::test]
    async fn release_of_job_forbids_late_additions() {
        let manager = ProxyDeviceManager::new(always_succeeds(), true);
        let job_id = labrun_metadata::JobId::new_v4();
        let test_id = labrun_metadata::TestId::new_v4();
        let test = locator(job_id, test_id);
        let job = JobLocator {
            id: job_id,
            name: "job".into(),
        };
        manager
            .lease_devices_of_job(&job, &[], &HashMap::new())
            .unwrap();
        manager.release_devices_of_job(job_id).await;

        let err = manager
            .lease_devices_of_test(
                &test,
                &[DeviceRequirement {
                    sub_device_index: SubDeviceIndex::PRIMARY,
                    requirement: "any".into(),
                }],
            )
            .unwrap_err();
        assert!(matches!(err, LeaseError::JobAlreadyReleased(_)));
    }

    #[tokio::test]
    async fn release_of_test_is_idempotent() {
        let manager = ProxyDeviceManager::new(always_succeeds(), true);
        let job_id = labrun_metadata::JobId::new_v4();
        let test_id = labrun_metadata::TestId::new_v4();
        let test = locator(job_id, test_id);
        let job = JobLocator {
            id: job_id,
            name: "job".into(),
        };
        let mut requirements = HashMap::new();
        requirements.insert(
            test_id,
            vec![DeviceRequirement {
                sub_device_index: SubDeviceIndex::PRIMARY,
                requirement: "any".into(),
            }],
        );
        manager
            .lease_devices_of_job(&job, &[test.clone()], &requirements)
            .unwrap();
        manager.release_devices_of_test(&test).await;
        manager.release_devices_of_test(&test).await;
    }
}
