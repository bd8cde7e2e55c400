//! Master Syncer for Device (spec §4.D): periodic heartbeat, sign-up/sign-out
//! on device events, outdated-device catch-up, one-way drain override.
//!
//! The periodic loop and the event-driven handlers are unified into a single
//! actor task, the same shape as the teacher's `signal.rs` handler and the
//! dispatcher's event loop: one `tokio::select!` over an interval timer and
//! an mpsc channel, so there is exactly one task mutating syncer state and
//! the "per-object lock" semantics in spec §9 fall out for free.

use crate::device_status::{DeviceStatusInfo, DeviceStatusProvider, MasterSyncClient};
use chrono::Local;
use labrun_metadata::{DeviceStatus, DeviceUuid};
use std::sync::{atomic::{AtomicBool, Ordering}, Arc};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, instrument, warn};

pub const SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Events delivered by the plugin-style device event bus (spec §6).
#[derive(Clone, Debug)]
pub enum DeviceEvent {
    DeviceUp(DeviceUuid),
    DeviceChanged(DeviceUuid),
    DeviceDown(DeviceUuid),
    DeviceErrorChanged(DeviceUuid, String),
    ConfigUpdated,
}

pub struct MasterSyncer {
    provider: Arc<dyn DeviceStatusProvider>,
    client: Arc<dyn MasterSyncClient>,
    draining: AtomicBool,
    /// Mutual exclusion for single-device sign-up, matching spec §4.D:
    /// "DeviceUp handler is synchronized on the syncer."
    single_signup_lock: Mutex<()>,
}

impl MasterSyncer {
    pub fn new(
        provider: Arc<dyn DeviceStatusProvider>,
        client: Arc<dyn MasterSyncClient>,
    ) -> Self {
        Self {
            provider,
            client,
            draining: AtomicBool::new(false),
            single_signup_lock: Mutex::new(()),
        }
    }

    /// One-way switch: once enabled, draining can never be turned back off.
    pub fn enable_draining_mode(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Runs the periodic loop and the event-driven handlers until `events`'s
    /// senders are all dropped (cooperative shutdown; see spec §9: "the loop
    /// must never terminate on exceptions other than cooperative interrupt").
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<DeviceEvent>) {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
            }
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn run_tick(&self) {
        let snapshot = self
            .provider
            .all_device_status_without_duplicated_uuid(true)
            .await;

        let published: Vec<_> = snapshot
            .iter()
            .map(|info| (info.uuid, self.publish_status(info.status), Local::now()))
            .collect();

        let heartbeat = match self.client.heartbeat_lab(&published).await {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "heartbeat RPC failed, skipping this tick's sign-up catch-up");
                return;
            }
        };

        if heartbeat.sign_up_all {
            self.sign_up_batch(snapshot).await;
        } else if !heartbeat.outdated_uuids.is_empty() {
            let batch: Vec<DeviceStatusInfo> = heartbeat
                .outdated_uuids
                .into_iter()
                .filter_map(|uuid| self.provider.device_and_status_info_by_uuid(uuid))
                .collect();
            if !batch.is_empty() {
                self.sign_up_batch(batch).await;
            }
        }
    }

    async fn handle_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::DeviceUp(uuid) | DeviceEvent::DeviceChanged(uuid) => {
                self.sign_up_single(uuid).await;
            }
            DeviceEvent::DeviceDown(uuid) => {
                if let Err(error) = self.client.sign_out_device(uuid).await {
                    warn!(%uuid, %error, "sign-out RPC failed");
                }
            }
            DeviceEvent::DeviceErrorChanged(uuid, detail) => {
                debug!(%uuid, %detail, "resending sign-up with updated exception detail");
                self.sign_up_single(uuid).await;
            }
            DeviceEvent::ConfigUpdated => {
                let known = self
                    .provider
                    .all_device_status_without_duplicated_uuid(false)
                    .await;
                self.sign_up_batch(known).await;
            }
        }
    }

    async fn sign_up_single(&self, uuid: DeviceUuid) {
        let _guard = self.single_signup_lock.lock().await;
        let Some(info) = self.provider.device_and_status_info_by_uuid(uuid) else {
            debug!(%uuid, "device event for an unknown device, ignoring");
            return;
        };
        self.sign_up_batch(vec![info]).await;
    }

    async fn sign_up_batch(&self, devices: Vec<DeviceStatusInfo>) {
        if devices.is_empty() {
            return;
        }
        match self.client.sign_up_lab(&devices).await {
            Ok(result) => {
                for uuid in result.duplicated_uuids {
                    self.provider.update_duplicated_uuid(uuid);
                }
            }
            Err(error) => warn!(%error, "sign-up RPC failed"),
        }
    }

    fn publish_status(&self, status: DeviceStatus) -> DeviceStatus {
        status.publish_with_drain(self.is_draining())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MasterSyncError;
    use futures::future::BoxFuture;
    use std::sync::Mutex as StdMutex;

    struct FakeProvider {
        devices: StdMutex<Vec<DeviceStatusInfo>>,
        duplicated: StdMutex<Vec<DeviceUuid>>,
    }

    impl DeviceStatusProvider for FakeProvider {
        fn all_device_status_without_duplicated_uuid(
            &self,
            _realtime_dispatch: bool,
        ) -> BoxFuture<'_, Vec<DeviceStatusInfo>> {
            Box::pin(async { self.devices.lock().unwrap().clone() })
        }

        fn device_and_status_info_by_control_id(
            &self,
            _control_id: &str,
            _device_type: &str,
        ) -> Option<DeviceStatusInfo> {
            None
        }

        fn device_and_status_info_by_uuid(&self, uuid: DeviceUuid) -> Option<DeviceStatusInfo> {
            self.devices
                .lock()
                .unwrap()
                .iter()
                .find(|d| d.uuid == uuid)
                .cloned()
        }

        fn update_duplicated_uuid(&self, uuid: DeviceUuid) {
            self.duplicated.lock().unwrap().push(uuid);
        }
    }

    struct FakeClient {
        heartbeats: StdMutex<Vec<Vec<(DeviceUuid, DeviceStatus, chrono::DateTime<Local>)>>>,
    }

    impl MasterSyncClient for FakeClient {
        fn sign_up_lab<'a>(
            &'a self,
            _devices: &'a [DeviceStatusInfo],
        ) -> BoxFuture<'a, Result<crate::device_status::SignUpResult, MasterSyncError>> {
            Box::pin(async { Ok(Default::default()) })
        }

        fn heartbeat_lab<'a>(
            &'a self,
            devices: &'a [(DeviceUuid, DeviceStatus, chrono::DateTime<Local>)],
        ) -> BoxFuture<'a, Result<crate::device_status::HeartbeatResult, MasterSyncError>> {
            self.heartbeats.lock().unwrap().push(devices.to_vec());
            Box::pin(async { Ok(Default::default()) })
        }

        fn sign_out_device(
            &self,
            _uuid: DeviceUuid,
        ) -> BoxFuture<'_, Result<(), MasterSyncError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn uuid() -> DeviceUuid {
        DeviceUuid::new_v4()
    }

    #[tokio::test]
    async fn drain_mode_rewrites_idle_at_publish_time() {
        let device = uuid();
        let provider = Arc::new(FakeProvider {
            devices: StdMutex::new(vec![DeviceStatusInfo {
                uuid: device,
                control_id: "c0".into(),
                device_type: "phone".into(),
                status: DeviceStatus::Idle,
            }]),
            duplicated: StdMutex::new(Vec::new()),
        });
        let client = Arc::new(FakeClient {
            heartbeats: StdMutex::new(Vec::new()),
        });
        let syncer = Arc::new(MasterSyncer::new(provider, client.clone()));

        syncer.run_tick().await;
        syncer.enable_draining_mode();
        syncer.run_tick().await;

        let heartbeats = client.heartbeats.lock().unwrap();
        assert_eq!(heartbeats[0][0].1, DeviceStatus::Idle);
        assert_eq!(heartbeats[1][0].1, DeviceStatus::Lameduck);
    }

    #[tokio::test]
    async fn device_up_event_signs_up_only_that_device() {
        let known = uuid();
        let provider = Arc::new(FakeProvider {
            devices: StdMutex::new(vec![DeviceStatusInfo {
                uuid: known,
                control_id: "c0".into(),
                device_type: "phone".into(),
                status: DeviceStatus::Idle,
            }]),
            duplicated: StdMutex::new(Vec::new()),
        });
        let client = Arc::new(FakeClient {
            heartbeats: StdMutex::new(Vec::new()),
        });
        let syncer = Arc::new(MasterSyncer::new(provider, client));

        // Unknown uuid: ignored without panicking.
        syncer.sign_up_single(uuid()).await;
        // Known uuid: resolved and signed up.
        syncer.sign_up_single(known).await;
    }
}
