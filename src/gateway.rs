//! Gateway composition and lifecycle (C10): owns every shared collaborator
//! and wires the leader lock to the two replica-gated accept loops (public
//! WebSocket server, loopback RTSP proxy).

use crate::auth::DeviceAuthenticator;
use crate::config::{AppConfig, StorageMode};
use crate::coordinator::CaptureCoordinator;
use crate::errors::FailureStage;
use crate::events::{EventBus, SnapshotFailedEvent};
use crate::leader::{run_leader_loop, LeaderEvent, LeaderLock};
use crate::proxy::LoopbackProxy;
use crate::registry::DeviceRegistry;
use crate::session::SessionHandle;
use crate::storage::{LocalFsStorageAdapter, S3StorageAdapter, StorageAdapter, StorageWorker};
use crate::ws;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// How long an orderly shutdown waits for in-flight storage jobs before
/// giving up and exiting anyway.
const SHUTDOWN_STORAGE_GRACE: Duration = Duration::from_secs(5);

/// Everything a session or the loopback proxy needs to reach the rest of the
/// system. Cloned as `Arc<Gateway>` into every per-connection task.
pub struct Gateway {
    pub config: AppConfig,
    pub registry: Arc<dyn DeviceRegistry>,
    pub authenticator: Arc<DeviceAuthenticator>,
    pub coordinator: Arc<CaptureCoordinator>,
    pub bus: EventBus,
    pub leader_lock: Arc<dyn LeaderLock>,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl Gateway {
    pub fn new(
        config: AppConfig,
        registry: Arc<dyn DeviceRegistry>,
        authenticator: Arc<DeviceAuthenticator>,
        coordinator: Arc<CaptureCoordinator>,
        bus: EventBus,
        leader_lock: Arc<dyn LeaderLock>,
    ) -> Self {
        Self {
            config,
            registry,
            authenticator,
            coordinator,
            bus,
            leader_lock,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_session(&self, handle: Arc<SessionHandle>) {
        self.sessions.write().await.insert(handle.id.clone(), handle);
    }

    pub async fn deregister_session(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }

    pub async fn session_handle(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// If `handle` has a capture in flight, abort its task, release the
    /// coordinator slot, and publish exactly one `stage=capture` failure with
    /// `error`. A no-op if the capture already finished (or never started) -
    /// `SessionHandle::claim_capture_end` arbitrates against the capture
    /// task's own completion so the two can never both report it.
    pub(crate) async fn abort_session_capture(&self, handle: &Arc<SessionHandle>, error: &str) {
        if let Some(abort) = handle.take_capture_task().await {
            abort.abort();
        }

        if handle.claim_capture_end() {
            self.coordinator.release(&handle.id).await;
            self.bus.publish_failed(SnapshotFailedEvent {
                session_id: handle.id.clone(),
                device_id: handle.device_id().await,
                payload_id: handle.payload_id().await,
                remote: handle.remote.clone(),
                stage: FailureStage::Capture,
                error: error.to_string(),
            });
        }
    }

    /// Called when leadership is revoked mid-capture: any session with a
    /// capture in flight is failed with `stage=capture` and asked to close;
    /// everything else is asked to close without a synthetic failure.
    async fn abort_in_flight_sessions(&self) {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().await.values().cloned().collect();
        for handle in handles {
            self.abort_session_capture(&handle, "leadership revoked mid-capture").await;
            handle.request_close();
        }
    }

    fn build_storage_adapter(&self) -> Arc<dyn StorageAdapter> {
        match self.config.storage_mode {
            StorageMode::Local => Arc::new(LocalFsStorageAdapter::new(
                self.config.out_dir.clone(),
                self.config.storage_delete_local,
            )),
            StorageMode::S3 => Arc::new(S3StorageAdapter::new("snapshots", self.config.storage_delete_local)),
        }
    }

    /// Start every subsystem and block until shutdown is requested via
    /// `shutdown`. Start order: storage worker, leader loop, then the
    /// leader-reactive accept loops; stop order is the reverse, with a
    /// bounded wait for in-flight store jobs.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let storage_worker = Arc::new(StorageWorker::new(
            self.build_storage_adapter(),
            self.bus.clone(),
            self.config.storage_concurrency,
            self.config.use_device_tz_offset,
        ));
        let storage_handle = tokio::spawn(storage_worker.run());

        let leader_handle = tokio::spawn(run_leader_loop(self.leader_lock.clone()));
        let reactor_handle = tokio::spawn(self.clone().run_leader_reactor());

        let _ = self.leader_lock.try_acquire().await;

        let _ = (&mut shutdown).await;

        tracing::info!("shutdown requested, releasing leadership");
        if let Err(e) = self.leader_lock.release().await {
            tracing::warn!(error = %e, "failed to release leader lock cleanly");
        }

        reactor_handle.abort();
        leader_handle.abort();

        // Give in-flight store jobs a bounded window to finish, then cut the
        // cord rather than block shutdown indefinitely.
        tokio::time::sleep(SHUTDOWN_STORAGE_GRACE).await;
        storage_handle.abort();
    }

    /// React to leader-election transitions: only the elected replica runs
    /// the public WS server and the loopback proxy accept loop.
    async fn run_leader_reactor(self: Arc<Self>) {
        let mut events = self.leader_lock.events();
        let mut active: Option<(JoinHandle<()>, JoinHandle<()>)> = None;

        if self.leader_lock.am_leader() {
            active = Some(self.clone().spawn_accept_loops());
        }

        loop {
            match events.recv().await {
                Ok(LeaderEvent::Elected) => {
                    if active.is_none() {
                        tracing::info!("elected leader, starting accept loops");
                        active = Some(self.clone().spawn_accept_loops());
                    }
                }
                Ok(LeaderEvent::Revoked) => {
                    if let Some((ws_task, proxy_task)) = active.take() {
                        tracing::warn!("leadership revoked, stopping accept loops");
                        ws_task.abort();
                        proxy_task.abort();
                    }
                    self.abort_in_flight_sessions().await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn spawn_accept_loops(self: Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let ws_gateway = self.clone();
        let ws_task = tokio::spawn(async move {
            if let Err(e) = ws::serve(ws_gateway).await {
                tracing::error!(error = %e, "websocket server exited");
            }
        });

        let proxy_gateway = self.clone();
        let proxy_task = tokio::spawn(async move {
            let proxy = Arc::new(LoopbackProxy::new(proxy_gateway.config.proxy_port, proxy_gateway));
            if let Err(e) = proxy.run().await {
                tracing::error!(error = %e, "loopback proxy exited");
            }
        });

        (ws_task, proxy_task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leader::SingleProcessLeaderLock;
    use crate::registry::StaticRegistry;

    fn test_gateway() -> Arc<Gateway> {
        let registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new());
        let authenticator = Arc::new(DeviceAuthenticator::new(registry.clone()));
        Arc::new(Gateway::new(
            AppConfig::default(),
            registry,
            authenticator,
            Arc::new(CaptureCoordinator::new()),
            EventBus::new(),
            Arc::new(SingleProcessLeaderLock::new()),
        ))
    }

    #[tokio::test]
    async fn register_and_deregister_round_trips() {
        let gateway = test_gateway();
        let (handle, _ws_rx, _close_rx) = SessionHandle::new_for_tests("s1");

        gateway.register_session(handle.clone()).await;
        assert!(gateway.session_handle("s1").await.is_some());

        gateway.deregister_session("s1").await;
        assert!(gateway.session_handle("s1").await.is_none());
    }

    #[tokio::test]
    async fn abort_session_capture_reports_once_even_if_called_twice() {
        let gateway = test_gateway();
        let mut failed_rx = gateway.bus.subscribe_failed();
        let (handle, _ws_rx, _close_rx) = SessionHandle::new_for_tests("capturing");
        handle.set_capture_active_for_tests(true);

        gateway.abort_session_capture(&handle, "test reason").await;
        let failed = failed_rx.try_recv().expect("one failed event");
        assert_eq!(failed.stage, FailureStage::Capture);
        assert_eq!(failed.error, "test reason");

        // A second call (e.g. a racing close arriving right after leadership
        // is revoked) must not publish a second terminal event.
        gateway.abort_session_capture(&handle, "test reason").await;
        assert!(failed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn abort_session_capture_is_a_noop_when_nothing_is_in_flight() {
        let gateway = test_gateway();
        let mut failed_rx = gateway.bus.subscribe_failed();
        let (handle, _ws_rx, _close_rx) = SessionHandle::new_for_tests("idle");

        gateway.abort_session_capture(&handle, "test reason").await;
        assert!(failed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn abort_in_flight_sessions_fails_active_captures_and_closes_all() {
        let gateway = test_gateway();
        let mut failed_rx = gateway.bus.subscribe_failed();

        let (capturing, _rx1, mut capturing_close_rx) = SessionHandle::new_for_tests("capturing");
        capturing.set_capture_active_for_tests(true);
        let (idle, _rx2, mut idle_close_rx) = SessionHandle::new_for_tests("idle");

        gateway.register_session(capturing.clone()).await;
        gateway.register_session(idle.clone()).await;

        gateway.abort_in_flight_sessions().await;

        let failed = failed_rx.try_recv().expect("one failed event for the capturing session");
        assert_eq!(failed.session_id, "capturing");
        assert_eq!(failed.stage, FailureStage::Capture);
        assert!(failed_rx.try_recv().is_err());

        assert!(*capturing_close_rx.borrow_and_update());
        assert!(*idle_close_rx.borrow_and_update());
    }
}
