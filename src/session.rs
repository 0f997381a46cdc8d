//! Session manager (C4): the per-connection state machine that runs the
//! handshake, owns per-session resources, and drives auto-capture.

use crate::capture::{self, CameraProfile};
use crate::errors::{CaptureError, FailureStage};
use crate::events::SnapshotCapturedEvent;
use crate::events::SnapshotFailedEvent;
use crate::frame::{self, FrameTag, TextCommand};
use crate::gateway::Gateway;
use crate::util::{new_session_id, safe_device_id};
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    New,
    Helloed,
    Authed,
}

/// Outbound message queued for the session's WebSocket writer task.
pub(crate) enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Shared, cheaply-cloneable handle to a session's mutable state. Owned by
/// the session table (on the gateway) and by the loopback proxy while a
/// capture is bound.
pub struct SessionHandle {
    pub id: String,
    pub remote: String,
    device_id: RwLock<String>,
    payload_id: RwLock<Option<String>>,
    nonce: RwLock<Option<String>>,
    tz_offset_hours: RwLock<Option<i32>>,
    authed: AtomicBool,
    capture_active: AtomicBool,
    capture_task: RwLock<Option<AbortHandle>>,
    ws_tx: mpsc::Sender<Outbound>,
    proxy_tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    close_tx: watch::Sender<bool>,
}

impl SessionHandle {
    fn new(id: String, remote: String, ws_tx: mpsc::Sender<Outbound>, close_tx: watch::Sender<bool>) -> Self {
        Self {
            id,
            remote,
            device_id: RwLock::new("unknown".to_string()),
            payload_id: RwLock::new(None),
            nonce: RwLock::new(None),
            tz_offset_hours: RwLock::new(None),
            authed: AtomicBool::new(false),
            capture_active: AtomicBool::new(false),
            capture_task: RwLock::new(None),
            ws_tx,
            proxy_tx: RwLock::new(None),
            close_tx,
        }
    }

    pub async fn device_id(&self) -> String {
        self.device_id.read().await.clone()
    }

    async fn set_device_id(&self, id: String) {
        *self.device_id.write().await = id;
    }

    pub async fn payload_id(&self) -> Option<String> {
        self.payload_id.read().await.clone()
    }

    async fn set_payload_id(&self, id: Option<String>) {
        *self.payload_id.write().await = id;
    }

    pub async fn tz_offset_hours(&self) -> Option<i32> {
        *self.tz_offset_hours.read().await
    }

    async fn set_tz_offset_hours(&self, tz: Option<i32>) {
        *self.tz_offset_hours.write().await = tz;
    }

    async fn nonce(&self) -> Option<String> {
        self.nonce.read().await.clone()
    }

    async fn set_nonce(&self, nonce: String) {
        *self.nonce.write().await = Some(nonce);
    }

    pub fn is_authed(&self) -> bool {
        self.authed.load(Ordering::SeqCst)
    }

    fn set_authed(&self) {
        self.authed.store(true, Ordering::SeqCst);
    }

    pub fn is_capture_active(&self) -> bool {
        self.capture_active.load(Ordering::SeqCst)
    }

    fn set_capture_active(&self, active: bool) {
        self.capture_active.store(active, Ordering::SeqCst);
    }

    /// Record the abort handle of the task running this session's capture,
    /// so a concurrent close can cancel it instead of leaving it to run to
    /// its own watchdog.
    pub(crate) async fn set_capture_task(&self, abort: AbortHandle) {
        *self.capture_task.write().await = Some(abort);
    }

    /// Remove and return the stored abort handle, if any. Used both to clear
    /// bookkeeping once a capture finishes on its own and to actually abort
    /// the task from session teardown.
    pub(crate) async fn take_capture_task(&self) -> Option<AbortHandle> {
        self.capture_task.write().await.take()
    }

    /// Atomically mark the capture as finished, returning `true` only for
    /// whichever caller gets there first. Guarantees exactly one of "the
    /// capture task completing" and "the session tearing down" reports a
    /// given capture's terminal outcome.
    pub(crate) fn claim_capture_end(&self) -> bool {
        self.capture_active.swap(false, Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) {
        let _ = self.ws_tx.send(Outbound::Text(text)).await;
    }

    pub(crate) async fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.ws_tx.send(Outbound::Binary(bytes)).await;
    }

    /// Bind a loopback proxy pump to this session, giving it the channel
    /// through which device->proxy bytes should be forwarded.
    pub async fn bind_proxy(&self, tx: mpsc::Sender<Vec<u8>>) {
        *self.proxy_tx.write().await = Some(tx);
    }

    pub async fn unbind_proxy(&self) {
        *self.proxy_tx.write().await = None;
    }

    pub async fn has_bound_proxy(&self) -> bool {
        self.proxy_tx.read().await.is_some()
    }

    /// Forward a device->proxy payload to the bound loopback socket, if any.
    /// Returns `false` (silently) when nothing is bound.
    async fn forward_to_proxy(&self, payload: Vec<u8>) -> bool {
        let guard = self.proxy_tx.read().await;
        match guard.as_ref() {
            Some(tx) => tx.send(payload).await.is_ok(),
            None => false,
        }
    }

    /// Instruct the session's main loop to close the connection. Used by the
    /// capture task once a capture attempt (successful or not) concludes.
    pub fn request_close(&self) {
        let _ = self.close_tx.send(true);
    }

    pub async fn send_open(&self) {
        self.send_binary(frame::encode(FrameTag::Open, &[])).await;
    }

    pub(crate) async fn send_close(&self) {
        self.send_binary(frame::encode(FrameTag::Close, &[])).await;
    }
}

/// Drive one WebSocket connection end to end: handshake, auto-capture, and
/// teardown. Registers/deregisters itself in the gateway's session table.
pub async fn run_session(socket: WebSocket, remote: SocketAddr, gateway: Arc<Gateway>) {
    let id = new_session_id();
    let remote_str = remote.to_string();
    let (ws_tx, mut ws_rx) = mpsc::channel::<Outbound>(64);
    let (close_tx, mut close_rx) = watch::channel(false);

    let handle = Arc::new(SessionHandle::new(id.clone(), remote_str.clone(), ws_tx, close_tx));
    gateway.register_session(handle.clone()).await;

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = ws_rx.recv().await {
            let axum_msg = match msg {
                Outbound::Text(t) => Message::Text(t),
                Outbound::Binary(b) => Message::Binary(b),
            };
            if sink.send(axum_msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    handle.send_text(TextCommand::Ready.to_wire()).await;

    let mut state = SessionState::New;
    let hello_deadline = tokio::time::sleep(Duration::from_millis(gateway.config.hello_wait_ms));
    tokio::pin!(hello_deadline);

    let mut pending_failure: Option<(FailureStage, String)> = None;

    loop {
        tokio::select! {
            _ = &mut hello_deadline, if state == SessionState::New => {
                pending_failure = Some((FailureStage::Hello, "no_hello".to_string()));
                break;
            }
            changed = close_rx.changed() => {
                if changed.is_ok() && *close_rx.borrow() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(failure) = handle_text(&text, &mut state, &handle, &gateway).await {
                            pending_failure = Some(failure);
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        handle_binary(&bytes, state, &handle).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(session_id = %id, error = %e, "websocket read error");
                        pending_failure = Some((FailureStage::Unknown, e.to_string()));
                        break;
                    }
                }
            }
        }
    }

    let device_id = handle.device_id().await;
    let payload_id = handle.payload_id().await;

    handle.unbind_proxy().await;
    gateway
        .abort_session_capture(&handle, "session closed mid-capture")
        .await;
    handle.send_close().await;
    gateway.deregister_session(&id).await;
    drop(handle);

    // Close the writer's channel by dropping the sender side held in the
    // loop above (already implicit once `handle` is dropped); wait for it to
    // flush and close the socket.
    let _ = writer.await;

    if let Some((stage, error)) = pending_failure {
        gateway.bus.publish_failed(SnapshotFailedEvent {
            session_id: id,
            device_id,
            payload_id,
            remote: remote_str,
            stage,
            error,
        });
    }
}

async fn handle_text(
    text: &str,
    state: &mut SessionState,
    handle: &Arc<SessionHandle>,
    gateway: &Arc<Gateway>,
) -> Result<(), (FailureStage, String)> {
    let Some(cmd) = frame::parse_text_command(text) else {
        return Ok(());
    };

    match cmd {
        TextCommand::Hello { payload_id, device_id } => {
            if *state != SessionState::New {
                return Ok(());
            }

            let safe_id = safe_device_id(&device_id);
            handle.set_device_id(safe_id.clone()).await;
            handle.set_payload_id(payload_id).await;

            let tz_offset = gateway
                .registry
                .lookup_device(&safe_id)
                .await
                .ok()
                .flatten()
                .and_then(|d| d.tz_offset_hours);
            handle.set_tz_offset_hours(tz_offset).await;

            let nonce = gateway.authenticator.new_nonce();
            handle.set_nonce(nonce.clone()).await;
            handle.send_text(TextCommand::Chal(nonce).to_wire()).await;
            *state = SessionState::Helloed;

            if !gateway.config.require_auth {
                handle.set_authed();
                handle.send_text(TextCommand::AuthOk.to_wire()).await;
                *state = SessionState::Authed;
                maybe_start_capture(handle, gateway).await;
            }

            Ok(())
        }
        TextCommand::Auth { device_id, sig_b64 } => {
            if *state == SessionState::New {
                handle
                    .send_text(TextCommand::AuthFail("no_chal".to_string()).to_wire())
                    .await;
                if gateway.config.require_auth {
                    return Err((FailureStage::Auth, "no_chal".to_string()));
                }
                return Ok(());
            }

            if !gateway.config.require_auth {
                // Advisory only once HELLO already auto-authenticated the session.
                return Ok(());
            }

            if *state == SessionState::Authed {
                return Ok(());
            }

            let safe_id = safe_device_id(&device_id);
            let current = handle.device_id().await;
            if safe_id != current {
                handle
                    .send_text(TextCommand::AuthFail("device_mismatch".to_string()).to_wire())
                    .await;
                return Err((FailureStage::Auth, "device_mismatch".to_string()));
            }

            let nonce = handle.nonce().await.unwrap_or_default();
            let verified = gateway.authenticator.verify(&safe_id, &nonce, &sig_b64).await;

            if verified {
                handle.set_authed();
                handle.send_text(TextCommand::AuthOk.to_wire()).await;
                *state = SessionState::Authed;
                maybe_start_capture(handle, gateway).await;
                Ok(())
            } else {
                handle
                    .send_text(TextCommand::AuthFail("verify_failed".to_string()).to_wire())
                    .await;
                Err((FailureStage::Auth, "verify_failed".to_string()))
            }
        }
        _ => Ok(()),
    }
}

async fn handle_binary(bytes: &[u8], state: SessionState, handle: &Arc<SessionHandle>) {
    let Ok(frame) = frame::decode(bytes) else {
        return;
    };

    if frame.tag != FrameTag::DeviceToProxy {
        return;
    }

    if state != SessionState::Authed {
        return;
    }

    let _ = handle.forward_to_proxy(frame.payload.to_vec()).await;
}

async fn maybe_start_capture(handle: &Arc<SessionHandle>, gateway: &Arc<Gateway>) {
    if !gateway.config.auto_capture || handle.is_capture_active() {
        return;
    }

    if !gateway.coordinator.try_reserve(&handle.id).await {
        gateway.bus.publish_failed(SnapshotFailedEvent {
            session_id: handle.id.clone(),
            device_id: handle.device_id().await,
            payload_id: handle.payload_id().await,
            remote: handle.remote.clone(),
            stage: FailureStage::Capture,
            error: CaptureError::AlreadyCapturing.as_event_message(),
        });
        handle.request_close();
        return;
    }

    handle.set_capture_active(true);

    let task_handle = handle.clone();
    let task_gateway = gateway.clone();
    let join = tokio::spawn(async move {
        run_capture_task(task_handle, task_gateway).await;
    });
    handle.set_capture_task(join.abort_handle()).await;
}

async fn run_capture_task(handle: Arc<SessionHandle>, gateway: Arc<Gateway>) {
    let device_id = handle.device_id().await;
    let sensors = gateway
        .registry
        .lookup_sensor_meta(&device_id)
        .await
        .unwrap_or_default();
    let profile = CameraProfile::resolve(
        &sensors,
        &gateway.config.cam_user,
        &gateway.config.cam_pass,
        &gateway.config.rtsp_path,
    );

    let timeout = Duration::from_millis(gateway.config.capture_timeout_ms);
    let result = capture::run_capture(
        &profile,
        gateway.config.proxy_port,
        &gateway.config.out_dir,
        &device_id,
        timeout,
    )
    .await;

    if !handle.claim_capture_end() {
        // Session teardown already claimed this capture (closed WS, or
        // leadership revoked mid-capture) and reported its own terminal
        // event; this task's own result must not race a second one.
        return;
    }

    gateway.coordinator.release(&handle.id).await;
    handle.take_capture_task().await;

    match result {
        Ok(path) => {
            gateway.bus.publish_captured(SnapshotCapturedEvent {
                session_id: handle.id.clone(),
                device_id,
                payload_id: handle.payload_id().await,
                remote: handle.remote.clone(),
                local_path: path.to_string_lossy().into_owned(),
                captured_at: Utc::now(),
                tz_offset_hours: handle.tz_offset_hours().await,
            });
        }
        Err(e) => {
            gateway.bus.publish_failed(SnapshotFailedEvent {
                session_id: handle.id.clone(),
                device_id,
                payload_id: handle.payload_id().await,
                remote: handle.remote.clone(),
                stage: FailureStage::Capture,
                error: e.as_event_message(),
            });
        }
    }

    handle.request_close();
}

#[cfg(test)]
impl SessionHandle {
    /// Build a standalone handle for tests outside this module (e.g. the
    /// gateway's leader-revocation tests), bypassing `run_session`.
    pub(crate) fn new_for_tests(id: &str) -> (Arc<Self>, mpsc::Receiver<Outbound>, watch::Receiver<bool>) {
        let (ws_tx, ws_rx) = mpsc::channel(16);
        let (close_tx, close_rx) = watch::channel(false);
        let handle = Arc::new(Self::new(id.to_string(), "127.0.0.1:1".to_string(), ws_tx, close_tx));
        (handle, ws_rx, close_rx)
    }

    #[cfg(test)]
    pub(crate) fn set_capture_active_for_tests(&self, active: bool) {
        self.set_capture_active(active);
    }
}
