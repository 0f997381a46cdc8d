//! Loopback RTSP proxy (C5): accepts the local `ffmpeg` connection a capture
//! opens against `127.0.0.1:PROXY_PORT` and pumps it bidirectionally through
//! the currently-capturing session's WebSocket tunnel.

use crate::frame::{self, FrameTag};
use crate::gateway::Gateway;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const READ_BUF_SIZE: usize = 8192;
const TO_DEVICE_CHANNEL_CAPACITY: usize = 64;

pub struct LoopbackProxy {
    port: u16,
    gateway: Arc<Gateway>,
}

impl LoopbackProxy {
    pub fn new(port: u16, gateway: Arc<Gateway>) -> Self {
        Self { port, gateway }
    }

    /// Bind to loopback only, per the proxy's security posture: this socket
    /// must never be reachable from outside the host.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", self.port)).await?;
        tracing::info!(port = self.port, "loopback proxy listening");

        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    let proxy = self.clone();
                    tokio::spawn(async move {
                        proxy.handle_connection(socket, addr).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "loopback proxy accept failed");
                }
            }
        }
    }

    /// Bind the new socket to whichever session currently holds the capture
    /// slot, relay until either side closes, then tear the binding down.
    async fn handle_connection(&self, socket: TcpStream, addr: SocketAddr) {
        let Some(session_id) = self.gateway.coordinator.current_holder().await else {
            tracing::warn!(%addr, "loopback connection with no capturing session, dropping");
            return;
        };

        let Some(handle) = self.gateway.session_handle(&session_id).await else {
            tracing::warn!(%addr, session_id, "capturing session vanished before bind, dropping");
            return;
        };

        let (to_loopback_tx, mut to_loopback_rx) = mpsc::channel::<Vec<u8>>(TO_DEVICE_CHANNEL_CAPACITY);
        handle.bind_proxy(to_loopback_tx).await;
        handle.send_open().await;

        let (mut read_half, mut write_half) = socket.into_split();

        let reader_handle = handle.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        reader_handle
                            .send_binary(frame::encode(FrameTag::ProxyToDevice, &buf[..n]))
                            .await;
                    }
                }
            }
        });

        let mut writer = tokio::spawn(async move {
            while let Some(payload) = to_loopback_rx.recv().await {
                if write_half.write_all(&payload).await.is_err() {
                    break;
                }
            }
        });
        let mut reader = reader;

        // Either direction closing tears the whole connection down; abort
        // whichever pump is still running so the task never outlives the
        // loopback socket.
        tokio::select! {
            _ = &mut reader => { writer.abort(); }
            _ = &mut writer => { reader.abort(); }
        }

        handle.unbind_proxy().await;
        handle.send_close().await;
    }
}
