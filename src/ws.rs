//! Public WebSocket surface (C4/C10 boundary): the single upgrade route
//! devices dial, plus the plain/TLS listener setup.

use crate::gateway::Gateway;
use crate::session;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::sync::Arc;

/// The tunnel's maximum WebSocket message size, enforced by the framework
/// rather than by hand in the session loop.
const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new().route("/", get(handle_upgrade)).with_state(gateway)
}

async fn handle_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(gateway): State<Arc<Gateway>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket: WebSocket| session::run_session(socket, remote, gateway))
}

/// Start the public listener on `WS_PORT`, plain or TLS depending on
/// `WS_TLS`. Runs until the accept loop itself errors or is aborted by the
/// gateway's leader reactor.
pub async fn serve(gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], gateway.config.ws_port));
    let app = router(gateway.clone()).into_make_service_with_connect_info::<SocketAddr>();

    if gateway.config.ws_tls {
        let cert = gateway
            .config
            .tls_cert
            .clone()
            .ok_or_else(|| anyhow::anyhow!("WS_TLS=1 requires TLS_CERT"))?;
        let key = gateway
            .config
            .tls_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("WS_TLS=1 requires TLS_KEY"))?;
        let tls_config = RustlsConfig::from_pem_file(cert, key).await?;

        tracing::info!(%addr, "websocket server listening (tls)");
        axum_server::bind_rustls(addr, tls_config).serve(app).await?;
    } else {
        tracing::info!(%addr, "websocket server listening");
        axum_server::bind(addr).serve(app).await?;
    }

    Ok(())
}
