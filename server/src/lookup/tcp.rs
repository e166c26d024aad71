//! TCP accept loop of the lookup daemon

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::protocol::{LookupContext, LookupProtocolV1, send_response};
use crate::broker::protocol::read_magic;
use crate::core::constants::MAGIC_V1;

pub async fn serve(
    ctx: Arc<LookupContext>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(address = %addr, "TCP: listening");
    }
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    tracing::debug!(client = %addr, "TCP: new client");
                    let ctx = Arc::clone(&ctx);
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        handle_connection(ctx, socket, addr, shutdown_rx).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "TCP: accept failed");
                }
            }
        }
    }
    tracing::info!("TCP: closing");
}

async fn handle_connection(
    ctx: Arc<LookupContext>,
    mut socket: TcpStream,
    addr: std::net::SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
) {
    let magic = match read_magic(&mut socket).await {
        Ok(magic) => magic,
        Err(e) => {
            tracing::debug!(client = %addr, error = %e, "Failed to read protocol magic");
            return;
        }
    };
    if &magic != MAGIC_V1 {
        tracing::warn!(client = %addr, magic = ?magic, "Bad protocol magic");
        let _ = send_response(&mut socket, b"E_BAD_PROTOCOL").await;
        return;
    }

    let protocol = LookupProtocolV1::new(ctx);
    if let Err(e) = protocol.io_loop(socket, addr, shutdown_rx).await {
        tracing::debug!(client = %addr, error = %e, "Connection closed with error");
    }
}
