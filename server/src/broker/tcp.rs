//! TCP accept loop of the message daemon

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::broker::Broker;
use super::protocol::{Frame, ProtocolV2, read_magic, write_frame};
use crate::core::constants::MAGIC_V2;

pub async fn serve(
    broker: Arc<Broker>,
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
                    let broker = Arc::clone(&broker);
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        handle_connection(broker, socket, addr, shutdown_rx).await;
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
    broker: Arc<Broker>,
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
    if &magic != MAGIC_V2 {
        tracing::warn!(client = %addr, magic = ?magic, "Bad protocol magic");
        let frame = Frame::Error(Bytes::from_static(b"E_BAD_PROTOCOL"));
        let _ = write_frame(&mut socket, &frame).await;
        return;
    }

    let protocol = ProtocolV2::new(broker);
    if let Err(e) = protocol.io_loop(socket, addr, shutdown_rx).await {
        tracing::debug!(client = %addr, error = %e, "Connection closed with error");
    } else {
        tracing::debug!(client = %addr, "Client disconnected");
    }
}
