//! Lookup daemon peer client
//!
//! One task per configured lookup daemon: announce this broker with
//! `IDENTIFY`, replay the current topic/channel registrations, forward
//! lifecycle events as they happen, and `PING` on an interval. Failed
//! connections are retried with a fixed backoff.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};

use super::broker::{Broker, RegistrationEvent};
use crate::core::constants::{
    LOOKUPD_PING_INTERVAL_SECS, LOOKUPD_RECONNECT_DELAY_SECS, MAGIC_V1,
};

/// Identity this broker announces to each lookup daemon.
#[derive(Debug, Clone, Serialize)]
pub struct PeerIdentity {
    pub address: String,
    pub tcp_port: u16,
    pub http_port: u16,
    pub version: String,
}

/// Spawn one peer task per configured lookup daemon address.
pub fn spawn_peers(broker: &Arc<Broker>, identity: PeerIdentity) {
    for addr in broker.config.lookupd_tcp_addresses.clone() {
        let broker = Arc::clone(broker);
        let identity = identity.clone();
        let shutdown_rx = broker.shutdown_rx();
        tokio::spawn(async move {
            run_peer(broker, addr, identity, shutdown_rx).await;
        });
    }
}

async fn run_peer(
    broker: Arc<Broker>,
    addr: String,
    identity: PeerIdentity,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        match connect_and_run(&broker, &addr, &identity, &mut shutdown_rx).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(lookupd = %addr, error = %e, "Lookup peer connection failed");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(LOOKUPD_RECONNECT_DELAY_SECS)) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}

async fn connect_and_run(
    broker: &Arc<Broker>,
    addr: &str,
    identity: &PeerIdentity,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    let stream = TcpStream::connect(addr).await?;
    let mut stream = BufStream::new(stream);
    stream.write_all(MAGIC_V1).await?;

    let body = serde_json::to_vec(identity).map_err(io::Error::other)?;
    send_command(&mut stream, "IDENTIFY", Some(&body)).await?;
    let response = read_response(&mut stream).await?;
    tracing::info!(
        lookupd = %addr,
        response = %String::from_utf8_lossy(&response),
        "Connected to lookup daemon"
    );

    // Subscribe before replaying so no event falls between snapshot and stream
    let mut events = broker.subscribe_registrations();
    for event in broker.registration_snapshot() {
        send_event(&mut stream, addr, &event).await?;
    }

    let mut ping = tokio::time::interval(Duration::from_secs(LOOKUPD_PING_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return Ok(()),
            _ = ping.tick() => {
                send_command(&mut stream, "PING", None).await?;
                read_response(&mut stream).await?;
            }
            event = events.recv() => match event {
                Ok(event) => send_event(&mut stream, addr, &event).await?,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // deletes missed during the lag cannot be replayed
                    tracing::warn!(lookupd = %addr, missed, "Registration events lagged, resyncing");
                    for event in broker.registration_snapshot() {
                        send_event(&mut stream, addr, &event).await?;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

async fn send_event(
    stream: &mut BufStream<TcpStream>,
    addr: &str,
    event: &RegistrationEvent,
) -> io::Result<()> {
    let line = match event {
        RegistrationEvent::TopicCreate { topic } => format!("REGISTER {topic}"),
        RegistrationEvent::TopicDelete { topic } => format!("UNREGISTER {topic}"),
        RegistrationEvent::ChannelCreate { topic, channel } => {
            format!("REGISTER {topic} {channel}")
        }
        RegistrationEvent::ChannelDelete { topic, channel } => {
            format!("UNREGISTER {topic} {channel}")
        }
    };
    send_command(stream, &line, None).await?;
    let response = read_response(stream).await?;
    if response.as_slice() != b"OK" {
        tracing::warn!(
            lookupd = %addr,
            command = %line,
            response = %String::from_utf8_lossy(&response),
            "Lookup daemon rejected registration"
        );
    }
    Ok(())
}

async fn send_command(
    stream: &mut BufStream<TcpStream>,
    line: &str,
    body: Option<&[u8]>,
) -> io::Result<()> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    if let Some(body) = body {
        stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
        stream.write_all(body).await?;
    }
    stream.flush().await
}

async fn read_response(stream: &mut BufStream<TcpStream>) -> io::Result<Vec<u8>> {
    let size = stream.read_u32().await? as usize;
    let mut data = vec![0u8; size];
    stream.read_exact(&mut data).await?;
    Ok(data)
}
