//! V2 protocol engine
//!
//! Each accepted connection runs a reader task (this module's `io_loop`), a
//! writer task draining the client's outbound frame queue, and a heartbeat
//! monitor. Commands are newline-terminated space-split lines; some carry a
//! 4-byte big-endian length-prefixed body.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::broker::Broker;
use super::channel::Channel;
use super::client::{ClientSession, ClientState};
use super::message::{MESSAGE_ID_LEN, MessageId};
use crate::core::constants::{CLIENT_OUTPUT_QUEUE_SIZE, HEARTBEAT_BODY, MAX_REQUEUE_DELAY_MS};

const FRAME_TYPE_RESPONSE: u32 = 0;
const FRAME_TYPE_ERROR: u32 = 1;
const FRAME_TYPE_MESSAGE: u32 = 2;

const OK: Bytes = Bytes::from_static(b"OK");

/// A frame queued for a client's writer task.
#[derive(Debug, Clone)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(super::message::Message),
}

/// A protocol-level failure reported to the client as an `E_*` error frame.
///
/// Fatal errors (broken framing, exceeded length limits) also close the
/// connection; everything else leaves it open.
#[derive(Debug, Error)]
#[error("{code} {description}")]
pub struct ClientError {
    code: &'static str,
    description: String,
    fatal: bool,
}

impl ClientError {
    fn new(code: &'static str, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            fatal: false,
        }
    }

    fn fatal(code: &'static str, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            fatal: true,
        }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

/// Connection metadata negotiated with `IDENTIFY`.
#[derive(Debug, Deserialize)]
struct IdentifyBody {
    short_id: Option<String>,
    long_id: Option<String>,
    /// Milliseconds; 0 disables idle heartbeats
    heartbeat_interval: Option<u64>,
}

/// The per-connection command engine of the message daemon.
pub struct ProtocolV2 {
    broker: Arc<Broker>,
}

impl ProtocolV2 {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Drive one connection until it disconnects, errors fatally, times out
    /// or the daemon shuts down. The magic has already been consumed.
    pub async fn io_loop(
        &self,
        socket: TcpStream,
        addr: SocketAddr,
        shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let (read_half, write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        let (out_tx, out_rx) = mpsc::channel(CLIENT_OUTPUT_QUEUE_SIZE);
        let client = Arc::new(ClientSession::new(
            self.broker.next_client_id(),
            addr,
            out_tx,
            self.broker.config.default_heartbeat_interval().as_millis() as u64,
        ));
        let cancel = CancellationToken::new();

        let writer_task = tokio::spawn(write_loop(write_half, out_rx));
        let heartbeat_task = tokio::spawn(heartbeat_loop(Arc::clone(&client), cancel.clone()));

        let result = self
            .read_loop(&client, &mut reader, &cancel, shutdown_rx)
            .await;

        cancel.cancel();
        self.teardown(&client);

        let _ = heartbeat_task.await;
        drop(client);
        let _ = writer_task.await;

        result
    }

    /// Detach the client from its channel; anything it still had in flight
    /// goes straight back to the head of the queue.
    fn teardown(&self, client: &Arc<ClientSession>) {
        let Some(channel) = client.channel() else {
            return;
        };
        let remaining = channel.remove_client(client.id);
        if channel.ephemeral && remaining == 0 {
            if let Some(topic) = self.broker.get_topic(&channel.topic_name) {
                topic.delete_channel(&channel.name);
            }
        }
    }

    async fn read_loop(
        &self,
        client: &Arc<ClientSession>,
        reader: &mut BufReader<OwnedReadHalf>,
        cancel: &CancellationToken,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = shutdown_rx.changed() => return Ok(()),
                read = reader.read_line(&mut line) => read?,
            };
            if n == 0 {
                // clean disconnect
                return Ok(());
            }
            client.touch_activity();

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }
            let params: Vec<&str> = trimmed.split(' ').collect();
            tracing::trace!(client = %client.remote_addr, command = params[0], "Command received");

            let outcome = self.exec(client, reader, &params).await;
            client.touch_activity();
            match outcome {
                Ok(Some(response)) => {
                    if client.outbound.send(Frame::Response(response)).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(
                        client = %client.remote_addr,
                        error = %err,
                        "Command rejected"
                    );
                    let frame = Frame::Error(Bytes::copy_from_slice(err.code().as_bytes()));
                    if client.outbound.send(frame).await.is_err() || err.is_fatal() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn exec(
        &self,
        client: &Arc<ClientSession>,
        reader: &mut BufReader<OwnedReadHalf>,
        params: &[&str],
    ) -> Result<Option<Bytes>, ClientError> {
        match params[0] {
            "IDENTIFY" => self.identify(client, reader).await,
            "SUB" => self.sub(client, params),
            "RDY" => self.rdy(client, params),
            "PUB" => self.publish(reader, params).await,
            "MPUB" => self.mpublish(reader, params).await,
            "FIN" => self.fin(client, params),
            "REQ" => self.req(client, params),
            "TOUCH" => self.touch(client, params),
            "CLS" => self.cls(client),
            "NOP" => Ok(None),
            other => Err(ClientError::new(
                "E_INVALID",
                format!("invalid command {other}"),
            )),
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn identify(
        &self,
        client: &Arc<ClientSession>,
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<Option<Bytes>, ClientError> {
        if client.state() != ClientState::Init {
            return Err(ClientError::new(
                "E_INVALID",
                "cannot IDENTIFY in current state",
            ));
        }
        let body = self.read_body(reader).await?;
        let identify: IdentifyBody = serde_json::from_slice(&body)
            .map_err(|e| ClientError::new("E_BAD_BODY", format!("invalid JSON: {e}")))?;

        let short_id = identify.short_id.unwrap_or_else(|| client.short_id());
        let long_id = identify.long_id.unwrap_or_else(|| client.long_id());
        client.set_identifiers(&short_id, &long_id);
        if let Some(interval) = identify.heartbeat_interval {
            client.set_heartbeat_interval_ms(interval);
        }
        Ok(Some(OK))
    }

    fn sub(
        &self,
        client: &Arc<ClientSession>,
        params: &[&str],
    ) -> Result<Option<Bytes>, ClientError> {
        if client.state() != ClientState::Init {
            return Err(ClientError::new("E_INVALID", "cannot SUB in current state"));
        }
        if params.len() < 5 {
            return Err(ClientError::new(
                "E_INVALID",
                "insufficient number of params",
            ));
        }
        let topic_name = params[1];
        let channel_name = params[2];
        if !crate::utils::names::is_valid_topic_name(topic_name) {
            return Err(ClientError::new(
                "E_BAD_TOPIC",
                format!("topic name '{topic_name}' is not valid"),
            ));
        }
        if !crate::utils::names::is_valid_channel_name(channel_name) {
            return Err(ClientError::new(
                "E_BAD_CHANNEL",
                format!("channel name '{channel_name}' is not valid"),
            ));
        }

        client.set_identifiers(params[3], params[4]);
        let topic = self.broker.get_or_create_topic(topic_name);
        let channel = topic.get_or_create_channel(channel_name);
        client.set_channel(Arc::clone(&channel));
        client.set_state(ClientState::Subscribed);
        channel.add_client(Arc::clone(client));

        tracing::debug!(
            client = %client.remote_addr,
            topic = topic_name,
            channel = channel_name,
            "Client subscribed"
        );
        Ok(None)
    }

    fn rdy(
        &self,
        client: &Arc<ClientSession>,
        params: &[&str],
    ) -> Result<Option<Bytes>, ClientError> {
        if client.state() != ClientState::Subscribed {
            return Err(ClientError::new("E_INVALID", "cannot RDY in current state"));
        }
        if params.len() != 2 {
            return Err(ClientError::new(
                "E_INVALID",
                "insufficient number of params",
            ));
        }
        let count: i64 = params[1]
            .parse()
            .map_err(|_| ClientError::new("E_INVALID", format!("could not parse RDY count {}", params[1])))?;
        let max = self.broker.config.max_rdy_count;
        if count < 0 || count > max {
            return Err(ClientError::new(
                "E_INVALID",
                format!("RDY count {count} out of range 0-{max}"),
            ));
        }
        client.set_ready_count(count);
        Ok(None)
    }

    async fn publish(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        params: &[&str],
    ) -> Result<Option<Bytes>, ClientError> {
        if params.len() < 2 {
            return Err(ClientError::new(
                "E_INVALID",
                "insufficient number of params",
            ));
        }
        let topic_name = params[1];
        if !crate::utils::names::is_valid_topic_name(topic_name) {
            return Err(ClientError::new(
                "E_BAD_TOPIC",
                format!("topic name '{topic_name}' is not valid"),
            ));
        }
        let body = self.read_body(reader).await?;

        let topic = self.broker.get_or_create_topic(topic_name);
        let msg = self.broker.new_message(Bytes::from(body));
        topic
            .put(msg)
            .map_err(|e| ClientError::new("E_PUB_FAILED", e.to_string()))?;
        Ok(Some(OK))
    }

    async fn mpublish(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        params: &[&str],
    ) -> Result<Option<Bytes>, ClientError> {
        if params.len() < 2 {
            return Err(ClientError::new(
                "E_INVALID",
                "insufficient number of params",
            ));
        }
        let topic_name = params[1];
        if !crate::utils::names::is_valid_topic_name(topic_name) {
            return Err(ClientError::new(
                "E_BAD_TOPIC",
                format!("topic name '{topic_name}' is not valid"),
            ));
        }
        let body = Bytes::from(self.read_body(reader).await?);
        if body.len() < 4 {
            return Err(ClientError::new("E_BAD_BODY", "body too short"));
        }

        let count = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        if count == 0 {
            return Err(ClientError::new("E_BAD_BODY", "invalid message count 0"));
        }
        let mut messages = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            if offset + 4 > body.len() {
                return Err(ClientError::new("E_BAD_BODY", "message length mismatch"));
            }
            let len = u32::from_be_bytes([
                body[offset],
                body[offset + 1],
                body[offset + 2],
                body[offset + 3],
            ]) as usize;
            offset += 4;
            if offset + len > body.len() {
                return Err(ClientError::new("E_BAD_BODY", "message length mismatch"));
            }
            messages.push(self.broker.new_message(body.slice(offset..offset + len)));
            offset += len;
        }
        if offset != body.len() {
            return Err(ClientError::new("E_BAD_BODY", "message length mismatch"));
        }

        let topic = self.broker.get_or_create_topic(topic_name);
        for msg in messages {
            topic
                .put(msg)
                .map_err(|e| ClientError::new("E_MPUB_FAILED", e.to_string()))?;
        }
        Ok(Some(OK))
    }

    fn fin(
        &self,
        client: &Arc<ClientSession>,
        params: &[&str],
    ) -> Result<Option<Bytes>, ClientError> {
        let channel = self.subscribed_channel(client)?;
        if params.len() != 2 {
            return Err(ClientError::new(
                "E_INVALID",
                "insufficient number of params",
            ));
        }
        let id = parse_message_id(params[1])?;
        channel
            .finish(&id, client)
            .map_err(|e| ClientError::new("E_FIN_FAILED", e.to_string()))?;
        Ok(None)
    }

    fn req(
        &self,
        client: &Arc<ClientSession>,
        params: &[&str],
    ) -> Result<Option<Bytes>, ClientError> {
        let channel = self.subscribed_channel(client)?;
        if params.len() != 3 {
            return Err(ClientError::new(
                "E_INVALID",
                "insufficient number of params",
            ));
        }
        let id = parse_message_id(params[1])?;
        let timeout_ms: u64 = params[2].parse().map_err(|_| {
            ClientError::new(
                "E_INVALID",
                format!("could not parse timeout {}", params[2]),
            )
        })?;
        if timeout_ms > MAX_REQUEUE_DELAY_MS {
            return Err(ClientError::new(
                "E_INVALID",
                format!("timeout {timeout_ms} out of range"),
            ));
        }
        channel
            .requeue(&id, client, Duration::from_millis(timeout_ms))
            .map_err(|e| ClientError::new("E_REQ_FAILED", e.to_string()))?;
        Ok(None)
    }

    fn touch(
        &self,
        client: &Arc<ClientSession>,
        params: &[&str],
    ) -> Result<Option<Bytes>, ClientError> {
        let channel = self.subscribed_channel(client)?;
        if params.len() != 2 {
            return Err(ClientError::new(
                "E_INVALID",
                "insufficient number of params",
            ));
        }
        let id = parse_message_id(params[1])?;
        channel
            .touch(&id, client)
            .map_err(|e| ClientError::new("E_TOUCH_FAILED", e.to_string()))?;
        Ok(None)
    }

    fn cls(&self, client: &Arc<ClientSession>) -> Result<Option<Bytes>, ClientError> {
        if client.state() != ClientState::Subscribed {
            return Err(ClientError::new("E_INVALID", "cannot CLS in current state"));
        }
        client.start_close();
        Ok(Some(Bytes::from_static(b"CLOSE_WAIT")))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// In-flight commands are valid while subscribed, including the closing
    /// drain window.
    fn subscribed_channel(
        &self,
        client: &Arc<ClientSession>,
    ) -> Result<Arc<Channel>, ClientError> {
        match client.state() {
            ClientState::Subscribed | ClientState::Closing => client
                .channel()
                .ok_or_else(|| ClientError::new("E_INVALID", "client not subscribed")),
            ClientState::Init => Err(ClientError::new("E_INVALID", "client not subscribed")),
        }
    }

    async fn read_body(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<Vec<u8>, ClientError> {
        let mut size_buf = [0u8; 4];
        reader
            .read_exact(&mut size_buf)
            .await
            .map_err(|e| ClientError::fatal("E_BAD_BODY", format!("failed to read body size: {e}")))?;
        let size = i32::from_be_bytes(size_buf);
        if size <= 0 {
            return Err(ClientError::fatal(
                "E_BAD_BODY",
                format!("invalid body size {size}"),
            ));
        }
        let size = size as usize;
        if size > self.broker.config.max_body_size {
            return Err(ClientError::fatal(
                "E_BAD_BODY",
                format!("body too large ({size} bytes)"),
            ));
        }
        let mut body = vec![0u8; size];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| ClientError::fatal("E_BAD_BODY", format!("failed to read body: {e}")))?;
        Ok(body)
    }
}

fn parse_message_id(param: &str) -> Result<MessageId, ClientError> {
    let bytes = param.as_bytes();
    if bytes.len() != MESSAGE_ID_LEN {
        return Err(ClientError::new(
            "E_BAD_MESSAGE",
            format!("invalid message id '{param}'"),
        ));
    }
    let mut id = [0u8; MESSAGE_ID_LEN];
    id.copy_from_slice(bytes);
    Ok(id)
}

// =============================================================================
// Writer / heartbeat tasks
// =============================================================================

/// Drain a client's outbound queue onto the socket, flushing whenever the
/// queue momentarily empties. Frames go out strictly in queue order.
async fn write_loop(write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    let mut writer = BufWriter::new(write_half);
    while let Some(frame) = rx.recv().await {
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
        if rx.is_empty() && writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.flush().await;
}

/// Encode one frame: 4-byte size (type word + data), 4-byte type, data.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    let (frame_type, data) = match frame {
        Frame::Response(data) => (FRAME_TYPE_RESPONSE, data.clone()),
        Frame::Error(data) => (FRAME_TYPE_ERROR, data.clone()),
        Frame::Message(msg) => {
            let mut buf = Vec::new();
            msg.encode(&mut buf);
            (FRAME_TYPE_MESSAGE, Bytes::from(buf))
        }
    };
    writer.write_u32((data.len() + 4) as u32).await?;
    writer.write_u32(frame_type).await?;
    writer.write_all(&data).await?;
    Ok(())
}

/// Watch a client's idle time. Each interval the client stays silent queues
/// a `_heartbeat_` response; the second consecutive silent interval closes
/// the connection instead.
async fn heartbeat_loop(client: Arc<ClientSession>, cancel: CancellationToken) {
    let mut misses = 0u32;
    loop {
        let interval_ms = client.heartbeat_interval_ms();
        if interval_ms == 0 {
            // heartbeats disabled until renegotiated
            misses = 0;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = client.heartbeat_changed() => continue,
            }
        }
        let interval = Duration::from_millis(interval_ms);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = client.heartbeat_changed() => {
                misses = 0;
                continue;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        if client.idle_time() < interval {
            misses = 0;
            continue;
        }
        misses += 1;
        if misses >= 2 {
            tracing::debug!(client = %client.remote_addr, "Client timed out, disconnecting");
            cancel.cancel();
            return;
        }
        let heartbeat = Frame::Response(Bytes::from_static(HEARTBEAT_BODY));
        if client.outbound.send(heartbeat).await.is_err() {
            return;
        }
    }
}

/// Read the 4-byte protocol magic from a fresh connection.
pub(crate) async fn read_magic<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<[u8; 4]> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    Ok(magic)
}
