//! V1 lookup protocol
//!
//! Line-oriented: each command is a newline-terminated space-split header;
//! `IDENTIFY` additionally reads a 4-byte big-endian length-prefixed JSON
//! body. Every command is answered with a length-prefixed response.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;

use super::registry::{Producer, ProducerInfo, Registration, RegistrationDb};
use crate::utils::names::{is_valid_channel_name, is_valid_topic_name};

/// Largest IDENTIFY body accepted.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Shared state of the lookup daemon: the registration database plus the
/// identity it reports to producers.
pub struct LookupContext {
    pub db: RegistrationDb,
    pub address: String,
    pub tcp_port: u16,
    pub http_port: u16,
    pub version: String,
}

/// A command failure answered with an `E_*` response; the connection stays
/// open.
#[derive(Debug, Error)]
#[error("{code} {description}")]
pub struct ClientError {
    code: &'static str,
    description: String,
}

impl ClientError {
    fn new(code: &'static str, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

/// Producer identity carried in an IDENTIFY body. All fields are required.
#[derive(Debug, Deserialize)]
struct IdentifyBody {
    address: Option<String>,
    tcp_port: Option<u16>,
    http_port: Option<u16>,
    version: Option<String>,
}

/// The per-connection command engine of the lookup daemon.
pub struct LookupProtocolV1 {
    ctx: Arc<LookupContext>,
}

impl LookupProtocolV1 {
    pub fn new(ctx: Arc<LookupContext>) -> Self {
        Self { ctx }
    }

    /// Drive one connection until it disconnects or the daemon shuts down.
    /// The magic has already been consumed.
    pub async fn io_loop(
        &self,
        socket: TcpStream,
        addr: SocketAddr,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        let mut producer: Option<Arc<Producer>> = None;

        let mut line = String::new();
        loop {
            line.clear();
            let n = tokio::select! {
                _ = shutdown_rx.changed() => break,
                read = reader.read_line(&mut line) => match read {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(client = %addr, error = %e, "Read failed");
                        break;
                    }
                },
            };
            if n == 0 {
                break;
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }
            let params: Vec<&str> = trimmed.split(' ').collect();

            let outcome = self
                .exec(&mut producer, addr, &mut reader, &params)
                .await;
            let response = match outcome {
                Ok(response) => response,
                Err(err) => {
                    tracing::debug!(client = %addr, error = %err, "Command rejected");
                    err.code().as_bytes().to_vec()
                }
            };
            if send_response(&mut write_half, &response).await.is_err() {
                break;
            }
        }

        tracing::debug!(client = %addr, "Lookup client closing");
        if let Some(producer) = producer {
            self.remove_producer(&producer);
        }
        Ok(())
    }

    /// Drop a disconnected producer from every registration it appears in.
    fn remove_producer(&self, producer: &Producer) {
        let db = &self.ctx.db;
        let id = &producer.info.id;
        db.remove(&Registration::new("client", "", ""), id);
        for registration in db.lookup_registrations(id) {
            db.remove(&registration, id);
        }
    }

    async fn exec(
        &self,
        producer: &mut Option<Arc<Producer>>,
        addr: SocketAddr,
        reader: &mut BufReader<OwnedReadHalf>,
        params: &[&str],
    ) -> Result<Vec<u8>, ClientError> {
        match params[0] {
            "PING" => self.ping(producer),
            "IDENTIFY" => self.identify(producer, addr, reader).await,
            "REGISTER" => self.register(producer, params),
            "UNREGISTER" => self.unregister(producer, params),
            other => Err(ClientError::new(
                "E_INVALID",
                format!("invalid command {other}"),
            )),
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn ping(&self, producer: &Option<Arc<Producer>>) -> Result<Vec<u8>, ClientError> {
        // a PING may arrive before IDENTIFY on the same connection
        if let Some(producer) = producer {
            producer.touch();
            tracing::trace!(producer = %producer.info.id, "Producer pinged");
        }
        Ok(b"OK".to_vec())
    }

    async fn identify(
        &self,
        producer: &mut Option<Arc<Producer>>,
        addr: SocketAddr,
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<Vec<u8>, ClientError> {
        let body = read_body(reader).await?;
        let identify: IdentifyBody = serde_json::from_slice(&body)
            .map_err(|e| ClientError::new("E_BAD_BODY", format!("invalid JSON: {e}")))?;

        let (Some(address), Some(tcp_port), Some(http_port), Some(version)) = (
            identify.address,
            identify.tcp_port,
            identify.http_port,
            identify.version,
        ) else {
            return Err(ClientError::new("E_BAD_BODY", "missing fields in IDENTIFY"));
        };
        if address.is_empty() || version.is_empty() {
            return Err(ClientError::new("E_BAD_BODY", "missing fields in IDENTIFY"));
        }

        let record = Producer::new(ProducerInfo {
            id: addr.to_string(),
            address,
            tcp_port,
            http_port,
            version,
        });
        tracing::info!(
            client = %addr,
            tcp_port = record.info.tcp_port,
            http_port = record.info.http_port,
            address = %record.info.address,
            "Producer registered"
        );
        self.ctx
            .db
            .add(Registration::new("client", "", ""), Arc::clone(&record));
        *producer = Some(record);

        let response = serde_json::json!({
            "tcp_port": self.ctx.tcp_port,
            "http_port": self.ctx.http_port,
            "version": self.ctx.version,
            "address": self.ctx.address,
        });
        serde_json::to_vec(&response)
            .map_err(|e| ClientError::new("E_BAD_BODY", format!("marshaling failed: {e}")))
    }

    fn register(
        &self,
        producer: &Option<Arc<Producer>>,
        params: &[&str],
    ) -> Result<Vec<u8>, ClientError> {
        let Some(producer) = producer else {
            return Err(ClientError::new("E_INVALID", "client must IDENTIFY"));
        };
        let (topic, channel) = topic_channel_args(params)?;

        if let Some(channel) = channel {
            tracing::debug!(
                producer = %producer.info.id,
                topic,
                channel,
                "Added channel registration"
            );
            self.ctx.db.add(
                Registration::new("channel", topic, channel),
                Arc::clone(producer),
            );
        }
        tracing::debug!(producer = %producer.info.id, topic, "Added topic registration");
        self.ctx
            .db
            .add(Registration::new("topic", topic, ""), Arc::clone(producer));

        Ok(b"OK".to_vec())
    }

    fn unregister(
        &self,
        producer: &Option<Arc<Producer>>,
        params: &[&str],
    ) -> Result<Vec<u8>, ClientError> {
        let Some(producer) = producer else {
            return Err(ClientError::new("E_INVALID", "client must IDENTIFY"));
        };
        let (topic, channel) = topic_channel_args(params)?;

        match channel {
            Some(channel) => {
                tracing::debug!(
                    producer = %producer.info.id,
                    topic,
                    channel,
                    "Removed channel registration"
                );
                // ephemeral channels left without producers are deleted here
                self.ctx
                    .db
                    .remove(&Registration::new("channel", topic, channel), &producer.info.id);
            }
            None => {
                tracing::debug!(producer = %producer.info.id, topic, "Removed topic registration");
                self.ctx
                    .db
                    .remove(&Registration::new("topic", topic, ""), &producer.info.id);
            }
        }
        Ok(b"OK".to_vec())
    }
}

/// Parse and validate the `topic [channel]` argument pair.
fn topic_channel_args<'a>(params: &[&'a str]) -> Result<(&'a str, Option<&'a str>), ClientError> {
    if params.len() < 2 {
        return Err(ClientError::new(
            "E_MISSING_PARAMS",
            "insufficient number of params",
        ));
    }
    let topic = params[1];
    if !is_valid_topic_name(topic) {
        return Err(ClientError::new(
            "E_BAD_TOPIC",
            format!("topic name '{topic}' is not valid"),
        ));
    }
    let channel = params.get(2).copied();
    if let Some(channel) = channel {
        if !is_valid_channel_name(channel) {
            return Err(ClientError::new(
                "E_BAD_CHANNEL",
                format!("channel name '{channel}' is not valid"),
            ));
        }
    }
    Ok((topic, channel))
}

async fn read_body(reader: &mut BufReader<OwnedReadHalf>) -> Result<Vec<u8>, ClientError> {
    let mut size_buf = [0u8; 4];
    reader
        .read_exact(&mut size_buf)
        .await
        .map_err(|e| ClientError::new("E_BAD_BODY", format!("failed to read body size: {e}")))?;
    let size = i32::from_be_bytes(size_buf);
    if size < 0 || size as usize > MAX_BODY_SIZE {
        return Err(ClientError::new(
            "E_BAD_BODY",
            format!("invalid body size {size}"),
        ));
    }
    let mut body = vec![0u8; size as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| ClientError::new("E_BAD_BODY", format!("failed to read body: {e}")))?;
    Ok(body)
}

/// V1 responses are a 4-byte big-endian length followed by the body.
pub(crate) async fn send_response<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> io::Result<()> {
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await
}
