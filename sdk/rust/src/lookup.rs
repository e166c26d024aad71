//! Line-oriented V1 lookup connection

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::ProtocolError;
use crate::MAGIC_V1;

/// Upper bound on a single V1 response accepted from the server.
const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Identity a producer announces to a lookup daemon with `IDENTIFY`.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub address: String,
    pub tcp_port: u16,
    pub http_port: u16,
    pub version: String,
}

/// A V1 connection to an emberq-lookupd instance.
///
/// Every command is answered with a length-prefixed response, so each method
/// here writes the command and returns the response body.
pub struct LookupConnection {
    stream: BufStream<TcpStream>,
}

impl LookupConnection {
    /// Connect and send the protocol magic.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        let mut stream = BufStream::new(stream);
        stream.write_all(MAGIC_V1).await?;
        stream.flush().await?;
        Ok(Self { stream })
    }

    /// `IDENTIFY` — bind a producer identity to this connection.
    ///
    /// The response is the lookup daemon's own address information as JSON.
    pub async fn identify(&mut self, info: &PeerInfo) -> Result<Bytes, ProtocolError> {
        let body = serde_json::to_vec(info)?;
        self.send("IDENTIFY", Some(&body)).await?;
        self.read_response().await
    }

    /// `REGISTER topic [channel]`
    pub async fn register(
        &mut self,
        topic: &str,
        channel: Option<&str>,
    ) -> Result<Bytes, ProtocolError> {
        let line = match channel {
            Some(ch) => format!("REGISTER {topic} {ch}"),
            None => format!("REGISTER {topic}"),
        };
        self.send(&line, None).await?;
        self.read_response().await
    }

    /// `UNREGISTER topic [channel]`
    pub async fn unregister(
        &mut self,
        topic: &str,
        channel: Option<&str>,
    ) -> Result<Bytes, ProtocolError> {
        let line = match channel {
            Some(ch) => format!("UNREGISTER {topic} {ch}"),
            None => format!("UNREGISTER {topic}"),
        };
        self.send(&line, None).await?;
        self.read_response().await
    }

    /// `PING` — refresh this producer's liveness.
    pub async fn ping(&mut self) -> Result<Bytes, ProtocolError> {
        self.send("PING", None).await?;
        self.read_response().await
    }

    async fn send(&mut self, line: &str, body: Option<&[u8]>) -> Result<(), ProtocolError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        if let Some(body) = body {
            self.stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
            self.stream.write_all(body).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Bytes, ProtocolError> {
        let size = self.stream.read_u32().await? as usize;
        if size > MAX_RESPONSE_SIZE {
            return Err(ProtocolError::InvalidLength(size));
        }
        let mut data = vec![0u8; size];
        self.stream.read_exact(&mut data).await?;
        Ok(Bytes::from(data))
    }
}
