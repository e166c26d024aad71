//! Framed V2 connection

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::command::Command;
use crate::error::ProtocolError;
use crate::frame::{Frame, FrameType, Message};
use crate::MAGIC_V2;

/// Upper bound on a single frame accepted from the server.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A V2 connection to an emberqd instance.
pub struct Connection {
    stream: BufStream<TcpStream>,
}

impl Connection {
    /// Connect and send the protocol magic.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        let mut stream = BufStream::new(stream);
        stream.write_all(MAGIC_V2).await?;
        stream.flush().await?;
        Ok(Self { stream })
    }

    /// Send a single command and flush.
    pub async fn send(&mut self, cmd: &Command) -> Result<(), ProtocolError> {
        let mut buf = Vec::new();
        cmd.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next frame, blocking until one arrives.
    pub async fn read_frame(&mut self) -> Result<Frame, ProtocolError> {
        let size = self.stream.read_u32().await? as usize;
        if size < 4 || size > MAX_FRAME_SIZE {
            return Err(ProtocolError::InvalidLength(size));
        }
        let frame_type = FrameType::from_wire(self.stream.read_u32().await?)?;
        let mut data = vec![0u8; size - 4];
        self.stream.read_exact(&mut data).await?;
        Ok(Frame {
            frame_type,
            data: Bytes::from(data),
        })
    }

    /// Read frames until a message arrives, skipping heartbeats.
    ///
    /// Returns an error on an [`FrameType::Error`] frame.
    pub async fn read_message(&mut self) -> Result<Message, ProtocolError> {
        loop {
            let frame = self.read_frame().await?;
            match frame.frame_type {
                FrameType::Message => return Message::decode(&frame.data),
                FrameType::Response => continue,
                FrameType::Error => {
                    return Err(ProtocolError::MalformedMessage(
                        String::from_utf8_lossy(&frame.data).into_owned(),
                    ));
                }
            }
        }
    }
}
