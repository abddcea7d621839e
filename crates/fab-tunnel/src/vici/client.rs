//! A single VICI session over a stream socket.

use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::trace;

use super::codec::{Packet, ViciCodec};
use super::message::Message;
use crate::error::{Result, TunnelError};

/// Default strongSwan control socket.
pub const DEFAULT_SOCKET: &str = "/var/run/charon.vici";

/// One control session. Dropping it closes the socket.
pub struct ViciClient<S> {
    framed: Framed<S, ViciCodec>,
}

impl ViciClient<UnixStream> {
    /// Opens a session on the daemon's Unix socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self::new(stream))
    }
}

impl<S> ViciClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, ViciCodec),
        }
    }

    async fn send(&mut self, packet: Packet) -> Result<()> {
        self.framed.send(packet).await
    }

    async fn recv(&mut self) -> Result<Packet> {
        match self.framed.next().await {
            Some(packet) => packet,
            None => Err(TunnelError::Protocol("daemon closed the session".to_string())),
        }
    }

    /// Sends a command and returns its response.
    ///
    /// Responses carrying `success = no` are turned into
    /// [`TunnelError::CommandFailed`].
    pub async fn request(&mut self, command: &str, message: Message) -> Result<Message> {
        trace!(command, "vici request");
        self.send(Packet::CmdRequest {
            command: command.to_string(),
            message,
        })
        .await?;

        loop {
            match self.recv().await? {
                Packet::CmdResponse(response) => return check_success(command, response),
                Packet::CmdUnknown => return Err(TunnelError::Unsupported(command.to_string())),
                // events of an earlier registration may still trickle in
                Packet::Event { .. } => continue,
                other => {
                    return Err(TunnelError::Protocol(format!(
                        "unexpected {other:?} while waiting for '{command}'"
                    )));
                }
            }
        }
    }

    /// Sends a streamed command, collecting every `event` it emits.
    pub async fn stream_request(
        &mut self,
        command: &str,
        event: &str,
        message: Message,
    ) -> Result<Vec<Message>> {
        self.register(event).await?;

        trace!(command, event, "vici streamed request");
        self.send(Packet::CmdRequest {
            command: command.to_string(),
            message,
        })
        .await?;

        let mut events = Vec::new();
        let outcome = loop {
            match self.recv().await? {
                Packet::Event { name, message } if name == event => events.push(message),
                Packet::Event { .. } => continue,
                Packet::CmdResponse(response) => break check_success(command, response),
                Packet::CmdUnknown => break Err(TunnelError::Unsupported(command.to_string())),
                other => {
                    break Err(TunnelError::Protocol(format!(
                        "unexpected {other:?} while streaming '{command}'"
                    )));
                }
            }
        };

        self.unregister(event).await?;
        outcome.map(|_| events)
    }

    async fn register(&mut self, event: &str) -> Result<()> {
        self.send(Packet::EventRegister(event.to_string())).await?;
        self.expect_confirm(event).await
    }

    async fn unregister(&mut self, event: &str) -> Result<()> {
        self.send(Packet::EventUnregister(event.to_string())).await?;
        self.expect_confirm(event).await
    }

    async fn expect_confirm(&mut self, event: &str) -> Result<()> {
        loop {
            match self.recv().await? {
                Packet::EventConfirm => return Ok(()),
                Packet::EventUnknown => return Err(TunnelError::Unsupported(event.to_string())),
                Packet::Event { .. } => continue,
                other => {
                    return Err(TunnelError::Protocol(format!(
                        "unexpected {other:?} while (un)registering '{event}'"
                    )));
                }
            }
        }
    }
}

fn check_success(command: &str, response: Message) -> Result<Message> {
    match response.get_str("success").as_deref() {
        Some("no") => Err(TunnelError::CommandFailed {
            command: command.to_string(),
            message: response
                .get_str("errmsg")
                .unwrap_or_else(|| "unknown error".to_string()),
        }),
        _ => Ok(response),
    }
}
