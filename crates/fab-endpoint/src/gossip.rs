//! Multicast endpoint discovery.
//!
//! Every node periodically announces its own endpoint plus a shared token to a
//! multicast group, and listens on the same group for peers. Announcements
//! with a wrong token or carrying our own name are dropped.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{EndpointError, Result};
use crate::store::{PeerEndpointStore, UpsertOutcome};
use crate::types::Endpoint;

/// Largest announcement we accept.
const MAX_MESSAGE_SIZE: usize = 8192;

/// Configuration for multicast discovery.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Multicast group and port.
    pub group: SocketAddrV4,
    /// Local interface to join the group on.
    pub interface: Ipv4Addr,
    /// Shared secret every announcement must carry.
    pub token: String,
    /// Interval between announcements.
    pub interval: Duration,
    /// How long a discovered endpoint stays valid.
    pub ttl: chrono::Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            group: SocketAddrV4::new(Ipv4Addr::new(239, 40, 20, 81), 18080),
            interface: Ipv4Addr::UNSPECIFIED,
            token: String::new(),
            interval: Duration::from_secs(5),
            ttl: chrono::Duration::seconds(60),
        }
    }
}

/// Wire format of an announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    /// The announced endpoint.
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// Shared secret.
    pub token: String,
}

/// Encodes an announcement for `endpoint`.
pub fn encode_message(endpoint: &Endpoint, token: &str) -> Result<Vec<u8>> {
    let message = GossipMessage {
        endpoint: endpoint.clone(),
        token: token.to_string(),
    };
    serde_json::to_vec(&message).map_err(|e| EndpointError::MalformedMessage(e.to_string()))
}

/// Decodes and authenticates an announcement.
///
/// Returns `Ok(None)` for our own echo.
pub fn decode_message(data: &[u8], token: &str, local_name: &str) -> Result<Option<Endpoint>> {
    let message: GossipMessage =
        serde_json::from_slice(data).map_err(|e| EndpointError::MalformedMessage(e.to_string()))?;

    if message.token != token {
        return Err(EndpointError::GossipAuth {
            name: message.endpoint.name,
        });
    }

    if message.endpoint.name == local_name {
        return Ok(None);
    }

    Ok(Some(message.endpoint))
}

/// Opens a socket bound to the group port and joined to the group.
fn bind_listener(config: &GossipConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.group.port());
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.join_multicast_v4(config.group.ip(), &config.interface)?;

    UdpSocket::from_std(socket.into())
}

/// Opens an ephemeral socket for sending announcements.
fn bind_sender(config: &GossipConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_ttl_v4(1)?;
    if !config.interface.is_unspecified() {
        socket.set_multicast_if_v4(&config.interface)?;
    }
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;

    UdpSocket::from_std(socket.into())
}

/// Starts the announcement loop.
///
/// The task owns its socket and releases it when `cancel` fires.
pub fn spawn_broadcaster(
    store: Arc<PeerEndpointStore>,
    config: GossipConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        let mut socket: Option<UdpSocket> = None;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(endpoint) = store.self_endpoint() else {
                continue;
            };

            if socket.is_none() {
                match bind_sender(&config) {
                    Ok(s) => socket = Some(s),
                    Err(e) => {
                        warn!(error = %e, "failed to open gossip sender socket");
                        continue;
                    }
                }
            }

            let data = match encode_message(&endpoint, &config.token) {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, "failed to encode announcement");
                    continue;
                }
            };

            if let Some(s) = &socket {
                if let Err(e) = s.send_to(&data, SocketAddr::V4(config.group)).await {
                    warn!(group = %config.group, error = %e, "failed to send announcement");
                    socket = None;
                } else {
                    trace!(name = %endpoint.name, "sent announcement");
                }
            }
        }

        debug!("gossip broadcaster stopped");
    })
}

/// Starts the receive loop.
///
/// `on_change` fires when a peer is added or its endpoint changes; plain
/// refreshes only extend the expiry.
pub fn spawn_receiver<F>(
    store: Arc<PeerEndpointStore>,
    config: GossipConfig,
    cancel: CancellationToken,
    on_change: F,
) -> JoinHandle<()>
where
    F: Fn(&Endpoint) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

        'outer: loop {
            let socket = match bind_listener(&config) {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(group = %config.group, error = %e, "failed to join gossip group");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(config.interval) => continue,
                    }
                }
            };
            info!(group = %config.group, "listening for endpoint announcements");

            loop {
                let received = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break 'outer,
                    r = socket.recv_from(&mut buf) => r,
                };

                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "gossip socket error, rejoining");
                        continue 'outer;
                    }
                };

                let local_name = store.self_endpoint().map(|e| e.name).unwrap_or_default();
                match decode_message(&buf[..len], &config.token, &local_name) {
                    Ok(Some(endpoint)) => match store.upsert_local(endpoint.clone(), config.ttl) {
                        UpsertOutcome::Added | UpsertOutcome::Updated => {
                            info!(peer = %endpoint.name, %from, "discovered endpoint");
                            on_change(&endpoint);
                        }
                        UpsertOutcome::Refreshed => {}
                    },
                    Ok(None) => {}
                    Err(EndpointError::GossipAuth { name }) => {
                        trace!(%from, name = %name, "dropped announcement with bad token");
                    }
                    Err(e) => {
                        debug!(%from, error = %e, "dropped malformed announcement");
                    }
                }
            }
        }

        debug!("gossip receiver stopped");
    })
}
