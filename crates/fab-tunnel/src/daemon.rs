//! The IPsec daemon seam.
//!
//! [`IpsecDaemon`] is what the tunnel manager needs from the daemon.
//! [`ViciDaemon`] implements it over strongSwan's control socket, opening a
//! fresh session for every call.

use std::future::Future;
use std::path::PathBuf;

use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::vici::{Message, ViciClient};

/// One child SA of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildDescriptor {
    /// Child name, unique within the daemon.
    pub name: String,
    /// Local traffic selectors.
    pub local_ts: Vec<String>,
    /// Remote traffic selectors.
    pub remote_ts: Vec<String>,
}

/// A connection as the daemon sees it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionDescriptor {
    /// Connection name.
    pub name: String,
    /// Local IKE identity.
    pub local_id: String,
    /// Local addresses.
    pub local_addrs: Vec<String>,
    /// Local certificates as PEM. Empty when read back from the daemon.
    pub local_certs: Vec<String>,
    /// Remote IKE identity.
    pub remote_id: String,
    /// Remote addresses.
    pub remote_addrs: Vec<String>,
    /// Remote IKE port.
    pub remote_port: Option<u16>,
    /// This connection is to a mediation server.
    pub mediation: bool,
    /// Name of the mediation connection used to reach the peer.
    pub mediated_by: Option<String>,
    /// Identity of the peer as known to the mediator.
    pub mediation_peer: Option<String>,
    /// Child SAs.
    pub children: Vec<ChildDescriptor>,
}

/// An established IKE SA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSa {
    /// Connection name of the IKE SA.
    pub ike: String,
    /// IKE SA state, e.g. `ESTABLISHED`.
    pub state: String,
    /// Names of the installed child SAs.
    pub children: Vec<String>,
}

/// Daemon counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStats {
    /// When the daemon was started.
    pub running_since: Option<String>,
    /// Number of IKE SAs.
    pub ike_sas_total: u64,
    /// Number of half open IKE SAs.
    pub ike_sas_half_open: u64,
}

/// Operations the tunnel manager needs from the IPsec daemon.
pub trait IpsecDaemon: Send + Sync {
    /// Names of all loaded connections.
    fn get_conns(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Loaded connections, optionally only the one called `name`.
    fn list_conns(
        &self,
        name: Option<&str>,
    ) -> impl Future<Output = Result<Vec<ConnectionDescriptor>>> + Send;

    /// Loads or replaces a connection.
    fn load_conn(&self, conn: &ConnectionDescriptor) -> impl Future<Output = Result<()>> + Send;

    /// Unloads a connection.
    fn unload_conn(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    /// Starts a child SA of the connection `ike`.
    fn initiate(&self, ike: &str, child: &str) -> impl Future<Output = Result<()>> + Send;

    /// Tears down the IKE SA of the connection `ike`.
    fn terminate(&self, ike: &str) -> impl Future<Output = Result<()>> + Send;

    /// Active SAs, optionally only those of the connection `ike`.
    fn list_sas(&self, ike: Option<&str>) -> impl Future<Output = Result<Vec<ActiveSa>>> + Send;

    /// Daemon counters.
    fn stats(&self) -> impl Future<Output = Result<DaemonStats>> + Send;
}

/// [`IpsecDaemon`] over the VICI Unix socket.
#[derive(Debug, Clone)]
pub struct ViciDaemon {
    socket_path: PathBuf,
}

impl ViciDaemon {
    /// Creates a daemon handle for the socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn session(&self) -> Result<ViciClient<tokio::net::UnixStream>> {
        ViciClient::connect(&self.socket_path).await
    }
}

impl Default for ViciDaemon {
    fn default() -> Self {
        Self::new(crate::vici::DEFAULT_SOCKET)
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

/// Builds the `load-conn` request for a connection.
pub(crate) fn load_conn_message(conn: &ConnectionDescriptor) -> Message {
    let mut body = Message::new()
        .with_value("version", "2")
        .with_list("local_addrs", &conn.local_addrs)
        .with_list("remote_addrs", &conn.remote_addrs);
    if let Some(port) = conn.remote_port {
        body.push_value("remote_port", port.to_string());
    }
    body.push_value("mediation", yes_no(conn.mediation));
    if let Some(mediated_by) = &conn.mediated_by {
        body.push_value("mediated_by", mediated_by);
    }
    if let Some(peer) = &conn.mediation_peer {
        body.push_value("mediation_peer", peer);
    }

    let mut local = Message::new()
        .with_value("auth", "pubkey")
        .with_value("id", &conn.local_id);
    if !conn.local_certs.is_empty() {
        local.push_list("certs", &conn.local_certs);
    }
    body.push_section("local", local);
    body.push_section(
        "remote",
        Message::new()
            .with_value("auth", "pubkey")
            .with_value("id", &conn.remote_id),
    );

    let mut children = Message::new();
    for child in &conn.children {
        children.push_section(
            child.name.clone(),
            Message::new()
                .with_list("local_ts", &child.local_ts)
                .with_list("remote_ts", &child.remote_ts)
                .with_value("dpd_action", "restart")
                .with_value("close_action", "restart"),
        );
    }
    if !children.is_empty() {
        body.push_section("children", children);
    }

    Message::new().with_section(conn.name.clone(), body)
}

/// Parses one `list-conn` event into descriptors.
pub(crate) fn parse_list_conn(event: &Message) -> Vec<ConnectionDescriptor> {
    event
        .sections()
        .map(|(name, conn)| {
            let section_value = |section: &str, key: &str| {
                conn.get_section(section)
                    .and_then(|s| s.get_str(key))
                    .unwrap_or_default()
            };
            let children = conn
                .get_section("children")
                .map(|children| {
                    children
                        .sections()
                        .map(|(child, ts)| ChildDescriptor {
                            name: child.to_string(),
                            local_ts: ts.get_list("local-ts"),
                            remote_ts: ts.get_list("remote-ts"),
                        })
                        .collect()
                })
                .unwrap_or_default();

            ConnectionDescriptor {
                name: name.to_string(),
                local_id: section_value("local-1", "id"),
                local_addrs: conn.get_list("local_addrs"),
                local_certs: Vec::new(),
                remote_id: section_value("remote-1", "id"),
                remote_addrs: conn.get_list("remote_addrs"),
                remote_port: conn.get_str("remote_port").and_then(|p| p.parse().ok()),
                mediation: conn.get_str("mediation").as_deref() == Some("yes"),
                mediated_by: conn.get_str("mediated_by"),
                mediation_peer: conn.get_str("mediation_peer"),
                children,
            }
        })
        .collect()
}

/// Parses one `list-sa` event.
pub(crate) fn parse_list_sa(event: &Message) -> Vec<ActiveSa> {
    event
        .sections()
        .map(|(name, sa)| ActiveSa {
            ike: name.to_string(),
            state: sa.get_str("state").unwrap_or_default(),
            children: sa
                .get_section("child-sas")
                .map(|children| {
                    children
                        .sections()
                        .filter_map(|(_, child)| child.get_str("name"))
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect()
}

fn parse_stats(response: &Message) -> DaemonStats {
    let counter = |section: &str, key: &str| {
        response
            .get_section(section)
            .and_then(|s| s.get_str(key))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };
    DaemonStats {
        running_since: response.get_section("uptime").and_then(|u| u.get_str("since")),
        ike_sas_total: counter("ikesas", "total"),
        ike_sas_half_open: counter("ikesas", "half-open"),
    }
}

impl IpsecDaemon for ViciDaemon {
    async fn get_conns(&self) -> Result<Vec<String>> {
        let response = self.session().await?.request("get-conns", Message::new()).await?;
        Ok(response.get_list("conns"))
    }

    async fn list_conns(&self, name: Option<&str>) -> Result<Vec<ConnectionDescriptor>> {
        let mut filter = Message::new();
        if let Some(name) = name {
            filter.push_value("ike", name);
        }
        let events = self
            .session()
            .await?
            .stream_request("list-conns", "list-conn", filter)
            .await?;
        Ok(events.iter().flat_map(parse_list_conn).collect())
    }

    async fn load_conn(&self, conn: &ConnectionDescriptor) -> Result<()> {
        self.session()
            .await?
            .request("load-conn", load_conn_message(conn))
            .await?;
        debug!(conn = %conn.name, "daemon loaded connection");
        Ok(())
    }

    async fn unload_conn(&self, name: &str) -> Result<()> {
        self.session()
            .await?
            .request("unload-conn", Message::new().with_value("name", name))
            .await?;
        Ok(())
    }

    async fn initiate(&self, ike: &str, child: &str) -> Result<()> {
        let request = Message::new()
            .with_value("child", child)
            .with_value("ike", ike)
            .with_value("timeout", "-1");
        self.session().await?.request("initiate", request).await?;
        Ok(())
    }

    async fn terminate(&self, ike: &str) -> Result<()> {
        let request = Message::new()
            .with_value("ike", ike)
            .with_value("timeout", "-1");
        match self.session().await?.request("terminate", request).await {
            Ok(_) => Ok(()),
            // nothing established yet
            Err(TunnelError::CommandFailed { message, .. }) if message.contains("no matching") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_sas(&self, ike: Option<&str>) -> Result<Vec<ActiveSa>> {
        let mut filter = Message::new();
        if let Some(ike) = ike {
            filter.push_value("ike", ike);
        }
        let events = self
            .session()
            .await?
            .stream_request("list-sas", "list-sa", filter)
            .await?;
        Ok(events.iter().flat_map(parse_list_sa).collect())
    }

    async fn stats(&self) -> Result<DaemonStats> {
        let response = self.session().await?.request("stats", Message::new()).await?;
        Ok(parse_stats(&response))
    }
}
