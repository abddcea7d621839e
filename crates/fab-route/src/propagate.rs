//! Cross-node prefix propagation.
//!
//! Nodes that terminate tunnels announce the prefixes they host and the
//! prefixes they reach through the overlay. Siblings route those prefixes via
//! the announcing node and drop the routes again when it leaves.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cni::PrefixDiscovery;
use crate::error::{Result, RouteError};
use crate::table::{AddressFamily, MAIN_TABLE, Route, RouteTable};

/// Largest datagram accepted by [`UdpMembership`].
const MAX_DATAGRAM: usize = 64 * 1024;

/// Prefixes announced by one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefixAnnouncement {
    /// Announcing node.
    pub node: String,
    /// Prefixes hosted on the node.
    pub local_prefixes: Vec<IpNet>,
    /// Prefixes the node reaches through tunnels.
    pub connector_prefixes: Vec<IpNet>,
}

/// Events emitted by a membership implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node became visible.
    Joined {
        /// Node name.
        node: String,
        /// Address the node was heard from.
        addr: IpAddr,
    },
    /// A node sent a payload.
    Message {
        /// Sending node.
        from: String,
        /// Address of the sender.
        addr: IpAddr,
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// A node left the view.
    Left {
        /// Node name.
        node: String,
    },
}

/// Broadcast side of a cluster membership protocol.
pub trait ClusterMembership: Send + Sync {
    /// Sends `payload` to every member.
    fn broadcast(&self, payload: &[u8]) -> impl Future<Output = Result<()>> + Send;
}

/// Propagation settings.
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Name of this node.
    pub node: String,
    /// Interval between announcements.
    pub interval: Duration,
    /// Table propagated routes are installed in.
    pub table: u32,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            node: String::new(),
            interval: Duration::from_secs(5),
            table: MAIN_TABLE,
        }
    }
}

/// Announces local prefixes and installs routes for those of siblings.
pub struct PrefixPropagator<D, T, M> {
    config: PropagationConfig,
    discovery: Arc<D>,
    routes: Arc<T>,
    membership: M,
    node_routes: Mutex<HashMap<String, Vec<Route>>>,
}

impl<D, T, M> PrefixPropagator<D, T, M>
where
    D: PrefixDiscovery,
    T: RouteTable,
    M: ClusterMembership,
{
    /// Creates a propagator.
    pub fn new(
        config: PropagationConfig,
        discovery: Arc<D>,
        routes: Arc<T>,
        membership: M,
    ) -> Self {
        Self {
            config,
            discovery,
            routes,
            membership,
            node_routes: Mutex::new(HashMap::new()),
        }
    }

    /// Routes currently installed on behalf of `node`.
    pub fn routes_of(&self, node: &str) -> Vec<Route> {
        self.node_routes.lock().get(node).cloned().unwrap_or_default()
    }

    /// Broadcasts this node's prefixes once.
    pub async fn announce(&self) -> Result<()> {
        let announcement = PrefixAnnouncement {
            node: self.config.node.clone(),
            local_prefixes: self.discovery.local_prefixes().await?,
            connector_prefixes: self.discovery.connector_prefixes().await?,
        };
        let payload = serde_json::to_vec(&announcement)
            .map_err(|e| RouteError::Membership(e.to_string()))?;
        self.membership.broadcast(&payload).await?;
        trace!(
            local = announcement.local_prefixes.len(),
            connector = announcement.connector_prefixes.len(),
            "announced prefixes"
        );
        Ok(())
    }

    /// Applies one membership event.
    pub async fn handle_event(&self, event: MembershipEvent) {
        match event {
            MembershipEvent::Joined { node, addr } => {
                info!(node = %node, %addr, "node joined");
            }
            MembershipEvent::Message { from, addr, payload } => {
                if from == self.config.node {
                    return;
                }
                match serde_json::from_slice::<PrefixAnnouncement>(&payload) {
                    Ok(announcement) => self.apply_announcement(&from, addr, &announcement).await,
                    Err(e) => debug!(node = %from, error = %e, "dropped malformed announcement"),
                }
            }
            MembershipEvent::Left { node } => {
                info!(node = %node, "node left");
                self.remove_node(&node).await;
            }
        }
    }

    async fn apply_announcement(
        &self,
        node: &str,
        addr: IpAddr,
        announcement: &PrefixAnnouncement,
    ) {
        let family = AddressFamily::of_addr(&addr);
        let desired: Vec<Route> = announcement
            .local_prefixes
            .iter()
            .chain(&announcement.connector_prefixes)
            .filter(|p| AddressFamily::of(p) == family)
            .filter(|p| {
                // A default route or one covering the sender would hijack
                // the node's own uplink.
                let accepted = p.prefix_len() > 0 && !p.contains(&addr);
                if !accepted {
                    warn!(node = %node, prefix = %p, "rejected announced prefix");
                }
                accepted
            })
            .collect::<HashSet<_>>()
            .into_iter()
            .map(|p| Route::unicast(*p, addr, self.config.table))
            .collect();

        let previous = self.node_routes.lock().remove(node).unwrap_or_default();
        for stale in previous.iter().filter(|r| !desired.contains(r)) {
            if let Err(e) = self.routes.delete_route(stale).await {
                warn!(
                    node = %node,
                    route = %stale,
                    error = %e,
                    "failed to delete propagated route"
                );
            }
        }

        let mut installed = Vec::with_capacity(desired.len());
        for route in desired {
            match self.routes.replace_route(&route).await {
                Ok(()) => installed.push(route),
                Err(e) => {
                    warn!(
                        node = %node,
                        route = %route,
                        error = %e,
                        "failed to install propagated route"
                    );
                }
            }
        }
        debug!(node = %node, routes = installed.len(), "applied prefix announcement");
        self.node_routes.lock().insert(node.to_string(), installed);
    }

    async fn remove_node(&self, node: &str) {
        let routes = self.node_routes.lock().remove(node).unwrap_or_default();
        for route in routes {
            if let Err(e) = self.routes.delete_route(&route).await {
                warn!(
                    node = %node,
                    route = %route,
                    error = %e,
                    "failed to delete propagated route"
                );
            }
        }
    }

    /// Announces periodically and applies events until cancelled.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<MembershipEvent>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.announce().await {
                        warn!(error = %e, "failed to announce prefixes");
                    }
                }
            }
        }
        debug!("prefix propagation stopped");
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    from: String,
    payload: String,
}

/// Settings for [`UdpMembership`].
#[derive(Debug, Clone)]
pub struct UdpMembershipConfig {
    /// Name of this node.
    pub node: String,
    /// Local address to bind.
    pub bind: SocketAddr,
    /// Members to send to.
    pub seeds: Vec<SocketAddr>,
    /// Silence after which a member is considered gone.
    pub member_timeout: Duration,
}

/// Seed list membership over UDP.
///
/// A node joins the view when it is first heard and leaves after
/// `member_timeout` of silence.
pub struct UdpMembership {
    node: String,
    socket: Arc<UdpSocket>,
    seeds: Vec<SocketAddr>,
    member_timeout: Duration,
}

impl UdpMembership {
    /// Binds the membership socket.
    pub async fn bind(config: &UdpMembershipConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind).await?;
        Ok(Self {
            node: config.node.clone(),
            socket: Arc::new(socket),
            seeds: config.seeds.clone(),
            member_timeout: config.member_timeout,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Starts the receive loop and returns its event stream.
    pub fn spawn_receiver(
        &self,
        cancel: CancellationToken,
    ) -> (JoinHandle<()>, mpsc::Receiver<MembershipEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let socket = Arc::clone(&self.socket);
        let local = self.node.clone();
        let timeout = self.member_timeout;

        let handle = tokio::spawn(async move {
            let mut members: HashMap<String, Instant> = HashMap::new();
            let mut sweep = tokio::time::interval((timeout / 2).max(Duration::from_millis(10)));
            let mut buf = vec![0u8; MAX_DATAGRAM];

            loop {
                let events = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, addr)) => receive(&buf[..len], addr, &local, &mut members),
                        Err(e) => {
                            warn!(error = %e, "membership socket error");
                            Vec::new()
                        }
                    },
                    _ = sweep.tick() => expire(&mut members, timeout),
                };

                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            debug!("membership receiver stopped");
        });

        (handle, rx)
    }
}

fn receive(
    data: &[u8],
    addr: SocketAddr,
    local: &str,
    members: &mut HashMap<String, Instant>,
) -> Vec<MembershipEvent> {
    let envelope: Envelope = match serde_json::from_slice(data) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(%addr, error = %e, "dropped malformed envelope");
            return Vec::new();
        }
    };
    if envelope.from == local {
        return Vec::new();
    }

    let mut events = Vec::with_capacity(2);
    if members.insert(envelope.from.clone(), Instant::now()).is_none() {
        events.push(MembershipEvent::Joined {
            node: envelope.from.clone(),
            addr: addr.ip(),
        });
    }
    events.push(MembershipEvent::Message {
        from: envelope.from,
        addr: addr.ip(),
        payload: envelope.payload.into_bytes(),
    });
    events
}

fn expire(members: &mut HashMap<String, Instant>, timeout: Duration) -> Vec<MembershipEvent> {
    let now = Instant::now();
    let gone: Vec<String> = members
        .iter()
        .filter(|(_, seen)| now.duration_since(**seen) > timeout)
        .map(|(node, _)| node.clone())
        .collect();
    gone.into_iter()
        .map(|node| {
            members.remove(&node);
            MembershipEvent::Left { node }
        })
        .collect()
}

impl ClusterMembership for UdpMembership {
    async fn broadcast(&self, payload: &[u8]) -> Result<()> {
        let envelope = Envelope {
            from: self.node.clone(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        };
        let data =
            serde_json::to_vec(&envelope).map_err(|e| RouteError::Membership(e.to_string()))?;
        for seed in &self.seeds {
            if let Err(e) = self.socket.send_to(&data, seed).await {
                warn!(%seed, error = %e, "failed to reach member");
            }
        }
        Ok(())
    }
}

/// Membership that records broadcasts, for tests.
#[derive(Debug, Clone, Default)]
pub struct FakeMembership {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeMembership {
    /// Creates an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads broadcast so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }
}

impl ClusterMembership for FakeMembership {
    async fn broadcast(&self, payload: &[u8]) -> Result<()> {
        self.sent.lock().push(payload.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cni::{CniRouter, CniType};
    use crate::table::{DEFAULT_TABLE, FakeRouteTable};

    type TestPropagator =
        PrefixPropagator<CniRouter<FakeRouteTable>, FakeRouteTable, FakeMembership>;

    fn net(s: &str) -> IpNet {
        s.parse().expect("cidr")
    }

    fn setup() -> (Arc<FakeRouteTable>, FakeMembership, TestPropagator) {
        let table = Arc::new(FakeRouteTable::new());
        table.seed(Route::blackhole(net("10.233.1.0/26"), MAIN_TABLE));
        table.seed(Route::unicast(
            net("10.2.0.0/16"),
            "192.168.0.1".parse().expect("ip"),
            DEFAULT_TABLE,
        ));
        let membership = FakeMembership::new();
        let discovery = Arc::new(CniRouter::new(
            CniType::Calico,
            Arc::clone(&table),
            DEFAULT_TABLE,
        ));
        let config = PropagationConfig {
            node: "node1".to_string(),
            ..PropagationConfig::default()
        };
        let propagator =
            PrefixPropagator::new(config, discovery, Arc::clone(&table), membership.clone());
        (table, membership, propagator)
    }

    fn announcement(node: &str, prefixes: &[&str]) -> Vec<u8> {
        serde_json::to_vec(&PrefixAnnouncement {
            node: node.to_string(),
            local_prefixes: prefixes.iter().map(|p| net(p)).collect(),
            connector_prefixes: Vec::new(),
        })
        .expect("json")
    }

    fn message(from: &str, prefixes: &[&str]) -> MembershipEvent {
        MembershipEvent::Message {
            from: from.to_string(),
            addr: "192.168.0.2".parse().expect("ip"),
            payload: announcement(from, prefixes),
        }
    }

    // ==================== PROPAGATOR TESTS ====================

    #[tokio::test]
    async fn test_announce_serializes_discovered_prefixes() {
        let (_, membership, propagator) = setup();
        propagator.announce().await.expect("announce");

        let sent = membership.sent();
        assert_eq!(sent.len(), 1);
        let decoded: PrefixAnnouncement = serde_json::from_slice(&sent[0]).expect("json");
        assert_eq!(decoded.node, "node1");
        assert_eq!(decoded.local_prefixes, vec![net("10.233.1.0/26")]);
        assert_eq!(decoded.connector_prefixes, vec![net("10.2.0.0/16")]);
    }

    #[tokio::test]
    async fn test_routes_follow_announcements() {
        let (table, _, propagator) = setup();
        propagator
            .handle_event(message("node2", &["10.233.2.0/26", "10.233.3.0/26"]))
            .await;
        assert_eq!(propagator.routes_of("node2").len(), 2);

        propagator.handle_event(message("node2", &["10.233.3.0/26"])).await;
        let routes = propagator.routes_of("node2");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].destination, net("10.233.3.0/26"));
        assert_eq!(routes[0].gateway, Some("192.168.0.2".parse().expect("ip")));
        assert!(
            !table
                .routes_in(MAIN_TABLE)
                .iter()
                .any(|r| r.destination == net("10.233.2.0/26"))
        );
    }

    #[tokio::test]
    async fn test_leave_removes_all_routes_of_node() {
        let (table, _, propagator) = setup();
        propagator.handle_event(message("node2", &["10.233.2.0/26"])).await;

        propagator
            .handle_event(MembershipEvent::Left {
                node: "node2".to_string(),
            })
            .await;

        assert!(propagator.routes_of("node2").is_empty());
        assert_eq!(table.routes_in(MAIN_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_own_and_malformed_messages_are_ignored() {
        let (table, _, propagator) = setup();
        propagator.handle_event(message("node1", &["10.233.9.0/26"])).await;
        propagator
            .handle_event(MembershipEvent::Message {
                from: "node3".to_string(),
                addr: "192.168.0.3".parse().expect("ip"),
                payload: b"garbage".to_vec(),
            })
            .await;

        assert_eq!(table.routes_in(MAIN_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_family_prefixes_are_skipped() {
        let (_, _, propagator) = setup();
        propagator
            .handle_event(message("node2", &["10.233.2.0/26", "fd00:2::/64"]))
            .await;
        assert_eq!(propagator.routes_of("node2").len(), 1);
    }

    #[tokio::test]
    async fn test_default_and_sender_covering_prefixes_are_rejected() {
        let (table, _, propagator) = setup();
        propagator
            .handle_event(message(
                "node2",
                &["0.0.0.0/0", "192.168.0.0/16", "10.233.2.0/26"],
            ))
            .await;

        let routes = propagator.routes_of("node2");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].destination, net("10.233.2.0/26"));
        assert!(
            !table
                .routes_in(MAIN_TABLE)
                .iter()
                .any(|r| r.destination.prefix_len() == 0)
        );
    }

    // ==================== MEMBERSHIP TESTS ====================

    #[test]
    fn test_receive_emits_join_once() {
        let mut members = HashMap::new();
        let addr: SocketAddr = "192.168.0.2:7946".parse().expect("addr");
        let data = serde_json::to_vec(&Envelope {
            from: "node2".to_string(),
            payload: "{}".to_string(),
        })
        .expect("json");

        let first = receive(&data, addr, "node1", &mut members);
        assert!(matches!(first[0], MembershipEvent::Joined { .. }));
        assert_eq!(first.len(), 2);

        let second = receive(&data, addr, "node1", &mut members);
        assert_eq!(second.len(), 1);
        assert!(matches!(second[0], MembershipEvent::Message { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_member_expires() {
        let mut members = HashMap::new();
        members.insert("node2".to_string(), Instant::now());

        assert!(expire(&mut members, Duration::from_secs(30)).is_empty());
        tokio::time::advance(Duration::from_secs(31)).await;

        let events = expire(&mut members, Duration::from_secs(30));
        assert_eq!(
            events,
            vec![MembershipEvent::Left {
                node: "node2".to_string()
            }]
        );
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn test_udp_membership_delivers_messages() {
        let loopback: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let receiver = UdpMembership::bind(&UdpMembershipConfig {
            node: "node1".to_string(),
            bind: loopback,
            seeds: Vec::new(),
            member_timeout: Duration::from_secs(30),
        })
        .await
        .expect("bind receiver");
        let sender = UdpMembership::bind(&UdpMembershipConfig {
            node: "node2".to_string(),
            bind: loopback,
            seeds: vec![receiver.local_addr().expect("addr")],
            member_timeout: Duration::from_secs(30),
        })
        .await
        .expect("bind sender");

        let cancel = CancellationToken::new();
        let (handle, mut events) = receiver.spawn_receiver(cancel.clone());
        sender.broadcast(b"hello").await.expect("broadcast");

        let joined = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("in time")
            .expect("event");
        assert!(matches!(joined, MembershipEvent::Joined { ref node, .. } if node == "node2"));

        let message = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("in time")
            .expect("event");
        assert!(matches!(
            message,
            MembershipEvent::Message { ref payload, .. } if payload == b"hello"
        ));

        cancel.cancel();
        handle.await.expect("no panic");
    }
}
