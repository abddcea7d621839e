//! CNI-specific prefix discovery.
//!
//! Each network plugin exposes the pod prefixes of a node differently. Both
//! strategies are pure reads of kernel state.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::table::{AddressFamily, MAIN_TABLE, RouteKind, RouteTable};

/// Default bridge device of flannel.
pub const FLANNEL_BRIDGE: &str = "cni0";

/// Supported network plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CniType {
    /// Calico: per node IPAM blocks appear as blackhole routes.
    Calico,
    /// Flannel: the node's pod subnet is assigned to the bridge.
    Flannel,
}

impl fmt::Display for CniType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Calico => write!(f, "calico"),
            Self::Flannel => write!(f, "flannel"),
        }
    }
}

impl FromStr for CniType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "calico" => Ok(Self::Calico),
            "flannel" => Ok(Self::Flannel),
            other => Err(format!("unsupported CNI type '{other}'")),
        }
    }
}

/// Discovers the prefixes a node owns and the ones it reaches via tunnels.
pub trait PrefixDiscovery: Send + Sync {
    /// Pod prefixes hosted on this node.
    fn local_prefixes(&self) -> impl Future<Output = Result<Vec<IpNet>>> + Send;

    /// Prefixes already routed through the overlay table.
    fn connector_prefixes(&self) -> impl Future<Output = Result<Vec<IpNet>>> + Send;
}

async fn table_destinations<T: RouteTable>(
    routes: &T,
    table: u32,
    kind: Option<RouteKind>,
) -> Result<Vec<IpNet>> {
    let mut prefixes = Vec::new();
    for family in [AddressFamily::V4, AddressFamily::V6] {
        prefixes.extend(
            routes
                .list_routes(table, family)
                .await?
                .into_iter()
                .filter(|r| kind.is_none_or(|k| r.kind == k))
                .map(|r| r.destination),
        );
    }
    Ok(prefixes)
}

/// Calico prefix discovery.
pub struct CalicoDiscovery<T> {
    routes: Arc<T>,
    table: u32,
}

impl<T: RouteTable> PrefixDiscovery for CalicoDiscovery<T> {
    async fn local_prefixes(&self) -> Result<Vec<IpNet>> {
        table_destinations(self.routes.as_ref(), MAIN_TABLE, Some(RouteKind::Blackhole)).await
    }

    async fn connector_prefixes(&self) -> Result<Vec<IpNet>> {
        table_destinations(self.routes.as_ref(), self.table, None).await
    }
}

/// Flannel prefix discovery.
pub struct FlannelDiscovery<T> {
    routes: Arc<T>,
    table: u32,
    bridge: String,
}

impl<T: RouteTable> PrefixDiscovery for FlannelDiscovery<T> {
    async fn local_prefixes(&self) -> Result<Vec<IpNet>> {
        self.routes.interface_networks(&self.bridge).await
    }

    async fn connector_prefixes(&self) -> Result<Vec<IpNet>> {
        table_destinations(self.routes.as_ref(), self.table, None).await
    }
}

/// The discovery strategy for the configured plugin.
pub enum CniRouter<T> {
    /// Calico strategy.
    Calico(CalicoDiscovery<T>),
    /// Flannel strategy.
    Flannel(FlannelDiscovery<T>),
}

impl<T: RouteTable> CniRouter<T> {
    /// Selects the strategy for `cni`, reading overlay routes from `table`.
    pub fn new(cni: CniType, routes: Arc<T>, table: u32) -> Self {
        match cni {
            CniType::Calico => Self::Calico(CalicoDiscovery { routes, table }),
            CniType::Flannel => Self::Flannel(FlannelDiscovery {
                routes,
                table,
                bridge: FLANNEL_BRIDGE.to_string(),
            }),
        }
    }

    /// The plugin this router was built for.
    pub fn cni_type(&self) -> CniType {
        match self {
            Self::Calico(_) => CniType::Calico,
            Self::Flannel(_) => CniType::Flannel,
        }
    }
}

impl<T: RouteTable> PrefixDiscovery for CniRouter<T> {
    async fn local_prefixes(&self) -> Result<Vec<IpNet>> {
        match self {
            Self::Calico(d) => d.local_prefixes().await,
            Self::Flannel(d) => d.local_prefixes().await,
        }
    }

    async fn connector_prefixes(&self) -> Result<Vec<IpNet>> {
        match self {
            Self::Calico(d) => d.connector_prefixes().await,
            Self::Flannel(d) => d.connector_prefixes().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{DEFAULT_TABLE, FakeRouteTable, Route};
    use std::net::IpAddr;

    fn net(s: &str) -> IpNet {
        s.parse().expect("cidr")
    }

    fn fake() -> Arc<FakeRouteTable> {
        let table = FakeRouteTable::new();
        let gw: IpAddr = "192.168.0.1".parse().expect("ip");
        table.seed(Route::blackhole(net("10.233.1.0/26"), MAIN_TABLE));
        table.seed(Route::unicast(net("192.168.10.0/24"), gw, MAIN_TABLE));
        table.seed(Route::unicast(net("10.2.0.0/16"), gw, DEFAULT_TABLE));
        table.seed(Route::unicast(
            net("fd00:2::/64"),
            "fd00::1".parse().expect("ip"),
            DEFAULT_TABLE,
        ));
        table.set_interface_networks(FLANNEL_BRIDGE, vec![net("10.244.1.0/24")]);
        Arc::new(table)
    }

    #[test]
    fn test_cni_type_parsing() {
        assert_eq!("Calico".parse::<CniType>(), Ok(CniType::Calico));
        assert_eq!("flannel".parse::<CniType>(), Ok(CniType::Flannel));
        assert!("weave".parse::<CniType>().is_err());
    }

    #[tokio::test]
    async fn test_calico_local_prefixes_are_blackholes() {
        let router = CniRouter::new(CniType::Calico, fake(), DEFAULT_TABLE);
        assert_eq!(router.local_prefixes().await.expect("local"), vec![net("10.233.1.0/26")]);
    }

    #[tokio::test]
    async fn test_flannel_local_prefixes_come_from_bridge() {
        let router = CniRouter::new(CniType::Flannel, fake(), DEFAULT_TABLE);
        assert_eq!(router.cni_type(), CniType::Flannel);
        assert_eq!(router.local_prefixes().await.expect("local"), vec![net("10.244.1.0/24")]);
    }

    #[tokio::test]
    async fn test_connector_prefixes_read_dedicated_table() {
        for cni in [CniType::Calico, CniType::Flannel] {
            let router = CniRouter::new(cni, fake(), DEFAULT_TABLE);
            assert_eq!(
                router.connector_prefixes().await.expect("connector"),
                vec![net("10.2.0.0/16"), net("fd00:2::/64")]
            );
        }
    }
}
