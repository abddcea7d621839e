//! Kernel routing table access.
//!
//! [`RouteTable`] is the seam to the kernel. [`IpRouteTable`] drives
//! iproute2 and parses its JSON output; [`FakeRouteTable`] keeps routes in
//! memory for tests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::trace;

use crate::error::{Result, RouteError};

/// Routing table used for overlay routes.
pub const DEFAULT_TABLE: u32 = 220;

/// The kernel's main routing table.
pub const MAIN_TABLE: u32 = 254;

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl AddressFamily {
    /// Family of a network.
    #[must_use]
    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Self::V4,
            IpNet::V6(_) => Self::V6,
        }
    }

    /// Family of an address.
    #[must_use]
    pub fn of_addr(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    fn flag(self) -> &'static str {
        match self {
            Self::V4 => "-4",
            Self::V6 => "-6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// Route type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    /// Forward via a gateway.
    Unicast,
    /// Silently drop.
    Blackhole,
}

/// A kernel route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    /// Destination network.
    pub destination: IpNet,
    /// Next hop, for unicast routes.
    pub gateway: Option<IpAddr>,
    /// Routing table.
    pub table: u32,
    /// Route type.
    pub kind: RouteKind,
}

impl Route {
    /// A unicast route via `gateway`.
    #[must_use]
    pub fn unicast(destination: IpNet, gateway: IpAddr, table: u32) -> Self {
        Self {
            destination,
            gateway: Some(gateway),
            table,
            kind: RouteKind::Unicast,
        }
    }

    /// A blackhole route.
    #[must_use]
    pub fn blackhole(destination: IpNet, table: u32) -> Self {
        Self {
            destination,
            gateway: None,
            table,
            kind: RouteKind::Blackhole,
        }
    }

    /// Family of the destination.
    #[must_use]
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.destination)
    }

    /// iproute2 arguments after the verb.
    fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(6);
        if self.kind == RouteKind::Blackhole {
            args.push("blackhole".to_string());
        }
        args.push(self.destination.to_string());
        if let Some(gateway) = self.gateway {
            args.push("via".to_string());
            args.push(gateway.to_string());
        }
        args.push("table".to_string());
        args.push(self.table.to_string());
        args
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args().join(" "))
    }
}

/// Parses a CIDR, accepting bare addresses as host routes.
pub fn parse_cidr(value: &str) -> Result<IpNet> {
    let value = value.trim();
    value
        .parse::<IpNet>()
        .or_else(|_| value.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| RouteError::InvalidCidr(value.to_string()))
}

/// Access to kernel routes and addresses.
pub trait RouteTable: Send + Sync {
    /// Routes of one family in `table`.
    fn list_routes(
        &self,
        table: u32,
        family: AddressFamily,
    ) -> impl Future<Output = Result<Vec<Route>>> + Send;

    /// Adds or replaces a route.
    fn replace_route(&self, route: &Route) -> impl Future<Output = Result<()>> + Send;

    /// Adds a route; an existing route counts as success.
    fn add_route(&self, route: &Route) -> impl Future<Output = Result<()>> + Send;

    /// Deletes a route; a missing route counts as success.
    fn delete_route(&self, route: &Route) -> impl Future<Output = Result<()>> + Send;

    /// Gateway of the main default route.
    fn default_gateway(
        &self,
        family: AddressFamily,
    ) -> impl Future<Output = Result<Option<IpAddr>>> + Send;

    /// Networks of the addresses assigned to `device`.
    fn interface_networks(&self, device: &str) -> impl Future<Output = Result<Vec<IpNet>>> + Send;
}

/// [`RouteTable`] over the `ip` command.
#[derive(Debug, Clone, Default)]
pub struct IpRouteTable;

#[derive(Debug, Deserialize)]
struct JsonRoute {
    #[serde(rename = "type")]
    kind: Option<String>,
    dst: String,
    gateway: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonLink {
    #[serde(default)]
    addr_info: Vec<JsonAddr>,
}

#[derive(Debug, Deserialize)]
struct JsonAddr {
    local: Option<String>,
    prefixlen: Option<u8>,
}

impl IpRouteTable {
    /// Creates a route table handle.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn run(args: &[String]) -> Result<std::process::Output> {
        trace!(args = ?args, "ip");
        Ok(Command::new("ip").args(args).output().await?)
    }

    fn failure(args: &[String], output: &std::process::Output) -> RouteError {
        RouteError::Command {
            program: "ip".to_string(),
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    async fn query<T: for<'de> Deserialize<'de>>(args: Vec<String>) -> Result<Vec<T>> {
        let output = Self::run(&args).await?;
        if !output.status.success() {
            return Err(Self::failure(&args, &output));
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&output.stdout).map_err(|e| RouteError::UnexpectedOutput {
            program: "ip".to_string(),
            reason: e.to_string(),
        })
    }

    async fn mutate(verb: &str, route: &Route, tolerated: &str) -> Result<()> {
        let mut args = vec![
            route.family().flag().to_string(),
            "route".to_string(),
            verb.to_string(),
        ];
        args.extend(route.args());

        let output = Self::run(&args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !tolerated.is_empty() && stderr.contains(tolerated) {
            return Ok(());
        }
        Err(Self::failure(&args, &output))
    }
}

fn route_from_json(route: JsonRoute, table: u32) -> Option<Route> {
    if route.dst == "default" {
        return None;
    }
    let destination = parse_cidr(&route.dst).ok()?;
    let kind = match route.kind.as_deref() {
        None | Some("unicast") => RouteKind::Unicast,
        Some("blackhole") => RouteKind::Blackhole,
        Some(_) => return None,
    };
    Some(Route {
        destination,
        gateway: route.gateway.and_then(|g| g.parse().ok()),
        table,
        kind,
    })
}

fn networks_from_json(links: Vec<JsonLink>) -> Vec<IpNet> {
    links
        .into_iter()
        .flat_map(|link| link.addr_info)
        .filter_map(|addr| {
            let local: IpAddr = addr.local?.parse().ok()?;
            IpNet::new(local, addr.prefixlen?).ok().map(|net| net.trunc())
        })
        .collect()
}

impl RouteTable for IpRouteTable {
    async fn list_routes(&self, table: u32, family: AddressFamily) -> Result<Vec<Route>> {
        let args = vec![
            family.flag().to_string(),
            "-j".to_string(),
            "route".to_string(),
            "show".to_string(),
            "table".to_string(),
            table.to_string(),
        ];
        let routes: Vec<JsonRoute> = Self::query(args).await?;
        Ok(routes
            .into_iter()
            .filter_map(|r| route_from_json(r, table))
            .collect())
    }

    async fn replace_route(&self, route: &Route) -> Result<()> {
        Self::mutate("replace", route, "").await
    }

    async fn add_route(&self, route: &Route) -> Result<()> {
        Self::mutate("add", route, "File exists").await
    }

    async fn delete_route(&self, route: &Route) -> Result<()> {
        Self::mutate("del", route, "No such process").await
    }

    async fn default_gateway(&self, family: AddressFamily) -> Result<Option<IpAddr>> {
        let args = vec![
            family.flag().to_string(),
            "-j".to_string(),
            "route".to_string(),
            "show".to_string(),
            "default".to_string(),
        ];
        let routes: Vec<JsonRoute> = Self::query(args).await?;
        Ok(routes
            .into_iter()
            .find_map(|r| r.gateway.and_then(|g| g.parse().ok())))
    }

    async fn interface_networks(&self, device: &str) -> Result<Vec<IpNet>> {
        let args = vec![
            "-j".to_string(),
            "addr".to_string(),
            "show".to_string(),
            "dev".to_string(),
            device.to_string(),
        ];
        Ok(networks_from_json(Self::query(args).await?))
    }
}

#[derive(Debug, Default)]
struct FakeRouteState {
    routes: Vec<Route>,
    gateways: HashMap<AddressFamily, IpAddr>,
    interfaces: HashMap<String, Vec<IpNet>>,
    failing: HashSet<IpNet>,
    replace_calls: usize,
    delete_calls: usize,
}

/// In-memory [`RouteTable`] for tests.
#[derive(Debug, Clone, Default)]
pub struct FakeRouteTable {
    state: Arc<Mutex<FakeRouteState>>,
}

impl FakeRouteTable {
    /// Creates an empty fake table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default gateway of a family.
    pub fn set_default_gateway(&self, gateway: IpAddr) {
        self.state
            .lock()
            .gateways
            .insert(AddressFamily::of_addr(&gateway), gateway);
    }

    /// Assigns networks to a device.
    pub fn set_interface_networks(&self, device: &str, networks: Vec<IpNet>) {
        self.state
            .lock()
            .interfaces
            .insert(device.to_string(), networks);
    }

    /// Inserts a route without counting it as a call.
    pub fn seed(&self, route: Route) {
        self.state.lock().routes.push(route);
    }

    /// Makes mutations of `destination` fail.
    pub fn fail_destination(&self, destination: IpNet) {
        self.state.lock().failing.insert(destination);
    }

    /// All routes in `table`.
    #[must_use]
    pub fn routes_in(&self, table: u32) -> Vec<Route> {
        self.state
            .lock()
            .routes
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect()
    }

    /// Number of replace calls.
    #[must_use]
    pub fn replace_calls(&self) -> usize {
        self.state.lock().replace_calls
    }

    /// Number of delete calls.
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.state.lock().delete_calls
    }

    fn check(state: &FakeRouteState, route: &Route) -> Result<()> {
        if state.failing.contains(&route.destination) {
            return Err(RouteError::Command {
                program: "ip".to_string(),
                args: route.to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

fn same_slot(a: &Route, b: &Route) -> bool {
    a.table == b.table && a.destination == b.destination
}

impl RouteTable for FakeRouteTable {
    async fn list_routes(&self, table: u32, family: AddressFamily) -> Result<Vec<Route>> {
        Ok(self
            .state
            .lock()
            .routes
            .iter()
            .filter(|r| r.table == table && r.family() == family)
            .cloned()
            .collect())
    }

    async fn replace_route(&self, route: &Route) -> Result<()> {
        let mut state = self.state.lock();
        state.replace_calls += 1;
        Self::check(&state, route)?;
        state.routes.retain(|r| !same_slot(r, route));
        state.routes.push(route.clone());
        Ok(())
    }

    async fn add_route(&self, route: &Route) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state, route)?;
        if !state.routes.iter().any(|r| same_slot(r, route)) {
            state.routes.push(route.clone());
        }
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> Result<()> {
        let mut state = self.state.lock();
        state.delete_calls += 1;
        Self::check(&state, route)?;
        state
            .routes
            .retain(|r| !(same_slot(r, route) && r.kind == route.kind));
        Ok(())
    }

    async fn default_gateway(&self, family: AddressFamily) -> Result<Option<IpAddr>> {
        Ok(self.state.lock().gateways.get(&family).copied())
    }

    async fn interface_networks(&self, device: &str) -> Result<Vec<IpNet>> {
        Ok(self
            .state
            .lock()
            .interfaces
            .get(device)
            .cloned()
            .unwrap_or_default())
    }
}
