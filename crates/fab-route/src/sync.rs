//! Overlay route synchronization.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use fab_tunnel::ConnConfig;
use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::error::{Result, RouteError};
use crate::table::{AddressFamily, Route, RouteTable, parse_cidr};

/// Keeps the overlay table populated with one route per remote subnet.
pub struct RouteSynchronizer<T> {
    routes: Arc<T>,
    table: u32,
}

/// Parses every remote subnet of `connections`, skipping invalid ones.
fn remote_subnets(connections: &[ConnConfig]) -> Vec<IpNet> {
    let mut seen = HashSet::new();
    connections
        .iter()
        .flat_map(|conn| conn.remote_subnets.iter().map(move |s| (conn, s)))
        .filter_map(|(conn, subnet)| match parse_cidr(subnet) {
            Ok(net) => Some(net.trunc()),
            Err(e) => {
                warn!(conn = %conn.name, error = %e, "skipping remote subnet");
                None
            }
        })
        .filter(|net| seen.insert(*net))
        .collect()
}

impl<T: RouteTable> RouteSynchronizer<T> {
    /// Creates a synchronizer for `table`.
    pub fn new(routes: Arc<T>, table: u32) -> Self {
        Self { routes, table }
    }

    /// Table this synchronizer owns.
    pub fn table(&self) -> u32 {
        self.table
    }

    async fn gateway(&self, family: AddressFamily) -> Result<IpAddr> {
        self.routes
            .default_gateway(family)
            .await?
            .ok_or_else(|| RouteError::NoDefaultGateway(family.to_string()))
    }

    async fn existing_routes(&self) -> Result<Vec<Route>> {
        let mut routes = self.routes.list_routes(self.table, AddressFamily::V4).await?;
        routes.extend(self.routes.list_routes(self.table, AddressFamily::V6).await?);
        Ok(routes)
    }

    /// Converges the table to one route per remote subnet of `connections`.
    ///
    /// Routes outside the whitelist are deleted first. Failures on single
    /// routes are logged and skipped; failing to resolve a gateway aborts.
    pub async fn sync_routes(&self, connections: &[ConnConfig]) -> Result<()> {
        let desired = remote_subnets(connections);
        let needs_v6 = desired.iter().any(|n| AddressFamily::of(n) == AddressFamily::V6);

        let gw4 = self.gateway(AddressFamily::V4).await?;
        let gw6 = if needs_v6 {
            Some(self.gateway(AddressFamily::V6).await?)
        } else {
            None
        };

        let whitelist: HashSet<IpNet> = desired.iter().copied().collect();
        for route in self.existing_routes().await? {
            if whitelist.contains(&route.destination) {
                continue;
            }
            match self.routes.delete_route(&route).await {
                Ok(()) => info!(route = %route, "deleted stale route"),
                Err(e) => warn!(route = %route, error = %e, "failed to delete stale route"),
            }
        }

        for destination in desired {
            let gateway = match AddressFamily::of(&destination) {
                AddressFamily::V4 => gw4,
                AddressFamily::V6 => match gw6 {
                    Some(gw) => gw,
                    None => continue,
                },
            };
            let route = Route::unicast(destination, gateway, self.table);
            match self.routes.replace_route(&route).await {
                Ok(()) => debug!(route = %route, "route in place"),
                Err(e) => warn!(route = %route, error = %e, "failed to install route"),
            }
        }
        Ok(())
    }

    /// Deletes the routes of every known remote subnet.
    pub async fn clean_routes(&self, connections: &[ConnConfig]) -> Result<()> {
        let blacklist: HashSet<IpNet> = remote_subnets(connections).into_iter().collect();
        for route in self.existing_routes().await? {
            if !blacklist.contains(&route.destination) {
                continue;
            }
            match self.routes.delete_route(&route).await {
                Ok(()) => info!(route = %route, "withdrew route"),
                Err(e) => warn!(route = %route, error = %e, "failed to withdraw route"),
            }
        }
        Ok(())
    }

    /// Installs a blackhole route for `cidr`.
    pub async fn ensure_blackhole(&self, cidr: &str) -> Result<()> {
        let route = Route::blackhole(parse_cidr(cidr)?.trunc(), self.table);
        self.routes.add_route(&route).await?;
        debug!(route = %route, "blackhole in place");
        Ok(())
    }

    /// Removes the blackhole route for `cidr`.
    pub async fn remove_blackhole(&self, cidr: &str) -> Result<()> {
        let route = Route::blackhole(parse_cidr(cidr)?.trunc(), self.table);
        self.routes.delete_route(&route).await
    }
}
