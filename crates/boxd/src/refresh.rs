//! Periodic presence refresh.
//!
//! Every refresh interval the daemon republishes its own node record with
//! a fresh `last_seen`. Other nodes treat two missed refreshes as the
//! staleness signal, so this loop is what keeps the node visibly alive.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use box_core::record::{
    classify_scope, AddressSource, Connectivity, Endpoint, NodeRecord, PortMappingPreference,
};
use box_service::location::{LocationService, REFRESH_INTERVAL};

/// Everything needed to rebuild the local node record each cycle.
#[derive(Debug, Clone)]
pub struct Presence {
    pub node_uuid: Uuid,
    pub user_uuid: Uuid,
    pub bound: SocketAddr,
    /// Extra address from configuration, advertised alongside the bound one.
    pub configured: Option<IpAddr>,
    pub port_mapping: PortMappingPreference,
    pub ipv6: bool,
    pub external: Option<Endpoint>,
    /// Millisecond timestamp of daemon startup.
    pub since: i64,
}

impl Presence {
    /// The node record as of `now`.
    pub fn record_at(&self, now_ms: i64) -> NodeRecord {
        let mut addresses = Vec::new();

        let bound_ip = if self.bound.ip().is_unspecified() {
            // A wildcard bind advertises loopback; LAN/global reachability
            // comes from the configured address or the mapping backend.
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.bound.ip()
        };
        addresses.push(Endpoint {
            ip: bound_ip,
            port: self.bound.port(),
            scope: classify_scope(&bound_ip),
            source: AddressSource::Probe,
        });

        if let Some(ip) = self.configured {
            if ip != bound_ip {
                addresses.push(Endpoint {
                    ip,
                    port: self.bound.port(),
                    scope: classify_scope(&ip),
                    source: AddressSource::Config,
                });
            }
        }

        NodeRecord {
            user_uuid: self.user_uuid,
            node_uuid: self.node_uuid,
            addresses,
            node_public_key: None,
            online: true,
            since: self.since,
            last_seen: now_ms,
            connectivity: Connectivity {
                ipv6: self.ipv6,
                port_mapping: self.port_mapping,
                external: self.external.clone(),
                reachability: None,
            },
            tags: None,
        }
    }
}

/// Republish the local node record forever. Cancel by aborting the task.
pub async fn refresh_loop(location: Arc<LocationService>, presence: Presence) {
    let mut interval = tokio::time::interval(REFRESH_INTERVAL);
    // The immediate first tick re-publishes right after startup.
    loop {
        interval.tick().await;
        let record = presence.record_at(Utc::now().timestamp_millis());
        match location.publish_node(&record) {
            Ok(()) => {
                tracing::debug!(node = %record.node_uuid, last_seen = record.last_seen, "presence refreshed");
            }
            Err(e) => {
                tracing::warn!(error = %e, "presence refresh failed");
            }
        }
    }
}
