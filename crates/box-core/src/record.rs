//! Location Service record shapes.
//!
//! Two records live in the `whoswho` queue: a node record (one per daemon
//! instance, replaced in place on every refresh) and a user record (a
//! recomputed index of the node UUIDs a user owns). Both are stored as the
//! payload of a [`StoredObject`] whose `schema` metadata names the shape.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema tag for node records.
pub const NODE_SCHEMA: &str = "box.location-service.v1";

/// Schema tag for user records.
pub const USER_SCHEMA: &str = "box.location-service.user.v1";

/// How long a node may miss refreshes before it counts as stale.
/// Two missed 60 s refresh cycles.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(120);

/// Reachability class of an advertised address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressScope {
    Global,
    Lan,
    Loopback,
}

/// Where an advertised address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSource {
    Probe,
    Config,
    Manual,
}

/// One advertised endpoint of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub scope: AddressScope,
    pub source: AddressSource,
}

/// Who decided the port-mapping preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingOrigin {
    Default,
    Cli,
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMappingPreference {
    pub enabled: bool,
    pub origin: MappingOrigin,
}

/// Connectivity snapshot: IPv6 probe result, the port-mapping preference,
/// and whatever the mapping backend reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connectivity {
    pub ipv6: bool,
    pub port_mapping: PortMappingPreference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reachability: Option<String>,
}

/// Presence and connectivity snapshot for a single daemon instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub user_uuid: Uuid,
    pub node_uuid: Uuid,
    pub addresses: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_public_key: Option<String>,
    pub online: bool,
    /// Milliseconds since epoch at which this node came up.
    pub since: i64,
    /// Milliseconds since epoch of the latest refresh.
    pub last_seen: i64,
    pub connectivity: Connectivity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl NodeRecord {
    /// A record is stale once its last refresh is older than `threshold`.
    pub fn is_stale(&self, now_ms: i64, threshold: Duration) -> bool {
        now_ms.saturating_sub(self.last_seen) > threshold.as_millis() as i64
    }
}

/// Sorted index of the node UUIDs one user owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_uuid: Uuid,
    pub node_uuids: Vec<Uuid>,
    /// Milliseconds since epoch at which the index was recomputed.
    pub generated_at: i64,
}

/// Classify an IP address into the scope advertised in node records.
pub fn classify_scope(ip: &IpAddr) -> AddressScope {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() {
                AddressScope::Loopback
            } else if v4.is_private() || v4.is_link_local() || v4.is_unspecified() {
                AddressScope::Lan
            } else {
                AddressScope::Global
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                AddressScope::Loopback
            } else {
                let first = v6.segments()[0];
                // fe80::/10 link-local, fc00::/7 unique-local.
                if first & 0xffc0 == 0xfe80 || first & 0xfe00 == 0xfc00 || v6.is_unspecified() {
                    AddressScope::Lan
                } else {
                    AddressScope::Global
                }
            }
        }
    }
}
