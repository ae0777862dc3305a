//! Gateway port-mapping seam.
//!
//! Actual traversal backends (UPnP, PCP, NAT-PMP) live outside the core;
//! the runtime only consumes their probe output. The baseline prober
//! reports no gateway methods and no external endpoint, which keeps the
//! `nat-probe` admin command and the connectivity snapshot honest on
//! hosts without a cooperating gateway.

use serde::Serialize;

use box_core::record::Endpoint;

/// What a probe of the local gateway found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    /// Mapping methods the gateway supports, e.g. `pcp`.
    pub methods: Vec<String>,
    /// External endpoint obtained through a mapping, if any.
    pub external: Option<Endpoint>,
    /// Whether an IPv6 socket could be opened locally.
    pub ipv6: bool,
}

pub trait PortMapper: Send + Sync {
    fn probe(&self) -> ProbeReport;
}

/// Baseline prober: no gateway backend compiled in.
pub struct NullMapper;

impl PortMapper for NullMapper {
    fn probe(&self) -> ProbeReport {
        ProbeReport {
            methods: Vec::new(),
            external: None,
            ipv6: ipv6_available(),
        }
    }
}

/// Cheap local IPv6 probe: can we open a v6 socket at all?
pub fn ipv6_available() -> bool {
    std::net::UdpSocket::bind("[::1]:0").is_ok()
}
