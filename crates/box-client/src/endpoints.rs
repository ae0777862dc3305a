//! Endpoint candidate selection.
//!
//! Preference order: the explicit command-line address, then the
//! configured client address, then the root servers in shuffled order,
//! then the loopback fallback. Later duplicates are dropped so each
//! endpoint is attempted at most once.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rand::seq::SliceRandom;

use box_core::config::BoxConfig;
use box_core::options::RuntimeOptions;

/// Build the ordered candidate list for this invocation.
pub fn candidates(options: &RuntimeOptions, config: &BoxConfig) -> Vec<SocketAddr> {
    let port = options.effective_port(config);
    let mut out: Vec<SocketAddr> = Vec::new();

    if let Some(raw) = &options.address {
        push_endpoint(&mut out, raw, port);
    } else if !config.client.address.is_empty() {
        push_endpoint(&mut out, &config.client.address, port);
    }

    let mut roots: Vec<SocketAddr> = config
        .common
        .root_servers
        .iter()
        .filter_map(|raw| parse_endpoint(raw, port))
        .collect();
    roots.shuffle(&mut rand::thread_rng());
    for root in roots {
        if !out.contains(&root) {
            out.push(root);
        }
    }

    let fallback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    if !out.contains(&fallback) {
        out.push(fallback);
    }
    out
}

fn push_endpoint(out: &mut Vec<SocketAddr>, raw: &str, default_port: u16) {
    match parse_endpoint(raw, default_port) {
        Some(endpoint) if !out.contains(&endpoint) => out.push(endpoint),
        Some(_) => {}
        None => tracing::warn!(address = raw, "ignoring unparseable endpoint"),
    }
}

/// Accept `ip:port`, bare `ip`, and bracketed IPv6 forms. Name resolution
/// is deliberately not attempted.
fn parse_endpoint(raw: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(endpoint) = raw.parse::<SocketAddr>() {
        return Some(endpoint);
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        if let Ok(ip) = inner.parse::<IpAddr>() {
            return Some(SocketAddr::new(ip, default_port));
        }
    }
    None
}
