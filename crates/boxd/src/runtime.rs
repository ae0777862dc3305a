//! Runtime controller — daemon lifecycle orchestration.
//!
//! Startup order: configuration → on-disk layout → store (INBOX must
//! provision or we refuse to start) → Location Service → transport →
//! socket bind (IPv6 preferred, IPv4 fallback) → refresh task → admin
//! channel → dispatch loop. Shutdown runs the same list in reverse.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use uuid::Uuid;

use box_core::config::{BoxConfig, BoxPaths};
use box_core::options::{Role, RuntimeOptions};
use box_core::queue::QueuePath;
use box_service::{Dispatcher, LocationService};
use box_store::QueueStore;

use crate::admin::{self, AdminState};
use crate::logging;
use crate::nat::{self, NullMapper, PortMapper};
use crate::refresh::{self, Presence};
use crate::transport::Transport;
use crate::{build_id, transport};

/// A running daemon. Dropping it does not stop the tasks; call
/// [`Runtime::shutdown`].
pub struct Runtime {
    pub local_addr: SocketAddr,
    pub admin_socket: Option<PathBuf>,
    pub node_uuid: Uuid,
    pub user_uuid: Uuid,
    pub store: Arc<QueueStore>,
    pub location: Arc<LocationService>,
    refresh_task: JoinHandle<()>,
    admin_task: Option<JoinHandle<()>>,
    dispatch_task: JoinHandle<()>,
}

impl Runtime {
    /// Bring the daemon up. Fails (and the process should exit non-zero)
    /// on any startup contract violation: unreadable configuration, no
    /// INBOX, no bindable socket.
    pub async fn start(options: RuntimeOptions) -> Result<Self> {
        let paths = BoxPaths::new(
            options
                .home
                .clone()
                .unwrap_or_else(BoxPaths::default_root),
        );
        let config_path = options
            .config_path
            .clone()
            .unwrap_or_else(|| paths.config_file());
        let config = BoxConfig::load_or_init(&config_path)
            .with_context(|| format!("loading configuration from {}", config_path.display()))?;

        let log = logging::init(
            options.effective_log_level(&config),
            options.effective_log_target(&config),
        )
        .context("initialising logging")?;

        provision_layout(&paths)?;

        let store = Arc::new(
            QueueStore::open(paths.queues_dir(), config.permanent_queues())
                .context("opening the queue store")?,
        );
        store
            .ensure_queue(&QueuePath::inbox())
            .context("cannot provision INBOX; refusing to start")?;
        store
            .ensure_queue(&QueuePath::whoswho())
            .context("cannot provision whoswho; refusing to start")?;
        let location = Arc::new(LocationService::new(store.clone()));

        let transport = transport::for_config(config.server.transport)
            .context("selecting the transport")?;

        let port = options.effective_port(&config);
        let bind_ip = parse_bind_address(options.address.as_deref())?;
        let socket = bind_udp(bind_ip, port).context("binding the UDP socket")?;
        let local_addr = socket.local_addr().context("reading the bound address")?;
        let socket = Arc::new(socket);

        let node_uuid = config.common.node_uuid;
        let user_uuid = config.common.user_uuid;
        tracing::info!(
            %local_addr,
            node = %node_uuid,
            user = %user_uuid,
            transport = transport.name(),
            "boxd listening"
        );

        // Presence: publish now, then keep refreshing.
        let mapper: Arc<dyn PortMapper> = Arc::new(NullMapper);
        let mapping = options.port_mapping_preference(&config);
        let external = if mapping.enabled {
            mapper.probe().external
        } else {
            None
        };
        let presence = Presence {
            node_uuid,
            user_uuid,
            bound: local_addr,
            configured: None,
            port_mapping: mapping,
            ipv6: nat::ipv6_available(),
            external,
            since: Utc::now().timestamp_millis(),
        };
        let refresh_task = tokio::spawn(refresh::refresh_loop(location.clone(), presence));

        let admin_state = AdminState {
            started_at: Instant::now(),
            bound: local_addr,
            node_uuid,
            user_uuid,
            transport: transport.name(),
            config_path,
            store: store.clone(),
            location: location.clone(),
            log,
            mapper,
            reload_count: Arc::new(AtomicU64::new(0)),
            last_reload: Arc::new(Mutex::new(String::new())),
        };
        let (admin_task, admin_socket) = if config.server.admin_channel {
            let path = paths.admin_socket();
            let listener = admin::bind_socket(&path)
                .with_context(|| format!("binding admin socket at {}", path.display()))?;
            tracing::info!(path = %path.display(), "admin channel listening");
            (
                Some(tokio::spawn(admin::serve(listener, admin_state))),
                Some(path),
            )
        } else {
            (None, None)
        };

        let dispatcher = Dispatcher::new(
            store.clone(),
            location.clone(),
            node_uuid,
            user_uuid,
            build_id(),
        );
        let dispatch_task = tokio::spawn(dispatch_loop(socket, transport, dispatcher));

        Ok(Self {
            local_addr,
            admin_socket,
            node_uuid,
            user_uuid,
            store,
            location,
            refresh_task,
            admin_task,
            dispatch_task,
        })
    }

    /// Stop in reverse lifecycle order: refresh, admin, dispatch. The
    /// store has no buffered state to flush; dropping it releases the
    /// remaining resources.
    pub async fn shutdown(self) {
        self.refresh_task.abort();
        let _ = self.refresh_task.await;
        if let Some(admin_task) = self.admin_task {
            admin_task.abort();
            let _ = admin_task.await;
        }
        if let Some(path) = &self.admin_socket {
            let _ = std::fs::remove_file(path);
        }
        self.dispatch_task.abort();
        let _ = self.dispatch_task.await;
        tracing::info!("boxd stopped");
    }
}

/// Run the daemon until interrupted.
pub async fn run(options: RuntimeOptions) -> Result<()> {
    debug_assert!(matches!(options.role, Role::Server));
    let runtime = Runtime::start(options).await?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");
    runtime.shutdown().await;
    Ok(())
}

/// Receive datagrams, run them through the transport and dispatcher, and
/// send whatever comes back.
async fn dispatch_loop(
    socket: Arc<UdpSocket>,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, remote) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                continue;
            }
        };
        let plaintext = match transport.open(&buf[..len]) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::debug!(%remote, error = %e, "transport rejected datagram");
                continue;
            }
        };
        for response in dispatcher.handle_datagram(remote, &plaintext) {
            if response.is_empty() {
                continue;
            }
            match transport.seal(response) {
                Ok(sealed) => {
                    if let Err(e) = socket.send_to(&sealed, remote).await {
                        tracing::warn!(%remote, error = %e, "send_to failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(%remote, error = %e, "transport refused to seal response");
                }
            }
        }
    }
}

/// Create the per-user directory layout, everything mode 0700.
fn provision_layout(paths: &BoxPaths) -> Result<()> {
    for dir in [
        paths.root().to_path_buf(),
        paths.keys_dir(),
        paths.logs_dir(),
        paths.run_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("restricting {}", dir.display()))?;
    }
    Ok(())
}

fn parse_bind_address(address: Option<&str>) -> Result<Option<IpAddr>> {
    match address {
        None => Ok(None),
        Some(raw) => raw
            .parse::<IpAddr>()
            .map(Some)
            .with_context(|| format!("not a bindable address: {raw}")),
    }
}

/// Bind the daemon socket. With no explicit address: a dual-stack IPv6
/// wildcard first, the IPv4 wildcard as fallback.
fn bind_udp(ip: Option<IpAddr>, port: u16) -> Result<UdpSocket> {
    let addr = match ip {
        Some(ip) => SocketAddr::new(ip, port),
        None => match bind_at(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)) {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                tracing::debug!(error = %e, "IPv6 bind failed, falling back to IPv4");
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
            }
        },
    };
    bind_at(addr)
}

fn bind_at(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    if addr.is_ipv6() {
        // Dual stack: accept IPv4-mapped peers on the same socket.
        socket.set_only_v6(false).context("IPV6_V6ONLY")?;
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&addr.into()).context("bind()")?;
    UdpSocket::from_std(socket.into()).context("registering socket with the runtime")
}
