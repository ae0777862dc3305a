//! Box integration test harness.
//!
//! Each test brings up a real daemon in-process on an ephemeral loopback
//! port with its own temporary Box root, then drives it with the real
//! client over UDP and with raw line-delimited JSON over the admin socket.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use box_client::{run_action, ClientError, Outcome};
use box_core::config::BoxConfig;
use box_core::options::{ClientAction, Role, RuntimeOptions};
use box_core::record::{
    classify_scope, AddressSource, Connectivity, Endpoint, MappingOrigin, NodeRecord,
    PortMappingPreference,
};
use boxd::Runtime;

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

// ── Harness ───────────────────────────────────────────────────────────────────

struct TestDaemon {
    /// Owns the Box root; dropping it cleans up.
    home: tempfile::TempDir,
    runtime: Runtime,
    /// A client identity pre-registered in `whoswho`.
    client_node: Uuid,
    client_user: Uuid,
}

impl TestDaemon {
    async fn start() -> Result<Self> {
        Self::start_with(|_| {}).await
    }

    /// Start a daemon after letting the caller edit the configuration.
    async fn start_with(mutate: impl FnOnce(&mut BoxConfig)) -> Result<Self> {
        let home = tempfile::tempdir().context("creating a Box root")?;
        let config_path = home.path().join("config");
        let mut config = BoxConfig::default();
        mutate(&mut config);
        config.save(&config_path).context("writing configuration")?;

        let options = RuntimeOptions {
            role: Role::Server,
            home: Some(home.path().to_path_buf()),
            port: Some(0),
            ..RuntimeOptions::default()
        };
        let runtime = Runtime::start(options).await.context("starting boxd")?;

        // Register a client identity the way a previously-introduced node
        // would appear: with a node record in whoswho.
        let client_node = Uuid::new_v4();
        let client_user = Uuid::new_v4();
        runtime
            .location
            .publish_node(&node_record(client_node, client_user))
            .context("registering the test client")?;

        Ok(Self {
            home,
            runtime,
            client_node,
            client_user,
        })
    }

    /// Loopback endpoint matching the bound socket's family.
    fn endpoint(&self) -> SocketAddr {
        loopback_endpoint(self.runtime.local_addr)
    }

    fn queues_dir(&self) -> std::path::PathBuf {
        self.home.path().join("queues")
    }

    /// Run a client action as the pre-registered identity.
    async fn client(&self, action: ClientAction) -> Result<Outcome, ClientError> {
        run_action(
            action,
            &[self.endpoint()],
            self.client_node,
            self.client_user,
            ATTEMPT_TIMEOUT,
        )
        .await
    }

    /// Run a client action as an identity the daemon has never seen.
    async fn stranger(&self, action: ClientAction) -> Result<Outcome, ClientError> {
        run_action(
            action,
            &[self.endpoint()],
            Uuid::new_v4(),
            Uuid::new_v4(),
            ATTEMPT_TIMEOUT,
        )
        .await
    }

    /// One admin round-trip over the Unix socket.
    async fn admin(&self, command: &str, args: &[&str]) -> Result<Value> {
        let socket_path = self
            .runtime
            .admin_socket
            .clone()
            .context("admin channel disabled")?;
        let stream = tokio::net::UnixStream::connect(&socket_path)
            .await
            .with_context(|| format!("connecting to {}", socket_path.display()))?;
        let (reader, mut writer) = stream.into_split();

        let request = serde_json::json!({ "command": command, "args": args });
        let mut line = request.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;

        let response = BufReader::new(reader)
            .lines()
            .next_line()
            .await?
            .context("daemon closed the admin connection")?;
        serde_json::from_str(&response).context("parsing admin response")
    }

    async fn shutdown(self) {
        self.runtime.shutdown().await;
    }
}

fn node_record(node: Uuid, user: Uuid) -> NodeRecord {
    let ip: IpAddr = "127.0.0.1".parse().unwrap();
    NodeRecord {
        user_uuid: user,
        node_uuid: node,
        addresses: vec![Endpoint {
            ip,
            port: 0,
            scope: classify_scope(&ip),
            source: AddressSource::Manual,
        }],
        node_public_key: None,
        online: true,
        since: 0,
        last_seen: chrono::Utc::now().timestamp_millis(),
        connectivity: Connectivity {
            ipv6: false,
            port_mapping: PortMappingPreference {
                enabled: false,
                origin: MappingOrigin::Default,
            },
            external: None,
            reachability: None,
        },
        tags: None,
    }
}

fn loopback_endpoint(addr: SocketAddr) -> SocketAddr {
    let ip = if addr.ip().is_unspecified() {
        if addr.is_ipv6() {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    } else {
        addr.ip()
    };
    SocketAddr::new(ip, addr.port())
}

fn json_files(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            let mut names: Vec<String> = entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|n| n.ends_with(".json"))
                .collect();
            names.sort();
            names
        }
        Err(_) => Vec::new(),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
//  Handshake & identification
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn handshake_with_a_registered_client() {
    let daemon = TestDaemon::start().await.unwrap();

    let outcome = daemon.client(ClientAction::Handshake).await.unwrap();
    assert_eq!(outcome, Outcome::Handshake);

    daemon.shutdown().await;
}

#[tokio::test]
async fn ping_returns_the_build_identification() {
    let daemon = TestDaemon::start().await.unwrap();

    match daemon.client(ClientAction::Ping).await.unwrap() {
        Outcome::Ping { message } => {
            assert!(message.starts_with("boxd/"), "unexpected build id: {message}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn handshake_works_for_strangers_too() {
    // HELLO and the post-HELLO ping are how new nodes introduce
    // themselves, so they are not gated on registration.
    let daemon = TestDaemon::start().await.unwrap();

    let outcome = daemon.stranger(ClientAction::Handshake).await.unwrap();
    assert_eq!(outcome, Outcome::Handshake);

    daemon.shutdown().await;
}

// ══════════════════════════════════════════════════════════════════════════════
//  PUT / GET / DELETE / SEARCH
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn put_then_get_on_an_ephemeral_queue() {
    let daemon = TestDaemon::start().await.unwrap();
    let demo = daemon.queues_dir().join("demo");

    let outcome = daemon
        .client(ClientAction::Put {
            queue: "/demo".into(),
            content_type: "text/plain".into(),
            data: b"Hello".to_vec(),
        })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::PutAck);
    assert_eq!(json_files(&demo).len(), 1, "object file missing on disk");

    match daemon
        .client(ClientAction::Get {
            queue: "/demo".into(),
        })
        .await
        .unwrap()
    {
        Outcome::Got {
            queue,
            content_type,
            data,
        } => {
            assert_eq!(queue, "demo");
            assert_eq!(content_type, "text/plain");
            assert_eq!(data, b"Hello");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // Ephemeral: the GET consumed the object.
    assert!(json_files(&demo).is_empty(), "queue should be empty again");
    match daemon
        .client(ClientAction::Get {
            queue: "/demo".into(),
        })
        .await
    {
        Err(ClientError::Remote { status, .. }) => {
            assert_eq!(status, box_core::wire::StatusCode::NotFound);
        }
        other => panic!("expected notFound, got {other:?}"),
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn permanent_queue_get_is_idempotent() {
    let daemon = TestDaemon::start_with(|config| {
        config.server.permanent_queues = vec!["journal".into()];
    })
    .await
    .unwrap();

    daemon
        .client(ClientAction::Put {
            queue: "journal".into(),
            content_type: "text/plain".into(),
            data: b"keep".to_vec(),
        })
        .await
        .unwrap();

    for _ in 0..2 {
        match daemon
            .client(ClientAction::Get {
                queue: "journal".into(),
            })
            .await
            .unwrap()
        {
            Outcome::Got { data, .. } => assert_eq!(data, b"keep"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn sync_streams_the_whole_queue() {
    let daemon = TestDaemon::start().await.unwrap();

    for body in ["one", "two", "three"] {
        daemon
            .client(ClientAction::Put {
                queue: "feed".into(),
                content_type: "text/plain".into(),
                data: body.as_bytes().to_vec(),
            })
            .await
            .unwrap();
    }

    match daemon
        .client(ClientAction::Sync {
            queue: "feed".into(),
        })
        .await
        .unwrap()
    {
        Outcome::Synced { objects } => {
            assert_eq!(objects.len(), 3);
            let bodies: Vec<&[u8]> = objects.iter().map(|o| o.data.as_slice()).collect();
            assert_eq!(bodies, vec![&b"one"[..], &b"two"[..], &b"three"[..]]);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // SEARCH does not consume: the queue still has all three.
    assert_eq!(json_files(&daemon.queues_dir().join("feed")).len(), 3);

    daemon.shutdown().await;
}

#[tokio::test]
async fn zero_length_payloads_are_stored_and_returned() {
    let daemon = TestDaemon::start().await.unwrap();

    daemon
        .client(ClientAction::Put {
            queue: "empty".into(),
            content_type: "application/octet-stream".into(),
            data: Vec::new(),
        })
        .await
        .unwrap();

    match daemon
        .client(ClientAction::Get {
            queue: "empty".into(),
        })
        .await
        .unwrap()
    {
        Outcome::Got { data, .. } => assert!(data.is_empty()),
        other => panic!("unexpected outcome: {other:?}"),
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn malformed_queue_paths_are_rejected() {
    let daemon = TestDaemon::start().await.unwrap();

    match daemon
        .client(ClientAction::Get {
            queue: "a//b".into(),
        })
        .await
    {
        Err(ClientError::Remote { status, .. }) => {
            assert_eq!(status, box_core::wire::StatusCode::BadRequest);
        }
        other => panic!("expected badRequest, got {other:?}"),
    }

    daemon.shutdown().await;
}

// ══════════════════════════════════════════════════════════════════════════════
//  whoswho & LOCATE
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn whoswho_put_updates_the_user_index() {
    let daemon = TestDaemon::start().await.unwrap();

    // The client republishes its own record with a tag.
    let mut record = node_record(daemon.client_node, daemon.client_user);
    record.tags = Some(vec!["laptop".into()]);
    let outcome = daemon
        .client(ClientAction::Put {
            queue: "whoswho".into(),
            content_type: "application/json".into(),
            data: serde_json::to_vec(&record).unwrap(),
        })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::PutAck);

    // Subject-named files for both the node and the user index.
    let whoswho = daemon.queues_dir().join("whoswho");
    let files = json_files(&whoswho);
    assert!(files.contains(&format!("{}.json", daemon.client_node)));
    assert!(files.contains(&format!("{}.json", daemon.client_user)));

    // The index lists the node, sorted and without duplicates.
    let resolution = daemon
        .runtime
        .location
        .resolve_user(daemon.client_user)
        .unwrap();
    assert_eq!(resolution.node_uuids, vec![daemon.client_node]);

    daemon.shutdown().await;
}

#[tokio::test]
async fn whoswho_put_with_a_foreign_subject_is_rejected() {
    let daemon = TestDaemon::start().await.unwrap();

    // Claim somebody else's node uuid.
    let rogue = node_record(Uuid::new_v4(), daemon.client_user);
    match daemon
        .client(ClientAction::Put {
            queue: "whoswho".into(),
            content_type: "application/json".into(),
            data: serde_json::to_vec(&rogue).unwrap(),
        })
        .await
    {
        Err(ClientError::Remote { status, .. }) => {
            assert_eq!(status, box_core::wire::StatusCode::BadRequest);
        }
        other => panic!("expected badRequest, got {other:?}"),
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn locate_resolves_nodes_and_users() {
    let daemon = TestDaemon::start().await.unwrap();

    // Node subject.
    match daemon
        .client(ClientAction::Locate {
            subject: daemon.client_node,
        })
        .await
        .unwrap()
    {
        Outcome::Located { body } => {
            assert_eq!(body["node_uuid"], daemon.client_node.to_string());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // User subject: the index plus the records behind it.
    match daemon
        .client(ClientAction::Locate {
            subject: daemon.client_user,
        })
        .await
        .unwrap()
    {
        Outcome::Located { body } => {
            assert_eq!(body["user_uuid"], daemon.client_user.to_string());
            assert_eq!(body["node_uuids"][0], daemon.client_node.to_string());
            assert_eq!(
                body["records"][0]["node_uuid"],
                daemon.client_node.to_string()
            );
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn unauthorized_locate_discloses_nothing() {
    let daemon = TestDaemon::start().await.unwrap();

    // The subject exists, but the caller is unknown; the answer must not
    // depend on the subject at all.
    for subject in [daemon.client_node, Uuid::new_v4()] {
        match daemon.stranger(ClientAction::Locate { subject }).await {
            Err(ClientError::Remote { status, message }) => {
                assert_eq!(status, box_core::wire::StatusCode::Unauthorized);
                assert!(message.is_empty(), "leaked detail: {message:?}");
            }
            other => panic!("expected unauthorized, got {other:?}"),
        }
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn daemon_publishes_its_own_presence() {
    let daemon = TestDaemon::start().await.unwrap();

    // The refresh loop ticks immediately on startup.
    tokio::time::sleep(Duration::from_millis(300)).await;

    match daemon
        .client(ClientAction::Locate {
            subject: daemon.runtime.node_uuid,
        })
        .await
        .unwrap()
    {
        Outcome::Located { body } => {
            assert_eq!(body["online"], true);
            assert!(body["last_seen"].as_i64().unwrap() > 0);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    daemon.shutdown().await;
}

// ══════════════════════════════════════════════════════════════════════════════
//  Timeouts
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn a_silent_server_times_out() {
    // A bound socket that never answers.
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let endpoint = silent.local_addr().unwrap();

    let error = run_action(
        ClientAction::Handshake,
        &[endpoint],
        Uuid::new_v4(),
        Uuid::new_v4(),
        Duration::from_millis(300),
    )
    .await
    .unwrap_err();

    assert!(matches!(error, ClientError::Timeout(_)), "got {error:?}");
}

// ══════════════════════════════════════════════════════════════════════════════
//  Admin channel
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn admin_ping_pongs() {
    let daemon = TestDaemon::start().await.unwrap();

    let response = daemon.admin("ping", &[]).await.unwrap();
    assert_eq!(response["status"], "ok");
    assert_eq!(response["message"], "pong");

    daemon.shutdown().await;
}

#[tokio::test]
async fn admin_status_reports_identity_and_queues() {
    let daemon = TestDaemon::start().await.unwrap();

    let response = daemon.admin("status", &[]).await.unwrap();
    assert_eq!(response["status"], "ok");
    assert_eq!(
        response["node_uuid"],
        daemon.runtime.node_uuid.to_string()
    );
    assert_eq!(response["port"], daemon.runtime.local_addr.port());
    assert_eq!(response["transport"], "clear");
    // INBOX and whoswho are provisioned at startup.
    assert!(response["queues"]["queue_count"].as_u64().unwrap() >= 2);

    daemon.shutdown().await;
}

#[tokio::test]
async fn admin_log_target_switch_survives_into_status() {
    let daemon = TestDaemon::start().await.unwrap();
    let log_path = daemon.home.path().join("logs").join("box.log");
    let target = format!("file:{}", log_path.display());

    let response = daemon.admin("log-target", &[&target]).await.unwrap();
    assert_eq!(response["status"], "ok");

    let response = daemon.admin("status", &[]).await.unwrap();
    assert_eq!(response["log_target"], target);

    daemon.shutdown().await;
}

#[tokio::test]
async fn admin_reload_config_updates_stats() {
    let daemon = TestDaemon::start().await.unwrap();

    let response = daemon.admin("reload-config", &[]).await.unwrap();
    assert_eq!(response["status"], "ok");

    let stats = daemon.admin("stats", &[]).await.unwrap();
    assert_eq!(stats["status"], "ok");
    assert_eq!(stats["reload_count"], 1);
    assert_eq!(stats["last_reload"], "ok");
    assert!(stats["object_count"].is_number());

    daemon.shutdown().await;
}

#[tokio::test]
async fn admin_locate_and_summary() {
    let daemon = TestDaemon::start().await.unwrap();

    let response = daemon
        .admin("locate", &[&daemon.client_node.to_string()])
        .await
        .unwrap();
    assert_eq!(response["status"], "ok");
    assert_eq!(response["kind"], "node");

    let summary = daemon.admin("location-summary", &[]).await.unwrap();
    assert_eq!(summary["status"], "ok");
    // The pre-registered client, plus the daemon once its first refresh ran.
    assert!(summary["total_nodes"].as_u64().unwrap() >= 1);
    assert!(summary["stale_nodes"].as_array().unwrap().is_empty());

    daemon.shutdown().await;
}

#[tokio::test]
async fn admin_socket_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let daemon = TestDaemon::start().await.unwrap();
    let socket_path = daemon.runtime.admin_socket.clone().unwrap();

    let mode = std::fs::metadata(&socket_path)
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);

    daemon.shutdown().await;
}

#[tokio::test]
async fn admin_channel_can_be_disabled() {
    let daemon = TestDaemon::start_with(|config| {
        config.server.admin_channel = false;
    })
    .await
    .unwrap();

    assert!(daemon.runtime.admin_socket.is_none());
    assert!(daemon.admin("ping", &[]).await.is_err());

    daemon.shutdown().await;
}

// ══════════════════════════════════════════════════════════════════════════════
//  Restart behaviour
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stored_objects_survive_a_restart() {
    let home = tempfile::tempdir().unwrap();
    let options = || RuntimeOptions {
        role: Role::Server,
        home: Some(home.path().to_path_buf()),
        port: Some(0),
        ..RuntimeOptions::default()
    };

    let first = Runtime::start(options()).await.unwrap();
    let client_node = Uuid::new_v4();
    let client_user = Uuid::new_v4();
    first
        .location
        .publish_node(&node_record(client_node, client_user))
        .unwrap();

    let endpoint = |runtime: &Runtime| loopback_endpoint(runtime.local_addr);
    run_action(
        ClientAction::Put {
            queue: "mail".into(),
            content_type: "text/plain".into(),
            data: b"persisted".to_vec(),
        },
        &[endpoint(&first)],
        client_node,
        client_user,
        ATTEMPT_TIMEOUT,
    )
    .await
    .unwrap();
    first.shutdown().await;

    let second = Runtime::start(options()).await.unwrap();
    let outcome = run_action(
        ClientAction::Get {
            queue: "mail".into(),
        },
        &[endpoint(&second)],
        client_node,
        client_user,
        ATTEMPT_TIMEOUT,
    )
    .await
    .unwrap();
    match outcome {
        Outcome::Got { data, .. } => assert_eq!(data, b"persisted"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    second.shutdown().await;
}
