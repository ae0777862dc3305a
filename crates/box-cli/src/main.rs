//! box — client, daemon, and admin front door in one binary.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use box_client::Outcome;
use box_core::config::{BoxConfig, BoxPaths};
use box_core::options::{Role, RuntimeOptions};

mod args;

use args::Invocation;

fn print_usage() {
    println!("Usage: box [options]");
    println!("       box admin <command> [args...]");
    println!("       box init-config [--config <path>]");
    println!();
    println!("Roles");
    println!("  (default)                       Client: handshake with the server and exit");
    println!("  --server                        Run the daemon");
    println!();
    println!("Client actions");
    println!("  --ping                          Print the server identification string");
    println!("  --put <queue>[:<type>] --data <payload>");
    println!("                                  Store a payload in a queue");
    println!("  --get <queue>                   Fetch (and on ephemeral queues remove) the latest object");
    println!("  --locate <uuid>                 Resolve a node or user uuid");
    println!("  --sync <queue>                  Stream every object in a queue");
    println!();
    println!("Connection");
    println!("  --address <ip>                  Server address (client) or bind address (server)");
    println!("  --port <port>                   UDP port (default: 12567)");
    println!("  --timeout <secs>                Per-attempt timeout (default: 5)");
    println!();
    println!("Configuration");
    println!("  --config <path>                 Alternate configuration file");
    println!("  --log-level <level>             trace|debug|info|warn|error|critical");
    println!("  --log-target <target>           stderr|stdout|file:<path>");
    println!("  --enable-port-mapping / --no-enable-port-mapping");
    println!();
    println!("Admin commands: status ping log-target reload-config stats nat-probe");
    println!("                locate location-summary");
    println!();
    println!("The Box root directory is ~/.box (override with BOX_HOME).");
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match args::parse(&args) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("box: {e}");
            eprintln!();
            print_usage();
            std::process::exit(2);
        }
    };

    let result = match invocation {
        Invocation::Help => {
            print_usage();
            Ok(())
        }
        Invocation::InitConfig { home, config_path } => init_config(home, config_path),
        Invocation::Admin {
            home,
            command,
            args,
        } => admin(home, &command, args).await,
        Invocation::Run(options) => match options.role {
            Role::Server => server(options).await,
            Role::Client => client(options).await,
        },
    };

    if let Err(e) = result {
        eprintln!("box: {e:#}");
        std::process::exit(1);
    }
}

fn resolve_paths(home: Option<std::path::PathBuf>) -> BoxPaths {
    BoxPaths::new(home.unwrap_or_else(BoxPaths::default_root))
}

fn init_config(
    home: Option<std::path::PathBuf>,
    config_path: Option<std::path::PathBuf>,
) -> Result<()> {
    let paths = resolve_paths(home);
    let path = config_path.unwrap_or_else(|| paths.config_file());
    let config = BoxConfig::load_or_init(&path).context("initialising configuration")?;
    println!("configuration: {}", path.display());
    println!("node_uuid:     {}", config.common.node_uuid);
    println!("user_uuid:     {}", config.common.user_uuid);
    Ok(())
}

async fn server(options: RuntimeOptions) -> Result<()> {
    // The daemon manages per-user private data; running it with elevated
    // privileges is always a mistake.
    if unsafe { libc::geteuid() } == 0 && std::env::var_os("BOX_ALLOW_ROOT").is_none() {
        bail!("refusing to run the daemon as root (set BOX_ALLOW_ROOT to override)");
    }
    boxd::runtime::run(options).await
}

async fn client(options: RuntimeOptions) -> Result<()> {
    let paths = resolve_paths(options.home.clone());
    let config_path = options
        .config_path
        .clone()
        .unwrap_or_else(|| paths.config_file());
    let config = BoxConfig::load_or_init(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    let directive = options.effective_log_level(&config).directive();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| directive.to_owned()),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let endpoints = box_client::endpoints::candidates(&options, &config);
    let timeout = options.timeout.unwrap_or(box_client::driver::DEFAULT_TIMEOUT);
    let outcome = box_client::run_action(
        options.action.clone(),
        &endpoints,
        config.common.node_uuid,
        config.common.user_uuid,
        timeout,
    )
    .await?;

    match outcome {
        Outcome::Handshake => println!("handshake ok"),
        Outcome::Ping { message } => println!("{message}"),
        Outcome::PutAck => println!("stored"),
        Outcome::Got {
            queue,
            content_type,
            data,
        } => {
            tracing::info!(queue = %queue, content_type = %content_type, bytes = data.len(), "object received");
            use std::io::Write;
            std::io::stdout().write_all(&data).context("writing object data")?;
            if !data.ends_with(b"\n") {
                println!();
            }
        }
        Outcome::Located { body } => {
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Outcome::Synced { objects } => {
            tracing::info!(count = objects.len(), "sync complete");
            for object in objects {
                println!(
                    "{}: {} ({} bytes)",
                    object.queue,
                    object.content_type,
                    object.data.len()
                );
            }
        }
    }
    Ok(())
}

async fn admin(
    home: Option<std::path::PathBuf>,
    command: &str,
    args: Vec<String>,
) -> Result<()> {
    let paths = resolve_paths(home);
    let socket_path = paths.admin_socket();
    let stream = tokio::net::UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("connecting to the daemon at {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();

    let request = serde_json::json!({ "command": command, "args": args });
    let mut line = request.to_string();
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .context("sending admin request")?;

    let mut lines = BufReader::new(reader).lines();
    let response = lines
        .next_line()
        .await
        .context("reading admin response")?
        .context("daemon closed the admin connection")?;

    let value: serde_json::Value =
        serde_json::from_str(&response).context("parsing admin response")?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    if value.get("status").and_then(|s| s.as_str()) != Some("ok") {
        bail!(
            "{}",
            value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("admin command failed")
        );
    }
    Ok(())
}
