//! Argument surface of the `box` binary.
//!
//! A plain scan over the argument list, no parser dependency. The output
//! is either a `RuntimeOptions` for the core, an admin invocation, or an
//! init-config request.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use box_core::config::{LogLevel, LogTarget};
use box_core::options::{ClientAction, Role, RuntimeOptions};

#[derive(Debug)]
pub enum Invocation {
    Run(RuntimeOptions),
    Admin {
        home: Option<PathBuf>,
        command: String,
        args: Vec<String>,
    },
    InitConfig {
        home: Option<PathBuf>,
        config_path: Option<PathBuf>,
    },
    Help,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ArgError(String);

fn bad(message: impl Into<String>) -> ArgError {
    ArgError(message.into())
}

pub fn parse(args: &[String]) -> Result<Invocation, ArgError> {
    // Subcommands come first; everything else is flag-driven.
    match args.first().map(String::as_str) {
        Some("admin") => {
            let command = args
                .get(1)
                .ok_or_else(|| bad("admin requires a command"))?
                .clone();
            return Ok(Invocation::Admin {
                home: home_from_env(),
                command,
                args: args[2..].to_vec(),
            });
        }
        Some("init-config") => {
            let mut config_path = None;
            let mut i = 1;
            while i < args.len() {
                match args[i].as_str() {
                    "--config" => {
                        i += 1;
                        config_path = Some(PathBuf::from(value(args, i, "--config")?));
                    }
                    other => return Err(bad(format!("unknown option: {other}"))),
                }
                i += 1;
            }
            return Ok(Invocation::InitConfig {
                home: home_from_env(),
                config_path,
            });
        }
        Some("help") | Some("--help") | Some("-h") => return Ok(Invocation::Help),
        _ => {}
    }

    let mut options = RuntimeOptions {
        home: home_from_env(),
        ..RuntimeOptions::default()
    };
    let mut put_target: Option<String> = None;
    let mut put_data: Option<Vec<u8>> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--server" => options.role = Role::Server,
            "--address" => {
                i += 1;
                options.address = Some(value(args, i, "--address")?.to_owned());
            }
            "--port" => {
                i += 1;
                options.port = Some(
                    value(args, i, "--port")?
                        .parse()
                        .map_err(|_| bad("--port must be a number"))?,
                );
            }
            "--config" => {
                i += 1;
                options.config_path = Some(PathBuf::from(value(args, i, "--config")?));
            }
            "--log-level" => {
                i += 1;
                options.log_level = Some(
                    value(args, i, "--log-level")?
                        .parse::<LogLevel>()
                        .map_err(|e| bad(e.to_string()))?,
                );
            }
            "--log-target" => {
                i += 1;
                options.log_target = Some(
                    value(args, i, "--log-target")?
                        .parse::<LogTarget>()
                        .map_err(|e| bad(e.to_string()))?,
                );
            }
            "--enable-port-mapping" => options.port_mapping = Some(true),
            "--no-enable-port-mapping" => options.port_mapping = Some(false),
            "--timeout" => {
                i += 1;
                let secs: u64 = value(args, i, "--timeout")?
                    .parse()
                    .map_err(|_| bad("--timeout must be a number of seconds"))?;
                options.timeout = Some(Duration::from_secs(secs));
            }
            "--put" => {
                i += 1;
                put_target = Some(value(args, i, "--put")?.to_owned());
            }
            "--data" => {
                i += 1;
                put_data = Some(value(args, i, "--data")?.as_bytes().to_vec());
            }
            "--get" => {
                i += 1;
                set_action(
                    &mut options,
                    ClientAction::Get {
                        queue: value(args, i, "--get")?.to_owned(),
                    },
                )?;
            }
            "--locate" => {
                i += 1;
                let subject: Uuid = value(args, i, "--locate")?
                    .parse()
                    .map_err(|_| bad("--locate requires a uuid"))?;
                set_action(&mut options, ClientAction::Locate { subject })?;
            }
            "--sync" => {
                i += 1;
                set_action(
                    &mut options,
                    ClientAction::Sync {
                        queue: value(args, i, "--sync")?.to_owned(),
                    },
                )?;
            }
            "--ping" => set_action(&mut options, ClientAction::Ping)?,
            other => return Err(bad(format!("unknown option: {other}"))),
        }
        i += 1;
    }

    if let Some(target) = put_target {
        let data = put_data.ok_or_else(|| bad("--put requires --data"))?;
        let (queue, content_type) = match target.split_once(':') {
            Some((queue, content_type)) => (queue.to_owned(), content_type.to_owned()),
            None => (target, "application/octet-stream".to_owned()),
        };
        set_action(
            &mut options,
            ClientAction::Put {
                queue,
                content_type,
                data,
            },
        )?;
    } else if put_data.is_some() {
        return Err(bad("--data requires --put"));
    }

    if options.role == Role::Server && options.action != ClientAction::Handshake {
        return Err(bad("client actions cannot be combined with --server"));
    }

    Ok(Invocation::Run(options))
}

fn set_action(options: &mut RuntimeOptions, action: ClientAction) -> Result<(), ArgError> {
    if options.action != ClientAction::Handshake {
        return Err(bad("only one client action may be given"));
    }
    options.action = action;
    Ok(())
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, ArgError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| bad(format!("{flag} requires a value")))
}

fn home_from_env() -> Option<PathBuf> {
    std::env::var("BOX_HOME").ok().map(PathBuf::from)
}
