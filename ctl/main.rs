#![forbid(unsafe_code)]

//! `host-relay-ctl`: local CLI companion for `host-relay`.
//!
//! Server commands go over the IPC socket as JSON lines. `connect` opens a
//! client transport of any kind and bridges it to this process's stdio.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};
use tokio::io::{AsyncBufReadExt, BufReader as AsyncBufReader};

use host_relay::config::{ClientConfig, GlobalConfig};
use host_relay::models::transport::TransportState;
use host_relay::transport::info::{SshCredential, DEFAULT_SSH_PORT, DEFAULT_SSH_SUBSYSTEM};
use host_relay::transport::{AckMatcher, ChannelConnectionInfo, RecordCallback, TransportManager};
use host_relay::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "host-relay-ctl",
    about = "Local CLI for host-relay",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "host-relay")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List servers.
    List {
        /// Only servers of this kind: tcp, websocket or named_pipe.
        #[arg(long)]
        kind: Option<String>,
    },

    /// Show live connections of a server.
    Connections {
        /// Server name.
        name: String,
    },

    /// Stop a server.
    Stop {
        /// Server name.
        name: String,
        /// Skip the drain window.
        #[arg(long)]
        force: bool,
    },

    /// Bridge stdin/stdout to a client transport.
    Connect {
        /// Config file supplying client timeouts.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Record sent to close the session when stdin ends.
        #[arg(long)]
        close_frame: Option<String>,
        /// Substring identifying the peer's close acknowledgement.
        #[arg(long)]
        ack: Option<String>,
        #[command(subcommand)]
        target: Target,
    },
}

#[derive(Debug, Subcommand)]
enum Target {
    /// Local child process.
    Subprocess {
        /// Program to run.
        program: String,
        /// Program arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// TCP socket.
    Tcp {
        /// Host.
        host: String,
        /// Port.
        port: u16,
    },
    /// WebSocket URI.
    Websocket {
        /// `ws://` URI.
        uri: String,
    },
    /// Named pipe.
    Pipe {
        /// Bare pipe name.
        name: String,
    },
    /// SSH subsystem.
    Ssh {
        /// Remote host.
        host: String,
        /// Remote port.
        #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
        port: u16,
        /// Login user.
        #[arg(long)]
        user: Option<String>,
        /// Private key file.
        #[arg(long)]
        key: Option<PathBuf>,
        /// Subsystem to run.
        #[arg(long, default_value = DEFAULT_SSH_SUBSYSTEM)]
        subsystem: String,
        /// Open the remote shell instead of a subsystem.
        #[arg(long)]
        shell: bool,
    },
}

fn main() {
    let args = Cli::parse();

    let request_json = match &args.command {
        Command::List { kind } => {
            let mut req = serde_json::json!({ "command": "list" });
            if let Some(k) = kind {
                req["kind"] = serde_json::Value::String(k.clone());
            }
            req
        }
        Command::Connections { name } => {
            serde_json::json!({ "command": "connections", "name": name })
        }
        Command::Stop { name, force } => {
            serde_json::json!({ "command": "stop", "name": name, "force": force })
        }
        Command::Connect {
            config,
            close_frame,
            ack,
            target,
        } => {
            if let Err(err) = run_connect(config.as_deref(), close_frame.clone(), ack.clone(), target) {
                eprintln!("Error: {err}");
                std::process::exit(1);
            }
            return;
        }
    };

    let ipc_name = &args.ipc_name;

    match send_ipc_command(ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is host-relay running with ipc_name '{ipc_name}'?");
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}

fn target_info(target: &Target) -> Result<ChannelConnectionInfo> {
    match target {
        Target::Subprocess { program, args } => {
            ChannelConnectionInfo::subprocess(program.clone(), args.clone())
        }
        Target::Tcp { host, port } => ChannelConnectionInfo::tcp(host.clone(), *port),
        Target::Websocket { uri } => ChannelConnectionInfo::websocket(uri.clone()),
        Target::Pipe { name } => ChannelConnectionInfo::named_pipe(name.clone()),
        Target::Ssh {
            host,
            port,
            user,
            key,
            subsystem,
            shell,
        } => {
            let mut info = ChannelConnectionInfo::ssh(host.clone())?;
            if let ChannelConnectionInfo::Ssh(ssh) = &mut info {
                ssh.port = *port;
                ssh.user.clone_from(user);
                if let Some(key) = key {
                    ssh.credential = SshCredential::KeyFile(key.clone());
                }
                ssh.subsystem = (!shell).then(|| subsystem.clone());
            }
            info.validate()?;
            Ok(info)
        }
    }
}

fn run_connect(
    config: Option<&std::path::Path>,
    close_frame: Option<String>,
    ack: Option<String>,
    target: &Target,
) -> Result<()> {
    let client = match config {
        Some(path) => GlobalConfig::load_from_path(path)?.client,
        None => ClientConfig::default(),
    };
    let info = target_info(target)?;
    let options = client.transport_options(&info);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(async move {
            let on_record: RecordCallback = Arc::new(|record: &str| {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{record}");
                let _ = out.flush();
            });
            let manager = TransportManager::connect(&info, options, on_record).await?;

            let mut lines = AsyncBufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    state = manager.wait_for_state(TransportState::Closed) => {
                        return match manager.last_error() {
                            Some(err) if state == TransportState::Broken => Err(err),
                            _ => Ok(()),
                        };
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => manager.send(&line).await?,
                        Ok(None) => break,
                        Err(err) => return Err(AppError::Io(format!("stdin read failed: {err}"))),
                    }
                }
            }

            match close_frame {
                Some(frame) => {
                    let matcher: Option<AckMatcher> = ack.map(|needle| {
                        Box::new(move |record: &str| record.contains(&needle)) as AckMatcher
                    });
                    manager.request_close(Some(&frame), matcher).await
                }
                None => {
                    manager.cleanup().await;
                    Ok(())
                }
            }
        })
}
