//! ICMP Tunnel Server
//!
//! Accepts tunnel connections carried in ICMP Echo Requests and runs one of:
//! - a file service (upload, download, version)
//! - a broadcast chat relay
//!
//! Needs CAP_NET_RAW, and the kernel's own echo replies switched off with
//! `sysctl -w net.ipv4.icmp_echo_ignore_all=1`.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use icmp_tunnel::{
    broker::Broker,
    config::{generate_example_config, Config},
    rpc::RpcServer,
    transport::RawIcmpSocket,
    tunnel::TunnelError,
    Listener,
};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

const ECHO_IGNORE_SYSCTL: &str = "/proc/sys/net/ipv4/icmp_echo_ignore_all";

/// ICMP Tunnel Server - serve files or relay chat over ping traffic
#[derive(Parser, Debug)]
#[command(name = "icmp-server")]
#[command(about = "ICMP Tunnel Server - TCP-like connections over ICMP echo")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration to --config and exit
    #[arg(long)]
    generate_config: bool,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve file uploads and downloads
    Files {
        /// Upload directory (overrides config)
        #[arg(short, long)]
        dir: Option<String>,
    },
    /// Relay chat lines between all connected clients
    Broker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example configuration")?;
        println!("Wrote example configuration to {}", args.config);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    init_logging(
        args.log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );

    let command = args
        .command
        .ok_or_else(|| anyhow!("No command given (use `files` or `broker`)"))?;
    let server_config = config
        .server
        .clone()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    let key = server_config.secret().context("Invalid server key")?;
    if key.is_none() {
        warn!("No password or key configured - traffic is not encrypted");
    }
    check_kernel_echo();

    let socket = RawIcmpSocket::bind(Ipv4Addr::UNSPECIFIED)
        .context("Failed to open raw ICMP socket (are you root?)")?;
    let listener = Listener::bind_with(Arc::new(socket), key.as_deref(), config.tunnel.clone())
        .context("Failed to start listener")?;

    match command {
        Command::Files { dir } => {
            let dir = dir.unwrap_or(server_config.upload_dir);
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create upload directory {}", dir))?;

            info!("Serving files from {}", dir);
            let server = RpcServer::new(&dir);
            run_until_shutdown(&listener, server.serve(&listener)).await
        }
        Command::Broker => {
            info!("Relaying chat messages");
            let broker = Broker::new();
            run_until_shutdown(&listener, broker.serve(&listener)).await
        }
    }
}

fn init_logging(level: &str, format: &str) {
    let builder = tracing_subscriber::fmt().with_env_filter(level);
    if format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

/// Warn when the kernel still answers pings itself
fn check_kernel_echo() {
    match std::fs::read_to_string(ECHO_IGNORE_SYSCTL) {
        Ok(value) if value.trim() == "0" => {
            warn!("Kernel echo replies are enabled; run `sysctl -w net.ipv4.icmp_echo_ignore_all=1`")
        }
        _ => {}
    }
}

async fn run_until_shutdown<F>(listener: &Listener, serve: F) -> Result<()>
where
    F: Future<Output = Result<(), TunnelError>>,
{
    tokio::select! {
        result = serve => result.context("Listener failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down ({} live sessions)", listener.session_count());
            listener.close().context("Failed to close listener")?;
            Ok(())
        }
    }
}
