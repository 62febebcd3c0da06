//! ICMP Tunnel Client
//!
//! Opens a tunnel connection to an ICMP tunnel server and:
//! - uploads or downloads files
//! - queries the server version
//! - chats through a broadcast relay

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use icmp_tunnel::{
    config::{generate_example_config, Config},
    rpc::RpcClient,
    transport::RawIcmpSocket,
    Client, Connection,
};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

const VERSION_TIMEOUT: Duration = Duration::from_secs(30);

/// ICMP Tunnel Client - files and chat over ping traffic
#[derive(Parser, Debug)]
#[command(name = "icmp-client")]
#[command(about = "ICMP Tunnel Client - TCP-like connections over ICMP echo")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration to --config and exit
    #[arg(long)]
    generate_config: bool,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file
    Upload {
        /// File to upload
        file: PathBuf,
    },
    /// Download a file from the server
    Download {
        /// Name of the stored file
        name: String,
        /// Directory to write into
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
    /// Print the server version
    Version,
    /// Chat through a broadcast relay (reads lines from stdin)
    Chat {
        /// Name shown to other users (overrides config)
        #[arg(short, long)]
        nickname: Option<String>,
    },
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
    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_deref().unwrap_or(&config.logging.level))
        .init();

    let command = args
        .command
        .ok_or_else(|| anyhow!("No command given (try --help)"))?;
    let client_config = config
        .client
        .clone()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;

    let server = args.server.unwrap_or_else(|| client_config.server.clone());
    let remote: IpAddr = server
        .parse()
        .with_context(|| format!("Invalid server address: {}", server))?;
    let key = client_config.secret().context("Invalid client key")?;
    if key.is_none() {
        warn!("No password or key configured - traffic is not encrypted");
    }

    let socket = RawIcmpSocket::bind(Ipv4Addr::UNSPECIFIED)
        .context("Failed to open raw ICMP socket (are you root?)")?;
    let client = Client::with_transport(Arc::new(socket), config.tunnel.clone())
        .context("Failed to start client")?;
    let conn = client
        .connect(remote, key.as_deref())
        .with_context(|| format!("Failed to connect to {}", remote))?;
    info!("Tunnel to {} open", remote);

    match command {
        Command::Upload { file } => {
            let mut rpc = RpcClient::new(conn);
            rpc.upload(&file).await.context("Upload failed")?;
            println!("Uploaded {}", file.display());
            rpc.close();
        }
        Command::Download { name, out } => {
            let mut rpc = RpcClient::new(conn);
            let path = rpc.download(&name, &out).await.context("Download failed")?;
            println!("Saved {}", path.display());
            rpc.close();
        }
        Command::Version => {
            let mut rpc = RpcClient::new(conn).with_timeout(VERSION_TIMEOUT);
            let version = rpc.version().await.context("Version request failed")?;
            println!("{}", version);
            rpc.close();
        }
        Command::Chat { nickname } => {
            let nickname = nickname
                .or(client_config.nickname)
                .ok_or_else(|| anyhow!("Must provide a nickname"))?;
            chat(conn, &nickname).await?;
        }
    }

    Ok(())
}

/// Send stdin lines to the relay and print everything it relays back
async fn chat(conn: Connection, nickname: &str) -> Result<()> {
    let incoming = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(conn);
            let mut line = Vec::new();
            while matches!(reader.read_until(b'\n', &mut line).await, Ok(n) if n > 0) {
                println!(">> {}", String::from_utf8_lossy(&line).trim_end());
                line.clear();
            }
            debug!("Relay connection closed");
        })
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                conn.write(format!("[ {} ] >>  {}\n", nickname, line).as_bytes())
                    .context("Connection closed")?;
            }
            _ = conn.closed() => break,
        }
    }

    let _ = conn.close();
    incoming.abort();
    Ok(())
}
