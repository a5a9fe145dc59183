//! NETCONF CLI binary.
//!
//! # Commands
//!
//! - `serve` - Run a NETCONF server over TCP
//! - `hello` - Connect and show the negotiated session
//! - `rpc` - Send one operation and print the reply

use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use netconf::{
    config::Config,
    dispatch::{handler_fn, OperationOutput, OperationResult},
    protocol::{Message, OperationName, RpcReply},
    transport::{connect, TcpTransport, Transport},
    ClientOptions, NetconfError, NetconfServer, VERSION,
};

#[derive(Parser)]
#[command(name = "netconf")]
#[command(version = VERSION)]
#[command(about = "NETCONF session engine - server and client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: user config dir, then NETCONF_* env)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a NETCONF server over TCP
    Serve {
        /// Listen host
        #[arg(long)]
        host: Option<String>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Connect, exchange hellos and print the negotiated session
    Hello {
        /// Server address (host:port)
        addr: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send one operation and print the reply
    Rpc {
        /// Server address (host:port)
        addr: String,

        /// Operation XML (or - for stdin)
        input: Option<String>,

        /// Read operation XML from file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Reply timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config)?;

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Serve { host, port } => runtime.block_on(cmd_serve(config, host, port)),
        Commands::Hello { addr, json } => runtime.block_on(cmd_hello(config, addr, json)),
        Commands::Rpc {
            addr,
            input,
            file,
            timeout,
        } => {
            let xml = read_input(input, file)?;
            runtime.block_on(cmd_rpc(config, addr, xml, timeout))
        },
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => {
            let config = Config::from_file(path)?.with_env();
            config.validate()?;
            config
        },
        None => Config::load_default()?,
    };
    Ok(config)
}

async fn cmd_serve(mut config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr: SocketAddr = config.server.listen_addr().parse()?;

    let server = NetconfServer::builder(config)
        .with_operation(
            OperationName::base("get"),
            handler_fn(|_req, _prev| async {
                OperationResult::Ok(OperationOutput::Data("<data/>".to_string()))
            }),
        )
        .build()?;

    let transport = TcpTransport::new(addr);
    tracing::info!(
        "Starting NETCONF server {} on {} ({})",
        VERSION,
        transport.listen_addr(),
        transport.name()
    );
    transport.serve(server).await?;
    Ok(())
}

async fn cmd_hello(config: Config, addr: String, json_output: bool) -> anyhow::Result<()> {
    let client = connect(addr.as_str(), ClientOptions::from_config(&config)).await?;

    if json_output {
        let output = serde_json::json!({
            "session_id": client.session_id(),
            "framing": client.framing(),
            "capabilities": client.server_capabilities(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Session:   {}", client.session_id());
        println!("Framing:   {}", client.framing());
        println!("Capabilities ({}):", client.server_capabilities().len());
        for capability in client.server_capabilities() {
            println!("  {}", capability);
        }
    }

    client.close().await?;
    Ok(())
}

async fn cmd_rpc(
    config: Config,
    addr: String,
    xml: String,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let mut options = ClientOptions::from_config(&config);
    if let Some(secs) = timeout {
        options = options.with_request_timeout(Duration::from_secs(secs));
    }
    let client = connect(addr.as_str(), options).await?;

    let outcome = client.rpc(xml.trim()).await;
    client.close().await?;

    match outcome {
        Ok(reply) => {
            println!("{}", Message::RpcReply(reply).to_xml());
            Ok(())
        },
        Err(NetconfError::Rpc(errors)) => {
            let reply = RpcReply::errors(None, errors);
            println!("{}", Message::RpcReply(reply).to_xml());
            anyhow::bail!("server returned rpc-error")
        },
        Err(err) => Err(err.into()),
    }
}

// Helper functions

fn read_input(input: Option<String>, file: Option<PathBuf>) -> anyhow::Result<String> {
    if let Some(path) = file {
        Ok(std::fs::read_to_string(path)?)
    } else if let Some(s) = input {
        if s == "-" {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            Ok(buffer)
        } else {
            Ok(s)
        }
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    }
}
