//! RTA overlay node daemon.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 bind/listen
//! failure.

use clap::Parser;
use rtanode::config::{parse_rpc_login, Args, NetConfig};
use rtanode::net::node::{NodeServer, NullPayloadHandler};
use rtanode::net::peerlist::FilePeerlistStore;
use rtanode::rpc;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtanode=info".parse().expect("static directive")),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap renders --help/--version through the error path too.
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(EXIT_CONFIG),
            };
        }
    };

    let config = match NetConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let rpc_login = match args.rpc_login.as_deref().map(parse_rpc_login).transpose() {
        Ok(login) => login,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let credentials = match rpc::resolve_credentials(rpc_login, &config, args.rpc_bind_port) {
        Ok(credentials) => credentials,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if config.no_igd {
        info!("IGD port mapping disabled");
    } else if !config.offline {
        // Port forwarding is requested from the gateway by an external
        // integration; nothing to do here beyond announcing the intent.
        info!(port = config.bind_port, "IGD port mapping requested");
    }

    let store = Arc::new(FilePeerlistStore::new(&config.data_dir));
    let node = match NodeServer::new(config.clone(), Arc::new(NullPayloadHandler), store).await {
        Ok(node) => node,
        Err(e) => {
            error!("failed to create node: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(e) = node.start().await {
        error!("failed to start p2p listener: {e}");
        return ExitCode::from(EXIT_BIND);
    }

    let rpc_addr = SocketAddr::new(args.rpc_bind_ip, args.rpc_bind_port);
    let rpc_listener = match rpc::bind(rpc_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_BIND);
        }
    };
    {
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = rpc::serve(rpc_listener, node, credentials).await {
                error!("admin RPC stopped: {e}");
            }
        });
    }

    // Periodic status line.
    {
        let node = node.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(tokio::time::Duration::from_secs(30));
            tick.tick().await;
            loop {
                tick.tick().await;
                let stats = node.stats().await;
                info!(
                    out = stats.out_connections,
                    inc = stats.in_connections,
                    white = stats.white_size,
                    gray = stats.gray_size,
                    "status"
                );
            }
        });
    }

    info!("node running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.ok();
    node.shutdown().await;
    ExitCode::SUCCESS
}
