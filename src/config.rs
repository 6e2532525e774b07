//! CLI surface and runtime configuration

use crate::error::{NetError, Result};
use crate::net::types::{DEFAULT_P2P_PORT, DEFAULT_RPC_PORT};
use crate::types::PeerAddress;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

/// Default transfer-rate limits, kB/s.
pub const DEFAULT_LIMIT_UP_KB: u64 = 2048;
pub const DEFAULT_LIMIT_DOWN_KB: u64 = 8192;

/// Identifier of the production overlay. A node only talks to peers
/// carrying the same id.
pub const MAINNET_NETWORK_ID: [u8; 16] = [
    0x12, 0x30, 0xf1, 0x71, 0x61, 0x04, 0x41, 0x61, 0x17, 0x31, 0x00, 0x82, 0x16, 0xa1, 0xa1,
    0x10,
];

#[derive(Debug, Parser)]
#[command(name = "rtanode", version, about = "RTA overlay node")]
pub struct Args {
    /// Interface for p2p network protocol
    #[arg(long = "p2p-bind-ip", default_value = "0.0.0.0")]
    pub p2p_bind_ip: IpAddr,

    /// Port for p2p network protocol
    #[arg(long = "p2p-bind-port", default_value_t = DEFAULT_P2P_PORT)]
    pub p2p_bind_port: u16,

    /// External port for p2p network protocol (if port forwarding used)
    #[arg(long = "p2p-external-port", default_value_t = 0)]
    pub p2p_external_port: u16,

    /// Manually add peer to local peerlist
    #[arg(long = "add-peer")]
    pub add_peer: Vec<String>,

    /// Specify list of peers to connect to and attempt to keep the connection open
    #[arg(long = "add-priority-node")]
    pub add_priority_node: Vec<String>,

    /// Specify list of peers to connect to only. If this option is given the options
    /// add-priority-node and seed-node are ignored
    #[arg(long = "add-exclusive-node")]
    pub add_exclusive_node: Vec<String>,

    /// Connect to a node to retrieve peer addresses, and disconnect
    #[arg(long = "seed-node")]
    pub seed_node: Vec<String>,

    /// Do not announce yourself as peerlist candidate
    #[arg(long = "hide-my-port")]
    pub hide_my_port: bool,

    /// Disable UPnP port mapping
    #[arg(long = "no-igd")]
    pub no_igd: bool,

    /// Do not listen for peers, nor connect to any
    #[arg(long = "offline")]
    pub offline: bool,

    /// Set max number of outbound peers
    #[arg(long = "out-peers", default_value_t = 8)]
    pub out_peers: usize,

    /// Set max number of inbound peers
    #[arg(long = "in-peers", default_value_t = 64)]
    pub in_peers: usize,

    /// Set TOS flag on p2p sockets
    #[arg(long = "tos-flag")]
    pub tos_flag: Option<u32>,

    /// Set upload limit in kB/s
    #[arg(long = "limit-rate-up")]
    pub limit_rate_up: Option<u64>,

    /// Set download limit in kB/s
    #[arg(long = "limit-rate-down")]
    pub limit_rate_down: Option<u64>,

    /// Set both upload and download limits in kB/s
    #[arg(long = "limit-rate")]
    pub limit_rate: Option<u64>,

    /// Allow local ip addresses to enter the peerlist
    #[arg(long = "allow-local-ip")]
    pub allow_local_ip: bool,

    /// Log connection open/close events for graph analysis
    #[arg(long = "save-graph")]
    pub save_graph: bool,

    /// Interface for the admin RPC
    #[arg(long = "rpc-bind-ip", default_value = "127.0.0.1")]
    pub rpc_bind_ip: IpAddr,

    /// Port for the admin RPC
    #[arg(long = "rpc-bind-port", default_value_t = DEFAULT_RPC_PORT)]
    pub rpc_bind_port: u16,

    /// Admin RPC credentials as user:password. A random password is
    /// generated and written to a login file when unset.
    #[arg(long = "rpc-login")]
    pub rpc_login: Option<String>,

    /// Data directory
    #[arg(long = "data-dir", default_value = "./data")]
    pub data_dir: PathBuf,
}

/// Validated runtime configuration of the p2p layer.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub bind_ip: IpAddr,
    pub bind_port: u16,
    pub external_port: u16,
    pub out_peers: usize,
    pub in_peers: usize,
    pub peers: Vec<PeerAddress>,
    pub priority_peers: Vec<PeerAddress>,
    pub exclusive_peers: Vec<PeerAddress>,
    /// Hostname:port or ip:port; resolved at bootstrap time.
    pub seed_nodes: Vec<String>,
    pub hide_my_port: bool,
    pub no_igd: bool,
    pub offline: bool,
    pub allow_local_ip: bool,
    pub save_graph: bool,
    pub tos_flag: Option<u32>,
    pub limit_rate_up_kb: u64,
    pub limit_rate_down_kb: u64,
    pub rpc_port: Option<u16>,
    pub data_dir: PathBuf,
    pub network_id: [u8; 16],
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0u8, 0, 0, 0]),
            bind_port: DEFAULT_P2P_PORT,
            external_port: 0,
            out_peers: 8,
            in_peers: 64,
            peers: Vec::new(),
            priority_peers: Vec::new(),
            exclusive_peers: Vec::new(),
            seed_nodes: Vec::new(),
            hide_my_port: false,
            no_igd: false,
            offline: false,
            allow_local_ip: false,
            save_graph: false,
            tos_flag: None,
            limit_rate_up_kb: DEFAULT_LIMIT_UP_KB,
            limit_rate_down_kb: DEFAULT_LIMIT_DOWN_KB,
            rpc_port: Some(DEFAULT_RPC_PORT),
            data_dir: PathBuf::from("./data"),
            network_id: MAINNET_NETWORK_ID,
        }
    }
}

impl NetConfig {
    /// Validate the CLI arguments into a runtime config. Any error here
    /// is a configuration error and aborts startup.
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.out_peers == 0 {
            return Err(NetError::Config("--out-peers must be at least 1".into()));
        }
        if !args.add_exclusive_node.is_empty() && !args.add_priority_node.is_empty() {
            tracing::warn!(
                "--add-exclusive-node given; ignoring --add-priority-node and --seed-node"
            );
        }

        let limit_rate_up_kb = args
            .limit_rate
            .or(args.limit_rate_up)
            .unwrap_or(DEFAULT_LIMIT_UP_KB);
        let limit_rate_down_kb = args
            .limit_rate
            .or(args.limit_rate_down)
            .unwrap_or(DEFAULT_LIMIT_DOWN_KB);
        if limit_rate_up_kb == 0 || limit_rate_down_kb == 0 {
            return Err(NetError::Config("rate limits must be positive".into()));
        }

        let exclusive = parse_peers(&args.add_exclusive_node)?;
        let (priority, seeds) = if exclusive.is_empty() {
            (parse_peers(&args.add_priority_node)?, args.seed_node.clone())
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(Self {
            bind_ip: args.p2p_bind_ip,
            bind_port: args.p2p_bind_port,
            external_port: args.p2p_external_port,
            out_peers: args.out_peers,
            in_peers: args.in_peers,
            peers: parse_peers(&args.add_peer)?,
            priority_peers: priority,
            exclusive_peers: exclusive,
            seed_nodes: seeds,
            hide_my_port: args.hide_my_port,
            no_igd: args.no_igd,
            offline: args.offline,
            allow_local_ip: args.allow_local_ip,
            save_graph: args.save_graph,
            tos_flag: args.tos_flag,
            limit_rate_up_kb,
            limit_rate_down_kb,
            rpc_port: Some(args.rpc_bind_port),
            data_dir: args.data_dir.clone(),
            network_id: MAINNET_NETWORK_ID,
        })
    }
}

fn parse_peers(strings: &[String]) -> Result<Vec<PeerAddress>> {
    let mut out = Vec::with_capacity(strings.len());
    for s in strings {
        let adr: PeerAddress = s
            .parse()
            .map_err(|e| NetError::Config(format!("bad peer address {s:?}: {e}")))?;
        out.push(adr);
    }
    Ok(out)
}

/// Parse the `user:password` form of `--rpc-login`.
pub fn parse_rpc_login(value: &str) -> Result<(String, String)> {
    match value.split_once(':') {
        Some((user, pass)) if !user.is_empty() => Ok((user.to_string(), pass.to_string())),
        _ => Err(NetError::Config(
            "--rpc-login must be in user:password form".into(),
        )),
    }
}
