//! Admin HTTP RPC: supernode registration, RTA routes, broadcasts.
//!
//! Authentication is HTTP Basic. When no credentials are configured a
//! 16-byte random password is generated at startup and written to
//! `graft-supernode.<port>.login` with user-only read permissions, so
//! co-located supernode daemons can pick it up.

use crate::config::NetConfig;
use crate::error::{NetError, Result};
use crate::net::node::NodeServer;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_RPC_USER: &str = "supernode";

#[derive(Clone)]
struct RpcState {
    node: NodeServer,
    /// `user:password` the Authorization header must match.
    auth: Arc<String>,
}

/// Resolve the Basic-auth credentials: the configured pair, or a fresh
/// random password persisted to the login cookie file.
pub fn resolve_credentials(
    configured: Option<(String, String)>,
    config: &NetConfig,
    rpc_port: u16,
) -> Result<(String, String)> {
    if let Some(pair) = configured {
        return Ok(pair);
    }
    let mut secret = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut secret);
    let password = BASE64.encode(secret);

    let path = config
        .data_dir
        .join(format!("graft-supernode.{rpc_port}.login"));
    write_private_file(&path, &format!("{DEFAULT_RPC_USER}:{password}"))?;
    info!("RPC username/password is stored in file {}", path.display());
    Ok((DEFAULT_RPC_USER.to_string(), password))
}

/// Create the file readable by the owner only before writing the secret.
fn write_private_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| NetError::Config(format!("creating {}: {e}", parent.display())))?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| NetError::Config(format!("creating {}: {e}", path.display())))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| NetError::Config(format!("writing {}: {e}", path.display())))
}

/// Bind the RPC listener. Failing to bind is a listen failure, distinct
/// from configuration errors.
pub async fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| NetError::Transport(format!("rpc bind {addr}: {e}")))
}

/// Serve the admin API until the process exits.
pub async fn serve(
    listener: tokio::net::TcpListener,
    node: NodeServer,
    credentials: (String, String),
) -> Result<()> {
    let state = RpcState {
        node,
        auth: Arc::new(format!("{}:{}", credentials.0, credentials.1)),
    };
    let app = Router::new()
        .route("/register_supernode", post(register_supernode))
        .route("/add_rta_route", post(add_rta_route))
        .route("/broadcast", post(broadcast))
        .with_state(state);

    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "admin RPC listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| NetError::Transport(format!("rpc server: {e}")))
}

fn authorized(state: &RpcState, headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    decoded == state.auth.as_bytes()
}

#[derive(Debug, Serialize)]
struct RpcReply {
    status: String,
}

impl RpcReply {
    fn ok() -> (StatusCode, Json<RpcReply>) {
        (StatusCode::OK, Json(RpcReply { status: "OK".into() }))
    }

    fn error(code: StatusCode, message: impl Into<String>) -> (StatusCode, Json<RpcReply>) {
        (code, Json(RpcReply { status: message.into() }))
    }

    fn unauthorized() -> (StatusCode, Json<RpcReply>) {
        Self::error(StatusCode::UNAUTHORIZED, "unauthorized")
    }
}

#[derive(Debug, Deserialize)]
struct RegisterSupernodeRequest {
    supernode_id: String,
    supernode_url: String,
    #[serde(default)]
    redirect_uri: String,
    redirect_timeout_ms: u64,
}

async fn register_supernode(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<RegisterSupernodeRequest>,
) -> (StatusCode, Json<RpcReply>) {
    if !authorized(&state, &headers) {
        return RpcReply::unauthorized();
    }
    match state.node.rta().register_supernode(
        &req.supernode_id,
        &req.supernode_url,
        &req.redirect_uri,
        req.redirect_timeout_ms,
    ) {
        Ok(()) => RpcReply::ok(),
        Err(e) => {
            warn!("register_supernode failed: {e}");
            RpcReply::error(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddRtaRouteRequest {
    recipient_id: String,
    supernode_id: String,
}

async fn add_rta_route(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<AddRtaRouteRequest>,
) -> (StatusCode, Json<RpcReply>) {
    if !authorized(&state, &headers) {
        return RpcReply::unauthorized();
    }
    match state.node.rta().add_route(&req.recipient_id, &req.supernode_id) {
        Ok(()) => RpcReply::ok(),
        Err(e @ NetError::UnknownSupernode(_)) => {
            warn!("add_rta_route failed: {e}");
            RpcReply::error(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => RpcReply::error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    #[serde(default)]
    sender_address: Option<String>,
    #[serde(default)]
    receiver_id: Option<String>,
    data: String,
}

async fn broadcast(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<BroadcastRequest>,
) -> (StatusCode, Json<RpcReply>) {
    if !authorized(&state, &headers) {
        return RpcReply::unauthorized();
    }
    match state
        .node
        .broadcast(req.sender_address, req.receiver_id, req.data.into_bytes())
        .await
    {
        Ok(_posts) => RpcReply::ok(),
        Err(e) => {
            warn!("broadcast failed: {e}");
            RpcReply::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::node::{NodeServer, NullPayloadHandler};
    use crate::net::peerlist::FilePeerlistStore;

    async fn test_state() -> RpcState {
        let mut config = NetConfig::default();
        config.offline = true;
        let dir = std::env::temp_dir().join(format!("rtanode_rpc_{}", rand::random::<u32>()));
        let node = NodeServer::new(
            config,
            Arc::new(NullPayloadHandler),
            Arc::new(FilePeerlistStore::new(&dir)),
        )
        .await
        .unwrap();
        RpcState {
            node,
            auth: Arc::new("user:pass".to_string()),
        }
    }

    #[tokio::test]
    async fn basic_auth_accepts_exact_credentials() {
        let state = test_state().await;
        let mut headers = HeaderMap::new();
        assert!(!authorized(&state, &headers));

        let token = BASE64.encode(b"user:pass");
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {token}").parse().unwrap(),
        );
        assert!(authorized(&state, &headers));

        let wrong = BASE64.encode(b"user:wrong");
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {wrong}").parse().unwrap(),
        );
        assert!(!authorized(&state, &headers));
    }

    #[tokio::test]
    async fn generated_credentials_land_in_login_file() {
        let dir = std::env::temp_dir().join(format!("rtanode_login_{}", rand::random::<u32>()));
        let mut config = NetConfig::default();
        config.data_dir = dir.clone();

        let (user, password) = resolve_credentials(None, &config, 28681).unwrap();
        assert_eq!(user, DEFAULT_RPC_USER);

        let path = dir.join("graft-supernode.28681.login");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, format!("{user}:{password}"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn configured_credentials_skip_the_login_file() {
        let dir = std::env::temp_dir().join(format!("rtanode_login2_{}", rand::random::<u32>()));
        let mut config = NetConfig::default();
        config.data_dir = dir.clone();

        let creds = Some(("admin".to_string(), "secret".to_string()));
        let (user, password) = resolve_credentials(creds, &config, 28681).unwrap();
        assert_eq!((user.as_str(), password.as_str()), ("admin", "secret"));
        assert!(!dir.join("graft-supernode.28681.login").exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
