pub mod config;
pub mod error;
pub mod net;
pub mod rpc;
pub mod types;

pub use config::{Args, NetConfig};
pub use error::{NetError, Result};
pub use net::{
    FilePeerlistStore, NodeServer, NodeStats, NullPayloadHandler, PayloadHandler, PeerlistStore,
};
pub use types::{now, ConnId, PeerAddress, PeerId};
