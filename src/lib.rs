//! ChainSync - a hash-chained ledger replicated between peers
//!
//! A [`Ledger`] holds an append-only chain of [`Block`]s, each bound to its
//! predecessor by a SHA-256 digest. A [`SyncNode`] serves its chain to peers,
//! pulls theirs, pushes new blocks, and adopts any strictly longer chain it
//! receives.

// Modules
pub mod block;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod network;
pub mod node;

// Re-exports
pub use block::{Block, Payload};
pub use error::{ChainSyncError, IntegrityError, NetworkError, Result};
pub use ledger::{Chain, Ledger, ReplaceOutcome};
pub use network::{PeerAddr, PeerInfo, WireMessage};
pub use node::{BroadcastReport, NodeConfig, SyncNode, SyncNodeBuilder};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Default interface ChainSync nodes listen on
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default network port for ChainSync nodes
pub const DEFAULT_PORT: u16 = 21000;
