//! ChainSync node implementation

use crate::{
    block::{Block, Payload},
    error::{ChainSyncError, NetworkError, Result},
    ledger::{Chain, Ledger, ReplaceOutcome},
    network::{self, Connection, PeerAddr, PeerInfo, WireCodec, WireMessage},
    DEFAULT_HOST, DEFAULT_PORT,
};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A networked peer owning one ledger and a set of known peers
pub struct SyncNode {
    /// The local chain, shared with connection handlers
    ledger: Arc<Ledger>,

    /// Known peers and pulls in flight
    peers: Arc<RwLock<PeerBook>>,

    /// Node configuration
    config: Arc<NodeConfig>,

    /// Address the listener is bound to while running
    local_addr: Option<SocketAddr>,

    /// Stops the accept loop
    shutdown: CancellationToken,

    /// Accept loop task
    server: Option<JoinHandle<()>>,
}

impl SyncNode {
    /// Create a node with a fresh genesis-only ledger
    pub fn new(config: NodeConfig) -> Self {
        Self::with_ledger(config, Ledger::new())
    }

    /// Create a node around an existing ledger
    pub fn with_ledger(config: NodeConfig, ledger: Ledger) -> Self {
        Self {
            ledger: Arc::new(ledger),
            peers: Arc::new(RwLock::new(PeerBook::default())),
            config: Arc::new(config),
            local_addr: None,
            shutdown: CancellationToken::new(),
            server: None,
        }
    }

    /// Create a node with default settings
    pub fn new_default() -> Self {
        Self::new(NodeConfig::default())
    }

    /// Create a builder for this node
    pub fn builder() -> SyncNodeBuilder {
        SyncNodeBuilder::new()
    }

    /// Bind the listening socket and start accepting peers.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the configured port is 0.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.server.is_some() {
            return Err(ChainSyncError::config("node is already running"));
        }

        let host = self.config.host.as_str();
        let listener = TcpListener::bind((host, self.config.port))
            .await
            .map_err(|source| {
                ChainSyncError::Network(NetworkError::BindFailed {
                    addr: PeerAddr::new(host, self.config.port).to_string(),
                    source,
                })
            })?;
        let local_addr = listener.local_addr()?;

        self.shutdown = CancellationToken::new();
        self.server = Some(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.ledger),
            Arc::clone(&self.config),
            self.shutdown.clone(),
        )));
        self.local_addr = Some(local_addr);

        info!("Node started on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting connections. Handlers already running finish on their
    /// own.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            if let Err(e) = server.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }
        if let Some(addr) = self.local_addr.take() {
            info!("Node on {} stopped", addr);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        Arc::clone(&self.ledger)
    }

    /// Snapshot of the local chain
    pub async fn chain(&self) -> Chain {
        self.ledger.snapshot().await
    }

    /// Get all known peers
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers.known.values().cloned().collect()
    }

    /// Known peer addresses, sorted
    pub async fn peer_addrs(&self) -> Vec<PeerAddr> {
        let peers = self.peers.read().await;
        let mut addrs: Vec<PeerAddr> = peers.known.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub async fn has_peer(&self, peer: &PeerAddr) -> bool {
        self.peers.read().await.known.contains_key(peer)
    }

    /// Pull the chain of the node at `host:port` and reconcile with it.
    ///
    /// Returns `Ok(None)` when the peer is already known or another call is
    /// pulling from it. On failure the error is logged and the peer is not
    /// recorded, so a later call retries.
    pub async fn connect_to_peer(&self, host: &str, port: u16) -> Result<Option<ReplaceOutcome>> {
        self.connect_to_peer_addr(PeerAddr::new(host, port)).await
    }

    /// Same as [`SyncNode::connect_to_peer`] for an already parsed address
    pub async fn connect_to_peer_addr(&self, peer: PeerAddr) -> Result<Option<ReplaceOutcome>> {
        if !self.peers.write().await.reserve(&peer) {
            debug!("Peer {} already known, skipping pull", peer);
            return Ok(None);
        }

        let blocks = match network::request_chain(&peer, &self.config).await {
            Ok(blocks) => blocks,
            Err(e) => {
                self.peers.write().await.release(&peer);
                warn!("Failed to connect to peer {}: {}", peer, e);
                return Err(e);
            },
        };

        self.peers.write().await.confirm(peer.clone());
        info!("Connected to peer {} ({} blocks)", peer, blocks.len());

        match self
            .ledger
            .replace_if_longer(blocks, self.config.verify_candidates)
            .await
        {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                warn!("Refused chain from peer {}: {}", peer, e);
                Err(e)
            },
        }
    }

    /// Push `block` to every known peer, each on its own connection.
    ///
    /// Deliveries run concurrently; a failure only affects its own peer.
    pub async fn broadcast_new_block(&self, block: &Block) -> BroadcastReport {
        let peers = self.peer_addrs().await;
        let config = &self.config;
        let sends = peers.into_iter().map(|peer| async move {
            let result = network::push_block(&peer, block, config).await;
            (peer, result)
        });

        let mut report = BroadcastReport::default();
        for (peer, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    debug!("Sent block {} to {}", block, peer);
                    report.delivered.push(peer);
                },
                Err(e) => {
                    warn!("Failed to broadcast to {}: {}", peer, e);
                    report.failed.push(peer);
                },
            }
        }

        if !report.delivered.is_empty() {
            let mut peers = self.peers.write().await;
            for peer in &report.delivered {
                if let Some(info) = peers.known.get_mut(peer) {
                    info.touch();
                }
            }
        }
        report
    }

    /// Append a block to the local ledger and broadcast it
    pub async fn create_block(&self, payload: Payload) -> Result<(Block, BroadcastReport)> {
        let block = self.ledger.append(payload).await?;
        info!("Created block {}", block);
        let report = self.broadcast_new_block(&block).await;
        Ok((block, report))
    }
}

impl Drop for SyncNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Known peers plus addresses a pull is currently running against
#[derive(Debug, Default)]
struct PeerBook {
    known: HashMap<PeerAddr, PeerInfo>,
    pending: HashSet<PeerAddr>,
}

impl PeerBook {
    /// Claim `peer` for a pull; false when it is known or already claimed
    fn reserve(&mut self, peer: &PeerAddr) -> bool {
        if self.known.contains_key(peer) {
            return false;
        }
        self.pending.insert(peer.clone())
    }

    fn confirm(&mut self, peer: PeerAddr) {
        self.pending.remove(&peer);
        self.known
            .entry(peer.clone())
            .or_insert_with(|| PeerInfo::new(peer));
    }

    fn release(&mut self, peer: &PeerAddr) {
        self.pending.remove(peer);
    }
}

/// Per-peer result of a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<PeerAddr>,
    pub failed: Vec<PeerAddr>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    ledger: Arc<Ledger>,
    config: Arc<NodeConfig>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Connection from {}", addr);
                    tokio::spawn(handle_connection(
                        stream,
                        addr,
                        Arc::clone(&ledger),
                        Arc::clone(&config),
                    ));
                },
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                },
            },
        }
    }
}

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ledger: Arc<Ledger>,
    config: Arc<NodeConfig>,
) {
    let mut conn: Connection = Framed::new(stream, WireCodec::new(config.max_frame_length));
    if let Err(e) = serve_request(&mut conn, addr, &ledger, &config).await {
        warn!("Failed to handle request from {}: {}", addr, e);
    }
}

async fn serve_request(
    conn: &mut Connection,
    addr: SocketAddr,
    ledger: &Ledger,
    config: &NodeConfig,
) -> Result<()> {
    let message = network::read_message(conn, config, &addr.to_string()).await?;
    match message {
        WireMessage::GetChain => {
            let blocks = ledger.snapshot().await.into_blocks();
            debug!("Serving {} blocks to {}", blocks.len(), addr);
            network::send_message(conn, WireMessage::Chain(blocks), config).await?;
        },
        WireMessage::Chain(blocks) => {
            let outcome = ledger
                .replace_if_longer(blocks, config.verify_candidates)
                .await?;
            debug!("Pushed chain from {}: {:?}", addr, outcome);
        },
        WireMessage::Block(block) => {
            info!("Received block {} from {}", block, addr);
            let outcome = apply_pushed_block(ledger, block, config.verify_candidates).await?;
            debug!("Pushed block from {}: {:?}", addr, outcome);
        },
    }
    Ok(())
}

/// Treat a pushed block as the local chain extended by that block and run
/// the replacement policy on the result
pub(crate) async fn apply_pushed_block(
    ledger: &Ledger,
    block: Block,
    verify: bool,
) -> Result<ReplaceOutcome> {
    let mut candidate = ledger.snapshot().await.into_blocks();
    candidate.push(block);
    ledger.replace_if_longer(candidate, verify).await
}

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Interface to listen on
    pub host: String,

    /// Network port to listen on; 0 picks a free port
    pub port: u16,

    /// Verify hashes and linkage of received chains before adopting them
    pub verify_candidates: bool,

    /// Bound on establishing an outbound connection
    pub connect_timeout: Duration,

    /// Bound on each read or write of a frame
    pub io_timeout: Duration,

    /// Largest frame accepted or sent
    pub max_frame_length: usize,
}

impl NodeConfig {
    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ChainSyncError::config("host must not be empty"));
        }
        if self.connect_timeout.is_zero() || self.io_timeout.is_zero() {
            return Err(ChainSyncError::config("timeouts must be greater than zero"));
        }
        if self.max_frame_length == 0 {
            return Err(ChainSyncError::config("max frame length must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            verify_candidates: true,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(10),
            max_frame_length: network::DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// Builder for ChainSync nodes
pub struct SyncNodeBuilder {
    config: NodeConfig,
    ledger: Option<Ledger>,
}

impl SyncNodeBuilder {
    /// Create a new node builder
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            ledger: None,
        }
    }

    /// Set the node configuration
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Start from an existing ledger instead of a fresh genesis
    pub fn with_ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Set the listening host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Enable or disable verification of received chains
    pub fn verify_candidates(mut self, verify: bool) -> Self {
        self.config.verify_candidates = verify;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.config.io_timeout = timeout;
        self
    }

    pub fn max_frame_length(mut self, max: usize) -> Self {
        self.config.max_frame_length = max;
        self
    }

    /// Build the node
    pub fn build(self) -> Result<SyncNode> {
        self.config.validate()?;
        let ledger = self.ledger.unwrap_or_default();
        Ok(SyncNode::with_ledger(self.config, ledger))
    }
}

impl Default for SyncNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn amount(n: i64) -> Payload {
        let mut payload = Payload::new();
        payload.insert("amt".to_string(), json!(n));
        payload
    }

    #[test]
    fn test_peer_book_reservations() {
        let peer = PeerAddr::new("127.0.0.1", 9000);
        let mut book = PeerBook::default();

        assert!(book.reserve(&peer));
        assert!(!book.reserve(&peer), "a pending pull blocks a second one");

        book.release(&peer);
        assert!(book.reserve(&peer), "a released address can be retried");

        book.confirm(peer.clone());
        assert!(book.pending.is_empty());
        assert!(book.known.contains_key(&peer));
        assert!(!book.reserve(&peer));
    }

    #[tokio::test]
    async fn test_bind_accepts_ipv6_host() {
        if std::net::TcpListener::bind("[::1]:0").is_err() {
            // No IPv6 loopback in this environment
            return;
        }
        let mut node = SyncNode::builder().host("::1").port(0).build().unwrap();
        let addr = node.start().await.unwrap();
        assert!(addr.is_ipv6());
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pushed_block_extending_head_is_adopted() {
        let source = Ledger::new();
        let block = source.append(amount(1)).await.unwrap();
        let genesis = source.snapshot().await.genesis().clone();
        let target = Ledger::from_chain(Chain::from_blocks(vec![genesis]).unwrap());

        let outcome = apply_pushed_block(&target, block, true).await.unwrap();
        assert_eq!(
            outcome,
            ReplaceOutcome::Replaced {
                previous_len: 1,
                new_len: 2
            }
        );
        assert_eq!(target.snapshot().await, source.snapshot().await);
    }

    #[tokio::test]
    async fn test_pushed_block_not_extending_head_is_refused() {
        let target = Ledger::new();
        let before = target.snapshot().await;
        let stray = Block::seal(1, "f".repeat(64), 1, amount(1));

        let result = apply_pushed_block(&target, stray.clone(), true).await;
        assert!(matches!(result, Err(ChainSyncError::Integrity(_))));
        assert_eq!(target.snapshot().await, before);

        // The literal policy only looks at length
        let outcome = apply_pushed_block(&target, stray, false).await.unwrap();
        assert!(outcome.is_replaced());
    }

    #[test]
    fn test_builder_validates_config() {
        assert!(SyncNode::builder().io_timeout(Duration::ZERO).build().is_err());
        assert!(SyncNode::builder().max_frame_length(0).build().is_err());
        assert!(SyncNode::builder().host("").build().is_err());

        let node = SyncNode::builder()
            .host("127.0.0.1")
            .port(0)
            .verify_candidates(false)
            .build()
            .unwrap();
        assert!(!node.config().verify_candidates);
        assert!(!node.is_running());
        assert!(node.local_addr().is_none());
    }
}
