//! Networking module for peer-to-peer chain synchronization
//!
//! Every connection carries exactly one exchange: either a `get_chain`
//! request answered by the full chain, or an unsolicited push of a block (a
//! JSON object) or a chain (a JSON array). Messages travel as frames with a
//! 4-byte big-endian length prefix.

use crate::block::{json_kind, Block};
use crate::error::{ChainSyncError, NetworkError, Result};
use crate::node::NodeConfig;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};
use tracing::debug;

/// Request token asking a peer for its full chain
pub const GET_CHAIN: &str = "get_chain";

/// Default upper bound on a single frame
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Network address of a remote node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        Self { host, port }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddr {
    type Err = ChainSyncError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            ChainSyncError::Network(NetworkError::InvalidAddress {
                addr: s.to_string(),
                reason: reason.to_string(),
            })
        };

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("invalid port number"))?;
        Ok(Self::new(host, port))
    }
}

impl From<std::net::SocketAddr> for PeerAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Information about a known peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: PeerAddr,
    pub added_at: chrono::DateTime<chrono::Utc>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

impl PeerInfo {
    pub fn new(address: PeerAddr) -> Self {
        let now = chrono::Utc::now();
        Self {
            address,
            added_at: now,
            last_seen: now,
        }
    }

    /// Record a successful exchange with this peer
    pub fn touch(&mut self) {
        self.last_seen = chrono::Utc::now();
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Pull request for the full chain
    GetChain,
    /// Full chain, either as a `get_chain` response or pushed unsolicited
    Chain(Vec<Block>),
    /// A single pushed block
    Block(Block),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::GetChain => GET_CHAIN,
            WireMessage::Chain(_) => "chain",
            WireMessage::Block(_) => "block",
        }
    }

    /// Encode the frame body
    pub fn to_bytes(&self) -> Result<Bytes> {
        let bytes = match self {
            WireMessage::GetChain => Bytes::from_static(GET_CHAIN.as_bytes()),
            WireMessage::Chain(blocks) => Bytes::from(serde_json::to_vec(blocks)?),
            WireMessage::Block(block) => Bytes::from(serde_json::to_vec(block)?),
        };
        Ok(bytes)
    }

    /// Decode a frame body, telling pushes apart by JSON shape
    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        if frame == GET_CHAIN.as_bytes() {
            return Ok(WireMessage::GetChain);
        }

        let value: Value = serde_json::from_slice(frame)?;
        match value {
            Value::Array(_) => Ok(WireMessage::Chain(serde_json::from_value(value)?)),
            Value::Object(_) => Ok(WireMessage::Block(serde_json::from_value(value)?)),
            other => Err(ChainSyncError::invalid_message(format!(
                "expected {}, a block object or a chain array, got {}",
                GET_CHAIN,
                json_kind(&other)
            ))),
        }
    }
}

/// Length-delimited codec carrying [`WireMessage`] frames
#[derive(Debug)]
pub struct WireCodec {
    length_codec: LengthDelimitedCodec,
    max_frame_length: usize,
    awaiting_head: bool,
}

impl WireCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            length_codec: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX_BYTES)
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
            awaiting_head: true,
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for WireCodec {
    type Item = WireMessage;
    type Error = ChainSyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Only a buffer that starts at a frame boundary begins with a length
        if self.awaiting_head && src.len() >= LENGTH_PREFIX_BYTES {
            let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if size > self.max_frame_length {
                return Err(NetworkError::MessageTooLarge {
                    size,
                    max_size: self.max_frame_length,
                }
                .into());
            }
        }

        let buffered = src.len();
        match self.length_codec.decode(src)? {
            Some(frame) => {
                self.awaiting_head = true;
                WireMessage::from_bytes(&frame).map(Some)
            },
            None => {
                // The inner codec consumes the head before the body arrives
                if src.len() != buffered {
                    self.awaiting_head = false;
                }
                Ok(None)
            },
        }
    }
}

impl Encoder<WireMessage> for WireCodec {
    type Error = ChainSyncError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<()> {
        let body = item.to_bytes()?;
        if body.len() > self.max_frame_length {
            return Err(NetworkError::MessageTooLarge {
                size: body.len(),
                max_size: self.max_frame_length,
            }
            .into());
        }
        self.length_codec.encode(body, dst)?;
        Ok(())
    }
}

/// A framed connection to or from a peer
pub type Connection = Framed<TcpStream, WireCodec>;

/// Run `fut`, failing with [`NetworkError::Timeout`] once `duration` elapses
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| NetworkError::Timeout { duration })?
}

/// Open a framed connection to `peer`
pub async fn connect(peer: &PeerAddr, config: &NodeConfig) -> Result<Connection> {
    let stream = with_timeout(config.connect_timeout, async {
        TcpStream::connect((peer.host.as_str(), peer.port))
            .await
            .map_err(|source| {
                ChainSyncError::Network(NetworkError::ConnectionFailed {
                    addr: peer.to_string(),
                    source,
                })
            })
    })
    .await?;
    debug!("Connected to peer {}", peer);
    Ok(Framed::new(stream, WireCodec::new(config.max_frame_length)))
}

/// Read exactly one message, treating a closed connection as an error
pub async fn read_message(
    conn: &mut Connection,
    config: &NodeConfig,
    addr: &str,
) -> Result<WireMessage> {
    with_timeout(config.io_timeout, async {
        match conn.next().await {
            Some(message) => message,
            None => Err(NetworkError::ConnectionClosed {
                addr: addr.to_string(),
            }
            .into()),
        }
    })
    .await
}

/// Send one message and flush it
pub async fn send_message(
    conn: &mut Connection,
    message: WireMessage,
    config: &NodeConfig,
) -> Result<()> {
    with_timeout(config.io_timeout, conn.send(message)).await
}

/// Pull the full chain from `peer`
pub async fn request_chain(peer: &PeerAddr, config: &NodeConfig) -> Result<Vec<Block>> {
    let mut conn = connect(peer, config).await?;
    send_message(&mut conn, WireMessage::GetChain, config).await?;
    match read_message(&mut conn, config, &peer.to_string()).await? {
        WireMessage::Chain(blocks) => Ok(blocks),
        other => Err(NetworkError::UnexpectedResponse {
            expected: "chain".to_string(),
            actual: other.kind().to_string(),
        }
        .into()),
    }
}

/// Push a single block to `peer` on a fresh connection
pub async fn push_block(peer: &PeerAddr, block: &Block, config: &NodeConfig) -> Result<()> {
    let mut conn = connect(peer, config).await?;
    send_message(&mut conn, WireMessage::Block(block.clone()), config).await
}

/// Push a whole chain to `peer` on a fresh connection
pub async fn push_chain(peer: &PeerAddr, blocks: Vec<Block>, config: &NodeConfig) -> Result<()> {
    let mut conn = connect(peer, config).await?;
    send_message(&mut conn, WireMessage::Chain(blocks), config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Payload;
    use crate::ledger::Chain;
    use serde_json::json;
    use tokio_test::io::Builder;
    use tokio_util::codec::FramedRead;

    fn sample_chain() -> Chain {
        let mut chain = Chain::new();
        let mut payload = Payload::new();
        payload.insert("amt".to_string(), json!(5));
        chain.append(payload);
        chain
    }

    #[test]
    fn test_peer_addr_parsing() {
        let addr: PeerAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(addr, PeerAddr::new("127.0.0.1", 5000));
        assert_eq!(addr.to_string(), "127.0.0.1:5000");

        let v6: PeerAddr = "[::1]:7000".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:7000");

        assert!("localhost".parse::<PeerAddr>().is_err());
        assert!(":80".parse::<PeerAddr>().is_err());
        assert!("host:notaport".parse::<PeerAddr>().is_err());
        assert!("host:70000".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn test_message_shapes() {
        let chain = sample_chain();
        let block = chain.head().clone();

        assert_eq!(
            WireMessage::from_bytes(b"get_chain").unwrap(),
            WireMessage::GetChain
        );

        let pushed = WireMessage::Block(block.clone()).to_bytes().unwrap();
        assert_eq!(pushed.first(), Some(&b'{'));
        assert_eq!(
            WireMessage::from_bytes(&pushed).unwrap(),
            WireMessage::Block(block)
        );

        let blocks = chain.into_blocks();
        let response = WireMessage::Chain(blocks.clone()).to_bytes().unwrap();
        assert_eq!(response.first(), Some(&b'['));
        assert_eq!(
            WireMessage::from_bytes(&response).unwrap(),
            WireMessage::Chain(blocks)
        );
    }

    #[test]
    fn test_rejects_other_payloads() {
        assert!(WireMessage::from_bytes(b"42").is_err());
        assert!(WireMessage::from_bytes(b"get_chain please").is_err());
        assert!(WireMessage::from_bytes(br#"{"index": 1}"#).is_err());
    }

    #[test]
    fn test_codec_frames_messages() {
        let blocks = sample_chain().into_blocks();
        let mut buffer = BytesMut::new();
        let mut codec = WireCodec::default();
        codec.encode(WireMessage::GetChain, &mut buffer).unwrap();
        codec
            .encode(WireMessage::Chain(blocks.clone()), &mut buffer)
            .unwrap();

        assert_eq!(&buffer[..4], &[0, 0, 0, 9]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(WireMessage::GetChain));
        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(WireMessage::Chain(blocks))
        );
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_codec_enforces_max_frame_length() {
        let blocks = sample_chain().into_blocks();
        let mut small = WireCodec::new(16);
        let mut buffer = BytesMut::new();
        assert!(matches!(
            small.encode(WireMessage::Chain(blocks), &mut buffer),
            Err(ChainSyncError::Network(NetworkError::MessageTooLarge { max_size: 16, .. }))
        ));

        let mut header = BytesMut::from(&[0u8, 0, 1, 0][..]);
        assert!(matches!(
            small.decode(&mut header),
            Err(ChainSyncError::Network(NetworkError::MessageTooLarge { size: 256, .. }))
        ));
    }

    #[tokio::test]
    async fn test_stream_split_across_reads() {
        let block = sample_chain().head().clone();
        let mut buffer = BytesMut::new();
        WireCodec::default()
            .encode(WireMessage::Block(block.clone()), &mut buffer)
            .unwrap();
        let bytes = buffer.freeze();
        let (first, second) = bytes.split_at(7);

        let mut stream = Builder::new().read(first).read(second).build();
        let mut framed = FramedRead::new(&mut stream, WireCodec::default());

        let decoded = framed.next().await.unwrap().unwrap();
        assert_eq!(decoded, WireMessage::Block(block));
        assert!(framed.next().await.is_none());
    }
}
