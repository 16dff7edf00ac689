//! Hash-chained ledger and its shared, lock-protected wrapper

use crate::block::{now_millis, Block, Payload, GENESIS_PREVIOUS_HASH};
use crate::error::{ChainSyncError, IntegrityError, Result};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Ordered sequence of blocks, genesis first.
///
/// Never empty: every constructor either creates a genesis block or rejects an
/// empty input.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    blocks: Vec<Block>,
}

impl Chain {
    /// Start a chain holding a freshly created genesis block
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::genesis()],
        }
    }

    /// Wrap existing blocks without checking linkage
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self> {
        if blocks.is_empty() {
            return Err(ChainSyncError::EmptyChain);
        }
        Ok(Self { blocks })
    }

    /// Extend the chain with a block built on top of the current head.
    ///
    /// Fails without touching the chain when the head already holds the
    /// largest index.
    pub fn append(&mut self, payload: Payload) -> Result<Block> {
        let head = self.head();
        let index = next_index(head.index())?;
        let block = Block::seal(index, head.hash(), now_millis(), payload);
        self.blocks.push(block.clone());
        Ok(block)
    }

    pub fn head(&self) -> &Block {
        // from_blocks and new guarantee at least one block
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn try_head(&self) -> Result<&Block> {
        self.blocks.last().ok_or(ChainSyncError::EmptyChain)
    }

    pub fn genesis(&self) -> &Block {
        &self.blocks[0]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    /// Re-derive every hash and check linkage
    pub fn verify(&self) -> bool {
        Self::verify_blocks(&self.blocks).is_ok()
    }

    /// Check a block sequence against the chain invariants, stopping at the
    /// first failure.
    pub fn verify_blocks(blocks: &[Block]) -> std::result::Result<(), IntegrityError> {
        let genesis = blocks.first().ok_or(IntegrityError::Empty)?;
        if genesis.index() != 0 || genesis.previous_hash() != GENESIS_PREVIOUS_HASH {
            return Err(IntegrityError::InvalidGenesis {
                index: genesis.index(),
                previous_hash: genesis.previous_hash().to_string(),
            });
        }
        genesis.validate()?;

        for pair in blocks.windows(2) {
            let (prev, block) = (&pair[0], &pair[1]);
            let expected = next_index(prev.index())?;
            if block.index() != expected {
                return Err(IntegrityError::IndexGap {
                    expected,
                    actual: block.index(),
                });
            }
            if block.previous_hash() != prev.hash() {
                return Err(IntegrityError::BrokenLink {
                    index: block.index(),
                    expected: prev.hash().to_string(),
                    actual: block.previous_hash().to_string(),
                });
            }
            block.validate()?;
        }
        Ok(())
    }
}

fn next_index(index: u64) -> std::result::Result<u64, IntegrityError> {
    index
        .checked_add(1)
        .ok_or(IntegrityError::IndexOverflow { index })
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of applying the replacement policy to a candidate chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Candidate was strictly longer and now is the local chain
    Replaced { previous_len: usize, new_len: usize },
    /// Local chain left untouched
    Kept {
        local_len: usize,
        candidate_len: usize,
    },
}

impl ReplaceOutcome {
    pub fn is_replaced(&self) -> bool {
        matches!(self, ReplaceOutcome::Replaced { .. })
    }
}

/// The chain shared between a node's connection handlers.
///
/// `append`, `snapshot` and `replace_if_longer` each run under a single lock
/// acquisition, so no caller ever sees a chain halfway through replacement.
#[derive(Debug, Default)]
pub struct Ledger {
    chain: RwLock<Chain>,
}

impl Ledger {
    /// Create a ledger holding only a new genesis block
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_chain(chain: Chain) -> Self {
        Self {
            chain: RwLock::new(chain),
        }
    }

    /// Append a block carrying `payload` and return it
    pub async fn append(&self, payload: Payload) -> Result<Block> {
        let mut chain = self.chain.write().await;
        let block = chain.append(payload)?;
        debug!("Appended block {}", block);
        Ok(block)
    }

    /// Copy of the current chain
    pub async fn snapshot(&self) -> Chain {
        self.chain.read().await.clone()
    }

    pub async fn head(&self) -> Block {
        self.chain.read().await.head().clone()
    }

    pub async fn len(&self) -> usize {
        self.chain.read().await.len()
    }

    pub async fn verify(&self) -> bool {
        self.chain.read().await.verify()
    }

    /// Replace the local chain with `candidate` iff the candidate is strictly
    /// longer.
    ///
    /// When `verify` is set the candidate must pass [`Chain::verify_blocks`]
    /// first and is refused with an integrity error otherwise, whatever its
    /// length. Verification happens before the lock is taken.
    pub async fn replace_if_longer(
        &self,
        candidate: Vec<Block>,
        verify: bool,
    ) -> Result<ReplaceOutcome> {
        if verify {
            Chain::verify_blocks(&candidate)?;
        }

        let mut chain = self.chain.write().await;
        let local_len = chain.len();
        let candidate_len = candidate.len();
        if candidate_len <= local_len {
            debug!(
                "Keeping local chain ({} blocks) over candidate ({} blocks)",
                local_len, candidate_len
            );
            return Ok(ReplaceOutcome::Kept {
                local_len,
                candidate_len,
            });
        }

        // candidate_len > local_len >= 1, so the candidate cannot be empty
        *chain = Chain::from_blocks(candidate)?;
        info!(
            "Blockchain updated: {} -> {} blocks",
            local_len, candidate_len
        );
        Ok(ReplaceOutcome::Replaced {
            previous_len: local_len,
            new_len: candidate_len,
        })
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
    fn test_new_chain_has_only_genesis() {
        let chain = Chain::new();
        assert_eq!(chain.len(), 1);
        assert!(chain.head().is_genesis());
        assert!(chain.verify());
    }

    #[test]
    fn test_append_links_to_head() {
        let mut chain = Chain::new();
        let genesis_hash = chain.head().hash().to_string();
        let block = chain.append(amount(5)).unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(block.index(), 1);
        assert_eq!(block.previous_hash(), genesis_hash);
        assert_eq!(chain.head(), &block);
        assert!(chain.verify());
    }

    #[test]
    fn test_from_blocks_rejects_empty() {
        assert!(matches!(
            Chain::from_blocks(Vec::new()),
            Err(ChainSyncError::EmptyChain)
        ));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let mut chain = Chain::new();
        chain.append(amount(1)).unwrap();
        chain.append(amount(2)).unwrap();
        let mut blocks = chain.into_blocks();

        // Replace block 1 with one carrying different content but the old hash
        let original = blocks[1].clone();
        blocks[1] = Block::new(
            original.index(),
            original.previous_hash(),
            original.timestamp(),
            amount(1000),
            original.hash(),
        );
        assert!(matches!(
            Chain::verify_blocks(&blocks),
            Err(IntegrityError::HashMismatch { index: 1, .. })
        ));
    }

    #[test]
    fn test_verify_detects_broken_link_and_gap() {
        let mut a = Chain::new();
        a.append(amount(1)).unwrap();
        let mut blocks = a.blocks().to_vec();
        blocks[1] = Block::seal(1, "f".repeat(64), 1, amount(1));
        assert!(matches!(
            Chain::verify_blocks(&blocks),
            Err(IntegrityError::BrokenLink { index: 1, .. })
        ));

        let head = a.head().clone();
        let skipped = Block::seal(head.index() + 2, head.hash(), 1, Payload::new());
        let mut gapped = a.into_blocks();
        gapped.push(skipped);
        assert_eq!(
            Chain::verify_blocks(&gapped),
            Err(IntegrityError::IndexGap {
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn test_verify_rejects_bad_genesis() {
        let block = Block::seal(1, "abc", 1, Payload::new());
        assert!(matches!(
            Chain::verify_blocks(&[block]),
            Err(IntegrityError::InvalidGenesis { index: 1, .. })
        ));
        assert_eq!(Chain::verify_blocks(&[]), Err(IntegrityError::Empty));
    }

    #[test]
    fn test_verify_handles_largest_index() {
        let genesis = Block::genesis();
        let top = Block::seal(u64::MAX, genesis.hash(), 1, Payload::new());
        let after = Block::seal(0, top.hash(), 2, Payload::new());
        assert_eq!(
            Chain::verify_blocks(&[genesis, top, after]),
            Err(IntegrityError::IndexGap {
                expected: 1,
                actual: u64::MAX
            })
        );
    }

    #[tokio::test]
    async fn test_append_after_largest_index_fails_cleanly() {
        let genesis = Block::genesis();
        let top = Block::new(u64::MAX, "x", 1, Payload::new(), "y");
        let ledger = Ledger::new();

        // Only the literal policy lets such a chain in
        let outcome = ledger
            .replace_if_longer(vec![genesis, top], false)
            .await
            .unwrap();
        assert!(outcome.is_replaced());
        let before = ledger.snapshot().await;

        let result = ledger.append(amount(1)).await;
        assert!(matches!(
            result,
            Err(ChainSyncError::Integrity(IntegrityError::IndexOverflow { index: u64::MAX }))
        ));
        assert_eq!(ledger.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_replace_requires_strictly_longer() {
        let ledger = Ledger::new();
        ledger.append(amount(1)).await.unwrap();
        let before = ledger.snapshot().await;

        let mut same_len = Chain::new();
        same_len.append(amount(2)).unwrap();
        let outcome = ledger
            .replace_if_longer(same_len.into_blocks(), true)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReplaceOutcome::Kept {
                local_len: 2,
                candidate_len: 2
            }
        );
        assert_eq!(ledger.snapshot().await, before);

        let mut longer = Chain::new();
        longer.append(amount(3)).unwrap();
        longer.append(amount(4)).unwrap();
        let expected = longer.clone();
        let outcome = ledger
            .replace_if_longer(longer.into_blocks(), true)
            .await
            .unwrap();
        assert!(outcome.is_replaced());
        assert_eq!(ledger.snapshot().await, expected);
    }

    #[tokio::test]
    async fn test_replace_refuses_invalid_candidate_when_verifying() {
        let ledger = Ledger::new();
        let before = ledger.snapshot().await;

        let mut longer = Chain::new();
        longer.append(amount(1)).unwrap();
        let mut blocks = longer.into_blocks();
        blocks.push(Block::new(2, "bogus", 1, Payload::new(), "bogus"));

        let result = ledger.replace_if_longer(blocks.clone(), true).await;
        assert!(matches!(result, Err(ChainSyncError::Integrity(_))));
        assert_eq!(ledger.snapshot().await, before);

        // Without verification the longer chain wins unconditionally
        let outcome = ledger.replace_if_longer(blocks, false).await.unwrap();
        assert!(outcome.is_replaced());
        assert_eq!(ledger.len().await, 3);
        assert!(!ledger.verify().await);
    }
}
