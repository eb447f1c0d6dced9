use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{clock::LamportTime, NodeId};

pub type BlockHash = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub src: NodeId,
    pub dst: NodeId,
    pub amount: u64,
    pub ts: LamportTime,
    pub initiator: NodeId,
}

impl Transaction {
    // the all-zero transaction carried by the genesis block
    pub fn sentinel() -> Self {
        Self {
            src: 0,
            dst: 0,
            amount: 0,
            ts: 0,
            initiator: 0,
        }
    }

    pub fn order_key(&self) -> (LamportTime, NodeId) {
        (self.ts, self.initiator)
    }

    // the only surface that requires bit exact agreement across replicas:
    // fixed width big endian fields, in declaration order
    fn update_canonical(&self, digest: &mut Sha256) {
        digest.update(self.src.to_be_bytes());
        digest.update(self.dst.to_be_bytes());
        digest.update(self.amount.to_be_bytes());
        digest.update(self.ts.to_be_bytes());
        digest.update(self.initiator.to_be_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub transaction: Transaction,
    pub prev_hash: BlockHash,
    pub hash: BlockHash,
}

impl Block {
    fn digest(index: u64, transaction: &Transaction, prev_hash: &BlockHash) -> BlockHash {
        let mut digest = Sha256::new();
        digest.update(index.to_be_bytes());
        transaction.update_canonical(&mut digest);
        digest.update(prev_hash);
        digest.finalize().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    blocks: Vec<Block>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        let transaction = Transaction::sentinel();
        let prev_hash = BlockHash::default();
        let hash = Block::digest(0, &transaction, &prev_hash);
        Self {
            blocks: vec![Block {
                index: 0,
                transaction,
                prev_hash,
                hash,
            }],
        }
    }

    // callers must hold the critical section for `transaction.initiator`;
    // appends arrive in `(ts, initiator)` order on every honest replica, so a
    // violation here means the replicas have diverged and this one is done
    pub fn append(&mut self, transaction: Transaction) -> anyhow::Result<&Block> {
        let last = self.blocks.last().unwrap();
        anyhow::ensure!(
            transaction.order_key() > last.transaction.order_key(),
            "ledger divergence: {:?} after {:?}",
            transaction.order_key(),
            last.transaction.order_key(),
        );
        let index = last.index + 1;
        let prev_hash = last.hash;
        let hash = Block::digest(index, &transaction, &prev_hash);
        self.blocks.push(Block {
            index,
            transaction,
            prev_hash,
            hash,
        });
        Ok(self.blocks.last().unwrap())
    }

    // recompute every hash and linkage; the index of the first break, if any
    pub fn verify(&self) -> Result<(), u64> {
        for (i, block) in self.blocks.iter().enumerate() {
            let index = i as u64;
            if block.index != index {
                return Err(index);
            }
            if let Some(prev) = i.checked_sub(1).map(|i| &self.blocks[i]) {
                if block.prev_hash != prev.hash
                    || block.transaction.order_key() <= prev.transaction.order_key()
                {
                    return Err(index);
                }
            } else if block.prev_hash != BlockHash::default()
                || block.transaction != Transaction::sentinel()
            {
                return Err(index);
            }
            if block.hash != Block::digest(block.index, &block.transaction, &block.prev_hash) {
                return Err(index);
            }
        }
        Ok(())
    }

    pub fn head(&self) -> &Block {
        self.blocks.last().unwrap()
    }

    pub fn len(&self) -> u64 {
        self.blocks.len() as _
    }

    pub fn range(&self, lo: u64, hi: u64) -> &[Block] {
        let lo = (lo as usize).min(self.blocks.len());
        let hi = (hi as usize).clamp(lo, self.blocks.len());
        &self.blocks[lo..hi]
    }

    pub fn balance_of(&self, id: NodeId, initial: u64) -> u64 {
        let mut balance = initial as i128;
        for block in &self.blocks[1..] {
            if block.transaction.src == id {
                balance -= block.transaction.amount as i128
            }
            if block.transaction.dst == id {
                balance += block.transaction.amount as i128
            }
        }
        balance.max(0) as u64
    }
}

pub fn hex(hash: &BlockHash) -> String {
    use std::fmt::Write;
    hash.iter().fold(String::new(), |mut hex, byte| {
        let _ = write!(&mut hex, "{byte:02x}");
        hex
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn transfer(src: NodeId, dst: NodeId, amount: u64, ts: LamportTime) -> Transaction {
        Transaction {
            src,
            dst,
            amount,
            ts,
            initiator: src,
        }
    }

    #[test]
    fn genesis_shape() {
        let ledger = Ledger::new();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.head().index, 0);
        assert_eq!(ledger.head().prev_hash, BlockHash::default());
        assert_eq!(ledger.head().transaction, Transaction::sentinel());
        assert_eq!(ledger.verify(), Ok(()))
    }

    #[test]
    fn append_links_blocks() {
        let mut ledger = Ledger::new();
        let genesis_hash = ledger.head().hash;
        ledger.append(transfer(1, 2, 10, 1)).unwrap();
        ledger.append(transfer(3, 2, 7, 1)).unwrap();
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.range(1, 3)[0].prev_hash, genesis_hash);
        assert_eq!(ledger.range(1, 3)[1].prev_hash, ledger.range(1, 2)[0].hash);
        assert_eq!(ledger.verify(), Ok(()))
    }

    #[test]
    fn digest_is_reproducible() {
        let transaction = transfer(1, 2, 10, 1);
        let prev_hash = [7; 32];
        assert_eq!(
            Block::digest(1, &transaction, &prev_hash),
            Block::digest(1, &transaction, &prev_hash)
        )
    }

    #[test]
    fn out_of_order_append_is_divergence() {
        let mut ledger = Ledger::new();
        ledger.append(transfer(3, 2, 7, 1)).unwrap();
        // (1, 1) sorts before the appended (1, 3)
        ledger.append(transfer(1, 2, 10, 1)).unwrap_err();
        // ties are not strictly greater either
        ledger.append(transfer(3, 2, 7, 1)).unwrap_err();
        assert_eq!(ledger.len(), 2)
    }

    #[test]
    fn verify_reports_first_break() {
        let mut ledger = Ledger::new();
        ledger.append(transfer(1, 2, 10, 1)).unwrap();
        ledger.append(transfer(2, 1, 5, 4)).unwrap();
        ledger.blocks[1].transaction.amount = 1000;
        assert_eq!(ledger.verify(), Err(1))
    }

    #[test]
    fn balances_fold_from_chain() {
        let mut ledger = Ledger::new();
        ledger.append(transfer(1, 2, 5, 1)).unwrap();
        ledger.append(transfer(3, 2, 7, 1)).unwrap();
        assert_eq!(ledger.balance_of(1, 100), 95);
        assert_eq!(ledger.balance_of(2, 100), 112);
        assert_eq!(ledger.balance_of(3, 100), 93)
    }

    proptest! {
        #[test]
        fn any_well_formed_chain_verifies(transfers in prop::collection::vec((1u32..5, 1u32..5, 1u64..1000), 0..20)) {
            let mut ledger = Ledger::new();
            for (i, (src, dst, amount)) in transfers.into_iter().enumerate() {
                let transaction = transfer(src, dst, amount, i as u64 + 1);
                ledger.append(transaction).unwrap();
            }
            prop_assert_eq!(ledger.verify(), Ok(()));
            // every prefix of a valid ledger is also valid
            let len = ledger.len();
            ledger.blocks.truncate((len as usize).saturating_sub(1).max(1));
            prop_assert_eq!(ledger.verify(), Ok(()))
        }
    }
}
