use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bcc_consensus::{build_block, genesis_block, replay_chain, select_validator, validate_block};
use bcc_core::{
    validate_transaction, Account, Block, Chain, ChainError, Ledger, NodeId, Transaction,
    TxContext, GENESIS_GRANT, GENESIS_VALIDATOR, RESERVED_ADDRESS,
};
use bcc_crypto::KeyMaterial;
use bcc_network::{PeerAddr, PeerTransport};
use bcc_wallet::{Wallet, WalletRecord};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// What happened to an incoming block: appended to the chain, or parked in
/// the out-of-order buffer until its predecessor shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Committed,
    Buffered,
}

/// Everything the chain lock guards: the committed blocks, the ledger
/// derived from exactly those blocks, and the mempool-adjusted soft ledger.
struct ChainState {
    chain: Chain,
    chain_ledger: Ledger,
    soft_ledger: Ledger,
}

/// One replica of the BlockChat state machine. All mutation funnels through
/// two locks: `state` (the chain lock) and `mempool`; the lock order is
/// always state before mempool or buffer, never the other way around.
pub struct Node {
    keys: KeyMaterial,
    capacity: usize,
    total_nodes: u64,
    id: Mutex<Option<NodeId>>,
    state: Mutex<ChainState>,
    mempool: Mutex<VecDeque<Transaction>>,
    buffer: Mutex<Vec<Block>>,
    wallet: Mutex<Wallet>,
    send_counter: AtomicU64,
    peers: Arc<dyn PeerTransport>,
}

impl Node {
    pub fn new(
        keys: KeyMaterial,
        capacity: usize,
        total_nodes: u64,
        peers: Arc<dyn PeerTransport>,
    ) -> Self {
        let wallet = Wallet::new(keys.clone());
        Self {
            keys,
            capacity,
            total_nodes,
            id: Mutex::new(None),
            state: Mutex::new(ChainState {
                chain: Chain::new(),
                chain_ledger: Ledger::new(),
                soft_ledger: Ledger::new(),
            }),
            mempool: Mutex::new(VecDeque::new()),
            buffer: Mutex::new(Vec::new()),
            wallet: Mutex::new(wallet),
            send_counter: AtomicU64::new(0),
            peers,
        }
    }

    pub fn public_key(&self) -> &str {
        &self.keys.public_pem
    }

    pub fn id(&self) -> Option<NodeId> {
        *self.id.lock()
    }

    pub fn set_id(&self, id: NodeId) {
        *self.id.lock() = Some(id);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_nodes(&self) -> u64 {
        self.total_nodes
    }

    pub fn chain_len(&self) -> usize {
        self.state.lock().chain.len()
    }

    pub fn last_block(&self) -> Option<Block> {
        self.state.lock().chain.tip().cloned()
    }

    pub fn chain_snapshot(&self) -> Chain {
        self.state.lock().chain.clone()
    }

    pub fn ring_snapshot(&self) -> Ledger {
        self.state.lock().chain_ledger.clone()
    }

    pub fn soft_snapshot(&self) -> Ledger {
        self.state.lock().soft_ledger.clone()
    }

    /// Balance as the next block would leave it.
    pub fn soft_balance(&self) -> Option<u64> {
        let state = self.state.lock();
        let id = state.soft_ledger.id_of_key(self.public_key())?;
        state.soft_ledger.balance_of(id)
    }

    pub fn soft_stake(&self) -> Option<u64> {
        let state = self.state.lock();
        let id = state.soft_ledger.id_of_key(self.public_key())?;
        state.soft_ledger.stake_of(id)
    }

    pub fn wallet_records(&self) -> Vec<WalletRecord> {
        self.wallet.lock().records().to_vec()
    }

    pub fn mempool_len(&self) -> usize {
        self.mempool.lock().len()
    }

    /// The pooled transactions in arrival order.
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.mempool.lock().iter().cloned().collect()
    }

    pub fn key_of_id(&self, id: NodeId) -> Option<String> {
        self.state
            .lock()
            .chain_ledger
            .key_of_id(id)
            .map(str::to_string)
    }

    /// Seeds this node as the bootstrap (id 0): registers itself in the
    /// ring, installs the genesis block and credits itself the full grant.
    pub fn bootstrap_genesis(&self, ip: &str, port: &str) -> Result<()> {
        self.set_id(0);
        let genesis = genesis_block(self.public_key(), self.total_nodes);
        {
            let mut state = self.state.lock();
            anyhow::ensure!(state.chain.is_empty(), "chain already initialized");
            let mut account = Account::new(0, ip.to_string(), port.to_string(), self.keys.public_pem.clone());
            account.balance = GENESIS_GRANT * self.total_nodes;
            account.nonces.insert(0);
            state.chain_ledger.insert(account);
            state.soft_ledger = state.chain_ledger.clone();
            state.chain.push(genesis.clone());
        }
        // The coinbase nonce belongs to account 0, so the first outgoing
        // transaction uses nonce 1.
        self.send_counter.store(1, Ordering::SeqCst);
        self.wallet
            .lock()
            .confirm(&genesis.transactions[0], GENESIS_VALIDATOR);
        info!(grant = GENESIS_GRANT * self.total_nodes, "genesis installed");
        Ok(())
    }

    /// Bootstrap-only: assigns the next free ring id to a joining peer.
    pub fn register_peer(
        &self,
        public_key: String,
        ip: String,
        port: String,
    ) -> Result<NodeId, ChainError> {
        let mut state = self.state.lock();
        let next = state.chain_ledger.len() as u64;
        if next >= self.total_nodes {
            return Err(ChainError::SystemFull(self.total_nodes));
        }
        state
            .chain_ledger
            .insert(Account::new(next, ip, port, public_key));
        state.soft_ledger = state.chain_ledger.clone();
        info!(id = next, "peer registered");
        Ok(next)
    }

    /// Runs once the ring is complete: ships ring and chain to every peer,
    /// then grants each one its opening balance through ordinary
    /// transactions that settle by consensus like any other.
    pub async fn finish_bootstrap(&self) -> Result<()> {
        let my_id = self.id();
        let (ring, chain) = {
            let state = self.state.lock();
            (state.chain_ledger.clone(), state.chain.clone())
        };
        for account in ring.accounts() {
            if Some(account.id) == my_id {
                continue;
            }
            let peer = PeerAddr {
                ip: account.ip.clone(),
                port: account.port.clone(),
            };
            self.peers.share_ring(&peer, &ring).await?;
            self.peers.share_chain(&peer, &chain).await?;
        }
        let grantees: Vec<String> = ring
            .accounts()
            .filter(|a| Some(a.id) != my_id)
            .map(|a| a.public_key.clone())
            .collect();
        for key in grantees {
            self.create_transaction(&key, GENESIS_GRANT as i64, "")
                .await?;
        }
        info!("bootstrap complete, ring and chain shipped");
        Ok(())
    }

    /// Creates, signs and broadcasts a transaction from this node's wallet.
    /// The broadcast includes the node itself, so pooling happens on the
    /// same path as for every other peer.
    pub async fn create_transaction(
        &self,
        receiver: &str,
        amount: i64,
        message: &str,
    ) -> Result<Transaction, ChainError> {
        let nonce = self.send_counter.load(Ordering::SeqCst);
        let (tip_index, soft) = {
            let state = self.state.lock();
            let tip_index = state.chain.tip().map(|b| b.index).unwrap_or(0);
            (tip_index, state.soft_ledger.clone())
        };
        let mut tx = Transaction::new(
            self.keys.public_pem.clone(),
            receiver.to_string(),
            amount,
            message.to_string(),
            nonce,
            tip_index,
        );
        tx.sign(&self.keys.private_pem)
            .map_err(|_| ChainError::InvalidSignature)?;
        validate_transaction(
            &tx,
            &soft,
            TxContext {
                block_index: tip_index,
                validator: None,
            },
        )?;
        self.send_counter.fetch_add(1, Ordering::SeqCst);
        let ring = PeerAddr::ring_of(&soft);
        self.peers.broadcast_transaction(&ring, &tx).await;
        Ok(tx)
    }

    /// A stake update: positive amounts move balance into stake, negative
    /// amounts free staked coins.
    pub async fn create_stake(&self, amount: i64) -> Result<Transaction, ChainError> {
        self.create_transaction(RESERVED_ADDRESS, amount, "").await
    }

    /// Incoming transaction: validate against the soft ledger, pool it, and
    /// mint if the pool just reached capacity.
    pub async fn handle_transaction(&self, tx: Transaction) -> Result<(), ChainError> {
        let mine = self.wallet.lock().owns(&tx);
        let at_capacity = {
            let mut state = self.state.lock();
            let tip_index = state.chain.tip().map(|b| b.index).unwrap_or(0);
            let next = validate_transaction(
                &tx,
                &state.soft_ledger,
                TxContext {
                    block_index: tip_index,
                    validator: None,
                },
            )?;
            state.soft_ledger = next;
            let mut pool = self.mempool.lock();
            pool.push_back(tx.clone());
            pool.len() >= self.capacity
        };
        if mine {
            self.wallet.lock().record_pending(&tx);
        }
        debug!(id = %tx.transaction_id, "transaction pooled");
        if at_capacity {
            self.try_mint().await;
        }
        Ok(())
    }

    /// Mints and broadcasts the next block if this node wins the draw seeded
    /// by the tip hash. A no-op otherwise; some other peer will publish.
    pub async fn try_mint(&self) {
        let Some(my_id) = self.id() else {
            return;
        };
        let (tip, ledger) = {
            let state = self.state.lock();
            let Some(tip) = state.chain.tip().cloned() else {
                return;
            };
            (tip, state.chain_ledger.clone())
        };
        if select_validator(&tip.current_hash, &ledger) != Some(my_id) {
            debug!("not the drawn validator, waiting");
            return;
        }
        let transactions: Vec<Transaction> = {
            let mut pool = self.mempool.lock();
            if pool.len() < self.capacity {
                return;
            }
            pool.drain(..self.capacity).collect()
        };
        let block = build_block(&tip, transactions, self.public_key());
        info!(index = block.index, "minting block");
        let ring = PeerAddr::ring_of(&ledger);
        self.peers.broadcast_block(&ring, &block).await;
    }

    /// Incoming block: commit it onto the tip, or buffer it if its
    /// predecessor has not arrived yet. After a commit, buffered successors
    /// are replayed until no further progress is made.
    pub async fn handle_block(&self, block: Block) -> Result<BlockOutcome, ChainError> {
        let outcome = self.commit_block(block)?;
        if outcome == BlockOutcome::Committed {
            self.reconsider_buffered();
        }
        Ok(outcome)
    }

    fn commit_block(&self, block: Block) -> Result<BlockOutcome, ChainError> {
        if block.current_hash != block.compute_hash() {
            return Err(ChainError::HashMismatch);
        }
        let committed = {
            let mut state = self.state.lock();
            let tip = state
                .chain
                .tip()
                .cloned()
                .ok_or(ChainError::PrevHashMismatch)?;
            if block.previous_hash != tip.current_hash {
                drop(state);
                let mut buffer = self.buffer.lock();
                if !buffer.contains(&block) {
                    debug!(index = block.index, "buffering out-of-order block");
                    buffer.push(block);
                }
                return Ok(BlockOutcome::Buffered);
            }
            let next = validate_block(&block, &tip, &state.chain_ledger)?;
            state.chain.push(block.clone());
            state.chain_ledger = next.clone();
            state.soft_ledger = next;
            block
        };

        {
            let mut wallet = self.wallet.lock();
            for tx in &committed.transactions {
                if wallet.owns(tx) {
                    wallet.confirm(tx, &committed.validator);
                }
            }
        }
        self.filter_mempool(&committed);
        info!(index = committed.index, "block committed");
        Ok(BlockOutcome::Committed)
    }

    /// Drops pooled transactions that the committed block carried, then
    /// revalidates the survivors in arrival order against the fresh chain
    /// ledger; the soft ledger becomes whatever the survivors produce.
    fn filter_mempool(&self, block: &Block) {
        let mut state = self.state.lock();
        let mut pool = self.mempool.lock();
        let mut soft = state.chain_ledger.clone();
        let mut kept = VecDeque::with_capacity(pool.len());
        for tx in pool.drain(..) {
            if block.transactions.contains(&tx) {
                continue;
            }
            match validate_transaction(
                &tx,
                &soft,
                TxContext {
                    block_index: block.index,
                    validator: None,
                },
            ) {
                Ok(next) => {
                    soft = next;
                    kept.push_back(tx);
                }
                Err(e) => debug!(id = %tx.transaction_id, %e, "dropping pooled transaction"),
            }
        }
        *pool = kept;
        state.soft_ledger = soft;
    }

    /// Scans the buffer for a block that now links to the tip and replays it
    /// through the normal commit path, repeating until nothing matches.
    /// Entries at or below the tip can never link again and are pruned.
    fn reconsider_buffered(&self) {
        loop {
            let (tip_hash, tip_index) = {
                let state = self.state.lock();
                match state.chain.tip() {
                    Some(tip) => (tip.current_hash.clone(), tip.index),
                    None => return,
                }
            };
            let candidate = {
                let mut buffer = self.buffer.lock();
                buffer.retain(|b| b.index > tip_index);
                match buffer.iter().position(|b| b.previous_hash == tip_hash) {
                    Some(pos) => Some(buffer.swap_remove(pos)),
                    None => None,
                }
            };
            match candidate {
                Some(block) => {
                    debug!(index = block.index, "replaying buffered block");
                    if let Err(e) = self.commit_block(block) {
                        warn!("buffered block rejected: {e}");
                    }
                }
                None => return,
            }
        }
    }

    /// Installs the ring shipped by the bootstrap and learns this node's id
    /// from it.
    pub fn install_ring(&self, ring: Ledger) {
        let my_id = ring.id_of_key(self.public_key());
        {
            let mut state = self.state.lock();
            state.chain_ledger = ring.clone();
            state.soft_ledger = ring;
        }
        match my_id {
            Some(id) => {
                self.set_id(id);
                info!(id, "ring installed");
            }
            None => warn!("installed a ring that does not contain this node"),
        }
    }

    /// Validates a full chain from empty state and, if this node has no
    /// chain yet, installs it together with the replayed ledger. The
    /// mempool is cleared; pooled transactions predate the new state.
    pub fn install_chain(&self, chain: Chain) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        let ledger = replay_chain(&chain, &state.chain_ledger)?;
        if !state.chain.is_empty() {
            debug!("chain already present, rejecting replacement");
            return Err(ChainError::GenesisInvalid);
        }
        state.chain = chain;
        state.chain_ledger = ledger.clone();
        state.soft_ledger = ledger;
        drop(state);
        self.mempool.lock().clear();
        info!(blocks = self.chain_len(), "chain installed from bootstrap");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bcc_crypto::generate_rsa;

    struct NullPeers;

    #[async_trait]
    impl PeerTransport for NullPeers {
        async fn broadcast_transaction(&self, _ring: &[PeerAddr], _tx: &Transaction) {}
        async fn broadcast_block(&self, _ring: &[PeerAddr], _block: &Block) {}
        async fn share_ring(&self, _peer: &PeerAddr, _ring: &Ledger) -> Result<()> {
            Ok(())
        }
        async fn share_chain(&self, _peer: &PeerAddr, _chain: &Chain) -> Result<()> {
            Ok(())
        }
    }

    fn test_node(total: u64) -> Node {
        Node::new(generate_rsa().unwrap(), 3, total, Arc::new(NullPeers))
    }

    #[test]
    fn bootstrap_creates_a_funded_genesis() {
        let node = test_node(4);
        node.bootstrap_genesis("127.0.0.1", "5000").unwrap();
        assert_eq!(node.id(), Some(0));
        assert_eq!(node.chain_len(), 1);
        assert_eq!(node.soft_balance(), Some(4000));
        assert_eq!(node.soft_stake(), Some(1));
        let genesis = node.last_block().unwrap();
        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.transactions.len(), 1);
        assert_eq!(genesis.transactions[0].sender_address, RESERVED_ADDRESS);
    }

    #[test]
    fn registration_stops_at_n_nodes() {
        let node = test_node(2);
        node.bootstrap_genesis("127.0.0.1", "5000").unwrap();
        let peer = generate_rsa().unwrap();
        let id = node
            .register_peer(peer.public_pem.clone(), "127.0.0.1".into(), "5001".into())
            .unwrap();
        assert_eq!(id, 1);
        let late = generate_rsa().unwrap();
        let err = node
            .register_peer(late.public_pem, "127.0.0.1".into(), "5002".into())
            .unwrap_err();
        assert_eq!(err, ChainError::SystemFull(2));
    }

    #[tokio::test]
    async fn create_transaction_rejects_overdraft() {
        let node = test_node(1);
        node.bootstrap_genesis("127.0.0.1", "5000").unwrap();
        let stranger = generate_rsa().unwrap();
        node.register_peer(
            stranger.public_pem.clone(),
            "127.0.0.1".into(),
            "5001".into(),
        )
        .unwrap_err();
        // Ring of one: send to a key that is not in the ring.
        let err = node
            .create_transaction(&stranger.public_pem, 100_000, "")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChainError::InsufficientBalance { .. } | ChainError::UnknownAccount
        ));
    }

    #[tokio::test]
    async fn duplicate_block_is_parked_not_reapplied() {
        let node = test_node(1);
        node.bootstrap_genesis("127.0.0.1", "5000").unwrap();
        let tip = node.last_block().unwrap();
        let ledger = node.ring_snapshot();
        let validator = select_validator(&tip.current_hash, &ledger).unwrap();
        let validator_key = ledger.key_of_id(validator).unwrap().to_string();

        let tx = node.create_stake(5).await.unwrap();
        let block = build_block(&tip, vec![tx], &validator_key);
        assert_eq!(
            node.handle_block(block.clone()).await.unwrap(),
            BlockOutcome::Committed
        );
        assert_eq!(node.chain_len(), 2);
        // Replaying the same block fails the linkage check and parks it.
        assert_eq!(
            node.handle_block(block).await.unwrap(),
            BlockOutcome::Buffered
        );
        assert_eq!(node.chain_len(), 2);
    }
}
