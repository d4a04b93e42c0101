use std::collections::{BTreeMap, BTreeSet};

use bcc_crypto::{sha256_hex, sign_message, verify_message};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type NodeId = u64;

/// Sentinel address used both as the coinbase sender and as the receiver of
/// stake updates. Never looked up in the ring.
pub const RESERVED_ADDRESS: &str = "0";
/// `previous_hash` of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "1";
/// `validator` of the genesis block.
pub const GENESIS_VALIDATOR: &str = "0";
/// BCCs granted per node at genesis.
pub const GENESIS_GRANT: u64 = 1000;
/// Every account starts with this stake so the first draw is well defined.
pub const INITIAL_STAKE: u64 = 1;
/// A transaction left unconfirmed for more than this many blocks is dropped.
pub const TTL_LIMIT: u64 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: u64, available: u64 },
    #[error("nonce {0} already seen for this sender")]
    NonceReused(u64),
    #[error("transaction created at block {ttl} is stale at block {block_index}")]
    StaleTtl { ttl: u64, block_index: u64 },
    #[error("negative amount outside a stake refund")]
    NegativeNonStake,
    #[error("stake refund {refund} exceeds current stake {stake}")]
    StakeRefundOverflow { refund: u64, stake: u64 },
    #[error("block hash does not match its contents")]
    HashMismatch,
    #[error("previous hash does not match the chain tip")]
    PrevHashMismatch,
    #[error("validator does not match the stake-weighted draw")]
    WrongValidator,
    #[error("genesis block malformed")]
    GenesisInvalid,
    #[error("account not present in the ring")]
    UnknownAccount,
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),
    #[error("system is full, exactly {0} nodes are running")]
    SystemFull(u64),
}

/// A signed value-or-stake transfer. Identity is the hex SHA-256 of the
/// canonical array `[sender, receiver, amount, message, nonce]`; `ttl` and
/// `signature` are deliberately outside the hash so re-broadcasting and
/// signing do not change it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub sender_address: String,
    pub receiver_address: String,
    pub amount: i64,
    pub message: String,
    pub nonce: u64,
    pub ttl: u64,
    pub transaction_id: String,
    pub signature: String,
}

impl Transaction {
    pub fn new(
        sender_address: String,
        receiver_address: String,
        amount: i64,
        message: String,
        nonce: u64,
        ttl: u64,
    ) -> Self {
        let transaction_id = canonical_tx_hash(
            &sender_address,
            &receiver_address,
            amount,
            &message,
            nonce,
        );
        Self {
            sender_address,
            receiver_address,
            amount,
            message,
            nonce,
            ttl,
            transaction_id,
            signature: String::new(),
        }
    }

    /// The unsigned genesis grant from the reserved address to node 0.
    pub fn coinbase(receiver_address: String, amount: i64) -> Self {
        Self::new(
            RESERVED_ADDRESS.to_string(),
            receiver_address,
            amount,
            String::new(),
            0,
            0,
        )
    }

    pub fn is_stake(&self) -> bool {
        self.receiver_address == RESERVED_ADDRESS
    }

    /// The raw digest bytes the signature covers.
    fn digest_bytes(&self) -> Vec<u8> {
        hex::decode(&self.transaction_id).unwrap_or_default()
    }

    pub fn sign(&mut self, private_pem: &str) -> anyhow::Result<()> {
        self.signature = sign_message(private_pem, &self.digest_bytes())?;
        Ok(())
    }

    /// Recomputes the canonical hash and checks the PSS signature under the
    /// sender's key. A transaction whose id was tampered with fails here too.
    pub fn verify_signature(&self) -> bool {
        let expected = canonical_tx_hash(
            &self.sender_address,
            &self.receiver_address,
            self.amount,
            &self.message,
            self.nonce,
        );
        if expected != self.transaction_id {
            return false;
        }
        verify_message(&self.sender_address, &self.digest_bytes(), &self.signature)
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.transaction_id == other.transaction_id
    }
}

impl Eq for Transaction {}

fn canonical_tx_hash(
    sender: &str,
    receiver: &str,
    amount: i64,
    message: &str,
    nonce: u64,
) -> String {
    let encoded =
        serde_json::to_vec(&(sender, receiver, amount, message, nonce)).unwrap();
    sha256_hex(&encoded)
}

/// An ordered batch of transactions chained to its predecessor by hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    pub validator: String,
    pub previous_hash: String,
    pub current_hash: String,
}

impl Block {
    pub fn new(
        index: u64,
        previous_hash: String,
        validator: String,
        transactions: Vec<Transaction>,
    ) -> Self {
        let mut block = Self {
            index,
            timestamp: chrono::Utc::now().timestamp_millis(),
            transactions,
            validator,
            previous_hash,
            current_hash: String::new(),
        };
        block.current_hash = block.compute_hash();
        block
    }

    /// Hash over the canonical array
    /// `[index, timestamp, [tx_ids], validator, previous_hash]`.
    pub fn compute_hash(&self) -> String {
        let tx_ids: Vec<&str> = self
            .transactions
            .iter()
            .map(|tx| tx.transaction_id.as_str())
            .collect();
        let encoded = serde_json::to_vec(&(
            self.index,
            self.timestamp,
            tx_ids,
            &self.validator,
            &self.previous_hash,
        ))
        .unwrap();
        sha256_hex(&encoded)
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.current_hash == other.current_hash
    }
}

impl Eq for Block {}

/// Append-only sequence of committed blocks, genesis first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chain {
    pub blocks: Vec<Block>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// One ring entry: a peer's network coordinates plus its derived account
/// state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: NodeId,
    pub ip: String,
    pub port: String,
    pub public_key: String,
    pub balance: u64,
    pub stake: u64,
    pub nonces: BTreeSet<u64>,
}

impl Account {
    pub fn new(id: NodeId, ip: String, port: String, public_key: String) -> Self {
        Self {
            id,
            ip,
            port,
            public_key,
            balance: 0,
            stake: INITIAL_STAKE,
            nonces: BTreeSet::new(),
        }
    }
}

/// The ring as derived account state: a map from node id to account, cloned
/// wholesale wherever validation needs a scratch copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    accounts: BTreeMap<NodeId, Account>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, account: Account) {
        self.accounts.insert(account.id, account);
    }

    pub fn get(&self, id: NodeId) -> Option<&Account> {
        self.accounts.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Account> {
        self.accounts.get_mut(&id)
    }

    pub fn id_of_key(&self, public_key: &str) -> Option<NodeId> {
        self.accounts
            .values()
            .find(|a| a.public_key == public_key)
            .map(|a| a.id)
    }

    pub fn key_of_id(&self, id: NodeId) -> Option<&str> {
        self.accounts.get(&id).map(|a| a.public_key.as_str())
    }

    pub fn balance_of(&self, id: NodeId) -> Option<u64> {
        self.accounts.get(&id).map(|a| a.balance)
    }

    pub fn stake_of(&self, id: NodeId) -> Option<u64> {
        self.accounts.get(&id).map(|a| a.stake)
    }

    pub fn total_stake(&self) -> u64 {
        self.accounts.values().map(|a| a.stake).sum()
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// The same ring with balances zeroed, stakes reset and nonces cleared;
    /// the starting state for chain replay.
    pub fn zeroed(&self) -> Self {
        let accounts = self
            .accounts
            .values()
            .map(|a| {
                let mut fresh = a.clone();
                fresh.balance = 0;
                fresh.stake = INITIAL_STAKE;
                fresh.nonces.clear();
                (fresh.id, fresh)
            })
            .collect();
        Self { accounts }
    }
}

/// Fee for a regular transfer: 3% of the amount, floored, plus one BCC per
/// message byte. Integer arithmetic only, so every replica agrees.
pub fn transfer_fee(amount: u64, message: &str) -> u64 {
    amount * 3 / 100 + message.len() as u64
}

/// What the sender is debited in total. Stake increases carry no fee.
pub fn total_charge(amount: u64, message: &str, stake: bool) -> u64 {
    if stake {
        amount
    } else {
        amount + transfer_fee(amount, message)
    }
}

/// Where a transaction is being considered: the block index its TTL is
/// measured against (the chain tip when validating live) and the prospective
/// validator who collects fees (none when validating live).
#[derive(Debug, Clone, Copy)]
pub struct TxContext {
    pub block_index: u64,
    pub validator: Option<NodeId>,
}

/// Runs the full check sequence for one transaction against `ledger` and, on
/// success, returns the successor ledger with the transaction applied.
///
/// Check order: signature, TTL freshness, amount sign rule, balance, nonce
/// novelty.
pub fn validate_transaction(
    tx: &Transaction,
    ledger: &Ledger,
    ctx: TxContext,
) -> Result<Ledger, ChainError> {
    if !tx.verify_signature() {
        return Err(ChainError::InvalidSignature);
    }

    if ctx.block_index.saturating_sub(tx.ttl) > TTL_LIMIT {
        return Err(ChainError::StaleTtl {
            ttl: tx.ttl,
            block_index: ctx.block_index,
        });
    }

    let sender = ledger
        .id_of_key(&tx.sender_address)
        .ok_or(ChainError::UnknownAccount)?;

    if tx.amount < 0 {
        if !tx.is_stake() {
            return Err(ChainError::NegativeNonStake);
        }
        let refund = tx.amount.unsigned_abs();
        let stake = ledger.stake_of(sender).unwrap_or(0);
        if refund > stake {
            return Err(ChainError::StakeRefundOverflow { refund, stake });
        }
    } else {
        let needed = total_charge(tx.amount as u64, &tx.message, tx.is_stake());
        let available = ledger.balance_of(sender).unwrap_or(0);
        if available < needed {
            return Err(ChainError::InsufficientBalance { needed, available });
        }
    }

    if ledger
        .get(sender)
        .map(|a| a.nonces.contains(&tx.nonce))
        .unwrap_or(false)
    {
        return Err(ChainError::NonceReused(tx.nonce));
    }

    apply_transaction(tx, ledger, sender, ctx.validator)
}

/// Applies an already-checked transaction to a fresh copy of the ledger.
fn apply_transaction(
    tx: &Transaction,
    ledger: &Ledger,
    sender: NodeId,
    validator: Option<NodeId>,
) -> Result<Ledger, ChainError> {
    let mut next = ledger.clone();

    {
        let account = next.get_mut(sender).ok_or(ChainError::UnknownAccount)?;
        account.nonces.insert(tx.nonce);
    }

    if tx.is_stake() {
        let account = next.get_mut(sender).ok_or(ChainError::UnknownAccount)?;
        if tx.amount < 0 {
            let refund = tx.amount.unsigned_abs();
            account.stake = account
                .stake
                .checked_sub(refund)
                .ok_or(ChainError::StakeRefundOverflow {
                    refund,
                    stake: account.stake,
                })?;
            account.balance += refund;
        } else {
            let amount = tx.amount as u64;
            account.balance =
                account
                    .balance
                    .checked_sub(amount)
                    .ok_or(ChainError::InsufficientBalance {
                        needed: amount,
                        available: account.balance,
                    })?;
            account.stake += amount;
        }
    } else {
        let amount = tx.amount as u64;
        let charge = total_charge(amount, &tx.message, false);
        let fee = charge - amount;
        let receiver = next
            .id_of_key(&tx.receiver_address)
            .ok_or(ChainError::UnknownAccount)?;
        {
            let account = next.get_mut(sender).ok_or(ChainError::UnknownAccount)?;
            account.balance =
                account
                    .balance
                    .checked_sub(charge)
                    .ok_or(ChainError::InsufficientBalance {
                        needed: charge,
                        available: account.balance,
                    })?;
        }
        next.get_mut(receiver)
            .ok_or(ChainError::UnknownAccount)?
            .balance += amount;
        if let Some(validator) = validator {
            next.get_mut(validator)
                .ok_or(ChainError::UnknownAccount)?
                .balance += fee;
        }
    }

    Ok(next)
}
