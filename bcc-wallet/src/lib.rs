use bcc_core::{Ledger, Transaction};
use bcc_crypto::KeyMaterial;
use serde::{Deserialize, Serialize};

/// Read-only view of account state, handed to the wallet instead of a back
/// pointer into the node.
pub trait LedgerView {
    fn balance_of_key(&self, public_key: &str) -> Option<u64>;
    fn stake_of_key(&self, public_key: &str) -> Option<u64>;
}

impl LedgerView for Ledger {
    fn balance_of_key(&self, public_key: &str) -> Option<u64> {
        self.id_of_key(public_key).and_then(|id| self.balance_of(id))
    }

    fn stake_of_key(&self, public_key: &str) -> Option<u64> {
        self.id_of_key(public_key).and_then(|id| self.stake_of(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Unconfirmed,
    Confirmed,
}

/// One wallet history line: the transaction, who minted the block it landed
/// in, and whether it has landed at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRecord {
    pub transaction: Transaction,
    pub validator: Option<String>,
    pub status: TxStatus,
}

/// The node's wallet: its keypair plus the history of transactions it sent
/// or received. Balance and stake are not stored; they are read through a
/// [`LedgerView`] on demand.
#[derive(Debug)]
pub struct Wallet {
    keys: KeyMaterial,
    records: Vec<WalletRecord>,
}

impl Wallet {
    pub fn new(keys: KeyMaterial) -> Self {
        Self {
            keys,
            records: Vec::new(),
        }
    }

    pub fn public_key(&self) -> &str {
        &self.keys.public_pem
    }

    pub fn private_key(&self) -> &str {
        &self.keys.private_pem
    }

    pub fn owns(&self, tx: &Transaction) -> bool {
        tx.sender_address == self.keys.public_pem || tx.receiver_address == self.keys.public_pem
    }

    /// Records a transaction seen in the pool but not yet in a block. A
    /// record already present (matched by transaction id) is left alone.
    pub fn record_pending(&mut self, tx: &Transaction) {
        if self.records.iter().any(|r| r.transaction == *tx) {
            return;
        }
        self.records.push(WalletRecord {
            transaction: tx.clone(),
            validator: None,
            status: TxStatus::Unconfirmed,
        });
    }

    /// Flips a record to confirmed once its block commits, inserting one if
    /// the transaction was never seen in the pool.
    pub fn confirm(&mut self, tx: &Transaction, validator_key: &str) {
        match self.records.iter_mut().find(|r| r.transaction == *tx) {
            Some(record) => {
                record.validator = Some(validator_key.to_string());
                record.status = TxStatus::Confirmed;
            }
            None => self.records.push(WalletRecord {
                transaction: tx.clone(),
                validator: Some(validator_key.to_string()),
                status: TxStatus::Confirmed,
            }),
        }
    }

    pub fn records(&self) -> &[WalletRecord] {
        &self.records
    }

    pub fn balance(&self, view: &dyn LedgerView) -> Option<u64> {
        view.balance_of_key(self.public_key())
    }

    pub fn stake(&self, view: &dyn LedgerView) -> Option<u64> {
        view.stake_of_key(self.public_key())
    }
}
