use bcc_core::{
    validate_transaction, Block, Chain, ChainError, Ledger, NodeId, Transaction, TxContext,
    GENESIS_GRANT, GENESIS_PREVIOUS_HASH, GENESIS_VALIDATOR, RESERVED_ADDRESS,
};
use bcc_crypto::sha256_hex;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use tracing::debug;

/// Turns a hex seed hash into 32 seed bytes. Hashes are 64 nibbles already;
/// shorter values (the genesis sentinel `"1"`) are left-padded, matching the
/// big-endian integer interpretation the draw is specified over.
fn seed_bytes(seed_hash: &str) -> [u8; 32] {
    let trimmed = seed_hash.trim();
    let padded = if trimmed.len() <= 64 {
        format!("{trimmed:0>64}")
    } else {
        trimmed[trimmed.len() - 64..].to_string()
    };
    let raw = match hex::decode(&padded) {
        Ok(raw) if raw.len() == 32 => raw,
        // Non-hex seeds cannot come from a well-formed block, but a stray
        // value must still map to a deterministic draw on every replica.
        _ => hex::decode(sha256_hex(trimmed.as_bytes())).unwrap_or_default(),
    };
    let mut seed = [0u8; 32];
    if raw.len() == 32 {
        seed.copy_from_slice(&raw);
    }
    seed
}

/// The stake-weighted draw. Every replica seeds a `Pcg64` with the same block
/// hash and walks the same cumulative distribution in ascending id order, so
/// all of them name the same validator. `None` when the ring holds no stake.
///
/// The PRNG choice is a compatibility contract: changing it forks the chain.
pub fn select_validator(seed_hash: &str, ledger: &Ledger) -> Option<NodeId> {
    let total = ledger.total_stake();
    if total == 0 {
        return None;
    }
    let mut rng = Pcg64::from_seed(seed_bytes(seed_hash));
    let draw: f64 = rng.gen();

    let mut cumulative = 0.0;
    let mut last = None;
    for account in ledger.accounts() {
        cumulative += account.stake as f64 / total as f64;
        last = Some(account.id);
        if draw <= cumulative {
            debug!(id = account.id, draw, "validator drawn");
            return Some(account.id);
        }
    }
    // Rounding can leave the final cumulative step a hair under 1.0.
    last
}

/// The one-transaction block every chain starts from: the reserved sender
/// grants node 0 the whole 1000·N supply.
pub fn genesis_block(node0_key: &str, total_nodes: u64) -> Block {
    let coinbase = Transaction::coinbase(
        node0_key.to_string(),
        (GENESIS_GRANT * total_nodes) as i64,
    );
    Block::new(
        0,
        GENESIS_PREVIOUS_HASH.to_string(),
        GENESIS_VALIDATOR.to_string(),
        vec![coinbase],
    )
}

pub fn build_block(tip: &Block, transactions: Vec<Transaction>, validator_key: &str) -> Block {
    Block::new(
        tip.index + 1,
        tip.current_hash.clone(),
        validator_key.to_string(),
        transactions,
    )
}

/// Checks a block against the tip it claims to extend and the ledger it
/// would be applied to, and returns the resulting ledger.
///
/// `PrevHashMismatch` is the one recoverable outcome: the caller buffers the
/// block instead of dropping it.
pub fn validate_block(block: &Block, tip: &Block, ledger: &Ledger) -> Result<Ledger, ChainError> {
    if block.current_hash != block.compute_hash() {
        return Err(ChainError::HashMismatch);
    }
    if block.previous_hash != tip.current_hash {
        return Err(ChainError::PrevHashMismatch);
    }
    let validator = ledger
        .id_of_key(&block.validator)
        .ok_or(ChainError::WrongValidator)?;
    if select_validator(&block.previous_hash, ledger) != Some(validator) {
        return Err(ChainError::WrongValidator);
    }

    let mut state = ledger.clone();
    for tx in &block.transactions {
        state = validate_transaction(
            tx,
            &state,
            TxContext {
                block_index: block.index,
                validator: Some(validator),
            },
        )?;
    }
    Ok(state)
}

/// Replays a full chain from zeroed account state, as a joining node does.
/// The genesis block is checked structurally; every later block goes through
/// [`validate_block`]. All-or-nothing: any failure rejects the whole chain.
pub fn replay_chain(chain: &Chain, ring: &Ledger) -> Result<Ledger, ChainError> {
    let mut ledger = ring.zeroed();
    let genesis = chain.blocks.first().ok_or(ChainError::GenesisInvalid)?;

    if genesis.index != 0
        || genesis.previous_hash != GENESIS_PREVIOUS_HASH
        || genesis.current_hash != genesis.compute_hash()
        || genesis.transactions.len() != 1
    {
        return Err(ChainError::GenesisInvalid);
    }
    let node0_key = ledger
        .key_of_id(0)
        .ok_or(ChainError::GenesisInvalid)?
        .to_string();
    let coinbase = &genesis.transactions[0];
    let grant = (GENESIS_GRANT * ledger.len() as u64) as i64;
    if coinbase.sender_address != RESERVED_ADDRESS
        || coinbase.receiver_address != node0_key
        || coinbase.amount != grant
        || !coinbase.message.is_empty()
        || coinbase.nonce != 0
    {
        return Err(ChainError::GenesisInvalid);
    }
    {
        let node0 = ledger.get_mut(0).ok_or(ChainError::GenesisInvalid)?;
        node0.balance += grant as u64;
        node0.nonces.insert(0);
    }

    for pair in chain.blocks.windows(2) {
        ledger = validate_block(&pair[1], &pair[0], &ledger)?;
    }
    Ok(ledger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcc_core::Account;
    use bcc_crypto::{generate_rsa, KeyMaterial};

    fn ring_of(keys: &[&KeyMaterial]) -> Ledger {
        let mut ledger = Ledger::new();
        for (id, key) in keys.iter().enumerate() {
            ledger.insert(Account::new(
                id as u64,
                "127.0.0.1".into(),
                format!("500{id}"),
                key.public_pem.clone(),
            ));
        }
        ledger
    }

    #[test]
    fn draw_is_deterministic() {
        let keys: Vec<_> = (0..4).map(|_| generate_rsa().unwrap()).collect();
        let ledger = ring_of(&keys.iter().collect::<Vec<_>>());
        let seed = sha256_hex(b"tip");
        let a = select_validator(&seed, &ledger);
        let b = select_validator(&seed, &ledger);
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn draw_accepts_the_genesis_sentinel_seed() {
        let keys: Vec<_> = (0..3).map(|_| generate_rsa().unwrap()).collect();
        let ledger = ring_of(&keys.iter().collect::<Vec<_>>());
        assert!(select_validator(GENESIS_PREVIOUS_HASH, &ledger).is_some());
    }

    #[test]
    fn draw_follows_the_stake() {
        let keys: Vec<_> = (0..3).map(|_| generate_rsa().unwrap()).collect();
        let mut ledger = ring_of(&keys.iter().collect::<Vec<_>>());
        for id in 0..3 {
            ledger.get_mut(id).unwrap().stake = 0;
        }
        ledger.get_mut(1).unwrap().stake = 10;
        for salt in 0..16u8 {
            let seed = sha256_hex(&[salt]);
            assert_eq!(select_validator(&seed, &ledger), Some(1));
        }
    }

    #[test]
    fn empty_stake_has_no_validator() {
        let keys: Vec<_> = (0..2).map(|_| generate_rsa().unwrap()).collect();
        let mut ledger = ring_of(&keys.iter().collect::<Vec<_>>());
        for id in 0..2 {
            ledger.get_mut(id).unwrap().stake = 0;
        }
        assert_eq!(select_validator(&sha256_hex(b"x"), &ledger), None);
    }

    fn two_node_chain() -> (Vec<KeyMaterial>, Ledger, Chain, Ledger) {
        let keys: Vec<_> = (0..2).map(|_| generate_rsa().unwrap()).collect();
        let ledger = ring_of(&keys.iter().collect::<Vec<_>>());
        let genesis = genesis_block(&keys[0].public_pem, 2);

        let mut after_genesis = ledger.zeroed();
        {
            let node0 = after_genesis.get_mut(0).unwrap();
            node0.balance += 2 * GENESIS_GRANT;
            node0.nonces.insert(0);
        }

        let validator = select_validator(&genesis.current_hash, &after_genesis).unwrap();
        let validator_key = after_genesis.key_of_id(validator).unwrap().to_string();
        let mut tx = Transaction::new(
            keys[0].public_pem.clone(),
            keys[1].public_pem.clone(),
            1000,
            String::new(),
            1,
            0,
        );
        tx.sign(&keys[0].private_pem).unwrap();
        let block = build_block(&genesis, vec![tx], &validator_key);

        let mut chain = Chain::new();
        chain.push(genesis);
        chain.push(block);
        (keys, ledger, chain, after_genesis)
    }

    #[test]
    fn replay_equals_incremental_commit() {
        let (_keys, ring, chain, after_genesis) = two_node_chain();
        let incremental =
            validate_block(&chain.blocks[1], &chain.blocks[0], &after_genesis).unwrap();
        let replayed = replay_chain(&chain, &ring).unwrap();
        assert_eq!(incremental, replayed);
    }

    #[test]
    fn replay_rejects_a_tampered_genesis() {
        let (_keys, ring, mut chain, _) = two_node_chain();
        chain.blocks[0].transactions[0].amount = 1;
        let err = replay_chain(&chain, &ring).unwrap_err();
        assert_eq!(err, ChainError::GenesisInvalid);
    }

    #[test]
    fn wrong_validator_is_rejected() {
        let (keys, _ring, chain, after_genesis) = two_node_chain();
        let drawn = select_validator(&chain.blocks[0].current_hash, &after_genesis).unwrap();
        let imposter = &keys[(drawn as usize + 1) % 2];
        let forged = build_block(
            &chain.blocks[0],
            chain.blocks[1].transactions.clone(),
            &imposter.public_pem,
        );
        let err = validate_block(&forged, &chain.blocks[0], &after_genesis).unwrap_err();
        assert_eq!(err, ChainError::WrongValidator);
    }

    #[test]
    fn unlinked_block_reports_prev_hash_mismatch() {
        let (_keys, _ring, chain, after_genesis) = two_node_chain();
        let mut stray = chain.blocks[1].clone();
        stray.previous_hash = sha256_hex(b"elsewhere");
        stray.current_hash = stray.compute_hash();
        let err = validate_block(&stray, &chain.blocks[0], &after_genesis).unwrap_err();
        assert_eq!(err, ChainError::PrevHashMismatch);
    }

    #[test]
    fn tampered_block_reports_hash_mismatch() {
        let (_keys, _ring, chain, after_genesis) = two_node_chain();
        let mut tampered = chain.blocks[1].clone();
        tampered.transactions.clear();
        let err = validate_block(&tampered, &chain.blocks[0], &after_genesis).unwrap_err();
        assert_eq!(err, ChainError::HashMismatch);
    }

    #[test]
    fn validator_collects_the_fees_on_replay() {
        let keys: Vec<_> = (0..2).map(|_| generate_rsa().unwrap()).collect();
        let ledger = ring_of(&keys.iter().collect::<Vec<_>>());
        let genesis = genesis_block(&keys[0].public_pem, 2);

        let mut after_genesis = ledger.zeroed();
        {
            let node0 = after_genesis.get_mut(0).unwrap();
            node0.balance += 2 * GENESIS_GRANT;
            node0.nonces.insert(0);
        }
        let validator = select_validator(&genesis.current_hash, &after_genesis).unwrap();
        let validator_key = after_genesis.key_of_id(validator).unwrap().to_string();
        let mut tx = Transaction::new(
            keys[0].public_pem.clone(),
            keys[1].public_pem.clone(),
            100,
            "hi".into(),
            1,
            0,
        );
        tx.sign(&keys[0].private_pem).unwrap();
        let block = build_block(&genesis, vec![tx], &validator_key);
        let state = validate_block(&block, &genesis, &after_genesis).unwrap();

        // Conservation: grant plus initial stakes = balances + stakes, fees
        // included via the validator's balance.
        let total: u64 = state.accounts().map(|a| a.balance + a.stake).sum();
        assert_eq!(total, 2 * GENESIS_GRANT + 2 * bcc_core::INITIAL_STAKE);
    }
}
