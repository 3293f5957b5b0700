//! Node-level scenarios: transfers, replay protection, VM transactions,
//! restart recovery and fork resolution.

use rvchain::core::block::{Block, BlockHeader};
use rvchain::core::config::{GlobalConfig, NodeConfig};
use rvchain::core::consensus::{ConsensusState, PERIOD_TIME_NS};
use rvchain::core::node::ChainNode;
use rvchain::core::transaction::{Transaction, TX_TRANSFER, TX_VM_CALL};
use rvchain::crypto::key_pair::PrivateKey;
use rvchain::types::address::Address;
use rvchain::types::hash::Hash;
use rvchain::virtual_machine::asm::{self, CodeBuilder, A0};
use rvchain::virtual_machine::context::RAW_CODE_PC;
use rvchain::virtual_machine::syscall::SYSCALL_TRANSFER;

fn make_genesis(miner: Address) -> (Block, ConsensusState) {
    // Ideal block spacing keeps every retarget a ratio-1 no-op, so the
    // permissive test difficulty stays permissive at any height
    let mut genesis = Block {
        header: BlockHeader::default(),
        miner,
        time: PERIOD_TIME_NS,
        txs: Vec::new(),
    };
    genesis.fill_hash();
    let cs = ConsensusState {
        height: -1,
        last_block_time: 0,
        last_key_block_time: 0,
        difficulty: Hash([0xff; 32]),
    };
    (genesis, cs)
}

struct TestChain {
    node: ChainNode,
    config: NodeConfig,
    global: GlobalConfig,
    _dir: tempfile::TempDir,
}

impl TestChain {
    /// Fresh chain whose genesis reward funds `rich` with 10,000,000.
    fn new(rich: Address) -> TestChain {
        let dir = tempfile::tempdir().unwrap();
        let (genesis, genesis_cs) = make_genesis(rich);
        let config = NodeConfig {
            storage_path: dir.path().to_str().unwrap().to_string(),
            storage_finalize_depth: 10,
            storage_dump_disk_ratio: 0.5,
        };
        let global = GlobalConfig {
            chain_id: 7,
            genesis_block: genesis,
            genesis_consensus_state: genesis_cs,
            genesis_block_reward: 10_000_000,
            block_reward: 0,
            tip1_enable_height: 0,
        };
        let node = ChainNode::new(config.clone(), global.clone(), None).unwrap();
        TestChain {
            node,
            config,
            global,
            _dir: dir,
        }
    }

    /// Shuts the node down (releasing the storage directory) and boots a
    /// fresh one over the same files.
    fn reopened(self) -> TestChain {
        let TestChain {
            node,
            config,
            global,
            _dir,
        } = self;
        drop(node);
        let node = ChainNode::new(config.clone(), global.clone(), None).unwrap();
        TestChain {
            node,
            config,
            global,
            _dir,
        }
    }

    /// Builds, submits and requires acceptance of a block on the current tip.
    fn apply_block(&self, miner: Address, txs: Vec<Transaction>) -> Block {
        let block = self.build_block(miner, txs, Hash::zero());
        let before = self.node.get_highest().unwrap().1.height;
        self.node.submit_block(block.clone()).unwrap();
        let after = self.node.get_highest().unwrap().1.height;
        assert_eq!(after, before + 1, "block was not accepted");
        block
    }

    fn build_block(&self, miner: Address, txs: Vec<Transaction>, extra: Hash) -> Block {
        let (tip, tip_cs) = self.node.get_highest().unwrap();
        let mut block = Block {
            header: BlockHeader {
                parent_hash: tip.header.hash,
                extra_data: extra,
                ..Default::default()
            },
            miner,
            time: tip_cs.last_block_time + PERIOD_TIME_NS,
            txs,
        };
        block.fill_hash();
        block
    }

    fn balance(&self, addr: &Address) -> u64 {
        self.node.get_account_info(addr).balance
    }
}

fn transfer_tx(key: &PrivateKey, to: Address, value: u64, fee: u64, nonce: u64) -> Transaction {
    let mut tx = Transaction {
        tx_type: TX_TRANSFER,
        sender_pubkey: Default::default(),
        sender_sig: Default::default(),
        receiver: to,
        value,
        gas_limit: 1_000_000,
        fee,
        nonce,
        data: Vec::new(),
    };
    tx.sign(key);
    tx
}

fn vm_tx(key: &PrivateKey, code: Vec<u8>, gas_limit: u64, fee: u64, nonce: u64) -> Transaction {
    let mut tx = Transaction {
        tx_type: TX_VM_CALL,
        sender_pubkey: Default::default(),
        sender_sig: Default::default(),
        receiver: Address::zero(),
        value: 0,
        gas_limit,
        fee,
        nonce,
        data: code,
    };
    tx.sign(key);
    tx
}

fn miner_addr() -> Address {
    Address([0xCC; 32])
}

#[test]
fn self_transfer_round_trip() {
    let a = PrivateKey::generate();
    let b = PrivateKey::generate();
    let a_addr = a.public_key().address();
    let b_addr = b.public_key().address();

    let chain = TestChain::new(a_addr);
    assert_eq!(chain.balance(&a_addr), 10_000_000);

    chain.apply_block(
        miner_addr(),
        vec![transfer_tx(&a, b_addr, 500_000, 100_000, 0)],
    );
    chain.apply_block(
        miner_addr(),
        vec![transfer_tx(&b, a_addr, 100_000, 100_000, 0)],
    );

    assert_eq!(chain.balance(&a_addr), 9_500_000);
    assert_eq!(chain.balance(&b_addr), 300_000);
    // Fees landed with the miner; nothing minted, nothing burned
    assert_eq!(chain.balance(&miner_addr()), 200_000);
    assert_eq!(
        chain.balance(&a_addr) + chain.balance(&b_addr) + chain.balance(&miner_addr()),
        10_000_000
    );
}

#[test]
fn nonce_replay_is_rejected() {
    let a = PrivateKey::generate();
    let b = PrivateKey::generate();
    let a_addr = a.public_key().address();

    let chain = TestChain::new(a_addr);
    let tx = transfer_tx(&a, b.public_key().address(), 500_000, 100_000, 0);
    chain.apply_block(miner_addr(), vec![tx.clone()]);

    // Replaying the same transaction fails the whole block
    let replay = chain.build_block(miner_addr(), vec![tx], Hash::zero());
    let before = chain.node.get_highest().unwrap().1.height;
    chain.node.submit_block(replay).unwrap();
    assert_eq!(chain.node.get_highest().unwrap().1.height, before);
    assert_eq!(chain.balance(&a_addr), 9_400_000);
}

/// Raw code transferring 500,000 from the origin to a fixed address.
fn transfer_contract(target: Address) -> Vec<u8> {
    let mut b = CodeBuilder::new();
    let target_off = b.embedded_data(target.as_slice());
    b.push(asm::addi(8, asm::RA, 0)); // syscalls clobber ra
    b.li64(A0, RAW_CODE_PC + target_off as u64);
    b.li64(11, 500_000);
    b.li(12, 0);
    b.li(13, 0);
    b.syscall(SYSCALL_TRANSFER);
    b.push(asm::addi(asm::RA, 8, 0));
    b.push(asm::ret());
    b.build()
}

#[test]
fn vm_self_send_via_transfer_syscall() {
    let a = PrivateKey::generate();
    let a_addr = a.public_key().address();
    let target = Address([0xEE; 32]);

    let chain = TestChain::new(a_addr);
    chain.apply_block(
        miner_addr(),
        vec![vm_tx(&a, transfer_contract(target), 100_000, 100_000, 0)],
    );

    assert_eq!(chain.balance(&a_addr), 9_400_000);
    assert_eq!(chain.balance(&target), 500_000);
    assert_eq!(chain.balance(&miner_addr()), 100_000);
}

#[test]
fn vm_failure_still_consumes_the_fee() {
    let a = PrivateKey::generate();
    let a_addr = a.public_key().address();
    let target = Address([0xEE; 32]);

    let chain = TestChain::new(a_addr);
    // Not enough gas to reach the transfer; the fee is charged regardless
    chain.apply_block(
        miner_addr(),
        vec![vm_tx(&a, transfer_contract(target), 10_000, 100_000, 0)],
    );

    assert_eq!(chain.balance(&a_addr), 9_900_000);
    assert_eq!(chain.balance(&target), 0);
    assert_eq!(chain.node.get_account_info(&a_addr).nonce, 1);
}

#[test]
fn type2_disabled_before_tip1_height() {
    let a = PrivateKey::generate();
    let a_addr = a.public_key().address();

    let mut chain = TestChain::new(a_addr);
    chain.global.tip1_enable_height = 100;
    // Rebuild the node with the stricter config on a fresh directory
    let dir = tempfile::tempdir().unwrap();
    chain.config.storage_path = dir.path().to_str().unwrap().to_string();
    let chain = chain.reopened();

    let block = chain.build_block(
        miner_addr(),
        vec![vm_tx(
            &a,
            transfer_contract(Address([0xEE; 32])),
            100_000,
            100_000,
            0,
        )],
        Hash::zero(),
    );
    let before = chain.node.get_highest().unwrap().1.height;
    chain.node.submit_block(block).unwrap();
    assert_eq!(chain.node.get_highest().unwrap().1.height, before);
    let _ = dir;
}

#[test]
fn candidate_assembly_keeps_only_valid_transactions() {
    let a = PrivateKey::generate();
    let b = PrivateKey::generate();
    let a_addr = a.public_key().address();

    let chain = TestChain::new(a_addr);

    // Valid, replayable and unfunded transactions all sit in the pool
    chain
        .node
        .submit_tx(transfer_tx(&a, b.public_key().address(), 1_000, 500, 0))
        .unwrap();
    chain
        .node
        .submit_tx(transfer_tx(&b, a_addr, 1_000, 900, 0))
        .unwrap();

    let candidate = chain.node.get_block_candidate(miner_addr()).unwrap();
    assert_eq!(candidate.txs.len(), 1);
    assert_eq!(candidate.txs[0].fee, 500);
    assert_eq!(candidate.header.parent_hash, chain.global.genesis_block.header.hash);

    // The candidate is a valid block as-is
    chain.node.submit_block(candidate).unwrap();
    assert_eq!(chain.node.get_highest().unwrap().1.height, 1);
}

#[test]
fn restart_recovers_the_highest_chain() {
    let a = PrivateKey::generate();
    let b = PrivateKey::generate();
    let a_addr = a.public_key().address();
    let b_addr = b.public_key().address();

    let chain = TestChain::new(a_addr);
    for i in 0..30u64 {
        let txs = if i == 0 {
            vec![transfer_tx(&a, b_addr, 500_000, 100_000, 0)]
        } else {
            Vec::new()
        };
        chain.apply_block(miner_addr(), txs);
    }
    let (tip_before, cs_before) = chain.node.get_highest().unwrap();
    assert_eq!(cs_before.height, 30);

    let chain = chain.reopened();

    let (tip_after, cs_after) = chain.node.get_highest().unwrap();
    assert_eq!(tip_after.header.hash, tip_before.header.hash);
    assert_eq!(cs_after, cs_before);
    assert_eq!(chain.balance(&b_addr), 500_000);

    // Finalized heights remain readable after the restart
    for height in [1i64, 5, 10] {
        let block = chain.node.get_block(height).unwrap();
        assert_ne!(block.header.hash, Hash::zero());
    }
}

#[test]
fn fork_resolution_converges_to_the_deeper_chain() {
    let a_addr = Address([0xAA; 32]);
    let chain = TestChain::new(a_addr);

    // A 7-block chain becomes the tip first
    for _ in 0..7 {
        chain.apply_block(miner_addr(), Vec::new());
    }
    assert_eq!(chain.node.get_highest().unwrap().1.height, 7);

    // A competing 17-block chain built straight from genesis
    let mut parent_hash = chain.global.genesis_block.header.hash;
    let mut time = chain.global.genesis_block.time;
    let mut alt_blocks = Vec::new();
    for i in 0..17u64 {
        let mut block = Block {
            header: BlockHeader {
                parent_hash,
                extra_data: Hash::digest(format!("alt-{}", i).as_bytes()),
                ..Default::default()
            },
            miner: Address([0xBB; 32]),
            time: time + PERIOD_TIME_NS,
            txs: Vec::new(),
        };
        block.fill_hash();
        parent_hash = block.header.hash;
        time = block.time;
        alt_blocks.push(block);
    }

    // Deliver out of order: children first, then the missing ancestors
    for block in alt_blocks.iter().rev() {
        chain.node.submit_block(block.clone()).unwrap();
    }

    let (tip, cs) = chain.node.get_highest().unwrap();
    assert_eq!(cs.height, 17);
    assert_eq!(tip.header.hash, alt_blocks.last().unwrap().header.hash);
    assert!(cs.height >= 15);
}
