//! Multi-engine scenarios

use crate::*;
use ed25519_dalek::SigningKey;
use powchain_admission::{prepare_submission, ProblemInstance, ReferenceSolver, Solver, TierLimiter};
use powchain_codec::{
    address_of, Account, Address, Block, ProblemRef, ProofKind, Tier, Transaction, H256,
};
use parking_lot::RwLock;
use powchain_runtime::{
    ChainStore, FeeSplit, MemoryBlobStore, MemoryStore, MempoolConfig, MempoolHandle,
    MempoolService,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ALICE: u8 = 9;
const BOB: H256 = H256([5; 32]);
const TREASURY: H256 = H256([0xee; 32]);

fn key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

fn addr(seed: u8) -> Address {
    address_of(&key(seed))
}

fn config() -> EngineConfig {
    EngineConfig {
        treasury: TREASURY,
        genesis_allocations: vec![Account::with_balance(addr(ALICE), 10_000_000)],
        ..Default::default()
    }
}

fn engine_with(
    seed: u8,
    validators: &[u8],
    store: Arc<MemoryStore>,
    config: EngineConfig,
) -> ConsensusEngine<MemoryStore> {
    ConsensusEngine::builder()
        .identity(key(seed))
        .validators(validators.iter().map(|s| addr(*s)).collect())
        .store(store)
        .config(config)
        .build()
        .unwrap()
}

fn engine(seed: u8, validators: &[u8]) -> ConsensusEngine<MemoryStore> {
    engine_with(seed, validators, Arc::new(MemoryStore::new()), config())
}

fn transfer(nonce: u64) -> Transaction {
    // fee = 1 * 100_000
    Transaction::signed(&key(ALICE), BOB, 1_000, nonce, 100_000, 1)
}

fn tip_block(engine: &ConsensusEngine<MemoryStore>) -> Block {
    engine
        .store()
        .get_block(engine.tip().index)
        .unwrap()
        .unwrap()
}

/// Solve a size-10 problem for the engine's next height and queue the proof
fn mine_for(engine: &mut ConsensusEngine<MemoryStore>, miner_seed: u8) {
    let problem = ProblemRef {
        kind: ProofKind::SubsetSum,
        tier: Tier::Tier1,
        size: 10,
        parent_hash: engine.tip().hash(),
        block_index: engine.next_height(),
    };
    let instance = ProblemInstance::derive(&problem);
    let limits = *TierLimiter::default().limits(problem.tier);
    let solution = ReferenceSolver
        .solve(&instance, &limits, Instant::now() + Duration::from_secs(30))
        .unwrap();
    let (commitment, reveal) = prepare_submission(
        &[miner_seed; 32],
        H256([miner_seed; 32]),
        problem,
        solution,
    );

    let binder = engine.binder();
    binder.submit_commitment(&commitment).unwrap();
    let admitted = binder.admit_reveal(&reveal, &ReferenceSolver, None).unwrap();
    assert!(engine.submit_proof(admitted));
}

#[test]
fn test_single_validator_settles_fees() {
    let mut engine = engine(1, &[1]);
    let info = engine.propose(&[transfer(1)], 1_000).unwrap();

    assert_eq!(info.index, 1);
    assert_eq!(info.senders, vec![addr(ALICE)]);
    assert_eq!(
        info.fees,
        FeeSplit {
            validator: 41_420,
            burn: 29_290,
            treasury: 29_290,
        }
    );

    let store = engine.store();
    assert_eq!(store.get_account(&addr(ALICE)).unwrap().balance, 10_000_000 - 101_000);
    assert_eq!(store.get_account(&addr(ALICE)).unwrap().nonce, 1);
    assert_eq!(store.get_account(&BOB).unwrap().balance, 1_000);
    assert_eq!(store.get_account(&addr(1)).unwrap().balance, 41_420);
    assert_eq!(store.get_account(&TREASURY).unwrap().balance, 29_290);

    let stats = engine.stats();
    assert_eq!(stats.total_burned, 29_290);
    assert_eq!(stats.total_fees, 100_000);
    assert_eq!(stats.blocks_proposed, 1);
    assert_eq!(stats.state, EngineState::Committed);
}

#[test]
fn test_three_validators_rotate_and_agree() {
    let mut engines = vec![engine(1, &[1, 2, 3]), engine(2, &[1, 2, 3]), engine(3, &[1, 2, 3])];
    let order = [1u8, 2, 3];

    for height in 1..=6u64 {
        let proposer = engines
            .iter()
            .position(|e| e.is_my_slot(height))
            .unwrap();
        let info = engines[proposer].propose(&[], height * 10).unwrap();
        assert_eq!(info.index, height);
        let block = tip_block(&engines[proposer]);
        assert_eq!(block.proposer, addr(order[(height % 3) as usize]));

        for (i, other) in engines.iter_mut().enumerate() {
            if i != proposer {
                assert!(matches!(
                    other.import_block(block.clone()),
                    Ok(ImportOutcome::Extended(_))
                ));
            }
        }
    }

    let tip = engines[0].tip().clone();
    assert_eq!(tip.index, 6);
    assert_eq!(tip.cumulative_work, 7);
    assert!(engines.iter().all(|e| e.tip() == &tip));
    assert_eq!(engines[1].stats().blocks_proposed, 2);
    assert_eq!(engines[1].stats().blocks_imported, 4);
}

#[test]
fn test_block_carries_admitted_proof() {
    let mut producer = engine(1, &[1]);
    let mut follower = engine(2, &[1]);

    mine_for(&mut producer, 4);
    let info = producer.propose(&[transfer(1)], 10).unwrap();
    assert_eq!(info.cumulative_work, 1 + 1024);

    let block = tip_block(&producer);
    assert_eq!(block.header.work_score, 1024);
    assert_eq!(block.header.tier, Tier::Tier1);
    assert!(block.proof.is_some());
    assert_eq!(
        block.header.problem_commitment,
        block.proof.as_ref().map(|p| p.commitment)
    );

    assert!(matches!(
        follower.import_block(block.clone()),
        Ok(ImportOutcome::Extended(_))
    ));
    assert_eq!(follower.tip().cumulative_work, 1025);
    assert_eq!(follower.stats().proofs_included, 1);

    // A block moved to another height no longer matches its signature
    let mut tampered = block;
    tampered.header.index = 2;
    assert!(follower.import_block(tampered).is_err());
}

#[test]
fn test_heavier_branch_reorganizes_and_returns_transactions() {
    // One validator key signs a light block on one store and a heavy one on another
    let mut light = engine(1, &[1]);
    let mut heavy = engine(1, &[1]);

    light.propose(&[transfer(1)], 10).unwrap();
    let light_block = tip_block(&light);
    assert_eq!(light.store().get_account(&BOB).unwrap().balance, 1_000);

    mine_for(&mut heavy, 4);
    heavy.propose(&[], 10).unwrap();
    let heavy_block = tip_block(&heavy);

    let outcome = light.import_block(heavy_block.clone()).unwrap();
    match outcome {
        ImportOutcome::Reorganized {
            depth,
            committed,
            reverted,
        } => {
            assert_eq!(depth, 1);
            assert_eq!(committed.len(), 1);
            assert_eq!(committed[0].hash, heavy_block.hash());
            assert_eq!(reverted, vec![transfer(1)]);
        }
        other => panic!("expected a reorganization, got {:?}", other),
    }

    assert_eq!(light.tip(), heavy.tip());
    assert_eq!(light.store().get_block(1).unwrap().unwrap(), heavy_block);
    // The reverted transfer is undone, fees included
    assert_eq!(light.store().get_account(&BOB).unwrap().balance, 0);
    assert_eq!(
        light.store().get_account(&addr(ALICE)).unwrap().balance,
        10_000_000
    );
    assert_eq!(light.store().get_account(&addr(ALICE)).unwrap().nonce, 0);
    let stats = light.stats();
    assert_eq!(stats.reorgs, 1);
    assert_eq!(stats.deepest_reorg, 1);
    assert_eq!(stats.total_burned, 0);
    assert_eq!(stats.side_blocks, 1);

    // Signing both blocks at height 1 is a double proposal
    let records = light.slashing().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].validator, addr(1));
    assert!(matches!(
        records[0].offense,
        Offense::DoubleProposal { height: 1, .. }
    ));

    // The heavy side keeps its chain and files the light block away
    assert_eq!(
        heavy.import_block(light_block.clone()),
        Ok(ImportOutcome::SideChain {
            index: 1,
            hash: light_block.hash(),
        })
    );
    assert_eq!(heavy.tip().hash(), heavy_block.hash());
}

#[test]
fn test_equal_work_forks_converge_on_lowest_hash() {
    let mut a = engine(1, &[1]);
    let mut b = engine(1, &[1]);
    a.propose(&[], 10).unwrap();
    b.propose(&[], 20).unwrap();
    let block_a = tip_block(&a);
    let block_b = tip_block(&b);
    assert_ne!(block_a.hash(), block_b.hash());

    let outcome_a = a.import_block(block_b.clone()).unwrap();
    let outcome_b = b.import_block(block_a.clone()).unwrap();

    let winner = block_a.hash().min(block_b.hash());
    assert_eq!(a.tip().hash(), winner);
    assert_eq!(b.tip().hash(), winner);

    let reorgs = [&outcome_a, &outcome_b]
        .iter()
        .filter(|o| matches!(o, ImportOutcome::Reorganized { .. }))
        .count();
    let sides = [&outcome_a, &outcome_b]
        .iter()
        .filter(|o| matches!(o, ImportOutcome::SideChain { .. }))
        .count();
    assert_eq!((reorgs, sides), (1, 1));
}

#[test]
fn test_out_of_slot_block_is_refused_and_recorded() {
    // Validator 1 believes it is alone; validator 2 knows height 1 is its own
    let mut rogue = engine(1, &[1]);
    let mut honest = engine(2, &[1, 2]);

    rogue.propose(&[], 10).unwrap();
    let block = tip_block(&rogue);

    let err = honest.import_block(block.clone()).unwrap_err();
    assert_eq!(
        err,
        ConsensusError::NotProposer {
            height: 1,
            expected: addr(2),
            got: addr(1),
        }
    );
    assert!(honest.import_block(block).is_err());
    assert_eq!(honest.tip().index, 0);

    let records = honest.slashing().records_for(&addr(1));
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].offense,
        Offense::OutOfSlot {
            height: 1,
            expected: addr(2),
        }
    );
    assert_eq!(honest.slashing().penalty_score(&addr(1)), 10);
}

#[test]
fn test_reorg_beyond_limit_is_refused() {
    let mut shallow = engine_with(
        1,
        &[1],
        Arc::new(MemoryStore::new()),
        EngineConfig {
            max_reorg_depth: 1,
            ..config()
        },
    );
    let mut heavy = engine(1, &[1]);

    shallow.propose(&[], 10).unwrap();
    shallow.propose(&[], 20).unwrap();
    mine_for(&mut heavy, 4);
    heavy.propose(&[], 10).unwrap();

    let err = shallow.import_block(tip_block(&heavy)).unwrap_err();
    assert!(matches!(err, ConsensusError::ReorgTooDeep { depth: 2, .. }));
    assert_eq!(shallow.tip().index, 2);
    assert!(!shallow.is_halted());
}

#[tokio::test]
async fn test_longer_branch_with_more_work_replaces_two_blocks() {
    let store = Arc::new(MemoryStore::new());
    let node = engine_with(
        2,
        &[1],
        store.clone(),
        EngineConfig {
            slot_interval: Duration::from_secs(3600),
            ..config()
        },
    );
    let (mempool, _) = MempoolService::spawn(store.clone(), MempoolConfig::default());
    let (handle, _) = EngineService::spawn(node, mempool.clone(), None);

    // Canonical: b1 carries transfer 1, b2 carries transfer 2 and a proof
    let mut canonical = engine(1, &[1]);
    canonical.propose(&[transfer(1)], 15).unwrap();
    let b1 = tip_block(&canonical);
    mine_for(&mut canonical, 4);
    canonical.propose(&[transfer(2)], 25).unwrap();
    let b2 = tip_block(&canonical);
    assert_eq!(canonical.tip().cumulative_work, 1026);

    // Branch: f1 carries transfer 1 again, f3 carries the proof
    let mut branch = engine(1, &[1]);
    branch.propose(&[transfer(1)], 10).unwrap();
    let f1 = tip_block(&branch);
    branch.propose(&[], 20).unwrap();
    let f2 = tip_block(&branch);
    mine_for(&mut branch, 4);
    branch.propose(&[], 30).unwrap();
    let f3 = tip_block(&branch);
    assert_eq!(branch.tip().cumulative_work, 1027);

    for block in [b1, b2.clone()] {
        assert!(matches!(
            handle.import_block(block).await,
            Ok(ImportOutcome::Extended(_))
        ));
    }
    assert_eq!(store.get_account(&BOB).unwrap().balance, 2_000);

    for block in [f1.clone(), f2.clone()] {
        assert!(matches!(
            handle.import_block(block).await,
            Ok(ImportOutcome::SideChain { .. })
        ));
    }
    assert_eq!(handle.tip().await.unwrap().hash(), b2.hash());

    match handle.import_block(f3.clone()).await.unwrap() {
        ImportOutcome::Reorganized {
            depth,
            committed,
            reverted,
        } => {
            assert_eq!(depth, 2);
            let hashes: Vec<H256> = committed.iter().map(|c| c.hash).collect();
            assert_eq!(hashes, vec![f1.hash(), f2.hash(), f3.hash()]);
            // transfer 1 is in both chains, so only transfer 2 comes back
            assert_eq!(reverted, vec![transfer(2)]);
        }
        other => panic!("expected a reorganization, got {:?}", other),
    }

    assert_eq!(handle.tip().await.unwrap(), branch.tip().clone());
    let alice = store.get_account(&addr(ALICE)).unwrap();
    assert_eq!(alice.balance, 10_000_000 - 101_000);
    assert_eq!(alice.nonce, 1);
    assert_eq!(store.get_account(&BOB).unwrap().balance, 1_000);
    assert_eq!(store.get_account(&addr(1)).unwrap().balance, 41_420);
    assert_eq!(store.get_account(&TREASURY).unwrap().balance, 29_290);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.height, 3);
    assert_eq!(stats.total_burned, 29_290);
    assert_eq!(stats.reorgs, 1);
    assert_eq!(stats.deepest_reorg, 2);
    // The displaced b1 and b2
    assert_eq!(stats.side_blocks, 2);

    let pending = mempool.top_n(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(*pending[0], transfer(2));

    handle.shutdown().await;
    mempool.shutdown().await;
}

/// An engine service with its own mempool and relay on `network`
fn relay_node(
    network: &MemoryNetwork,
    name: &str,
    seed: u8,
) -> (Arc<MemoryStore>, MempoolHandle, EngineHandle, Arc<RwLock<RelayStats>>) {
    let store = Arc::new(MemoryStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let (transport, inbox) = network.join(name);
    let engine = engine_with(
        seed,
        &[1],
        store.clone(),
        EngineConfig {
            slot_interval: Duration::from_secs(3600),
            ..config()
        },
    );
    let (mempool, _) = MempoolService::spawn(store.clone(), MempoolConfig::default());
    let (handle, _) = EngineService::spawn(engine, mempool.clone(), None);
    let relay = BlockRelay::new(Arc::new(transport), blobs, handle.clone(), Duration::from_secs(1));
    let stats = relay.stats_handle();
    tokio::spawn(relay.run(inbox));
    (store, mempool, handle, stats)
}

#[tokio::test(start_paused = true)]
async fn test_reconnected_node_catches_up_across_a_fork() {
    let network = MemoryNetwork::new();
    let (_, ahead_pool, ahead, _) = relay_node(&network, "ahead", 3);
    let (behind_store, behind_pool, behind, behind_relay) = relay_node(&network, "behind", 2);

    let mut producer = engine(1, &[1]);
    producer.propose(&[], 10).unwrap();
    let b1 = tip_block(&producer);
    for handle in [&ahead, &behind] {
        assert!(matches!(
            handle.import_block(b1.clone()).await,
            Ok(ImportOutcome::Extended(_))
        ));
    }

    // While cut off, the lagging node adopts a competing block 2
    network.set_online("behind", false);
    let mut lone = engine(1, &[1]);
    lone.import_block(b1).unwrap();
    lone.propose(&[transfer(1)], 25).unwrap();
    assert!(matches!(
        behind.import_block(tip_block(&lone)).await,
        Ok(ImportOutcome::Extended(_))
    ));
    assert_eq!(behind_store.get_account(&BOB).unwrap().balance, 1_000);

    for timestamp in [20, 30, 40] {
        producer.propose(&[], timestamp).unwrap();
        assert!(matches!(
            ahead.import_block(tip_block(&producer)).await,
            Ok(ImportOutcome::Extended(_))
        ));
    }
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(behind.tip().await.unwrap().index, 2);

    // Heartbeats resume; the relay pulls blocks 3 and 4, then walks back to the fork
    network.set_online("behind", true);
    tokio::time::sleep(Duration::from_secs(3)).await;

    let tip = ahead.tip().await.unwrap();
    assert_eq!(tip.index, 4);
    assert_eq!(behind.tip().await.unwrap(), tip);
    assert!(behind.stats().await.unwrap().reorgs >= 1);
    assert_eq!(behind_store.get_account(&BOB).unwrap().balance, 0);
    assert_eq!(behind_store.get_account(&addr(ALICE)).unwrap().nonce, 0);
    assert_eq!(behind_pool.stats().await.unwrap().pending, 1);

    let relay = behind_relay.read().clone();
    assert!(relay.sync_requests >= 2);
    assert!(relay.orphans_queued >= 1);
    assert_eq!(relay.blocks_rejected, 0);

    for (handle, pool) in [(ahead, ahead_pool), (behind, behind_pool)] {
        handle.shutdown().await;
        pool.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_blocks_flow_between_services() {
    let network = MemoryNetwork::new();
    let gossip_config = GossipConfig {
        broadcast_interval: Duration::from_secs(1),
        refresh_interval: Duration::from_secs(1),
        cleanup_multiplier: 100,
        ..Default::default()
    };

    let mut nodes = Vec::new();
    for (name, seed) in [("producer", 1u8), ("follower", 2u8)] {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let (transport, inbox) = network.join(name);
        let transport: Arc<dyn PeerTransport> = Arc::new(transport);

        let engine = ConsensusEngine::builder()
            .identity(key(seed))
            .validators(vec![addr(1)])
            .store(store.clone())
            .blobs(blobs.clone())
            .config(config())
            .build()
            .unwrap();
        let (mempool, _) = MempoolService::spawn(store.clone(), MempoolConfig::default());
        let (scheduler, gossip) = GossipScheduler::start(gossip_config.clone(), transport.clone());
        let (handle, _) = EngineService::spawn(engine, mempool.clone(), Some(gossip));
        let relay = BlockRelay::new(transport, blobs, handle.clone(), Duration::from_secs(5));
        let relay_stats = relay.stats_handle();
        tokio::spawn(relay.run(inbox));
        nodes.push((store, mempool, scheduler, handle, relay_stats));
    }

    let mut updates = nodes[1].3.subscribe();
    nodes[0].1.add(transfer(1)).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(30), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.index, 1);
    assert_eq!(first.transaction_count, 1);
    assert_eq!(first.reorg_depth, None);
    assert!(first.cid.is_some());
    // Let the relay finish its bookkeeping
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(nodes[1].0.get_account(&BOB).unwrap().balance, 1_000);
    assert_eq!(nodes[0].1.stats().await.unwrap().pending, 0);
    assert!(nodes[0].3.stats().await.unwrap().blocks_proposed >= 1);
    assert!(nodes[1].4.read().blocks_imported >= 1);
    assert!(nodes[0].2.stats().cids_sent >= 1);

    for (_, mempool, scheduler, handle, _) in nodes {
        handle.shutdown().await;
        mempool.shutdown().await;
        scheduler.stop();
    }
}

#[tokio::test]
async fn test_handle_admits_reveals_off_the_worker() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(
        1,
        &[1],
        store.clone(),
        EngineConfig {
            slot_interval: Duration::from_secs(3600),
            ..config()
        },
    );
    let (mempool, _) = MempoolService::spawn(store, MempoolConfig::default());
    let (handle, worker) = EngineService::spawn(engine, mempool, None);

    let epoch = handle.epoch();
    let problem = ProblemRef {
        kind: ProofKind::SubsetSum,
        tier: Tier::Tier1,
        size: 10,
        parent_hash: epoch.parent_hash,
        block_index: epoch.index,
    };
    let instance = ProblemInstance::derive(&problem);
    let limits = *TierLimiter::default().limits(Tier::Tier1);
    let solution = ReferenceSolver
        .solve(&instance, &limits, Instant::now() + Duration::from_secs(30))
        .unwrap();
    let (commitment, reveal) = prepare_submission(&[4; 32], H256([4; 32]), problem, solution);

    handle.submit_commitment(&commitment).unwrap();
    assert_eq!(handle.admit_reveal(reveal.clone()).await, Ok(true));
    assert!(matches!(
        handle.admit_reveal(reveal).await,
        Err(ConsensusError::Proof(_))
    ));
    assert_eq!(handle.tip().await.unwrap().index, 0);
    assert!(handle.slashing_records().await.unwrap().is_empty());

    handle.shutdown().await;
    worker.await.unwrap();
    assert!(matches!(handle.stats().await, Err(ConsensusError::Closed)));
}
