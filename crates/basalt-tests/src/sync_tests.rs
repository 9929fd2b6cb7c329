//! Downloader scenario tests: full and fast catch-up against a serving
//! remote, and round cancellation on bad deliveries.

use crate::generators::{build_chain, genesis};
use crate::harness::{serve_chain, wait_until, Remote, TestNet, RECV_TIMEOUT};
use basalt_network::{HashOrNumber, Message, NewBlockData, StatusData, PROTOCOL_VERSIONS};
use basalt_sync::{ManagerConfig, SyncMode};
use basalt_types::{BlockChain, Hash256, MemoryChain};
use num_bigint::BigUint;
use std::sync::Arc;
use std::time::Duration;

fn status_at(source: &MemoryChain, number: u64) -> StatusData {
    let header = source.header_by_number(number).expect("header in source");
    let hash = header.hash();
    let td = source
        .total_difficulty(&hash, number)
        .expect("td in source");
    StatusData {
        protocol_version: PROTOCOL_VERSIONS[0],
        network_id: 1,
        td,
        head: hash,
        genesis: genesis().hash(),
    }
}

/// Kick a sync round by propagating the source head with its real TD.
async fn propagate_head(remote: &mut Remote, source: &MemoryChain, blocks_len: u64) {
    let head = source
        .block_by_hash(&source.header_by_number(blocks_len).unwrap().hash())
        .unwrap();
    let td = source
        .total_difficulty(&head.hash(), blocks_len)
        .unwrap();
    remote
        .send(Message::NewBlock(NewBlockData { block: head, td }))
        .await;
}

#[tokio::test]
async fn test_full_sync_catches_up_to_master() {
    let (source, _blocks) = build_chain(10, 2);
    let net = TestNet::start(ManagerConfig::default());

    // Advertise a TD two blocks behind so the head propagation lifts it
    let mut remote = Remote::connect(&net, 1, status_at(&source, 8), false).await;
    assert!(wait_until(RECV_TIMEOUT, || net.manager.peer_set().len() == 1).await);

    propagate_head(&mut remote, &source, 10).await;
    let chain = Arc::clone(&net.chain);
    let server = tokio::spawn(serve_chain(remote, Arc::clone(&source)));

    // The downloader proves the head's parent and pulls the whole chain
    assert!(
        wait_until(Duration::from_secs(10), || chain.height() == 10).await,
        "full sync never completed, height {}",
        chain.height()
    );
    assert!(net.manager.accepts_txs());

    // Imported content matches the source
    for number in 1..=10u64 {
        let local = net.chain.header_by_number(number).unwrap();
        let remote_header = source.header_by_number(number).unwrap();
        assert_eq!(local.hash(), remote_header.hash());
    }

    server.abort();
    net.stop().await;
}

#[tokio::test]
async fn test_fast_sync_skips_execution_below_pivot() {
    let (source, blocks) = build_chain(70, 1);
    let net = TestNet::start(ManagerConfig {
        sync_mode: SyncMode::Fast,
        ..ManagerConfig::default()
    });

    let mut remote = Remote::connect(&net, 1, status_at(&source, 68), false).await;
    assert!(wait_until(RECV_TIMEOUT, || net.manager.peer_set().len() == 1).await);

    propagate_head(&mut remote, &source, 70).await;
    let chain = Arc::clone(&net.chain);
    let server = tokio::spawn(serve_chain(remote, Arc::clone(&source)));

    // The master proves block 69 (the parent of the propagated 70) and
    // the batch streams the rest; fast sync fills receipts below the
    // pivot and the pivot state, executing only the tail
    assert!(
        wait_until(Duration::from_secs(15), || chain.height() == 70).await,
        "fast sync never completed, height {}",
        chain.height()
    );
    assert!(net.manager.accepts_txs());

    // Receipts below the pivot came off the wire
    let below_pivot = &blocks[0]; // block 1
    let receipts = net.chain.receipts_by_hash(&below_pivot.hash()).unwrap();
    assert!(!receipts.is_empty());

    // The pivot state node was fetched into the local sink
    let pivot = 69 - basalt_sync::PIVOT_DISTANCE;
    let pivot_root = source.header_by_number(pivot).unwrap().state_root;
    assert!(net.chain.trie_node(&pivot_root).is_some());

    server.abort();
    net.stop().await;
}

#[tokio::test]
async fn test_non_contiguous_headers_drop_the_master() {
    let (source, _blocks) = build_chain(3, 0);
    let net = TestNet::start(ManagerConfig::default());

    let mut remote = Remote::connect(&net, 1, status_at(&source, 1), false).await;
    assert!(wait_until(RECV_TIMEOUT, || net.manager.peer_set().len() == 1).await);

    propagate_head(&mut remote, &source, 3).await;

    // Serve the height probe honestly
    let probe = remote
        .recv_until(
            |m| matches!(m, Message::GetBlockHeaders(q) if matches!(q.origin, HashOrNumber::Hash(_))),
        )
        .await
        .expect("height probe");
    let Message::GetBlockHeaders(query) = probe else {
        unreachable!()
    };
    let HashOrNumber::Hash(head_hash) = query.origin else {
        unreachable!()
    };
    let head = source.header_by_hash(&head_hash).unwrap();
    remote.send(Message::BlockHeaders(vec![head])).await;

    // Answer the batch request with a gap
    remote
        .recv_until(
            |m| matches!(m, Message::GetBlockHeaders(q) if matches!(q.origin, HashOrNumber::Number(_))),
        )
        .await
        .expect("batch request");
    let h1 = source.header_by_number(1).unwrap();
    let h3 = source.header_by_number(3).unwrap();
    remote.send(Message::BlockHeaders(vec![h1, h3])).await;

    // Hard protocol error: the master is removed and the session ends
    assert!(
        wait_until(Duration::from_secs(5), || net.manager.peer_set().len() == 0).await,
        "lying master was never dropped"
    );
    assert_eq!(net.chain.height(), 0);

    remote.close().abort();
    net.stop().await;
}

#[tokio::test]
async fn test_propagated_td_updates_peer_head() {
    let (source, _blocks) = build_chain(5, 0);
    let net = TestNet::start(ManagerConfig::default());

    let mut remote = Remote::connect(&net, 1, status_at(&source, 2), false).await;
    assert!(wait_until(RECV_TIMEOUT, || net.manager.peer_set().len() == 1).await);

    let advertised = net
        .manager
        .peer_set()
        .peer(&Remote::peer_id(1))
        .unwrap()
        .td();

    propagate_head(&mut remote, &source, 5).await;

    // The head snapshot moves to TD(4) = TD(5) - difficulty(5)
    let expected = source
        .total_difficulty(&source.header_by_number(4).unwrap().hash(), 4)
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            net.manager
                .peer_set()
                .peer(&Remote::peer_id(1))
                .map(|p| p.td() == expected)
                .unwrap_or(false)
        })
        .await,
        "peer head never updated"
    );
    assert!(expected > advertised);

    remote.close().abort();
    net.stop().await;
}

#[tokio::test]
async fn test_sync_skipped_when_peer_is_not_ahead() {
    let (local_chain, _) = build_chain(5, 0);
    let net = TestNet::start_on_chain(
        ManagerConfig::default(),
        Arc::new(basalt_types::NoopEngine),
        local_chain,
    );

    // The remote is behind us; no sync round should start
    let status = StatusData {
        protocol_version: PROTOCOL_VERSIONS[0],
        network_id: 1,
        td: BigUint::from(1u32),
        head: Hash256::of(b"their head"),
        genesis: genesis().hash(),
    };
    let remote = Remote::connect(&net, 1, status, false).await;
    assert!(wait_until(RECV_TIMEOUT, || net.manager.peer_set().len() == 1).await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!net.manager.downloader().is_syncing());
    assert_eq!(net.chain.height(), 5);

    remote.close().abort();
    net.stop().await;
}
