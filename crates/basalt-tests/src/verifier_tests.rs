//! UDP verifier channel tests over real sockets.

use basalt_network::{
    BroadcastInfo, ConsensusResult, ResultVerifier, SignatureBlock, VerifierChannel,
    VerifierDatagram, MSG_TYPE_BROADCAST_ROSTER, MSG_TYPE_CONSENSUS_TXS,
};
use basalt_types::{BasicTxPool, Hash256, Transaction, TxPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

struct FixedVerifier(bool);

impl ResultVerifier for FixedVerifier {
    fn verify(&self, _result: &SignatureBlock) -> bool {
        self.0
    }
}

struct Fixture {
    pool: Arc<BasicTxPool>,
    roster_rx: mpsc::Receiver<BroadcastInfo>,
    client: UdpSocket,
    server_addr: std::net::SocketAddr,
    shutdown: watch::Sender<bool>,
}

async fn start_channel(accept: bool) -> Fixture {
    let pool = Arc::new(BasicTxPool::new());
    let (channel, roster_rx) = VerifierChannel::new(Arc::clone(&pool) as Arc<dyn TxPool>);
    channel.install_verifier(Arc::new(FixedVerifier(accept)));
    let channel = Arc::new(channel);

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move { channel.run(server, shutdown_rx).await });

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    Fixture {
        pool,
        roster_rx,
        client,
        server_addr,
        shutdown,
    }
}

fn consensus_datagram(txs: Vec<Transaction>) -> Vec<u8> {
    let payload = ConsensusResult {
        result: SignatureBlock {
            block_hash: Hash256::of(b"sealed"),
            signatures: vec!["aa".to_string(), "bb".to_string()],
        },
        txs,
    };
    serde_json::to_vec(&VerifierDatagram {
        block_num: 7,
        msg_type: MSG_TYPE_CONSENSUS_TXS,
        data: serde_json::to_value(payload).unwrap(),
    })
    .unwrap()
}

#[tokio::test]
async fn test_approved_transactions_flow_to_pool() {
    let fixture = start_channel(true).await;
    let tx = Transaction::new(0, Hash256::of(b"to"), 1, Vec::new());

    fixture
        .client
        .send_to(&consensus_datagram(vec![tx]), fixture.server_addr)
        .await
        .unwrap();

    let end = tokio::time::Instant::now() + Duration::from_secs(2);
    while fixture.pool.is_empty() && tokio::time::Instant::now() < end {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(fixture.pool.len(), 1);
    let _ = fixture.shutdown.send(true);
}

#[tokio::test]
async fn test_tampered_signature_keeps_pool_empty() {
    let fixture = start_channel(false).await;
    let tx = Transaction::new(0, Hash256::of(b"to"), 1, Vec::new());

    fixture
        .client
        .send_to(&consensus_datagram(vec![tx]), fixture.server_addr)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fixture.pool.is_empty());
    let _ = fixture.shutdown.send(true);
}

#[tokio::test]
async fn test_roster_lands_on_miner_channel() {
    let mut fixture = start_channel(true).await;

    let datagram = serde_json::to_vec(&VerifierDatagram {
        block_num: 9,
        msg_type: MSG_TYPE_BROADCAST_ROSTER,
        data: serde_json::json!({ "Nodes": ["node-a", "node-b", "node-c"] }),
    })
    .unwrap();
    fixture
        .client
        .send_to(&datagram, fixture.server_addr)
        .await
        .unwrap();

    let info = timeout(Duration::from_secs(2), fixture.roster_rx.recv())
        .await
        .expect("roster in time")
        .expect("roster channel open");
    assert_eq!(info.block_num, 9);
    assert_eq!(info.nodes.len(), 3);
    let _ = fixture.shutdown.send(true);
}

#[tokio::test]
async fn test_garbage_datagram_is_ignored() {
    let fixture = start_channel(true).await;

    fixture
        .client
        .send_to(b"not even json", fixture.server_addr)
        .await
        .unwrap();

    // The channel survives and keeps serving
    let tx = Transaction::new(0, Hash256::of(b"to"), 1, Vec::new());
    fixture
        .client
        .send_to(&consensus_datagram(vec![tx]), fixture.server_addr)
        .await
        .unwrap();

    let end = tokio::time::Instant::now() + Duration::from_secs(2);
    while fixture.pool.is_empty() && tokio::time::Instant::now() < end {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(fixture.pool.len(), 1);
    let _ = fixture.shutdown.send(true);
}
