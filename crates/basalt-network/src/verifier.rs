//! Trusted UDP verifier channel.
//!
//! Out-of-band datagrams from the verifier cohort instruct the node
//! about consensus-approved transactions and broadcast-node membership.
//! Datagrams are JSON; the payload is a typed sub-object per message
//! type. Nothing is accepted until a verifier is installed.

use crate::{NetworkError, NetworkResult};
use basalt_types::{Hash256, Transaction, TxPool};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Datagram type carrying consensus-approved transactions.
pub const MSG_TYPE_CONSENSUS_TXS: u8 = 1;

/// Datagram type carrying the broadcast-node roster.
pub const MSG_TYPE_BROADCAST_ROSTER: u8 = 2;

/// Largest datagram the channel reads.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Envelope of every verifier datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierDatagram {
    /// Block height the instruction refers to.
    #[serde(rename = "BlockNum")]
    pub block_num: u64,
    /// Payload discriminator.
    #[serde(rename = "MsgType")]
    pub msg_type: u8,
    /// Typed payload, decoded per `msg_type`.
    #[serde(rename = "Data")]
    pub data: serde_json::Value,
}

/// Signature block sealing a consensus result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureBlock {
    /// Hash the cohort signed.
    #[serde(rename = "BlockHash")]
    pub block_hash: Hash256,
    /// Cohort signatures, hex encoded.
    #[serde(rename = "Signatures")]
    pub signatures: Vec<String>,
}

/// Payload of a consensus-approved transaction datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// The sealing signature block.
    #[serde(rename = "Result")]
    pub result: SignatureBlock,
    /// Approved transactions.
    #[serde(rename = "Txs")]
    pub txs: Vec<Transaction>,
}

/// Broadcast-node roster forwarded to the miner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastInfo {
    /// Block height the roster applies from.
    #[serde(rename = "BlockNum")]
    pub block_num: u64,
    /// Node identities authorized to relay consensus messages.
    #[serde(rename = "Nodes")]
    pub nodes: Vec<String>,
}

/// Payload of a roster datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RosterPayload {
    #[serde(rename = "Nodes")]
    nodes: Vec<String>,
}

/// Validates a consensus result's signature block.
pub trait ResultVerifier: Send + Sync {
    /// Whether the signature block is authentic.
    fn verify(&self, result: &SignatureBlock) -> bool;
}

/// The UDP verifier channel.
pub struct VerifierChannel {
    pool: Arc<dyn TxPool>,
    verifier: RwLock<Option<Arc<dyn ResultVerifier>>>,
    roster_tx: mpsc::Sender<BroadcastInfo>,
}

impl VerifierChannel {
    /// Create the channel.
    ///
    /// Returns the channel and the single-slot receiver the miner
    /// subsystem reads rosters from.
    pub fn new(pool: Arc<dyn TxPool>) -> (Self, mpsc::Receiver<BroadcastInfo>) {
        let (roster_tx, roster_rx) = mpsc::channel(1);
        (
            Self {
                pool,
                verifier: RwLock::new(None),
                roster_tx,
            },
            roster_rx,
        )
    }

    /// Install the verifier; until then every datagram is rejected.
    pub fn install_verifier(&self, verifier: Arc<dyn ResultVerifier>) {
        *self.verifier.write() = Some(verifier);
    }

    /// Process one datagram.
    pub async fn handle_datagram(&self, data: &[u8]) -> NetworkResult<()> {
        let datagram: VerifierDatagram = serde_json::from_slice(data)
            .map_err(|err| NetworkError::VerifierRejected(format!("malformed envelope: {err}")))?;

        info!(
            block = datagram.block_num,
            msg_type = datagram.msg_type,
            "Verifier datagram received"
        );

        let Some(verifier) = self.verifier.read().clone() else {
            return Err(NetworkError::VerifierRejected(
                "no verifier installed".to_string(),
            ));
        };

        match datagram.msg_type {
            MSG_TYPE_CONSENSUS_TXS => {
                let payload: ConsensusResult =
                    serde_json::from_value(datagram.data).map_err(|err| {
                        NetworkError::VerifierRejected(format!(
                            "malformed consensus payload at block {}: {err}",
                            datagram.block_num
                        ))
                    })?;

                if !verifier.verify(&payload.result) {
                    return Err(NetworkError::VerifierRejected(format!(
                        "fake result signature at block {}",
                        datagram.block_num
                    )));
                }

                if payload.txs.is_empty() {
                    debug!("Verifier tx list is empty, nothing for the pool");
                    return Ok(());
                }

                for (i, result) in self.pool.add_remotes(payload.txs).into_iter().enumerate() {
                    if let Err(err) = result {
                        warn!(index = i, error = %err, "Pool rejected verifier transaction");
                    }
                }
                Ok(())
            }
            MSG_TYPE_BROADCAST_ROSTER => {
                let payload: RosterPayload =
                    serde_json::from_value(datagram.data).map_err(|err| {
                        NetworkError::VerifierRejected(format!(
                            "malformed roster payload at block {}: {err}",
                            datagram.block_num
                        ))
                    })?;

                info!(
                    block = datagram.block_num,
                    nodes = payload.nodes.len(),
                    "Forwarding broadcast roster"
                );
                self.roster_tx
                    .send(BroadcastInfo {
                        block_num: datagram.block_num,
                        nodes: payload.nodes,
                    })
                    .await
                    .map_err(|_| {
                        NetworkError::VerifierRejected("roster consumer gone".to_string())
                    })
            }
            other => {
                warn!(msg_type = other, "Unknown verifier message type");
                Ok(())
            }
        }
    }

    /// Read datagrams from the socket until shutdown.
    pub async fn run(&self, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        info!(addr = ?socket.local_addr().ok(), "Verifier channel listening");
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            if let Err(err) = self.handle_datagram(&buf[..len]).await {
                                warn!(%from, error = %err, "Dropped verifier datagram");
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "Verifier socket read failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Verifier channel shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_types::BasicTxPool;

    struct FixedVerifier(bool);

    impl ResultVerifier for FixedVerifier {
        fn verify(&self, _result: &SignatureBlock) -> bool {
            self.0
        }
    }

    fn datagram(msg_type: u8, data: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&VerifierDatagram {
            block_num: 42,
            msg_type,
            data,
        })
        .unwrap()
    }

    fn consensus_payload(txs: Vec<Transaction>) -> serde_json::Value {
        serde_json::to_value(ConsensusResult {
            result: SignatureBlock {
                block_hash: Hash256::of(b"sealed"),
                signatures: vec!["00ff".to_string()],
            },
            txs,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_rejected_without_verifier() {
        let pool = Arc::new(BasicTxPool::new());
        let (channel, _roster) = VerifierChannel::new(pool.clone());

        let data = datagram(MSG_TYPE_CONSENSUS_TXS, consensus_payload(vec![]));
        assert!(channel.handle_datagram(&data).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_signature_leaves_pool_untouched() {
        let pool = Arc::new(BasicTxPool::new());
        let (channel, _roster) = VerifierChannel::new(pool.clone());
        channel.install_verifier(Arc::new(FixedVerifier(false)));

        let tx = Transaction::new(0, Hash256::of(b"to"), 1, Vec::new());
        let data = datagram(MSG_TYPE_CONSENSUS_TXS, consensus_payload(vec![tx]));

        let result = channel.handle_datagram(&data).await;
        assert!(matches!(result, Err(NetworkError::VerifierRejected(_))));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_approved_txs_reach_pool() {
        let pool = Arc::new(BasicTxPool::new());
        let (channel, _roster) = VerifierChannel::new(pool.clone());
        channel.install_verifier(Arc::new(FixedVerifier(true)));

        let tx = Transaction::new(0, Hash256::of(b"to"), 1, Vec::new());
        let data = datagram(MSG_TYPE_CONSENSUS_TXS, consensus_payload(vec![tx]));

        channel.handle_datagram(&data).await.unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_roster_forwarded() {
        let pool = Arc::new(BasicTxPool::new());
        let (channel, mut roster) = VerifierChannel::new(pool);
        channel.install_verifier(Arc::new(FixedVerifier(true)));

        let data = datagram(
            MSG_TYPE_BROADCAST_ROSTER,
            serde_json::json!({ "Nodes": ["node-a", "node-b"] }),
        );
        channel.handle_datagram(&data).await.unwrap();

        let info = roster.recv().await.unwrap();
        assert_eq!(info.block_num, 42);
        assert_eq!(info.nodes, vec!["node-a", "node-b"]);
    }

    #[tokio::test]
    async fn test_unknown_type_discarded() {
        let pool = Arc::new(BasicTxPool::new());
        let (channel, _roster) = VerifierChannel::new(pool.clone());
        channel.install_verifier(Arc::new(FixedVerifier(true)));

        let data = datagram(99, serde_json::json!({}));
        // Logged and discarded, not an error
        channel.handle_datagram(&data).await.unwrap();
        assert!(pool.is_empty());
    }
}
