//! Outbound half of peer replication: fetches full dumps at startup and
//! fans out incremental deltas as the local store mutates (spec §4.F).
//!
//! # Design Pattern: persistent per-peer connection
//!
//! Each peer gets one lazily-established `TcpStream`, guarded by its own
//! `tokio::sync::Mutex` and reused across calls; a failed request drops
//! the stored connection so the next call reconnects. This differs from
//! connecting fresh for every outbound message — the right tradeoff here
//! because incremental fanout fires on every local mutation, frequently
//! enough that a fresh TCP handshake per call would dominate the cost of
//! replication. A single slow peer only ever blocks its own `Mutex`, not
//! the others, even though fanout below visits peers one at a time.

use crate::codec::frame::{read_frame, write_frame, FrameError};
use crate::codec::value::{decode, encode, Value, ValueError};
use crate::store::Store;
use crate::sync::types::{DataPackage, IncrementalPackage, SyncTypeError, RPC_FULL_SYNC, RPC_GET_FULL_DATA, RPC_INCREMENTAL_SYNC};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SyncClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Type(#[from] SyncTypeError),
    #[error("timed out talking to peer {addr}")]
    Timeout { addr: SocketAddr },
}

struct Peer {
    name: String,
    addr: SocketAddr,
    conn: Mutex<Option<TcpStream>>,
}

/// Outbound replication client for one node, holding a handle per peer.
pub struct SyncClient {
    peers: Vec<Peer>,
}

impl SyncClient {
    pub fn new(peers: Vec<(String, SocketAddr)>) -> Self {
        Self {
            peers: peers
                .into_iter()
                .map(|(name, addr)| Peer { name, addr, conn: Mutex::new(None) })
                .collect(),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    async fn request(&self, peer: &Peer, msg_type: u64, payload: &[u8]) -> Result<Value, SyncClientError> {
        let mut guard = peer.conn.lock().await;

        if guard.is_none() {
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer.addr))
                .await
                .map_err(|_| SyncClientError::Timeout { addr: peer.addr })??;
            *guard = Some(stream);
        }

        let result: Result<Value, SyncClientError> = async {
            let stream = guard.as_mut().expect("just populated");
            write_frame(stream, msg_type, payload).await?;
            let frame = tokio::time::timeout(REQUEST_TIMEOUT, read_frame(stream))
                .await
                .map_err(|_| SyncClientError::Timeout { addr: peer.addr })??;
            Ok(decode(&frame.payload)?)
        }
        .await;

        if result.is_err() {
            *guard = None;
        }
        result
    }

    /// Fetches the full dataset `peer` currently holds.
    pub async fn fetch_full_data(&self, peer_name: &str) -> Result<DataPackage, SyncClientError> {
        let peer = self.find(peer_name);
        let value = self.request(peer, RPC_GET_FULL_DATA, &[]).await?;
        Ok(DataPackage::try_from(&value)?)
    }

    /// Startup reconciliation (spec §4.F, §4.I step 5): iterates peers in
    /// config order and merges, by last-writer-wins, the full dataset of
    /// the *first* peer whose `GetFullData` answers without error. Other
    /// peers are not consulted. On total failure, logs a warning and
    /// leaves `store` as-is.
    pub async fn startup_reconcile(&self, store: &Store) {
        for peer in &self.peers {
            match self.request(peer, RPC_GET_FULL_DATA, &[]).await {
                Ok(value) => match DataPackage::try_from(&value) {
                    Ok(pkg) => {
                        for msg in pkg.messages {
                            if let Err(e) = store.apply_remote_upsert(msg) {
                                warn!(peer = %peer.name, error = %e, "failed to apply message during startup reconcile");
                            }
                        }
                        debug!(peer = %peer.name, "startup reconcile fetched peer data");
                        return;
                    }
                    Err(e) => warn!(peer = %peer.name, error = %e, "malformed full-data response during startup reconcile"),
                },
                Err(e) => warn!(peer = %peer.name, error = %e, "peer unreachable during startup reconcile"),
            }
        }
        warn!("startup reconcile found no reachable peer, proceeding with local-only state");
    }

    /// Pushes the node's entire current dataset to every peer. Used
    /// rarely (operator-triggered full resync); incremental fanout is the
    /// steady-state path.
    pub async fn fanout_full(&self, store: &Store) {
        let pkg = DataPackage { messages: store.snapshot(), ..Default::default() };
        let payload = encode(&Value::from(&pkg));
        for peer in &self.peers {
            if let Err(e) = self.request(peer, RPC_FULL_SYNC, &payload).await {
                warn!(peer = %peer.name, error = %e, "full sync fanout failed");
            }
        }
    }

    /// Best-effort fanout of one incremental delta to every peer. A peer
    /// that's down simply misses this delta; it catches up on its own
    /// next startup reconcile. Errors are logged, never propagated — a
    /// request that already mutated the local store must still succeed
    /// from the caller's point of view.
    pub async fn fanout_incremental(&self, pkg: &IncrementalPackage) {
        if pkg.is_empty() {
            return;
        }
        let payload = encode(&Value::from(pkg));
        for peer in &self.peers {
            if let Err(e) = self.request(peer, RPC_INCREMENTAL_SYNC, &payload).await {
                warn!(peer = %peer.name, error = %e, "incremental sync fanout failed");
            }
        }
    }

    fn find(&self, name: &str) -> &Peer {
        self.peers
            .iter()
            .find(|p| p.name == name)
            .unwrap_or_else(|| panic!("unknown peer: {name}"))
    }
}
