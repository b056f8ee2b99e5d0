//! Peer RPC listener: serves `GetFullData`, `FullSync` and
//! `IncrementalSync` to other nodes in the cluster (spec §4.E).

use crate::codec::frame::{read_frame, write_frame, FrameError};
use crate::codec::value::{decode, encode, Value, ValueError};
use crate::store::{Store, StoreError};
use crate::sync::types::{
    DataPackage, IncrementalPackage, SyncTypeError, RPC_ACK, RPC_FULL_SYNC, RPC_GET_FULL_DATA, RPC_INCREMENTAL_SYNC,
};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SyncServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Type(#[from] SyncTypeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unrecognized RPC code: {0}")]
    UnknownOp(u64),
}

/// Binds `addr` and serves peer RPC requests against `store` until the
/// listener errors. Each connection may carry more than one request in
/// sequence, mirroring the persistent-connection client in
/// [`crate::sync::client`].
pub async fn serve(addr: SocketAddr, store: Arc<Store>) -> Result<(), SyncServerError> {
    let listener = TcpListener::bind(addr).await?;
    debug!(%addr, "sync RPC listener bound");
    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, &store).await {
                warn!(%peer_addr, error = %e, "sync RPC connection ended with an error");
            }
        });
    }
}

async fn handle_connection(mut socket: TcpStream, store: &Store) -> Result<(), SyncServerError> {
    loop {
        let frame = match read_frame(&mut socket).await {
            Ok(f) => f,
            Err(FrameError::EndOfStream) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let (response_type, response_value) = match frame.msg_type {
            RPC_GET_FULL_DATA => {
                let pkg = DataPackage { messages: store.snapshot(), ..Default::default() };
                (RPC_GET_FULL_DATA, Value::from(&pkg))
            }
            RPC_FULL_SYNC => {
                let value = decode(&frame.payload)?;
                let pkg = DataPackage::try_from(&value)?;
                store.replace_all(pkg.messages, &pkg.deleted_ids)?;
                (RPC_ACK, Value::Null)
            }
            RPC_INCREMENTAL_SYNC => {
                let value = decode(&frame.payload)?;
                let pkg = IncrementalPackage::try_from(&value)?;
                apply_incremental(store, &pkg)?;
                (RPC_ACK, Value::Null)
            }
            other => return Err(SyncServerError::UnknownOp(other)),
        };

        write_frame(&mut socket, response_type, &encode(&response_value)).await?;
    }
}

fn apply_incremental(store: &Store, pkg: &IncrementalPackage) -> Result<(), StoreError> {
    for msg in &pkg.upserts {
        store.apply_remote_upsert(msg.clone())?;
    }
    if !pkg.deletes.is_empty() {
        store.apply_remote_delete(&pkg.deletes)?;
    }
    if !pkg.reads.is_empty() {
        store.apply_remote_read(&pkg.reads)?;
    }
    Ok(())
}
