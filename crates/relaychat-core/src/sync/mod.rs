//! Peer replication: RPC surface (§4.E) and outbound client (§4.F).

pub mod client;
pub mod server;
pub mod types;

pub use client::{SyncClient, SyncClientError};
pub use server::{serve, SyncServerError};
pub use types::{DataPackage, IncrementalPackage, SyncTypeError, RPC_ACK, RPC_FULL_SYNC, RPC_GET_FULL_DATA, RPC_INCREMENTAL_SYNC};
