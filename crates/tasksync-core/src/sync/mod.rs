//! Sync queue processing against the authoritative server

mod processor;
mod remote;

pub use processor::{ProcessorDeps, SyncProcessor};
pub use remote::{classify_status, HttpRemoteStore, RemoteError, RemoteResult, RemoteSnapshot, RemoteStore};
