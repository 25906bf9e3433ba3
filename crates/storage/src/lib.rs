#![forbid(unsafe_code)]

mod connection;
mod entry;
mod memory;
mod resp;
mod scan;
mod store;
mod txn;

pub use connection::Connection;
pub use memory::MemoryStore;
pub use resp::{RespConfig, RespStore};
pub use scan::HashScan;
pub use store::{KeyValueStore, SetCondition, SetOptions};
pub use txn::{Compare, Script, Txn, TxnOp, TxnOutput, TxnResponse};
