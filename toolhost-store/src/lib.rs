//! Durable key-value storage used for permission grants and server records.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod file;
mod kv;
mod volatile;

pub use error::{StoreError, StoreResult};
pub use file::FileStore;
pub use kv::KeyValueStore;
pub use volatile::MemoryStore;
