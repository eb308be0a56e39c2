//! Remote access to a table and heap storage engine.
//!
//! A [`StorageServer`] hosts an engine behind a TCP listener; a
//! [`StorageClient`] drives it from another process as if it were local.
//! Table mutations are buffered and shipped in batches, range scans are
//! paged and prefetched.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tabwire::{DataType, MemoryEngine, StorageClient, StorageServer, config::*};
//!
//! let server = StorageServer::bind("127.0.0.1:7182", Arc::new(MemoryEngine::new()), &ServerConfig::default())?;
//! std::thread::spawn(move || server.listen());
//!
//! let client = StorageClient::connect("127.0.0.1:7182", ClientConfig::default())?;
//! let people = client.open_table("people", DataType::Int64, DataType::String)?;
//! people.replace(1_i64, "alice")?;
//! for row in people.forward(None, None)? {
//!     let (key, record) = row?;
//!     println!("{key} -> {record}");
//! }
//! client.commit()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
pub mod cli;
pub mod client;
pub mod config;
pub mod data;
pub mod descriptor;
pub mod error;
pub mod protocol;
pub mod storage;

pub use client::{RemoteHeap, RemoteScan, RemoteTable, StorageClient};
pub use data::{Data, DataType};
pub use descriptor::Descriptor;
pub use error::{Error, Result};
pub use protocol::{Dispatcher, StorageServer};
pub use storage::{MemoryEngine, StorageEngine};
