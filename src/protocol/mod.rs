//! Client-server command protocol.
//!
//! This module defines how a client drives a remote storage engine: the
//! command model, its binary encoding, message framing and the server-side
//! dispatcher that executes decoded commands.
//!
//! # Overview
//!
//! Every request is one [`Message`]: a target descriptor and an ordered
//! [`CommandBatch`]. The server answers each request with one message holding
//! the results of the synchronous commands in the batch, or a single
//! [`Command::Exception`] if anything failed.
//!
//! # Binary Format
//!
//! ```text
//! Message := descriptor_id:i64 Batch
//! Batch   := count:i32 common_code:i32 Payload*
//! Payload := count x (code:i32 <payload>)      mixed or non-bulk batches
//!          | count x <payload>                 count > 1, common bulk mutation
//! ```
//!
//! - Fixed-width integers are little-endian.
//! - Strings and blobs are a 7-bit continuation varint length followed by the bytes.
//! - Optional fields carry a leading presence byte.
//! - Descriptor ids `<= 0` address the engine itself; such messages carry no keys or records.
//!
//! # Key Components
//!
//! - [`Command`]: the closed set of operations, with stable [`CommandCode`]s.
//! - [`CommandCodec`]: per-variant payload encoding.
//! - [`CommandBatch`]: ordered commands plus the common-code tracking.
//! - [`Message`]: wire envelope, resolved through a [`DescriptorCache`] on read.
//! - [`Dispatcher`]: executes messages against a [`StorageEngine`](crate::storage::StorageEngine).
//! - [`Transport`]: request/response delivery, with [`TcpTransport`] and [`LocalTransport`].
//!
//! # See Also
//!
//! - [`client`](crate::client): batching and prefetching on top of this protocol.
mod batch;
mod codec;
mod command;
mod dispatch;
mod message;
mod server;
mod thread;
mod transport;
pub mod wire;

use thread::ThreadPool;

pub use batch::CommandBatch;
pub use codec::CommandCodec;
pub use command::{Command, CommandCode, Row, Scope};
pub use dispatch::{DispatchError, Dispatcher};
pub use message::{DescriptorCache, Message};
pub use server::StorageServer;
pub use transport::{
    Frame, LocalTransport, MAX_FRAME_SIZE, ProtocolTransport, TcpTransport, Transport,
    TransportError,
};
pub use wire::CodecError;
