//! Request/response delivery.
//!
//! The protocol only needs "send these bytes, get the answer back". On TCP
//! each message travels in a bincode [`Frame`] tagged with a request id, so a
//! single connection can carry several requests at once and responses may
//! come back in any order.
use std::{
    collections::HashMap,
    io::{self, BufReader, BufWriter, ErrorKind, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
};

use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, Limit, LittleEndian},
    decode_from_std_read, encode_into_std_write,
    error::DecodeError,
};
use log::{debug, trace, warn};
use thiserror::Error;

use crate::{protocol::dispatch::Dispatcher, storage::StorageEngine};

/// Largest payload accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode frame: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode frame: {0}")]
    Deserialize(#[from] DecodeError),
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),
    #[error("connection lost")]
    ConnectionLost,
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Frame {
    pub id: u64,
    pub payload: Vec<u8>,
}

/// Frame codec over a byte stream.
pub struct ProtocolTransport<T> {
    stream: T,
    config: Configuration<LittleEndian, Fixint, Limit<MAX_FRAME_SIZE>>,
}

impl<T> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        let config = bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding()
            .with_limit::<MAX_FRAME_SIZE>();
        Self { stream, config }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }
}

impl<T: Write> ProtocolTransport<T> {
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if frame.payload.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(frame.payload.len()));
        }
        encode_into_std_write(frame, &mut self.stream, self.config)?;
        self.stream.flush()?;
        Ok(())
    }
}

impl<T: Read> ProtocolTransport<T> {
    /// Blocks for the next frame. A stream closed between frames is reported
    /// as [`TransportError::ConnectionLost`].
    pub fn read_frame(&mut self) -> Result<Frame, TransportError> {
        match decode_from_std_read(&mut self.stream, self.config) {
            Ok(frame) => Ok(frame),
            Err(DecodeError::Io { inner, .. }) if inner.kind() == ErrorKind::UnexpectedEof => {
                Err(TransportError::ConnectionLost)
            }
            Err(DecodeError::LimitExceeded) => Err(TransportError::FrameTooLarge(MAX_FRAME_SIZE)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Client side of a connection: submit a request, wait for its response.
pub trait Transport: Send + Sync {
    fn exchange(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

type Reply = Result<Vec<u8>, TransportError>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, mpsc::Sender<Reply>>,
    closed: bool,
}

impl Pending {
    fn fail_all(&mut self) {
        self.closed = true;
        for (id, waiter) in self.waiters.drain() {
            trace!("failing request {id}");
            let _ = waiter.send(Err(TransportError::ConnectionLost));
        }
    }
}

/// Multiplexed TCP connection to a server.
pub struct TcpTransport {
    stream: TcpStream,
    writer: Mutex<ProtocolTransport<BufWriter<TcpStream>>>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    reader: Option<JoinHandle<()>>,
}

impl TcpTransport {
    pub fn connect(address: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        debug!("connected to {}", stream.peer_addr()?);

        let pending = Arc::new(Mutex::new(Pending::default()));
        let reader = {
            let transport = ProtocolTransport::new(BufReader::new(stream.try_clone()?));
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name("tabwire-reader".into())
                .spawn(move || route_responses(transport, pending))?
        };

        Ok(Self {
            writer: Mutex::new(ProtocolTransport::new(BufWriter::new(stream.try_clone()?))),
            stream,
            pending,
            next_id: AtomicU64::new(1),
            reader: Some(reader),
        })
    }
}

fn route_responses(mut transport: ProtocolTransport<BufReader<TcpStream>>, pending: Arc<Mutex<Pending>>) {
    loop {
        match transport.read_frame() {
            Ok(frame) => {
                let waiter = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .waiters
                    .remove(&frame.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(frame.payload));
                    }
                    None => warn!("dropping response to unknown request {}", frame.id),
                }
            }
            Err(e) => {
                debug!("connection closed: {e}");
                break;
            }
        }
    }
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .fail_all();
}

impl Transport for TcpTransport {
    fn exchange(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.closed {
                return Err(TransportError::ConnectionLost);
            }
            pending.waiters.insert(id, tx);
        }

        let frame = Frame {
            id,
            payload: request,
        };
        let written = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_frame(&frame);
        if let Err(e) = written {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .waiters
                .remove(&id);
            return Err(e);
        }

        rx.recv().map_err(|_| TransportError::ConnectionLost)?
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("response reader panicked");
            }
        }
    }
}

/// In-process transport that hands requests straight to a dispatcher.
pub struct LocalTransport<E> {
    dispatcher: Arc<Dispatcher<E>>,
}

impl<E: StorageEngine> LocalTransport<E> {
    pub fn new(dispatcher: Arc<Dispatcher<E>>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<E>> {
        &self.dispatcher
    }
}

impl<E: StorageEngine> Transport for LocalTransport<E> {
    fn exchange(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        Ok(self.dispatcher.handle(&request))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek, SeekFrom};

    use bytes::BufMut;

    use super::*;

    #[test]
    fn read_write_frames() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        let first = Frame {
            id: 1,
            payload: b"first".to_vec(),
        };
        let second = Frame {
            id: 7,
            payload: Vec::new(),
        };
        transport.write_frame(&first).unwrap();
        transport.write_frame(&second).unwrap();

        transport.stream.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(transport.read_frame().unwrap(), first);
        assert_eq!(transport.read_frame().unwrap(), second);
        assert!(matches!(
            transport.read_frame(),
            Err(TransportError::ConnectionLost)
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_on_write() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        let frame = Frame {
            id: 1,
            payload: vec![0; MAX_FRAME_SIZE + 1],
        };
        assert!(matches!(
            transport.write_frame(&frame),
            Err(TransportError::FrameTooLarge(_))
        ));
        assert!(transport.get_ref().get_ref().is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected_on_read() {
        let mut header = Vec::new();
        header.put_u64_le(1);
        header.put_u64_le(1 << 40);
        let mut transport = ProtocolTransport::new(Cursor::new(header));
        assert!(matches!(
            transport.read_frame(),
            Err(TransportError::FrameTooLarge(_))
        ));
    }
}
