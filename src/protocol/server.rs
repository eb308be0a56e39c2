use std::{
    io::{BufReader, BufWriter},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use log::{debug, info, trace, warn};

use crate::{config::ServerConfig, storage::StorageEngine};

use super::{
    ThreadPool,
    dispatch::Dispatcher,
    message::Message,
    transport::{Frame, MAX_FRAME_SIZE, ProtocolTransport, TransportError},
};

/// Serves one storage engine over TCP.
pub struct StorageServer<E> {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher<E>>,
    pool: Arc<ThreadPool>,
}

impl<E: StorageEngine> StorageServer<E> {
    pub fn bind(
        address: impl ToSocketAddrs,
        engine: Arc<E>,
        config: &ServerConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)?;
        Ok(Self {
            listener,
            dispatcher: Arc::new(Dispatcher::new(engine)),
            pool: Arc::new(ThreadPool::new(config.workers)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<E>> {
        &self.dispatcher
    }

    /// Accepts connections until the listener fails.
    pub fn listen(self) -> Result<(), TransportError> {
        info!(
            "listening at {} with {} workers",
            self.local_addr()?,
            self.pool.size()
        );

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => self.serve(stream),
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }

    fn serve(&self, stream: TcpStream) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let pool = Arc::clone(&self.pool);
        let spawned = thread::Builder::new()
            .name("tabwire-connection".into())
            .spawn(move || {
                if let Err(e) = handle_connection(stream, dispatcher, pool) {
                    warn!("connection failed: {e}");
                }
            });
        if let Err(e) = spawned {
            warn!("failed to spawn connection thread: {e}");
        }
    }
}

/// Reads requests off one connection and queues each on the pool. Responses
/// are written as they complete, tagged with their request id.
fn handle_connection<E: StorageEngine>(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher<E>>,
    pool: Arc<ThreadPool>,
) -> Result<(), TransportError> {
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    info!("accepted connection from {peer}");

    let writer = Arc::new(Mutex::new(ProtocolTransport::new(BufWriter::new(
        stream.try_clone()?,
    ))));
    let mut reader = ProtocolTransport::new(BufReader::new(stream));

    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(TransportError::ConnectionLost) => {
                info!("{peer} disconnected");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        trace!("request {} from {peer}: {} bytes", frame.id, frame.payload.len());

        let dispatcher = Arc::clone(&dispatcher);
        let writer = Arc::clone(&writer);
        pool.execute(move || {
            let mut payload = dispatcher.handle(&frame.payload);
            if payload.len() > MAX_FRAME_SIZE {
                warn!("response to {} is {} bytes, over the frame limit", frame.id, payload.len());
                payload = Message::exception(TransportError::FrameTooLarge(payload.len()).to_string())
                    .encode()
                    .unwrap_or_default();
            }
            let response = Frame {
                id: frame.id,
                payload,
            };
            let written = writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_frame(&response);
            match written {
                Ok(()) => debug!("answered request {} from {peer}", response.id),
                Err(e) => warn!("failed to answer request {} from {peer}: {e}", response.id),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{
            batch::CommandBatch,
            command::Command,
            transport::{TcpTransport, Transport},
        },
        storage::MemoryEngine,
    };

    fn spawn_server() -> SocketAddr {
        let server = StorageServer::bind(
            "127.0.0.1:0",
            Arc::new(MemoryEngine::new()),
            &ServerConfig { workers: 2 },
        )
        .unwrap();
        let address = server.local_addr().unwrap();
        thread::spawn(move || server.listen());
        address
    }

    fn count_tables(transport: &TcpTransport) -> Command {
        let request = Message::engine(CommandBatch::from(Command::CountTables { count: 0 }));
        let response = transport.exchange(request.encode().unwrap()).unwrap();
        let response = Message::decode(&response, |_| None).unwrap();
        response.batch.into_commands().remove(0)
    }

    #[test]
    fn answers_over_tcp() {
        let transport = TcpTransport::connect(spawn_server()).unwrap();
        assert_eq!(count_tables(&transport), Command::CountTables { count: 0 });
    }

    #[test]
    fn concurrent_requests_share_a_connection() {
        let transport = Arc::new(TcpTransport::connect(spawn_server()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let transport = Arc::clone(&transport);
                thread::spawn(move || count_tables(&transport))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Command::CountTables { count: 0 });
        }
    }

    #[test]
    fn garbage_payload_gets_exception() {
        let transport = TcpTransport::connect(spawn_server()).unwrap();
        let response = transport.exchange(vec![0xAB; 5]).unwrap();
        let response = Message::decode(&response, |_| None).unwrap();
        assert!(matches!(
            response.batch.commands(),
            [Command::Exception { .. }]
        ));
    }
}
