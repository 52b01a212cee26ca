use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{SessionId, Transport, TransportEvent};

/// Bound on dialling and on the identifier exchange.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const READ_BUFFER_SIZE: usize = 64 * 1024;

struct Session {
    tx: mpsc::UnboundedSender<Bytes>,
    token: CancellationToken,
}

struct Inner {
    local_net_id: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_session: AtomicU32,
    token: CancellationToken,
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        // The receiver only goes away on shutdown.
        let _ = self.events.send(event);
    }
}

/// A [`Transport`] over plain TCP.
///
/// Both sides of a new connection first exchange their 8-byte network identifiers (big-endian),
/// the stream then carries packets as they are.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

impl TcpTransport {
    /// Creates the transport along with the receiver of its events.
    pub fn new(local_net_id: u64) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(Inner {
                local_net_id,
                events,
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU32::new(1),
                token: CancellationToken::new(),
            }),
        };

        (transport, events_rx)
    }

    /// The number of open connections.
    pub fn num_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }
}

// Sends our identifier, then reads the remote one.
async fn exchange_ids(stream: &mut TcpStream, local_net_id: u64) -> io::Result<u64> {
    let exchange = async {
        stream.write_all(&local_net_id.to_be_bytes()).await?;
        stream.read_u64().await
    };

    timeout(CONNECT_TIMEOUT, exchange)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "identifier exchange timed out"))?
}

async fn dial(addr: SocketAddr, local_net_id: u64) -> io::Result<(TcpStream, u64)> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;

    let remote = exchange_ids(&mut stream, local_net_id).await?;
    Ok((stream, remote))
}

/// Registers the connection, reports it with `event` and spawns its reader and writer.
fn start_session(
    inner: &Arc<Inner>,
    stream: TcpStream,
    net_id: u64,
    event: impl FnOnce(SessionId) -> TransportEvent,
) {
    let session = inner.next_session.fetch_add(1, Ordering::Relaxed);
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let token = inner.token.child_token();

    inner.sessions.lock().insert(
        session,
        Session {
            tx,
            token: token.clone(),
        },
    );
    inner.emit(event(session));

    tokio::spawn(write_loop(
        Arc::clone(inner),
        writer,
        rx,
        token.clone(),
        net_id,
        session,
    ));
    tokio::spawn(read_loop(Arc::clone(inner), reader, token, net_id, session));
}

async fn write_loop(
    inner: Arc<Inner>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    token: CancellationToken,
    net_id: u64,
    session: SessionId,
) {
    loop {
        let first = tokio::select! {
            _ = token.cancelled() => break,
            data = rx.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        // Write out whatever is queued, then report the queue as drained.
        let mut next = Some(first);
        while let Some(data) = next.take() {
            if let Err(e) = writer.write_all(&data).await {
                debug!(session, "write failed: {e}");
                token.cancel();
                return;
            }
            next = rx.try_recv().ok();
        }

        inner.emit(TransportEvent::SendQueueDrained { net_id, session });
    }

    let _ = writer.shutdown().await;
}

async fn read_loop(
    inner: Arc<Inner>,
    mut reader: OwnedReadHalf,
    token: CancellationToken,
    net_id: u64,
    session: SessionId,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let reason = loop {
        let read = tokio::select! {
            _ = token.cancelled() => break "shutdown".to_owned(),
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => break "closed by peer".to_owned(),
            Ok(n) => {
                trace!(session, n, "read");
                inner.emit(TransportEvent::DataReceived {
                    net_id,
                    session,
                    data: buf.split().freeze(),
                });
                buf.reserve(READ_BUFFER_SIZE);
            }
            Err(e) => break e.to_string(),
        }
    };

    // Stops the writer too.
    token.cancel();
    inner.sessions.lock().remove(&session);
    inner.emit(TransportEvent::Disconnected {
        net_id,
        session,
        reason,
    });
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        let (mut stream, addr) = tokio::select! {
            _ = inner.token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            },
        };

        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            match exchange_ids(&mut stream, inner.local_net_id).await {
                Ok(net_id) => start_session(&inner, stream, net_id, |session| {
                    TransportEvent::Accepted {
                        net_id,
                        session,
                        addr,
                    }
                }),
                Err(e) => debug!(%addr, "inbound handshake failed: {e}"),
            }
        });
    }
}

impl Transport for TcpTransport {
    fn listen(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let bound = listener.local_addr()?;

        info!(%bound, "listening");
        tokio::spawn(accept_loop(Arc::clone(&self.inner), listener));

        // No NAT in the way of plain TCP: we're reachable where we listen.
        self.inner.emit(TransportEvent::NatTypeChecked {
            nat_type: 0,
            public_addr: bound,
        });

        Ok(bound)
    }

    fn proxy(&self, _addr: SocketAddr) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "NAT traversal is not supported over TCP",
        ))
    }

    fn connect(&self, net_id: u64, addr: SocketAddr) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match dial(addr, inner.local_net_id).await {
                Ok((stream, remote)) if remote == net_id => {
                    start_session(&inner, stream, net_id, |session| {
                        TransportEvent::Connected { net_id, session }
                    })
                }
                Ok((_, remote)) => {
                    warn!(%addr, expected = net_id, remote, "unexpected node");
                    inner.emit(TransportEvent::Disconnected {
                        net_id,
                        session: 0,
                        reason: "unexpected node".to_owned(),
                    });
                }
                Err(e) => {
                    debug!(%addr, "connect failed: {e}");
                    inner.emit(TransportEvent::Disconnected {
                        net_id,
                        session: 0,
                        reason: e.to_string(),
                    });
                }
            }
        });
    }

    fn send(&self, session: SessionId, data: Bytes) {
        match self.inner.sessions.lock().get(&session) {
            Some(s) => {
                let _ = s.tx.send(data);
            }
            None => trace!(session, "send on a closed session"),
        }
    }

    fn shutdown(&self, session: SessionId) {
        if let Some(s) = self.inner.sessions.lock().get(&session) {
            s.token.cancel();
        }
    }

    fn close(&self) {
        self.inner.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn connect_send_shutdown() {
        let (a, mut a_events) = TcpTransport::new(1);
        let (b, mut b_events) = TcpTransport::new(2);

        let addr = b.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(matches!(
            next_event(&mut b_events).await,
            TransportEvent::NatTypeChecked { public_addr, .. } if public_addr == addr
        ));

        a.connect(2, addr);
        let TransportEvent::Connected { net_id: 2, session } = next_event(&mut a_events).await
        else {
            panic!("expected a connection");
        };
        let TransportEvent::Accepted { net_id: 1, .. } = next_event(&mut b_events).await else {
            panic!("expected an accepted connection");
        };

        a.send(session, Bytes::from_static(b"Hello, world!"));
        assert!(matches!(
            next_event(&mut a_events).await,
            TransportEvent::SendQueueDrained { net_id: 2, .. }
        ));

        let mut received = BytesMut::new();
        while received.len() < 13 {
            match next_event(&mut b_events).await {
                TransportEvent::DataReceived { data, .. } => received.extend_from_slice(&data),
                event => panic!("unexpected {event:?}"),
            }
        }
        assert_eq!(&received[..], b"Hello, world!");

        a.shutdown(session);
        assert!(matches!(
            next_event(&mut a_events).await,
            TransportEvent::Disconnected { net_id: 2, .. }
        ));
        assert!(matches!(
            next_event(&mut b_events).await,
            TransportEvent::Disconnected { net_id: 1, .. }
        ));
        assert_eq!(a.num_sessions(), 0);
    }

    #[tokio::test]
    async fn wrong_node_is_refused() {
        let (a, mut a_events) = TcpTransport::new(1);
        let (b, _b_events) = TcpTransport::new(2);
        let addr = b.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        a.connect(3, addr);
        assert!(matches!(
            next_event(&mut a_events).await,
            TransportEvent::Disconnected {
                net_id: 3,
                session: 0,
                ..
            }
        ));
    }

    #[test]
    fn proxy_is_unsupported() {
        let (a, _) = TcpTransport::new(1);
        assert!(a.proxy("127.0.0.1:1".parse().unwrap()).is_err());
    }
}
