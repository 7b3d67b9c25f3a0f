//! UDP endpoints: the listen-side demultiplexer and the knock dialer.
//!
//! UDP has no accept loop, so the listener synthesizes one: a single shared
//! socket is read by one task, and datagrams are routed by peer address into
//! per-peer pseudo-connections. A pseudo-connection satisfies the same
//! duplex contract as a TCP stream; reads drain its inbox, writes go out
//! through the shared socket with `send_to`.

use crate::addr::resolve_addr;
use crate::error::{Error, Result};
use crate::splice::COPY_BUFFER_SIZE;
use crate::stream::Stream;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::timeout;

/// Receive deadline on the listening socket; bounds how long a quit signal
/// can go unobserved.
const LISTEN_RECV_TIMEOUT: Duration = Duration::from_secs(16);

/// Deadline on a pseudo-connection read waiting for the next datagram.
const PSEUDO_READ_TIMEOUT: Duration = Duration::from_secs(16);

/// Idle deadline on a dialed socket. UDP gives no close signal, so this is
/// the only way the descriptor is reclaimed when the peer goes silent.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Pending datagrams a pseudo-connection can hold before the listener
/// blocks. Backpressure, not a drop policy.
const INBOX_CAPACITY: usize = 16;

/// Single byte sent on dial so the remote demultiplexer materializes a
/// pseudo-connection for this peer.
pub const KNOCK: &[u8] = &[0x00];

/// Clears the shared established flag when the last owner goes away.
struct CloseGuard {
    established: Arc<AtomicBool>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.established.store(false, Ordering::Release);
    }
}

/// Demux-table handle for one live pseudo-connection.
pub(crate) struct PseudoEntry {
    established: Arc<AtomicBool>,
    pub(crate) inbox: mpsc::Sender<Bytes>,
}

impl PseudoEntry {
    pub(crate) fn established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }
}

/// A virtual duplex stream for one remote peer of a shared UDP socket.
///
/// Closing is expressed as drop: when the connection (or both of its split
/// halves) goes away, the established flag clears and the listener evicts
/// the table entry on the next datagram from the same peer.
pub struct UdpPseudoConn {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbox: mpsc::Receiver<Bytes>,
    established: Arc<AtomicBool>,
    guard: Arc<CloseGuard>,
}

impl UdpPseudoConn {
    pub(crate) fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> (Self, PseudoEntry) {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let established = Arc::new(AtomicBool::new(true));
        let guard = Arc::new(CloseGuard {
            established: Arc::clone(&established),
        });

        (
            Self {
                socket,
                peer,
                inbox: inbox_rx,
                established: Arc::clone(&established),
                guard,
            },
            PseudoEntry {
                established,
                inbox: inbox_tx,
            },
        )
    }

    /// Delivers the next queued datagram, truncated to `buf`.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        recv_queued(&mut self.inbox, &self.established, buf).await
    }

    /// Emits `buf` as one datagram to the peer through the shared socket.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        send_datagram(&self.socket, self.peer, &self.established, buf).await
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn split(self) -> (PseudoReadHalf, PseudoWriteHalf) {
        (
            PseudoReadHalf {
                inbox: self.inbox,
                established: Arc::clone(&self.established),
                _guard: Arc::clone(&self.guard),
            },
            PseudoWriteHalf {
                socket: self.socket,
                peer: self.peer,
                established: self.established,
                _guard: self.guard,
            },
        )
    }
}

/// Read half of a split pseudo-connection.
pub struct PseudoReadHalf {
    inbox: mpsc::Receiver<Bytes>,
    established: Arc<AtomicBool>,
    _guard: Arc<CloseGuard>,
}

impl PseudoReadHalf {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        recv_queued(&mut self.inbox, &self.established, buf).await
    }
}

/// Write half of a split pseudo-connection.
pub struct PseudoWriteHalf {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    established: Arc<AtomicBool>,
    _guard: Arc<CloseGuard>,
}

impl PseudoWriteHalf {
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        send_datagram(&self.socket, self.peer, &self.established, buf).await
    }
}

async fn recv_queued(
    inbox: &mut mpsc::Receiver<Bytes>,
    established: &AtomicBool,
    buf: &mut [u8],
) -> Result<usize> {
    if !established.load(Ordering::Acquire) {
        return Err(Error::Closed);
    }

    match timeout(PSEUDO_READ_TIMEOUT, inbox.recv()).await {
        Err(_) => Err(Error::ReadTimeout),
        Ok(None) => Err(Error::Closed),
        Ok(Some(datagram)) => {
            let n = datagram.len().min(buf.len());
            buf[..n].copy_from_slice(&datagram[..n]);
            Ok(n)
        }
    }
}

async fn send_datagram(
    socket: &UdpSocket,
    peer: SocketAddr,
    established: &AtomicBool,
    buf: &[u8],
) -> Result<usize> {
    if !established.load(Ordering::Acquire) {
        return Err(Error::Closed);
    }
    Ok(socket.send_to(buf, peer).await?)
}

/// A dialed, connected UDP socket. Cloning shares the socket, which is how
/// the splicer obtains its two directions.
#[derive(Clone)]
pub struct UdpDialed {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpDialed {
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match timeout(IDLE_TIMEOUT, self.socket.recv(buf)).await {
            Err(_) => Err(Error::ReadTimeout),
            Ok(r) => Ok(r?),
        }
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.socket.send(buf).await?)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Listens on `address` and demultiplexes inbound datagrams into per-peer
/// pseudo-connections, announcing each new peer on `clients`.
///
/// A fatal socket error is reported as one `Err` on `clients` before the
/// task returns. The quit channel is polled before every receive; the
/// receive deadline bounds the reaction latency.
pub async fn listen(
    address: String,
    clients: mpsc::Sender<Result<Stream>>,
    mut quit: mpsc::Receiver<()>,
) {
    let socket = match bind(&address).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            tracing::error!("udp listen error, {}", e);
            let _ = clients.send(Err(e)).await;
            return;
        }
    };

    // Peer address -> live pseudo-connection. A closed entry lingers until
    // the next datagram from the same peer evicts it; there is no
    // background sweep.
    let mut table: HashMap<SocketAddr, PseudoEntry> = HashMap::new();

    // Matches the bound the splicer copies with, so larger datagrams are
    // truncated here and nowhere else.
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        match quit.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => {}
        }

        let (n, peer) = match timeout(LISTEN_RECV_TIMEOUT, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                tracing::error!("udp listen error, {}", e);
                let _ = clients.send(Err(e.into())).await;
                return;
            }
            Ok(Ok(r)) => r,
        };
        let mut datagram = Bytes::copy_from_slice(&buf[..n]);

        let mut expired = false;
        if let Some(entry) = table.get(&peer) {
            if entry.established() {
                match entry.inbox.send(datagram).await {
                    // Known live peer: deliver without re-announcing.
                    Ok(()) => continue,
                    Err(send_err) => {
                        datagram = send_err.0;
                        expired = true;
                    }
                }
            } else {
                expired = true;
            }
        }
        if expired {
            table.remove(&peer);
        }

        // New peer (or a re-knock on an expired entry): materialize a
        // pseudo-connection seeded with this datagram and announce it.
        let (conn, entry) = UdpPseudoConn::new(Arc::clone(&socket), peer);
        let _ = entry.inbox.send(datagram).await;
        table.insert(peer, entry);
        if clients.send(Ok(Stream::UdpPseudo(conn))).await.is_err() {
            return;
        }
    }
}

async fn bind(address: &str) -> Result<UdpSocket> {
    let addr = resolve_addr(address).await?;
    Ok(UdpSocket::bind(addr).await?)
}

/// Dials `address`, sends the knock so the remote demultiplexer creates a
/// pseudo-connection for this peer, and returns the connected socket.
///
/// Reads on the returned stream carry the 60-second idle deadline.
pub async fn dial(address: &str) -> Result<Stream> {
    let peer = resolve_addr(address).await?;
    let local = if peer.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    socket.send(KNOCK).await?;

    Ok(Stream::Udp(UdpDialed {
        socket: Arc::new(socket),
        peer,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    async fn bound_pair() -> (Arc<UdpSocket>, UdpSocket) {
        let shared = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (shared, remote)
    }

    #[tokio::test]
    async fn test_pseudo_read_delivers_in_order() {
        let (shared, remote) = bound_pair().await;
        let peer = remote.local_addr().unwrap();
        let (mut conn, entry) = UdpPseudoConn::new(shared, peer);

        entry.inbox.send(Bytes::from_static(b"one")).await.unwrap();
        entry.inbox.send(Bytes::from_static(b"two")).await.unwrap();
        entry.inbox.send(Bytes::from_static(b"three")).await.unwrap();

        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"three");
    }

    #[tokio::test]
    async fn test_pseudo_read_truncates_to_buffer() {
        let (shared, remote) = bound_pair().await;
        let peer = remote.local_addr().unwrap();
        let (mut conn, entry) = UdpPseudoConn::new(shared, peer);

        entry
            .inbox
            .send(Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..n], b"0123");
    }

    #[tokio::test]
    async fn test_pseudo_write_sends_datagram() {
        let (shared, remote) = bound_pair().await;
        let peer = remote.local_addr().unwrap();
        let (conn, _entry) = UdpPseudoConn::new(Arc::clone(&shared), peer);

        let n = conn.write(b"hello").await.unwrap();
        assert_eq!(n, 5);

        let mut buf = [0u8; 64];
        let (n, from) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, shared.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_drop_clears_established() {
        let (shared, remote) = bound_pair().await;
        let peer = remote.local_addr().unwrap();
        let (conn, entry) = UdpPseudoConn::new(shared, peer);

        assert!(entry.established());
        drop(conn);
        assert!(!entry.established());
    }

    #[tokio::test]
    async fn test_split_halves_keep_conn_established() {
        let (shared, remote) = bound_pair().await;
        let peer = remote.local_addr().unwrap();
        let (conn, entry) = UdpPseudoConn::new(shared, peer);

        let (read_half, write_half) = conn.split();
        assert!(entry.established());
        drop(read_half);
        assert!(entry.established());
        drop(write_half);
        assert!(!entry.established());
    }

    #[tokio::test]
    async fn test_listen_demux_routes_by_peer() {
        let (clients_tx, mut clients_rx) = mpsc::channel(1);
        let (_quit_tx, quit_rx) = mpsc::channel(1);
        tokio::spawn(listen("127.0.0.1:45511".to_string(), clients_tx, quit_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let peer1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer1.send_to(b"from-one", "127.0.0.1:45511").await.unwrap();
        peer2.send_to(b"from-two", "127.0.0.1:45511").await.unwrap();

        let mut conn1 = match clients_rx.recv().await.unwrap().unwrap() {
            Stream::UdpPseudo(c) => c,
            _ => panic!("expected pseudo-connection"),
        };
        let mut conn2 = match clients_rx.recv().await.unwrap().unwrap() {
            Stream::UdpPseudo(c) => c,
            _ => panic!("expected pseudo-connection"),
        };
        assert_eq!(conn1.peer(), peer1.local_addr().unwrap());
        assert_eq!(conn2.peer(), peer2.local_addr().unwrap());

        let mut buf = [0u8; 64];
        let n = conn1.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from-one");
        let n = conn2.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from-two");

        // A second datagram from a known peer is delivered, not
        // re-announced.
        peer1.send_to(b"again", "127.0.0.1:45511").await.unwrap();
        let n = conn1.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"again");
    }

    #[tokio::test]
    async fn test_listen_reknock_after_close() {
        let (clients_tx, mut clients_rx) = mpsc::channel(1);
        let (_quit_tx, quit_rx) = mpsc::channel(1);
        tokio::spawn(listen("127.0.0.1:45512".to_string(), clients_tx, quit_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(KNOCK, "127.0.0.1:45512").await.unwrap();

        let conn = match clients_rx.recv().await.unwrap().unwrap() {
            Stream::UdpPseudo(c) => c,
            _ => panic!("expected pseudo-connection"),
        };
        drop(conn);

        // The stale entry is evicted and a fresh pseudo-connection is
        // announced for the same peer address.
        peer.send_to(b"back", "127.0.0.1:45512").await.unwrap();
        let mut conn = match clients_rx.recv().await.unwrap().unwrap() {
            Stream::UdpPseudo(c) => c,
            _ => panic!("expected pseudo-connection"),
        };
        assert_eq!(conn.peer(), peer.local_addr().unwrap());

        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"back");
    }

    #[tokio::test]
    async fn test_listen_reports_bind_failure() {
        let (clients_tx, mut clients_rx) = mpsc::channel(1);
        let (_quit_tx, quit_rx) = mpsc::channel(1);
        tokio::spawn(listen("definitely.invalid:0".to_string(), clients_tx, quit_rx));

        assert!(clients_rx.recv().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_dial_sends_knock() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let stream = dial(&addr.to_string()).await.unwrap();
        assert_eq!(stream.remote_addr(), addr);

        let mut buf = [0u8; 16];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], KNOCK);
    }

    #[tokio::test]
    async fn test_dialed_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let stream = match dial(&addr.to_string()).await.unwrap() {
            Stream::Udp(d) => d,
            _ => panic!("expected dialed socket"),
        };

        let mut buf = [0u8; 64];
        let (_, client_addr) = server.recv_from(&mut buf).await.unwrap();

        stream.write(b"ping").await.unwrap();
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server.send_to(b"pong", client_addr).await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }
}
