//! The duplex stream contract shared by every endpoint variant.
//!
//! All four variants (TCP accepted, TCP dialed, UDP pseudo, UDP dialed) are
//! one enum; the splicer splits a stream into owned halves so the two copy
//! directions can run concurrently. There is no explicit close: dropping a
//! stream (or both halves) closes the underlying transport.

use crate::error::Result;
use crate::udp::{PseudoReadHalf, PseudoWriteHalf, UdpDialed, UdpPseudoConn};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A polymorphic duplex byte stream.
pub enum Stream {
    /// TCP connection, accepted or dialed.
    Tcp { stream: TcpStream, peer: SocketAddr },
    /// Dialed, connected UDP socket.
    Udp(UdpDialed),
    /// Per-peer virtual connection from a UDP listener.
    UdpPseudo(UdpPseudoConn),
}

impl Stream {
    pub fn tcp(stream: TcpStream, peer: SocketAddr) -> Self {
        Stream::Tcp { stream, peer }
    }

    /// The remote network address this stream talks to.
    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            Stream::Tcp { peer, .. } => *peer,
            Stream::Udp(dialed) => dialed.peer(),
            Stream::UdpPseudo(conn) => conn.peer(),
        }
    }

    /// Reads into `buf`, returning the number of bytes delivered. `Ok(0)`
    /// means end of stream on TCP.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Stream::Tcp { stream, .. } => Ok(stream.read(buf).await?),
            Stream::Udp(dialed) => dialed.read(buf).await,
            Stream::UdpPseudo(conn) => conn.read(buf).await,
        }
    }

    /// Writes the whole of `buf`: all bytes on TCP, one datagram on UDP.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self {
            Stream::Tcp { stream, .. } => {
                stream.write_all(buf).await?;
                Ok(buf.len())
            }
            Stream::Udp(dialed) => dialed.write(buf).await,
            Stream::UdpPseudo(conn) => conn.write(buf).await,
        }
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        match self {
            Stream::Tcp { stream, .. } => {
                let (read, write) = stream.into_split();
                (ReadHalf::Tcp(read), WriteHalf::Tcp(write))
            }
            Stream::Udp(dialed) => (
                ReadHalf::Udp(dialed.clone()),
                WriteHalf::Udp(dialed),
            ),
            Stream::UdpPseudo(conn) => {
                let (read, write) = conn.split();
                (ReadHalf::UdpPseudo(read), WriteHalf::UdpPseudo(write))
            }
        }
    }
}

/// Read side of a split [`Stream`].
pub enum ReadHalf {
    Tcp(OwnedReadHalf),
    Udp(UdpDialed),
    UdpPseudo(PseudoReadHalf),
}

impl ReadHalf {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            ReadHalf::Tcp(read) => Ok(read.read(buf).await?),
            ReadHalf::Udp(dialed) => dialed.read(buf).await,
            ReadHalf::UdpPseudo(read) => read.read(buf).await,
        }
    }

    /// Whether a zero-length read means the peer ended the stream. True
    /// only for TCP; a datagram source can legitimately deliver an empty
    /// datagram, and its end of life is signalled by a read deadline
    /// instead.
    pub fn eof_on_empty_read(&self) -> bool {
        matches!(self, ReadHalf::Tcp(_))
    }
}

/// Write side of a split [`Stream`].
pub enum WriteHalf {
    Tcp(OwnedWriteHalf),
    Udp(UdpDialed),
    UdpPseudo(PseudoWriteHalf),
}

impl WriteHalf {
    /// Writes the whole of `buf`: all bytes on TCP, one datagram on UDP.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self {
            WriteHalf::Tcp(write) => {
                write.write_all(buf).await?;
                Ok(buf.len())
            }
            WriteHalf::Udp(dialed) => dialed.write(buf).await,
            WriteHalf::UdpPseudo(write) => write.write(buf).await,
        }
    }
}
