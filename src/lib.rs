//! portforward - bidirectional TCP/UDP port forwarder.
//!
//! Two independently configured socket endpoints (listen or conn) are paired
//! into a byte-transparent duplex bridge. Three topologies fall out of the
//! combinations: Conn<=>Conn (pivot), Listen<=>Conn (forward proxy), and
//! Listen<=>Listen (double-reverse rendezvous). UDP is made to behave like
//! an accept loop by demultiplexing a shared socket into per-peer
//! pseudo-connections.

pub mod addr;
pub mod cli;
pub mod error;
pub mod forward;
pub mod logging;
pub mod splice;
pub mod stream;
pub mod tcp;
pub mod udp;

pub use addr::resolve_addr;
pub use cli::{Cli, Protocol, SockMethod, SockSpec};
pub use error::{Error, Result};
pub use forward::{Controller, ForwardArgs};
pub use splice::{splice, COPY_BUFFER_SIZE};
pub use stream::{ReadHalf, Stream, WriteHalf};
pub use udp::{UdpDialed, UdpPseudoConn, KNOCK};
