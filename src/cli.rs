//! CLI definitions for portforward.

use clap::{builder::PossibleValuesParser, Parser, ValueEnum};

/// The transport protocol both endpoints run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    /// Stream transport, byte transparent.
    Tcp,
    /// Datagram transport, demultiplexed into pseudo-connections on the
    /// listening side.
    Udp,
}

/// How one side of the forward obtains its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockMethod {
    /// Accept incoming connections.
    Listen,
    /// Dial outward.
    Conn,
}

/// One configured endpoint: a method plus the address it applies to.
///
/// Parsed from `<method>:<address>`, split on the first `:` only; the
/// remainder (including bracketed IPv6 such as `[fe80::1%lo0]:8888`) is
/// handed to the endpoint layer verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SockSpec {
    pub method: SockMethod,
    pub addr: String,
}

/// Parses a sock string of the form `<method>:<address>`.
fn parse_sock(sock: &str) -> Result<SockSpec, String> {
    let (method, addr) = sock
        .split_once(':')
        .ok_or_else(|| "sock format must be [method:address:port]".to_string())?;

    let method = if method.eq_ignore_ascii_case("listen") {
        SockMethod::Listen
    } else if method.eq_ignore_ascii_case("conn") {
        SockMethod::Conn
    } else {
        return Err(format!("unknown method [{}]", method));
    };

    if addr.is_empty() {
        return Err("sock format must be [method:address:port]".to_string());
    }

    Ok(SockSpec {
        method,
        addr: addr.to_string(),
    })
}

/// Bidirectional TCP/UDP port forwarder.
#[derive(Debug, Parser)]
#[command(name = "portforward")]
#[command(version, about, long_about = None)]
#[command(after_help = "\
Examples:
  portforward tcp conn:192.168.1.1:3389 conn:192.168.1.10:23333
  portforward udp listen:192.168.1.3:5353 conn:8.8.8.8:53
  portforward tcp listen:[fe80::1%lo0]:8888 conn:[fe80::1%lo0]:7777")]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "debug", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    /// Forwarding protocol (tcp/udp)
    #[arg(ignore_case = true)]
    pub proto: Protocol,

    /// First endpoint, format: [method:address:port], method is listen/conn
    #[arg(value_parser = parse_sock)]
    pub sock1: SockSpec,

    /// Second endpoint, format: [method:address:port], method is listen/conn
    #[arg(value_parser = parse_sock)]
    pub sock2: SockSpec,
}
