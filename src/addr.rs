//! Endpoint address handling.
//!
//! Endpoint addresses arrive as `host:port` strings (the method prefix has
//! already been stripped by the CLI layer) and may carry a bracketed IPv6
//! host. Hostnames resolve through a shared, lazily initialized DNS
//! resolver.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use tokio::sync::Mutex;

static RESOLVER: Lazy<DnsResolver> = Lazy::new(DnsResolver::new);

/// Resolves an endpoint address string into a socket address.
pub async fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    let (host, port) = split_host_port(addr)?;
    RESOLVER.resolve(&host, port).await
}

/// Splits `host:port` on the last `:`, unwrapping a bracketed IPv6 host.
fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let colon_pos = addr
        .rfind(':')
        .ok_or_else(|| Error::Config(format!("address must include port: '{}'", addr)))?;

    let host_part = &addr[..colon_pos];
    let port_part = &addr[colon_pos + 1..];

    let host = if host_part.starts_with('[') && host_part.ends_with(']') {
        &host_part[1..host_part.len() - 1]
    } else {
        host_part
    };

    let port: u16 = port_part
        .parse()
        .map_err(|_| Error::Config(format!("invalid port in address '{}'", addr)))?;

    Ok((host.to_string(), port))
}

/// Shared DNS resolver wrapper for reuse across multiple resolutions.
pub struct DnsResolver {
    resolver: Arc<
        Mutex<
            Option<
                hickory_resolver::Resolver<
                    hickory_resolver::name_server::TokioConnectionProvider,
                >,
            >,
        >,
    >,
}

impl DnsResolver {
    /// Creates a new DNS resolver.
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolves a hostname to a SocketAddr asynchronously.
    ///
    /// IP literals (including zone-scoped IPv6 such as `fe80::1%lo0`)
    /// short-circuit; otherwise the resolver is lazily initialized and
    /// reused for subsequent lookups.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        // std's address parser has no zone-id support, so the scope is
        // split off and resolved to an interface index here.
        if let Some((ip_part, zone)) = host.split_once('%') {
            let ip: Ipv6Addr = ip_part.parse().map_err(|_| {
                Error::Config(format!("invalid scoped address '{}'", host))
            })?;
            let scope_id = resolve_zone(zone)?;
            return Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope_id)));
        }

        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let mut resolver_guard = self.resolver.lock().await;
        if resolver_guard.is_none() {
            let resolver = hickory_resolver::Resolver::builder_tokio()
                .map_err(|e| Error::Config(format!("failed to create DNS resolver: {}", e)))?
                .build();
            *resolver_guard = Some(resolver);
        }

        let resolver = match resolver_guard.as_ref() {
            Some(r) => r,
            None => return Err(Error::Config("DNS resolver unavailable".to_string())),
        };

        let response = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::Config(format!("failed to resolve '{}': {}", host, e)))?;

        response
            .iter()
            .next()
            .map(|ip| SocketAddr::new(ip, port))
            .ok_or_else(|| Error::Config(format!("no addresses found for '{}'", host)))
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves an IPv6 zone id to an interface index: either a numeric scope
/// or an interface name like `lo0`.
fn resolve_zone(zone: &str) -> Result<u32> {
    if let Ok(index) = zone.parse::<u32>() {
        return Ok(index);
    }

    #[cfg(unix)]
    {
        let name = std::ffi::CString::new(zone)
            .map_err(|_| Error::Config(format!("invalid zone id '{}'", zone)))?;
        // SAFETY: if_nametoindex reads a NUL-terminated string and returns
        // the interface index, or 0 when the name is unknown.
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index != 0 {
            return Ok(index);
        }
    }

    Err(Error::Config(format!("unknown zone id '{}'", zone)))
}
