//! Address parsing shared by connecting buffer events and listeners.

use crate::error::Error;
use socket2::{Domain, SockAddr};
use std::net::SocketAddr;

/// Parses `ip:port` (IPv6 in brackets) or `unix:path` into a socket
/// address and the domain to open the socket in.
///
/// Host names are not resolved; the caller passes literal addresses.
pub(crate) fn parse_addr(address: &str) -> Result<(SockAddr, Domain), Error> {
    if let Some(path) = address.strip_prefix("unix:") {
        let addr = SockAddr::unix(path).map_err(|e| Error::Config {
            reason: format!("invalid unix socket path {path:?}: {e}"),
        })?;
        return Ok((addr, Domain::UNIX));
    }
    let parsed: SocketAddr = address.parse().map_err(|_| Error::Config {
        reason: format!("unparseable address {address:?}; expected ip:port or unix:path"),
    })?;
    let domain = if parsed.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    Ok((SockAddr::from(parsed), domain))
}

/// Renders a socket address for log lines.
pub(crate) fn format_addr(addr: &SockAddr) -> String {
    if let Some(socket) = addr.as_socket() {
        return socket.to_string();
    }
    if addr.is_unix() {
        if let Some(path) = addr.as_pathname() {
            return format!("unix:{}", path.display());
        }
        return "unix:<unnamed>".to_string();
    }
    format!("<family {}>", addr.family())
}
