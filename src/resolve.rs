//! Hostname resolution
//!
//! Peer hostnames in the session document are resolved lazily, at read time.
//! A name that resolves to loopback (the self-reference case on single-host
//! setups) is substituted with the address the kernel would pick for
//! outbound traffic; which local address wins when several routes exist is
//! the kernel's route selection, not ours.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs, UdpSocket};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Host '{0}' does not resolve to an IPv4 address")]
    Unresolvable(String),

    #[error("Could not determine local outbound address: {0}")]
    Outbound(std::io::Error),
}

pub trait Resolver: Send + Sync {
    /// Resolve a hostname to an IPv4 address.
    fn resolve(&self, host: &str) -> Result<Ipv4Addr, ResolveError>;

    /// The local address outbound traffic would use.
    fn local_outbound(&self) -> Result<Ipv4Addr, ResolveError>;
}

/// System resolver backed by the platform's name lookup.
pub struct DnsResolver;

impl Resolver for DnsResolver {
    fn resolve(&self, host: &str) -> Result<Ipv4Addr, ResolveError> {
        let addrs = (host, 0u16)
            .to_socket_addrs()
            .map_err(|_| ResolveError::Unresolvable(host.to_string()))?;
        for addr in addrs {
            if let IpAddr::V4(v4) = addr.ip() {
                return Ok(v4);
            }
        }
        Err(ResolveError::Unresolvable(host.to_string()))
    }

    fn local_outbound(&self) -> Result<Ipv4Addr, ResolveError> {
        // Connecting a UDP socket sends no packets; it only asks the kernel
        // which source address would be used to reach the target.
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(ResolveError::Outbound)?;
        socket
            .connect("8.8.8.8:80")
            .map_err(ResolveError::Outbound)?;
        let local = socket.local_addr().map_err(ResolveError::Outbound)?;
        match local.ip() {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => Err(ResolveError::Unresolvable("local outbound".to_string())),
        }
    }
}

/// Resolver returning fixed answers, for tests and dry runs.
pub struct FixedResolver {
    pub address: Ipv4Addr,
    pub outbound: Ipv4Addr,
}

impl Resolver for FixedResolver {
    fn resolve(&self, _host: &str) -> Result<Ipv4Addr, ResolveError> {
        Ok(self.address)
    }

    fn local_outbound(&self) -> Result<Ipv4Addr, ResolveError> {
        Ok(self.outbound)
    }
}
