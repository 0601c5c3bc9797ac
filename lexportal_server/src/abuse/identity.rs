//! Client identity resolution.
//!
//! The identity is the peer address of the connection. Forwarded headers are
//! only believed when the peer itself is a trusted proxy.

use axum::{
    extract::{ConnectInfo, Request},
    http::HeaderMap,
};
use ipnet::IpNet;
use lexportal_common::constants;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Key under which violations are tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientIdentity(IpAddr);

impl ClientIdentity {
    /// IPv4-mapped IPv6 addresses are folded to plain IPv4
    pub fn new(ip: IpAddr) -> Self {
        Self(ip.to_canonical())
    }

    pub fn ip(&self) -> IpAddr {
        self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Request carries no peer address")]
    MissingPeer,
}

/// Derives a [`ClientIdentity`] from an inbound request
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    trusted_proxies: Vec<IpNet>,
}

impl IdentityResolver {
    pub fn new(trusted_proxies: Vec<IpNet>) -> Self {
        Self { trusted_proxies }
    }

    pub fn resolve(&self, req: &Request) -> Result<ClientIdentity, IdentityError> {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        self.resolve_parts(peer, req.headers())
    }

    fn resolve_parts(
        &self,
        peer: Option<IpAddr>,
        headers: &HeaderMap,
    ) -> Result<ClientIdentity, IdentityError> {
        let peer = peer.ok_or(IdentityError::MissingPeer)?.to_canonical();

        if !self.is_trusted_proxy(&peer) {
            return Ok(ClientIdentity::new(peer));
        }

        if let Some(ip) = self.from_forwarded_for(headers) {
            return Ok(ClientIdentity::new(ip));
        }

        if let Some(ip) = headers
            .get(constants::REAL_IP_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            return Ok(ClientIdentity::new(ip));
        }

        Ok(ClientIdentity::new(peer))
    }

    /// Walk X-Forwarded-For right to left, skipping our own proxies
    fn from_forwarded_for(&self, headers: &HeaderMap) -> Option<IpAddr> {
        let value = headers
            .get(constants::FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())?;

        let hops: Vec<IpAddr> = value
            .split(',')
            .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
            .map(|ip| ip.to_canonical())
            .collect();

        hops.iter()
            .rev()
            .find(|ip| !self.is_trusted_proxy(ip))
            .or_else(|| hops.first())
            .copied()
    }

    fn is_trusted_proxy(&self, ip: &IpAddr) -> bool {
        self.trusted_proxies.iter().any(|net| net.contains(ip))
    }
}
