//! Addresses and node identities.
//!
//! A [`NetworkAddress`] is where a member listens; a [`NodeUid`] is *who*
//! the member is. The distinction matters for membership changes: a node
//! that crashes and restarts at the same address comes back with a fresh
//! UID, and the reconfiguration logic must tell the two incarnations apart.

use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Network address (IPv4/IPv6 + port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// IP address (IPv4 or IPv6).
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
}

impl NetworkAddress {
    /// Create a new network address.
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Whether this is an IPv4 address.
    pub const fn is_v4(&self) -> bool {
        self.ip.is_ipv4()
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Error parsing a network address from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid network address: {input}")]
pub struct AddressParseError {
    /// The string that failed to parse.
    pub input: String,
}

impl FromStr for NetworkAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sock: std::net::SocketAddr = s.parse().map_err(|_| AddressParseError {
            input: s.to_string(),
        })?;
        Ok(Self::new(sock.ip(), sock.port()))
    }
}

/// 128-bit node identity.
///
/// Unique per incarnation of a member process. Two incarnations at the same
/// [`NetworkAddress`] have different UIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeUid {
    /// First 64 bits.
    pub first: u64,
    /// Second 64 bits.
    pub second: u64,
}

impl NodeUid {
    /// Create a UID with explicit values.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Check if the UID is valid (non-zero).
    pub const fn is_valid(&self) -> bool {
        self.first != 0 || self.second != 0
    }
}

impl std::fmt::Display for NodeUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}
