// Addressing utilities shared by the policy builder and the verifier.
//
// Converts dotted-quad host literals and CIDR literals into a (address, mask)
// pair of 32-bit integers in host order, so that a source address can be
// tested against a prefix with a single AND and compare.
//
// IPv4 only.

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while converting an address literal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid IPv4 address '{0}'")]
    InvalidAddress(String),

    #[error("invalid prefix length in '{0}'")]
    InvalidMask(String),
}

// ============================================================================
// PREFIX MATCHER
// ============================================================================

/// A bit-masked IPv4 prefix.
///
/// `address` always has its host bits cleared, so `addr & mask == address`
/// is the membership test. A host literal carries an all-ones mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Prefix {
    pub address: u32,
    pub mask: u32,
}

impl Prefix {
    /// Prefix matching exactly one host.
    pub const fn host(address: u32) -> Self {
        Prefix {
            address,
            mask: u32::MAX,
        }
    }

    /// Builds a prefix from an address and a prefix length, clearing host bits.
    pub fn from_len(address: u32, len: u8) -> Result<Self, AddressError> {
        if len > 32 {
            return Err(AddressError::InvalidMask(format!(
                "{}/{}",
                Ipv4Addr::from(address),
                len
            )));
        }
        let mask = mask_for_len(len);
        Ok(Prefix {
            address: address & mask,
            mask,
        })
    }

    /// Parses either `a.b.c.d` or `a.b.c.d/n`.
    pub fn parse(literal: &str) -> Result<Self, AddressError> {
        if literal.contains('/') {
            parse_cidr(literal)
        } else {
            parse_host(literal).map(Prefix::host)
        }
    }

    /// Returns true if `addr` falls inside this prefix.
    #[inline]
    pub const fn contains(&self, addr: u32) -> bool {
        addr & self.mask == self.address
    }

    /// Number of leading one-bits in the mask.
    pub const fn len(&self) -> u32 {
        self.mask.leading_ones()
    }

    /// True for the catch-all `0.0.0.0/0`.
    pub const fn is_any(&self) -> bool {
        self.mask == 0
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mask == u32::MAX {
            write!(f, "{}", Ipv4Addr::from(self.address))
        } else {
            write!(f, "{}/{}", Ipv4Addr::from(self.address), self.len())
        }
    }
}

impl FromStr for Prefix {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Prefix::parse(s)
    }
}

// ============================================================================
// LITERAL PARSING
// ============================================================================

/// Parses a dotted-quad host literal into its big-endian integer value.
pub fn parse_host(literal: &str) -> Result<u32, AddressError> {
    Ipv4Addr::from_str(literal)
        .map(u32::from)
        .map_err(|_| AddressError::InvalidAddress(literal.to_string()))
}

/// Parses a CIDR literal. The address is normalized to the network address
/// and the mask carries `n` leading one-bits.
pub fn parse_cidr(literal: &str) -> Result<Prefix, AddressError> {
    let (addr, len) = literal
        .split_once('/')
        .ok_or_else(|| AddressError::InvalidMask(literal.to_string()))?;

    // Validate both halves ourselves so the error names the right part.
    parse_host(addr)?;
    let len: u8 = len
        .parse()
        .map_err(|_| AddressError::InvalidMask(literal.to_string()))?;
    if len > 32 {
        return Err(AddressError::InvalidMask(literal.to_string()));
    }

    let network = Ipv4Network::from_str(literal)
        .map_err(|_| AddressError::InvalidAddress(literal.to_string()))?;

    Ok(Prefix {
        address: u32::from(network.network()),
        mask: u32::from(network.mask()),
    })
}

/// Mask with `len` leading one-bits.
pub const fn mask_for_len(len: u8) -> u32 {
    if len == 0 {
        0
    } else if len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - len as u32)
    }
}
