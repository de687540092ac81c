//! Input validation functions for the pairing server
//!
//! Everything a client can submit is validated at the boundary before it
//! reaches core logic. Non-conforming input is a ValidationError: dropped,
//! never echoed back.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Validates chat message text
///
/// Requirements:
/// - Non-empty after trimming
/// - At most `max_chars` characters after trimming
pub fn validate_message_text(text: &str, max_chars: usize) -> Result<&str, String> {
    let trimmed = text.trim();

    if trimmed.is_empty() {
        return Err("Message cannot be empty".to_string());
    }

    if trimmed.chars().count() > max_chars {
        return Err(format!("Message must not exceed {max_chars} characters"));
    }

    Ok(trimmed)
}

/// Validates a proof-of-work candidate submission
///
/// Requirements:
/// - 1-64 characters
/// - ASCII alphanumeric only
pub fn validate_challenge_candidate(candidate: &str) -> Result<(), String> {
    if candidate.is_empty() {
        return Err("Candidate cannot be empty".to_string());
    }

    if candidate.len() > 64 {
        return Err("Candidate must not exceed 64 characters".to_string());
    }

    if !candidate.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err("Candidate can only contain alphanumeric characters".to_string());
    }

    Ok(())
}

/// Parsed CIDR block used by the connection blocklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrBlock {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrBlock {
    /// Parse `a.b.c.d/len` or `x:y::/len`. A bare address is a full-length
    /// prefix.
    pub fn parse(cidr: &str) -> Result<Self, String> {
        let (addr_part, len_part) = match cidr.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (cidr, None),
        };

        let network: IpAddr = addr_part
            .parse()
            .map_err(|_| format!("Invalid address in CIDR: {cidr}"))?;

        let max_len = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix_len = match len_part {
            Some(l) => l
                .parse::<u8>()
                .map_err(|_| format!("Invalid prefix length in CIDR: {cidr}"))?,
            None => max_len,
        };

        if prefix_len > max_len {
            return Err(format!("Prefix length out of range in CIDR: {cidr}"));
        }

        Ok(Self {
            network,
            prefix_len,
        })
    }

    /// Whether the address falls inside this block. Families never mix.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = v4_mask(self.prefix_len);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = v6_mask(self.prefix_len);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

fn v6_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}

/// Convenience used by the gateway: does any configured block contain `addr`?
pub fn ip_in_ranges(addr: IpAddr, cidrs: &[String]) -> bool {
    cidrs.iter().any(|c| match CidrBlock::parse(c) {
        Ok(block) => block.contains(addr),
        Err(_) => false,
    })
}

/// Normalize an IP string the proxy may have decorated.
pub fn parse_ip(raw: &str) -> Option<IpAddr> {
    let trimmed = raw.trim().trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Some(ip);
    }
    // "host:port" forms
    if let Some((host, _)) = trimmed.rsplit_once(':') {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Some(IpAddr::V4(ip));
        }
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<Ipv6Addr>() {
            return Some(IpAddr::V6(ip));
        }
    }
    None
}
