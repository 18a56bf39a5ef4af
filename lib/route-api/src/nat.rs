//! Subnet NAT rules (`LOCAL_SUBNET_NAT` / `REMOTE_SUBNET_NAT`)
//!
//! Rules are written as `original=mapped,original=mapped`. Lookups match whole
//! networks so `10.1.0.0/16` never rewrites part of `110.1.0.0/16`.

use ipnetwork::IpNetwork;
use std::fmt;

use crate::{RecordError, Result};

/// One original -> mapped translation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetNatRule {
    pub original: IpNetwork,
    pub mapped: IpNetwork,
}

impl SubnetNatRule {
    /// Mapping a whole subnet onto one address (SNAT instead of NETMAP)
    pub fn is_many_to_one(&self) -> bool {
        !is_single_host(&self.original) && is_single_host(&self.mapped)
    }
}

impl fmt::Display for SubnetNatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.original, self.mapped)
    }
}

/// Ordered list of subnet NAT rules
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubnetNat {
    rules: Vec<SubnetNatRule>,
}

impl SubnetNat {
    /// Parse and validate a rule list. `kind` is "local" or "remote" and only
    /// shows up in error messages.
    pub fn parse(text: &str, kind: &str) -> Result<Self> {
        let text = text.trim().to_lowercase();
        if text.is_empty() {
            return Ok(Self::default());
        }

        let mut rules = Vec::new();
        for rule in text.split(',') {
            let parts: Vec<&str> = rule.split('=').collect();
            if parts.len() != 2 {
                return Err(RecordError::MalformedNatRule {
                    kind: kind.to_string(),
                    rule: rule.to_string(),
                });
            }

            let original: IpNetwork =
                parts[0].parse().map_err(|_| RecordError::InvalidOriginalCidr {
                    kind: kind.to_string(),
                    cidr: parts[0].to_string(),
                })?;
            let mapped: IpNetwork =
                parts[1].parse().map_err(|_| RecordError::InvalidMappedCidr {
                    kind: kind.to_string(),
                    cidr: parts[1].to_string(),
                })?;

            if original.prefix() != mapped.prefix() && !is_single_host(&mapped) {
                return Err(RecordError::NatSizeMismatch {
                    kind: kind.to_string(),
                    rule: rule.to_string(),
                });
            }

            rules.push(SubnetNatRule { original, mapped });
        }

        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[SubnetNatRule] {
        &self.rules
    }

    /// Networks on the inside of the translation
    pub fn originals(&self) -> impl Iterator<Item = &IpNetwork> {
        self.rules.iter().map(|r| &r.original)
    }

    /// Translate an original network to its mapped network
    pub fn remap(&self, subnet: &IpNetwork) -> IpNetwork {
        self.rules
            .iter()
            .find(|r| same_network(&r.original, subnet))
            .map(|r| r.mapped)
            .unwrap_or(*subnet)
    }

    /// Translate a mapped network back to its original network
    pub fn unmap(&self, subnet: &IpNetwork) -> Option<IpNetwork> {
        self.rules
            .iter()
            .find(|r| same_network(&r.mapped, subnet))
            .map(|r| r.original)
    }
}

impl fmt::Display for SubnetNat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rules: Vec<String> = self.rules.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", rules.join(","))
    }
}

/// Compare two networks by network address and prefix, ignoring host bits
pub fn same_network(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.prefix() == b.prefix() && a.network() == b.network()
}

/// True for /32 (IPv4) and /128 (IPv6) networks
pub fn is_single_host(net: &IpNetwork) -> bool {
    match net {
        IpNetwork::V4(n) => n.prefix() == 32,
        IpNetwork::V6(n) => n.prefix() == 128,
    }
}
