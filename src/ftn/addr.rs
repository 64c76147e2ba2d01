//! 5D FTN addressing: `zone:net/node.point@domain`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A five-dimensional FTN address. Point 0 means the node itself; an empty
/// domain inherits the configured default at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FtnAddress {
    pub zone: u16,
    pub net: u16,
    pub node: u16,
    pub point: u16,
    #[serde(default)]
    pub domain: String,
}

impl FtnAddress {
    pub fn new(zone: u16, net: u16, node: u16, point: u16) -> Self {
        FtnAddress { zone, net, node, point, domain: String::new() }
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_ascii_lowercase();
        self
    }

    /// Numeric identity match, ignoring the domain. Routing by numeric
    /// identity uses this; config identity checks use full `==`.
    pub fn same_node(&self, other: &FtnAddress) -> bool {
        self.zone == other.zone
            && self.net == other.net
            && self.node == other.node
            && self.point == other.point
    }

    /// The boss node of a point address (point cleared). Non-points return
    /// themselves unchanged.
    pub fn boss(&self) -> FtnAddress {
        FtnAddress { point: 0, ..self.clone() }
    }

    pub fn is_point(&self) -> bool {
        self.point != 0
    }

    /// Directory-name form used in the outbound/inbound spool trees.
    pub fn spool_dir(&self) -> String {
        if self.point == 0 {
            format!("{}.{}", self.net, self.node)
        } else {
            format!("{}.{}.{}", self.net, self.node, self.point)
        }
    }
}

impl fmt::Display for FtnAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.zone, self.net, self.node)?;
        if self.point != 0 {
            write!(f, ".{}", self.point)?;
        }
        if !self.domain.is_empty() {
            write!(f, "@{}", self.domain)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed FTN address '{0}'")]
pub struct AddrParseError(String);

impl FromStr for FtnAddress {
    type Err = AddrParseError;

    /// Accepts `zone:net/node`, `zone:net/node.point`, and either with a
    /// trailing `@domain`. Missing point defaults to 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || AddrParseError(s.to_string());
        let (addr_part, domain) = match s.split_once('@') {
            Some((a, d)) => (a, d.to_ascii_lowercase()),
            None => (s, String::new()),
        };
        let (zone_s, rest) = addr_part.split_once(':').ok_or_else(bad)?;
        let (net_s, node_part) = rest.split_once('/').ok_or_else(bad)?;
        let (node_s, point_s) = match node_part.split_once('.') {
            Some((n, p)) => (n, Some(p)),
            None => (node_part, None),
        };
        let zone = zone_s.trim().parse().map_err(|_| bad())?;
        let net = net_s.trim().parse().map_err(|_| bad())?;
        let node = node_s.trim().parse().map_err(|_| bad())?;
        let point = match point_s {
            Some(p) => p.trim().parse().map_err(|_| bad())?,
            None => 0,
        };
        Ok(FtnAddress { zone, net, node, point, domain })
    }
}
