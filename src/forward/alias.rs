use chrono::{DateTime, TimeZone, Utc};
use hashbrown::HashMap;
use tracing::{debug, trace};

use super::tree::{NodeAddr, TreeNode};
use crate::net::wire::WireAlias;

/// Transient name -> address overrides for one dispatch.
///
/// An external source installs a table (for instance addresses of nodes that
/// were just powered up and are not yet in the default resolution) together
/// with the time after which the overrides are stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasTable {
    addrs: HashMap<String, String>,
    expires_at: Option<DateTime<Utc>>,
}

impl AliasTable {
    pub fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            addrs: HashMap::new(),
            expires_at: Some(expires_at),
        }
    }

    /// A table that never expires.
    pub fn permanent() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, addr: impl Into<String>) {
        self.addrs.insert(name.into(), addr.into());
    }

    pub fn with(mut self, name: impl Into<String>, addr: impl Into<String>) -> Self {
        self.insert(name, addr);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.addrs.get(name).map(String::as_str)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// The entries a branch needs, i.e. those naming a node of `nodes`.
    pub(crate) fn to_wire(&self, nodes: &[TreeNode]) -> (Vec<WireAlias>, Option<i64>) {
        let aliases = nodes
            .iter()
            .filter_map(|n| {
                self.addrs.get(&n.node.name).map(|addr| WireAlias {
                    name: n.node.name.clone(),
                    addr: addr.clone(),
                })
            })
            .collect::<Vec<_>>();
        let expires_at = if aliases.is_empty() {
            None
        } else {
            self.expires_at.map(|at| at.timestamp_micros())
        };
        (aliases, expires_at)
    }

    pub(crate) fn from_wire(aliases: Vec<WireAlias>, expires_at: Option<i64>) -> Option<Self> {
        if aliases.is_empty() {
            return None;
        }
        let expires_at = match expires_at {
            Some(micros) => match Utc.timestamp_micros(micros).single() {
                Some(at) => Some(at),
                // an unreadable expiry can't be honoured, so drop the overrides
                None => return None,
            },
            None => None,
        };
        Some(Self {
            addrs: aliases.into_iter().map(|a| (a.name, a.addr)).collect(),
            expires_at,
        })
    }
}

/// Picks the physical address to contact for a node. Lookups are plain map
/// reads and never touch the network.
#[derive(Debug, Clone, Default)]
pub struct AliasResolver {
    table: Option<AliasTable>,
}

impl AliasResolver {
    pub fn new(table: Option<AliasTable>) -> Self {
        let table = table.filter(|t| !t.is_empty());
        Self { table }
    }

    pub fn table(&self) -> Option<&AliasTable> {
        self.table.as_ref()
    }

    /// Returns the live alias table, or `None` once it has expired.
    fn live_table(&self) -> Option<&AliasTable> {
        let table = self.table.as_ref()?;
        if table.is_expired(Utc::now()) {
            debug!("alias table expired, using default addresses");
            return None;
        }
        Some(table)
    }

    pub fn resolve<'a>(&'a self, node: &'a NodeAddr) -> &'a str {
        match self.live_table().and_then(|t| t.get(&node.name)) {
            Some(addr) => {
                trace!("resolved {} to alias {}", node.name, addr);
                addr
            }
            None => &node.addr,
        }
    }

    /// Alias entries to ship with a branch covering `nodes`. Nothing is sent
    /// once the table has expired.
    pub(crate) fn for_branch(&self, nodes: &[TreeNode]) -> (Vec<WireAlias>, Option<i64>) {
        match self.live_table() {
            Some(table) => table.to_wire(nodes),
            None => (Vec::new(), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn node(name: &str, addr: &str) -> NodeAddr {
        NodeAddr::new(name, addr)
    }

    #[test]
    fn alias_wins_over_default_address() {
        let table =
            AliasTable::new(Utc::now() + Duration::minutes(5)).with("cn01", "10.9.0.1:6818");
        let resolver = AliasResolver::new(Some(table));
        let cn01 = node("cn01", "cn01:6818");
        let cn02 = node("cn02", "cn02:6818");
        assert_eq!(resolver.resolve(&cn01), "10.9.0.1:6818");
        assert_eq!(resolver.resolve(&cn02), "cn02:6818");
    }

    #[test]
    fn expired_table_is_ignored() {
        let table =
            AliasTable::new(Utc::now() - Duration::seconds(1)).with("cn01", "10.9.0.1:6818");
        let resolver = AliasResolver::new(Some(table));
        let cn01 = node("cn01", "cn01:6818");
        assert_eq!(resolver.resolve(&cn01), "cn01:6818");
        let branch = [TreeNode {
            node: cn01.clone(),
            span: 1,
        }];
        assert!(resolver.for_branch(&branch).0.is_empty());
    }

    #[test]
    fn empty_table_means_default_resolution() {
        let resolver = AliasResolver::new(Some(AliasTable::permanent()));
        assert!(resolver.table().is_none());
        let cn01 = node("cn01", "cn01:6818");
        assert_eq!(resolver.resolve(&cn01), "cn01:6818");
    }

    #[test]
    fn branch_only_carries_its_own_aliases() {
        let expires = Utc::now() + Duration::minutes(1);
        let table = AliasTable::new(expires)
            .with("cn01", "10.9.0.1:6818")
            .with("cn07", "10.9.0.7:6818");
        let branch = [
            TreeNode {
                node: node("cn06", "cn06:6818"),
                span: 2,
            },
            TreeNode {
                node: node("cn07", "cn07:6818"),
                span: 1,
            },
        ];
        let (aliases, expires_at) = table.to_wire(&branch);
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].name, "cn07");
        assert_eq!(expires_at, Some(expires.timestamp_micros()));

        let rebuilt = AliasTable::from_wire(aliases, expires_at).unwrap();
        assert_eq!(rebuilt.get("cn07"), Some("10.9.0.7:6818"));
        assert_eq!(
            rebuilt.expires_at().map(|t| t.timestamp_micros()),
            Some(expires.timestamp_micros())
        );
    }
}
