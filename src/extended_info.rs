//! Reverse lookup tables from relay identifiers to lease addresses.
//!
//! Relays stamp the identifiers they know about (relay-id, remote-id) into
//! the user context of each lease under the `"ISC"` key. These tables map
//! each identifier back to the set of addresses carrying it so bulk lease
//! queries can page through them in address order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use serde_json::Value;

use crate::lease::{Lease, LeasePage, Link, address_range};

const ISC_KEY: &str = "ISC";
const RELAY_INFO_KEY: &str = "relay-info";
const RELAY_AGENT_INFO_KEY: &str = "relay-agent-info";
const RELAY_ID_KEY: &str = "relay-id";
const REMOTE_ID_KEY: &str = "remote-id";

/// Which of the two tables an identifier belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    RelayId,
    RemoteId,
}

/// Identifiers extracted from a lease's user context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedInfo {
    pub relay_ids: Vec<Vec<u8>>,
    pub remote_ids: Vec<Vec<u8>>,
}

impl ExtendedInfo {
    /// Extracts relay and remote identifiers from a user context.
    ///
    /// Looks at every entry of `ISC.relay-info` (v6 relay chain) and at
    /// `ISC.relay-agent-info` (v4 option 82). Values are hex strings with
    /// an optional `0x` prefix. Anything malformed is treated as absent.
    pub fn from_user_context(context: &Value) -> Self {
        let mut info = Self::default();
        let Some(isc) = context.get(ISC_KEY) else {
            return info;
        };

        if let Some(relays) = isc.get(RELAY_INFO_KEY).and_then(Value::as_array) {
            for relay in relays {
                info.collect(relay);
            }
        }

        if let Some(agent) = isc.get(RELAY_AGENT_INFO_KEY)
            && agent.is_object()
        {
            info.collect(agent);
        }

        info
    }

    pub fn from_lease(lease: &Lease) -> Self {
        lease
            .user_context
            .as_ref()
            .map(Self::from_user_context)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.relay_ids.is_empty() && self.remote_ids.is_empty()
    }

    pub fn identifiers(&self, kind: IdentifierKind) -> &[Vec<u8>] {
        match kind {
            IdentifierKind::RelayId => &self.relay_ids,
            IdentifierKind::RemoteId => &self.remote_ids,
        }
    }

    fn collect(&mut self, relay: &Value) {
        if let Some(id) = relay.get(RELAY_ID_KEY).and_then(decode_identifier)
            && !self.relay_ids.contains(&id)
        {
            self.relay_ids.push(id);
        }
        if let Some(id) = relay.get(REMOTE_ID_KEY).and_then(decode_identifier)
            && !self.remote_ids.contains(&id)
        {
            self.remote_ids.push(id);
        }
    }
}

fn decode_identifier(value: &Value) -> Option<Vec<u8>> {
    parse_identifier(value.as_str()?)
}

/// Decodes a hex identifier with an optional `0x` prefix.
///
/// Returns `None` for anything that is not a non-empty, even-length hex
/// string.
pub fn parse_identifier(text: &str) -> Option<Vec<u8>> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    match hex::decode(digits) {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        _ => None,
    }
}

/// One identifier table, searchable by identifier and by address.
///
/// Each `(identifier, address)` pair is stored at most once.
#[derive(Debug, Default)]
pub struct ExtendedInfoTable {
    by_identifier: BTreeMap<Vec<u8>, BTreeSet<IpAddr>>,
    by_address: HashMap<IpAddr, BTreeSet<Vec<u8>>>,
    len: usize,
}

impl ExtendedInfoTable {
    /// Returns `false` if the pair was already present.
    pub fn insert(&mut self, address: IpAddr, identifier: &[u8]) -> bool {
        let inserted = self
            .by_identifier
            .entry(identifier.to_vec())
            .or_default()
            .insert(address);
        if inserted {
            self.by_address
                .entry(address)
                .or_default()
                .insert(identifier.to_vec());
            self.len += 1;
        }
        inserted
    }

    /// Removes every entry for the address and returns how many there were.
    pub fn remove_address(&mut self, address: &IpAddr) -> usize {
        let Some(identifiers) = self.by_address.remove(address) else {
            return 0;
        };
        for identifier in &identifiers {
            if let Some(addresses) = self.by_identifier.get_mut(identifier) {
                addresses.remove(address);
                if addresses.is_empty() {
                    self.by_identifier.remove(identifier);
                }
            }
        }
        self.len -= identifiers.len();
        identifiers.len()
    }

    pub fn contains(&self, address: &IpAddr, identifier: &[u8]) -> bool {
        self.by_address
            .get(address)
            .is_some_and(|identifiers| identifiers.contains(identifier))
    }

    /// Addresses indexed under `identifier`, ascending, strictly after
    /// `start_from` and restricted to `link` when given.
    pub fn addresses<'a>(
        &'a self,
        identifier: &[u8],
        link: Option<&Link>,
        start_from: Option<&IpAddr>,
    ) -> impl Iterator<Item = &'a IpAddr> + use<'a> {
        self.by_identifier
            .get(identifier)
            .zip(address_range(link, start_from))
            .into_iter()
            .flat_map(|(addresses, range)| addresses.range(range))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The relay-id and remote-id tables.
#[derive(Debug, Default)]
pub struct ExtendedInfoTables {
    relay_id: ExtendedInfoTable,
    remote_id: ExtendedInfoTable,
}

impl ExtendedInfoTables {
    pub fn table(&self, kind: IdentifierKind) -> &ExtendedInfoTable {
        match kind {
            IdentifierKind::RelayId => &self.relay_id,
            IdentifierKind::RemoteId => &self.remote_id,
        }
    }

    fn table_mut(&mut self, kind: IdentifierKind) -> &mut ExtendedInfoTable {
        match kind {
            IdentifierKind::RelayId => &mut self.relay_id,
            IdentifierKind::RemoteId => &mut self.remote_id,
        }
    }

    pub fn add_entry(&mut self, kind: IdentifierKind, address: IpAddr, identifier: &[u8]) -> bool {
        self.table_mut(kind).insert(address, identifier)
    }

    /// Indexes every identifier found in the lease's user context and
    /// returns the number of new entries.
    pub fn add_lease(&mut self, lease: &Lease) -> usize {
        let info = ExtendedInfo::from_lease(lease);
        let mut added = 0;
        for kind in [IdentifierKind::RelayId, IdentifierKind::RemoteId] {
            for identifier in info.identifiers(kind) {
                if self.add_entry(kind, lease.address, identifier) {
                    added += 1;
                }
            }
        }
        added
    }

    /// Removes the address from both tables; returns the entries removed.
    pub fn delete_entries_for_address(&mut self, address: &IpAddr) -> usize {
        self.relay_id.remove_address(address) + self.remote_id.remove_address(address)
    }

    /// Addresses for one page of an identifier lookup.
    pub fn query(
        &self,
        kind: IdentifierKind,
        identifier: &[u8],
        link: Option<&Link>,
        page: &LeasePage,
    ) -> Vec<IpAddr> {
        self.query_with(kind, identifier, link, page, |address| Some(*address))
    }

    /// One page of an identifier lookup, resolving each address through
    /// `resolve`. Addresses it maps to `None` are skipped and do not count
    /// towards the page size.
    pub fn query_with<T>(
        &self,
        kind: IdentifierKind,
        identifier: &[u8],
        link: Option<&Link>,
        page: &LeasePage,
        resolve: impl FnMut(&IpAddr) -> Option<T>,
    ) -> Vec<T> {
        self.table(kind)
            .addresses(identifier, link, page.start_from.as_ref())
            .filter_map(resolve)
            .take(page.size.get())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeasePageSize;
    use serde_json::json;

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[test]
    fn test_parse_v6_relay_chain() {
        let context = json!({
            "ISC": {
                "relay-info": [
                    {
                        "hop": 1,
                        "link": "2001:db8::1",
                        "peer": "2001:db8::2",
                        "remote-id": "010203040506",
                        "relay-id": "6464646464646464"
                    },
                    {
                        "hop": 0,
                        "link": "2001:db8::3",
                        "peer": "2001:db8::4",
                        "remote-id": "0x0A0B0C"
                    }
                ]
            }
        });
        let info = ExtendedInfo::from_user_context(&context);
        assert_eq!(info.relay_ids, vec![vec![0x64; 8]]);
        assert_eq!(
            info.remote_ids,
            vec![vec![1, 2, 3, 4, 5, 6], vec![0x0a, 0x0b, 0x0c]]
        );
    }

    #[test]
    fn test_parse_v4_relay_agent_info() {
        let context = json!({
            "ISC": {
                "relay-agent-info": {
                    "sub-options": "0x02030102030C03AABBCC",
                    "remote-id": "010203",
                    "relay-id": "AABBCC"
                }
            }
        });
        let info = ExtendedInfo::from_user_context(&context);
        assert_eq!(info.relay_ids, vec![vec![0xaa, 0xbb, 0xcc]]);
        assert_eq!(info.remote_ids, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_malformed_context_is_empty() {
        let cases = [
            json!(null),
            json!("ISC"),
            json!({ "comment": "no isc" }),
            json!({ "ISC": "not a map" }),
            json!({ "ISC": { "relay-info": "not a list" } }),
            json!({ "ISC": { "relay-info": [{ "relay-id": 42 }] } }),
            json!({ "ISC": { "relay-info": [{ "relay-id": "xyz" }] } }),
            json!({ "ISC": { "relay-info": [{ "remote-id": "123" }] } }),
            json!({ "ISC": { "relay-info": [{ "remote-id": "" }] } }),
            json!({ "ISC": { "relay-agent-info": ["010203"] } }),
        ];
        for context in cases {
            assert!(
                ExtendedInfo::from_user_context(&context).is_empty(),
                "{context}"
            );
        }
    }

    #[test]
    fn test_table_pairs_are_unique() {
        let mut table = ExtendedInfoTable::default();
        assert!(table.insert(ip("2001:db8::1"), b"relay"));
        assert!(!table.insert(ip("2001:db8::1"), b"relay"));
        assert!(table.insert(ip("2001:db8::1"), b"other"));
        assert!(table.insert(ip("2001:db8::2"), b"relay"));
        assert_eq!(table.len(), 3);
        assert!(table.contains(&ip("2001:db8::1"), b"other"));

        assert_eq!(table.remove_address(&ip("2001:db8::1")), 2);
        assert_eq!(table.remove_address(&ip("2001:db8::1")), 0);
        assert_eq!(table.len(), 1);
        assert!(!table.contains(&ip("2001:db8::1"), b"relay"));
        assert!(table.contains(&ip("2001:db8::2"), b"relay"));

        assert_eq!(table.remove_address(&ip("2001:db8::2")), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_query_orders_and_filters() {
        let mut tables = ExtendedInfoTables::default();
        for address in ["2001:db8::9", "2001:db8::3", "2001:db8:1::1", "2001:db8::5"] {
            tables.add_entry(IdentifierKind::RemoteId, ip(address), b"rid");
        }
        tables.add_entry(IdentifierKind::RelayId, ip("2001:db8::4"), b"rid");

        let size = LeasePageSize::new(10).unwrap();
        let all = tables.query(IdentifierKind::RemoteId, b"rid", None, &LeasePage::first(size));
        assert_eq!(
            all,
            vec![
                ip("2001:db8::3"),
                ip("2001:db8::5"),
                ip("2001:db8::9"),
                ip("2001:db8:1::1")
            ]
        );

        let link: Link = "2001:db8::/64".parse().unwrap();
        let page = LeasePage::after(ip("2001:db8::3"), LeasePageSize::new(1).unwrap());
        let got = tables.query(IdentifierKind::RemoteId, b"rid", Some(&link), &page);
        assert_eq!(got, vec![ip("2001:db8::5")]);

        let page = LeasePage::after(ip("2001:db8::9"), size);
        assert!(
            tables
                .query(IdentifierKind::RemoteId, b"rid", Some(&link), &page)
                .is_empty()
        );

        assert!(
            tables
                .query(IdentifierKind::RemoteId, b"nope", None, &LeasePage::first(size))
                .is_empty()
        );
    }

    #[test]
    fn test_query_with_skips_unresolved_addresses() {
        let mut tables = ExtendedInfoTables::default();
        for address in ["2001:db8::1", "2001:db8::2", "2001:db8::3", "2001:db8::4"] {
            tables.add_entry(IdentifierKind::RelayId, ip(address), b"relay");
        }

        let page = LeasePage::first(LeasePageSize::new(2).unwrap());
        let got = tables.query_with(IdentifierKind::RelayId, b"relay", None, &page, |address| {
            (*address != ip("2001:db8::2")).then(|| address.to_string())
        });
        assert_eq!(got, vec!["2001:db8::1", "2001:db8::3"]);
    }

    #[test]
    fn test_delete_entries_spans_both_tables() {
        let mut tables = ExtendedInfoTables::default();
        let address = ip("192.0.2.1");
        tables.add_entry(IdentifierKind::RelayId, address, &[1]);
        tables.add_entry(IdentifierKind::RemoteId, address, &[2]);
        tables.add_entry(IdentifierKind::RemoteId, address, &[3]);
        assert_eq!(tables.delete_entries_for_address(&address), 3);
        assert!(tables.table(IdentifierKind::RelayId).is_empty());
        assert!(tables.table(IdentifierKind::RemoteId).is_empty());
    }
}
