//! Lease storage with extended-info indexing and persistence.
//!
//! This module owns the authoritative lease collection. It provides:
//!
//! - Add, update and delete of v4 and v6 leases keyed by address
//! - Synchronous maintenance of the relay-id / remote-id reverse tables
//!   (see [`crate::extended_info`]) driven by each lease's action tag
//! - Paginated lookups by relay-id, remote-id and link prefix
//! - Persistence to a JSON file, with the index rebuilt on load
//!
//! # Thread Safety
//!
//! All operations are thread-safe. The [`Leases`] struct uses a single
//! [`Mutex`] guarding both the lease map and the index tables, so a lease
//! change and its index maintenance are observed together by every reader.
//! A second [`Mutex`] serializes file writes.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::Bound;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::LeaseDatabaseConfig;
use crate::error::{Error, Result};
use crate::extended_info::{ExtendedInfoTables, IdentifierKind};

/// Minimum interval between lease file saves (5 seconds).
///
/// Prevents excessive disk I/O when handling many updates. Changes are only
/// marked saved once a write has succeeded, so a failed write is retried on
/// the next change after the interval.
const SAVE_INTERVAL_MILLIS: u64 = 5000;

/// The kind of resource a lease assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseType {
    /// DHCPv4 address.
    #[serde(rename = "V4")]
    V4,
    /// DHCPv6 non-temporary address.
    #[serde(rename = "IA_NA")]
    Na,
    /// DHCPv6 temporary address.
    #[serde(rename = "IA_TA")]
    Ta,
    /// DHCPv6 delegated prefix.
    #[serde(rename = "IA_PD")]
    Pd,
}

impl fmt::Display for LeaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeaseType::V4 => "V4",
            LeaseType::Na => "IA_NA",
            LeaseType::Ta => "IA_TA",
            LeaseType::Pd => "IA_PD",
        };
        f.pad(name)
    }
}

/// Directive telling the store what to do with the extended-info tables
/// when the lease is written.
///
/// The tag is transient: it is never persisted and the store resets it to
/// [`ExtendedInfoAction::Ignore`] whenever it consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtendedInfoAction {
    /// Leave the tables untouched.
    #[default]
    Ignore,
    /// Drop every table entry referencing this lease.
    Delete,
    /// Drop the entries and re-derive them from the user context.
    Update,
}

/// An address or prefix assignment.
///
/// Represents a binding between a client identifier (client id or DUID)
/// and an address with a validity window. Leases are persisted to disk
/// and restored on restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// The leased address (or delegated prefix).
    pub address: IpAddr,

    /// Lease type; always [`LeaseType::V4`] for IPv4 addresses.
    pub lease_type: LeaseType,

    /// Prefix length: 32 for v4, 128 for v6 addresses, the delegated
    /// length for prefixes.
    pub prefix_len: u8,

    /// Client identifier or DUID (hex-encoded on disk).
    #[serde(with = "hex")]
    pub client_id: Vec<u8>,

    /// Identifier of the subnet the lease belongs to.
    pub subnet_id: u32,

    /// Valid lifetime in seconds.
    pub valid_lifetime: u32,

    /// Preferred lifetime in seconds (0 for v4).
    #[serde(default)]
    pub preferred_lifetime: u32,

    /// Client last transaction time (UTC).
    pub cltt: DateTime<Utc>,

    /// Client-provided hostname.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Opaque user context; may embed relay identifiers under `"ISC"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_context: Option<serde_json::Value>,

    /// Transient index directive, consumed by the store.
    #[serde(skip)]
    pub extended_info_action: ExtendedInfoAction,
}

impl Lease {
    /// Creates a DHCPv4 lease starting now.
    pub fn new_v4(
        address: Ipv4Addr,
        client_id: Vec<u8>,
        valid_lifetime: u32,
        subnet_id: u32,
    ) -> Self {
        Self {
            address: IpAddr::V4(address),
            lease_type: LeaseType::V4,
            prefix_len: 32,
            client_id,
            subnet_id,
            valid_lifetime,
            preferred_lifetime: 0,
            cltt: Utc::now(),
            hostname: None,
            user_context: None,
            extended_info_action: ExtendedInfoAction::Ignore,
        }
    }

    /// Creates a DHCPv6 lease starting now.
    ///
    /// A [`LeaseType::V4`] type passed here is coerced to
    /// [`LeaseType::Na`].
    pub fn new_v6(
        lease_type: LeaseType,
        address: Ipv6Addr,
        duid: Vec<u8>,
        preferred_lifetime: u32,
        valid_lifetime: u32,
        subnet_id: u32,
    ) -> Self {
        let lease_type = match lease_type {
            LeaseType::V4 => LeaseType::Na,
            other => other,
        };
        Self {
            address: IpAddr::V6(address),
            lease_type,
            prefix_len: 128,
            client_id: duid,
            subnet_id,
            valid_lifetime,
            preferred_lifetime,
            cltt: Utc::now(),
            hostname: None,
            user_context: None,
            extended_info_action: ExtendedInfoAction::Ignore,
        }
    }

    /// Returns true for DHCPv6 leases.
    pub fn is_v6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// When this lease expires (UTC).
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.cltt + TimeDelta::seconds(self.valid_lifetime as i64)
    }

    /// Returns true if the lease has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at()
    }

    /// Renews the lease for the specified duration from now.
    pub fn renew(&mut self, valid_lifetime: u32) {
        self.cltt = Utc::now();
        self.valid_lifetime = valid_lifetime;
    }

    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        let remaining = self.expires_at() - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Width in bits of an address family.
fn address_width(address: &IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn address_bits(address: &IpAddr) -> u128 {
    match address {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn prefix_mask(width: u8, len: u8) -> u128 {
    let full = if width == 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    };
    if len == 0 {
        0
    } else {
        (u128::MAX << (width - len)) & full
    }
}

/// A network prefix scoping a query to one topological segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    prefix: IpAddr,
    prefix_len: u8,
}

impl Link {
    /// Creates a link from any address inside it and a prefix length.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the prefix length exceeds the
    /// address width.
    pub fn new(prefix: IpAddr, prefix_len: u8) -> Result<Self> {
        let width = address_width(&prefix);
        if prefix_len > width {
            return Err(Error::InvalidParameter(format!(
                "prefix length {} exceeds {} bits",
                prefix_len, width
            )));
        }
        Ok(Self { prefix, prefix_len })
    }

    pub fn prefix(&self) -> IpAddr {
        self.prefix
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn mask(&self) -> u128 {
        prefix_mask(address_width(&self.prefix), self.prefix_len)
    }

    fn from_bits(&self, bits: u128) -> IpAddr {
        match self.prefix {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
        }
    }

    /// Lowest address of the link.
    pub fn first(&self) -> IpAddr {
        self.from_bits(address_bits(&self.prefix) & self.mask())
    }

    /// Highest address of the link.
    pub fn last(&self) -> IpAddr {
        let width = address_width(&self.prefix);
        let host = !self.mask() & prefix_mask(width, width);
        self.from_bits((address_bits(&self.prefix) & self.mask()) | host)
    }

    /// Returns true if the address is of the same family and inside the prefix.
    pub fn contains(&self, address: &IpAddr) -> bool {
        address.is_ipv6() == self.prefix.is_ipv6()
            && address_bits(address) & self.mask() == address_bits(&self.prefix) & self.mask()
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.first(), self.prefix_len)
    }
}

impl FromStr for Link {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let (address, len) = text
            .split_once('/')
            .ok_or_else(|| Error::InvalidParameter(format!("link {} has no prefix length", text)))?;
        let prefix: IpAddr = address
            .trim()
            .parse()
            .map_err(|_| Error::InvalidParameter(format!("invalid link address {}", address)))?;
        let prefix_len: u8 = len
            .trim()
            .parse()
            .map_err(|_| Error::InvalidParameter(format!("invalid prefix length {}", len)))?;
        Link::new(prefix, prefix_len)
    }
}

/// Maximum number of leases returned by one paginated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePageSize(usize);

impl LeasePageSize {
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a zero page size.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidParameter(
                "page size must be greater than 0".to_string(),
            ));
        }
        Ok(Self(size))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

/// Cursor and size of one page of a query.
///
/// `start_from` is exclusive: pass the last address of the previous page
/// to continue after it, or `None` to start at the lowest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePage {
    pub start_from: Option<IpAddr>,
    pub size: LeasePageSize,
}

impl LeasePage {
    pub fn first(size: LeasePageSize) -> Self {
        Self {
            start_from: None,
            size,
        }
    }

    pub fn after(address: IpAddr, size: LeasePageSize) -> Self {
        Self {
            start_from: Some(address),
            size,
        }
    }
}

/// Computes the ordered address range a paginated scan covers, or `None`
/// when the range is empty (cursor already past the link).
pub(crate) fn address_range(
    link: Option<&Link>,
    start_from: Option<&IpAddr>,
) -> Option<(Bound<IpAddr>, Bound<IpAddr>)> {
    let lower = match (link, start_from) {
        (Some(link), Some(cursor)) if *cursor >= link.first() => Bound::Excluded(*cursor),
        (Some(link), _) => Bound::Included(link.first()),
        (None, Some(cursor)) => Bound::Excluded(*cursor),
        (None, None) => Bound::Unbounded,
    };
    let upper = match link {
        Some(link) => Bound::Included(link.last()),
        None => Bound::Unbounded,
    };

    if let (Bound::Excluded(low), Bound::Included(high)) = (&lower, &upper)
        && low >= high
    {
        return None;
    }

    Some((lower, upper))
}

/// Persistent lease storage format (serialized to JSON).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LeaseFile {
    /// Leases in ascending address order.
    pub leases: Vec<Lease>,
}

/// Internal mutable state protected by the store mutex.
#[derive(Debug)]
struct InternalState {
    leases: BTreeMap<IpAddr, Lease>,
    extended_info: ExtendedInfoTables,
    /// Whether add/update/delete maintain the extended-info tables.
    extended_info_enabled: bool,
    /// Bumped on every change.
    version: u64,
    /// Highest version known to be on disk.
    saved_version: u64,
    /// When a save was last attempted.
    last_save: Instant,
}

impl InternalState {
    fn mark_dirty(&mut self) {
        self.version += 1;
    }

    fn is_dirty(&self) -> bool {
        self.version != self.saved_version
    }

    /// Reserves a save attempt if one is due.
    fn take_save_slot(&mut self) -> bool {
        if self.is_dirty() && self.last_save.elapsed().as_millis() >= SAVE_INTERVAL_MILLIS as u128 {
            self.last_save = Instant::now();
            return true;
        }
        false
    }

    fn snapshot(&self) -> LeaseFile {
        LeaseFile {
            leases: self.leases.values().cloned().collect(),
        }
    }

    fn identifier_query(
        &self,
        kind: IdentifierKind,
        identifier: &[u8],
        link: Option<&Link>,
        page: &LeasePage,
    ) -> Vec<Lease> {
        self.extended_info
            .query_with(kind, identifier, link, page, |address| {
                self.leases.get(address).cloned()
            })
    }
}

/// Thread-safe lease store with extended-info indexes and persistence.
///
/// # Example
///
/// ```no_run
/// use leasehold::config::LeaseDatabaseConfig;
/// use leasehold::lease::{Lease, LeasePage, LeasePageSize, LeaseType, Leases};
///
/// # async fn example() -> leasehold::Result<()> {
/// let leases = Leases::new(LeaseDatabaseConfig::in_memory(true)).await?;
///
/// let mut lease = Lease::new_v6(
///     LeaseType::Na,
///     "2001:db8::1".parse().unwrap(),
///     vec![0, 1, 2, 3],
///     1000,
///     2000,
///     1,
/// );
/// leases.add_lease(&mut lease).await?;
///
/// let page = LeasePage::first(LeasePageSize::new(10)?);
/// let found = leases.get_leases_by_relay_id(&[0x64; 8], None, &page).await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Leases {
    state: Arc<Mutex<InternalState>>,
    config: LeaseDatabaseConfig,
    /// Mutex to prevent concurrent file writes.
    save_lock: Arc<Mutex<()>>,
}

impl Leases {
    /// Creates a lease store from the given database settings.
    ///
    /// When persistence is enabled, loads existing leases from the
    /// configured `leases_file` if it exists and, with extended-info tables
    /// enabled, rebuilds the index from each lease's user context.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease file exists but cannot be read or parsed.
    pub async fn new(config: LeaseDatabaseConfig) -> Result<Self> {
        let file = if config.persist {
            Self::load_file(&config.leases_file).await?
        } else {
            LeaseFile::default()
        };

        let mut leases = BTreeMap::new();
        let mut extended_info = ExtendedInfoTables::default();
        for lease in file.leases {
            let address = lease.address;
            if leases.contains_key(&address) {
                warn!("Lease file holds {} more than once, keeping the last record", address);
                extended_info.delete_entries_for_address(&address);
            }
            if config.extended_info_tables {
                extended_info.add_lease(&lease);
            }
            leases.insert(address, lease);
        }

        if config.persist {
            info!(
                "Loaded {} lease(s) from {}",
                leases.len(),
                config.leases_file
            );
        }

        let state = InternalState {
            leases,
            extended_info,
            extended_info_enabled: config.extended_info_tables,
            version: 0,
            saved_version: 0,
            last_save: Instant::now(),
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            config,
            save_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn load_file<P: AsRef<Path>>(path: P) -> Result<LeaseFile> {
        let path = path.as_ref();
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let file: LeaseFile = serde_json::from_str(&content)?;
            Ok(file)
        } else {
            Ok(LeaseFile::default())
        }
    }

    /// Stores a new lease.
    ///
    /// With extended-info tables enabled, the relay and remote identifiers
    /// found in the user context are indexed. The action tag is reset to
    /// [`ExtendedInfoAction::Ignore`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateEntry`] if a lease for the address exists.
    pub async fn add_lease(&self, lease: &mut Lease) -> Result<()> {
        lease.extended_info_action = ExtendedInfoAction::Ignore;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.leases.contains_key(&lease.address) {
            return Err(Error::DuplicateEntry(lease.address));
        }

        if state.extended_info_enabled {
            let added = state.extended_info.add_lease(lease);
            if added > 0 {
                debug!("Indexed {} extended info entries for {}", added, lease.address);
            }
        }
        state.leases.insert(lease.address, lease.clone());
        state.mark_dirty();

        self.maybe_save(guard).await;
        Ok(())
    }

    /// Replaces a stored lease.
    ///
    /// The action tag decides what happens to the extended-info tables:
    /// `Ignore` leaves them alone, `Delete` drops this address's entries,
    /// `Update` drops them and re-derives them from the new user context.
    /// The tag is reset to [`ExtendedInfoAction::Ignore`] in every case,
    /// including failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchLease`] if no lease exists for the address.
    pub async fn update_lease(&self, lease: &mut Lease) -> Result<()> {
        let action = std::mem::take(&mut lease.extended_info_action);

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(stored) = state.leases.get_mut(&lease.address) else {
            return Err(Error::NoSuchLease(lease.address));
        };
        *stored = lease.clone();

        if state.extended_info_enabled {
            match action {
                ExtendedInfoAction::Ignore => {}
                ExtendedInfoAction::Delete => {
                    state.extended_info.delete_entries_for_address(&lease.address);
                }
                ExtendedInfoAction::Update => {
                    state.extended_info.delete_entries_for_address(&lease.address);
                    state.extended_info.add_lease(lease);
                }
            }
        }
        state.mark_dirty();

        self.maybe_save(guard).await;
        Ok(())
    }

    /// Removes a lease and, with tables enabled, every extended-info entry
    /// for its address.
    ///
    /// Returns `false` if no lease was stored for the address. The action
    /// tag is reset to [`ExtendedInfoAction::Ignore`].
    pub async fn delete_lease(&self, lease: &mut Lease) -> Result<bool> {
        lease.extended_info_action = ExtendedInfoAction::Ignore;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.leases.remove(&lease.address).is_none() {
            return Ok(false);
        }

        if state.extended_info_enabled {
            state.extended_info.delete_entries_for_address(&lease.address);
        }
        state.mark_dirty();

        self.maybe_save(guard).await;
        Ok(true)
    }

    /// Returns the lease for an address, if one exists.
    pub async fn get_lease(&self, address: IpAddr) -> Option<Lease> {
        let state = self.state.lock().await;
        state.leases.get(&address).cloned()
    }

    /// Returns leases relayed through `relay_id`, in ascending address order.
    ///
    /// When `link` is given only addresses inside it are returned.
    pub async fn get_leases_by_relay_id(
        &self,
        relay_id: &[u8],
        link: Option<&Link>,
        page: &LeasePage,
    ) -> Vec<Lease> {
        let state = self.state.lock().await;
        state.identifier_query(IdentifierKind::RelayId, relay_id, link, page)
    }

    /// Returns leases carrying `remote_id`, in ascending address order.
    ///
    /// When `link` is given only addresses inside it are returned.
    pub async fn get_leases_by_remote_id(
        &self,
        remote_id: &[u8],
        link: Option<&Link>,
        page: &LeasePage,
    ) -> Vec<Lease> {
        let state = self.state.lock().await;
        state.identifier_query(IdentifierKind::RemoteId, remote_id, link, page)
    }

    /// Returns leases whose address falls inside `link`, in ascending order.
    pub async fn get_leases_by_link(&self, link: &Link, page: &LeasePage) -> Vec<Lease> {
        let state = self.state.lock().await;
        let Some(range) = address_range(Some(link), page.start_from.as_ref()) else {
            return Vec::new();
        };
        state
            .leases
            .range(range)
            .map(|(_, lease)| lease)
            .take(page.size.get())
            .cloned()
            .collect()
    }

    /// Indexes `relay_id` for an address without touching the lease map.
    ///
    /// Returns `false` if the pair was already present.
    pub async fn add_relay_id(&self, address: IpAddr, relay_id: &[u8]) -> bool {
        let mut state = self.state.lock().await;
        state
            .extended_info
            .add_entry(IdentifierKind::RelayId, address, relay_id)
    }

    /// Indexes `remote_id` for an address without touching the lease map.
    ///
    /// Returns `false` if the pair was already present.
    pub async fn add_remote_id(&self, address: IpAddr, remote_id: &[u8]) -> bool {
        let mut state = self.state.lock().await;
        state
            .extended_info
            .add_entry(IdentifierKind::RemoteId, address, remote_id)
    }

    /// Drops every extended-info entry for an address from both tables.
    ///
    /// Returns the number of entries removed; zero is not an error.
    pub async fn delete_extended_info(&self, address: IpAddr) -> usize {
        let mut state = self.state.lock().await;
        state.extended_info.delete_entries_for_address(&address)
    }

    /// Number of entries in the relay-id table.
    pub async fn relay_id_count(&self) -> usize {
        let state = self.state.lock().await;
        state.extended_info.table(IdentifierKind::RelayId).len()
    }

    /// Number of entries in the remote-id table.
    pub async fn remote_id_count(&self) -> usize {
        let state = self.state.lock().await;
        state.extended_info.table(IdentifierKind::RemoteId).len()
    }

    /// Enables or disables index maintenance on add/update/delete.
    ///
    /// Existing entries are kept as they are: disabling does not purge
    /// them and they stay queryable until an enabled write touches them.
    pub async fn set_extended_info_tables_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().await;
        state.extended_info_enabled = enabled;
    }

    pub async fn extended_info_tables_enabled(&self) -> bool {
        let state = self.state.lock().await;
        state.extended_info_enabled
    }

    /// Removes all expired leases and their index entries.
    ///
    /// Returns the number of leases cleaned up. A failed write is logged and
    /// retried later; call [`Leases::save`] to surface it.
    pub async fn cleanup_expired_leases(&self) -> usize {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let expired: Vec<IpAddr> = state
            .leases
            .values()
            .filter(|lease| lease.is_expired())
            .map(|lease| lease.address)
            .collect();

        for address in &expired {
            state.leases.remove(address);
            state.extended_info.delete_entries_for_address(address);
        }

        let count = expired.len();
        if count > 0 {
            state.mark_dirty();
            drop(guard);
            if let Err(error) = self.save().await {
                warn!("Failed to save leases after cleanup: {}", error);
            }
        }

        count
    }

    /// Writes the state if a save is due. The state lock is released before
    /// the write; failures are logged, not returned.
    async fn maybe_save(&self, mut guard: MutexGuard<'_, InternalState>) {
        if !self.config.persist || !guard.take_save_slot() {
            return;
        }
        drop(guard);

        if let Err(error) = self.save().await {
            warn!("Failed to save leases to {}: {}", self.config.leases_file, error);
        }
    }

    /// Forces an immediate save of the lease state to disk.
    ///
    /// Does nothing for an in-memory store. On failure the state stays
    /// dirty and the next change retries the write.
    pub async fn save(&self) -> Result<()> {
        if !self.config.persist {
            return Ok(());
        }

        // Lock order is save_lock, then state. Snapshots are taken under the
        // save lock so writes land on disk in version order.
        let _lock = self.save_lock.lock().await;
        let (snapshot, version) = {
            let state = self.state.lock().await;
            (state.snapshot(), state.version)
        };

        let content = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&self.config.leases_file, content).await?;

        let mut state = self.state.lock().await;
        state.saved_version = state.saved_version.max(version);
        state.last_save = Instant::now();

        Ok(())
    }

    /// Whether changes are waiting to be written to disk.
    pub async fn has_unsaved_changes(&self) -> bool {
        let state = self.state.lock().await;
        self.config.persist && state.is_dirty()
    }

    /// Returns all leases (including expired ones) in ascending address order.
    pub async fn list_leases(&self) -> Vec<Lease> {
        let state = self.state.lock().await;
        state.leases.values().cloned().collect()
    }

    /// Returns the number of stored leases.
    pub async fn lease_count(&self) -> usize {
        let state = self.state.lock().await;
        state.leases.len()
    }
}
