//! Per-site capacity accounting
//!
//! Each site account lives in its own DashMap entry, so check-and-decrement
//! runs under that entry's shard lock and unrelated sites never serialize
//! against each other.

use crate::error::{Result, SliceError};
use crate::models::{Resources, Site, SiteId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Handle returned by a successful reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationId(pub u64);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rsv-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub site_id: SiteId,
    pub resources: Resources,
}

#[derive(Debug)]
struct SiteAccount {
    site: Site,
    reserved: Resources,
}

#[derive(Debug, Default)]
pub struct CapacityLedger {
    sites: DashMap<SiteId, SiteAccount>,
    reservations: DashMap<ReservationId, Reservation>,
    next_id: AtomicU64,
}

impl CapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger from an initial site inventory
    pub fn with_sites(sites: impl IntoIterator<Item = Site>) -> Result<Self> {
        let ledger = Self::new();
        for site in sites {
            ledger.register_site(site)?;
        }
        Ok(ledger)
    }

    /// Add a site, or update an existing one keeping its reservations
    ///
    /// `available_capacity` is always recomputed from the total and the
    /// currently reserved amount.
    pub fn register_site(&self, mut site: Site) -> Result<()> {
        let id = site.id.clone();
        match self.sites.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let account = entry.get_mut();
                let available = site
                    .total_capacity
                    .checked_sub(&account.reserved)
                    .ok_or_else(|| {
                        SliceError::Configuration(format!(
                            "site {} total capacity below reserved amount",
                            id
                        ))
                    })?;
                site.available_capacity = available;
                account.site = site;
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                site.available_capacity = site.total_capacity;
                entry.insert(SiteAccount {
                    site,
                    reserved: Resources::default(),
                });
            }
        }
        debug!(site = %id, "Registered site");
        Ok(())
    }

    /// Atomically check and decrement a site's available capacity
    pub fn reserve(&self, site_id: &str, resources: Resources) -> Result<ReservationId> {
        let mut account = self
            .sites
            .get_mut(site_id)
            .ok_or_else(|| SliceError::UnknownSite(site_id.to_string()))?;

        if !resources.fits_within(&account.site.available_capacity) {
            return Err(SliceError::CapacityExhausted {
                site_id: site_id.to_string(),
            });
        }
        let remaining = account
            .site
            .available_capacity
            .checked_sub(&resources)
            .ok_or_else(|| SliceError::CapacityExhausted {
                site_id: site_id.to_string(),
            })?;
        account.site.available_capacity = remaining;
        account.reserved = account.reserved + resources;

        let id = ReservationId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.reservations.insert(
            id,
            Reservation {
                id,
                site_id: site_id.to_string(),
                resources,
            },
        );
        drop(account);

        debug!(site = %site_id, reservation = %id, bandwidth_kbps = resources.bandwidth_kbps, "Reserved capacity");
        Ok(id)
    }

    /// Return a reservation's resources; releasing twice is a no-op
    pub fn release(&self, id: ReservationId) {
        let Some((_, reservation)) = self.reservations.remove(&id) else {
            return;
        };
        match self.sites.get_mut(&reservation.site_id) {
            Some(mut account) => {
                account.reserved = account
                    .reserved
                    .checked_sub(&reservation.resources)
                    .unwrap_or_default();
                let restored = account.site.available_capacity + reservation.resources;
                account.site.available_capacity = Resources {
                    cpu_millicores: restored
                        .cpu_millicores
                        .min(account.site.total_capacity.cpu_millicores),
                    memory_mb: restored.memory_mb.min(account.site.total_capacity.memory_mb),
                    bandwidth_kbps: restored
                        .bandwidth_kbps
                        .min(account.site.total_capacity.bandwidth_kbps),
                };
                debug!(site = %reservation.site_id, reservation = %id, "Released capacity");
            }
            None => {
                warn!(site = %reservation.site_id, reservation = %id, "Released reservation for unknown site");
            }
        }
    }

    pub fn release_all<'a>(&self, ids: impl IntoIterator<Item = &'a ReservationId>) {
        for id in ids {
            self.release(*id);
        }
    }

    /// Currently available capacity of a site
    pub fn peek(&self, site_id: &str) -> Result<Resources> {
        self.sites
            .get(site_id)
            .map(|a| a.site.available_capacity)
            .ok_or_else(|| SliceError::UnknownSite(site_id.to_string()))
    }

    /// Sum of live reservations on a site
    pub fn reserved(&self, site_id: &str) -> Result<Resources> {
        self.sites
            .get(site_id)
            .map(|a| a.reserved)
            .ok_or_else(|| SliceError::UnknownSite(site_id.to_string()))
    }

    pub fn is_held(&self, id: ReservationId) -> bool {
        self.reservations.contains_key(&id)
    }

    pub fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        self.reservations.get(&id).map(|r| r.clone())
    }

    pub fn site(&self, site_id: &str) -> Option<Site> {
        self.sites.get(site_id).map(|a| a.site.clone())
    }

    /// Snapshot of all sites sorted by id
    pub fn sites(&self) -> Vec<Site> {
        let mut sites: Vec<Site> = self.sites.iter().map(|a| a.site.clone()).collect();
        sites.sort_by(|a, b| a.id.cmp(&b.id));
        sites
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeEndpoint, Tier};
    use std::sync::Arc;

    fn site(id: &str, bandwidth_mbps: f64) -> Site {
        Site::new(
            id,
            Tier::Edge,
            NodeEndpoint {
                name: format!("{}-node", id),
                address: "10.0.0.1".parse().unwrap(),
                interface: "eth0".into(),
                agent_url: None,
            },
            Resources::compute(8000, 16384).with_bandwidth_mbps(bandwidth_mbps),
        )
    }

    #[test]
    fn test_reserve_and_release_round_trip() {
        let ledger = CapacityLedger::with_sites([site("edge-1", 10.0)]).unwrap();
        let before = ledger.peek("edge-1").unwrap();

        let need = Resources::compute(1000, 1024).with_bandwidth_mbps(2.5);
        let id = ledger.reserve("edge-1", need).unwrap();
        assert!(ledger.is_held(id));
        assert_eq!(ledger.peek("edge-1").unwrap().bandwidth_kbps, 7500);
        assert_eq!(ledger.reserved("edge-1").unwrap(), need);

        ledger.release(id);
        ledger.release(id);
        assert!(!ledger.is_held(id));
        assert_eq!(ledger.peek("edge-1").unwrap(), before);
    }

    #[test]
    fn test_reserve_rejects_over_capacity() {
        let ledger = CapacityLedger::with_sites([site("edge-1", 1.0)]).unwrap();
        let result = ledger.reserve("edge-1", Resources::default().with_bandwidth_mbps(1.5));
        assert!(matches!(result, Err(SliceError::CapacityExhausted { .. })));
        assert_eq!(ledger.peek("edge-1").unwrap().bandwidth_kbps, 1000);
    }

    #[test]
    fn test_unknown_site() {
        let ledger = CapacityLedger::new();
        assert!(matches!(
            ledger.reserve("nowhere", Resources::default()),
            Err(SliceError::UnknownSite(_))
        ));
    }

    #[test]
    fn test_reregister_keeps_reservations() {
        let ledger = CapacityLedger::with_sites([site("edge-1", 10.0)]).unwrap();
        ledger
            .reserve("edge-1", Resources::default().with_bandwidth_mbps(4.0))
            .unwrap();
        ledger.register_site(site("edge-1", 20.0)).unwrap();
        assert_eq!(ledger.peek("edge-1").unwrap().bandwidth_kbps, 16_000);
        assert!(ledger.register_site(site("edge-1", 2.0)).is_err());
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_capacity() {
        let ledger = Arc::new(CapacityLedger::with_sites([site("edge-1", 10.0)]).unwrap());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                let mut held = Vec::new();
                for i in 0..200 {
                    if let Ok(id) =
                        ledger.reserve("edge-1", Resources::default().with_bandwidth_mbps(0.7))
                    {
                        held.push(id);
                    }
                    let reserved = ledger.reserved("edge-1").unwrap();
                    assert!(reserved.bandwidth_kbps <= 10_000);
                    if i % 3 == 0 {
                        if let Some(id) = held.pop() {
                            ledger.release(id);
                        }
                    }
                }
                held
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        let reserved = ledger.reserved("edge-1").unwrap();
        assert_eq!(reserved.bandwidth_kbps, all.len() as u64 * 700);
        assert!(reserved.bandwidth_kbps <= 10_000);

        ledger.release_all(all.iter());
        assert_eq!(ledger.peek("edge-1").unwrap().bandwidth_kbps, 10_000);
        assert_eq!(ledger.reservation_count(), 0);
    }
}
