use std::{
    collections::HashMap,
    fmt::Display,
    net::Ipv4Addr,
    ops::Deref,
};

use ipnet::Ipv4Net;
use log::info;
use thiserror::Error;
use tokio::sync::RwLock;

use super::{Contains, Range};

pub type Ipv4Leases = Leases<Ipv4Addr, Ipv4Net>;
pub type Ipv4LeaseManager = LeaseManager<Ipv4Addr, Ipv4Net>;

/// Address reservations within a network, keyed by the owner of the lease.
#[derive(Debug)]
pub struct Leases<IP, IPNet> {
    range: IPNet,
    leases: HashMap<String, IP>,
    /// a _sorted_ list of leased and blacklisted addresses
    reserved: Vec<IP>,
}

impl<IP, IPNet> Leases<IP, IPNet>
where
    IP: Copy + Ord + Display,
    IPNet: Contains<IP> + Range<IP>,
{
    pub fn new(range: IPNet) -> Self {
        Self {
            range,
            leases: HashMap::new(),
            reserved: Vec::new(),
        }
    }

    pub fn range(&self) -> &IPNet {
        &self.range
    }

    /// Makes the address unavailable for leasing without assigning it to anyone.
    pub fn blacklist(&mut self, ip: IP) -> Result<(), LeaseError<IP>> {
        if !self.is_in_range(&ip) {
            return Err(LeaseError::IpOutOfRange(ip));
        }

        if let Err(index) = self.reserved.binary_search(&ip) {
            self.reserved.insert(index, ip);
        }

        Ok(())
    }

    /// Records an already existing lease, e.g. one read back from a status.
    pub fn try_insert(&mut self, key: &str, ip: IP) -> Result<IP, LeaseError<IP>> {
        if self.leases.contains_key(key) {
            return Err(LeaseError::KeyConflict(key.to_owned()));
        }

        if !self.is_in_range(&ip) {
            return Err(LeaseError::IpOutOfRange(ip));
        }

        let Err(index) = self.reserved.binary_search(&ip) else {
            return Err(LeaseError::IpConflict(ip));
        };

        self.reserved.insert(index, ip);
        self.leases.insert(key.to_owned(), ip);

        info!("Leased {ip} address to {key}!");

        Ok(ip)
    }

    pub fn try_lease(&mut self, key: &str) -> Result<IP, LeaseError<IP>> {
        if self.leases.contains_key(key) {
            return Err(LeaseError::KeyConflict(key.to_owned()));
        }

        let (ip, index) = self
            .try_get_next_leasable_ip()
            .ok_or(LeaseError::RangeExhausted)?;

        self.reserved.insert(index, ip);
        self.leases.insert(key.to_owned(), ip);

        info!("Leased {ip} address to {key}!");

        Ok(ip)
    }

    pub fn release(&mut self, key: &str) -> Option<IP> {
        let ip = self.leases.remove(key)?;

        if let Ok(index) = self.reserved.binary_search(&ip) {
            self.reserved.remove(index);
        }

        info!("Released {ip} address held by {key}!");

        Some(ip)
    }

    pub fn get(&self, key: &str) -> Option<IP> {
        self.leases.get(key).copied()
    }

    pub fn is_leased(&self, ip: &IP) -> bool {
        self.leases.values().any(|leased| leased == ip)
    }

    pub fn is_in_range(&self, ip: &IP) -> bool {
        self.range.contains(ip)
    }

    fn try_get_next_leasable_ip(&self) -> Option<(IP, usize)> {
        // linear in the number of reservations, which is bounded by the number of addresses
        let ip = self
            .range
            .range()
            .find(|ip| self.reserved.binary_search(ip).is_err())?;
        let index = self.reserved.binary_search(&ip).err()?;

        Some((ip, index))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeaseError<IP: Display> {
    #[error("'{}' already holds a lease!", .0)]
    KeyConflict(String),
    #[error("Address {} is already leased!", .0)]
    IpConflict(IP),
    #[error("The IP range was exhausted!")]
    RangeExhausted,
    #[error("Address {} is out of range!", .0)]
    IpOutOfRange(IP),
}

pub struct LeaseManager<IP, IPNet>(RwLock<Leases<IP, IPNet>>);

impl<IP, IPNet> LeaseManager<IP, IPNet>
where
    IP: Copy + Ord + Display,
    IPNet: Contains<IP> + Range<IP>,
{
    pub async fn get_or_lease(&self, key: &str) -> Result<IP, LeaseError<IP>> {
        {
            let read_guard = self.read().await;

            if let Some(ip) = read_guard.get(key) {
                return Ok(ip);
            }
        }

        let mut guard = self.write().await;

        if let Some(ip) = guard.get(key) {
            return Ok(ip);
        }

        guard.try_lease(key)
    }

    pub async fn release(&self, key: &str) -> Option<IP> {
        self.write().await.release(key)
    }
}

impl<IP, IPNet> Deref for LeaseManager<IP, IPNet> {
    type Target = RwLock<Leases<IP, IPNet>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<IP, IPNet> From<Leases<IP, IPNet>> for LeaseManager<IP, IPNet> {
    fn from(value: Leases<IP, IPNet>) -> Self {
        Self(RwLock::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leases(net: &str) -> Ipv4Leases {
        Ipv4Leases::new(net.parse().unwrap())
    }

    #[test]
    fn leases_lowest_free_address() {
        let mut leases = leases("10.0.0.0/29");

        assert_eq!(leases.try_lease("a").unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(leases.try_lease("b").unwrap(), Ipv4Addr::new(10, 0, 0, 2));

        leases.release("a");

        assert_eq!(leases.try_lease("c").unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(leases.get("b"), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn blacklisted_addresses_are_skipped() {
        let mut leases = leases("10.0.0.0/29");

        leases.blacklist(Ipv4Addr::new(10, 0, 0, 1)).unwrap();

        assert_eq!(leases.try_lease("a").unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert!(!leases.is_leased(&Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(
            leases.blacklist(Ipv4Addr::new(10, 1, 0, 1)),
            Err(LeaseError::IpOutOfRange(Ipv4Addr::new(10, 1, 0, 1)))
        );
    }

    #[test]
    fn conflicts_are_reported() {
        let mut leases = leases("10.0.0.0/29");

        leases.try_insert("a", Ipv4Addr::new(10, 0, 0, 3)).unwrap();

        assert_eq!(
            leases.try_insert("b", Ipv4Addr::new(10, 0, 0, 3)),
            Err(LeaseError::IpConflict(Ipv4Addr::new(10, 0, 0, 3)))
        );
        assert_eq!(
            leases.try_lease("a"),
            Err(LeaseError::KeyConflict("a".to_owned()))
        );
        assert_eq!(
            leases.try_insert("c", Ipv4Addr::new(192, 168, 0, 1)),
            Err(LeaseError::IpOutOfRange(Ipv4Addr::new(192, 168, 0, 1)))
        );
    }

    #[test]
    fn exhausted_range_is_reported() {
        let mut leases = leases("10.0.0.0/30");

        leases.try_lease("a").unwrap();
        leases.try_lease("b").unwrap();

        assert_eq!(leases.try_lease("c"), Err(LeaseError::RangeExhausted));
    }

    #[test]
    fn point_to_point_ranges_keep_the_network_address() {
        let mut pair = leases("10.0.0.0/31");

        assert_eq!(pair.try_lease("a").unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(pair.try_lease("b"), Err(LeaseError::RangeExhausted));

        let mut single = leases("10.0.0.0/32");

        assert_eq!(single.try_lease("a"), Err(LeaseError::RangeExhausted));
    }

    #[tokio::test]
    async fn manager_returns_existing_lease() {
        let manager: Ipv4LeaseManager = leases("10.0.0.0/29").into();

        let first = manager.get_or_lease("a").await.unwrap();
        let second = manager.get_or_lease("a").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.release("a").await, Some(first));
        assert_eq!(manager.release("a").await, None);
    }
}
