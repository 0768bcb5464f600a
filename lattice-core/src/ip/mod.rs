use std::net::Ipv4Addr;

use ipnet::{Ipv4AddrRange, Ipv4Net};

pub mod lease;

pub trait Contains<T> {
    fn contains(&self, other: &T) -> bool;
}

impl Contains<Ipv4Addr> for Ipv4Net {
    fn contains(&self, other: &Ipv4Addr) -> bool {
        self.contains(other)
    }
}

/// Ordered iteration over the assignable addresses of a network.
pub trait Range<T> {
    type Iter: Iterator<Item = T>;

    fn range(&self) -> Self::Iter;
}

impl Range<Ipv4Addr> for Ipv4Net {
    type Iter = Ipv4AddrRange;

    /// The network address is never assignable, /31 and /32 networks included.
    fn range(&self) -> Self::Iter {
        if self.prefix_len() < 31 {
            return self.hosts();
        }

        match u32::from(self.network()).checked_add(1) {
            Some(first) => Ipv4AddrRange::new(first.into(), self.broadcast()),
            None => Ipv4AddrRange::new(Ipv4Addr::BROADCAST, Ipv4Addr::UNSPECIFIED),
        }
    }
}
