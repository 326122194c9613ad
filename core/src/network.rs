//! Guest address management for the host bridge subnet.
//!
//! Provides IPv4 CIDR parsing and the `AddressAllocator`, which hands out
//! single guest addresses from one flat subnet. The first host address of the
//! subnet belongs to the bridge (the guests' gateway) and is never handed out.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ChvError, Result};

/// An IPv4 address together with a prefix length (e.g. `10.0.0.2/24`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// Build a CIDR value. Fails if `prefix_len` exceeds 32.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(ChvError::InvalidSubnet(format!(
                "invalid prefix length {}",
                prefix_len
            )));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// The address part, exactly as given.
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Netmask for the prefix (e.g. 255.255.255.0 for /24).
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_bits(self.prefix_len))
    }

    /// Network address (host bits cleared).
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & mask_bits(self.prefix_len))
    }

    /// Broadcast address (host bits set).
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) | !mask_bits(self.prefix_len))
    }

    /// Whether `ip` falls inside this network.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = mask_bits(self.prefix_len);
        u32::from(ip) & mask == u32::from(self.address) & mask
    }

    /// Same prefix, different address.
    pub fn with_address(&self, address: Ipv4Addr) -> Self {
        Self {
            address,
            prefix_len: self.prefix_len,
        }
    }
}

fn mask_bits(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ChvError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| ChvError::InvalidSubnet(format!("invalid CIDR notation: {}", s)))?;

        let address: Ipv4Addr = addr.parse().map_err(|e| {
            ChvError::InvalidSubnet(format!("invalid network address '{}': {}", addr, e))
        })?;
        let prefix_len: u8 = prefix.parse().map_err(|e| {
            ChvError::InvalidSubnet(format!("invalid prefix length '{}': {}", prefix, e))
        })?;

        Self::new(address, prefix_len)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = ChvError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(value: Ipv4Cidr) -> Self {
        value.to_string()
    }
}

/// Generate a deterministic MAC address from an IPv4 address.
/// Uses the locally-administered prefix 02:42.
pub fn mac_from_ip(ip: &Ipv4Addr) -> String {
    let octets = ip.octets();
    format!(
        "02:42:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2], octets[3]
    )
}

/// Pool state guarded by the allocator's lock.
///
/// `available` is the never-issued range `[next, end)` followed by `freed`.
/// The bounds are `u64` so the range can end past 255.255.255.255.
/// The range is kept implicit so large subnets do not materialize every
/// address up front.
#[derive(Debug)]
struct Pool {
    next: u64,
    end: u64,
    freed: VecDeque<Ipv4Addr>,
    allocated: HashSet<Ipv4Addr>,
}

impl Pool {
    fn available_count(&self) -> usize {
        (self.end - self.next) as usize + self.freed.len()
    }

    fn pop_front(&mut self) -> Option<Ipv4Addr> {
        if self.next < self.end {
            let ip = Ipv4Addr::from(self.next as u32);
            self.next += 1;
            Some(ip)
        } else {
            self.freed.pop_front()
        }
    }
}

/// Hands out and reclaims guest addresses from a single subnet.
///
/// Addresses are issued in ascending order from network+2 up to and
/// including the broadcast address. A freed
/// address goes to the tail of the queue, so it is only reissued after every
/// never-issued address is gone.
#[derive(Debug)]
pub struct AddressAllocator {
    /// Subnet, normalized to its network address.
    subnet: Ipv4Cidr,
    /// Gateway (network + 1), owned by the host bridge.
    gateway: Ipv4Addr,
    pool: Mutex<Pool>,
}

impl AddressAllocator {
    /// Create an allocator from a CIDR string (e.g. "10.0.0.0/24").
    ///
    /// Host bits in the input are ignored. Prefixes longer than /30 leave no
    /// guest address next to the gateway and are rejected.
    pub fn new(subnet_cidr: &str) -> Result<Self> {
        let parsed: Ipv4Cidr = subnet_cidr.parse()?;
        if parsed.prefix_len() > 30 {
            return Err(ChvError::InvalidSubnet(format!(
                "prefix length {} too large (max 30 for usable hosts)",
                parsed.prefix_len()
            )));
        }

        let subnet = parsed.with_address(parsed.network());
        let net_u32 = u32::from(subnet.network());
        let gateway = Ipv4Addr::from(net_u32 + 1);

        let pool = Pool {
            next: u64::from(net_u32) + 2,
            end: u64::from(u32::from(subnet.broadcast())) + 1,
            freed: VecDeque::new(),
            allocated: HashSet::new(),
        };

        tracing::debug!(
            subnet = %subnet,
            gateway = %gateway,
            capacity = pool.available_count(),
            "Address allocator initialized"
        );

        Ok(Self {
            subnet,
            gateway,
            pool: Mutex::new(pool),
        })
    }

    /// The managed subnet in CIDR form (network address).
    pub fn subnet(&self) -> Ipv4Cidr {
        self.subnet
    }

    /// The gateway in CIDR form (e.g. 10.0.0.1/24).
    pub fn gateway(&self) -> Ipv4Cidr {
        self.subnet.with_address(self.gateway)
    }

    /// Take the next available address.
    pub fn allocate(&self) -> Result<Ipv4Cidr> {
        let mut pool = self.pool.lock();
        let ip = pool.pop_front().ok_or_else(|| ChvError::PoolExhausted {
            subnet: self.subnet.to_string(),
        })?;
        pool.allocated.insert(ip);
        Ok(self.subnet.with_address(ip))
    }

    /// Return an address to the tail of the pool.
    pub fn free(&self, ip: Ipv4Addr) -> Result<()> {
        let mut pool = self.pool.lock();

        if !self.subnet.contains(ip) {
            return Err(ChvError::AddressOutOfRange {
                address: ip,
                subnet: self.subnet.to_string(),
            });
        }

        if !pool.allocated.remove(&ip) {
            return Err(ChvError::AddressNotAllocated(ip));
        }
        pool.freed.push_back(ip);
        Ok(())
    }

    /// Number of addresses that can still be allocated.
    pub fn available_count(&self) -> usize {
        self.pool.lock().available_count()
    }

    /// Number of addresses currently handed out.
    pub fn allocated_count(&self) -> usize {
        self.pool.lock().allocated.len()
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.pool.lock().allocated.contains(&ip)
    }

    /// Snapshot of the available queue, in allocation order.
    pub fn available(&self) -> Vec<Ipv4Addr> {
        let pool = self.pool.lock();
        (pool.next..pool.end)
            .map(|n| Ipv4Addr::from(n as u32))
            .chain(pool.freed.iter().copied())
            .collect()
    }

    /// Snapshot of the allocated set, sorted.
    pub fn allocated(&self) -> Vec<Ipv4Addr> {
        let pool = self.pool.lock();
        let mut ips: Vec<Ipv4Addr> = pool.allocated.iter().copied().collect();
        ips.sort();
        ips
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usable_hosts(allocator: &AddressAllocator) -> Vec<Ipv4Addr> {
        let net = u32::from(allocator.subnet().network());
        let bcast = u32::from(allocator.subnet().broadcast());
        (net + 2..=bcast).map(Ipv4Addr::from).collect()
    }

    fn assert_partition(allocator: &AddressAllocator) {
        let mut all: Vec<Ipv4Addr> = allocator.available();
        let allocated = allocator.allocated();
        for ip in &allocated {
            assert!(!all.contains(ip), "{} both available and allocated", ip);
        }
        all.extend(allocated);
        all.sort();
        assert_eq!(all, usable_hosts(allocator));
    }

    // --- Ipv4Cidr tests ---

    #[test]
    fn test_cidr_parse_and_display() {
        let cidr: Ipv4Cidr = "10.0.0.2/24".parse().unwrap();
        assert_eq!(cidr.address(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(cidr.prefix_len(), 24);
        assert_eq!(cidr.to_string(), "10.0.0.2/24");
    }

    #[test]
    fn test_cidr_invalid() {
        assert!("10.0.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("not-an-ip/24".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_cidr_network_broadcast_netmask() {
        let cidr: Ipv4Cidr = "172.20.3.7/16".parse().unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(172, 20, 0, 0));
        assert_eq!(cidr.broadcast(), Ipv4Addr::new(172, 20, 255, 255));
        assert_eq!(cidr.netmask(), Ipv4Addr::new(255, 255, 0, 0));
    }

    #[test]
    fn test_cidr_contains() {
        let cidr: Ipv4Cidr = "10.0.0.0/24".parse().unwrap();
        assert!(cidr.contains(Ipv4Addr::new(10, 0, 0, 200)));
        assert!(!cidr.contains(Ipv4Addr::new(10, 0, 1, 1)));
    }

    #[test]
    fn test_cidr_serde_as_string() {
        let cidr: Ipv4Cidr = "10.0.0.2/24".parse().unwrap();
        let json = serde_json::to_string(&cidr).unwrap();
        assert_eq!(json, "\"10.0.0.2/24\"");
        let parsed: Ipv4Cidr = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cidr);
        assert!(serde_json::from_str::<Ipv4Cidr>("\"garbage\"").is_err());
    }

    #[test]
    fn test_mac_from_ip() {
        assert_eq!(mac_from_ip(&Ipv4Addr::new(10, 88, 0, 2)), "02:42:0a:58:00:02");
        assert_eq!(
            mac_from_ip(&Ipv4Addr::new(192, 168, 1, 100)),
            "02:42:c0:a8:01:64"
        );
    }

    // --- AddressAllocator tests ---

    #[test]
    fn test_new_invalid_subnet() {
        for bad in ["", "10.0.0.0", "10.0.0.0/31", "10.0.0.0/32", "x/24"] {
            let err = AddressAllocator::new(bad).unwrap_err();
            assert!(matches!(err, ChvError::InvalidSubnet(_)), "{}", bad);
        }
    }

    #[test]
    fn test_new_reserves_gateway() {
        let allocator = AddressAllocator::new("10.0.0.0/24").unwrap();
        assert_eq!(allocator.gateway().to_string(), "10.0.0.1/24");
        assert!(!allocator.available().contains(&Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(allocator.available()[0], Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(allocator.available_count(), 254);
        assert_eq!(
            *allocator.available().last().unwrap(),
            Ipv4Addr::new(10, 0, 0, 255)
        );
    }

    #[test]
    fn test_whole_address_space() {
        let allocator = AddressAllocator::new("0.0.0.0/0").unwrap();
        assert_eq!(allocator.available_count(), (1usize << 32) - 2);
        assert_eq!(
            allocator.allocate().unwrap().address(),
            Ipv4Addr::new(0, 0, 0, 2)
        );
    }

    #[test]
    fn test_new_normalizes_host_bits() {
        let allocator = AddressAllocator::new("10.0.0.77/24").unwrap();
        assert_eq!(allocator.subnet().to_string(), "10.0.0.0/24");
        assert_eq!(allocator.gateway().address(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_first_allocation() {
        let allocator = AddressAllocator::new("10.0.0.0/24").unwrap();
        let ip = allocator.allocate().unwrap();
        assert_eq!(ip.to_string(), "10.0.0.2/24");
        assert!(allocator.is_allocated(ip.address()));
    }

    #[test]
    fn test_allocation_is_ascending() {
        let allocator = AddressAllocator::new("10.0.0.0/24").unwrap();
        let ips: Vec<Ipv4Addr> = (0..5)
            .map(|_| allocator.allocate().unwrap().address())
            .collect();
        let expected: Vec<Ipv4Addr> = (2..7).map(|n| Ipv4Addr::new(10, 0, 0, n)).collect();
        assert_eq!(ips, expected);
    }

    #[test]
    fn test_exhaustion_after_every_usable_host() {
        let allocator = AddressAllocator::new("10.0.0.0/28").unwrap();
        // .0 network, .1 gateway => .2 through .15
        let mut last = None;
        for _ in 0..14 {
            last = Some(allocator.allocate().unwrap().address());
        }
        assert_eq!(last, Some(Ipv4Addr::new(10, 0, 0, 15)));
        let err = allocator.allocate().unwrap_err();
        assert!(matches!(err, ChvError::PoolExhausted { .. }));
        assert_eq!(allocator.allocated_count(), 14);
    }

    #[test]
    fn test_slash30_has_two_guests() {
        let allocator = AddressAllocator::new("10.0.0.0/30").unwrap();
        assert_eq!(
            allocator.allocate().unwrap().address(),
            Ipv4Addr::new(10, 0, 0, 2)
        );
        assert_eq!(
            allocator.allocate().unwrap().address(),
            Ipv4Addr::new(10, 0, 0, 3)
        );
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn test_never_returns_gateway_or_duplicate() {
        let allocator = AddressAllocator::new("10.0.0.0/27").unwrap();
        let mut seen = HashSet::new();
        while let Ok(ip) = allocator.allocate() {
            assert_ne!(ip.address(), allocator.gateway().address());
            assert!(seen.insert(ip.address()));
        }
    }

    #[test]
    fn test_freed_address_goes_to_tail() {
        let allocator = AddressAllocator::new("10.0.0.0/24").unwrap();
        let first = allocator.allocate().unwrap().address();
        allocator.free(first).unwrap();

        let next = allocator.allocate().unwrap().address();
        assert_ne!(next, first);
        assert_eq!(next, Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(*allocator.available().last().unwrap(), first);
    }

    #[test]
    fn test_freed_address_reused_after_exhaustion() {
        let allocator = AddressAllocator::new("10.0.0.0/29").unwrap();
        let ips: Vec<Ipv4Addr> = (0..6)
            .map(|_| allocator.allocate().unwrap().address())
            .collect();
        allocator.free(ips[1]).unwrap();
        allocator.free(ips[3]).unwrap();

        assert_eq!(allocator.allocate().unwrap().address(), ips[1]);
        assert_eq!(allocator.allocate().unwrap().address(), ips[3]);
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn test_free_out_of_range() {
        let allocator = AddressAllocator::new("10.0.0.0/24").unwrap();
        let err = allocator.free(Ipv4Addr::new(192, 168, 0, 2)).unwrap_err();
        assert!(matches!(err, ChvError::AddressOutOfRange { .. }));
    }

    #[test]
    fn test_free_not_allocated() {
        let allocator = AddressAllocator::new("10.0.0.0/24").unwrap();
        let err = allocator.free(Ipv4Addr::new(10, 0, 0, 50)).unwrap_err();
        assert!(matches!(err, ChvError::AddressNotAllocated(_)));

        // Gateway is never allocated either.
        let err = allocator.free(Ipv4Addr::new(10, 0, 0, 1)).unwrap_err();
        assert!(matches!(err, ChvError::AddressNotAllocated(_)));
    }

    #[test]
    fn test_double_free() {
        let allocator = AddressAllocator::new("10.0.0.0/24").unwrap();
        let ip = allocator.allocate().unwrap().address();
        allocator.free(ip).unwrap();
        assert!(matches!(
            allocator.free(ip),
            Err(ChvError::AddressNotAllocated(_))
        ));
        assert_partition(&allocator);
    }

    #[test]
    fn test_partition_holds_through_mixed_operations() {
        let allocator = AddressAllocator::new("10.0.0.0/28").unwrap();
        assert_partition(&allocator);

        let mut held = Vec::new();
        for round in 0..40 {
            if round % 3 == 2 && !held.is_empty() {
                let ip = held.remove(round % held.len());
                allocator.free(ip).unwrap();
            } else if let Ok(ip) = allocator.allocate() {
                held.push(ip.address());
            }
            assert_partition(&allocator);
        }
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let allocator = AddressAllocator::new("10.0.0.0/22").unwrap();
        let capacity = allocator.available_count();

        let results: Vec<Vec<Ipv4Addr>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let mut mine = Vec::new();
                        while let Ok(ip) = allocator.allocate() {
                            mine.push(ip.address());
                        }
                        mine
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut all: Vec<Ipv4Addr> = results.into_iter().flatten().collect();
        assert_eq!(all.len(), capacity);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), capacity);
        assert_eq!(allocator.available_count(), 0);
    }
}
