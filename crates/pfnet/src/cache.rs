// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pfnet developers

//! Cached view of the host's interfaces and IP addresses.
//!
//! The reader thread is the only writer during normal operation; public
//! queries take the read side. The address index maps an IP to the
//! interfaces carrying it, so same-IP entries on different interfaces
//! share a bucket and lookup scans only those collisions. Virtual
//! addresses (installed by us on tun devices) are deliberately kept out
//! of the index.

use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::{BitOr, BitOrAssign};

use parking_lot::RwLockReadGuard;

use crate::addr;
use crate::tun::TunDevice;
use crate::wire::{IFF_LOOPBACK, IFF_UP};

/// One IP address on an interface.
#[derive(Clone, Debug)]
pub(crate) struct AddrEntry {
    pub ip: IpAddr,
    /// Installed by this process for a tunnel.
    pub virt: bool,
}

/// A network interface and its addresses.
#[derive(Clone, Debug)]
pub(crate) struct IfaceEntry {
    pub ifindex: u32,
    pub name: String,
    /// Kernel interface flags (IFF_UP, IFF_LOOPBACK, ...).
    pub flags: u32,
    /// Not excluded by the daemon's interface configuration.
    pub usable: bool,
    pub addrs: Vec<AddrEntry>,
}

impl IfaceEntry {
    pub fn is_up(&self) -> bool {
        self.flags & IFF_UP == IFF_UP
    }

    pub fn is_up_and_usable(&self) -> bool {
        self.usable && self.is_up()
    }

    pub fn is_loopback(&self) -> bool {
        self.flags & IFF_LOOPBACK == IFF_LOOPBACK
    }
}

/// IP-to-interface index. Buckets by address; entry identity is the
/// (address, interface index) pair.
#[derive(Debug, Default)]
pub(crate) struct AddrIndex {
    map: HashMap<IpAddr, Vec<u32>>,
}

impl AddrIndex {
    pub fn insert(&mut self, ip: IpAddr, ifindex: u32) {
        let bucket = self.map.entry(ip).or_default();
        if !bucket.contains(&ifindex) {
            bucket.push(ifindex);
        }
    }

    pub fn remove(&mut self, ip: IpAddr, ifindex: u32) {
        if let Some(bucket) = self.map.get_mut(&ip) {
            bucket.retain(|&i| i != ifindex);
            if bucket.is_empty() {
                self.map.remove(&ip);
            }
        }
    }

    pub fn bucket(&self, ip: IpAddr) -> &[u32] {
        self.map.get(&ip).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
impl AddrIndex {
    pub fn contains(&self, ip: IpAddr, ifindex: u32) -> bool {
        self.bucket(ip).contains(&ifindex)
    }

    pub fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }
}

/// Everything guarded by the monitor's cache lock: the interface list,
/// the address index, and the tun devices we installed.
#[derive(Debug, Default)]
pub(crate) struct NetState {
    pub ifaces: Vec<IfaceEntry>,
    pub index: AddrIndex,
    pub tuns: Vec<TunDevice>,
}

impl NetState {
    pub fn iface_by_index(&mut self, ifindex: u32) -> Option<&mut IfaceEntry> {
        self.ifaces.iter_mut().find(|i| i.ifindex == ifindex)
    }

    pub fn iface_by_name(&mut self, name: &str) -> Option<&mut IfaceEntry> {
        self.ifaces.iter_mut().find(|i| i.name == name)
    }

    /// Record a new address on an interface. Returns false when an entry
    /// with this IP already exists there (duplicates are suppressed).
    pub fn add_addr(&mut self, ifindex: u32, ip: IpAddr, virt: bool) -> bool {
        let Some(iface) = self.ifaces.iter_mut().find(|i| i.ifindex == ifindex) else {
            return false;
        };
        if iface.addrs.iter().any(|a| a.ip == ip) {
            return false;
        }
        iface.addrs.push(AddrEntry { ip, virt });
        if !virt {
            self.index.insert(ip, ifindex);
        }
        true
    }

    /// Remove an address from an interface, dropping its index entry.
    pub fn remove_addr(&mut self, ifindex: u32, ip: IpAddr) -> Option<AddrEntry> {
        let iface = self.ifaces.iter_mut().find(|i| i.ifindex == ifindex)?;
        let pos = iface.addrs.iter().position(|a| a.ip == ip)?;
        let entry = iface.addrs.remove(pos);
        if !entry.virt {
            self.index.remove(ip, ifindex);
        }
        Some(entry)
    }

    /// Drop all addresses of one interface, including index entries.
    /// Used before rebuilding from a fresh kernel enumeration.
    pub fn clear_addrs(&mut self, ifindex: u32) {
        let Some(iface) = self.ifaces.iter_mut().find(|i| i.ifindex == ifindex) else {
            return;
        };
        for entry in iface.addrs.drain(..) {
            if !entry.virt {
                self.index.remove(entry.ip, ifindex);
            }
        }
    }

    /// Mark the address as virtual on the named interface and drop it
    /// from the index; virtual entries are never indexed.
    pub fn mark_virtual(&mut self, ifname: &str, ip: IpAddr) {
        for iface in self.ifaces.iter_mut().filter(|i| i.name == ifname) {
            for entry in iface.addrs.iter_mut().filter(|a| a.ip == ip) {
                if !entry.virt {
                    entry.virt = true;
                    self.index.remove(ip, iface.ifindex);
                }
            }
        }
    }

    /// Name of the interface carrying this IP, preferring interfaces that
    /// are both up and usable. A match on an interface that is merely up
    /// is reported as "not local"; it only changes the log line.
    pub fn interface_for(&self, ip: IpAddr) -> Option<String> {
        if ip.is_unspecified() {
            return None;
        }
        let lookup = |pred: fn(&IfaceEntry) -> bool| {
            self.index
                .bucket(ip)
                .iter()
                .filter_map(|&ifindex| self.ifaces.iter().find(|i| i.ifindex == ifindex))
                .find(|iface| pred(iface))
        };
        if let Some(iface) = lookup(IfaceEntry::is_up_and_usable) {
            log::debug!("{} is on interface {}", ip, iface.name);
            return Some(iface.name.clone());
        }
        if lookup(IfaceEntry::is_up).is_none() {
            log::debug!("{} is not a local address or the interface is down", ip);
        }
        None
    }
}

/// Selects which interfaces and addresses an enumeration yields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressMask(u32);

impl AddressMask {
    /// Regular (kernel-installed) addresses.
    pub const REGULAR: AddressMask = AddressMask(0x1);
    /// Virtual addresses installed by this monitor.
    pub const VIRTUAL: AddressMask = AddressMask(0x2);
    /// Include loopback interfaces.
    pub const LOOPBACK: AddressMask = AddressMask(0x4);
    /// Include interfaces that are down.
    pub const DOWN: AddressMask = AddressMask(0x8);
    /// Include interfaces excluded by configuration.
    pub const IGNORED: AddressMask = AddressMask(0x10);
    /// Everything.
    pub const ALL: AddressMask = AddressMask(0x1f);

    pub fn contains(self, bits: AddressMask) -> bool {
        self.0 & bits.0 == bits.0
    }
}

impl Default for AddressMask {
    fn default() -> Self {
        AddressMask::REGULAR
    }
}

impl BitOr for AddressMask {
    type Output = AddressMask;

    fn bitor(self, rhs: AddressMask) -> AddressMask {
        AddressMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for AddressMask {
    fn bitor_assign(&mut self, rhs: AddressMask) {
        self.0 |= rhs.0;
    }
}

fn iface_visible(iface: &IfaceEntry, mask: AddressMask) -> bool {
    if !mask.contains(AddressMask::IGNORED) && !iface.usable {
        return false;
    }
    if !mask.contains(AddressMask::LOOPBACK) && iface.is_loopback() {
        return false;
    }
    if !mask.contains(AddressMask::DOWN) && !iface.is_up() {
        return false;
    }
    true
}

fn addr_visible(entry: &AddrEntry, mask: AddressMask) -> bool {
    if !mask.contains(AddressMask::VIRTUAL) && entry.virt {
        return false;
    }
    if !mask.contains(AddressMask::REGULAR) && !entry.virt {
        return false;
    }
    // Link-local scope is never a usable source.
    !addr::is_link_local(entry.ip)
}

/// Iterator over cached addresses, filtered by an [`AddressMask`].
///
/// Holds the cache read lock for its whole lifetime; drop it promptly and
/// do not call back into the monitor while iterating.
pub struct AddressIter<'a> {
    guard: RwLockReadGuard<'a, NetState>,
    mask: AddressMask,
    iface_pos: usize,
    addr_pos: usize,
}

impl<'a> AddressIter<'a> {
    pub(crate) fn new(guard: RwLockReadGuard<'a, NetState>, mask: AddressMask) -> Self {
        AddressIter {
            guard,
            mask,
            iface_pos: 0,
            addr_pos: 0,
        }
    }
}

impl Iterator for AddressIter<'_> {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        loop {
            let iface = self.guard.ifaces.get(self.iface_pos)?;
            if !iface_visible(iface, self.mask) {
                self.iface_pos += 1;
                self.addr_pos = 0;
                continue;
            }
            match iface.addrs.get(self.addr_pos) {
                None => {
                    self.iface_pos += 1;
                    self.addr_pos = 0;
                }
                Some(entry) => {
                    self.addr_pos += 1;
                    if addr_visible(entry, self.mask) {
                        return Some(entry.ip);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn iface(ifindex: u32, name: &str, flags: u32, usable: bool) -> IfaceEntry {
        IfaceEntry {
            ifindex,
            name: name.to_string(),
            flags,
            usable,
            addrs: Vec::new(),
        }
    }

    fn sample_state() -> NetState {
        let mut state = NetState::default();
        state.ifaces.push(iface(1, "lo0", IFF_UP | IFF_LOOPBACK, true));
        state.ifaces.push(iface(2, "en0", IFF_UP, true));
        state.ifaces.push(iface(3, "en1", 0, true));
        state.ifaces.push(iface(4, "ppp0", IFF_UP, false));
        state.add_addr(1, v4("127.0.0.1"), false);
        state.add_addr(2, v4("10.0.0.5"), false);
        state.add_addr(2, "fe80::1".parse().unwrap(), false);
        state.add_addr(3, v4("192.168.7.2"), false);
        state.add_addr(4, v4("172.16.0.9"), false);
        state
    }

    #[test]
    fn test_index_tracks_non_virtual_addrs() {
        let state = sample_state();
        // Every non-virtual entry has exactly one index entry, and the
        // index holds nothing else.
        let mut expected = 0;
        for iface in &state.ifaces {
            for entry in &iface.addrs {
                assert!(!entry.virt);
                assert!(state.index.contains(entry.ip, iface.ifindex));
                expected += 1;
            }
        }
        assert_eq!(state.index.len(), expected);
    }

    #[test]
    fn test_add_addr_suppresses_duplicates() {
        let mut state = sample_state();
        assert!(!state.add_addr(2, v4("10.0.0.5"), false));
        let en0 = state.iface_by_name("en0").unwrap();
        assert_eq!(en0.addrs.iter().filter(|a| a.ip == v4("10.0.0.5")).count(), 1);
    }

    #[test]
    fn test_add_addr_unknown_iface() {
        let mut state = sample_state();
        assert!(!state.add_addr(99, v4("10.9.9.9"), false));
        assert_eq!(state.index.bucket(v4("10.9.9.9")), &[] as &[u32]);
    }

    #[test]
    fn test_remove_addr_drops_index_entry() {
        let mut state = sample_state();
        let entry = state.remove_addr(2, v4("10.0.0.5")).unwrap();
        assert_eq!(entry.ip, v4("10.0.0.5"));
        assert!(!state.index.contains(v4("10.0.0.5"), 2));
        assert!(state.remove_addr(2, v4("10.0.0.5")).is_none());
    }

    #[test]
    fn test_same_ip_on_two_interfaces_shares_bucket() {
        let mut state = sample_state();
        state.add_addr(3, v4("10.0.0.5"), false);
        assert_eq!(state.index.bucket(v4("10.0.0.5")), &[2, 3]);
        state.remove_addr(2, v4("10.0.0.5"));
        assert_eq!(state.index.bucket(v4("10.0.0.5")), &[3]);
    }

    #[test]
    fn test_virtual_addr_not_indexed() {
        let mut state = sample_state();
        assert!(state.add_addr(2, v4("10.99.0.2"), true));
        assert!(!state.index.contains(v4("10.99.0.2"), 2));
    }

    #[test]
    fn test_mark_virtual_removes_index_entry() {
        let mut state = sample_state();
        state.mark_virtual("en0", v4("10.0.0.5"));
        let en0 = state.iface_by_name("en0").unwrap();
        assert!(en0.addrs.iter().find(|a| a.ip == v4("10.0.0.5")).unwrap().virt);
        assert!(!state.index.contains(v4("10.0.0.5"), 2));
    }

    #[test]
    fn test_clear_addrs() {
        let mut state = sample_state();
        state.clear_addrs(2);
        let en0 = state.iface_by_name("en0").unwrap();
        assert!(en0.addrs.is_empty());
        assert!(!state.index.contains(v4("10.0.0.5"), 2));
        // Other interfaces untouched.
        assert!(state.index.contains(v4("192.168.7.2"), 3));
    }

    #[test]
    fn test_interface_for_up_and_usable() {
        let state = sample_state();
        assert_eq!(state.interface_for(v4("10.0.0.5")), Some("en0".to_string()));
    }

    #[test]
    fn test_interface_for_down_interface() {
        let state = sample_state();
        // en1 carries the address but is down.
        assert_eq!(state.interface_for(v4("192.168.7.2")), None);
    }

    #[test]
    fn test_interface_for_unusable_interface() {
        let state = sample_state();
        // ppp0 is up but excluded by configuration; the up-only match is
        // diagnostic and still answers "not local".
        assert_eq!(state.interface_for(v4("172.16.0.9")), None);
    }

    #[test]
    fn test_interface_for_unknown_or_any() {
        let state = sample_state();
        assert_eq!(state.interface_for(v4("203.0.113.1")), None);
        assert_eq!(state.interface_for(v4("0.0.0.0")), None);
    }

    #[test]
    fn test_interface_for_prefers_usable() {
        let mut state = sample_state();
        // Same IP on ppp0 (up, unusable) and en0 (up, usable).
        state.add_addr(4, v4("10.0.0.5"), false);
        assert_eq!(state.interface_for(v4("10.0.0.5")), Some("en0".to_string()));
    }

    #[test]
    fn test_mask_bits() {
        let mask = AddressMask::REGULAR | AddressMask::VIRTUAL;
        assert!(mask.contains(AddressMask::REGULAR));
        assert!(mask.contains(AddressMask::VIRTUAL));
        assert!(!mask.contains(AddressMask::LOOPBACK));
        assert_eq!(AddressMask::default(), AddressMask::REGULAR);
        assert!(AddressMask::ALL.contains(AddressMask::IGNORED));
    }

    #[test]
    fn test_enumerate_default_mask() {
        let lock = RwLock::new(sample_state());
        let addrs: Vec<IpAddr> =
            AddressIter::new(lock.read(), AddressMask::default()).collect();
        // lo0 (loopback), en1 (down), ppp0 (unusable) and the link-local
        // address are all filtered.
        assert_eq!(addrs, vec![v4("10.0.0.5")]);
    }

    #[test]
    fn test_enumerate_loopback_and_down() {
        let lock = RwLock::new(sample_state());
        let mask = AddressMask::REGULAR | AddressMask::LOOPBACK | AddressMask::DOWN;
        let addrs: Vec<IpAddr> = AddressIter::new(lock.read(), mask).collect();
        assert!(addrs.contains(&v4("127.0.0.1")));
        assert!(addrs.contains(&v4("192.168.7.2")));
        assert!(!addrs.contains(&v4("172.16.0.9")));
    }

    #[test]
    fn test_enumerate_ignored() {
        let lock = RwLock::new(sample_state());
        let mask = AddressMask::REGULAR | AddressMask::IGNORED;
        let addrs: Vec<IpAddr> = AddressIter::new(lock.read(), mask).collect();
        assert!(addrs.contains(&v4("172.16.0.9")));
    }

    #[test]
    fn test_enumerate_virtual_only() {
        let lock = RwLock::new(sample_state());
        lock.write().add_addr(2, v4("10.99.0.2"), true);

        let addrs: Vec<IpAddr> =
            AddressIter::new(lock.read(), AddressMask::VIRTUAL).collect();
        assert_eq!(addrs, vec![v4("10.99.0.2")]);

        // Default mask hides it.
        let addrs: Vec<IpAddr> =
            AddressIter::new(lock.read(), AddressMask::default()).collect();
        assert!(!addrs.contains(&v4("10.99.0.2")));

        // A mask with both classes sees both.
        let mask = AddressMask::REGULAR | AddressMask::VIRTUAL;
        let addrs: Vec<IpAddr> = AddressIter::new(lock.read(), mask).collect();
        assert!(addrs.contains(&v4("10.99.0.2")));
        assert!(addrs.contains(&v4("10.0.0.5")));
    }

    #[test]
    fn test_enumerate_suppresses_v6_link_local() {
        let lock = RwLock::new(sample_state());
        lock.write().add_addr(2, "2001:db8::5".parse().unwrap(), false);

        let addrs: Vec<IpAddr> = AddressIter::new(lock.read(), AddressMask::ALL).collect();
        assert!(addrs.contains(&"2001:db8::5".parse().unwrap()));
        assert!(!addrs.contains(&"fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_enumerator_holds_read_lock() {
        let lock = RwLock::new(sample_state());
        let iter = AddressIter::new(lock.read(), AddressMask::default());
        assert!(lock.try_write().is_none());
        drop(iter);
        assert!(lock.try_write().is_some());
    }
}
