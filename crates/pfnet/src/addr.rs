// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pfnet developers

//! Address helpers shared by the codec, cache and tunnel driver.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Number of bits in an address of the same family as `addr`.
pub fn full_prefix(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Build a netmask of the same family as `addr` with `prefix` leading
/// one-bits. Returns `None` when the prefix exceeds the family width.
pub fn netmask(addr: IpAddr, prefix: u8) -> Option<IpAddr> {
    match addr {
        IpAddr::V4(_) => {
            if prefix > 32 {
                return None;
            }
            let bits = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix))
            };
            Some(IpAddr::V4(Ipv4Addr::from(bits)))
        }
        IpAddr::V6(_) => {
            if prefix > 128 {
                return None;
            }
            let bits = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix))
            };
            Some(IpAddr::V6(Ipv6Addr::from(bits)))
        }
    }
}

/// True for IPv6 link-local addresses (fe80::/10). IPv4 addresses never
/// count; the enumeration filter only suppresses v6 link-local scope.
pub fn is_link_local(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(_) => false,
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Set the most significant address bit, yielding the upper half of the
/// address space. Used to split a default route into two half routes.
pub fn upper_half(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            octets[0] |= 0x80;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            octets[0] |= 0x80;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}
