// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pfnet developers

//! Kernel interface and address enumeration via getifaddrs.

use std::ffi::CStr;
use std::io;
use std::net::IpAddr;

/// One record from the kernel's interface/address walk. Link-layer
/// entries carry no IP; they still announce the interface itself.
#[derive(Clone, Debug)]
pub(crate) struct IfAddrRecord {
    pub name: String,
    pub flags: u32,
    pub ifindex: u32,
    pub addr: Option<IpAddr>,
}

/// Enumerate all kernel-known interfaces and their addresses.
pub(crate) fn enumerate() -> io::Result<Vec<IfAddrRecord>> {
    let mut records = Vec::new();
    let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: getifaddrs populates the out-pointer with a linked list that
    // stays valid until freeifaddrs below.
    let ret = unsafe { libc::getifaddrs(&mut ifaddrs) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ifa = ifaddrs;
    while !ifa.is_null() {
        // SAFETY: non-null node of the list returned by getifaddrs.
        let entry = unsafe { &*ifa };

        // SAFETY: ifa_name is non-null and NUL-terminated for the lifetime
        // of the list; we copy it out immediately.
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();

        let addr = if entry.ifa_addr.is_null() {
            None
        } else {
            // SAFETY: ifa_addr is non-null and points at a sockaddr owned
            // by the list; only sa_family is read before the cast.
            let sa = unsafe { &*entry.ifa_addr };
            match i32::from(sa.sa_family) {
                af if af == libc::AF_INET => {
                    let sin = entry.ifa_addr.cast::<libc::sockaddr_in>();
                    // SAFETY: sa_family == AF_INET guarantees sockaddr_in.
                    let ip = unsafe { (*sin).sin_addr.s_addr };
                    Some(IpAddr::V4(u32::from_be(ip).into()))
                }
                af if af == libc::AF_INET6 => {
                    let sin6 = entry.ifa_addr.cast::<libc::sockaddr_in6>();
                    // SAFETY: sa_family == AF_INET6 guarantees sockaddr_in6.
                    let ip = unsafe { (*sin6).sin6_addr.s6_addr };
                    Some(IpAddr::V6(ip.into()))
                }
                _ => None,
            }
        };

        // Skip entries with no address structure at all; a link-layer
        // entry still contributes interface name and flags.
        if !entry.ifa_addr.is_null() {
            records.push(IfAddrRecord {
                ifindex: name_to_index(&name),
                name,
                flags: entry.ifa_flags,
                addr,
            });
        }

        ifa = entry.ifa_next;
    }

    // SAFETY: ifaddrs came from getifaddrs and has not been freed.
    unsafe { libc::freeifaddrs(ifaddrs) };

    Ok(records)
}

/// Resolve an interface index to its name.
pub(crate) fn index_to_name(ifindex: u32) -> Option<String> {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    // SAFETY: buf holds IF_NAMESIZE bytes; if_indextoname writes at most
    // that much including the NUL terminator.
    let ret = unsafe { libc::if_indextoname(ifindex, buf.as_mut_ptr().cast::<libc::c_char>()) };
    if ret.is_null() {
        return None;
    }
    // SAFETY: success guarantees a NUL-terminated string in buf.
    let name = unsafe { CStr::from_ptr(buf.as_ptr().cast::<libc::c_char>()) };
    Some(name.to_string_lossy().into_owned())
}

/// Resolve an interface name to its index (0 when unknown).
pub(crate) fn name_to_index(name: &str) -> u32 {
    let Ok(cname) = std::ffi::CString::new(name) else {
        return 0;
    };
    // SAFETY: cname is a valid NUL-terminated string.
    unsafe { libc::if_nametoindex(cname.as_ptr()) }
}
