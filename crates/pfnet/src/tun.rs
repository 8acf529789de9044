// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pfnet developers

//! BSD tun(4) device driver for virtual IPs.
//!
//! A tun device exists as long as its character device stays open, so the
//! owning [`TunDevice`] keeps the fd and the kernel tears the interface
//! down when the value is dropped. Address assignment goes through the
//! classic alias ioctls with the sockaddr layouts from [`crate::wire`].

use std::ffi::CString;
use std::io;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::{addr, wire, Error, Result};

const IFNAMSIZ: usize = 16;
const TUN_UNITS: u32 = 256;

const IOC_IN: u64 = 0x8000_0000;
const IOC_OUT: u64 = 0x4000_0000;

const fn ioc(inout: u64, group: u8, num: u8, len: usize) -> u64 {
    inout | (((len & 0x1fff) as u64) << 16) | ((group as u64) << 8) | num as u64
}

const SIOCSIFFLAGS: u64 = ioc(IOC_IN, b'i', 16, std::mem::size_of::<IfReq>());
const SIOCGIFFLAGS: u64 = ioc(IOC_IN | IOC_OUT, b'i', 17, std::mem::size_of::<IfReq>());
const SIOCAIFADDR: u64 = ioc(IOC_IN, b'i', 26, std::mem::size_of::<InAliasReq>());
const SIOCAIFADDR_IN6: u64 = ioc(IOC_IN, b'i', 26, std::mem::size_of::<In6AliasReq>());

const ND6_INFINITE_LIFETIME: u32 = u32::MAX;

#[repr(C)]
#[derive(Clone, Copy)]
struct IfReq {
    ifr_name: [u8; IFNAMSIZ],
    ifru_flags: i16,
    _ifru_pad: [u8; 14],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct InAliasReq {
    ifra_name: [u8; IFNAMSIZ],
    ifra_addr: [u8; 16],
    ifra_dstaddr: [u8; 16],
    ifra_mask: [u8; 16],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct In6AddrLifetime {
    ia6t_expire: i64,
    ia6t_preferred: i64,
    ia6t_vltime: u32,
    ia6t_pltime: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct In6AliasReq {
    ifra_name: [u8; IFNAMSIZ],
    ifra_addr: [u8; 28],
    ifra_dstaddr: [u8; 28],
    ifra_prefixmask: [u8; 28],
    ifra_flags: i32,
    ifra_lifetime: In6AddrLifetime,
}

fn name_bytes(name: &str) -> [u8; IFNAMSIZ] {
    let mut buf = [0u8; IFNAMSIZ];
    let n = name.len().min(IFNAMSIZ - 1);
    buf[..n].copy_from_slice(&name.as_bytes()[..n]);
    buf
}

fn sockaddr_bytes<const N: usize>(ip: IpAddr) -> [u8; N] {
    let rec = wire::ip_to_sockaddr(ip);
    let mut buf = [0u8; N];
    let n = rec.len().min(N);
    buf[..n].copy_from_slice(&rec[..n]);
    buf
}

fn v4_alias_request(name: &str, ip: IpAddr, prefix: u8) -> Option<InAliasReq> {
    let mask = addr::netmask(ip, prefix)?;
    Some(InAliasReq {
        ifra_name: name_bytes(name),
        ifra_addr: sockaddr_bytes(ip),
        // Point-to-point device: the peer is the address itself.
        ifra_dstaddr: sockaddr_bytes(ip),
        ifra_mask: sockaddr_bytes(mask),
    })
}

fn v6_alias_request(name: &str, ip: IpAddr, prefix: u8) -> Option<In6AliasReq> {
    let mask = addr::netmask(ip, prefix)?;
    Some(In6AliasReq {
        ifra_name: name_bytes(name),
        ifra_addr: sockaddr_bytes(ip),
        ifra_dstaddr: sockaddr_bytes(ip),
        ifra_prefixmask: sockaddr_bytes(mask),
        ifra_flags: 0,
        ifra_lifetime: In6AddrLifetime {
            ia6t_expire: 0,
            ia6t_preferred: 0,
            ia6t_vltime: ND6_INFINITE_LIFETIME,
            ia6t_pltime: ND6_INFINITE_LIFETIME,
        },
    })
}

fn ctl_socket(family: i32) -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2); ownership of the fd transfers to OwnedFd.
    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly created, valid descriptor owned by no one
    // else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ioctl<T>(fd: RawFd, request: u64, arg: &mut T) -> io::Result<()> {
    // SAFETY: arg points at a properly sized repr(C) request structure
    // matching the ioctl's expected layout; the call does not retain the
    // pointer.
    let ret = unsafe { libc::ioctl(fd, request as _, std::ptr::from_mut(arg)) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// An open tun(4) device, alive until dropped.
#[derive(Debug)]
pub struct TunDevice {
    fd: OwnedFd,
    name: String,
    addr: Option<IpAddr>,
}

impl TunDevice {
    /// Claim the first free tun unit.
    pub fn create() -> Result<Self> {
        let mut last_err = io::Error::from(io::ErrorKind::NotFound);
        for unit in 0..TUN_UNITS {
            let name = format!("tun{unit}");
            let Ok(path) = CString::new(format!("/dev/{name}")) else {
                continue;
            };
            // SAFETY: path is a valid NUL-terminated string; the fd is
            // transferred into OwnedFd immediately on success.
            let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
            if fd >= 0 {
                log::debug!("created tun device {}", name);
                return Ok(TunDevice {
                    // SAFETY: fd is valid and exclusively ours.
                    fd: unsafe { OwnedFd::from_raw_fd(fd) },
                    name,
                    addr: None,
                });
            }
            last_err = io::Error::last_os_error();
        }
        log::warn!("unable to claim a tun device: {}", last_err);
        Err(Error::Tun(last_err))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address assigned via [`TunDevice::set_address`], if any.
    pub fn address(&self) -> Option<IpAddr> {
        self.addr
    }

    /// Bring the interface up.
    pub fn up(&self) -> Result<()> {
        let ctl = ctl_socket(libc::AF_INET).map_err(Error::Tun)?;
        let mut req = IfReq {
            ifr_name: name_bytes(&self.name),
            ifru_flags: 0,
            _ifru_pad: [0; 14],
        };
        ioctl(ctl.as_raw_fd(), SIOCGIFFLAGS, &mut req).map_err(Error::Tun)?;
        req.ifru_flags |= wire::IFF_UP as i16;
        ioctl(ctl.as_raw_fd(), SIOCSIFFLAGS, &mut req).map_err(Error::Tun)?;
        Ok(())
    }

    /// Assign `ip/prefix` to the device.
    pub fn set_address(&mut self, ip: IpAddr, prefix: u8) -> Result<()> {
        let bad_prefix =
            || Error::AddressAssign(io::Error::new(io::ErrorKind::InvalidInput, "bad prefix"));
        match ip {
            IpAddr::V4(_) => {
                let ctl = ctl_socket(libc::AF_INET).map_err(Error::AddressAssign)?;
                let mut req = v4_alias_request(&self.name, ip, prefix).ok_or_else(bad_prefix)?;
                ioctl(ctl.as_raw_fd(), SIOCAIFADDR, &mut req).map_err(Error::AddressAssign)?;
            }
            IpAddr::V6(_) => {
                let ctl = ctl_socket(libc::AF_INET6).map_err(Error::AddressAssign)?;
                let mut req = v6_alias_request(&self.name, ip, prefix).ok_or_else(bad_prefix)?;
                ioctl(ctl.as_raw_fd(), SIOCAIFADDR_IN6, &mut req).map_err(Error::AddressAssign)?;
            }
        }
        self.addr = Some(ip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_sizes() {
        // The ioctl codes encode these sizes; both must match the kernel's
        // view of the structures.
        assert_eq!(std::mem::size_of::<IfReq>(), 32);
        assert_eq!(std::mem::size_of::<InAliasReq>(), 64);
        assert_eq!(std::mem::size_of::<In6AliasReq>(), 128);
    }

    #[test]
    fn test_ioctl_codes() {
        assert_eq!(SIOCSIFFLAGS, 0x8020_6910);
        assert_eq!(SIOCGIFFLAGS, 0xc020_6911);
        assert_eq!(SIOCAIFADDR, 0x8040_691a);
        assert_eq!(SIOCAIFADDR_IN6, 0x8080_691a);
    }

    #[test]
    fn test_name_bytes_terminated() {
        let buf = name_bytes("tun0");
        assert_eq!(&buf[..4], b"tun0");
        assert_eq!(buf[4], 0);

        // Oversized names keep the trailing NUL.
        let buf = name_bytes("0123456789abcdefXYZ");
        assert_eq!(buf[IFNAMSIZ - 1], 0);
    }

    #[test]
    fn test_v4_alias_request_contents() {
        let req = v4_alias_request("tun1", "10.99.0.2".parse().unwrap(), 32).unwrap();
        assert_eq!(&req.ifra_name[..4], b"tun1");
        assert_eq!(req.ifra_addr[0], 16);
        assert_eq!(req.ifra_addr[1], wire::AF_INET);
        assert_eq!(&req.ifra_addr[4..8], &[10, 99, 0, 2]);
        assert_eq!(&req.ifra_dstaddr[4..8], &[10, 99, 0, 2]);
        assert_eq!(&req.ifra_mask[4..8], &[255, 255, 255, 255]);
    }

    #[test]
    fn test_v4_alias_request_prefix() {
        let req = v4_alias_request("tun1", "10.99.0.2".parse().unwrap(), 24).unwrap();
        assert_eq!(&req.ifra_mask[4..8], &[255, 255, 255, 0]);
        assert!(v4_alias_request("tun1", "10.99.0.2".parse().unwrap(), 33).is_none());
    }

    #[test]
    fn test_v6_alias_request_contents() {
        let ip: IpAddr = "fd00::2".parse().unwrap();
        let req = v6_alias_request("tun2", ip, 128).unwrap();
        assert_eq!(req.ifra_addr[1], wire::AF_INET6);
        assert_eq!(req.ifra_addr[8], 0xfd);
        assert_eq!(req.ifra_prefixmask[8..24], [0xff; 16]);
        assert_eq!(req.ifra_lifetime.ia6t_vltime, ND6_INFINITE_LIFETIME);
    }
}
