// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pfnet developers

//! # pfnet - kernel network interface over PF_ROUTE
//!
//! The network-layer backend of an IPsec keying daemon on BSD-family
//! systems. It keeps an event-driven cache of the host's interfaces and IP
//! addresses, answers synchronous route lookups, programs routes, and
//! installs the virtual IPs negotiated by a tunnel onto local tun devices.
//!
//! Everything is driven by a single raw `PF_ROUTE` socket: a dedicated
//! reader thread consumes kernel notifications (`RTM_NEWADDR`,
//! `RTM_DELADDR`, `RTM_IFINFO`, route messages) and updates the cache,
//! while caller threads issue requests (`RTM_GET`, `RTM_ADD`, `RTM_DELETE`)
//! on the same socket and rendezvous with the reader for replies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pfnet::{AllowAll, NetMonitor};
//!
//! fn main() -> pfnet::Result<()> {
//!     let monitor = NetMonitor::new(Arc::new(AllowAll))?;
//!
//!     if let Some(src) = monitor.source_addr("192.0.2.1".parse().unwrap(), None) {
//!         println!("kernel would source from {src}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        NetMonitor                            |
//! |  public ops: interface_for / addresses / source_addr /       |
//! |  nexthop / add_ip / del_ip / add_route / del_route           |
//! +------------------+----------------------+--------------------+
//! | interface cache  |  query rendezvous    |  roam debouncer    |
//! | (RwLock)         |  (Mutex + Condvar)   |  (scheduler)       |
//! +------------------+----------------------+--------------------+
//! |              reader thread on the PF_ROUTE socket            |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Platform
//!
//! The wire codec follows the 4.4BSD `route(4)` message format, in which
//! every socket address record leads with its own length byte. Systems
//! whose sockaddr lacks that length field cannot host this backend.

/// Address helpers (netmask synthesis, scope checks).
pub mod addr;
/// Interface/address cache and mask-filtered enumeration.
pub mod cache;
/// Kernel interface/address enumeration via getifaddrs.
mod ifaddrs;
/// NetMonitor composition and public operations.
pub mod monitor;
/// Route-query rendezvous between caller threads and the reader.
mod query;
/// Roam-event debouncer.
mod roam;
/// Delayed-job scheduler.
pub mod sched;
/// Routing-socket transport.
mod socket;
/// Tunnel device driver for virtual IPs.
pub mod tun;
/// PF_ROUTE message codec.
pub mod wire;

pub use cache::{AddressIter, AddressMask};
pub use monitor::{AllowAll, Features, MonitorConfig, NetCallbacks, NetMonitor};
pub use tun::TunDevice;

use std::fmt;
use std::io;

/// Errors returned by pfnet operations.
#[derive(Debug)]
pub enum Error {
    /// Creating the PF_ROUTE socket failed. Fatal for construction.
    Socket(io::Error),
    /// Sending a request on the routing socket failed.
    Send(io::Error),
    /// Enumerating kernel interfaces failed.
    Enumerate(io::Error),
    /// A bounded wait (route reply, virtual IP event) expired.
    Timeout,
    /// del_ip was called for a virtual IP this monitor did not install.
    NotFound,
    /// Allocating or configuring a tunnel device failed.
    Tun(io::Error),
    /// Assigning an address to a tunnel device failed.
    AddressAssign(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Socket(e) => write!(f, "unable to create PF_ROUTE socket: {}", e),
            Error::Send(e) => write!(f, "PF_ROUTE send failed: {}", e),
            Error::Enumerate(e) => write!(f, "unable to get interface list: {}", e),
            Error::Timeout => write!(f, "timed out waiting for kernel event"),
            Error::NotFound => write!(f, "virtual IP not installed by this monitor"),
            Error::Tun(e) => write!(f, "tun device failed: {}", e),
            Error::AddressAssign(e) => write!(f, "address assignment failed: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Socket(e)
            | Error::Send(e)
            | Error::Enumerate(e)
            | Error::Tun(e)
            | Error::AddressAssign(e) => Some(e),
            _ => None,
        }
    }
}

/// Result alias for pfnet operations.
pub type Result<T> = std::result::Result<T, Error>;
