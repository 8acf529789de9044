// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pfnet developers

//! The network monitor: one long-lived object owning the PF_ROUTE socket,
//! the interface cache, and the reader thread that keeps them in step.

use std::mem::MaybeUninit;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;

use crate::cache::{AddressIter, AddressMask, IfaceEntry, NetState};
use crate::ifaddrs;
use crate::query::Rendezvous;
use crate::roam::RoamDebouncer;
use crate::sched::Scheduler;
use crate::socket::RouteSocket;
use crate::tun::TunDevice;
use crate::wire::{
    self, RouteRequest, SaIter, RTA_DST, RTA_GATEWAY, RTA_IFA, RTA_IFP, RTA_NETMASK, RTAX_DST,
    RTAX_GATEWAY, RTAX_IFA, RTF_GATEWAY, RTF_HOST, RTF_STATIC, RTF_UP, RTM_ADD, RTM_DELADDR,
    RTM_DELETE, RTM_GET, RTM_IFINFO, RTM_NEWADDR,
};
use crate::{addr, Error, Result};

/// Upcalls into the surrounding daemon.
///
/// The monitor consults this for interface policy and reports the events
/// upper layers care about. Implementations must tolerate calls from the
/// reader and scheduler threads.
pub trait NetCallbacks: Send + Sync {
    /// May this interface be used for IPsec source selection?
    fn is_interface_usable(&self, name: &str) -> bool;

    /// Local addressing changed enough to revalidate security
    /// associations. `address_changed` is set when an address (not just a
    /// link state) moved.
    fn roam(&self, address_changed: bool);

    /// A tun device for a virtual IP was installed (`installed`) or
    /// removed.
    fn tun_registered(&self, name: &str, installed: bool);
}

/// Callbacks that consider every interface usable and ignore all events.
pub struct AllowAll;

impl NetCallbacks for AllowAll {
    fn is_interface_usable(&self, _name: &str) -> bool {
        true
    }

    fn roam(&self, _address_changed: bool) {}

    fn tun_registered(&self, _name: &str, _installed: bool) {}
}

/// Capabilities the surrounding daemon has to compensate for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Features {
    /// Passthrough/exclude routes must be installed explicitly; the
    /// kernel does not narrow routes for IKE traffic by itself.
    pub requires_exclude_route: bool,
}

/// Tunables of the monitor.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Consume kernel events on a reader thread. Daemons that run without
    /// worker threads disable this and keep only synchronous sends.
    pub process_events: bool,
    /// Debounce window for roam events.
    pub roam_delay: Duration,
    /// How long a route query waits for its reply.
    pub reply_timeout: Duration,
    /// How long add_ip/del_ip wait for the kernel address event.
    pub vip_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            process_events: true,
            roam_delay: Duration::from_millis(100),
            reply_timeout: Duration::from_secs(1),
            vip_timeout: Duration::from_secs(1),
        }
    }
}

impl MonitorConfig {
    pub fn with_process_events(mut self, process_events: bool) -> Self {
        self.process_events = process_events;
        self
    }

    pub fn with_roam_delay(mut self, delay: Duration) -> Self {
        self.roam_delay = delay;
        self
    }
}

/// Everything the dispatcher and the public operations share. Kept apart
/// from the socket so message handling can be exercised without one.
pub(crate) struct Core {
    state: RwLock<NetState>,
    rendezvous: Rendezvous,
    callbacks: Arc<dyn NetCallbacks>,
    roam: RoamDebouncer,
    sched: Scheduler,
    config: MonitorConfig,
    pid: i32,
}

impl Core {
    fn new(callbacks: Arc<dyn NetCallbacks>, config: MonitorConfig) -> Self {
        Core {
            state: RwLock::new(NetState::default()),
            rendezvous: Rendezvous::new(),
            callbacks,
            roam: RoamDebouncer::new(config.roam_delay),
            sched: Scheduler::new(),
            config,
            pid: std::process::id() as i32,
        }
    }

    /// Seed the cache from a full kernel enumeration. Interfaces are
    /// created on first sight; link-layer records announce the interface
    /// but contribute no address.
    fn populate_initial(&self) -> std::io::Result<()> {
        let records = ifaddrs::enumerate()?;
        let mut state = self.state.write();
        for record in records {
            if state.iface_by_name(&record.name).is_none() {
                let usable = self.callbacks.is_interface_usable(&record.name);
                state.ifaces.push(IfaceEntry {
                    ifindex: record.ifindex,
                    name: record.name.clone(),
                    flags: record.flags,
                    usable,
                    addrs: Vec::new(),
                });
            }
            if let Some(ip) = record.addr {
                if let Some(ifindex) = state.iface_by_name(&record.name).map(|i| i.ifindex) {
                    state.add_addr(ifindex, ip, false);
                }
            }
        }

        log::debug!("known interfaces and IP addresses:");
        for iface in state.ifaces.iter().filter(|i| i.is_up_and_usable()) {
            log::debug!("  {}", iface.name);
            for entry in &iface.addrs {
                log::debug!("    {}", entry.ip);
            }
        }
        Ok(())
    }

    /// Validate one inbound message and dispatch it. Malformed input is
    /// logged and dropped; the dispatcher itself never fails.
    pub(crate) fn handle_message(&self, buf: &[u8]) {
        if buf.len() < wire::RT_HDR_MIN {
            log::warn!("received invalid PF_ROUTE message");
            return;
        }
        let Some(msglen) = wire::declared_len(buf) else {
            return;
        };
        if buf.len() < msglen {
            log::warn!("received invalid PF_ROUTE message");
            return;
        }
        let version = buf[2];
        let msg_type = buf[3];
        if version != wire::RTM_VERSION {
            log::warn!(
                "received PF_ROUTE message with unsupported version: {}",
                version
            );
            return;
        }
        let Some(hdrlen) = wire::header_len(msg_type) else {
            return;
        };
        if msglen < hdrlen {
            log::warn!("ignoring short PF_ROUTE message");
            return;
        }
        let msg = &buf[..msglen];
        match msg_type {
            RTM_NEWADDR | RTM_DELADDR => self.process_addr(msg),
            RTM_IFINFO => self.process_link(msg),
            // Route changes are validated but not interpreted; only the
            // reply correlation below looks at them.
            _ => {}
        }

        self.rendezvous.deliver(self.pid, msg);
    }

    /// RTM_NEWADDR / RTM_DELADDR: update one interface's address list.
    fn process_addr(&self, msg: &[u8]) {
        let Some(hdr) = wire::ifa_header(msg) else {
            return;
        };
        let tail = &msg[wire::IFA_MSGHDR_LEN..];
        let host = SaIter::new(hdr.ifam_addrs as u32, tail)
            .find(|&(slot, _)| slot == RTAX_IFA)
            .and_then(|(_, rec)| wire::sockaddr_to_ip(rec));
        let Some(host) = host else {
            return;
        };

        let ifindex = u32::from(hdr.ifam_index);
        let mut roam = false;
        {
            let mut state = self.state.write();
            let Some((name, usable)) = state
                .iface_by_index(ifindex)
                .map(|i| (i.name.clone(), i.usable))
            else {
                return;
            };

            let mut changed = false;
            match hdr.ifam_type {
                RTM_DELADDR => {
                    if let Some(entry) = state.remove_addr(ifindex, host) {
                        if !entry.virt && usable {
                            changed = true;
                            log::info!("{} disappeared from {}", host, name);
                        }
                    }
                }
                RTM_NEWADDR => {
                    if state.add_addr(ifindex, host, false) {
                        changed = true;
                        if usable {
                            log::info!("{} appeared on {}", host, name);
                        }
                    }
                }
                _ => {}
            }

            if changed
                && state
                    .iface_by_index(ifindex)
                    .is_some_and(|i| i.is_up_and_usable())
            {
                roam = true;
            }
        }

        if roam {
            self.fire_roam(true);
        }
    }

    /// RTM_IFINFO: refresh interface flags and rebuild its address list.
    /// Link flaps do not reliably announce every per-address transition,
    /// so the list is always rebuilt from a fresh enumeration.
    fn process_link(&self, msg: &[u8]) {
        let Some(hdr) = wire::if_header(msg) else {
            return;
        };
        let ifindex = u32::from(hdr.ifm_index);
        let new_flags = hdr.ifm_flags as u32;

        let mut roam = false;
        {
            let mut state = self.state.write();
            if let Some(iface) = state.iface_by_index(ifindex) {
                if iface.usable {
                    let was_up = iface.is_up();
                    let is_up = new_flags & wire::IFF_UP != 0;
                    if !was_up && is_up {
                        roam = true;
                        log::info!("interface {} activated", iface.name);
                    } else if was_up && !is_up {
                        roam = true;
                        log::info!("interface {} deactivated", iface.name);
                    }
                }
                iface.flags = new_flags;
                let name = iface.name.clone();
                repopulate(&mut state, ifindex, &name);
            } else if let Some(name) = ifaddrs::index_to_name(ifindex) {
                log::info!("interface {} appeared", name);
                let usable = self.callbacks.is_interface_usable(&name);
                state.ifaces.push(IfaceEntry {
                    ifindex,
                    name: name.clone(),
                    flags: new_flags,
                    usable,
                    addrs: Vec::new(),
                });
                repopulate(&mut state, ifindex, &name);
            }
        }

        if roam {
            self.fire_roam(true);
        }
    }

    fn fire_roam(&self, address: bool) {
        self.roam.fire(&self.sched, &self.callbacks, address);
    }

    fn interface_for(&self, ip: IpAddr) -> Option<String> {
        self.state.read().interface_for(ip)
    }
}

/// Rebuild one interface's address list from a fresh kernel enumeration.
fn repopulate(state: &mut NetState, ifindex: u32, name: &str) {
    state.clear_addrs(ifindex);
    let Ok(records) = ifaddrs::enumerate() else {
        return;
    };
    for record in records.into_iter().filter(|r| r.name == name) {
        if let Some(ip) = record.addr {
            state.add_addr(ifindex, ip, false);
        }
    }
}

/// Pull the requested address out of a route-get reply: the gateway (or,
/// for cloned direct routes flagged RTF_HOST, the destination) when a
/// nexthop was asked for, the interface address otherwise.
fn extract_route_reply(buf: &[u8], nexthop: bool) -> Option<IpAddr> {
    let hdr = wire::rt_header(buf)?;
    let end = (hdr.rtm_msglen as usize).min(buf.len());
    if end < wire::RT_MSGHDR_LEN {
        return None;
    }
    let tail = &buf[wire::RT_MSGHDR_LEN..end];
    for (slot, rec) in SaIter::new(hdr.rtm_addrs as u32, tail) {
        if nexthop && slot == RTAX_GATEWAY {
            return wire::sockaddr_to_ip(rec);
        }
        if nexthop && slot == RTAX_DST && hdr.rtm_flags as u32 & RTF_HOST != 0 {
            // Probably a cloned direct route.
            return wire::sockaddr_to_ip(rec);
        }
        if !nexthop && slot == RTAX_IFA {
            return wire::sockaddr_to_ip(rec);
        }
    }
    None
}

fn build_route(
    op: u8,
    dst: IpAddr,
    prefixlen: u8,
    gateway: Option<IpAddr>,
    if_name: Option<&str>,
    pid: i32,
    seq: i32,
) -> RouteRequest {
    let mut req = RouteRequest::new(op, RTF_UP | RTF_STATIC, pid, seq);
    let host_route = prefixlen == addr::full_prefix(dst);
    if host_route {
        req.or_flags(RTF_HOST | RTF_GATEWAY);
    }
    req.add_addr(RTA_DST, dst);
    if let Some(gw) = gateway {
        req.add_addr(RTA_GATEWAY, gw);
    }
    if !host_route {
        req.add_netmask(RTA_NETMASK, dst, prefixlen);
    }
    if let Some(name) = if_name {
        req.add_ifname(RTA_IFP, name);
    }
    req
}

/// Plan the request(s) for one route operation. The kernel refuses a
/// literal default route, so prefix 0 becomes two half-space routes:
/// upper half first, then lower.
fn plan_route(
    op: u8,
    dst: IpAddr,
    prefixlen: u8,
    gateway: Option<IpAddr>,
    if_name: Option<&str>,
    pid: i32,
    next_seq: &mut dyn FnMut() -> i32,
) -> Vec<RouteRequest> {
    if prefixlen == 0 {
        vec![
            build_route(op, addr::upper_half(dst), 1, gateway, if_name, pid, next_seq()),
            build_route(op, dst, 1, gateway, if_name, pid, next_seq()),
        ]
    } else {
        vec![build_route(op, dst, prefixlen, gateway, if_name, pid, next_seq())]
    }
}

/// Send planned requests in order, stopping at the first failure.
fn send_planned(
    plans: &[RouteRequest],
    send: &mut dyn FnMut(&RouteRequest) -> Result<()>,
) -> Result<()> {
    for req in plans {
        send(req)?;
    }
    Ok(())
}

const RECV_BUF_LEN: usize = 2048;

/// The daemon's view of, and control channel for, the host's network
/// configuration.
///
/// See the crate docs for the overall shape. Construction opens the
/// routing socket, seeds the cache from a full kernel enumeration and
/// (unless disabled) starts the reader thread; drop stops the reader,
/// closes the socket and destroys any remaining tun devices.
pub struct NetMonitor {
    core: Arc<Core>,
    socket: Arc<RouteSocket>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl NetMonitor {
    /// Create a monitor with default configuration.
    pub fn new(callbacks: Arc<dyn NetCallbacks>) -> Result<Self> {
        Self::with_config(callbacks, MonitorConfig::default())
    }

    pub fn with_config(callbacks: Arc<dyn NetCallbacks>, config: MonitorConfig) -> Result<Self> {
        let socket = Arc::new(RouteSocket::open()?);
        let process_events = config.process_events;
        if !process_events {
            // No worker threads in this mode; never register for events.
            socket.shutdown_read();
        }

        let core = Arc::new(Core::new(callbacks, config));
        core.populate_initial().map_err(Error::Enumerate)?;

        let mut monitor = NetMonitor {
            core,
            socket,
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        };
        if process_events {
            monitor.reader = Some(monitor.spawn_reader()?);
        }
        Ok(monitor)
    }

    fn spawn_reader(&self) -> Result<JoinHandle<()>> {
        let core = Arc::clone(&self.core);
        let socket = Arc::clone(&self.socket);
        let stop = Arc::clone(&self.stop);
        thread::Builder::new()
            .name("pfnet-route".to_string())
            .spawn(move || reader_loop(&core, &socket, &stop))
            .map_err(Error::Socket)
    }

    /// Kernel capabilities the daemon must work around.
    pub fn features(&self) -> Features {
        Features {
            requires_exclude_route: true,
        }
    }

    /// Name of the up-and-usable interface carrying `ip`, if any.
    pub fn interface_for(&self, ip: IpAddr) -> Option<String> {
        self.core.interface_for(ip)
    }

    /// Enumerate cached addresses. The iterator holds the cache read lock
    /// until dropped; release it promptly and do not call back into the
    /// monitor while holding it.
    pub fn addresses(&self, mask: AddressMask) -> AddressIter<'_> {
        AddressIter::new(self.core.state.read(), mask)
    }

    /// Source address the kernel would pick for `dest`.
    pub fn source_addr(&self, dest: IpAddr, src_hint: Option<IpAddr>) -> Option<IpAddr> {
        self.get_route(false, dest, src_hint)
    }

    /// Next hop toward `dest`.
    pub fn nexthop(&self, dest: IpAddr, src_hint: Option<IpAddr>) -> Option<IpAddr> {
        self.get_route(true, dest, src_hint)
    }

    fn get_route(&self, nexthop: bool, dest: IpAddr, src: Option<IpAddr>) -> Option<IpAddr> {
        let seq = self.socket.next_seq();
        let mut req = RouteRequest::new(RTM_GET, 0, self.socket.pid(), seq);
        req.add_addr(RTA_DST, dest);
        if !nexthop {
            // An empty link-name slot makes the kernel return a source
            // address.
            req.add_ifname(RTA_IFP, "");
        }
        if let Some(src) = src {
            req.add_addr(RTA_IFA, src);
        }
        let msg = req.encode();

        let reply = self
            .core
            .rendezvous
            .query(seq, self.core.config.reply_timeout, || {
                self.socket.send(&msg)
            });
        match reply {
            Ok(Some(reply)) => extract_route_reply(&reply, nexthop),
            Ok(None) => None,
            Err(e) => {
                log::warn!("PF_ROUTE lookup failed: {}", e);
                None
            }
        }
    }

    /// Install a route.
    pub fn add_route(
        &self,
        dst: IpAddr,
        prefixlen: u8,
        gateway: Option<IpAddr>,
        _src: Option<IpAddr>,
        if_name: Option<&str>,
    ) -> Result<()> {
        self.manage_route(RTM_ADD, dst, prefixlen, gateway, if_name)
    }

    /// Remove a route.
    pub fn del_route(
        &self,
        dst: IpAddr,
        prefixlen: u8,
        gateway: Option<IpAddr>,
        _src: Option<IpAddr>,
        if_name: Option<&str>,
    ) -> Result<()> {
        self.manage_route(RTM_DELETE, dst, prefixlen, gateway, if_name)
    }

    fn manage_route(
        &self,
        op: u8,
        dst: IpAddr,
        prefixlen: u8,
        gateway: Option<IpAddr>,
        if_name: Option<&str>,
    ) -> Result<()> {
        let mut next_seq = || self.socket.next_seq();
        let plans = plan_route(op, dst, prefixlen, gateway, if_name, self.socket.pid(), &mut next_seq);
        send_planned(&plans, &mut |req| {
            self.socket.send(&req.encode()).inspect_err(|e| {
                let verb = if op == RTM_ADD { "adding" } else { "deleting" };
                log::warn!("{} PF_ROUTE route failed: {}", verb, e);
            })
        })
    }

    /// Install a virtual IP on a fresh tun device and wait until the
    /// kernel's address event has been observed.
    pub fn add_ip(&self, vip: IpAddr, prefix: Option<u8>, _iface_hint: Option<&str>) -> Result<()> {
        let mut tun = TunDevice::create()?;
        let prefix = prefix.unwrap_or_else(|| addr::full_prefix(vip));
        tun.up()?;
        tun.set_address(vip, prefix)?;

        let core = &self.core;
        let appeared = core.rendezvous.wait_until(core.config.vip_timeout, || {
            core.state.read().interface_for(vip).is_some()
        });
        if !appeared {
            log::warn!("virtual IP {} did not appear on {}", vip, tun.name());
            return Err(Error::Timeout);
        }

        let mut state = core.state.write();
        let name = tun.name().to_string();
        state.tuns.push(tun);
        state.mark_virtual(&name, vip);
        // Registered while holding the write lock so nobody can delete
        // the device underneath the listener.
        core.callbacks.tun_registered(&name, true);
        Ok(())
    }

    /// Remove a virtual IP installed by this monitor. With `wait`, block
    /// (bounded) until the kernel's delete event has been observed.
    pub fn del_ip(&self, vip: IpAddr, _prefix: Option<u8>, wait: bool) -> Result<()> {
        let core = &self.core;
        let found = {
            let mut state = core.state.write();
            match state.tuns.iter().position(|t| t.address() == Some(vip)) {
                Some(pos) => {
                    let tun = state.tuns.remove(pos);
                    core.callbacks.tun_registered(tun.name(), false);
                    true
                }
                None => false,
            }
        };
        if !found {
            return Err(Error::NotFound);
        }

        if wait {
            let gone = core.rendezvous.wait_until(core.config.vip_timeout, || {
                core.state.read().interface_for(vip).is_none()
            });
            if !gone {
                log::warn!("virtual IP {} did not disappear from tun", vip);
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }
}

impl Drop for NetMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if self.reader.is_some() {
            // Wake the reader out of its blocking receive.
            self.socket.interrupt();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn reader_loop(core: &Core, socket: &RouteSocket, stop: &AtomicBool) {
    let mut buf = [MaybeUninit::<u8>::uninit(); RECV_BUF_LEN];
    while !stop.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                // SAFETY: recv initialized the first n bytes of buf.
                let msg =
                    unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), n) };
                core.handle_message(msg);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::Interrupted
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("unable to receive from PF_ROUTE event socket: {}", e);
                // Back off instead of spinning on a broken socket.
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
}
