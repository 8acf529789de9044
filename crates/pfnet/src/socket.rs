// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pfnet developers

//! The raw PF_ROUTE socket shared by the reader thread and request
//! senders.
//!
//! The socket is full-duplex: requests go out on it and both replies and
//! unsolicited kernel notifications come back in. Senders that expect a
//! reply coordinate through the query rendezvous; fire-and-forget sends
//! (route add/delete) just write.

use std::io;
use std::mem::MaybeUninit;
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use socket2::{Domain, Protocol, Socket, Type};

use crate::wire::{AF_UNSPEC, PF_ROUTE};
use crate::{Error, Result};

pub(crate) struct RouteSocket {
    sock: Socket,
    pid: i32,
    seq: AtomicI32,
}

impl RouteSocket {
    /// Open the routing socket. Fails on systems without PF_ROUTE.
    pub fn open() -> Result<Self> {
        let sock = Socket::new(
            Domain::from(PF_ROUTE),
            Type::RAW,
            Some(Protocol::from(i32::from(AF_UNSPEC))),
        )
        .map_err(Error::Socket)?;

        Ok(RouteSocket {
            sock,
            pid: std::process::id() as i32,
            seq: AtomicI32::new(0),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Next request sequence number; never zero, since zero marks "no
    /// query outstanding" in the rendezvous.
    pub fn next_seq(&self) -> i32 {
        bump_seq(&self.seq)
    }

    /// Send one framed message. A short write counts as failure; the
    /// kernel reports in-band errors through the send result.
    pub fn send(&self, msg: &[u8]) -> Result<()> {
        match self.sock.send(msg) {
            Ok(n) if n == msg.len() => Ok(()),
            Ok(_) => Err(Error::Send(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write on routing socket",
            ))),
            Err(e) => Err(Error::Send(e)),
        }
    }

    /// Blocking receive of one message.
    pub fn recv(&self, buf: &mut [MaybeUninit<u8>]) -> io::Result<usize> {
        self.sock.recv(buf)
    }

    /// Stop receiving kernel events; only synchronous sends remain. Used
    /// when the daemon runs without worker threads.
    pub fn shutdown_read(&self) {
        if let Err(e) = self.sock.shutdown(Shutdown::Read) {
            log::warn!("closing read end of PF_ROUTE socket failed: {}", e);
        }
    }

    /// Tear the socket down underneath a blocked reader so it wakes up.
    pub fn interrupt(&self) {
        // SAFETY: the fd is owned by self.sock and stays open until drop;
        // shutdown on a connected raw socket is always safe to call.
        unsafe {
            libc::shutdown(self.sock.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

fn bump_seq(seq: &AtomicI32) -> i32 {
    let next = seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    if next == 0 {
        seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    } else {
        next
    }
}
