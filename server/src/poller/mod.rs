/*
 * This file is part of ktd, a networked, expiration-aware key-value
 * cache server with master/slave replication.
 *
 * Copyright (c) 2024, ktd contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! # Poller
//!
//! Dispatches edge-triggered, one-shot I/O readiness notifications over a
//! dynamic set of raw socket handles. Built directly on `epoll(7)` rather
//! than on a higher-level reactor crate: `EPOLLONESHOT` gives us the
//! auto-disarm-on-hit semantics the spec calls for without having to fake
//! one-shot behaviour on top of a level-triggered abstraction, and the
//! worker pool this feeds is thread-per-connection rather than task-based,
//! so there is no async runtime underneath to hand this off to.
//!
//! Handles are raw file descriptors; the `Poller` never takes ownership of
//! the underlying socket; that stays with the acceptor/connection.

use crate::errors::{KtError, KtResult};
use std::{
    collections::{HashSet, VecDeque},
    os::unix::io::RawFd,
    sync::atomic::{AtomicBool, Ordering},
    sync::Mutex,
    time::{Duration, Instant},
};

/// The timed out are given a fresh look every `TICK` so that `abort()` is
/// observed promptly even while a long `wait()` is outstanding.
const TICK: Duration = Duration::from_millis(100);
const MAX_EVENTS: usize = 256;

pub type Handle = RawFd;

/// Interest flags a handle is deposited/re-armed with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub input: bool,
    pub output: bool,
    pub except: bool,
}

impl Interest {
    pub const fn input() -> Self {
        Self {
            input: true,
            output: false,
            except: false,
        }
    }
    pub const fn output() -> Self {
        Self {
            input: false,
            output: true,
            except: false,
        }
    }
}

/// One readiness notification: the handle and the flags actually observed.
#[derive(Debug, Clone, Copy)]
pub struct Hit {
    pub handle: Handle,
    pub observed: Interest,
}

struct Watch {
    interest: Interest,
}

/// An edge-triggered, one-shot readiness multiplexer.
pub struct Poller {
    epfd: RawFd,
    watched: HashSet<Handle>,
    registered: std::collections::HashMap<Handle, Watch>,
    hits: VecDeque<Hit>,
    abort_flag: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Poller {
    /// Acquires the underlying readiness facility (`epoll_create1`).
    pub fn open() -> KtResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(KtError::Io(std::io::Error::last_os_error()));
        }
        Ok(Self {
            epfd,
            watched: HashSet::new(),
            registered: std::collections::HashMap::new(),
            hits: VecDeque::new(),
            abort_flag: AtomicBool::new(false),
            last_error: Mutex::new(None),
        })
    }

    fn set_last_error(&self, msg: impl Into<String>) {
        *self.last_error.lock().unwrap() = Some(msg.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// Number of handles currently in the watch set.
    pub fn count(&self) -> usize {
        self.watched.len()
    }

    fn epoll_events_for(interest: Interest) -> u32 {
        let mut ev = libc::EPOLLONESHOT as u32;
        if interest.input {
            ev |= libc::EPOLLIN as u32;
        }
        if interest.output {
            ev |= libc::EPOLLOUT as u32;
        }
        if interest.except {
            ev |= libc::EPOLLPRI as u32;
        }
        ev
    }

    /// Adds `handle` to the watch set in one-shot mode. Fails if already
    /// deposited.
    pub fn deposit(&mut self, handle: Handle, interest: Interest) -> KtResult<()> {
        if !self.watched.insert(handle) {
            let msg = format!("handle {handle} already deposited");
            self.set_last_error(&msg);
            return Err(KtError::invalid(msg));
        }
        let mut ev = libc::epoll_event {
            events: Self::epoll_events_for(interest),
            u64: handle as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, handle, &mut ev) };
        if rc < 0 {
            self.watched.remove(&handle);
            let err = std::io::Error::last_os_error();
            self.set_last_error(err.to_string());
            return Err(KtError::Io(err));
        }
        self.registered.insert(handle, Watch { interest });
        Ok(())
    }

    /// Removes `handle` from the watch set; any pending hit is discarded.
    pub fn withdraw(&mut self, handle: Handle) -> KtResult<()> {
        if !self.watched.remove(&handle) {
            let msg = format!("handle {handle} is not deposited");
            self.set_last_error(&msg);
            return Err(KtError::invalid(msg));
        }
        self.registered.remove(&handle);
        self.hits.retain(|h| h.handle != handle);
        let rc = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, handle, std::ptr::null_mut())
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            self.set_last_error(err.to_string());
            return Err(KtError::Io(err));
        }
        Ok(())
    }

    /// Re-arms `handle` for one more notification using its last-declared
    /// interest flags. Required because every hit auto-disarms
    /// (`EPOLLONESHOT`).
    pub fn undo(&mut self, handle: Handle) -> KtResult<()> {
        let interest = match self.registered.get(&handle) {
            Some(w) => w.interest,
            None => {
                let msg = format!("handle {handle} was never deposited");
                self.set_last_error(&msg);
                return Err(KtError::invalid(msg));
            }
        };
        let mut ev = libc::epoll_event {
            events: Self::epoll_events_for(interest),
            u64: handle as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, handle, &mut ev) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            self.set_last_error(err.to_string());
            return Err(KtError::Io(err));
        }
        Ok(())
    }

    /// Pops one ready handle from the internal hit set.
    pub fn next(&mut self) -> KtResult<Hit> {
        self.hits.pop_front().ok_or_else(|| {
            self.set_last_error("no hits available");
            KtError::NoRec
        })
    }

    /// Blocks until at least one handle is ready or `timeout` elapses.
    /// Returns `Ok(true)` on success (the hit set has been populated);
    /// never returns `Ok(false)` — on timeout this returns `Err` with a
    /// "timed out" message, matching the spec's explicit carve-out that a
    /// timeout is not folded into the success path.
    pub fn wait(&mut self, timeout: Duration) -> KtResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.abort_flag.swap(false, Ordering::SeqCst) {
                self.set_last_error("operation aborted");
                return Err(KtError::misc("operation timed out"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.set_last_error("operation timed out");
                return Err(KtError::misc("operation timed out"));
            }
            let slice = remaining.min(TICK);
            let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as i32,
                    slice.as_millis() as i32,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                self.set_last_error(err.to_string());
                return Err(KtError::Io(err));
            }
            if n == 0 {
                // this tick produced nothing; keep ticking until the
                // deadline or an abort request
                continue;
            }
            for ev in &events[..n as usize] {
                let handle = ev.u64 as Handle;
                let observed = Interest {
                    input: ev.events & (libc::EPOLLIN as u32) != 0,
                    output: ev.events & (libc::EPOLLOUT as u32) != 0,
                    except: ev.events & (libc::EPOLLPRI as u32) != 0,
                };
                self.hits.push_back(Hit { handle, observed });
            }
            return Ok(true);
        }
    }

    /// Marks every watched handle as ready with empty flags; used to drain
    /// the worker pool during a graceful shutdown.
    pub fn flush(&mut self) {
        for &handle in &self.watched {
            self.hits.push_back(Hit {
                handle,
                observed: Interest::default(),
            });
        }
    }

    /// Cooperative cancellation: a concurrently-running `wait` exits with a
    /// timeout-like error at the next tick (at most [`TICK`] later).
    pub fn abort(&self) {
        self.abort_flag.store(true, Ordering::SeqCst);
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

// SAFETY: `Poller` only manipulates the epoll fd and its own bookkeeping;
// nothing here is thread-confined, and `abort()` is explicitly meant to be
// called from a different thread than the one blocked in `wait()`.
unsafe impl Send for Poller {}
unsafe impl Sync for Poller {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn deposit_twice_fails() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut p = Poller::open().unwrap();
        p.deposit(a.as_raw_fd(), Interest::input()).unwrap();
        assert!(p.deposit(a.as_raw_fd(), Interest::input()).is_err());
    }

    #[test]
    fn withdraw_removes_pending_hit() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut p = Poller::open().unwrap();
        p.deposit(a.as_raw_fd(), Interest::input()).unwrap();
        b.set_nonblocking(true).unwrap();
        use std::io::Write;
        let mut bb = &b;
        bb.write_all(b"x").unwrap();
        p.wait(Duration::from_millis(500)).unwrap();
        p.withdraw(a.as_raw_fd()).unwrap();
        assert!(p.next().is_err());
    }

    #[test]
    fn wait_times_out_without_activity() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut p = Poller::open().unwrap();
        p.deposit(a.as_raw_fd(), Interest::input()).unwrap();
        let err = p.wait(Duration::from_millis(150)).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn readiness_then_undo_rearms_for_next_hit() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut p = Poller::open().unwrap();
        p.deposit(a.as_raw_fd(), Interest::input()).unwrap();
        use std::io::{Read, Write};
        let mut bb = &b;
        bb.write_all(b"x").unwrap();
        p.wait(Duration::from_millis(500)).unwrap();
        let hit = p.next().unwrap();
        assert_eq!(hit.handle, a.as_raw_fd());
        assert!(hit.observed.input);
        // drain so the fd is not immediately ready again
        let mut buf = [0u8; 1];
        let mut aa = &a;
        aa.read_exact(&mut buf).unwrap();
        p.undo(a.as_raw_fd()).unwrap();
        bb.write_all(b"y").unwrap();
        p.wait(Duration::from_millis(500)).unwrap();
        assert!(p.next().is_ok());
    }

    #[test]
    fn abort_unblocks_a_concurrent_wait() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut p = Poller::open().unwrap();
        p.deposit(a.as_raw_fd(), Interest::input()).unwrap();
        p.abort();
        let err = p.wait(Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn flush_marks_every_watched_handle_ready() {
        let (a, _b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        let mut p = Poller::open().unwrap();
        p.deposit(a.as_raw_fd(), Interest::input()).unwrap();
        p.deposit(c.as_raw_fd(), Interest::input()).unwrap();
        p.flush();
        assert!(p.next().is_ok());
        assert!(p.next().is_ok());
        assert!(p.next().is_err());
    }
}
