//! Linux OS event facility
//!
//! Thin owners around epoll, eventfd and timerfd. Each worker holds one
//! `Poller`, one `EventFd` (the post event) and one `TimerFd` (the timer
//! tick). All fds are created `CLOEXEC | NONBLOCK` and closed on drop.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Readiness directions to register for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
    pub const BOTH: Interest = Interest { readable: true, writable: true };

    fn to_epoll(self) -> u32 {
        // Edge-triggered: handlers drain until EAGAIN.
        let mut ev = libc::EPOLLET as u32;
        if self.readable {
            ev |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if self.writable {
            ev |= libc::EPOLLOUT as u32;
        }
        ev
    }
}

/// One readiness notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
}

/// epoll instance
pub struct Poller {
    fd: RawFd,
    buf: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new(capacity: usize) -> EngineResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(EngineError::last_os("epoll_create1"));
        }
        Ok(Self {
            fd,
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
        })
    }

    pub fn add(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    pub fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: interest.to_epoll(), u64: token };
        let ret = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for readiness. `None` blocks indefinitely. Interrupted waits
    /// return no events.
    pub fn wait(&mut self, out: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        out.clear();
        let ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
        };
        let n = unsafe {
            libc::epoll_wait(self.fd, self.buf.as_mut_ptr(), self.buf.len() as libc::c_int, ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for ev in &self.buf[..n as usize] {
            let bits = ev.events;
            let token = ev.u64;
            let hup = bits & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;
            out.push(Event {
                token,
                readable: hup || bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0,
                writable: hup || bits & libc::EPOLLOUT as u32 != 0,
            });
        }
        Ok(n as usize)
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// eventfd used to wake a worker from another thread.
///
/// Multiple `notify()` calls before the worker reads coalesce into one
/// wakeup.
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> EngineResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(EngineError::last_os("eventfd"));
        }
        Ok(Self { fd })
    }

    pub fn notify(&self) -> io::Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, std::mem::size_of::<u64>())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: a wakeup is already pending.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Reset the counter, returning how many notifications it held
    pub fn drain(&self) -> u64 {
        read_u64(self.fd).unwrap_or(0)
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Monotonic timerfd used as the timer queue's tick source
pub struct TimerFd {
    fd: RawFd,
    armed: bool,
}

impl TimerFd {
    pub fn new() -> EngineResult<Self> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(EngineError::last_os("timerfd_create"));
        }
        Ok(Self { fd, armed: false })
    }

    /// Fire every `period`, starting one period from now
    pub fn arm_periodic(&mut self, period: Duration) -> io::Result<()> {
        let ts = timespec(period);
        self.settime(libc::itimerspec { it_interval: ts, it_value: ts })?;
        self.armed = true;
        Ok(())
    }

    pub fn disarm(&mut self) -> io::Result<()> {
        let zero = timespec(Duration::ZERO);
        self.settime(libc::itimerspec { it_interval: zero, it_value: zero })?;
        self.armed = false;
        Ok(())
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Consume pending expirations, returning their count
    pub fn drain(&self) -> u64 {
        read_u64(self.fd).unwrap_or(0)
    }

    fn settime(&self, spec: libc::itimerspec) -> io::Result<()> {
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

fn read_u64(fd: RawFd) -> io::Result<u64> {
    let mut val: u64 = 0;
    let ret = unsafe {
        libc::read(fd, &mut val as *mut u64 as *mut libc::c_void, std::mem::size_of::<u64>())
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventfd_coalesces() {
        let efd = EventFd::new().unwrap();
        efd.notify().unwrap();
        efd.notify().unwrap();
        assert_eq!(efd.drain(), 2);
        assert_eq!(efd.drain(), 0);
    }

    #[test]
    fn test_poller_sees_eventfd() {
        let mut poller = Poller::new(8).unwrap();
        let efd = EventFd::new().unwrap();
        poller.add(efd.as_raw_fd(), 42, Interest::READABLE).unwrap();

        let mut events = Vec::new();
        assert_eq!(poller.wait(&mut events, Some(Duration::ZERO)).unwrap(), 0);

        efd.notify().unwrap();
        let n = poller.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].token, 42);
        assert!(events[0].readable);
    }

    #[test]
    fn test_timerfd_ticks() {
        let mut poller = Poller::new(4).unwrap();
        let mut tfd = TimerFd::new().unwrap();
        poller.add(tfd.as_raw_fd(), 7, Interest::READABLE).unwrap();
        tfd.arm_periodic(Duration::from_millis(1)).unwrap();
        assert!(tfd.is_armed());

        let mut events = Vec::new();
        poller.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events[0].token, 7);
        assert!(tfd.drain() >= 1);

        tfd.disarm().unwrap();
        assert!(!tfd.is_armed());
    }
}
