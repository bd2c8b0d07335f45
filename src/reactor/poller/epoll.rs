use super::{Interest, PollEvent, Readiness};

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLPRI, EPOLLRDHUP, c_int, epoll_event,
};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub(crate) struct EpollPoller {
    epoll: OwnedFd,
    events: Vec<epoll_event>,
}

impl EpollPoller {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![epoll_event { events: 0, u64: 0 }; capacity.max(1)],
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, token, interest)
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, token, interest)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(EPOLL_CTL_DEL, fd, 0, Interest::default())
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let mut flags = 0u32;
        if interest.read {
            flags |= (EPOLLIN | EPOLLRDHUP) as u32;
        }
        if interest.write {
            flags |= EPOLLOUT as u32;
        }

        let mut event = epoll_event {
            events: flags,
            u64: token as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits up to `timeout` (forever if `None`) and appends what became ready.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        let timeout_ms: c_int = match timeout {
            None => -1,
            Some(duration) => {
                let ms = duration.as_millis().min(c_int::MAX as u128) as c_int;
                if ms == 0 && !duration.is_zero() { 1 } else { ms }
            }
        };

        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(error);
        }

        for index in 0..n as usize {
            let event = self.events[index];
            let flags = event.events;
            let token = event.u64 as usize;

            out.push(PollEvent {
                token,
                readiness: Readiness {
                    readable: flags & (EPOLLIN | EPOLLPRI) as u32 != 0,
                    writable: flags & EPOLLOUT as u32 != 0,
                    hangup: flags & (EPOLLHUP | EPOLLERR | EPOLLRDHUP) as u32 != 0,
                },
            });
        }

        Ok(n as usize)
    }
}
