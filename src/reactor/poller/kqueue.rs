use super::{Interest, PollEvent, Readiness};

use libc::{EV_ADD, EV_DELETE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE, kevent, kqueue};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

pub(crate) struct KqueuePoller {
    kqueue: OwnedFd,
    events: Vec<kevent>,
}

fn change(fd: RawFd, filter: i16, flags: u16, token: usize) -> kevent {
    kevent {
        ident: fd as usize,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: token as *mut _,
    }
}

impl KqueuePoller {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let fd = unsafe { kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            kqueue: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![change(0, 0, 0, 0); capacity.max(1)],
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.reregister(fd, token, interest)
    }

    /// Adds the filters in `interest` and deletes the others.
    pub(crate) fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let read = if interest.read { EV_ADD | EV_ENABLE } else { EV_DELETE };
        let write = if interest.write { EV_ADD | EV_ENABLE } else { EV_DELETE };

        self.apply(&[change(fd, EVFILT_READ, read, token)], !interest.read)?;
        self.apply(&[change(fd, EVFILT_WRITE, write, token)], !interest.write)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.apply(&[change(fd, EVFILT_READ, EV_DELETE, 0)], true)?;
        self.apply(&[change(fd, EVFILT_WRITE, EV_DELETE, 0)], true)
    }

    fn apply(&self, changes: &[kevent], missing_ok: bool) -> io::Result<()> {
        let rc = unsafe {
            kevent(
                self.kqueue.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            let error = io::Error::last_os_error();
            if missing_ok && error.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(error);
        }
        Ok(())
    }

    pub(crate) fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        let ts = timeout.map(|duration| libc::timespec {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_nsec: duration.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |ts| ts as *const libc::timespec);

        let n = unsafe {
            kevent(
                self.kqueue.as_raw_fd(),
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                ts_ptr,
            )
        };
        if n < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(error);
        }

        for event in &self.events[..n as usize] {
            let hangup = event.flags & (EV_EOF | EV_ERROR) != 0;
            out.push(PollEvent {
                token: event.udata as usize,
                readiness: Readiness {
                    readable: event.filter == EVFILT_READ,
                    writable: event.filter == EVFILT_WRITE,
                    hangup,
                },
            });
        }

        Ok(n as usize)
    }
}
