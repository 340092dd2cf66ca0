//! Reactor (C3): a single-threaded epoll event loop with cross-thread
//! task submission. Ported from `original_source/include/core/reactor.hpp`'s
//! Linux branch — no `mio` appears anywhere in this dependency family, so
//! the loop talks to epoll/eventfd/timerfd directly through `libc`, already
//! linked for other platform plumbing.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use tracing::warn;

pub type FdCallback = Box<dyn FnMut(RawFd) + Send>;
type Task = Box<dyn FnOnce(&mut ReactorLoop) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(pub u32);
impl EventMask {
    pub const READ: EventMask = EventMask(1);
    pub const WRITE: EventMask = EventMask(2);
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }
}
impl std::ops::BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

/// Handle usable from any thread; the actual fd work happens on the loop
/// thread after a task is drained and a wakeup is posted.
#[derive(Clone)]
pub struct ReactorHandle {
    tasks: Arc<SegQueue<Task>>,
    wakeup_fd: RawFd,
}

impl ReactorHandle {
    fn post(&self, task: Task) {
        self.tasks.push(task);
        self.wakeup();
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.wakeup_fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    pub fn add_fd(&self, fd: RawFd, cb: FdCallback) {
        self.post(Box::new(move |r| r.do_add_fd(fd, Some(cb))));
    }

    pub fn modify_fd(&self, fd: RawFd, mask: EventMask, write_cb: Option<FdCallback>) {
        self.post(Box::new(move |r| r.do_modify_fd(fd, mask, write_cb)));
    }

    /// Registers a periodic `timerfd`-backed timer; used to drive the
    /// timing wheel's `tick()` at a fixed cadence.
    pub fn add_timer(&self, interval_ms: i64, cb: FdCallback) {
        self.post(Box::new(move |r| r.do_add_timer(interval_ms, cb)));
    }

    pub fn remove_fd(&self, fd: RawFd) {
        self.post(Box::new(move |r| r.do_remove_fd(fd)));
    }

    pub fn stop(&self) {
        self.post(Box::new(|r| r.running.store(false, Ordering::SeqCst)));
    }
}

struct ReactorLoop {
    epoll_fd: RawFd,
    wakeup_fd: RawFd,
    running: Arc<AtomicBool>,
    read_callbacks: HashMap<RawFd, FdCallback>,
    write_callbacks: HashMap<RawFd, FdCallback>,
    timer_fds: Vec<RawFd>,
}

pub struct Reactor {
    epoll_fd: RawFd,
    wakeup_fd: RawFd,
    running: Arc<AtomicBool>,
    tasks: Arc<SegQueue<Task>>,
}

impl Reactor {
    pub fn new() -> std::io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            unsafe { libc::close(epoll_fd) };
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            wakeup_fd,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(SegQueue::new()),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            tasks: self.tasks.clone(),
            wakeup_fd: self.wakeup_fd,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Blocks, processing pending tasks before each `epoll_wait`, and
    /// dispatching ready events edge-triggered until `stop()` is called.
    pub fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut inner = ReactorLoop {
            epoll_fd: self.epoll_fd,
            wakeup_fd: self.wakeup_fd,
            running: self.running.clone(),
            read_callbacks: HashMap::new(),
            write_callbacks: HashMap::new(),
            timer_fds: Vec::new(),
        };
        inner.do_add_fd(
            self.wakeup_fd,
            Some(Box::new(|fd| {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                }
            })),
        );

        let mut events: Vec<libc::epoll_event> = vec![unsafe { std::mem::zeroed() }; 256];
        while self.running.load(Ordering::SeqCst) {
            while let Some(task) = self.tasks.pop() {
                task(&mut inner);
            }
            let n = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as i32, 1000)
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %err, "epoll_wait failed");
                continue;
            }
            for event in events.iter().take(n as usize) {
                let fd = event.u64 as RawFd;
                let flags = event.events;
                if flags & (libc::EPOLLIN as u32) != 0 {
                    if let Some(cb) = inner.read_callbacks.get_mut(&fd) {
                        cb(fd);
                    }
                }
                if flags & (libc::EPOLLOUT as u32) != 0 {
                    if let Some(cb) = inner.write_callbacks.get_mut(&fd) {
                        cb(fd);
                    }
                }
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_fd);
            libc::close(self.epoll_fd);
        }
    }
}

impl ReactorLoop {
    fn do_add_fd(&mut self, fd: RawFd, cb: Option<FdCallback>) {
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = (libc::EPOLLIN | libc::EPOLLET) as u32;
        ev.u64 = fd as u64;
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc == -1 {
            warn!(fd, error = %std::io::Error::last_os_error(), "epoll_ctl(ADD) failed");
            return;
        }
        if let Some(cb) = cb {
            self.read_callbacks.insert(fd, cb);
        }
    }

    fn do_modify_fd(&mut self, fd: RawFd, mask: EventMask, write_cb: Option<FdCallback>) {
        let mut events = libc::EPOLLET as u32;
        if mask.contains(EventMask::READ) {
            events |= libc::EPOLLIN as u32;
        }
        if mask.contains(EventMask::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = events;
        ev.u64 = fd as u64;
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                warn!(fd, error = %err, "epoll_ctl(MOD) failed");
            }
            return;
        }
        if mask.contains(EventMask::WRITE) {
            if let Some(cb) = write_cb {
                self.write_callbacks.insert(fd, cb);
            }
        } else {
            self.write_callbacks.remove(&fd);
        }
    }

    fn do_add_timer(&mut self, interval_ms: i64, cb: FdCallback) {
        let tfd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
        if tfd < 0 {
            warn!(error = %std::io::Error::last_os_error(), "timerfd_create failed");
            return;
        }
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: interval_ms / 1000,
                tv_nsec: (interval_ms % 1000) * 1_000_000,
            },
            it_value: libc::timespec {
                tv_sec: interval_ms / 1000,
                tv_nsec: (interval_ms % 1000) * 1_000_000,
            },
        };
        let rc = unsafe { libc::timerfd_settime(tfd, 0, &spec, std::ptr::null_mut()) };
        if rc == -1 {
            warn!(error = %std::io::Error::last_os_error(), "timerfd_settime failed");
            unsafe { libc::close(tfd) };
            return;
        }
        self.timer_fds.push(tfd);
        let mut cb = cb;
        self.do_add_fd(
            tfd,
            Some(Box::new(move |fd| {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                }
                cb(fd);
            })),
        );
    }

    fn do_remove_fd(&mut self, fd: RawFd) {
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if !matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) {
                warn!(fd, error = %err, "epoll_ctl(DEL) failed");
            }
        }
        self.read_callbacks.remove(&fd);
        self.write_callbacks.remove(&fd);
    }
}
