//! Poll multiplexer
//!
//! Backend-agnostic registration of unix fds with level-triggered readiness
//! dispatch. The epoll backend is used when available; the plain poll()
//! backend is both the fallback and the permanent downgrade target when
//! epoll_ctl reports ENOMEM. Slot state is maintained for both backends at
//! all times so the downgrade is seamless.

use std::cell::Cell;
use std::cell::RefCell;
use std::fmt::Display;
use std::fmt::Formatter;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::rc::Weak;

use bitflags::bitflags;

use crate::fd::Fd;

bitflags! {
    /// Readiness bits, identical between poll() and epoll.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollEvents: u32 {
        /// There is data to read.
        const POLLIN = libc::POLLIN as u32;
        /// Exceptional condition (OOB data).
        const POLLPRI = libc::POLLPRI as u32;
        /// Writing is now possible.
        const POLLOUT = libc::POLLOUT as u32;
        /// Error condition.
        const POLLERR = libc::POLLERR as u32;
        /// Hang up.
        const POLLHUP = libc::POLLHUP as u32;
        /// Invalid request: fd not open.
        const POLLNVAL = libc::POLLNVAL as u32;
    }
}

impl Display for PollEvents {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.bits(), f)
    }
}

struct Slot {
    user: Weak<Fd>,
    unix_fd: RawFd,
    events: PollEvents,
    /// Once polling stops completely (error paths), it never restarts for
    /// this registration.
    stopped: bool,
}

/// The fd readiness multiplexer.
pub struct Poller {
    slots: RefCell<Vec<Option<Slot>>>,
    freelist: RefCell<Vec<usize>>,
    active: Cell<usize>,
    epoll_fd: Cell<RawFd>,
}

impl Default for Poller {
    fn default() -> Self {
        Poller::new()
    }
}

impl Poller {
    pub fn new() -> Poller {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            log::info!("epoll unavailable, using poll backend");
        }
        Poller {
            slots: RefCell::new(Vec::new()),
            freelist: RefCell::new(Vec::new()),
            active: Cell::new(0),
            epoll_fd: Cell::new(epoll_fd),
        }
    }

    /// Number of registered fds. The main loop exits when it drops to zero.
    pub fn active_count(&self) -> usize {
        self.active.get()
    }

    /// Register an fd and return its slot index.
    pub fn add_user(&self, fd: &Rc<Fd>) -> usize {
        let slot = Slot {
            user: Rc::downgrade(fd),
            unix_fd: -1,
            events: PollEvents::empty(),
            stopped: false,
        };
        let index = match self.freelist.borrow_mut().pop() {
            Some(index) => {
                self.slots.borrow_mut()[index] = Some(slot);
                index
            }
            None => {
                let mut slots = self.slots.borrow_mut();
                slots.push(Some(slot));
                slots.len() - 1
            }
        };
        self.active.set(self.active.get() + 1);
        index
    }

    /// Remove a registration.
    pub fn remove_user(&self, index: usize) {
        let removed = self.slots.borrow_mut()[index].take();
        if let Some(slot) = removed {
            if slot.unix_fd != -1 {
                self.epoll_ctl(libc::EPOLL_CTL_DEL, slot.unix_fd, PollEvents::empty(), index);
            }
            self.freelist.borrow_mut().push(index);
            self.active.set(self.active.get() - 1);
        }
    }

    /// Change the events waited for on a slot. `None` stops waiting on the
    /// fd completely; a stopped slot is never restarted.
    pub fn set_events(&self, index: usize, unix_fd: RawFd, events: Option<PollEvents>) {
        let mut slots = self.slots.borrow_mut();
        let Some(slot) = slots.get_mut(index).and_then(Option::as_mut) else {
            return;
        };
        match events {
            None => {
                if slot.unix_fd != -1 {
                    let fd = slot.unix_fd;
                    slot.unix_fd = -1;
                    slot.events = PollEvents::empty();
                    slot.stopped = true;
                    drop(slots);
                    self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, PollEvents::empty(), index);
                } else {
                    slot.stopped = true;
                }
            }
            Some(events) => {
                if slot.stopped {
                    return;
                }
                let op = if slot.unix_fd == -1 {
                    libc::EPOLL_CTL_ADD
                } else if slot.events == events {
                    return;
                } else {
                    libc::EPOLL_CTL_MOD
                };
                slot.unix_fd = unix_fd;
                slot.events = events;
                drop(slots);
                self.epoll_ctl(op, unix_fd, events, index);
            }
        }
    }

    fn epoll_ctl(&self, op: libc::c_int, unix_fd: RawFd, events: PollEvents, index: usize) {
        let epoll_fd = self.epoll_fd.get();
        if epoll_fd == -1 {
            return;
        }
        let mut ev = libc::epoll_event { events: events.bits(), u64: index as u64 };
        if unsafe { libc::epoll_ctl(epoll_fd, op, unix_fd, &mut ev) } == -1 {
            let err = nix::errno::Errno::last();
            if err == nix::errno::Errno::ENOMEM {
                // out of kernel memory: give up on epoll for good, the slot
                // state keeps the poll backend consistent
                log::warn!("epoll_ctl ENOMEM, downgrading to poll backend");
                unsafe { libc::close(epoll_fd) };
                self.epoll_fd.set(-1);
            } else if op != libc::EPOLL_CTL_DEL {
                log::error!("epoll_ctl failed for fd {unix_fd}: {err}");
            }
        }
    }

    /// Wait for readiness and return the ready fds with their events.
    /// `timeout` is in milliseconds, −1 blocks indefinitely.
    pub fn wait(&self, timeout: i32) -> Vec<(Rc<Fd>, PollEvents)> {
        if self.epoll_fd.get() != -1 {
            self.wait_epoll(timeout)
        } else {
            self.wait_poll(timeout)
        }
    }

    fn wait_epoll(&self, timeout: i32) -> Vec<(Rc<Fd>, PollEvents)> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 128];
        let count = unsafe {
            libc::epoll_wait(self.epoll_fd.get(), events.as_mut_ptr(), events.len() as i32, timeout)
        };
        let mut ready = Vec::new();
        if count > 0 {
            let slots = self.slots.borrow();
            for event in &events[..count as usize] {
                let index = event.u64 as usize;
                if let Some(slot) = slots.get(index).and_then(Option::as_ref) {
                    if let Some(fd) = slot.user.upgrade() {
                        ready.push((fd, PollEvents::from_bits_truncate(event.events)));
                    }
                }
            }
        }
        ready
    }

    fn wait_poll(&self, timeout: i32) -> Vec<(Rc<Fd>, PollEvents)> {
        let mut pollfds: Vec<libc::pollfd> = Vec::new();
        let mut indices: Vec<usize> = Vec::new();
        {
            let slots = self.slots.borrow();
            for (index, slot) in slots.iter().enumerate() {
                let Some(slot) = slot else { continue };
                if slot.unix_fd == -1 {
                    continue;
                }
                pollfds.push(libc::pollfd {
                    fd: slot.unix_fd,
                    events: slot.events.bits() as i16,
                    revents: 0,
                });
                indices.push(index);
            }
        }
        let count = unsafe {
            libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout)
        };
        let mut ready = Vec::new();
        if count > 0 {
            let slots = self.slots.borrow();
            for (pollfd, &index) in pollfds.iter().zip(&indices) {
                if pollfd.revents == 0 {
                    continue;
                }
                if let Some(slot) = slots.get(index).and_then(Option::as_ref) {
                    if let Some(fd) = slot.user.upgrade() {
                        ready.push((fd, PollEvents::from_bits_truncate(pollfd.revents as u32)));
                    }
                }
            }
        }
        ready
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let epoll_fd = self.epoll_fd.get();
        if epoll_fd != -1 {
            unsafe { libc::close(epoll_fd) };
        }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Poller({} active, backend={})",
            self.active.get(),
            if self.epoll_fd.get() != -1 { "epoll" } else { "poll" }
        )
    }
}
