//! Sockets
//!
//! A socket multiplexes POSIX readiness into named network event bits
//! (READ, WRITE, OOB, ACCEPT, CONNECT, CLOSE). Clients select a mask and
//! bind either an event object or a window message; pending bits are
//! signaled through whichever is bound, messages in a fixed priority order
//! so a CONNECT is never seen after the READ it enabled. Peer shutdown on
//! stream sockets is synthesized from a zero-byte peek, since not every
//! host reports POLLHUP for a half-closed pair.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use bitflags::bitflags;
use nix::errno::Errno;

use crate::access::AccessMask;
use crate::access::OpenOptions;
use crate::async_io::Async;
use crate::async_io::AsyncQueue;
use crate::async_io::AsyncType;
use crate::fd::default_fd_queue_async;
use crate::fd::Fd;
use crate::fd::FdOps;
use crate::fd::FdType;
use crate::object::KObject;
use crate::object::ObjectHeader;
use crate::object::ObjRef;
use crate::poll::PollEvents;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;
use crate::sync::Event;
use crate::wait::wake_up;
use crate::wait::WaitQueueEntry;

pub const FD_MAX_EVENTS: usize = 6;
const FD_READ_BIT: usize = 0;
const FD_WRITE_BIT: usize = 1;
const FD_OOB_BIT: usize = 2;
const FD_ACCEPT_BIT: usize = 3;
const FD_CONNECT_BIT: usize = 4;
const FD_CLOSE_BIT: usize = 5;

bitflags! {
    /// Network event bits plus the internal state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SockEvents: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const OOB = 0x0004;
        const ACCEPT = 0x0008;
        const CONNECT = 0x0010;
        const CLOSE = 0x0020;
        // internal state bits, never reported to clients
        const LISTENING = 0x1000_0000;
        const NONBLOCKING = 0x2000_0000;
        const CONNECTED = 0x4000_0000;
    }
}

impl SockEvents {
    fn bit(index: usize) -> SockEvents {
        SockEvents::from_bits_truncate(1 << index)
    }
}

/// Delivery order when several bits are pending at once.
const EVENT_BITORDER: [usize; FD_MAX_EVENTS] = [
    FD_CONNECT_BIT,
    FD_ACCEPT_BIT,
    FD_OOB_BIT,
    FD_WRITE_BIT,
    FD_READ_BIT,
    FD_CLOSE_BIT,
];

bitflags! {
    /// Socket creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SockFlags: u32 {
        const OVERLAPPED = 0x01;
    }
}

/// A message queued for the bound window. Window delivery itself lives
/// outside this core; the record carries everything the poster needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockMessage {
    pub window: u32,
    pub message: u32,
    pub wparam: u64,
    pub event: SockEvents,
    pub error: i32,
}

pub struct Sock {
    header: ObjectHeader,
    fd: RefCell<Option<Rc<Fd>>>,
    state: Cell<SockEvents>,
    mask: Cell<SockEvents>,
    /// Held (already reported, not yet re-enabled) events.
    hmask: Cell<SockEvents>,
    /// Pending events not yet delivered.
    pmask: Cell<SockEvents>,
    flags: SockFlags,
    family: i32,
    sock_type: i32,
    proto: i32,
    polling: Cell<bool>,
    errors: [Cell<i32>; FD_MAX_EVENTS],
    event: RefCell<Option<Rc<Event>>>,
    window: Cell<u32>,
    message: Cell<u32>,
    wparam: Cell<u64>,
    posted: RefCell<VecDeque<SockMessage>>,
    deferred: RefCell<Option<Rc<Sock>>>,
    ifchange_q: RefCell<Option<Rc<AsyncQueue>>>,
}

impl fmt::Debug for Sock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sock(state={:?}, mask={:?}, pending={:?}, held={:?})",
            self.state.get(),
            self.mask.get(),
            self.pmask.get(),
            self.hmask.get()
        )
    }
}

impl Sock {
    fn alloc(family: i32, sock_type: i32, proto: i32, flags: SockFlags) -> Rc<Sock> {
        Rc::new(Sock {
            header: ObjectHeader::new(),
            fd: RefCell::new(None),
            state: Cell::new(SockEvents::empty()),
            mask: Cell::new(SockEvents::empty()),
            hmask: Cell::new(SockEvents::empty()),
            pmask: Cell::new(SockEvents::empty()),
            flags,
            family,
            sock_type,
            proto,
            polling: Cell::new(false),
            errors: Default::default(),
            event: RefCell::new(None),
            window: Cell::new(0),
            message: Cell::new(0),
            wparam: Cell::new(0),
            posted: RefCell::new(VecDeque::new()),
            deferred: RefCell::new(None),
            ifchange_q: RefCell::new(None),
        })
    }

    /// Create a socket of the given family/type/protocol.
    pub fn create(
        server: &Rc<Server>,
        family: i32,
        sock_type: i32,
        proto: i32,
        flags: SockFlags,
    ) -> SvResult<Rc<Sock>> {
        let unix_fd = unsafe { libc::socket(family, sock_type | libc::SOCK_CLOEXEC, proto) };
        if unix_fd == -1 {
            return Err(Status::from_sock_errno(Errno::last()));
        }
        unsafe {
            let fl = libc::fcntl(unix_fd, libc::F_GETFL);
            libc::fcntl(unix_fd, libc::F_SETFL, fl | libc::O_NONBLOCK);
        }
        let sock = Sock::alloc(family, sock_type, proto, flags);
        if sock_type == libc::SOCK_DGRAM || sock_type == libc::SOCK_RAW {
            // connectionless sockets are ready for data straight away
            sock.state.set(SockEvents::READ | SockEvents::WRITE);
        }
        let fd = Fd::create_anonymous(server, unix_fd, &sock, OpenOptions::empty());
        *sock.fd.borrow_mut() = Some(fd);
        Ok(sock)
    }

    /// Wrap an accepted or pre-existing unix socket fd.
    pub fn create_for_unix_fd(
        server: &Rc<Server>,
        unix_fd: libc::c_int,
        family: i32,
        sock_type: i32,
        proto: i32,
        flags: SockFlags,
    ) -> Rc<Sock> {
        let sock = Sock::alloc(family, sock_type, proto, flags);
        sock.state
            .set(SockEvents::CONNECTED | SockEvents::READ | SockEvents::WRITE);
        let fd = Fd::create_anonymous(server, unix_fd, &sock, OpenOptions::empty());
        *sock.fd.borrow_mut() = Some(fd);
        sock
    }

    pub fn fd(&self) -> SvResult<Rc<Fd>> {
        self.fd.borrow().clone().ok_or(Status::OBJECT_TYPE_MISMATCH)
    }

    pub fn state(&self) -> SockEvents {
        self.state.get()
    }

    pub fn pending_events(&self) -> SockEvents {
        self.pmask.get()
    }

    pub fn event_error(&self, bit_mask: SockEvents) -> i32 {
        for (index, slot) in self.errors.iter().enumerate() {
            if bit_mask.contains(SockEvents::bit(index)) {
                return slot.get();
            }
        }
        0
    }

    /// Bind the socket to a sockaddr blob.
    pub fn bind(&self, addr: &[u8]) -> SvResult<()> {
        let unix_fd = self.fd()?.unix_fd()?;
        let res = unsafe {
            libc::bind(unix_fd, addr.as_ptr().cast(), addr.len() as libc::socklen_t)
        };
        if res == -1 {
            return Err(Status::from_sock_errno(Errno::last()));
        }
        Ok(())
    }

    /// Start listening; readiness then reports ACCEPT.
    pub fn listen(self: &Rc<Self>, server: &Server, backlog: i32) -> SvResult<()> {
        let unix_fd = self.fd()?.unix_fd()?;
        if unsafe { libc::listen(unix_fd, backlog) } == -1 {
            return Err(Status::from_sock_errno(Errno::last()));
        }
        self.state.set(self.state.get() | SockEvents::LISTENING);
        self.reselect(server);
        Ok(())
    }

    /// Start a nonblocking connect; completion arrives as a CONNECT event.
    pub fn connect(self: &Rc<Self>, server: &Server, addr: &[u8]) -> SvResult<Status> {
        let unix_fd = self.fd()?.unix_fd()?;
        let res = unsafe {
            libc::connect(unix_fd, addr.as_ptr().cast(), addr.len() as libc::socklen_t)
        };
        if res == 0 {
            self.state.set(
                self.state.get() | SockEvents::CONNECTED | SockEvents::READ | SockEvents::WRITE,
            );
            self.reselect(server);
            return Ok(Status::SUCCESS);
        }
        match Errno::last() {
            Errno::EINPROGRESS | Errno::EALREADY => {
                self.state.set(self.state.get() | SockEvents::CONNECT);
                self.reselect(server);
                Ok(Status::PENDING)
            }
            err => Err(Status::from_sock_errno(err)),
        }
    }

    /// `WSAEventSelect`: choose the reported events and the event object
    /// signaled when one fires.
    pub fn event_select(
        self: &Rc<Self>,
        server: &Server,
        mask: SockEvents,
        event: Option<Rc<Event>>,
    ) {
        self.mask.set(mask);
        self.hmask.set(SockEvents::empty());
        *self.event.borrow_mut() = event;
        self.reselect(server);
    }

    /// `WSAAsyncSelect`: report events as messages posted to a window.
    pub fn message_select(
        self: &Rc<Self>,
        server: &Server,
        mask: SockEvents,
        window: u32,
        message: u32,
        wparam: u64,
    ) {
        self.mask.set(mask);
        self.hmask.set(SockEvents::empty());
        self.window.set(window);
        self.message.set(message);
        self.wparam.set(wparam);
        self.reselect(server);
    }

    /// Re-enable a held event bit after the client handled it.
    pub fn reenable_events(self: &Rc<Self>, server: &Server, mask: SockEvents) {
        self.hmask.set(self.hmask.get() & !mask);
        self.reselect(server);
    }

    /// Messages posted for the bound window, drained by the caller.
    pub fn take_posted_messages(&self) -> Vec<SockMessage> {
        self.posted.borrow_mut().drain(..).collect()
    }

    /// Park a pre-accepted socket for the next accept on this listener.
    pub fn set_deferred(&self, accepted: Rc<Sock>) {
        *self.deferred.borrow_mut() = Some(accepted);
    }

    /// Accept a connection: hand back the deferred socket if one is
    /// parked, else accept() and wrap the new fd with the listener's
    /// properties.
    pub fn accept(self: &Rc<Self>, server: &Rc<Server>) -> SvResult<Rc<Sock>> {
        let accepted = match self.deferred.borrow_mut().take() {
            Some(deferred) => deferred,
            None => {
                let unix_fd = self.fd()?.unix_fd()?;
                let new_fd = unsafe {
                    libc::accept(unix_fd, std::ptr::null_mut(), std::ptr::null_mut())
                };
                if new_fd == -1 {
                    let err = Errno::last();
                    if err == Errno::EWOULDBLOCK {
                        return Err(Status::DEVICE_NOT_READY);
                    }
                    return Err(Status::from_sock_errno(err));
                }
                let sock = Sock::create_for_unix_fd(
                    server,
                    new_fd,
                    self.family,
                    self.sock_type,
                    self.proto,
                    self.flags,
                );
                // the accepted socket inherits the listener's selection
                sock.mask.set(self.mask.get());
                sock.window.set(self.window.get());
                sock.message.set(self.message.get());
                sock.wparam.set(self.wparam.get());
                *sock.event.borrow_mut() = self.event.borrow().clone();
                sock
            }
        };
        self.pmask.set(self.pmask.get() & !SockEvents::ACCEPT);
        self.hmask.set(self.hmask.get() & !SockEvents::ACCEPT);
        self.reselect(server);
        Ok(accepted)
    }

    /// Accept into a caller-provided socket object, duping the connection
    /// fd into it.
    pub fn accept_into(self: &Rc<Self>, server: &Rc<Server>, target: &Rc<Sock>) -> SvResult<()> {
        let accepted = self.accept(server)?;
        let accepted_fd = accepted.fd()?;
        let new_unix = unsafe { libc::dup(accepted_fd.unix_fd()?) };
        if new_unix == -1 {
            return Err(Status::from_sock_errno(Errno::last()));
        }
        let fd = Fd::create_anonymous(server, new_unix, target, OpenOptions::empty());
        target.state.set(accepted.state.get());
        *target.fd.borrow_mut() = Some(fd);
        Ok(())
    }

    /// The poll events this socket currently needs.
    fn wanted_events(&self, fd: &Fd) -> PollEvents {
        let state = self.state.get();
        if state.contains(SockEvents::CONNECT) {
            // connecting: wait for writability
            return PollEvents::POLLOUT;
        }
        let mask = self.mask.get() & !self.hmask.get();
        let smask = state & mask;
        let mut ev = PollEvents::empty();

        let read_q_queued = fd.existing_queue_nonempty(AsyncType::Read);
        if read_q_queued {
            if fd.queue_waiting(AsyncType::Read) {
                ev |= PollEvents::POLLIN | PollEvents::POLLPRI;
            }
        } else if smask.contains(SockEvents::READ)
            || (state.contains(SockEvents::LISTENING) && mask.contains(SockEvents::ACCEPT))
        {
            ev |= PollEvents::POLLIN | PollEvents::POLLPRI;
        } else if self.sock_type == libc::SOCK_STREAM
            && state.contains(SockEvents::READ)
            && mask.contains(SockEvents::CLOSE)
            && !self.hmask.get().contains(SockEvents::READ)
        {
            // zero-byte recv() on POLLIN is the FD_CLOSE indication
            ev |= PollEvents::POLLIN;
        }

        if fd.existing_queue_nonempty(AsyncType::Write) {
            if fd.queue_waiting(AsyncType::Write) {
                ev |= PollEvents::POLLOUT;
            }
        } else if smask.contains(SockEvents::WRITE) {
            ev |= PollEvents::POLLOUT;
        }
        ev
    }

    fn reselect(self: &Rc<Self>, _server: &Server) {
        let Ok(fd) = self.fd() else { return };
        let ev = self.wanted_events(&fd);
        if !self.polling.get() {
            // a previously unconnected socket only joins the loop once it
            // has some state to watch
            if (self.state.get() & !SockEvents::NONBLOCKING).is_empty() {
                return;
            }
            self.polling.set(true);
            fd.allow_caching();
        }
        fd.set_fd_events(Some(ev));
    }

    /// Signal the bound event or post window messages for pending bits.
    fn deliver_events(self: &Rc<Self>, server: &Server) {
        let events = self.pmask.get() & self.mask.get();
        if events.is_empty() {
            return;
        }
        if let Some(event) = self.event.borrow().clone() {
            event.set();
        }
        if self.window.get() != 0 {
            for bit_index in EVENT_BITORDER {
                let bit = SockEvents::bit(bit_index);
                if self.pmask.get().contains(bit) {
                    self.posted.borrow_mut().push_back(SockMessage {
                        window: self.window.get(),
                        message: self.message.get(),
                        wparam: self.wparam.get(),
                        event: bit,
                        error: self.errors[bit_index].get(),
                    });
                }
            }
            self.pmask.set(SockEvents::empty());
            self.reselect(server);
        }
    }

    fn dispatch_asyncs(&self, server: &Server, fd: &Rc<Fd>, mut events: PollEvents, error: i32) -> PollEvents {
        if self.flags.contains(SockFlags::OVERLAPPED) {
            if events.intersects(PollEvents::POLLIN | PollEvents::POLLPRI)
                && fd.queue_waiting(AsyncType::Read)
            {
                crate::fd::fd_async_wake_up(server, fd, AsyncType::Read, Status::ALERTED);
                events &= !(PollEvents::POLLIN | PollEvents::POLLPRI);
            }
            if events.contains(PollEvents::POLLOUT) && fd.queue_waiting(AsyncType::Write) {
                crate::fd::fd_async_wake_up(server, fd, AsyncType::Write, Status::ALERTED);
                events &= !PollEvents::POLLOUT;
            }
            if events.intersects(PollEvents::POLLERR | PollEvents::POLLHUP) {
                let status = Status::from_sock_errno(Errno::from_raw(error));
                if !self.state.get().contains(SockEvents::READ) {
                    crate::fd::fd_async_wake_up(server, fd, AsyncType::Read, status);
                }
                if !self.state.get().contains(SockEvents::WRITE) {
                    crate::fd::fd_async_wake_up(server, fd, AsyncType::Write, status);
                }
            }
        }
        events
    }

    fn dispatch_events(
        self: &Rc<Self>,
        server: &Server,
        prevstate: SockEvents,
        events: PollEvents,
        error: i32,
    ) {
        let mut pmask = self.pmask.get();
        let mut hmask = self.hmask.get();
        if prevstate.contains(SockEvents::CONNECT) {
            pmask |= SockEvents::CONNECT;
            hmask |= SockEvents::CONNECT;
            self.errors[FD_CONNECT_BIT].set(error);
        } else if prevstate.contains(SockEvents::LISTENING) {
            pmask |= SockEvents::ACCEPT;
            hmask |= SockEvents::ACCEPT;
            self.errors[FD_ACCEPT_BIT].set(error);
        } else {
            if events.contains(PollEvents::POLLIN) {
                pmask |= SockEvents::READ;
                hmask |= SockEvents::READ;
                self.errors[FD_READ_BIT].set(0);
            }
            if events.contains(PollEvents::POLLOUT) {
                pmask |= SockEvents::WRITE;
                hmask |= SockEvents::WRITE;
                self.errors[FD_WRITE_BIT].set(0);
            }
            if events.contains(PollEvents::POLLPRI) {
                pmask |= SockEvents::OOB;
                hmask |= SockEvents::OOB;
                self.errors[FD_OOB_BIT].set(0);
            }
            if events.intersects(PollEvents::POLLERR | PollEvents::POLLHUP) {
                pmask |= SockEvents::CLOSE;
                hmask |= SockEvents::CLOSE;
                self.errors[FD_CLOSE_BIT].set(error);
            }
        }
        self.pmask.set(pmask);
        self.hmask.set(hmask);
        self.deliver_events(server);
    }

    fn socket_error(&self, fd: &Fd) -> i32 {
        let Ok(unix_fd) = fd.unix_fd() else { return 0 };
        let mut optval: libc::c_int = 0;
        let mut optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        unsafe {
            libc::getsockopt(
                unix_fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&mut optval as *mut libc::c_int).cast(),
                &mut optlen,
            );
        }
        optval
    }
}

impl KObject for Sock {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "Socket"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header.enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, _entry: &WaitQueueEntry) -> bool {
        let Ok(fd) = self.fd() else { return false };
        !fd.check_events(self.wanted_events(&fd)).is_empty()
    }

    fn get_fd(&self) -> SvResult<Rc<Fd>> {
        self.fd()
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_file()
    }
}

impl FdOps for Sock {
    fn get_poll_events(&self, fd: &Fd) -> PollEvents {
        self.wanted_events(fd)
    }

    fn poll_event(&self, server: &Server, fd: &Rc<Fd>, mut events: PollEvents) {
        let this = crate::namespace::rc_downcast::<Sock>(
            &fd.user_object().expect("socket fd has a user"),
        )
        .expect("socket fd user is a Sock");
        let prevstate = this.state.get();
        let mut error = 0;
        let mut hangup_seen = false;

        // on errors, leave the main loop before we mutate events
        if events.intersects(PollEvents::POLLERR | PollEvents::POLLHUP) {
            fd.set_fd_events(None);
        }

        let state = this.state.get();
        if state.contains(SockEvents::CONNECT) {
            if events.intersects(PollEvents::POLLERR | PollEvents::POLLHUP) {
                // the connect failed
                this.state.set(state & !SockEvents::CONNECT);
                events &= !PollEvents::POLLOUT;
                error = this.socket_error(fd);
            } else if events.contains(PollEvents::POLLOUT) {
                this.state.set(
                    (state & !SockEvents::CONNECT)
                        | SockEvents::CONNECTED
                        | SockEvents::READ
                        | SockEvents::WRITE,
                );
            }
        } else if state.contains(SockEvents::LISTENING) {
            if events.intersects(PollEvents::POLLERR | PollEvents::POLLHUP) {
                error = this.socket_error(fd);
            }
        } else {
            // normal data flow
            if this.sock_type == libc::SOCK_STREAM && events.contains(PollEvents::POLLIN) {
                let mut dummy = 0u8;
                let unix_fd = fd.raw_unix_fd();
                let nr = unsafe {
                    libc::recv(unix_fd, (&mut dummy as *mut u8).cast(), 1, libc::MSG_PEEK)
                };
                if nr == 0 {
                    // a half-closed peer does not always show up as POLLHUP
                    hangup_seen = true;
                    events &= !PollEvents::POLLIN;
                } else if nr < 0 {
                    events &= !PollEvents::POLLIN;
                    // EAGAIN can happen when an async recv lands between
                    // poll() and this callback
                    if Errno::last() != Errno::EAGAIN {
                        error = Errno::last() as i32;
                        events |= PollEvents::POLLERR;
                    }
                }
            }
            if (hangup_seen || events.intersects(PollEvents::POLLHUP | PollEvents::POLLERR))
                && this.state.get().intersects(SockEvents::READ | SockEvents::WRITE)
            {
                if error == 0 {
                    error = this.socket_error(fd);
                }
                let mut state = this.state.get();
                if events.contains(PollEvents::POLLERR) || events.contains(PollEvents::POLLHUP) {
                    state &= !SockEvents::WRITE;
                }
                state &= !SockEvents::READ;
                this.state.set(state);
            }
            if hangup_seen {
                events |= PollEvents::POLLHUP;
            }
        }

        let events = this.dispatch_asyncs(server, fd, events, error);
        this.dispatch_events(server, prevstate, events, error);

        let obj: ObjRef = this.clone();
        wake_up(&obj, 0);

        this.reselect(server);
    }

    fn fd_type(&self, _fd: &Fd) -> FdType {
        FdType::Socket
    }

    fn queue_async(
        &self,
        server: &Server,
        fd: &Rc<Fd>,
        async_op: &Rc<Async>,
        ty: AsyncType,
        _count: i32,
    ) -> SvResult<Status> {
        let result = default_fd_queue_async(server, fd, async_op, ty);
        if let Some(this) = crate::namespace::rc_downcast::<Sock>(
            &fd.user_object().ok_or(Status::OBJECT_TYPE_MISMATCH)?,
        ) {
            this.reselect(server);
        }
        result
    }

    fn reselect_async(&self, server: &Server, fd: &Rc<Fd>, _queue: &Rc<AsyncQueue>) {
        if let Some(this) = crate::namespace::rc_downcast::<Sock>(
            &fd.user_object().expect("socket fd has a user"),
        ) {
            this.reselect(server);
        }
    }
}

/* interface change notifications */

/// The shared netlink listener fanning interface changes out to every
/// subscribed socket.
#[derive(Debug)]
struct IfChangeSource {
    header: ObjectHeader,
    subscribers: RefCell<Vec<Weak<Sock>>>,
}

impl KObject for IfChangeSource {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "IfChange"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl FdOps for IfChangeSource {
    fn get_poll_events(&self, _fd: &Fd) -> PollEvents {
        PollEvents::POLLIN
    }

    fn poll_event(&self, server: &Server, fd: &Rc<Fd>, _events: PollEvents) {
        // drain the netlink message and wake every subscriber
        let Ok(unix_fd) = fd.unix_fd() else { return };
        let mut buffer = [0u8; 4096];
        unsafe { libc::recv(unix_fd, buffer.as_mut_ptr().cast(), buffer.len(), 0) };
        let mut subs = self.subscribers.borrow_mut();
        subs.retain(|weak| weak.strong_count() > 0);
        for sock in subs.iter().filter_map(Weak::upgrade) {
            if let Some(queue) = sock.ifchange_q.borrow().clone() {
                queue.wake_up(server, Status::SUCCESS);
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn create_ifchange_fd(server: &Rc<Server>) -> SvResult<(Rc<Fd>, Rc<IfChangeSource>)> {
    let unix_fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            libc::NETLINK_ROUTE,
        )
    };
    if unix_fd == -1 {
        return Err(Status::from_sock_errno(Errno::last()));
    }
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = (libc::RTMGRP_IPV4_IFADDR | libc::RTMGRP_IPV4_ROUTE) as u32;
    let res = unsafe {
        libc::bind(
            unix_fd,
            (&addr as *const libc::sockaddr_nl).cast(),
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if res == -1 {
        let err = Errno::last();
        unsafe { libc::close(unix_fd) };
        return Err(Status::from_sock_errno(err));
    }
    let source = Rc::new(IfChangeSource {
        header: ObjectHeader::new(),
        subscribers: RefCell::new(Vec::new()),
    });
    let fd = Fd::create_anonymous(server, unix_fd, &source, OpenOptions::empty());
    fd.set_fd_events(Some(PollEvents::POLLIN));
    Ok((fd, source))
}

#[cfg(not(target_os = "linux"))]
fn create_ifchange_fd(_server: &Rc<Server>) -> SvResult<(Rc<Fd>, Rc<IfChangeSource>)> {
    Err(Status::NOT_SUPPORTED)
}

/// Subscribe a socket to interface-change notifications; the async
/// completes on the next change.
pub fn sock_ifchange_wait(
    server: &Rc<Server>,
    sock: &Rc<Sock>,
    async_op: &Rc<Async>,
) -> SvResult<Status> {
    // one netlink socket serves the whole server
    let slot = server.ifchange_slot();
    let source = {
        let current = slot.borrow().clone();
        match current {
            Some(obj) => crate::namespace::rc_downcast::<IfChangeSource>(&obj)
                .ok_or(Status::NOT_SUPPORTED)?,
            None => {
                let (fd, source) = create_ifchange_fd(server)?;
                // the fd must stay registered for the server's lifetime
                server.make_static(Rc::new(IfChangeFdHolder {
                    header: ObjectHeader::new(),
                    _fd: fd,
                }));
                *slot.borrow_mut() = Some(source.clone());
                source
            }
        }
    };
    source.subscribers.borrow_mut().push(Rc::downgrade(sock));
    let queue = {
        let mut q = sock.ifchange_q.borrow_mut();
        match &*q {
            Some(queue) => queue.clone(),
            None => {
                let queue = AsyncQueue::new();
                *q = Some(queue.clone());
                queue
            }
        }
    };
    queue.queue(async_op);
    Ok(Status::PENDING)
}

/// Keeps the shared netlink fd alive in the server's static list.
#[derive(Debug)]
struct IfChangeFdHolder {
    header: ObjectHeader,
    _fd: Rc<Fd>,
}

impl KObject for IfChangeFdHolder {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "IfChangeFdHolder"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump(server: &Rc<Server>) {
        for _ in 0..4 {
            let ready = server.poller().wait(100);
            if ready.is_empty() {
                break;
            }
            for (fd, events) in ready {
                if let Some(ops) = fd.ops() {
                    ops.poll_event(server, &fd, events);
                }
            }
        }
    }

    fn unix_stream_pair(server: &Rc<Server>) -> (Rc<Sock>, libc::c_int) {
        let mut fds = [0 as libc::c_int; 2];
        let res = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(res, 0);
        let sock = Sock::create_for_unix_fd(
            server,
            fds[0],
            libc::AF_UNIX,
            libc::SOCK_STREAM,
            0,
            SockFlags::empty(),
        );
        (sock, fds[1])
    }

    #[test]
    fn udp_socket_is_ready_immediately() {
        let server = Server::new_for_tests();
        let sock = Sock::create(
            &server,
            libc::AF_INET,
            libc::SOCK_DGRAM,
            0,
            SockFlags::empty(),
        )
        .unwrap();
        assert!(sock.state().contains(SockEvents::READ | SockEvents::WRITE));
    }

    #[test]
    fn read_event_fires_and_is_held() {
        let server = Server::new_for_tests();
        let (sock, peer) = unix_stream_pair(&server);
        sock.event_select(&server, SockEvents::READ | SockEvents::CLOSE, None);

        assert_eq!(unsafe { libc::write(peer, b"hi".as_ptr().cast(), 2) }, 2);
        pump(&server);
        assert!(sock.pending_events().contains(SockEvents::READ));
        // held events are not re-polled until reenabled
        assert!(!sock.wanted_events(&sock.fd().unwrap()).contains(PollEvents::POLLIN));
        sock.reenable_events(&server, SockEvents::READ);
        assert!(sock.wanted_events(&sock.fd().unwrap()).contains(PollEvents::POLLIN));
        unsafe { libc::close(peer) };
    }

    #[test]
    fn close_event_from_zero_byte_peek() {
        let server = Server::new_for_tests();
        let (sock, peer) = unix_stream_pair(&server);
        sock.event_select(&server, SockEvents::READ | SockEvents::CLOSE, None);
        unsafe { libc::close(peer) };
        pump(&server);
        assert!(
            sock.pending_events().contains(SockEvents::CLOSE),
            "state: {sock:?}"
        );
        // the data directions were torn down
        assert!(!sock.state().contains(SockEvents::READ));
    }

    #[test]
    fn event_object_is_signaled_on_event() {
        let server = Server::new_for_tests();
        let (sock, peer) = unix_stream_pair(&server);
        let event = Event::create(&server, None, "", crate::access::Attributes::empty(), true, false)
            .unwrap()
            .obj;
        sock.event_select(&server, SockEvents::READ, Some(event.clone()));
        assert_eq!(unsafe { libc::write(peer, b"x".as_ptr().cast(), 1) }, 1);
        pump(&server);
        assert!(event.is_set());
        unsafe { libc::close(peer) };
    }

    #[test]
    fn listener_reports_accept_and_accepts() {
        let server = Server::new_for_tests();
        let listener = Sock::create(
            &server,
            libc::AF_INET,
            libc::SOCK_STREAM,
            0,
            SockFlags::empty(),
        )
        .unwrap();

        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = u32::from_be_bytes([127, 0, 0, 1]).to_be();
        addr.sin_port = 0;
        let addr_bytes = unsafe {
            std::slice::from_raw_parts(
                (&addr as *const libc::sockaddr_in).cast::<u8>(),
                std::mem::size_of::<libc::sockaddr_in>(),
            )
        };
        listener.bind(addr_bytes).unwrap();
        listener.listen(&server, 8).unwrap();
        listener.event_select(&server, SockEvents::ACCEPT, None);

        // find the bound port and connect from outside
        let unix_fd = listener.fd().unwrap().unix_fd().unwrap();
        let mut bound: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        unsafe {
            libc::getsockname(unix_fd, (&mut bound as *mut libc::sockaddr_in).cast(), &mut len)
        };
        let port = u16::from_be(bound.sin_port);
        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();

        pump(&server);
        assert!(listener.pending_events().contains(SockEvents::ACCEPT));

        let accepted = listener.accept(&server).unwrap();
        assert!(accepted.state().contains(SockEvents::CONNECTED));
        assert!(!listener.pending_events().contains(SockEvents::ACCEPT));
    }

    #[test]
    fn deferred_accept_is_handed_out_first() {
        let server = Server::new_for_tests();
        let listener = Sock::create(
            &server,
            libc::AF_INET,
            libc::SOCK_STREAM,
            0,
            SockFlags::empty(),
        )
        .unwrap();
        let parked = Sock::create(
            &server,
            libc::AF_INET,
            libc::SOCK_STREAM,
            0,
            SockFlags::empty(),
        )
        .unwrap();
        listener.set_deferred(parked.clone());
        let accepted = listener.accept(&server).unwrap();
        assert!(Rc::ptr_eq(&accepted, &parked));
    }

    #[test]
    fn window_messages_follow_priority_order() {
        let server = Server::new_for_tests();
        let (sock, peer) = unix_stream_pair(&server);
        sock.message_select(
            &server,
            SockEvents::READ | SockEvents::WRITE | SockEvents::CLOSE,
            0x1234,
            0x400,
            7,
        );
        assert_eq!(unsafe { libc::write(peer, b"z".as_ptr().cast(), 1) }, 1);
        pump(&server);
        let posted = sock.take_posted_messages();
        assert!(!posted.is_empty());
        // WRITE outranks READ in the fixed delivery order
        let write_pos = posted.iter().position(|m| m.event == SockEvents::WRITE);
        let read_pos = posted.iter().position(|m| m.event == SockEvents::READ);
        if let (Some(w), Some(r)) = (write_pos, read_pos) {
            assert!(w < r);
        }
        for message in &posted {
            assert_eq!(message.window, 0x1234);
            assert_eq!(message.message, 0x400);
            assert_eq!(message.wparam, 7);
        }
        unsafe { libc::close(peer) };
    }
}
