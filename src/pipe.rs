//! Named pipes
//!
//! The pipe device (`\Device\NamedPipe`) holds a namespace of pipes; each
//! pipe owns up to `max_instances` server ends. A server end walks the
//! Idle → WaitOpen → Connected → WaitDisconnect/WaitConnect state machine,
//! and a connecting client splits a fresh socketpair with it. Before a
//! connection exists the server end carries a pseudo-fd so ioctls and async
//! listens have somewhere to queue.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use bitflags::bitflags;
use nix::errno::Errno;

use crate::access::AccessMask;
use crate::access::Attributes;
use crate::access::OpenOptions;
use crate::access::ShareMode;
use crate::async_io::Async;
use crate::async_io::AsyncQueue;
use crate::async_io::AsyncType;
use crate::fd::default_fd_queue_async;
use crate::fd::fd_async_wake_up;
use crate::fd::fd_queue_async;
use crate::fd::Fd;
use crate::fd::FdOps;
use crate::fd::FdType;
use crate::namespace::create_named_object;
use crate::namespace::rc_downcast;
use crate::namespace::LookupPath;
use crate::namespace::Namespace;
use crate::object::downcast;
use crate::object::KObject;
use crate::object::ObjRef;
use crate::object::ObjectHeader;
use crate::process::Process;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;
use crate::timeout::TimeoutHandle;
use crate::timeout::TICKS_PER_SEC;
use crate::wait::WaitQueueEntry;

pub const FSCTL_PIPE_DISCONNECT: u32 = 0x0011_0004;
pub const FSCTL_PIPE_LISTEN: u32 = 0x0011_0008;
pub const FSCTL_PIPE_WAIT: u32 = 0x0011_0018;

/// Interval of the flush poll; POSIX offers no notification for "peer has
/// drained its buffer", so the server re-checks on a timer.
const FLUSH_POLL_INTERVAL: i64 = -TICKS_PER_SEC / 10;

bitflags! {
    /// Pipe mode flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipeFlags: u32 {
        const MESSAGE_STREAM_WRITE = 0x0001;
        const MESSAGE_STREAM_READ = 0x0002;
        const NONBLOCKING_MODE = 0x0004;
    }
}

/// Creation parameters of a named pipe.
#[derive(Debug, Clone, Copy)]
pub struct PipeParams {
    pub flags: PipeFlags,
    pub sharing: ShareMode,
    pub max_instances: u32,
    pub in_size: u32,
    pub out_size: u32,
    /// Default `FSCTL_PIPE_WAIT` timeout, relative ticks.
    pub timeout: i64,
}

/// The state machine of one pipe server end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Idle,
    WaitOpen,
    Connected,
    WaitDisconnect,
    WaitConnect,
}

/// The `\Device\NamedPipe` device object.
#[derive(Debug)]
pub struct NamedPipeDevice {
    header: ObjectHeader,
    pipes: Namespace,
}

/// Create and link the named pipe device.
pub fn create_named_pipe_device(server: &Rc<Server>, path: &str) -> SvResult<ObjRef> {
    let result = create_named_object(server, None, path, Attributes::CASE_INSENSITIVE, || {
        Ok(Rc::new(NamedPipeDevice {
            header: ObjectHeader::new(),
            pipes: Namespace::new(37),
        }))
    })?;
    Ok(result.obj)
}

impl KObject for NamedPipeDevice {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "Device"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn namespace(&self) -> Option<&Namespace> {
        Some(&self.pipes)
    }

    fn lookup_name(
        &self,
        _self_ref: &ObjRef,
        path: &mut LookupPath,
        _server: &Server,
    ) -> SvResult<Option<ObjRef>> {
        // pipe names may contain backslashes; the whole residual is the name
        let Some(rest) = path.rest().map(str::to_string) else {
            return Ok(None);
        };
        match self.pipes.find(&rest, path.attrs()) {
            Some(obj) => {
                path.set_rest(None);
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    fn link_name(&self, self_ref: &ObjRef, name: &str, parent: &ObjRef) -> SvResult<()> {
        crate::namespace::directory_link_name(self_ref, name, parent)
    }
}

/// A named pipe: the object clients resolve by name.
pub struct NamedPipe {
    header: ObjectHeader,
    params: Cell<PipeParams>,
    instances: Cell<u32>,
    servers: RefCell<Vec<Weak<PipeServer>>>,
    waiters: RefCell<Option<Rc<AsyncQueue>>>,
}

impl fmt::Debug for NamedPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NamedPipe(instances={}/{})",
            self.instances.get(),
            self.params.get().max_instances
        )
    }
}

impl NamedPipe {
    /// Create a pipe (or a new server instance of an existing one) under
    /// the pipe device. Returns the new server end.
    pub fn create(
        server: &Rc<Server>,
        path: &str,
        attrs: Attributes,
        params: PipeParams,
        options: OpenOptions,
    ) -> SvResult<Rc<PipeServer>> {
        let result = create_named_object(server, None, path, attrs | Attributes::OPEN_IF, || {
            Ok(Rc::new(NamedPipe {
                header: ObjectHeader::new(),
                params: Cell::new(params),
                instances: Cell::new(0),
                servers: RefCell::new(Vec::new()),
                waiters: RefCell::new(None),
            }))
        })?;
        let pipe = result.obj;
        if !result.created {
            let existing = pipe.params.get();
            if pipe.instances.get() >= existing.max_instances {
                return Err(Status::INSTANCE_NOT_AVAILABLE);
            }
            if existing.sharing != params.sharing {
                return Err(Status::ACCESS_DENIED);
            }
        }
        PipeServer::create(server, &pipe, options, params.flags)
    }

    pub fn params(&self) -> PipeParams {
        self.params.get()
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.get()
    }

    fn live_servers(&self) -> Vec<Rc<PipeServer>> {
        self.servers.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    /// Pick the server a new client connects to: a listening one first,
    /// else any idle instance.
    fn find_available_server(&self) -> Option<Rc<PipeServer>> {
        let servers = self.live_servers();
        servers
            .iter()
            .find(|s| s.state.get() == PipeState::WaitOpen)
            .or_else(|| servers.iter().find(|s| s.state.get() == PipeState::Idle))
            .cloned()
    }

    fn waiters(&self) -> Rc<AsyncQueue> {
        let mut slot = self.waiters.borrow_mut();
        match &*slot {
            Some(queue) => queue.clone(),
            None => {
                let queue = AsyncQueue::new();
                *slot = Some(queue.clone());
                queue
            }
        }
    }

    /// `FSCTL_PIPE_WAIT`: park the caller until a server end becomes
    /// available or the timeout fires.
    pub fn wait_available(
        self: &Rc<Self>,
        server: &Server,
        async_op: &Rc<Async>,
        timeout: Option<i64>,
    ) -> SvResult<Status> {
        if self.find_available_server().is_some() {
            return Ok(Status::SUCCESS);
        }
        let queue = self.waiters();
        queue.queue(async_op);
        let when = timeout.unwrap_or(self.params.get().timeout);
        async_op.set_timeout(server, when, Status::IO_TIMEOUT);
        Ok(Status::PENDING)
    }
}

impl KObject for NamedPipe {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "NamedPipe"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_file()
    }

    fn link_name(&self, self_ref: &ObjRef, name: &str, parent: &ObjRef) -> SvResult<()> {
        let Some(device) = downcast::<NamedPipeDevice>(parent) else {
            return Err(Status::OBJECT_NAME_INVALID);
        };
        device.pipes.add(name, self_ref);
        Ok(())
    }

    /// A client opening the pipe by name: allocate the socketpair and split
    /// it between an available server end and a fresh client end.
    fn open_file(
        &self,
        self_ref: &ObjRef,
        server_ctx: &Server,
        _process: &Rc<Process>,
        access: AccessMask,
        _sharing: ShareMode,
        options: OpenOptions,
    ) -> SvResult<ObjRef> {
        let pipe = rc_downcast::<NamedPipe>(self_ref).expect("self is a NamedPipe");
        let Some(server) = self.find_available_server() else {
            return Err(Status::PIPE_NOT_AVAILABLE);
        };
        let pipe_sharing = self.params.get().sharing;
        if (access.contains(AccessMask::GENERIC_READ) && !pipe_sharing.contains(ShareMode::READ))
            || (access.contains(AccessMask::GENERIC_WRITE)
                && !pipe_sharing.contains(ShareMode::WRITE))
        {
            return Err(Status::ACCESS_DENIED);
        }

        let params = self.params.get();
        let message_mode = params.flags.contains(PipeFlags::MESSAGE_STREAM_WRITE);
        let (server_fd, client_fd) = make_socketpair(message_mode)?;

        // only nonblocking when overlapped I/O was asked for; otherwise the
        // client read path would busy-loop
        if !options.is_synchronous() {
            set_nonblocking(client_fd);
        }
        if !server.options.is_synchronous() {
            set_nonblocking(server_fd);
        }
        if params.in_size != 0 {
            set_buffer_size(server_fd, libc::SO_RCVBUF, params.in_size);
            set_buffer_size(client_fd, libc::SO_RCVBUF, params.in_size);
        }
        if params.out_size != 0 {
            set_buffer_size(server_fd, libc::SO_SNDBUF, params.out_size);
            set_buffer_size(client_fd, libc::SO_SNDBUF, params.out_size);
        }

        let client = Rc::new(PipeClient {
            header: ObjectHeader::new(),
            fd: RefCell::new(None),
            server: RefCell::new(Rc::downgrade(&server)),
            flags: params.flags,
            pipe: pipe.clone(),
        });
        let sv = server_ctx.self_rc();
        let new_client_fd = Fd::create_anonymous(&sv, client_fd, &client, options);
        let new_server_fd = Fd::create_anonymous(&sv, server_fd, &server, server.options);
        new_client_fd.allow_caching();
        new_server_fd.allow_caching();
        if let Some(ioctl_fd) = server.ioctl_fd.borrow().as_ref() {
            ioctl_fd.copy_completion_to(&new_server_fd);
        }
        *client.fd.borrow_mut() = Some(new_client_fd);
        *server.fd.borrow_mut() = Some(new_server_fd);

        let was_waiting = server.state.get() == PipeState::WaitOpen;
        server.set_state(PipeState::Connected);
        *server.client.borrow_mut() = Some(Rc::downgrade(&client));
        if was_waiting {
            if let Some(ioctl_fd) = server.ioctl_fd.borrow().as_ref() {
                fd_async_wake_up(server_ctx, ioctl_fd, AsyncType::Wait, Status::SUCCESS);
            }
        }
        Ok(client)
    }
}

fn make_socketpair(message_mode: bool) -> SvResult<(libc::c_int, libc::c_int)> {
    let mut fds = [0 as libc::c_int; 2];
    if message_mode {
        // message mode wants SEQPACKET, but only when SO_PEEK_OFF exists so
        // the client can peek without consuming
        if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr()) }
            == 0
        {
            let zero: libc::c_int = 0;
            let ok = unsafe {
                libc::setsockopt(
                    fds[0],
                    libc::SOL_SOCKET,
                    libc::SO_PEEK_OFF,
                    (&zero as *const libc::c_int).cast(),
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                ) != -1
                    && libc::setsockopt(
                        fds[1],
                        libc::SOL_SOCKET,
                        libc::SO_PEEK_OFF,
                        (&zero as *const libc::c_int).cast(),
                        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                    ) != -1
            };
            if ok {
                return Ok((fds[0], fds[1]));
            }
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
        }
    }
    if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } == -1 {
        return Err(Status::from_errno(Errno::last()));
    }
    Ok((fds[0], fds[1]))
}

fn set_nonblocking(fd: libc::c_int) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn set_buffer_size(fd: libc::c_int, opt: libc::c_int, size: u32) {
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            (&size as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// A pipe server end.
pub struct PipeServer {
    header: ObjectHeader,
    fd: RefCell<Option<Rc<Fd>>>,
    /// Pseudo-fd carrying ioctl and async state while not connected.
    ioctl_fd: RefCell<Option<Rc<Fd>>>,
    pipe: Rc<NamedPipe>,
    client: RefCell<Option<Weak<PipeClient>>>,
    state: Cell<PipeState>,
    options: OpenOptions,
    flags: PipeFlags,
    flush_poll: RefCell<Option<TimeoutHandle>>,
}

impl fmt::Debug for PipeServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipeServer(state={:?})", self.state.get())
    }
}

impl PipeServer {
    fn create(
        server_ctx: &Rc<Server>,
        pipe: &Rc<NamedPipe>,
        options: OpenOptions,
        flags: PipeFlags,
    ) -> SvResult<Rc<PipeServer>> {
        let server = Rc::new(PipeServer {
            header: ObjectHeader::new(),
            fd: RefCell::new(None),
            ioctl_fd: RefCell::new(None),
            pipe: pipe.clone(),
            client: RefCell::new(None),
            state: Cell::new(PipeState::Idle),
            options,
            flags,
            flush_poll: RefCell::new(None),
        });
        let ioctl_fd = Fd::alloc_pseudo(server_ctx, &server, options);
        ioctl_fd.set_signaled(true);
        *server.ioctl_fd.borrow_mut() = Some(ioctl_fd);
        pipe.servers.borrow_mut().push(Rc::downgrade(&server));
        pipe.instances.set(pipe.instances.get() + 1);
        Ok(server)
    }

    pub fn pipe(&self) -> &Rc<NamedPipe> {
        &self.pipe
    }

    pub fn state(&self) -> PipeState {
        self.state.get()
    }

    fn set_state(&self, state: PipeState) {
        log::debug!("pipe server {:p}: {:?} -> {:?}", self, self.state.get(), state);
        self.state.set(state);
    }

    pub fn client(&self) -> Option<Rc<PipeClient>> {
        self.client.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// The fd ioctls and asyncs should target right now.
    fn current_fd(&self) -> Option<Rc<Fd>> {
        self.fd.borrow().clone().or_else(|| self.ioctl_fd.borrow().clone())
    }

    /// `FSCTL_PIPE_LISTEN`: start accepting a client.
    pub fn listen(&self, server_ctx: &Server, async_op: &Rc<Async>) -> SvResult<Status> {
        match self.state.get() {
            PipeState::Idle | PipeState::WaitConnect => {
                let ioctl_fd =
                    self.ioctl_fd.borrow().clone().ok_or(Status::PIPE_DISCONNECTED)?;
                fd_queue_async(server_ctx, &ioctl_fd, async_op, AsyncType::Wait);
                self.set_state(PipeState::WaitOpen);
                if let Some(waiters) = self.pipe.waiters.borrow().clone() {
                    waiters.wake_up(server_ctx, Status::SUCCESS);
                }
                Ok(Status::PENDING)
            }
            PipeState::Connected => Err(Status::PIPE_CONNECTED),
            PipeState::WaitDisconnect => Err(Status::NO_DATA_DETECTED),
            PipeState::WaitOpen => Err(Status::INVALID_HANDLE),
        }
    }

    /// `FSCTL_PIPE_DISCONNECT`: tear down the connection.
    pub fn disconnect(&self, server_ctx: &Server) -> SvResult<Status> {
        match self.state.get() {
            PipeState::Connected => {
                self.do_disconnect(server_ctx);
                if let Some(client) = self.client() {
                    *client.server.borrow_mut() = Weak::new();
                }
                *self.client.borrow_mut() = None;
                self.set_state(PipeState::WaitConnect);
                Ok(Status::SUCCESS)
            }
            PipeState::WaitDisconnect => {
                self.do_disconnect(server_ctx);
                self.set_state(PipeState::WaitConnect);
                Ok(Status::SUCCESS)
            }
            PipeState::Idle | PipeState::WaitOpen => Err(Status::PIPE_LISTENING),
            PipeState::WaitConnect => Err(Status::PIPE_DISCONNECTED),
        }
    }

    /// Drop both transport ends; the client loses any waiting data.
    fn do_disconnect(&self, server_ctx: &Server) {
        if let Some(client) = self.client() {
            if let Some(fd) = client.fd.borrow_mut().take() {
                fd_async_wake_up(server_ctx, &fd, AsyncType::Wait, Status::PIPE_DISCONNECTED);
            }
        }
        if let Some(fd) = self.fd.borrow_mut().take() {
            if let Ok(unix_fd) = fd.unix_fd() {
                unsafe { libc::shutdown(unix_fd, libc::SHUT_RDWR) };
            }
        }
        if let Some(poll) = self.flush_poll.borrow_mut().take() {
            poll.cancel();
        }
    }

    /// Is there still unread data in the client's receive buffer?
    fn data_remaining(&self) -> bool {
        let Some(client) = self.client() else { return false };
        let Some(fd) = client.fd.borrow().clone() else { return false };
        let Ok(unix_fd) = fd.unix_fd() else { return false };
        let mut pollfd =
            libc::pollfd { fd: unix_fd, events: libc::POLLIN, revents: 0 };
        unsafe { libc::poll(&mut pollfd, 1, 0) > 0 && pollfd.revents & libc::POLLIN != 0 }
    }

    fn arm_flush_poll(self: &Rc<Self>, server_ctx: &Server) {
        let weak = Rc::downgrade(self);
        let handle = server_ctx.timeouts().add(FLUSH_POLL_INTERVAL, move |server_ctx| {
            if let Some(pipe_server) = weak.upgrade() {
                pipe_server.flush_poll.borrow_mut().take();
                pipe_server.check_flushed(server_ctx);
            }
        });
        *self.flush_poll.borrow_mut() = Some(handle);
    }

    fn check_flushed(self: &Rc<Self>, server_ctx: &Server) {
        if self.data_remaining() {
            self.arm_flush_poll(server_ctx);
        } else if let Some(fd) = self.fd.borrow().clone() {
            fd_async_wake_up(server_ctx, &fd, AsyncType::Wait, Status::SUCCESS);
        }
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        if let Some(client) = self.client.borrow().as_ref().and_then(Weak::upgrade) {
            *client.server.borrow_mut() = Weak::new();
        }
        if let Some(fd) = self.fd.get_mut().take() {
            if let Ok(unix_fd) = fd.unix_fd() {
                unsafe { libc::shutdown(unix_fd, libc::SHUT_RDWR) };
            }
        }
        self.pipe.instances.set(self.pipe.instances.get() - 1);
        self.pipe
            .servers
            .borrow_mut()
            .retain(|weak| !std::ptr::eq(weak.as_ptr(), self as *const PipeServer));
    }
}

impl KObject for PipeServer {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "NamedPipeServer"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header.enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, _entry: &WaitQueueEntry) -> bool {
        self.current_fd().is_some_and(|fd| fd.is_signaled())
    }

    fn get_fd(&self) -> SvResult<Rc<Fd>> {
        self.current_fd().ok_or(Status::PIPE_DISCONNECTED)
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_file()
    }
}

impl FdOps for PipeServer {
    fn fd_type(&self, _fd: &Fd) -> FdType {
        FdType::Pipe
    }

    fn flush(&self, server_ctx: &Server, fd: &Rc<Fd>, async_op: &Rc<Async>) -> SvResult<Status> {
        if self.state.get() != PipeState::Connected || !self.data_remaining() {
            return Ok(Status::SUCCESS);
        }
        fd_queue_async(server_ctx, fd, async_op, AsyncType::Wait);
        let this = rc_downcast::<PipeServer>(&fd.user_object().ok_or(Status::PIPE_DISCONNECTED)?)
            .ok_or(Status::PIPE_DISCONNECTED)?;
        this.arm_flush_poll(server_ctx);
        Ok(Status::PENDING)
    }

    fn ioctl(&self, server_ctx: &Server, fd: &Rc<Fd>, code: u32, async_op: &Rc<Async>) -> SvResult<Status> {
        match code {
            FSCTL_PIPE_LISTEN => self.listen(server_ctx, async_op),
            FSCTL_PIPE_DISCONNECT => self.disconnect(server_ctx),
            _ => crate::fd::default_fd_ioctl(server_ctx, fd, code, async_op),
        }
    }

    fn queue_async(
        &self,
        server_ctx: &Server,
        fd: &Rc<Fd>,
        async_op: &Rc<Async>,
        ty: AsyncType,
        _count: i32,
    ) -> SvResult<Status> {
        // data I/O needs a connected peer
        if self.client().and_then(|c| c.fd.borrow().clone()).is_none() {
            return Err(Status::PIPE_DISCONNECTED);
        }
        default_fd_queue_async(server_ctx, fd, async_op, ty)
    }
}

/// A pipe client end.
pub struct PipeClient {
    header: ObjectHeader,
    fd: RefCell<Option<Rc<Fd>>>,
    server: RefCell<Weak<PipeServer>>,
    flags: PipeFlags,
    pipe: Rc<NamedPipe>,
}

impl fmt::Debug for PipeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipeClient(flags={:?})", self.flags)
    }
}

impl PipeClient {
    pub fn server(&self) -> Option<Rc<PipeServer>> {
        self.server.borrow().upgrade()
    }

    pub fn pipe(&self) -> &Rc<NamedPipe> {
        &self.pipe
    }
}

impl Drop for PipeClient {
    fn drop(&mut self) {
        if let Some(server) = self.server.borrow().upgrade() {
            match server.state.get() {
                PipeState::Connected => {
                    // keep the server fd so a flush can still drain
                    server.set_state(PipeState::WaitDisconnect);
                }
                _ => {}
            }
            *server.client.borrow_mut() = None;
        }
    }
}

impl KObject for PipeClient {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "NamedPipeClient"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header.enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, _entry: &WaitQueueEntry) -> bool {
        self.fd.borrow().as_ref().is_some_and(|fd| fd.is_signaled())
    }

    fn get_fd(&self) -> SvResult<Rc<Fd>> {
        self.fd.borrow().clone().ok_or(Status::PIPE_DISCONNECTED)
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_file()
    }
}

impl FdOps for PipeClient {
    fn fd_type(&self, _fd: &Fd) -> FdType {
        FdType::Pipe
    }

    fn flush(&self, _server: &Server, _fd: &Rc<Fd>, _async_op: &Rc<Async>) -> SvResult<Status> {
        Ok(Status::SUCCESS)
    }

    fn queue_async(
        &self,
        server_ctx: &Server,
        fd: &Rc<Fd>,
        async_op: &Rc<Async>,
        ty: AsyncType,
        _count: i32,
    ) -> SvResult<Status> {
        if self.server().is_none() {
            return Err(Status::PIPE_DISCONNECTED);
        }
        default_fd_queue_async(server_ctx, fd, async_op, ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::lookup_named_object;

    const PIPE_PATH: &str = "\\Device\\NamedPipe\\test";

    fn default_params(max_instances: u32) -> PipeParams {
        PipeParams {
            flags: PipeFlags::empty(),
            sharing: ShareMode::READ | ShareMode::WRITE,
            max_instances,
            in_size: 0,
            out_size: 0,
            timeout: -TICKS_PER_SEC,
        }
    }

    fn connect_client(server: &Rc<Server>, process: &Rc<Process>) -> SvResult<Rc<PipeClient>> {
        let (obj, rest) = lookup_named_object(
            server,
            None,
            PIPE_PATH,
            Attributes::CASE_INSENSITIVE,
        )?;
        assert!(rest.is_none(), "pipe must exist");
        let client = obj.open_file(
            &obj,
            server,
            process,
            AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE,
            ShareMode::empty(),
            OpenOptions::empty(),
        )?;
        Ok(rc_downcast::<PipeClient>(&client).unwrap())
    }

    #[test]
    fn listen_connect_disconnect_cycle() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let thread = process.main_thread().unwrap();

        let ps = NamedPipe::create(
            &server,
            PIPE_PATH,
            Attributes::CASE_INSENSITIVE,
            default_params(1),
            OpenOptions::empty(),
        )
        .unwrap();
        assert_eq!(ps.state(), PipeState::Idle);

        // listen parks an async and moves to WaitOpen
        let listen_async = Async::new(&thread, 0, 0, None);
        assert_eq!(ps.listen(&server, &listen_async).unwrap(), Status::PENDING);
        assert_eq!(ps.state(), PipeState::WaitOpen);
        assert!(listen_async.is_pending());

        // client connect completes the listen
        let client = connect_client(&server, &process).unwrap();
        assert_eq!(ps.state(), PipeState::Connected);
        assert_eq!(listen_async.status(), Status::SUCCESS);
        assert!(client.get_fd().is_ok());
        assert!(ps.get_fd().is_ok());

        // the transport really is a socketpair
        let server_unix = ps.get_fd().unwrap().unix_fd().unwrap();
        let client_unix = client.get_fd().unwrap().unix_fd().unwrap();
        let sent = unsafe { libc::write(server_unix, b"ping".as_ptr().cast(), 4) };
        assert_eq!(sent, 4);
        let mut buf = [0u8; 8];
        let got = unsafe { libc::read(client_unix, buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(&buf[..got as usize], b"ping");

        // disconnect tears the pair down
        assert_eq!(ps.disconnect(&server).unwrap(), Status::SUCCESS);
        assert_eq!(ps.state(), PipeState::WaitConnect);
        assert!(client.get_fd().is_err());

        // disconnect again is an error
        assert_eq!(ps.disconnect(&server).unwrap_err(), Status::PIPE_DISCONNECTED);

        // and the server can listen again
        let listen_async = Async::new(&thread, 0, 0, None);
        assert_eq!(ps.listen(&server, &listen_async).unwrap(), Status::PENDING);
        assert_eq!(ps.state(), PipeState::WaitOpen);
    }

    #[test]
    fn listen_while_connected_fails() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let thread = process.main_thread().unwrap();
        let ps = NamedPipe::create(
            &server,
            PIPE_PATH,
            Attributes::CASE_INSENSITIVE,
            default_params(1),
            OpenOptions::empty(),
        )
        .unwrap();
        let listen_async = Async::new(&thread, 0, 0, None);
        ps.listen(&server, &listen_async).unwrap();
        let _client = connect_client(&server, &process).unwrap();
        let listen_async = Async::new(&thread, 0, 0, None);
        assert_eq!(ps.listen(&server, &listen_async).unwrap_err(), Status::PIPE_CONNECTED);
    }

    #[test]
    fn second_client_gets_no_instance() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let thread = process.main_thread().unwrap();
        let ps = NamedPipe::create(
            &server,
            PIPE_PATH,
            Attributes::CASE_INSENSITIVE,
            default_params(1),
            OpenOptions::empty(),
        )
        .unwrap();
        let listen_async = Async::new(&thread, 0, 0, None);
        ps.listen(&server, &listen_async).unwrap();
        let _client = connect_client(&server, &process).unwrap();
        assert_eq!(
            connect_client(&server, &process).unwrap_err(),
            Status::PIPE_NOT_AVAILABLE
        );
    }

    #[test]
    fn max_instances_enforced() {
        let server = Server::new_for_tests();
        let _ps = NamedPipe::create(
            &server,
            PIPE_PATH,
            Attributes::CASE_INSENSITIVE,
            default_params(1),
            OpenOptions::empty(),
        )
        .unwrap();
        assert_eq!(
            NamedPipe::create(
                &server,
                PIPE_PATH,
                Attributes::CASE_INSENSITIVE,
                default_params(1),
                OpenOptions::empty(),
            )
            .unwrap_err(),
            Status::INSTANCE_NOT_AVAILABLE
        );
    }

    #[test]
    fn client_release_leaves_server_flushable() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let thread = process.main_thread().unwrap();
        let ps = NamedPipe::create(
            &server,
            PIPE_PATH,
            Attributes::CASE_INSENSITIVE,
            default_params(1),
            OpenOptions::empty(),
        )
        .unwrap();
        let listen_async = Async::new(&thread, 0, 0, None);
        ps.listen(&server, &listen_async).unwrap();
        let client = connect_client(&server, &process).unwrap();
        drop(client);
        assert_eq!(ps.state(), PipeState::WaitDisconnect);
        // server still holds its fd for flushing
        assert!(ps.get_fd().is_ok());
        assert_eq!(ps.disconnect(&server).unwrap(), Status::SUCCESS);
        assert_eq!(ps.state(), PipeState::WaitConnect);
    }

    #[test]
    fn pipe_wait_parks_until_listen() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let thread = process.main_thread().unwrap();
        let ps = NamedPipe::create(
            &server,
            PIPE_PATH,
            Attributes::CASE_INSENSITIVE,
            default_params(2),
            OpenOptions::empty(),
        )
        .unwrap();
        let pipe = ps.pipe().clone();

        server.timeouts().set_current_time(0);
        let waiter = Async::new(&thread, 0, 0, None);
        assert_eq!(
            pipe.wait_available(&server, &waiter, None).unwrap(),
            Status::PENDING
        );
        assert!(waiter.is_pending());

        // listen wakes the parked waiter
        let listen_async = Async::new(&thread, 0, 0, None);
        ps.listen(&server, &listen_async).unwrap();
        assert_eq!(waiter.status(), Status::SUCCESS);
    }

    #[test]
    fn pipe_wait_times_out() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let thread = process.main_thread().unwrap();
        let ps = NamedPipe::create(
            &server,
            PIPE_PATH,
            Attributes::CASE_INSENSITIVE,
            default_params(2),
            OpenOptions::empty(),
        )
        .unwrap();
        let pipe = ps.pipe().clone();
        server.timeouts().set_current_time(0);
        let waiter = Async::new(&thread, 0, 0, None);
        pipe.wait_available(&server, &waiter, Some(-TICKS_PER_SEC)).unwrap();
        server.timeouts().set_current_time(2 * TICKS_PER_SEC);
        server.timeouts().process(&server);
        assert_eq!(waiter.status(), Status::IO_TIMEOUT);
    }
}
