//! Client request channel
//!
//! Each client process talks to the server over a unix stream socket using
//! fixed-layout frames: a small header with a request code and payload
//! size, an optional payload, and replies that mirror the shape with a
//! status in place of the code. File descriptors ride out-of-band via
//! `SCM_RIGHTS` in both directions. The payload contents beyond the frame
//! are the protocol's business, not this module's.

use std::any::Any;
use std::cell::RefCell;
use std::io::IoSlice;
use std::io::IoSliceMut;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::rc::Rc;
use std::rc::Weak;

use nix::errno::Errno;
use nix::sys::socket::ControlMessage;
use nix::sys::socket::ControlMessageOwned;
use nix::sys::socket::MsgFlags;
use num_enum::TryFromPrimitive;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::access::AccessMask;
use crate::access::OpenOptions;
use crate::access::ShareMode;
use crate::fd::Fd;
use crate::fd::FdOps;
use crate::fd::FdType;
use crate::file::File;
use crate::handle::HandleFlags;
use crate::object::KObject;
use crate::object::ObjectHeader;
use crate::poll::PollEvents;
use crate::process::Process;
use crate::process::StartupState;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;

/// Requests the channel layer itself understands. Everything else is
/// dispatched upward as opaque payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum RequestCode {
    /// First message of a new client: completes the init handshake.
    InitFirstThread = 1,
    /// Wrap a unix fd passed over the channel as a File object.
    AllocFileHandle = 2,
    /// Orderly goodbye.
    Terminate = 3,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C)]
pub struct RequestHeader {
    pub code: u32,
    pub data_size: u32,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C)]
pub struct ReplyHeader {
    pub status: u32,
    pub data_size: u32,
}

/// Write a frame with optional out-of-band fds.
pub fn send_frame(
    sock: RawFd,
    header_bytes: &[u8],
    payload: &[u8],
    fds: &[RawFd],
) -> SvResult<()> {
    let iov = [IoSlice::new(header_bytes), IoSlice::new(payload)];
    let cmsgs: &[ControlMessage<'_>] =
        if fds.is_empty() { &[] } else { &[ControlMessage::ScmRights(fds)] };
    nix::sys::socket::sendmsg::<()>(sock, &iov, cmsgs, MsgFlags::empty(), None)
        .map_err(Status::from_sock_errno)?;
    Ok(())
}

/// Read up to one frame's worth of bytes plus any passed fds.
fn recv_with_fds(sock: RawFd, buf: &mut [u8]) -> SvResult<(usize, Vec<RawFd>)> {
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 4]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = nix::sys::socket::recvmsg::<()>(
        sock,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(Status::from_sock_errno)?;
    let mut fds = Vec::new();
    if let Ok(cmsgs) = msg.cmsgs() {
        for cmsg in cmsgs {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                fds.extend(received);
            }
        }
    }
    Ok((msg.bytes, fds))
}

/// The per-client request channel, pumped by the main loop.
pub struct RequestChannel {
    header: ObjectHeader,
    fd: RefCell<Option<Rc<Fd>>>,
    process: RefCell<Weak<Process>>,
}

impl std::fmt::Debug for RequestChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestChannel")
    }
}

impl RequestChannel {
    /// Attach a connected stream socket as a client's request channel.
    pub fn attach(
        server: &Rc<Server>,
        process: &Rc<Process>,
        stream_fd: RawFd,
    ) -> Rc<RequestChannel> {
        let channel = Rc::new(RequestChannel {
            header: ObjectHeader::new(),
            fd: RefCell::new(None),
            process: RefCell::new(Rc::downgrade(process)),
        });
        let fd = Fd::create_anonymous(server, stream_fd, &channel, OpenOptions::empty());
        fd.set_fd_events(Some(PollEvents::POLLIN));
        *channel.fd.borrow_mut() = Some(fd);
        channel
    }

    fn unix_fd(&self) -> SvResult<RawFd> {
        self.fd.borrow().as_ref().ok_or(Status::INVALID_HANDLE)?.unix_fd()
    }

    fn reply(&self, status: Status, payload: &[u8]) {
        let header = ReplyHeader { status: status.0, data_size: payload.len() as u32 };
        if let Ok(sock) = self.unix_fd() {
            if let Err(err) = send_frame(sock, header.as_bytes(), payload, &[]) {
                log::warn!("reply failed: {err}");
            }
        }
    }

    /// Ship an fd to the client so it can read/write directly; the server
    /// keeps the authoritative state.
    pub fn send_fd(&self, fd: &Fd) -> SvResult<()> {
        let unix_fd = fd.unix_fd()?;
        let sock = self.unix_fd()?;
        let header = ReplyHeader { status: Status::SUCCESS.0, data_size: 0 };
        send_frame(sock, header.as_bytes(), &[], &[unix_fd])
    }

    fn handle_frame(
        &self,
        server: &Server,
        header: RequestHeader,
        payload: &[u8],
        fds: Vec<RawFd>,
    ) {
        let Some(process) = self.process.borrow().upgrade() else { return };
        let code = match RequestCode::try_from(header.code) {
            Ok(code) => code,
            Err(_) => {
                for fd in fds {
                    unsafe { libc::close(fd) };
                }
                self.reply(Status::NOT_IMPLEMENTED, &[]);
                return;
            }
        };
        match code {
            RequestCode::InitFirstThread => {
                process.set_startup_state(StartupState::Done);
                let thread_id = process.main_thread().map_or(0, |t| t.id());
                let mut reply = [0u8; 8];
                reply[..4].copy_from_slice(&process.id().to_le_bytes());
                reply[4..].copy_from_slice(&thread_id.to_le_bytes());
                self.reply(Status::SUCCESS, &reply);
            }
            RequestCode::AllocFileHandle => {
                // the client hands in a pre-existing fd (stdio inheritance)
                let Some(unix_fd) = fds.first().copied() else {
                    self.reply(Status::INVALID_PARAMETER, &[]);
                    return;
                };
                for extra in &fds[1..] {
                    unsafe { libc::close(*extra) };
                }
                let access = payload
                    .get(..4)
                    .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                    .map(AccessMask::from_bits_truncate)
                    .unwrap_or(AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE);
                let file = File::create_for_unix_fd(
                    &server.self_rc(),
                    unix_fd,
                    access,
                    ShareMode::READ | ShareMode::WRITE,
                );
                let file_obj: crate::object::ObjRef = file;
                match process.handles().alloc(&file_obj, access, HandleFlags::empty()) {
                    Ok(handle) => self.reply(Status::SUCCESS, &handle.0.to_le_bytes()),
                    Err(err) => self.reply(err, &[]),
                }
            }
            RequestCode::Terminate => {
                self.reply(Status::SUCCESS, &[]);
                process.terminate(server, 0);
            }
        }
    }
}

impl KObject for RequestChannel {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "RequestChannel"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl FdOps for RequestChannel {
    fn get_poll_events(&self, _fd: &Fd) -> PollEvents {
        PollEvents::POLLIN
    }

    fn poll_event(&self, server: &Server, fd: &Rc<Fd>, events: PollEvents) {
        if events.intersects(PollEvents::POLLERR | PollEvents::POLLHUP)
            && !events.contains(PollEvents::POLLIN)
        {
            // client went away
            if let Some(process) = self.process.borrow().upgrade() {
                log::info!("client {} disconnected", process.id());
                process.terminate(server, 0);
            }
            fd.set_fd_events(None);
            return;
        }
        let Ok(sock) = self.unix_fd() else { return };
        let mut buf = [0u8; 0x2000];
        match recv_with_fds(sock, &mut buf) {
            Ok((0, _)) => {
                if let Some(process) = self.process.borrow().upgrade() {
                    process.terminate(server, 0);
                }
                fd.set_fd_events(None);
            }
            Ok((got, fds)) => {
                let Ok((header, rest)) = RequestHeader::read_from_prefix(&buf[..got]) else {
                    log::warn!("short request frame ({got} bytes)");
                    return;
                };
                let payload_len = (header.data_size as usize).min(rest.len());
                self.handle_frame(server, header, &rest[..payload_len], fds);
            }
            Err(err) => {
                log::warn!("request channel read failed: {err}");
            }
        }
    }

    fn fd_type(&self, _fd: &Fd) -> FdType {
        FdType::Socket
    }
}

/// The master socket accepting new client connections.
pub struct MasterSocket {
    header: ObjectHeader,
    fd: RefCell<Option<Rc<Fd>>>,
}

impl std::fmt::Debug for MasterSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterSocket")
    }
}

impl MasterSocket {
    /// Bind and listen on the server socket, replacing a stale one.
    pub fn create(server: &Rc<Server>, path: &Path) -> SvResult<Rc<MasterSocket>> {
        let _ = std::fs::remove_file(path);
        let listener = std::os::unix::net::UnixListener::bind(path).map_err(|err| {
            log::error!("binding {} failed: {err}", path.display());
            Status::from_sock_errno(Errno::last())
        })?;
        listener.set_nonblocking(true).map_err(|_| Status::UNSUCCESSFUL)?;
        let raw = {
            use std::os::unix::io::IntoRawFd;
            listener.into_raw_fd()
        };
        let master = Rc::new(MasterSocket {
            header: ObjectHeader::new(),
            fd: RefCell::new(None),
        });
        let fd = Fd::create_anonymous(server, raw, &master, OpenOptions::empty());
        fd.set_fd_events(Some(PollEvents::POLLIN));
        *master.fd.borrow_mut() = Some(fd);
        Ok(master)
    }
}

impl KObject for MasterSocket {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "MasterSocket"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl FdOps for MasterSocket {
    fn get_poll_events(&self, _fd: &Fd) -> PollEvents {
        PollEvents::POLLIN
    }

    fn poll_event(&self, server: &Server, _fd: &Rc<Fd>, _events: PollEvents) {
        let Some(master_fd) = self.fd.borrow().clone() else { return };
        let Ok(listen_fd) = master_fd.unix_fd() else { return };
        loop {
            let client_fd =
                unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if client_fd == -1 {
                break;
            }
            unsafe {
                libc::fcntl(client_fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
            let sv = server.self_rc();
            let process = Process::new(server, None, false);
            let channel = RequestChannel::attach(&sv, &process, client_fd);
            log::info!("client connected as process {}", process.id());
            // the channel lives as long as the server; teardown happens
            // through the process on disconnect
            server.make_static(channel);
        }
    }

    fn fd_type(&self, _fd: &Fd) -> FdType {
        FdType::Socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::io::Write as _;

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

    fn make_channel(
        server: &Rc<Server>,
    ) -> (Rc<Process>, Rc<RequestChannel>, std::os::unix::net::UnixStream) {
        let (client_end, server_end) = std::os::unix::net::UnixStream::pair().unwrap();
        let process = server.make_test_process();
        let raw = {
            use std::os::unix::io::IntoRawFd;
            server_end.into_raw_fd()
        };
        let channel = RequestChannel::attach(server, &process, raw);
        (process, channel, client_end)
    }

    #[test]
    fn init_handshake_replies_with_ids() {
        let server = Server::new_for_tests();
        let (process, _channel, mut client) = make_channel(&server);
        assert_eq!(process.startup_state(), StartupState::InProgress);

        let header = RequestHeader { code: RequestCode::InitFirstThread as u32, data_size: 0 };
        client.write_all(header.as_bytes()).unwrap();
        pump(&server);

        assert_eq!(process.startup_state(), StartupState::Done);
        let mut reply = [0u8; 16];
        let got = client.read(&mut reply).unwrap();
        let (reply_header, body) = ReplyHeader::read_from_prefix(&reply[..got]).unwrap();
        assert_eq!(reply_header.status, Status::SUCCESS.0);
        assert_eq!(reply_header.data_size, 8);
        let pid = u32::from_le_bytes(body[..4].try_into().unwrap());
        assert_eq!(pid, process.id());
    }

    #[test]
    fn alloc_file_handle_wraps_passed_fd() {
        let server = Server::new_for_tests();
        let (process, _channel, client) = make_channel(&server);

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file_fd = {
            use std::os::unix::io::AsRawFd;
            tmp.as_raw_fd()
        };
        let header = RequestHeader { code: RequestCode::AllocFileHandle as u32, data_size: 4 };
        let access = AccessMask::GENERIC_READ.bits().to_le_bytes();
        let sock = {
            use std::os::unix::io::AsRawFd;
            client.as_raw_fd()
        };
        send_frame(sock, header.as_bytes(), &access, &[file_fd]).unwrap();
        pump(&server);

        assert_eq!(process.handles().count(), 1);
        let mut client = client;
        let mut reply = [0u8; 16];
        let got = client.read(&mut reply).unwrap();
        let (reply_header, body) = ReplyHeader::read_from_prefix(&reply[..got]).unwrap();
        assert_eq!(reply_header.status, Status::SUCCESS.0);
        let handle = crate::handle::Handle(u32::from_le_bytes(body[..4].try_into().unwrap()));
        let file = process
            .handles()
            .get_obj_as::<File>(handle, AccessMask::empty())
            .unwrap();
        assert!(file.fd().unwrap().unix_fd().is_ok());
    }

    #[test]
    fn client_disconnect_terminates_process() {
        let server = Server::new_for_tests();
        let (process, _channel, client) = make_channel(&server);
        drop(client);
        pump(&server);
        assert!(!process.is_running());
    }

    #[test]
    fn master_socket_accepts_clients() {
        let server = Server::new_for_tests();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("socket");
        let _master = MasterSocket::create(&server, &path).unwrap();

        let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        pump(&server);

        let header = RequestHeader { code: RequestCode::InitFirstThread as u32, data_size: 0 };
        client.write_all(header.as_bytes()).unwrap();
        pump(&server);
        let mut reply = [0u8; 16];
        let got = client.read(&mut reply).unwrap();
        let (reply_header, _) = ReplyHeader::read_from_prefix(&reply[..got]).unwrap();
        assert_eq!(reply_header.status, Status::SUCCESS.0);
    }
}
