//! File descriptor layer
//!
//! An [`Fd`] wraps a POSIX file descriptor with the policy the host kernel
//! does not provide: Windows sharing modes, byte-range locks, async queues
//! and completion binding. Fds on the same on-disk file share an [`Inode`]
//! so sharing and locking coordinate across opens, and inodes hang off a
//! per-device node keyed by `st_dev`.
//!
//! POSIX advisory locks allow only one lock per process and region, so the
//! lock manager composes unlock "holes": removing one lock unlocks exactly
//! the byte ranges no other lock still covers.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::rc::Weak;

use bitflags::bitflags;
use nix::errno::Errno;

use crate::access::AccessMask;
use crate::access::OpenOptions;
use crate::access::ShareMode;
use crate::async_io::Async;
use crate::async_io::AsyncQueue;
use crate::async_io::AsyncType;
use crate::completion::IoCompletion;
use crate::object::KObject;
use crate::object::ObjRef;
use crate::object::ObjectHeader;
use crate::poll::PollEvents;
use crate::process::Process;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;
use crate::wait::wake_up;
use crate::wait::WaitQueueEntry;

thread_local! {
    // largest offset the host kernel accepts for fcntl locks; shrunk once
    // when a 32-bit off_t kernel rejects a 64-bit range
    static MAX_UNIX_OFFSET: Cell<u64> = const { Cell::new(i64::MAX as u64) };
}

bitflags! {
    /// Flags attached to an fd's completion binding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CompletionFlags: u32 {
        const SKIP_ON_SUCCESS = 0x1;
    }
}

/// What kind of unix object backs an fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdType {
    File,
    Dir,
    Socket,
    Pipe,
    Char,
    Device,
}

/// Per-type fd operations, implemented by the object using the fd.
///
/// The defaults implement the common poll-driven behavior; types override
/// what differs (sockets recompute event masks, pipes park flush asyncs, and
/// so on).
#[allow(unused_variables)]
pub trait FdOps: fmt::Debug + 'static {
    /// The poll events this fd currently wants.
    fn get_poll_events(&self, fd: &Fd) -> PollEvents {
        default_fd_get_poll_events(fd)
    }

    /// A poll event fired on the fd.
    fn poll_event(&self, server: &Server, fd: &Rc<Fd>, events: PollEvents) {
        default_poll_event(server, fd, events);
    }

    fn fd_type(&self, fd: &Fd) -> FdType {
        FdType::File
    }

    fn read(&self, server: &Server, fd: &Rc<Fd>, async_op: &Rc<Async>, pos: u64) -> SvResult<Status> {
        Err(Status::OBJECT_TYPE_MISMATCH)
    }

    fn write(&self, server: &Server, fd: &Rc<Fd>, async_op: &Rc<Async>, pos: u64) -> SvResult<Status> {
        Err(Status::OBJECT_TYPE_MISMATCH)
    }

    fn flush(&self, server: &Server, fd: &Rc<Fd>, async_op: &Rc<Async>) -> SvResult<Status> {
        Err(Status::OBJECT_TYPE_MISMATCH)
    }

    fn ioctl(&self, server: &Server, fd: &Rc<Fd>, code: u32, async_op: &Rc<Async>) -> SvResult<Status> {
        default_fd_ioctl(server, fd, code, async_op)
    }

    fn queue_async(
        &self,
        server: &Server,
        fd: &Rc<Fd>,
        async_op: &Rc<Async>,
        ty: AsyncType,
        count: i32,
    ) -> SvResult<Status> {
        default_fd_queue_async(server, fd, async_op, ty)
    }

    fn reselect_async(&self, server: &Server, fd: &Rc<Fd>, queue: &Rc<AsyncQueue>) {
        default_fd_reselect_async(server, fd, queue);
    }
}

struct FdUser {
    ops: Weak<dyn FdOps>,
    obj: Weak<dyn KObject>,
}

/// Record of a torn-down fd kept on the inode while byte-range locks or a
/// deferred unlink still need the file around.
#[derive(Debug)]
pub struct ClosedFd {
    unix_fd: Cell<libc::c_int>,
    unlink: Cell<bool>,
    unix_name: Option<PathBuf>,
}

impl ClosedFd {
    fn close_unix_fd(&self) {
        let fd = self.unix_fd.replace(-1);
        if fd != -1 {
            unsafe { libc::close(fd) };
        }
    }
}

/// Per-device node; inodes of the device hash off it.
pub struct Device {
    dev: u64,
    removable: Cell<bool>,
    inodes: RefCell<HashMap<u64, Weak<Inode>>>,
    registry: Weak<RefCell<HashMap<u64, Weak<Device>>>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device(dev={:#x})", self.dev)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut devices = registry.borrow_mut();
            // only drop our own entry; a replacement node may already be
            // registered under the same key
            if devices.get(&self.dev).is_some_and(|weak| {
                std::ptr::eq(weak.as_ptr(), self as *const Device)
            }) {
                devices.remove(&self.dev);
            }
        }
    }
}

impl Device {
    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn is_removable(&self) -> bool {
        self.removable.get()
    }
}

#[cfg(target_os = "linux")]
fn is_device_removable(unix_fd: libc::c_int) -> bool {
    let mut stfs: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstatfs(unix_fd, &mut stfs) } == -1 {
        return false;
    }
    stfs.f_type == 0x9660       /* iso9660 */
        || stfs.f_type == 0x9fa1    /* supermount */
        || stfs.f_type == 0x1501_3346 /* udf */
}

#[cfg(not(target_os = "linux"))]
fn is_device_removable(_unix_fd: libc::c_int) -> bool {
    false
}

/// Find or create the device node for `dev`.
pub fn get_device(server: &Server, dev: u64, unix_fd: libc::c_int) -> Option<Rc<Device>> {
    let registry = server.devices();
    if let Some(device) = registry.borrow().get(&dev).and_then(Weak::upgrade) {
        return Some(device);
    }
    if unix_fd == -1 {
        return None;
    }
    let device = Rc::new(Device {
        dev,
        removable: Cell::new(is_device_removable(unix_fd)),
        inodes: RefCell::new(HashMap::new()),
        registry: Rc::downgrade(registry),
    });
    registry.borrow_mut().insert(dev, Rc::downgrade(&device));
    Some(device)
}

/// Shared state of all fds open on one on-disk file.
pub struct Inode {
    device: Rc<Device>,
    ino: u64,
    open: RefCell<Vec<Weak<Fd>>>,
    locks: RefCell<Vec<Rc<FileLock>>>,
    closed: RefCell<Vec<ClosedFd>>,
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inode(dev={:#x}, ino={})", self.device.dev, self.ino)
    }
}

impl Inode {
    pub fn device(&self) -> &Rc<Device> {
        &self.device
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    fn open_fds(&self) -> Vec<Rc<Fd>> {
        self.open.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    pub fn has_locks(&self) -> bool {
        !self.locks.borrow().is_empty()
    }

    /// Close fds queued on the closed list; deferred-unlink records are kept
    /// around (with the fd closed) when `keep_unlinks` is set.
    fn close_pending(&self, keep_unlinks: bool) {
        self.closed.borrow_mut().retain(|closed| {
            closed.close_unix_fd();
            keep_unlinks && closed.unlink.get()
        });
    }

    fn add_closed_fd(&self, closed: ClosedFd) {
        if self.has_locks() {
            // the unix fd must survive until the locks are gone
            self.closed.borrow_mut().push(closed);
        } else if closed.unlink.get() {
            closed.close_unix_fd();
            self.closed.borrow_mut().push(closed);
        } else {
            closed.close_unix_fd();
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        debug_assert!(self.locks.get_mut().is_empty());
        {
            let mut inodes = self.device.inodes.borrow_mut();
            if inodes.get(&self.ino).is_some_and(|weak| {
                std::ptr::eq(weak.as_ptr(), self as *const Inode)
            }) {
                inodes.remove(&self.ino);
            }
        }
        for closed in self.closed.get_mut().drain(..) {
            closed.close_unix_fd();
            if !closed.unlink.get() {
                continue;
            }
            let Some(name) = &closed.unix_name else { continue };
            // unlink only if the path still names the same file
            let Ok(st) = nix::sys::stat::stat(name.as_path()) else { continue };
            if st.st_dev as u64 == self.device.dev && st.st_ino as u64 == self.ino {
                let result = if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
                    std::fs::remove_dir(name)
                } else {
                    std::fs::remove_file(name)
                };
                if let Err(err) = result {
                    log::warn!("deferred unlink of {} failed: {err}", name.display());
                }
            }
        }
    }
}

/// Find or create the inode node for `(dev, ino)`.
pub fn get_inode(server: &Server, dev: u64, ino: u64, unix_fd: libc::c_int) -> Option<Rc<Inode>> {
    let device = get_device(server, dev, unix_fd)?;
    if let Some(inode) = device.inodes.borrow().get(&ino).and_then(Weak::upgrade) {
        return Some(inode);
    }
    let inode = Rc::new(Inode {
        device: device.clone(),
        ino,
        open: RefCell::new(Vec::new()),
        locks: RefCell::new(Vec::new()),
        closed: RefCell::new(Vec::new()),
    });
    device.inodes.borrow_mut().insert(ino, Rc::downgrade(&inode));
    Some(inode)
}

/// A byte-range lock over `[start, end)`; `end == 0` is unbounded.
///
/// Registered on the fd, the inode and the owning process at once. The lock
/// is a waitable object: it signals once it has lost its owner, which is how
/// blocked lock requests learn to retry.
pub struct FileLock {
    header: ObjectHeader,
    fd: RefCell<Weak<Fd>>,
    shared: bool,
    start: u64,
    end: u64,
    process: RefCell<Option<Weak<Process>>>,
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileLock({} [{:#x},{:#x}))",
            if self.shared { "shared" } else { "excl" },
            self.start,
            self.end
        )
    }
}

impl FileLock {
    pub fn range(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        if self.end != 0 && start >= self.end {
            return false;
        }
        if end != 0 && self.start >= end {
            return false;
        }
        true
    }
}

impl KObject for FileLock {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "FileLock"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header.enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, _entry: &WaitQueueEntry) -> bool {
        // signaled once it has lost its owner
        self.process.borrow().is_none()
    }
}

/// Result of a lock request.
#[derive(Debug)]
pub enum LockResult {
    Granted,
    /// Conflicting lock held; wait on the returned lock object and retry.
    Pending(Rc<FileLock>),
}

/// The fd object.
pub struct Fd {
    server: Weak<Server>,
    user: RefCell<Option<FdUser>>,
    inode: RefCell<Option<Rc<Inode>>>,
    closed: RefCell<Option<ClosedFd>>,
    access: Cell<AccessMask>,
    options: Cell<OpenOptions>,
    sharing: Cell<ShareMode>,
    unix_name: RefCell<Option<PathBuf>>,
    unix_fd: Cell<libc::c_int>,
    no_fd_status: Cell<Status>,
    cacheable: Cell<bool>,
    signaled: Cell<bool>,
    fs_locks: Cell<bool>,
    poll_index: Cell<Option<usize>>,
    locks: RefCell<Vec<Rc<FileLock>>>,
    read_q: RefCell<Option<Rc<AsyncQueue>>>,
    write_q: RefCell<Option<Rc<AsyncQueue>>>,
    wait_q: RefCell<Option<Rc<AsyncQueue>>>,
    completion: RefCell<Option<Rc<IoCompletion>>>,
    comp_key: Cell<u64>,
    comp_flags: Cell<CompletionFlags>,
}

impl fmt::Debug for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fd(unix_fd={}, access={}, options={:?})",
            self.unix_fd.get(),
            self.access.get(),
            self.options.get()
        )
    }
}

impl Fd {
    fn alloc(server: &Rc<Server>, register_poll: bool) -> Rc<Fd> {
        let fd = Rc::new(Fd {
            server: Rc::downgrade(server),
            user: RefCell::new(None),
            inode: RefCell::new(None),
            closed: RefCell::new(None),
            access: Cell::new(AccessMask::empty()),
            options: Cell::new(OpenOptions::empty()),
            sharing: Cell::new(ShareMode::empty()),
            unix_name: RefCell::new(None),
            unix_fd: Cell::new(-1),
            no_fd_status: Cell::new(Status::BAD_DEVICE_TYPE),
            cacheable: Cell::new(false),
            signaled: Cell::new(true),
            fs_locks: Cell::new(true),
            poll_index: Cell::new(None),
            locks: RefCell::new(Vec::new()),
            read_q: RefCell::new(None),
            write_q: RefCell::new(None),
            wait_q: RefCell::new(None),
            completion: RefCell::new(None),
            comp_key: Cell::new(0),
            comp_flags: Cell::new(CompletionFlags::empty()),
        });
        if register_poll {
            fd.poll_index.set(Some(server.poller().add_user(&fd)));
        }
        fd
    }

    /// A pseudo-fd: no unix fd at all, only option/async/completion state.
    pub fn alloc_pseudo<T: FdOps + KObject>(
        server: &Rc<Server>,
        user: &Rc<T>,
        options: OpenOptions,
    ) -> Rc<Fd> {
        let fd = Fd::alloc(server, false);
        fd.options.set(options);
        fd.signaled.set(false);
        fd.fs_locks.set(false);
        fd.set_user(user);
        fd
    }

    /// Wrap a unix fd the caller already owns (socketpair ends and the
    /// like). The unix fd is closed if allocation fails.
    pub fn create_anonymous<T: FdOps + KObject>(
        server: &Rc<Server>,
        unix_fd: libc::c_int,
        user: &Rc<T>,
        options: OpenOptions,
    ) -> Rc<Fd> {
        let fd = Fd::alloc(server, true);
        fd.unix_fd.set(unix_fd);
        fd.options.set(options);
        fd.set_user(user);
        fd
    }

    /// Attach the using object. Must happen exactly once per fd.
    pub fn set_user<T: FdOps + KObject>(&self, user: &Rc<T>) {
        let ops: Rc<dyn FdOps> = user.clone();
        let obj: Rc<dyn KObject> = user.clone();
        *self.user.borrow_mut() = Some(FdUser {
            ops: Rc::downgrade(&ops),
            obj: Rc::downgrade(&obj),
        });
    }

    pub fn ops(&self) -> Option<Rc<dyn FdOps>> {
        self.user.borrow().as_ref().and_then(|u| u.ops.upgrade())
    }

    pub fn user_object(&self) -> Option<ObjRef> {
        self.user.borrow().as_ref().and_then(|u| u.obj.upgrade())
    }

    pub fn server(&self) -> Option<Rc<Server>> {
        self.server.upgrade()
    }

    /// The unix fd, or the fd's `no_fd_status` error when there is none.
    pub fn unix_fd(&self) -> SvResult<libc::c_int> {
        let fd = self.unix_fd.get();
        if fd == -1 { Err(self.no_fd_status.get()) } else { Ok(fd) }
    }

    pub fn raw_unix_fd(&self) -> libc::c_int {
        self.unix_fd.get()
    }

    pub fn unix_name(&self) -> Option<PathBuf> {
        self.unix_name.borrow().clone()
    }

    pub fn inode(&self) -> Option<Rc<Inode>> {
        self.inode.borrow().clone()
    }

    pub fn access(&self) -> AccessMask {
        self.access.get()
    }

    pub(crate) fn set_access(&self, access: AccessMask) {
        self.access.set(access);
    }

    pub fn sharing(&self) -> ShareMode {
        self.sharing.get()
    }

    pub(crate) fn set_sharing(&self, sharing: ShareMode) {
        self.sharing.set(sharing);
    }

    pub fn options(&self) -> OpenOptions {
        self.options.get()
    }

    pub fn set_no_fd_status(&self, status: Status) {
        self.no_fd_status.set(status);
    }

    /// Can the client cache this fd locally?
    pub fn is_cacheable(&self) -> bool {
        self.cacheable.get()
    }

    pub fn allow_caching(&self) {
        self.cacheable.set(true);
    }

    pub fn is_removable(&self) -> bool {
        self.inode
            .borrow()
            .as_ref()
            .is_some_and(|inode| inode.device.is_removable())
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.get()
    }

    /// Set or clear the signaled state, waking waiters on the user object.
    pub fn set_signaled(&self, signaled: bool) {
        self.signaled.set(signaled);
        if signaled {
            if let Some(obj) = self.user_object() {
                wake_up(&obj, 0);
            }
        }
    }

    /// True when both fds reference the same on-disk file.
    pub fn is_same_file(&self, other: &Fd) -> bool {
        match (self.inode.borrow().as_ref(), other.inode.borrow().as_ref()) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Change the events the poll layer waits for; `None` stops polling
    /// this fd for good.
    pub fn set_fd_events(&self, events: Option<PollEvents>) {
        let (Some(server), Some(index)) = (self.server.upgrade(), self.poll_index.get()) else {
            return;
        };
        server.poller().set_events(index, self.unix_fd.get(), events);
    }

    /// Check which of `events` are pending right now. Regular files are
    /// always ready.
    pub fn check_events(&self, events: PollEvents) -> PollEvents {
        let unix_fd = self.unix_fd.get();
        if unix_fd == -1 {
            return PollEvents::POLLERR;
        }
        if self.inode.borrow().is_some() {
            return events;
        }
        let mut pollfd = libc::pollfd { fd: unix_fd, events: events.bits() as i16, revents: 0 };
        if unsafe { libc::poll(&mut pollfd, 1, 0) } <= 0 {
            return PollEvents::empty();
        }
        PollEvents::from_bits_truncate(pollfd.revents as u32)
    }

    /// The async queue for a direction, created on first use.
    pub fn async_queue(self: &Rc<Self>, ty: AsyncType) -> Rc<AsyncQueue> {
        let slot = match ty {
            AsyncType::Read => &self.read_q,
            AsyncType::Write => &self.write_q,
            AsyncType::Wait => &self.wait_q,
        };
        let mut queue = slot.borrow_mut();
        match &*queue {
            Some(q) => q.clone(),
            None => {
                let q = AsyncQueue::new();
                q.attach_fd(self);
                *queue = Some(q.clone());
                q
            }
        }
    }

    fn existing_queue(&self, ty: AsyncType) -> Option<Rc<AsyncQueue>> {
        match ty {
            AsyncType::Read => self.read_q.borrow().clone(),
            AsyncType::Write => self.write_q.borrow().clone(),
            AsyncType::Wait => self.wait_q.borrow().clone(),
        }
    }

    /// True when a direction queue exists and holds entries.
    pub fn existing_queue_nonempty(&self, ty: AsyncType) -> bool {
        self.existing_queue(ty).is_some_and(|queue| !queue.is_empty())
    }

    /// True when a direction queue has a pending async.
    pub fn queue_waiting(&self, ty: AsyncType) -> bool {
        self.existing_queue(ty).is_some_and(|queue| queue.waiting())
    }

    /// Bind the fd to a completion port. Only one binding per fd.
    pub fn bind_completion(&self, completion: &Rc<IoCompletion>, key: u64) -> SvResult<()> {
        if self.completion.borrow().is_some() {
            return Err(Status::INVALID_PARAMETER);
        }
        *self.completion.borrow_mut() = Some(completion.clone());
        self.comp_key.set(key);
        Ok(())
    }

    pub fn set_completion_flags(&self, flags: CompletionFlags) {
        self.comp_flags.set(flags);
    }

    pub fn completion_binding(&self) -> Option<(Rc<IoCompletion>, u64, CompletionFlags)> {
        self.completion
            .borrow()
            .as_ref()
            .map(|c| (c.clone(), self.comp_key.get(), self.comp_flags.get()))
    }

    /// Copy the completion binding to another fd (used when a pipe's pseudo
    /// ioctl fd is replaced by the real connected fd).
    pub fn copy_completion_to(&self, dst: &Fd) {
        if let Some(completion) = self.completion.borrow().as_ref() {
            *dst.completion.borrow_mut() = Some(completion.clone());
            dst.comp_key.set(self.comp_key.get());
            dst.comp_flags.set(self.comp_flags.get());
        }
    }

    /// Mark or clear delete-on-close, with the checks a live inode demands.
    pub fn set_disposition(&self, unlink: bool) -> SvResult<()> {
        let inode = self.inode.borrow().clone().ok_or(Status::OBJECT_TYPE_MISMATCH)?;
        let unix_fd = self.unix_fd()?;
        let st = nix::sys::stat::fstat(unsafe {
            std::os::fd::BorrowedFd::borrow_raw(unix_fd)
        })
        .map_err(Status::from_errno)?;
        let fmt_bits = st.st_mode & libc::S_IFMT;
        if unlink && fmt_bits != libc::S_IFDIR && fmt_bits != libc::S_IFREG {
            return Err(Status::INVALID_PARAMETER);
        }
        if unlink && st.st_mode & (libc::S_IWUSR | libc::S_IWGRP | libc::S_IWOTH) == 0 {
            return Err(Status::CANNOT_DELETE);
        }
        if unlink {
            for other in inode.open_fds() {
                if !std::ptr::eq(&*other, self)
                    && other.access.get().intersects(AccessMask::FILE_MAPPING_ACCESS)
                {
                    return Err(Status::CANNOT_DELETE);
                }
            }
        }
        if let Some(closed) = self.closed.borrow().as_ref() {
            closed
                .unlink
                .set(unlink || self.options.get().contains(OpenOptions::DELETE_ON_CLOSE));
        }
        Ok(())
    }

    /// Tear the fd away from its device so the volume can be unmounted.
    pub fn unmount(&self, server: &Server) {
        if let Some(queue) = self.read_q.borrow().clone() {
            queue.wake_up(server, Status::VOLUME_DISMOUNTED);
        }
        if let Some(queue) = self.write_q.borrow().clone() {
            queue.wake_up(server, Status::VOLUME_DISMOUNTED);
        }
        self.set_fd_events(None);
        let unix_fd = self.unix_fd.replace(-1);
        if unix_fd != -1 {
            unsafe { libc::close(unix_fd) };
        }
        self.no_fd_status.set(Status::VOLUME_DISMOUNTED);
        if let Some(closed) = self.closed.borrow().as_ref() {
            closed.unix_fd.set(-1);
            closed.unlink.set(false);
        }
        // existing locks were removed by close; no further fs locking
        self.fs_locks.set(false);
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        remove_fd_locks(self);
        if let Some(index) = self.poll_index.take() {
            if let Some(server) = self.server.upgrade() {
                server.poller().remove_user(index);
            }
        }
        let inode = self.inode.get_mut().take();
        match inode {
            Some(inode) => {
                inode
                    .open
                    .borrow_mut()
                    .retain(|weak| !std::ptr::eq(weak.as_ptr(), self as *const Fd));
                if let Some(closed) = self.closed.get_mut().take() {
                    inode.add_closed_fd(closed);
                }
            }
            None => {
                let unix_fd = self.unix_fd.get();
                if unix_fd != -1 {
                    unsafe { libc::close(unix_fd) };
                }
            }
        }
    }
}

/* sharing checks */

/// Check the desired access against the sharing mode of every other open of
/// the same inode; the fd's access and sharing must already be set.
fn check_sharing(
    fd: &Fd,
    access: AccessMask,
    sharing: ShareMode,
    open_flags: libc::c_int,
    options: OpenOptions,
) -> Result<(), Status> {
    let read_access = AccessMask::FILE_READ_DATA | AccessMask::FILE_EXECUTE;
    let write_access = AccessMask::FILE_WRITE_DATA | AccessMask::FILE_APPEND_DATA;
    let all_access = read_access | write_access | AccessMask::DELETE;

    fd.access.set(access);
    fd.sharing.set(sharing);

    let inode = fd.inode.borrow().clone().expect("sharing check without inode");
    let mut existing_sharing = ShareMode::READ | ShareMode::WRITE | ShareMode::DELETE;
    let mut existing_access = AccessMask::empty();
    for other in inode.open_fds() {
        if std::ptr::eq(&*other, fd) {
            continue;
        }
        // an access mode of 0 means the sharing mode is ignored
        if other.access.get().intersects(all_access) {
            existing_sharing &= other.sharing.get();
        }
        existing_access |= other.access.get();
    }

    if (access.intersects(read_access) && !existing_sharing.contains(ShareMode::READ))
        || (access.intersects(write_access) && !existing_sharing.contains(ShareMode::WRITE))
        || (access.intersects(AccessMask::DELETE) && !existing_sharing.contains(ShareMode::DELETE))
    {
        return Err(Status::SHARING_VIOLATION);
    }
    if (existing_access.intersects(AccessMask::FILE_MAPPING_WRITE)
        && !sharing.contains(ShareMode::WRITE))
        || (existing_access.intersects(AccessMask::FILE_MAPPING_IMAGE)
            && access.intersects(AccessMask::FILE_WRITE_DATA))
    {
        return Err(Status::SHARING_VIOLATION);
    }
    if existing_access.intersects(AccessMask::FILE_MAPPING_IMAGE)
        && options.contains(OpenOptions::DELETE_ON_CLOSE)
    {
        return Err(Status::CANNOT_DELETE);
    }
    if existing_access.intersects(AccessMask::FILE_MAPPING_ACCESS) && open_flags & libc::O_TRUNC != 0
    {
        return Err(Status::USER_MAPPED_FILE);
    }
    if !access.intersects(all_access) {
        // access mode 0 ignores sharing (except for mappings, above)
        return Ok(());
    }
    if (existing_access.intersects(read_access) && !sharing.contains(ShareMode::READ))
        || (existing_access.intersects(write_access) && !sharing.contains(ShareMode::WRITE))
        || (existing_access.intersects(AccessMask::DELETE) && !sharing.contains(ShareMode::DELETE))
    {
        return Err(Status::SHARING_VIOLATION);
    }
    Ok(())
}

/* open paths */

fn combine_name(root: Option<&Rc<Fd>>, name: &Path) -> Option<PathBuf> {
    match root {
        None => Some(name.to_path_buf()),
        Some(root) => {
            let base = root.unix_name.borrow().clone()?;
            let mut rel = name;
            if let Ok(stripped) = rel.strip_prefix(".") {
                rel = stripped;
            }
            Some(base.join(rel))
        }
    }
}

struct CwdGuard {
    saved: libc::c_int,
}

impl CwdGuard {
    fn enter(root_fd: libc::c_int) -> SvResult<CwdGuard> {
        let saved = unsafe {
            libc::open(c".".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC)
        };
        if saved == -1 {
            return Err(Status::from_errno(Errno::last()));
        }
        if unsafe { libc::fchdir(root_fd) } == -1 {
            let err = Errno::last();
            unsafe { libc::close(saved) };
            return Err(Status::from_errno(err));
        }
        Ok(CwdGuard { saved })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        unsafe {
            libc::fchdir(self.saved);
            libc::close(self.saved);
        }
    }
}

/// `open()` wrapper producing an fd with no user set yet.
///
/// Opens relative to `root` when given (by way of a cwd hop, restored on
/// return). Regular files and directories get an inode and go through the
/// sharing checks; everything else is a "special" fd without one. `mode` is
/// updated to the file's actual mode.
pub fn open_fd(
    server: &Rc<Server>,
    root: Option<&Rc<Fd>>,
    name: &Path,
    mut flags: libc::c_int,
    mode: &mut libc::mode_t,
    access: AccessMask,
    sharing: ShareMode,
    options: OpenOptions,
) -> SvResult<Rc<Fd>> {
    if (options.contains(OpenOptions::DELETE_ON_CLOSE) && !access.contains(AccessMask::DELETE))
        || (options.contains(OpenOptions::DIRECTORY_FILE) && flags & libc::O_TRUNC != 0)
    {
        return Err(Status::INVALID_PARAMETER);
    }

    let fd = Fd::alloc(server, true);
    fd.options.set(options);

    let _cwd = match root {
        Some(root) => Some(CwdGuard::enter(root.unix_fd()?)?),
        None => None,
    };

    let c_name = CString::new(name.as_os_str().as_bytes()).map_err(|_| Status::OBJECT_NAME_INVALID)?;
    let mut created = flags & libc::O_CREAT != 0;
    let mut do_chmod = false;

    // create the directory if needed; read permission is granted during the
    // creation window and removed once the directory is open
    if options.contains(OpenOptions::DIRECTORY_FILE) && flags & libc::O_CREAT != 0 {
        if unsafe { libc::mkdir(c_name.as_ptr(), *mode | libc::S_IRUSR) } != -1 {
            do_chmod = *mode & libc::S_IRUSR == 0;
        } else {
            let err = Errno::last();
            if err != Errno::EEXIST || flags & libc::O_EXCL != 0 {
                return Err(Status::from_errno(err));
            }
            created = false;
        }
        flags &= !(libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC);
    }

    let rw_mode = if access.intersects(AccessMask::FILE_UNIX_WRITE_ACCESS)
        && !options.contains(OpenOptions::DIRECTORY_FILE)
    {
        if access.intersects(AccessMask::FILE_UNIX_READ_ACCESS) {
            libc::O_RDWR
        } else {
            libc::O_WRONLY
        }
    } else {
        libc::O_RDONLY
    };

    *fd.unix_name.borrow_mut() = combine_name(root, name);

    let mut unix_fd = unsafe {
        libc::open(c_name.as_ptr(), rw_mode | (flags & !libc::O_TRUNC), *mode as libc::c_uint)
    };
    if unix_fd == -1 {
        let err = Errno::last();
        if err == Errno::EISDIR {
            // asked for write access on a directory: retry read-only
            if access.intersects(AccessMask::FILE_UNIX_WRITE_ACCESS) || flags & libc::O_CREAT != 0 {
                unix_fd = unsafe {
                    libc::open(
                        c_name.as_ptr(),
                        libc::O_RDONLY | (flags & !(libc::O_TRUNC | libc::O_CREAT | libc::O_EXCL)),
                        *mode as libc::c_uint,
                    )
                };
            }
        } else if err == Errno::EACCES {
            // try a temporary chmod to open read-only through a
            // permission-denied file we own
            let interesting = (AccessMask::FILE_UNIX_WRITE_ACCESS
                | AccessMask::FILE_UNIX_READ_ACCESS
                | AccessMask::DELETE)
                & !AccessMask::FILE_WRITE_ATTRIBUTES;
            let st = nix::sys::stat::stat(name).ok();
            if let Some(st) = st {
                if !access.intersects(interesting)
                    && st.st_uid == nix::unistd::getuid().as_raw()
                    && unsafe { libc::chmod(c_name.as_ptr(), st.st_mode | libc::S_IRUSR) } == 0
                {
                    unix_fd = unsafe {
                        libc::open(
                            c_name.as_ptr(),
                            libc::O_RDONLY
                                | (flags & !(libc::O_TRUNC | libc::O_CREAT | libc::O_EXCL)),
                            *mode as libc::c_uint,
                        )
                    };
                    *mode = st.st_mode;
                    do_chmod = true;
                } else {
                    return Err(Status::ACCESS_DENIED);
                }
            } else {
                return Err(Status::ACCESS_DENIED);
            }
        }
        if unix_fd == -1 {
            let err = Status::from_errno(Errno::last());
            if do_chmod {
                unsafe { libc::chmod(c_name.as_ptr(), *mode) };
            }
            return Err(err);
        }
    }
    fd.unix_fd.set(unix_fd);

    if do_chmod {
        unsafe { libc::chmod(c_name.as_ptr(), *mode) };
    }

    let st = nix::sys::stat::fstat(unsafe { std::os::fd::BorrowedFd::borrow_raw(unix_fd) })
        .map_err(Status::from_errno)?;
    *mode = st.st_mode;

    let fmt_bits = st.st_mode & libc::S_IFMT;
    if fmt_bits == libc::S_IFREG || fmt_bits == libc::S_IFDIR {
        let inode = get_inode(server, st.st_dev as u64, st.st_ino as u64, unix_fd)
            .ok_or(Status::NO_MEMORY)?;
        fd.cacheable.set(!inode.device.is_removable());
        inode.open.borrow_mut().push(Rc::downgrade(&fd));
        *fd.inode.borrow_mut() = Some(inode);
        *fd.closed.borrow_mut() = Some(ClosedFd {
            unix_fd: Cell::new(unix_fd),
            unlink: Cell::new(false),
            unix_name: fd.unix_name.borrow().clone(),
        });

        if options.contains(OpenOptions::DIRECTORY_FILE) && fmt_bits != libc::S_IFDIR {
            return Err(Status::NOT_A_DIRECTORY);
        }
        if options.contains(OpenOptions::NON_DIRECTORY_FILE) && fmt_bits == libc::S_IFDIR {
            return Err(Status::FILE_IS_A_DIRECTORY);
        }
        check_sharing(&fd, access, sharing, flags, options)?;

        // can't unlink files we have no permission to access
        if options.contains(OpenOptions::DELETE_ON_CLOSE)
            && !created
            && st.st_mode & (libc::S_IWUSR | libc::S_IWGRP | libc::S_IWOTH) == 0
        {
            return Err(Status::CANNOT_DELETE);
        }
        if let Some(closed) = fd.closed.borrow().as_ref() {
            closed.unlink.set(options.contains(OpenOptions::DELETE_ON_CLOSE));
        }
        if flags & libc::O_TRUNC != 0 {
            if fmt_bits == libc::S_IFDIR {
                return Err(Status::OBJECT_NAME_COLLISION);
            }
            unsafe { libc::ftruncate(unix_fd, 0) };
        }
    } else {
        // special file: no inode, no deferred unlink
        if options.contains(OpenOptions::DELETE_ON_CLOSE) {
            return Err(Status::INVALID_PARAMETER);
        }
        fd.cacheable.set(true);
    }
    Ok(fd)
}

/// Duplicate an fd object for a different user, sharing the inode.
pub fn dup_fd_object(
    orig: &Rc<Fd>,
    access: AccessMask,
    sharing: ShareMode,
    options: OpenOptions,
) -> SvResult<Rc<Fd>> {
    let server = orig.server.upgrade().ok_or(Status::UNSUCCESSFUL)?;
    let fd = Fd::alloc(&server, true);
    fd.options.set(options);
    fd.cacheable.set(orig.cacheable.get());
    *fd.unix_name.borrow_mut() = orig.unix_name.borrow().clone();

    let unix_fd = unsafe { libc::dup(orig.unix_fd.get()) };
    if unix_fd == -1 {
        return Err(Status::from_errno(Errno::last()));
    }
    fd.unix_fd.set(unix_fd);

    if let Some(inode) = orig.inode.borrow().clone() {
        *fd.closed.borrow_mut() = Some(ClosedFd {
            unix_fd: Cell::new(unix_fd),
            unlink: Cell::new(false),
            unix_name: fd.unix_name.borrow().clone(),
        });
        inode.open.borrow_mut().push(Rc::downgrade(&fd));
        *fd.inode.borrow_mut() = Some(inode);
        check_sharing(&fd, access, sharing, 0, options)?;
    } else {
        fd.access.set(access);
        fd.sharing.set(sharing);
    }
    Ok(fd)
}

/// Reuse an open fd on the same inode with identical access and sharing,
/// as the mapping code wants.
pub fn get_fd_object_for_mapping(
    fd: &Rc<Fd>,
    access: AccessMask,
    sharing: ShareMode,
) -> Option<Rc<Fd>> {
    let inode = fd.inode.borrow().clone()?;
    inode
        .open_fds()
        .into_iter()
        .find(|other| other.access.get() == access && other.sharing.get() == sharing)
}

/* byte-range locks */

fn set_unix_lock(fd: &Fd, start: u64, mut end: u64, mut lock_type: libc::c_int) -> SvResult<()> {
    if !fd.fs_locks.get() {
        return Ok(());
    }
    loop {
        if start == end {
            return Ok(()); // can't set a zero-byte lock
        }
        let max_offset = MAX_UNIX_OFFSET.with(Cell::get);
        if start > max_offset {
            return Ok(()); // ignore it
        }
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = lock_type as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = start as libc::off_t;
        fl.l_len = if end == 0 || end > max_offset { 0 } else { (end - start) as libc::off_t };
        if unsafe { libc::fcntl(fd.unix_fd.get(), libc::F_SETLK, &fl) } != -1 {
            return Ok(());
        }
        match Errno::last() {
            Errno::EACCES => {
                // check whether locks work at all on this file system
                if unsafe { libc::fcntl(fd.unix_fd.get(), libc::F_GETLK, &mut fl) } != -1 {
                    return Err(Status::FILE_LOCK_CONFLICT);
                }
                fd.fs_locks.set(false);
                return Ok(());
            }
            Errno::EIO | Errno::ENOLCK | Errno::ENOTSUP => {
                // no locking on this fs, treat locks as advisory-only
                fd.fs_locks.set(false);
                return Ok(());
            }
            Errno::EAGAIN => return Err(Status::FILE_LOCK_CONFLICT),
            Errno::EBADF => {
                // write lock on a read-only file: grab a read lock instead
                if lock_type == libc::F_WRLCK {
                    lock_type = libc::F_RDLCK;
                    continue;
                }
                return Err(Status::ACCESS_DENIED);
            }
            Errno::EINVAL | Errno::EOVERFLOW => {
                // off_t is 64-bit but the kernel only takes 32: shrink the
                // limit once and retry
                if max_offset > i32::MAX as u64 {
                    MAX_UNIX_OFFSET.with(|c| c.set(i32::MAX as u64));
                    if end > i32::MAX as u64 {
                        end = 0;
                    }
                    continue;
                }
                return Err(Status::INVALID_PARAMETER);
            }
            err => return Err(Status::from_errno(err)),
        }
    }
}

/// Remove unix locks for every byte in `[start, end)` that no remaining
/// lock on the inode still covers.
fn remove_unix_locks(fd: &Fd, start: u64, mut end: u64) {
    let Some(inode) = fd.inode.borrow().clone() else { return };
    if !fd.fs_locks.get() {
        return;
    }
    let max_offset = MAX_UNIX_OFFSET.with(Cell::get);
    if start == end || start > max_offset {
        return;
    }
    if end == 0 || end > max_offset {
        end = max_offset + 1;
    }
    // subtract every live lock from the unlock interval
    let mut holes: Vec<(u64, u64)> = vec![(start, end)];
    for lock in inode.locks.borrow().iter() {
        if lock.start == lock.end {
            continue;
        }
        if !lock.overlaps(start, end) {
            continue;
        }
        let lock_end = if lock.end == 0 { u64::MAX } else { lock.end };
        let mut next: Vec<(u64, u64)> = Vec::with_capacity(holes.len() + 1);
        for (hole_start, hole_end) in holes {
            if hole_end <= lock.start || hole_start >= lock_end {
                next.push((hole_start, hole_end));
                continue;
            }
            if hole_start < lock.start {
                next.push((hole_start, lock.start));
            }
            if lock_end < hole_end {
                next.push((lock_end, hole_end));
            }
        }
        holes = next;
        if holes.is_empty() {
            return;
        }
    }
    for (hole_start, hole_end) in holes {
        let _ = set_unix_lock(fd, hole_start, hole_end, libc::F_UNLCK);
    }
}

fn add_lock(
    fd: &Rc<Fd>,
    process: &Rc<Process>,
    shared: bool,
    start: u64,
    end: u64,
) -> SvResult<Rc<FileLock>> {
    let lock = Rc::new(FileLock {
        header: ObjectHeader::new(),
        fd: RefCell::new(Rc::downgrade(fd)),
        shared,
        start,
        end,
        process: RefCell::new(Some(Rc::downgrade(process))),
    });
    set_unix_lock(fd, start, end, if shared { libc::F_RDLCK } else { libc::F_WRLCK })?;
    fd.locks.borrow_mut().push(lock.clone());
    let inode = fd.inode.borrow().clone().expect("lock without inode");
    inode.locks.borrow_mut().push(lock.clone());
    process.register_lock(&lock);
    Ok(lock)
}

fn remove_lock(lock: &Rc<FileLock>, remove_unix: bool) {
    let fd = lock.fd.borrow().upgrade();
    if let Some(fd) = &fd {
        fd.locks.borrow_mut().retain(|l| !Rc::ptr_eq(l, lock));
        if let Some(inode) = fd.inode.borrow().clone() {
            inode.locks.borrow_mut().retain(|l| !Rc::ptr_eq(l, lock));
            if remove_unix {
                remove_unix_locks(fd, lock.start, lock.end);
            }
            if inode.locks.borrow().is_empty() {
                inode.close_pending(true);
            }
        }
    }
    if let Some(process) = lock.process.borrow_mut().take().and_then(|weak| weak.upgrade()) {
        process.unregister_lock(lock);
    }
    let obj: ObjRef = lock.clone();
    wake_up(&obj, 0);
}

/// Remove every lock owned by a dying process.
pub fn remove_process_locks(process: &Process) {
    for lock in process.take_locks() {
        remove_lock(&lock, true);
    }
}

fn remove_fd_locks(fd: &Fd) {
    let mut span_start = u64::MAX;
    let mut span_end = 0u64;
    loop {
        let lock = fd.locks.borrow().first().cloned();
        let Some(lock) = lock else { break };
        span_start = span_start.min(lock.start);
        if lock.end == 0 {
            span_end = u64::MAX;
        } else {
            span_end = span_end.max(lock.end);
        }
        remove_lock(&lock, false);
    }
    if span_start < span_end {
        remove_unix_locks(fd, span_start, span_end);
    }
}

/// Add a byte-range lock. A conflicting server-side lock yields
/// `LockResult::Pending` with the lock object to wait on (when `wait` was
/// requested) or `FILE_LOCK_CONFLICT`.
pub fn lock_fd(
    fd: &Rc<Fd>,
    process: &Rc<Process>,
    start: u64,
    count: u64,
    shared: bool,
    wait: bool,
) -> SvResult<LockResult> {
    let inode = fd.inode.borrow().clone().ok_or(Status::INVALID_DEVICE_REQUEST)?;
    let end = start.wrapping_add(count);
    if end != 0 && end < start {
        return Err(Status::INVALID_PARAMETER);
    }

    // another lock on the file overlapping the range?
    let conflicting = inode.locks.borrow().iter().find_map(|lock| {
        if !lock.overlaps(start, end) {
            return None;
        }
        let same_fd = lock
            .fd
            .borrow()
            .upgrade()
            .is_some_and(|lock_fd| Rc::ptr_eq(&lock_fd, fd));
        if shared && (lock.shared || same_fd) {
            return None;
        }
        Some(lock.clone())
    });
    if let Some(lock) = conflicting {
        if !wait {
            return Err(Status::FILE_LOCK_CONFLICT);
        }
        return Ok(LockResult::Pending(lock));
    }

    match add_lock(fd, process, shared, start, end) {
        Ok(_) => Ok(LockResult::Granted),
        Err(Status::FILE_LOCK_CONFLICT) if wait => {
            // unix-level conflict from another server process: tell the
            // client to retry
            Err(Status::PENDING)
        }
        Err(err) => Err(err),
    }
}

/// Remove a lock with the exact same range.
pub fn unlock_fd(fd: &Rc<Fd>, start: u64, count: u64) -> SvResult<()> {
    let end = start.wrapping_add(count);
    let lock = fd
        .locks
        .borrow()
        .iter()
        .find(|lock| lock.start == start && lock.end == end)
        .cloned();
    match lock {
        Some(lock) => {
            remove_lock(&lock, true);
            Ok(())
        }
        None => Err(Status::FILE_LOCK_CONFLICT),
    }
}

/* default fd callbacks */

/// Default `signaled` for objects that poll an fd.
pub fn default_fd_signaled(obj: &dyn KObject) -> bool {
    match obj.get_fd() {
        Ok(fd) => fd.is_signaled(),
        Err(_) => false,
    }
}

pub fn default_fd_get_poll_events(fd: &Fd) -> PollEvents {
    let mut events = PollEvents::empty();
    if fd.read_q.borrow().as_ref().is_some_and(|q| q.waiting()) {
        events |= PollEvents::POLLIN;
    }
    if fd.write_q.borrow().as_ref().is_some_and(|q| q.waiting()) {
        events |= PollEvents::POLLOUT;
    }
    events
}

/// Default poll-event handler: wake the direction queues and reselect.
pub fn default_poll_event(server: &Server, fd: &Rc<Fd>, events: PollEvents) {
    if events.intersects(PollEvents::POLLIN | PollEvents::POLLERR | PollEvents::POLLHUP) {
        if let Some(queue) = fd.read_q.borrow().clone() {
            queue.wake_up(server, Status::ALERTED);
        }
    }
    if events.intersects(PollEvents::POLLOUT | PollEvents::POLLERR | PollEvents::POLLHUP) {
        if let Some(queue) = fd.write_q.borrow().clone() {
            queue.wake_up(server, Status::ALERTED);
        }
    }
    if events.intersects(PollEvents::POLLERR | PollEvents::POLLHUP) {
        // stop polling this fd to avoid busy-looping on the error
        fd.set_fd_events(None);
    } else if fd.inode.borrow().is_none() {
        if let Some(ops) = fd.ops() {
            fd.set_fd_events(Some(ops.get_poll_events(fd)));
        }
    }
}

/// Queue an async on one of the fd's queues and update polling. Regular
/// files are always ready, so their asyncs complete immediately.
pub fn fd_queue_async(server: &Server, fd: &Rc<Fd>, async_op: &Rc<Async>, ty: AsyncType) {
    let queue = fd.async_queue(ty);
    queue.queue(async_op);
    if ty != AsyncType::Wait {
        if fd.inode.borrow().is_none() {
            if let Some(ops) = fd.ops() {
                fd.set_fd_events(Some(ops.get_poll_events(fd)));
            }
        } else {
            queue.wake_up(server, Status::ALERTED);
        }
    }
}

pub fn fd_async_wake_up(server: &Server, fd: &Fd, ty: AsyncType, status: Status) {
    if let Some(queue) = fd.existing_queue(ty) {
        queue.wake_up(server, status);
    }
}

pub fn default_fd_queue_async(
    server: &Server,
    fd: &Rc<Fd>,
    async_op: &Rc<Async>,
    ty: AsyncType,
) -> SvResult<Status> {
    fd_queue_async(server, fd, async_op, ty);
    Ok(Status::PENDING)
}

pub fn default_fd_reselect_async(server: &Server, fd: &Rc<Fd>, queue: &Rc<AsyncQueue>) {
    let is_wait_q = fd
        .wait_q
        .borrow()
        .as_ref()
        .is_some_and(|wait_q| Rc::ptr_eq(wait_q, queue));
    if is_wait_q {
        return;
    }
    let Some(ops) = fd.ops() else { return };
    let poll_events = ops.get_poll_events(fd);
    let events = fd.check_events(poll_events);
    if !events.is_empty() {
        ops.poll_event(server, fd, events);
    } else {
        fd.set_fd_events(Some(poll_events));
    }
}

/// `FSCTL_DISMOUNT_VOLUME`.
pub const FSCTL_DISMOUNT_VOLUME: u32 = 0x0009_0020;

pub fn default_fd_ioctl(
    server: &Server,
    fd: &Rc<Fd>,
    code: u32,
    _async_op: &Rc<Async>,
) -> SvResult<Status> {
    match code {
        FSCTL_DISMOUNT_VOLUME => {
            unmount_device(server, fd)?;
            Ok(Status::SUCCESS)
        }
        _ => Err(Status::NOT_SUPPORTED),
    }
}

/// Close every unix fd on a device so the volume can be unmounted.
pub fn unmount_device(server: &Server, device_fd: &Rc<Fd>) -> SvResult<()> {
    let unix_fd = device_fd.unix_fd()?;
    let st = nix::sys::stat::fstat(unsafe { std::os::fd::BorrowedFd::borrow_raw(unix_fd) })
        .map_err(Status::from_errno)?;
    if st.st_mode & libc::S_IFMT != libc::S_IFBLK {
        return Err(Status::INVALID_PARAMETER);
    }
    let Some(device) = get_device(server, st.st_rdev as u64, -1) else {
        return Ok(());
    };
    let inodes: Vec<Rc<Inode>> = device
        .inodes
        .borrow()
        .values()
        .filter_map(Weak::upgrade)
        .collect();
    for inode in inodes {
        for fd in inode.open_fds() {
            fd.unmount(server);
        }
        inode.close_pending(false);
    }
    server.devices().borrow_mut().remove(&device.dev);
    Ok(())
}
