//! Directory change notifications
//!
//! One inotify fd in the server demultiplexes events for every watch. The
//! notifier mirrors each watched subtree as a tree of nodes, each holding
//! the kernel watch descriptor, its basename relative to its parent, and
//! the list of watches interested in it. Events are translated to Windows
//! actions, given a relative path assembled by walking up the node tree,
//! and queued on every watch whose filter matches (ancestors only when
//! watching the subtree).
//!
//! On hosts without inotify the dnotify fallback applies: `F_NOTIFY` per
//! directory fd, with the SIGIO handler only bumping a counter that
//! [`sigio_callback`] drains at the next poll boundary.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use bitflags::bitflags;

use crate::access::AccessMask;
use crate::access::OpenOptions;
use crate::access::ShareMode;
use crate::async_io::Async;
use crate::async_io::AsyncType;
use crate::fd::fd_async_wake_up;
use crate::fd::fd_queue_async;
use crate::fd::open_fd;
use crate::fd::Fd;
use crate::fd::FdOps;
use crate::fd::FdType;
use crate::object::KObject;
use crate::object::ObjectHeader;
use crate::poll::PollEvents;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;
use crate::wait::WaitQueueEntry;

bitflags! {
    /// `FILE_NOTIFY_CHANGE_*` filter bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NotifyFilter: u32 {
        const FILE_NAME = 0x0001;
        const DIR_NAME = 0x0002;
        const ATTRIBUTES = 0x0004;
        const SIZE = 0x0008;
        const LAST_WRITE = 0x0010;
        const LAST_ACCESS = 0x0020;
        const CREATION = 0x0040;
        const SECURITY = 0x0100;
    }
}

/// `FILE_ACTION_*` reported in change records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Added = 1,
    Removed = 2,
    Modified = 3,
    RenamedOldName = 4,
    RenamedNewName = 5,
}

/// One queued filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub cookie: u32,
    pub action: ChangeAction,
    /// Path relative to the watched directory, `\`-separated.
    pub name: String,
}

/// A node in the tree mirroring a watched subtree.
pub struct WatchNode {
    dev: u64,
    ino: u64,
    wd: Cell<i32>,
    name: RefCell<Option<String>>,
    parent: RefCell<Weak<WatchNode>>,
    children: RefCell<Vec<Rc<WatchNode>>>,
    watches: RefCell<Vec<Weak<DirWatch>>>,
    notifier: Weak<ChangeNotifier>,
}

impl Drop for WatchNode {
    fn drop(&mut self) {
        // reclaim the kernel watch and the hash entries once the last
        // interested watch lets go of the subtree
        let Some(notifier) = self.notifier.upgrade() else { return };
        let wd = self.wd.get();
        if wd != -1 {
            notifier.wd_map.borrow_mut().remove(&wd);
            if let Some(fd) = notifier.inotify_fd.borrow().as_ref() {
                if let Ok(unix_fd) = fd.unix_fd() {
                    unsafe { libc::inotify_rm_watch(unix_fd, wd) };
                }
            }
        }
        let mut nodes = notifier.nodes.borrow_mut();
        if nodes
            .get(&(self.dev, self.ino))
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            nodes.remove(&(self.dev, self.ino));
        }
    }
}

impl fmt::Debug for WatchNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WatchNode(wd={}, ino={})", self.wd.get(), self.ino)
    }
}

impl WatchNode {
    fn live_watches(&self) -> Vec<Rc<DirWatch>> {
        self.watches.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    /// Combined filter of the watches on this node and the subtree watches
    /// above it.
    fn combined_filter(self: &Rc<Self>, include_self: bool) -> NotifyFilter {
        let mut filter = NotifyFilter::empty();
        let mut is_parent = !include_self;
        let mut node = Some(self.clone());
        while let Some(cur) = node {
            for watch in cur.live_watches() {
                if watch.subtree.get() || !is_parent {
                    filter |= watch.filter.get();
                }
            }
            is_parent = true;
            node = cur.parent.borrow().upgrade();
        }
        filter
    }

    /// A unix path to this node, through `/proc/self/fd` of the first live
    /// watch up the tree.
    fn unix_path(&self) -> Option<PathBuf> {
        let watches = self.live_watches();
        if let Some(watch) = watches.first() {
            let unix_fd = watch.fd.unix_fd().ok()?;
            return Some(PathBuf::from(format!("/proc/self/fd/{unix_fd}")));
        }
        let name = self.name.borrow().clone()?;
        let parent = self.parent.borrow().upgrade()?;
        Some(parent.unix_path()?.join(name))
    }

    fn child_by_name(&self, name: &str) -> Option<Rc<WatchNode>> {
        self.children
            .borrow()
            .iter()
            .find(|child| child.name.borrow().as_deref() == Some(name))
            .cloned()
    }
}

/// The server-wide inotify multiplexer.
pub struct ChangeNotifier {
    inotify_fd: RefCell<Option<Rc<Fd>>>,
    nodes: RefCell<HashMap<(u64, u64), Weak<WatchNode>>>,
    wd_map: RefCell<HashMap<i32, Weak<WatchNode>>>,
    /// Watches using the dnotify fallback.
    dnotify_watches: RefCell<Vec<Weak<DirWatch>>>,
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeNotifier({} nodes)", self.nodes.borrow().len())
    }
}

/// The object owning the server's inotify fd in the poll loop.
#[derive(Debug)]
struct InotifySource {
    header: ObjectHeader,
}

impl KObject for InotifySource {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "InotifySource"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl FdOps for InotifySource {
    fn get_poll_events(&self, _fd: &Fd) -> PollEvents {
        PollEvents::POLLIN
    }

    fn poll_event(&self, server: &Server, fd: &Rc<Fd>, _events: PollEvents) {
        let Some(notifier) = server.notifier_slot().borrow().clone() else { return };
        notifier.drain_events(server, fd);
    }
}

/// Get or create the notifier for this server.
pub fn get_notifier(server: &Server) -> Rc<ChangeNotifier> {
    let mut slot = server.notifier_slot().borrow_mut();
    match &*slot {
        Some(notifier) => notifier.clone(),
        None => {
            let notifier = Rc::new(ChangeNotifier {
                inotify_fd: RefCell::new(None),
                nodes: RefCell::new(HashMap::new()),
                wd_map: RefCell::new(HashMap::new()),
                dnotify_watches: RefCell::new(Vec::new()),
            });
            *slot = Some(notifier.clone());
            notifier
        }
    }
}

impl ChangeNotifier {
    fn inotify_unix_fd(&self, server: &Server) -> Option<libc::c_int> {
        if let Some(fd) = self.inotify_fd.borrow().as_ref() {
            return fd.unix_fd().ok();
        }
        let unix_fd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC) };
        if unix_fd == -1 {
            return None;
        }
        let source = Rc::new(InotifySource { header: ObjectHeader::new() });
        let fd = Fd::create_anonymous(&server.self_rc(), unix_fd, &source, OpenOptions::empty());
        fd.set_fd_events(Some(PollEvents::POLLIN));
        // the source object must outlive the fd registration
        server.make_static(source);
        *self.inotify_fd.borrow_mut() = Some(fd);
        Some(unix_fd)
    }

    fn node_for(self: &Rc<Self>, dev: u64, ino: u64) -> Rc<WatchNode> {
        if let Some(node) = self.nodes.borrow().get(&(dev, ino)).and_then(Weak::upgrade) {
            return node;
        }
        let node = Rc::new(WatchNode {
            dev,
            ino,
            wd: Cell::new(-1),
            name: RefCell::new(None),
            parent: RefCell::new(Weak::new()),
            children: RefCell::new(Vec::new()),
            watches: RefCell::new(Vec::new()),
            notifier: Rc::downgrade(self),
        });
        self.nodes.borrow_mut().insert((dev, ino), Rc::downgrade(&node));
        node
    }

    fn node_from_wd(&self, wd: i32) -> Option<Rc<WatchNode>> {
        self.wd_map.borrow().get(&wd).and_then(Weak::upgrade)
    }

    fn set_node_wd(&self, node: &Rc<WatchNode>, wd: i32) {
        let old = node.wd.replace(wd);
        if old != -1 {
            self.wd_map.borrow_mut().remove(&old);
        }
        self.wd_map.borrow_mut().insert(wd, Rc::downgrade(node));
    }

    fn release_node(&self, node: &Rc<WatchNode>, server: &Server) {
        let wd = node.wd.replace(-1);
        if wd != -1 {
            self.wd_map.borrow_mut().remove(&wd);
            if let Some(unix_fd) = self.inotify_unix_fd(server) {
                unsafe { libc::inotify_rm_watch(unix_fd, wd) };
            }
        }
        self.nodes.borrow_mut().remove(&(node.dev, node.ino));
        if let Some(parent) = node.parent.borrow().upgrade() {
            parent.children.borrow_mut().retain(|child| !Rc::ptr_eq(child, node));
        }
        for child in node.children.borrow_mut().drain(..) {
            self.release_node(&child, server);
        }
    }

    fn add_inotify_watch(&self, server: &Server, path: &Path, filter: NotifyFilter) -> Option<i32> {
        let unix_fd = self.inotify_unix_fd(server)?;
        let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
        let wd = unsafe { libc::inotify_add_watch(unix_fd, c_path.as_ptr(), inotify_mask(filter)) };
        if wd == -1 { None } else { Some(wd) }
    }

    /// Hook a watch up to inotify, creating the node for its directory.
    fn adjust_changes(self: &Rc<Self>, server: &Server, watch: &Rc<DirWatch>) -> bool {
        if self.inotify_unix_fd(server).is_none() {
            return false;
        }
        let existing_node = watch.node.borrow().clone();
        let node = match existing_node {
            Some(node) => node,
            None => {
                let Ok(unix_fd) = watch.fd.unix_fd() else { return false };
                let Ok(st) = nix::sys::stat::fstat(unsafe {
                    std::os::fd::BorrowedFd::borrow_raw(unix_fd)
                }) else {
                    return false;
                };
                let node = self.node_for(st.st_dev as u64, st.st_ino as u64);
                node.watches.borrow_mut().push(Rc::downgrade(watch));
                *watch.node.borrow_mut() = Some(node.clone());
                node
            }
        };
        let filter = node.combined_filter(true);
        let Some(path) = node.unix_path() else { return false };
        let Some(wd) = self.add_inotify_watch(server, &path, filter) else { return false };
        self.set_node_wd(&node, wd);
        if watch.subtree.get() {
            self.register_existing_subtree(server, &node, &path);
        }
        true
    }

    /// Eagerly mirror existing subdirectories of a subtree watch so events
    /// below them are seen from the start.
    fn register_existing_subtree(self: &Rc<Self>, server: &Server, parent: &Rc<WatchNode>, path: &Path) {
        let Ok(entries) = std::fs::read_dir(path) else { return };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
            let child_path = path.join(&name);
            self.watch_child_dir(server, parent, &name, &child_path);
        }
    }

    fn watch_child_dir(
        self: &Rc<Self>,
        server: &Server,
        parent: &Rc<WatchNode>,
        name: &str,
        path: &Path,
    ) {
        let Ok(st) = nix::sys::stat::stat(path) else { return };
        let filter = parent.combined_filter(false);
        if filter.is_empty() {
            return;
        }
        let node = self.node_for(st.st_dev as u64, st.st_ino as u64);
        if node.parent.borrow().upgrade().is_none() {
            *node.parent.borrow_mut() = Rc::downgrade(parent);
            *node.name.borrow_mut() = Some(name.to_string());
            parent.children.borrow_mut().push(node.clone());
        }
        if node.wd.get() != -1 {
            return;
        }
        match self.add_inotify_watch(server, path, filter) {
            Some(wd) => {
                self.set_node_wd(&node, wd);
                self.register_existing_subtree(server, &node, path);
            }
            None => self.release_node(&node, server),
        }
    }

    /// Read and dispatch all pending inotify events.
    fn drain_events(self: &Rc<Self>, server: &Server, fd: &Rc<Fd>) {
        let Ok(unix_fd) = fd.unix_fd() else { return };
        let mut buffer = [0u8; 0x1000];
        let got = unsafe { libc::read(unix_fd, buffer.as_mut_ptr().cast(), buffer.len()) };
        if got <= 0 {
            return;
        }
        let mut offset = 0usize;
        let header_len = std::mem::size_of::<libc::inotify_event>();
        while offset + header_len <= got as usize {
            let event = unsafe {
                buffer
                    .as_ptr()
                    .add(offset)
                    .cast::<libc::inotify_event>()
                    .read_unaligned()
            };
            let name_bytes = &buffer[offset + header_len..offset + header_len + event.len as usize];
            let name_end = memchr::memchr(0, name_bytes).unwrap_or(name_bytes.len());
            let name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();
            offset += header_len + event.len as usize;
            self.notify_all(server, event.wd, event.mask, event.cookie, &name);
        }
    }

    /// Translate one inotify event and deliver it to every interested
    /// watch up the node tree.
    fn notify_all(self: &Rc<Self>, server: &Server, wd: i32, mask: u32, cookie: u32, name: &str) {
        let Some(node) = self.node_from_wd(wd) else {
            log::debug!("no watch node matches wd {wd}");
            return;
        };
        let filter = filter_from_mask(mask);
        let action = if mask & libc::IN_CREATE != 0 {
            if mask & libc::IN_ISDIR != 0 {
                // a new directory extends every subtree watch above it
                if let Some(path) = node.unix_path() {
                    self.watch_child_dir(server, &node, name, &path.join(name));
                }
            }
            ChangeAction::Added
        } else if mask & libc::IN_DELETE != 0 {
            ChangeAction::Removed
        } else if mask & libc::IN_MOVED_FROM != 0 {
            ChangeAction::RenamedOldName
        } else if mask & libc::IN_MOVED_TO != 0 {
            ChangeAction::RenamedNewName
        } else {
            ChangeAction::Modified
        };

        // walk up the tree, prepending basenames as we go and notifying
        // the recursive watchers
        let mut path = name.to_string();
        let mut cur = Some(node.clone());
        let mut at_origin = true;
        while let Some(i) = cur {
            for watch in i.live_watches() {
                if filter.intersects(watch.filter.get()) && (at_origin || watch.subtree.get()) {
                    watch.push_record(server, action, cookie, &path);
                }
            }
            let parent_name = i.name.borrow().clone();
            match parent_name {
                Some(parent_name) => path = format!("{parent_name}\\{path}"),
                None => break,
            }
            at_origin = false;
            cur = i.parent.borrow().upgrade();
        }

        if mask & libc::IN_DELETE != 0 {
            if let Some(child) = node.child_by_name(name) {
                self.release_node(&child, server);
            }
        }
    }
}

fn filter_from_mask(mask: u32) -> NotifyFilter {
    let mut filter = NotifyFilter::empty();
    if mask & (libc::IN_MOVED_FROM | libc::IN_MOVED_TO | libc::IN_DELETE | libc::IN_CREATE) != 0 {
        filter |= NotifyFilter::FILE_NAME | NotifyFilter::DIR_NAME;
    }
    if mask & libc::IN_MODIFY != 0 {
        filter |= NotifyFilter::SIZE | NotifyFilter::LAST_WRITE;
    }
    if mask & libc::IN_ATTRIB != 0 {
        filter |= NotifyFilter::ATTRIBUTES | NotifyFilter::SECURITY;
    }
    if mask & libc::IN_ACCESS != 0 {
        filter |= NotifyFilter::LAST_ACCESS;
    }
    if mask & libc::IN_CREATE != 0 {
        filter |= NotifyFilter::CREATION;
    }
    if mask & libc::IN_ISDIR != 0 {
        filter &= !NotifyFilter::FILE_NAME;
    } else {
        filter &= !NotifyFilter::DIR_NAME;
    }
    filter
}

fn inotify_mask(filter: NotifyFilter) -> u32 {
    // always watch names so recursive watches can track subdirectories
    let mut mask = libc::IN_MOVED_FROM
        | libc::IN_MOVED_TO
        | libc::IN_DELETE
        | libc::IN_CREATE
        | libc::IN_DELETE_SELF;
    if filter.contains(NotifyFilter::ATTRIBUTES) || filter.contains(NotifyFilter::SECURITY) {
        mask |= libc::IN_ATTRIB;
    }
    if filter.intersects(NotifyFilter::SIZE | NotifyFilter::LAST_WRITE) {
        mask |= libc::IN_MODIFY;
    }
    if filter.contains(NotifyFilter::LAST_ACCESS) {
        mask |= libc::IN_ACCESS;
    }
    mask
}

/// A directory watch object (one `NtNotifyChangeDirectoryFile` consumer).
pub struct DirWatch {
    header: ObjectHeader,
    fd: Rc<Fd>,
    filter: Cell<NotifyFilter>,
    subtree: Cell<bool>,
    want_data: Cell<bool>,
    /// dnotify fallback counter, bumped from the signal path only.
    notified: AtomicU32,
    records: RefCell<VecDeque<ChangeRecord>>,
    node: RefCell<Option<Rc<WatchNode>>>,
}

impl fmt::Debug for DirWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DirWatch(filter={:?}, subtree={}, records={})",
            self.filter.get(),
            self.subtree.get(),
            self.records.borrow().len()
        )
    }
}

impl DirWatch {
    /// Wrap an already-open directory fd.
    pub fn create_from_fd(fd: Rc<Fd>) -> Rc<DirWatch> {
        let watch = Rc::new(DirWatch {
            header: ObjectHeader::new(),
            fd: fd.clone(),
            filter: Cell::new(NotifyFilter::empty()),
            subtree: Cell::new(false),
            want_data: Cell::new(true),
            notified: AtomicU32::new(0),
            records: RefCell::new(VecDeque::new()),
            node: RefCell::new(None),
        });
        fd.set_user(&watch);
        watch
    }

    /// Open a directory by unix path for watching.
    pub fn open(server: &Rc<Server>, path: &Path) -> SvResult<Rc<DirWatch>> {
        let mut mode = 0o777;
        let fd = open_fd(
            server,
            None,
            path,
            0,
            &mut mode,
            AccessMask::FILE_READ_DATA | AccessMask::SYNCHRONIZE,
            ShareMode::READ | ShareMode::WRITE | ShareMode::DELETE,
            OpenOptions::DIRECTORY_FILE,
        )?;
        Ok(DirWatch::create_from_fd(fd))
    }

    pub fn filter(&self) -> NotifyFilter {
        self.filter.get()
    }

    /// Begin (or continue) watching: parks `async_op` until a change
    /// arrives. The filter is assigned on the first call only.
    pub fn read_directory_changes(
        self: &Rc<Self>,
        server: &Server,
        filter: NotifyFilter,
        subtree: bool,
        want_data: bool,
        async_op: &Rc<Async>,
    ) -> SvResult<Status> {
        if filter.is_empty() {
            return Err(Status::INVALID_PARAMETER);
        }
        fd_queue_async(server, &self.fd, async_op, AsyncType::Wait);
        if self.filter.get().is_empty() {
            let notifier = get_notifier(server);
            self.filter.set(filter);
            self.subtree.set(subtree);
            self.want_data.set(want_data);
            if !notifier.adjust_changes(server, self) {
                self.dnotify_adjust_changes(server, &notifier);
            }
        }
        // a change that arrived before this request completes it at once
        if !self.records.borrow().is_empty() {
            fd_async_wake_up(server, &self.fd, AsyncType::Wait, Status::ALERTED);
        }
        Ok(Status::PENDING)
    }

    fn push_record(&self, server: &Server, action: ChangeAction, cookie: u32, name: &str) {
        if self.want_data.get() {
            self.records.borrow_mut().push_back(ChangeRecord {
                cookie,
                action,
                name: name.to_string(),
            });
        }
        fd_async_wake_up(server, &self.fd, AsyncType::Wait, Status::ALERTED);
    }

    /// Drain the queued records, resolving rename pairs: an old/new pair
    /// sharing a cookie stays a rename, unmatched halves degrade to
    /// remove/add.
    pub fn read_changes(&self) -> SvResult<Vec<ChangeRecord>> {
        let drained: Vec<ChangeRecord> = self.records.borrow_mut().drain(..).collect();
        if drained.is_empty() {
            return Err(Status::NO_DATA_DETECTED);
        }
        let mut out: Vec<ChangeRecord> = Vec::with_capacity(drained.len());
        let mut iter = drained.into_iter().peekable();
        while let Some(mut record) = iter.next() {
            match record.action {
                ChangeAction::RenamedOldName => {
                    let paired = iter
                        .peek()
                        .is_some_and(|next| {
                            next.action == ChangeAction::RenamedNewName
                                && next.cookie == record.cookie
                        });
                    if !paired {
                        record.action = ChangeAction::Removed;
                    }
                }
                ChangeAction::RenamedNewName => {
                    let prev_was_pair = out
                        .last()
                        .is_some_and(|prev| {
                            prev.action == ChangeAction::RenamedOldName
                                && prev.cookie == record.cookie
                        });
                    if !prev_was_pair {
                        record.action = ChangeAction::Added;
                    }
                }
                _ => {}
            }
            out.push(record);
        }
        Ok(out)
    }

    fn dnotify_adjust_changes(self: &Rc<Self>, server: &Server, notifier: &Rc<ChangeNotifier>) {
        #[cfg(target_os = "linux")]
        {
            const F_NOTIFY: libc::c_int = 1026;
            const DN_MODIFY: libc::c_long = 0x0002;
            const DN_CREATE: libc::c_long = 0x0004;
            const DN_DELETE: libc::c_long = 0x0008;
            const DN_RENAME: libc::c_long = 0x0010;
            const DN_ATTRIB: libc::c_long = 0x0020;
            const DN_MULTISHOT: libc::c_long = 0x8000_0000u32 as libc::c_long;
            let Ok(unix_fd) = self.fd.unix_fd() else { return };
            let filter = self.filter.get();
            let mut mask = DN_CREATE | DN_DELETE | DN_RENAME | DN_MULTISHOT;
            if filter.intersects(NotifyFilter::SIZE | NotifyFilter::LAST_WRITE) {
                mask |= DN_MODIFY;
            }
            if filter.intersects(NotifyFilter::ATTRIBUTES | NotifyFilter::SECURITY) {
                mask |= DN_ATTRIB;
            }
            unsafe { libc::fcntl(unix_fd, F_NOTIFY, mask) };
        }
        let _ = server;
        notifier.dnotify_watches.borrow_mut().push(Rc::downgrade(self));
    }
}

impl KObject for DirWatch {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "File"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header.enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, _entry: &WaitQueueEntry) -> bool {
        self.fd.is_signaled()
    }

    fn get_fd(&self) -> SvResult<Rc<Fd>> {
        Ok(self.fd.clone())
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_file()
    }
}

impl FdOps for DirWatch {
    fn get_poll_events(&self, _fd: &Fd) -> PollEvents {
        PollEvents::empty()
    }

    fn fd_type(&self, _fd: &Fd) -> FdType {
        FdType::Dir
    }
}

/// Drain the dnotify counters at a safe poll boundary and wake the watches
/// whose directories changed.
pub fn sigio_callback(server: &Rc<Server>) {
    let Some(notifier) = server.notifier_slot().borrow().clone() else { return };
    let watches: Vec<Rc<DirWatch>> = {
        let mut list = notifier.dnotify_watches.borrow_mut();
        list.retain(|weak| weak.strong_count() > 0);
        list.iter().filter_map(Weak::upgrade).collect()
    };
    for watch in watches {
        // without siginfo routing the wakeup is conservative; the counter
        // only records that the signal fired
        watch.notified.swap(0, Ordering::Relaxed);
        fd_async_wake_up(server, &watch.fd, AsyncType::Wait, Status::ALERTED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;
    use tempfile::TempDir;

    fn pump_inotify(server: &Rc<Server>) {
        // dispatch pending inotify readiness without running the full loop
        for _ in 0..4 {
            let ready = server.poller().wait(50);
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

    fn watch_dir(
        server: &Rc<Server>,
        process: &Rc<Process>,
        path: &Path,
        filter: NotifyFilter,
        subtree: bool,
    ) -> Rc<DirWatch> {
        let watch = DirWatch::open(server, path).unwrap();
        let thread = process.main_thread().unwrap();
        let async_op = Async::new(&thread, 0, 0, None);
        watch
            .read_directory_changes(server, filter, subtree, true, &async_op)
            .unwrap();
        watch
    }

    #[test]
    fn non_recursive_watch_sees_direct_children_only() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let dir = TempDir::new().unwrap();
        let watch = watch_dir(
            &server,
            &process,
            dir.path(),
            NotifyFilter::FILE_NAME,
            false,
        );

        std::fs::write(dir.path().join("a"), b"x").unwrap();
        pump_inotify(&server);
        let records = watch.read_changes().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, ChangeAction::Added);
        assert_eq!(records[0].name, "a");

        // events under a subdirectory are not reported
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        pump_inotify(&server);
        let _ = watch.read_changes(); // drain the mkdir event, if any
        std::fs::write(dir.path().join("sub").join("b"), b"x").unwrap();
        pump_inotify(&server);
        assert_eq!(watch.read_changes().unwrap_err(), Status::NO_DATA_DETECTED);
    }

    #[test]
    fn subtree_watch_reports_relative_paths() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let watch = watch_dir(
            &server,
            &process,
            dir.path(),
            NotifyFilter::FILE_NAME,
            true,
        );

        std::fs::write(dir.path().join("sub").join("c"), b"x").unwrap();
        pump_inotify(&server);
        let records = watch.read_changes().unwrap();
        assert!(
            records
                .iter()
                .any(|r| r.action == ChangeAction::Added && r.name == "sub\\c"),
            "got {records:?}"
        );
    }

    #[test]
    fn subtree_watch_extends_to_new_directories() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let dir = TempDir::new().unwrap();
        let watch = watch_dir(
            &server,
            &process,
            dir.path(),
            NotifyFilter::FILE_NAME | NotifyFilter::DIR_NAME,
            true,
        );

        std::fs::create_dir(dir.path().join("fresh")).unwrap();
        pump_inotify(&server);
        let _ = watch.read_changes();

        std::fs::write(dir.path().join("fresh").join("inner"), b"x").unwrap();
        pump_inotify(&server);
        let records = watch.read_changes().unwrap();
        assert!(
            records
                .iter()
                .any(|r| r.action == ChangeAction::Added && r.name == "fresh\\inner"),
            "got {records:?}"
        );
    }

    #[test]
    fn rename_pairs_share_a_cookie() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("old"), b"x").unwrap();
        let watch = watch_dir(
            &server,
            &process,
            dir.path(),
            NotifyFilter::FILE_NAME,
            false,
        );

        std::fs::rename(dir.path().join("old"), dir.path().join("new")).unwrap();
        pump_inotify(&server);
        let records = watch.read_changes().unwrap();
        let old = records
            .iter()
            .find(|r| r.action == ChangeAction::RenamedOldName)
            .expect("old-name half");
        let new = records
            .iter()
            .find(|r| r.action == ChangeAction::RenamedNewName)
            .expect("new-name half");
        assert_eq!(old.cookie, new.cookie);
        assert_eq!(old.name, "old");
        assert_eq!(new.name, "new");
    }

    #[test]
    fn unmatched_rename_halves_degrade() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        std::fs::write(dir.path().join("leaving"), b"x").unwrap();
        let watch = watch_dir(
            &server,
            &process,
            dir.path(),
            NotifyFilter::FILE_NAME,
            false,
        );

        // rename out of the watched tree: only the old-name half arrives
        std::fs::rename(dir.path().join("leaving"), other.path().join("gone")).unwrap();
        pump_inotify(&server);
        let records = watch.read_changes().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, ChangeAction::Removed);
        assert_eq!(records[0].name, "leaving");
    }

    #[test]
    fn watch_async_wakes_on_change() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let dir = TempDir::new().unwrap();
        let watch = DirWatch::open(&server, dir.path()).unwrap();
        let thread = process.main_thread().unwrap();
        let async_op = Async::new(&thread, 0, 0, None);
        watch
            .read_directory_changes(&server, NotifyFilter::FILE_NAME, false, true, &async_op)
            .unwrap();
        assert!(async_op.is_pending());

        std::fs::write(dir.path().join("wake"), b"x").unwrap();
        pump_inotify(&server);
        assert_eq!(async_op.status(), Status::ALERTED);
    }
}
