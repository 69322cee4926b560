//! Server context and main loop
//!
//! One `Server` per daemon process bundles the state the original kept
//! global: the clock and timeout queue, the poll multiplexer, the
//! device/inode registries, the root of the object namespace, the PTID
//! allocator and the shutdown state machine. All request handling runs
//! between poll returns on a single thread; signal handlers only bump
//! atomic counters that the loop drains at its top.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use crate::access::Attributes;
use crate::fd::Device;
use crate::namespace::Directory;
use crate::object::ObjRef;
use crate::poll::Poller;
use crate::process::Process;
use crate::sync::Event;
use crate::timeout::TimeoutQueue;
use crate::timeout::TICKS_PER_SEC;

static SIGIO_COUNT: AtomicU32 = AtomicU32::new(0);
static SIGCHLD_COUNT: AtomicU32 = AtomicU32::new(0);
static SHUTDOWN_COUNT: AtomicU32 = AtomicU32::new(0);

extern "C" fn handle_sigio(_: libc::c_int) {
    SIGIO_COUNT.fetch_add(1, Ordering::Relaxed);
}

extern "C" fn handle_sigchld(_: libc::c_int) {
    SIGCHLD_COUNT.fetch_add(1, Ordering::Relaxed);
}

extern "C" fn handle_shutdown(_: libc::c_int) {
    SHUTDOWN_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Called from the dnotify signal path; the real work happens at the next
/// safe poll boundary.
pub fn bump_sigio() {
    SIGIO_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownStage {
    Running,
    /// Clients were told to exit and have a grace period.
    Phase1,
    /// Remaining non-system processes get terminated.
    Phase2,
}

/// Grace between shutdown phases.
const SHUTDOWN_GRACE: i64 = -3 * TICKS_PER_SEC;

/// The per-daemon server context.
pub struct Server {
    timeouts: TimeoutQueue,
    poller: Poller,
    devices: Rc<RefCell<HashMap<u64, Weak<Device>>>>,
    root: RefCell<Option<Rc<Directory>>>,
    next_ptid: Cell<u32>,
    processes: RefCell<Vec<Weak<Process>>>,
    shutdown_stage: Cell<ShutdownStage>,
    shutdown_event: RefCell<Option<Rc<Event>>>,
    notifier: RefCell<Option<Rc<crate::change::ChangeNotifier>>>,
    ifchange: RefCell<Option<ObjRef>>,
    shared_mappings: RefCell<Vec<Weak<crate::mapping::Mapping>>>,
    dirs: RefCell<Option<crate::server_dir::ServerDirs>>,
    /// Objects kept alive for the server's lifetime (the standard
    /// directories and devices).
    statics: RefCell<Vec<ObjRef>>,
    self_weak: RefCell<Weak<Server>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Server(processes={}, {:?}, {:?})",
            self.processes.borrow().len(),
            self.poller,
            self.timeouts
        )
    }
}

impl Server {
    fn alloc() -> Rc<Server> {
        let server = Rc::new(Server {
            timeouts: TimeoutQueue::new(),
            poller: Poller::new(),
            devices: Rc::new(RefCell::new(HashMap::new())),
            root: RefCell::new(None),
            next_ptid: Cell::new(8),
            processes: RefCell::new(Vec::new()),
            shutdown_stage: Cell::new(ShutdownStage::Running),
            shutdown_event: RefCell::new(None),
            notifier: RefCell::new(None),
            ifchange: RefCell::new(None),
            shared_mappings: RefCell::new(Vec::new()),
            dirs: RefCell::new(None),
            statics: RefCell::new(Vec::new()),
            self_weak: RefCell::new(Weak::new()),
        });
        *server.self_weak.borrow_mut() = Rc::downgrade(&server);
        server
    }

    /// A strong handle to this server, for code that only holds `&Server`.
    pub fn self_rc(&self) -> Rc<Server> {
        self.self_weak.borrow().upgrade().expect("server alive")
    }

    /// Keep an object alive for the server's lifetime.
    pub fn make_static(&self, obj: ObjRef) {
        self.statics.borrow_mut().push(obj);
    }

    fn init_directories(self: &Rc<Self>) {
        *self.root.borrow_mut() = Some(Directory::new(37));
        let attrs = Attributes::CASE_INSENSITIVE;
        let dirs: [(&str, usize); 3] =
            [("\\BaseNamedObjects", 37), ("\\Device", 7), ("\\KernelObjects", 7)];
        for (name, hash_size) in dirs {
            // the server keeps these alive for its whole lifetime
            match Directory::create(self, None, name, attrs, hash_size) {
                Ok(result) => self.make_static(result.obj),
                Err(err) => log::error!("creating {name} failed: {err}"),
            }
        }
        match crate::pipe::create_named_pipe_device(self, "\\Device\\NamedPipe") {
            Ok(device) => self.make_static(device),
            Err(err) => log::error!("creating named pipe device failed: {err}"),
        }
        let event = Event::create(self, None, "\\KernelObjects\\SystemShutdownEvent", attrs, true, false);
        if let Ok(event) = event {
            *self.shutdown_event.borrow_mut() = Some(event.obj);
        }
    }

    /// Create a fully initialized server and install its signal handlers.
    pub fn new() -> Rc<Server> {
        let server = Server::alloc();
        server.init_directories();
        server.install_signal_handlers();
        server
    }

    /// A server without process-wide signal handlers, for in-process tests.
    pub fn new_for_tests() -> Rc<Server> {
        let server = Server::alloc();
        server.init_directories();
        server
    }

    pub fn timeouts(&self) -> &TimeoutQueue {
        &self.timeouts
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub(crate) fn devices(&self) -> &Rc<RefCell<HashMap<u64, Weak<Device>>>> {
        &self.devices
    }

    pub fn root_directory(&self) -> ObjRef {
        self.root.borrow().clone().expect("namespace initialized")
    }

    pub fn shutdown_event(&self) -> Option<Rc<Event>> {
        self.shutdown_event.borrow().clone()
    }

    pub(crate) fn notifier_slot(&self) -> &RefCell<Option<Rc<crate::change::ChangeNotifier>>> {
        &self.notifier
    }

    pub(crate) fn ifchange_slot(&self) -> &RefCell<Option<ObjRef>> {
        &self.ifchange
    }

    pub(crate) fn shared_mappings(&self) -> &RefCell<Vec<Weak<crate::mapping::Mapping>>> {
        &self.shared_mappings
    }

    /// The daemon's config/server directories, once bootstrapped.
    pub fn server_dirs(&self) -> Option<crate::server_dir::ServerDirs> {
        self.dirs.borrow().clone()
    }

    pub fn set_server_dirs(&self, dirs: crate::server_dir::ServerDirs) {
        *self.dirs.borrow_mut() = Some(dirs);
    }

    /// Allocate a process or thread id.
    pub fn alloc_ptid(&self) -> u32 {
        let id = self.next_ptid.get();
        self.next_ptid.set(id + 4);
        id
    }

    pub(crate) fn register_process(&self, process: &Rc<Process>) {
        self.processes.borrow_mut().push(Rc::downgrade(process));
    }

    /// Live client processes.
    pub fn processes(&self) -> Vec<Rc<Process>> {
        let mut list = self.processes.borrow_mut();
        list.retain(|weak| weak.strong_count() > 0);
        list.iter().filter_map(Weak::upgrade).collect()
    }

    /// Convenience for tests: a fresh process with its initial thread.
    pub fn make_test_process(self: &Rc<Self>) -> Rc<Process> {
        Process::new(self, None, false)
    }

    fn install_signal_handlers(&self) {
        use nix::sys::signal;
        let make = |handler: extern "C" fn(libc::c_int)| {
            signal::SigAction::new(
                signal::SigHandler::Handler(handler),
                signal::SaFlags::SA_RESTART,
                signal::SigSet::empty(),
            )
        };
        unsafe {
            let _ = signal::sigaction(signal::Signal::SIGIO, &make(handle_sigio));
            let _ = signal::sigaction(signal::Signal::SIGCHLD, &make(handle_sigchld));
            let _ = signal::sigaction(signal::Signal::SIGHUP, &make(handle_shutdown));
            let _ = signal::sigaction(signal::Signal::SIGINT, &make(handle_shutdown));
            let _ = signal::sigaction(signal::Signal::SIGTERM, &make(handle_shutdown));
            let _ = signal::signal(signal::Signal::SIGPIPE, signal::SigHandler::SigIgn);
        }
    }

    /// Drain signal counters at a safe point. Handlers never touch object
    /// state; everything happens here.
    fn drain_signals(self: &Rc<Self>) {
        if SIGIO_COUNT.swap(0, Ordering::Relaxed) > 0 {
            crate::change::sigio_callback(self);
        }
        if SIGCHLD_COUNT.swap(0, Ordering::Relaxed) > 0 {
            self.reap_children();
        }
        if SHUTDOWN_COUNT.swap(0, Ordering::Relaxed) > 0 {
            self.start_shutdown();
        }
    }

    fn reap_children(self: &Rc<Self>) {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => self.client_died(pid.as_raw(), code as u32),
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.client_died(pid.as_raw(), 0x80 + sig as u32)
                }
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    fn client_died(self: &Rc<Self>, pid: i32, exit_code: u32) {
        for process in self.processes() {
            if process.unix_pid() == Some(pid) {
                log::info!("client process {} (pid {pid}) exited", process.id());
                process.terminate(self, exit_code);
            }
        }
    }

    /// Begin the two-phase shutdown: signal the shutdown event, give
    /// clients a grace period, then force the stragglers out.
    pub fn start_shutdown(self: &Rc<Self>) {
        if self.shutdown_stage.get() != ShutdownStage::Running {
            return;
        }
        log::info!("shutdown requested, entering phase 1");
        self.shutdown_stage.set(ShutdownStage::Phase1);
        if let Some(event) = self.shutdown_event.borrow().as_ref() {
            event.set();
        }
        let weak = Rc::downgrade(self);
        let handle = self.timeouts.add(SHUTDOWN_GRACE, move |_| {
            if let Some(server) = weak.upgrade() {
                server.shutdown_phase2();
            }
        });
        // the handle lives in the queue; dropping it does not cancel
        drop(handle);
    }

    fn shutdown_phase2(self: &Rc<Self>) {
        log::info!("shutdown phase 2: terminating remaining clients");
        self.shutdown_stage.set(ShutdownStage::Phase2);
        for process in self.processes() {
            if !process.is_system() && process.is_running() {
                process.terminate(self, 0);
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_stage.get() != ShutdownStage::Running
    }

    /// The server main loop: drain signals, expire timeouts, poll, and
    /// dispatch fd readiness, until the last poll user goes away.
    pub fn main_loop(self: &Rc<Self>) {
        self.timeouts.update_current_time();
        loop {
            self.drain_signals();
            let timeout = self.timeouts.process(self);
            if self.poller.active_count() == 0 {
                break;
            }
            let ready = self.poller.wait(timeout);
            self.timeouts.update_current_time();
            for (fd, events) in ready {
                if let Some(ops) = fd.ops() {
                    ops.poll_event(self, &fd, events);
                }
            }
        }
        log::info!("last poll user removed, exiting");
    }
}
