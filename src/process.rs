//! Processes, threads, APC queues and process bootstrap
//!
//! Client processes and threads are kernel objects like everything else:
//! waitable (signaled on termination), holders of the per-process handle
//! table, lock and async registrations, and the per-thread APC queues the
//! async engine and timers deliver into.
//!
//! Process startup is a handshake: the parent creates a startup-info object
//! carrying the inherited data block, the child retrieves it exactly once,
//! and `init_process_done` signals the parent that the child is running.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use crate::async_io::cancel_process_asyncs;
use crate::fd::remove_process_locks;
use crate::fd::FileLock;
use crate::handle::HandleTable;
use crate::object::KObject;
use crate::object::ObjRef;
use crate::object::ObjectHeader;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;
use crate::sync::abandon_mutexes;
use crate::sync::Mutex;
use crate::timeout::Ticks;
use crate::timeout::TimeoutHandle;
use crate::wait::wake_up;
use crate::wait::WaitQueueEntry;

/// Grace period before a terminated client is SIGKILLed, in ticks.
const PROCESS_KILL_GRACE: Ticks = -(1_000_000); // 100 ms relative

/// An asynchronous procedure call queued to a thread.
#[derive(Debug, Clone)]
pub struct Apc {
    pub call: ApcCall,
    pub owner: Option<ObjRef>,
}

/// The call payload delivered to the client thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ApcCall {
    /// Wake-up only.
    None,
    /// Waitable timer expiry.
    Timer { func: u64, time: Ticks, arg: u64 },
    /// Async I/O completion.
    AsyncIo { func: u64, user: u64, status: Status },
    /// User-queued APC.
    User { func: u64, args: [u64; 3] },
}

impl ApcCall {
    /// User APCs interrupt alertable waits; system APCs do not.
    fn is_user(&self) -> bool {
        matches!(self, ApcCall::None | ApcCall::Timer { .. } | ApcCall::User { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Terminated,
}

/// A client thread.
pub struct Thread {
    header: ObjectHeader,
    id: u32,
    process: Weak<Process>,
    state: Cell<RunState>,
    exit_code: Cell<u32>,
    system_apcs: RefCell<VecDeque<Apc>>,
    user_apcs: RefCell<VecDeque<Apc>>,
    wait: RefCell<Option<Rc<crate::wait::ThreadWait>>>,
    wait_result: Cell<Option<Status>>,
    mutexes: RefCell<Vec<Weak<Mutex>>>,
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread(id={}, state={:?})", self.id, self.state.get())
    }
}

impl Thread {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn process(&self) -> Option<Rc<Process>> {
        self.process.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.state.get() == RunState::Running
    }

    /// Queue an APC; returns false once the thread is gone.
    pub fn queue_apc(&self, owner: Option<ObjRef>, call: ApcCall) -> bool {
        if !self.is_alive() {
            return false;
        }
        let apc = Apc { call, owner };
        if call.is_user() {
            self.user_apcs.borrow_mut().push_back(apc);
            let wait = self.wait.borrow().clone();
            if let Some(wait) = wait {
                if wait.is_alertable() {
                    crate::wait::finish_wait(&wait, Status::USER_APC);
                }
            }
        } else {
            self.system_apcs.borrow_mut().push_back(apc);
        }
        true
    }

    /// Drop a queued-but-undelivered APC belonging to `owner`.
    pub fn cancel_apc(&self, owner: &ObjRef, user_queue: bool) -> bool {
        let queue = if user_queue { &self.user_apcs } else { &self.system_apcs };
        let mut queue = queue.borrow_mut();
        let before = queue.len();
        queue.retain(|apc| {
            apc.owner
                .as_ref()
                .map(|o| !Rc::ptr_eq(o, owner))
                .unwrap_or(true)
        });
        queue.len() != before
    }

    pub fn dequeue_system_apc(&self) -> Option<Apc> {
        self.system_apcs.borrow_mut().pop_front()
    }

    pub fn dequeue_user_apc(&self) -> Option<Apc> {
        self.user_apcs.borrow_mut().pop_front()
    }

    pub fn has_user_apc(&self) -> bool {
        !self.user_apcs.borrow().is_empty()
    }

    pub(crate) fn set_wait(&self, wait: &Rc<crate::wait::ThreadWait>) {
        *self.wait.borrow_mut() = Some(wait.clone());
    }

    pub(crate) fn current_wait(&self) -> Option<Rc<crate::wait::ThreadWait>> {
        self.wait.borrow().clone()
    }

    /// Record a wait result; a connected client is replied to from here.
    pub(crate) fn complete_wait(&self, status: Status) {
        self.wait.borrow_mut().take();
        self.wait_result.set(Some(status));
    }

    /// The result of the last finished wait, consumed on read.
    pub fn take_wait_result(&self) -> Option<Status> {
        self.wait_result.take()
    }

    pub(crate) fn register_mutex(&self, mutex: &Rc<Mutex>) {
        self.mutexes.borrow_mut().push(Rc::downgrade(mutex));
    }

    pub(crate) fn unregister_mutex(&self, mutex: &Mutex) {
        self.mutexes
            .borrow_mut()
            .retain(|weak| !std::ptr::eq(weak.as_ptr(), mutex));
    }

    pub(crate) fn take_mutexes(&self) -> Vec<Weak<Mutex>> {
        std::mem::take(&mut *self.mutexes.borrow_mut())
    }

    /// Terminate the thread: abandon owned mutexes, abort a pending wait,
    /// wake joiners.
    pub fn terminate(self: &Rc<Self>, exit_code: u32) {
        if self.state.replace(RunState::Terminated) == RunState::Terminated {
            return;
        }
        self.exit_code.set(exit_code);
        abandon_mutexes(self);
        let wait = self.wait.borrow_mut().take();
        if let Some(wait) = wait {
            crate::wait::finish_wait(&wait, Status::CANCELLED);
        }
        self.system_apcs.borrow_mut().clear();
        self.user_apcs.borrow_mut().clear();
        let obj: ObjRef = self.clone();
        wake_up(&obj, 0);
    }

    pub fn exit_code(&self) -> u32 {
        self.exit_code.get()
    }
}

impl KObject for Thread {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "Thread"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header().enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, _entry: &WaitQueueEntry) -> bool {
        self.state.get() == RunState::Terminated
    }
}

/// The startup phase of a client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupState {
    InProgress,
    Done,
    Aborted,
}

/// A client process.
pub struct Process {
    header: ObjectHeader,
    id: u32,
    unix_pid: Cell<Option<i32>>,
    is_system: Cell<bool>,
    running: Cell<bool>,
    exit_code: Cell<u32>,
    startup_state: Cell<StartupState>,
    handles: HandleTable,
    threads: RefCell<Vec<Rc<Thread>>>,
    locks: RefCell<Vec<Rc<FileLock>>>,
    asyncs: RefCell<Vec<Weak<crate::async_io::Async>>>,
    startup_info: RefCell<Option<Weak<StartupInfo>>>,
    sigkill_timeout: RefCell<Option<TimeoutHandle>>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Process(id={}, running={}, handles={})",
            self.id,
            self.running.get(),
            self.handles.count()
        )
    }
}

impl Process {
    /// Create a process with its initial thread. Handles marked
    /// inheritable in the parent are copied when `inherit_handles` is set.
    pub fn new(
        server: &Server,
        parent: Option<&Rc<Process>>,
        inherit_handles: bool,
    ) -> Rc<Process> {
        let handles = match parent {
            Some(parent) if inherit_handles => parent.handles.inherit(),
            _ => HandleTable::new(),
        };
        let process = Rc::new(Process {
            header: ObjectHeader::new(),
            id: server.alloc_ptid(),
            unix_pid: Cell::new(None),
            is_system: Cell::new(false),
            running: Cell::new(true),
            exit_code: Cell::new(0),
            startup_state: Cell::new(StartupState::InProgress),
            handles,
            threads: RefCell::new(Vec::new()),
            locks: RefCell::new(Vec::new()),
            asyncs: RefCell::new(Vec::new()),
            startup_info: RefCell::new(None),
            sigkill_timeout: RefCell::new(None),
        });
        let thread = Rc::new(Thread {
            header: ObjectHeader::new(),
            id: server.alloc_ptid(),
            process: Rc::downgrade(&process),
            state: Cell::new(RunState::Running),
            exit_code: Cell::new(0),
            system_apcs: RefCell::new(VecDeque::new()),
            user_apcs: RefCell::new(VecDeque::new()),
            wait: RefCell::new(None),
            wait_result: Cell::new(None),
            mutexes: RefCell::new(Vec::new()),
        });
        process.threads.borrow_mut().push(thread);
        server.register_process(&process);
        process
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn unix_pid(&self) -> Option<i32> {
        self.unix_pid.get()
    }

    pub fn set_unix_pid(&self, pid: i32) {
        self.unix_pid.set(Some(pid));
    }

    /// System processes survive phase-2 shutdown.
    pub fn is_system(&self) -> bool {
        self.is_system.get()
    }

    pub fn set_system(&self, system: bool) {
        self.is_system.set(system);
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn main_thread(&self) -> Option<Rc<Thread>> {
        self.threads.borrow().iter().find(|t| t.is_alive()).cloned()
    }

    pub fn threads(&self) -> Vec<Rc<Thread>> {
        self.threads.borrow().clone()
    }

    pub fn startup_state(&self) -> StartupState {
        self.startup_state.get()
    }

    pub(crate) fn register_lock(&self, lock: &Rc<FileLock>) {
        self.locks.borrow_mut().push(lock.clone());
    }

    pub(crate) fn unregister_lock(&self, lock: &Rc<FileLock>) {
        self.locks.borrow_mut().retain(|l| !Rc::ptr_eq(l, lock));
    }

    pub(crate) fn take_locks(&self) -> Vec<Rc<FileLock>> {
        std::mem::take(&mut *self.locks.borrow_mut())
    }

    pub(crate) fn register_async(&self, async_op: &Rc<crate::async_io::Async>) {
        self.asyncs.borrow_mut().push(Rc::downgrade(async_op));
    }

    pub(crate) fn take_asyncs(&self) -> Vec<Weak<crate::async_io::Async>> {
        std::mem::take(&mut *self.asyncs.borrow_mut())
    }

    /// Move the startup handshake forward and wake anyone waiting on the
    /// startup-info object.
    pub fn set_startup_state(&self, state: StartupState) {
        self.startup_state.set(state);
        let info = self.startup_info.borrow().as_ref().and_then(Weak::upgrade);
        if let Some(info) = info {
            let obj: ObjRef = info;
            wake_up(&obj, 0);
        }
    }

    /// Terminate the process: tear down threads, cancel asyncs, release
    /// locks and handles, and arm the SIGKILL grace timer.
    pub fn terminate(self: &Rc<Self>, server: &Server, exit_code: u32) {
        if !self.running.replace(false) {
            return;
        }
        self.exit_code.set(exit_code);
        if self.startup_state.get() == StartupState::InProgress {
            self.set_startup_state(StartupState::Aborted);
        }
        for thread in self.threads() {
            thread.terminate(exit_code);
        }
        cancel_process_asyncs(server, self);
        remove_process_locks(self);
        self.handles.clear();
        if let Some(pid) = self.unix_pid.get() {
            let handle = server.timeouts().add(PROCESS_KILL_GRACE, move |_server| {
                // the client had its grace period; force it out
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGKILL,
                );
            });
            *self.sigkill_timeout.borrow_mut() = Some(handle);
        }
        let obj: ObjRef = self.clone();
        wake_up(&obj, 0);
    }

    pub fn exit_code(&self) -> u32 {
        self.exit_code.get()
    }
}

impl KObject for Process {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "Process"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header().enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, _entry: &WaitQueueEntry) -> bool {
        !self.running.get()
    }
}

/// The startup-info object passed from parent to child.
///
/// Signaled once the child's startup state leaves `InProgress`. The data
/// block is handed to the child exactly once; ownership transfers on read.
pub struct StartupInfo {
    header: ObjectHeader,
    process: Rc<Process>,
    exe_file: RefCell<Option<ObjRef>>,
    info_size: usize,
    data: RefCell<Option<Vec<u8>>>,
}

impl fmt::Debug for StartupInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StartupInfo(process={}, info_size={})",
            self.process.id, self.info_size
        )
    }
}

impl StartupInfo {
    pub fn new(
        process: &Rc<Process>,
        exe_file: Option<ObjRef>,
        info_size: usize,
        data: Vec<u8>,
    ) -> Rc<StartupInfo> {
        let info = Rc::new(StartupInfo {
            header: ObjectHeader::new(),
            process: process.clone(),
            exe_file: RefCell::new(exe_file),
            info_size,
            data: RefCell::new(Some(data)),
        });
        *process.startup_info.borrow_mut() = Some(Rc::downgrade(&info));
        info
    }

    pub fn process(&self) -> &Rc<Process> {
        &self.process
    }

    pub fn info_size(&self) -> usize {
        self.info_size
    }

    pub fn exe_file(&self) -> Option<ObjRef> {
        self.exe_file.borrow().clone()
    }

    /// Retrieve the startup data; the buffer transfers to the caller and a
    /// second read gets nothing.
    pub fn take_data(&self) -> Option<Vec<u8>> {
        self.data.borrow_mut().take()
    }
}

impl KObject for StartupInfo {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "StartupInfo"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header().enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, _entry: &WaitQueueEntry) -> bool {
        self.process.startup_state.get() != StartupState::InProgress
    }
}
