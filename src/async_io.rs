//! Asynchronous I/O engine
//!
//! A pending client I/O is represented server-side by an [`Async`] queued on
//! one of an fd's per-direction queues. Completion turns synchronous POSIX
//! readiness into an APC on the owning thread plus, when the fd is bound to
//! a completion port, a posted completion record. Everything is FIFO per
//! queue and per thread.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use crate::fd::CompletionFlags;
use crate::fd::Fd;
use crate::process::ApcCall;
use crate::process::Process;
use crate::process::Thread;
use crate::server::Server;
use crate::status::Status;
use crate::timeout::TimeoutHandle;
use crate::timeout::Ticks;

/// Queue selector for the three per-fd async queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncType {
    Read,
    Write,
    Wait,
}

/// Server-side I/O status block carried across a suspended operation.
#[derive(Debug)]
pub struct Iosb {
    pub status: Cell<Status>,
    pub result: Cell<u64>,
    pub in_data: RefCell<Vec<u8>>,
    pub out_data: RefCell<Vec<u8>>,
}

impl Iosb {
    pub fn new(in_data: Vec<u8>) -> Rc<Iosb> {
        Rc::new(Iosb {
            status: Cell::new(Status::PENDING),
            result: Cell::new(0),
            in_data: RefCell::new(in_data),
            out_data: RefCell::new(Vec::new()),
        })
    }
}

/// A pending asynchronous operation.
pub struct Async {
    thread: Rc<Thread>,
    iosb: Option<Rc<Iosb>>,
    status: Cell<Status>,
    /// Client APC routine and argument, both opaque client pointers.
    apc: u64,
    apc_arg: u64,
    timeout: RefCell<Option<TimeoutHandle>>,
    queue: RefCell<Option<Weak<AsyncQueue>>>,
}

impl fmt::Debug for Async {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Async(thread={}, status={})", self.thread.id(), self.status.get())
    }
}

impl Async {
    /// Create an async owned by `thread` and register it with the owning
    /// process for teardown cancellation.
    pub fn new(thread: &Rc<Thread>, apc: u64, apc_arg: u64, iosb: Option<Rc<Iosb>>) -> Rc<Async> {
        let async_op = Rc::new(Async {
            thread: thread.clone(),
            iosb,
            status: Cell::new(Status::PENDING),
            apc,
            apc_arg,
            timeout: RefCell::new(None),
            queue: RefCell::new(None),
        });
        if let Some(process) = thread.process() {
            process.register_async(&async_op);
        }
        async_op
    }

    pub fn thread(&self) -> &Rc<Thread> {
        &self.thread
    }

    pub fn iosb(&self) -> Option<&Rc<Iosb>> {
        self.iosb.as_ref()
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn is_pending(&self) -> bool {
        self.status.get() == Status::PENDING
    }

    /// Arm a timeout that completes the async with `status` on expiry.
    pub fn set_timeout(self: &Rc<Self>, server: &Server, when: Ticks, status: Status) {
        if let Some(old) = self.timeout.borrow_mut().take() {
            old.cancel();
        }
        let weak = Rc::downgrade(self);
        let handle = server.timeouts().add(when, move |server| {
            if let Some(async_op) = weak.upgrade() {
                async_op.terminate(server, status);
            }
        });
        *self.timeout.borrow_mut() = Some(handle);
    }

    /// Complete the async with `status`: deliver the APC, post the
    /// completion record, and unlink from the queue.
    pub fn terminate(self: &Rc<Self>, server: &Server, status: Status) {
        if !self.is_pending() {
            return;
        }
        self.status.set(status);
        if let Some(timeout) = self.timeout.borrow_mut().take() {
            timeout.cancel();
        }
        if let Some(iosb) = &self.iosb {
            if iosb.status.get() == Status::PENDING {
                iosb.status.set(status);
            }
        }
        let information = self.iosb.as_ref().map_or(0, |iosb| iosb.result.get());
        self.thread.queue_apc(
            None,
            ApcCall::AsyncIo { func: self.apc, user: self.apc_arg, status },
        );
        // completion binding travels through the owning queue's fd
        let fd = self
            .queue
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .and_then(|queue| queue.fd());
        if let Some(fd) = fd {
            if let Some((completion, key, flags)) = fd.completion_binding() {
                let skip = flags.contains(CompletionFlags::SKIP_ON_SUCCESS) && status.is_success();
                if !skip {
                    completion.add(key, self.apc_arg, status, information);
                }
            }
        }
        if let Some(queue) = self.queue.borrow_mut().take().and_then(|q| q.upgrade()) {
            queue.unlink(self);
            // let the fd recompute its poll selection now that the queue
            // shrank
            if let Some(fd) = queue.fd() {
                if let Some(ops) = fd.ops() {
                    ops.reselect_async(server, &fd, &queue);
                }
            }
        }
    }
}

/// FIFO of pending asyncs, one per fd direction.
pub struct AsyncQueue {
    fd: RefCell<Weak<Fd>>,
    entries: RefCell<VecDeque<Rc<Async>>>,
}

impl fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsyncQueue({} pending)", self.entries.borrow().len())
    }
}

impl AsyncQueue {
    pub fn new() -> Rc<AsyncQueue> {
        Rc::new(AsyncQueue {
            fd: RefCell::new(Weak::new()),
            entries: RefCell::new(VecDeque::new()),
        })
    }

    pub(crate) fn attach_fd(&self, fd: &Rc<Fd>) {
        *self.fd.borrow_mut() = Rc::downgrade(fd);
    }

    pub fn fd(&self) -> Option<Rc<Fd>> {
        self.fd.borrow().upgrade()
    }

    /// Append a pending async.
    pub fn queue(self: &Rc<Self>, async_op: &Rc<Async>) {
        *async_op.queue.borrow_mut() = Some(Rc::downgrade(self));
        self.entries.borrow_mut().push_back(async_op.clone());
    }

    fn unlink(&self, async_op: &Rc<Async>) {
        self.entries.borrow_mut().retain(|a| !Rc::ptr_eq(a, async_op));
    }

    /// True when at least one async is still pending.
    pub fn waiting(&self) -> bool {
        self.entries.borrow().iter().any(|a| a.is_pending())
    }

    /// Number of queued asyncs.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Complete every queued async with `status`, in FIFO order. The
    /// caller reselects the fd afterwards if it cares.
    pub fn wake_up(&self, server: &Server, status: Status) {
        loop {
            let next = self.entries.borrow_mut().pop_front();
            match next {
                // the back link stays until terminate consumes it, so the
                // completion binding still resolves through the fd
                Some(async_op) => async_op.terminate(server, status),
                None => break,
            }
        }
    }
}

/// Cancel all asyncs owned by a process, in registration order.
pub fn cancel_process_asyncs(server: &Server, process: &Process) {
    for async_op in process.take_asyncs() {
        if let Some(async_op) = async_op.upgrade() {
            async_op.terminate(server, Status::CANCELLED);
        }
    }
}
