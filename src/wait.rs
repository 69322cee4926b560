//! Wait engine
//!
//! A client thread blocking on objects is represented server-side by a
//! [`ThreadWait`] holding one wait-queue entry per object. Signals re-run
//! the wait predicate; wait-all satisfaction is atomic (either every
//! object's consuming side effect applies or none does), and an alertable
//! wait is interrupted by queued user APCs.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use smallvec::SmallVec;

use crate::object::ObjRef;
use crate::process::Thread;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;
use crate::timeout::TimeoutHandle;
use crate::timeout::Ticks;

/// Hard limit on the number of objects in one wait.
pub const MAXIMUM_WAIT_OBJECTS: usize = 64;

/// One object's entry in a thread's wait.
pub struct WaitQueueEntry {
    wait: Weak<ThreadWait>,
    index: usize,
    obj: ObjRef,
}

impl WaitQueueEntry {
    pub fn object(&self) -> &ObjRef {
        &self.obj
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The waiting thread, while the wait is alive.
    pub fn thread(&self) -> Option<Rc<Thread>> {
        self.wait.upgrade().map(|wait| wait.thread.clone())
    }

    /// Flag the wait as satisfied by an abandoned mutex.
    pub fn mark_abandoned(&self) {
        if let Some(wait) = self.wait.upgrade() {
            wait.abandoned.set(true);
        }
    }
}

impl std::fmt::Debug for WaitQueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WaitQueueEntry(index={})", self.index)
    }
}

/// A thread's in-progress wait on up to 64 objects.
pub struct ThreadWait {
    thread: Rc<Thread>,
    entries: RefCell<SmallVec<[Rc<WaitQueueEntry>; 4]>>,
    wait_all: bool,
    alertable: bool,
    timeout: RefCell<Option<TimeoutHandle>>,
    abandoned: Cell<bool>,
    done: Cell<bool>,
}

impl std::fmt::Debug for ThreadWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ThreadWait(thread={}, objects={}, wait_all={})",
            self.thread.id(),
            self.entries.borrow().len(),
            self.wait_all
        )
    }
}

/// Outcome of initiating a wait.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The wait completed synchronously with this status.
    Completed(Status),
    /// The thread is now blocked; a signal, APC or timeout will finish it.
    Pending(Rc<ThreadWait>),
}

/// Begin a wait for `thread` on `objects`.
///
/// `timeout` follows request conventions: `None` waits forever, zero polls
/// once, positive is absolute ticks, negative is relative to now.
pub fn begin_wait(
    server: &Server,
    thread: &Rc<Thread>,
    objects: &[ObjRef],
    wait_all: bool,
    alertable: bool,
    timeout: Option<Ticks>,
) -> SvResult<WaitOutcome> {
    if objects.is_empty() || objects.len() > MAXIMUM_WAIT_OBJECTS {
        return Err(Status::INVALID_PARAMETER);
    }
    let wait = Rc::new(ThreadWait {
        thread: thread.clone(),
        entries: RefCell::new(SmallVec::new()),
        wait_all,
        alertable,
        timeout: RefCell::new(None),
        abandoned: Cell::new(false),
        done: Cell::new(false),
    });
    for (index, obj) in objects.iter().enumerate() {
        let entry = Rc::new(WaitQueueEntry {
            wait: Rc::downgrade(&wait),
            index,
            obj: obj.clone(),
        });
        if let Err(err) = obj.add_wait(&entry) {
            unlink_entries(&wait);
            return Err(err);
        }
        wait.entries.borrow_mut().push(entry);
    }

    if let Some(status) = try_satisfy(&wait) {
        finish_wait(&wait, status);
        return Ok(WaitOutcome::Completed(status));
    }
    if alertable && thread.has_user_apc() {
        finish_wait(&wait, Status::USER_APC);
        return Ok(WaitOutcome::Completed(Status::USER_APC));
    }
    match timeout {
        Some(0) => {
            // zero-length timeout polls once
            finish_wait(&wait, Status::TIMEOUT);
            return Ok(WaitOutcome::Completed(Status::TIMEOUT));
        }
        Some(when) => {
            let weak = Rc::downgrade(&wait);
            let handle = server.timeouts().add(when, move |_server| {
                if let Some(wait) = weak.upgrade() {
                    finish_wait(&wait, Status::TIMEOUT);
                }
            });
            *wait.timeout.borrow_mut() = Some(handle);
        }
        None => {}
    }
    thread.set_wait(&wait);
    Ok(WaitOutcome::Pending(wait))
}

/// Evaluate the wait predicate; on success run the consuming side effects
/// and return the result status.
fn try_satisfy(wait: &Rc<ThreadWait>) -> Option<Status> {
    if wait.done.get() {
        return None;
    }
    let entries = wait.entries.borrow().clone();
    if wait.wait_all {
        if !entries.iter().all(|e| e.obj.signaled(e)) {
            return None;
        }
        wait.abandoned.set(false);
        for entry in &entries {
            entry.obj.satisfied(entry);
        }
        Some(if wait.abandoned.get() {
            Status::ABANDONED_WAIT_0
        } else {
            Status::WAIT_0
        })
    } else {
        let entry = entries.iter().find(|e| e.obj.signaled(e))?;
        wait.abandoned.set(false);
        entry.obj.satisfied(entry);
        Some(if wait.abandoned.get() {
            Status::abandoned_wait_index(entry.index)
        } else {
            Status::wait_index(entry.index)
        })
    }
}

fn unlink_entries(wait: &Rc<ThreadWait>) {
    for entry in wait.entries.borrow_mut().drain(..) {
        entry.obj.remove_wait(&entry);
    }
}

/// Complete a wait with `status`, removing every queue entry.
pub fn finish_wait(wait: &Rc<ThreadWait>, status: Status) {
    if wait.done.replace(true) {
        return;
    }
    if let Some(timeout) = wait.timeout.borrow_mut().take() {
        timeout.cancel();
    }
    unlink_entries(wait);
    wait.thread.complete_wait(status);
}

/// Abort a pending wait (cancellation at thread teardown).
pub fn abort_wait(wait: &Rc<ThreadWait>) {
    finish_wait(wait, Status::CANCELLED);
}

impl ThreadWait {
    /// Whether a queued user APC may interrupt this wait.
    pub fn is_alertable(&self) -> bool {
        self.alertable
    }
}

/// Re-evaluate the waits queued on `obj` in insertion order, granting at
/// most `max` of them (all of them when `max` is 0). The caller decides
/// which state transitions warrant this.
pub fn wake_up(obj: &ObjRef, max: usize) -> usize {
    let mut woken = 0;
    loop {
        let entries = obj.header().wait_entries();
        let mut progressed = false;
        for entry in entries {
            let Some(wait) = entry.wait.upgrade() else { continue };
            if wait.done.get() {
                continue;
            }
            if let Some(status) = try_satisfy(&wait) {
                finish_wait(&wait, status);
                woken += 1;
                progressed = true;
                if max != 0 && woken >= max {
                    return woken;
                }
                // the queue changed; restart the scan from the head
                break;
            }
        }
        if !progressed {
            break;
        }
    }
    woken
}
