//! Waitable timers
//!
//! Manual-reset timers stay signaled until reset; auto-reset timers clear
//! when a wait consumes them. A periodic timer re-arms itself on every
//! expiry, and a timer armed with a client callback queues an APC to the
//! setting thread.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use crate::access::AccessMask;
use crate::access::Attributes;
use crate::namespace::create_named_object;
use crate::namespace::directory_link_name;
use crate::namespace::CreateResult;
use crate::object::KObject;
use crate::object::ObjRef;
use crate::object::ObjectHeader;
use crate::process::ApcCall;
use crate::process::Thread;
use crate::server::Server;
use crate::status::SvResult;
use crate::timeout::Ticks;
use crate::timeout::TimeoutHandle;
use crate::wait::wake_up;
use crate::wait::WaitQueueEntry;

pub struct Timer {
    header: ObjectHeader,
    manual: bool,
    signaled: Cell<bool>,
    period: Cell<u32>,
    when: Cell<Ticks>,
    timeout: RefCell<Option<TimeoutHandle>>,
    thread: RefCell<Option<Rc<Thread>>>,
    callback: Cell<u64>,
    arg: Cell<u64>,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timer(manual={}, signaled={}, period={}ms)",
            self.manual,
            self.signaled.get(),
            self.period.get()
        )
    }
}

impl Timer {
    pub fn create(
        server: &Server,
        root: Option<&ObjRef>,
        name: &str,
        attrs: Attributes,
        manual: bool,
    ) -> SvResult<CreateResult<Timer>> {
        create_named_object(server, root, name, attrs, || {
            Ok(Rc::new(Timer {
                header: ObjectHeader::new(),
                manual,
                signaled: Cell::new(false),
                period: Cell::new(0),
                when: Cell::new(0),
                timeout: RefCell::new(None),
                thread: RefCell::new(None),
                callback: Cell::new(0),
                arg: Cell::new(0),
            }))
        })
    }

    fn callback_fired(self: &Rc<Self>, server: &Server) {
        // queue the client APC to the setting thread
        let thread = self.thread.borrow().clone();
        if let Some(thread) = thread {
            let owner: ObjRef = self.clone();
            let call = if self.callback.get() != 0 {
                ApcCall::Timer {
                    func: self.callback.get(),
                    time: self.when.get(),
                    arg: self.arg.get(),
                }
            } else {
                ApcCall::None
            };
            if !thread.queue_apc(Some(owner), call) {
                *self.thread.borrow_mut() = None;
            }
        }

        if self.period.get() != 0 {
            // schedule the next expiration
            let next = self.when.get() + self.period.get() as Ticks * 10_000;
            self.when.set(next);
            let weak = Rc::downgrade(self);
            let handle = server.timeouts().add(next, move |server| {
                if let Some(timer) = weak.upgrade() {
                    timer.callback_fired(server);
                }
            });
            *self.timeout.borrow_mut() = Some(handle);
        } else {
            *self.timeout.borrow_mut() = None;
        }

        self.signaled.set(true);
        let obj: ObjRef = self.clone();
        wake_up(&obj, 0);
    }

    /// Arm the timer. `expire` follows request conventions (absolute when
    /// positive, relative when negative, clamped to now); `period` is in
    /// milliseconds. Returns the previous signaled state.
    pub fn set(
        self: &Rc<Self>,
        server: &Server,
        thread: &Rc<Thread>,
        expire: Ticks,
        mut period: u32,
        callback: u64,
        arg: u64,
    ) -> bool {
        let signaled = self.cancel(thread);
        if self.manual {
            // period makes no sense for a manual timer
            period = 0;
            self.signaled.set(false);
        }
        let now = server.timeouts().current_time();
        let when = if expire <= 0 { now - expire } else { expire.max(now) };
        self.when.set(when);
        self.period.set(period);
        self.callback.set(callback);
        self.arg.set(arg);
        if callback != 0 {
            *self.thread.borrow_mut() = Some(thread.clone());
        }
        let weak = Rc::downgrade(self);
        let handle = server.timeouts().add(when, move |server| {
            if let Some(timer) = weak.upgrade() {
                timer.callback_fired(server);
            }
        });
        *self.timeout.borrow_mut() = Some(handle);
        signaled
    }

    /// Disarm the timer, dropping any queued-but-undelivered APC. Returns
    /// the previous signaled state.
    pub fn cancel(self: &Rc<Self>, _thread: &Rc<Thread>) -> bool {
        let signaled = self.signaled.get();
        if let Some(timeout) = self.timeout.borrow_mut().take() {
            timeout.cancel();
        }
        if let Some(thread) = self.thread.borrow_mut().take() {
            let owner: ObjRef = self.clone();
            thread.cancel_apc(&owner, true);
        }
        signaled
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.get()
    }

    pub fn next_fire_time(&self) -> Ticks {
        self.when.get()
    }
}

impl KObject for Timer {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "Timer"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header.enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, _entry: &WaitQueueEntry) -> bool {
        self.signaled.get()
    }

    fn satisfied(&self, _entry: &WaitQueueEntry) {
        if !self.manual {
            self.signaled.set(false);
        }
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_default()
    }

    fn link_name(&self, self_ref: &ObjRef, name: &str, parent: &ObjRef) -> SvResult<()> {
        directory_link_name(self_ref, name, parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use crate::wait::begin_wait;
    use crate::wait::WaitOutcome;

    const MS: Ticks = 10_000;

    #[test]
    fn periodic_timer_fires_repeatedly() {
        let server = Server::new_for_tests();
        let thread = server.make_test_process().main_thread().unwrap();
        let timer = Timer::create(&server, None, "", Attributes::empty(), false).unwrap().obj;
        server.timeouts().set_current_time(0);
        timer.set(&server, &thread, 100 * MS, 100, 0, 0);

        for tick in [100, 200, 300] {
            assert!(!timer.is_signaled());
            server.timeouts().set_current_time(tick * MS + MS);
            server.timeouts().process(&server);
            assert!(timer.is_signaled(), "not signaled at t≈{tick}ms");
            // auto-reset: a satisfied wait consumes the signal
            let obj: ObjRef = timer.clone();
            match begin_wait(&server, &thread, &[obj], false, false, Some(0)).unwrap() {
                WaitOutcome::Completed(status) => assert_eq!(status, Status::WAIT_0),
                WaitOutcome::Pending(_) => panic!("signaled timer must satisfy"),
            }
            assert!(!timer.is_signaled());
        }
    }

    #[test]
    fn manual_timer_signal_is_sticky() {
        let server = Server::new_for_tests();
        let thread = server.make_test_process().main_thread().unwrap();
        let timer = Timer::create(&server, None, "", Attributes::empty(), true).unwrap().obj;
        server.timeouts().set_current_time(0);
        timer.set(&server, &thread, 10 * MS, 500, 0, 0);
        server.timeouts().set_current_time(20 * MS);
        server.timeouts().process(&server);
        assert!(timer.is_signaled());
        let obj: ObjRef = timer.clone();
        match begin_wait(&server, &thread, &[obj.clone()], false, false, Some(0)).unwrap() {
            WaitOutcome::Completed(status) => assert_eq!(status, Status::WAIT_0),
            WaitOutcome::Pending(_) => unreachable!(),
        }
        // still signaled afterwards, and no periodic re-arm happened
        assert!(timer.is_signaled());
        assert!(server.timeouts().is_empty());
    }

    #[test]
    fn relative_expiry_and_apc() {
        let server = Server::new_for_tests();
        let thread = server.make_test_process().main_thread().unwrap();
        let timer = Timer::create(&server, None, "", Attributes::empty(), false).unwrap().obj;
        server.timeouts().set_current_time(1_000 * MS);
        timer.set(&server, &thread, -(50 * MS), 0, 0xdead_0000, 0x77);
        assert_eq!(timer.next_fire_time(), 1_050 * MS);
        server.timeouts().set_current_time(1_100 * MS);
        server.timeouts().process(&server);
        let apc = thread.dequeue_user_apc().expect("timer apc queued");
        match apc.call {
            ApcCall::Timer { func, arg, .. } => {
                assert_eq!(func, 0xdead_0000);
                assert_eq!(arg, 0x77);
            }
            other => panic!("unexpected apc {other:?}"),
        }
    }

    #[test]
    fn cancel_reports_previous_state_and_drops_apc() {
        let server = Server::new_for_tests();
        let thread = server.make_test_process().main_thread().unwrap();
        let timer = Timer::create(&server, None, "", Attributes::empty(), false).unwrap().obj;
        server.timeouts().set_current_time(0);
        timer.set(&server, &thread, 10 * MS, 0, 0x1234, 0);
        assert!(!timer.cancel(&thread));
        // the timeout no longer fires
        server.timeouts().set_current_time(100 * MS);
        server.timeouts().process(&server);
        assert!(!timer.is_signaled());
        assert!(thread.dequeue_user_apc().is_none());

        // fire it, then observe cancel reporting the signaled state
        timer.set(&server, &thread, 200 * MS, 0, 0, 0);
        server.timeouts().set_current_time(300 * MS);
        server.timeouts().process(&server);
        assert!(timer.cancel(&thread));
    }
}
