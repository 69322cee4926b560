//! Waitable synchronization objects: events, mutexes, semaphores.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use crate::access::AccessMask;
use crate::access::Attributes;
use crate::namespace::create_named_object;
use crate::namespace::directory_link_name;
use crate::namespace::CreateResult;
use crate::object::downcast;
use crate::object::KObject;
use crate::object::ObjRef;
use crate::object::ObjectHeader;
use crate::process::Thread;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;
use crate::wait::wake_up;
use crate::wait::WaitQueueEntry;

/// An event: manual-reset keeps its signaled state, auto-reset consumes it
/// on a satisfied wait.
#[derive(Debug)]
pub struct Event {
    header: ObjectHeader,
    manual: bool,
    signaled: Cell<bool>,
}

impl Event {
    pub fn create(
        server: &Server,
        root: Option<&ObjRef>,
        name: &str,
        attrs: Attributes,
        manual: bool,
        signaled: bool,
    ) -> SvResult<CreateResult<Event>> {
        create_named_object(server, root, name, attrs, || {
            Ok(Rc::new(Event {
                header: ObjectHeader::new(),
                manual,
                signaled: Cell::new(signaled),
            }))
        })
    }

    pub fn set(self: &Rc<Self>) {
        self.signaled.set(true);
        let obj: ObjRef = self.clone();
        wake_up(&obj, 0);
    }

    pub fn reset(&self) {
        self.signaled.set(false);
    }

    /// Set, wake, and reset in one shot.
    pub fn pulse(self: &Rc<Self>) {
        self.set();
        self.reset();
    }

    pub fn is_set(&self) -> bool {
        self.signaled.get()
    }
}

impl KObject for Event {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "Event"
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

    fn signal(&self, self_ref: &ObjRef, _access: AccessMask) -> SvResult<()> {
        self.signaled.set(true);
        wake_up(self_ref, 0);
        Ok(())
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_default()
    }

    fn link_name(&self, self_ref: &ObjRef, name: &str, parent: &ObjRef) -> SvResult<()> {
        directory_link_name(self_ref, name, parent)
    }
}

/// Flip a type-erased event's state without waking anybody; the caller
/// decides when the transition warrants a wake.
pub fn set_event_state(obj: &ObjRef, set: bool) {
    if let Some(event) = downcast::<Event>(obj) {
        event.signaled.set(set);
    }
}

/// A mutex ("mutant"): recursively owned by a thread, abandoned when the
/// owner dies while holding it.
#[derive(Debug)]
pub struct Mutex {
    header: ObjectHeader,
    owner: RefCell<Option<Weak<Thread>>>,
    count: Cell<u32>,
    abandoned: Cell<bool>,
}

impl Mutex {
    pub fn create(
        server: &Server,
        root: Option<&ObjRef>,
        name: &str,
        attrs: Attributes,
        owned: bool,
        thread: &Rc<Thread>,
    ) -> SvResult<CreateResult<Mutex>> {
        let result = create_named_object(server, root, name, attrs, || {
            Ok(Rc::new(Mutex {
                header: ObjectHeader::new(),
                owner: RefCell::new(None),
                count: Cell::new(0),
                abandoned: Cell::new(false),
            }))
        })?;
        if result.created && owned {
            result.obj.grab(thread);
        }
        Ok(result)
    }

    fn grab(self: &Rc<Self>, thread: &Rc<Thread>) {
        if self.count.get() == 0 {
            *self.owner.borrow_mut() = Some(Rc::downgrade(thread));
            thread.register_mutex(self);
        }
        self.count.set(self.count.get() + 1);
    }

    fn owned_by(&self, thread: &Rc<Thread>) -> bool {
        self.owner
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|owner| Rc::ptr_eq(&owner, thread))
    }

    /// Release one recursion level; returns the previous count.
    pub fn release(self: &Rc<Self>, thread: &Rc<Thread>) -> SvResult<u32> {
        if !self.owned_by(thread) {
            return Err(Status::MUTANT_NOT_OWNED);
        }
        let prev = self.count.get();
        self.count.set(prev - 1);
        if prev == 1 {
            *self.owner.borrow_mut() = None;
            thread.unregister_mutex(self);
            let obj: ObjRef = self.clone();
            wake_up(&obj, 0);
        }
        Ok(prev)
    }

    pub fn recursion_count(&self) -> u32 {
        self.count.get()
    }

    fn abandon(self: &Rc<Self>) {
        self.abandoned.set(true);
        self.count.set(0);
        *self.owner.borrow_mut() = None;
        let obj: ObjRef = self.clone();
        wake_up(&obj, 0);
    }
}

impl KObject for Mutex {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "Mutant"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header.enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, entry: &WaitQueueEntry) -> bool {
        if self.count.get() == 0 {
            return true;
        }
        match entry.thread() {
            Some(thread) => self.owned_by(&thread),
            None => false,
        }
    }

    fn satisfied(&self, entry: &WaitQueueEntry) {
        let Some(thread) = entry.thread() else { return };
        if self.count.get() == 0 {
            *self.owner.borrow_mut() = Some(Rc::downgrade(&thread));
            if let Some(mutex) = crate::namespace::rc_downcast::<Mutex>(entry.object()) {
                thread.register_mutex(&mutex);
            }
        }
        self.count.set(self.count.get() + 1);
        if self.abandoned.get() {
            entry.mark_abandoned();
            self.abandoned.set(false);
        }
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_default()
    }

    fn link_name(&self, self_ref: &ObjRef, name: &str, parent: &ObjRef) -> SvResult<()> {
        directory_link_name(self_ref, name, parent)
    }
}

/// Abandon every mutex owned by a dying thread; the next waiter on each
/// observes the abandoned status.
pub fn abandon_mutexes(thread: &Rc<Thread>) {
    for mutex in thread.take_mutexes() {
        if let Some(mutex) = mutex.upgrade() {
            mutex.abandon();
        }
    }
}

/// A counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    header: ObjectHeader,
    count: Cell<u32>,
    max: u32,
}

impl Semaphore {
    pub fn create(
        server: &Server,
        root: Option<&ObjRef>,
        name: &str,
        attrs: Attributes,
        initial: u32,
        max: u32,
    ) -> SvResult<CreateResult<Semaphore>> {
        if max == 0 || initial > max {
            return Err(Status::INVALID_PARAMETER);
        }
        create_named_object(server, root, name, attrs, || {
            Ok(Rc::new(Semaphore {
                header: ObjectHeader::new(),
                count: Cell::new(initial),
                max,
            }))
        })
    }

    /// Add `count` to the semaphore; returns the previous count.
    pub fn release(self: &Rc<Self>, count: u32) -> SvResult<u32> {
        let prev = self.count.get();
        if count > self.max - prev {
            return Err(Status::SEMAPHORE_LIMIT_EXCEEDED);
        }
        self.count.set(prev + count);
        let obj: ObjRef = self.clone();
        wake_up(&obj, count as usize);
        Ok(prev)
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }
}

impl KObject for Semaphore {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "Semaphore"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header.enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, _entry: &WaitQueueEntry) -> bool {
        self.count.get() > 0
    }

    fn satisfied(&self, _entry: &WaitQueueEntry) {
        debug_assert!(self.count.get() > 0);
        self.count.set(self.count.get() - 1);
    }

    fn signal(&self, self_ref: &ObjRef, _access: AccessMask) -> SvResult<()> {
        let prev = self.count.get();
        if prev >= self.max {
            return Err(Status::SEMAPHORE_LIMIT_EXCEEDED);
        }
        self.count.set(prev + 1);
        wake_up(self_ref, 1);
        Ok(())
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_default()
    }

    fn link_name(&self, self_ref: &ObjRef, name: &str, parent: &ObjRef) -> SvResult<()> {
        directory_link_name(self_ref, name, parent)
    }
}
