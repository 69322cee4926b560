//! Kernel object core
//!
//! Everything the server manages is a kernel object: a reference-counted node
//! with a wait queue, an optional name linking it under a parent container,
//! and a set of per-type operations. Reference counting is `Rc`; the last
//! reference dropping runs the type's destructor and unlinks the name, which
//! is exactly the 0-refcount transition of the original design.
//!
//! Per-type operations live on the [`KObject`] trait. Operations a type does
//! not support keep the default method bodies, which fail with
//! `OBJECT_TYPE_MISMATCH`; concrete types override only what they implement.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::access::AccessMask;
use crate::access::OpenOptions;
use crate::access::ShareMode;
use crate::fd::Fd;
use crate::handle::Handle;
use crate::namespace::LookupPath;
use crate::namespace::Namespace;
use crate::process::Process;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;
use crate::wait::WaitQueueEntry;

/// Shared reference to any kernel object.
pub type ObjRef = Rc<dyn KObject>;

thread_local! {
    static LIVE_OBJECTS: Cell<u64> = const { Cell::new(0) };
}

/// Number of live objects on this thread.
///
/// Destruction stays observable without the intrusive debug list the original
/// carried; tests assert on the delta around create/release sequences.
pub fn live_objects() -> u64 {
    LIVE_OBJECTS.with(|c| c.get())
}

/// The name entry linking an object under a parent container.
///
/// The parent reference is strong (a named object keeps its whole parent
/// chain alive); the parent's bucket holds only a weak entry back, so a named
/// object still dies with its last real reference.
#[derive(Debug)]
pub struct NameEntry {
    pub parent: ObjRef,
    pub name: String,
}

/// State shared by every object type.
#[derive(Debug)]
pub struct ObjectHeader {
    name: RefCell<Option<NameEntry>>,
    wait_queue: RefCell<Vec<Rc<WaitQueueEntry>>>,
    handle_count: Cell<u32>,
    sd: RefCell<Option<Vec<u8>>>,
}

impl Default for ObjectHeader {
    fn default() -> Self {
        ObjectHeader::new()
    }
}

impl ObjectHeader {
    pub fn new() -> ObjectHeader {
        LIVE_OBJECTS.with(|c| c.set(c.get() + 1));
        ObjectHeader {
            name: RefCell::new(None),
            wait_queue: RefCell::new(Vec::new()),
            handle_count: Cell::new(0),
            sd: RefCell::new(None),
        }
    }

    /// Queue a wait entry. Used by the `add_wait` override of waitable types.
    pub fn enqueue_wait(&self, entry: &Rc<WaitQueueEntry>) {
        self.wait_queue.borrow_mut().push(entry.clone());
    }

    /// Unqueue a wait entry by identity.
    pub fn dequeue_wait(&self, entry: &Rc<WaitQueueEntry>) {
        self.wait_queue
            .borrow_mut()
            .retain(|e| !Rc::ptr_eq(e, entry));
    }

    /// Snapshot of the wait queue in insertion order.
    pub fn wait_entries(&self) -> Vec<Rc<WaitQueueEntry>> {
        self.wait_queue.borrow().clone()
    }

    pub fn wait_queue_empty(&self) -> bool {
        self.wait_queue.borrow().is_empty()
    }

    pub fn handle_count(&self) -> u32 {
        self.handle_count.get()
    }

    pub fn inc_handle_count(&self) {
        self.handle_count.set(self.handle_count.get() + 1);
    }

    pub fn dec_handle_count(&self) -> u32 {
        let count = self.handle_count.get() - 1;
        self.handle_count.set(count);
        count
    }

    pub fn name(&self) -> Option<String> {
        self.name.borrow().as_ref().map(|n| n.name.clone())
    }

    pub fn parent(&self) -> Option<ObjRef> {
        self.name.borrow().as_ref().map(|n| n.parent.clone())
    }

    pub fn set_name(&self, entry: NameEntry) {
        *self.name.borrow_mut() = Some(entry);
    }

    pub fn take_name(&self) -> Option<NameEntry> {
        self.name.borrow_mut().take()
    }

    pub fn sd(&self) -> Option<Vec<u8>> {
        self.sd.borrow().clone()
    }

    pub fn set_sd(&self, sd: Option<Vec<u8>>) {
        *self.sd.borrow_mut() = sd;
    }
}

impl Drop for ObjectHeader {
    fn drop(&mut self) {
        LIVE_OBJECTS.with(|c| c.set(c.get() - 1));
        // Nobody can hold a handle or be waiting once the last reference is
        // gone; a violation here is a refcounting bug, not a runtime error.
        debug_assert_eq!(self.handle_count.get(), 0);
        debug_assert!(self.wait_queue.get_mut().is_empty());
        if let Some(entry) = self.name.get_mut().take() {
            if let Some(ns) = entry.parent.namespace() {
                ns.remove_dead(&entry.name);
            }
        }
    }
}

/// Operations valid on all objects.
///
/// Default bodies implement the "not supported" behavior; a type overrides
/// the operations it actually provides, the way filesystem implementations
/// override the request callbacks they support.
#[allow(unused_variables)]
pub trait KObject: fmt::Debug + 'static {
    /// The common object header.
    fn header(&self) -> &ObjectHeader;

    /// Type name, used for diagnostics and type checks.
    fn type_name(&self) -> &'static str;

    /// Downcast support for typed handle lookups.
    fn as_any(&self) -> &dyn Any;

    /// Subscribe a waiter. Only waitable types accept entries.
    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        Err(Status::OBJECT_TYPE_MISMATCH)
    }

    /// Unsubscribe a waiter.
    fn remove_wait(&self, entry: &Rc<WaitQueueEntry>) {
        self.header().dequeue_wait(entry);
    }

    /// Would a wait on this object be satisfied right now?
    fn signaled(&self, entry: &WaitQueueEntry) -> bool {
        false
    }

    /// A wait on this object was satisfied; consume state if the type
    /// requires it (auto-reset events, mutex ownership, ...).
    fn satisfied(&self, entry: &WaitQueueEntry) {}

    /// Explicitly signal the object.
    fn signal(&self, self_ref: &ObjRef, access: AccessMask) -> SvResult<()> {
        Err(Status::OBJECT_TYPE_MISMATCH)
    }

    /// The fd backing this object, if it is fd-based.
    fn get_fd(&self) -> SvResult<Rc<Fd>> {
        Err(Status::OBJECT_TYPE_MISMATCH)
    }

    /// Expand generic access bits into the type-specific rights.
    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_default()
    }

    /// The namespace this object exposes, when it is a container.
    fn namespace(&self) -> Option<&Namespace> {
        None
    }

    /// Resolve the next path element against this object.
    ///
    /// `Ok(None)` stops the walk at this object; the residual path stays in
    /// `path` for create-or-open handling.
    fn lookup_name(
        &self,
        self_ref: &ObjRef,
        path: &mut LookupPath,
        server: &Server,
    ) -> SvResult<Option<ObjRef>> {
        match path.rest() {
            Some(_) => Err(Status::OBJECT_TYPE_MISMATCH),
            None => Ok(None),
        }
    }

    /// Link this object under a parent by name. Containers that accept this
    /// type override; the default refuses (the type cannot be named there).
    fn link_name(&self, self_ref: &ObjRef, name: &str, parent: &ObjRef) -> SvResult<()> {
        Err(Status::OBJECT_TYPE_MISMATCH)
    }

    /// Open an I/O object for a client that resolved this object by name
    /// (e.g. opening a named pipe creates the client end).
    fn open_file(
        &self,
        self_ref: &ObjRef,
        server: &Server,
        process: &Rc<Process>,
        access: AccessMask,
        sharing: ShareMode,
        options: OpenOptions,
    ) -> SvResult<ObjRef> {
        Err(Status::OBJECT_TYPE_MISMATCH)
    }

    /// Veto hook invoked when a handle to this object is closed. Returning
    /// false refuses the close.
    fn close_handle(&self, server: &Server, process: &Rc<Process>, handle: Handle) -> bool {
        true
    }
}

/// Grab another reference to an object.
pub fn grab_object(obj: &ObjRef) -> ObjRef {
    obj.clone()
}

/// Typed downcast of an object reference.
pub fn downcast<T: KObject>(obj: &ObjRef) -> Option<&T> {
    obj.as_any().downcast_ref::<T>()
}

/// Unlink a named object from its parent without destroying it.
pub fn unlink_named_object(obj: &ObjRef) {
    if let Some(entry) = obj.header().take_name() {
        if let Some(ns) = entry.parent.namespace() {
            ns.remove(&entry.name, Rc::as_ptr(obj) as *const ());
        }
    }
}

/// The full `\`-separated name of an object, or `None` when anonymous.
pub fn get_full_name(obj: &ObjRef) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut cur = obj.clone();
    loop {
        let name = cur.header().name.borrow().as_ref().map(|n| (n.name.clone(), n.parent.clone()));
        match name {
            Some((name, parent)) => {
                if !name.is_empty() {
                    parts.push(name);
                }
                cur = parent;
            }
            None => break,
        }
    }
    if parts.is_empty() {
        return None;
    }
    parts.reverse();
    let mut full = String::new();
    for part in parts {
        full.push('\\');
        full.push_str(&part);
    }
    Some(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Dummy {
        header: ObjectHeader,
    }

    impl KObject for Dummy {
        fn header(&self) -> &ObjectHeader {
            &self.header
        }
        fn type_name(&self) -> &'static str {
            "Dummy"
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn refcount_lifecycle() {
        let before = live_objects();
        let obj: ObjRef = Rc::new(Dummy { header: ObjectHeader::new() });
        assert_eq!(live_objects(), before + 1);
        let grabbed = grab_object(&obj);
        let grabbed2 = grab_object(&grabbed);
        drop(grabbed);
        drop(grabbed2);
        assert_eq!(live_objects(), before + 1);
        drop(obj);
        assert_eq!(live_objects(), before);
    }

    #[test]
    fn default_ops_refuse() {
        let obj: ObjRef = Rc::new(Dummy { header: ObjectHeader::new() });
        assert_eq!(obj.signal(&obj, AccessMask::empty()), Err(Status::OBJECT_TYPE_MISMATCH));
        assert!(obj.get_fd().is_err());
        assert!(obj.namespace().is_none());
    }
}
