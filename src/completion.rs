//! I/O completion ports
//!
//! A completion object is a FIFO of completion records. Fds bind to one with
//! a caller-chosen key; completed asyncs on a bound fd post records here, and
//! client threads wait on the object until a record is available.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::access::AccessMask;
use crate::access::Attributes;
use crate::namespace::create_named_object;
use crate::namespace::directory_link_name;
use crate::namespace::CreateResult;
use crate::object::KObject;
use crate::object::ObjRef;
use crate::object::ObjectHeader;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;
use crate::wait::wake_up;
use crate::wait::WaitQueueEntry;

/// A queued completion notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    pub key: u64,
    pub value: u64,
    pub status: Status,
    pub information: u64,
}

#[derive(Debug)]
pub struct IoCompletion {
    header: ObjectHeader,
    queue: RefCell<VecDeque<CompletionRecord>>,
}

impl IoCompletion {
    pub fn create(
        server: &Server,
        root: Option<&ObjRef>,
        name: &str,
        attrs: Attributes,
    ) -> SvResult<CreateResult<IoCompletion>> {
        create_named_object(server, root, name, attrs, || {
            Ok(Rc::new(IoCompletion {
                header: ObjectHeader::new(),
                queue: RefCell::new(VecDeque::new()),
            }))
        })
    }

    /// Post a completion record and wake one waiter.
    pub fn add(self: &Rc<Self>, key: u64, value: u64, status: Status, information: u64) {
        self.queue.borrow_mut().push_back(CompletionRecord { key, value, status, information });
        let obj: ObjRef = self.clone();
        wake_up(&obj, 1);
    }

    /// Pop the oldest record.
    pub fn pop(&self) -> Option<CompletionRecord> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn depth(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl KObject for IoCompletion {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "IoCompletion"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header.enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, _entry: &WaitQueueEntry) -> bool {
        !self.queue.borrow().is_empty()
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

    #[test]
    fn records_are_fifo() {
        let server = Server::new_for_tests();
        let port = IoCompletion::create(&server, None, "", Attributes::empty()).unwrap().obj;
        port.add(1, 100, Status::SUCCESS, 8);
        port.add(2, 200, Status::CANCELLED, 0);
        assert_eq!(port.depth(), 2);
        assert_eq!(port.pop().unwrap().key, 1);
        assert_eq!(port.pop().unwrap().key, 2);
        assert!(port.pop().is_none());
    }
}
