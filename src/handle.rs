//! Per-process handle tables
//!
//! A handle is an opaque 32-bit value with the two low bits reserved (always
//! zero on the wire). The table grows on demand and reuses the lowest free
//! slot first, so handle values stay small and predictable.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::access::AccessMask;
use crate::object::KObject;
use crate::object::ObjRef;
use crate::process::Process;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;

/// An opaque handle value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

impl Handle {
    /// Handles `0` and `-1` are never valid.
    pub fn is_valid(self) -> bool {
        self.0 != 0 && self.0 != u32::MAX && self.0 & 3 == 0
    }

    fn from_index(index: usize) -> Handle {
        Handle(((index as u32) + 1) << 2)
    }

    fn index(self) -> Option<usize> {
        if !self.is_valid() {
            return None;
        }
        Some((self.0 >> 2) as usize - 1)
    }
}

bitflags! {
    /// Per-handle attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HandleFlags: u32 {
        const INHERIT = 0x01;
        const PROTECT_FROM_CLOSE = 0x02;
    }
}

bitflags! {
    /// Options for `duplicate`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DuplicateOptions: u32 {
        const CLOSE_SOURCE = 0x01;
        const SAME_ACCESS = 0x02;
        const SAME_ATTRIBUTES = 0x04;
    }
}

#[derive(Clone)]
struct HandleEntry {
    obj: ObjRef,
    access: AccessMask,
    flags: HandleFlags,
}

/// A growable handle table, one per process.
#[derive(Default)]
pub struct HandleTable {
    entries: RefCell<Vec<Option<HandleEntry>>>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable::default()
    }

    /// Allocate a handle to an object. Generic access bits are expanded by
    /// the object type before the mask is stored.
    pub fn alloc(&self, obj: &ObjRef, access: AccessMask, flags: HandleFlags) -> SvResult<Handle> {
        let access = obj.map_access(access);
        let mut entries = self.entries.borrow_mut();
        let index = match entries.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                entries.push(None);
                entries.len() - 1
            }
        };
        entries[index] = Some(HandleEntry { obj: obj.clone(), access, flags });
        obj.header().inc_handle_count();
        Ok(Handle::from_index(index))
    }

    fn entry(&self, handle: Handle) -> SvResult<HandleEntry> {
        let index = handle.index().ok_or(Status::INVALID_HANDLE)?;
        self.entries
            .borrow()
            .get(index)
            .and_then(Clone::clone)
            .ok_or(Status::INVALID_HANDLE)
    }

    /// Look up the object behind a handle, checking the granted access mask
    /// covers every requested bit.
    pub fn get_obj(&self, handle: Handle, required: AccessMask) -> SvResult<ObjRef> {
        let entry = self.entry(handle)?;
        if !entry.access.contains(required) {
            return Err(Status::ACCESS_DENIED);
        }
        Ok(entry.obj)
    }

    /// Typed lookup; the object must be a `T`.
    pub fn get_obj_as<T: KObject>(&self, handle: Handle, required: AccessMask) -> SvResult<Rc<T>> {
        let obj = self.get_obj(handle, required)?;
        crate::namespace::rc_downcast::<T>(&obj).ok_or(Status::OBJECT_TYPE_MISMATCH)
    }

    /// The granted access mask of a handle.
    pub fn get_access(&self, handle: Handle) -> SvResult<AccessMask> {
        Ok(self.entry(handle)?.access)
    }

    /// The attribute flags of a handle.
    pub fn get_flags(&self, handle: Handle) -> SvResult<HandleFlags> {
        Ok(self.entry(handle)?.flags)
    }

    /// Update the attribute flags of a handle.
    pub fn set_flags(&self, handle: Handle, flags: HandleFlags) -> SvResult<()> {
        let index = handle.index().ok_or(Status::INVALID_HANDLE)?;
        let mut entries = self.entries.borrow_mut();
        match entries.get_mut(index).and_then(Option::as_mut) {
            Some(entry) => {
                entry.flags = flags;
                Ok(())
            }
            None => Err(Status::INVALID_HANDLE),
        }
    }

    /// Close a handle. The object's `close_handle` hook may veto.
    pub fn close(&self, server: &Server, process: &Rc<Process>, handle: Handle) -> SvResult<()> {
        let entry = self.entry(handle)?;
        if entry.flags.contains(HandleFlags::PROTECT_FROM_CLOSE) {
            return Err(Status::HANDLE_NOT_CLOSABLE);
        }
        // run the veto hook with the table unborrowed; it may touch objects
        // that in turn reach back into this table
        if !entry.obj.close_handle(server, process, handle) {
            return Err(Status::HANDLE_NOT_CLOSABLE);
        }
        let removed = {
            let mut entries = self.entries.borrow_mut();
            let index = handle.index().ok_or(Status::INVALID_HANDLE)?;
            match entries.get_mut(index) {
                Some(slot @ Some(_)) => slot.take(),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                entry.obj.header().dec_handle_count();
                Ok(())
            }
            None => Err(Status::INVALID_HANDLE),
        }
    }

    /// Number of live handles in the table.
    pub fn count(&self) -> usize {
        self.entries.borrow().iter().flatten().count()
    }

    /// Copy the inheritable entries for a new child process, preserving
    /// handle values.
    pub fn inherit(&self) -> HandleTable {
        let entries: Vec<Option<HandleEntry>> = self
            .entries
            .borrow()
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .filter(|e| e.flags.contains(HandleFlags::INHERIT))
                    .cloned()
            })
            .collect();
        for entry in entries.iter().flatten() {
            entry.obj.header().inc_handle_count();
        }
        HandleTable { entries: RefCell::new(entries) }
    }

    /// Release every handle, running no veto hooks. Used at process
    /// teardown, where closes cannot be refused.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.borrow_mut());
        for entry in entries.into_iter().flatten() {
            entry.obj.header().dec_handle_count();
        }
    }
}

impl Drop for HandleTable {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HandleTable({} handles)", self.count())
    }
}

/// Duplicate a handle between processes.
pub fn duplicate_handle(
    server: &Server,
    src_process: &Rc<Process>,
    src_handle: Handle,
    dst_process: &Rc<Process>,
    access: AccessMask,
    flags: HandleFlags,
    options: DuplicateOptions,
) -> SvResult<Handle> {
    let src_table = src_process.handles();
    let obj = src_table.get_obj(src_handle, AccessMask::empty())?;
    let access = if options.contains(DuplicateOptions::SAME_ACCESS) {
        src_table.get_access(src_handle)?
    } else {
        access
    };
    let flags = if options.contains(DuplicateOptions::SAME_ATTRIBUTES) {
        src_table.get_flags(src_handle)?
    } else {
        flags
    };
    let dst = dst_process.handles().alloc(&obj, access, flags)?;
    if options.contains(DuplicateOptions::CLOSE_SOURCE) {
        src_table.close(server, src_process, src_handle)?;
    }
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Directory;
    use crate::server::Server;

    #[test]
    fn handle_values() {
        assert!(!Handle(0).is_valid());
        assert!(!Handle(u32::MAX).is_valid());
        assert!(!Handle(6).is_valid());
        assert_eq!(Handle::from_index(0), Handle(4));
        assert_eq!(Handle(4).index(), Some(0));
    }

    #[test]
    fn alloc_reuses_lowest_slot() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let table = HandleTable::new();
        let obj: ObjRef = Directory::new(7);
        let h1 = table.alloc(&obj, AccessMask::GENERIC_READ, HandleFlags::empty()).unwrap();
        let h2 = table.alloc(&obj, AccessMask::GENERIC_READ, HandleFlags::empty()).unwrap();
        assert_eq!(obj.header().handle_count(), 2);
        table.close(&server, &process, h1).unwrap();
        assert_eq!(table.get_obj(h1, AccessMask::empty()).unwrap_err(), Status::INVALID_HANDLE);
        let h3 = table.alloc(&obj, AccessMask::GENERIC_READ, HandleFlags::empty()).unwrap();
        assert_eq!(h1, h3);
        assert_ne!(h2, h3);
    }

    #[test]
    fn access_check() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let table = process.handles();
        let obj: ObjRef = Directory::new(7);
        let h = table.alloc(&obj, AccessMask::STANDARD_RIGHTS_READ, HandleFlags::empty()).unwrap();
        assert!(table.get_obj(h, AccessMask::STANDARD_RIGHTS_READ).is_ok());
        assert_eq!(
            table.get_obj(h, AccessMask::DELETE).unwrap_err(),
            Status::ACCESS_DENIED
        );
    }

    #[test]
    fn protect_from_close() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let table = process.handles();
        let obj: ObjRef = Directory::new(7);
        let h = table
            .alloc(&obj, AccessMask::GENERIC_READ, HandleFlags::PROTECT_FROM_CLOSE)
            .unwrap();
        assert_eq!(table.close(&server, &process, h).unwrap_err(), Status::HANDLE_NOT_CLOSABLE);
        table.set_flags(h, HandleFlags::empty()).unwrap();
        table.close(&server, &process, h).unwrap();
    }

    #[test]
    fn duplicate_close_source() {
        let server = Server::new_for_tests();
        let process = server.make_test_process();
        let obj: ObjRef = Directory::new(7);
        let src = process
            .handles()
            .alloc(&obj, AccessMask::GENERIC_READ, HandleFlags::empty())
            .unwrap();
        let dst = duplicate_handle(
            &server,
            &process,
            src,
            &process,
            AccessMask::empty(),
            HandleFlags::empty(),
            DuplicateOptions::SAME_ACCESS | DuplicateOptions::CLOSE_SOURCE,
        )
        .unwrap();
        assert_eq!(
            process.handles().get_obj(src, AccessMask::empty()).unwrap_err(),
            Status::INVALID_HANDLE
        );
        let granted = process.handles().get_access(dst).unwrap();
        assert!(granted.contains(AccessMask::STANDARD_RIGHTS_READ));
    }

    #[test]
    fn inherit_copies_marked_entries() {
        let table = HandleTable::new();
        let obj: ObjRef = Directory::new(7);
        let h1 = table.alloc(&obj, AccessMask::GENERIC_READ, HandleFlags::INHERIT).unwrap();
        let _h2 = table.alloc(&obj, AccessMask::GENERIC_READ, HandleFlags::empty()).unwrap();
        let child = table.inherit();
        assert_eq!(child.count(), 1);
        assert!(child.get_obj(h1, AccessMask::empty()).is_ok());
    }
}
