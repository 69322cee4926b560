//! Symbolic link objects
//!
//! A symlink is a plain named object whose `lookup_name` redirects the walk:
//! the target path is resolved from the root and the walk continues from
//! whatever it names. `OPEN_LINK` on the final element opens the link object
//! itself instead.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::access::AccessMask;
use crate::access::Attributes;
use crate::namespace::create_named_object;
use crate::namespace::directory_link_name;
use crate::namespace::lookup_with_depth;
use crate::namespace::CreateResult;
use crate::namespace::LookupPath;
use crate::object::get_full_name;
use crate::object::KObject;
use crate::object::ObjRef;
use crate::object::ObjectHeader;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;

#[derive(Debug)]
pub struct SymbolicLink {
    header: ObjectHeader,
    target: RefCell<String>,
}

impl SymbolicLink {
    /// Create a named symlink with a literal target path.
    pub fn create(
        server: &Server,
        root: Option<&ObjRef>,
        name: &str,
        attrs: Attributes,
        target: &str,
    ) -> SvResult<CreateResult<SymbolicLink>> {
        if target.is_empty() {
            return Err(Status::INVALID_PARAMETER);
        }
        create_named_object(server, root, name, attrs, || {
            Ok(Rc::new(SymbolicLink {
                header: ObjectHeader::new(),
                target: RefCell::new(target.to_string()),
            }))
        })
    }

    /// Create a symlink pointing at an existing object, by its full name.
    pub fn create_to_object(
        server: &Server,
        root: Option<&ObjRef>,
        name: &str,
        attrs: Attributes,
        target: &ObjRef,
    ) -> SvResult<CreateResult<SymbolicLink>> {
        let Some(target_name) = get_full_name(target) else {
            return Err(Status::INVALID_PARAMETER);
        };
        SymbolicLink::create(server, root, name, attrs, &target_name)
    }

    /// The link's target path.
    pub fn target(&self) -> String {
        self.target.borrow().clone()
    }
}

impl KObject for SymbolicLink {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "SymbolicLink"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_default()
    }

    fn lookup_name(
        &self,
        _self_ref: &ObjRef,
        path: &mut LookupPath,
        server: &Server,
    ) -> SvResult<Option<ObjRef>> {
        // a link as the final element is opened as-is under OPEN_LINK
        if path.rest().is_none() && path.attrs().contains(Attributes::OPEN_LINK) {
            return Ok(None);
        }
        let target = self.target.borrow().clone();
        let (obj, rest) =
            lookup_with_depth(server, None, &target, path.attrs(), path.depth() + 1)?;
        if rest.is_some() {
            return Err(Status::OBJECT_PATH_NOT_FOUND);
        }
        Ok(Some(obj))
    }

    fn link_name(&self, self_ref: &ObjRef, name: &str, parent: &ObjRef) -> SvResult<()> {
        directory_link_name(self_ref, name, parent)
    }
}
