//! Object namespace
//!
//! Named objects hang off container objects (directories, the named pipe
//! device) through hash-bucketed namespaces. Buckets index objects weakly:
//! the name does not keep an object alive, so named objects vanish with
//! their last real reference and the whole tree is rebuilt fresh at every
//! server start.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use crate::access::Attributes;
use crate::object::downcast;
use crate::object::KObject;
use crate::object::NameEntry;
use crate::object::ObjRef;
use crate::object::ObjectHeader;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;

/// Symlink traversal limit; a longer chain is reported as a broken path.
const MAX_RELINK_DEPTH: u32 = 32;

struct NsEntry {
    name: String,
    obj: Weak<dyn KObject>,
}

/// A hash-bucketed name index owned by a container object.
pub struct Namespace {
    buckets: Vec<RefCell<Vec<NsEntry>>>,
}

impl Namespace {
    pub fn new(hash_size: usize) -> Namespace {
        Namespace {
            buckets: (0..hash_size).map(|_| RefCell::new(Vec::new())).collect(),
        }
    }

    // Case-insensitive hash so both lookup modes land in the same bucket.
    fn bucket(&self, name: &str) -> &RefCell<Vec<NsEntry>> {
        let mut hash = 0u32;
        for c in name.chars() {
            for lc in c.to_lowercase() {
                hash ^= lc as u32;
            }
        }
        &self.buckets[hash as usize % self.buckets.len()]
    }

    fn name_matches(entry: &str, name: &str, attrs: Attributes) -> bool {
        if attrs.contains(Attributes::CASE_INSENSITIVE) {
            entry.len() == name.len()
                && entry
                    .chars()
                    .flat_map(char::to_lowercase)
                    .eq(name.chars().flat_map(char::to_lowercase))
        } else {
            entry == name
        }
    }

    /// Find a live object by name.
    pub fn find(&self, name: &str, attrs: Attributes) -> Option<ObjRef> {
        let bucket = self.bucket(name).borrow();
        for entry in bucket.iter() {
            if Self::name_matches(&entry.name, name, attrs) {
                if let Some(obj) = entry.obj.upgrade() {
                    return Some(obj);
                }
            }
        }
        None
    }

    /// Insert an object under a name. Uniqueness is the caller's problem;
    /// lookup has already established the name is free.
    pub fn add(&self, name: &str, obj: &ObjRef) {
        self.bucket(name).borrow_mut().push(NsEntry {
            name: name.to_string(),
            obj: Rc::downgrade(obj),
        });
    }

    /// Remove the entry for a specific object.
    pub fn remove(&self, name: &str, obj_ptr: *const ()) {
        self.bucket(name).borrow_mut().retain(|e| {
            e.name != name
                || match e.obj.upgrade() {
                    Some(obj) => Rc::as_ptr(&obj) as *const () != obj_ptr,
                    None => false,
                }
        });
    }

    /// Remove the entry of an object that is mid-destruction (its weak
    /// reference no longer upgrades).
    pub fn remove_dead(&self, name: &str) {
        self.bucket(name)
            .borrow_mut()
            .retain(|e| e.name != name || e.obj.upgrade().is_some());
    }

    /// Live objects in the namespace, in bucket order.
    pub fn objects(&self) -> Vec<ObjRef> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            for entry in bucket.borrow().iter() {
                if let Some(obj) = entry.obj.upgrade() {
                    out.push(obj);
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Namespace({} buckets)", self.buckets.len())
    }
}

/// Remaining path state threaded through a name lookup.
#[derive(Debug)]
pub struct LookupPath {
    rest: Option<String>,
    attrs: Attributes,
    depth: u32,
}

impl LookupPath {
    fn new(rest: Option<String>, attrs: Attributes, depth: u32) -> LookupPath {
        LookupPath { rest, attrs, depth }
    }

    pub fn rest(&self) -> Option<&str> {
        self.rest.as_deref()
    }

    pub fn attrs(&self) -> Attributes {
        self.attrs
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn set_rest(&mut self, rest: Option<String>) {
        self.rest = rest;
    }
}

/// A namespace directory.
#[derive(Debug)]
pub struct Directory {
    header: ObjectHeader,
    entries: Namespace,
}

impl Directory {
    /// Create an anonymous directory with the given bucket count.
    pub fn new(hash_size: usize) -> Rc<Directory> {
        Rc::new(Directory {
            header: ObjectHeader::new(),
            entries: Namespace::new(hash_size),
        })
    }

    /// Create (or open with `OPEN_IF`) a named directory.
    pub fn create(
        server: &Server,
        root: Option<&ObjRef>,
        name: &str,
        attrs: Attributes,
        hash_size: usize,
    ) -> SvResult<CreateResult<Directory>> {
        create_named_object(server, root, name, attrs, || Ok(Directory::new(hash_size)))
    }
}

impl KObject for Directory {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "Directory"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn namespace(&self) -> Option<&Namespace> {
        Some(&self.entries)
    }

    fn lookup_name(
        &self,
        _self_ref: &ObjRef,
        path: &mut LookupPath,
        _server: &Server,
    ) -> SvResult<Option<ObjRef>> {
        let Some(rest) = path.rest().map(str::to_string) else {
            return Ok(None);
        };
        if rest.is_empty() {
            return Ok(None);
        }
        let (component, remainder) = match memchr::memchr(b'\\', rest.as_bytes()) {
            Some(idx) => (&rest[..idx], Some(rest[idx + 1..].to_string())),
            None => (rest.as_str(), None),
        };
        if component.is_empty() {
            return Err(Status::OBJECT_PATH_SYNTAX_BAD);
        }
        match self.entries.find(component, path.attrs()) {
            Some(obj) => {
                path.set_rest(remainder);
                Ok(Some(obj))
            }
            None if remainder.is_some() => Err(Status::OBJECT_PATH_NOT_FOUND),
            None => Ok(None),
        }
    }

    fn link_name(&self, self_ref: &ObjRef, name: &str, parent: &ObjRef) -> SvResult<()> {
        directory_link_name(self_ref, name, parent)
    }
}

/// Link an object into a parent that must be a plain directory. Shared by
/// every type that can live in the directory tree.
pub fn directory_link_name(obj: &ObjRef, name: &str, parent: &ObjRef) -> SvResult<()> {
    let Some(dir) = downcast::<Directory>(parent) else {
        return Err(Status::OBJECT_TYPE_MISMATCH);
    };
    dir.entries.add(name, obj);
    Ok(())
}

/// Find an object by path starting from `root` (or the server root when
/// absent). Returns the deepest resolved object and the residual path, which
/// is `None` when the path resolved completely.
pub fn lookup_named_object(
    server: &Server,
    root: Option<&ObjRef>,
    name: &str,
    attrs: Attributes,
) -> SvResult<(ObjRef, Option<String>)> {
    lookup_with_depth(server, root, name, attrs, 0)
}

pub(crate) fn lookup_with_depth(
    server: &Server,
    root: Option<&ObjRef>,
    name: &str,
    attrs: Attributes,
    depth: u32,
) -> SvResult<(ObjRef, Option<String>)> {
    if depth > MAX_RELINK_DEPTH {
        return Err(Status::OBJECT_PATH_NOT_FOUND);
    }
    let (mut parent, rest) = match root {
        Some(root) => {
            // with an explicit root the path must be relative
            if name.starts_with('\\') {
                return Err(Status::OBJECT_PATH_SYNTAX_BAD);
            }
            (root.clone(), name)
        }
        None => {
            let Some(rest) = name.strip_prefix('\\') else {
                return Err(Status::OBJECT_PATH_SYNTAX_BAD);
            };
            (server.root_directory(), rest)
        }
    };
    let rest = if rest.is_empty() { None } else { Some(rest.to_string()) };
    let mut path = LookupPath::new(rest, attrs, depth);
    loop {
        let parent_ref = parent.clone();
        match parent_ref.lookup_name(&parent_ref, &mut path, server)? {
            Some(obj) => parent = obj,
            None => break,
        }
    }
    Ok((parent, path.rest))
}

/// Open an existing object by name; a residual path is a lookup failure.
pub fn open_named_object(
    server: &Server,
    root: Option<&ObjRef>,
    name: &str,
    attrs: Attributes,
) -> SvResult<ObjRef> {
    let (obj, rest) = lookup_named_object(server, root, name, attrs)?;
    match rest {
        Some(_) => Err(Status::OBJECT_NAME_NOT_FOUND),
        None => Ok(obj),
    }
}

/// Typed open: the resolved object must be a `T`.
pub fn open_named_object_as<T: KObject>(
    server: &Server,
    root: Option<&ObjRef>,
    name: &str,
    attrs: Attributes,
) -> SvResult<Rc<T>> {
    let obj = open_named_object(server, root, name, attrs)?;
    match rc_downcast::<T>(&obj) {
        Some(typed) => Ok(typed),
        None => Err(Status::OBJECT_TYPE_MISMATCH),
    }
}

/// Result of a create-or-open in the namespace.
#[derive(Debug)]
pub struct CreateResult<T: KObject> {
    pub obj: Rc<T>,
    /// False when `OPEN_IF` matched an existing object; the request reply
    /// then carries `OBJECT_NAME_EXISTS`.
    pub created: bool,
}

impl<T: KObject> CreateResult<T> {
    /// The informational status to report alongside the object.
    pub fn status(&self) -> Status {
        if self.created {
            Status::SUCCESS
        } else {
            Status::OBJECT_NAME_EXISTS
        }
    }
}

/// Create an object as a named child of the resolved parent, or open the
/// existing object when `OPEN_IF` allows it. An empty name creates an
/// anonymous object.
pub fn create_named_object<T, F>(
    server: &Server,
    root: Option<&ObjRef>,
    name: &str,
    attrs: Attributes,
    make: F,
) -> SvResult<CreateResult<T>>
where
    T: KObject,
    F: FnOnce() -> SvResult<Rc<T>>,
{
    if name.is_empty() {
        return Ok(CreateResult { obj: make()?, created: true });
    }
    let (parent, rest) = lookup_named_object(server, root, name, attrs)?;
    let Some(leaf) = rest else {
        // fully resolved: the name already exists
        if attrs.contains(Attributes::OPEN_IF) {
            return match rc_downcast::<T>(&parent) {
                Some(existing) => Ok(CreateResult { obj: existing, created: false }),
                None => Err(Status::OBJECT_TYPE_MISMATCH),
            };
        }
        return Err(Status::OBJECT_NAME_COLLISION);
    };
    if leaf.is_empty() {
        return Err(Status::OBJECT_NAME_INVALID);
    }
    let obj = make()?;
    let obj_ref: ObjRef = obj.clone();
    obj_ref.link_name(&obj_ref, &leaf, &parent)?;
    obj.header().set_name(NameEntry { parent, name: leaf });
    Ok(CreateResult { obj, created: true })
}

/// Downcast an `Rc<dyn KObject>` to a concrete `Rc<T>`.
pub fn rc_downcast<T: KObject>(obj: &ObjRef) -> Option<Rc<T>> {
    if obj.as_any().is::<T>() {
        let raw = Rc::into_raw(obj.clone());
        // type checked above; the header layout is shared
        Some(unsafe { Rc::from_raw(raw as *const T) })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;

    #[test]
    fn namespace_case_rules() {
        let ns = Namespace::new(7);
        let dir = Directory::new(7);
        let obj: ObjRef = dir.clone();
        ns.add("Foo", &obj);
        assert!(ns.find("Foo", Attributes::empty()).is_some());
        assert!(ns.find("foo", Attributes::empty()).is_none());
        assert!(ns.find("FOO", Attributes::CASE_INSENSITIVE).is_some());
        ns.remove("Foo", Rc::as_ptr(&obj) as *const ());
        assert!(ns.find("Foo", Attributes::CASE_INSENSITIVE).is_none());
    }

    #[test]
    fn path_resolution() {
        let server = Server::new_for_tests();
        let attrs = Attributes::CASE_INSENSITIVE;
        let sub = Directory::create(&server, None, "\\Sub", attrs, 7).unwrap();
        assert!(sub.created);
        let leaf = Directory::create(&server, None, "\\Sub\\Leaf", attrs, 7).unwrap();
        assert!(leaf.created);

        let (obj, rest) = lookup_named_object(&server, None, "\\Sub\\Leaf", attrs).unwrap();
        assert!(rest.is_none());
        assert_eq!(obj.type_name(), "Directory");

        let (_, rest) = lookup_named_object(&server, None, "\\Sub\\Missing", attrs).unwrap();
        assert_eq!(rest.as_deref(), Some("Missing"));

        assert_eq!(
            lookup_named_object(&server, None, "\\Sub\\Missing\\Deeper", attrs).unwrap_err(),
            Status::OBJECT_PATH_NOT_FOUND
        );
        assert_eq!(
            lookup_named_object(&server, None, "relative", attrs).unwrap_err(),
            Status::OBJECT_PATH_SYNTAX_BAD
        );
    }

    #[test]
    fn name_collision_rules() {
        let server = Server::new_for_tests();
        let attrs = Attributes::CASE_INSENSITIVE;
        Directory::create(&server, None, "\\Dup", attrs, 7).unwrap();
        // second create without OPEN_IF collides
        assert_eq!(
            Directory::create(&server, None, "\\Dup", attrs, 7).unwrap_err(),
            Status::OBJECT_NAME_COLLISION
        );
        // with OPEN_IF the existing object comes back
        let reopened =
            Directory::create(&server, None, "\\Dup", attrs | Attributes::OPEN_IF, 7).unwrap();
        assert!(!reopened.created);
        assert_eq!(reopened.status(), Status::OBJECT_NAME_EXISTS);
    }

    #[test]
    fn named_object_dies_with_last_reference() {
        let server = Server::new_for_tests();
        let attrs = Attributes::CASE_INSENSITIVE;
        let dir = Directory::create(&server, None, "\\Transient", attrs, 7).unwrap().obj;
        drop(dir);
        let (_, rest) = lookup_named_object(&server, None, "\\Transient", attrs).unwrap();
        assert_eq!(rest.as_deref(), Some("Transient"));
    }
}
