//! Regular file objects
//!
//! Files wrap an fd-layer fd with the Windows create-disposition and
//! attribute semantics: disposition maps onto `O_*` flags, the unix mode is
//! derived from the attribute bits with execute-suffix heuristics, and
//! byte-range lock requests are forwarded to the lock manager.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use num_enum::TryFromPrimitive;

use crate::access::AccessMask;
use crate::access::FileAttributes;
use crate::access::OpenOptions;
use crate::access::ShareMode;
use crate::async_io::Async;
use crate::fd::lock_fd;
use crate::fd::open_fd;
use crate::fd::unlock_fd;
use crate::fd::Fd;
use crate::fd::FdOps;
use crate::fd::FdType;
use crate::fd::LockResult;
use crate::object::KObject;
use crate::object::ObjRef;
use crate::object::ObjectHeader;
use crate::process::Process;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;
use crate::wait::WaitQueueEntry;

/// NT create dispositions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum CreateDisposition {
    Supersede = 0,
    Open = 1,
    Create = 2,
    OpenIf = 3,
    Overwrite = 4,
    OverwriteIf = 5,
}

#[derive(Debug)]
pub struct File {
    header: ObjectHeader,
    fd: RefCell<Option<Rc<Fd>>>,
    mode: Cell<libc::mode_t>,
}

fn is_executable_name(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("exe") || ext.eq_ignore_ascii_case("com")
    )
}

impl File {
    fn from_fd(fd: Rc<Fd>, mode: libc::mode_t) -> Rc<File> {
        let file = Rc::new(File {
            header: ObjectHeader::new(),
            fd: RefCell::new(None),
            mode: Cell::new(mode),
        });
        fd.set_user(&file);
        *file.fd.borrow_mut() = Some(fd);
        file
    }

    /// Create or open a file by unix path with full disposition handling.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        server: &Rc<Server>,
        root: Option<&Rc<Fd>>,
        path: &Path,
        mut access: AccessMask,
        sharing: ShareMode,
        disposition: CreateDisposition,
        options: OpenOptions,
        attrs: FileAttributes,
    ) -> SvResult<Rc<File>> {
        let flags = match disposition {
            CreateDisposition::Create => libc::O_CREAT | libc::O_EXCL,
            CreateDisposition::Open => 0,
            CreateDisposition::OpenIf => libc::O_CREAT,
            CreateDisposition::Overwrite => {
                access |= AccessMask::FILE_WRITE_ATTRIBUTES;
                libc::O_TRUNC
            }
            CreateDisposition::OverwriteIf => {
                access |= AccessMask::FILE_WRITE_ATTRIBUTES;
                libc::O_CREAT | libc::O_TRUNC
            }
            CreateDisposition::Supersede => libc::O_CREAT | libc::O_TRUNC,
        };

        let readonly = attrs.contains(FileAttributes::READONLY);
        let mut mode: libc::mode_t = if options.contains(OpenOptions::DIRECTORY_FILE) {
            if readonly { 0o555 } else { 0o777 }
        } else {
            if readonly { 0o444 } else { 0o666 }
        };
        if is_executable_name(path) {
            // readable implies executable for the usual suspects
            if mode & libc::S_IRUSR != 0 {
                mode |= libc::S_IXUSR;
            }
            if mode & libc::S_IRGRP != 0 {
                mode |= libc::S_IXGRP;
            }
            if mode & libc::S_IROTH != 0 {
                mode |= libc::S_IXOTH;
            }
        }

        let access = access.map_generic_file();
        let fd = open_fd(
            server,
            root,
            path,
            flags | libc::O_NONBLOCK | libc::O_LARGEFILE,
            &mut mode,
            access,
            sharing,
            options,
        )?;
        Ok(File::from_fd(fd, mode))
    }

    /// Open an existing file read-style; the short form used everywhere a
    /// plain open is enough.
    pub fn create_from_unix_path(
        server: &Rc<Server>,
        path: &Path,
        access: AccessMask,
        sharing: ShareMode,
    ) -> SvResult<Rc<File>> {
        File::create(
            server,
            None,
            path,
            access,
            sharing,
            CreateDisposition::Open,
            OpenOptions::empty(),
            FileAttributes::empty(),
        )
    }

    /// Wrap a unix fd the server already owns (temp files, fds handed in by
    /// clients at `alloc_file_handle`).
    pub fn create_for_unix_fd(
        server: &Rc<Server>,
        unix_fd: libc::c_int,
        access: AccessMask,
        sharing: ShareMode,
    ) -> Rc<File> {
        let file = Rc::new(File {
            header: ObjectHeader::new(),
            fd: RefCell::new(None),
            mode: Cell::new(0o600),
        });
        let fd = Fd::create_anonymous(server, unix_fd, &file, OpenOptions::empty());
        fd.set_access(access.map_generic_file());
        fd.set_sharing(sharing);
        *file.fd.borrow_mut() = Some(fd);
        file
    }

    pub fn fd(&self) -> SvResult<Rc<Fd>> {
        self.fd.borrow().clone().ok_or(Status::OBJECT_TYPE_MISMATCH)
    }

    pub fn mode(&self) -> libc::mode_t {
        self.mode.get()
    }

    pub fn is_same_file(&self, other: &File) -> bool {
        match (self.fd.borrow().as_ref(), other.fd.borrow().as_ref()) {
            (Some(a), Some(b)) => a.is_same_file(b),
            _ => false,
        }
    }

    /// Lock a byte range on the file.
    pub fn lock(
        &self,
        process: &Rc<Process>,
        start: u64,
        count: u64,
        shared: bool,
        wait: bool,
    ) -> SvResult<LockResult> {
        lock_fd(&self.fd()?, process, start, count, shared, wait)
    }

    /// Remove the lock with exactly this range.
    pub fn unlock(&self, start: u64, count: u64) -> SvResult<()> {
        unlock_fd(&self.fd()?, start, count)
    }
}

impl KObject for File {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "File"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_wait(&self, entry: &Rc<WaitQueueEntry>) -> SvResult<()> {
        self.header.enqueue_wait(entry);
        Ok(())
    }

    fn signaled(&self, _entry: &WaitQueueEntry) -> bool {
        self.fd.borrow().as_ref().is_some_and(|fd| fd.is_signaled())
    }

    fn get_fd(&self) -> SvResult<Rc<Fd>> {
        self.fd()
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_file()
    }
}

impl FdOps for File {
    fn fd_type(&self, fd: &Fd) -> FdType {
        if fd.options().contains(OpenOptions::DIRECTORY_FILE) {
            FdType::Dir
        } else {
            FdType::File
        }
    }

    fn flush(&self, _server: &Server, fd: &Rc<Fd>, _async_op: &Rc<Async>) -> SvResult<Status> {
        let unix_fd = fd.unix_fd()?;
        if unsafe { libc::fsync(unix_fd) } == -1 {
            return Err(Status::from_errno(nix::errno::Errno::last()));
        }
        Ok(Status::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn dispositions() {
        let server = Server::new_for_tests();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");

        // OPEN of a missing file fails
        let err = File::create(
            &server,
            None,
            &path,
            AccessMask::GENERIC_READ,
            ShareMode::READ,
            CreateDisposition::Open,
            OpenOptions::empty(),
            FileAttributes::empty(),
        )
        .unwrap_err();
        assert_eq!(err, Status::NO_SUCH_FILE);

        // CREATE makes it
        File::create(
            &server,
            None,
            &path,
            AccessMask::GENERIC_WRITE,
            ShareMode::READ,
            CreateDisposition::Create,
            OpenOptions::empty(),
            FileAttributes::empty(),
        )
        .unwrap();
        assert!(path.exists());

        // CREATE again collides
        let err = File::create(
            &server,
            None,
            &path,
            AccessMask::GENERIC_WRITE,
            ShareMode::READ,
            CreateDisposition::Create,
            OpenOptions::empty(),
            FileAttributes::empty(),
        )
        .unwrap_err();
        assert_eq!(err, Status::OBJECT_NAME_COLLISION);

        // OPEN_IF opens it
        File::create(
            &server,
            None,
            &path,
            AccessMask::GENERIC_READ,
            ShareMode::READ | ShareMode::WRITE,
            CreateDisposition::OpenIf,
            OpenOptions::empty(),
            FileAttributes::empty(),
        )
        .unwrap();
    }

    #[test]
    fn overwrite_truncates() {
        let server = Server::new_for_tests();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t");
        std::fs::write(&path, b"hello world").unwrap();
        File::create(
            &server,
            None,
            &path,
            AccessMask::GENERIC_WRITE,
            ShareMode::READ,
            CreateDisposition::Overwrite,
            OpenOptions::empty(),
            FileAttributes::empty(),
        )
        .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn readonly_attribute_sets_mode() {
        let server = Server::new_for_tests();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ro");
        let file = File::create(
            &server,
            None,
            &path,
            AccessMask::GENERIC_READ,
            ShareMode::READ,
            CreateDisposition::Create,
            OpenOptions::empty(),
            FileAttributes::READONLY,
        )
        .unwrap();
        assert_eq!(file.mode() & 0o222, 0);
    }

    #[test]
    fn exe_suffix_gets_exec_bits() {
        let server = Server::new_for_tests();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prog.exe");
        let file = File::create(
            &server,
            None,
            &path,
            AccessMask::GENERIC_WRITE,
            ShareMode::READ,
            CreateDisposition::Create,
            OpenOptions::empty(),
            FileAttributes::empty(),
        )
        .unwrap();
        assert_ne!(file.mode() & libc::S_IXUSR, 0);
    }

    #[test]
    fn directory_open() {
        let server = Server::new_for_tests();
        let dir = TempDir::new().unwrap();
        let file = File::create(
            &server,
            None,
            dir.path(),
            AccessMask::GENERIC_READ,
            ShareMode::READ | ShareMode::WRITE,
            CreateDisposition::Open,
            OpenOptions::DIRECTORY_FILE,
            FileAttributes::empty(),
        )
        .unwrap();
        assert_eq!(file.fd().unwrap().options(), OpenOptions::DIRECTORY_FILE);
        // opening it as a non-directory fails
        let err = File::create(
            &server,
            None,
            dir.path(),
            AccessMask::GENERIC_READ,
            ShareMode::READ | ShareMode::WRITE,
            CreateDisposition::Open,
            OpenOptions::NON_DIRECTORY_FILE,
            FileAttributes::empty(),
        )
        .unwrap_err();
        assert_eq!(err, Status::FILE_IS_A_DIRECTORY);
    }
}
