//! NT status codes
//!
//! All request handlers report failure through a single flat status namespace.
//! A handler never unwinds across the dispatch boundary; it returns an
//! [`SvResult`] whose error half is carried back in the reply header.

use std::fmt;

use nix::errno::Errno;

/// Result type used throughout the server core.
pub type SvResult<T> = Result<T, Status>;

/// An NT status code.
///
/// Wrapped as a newtype so handlers can propagate with `?` while keeping the
/// raw 32-bit wire representation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

#[allow(missing_docs)]
impl Status {
    pub const SUCCESS: Status = Status(0x0000_0000);
    pub const WAIT_0: Status = Status(0x0000_0000);
    pub const ABANDONED_WAIT_0: Status = Status(0x0000_0080);
    pub const USER_APC: Status = Status(0x0000_00c0);
    pub const ALERTED: Status = Status(0x0000_0101);
    pub const TIMEOUT: Status = Status(0x0000_0102);
    pub const PENDING: Status = Status(0x0000_0103);
    pub const OBJECT_NAME_EXISTS: Status = Status(0x4000_0000);

    pub const UNSUCCESSFUL: Status = Status(0xc000_0001);
    pub const NOT_IMPLEMENTED: Status = Status(0xc000_0002);
    pub const INVALID_INFO_CLASS: Status = Status(0xc000_0003);
    pub const ACCESS_VIOLATION: Status = Status(0xc000_0005);
    pub const INVALID_HANDLE: Status = Status(0xc000_0008);
    pub const INVALID_PARAMETER: Status = Status(0xc000_000d);
    pub const NO_SUCH_DEVICE: Status = Status(0xc000_000e);
    pub const NO_SUCH_FILE: Status = Status(0xc000_000f);
    pub const INVALID_DEVICE_REQUEST: Status = Status(0xc000_0010);
    pub const END_OF_FILE: Status = Status(0xc000_0011);
    pub const NO_MEMORY: Status = Status(0xc000_0017);
    pub const ACCESS_DENIED: Status = Status(0xc000_0022);
    pub const BUFFER_TOO_SMALL: Status = Status(0xc000_0023);
    pub const OBJECT_TYPE_MISMATCH: Status = Status(0xc000_0024);
    pub const OBJECT_NAME_INVALID: Status = Status(0xc000_0033);
    pub const OBJECT_NAME_NOT_FOUND: Status = Status(0xc000_0034);
    pub const OBJECT_NAME_COLLISION: Status = Status(0xc000_0035);
    pub const OBJECT_PATH_INVALID: Status = Status(0xc000_0039);
    pub const OBJECT_PATH_NOT_FOUND: Status = Status(0xc000_003a);
    pub const OBJECT_PATH_SYNTAX_BAD: Status = Status(0xc000_003b);
    pub const SHARING_VIOLATION: Status = Status(0xc000_0043);
    pub const FILE_LOCK_CONFLICT: Status = Status(0xc000_0054);
    pub const LOCK_NOT_GRANTED: Status = Status(0xc000_0055);
    pub const DELETE_PENDING: Status = Status(0xc000_0056);
    pub const MUTANT_NOT_OWNED: Status = Status(0xc000_0046);
    pub const SEMAPHORE_LIMIT_EXCEEDED: Status = Status(0xc000_0047);
    pub const DISK_FULL: Status = Status(0xc000_007f);
    pub const TOO_MANY_OPENED_FILES: Status = Status(0xc000_011f);
    pub const CANCELLED: Status = Status(0xc000_0120);
    pub const CANNOT_DELETE: Status = Status(0xc000_0121);
    pub const FILE_DELETED: Status = Status(0xc000_0123);
    pub const FILE_IS_A_DIRECTORY: Status = Status(0xc000_00ba);
    pub const NOT_A_DIRECTORY: Status = Status(0xc000_0103);
    pub const ILLEGAL_FUNCTION: Status = Status(0xc000_00af);
    pub const PIPE_BUSY: Status = Status(0xc000_00ae);
    pub const PIPE_DISCONNECTED: Status = Status(0xc000_00b0);
    pub const PIPE_CLOSING: Status = Status(0xc000_00b1);
    pub const PIPE_CONNECTED: Status = Status(0xc000_00b2);
    pub const PIPE_LISTENING: Status = Status(0xc000_00b3);
    pub const PIPE_NOT_AVAILABLE: Status = Status(0xc000_00ac);
    pub const INVALID_PIPE_STATE: Status = Status(0xc000_00ad);
    pub const INSTANCE_NOT_AVAILABLE: Status = Status(0xc000_00ab);
    pub const SECTION_TOO_BIG: Status = Status(0xc000_0040);
    pub const INVALID_FILE_FOR_SECTION: Status = Status(0xc000_0020);
    pub const INVALID_IMAGE_FORMAT: Status = Status(0xc000_007b);
    pub const INVALID_IMAGE_NOT_MZ: Status = Status(0xc000_012f);
    pub const INVALID_IMAGE_PROTECT: Status = Status(0xc000_0130);
    pub const IMAGE_MACHINE_TYPE_MISMATCH: Status = Status(0x4000_000e);
    pub const MAPPED_FILE_SIZE_ZERO: Status = Status(0xc000_011e);
    pub const USER_MAPPED_FILE: Status = Status(0xc000_0243);
    pub const NOT_SAME_DEVICE: Status = Status(0xc000_00d4);
    pub const DIRECTORY_NOT_EMPTY: Status = Status(0xc000_0101);
    pub const NOT_SUPPORTED: Status = Status(0xc000_00bb);
    pub const BAD_DEVICE_TYPE: Status = Status(0xc000_00cb);
    pub const DEVICE_BUSY: Status = Status(0x8000_0011);
    pub const NO_DATA_DETECTED: Status = Status(0x8000_0022);
    pub const HANDLE_NOT_CLOSABLE: Status = Status(0xc000_0235);
    pub const INVALID_CID: Status = Status(0xc000_000b);
    pub const IO_TIMEOUT: Status = Status(0xc000_00b5);
    pub const VOLUME_DISMOUNTED: Status = Status(0xc000_026e);
    pub const TOO_MANY_THREADS: Status = Status(0xc000_0129);
    pub const PROCESS_IS_TERMINATING: Status = Status(0xc000_010a);
    pub const THREAD_IS_TERMINATING: Status = Status(0xc000_004b);
    pub const DEVICE_NOT_READY: Status = Status(0xc000_00a3);
    pub const NO_MORE_ENTRIES: Status = Status(0x8000_001a);
    pub const CONNECTION_REFUSED: Status = Status(0xc000_0236);
    pub const CONNECTION_ABORTED: Status = Status(0xc000_0241);
    pub const CONNECTION_RESET: Status = Status(0xc000_0240);
    pub const HOST_UNREACHABLE: Status = Status(0xc000_023d);
    pub const NETWORK_UNREACHABLE: Status = Status(0xc000_023c);
    pub const ADDRESS_ALREADY_ASSOCIATED: Status = Status(0xc000_0238);
    pub const INVALID_ADDRESS_COMPONENT: Status = Status(0xc000_0207);
    pub const SHUTDOWN_IN_PROGRESS: Status = Status(0xc000_00db);
}

impl Status {
    /// The satisfied-object index for a wait, as `WAIT_0 + index`.
    pub fn wait_index(index: usize) -> Status {
        Status(Self::WAIT_0.0 + index as u32)
    }

    /// The abandoned-mutex variant of a satisfied-wait index.
    pub fn abandoned_wait_index(index: usize) -> Status {
        Status(Self::ABANDONED_WAIT_0.0 + index as u32)
    }

    /// True for success and informational codes (severity 0 or 1).
    pub fn is_success(self) -> bool {
        self.0 < 0x8000_0000
    }

    /// Translate a POSIX errno from a file operation.
    ///
    /// This is the single errno translation table; callers that need a
    /// different mapping for a specific errno (e.g. the lock manager) check
    /// the errno before falling back to this.
    pub fn from_errno(err: Errno) -> Status {
        match err {
            Errno::ETXTBSY | Errno::EAGAIN => Status::SHARING_VIOLATION,
            Errno::EBADF => Status::INVALID_HANDLE,
            Errno::ENOSPC => Status::DISK_FULL,
            Errno::EACCES | Errno::ESRCH | Errno::EROFS | Errno::EPERM => Status::ACCESS_DENIED,
            Errno::EBUSY => Status::FILE_LOCK_CONFLICT,
            Errno::ENOENT => Status::NO_SUCH_FILE,
            Errno::EISDIR => Status::FILE_IS_A_DIRECTORY,
            Errno::ENFILE | Errno::EMFILE => Status::TOO_MANY_OPENED_FILES,
            Errno::EEXIST => Status::OBJECT_NAME_COLLISION,
            Errno::EINVAL | Errno::EOVERFLOW => Status::INVALID_PARAMETER,
            Errno::ESPIPE => Status::ILLEGAL_FUNCTION,
            Errno::ENOTEMPTY => Status::DIRECTORY_NOT_EMPTY,
            Errno::EIO => Status::ACCESS_VIOLATION,
            Errno::ENOTDIR => Status::NOT_A_DIRECTORY,
            Errno::EFBIG => Status::SECTION_TOO_BIG,
            Errno::ENODEV | Errno::ENXIO => Status::NO_SUCH_DEVICE,
            Errno::EXDEV => Status::NOT_SAME_DEVICE,
            Errno::ENOMEM => Status::NO_MEMORY,
            _ => {
                log::warn!("unmapped errno {err}");
                Status::UNSUCCESSFUL
            }
        }
    }

    /// Translate a POSIX errno reported by a socket operation.
    pub fn from_sock_errno(err: Errno) -> Status {
        match err {
            Errno::ECONNREFUSED => Status::CONNECTION_REFUSED,
            Errno::ECONNRESET => Status::CONNECTION_RESET,
            Errno::ECONNABORTED | Errno::EPIPE => Status::CONNECTION_ABORTED,
            Errno::EHOSTUNREACH => Status::HOST_UNREACHABLE,
            Errno::ENETUNREACH | Errno::ENETDOWN => Status::NETWORK_UNREACHABLE,
            Errno::EADDRINUSE => Status::ADDRESS_ALREADY_ASSOCIATED,
            Errno::EADDRNOTAVAIL => Status::INVALID_ADDRESS_COMPONENT,
            Errno::ETIMEDOUT => Status::IO_TIMEOUT,
            Errno::EWOULDBLOCK => Status::DEVICE_NOT_READY,
            _ => Status::from_errno(err),
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({:#010x})", self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl std::error::Error for Status {}

impl From<Errno> for Status {
    fn from(err: Errno) -> Status {
        Status::from_errno(err)
    }
}
