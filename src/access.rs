use std::fmt::Display;
use std::fmt::Formatter;

use bitflags::bitflags;

bitflags! {
    /// Windows-style object access mask.
    ///
    /// Holds the standard rights, `SYNCHRONIZE`, the generic bits expanded by
    /// each object type's `map_access`, and the file-specific rights (which
    /// double as the pseudo-rights used by the mapping code to participate in
    /// sharing checks).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessMask: u32 {
        const FILE_READ_DATA = 0x0001;
        const FILE_WRITE_DATA = 0x0002;
        const FILE_APPEND_DATA = 0x0004;
        const FILE_READ_EA = 0x0008;
        const FILE_WRITE_EA = 0x0010;
        const FILE_EXECUTE = 0x0020;
        const FILE_DELETE_CHILD = 0x0040;
        const FILE_READ_ATTRIBUTES = 0x0080;
        const FILE_WRITE_ATTRIBUTES = 0x0100;

        const DELETE = 0x0001_0000;
        const READ_CONTROL = 0x0002_0000;
        const WRITE_DAC = 0x0004_0000;
        const WRITE_OWNER = 0x0008_0000;
        const SYNCHRONIZE = 0x0010_0000;

        const STANDARD_RIGHTS_REQUIRED = 0x000f_0000;
        const STANDARD_RIGHTS_READ = Self::READ_CONTROL.bits();
        const STANDARD_RIGHTS_WRITE = Self::READ_CONTROL.bits();
        const STANDARD_RIGHTS_EXECUTE = Self::READ_CONTROL.bits();
        const STANDARD_RIGHTS_ALL = 0x001f_0000;

        const GENERIC_ALL = 0x1000_0000;
        const GENERIC_EXECUTE = 0x2000_0000;
        const GENERIC_WRITE = 0x4000_0000;
        const GENERIC_READ = 0x8000_0000;

        // Pseudo-rights carried on fds opened for a mapping; they never come
        // from a client but feed the sharing checks.
        const FILE_MAPPING_IMAGE = 0x8000_0000;
        const FILE_MAPPING_WRITE = 0x4000_0000;
        const FILE_MAPPING_ACCESS = 0x2000_0000;

        const _ = !0;
    }
}

impl AccessMask {
    pub const FILE_GENERIC_READ: AccessMask = AccessMask::STANDARD_RIGHTS_READ
        .union(AccessMask::FILE_READ_DATA)
        .union(AccessMask::FILE_READ_ATTRIBUTES)
        .union(AccessMask::FILE_READ_EA)
        .union(AccessMask::SYNCHRONIZE);
    pub const FILE_GENERIC_WRITE: AccessMask = AccessMask::STANDARD_RIGHTS_WRITE
        .union(AccessMask::FILE_WRITE_DATA)
        .union(AccessMask::FILE_WRITE_ATTRIBUTES)
        .union(AccessMask::FILE_WRITE_EA)
        .union(AccessMask::FILE_APPEND_DATA)
        .union(AccessMask::SYNCHRONIZE);
    pub const FILE_GENERIC_EXECUTE: AccessMask = AccessMask::STANDARD_RIGHTS_EXECUTE
        .union(AccessMask::FILE_EXECUTE)
        .union(AccessMask::FILE_READ_ATTRIBUTES)
        .union(AccessMask::SYNCHRONIZE);
    pub const FILE_ALL_ACCESS: AccessMask =
        AccessMask::STANDARD_RIGHTS_ALL.union(AccessMask::from_bits_retain(0x1ff));

    /// Access rights that require Unix read permission on the backing file.
    pub const FILE_UNIX_READ_ACCESS: AccessMask = AccessMask::FILE_READ_DATA
        .union(AccessMask::FILE_READ_ATTRIBUTES)
        .union(AccessMask::FILE_READ_EA);
    /// Access rights that require Unix write permission on the backing file.
    pub const FILE_UNIX_WRITE_ACCESS: AccessMask = AccessMask::FILE_WRITE_DATA
        .union(AccessMask::FILE_APPEND_DATA)
        .union(AccessMask::FILE_WRITE_ATTRIBUTES)
        .union(AccessMask::FILE_WRITE_EA);

    /// Default expansion of the generic bits into standard rights only.
    pub fn map_generic_default(self) -> AccessMask {
        let mut access = self;
        if access.contains(AccessMask::GENERIC_READ) {
            access |= AccessMask::STANDARD_RIGHTS_READ;
        }
        if access.contains(AccessMask::GENERIC_WRITE) {
            access |= AccessMask::STANDARD_RIGHTS_WRITE;
        }
        if access.contains(AccessMask::GENERIC_EXECUTE) {
            access |= AccessMask::STANDARD_RIGHTS_EXECUTE;
        }
        if access.contains(AccessMask::GENERIC_ALL) {
            access |= AccessMask::STANDARD_RIGHTS_ALL;
        }
        access.strip_generic()
    }

    /// Expansion of the generic bits into file rights, used by every
    /// fd-backed object type.
    pub fn map_generic_file(self) -> AccessMask {
        let mut access = self;
        if access.contains(AccessMask::GENERIC_READ) {
            access |= AccessMask::FILE_GENERIC_READ;
        }
        if access.contains(AccessMask::GENERIC_WRITE) {
            access |= AccessMask::FILE_GENERIC_WRITE;
        }
        if access.contains(AccessMask::GENERIC_EXECUTE) {
            access |= AccessMask::FILE_GENERIC_EXECUTE;
        }
        if access.contains(AccessMask::GENERIC_ALL) {
            access |= AccessMask::FILE_ALL_ACCESS;
        }
        access.strip_generic()
    }

    fn strip_generic(self) -> AccessMask {
        self & !(AccessMask::GENERIC_READ
            | AccessMask::GENERIC_WRITE
            | AccessMask::GENERIC_EXECUTE
            | AccessMask::GENERIC_ALL)
    }
}

impl Display for AccessMask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.bits())
    }
}

bitflags! {
    /// File sharing mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShareMode: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const DELETE = 0x04;
    }
}

bitflags! {
    /// File open options (`FILE_*` create options).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenOptions: u32 {
        const DIRECTORY_FILE = 0x0001;
        const WRITE_THROUGH = 0x0002;
        const SEQUENTIAL_ONLY = 0x0004;
        const SYNCHRONOUS_IO_ALERT = 0x0010;
        const SYNCHRONOUS_IO_NONALERT = 0x0020;
        const NON_DIRECTORY_FILE = 0x0040;
        const DELETE_ON_CLOSE = 0x1000;
        const OPEN_FOR_BACKUP_INTENT = 0x4000;
    }
}

impl OpenOptions {
    /// True when the open asks for synchronous I/O semantics.
    pub fn is_synchronous(self) -> bool {
        self.intersects(OpenOptions::SYNCHRONOUS_IO_ALERT | OpenOptions::SYNCHRONOUS_IO_NONALERT)
    }
}

bitflags! {
    /// Object attributes used at name lookup and creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Attributes: u32 {
        const INHERIT = 0x02;
        const PERMANENT = 0x10;
        const EXCLUSIVE = 0x20;
        const CASE_INSENSITIVE = 0x40;
        const OPEN_IF = 0x80;
        const OPEN_LINK = 0x100;
    }
}

bitflags! {
    /// File attribute bits (the subset with POSIX-visible consequences).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0001;
        const HIDDEN = 0x0002;
        const SYSTEM = 0x0004;
        const DIRECTORY = 0x0010;
        const ARCHIVE = 0x0020;
        const NORMAL = 0x0080;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_file_expansion() {
        let mapped = (AccessMask::GENERIC_READ | AccessMask::SYNCHRONIZE).map_generic_file();
        assert!(mapped.contains(AccessMask::FILE_READ_DATA));
        assert!(mapped.contains(AccessMask::SYNCHRONIZE));
        assert!(!mapped.intersects(AccessMask::GENERIC_READ));
    }

    #[test]
    fn generic_all_expansion() {
        let mapped = AccessMask::GENERIC_ALL.map_generic_file();
        assert!(mapped.contains(AccessMask::FILE_ALL_ACCESS));
        assert!(!mapped.intersects(
            AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE | AccessMask::GENERIC_ALL
        ));
    }
}
