//! Section (file mapping) objects
//!
//! A section backs client memory mappings with a real unix fd: either the
//! mapped file itself, or an anonymous temp file grown to the requested
//! size. `SEC_RESERVE` sections track their committed pages as a sorted set
//! of disjoint ranges. `SEC_IMAGE` sections parse the PE headers, validate
//! the machine against the client CPU, and concatenate the writable-shared
//! sections into one server-private temp file so every mapper of the image
//! shares those pages.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::rc::Weak;

use bitflags::bitflags;
use nix::errno::Errno;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::access::AccessMask;
use crate::access::Attributes;
use crate::access::OpenOptions;
use crate::access::ShareMode;
use crate::async_io::Async;
use crate::async_io::AsyncType;
use crate::fd::dup_fd_object;
use crate::fd::get_fd_object_for_mapping;
use crate::fd::Fd;
use crate::fd::FdOps;
use crate::fd::FdType;
use crate::file::File;
use crate::namespace::create_named_object;
use crate::namespace::directory_link_name;
use crate::namespace::CreateResult;
use crate::object::KObject;
use crate::object::ObjRef;
use crate::object::ObjectHeader;
use crate::server::Server;
use crate::status::Status;
use crate::status::SvResult;

bitflags! {
    /// `SEC_*` section flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SecFlags: u32 {
        const FILE = 0x0080_0000;
        const IMAGE = 0x0100_0000;
        const RESERVE = 0x0400_0000;
        const COMMIT = 0x0800_0000;
        const NOCACHE = 0x1000_0000;
        const WRITECOMBINE = 0x4000_0000;
        const LARGE_PAGES = 0x8000_0000;
    }
}

bitflags! {
    /// Page protection requested for the section.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Protection: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

/// Client CPU architectures a PE image can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuType {
    X86,
    X86_64,
    PowerPc,
    Arm,
    Arm64,
}

const IMAGE_DOS_SIGNATURE: u16 = 0x5a4d; // "MZ"
const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const IMAGE_OS2_SIGNATURE: u16 = 0x454e; // "NE"
const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10b;
const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20b;

const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
const IMAGE_FILE_MACHINE_POWERPC: u16 = 0x01f0;
const IMAGE_FILE_MACHINE_ARM: u16 = 0x01c0;
const IMAGE_FILE_MACHINE_THUMB: u16 = 0x01c2;
const IMAGE_FILE_MACHINE_ARMNT: u16 = 0x01c4;
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;

const IMAGE_SCN_MEM_SHARED: u32 = 0x1000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
struct DosHeader {
    e_magic: u16,
    e_cblp: u16,
    e_cp: u16,
    e_crlc: u16,
    e_cparhdr: u16,
    e_minalloc: u16,
    e_maxalloc: u16,
    e_ss: u16,
    e_sp: u16,
    e_csum: u16,
    e_ip: u16,
    e_cs: u16,
    e_lfarlc: u16,
    e_ovno: u16,
    e_res: [u16; 4],
    e_oemid: u16,
    e_oeminfo: u16,
    e_res2: [u16; 10],
    e_lfanew: u32,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
struct CoffFileHeader {
    machine: u16,
    number_of_sections: u16,
    time_date_stamp: u32,
    pointer_to_symbol_table: u32,
    number_of_symbols: u32,
    size_of_optional_header: u16,
    characteristics: u16,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
struct OptionalHeader32 {
    magic: u16,
    major_linker_version: u8,
    minor_linker_version: u8,
    size_of_code: u32,
    size_of_initialized_data: u32,
    size_of_uninitialized_data: u32,
    address_of_entry_point: u32,
    base_of_code: u32,
    base_of_data: u32,
    image_base: u32,
    section_alignment: u32,
    file_alignment: u32,
    major_os_version: u16,
    minor_os_version: u16,
    major_image_version: u16,
    minor_image_version: u16,
    major_subsystem_version: u16,
    minor_subsystem_version: u16,
    win32_version_value: u32,
    size_of_image: u32,
    size_of_headers: u32,
    checksum: u32,
    subsystem: u16,
    dll_characteristics: u16,
    size_of_stack_reserve: u32,
    size_of_stack_commit: u32,
    size_of_heap_reserve: u32,
    size_of_heap_commit: u32,
    loader_flags: u32,
    number_of_rva_and_sizes: u32,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
struct OptionalHeader64 {
    magic: u16,
    major_linker_version: u8,
    minor_linker_version: u8,
    size_of_code: u32,
    size_of_initialized_data: u32,
    size_of_uninitialized_data: u32,
    address_of_entry_point: u32,
    base_of_code: u32,
    image_base: u64,
    section_alignment: u32,
    file_alignment: u32,
    major_os_version: u16,
    minor_os_version: u16,
    major_image_version: u16,
    minor_image_version: u16,
    major_subsystem_version: u16,
    minor_subsystem_version: u16,
    win32_version_value: u32,
    size_of_image: u32,
    size_of_headers: u32,
    checksum: u32,
    subsystem: u16,
    dll_characteristics: u16,
    size_of_stack_reserve: u64,
    size_of_stack_commit: u64,
    size_of_heap_reserve: u64,
    size_of_heap_commit: u64,
    loader_flags: u32,
    number_of_rva_and_sizes: u32,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C)]
struct SectionHeader {
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    pointer_to_relocations: u32,
    pointer_to_linenumbers: u32,
    number_of_relocations: u16,
    number_of_linenumbers: u16,
    characteristics: u32,
}

/// Parameters extracted from a PE image for the client loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageInfo {
    pub base: u64,
    pub entry_point: u64,
    pub map_size: u64,
    pub stack_size: u64,
    pub stack_commit: u64,
    pub subsystem: u16,
    pub subsystem_low: u16,
    pub subsystem_high: u16,
    pub dll_charact: u16,
    pub loader_flags: u32,
    pub header_size: u64,
    pub checksum: u32,
    pub image_charact: u16,
    pub machine: u16,
    pub file_size: u64,
}

fn page_mask() -> u64 {
    page_size::get() as u64 - 1
}

fn round_size(size: u64) -> u64 {
    (size + page_mask()) & !page_mask()
}

/// Sorted set of disjoint `[start, end)` ranges recording committed pages.
#[derive(Debug, Default)]
pub struct RangeSet {
    ranges: Vec<(u64, u64)>,
}

impl RangeSet {
    pub fn new() -> RangeSet {
        RangeSet { ranges: Vec::with_capacity(8) }
    }

    /// Insert a range, merging overlapping and adjacent entries.
    pub fn add(&mut self, start: u64, end: u64) {
        debug_assert!(start <= end);
        let mut i = 0;
        while i < self.ranges.len() {
            let (rs, re) = self.ranges[i];
            if rs > end {
                break;
            }
            if re < start {
                i += 1;
                continue;
            }
            // overlaps or touches: extend this entry and swallow followers
            let mut new_end = end.max(re);
            let mut j = i + 1;
            while j < self.ranges.len() && self.ranges[j].0 <= new_end {
                new_end = new_end.max(self.ranges[j].1);
                j += 1;
            }
            self.ranges.drain(i + 1..j);
            self.ranges[i] = (rs.min(start), new_end);
            return;
        }
        self.ranges.insert(i, (start, end));
    }

    /// The first range at or after `offset`: returns the distance covered
    /// and whether it is committed.
    pub fn find(&self, offset: u64, total_size: u64) -> (u64, bool) {
        for &(rs, re) in &self.ranges {
            if rs > offset {
                return (rs - offset, false);
            }
            if re > offset {
                return (re - offset, true);
            }
        }
        (total_size - offset, false)
    }

    pub fn as_slice(&self) -> &[(u64, u64)] {
        &self.ranges
    }
}

/// A section object.
pub struct Mapping {
    header: ObjectHeader,
    size: Cell<u64>,
    flags: Cell<SecFlags>,
    protect: Protection,
    fd: RefCell<Option<Rc<Fd>>>,
    committed: RefCell<Option<RangeSet>>,
    image: RefCell<Option<ImageInfo>>,
    cpu: Cell<Option<CpuType>>,
    shared_file: RefCell<Option<Rc<File>>>,
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mapping(size={:#x}, flags={:?}, protect={:?})",
            self.size.get(),
            self.flags.get(),
            self.protect
        )
    }
}

/* temp file support */

thread_local! {
    // chosen once: the first candidate directory that allows PROT_EXEC maps
    static TEMP_DIR: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

fn dir_allows_exec_mappings(dir: &std::path::Path) -> bool {
    use std::os::fd::IntoRawFd;
    let Ok((fd, path)) = nix::unistd::mkstemp(&dir.join("anonmap.XXXXXX")) else {
        return false;
    };
    let fd = fd.into_raw_fd();
    let _ = std::fs::remove_file(&path);
    let ok = grow_file(fd, 1).is_ok() && {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page_size::get(),
                libc::PROT_READ | libc::PROT_EXEC,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        if ptr != libc::MAP_FAILED {
            unsafe { libc::munmap(ptr, page_size::get()) };
            true
        } else {
            false
        }
    };
    unsafe { libc::close(fd) };
    ok
}

fn mapping_temp_dir(server: &Server) -> PathBuf {
    TEMP_DIR.with(|cache| {
        if let Some(dir) = cache.borrow().clone() {
            return dir;
        }
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(dirs) = server.server_dirs() {
            candidates.push(dirs.server_dir.clone());
            // the server dir may sit on a noexec mount; the config dir is
            // the fallback
            candidates.push(dirs.config_dir.clone());
        }
        candidates.push(std::env::temp_dir());
        let chosen = candidates
            .iter()
            .find(|dir| dir_allows_exec_mappings(dir))
            .cloned()
            .unwrap_or_else(std::env::temp_dir);
        *cache.borrow_mut() = Some(chosen.clone());
        chosen
    })
}

/// Extend a file beyond its current end.
fn grow_file(unix_fd: libc::c_int, new_size: u64) -> SvResult<()> {
    let size = new_size as libc::off_t;
    if size as u64 != new_size {
        return Err(Status::INVALID_PARAMETER);
    }
    // write one byte past the requested size, then truncate back; this
    // works around ftruncate implementations that can't extend files
    let zero = 0u8;
    if unsafe { libc::pwrite(unix_fd, (&zero as *const u8).cast(), 1, size) } == -1 {
        return Err(Status::from_errno(Errno::last()));
    }
    if unsafe { libc::ftruncate(unix_fd, size) } == -1 {
        return Err(Status::from_errno(Errno::last()));
    }
    Ok(())
}

/// Create an unlinked temp file of `size` bytes for anonymous and
/// shared-section backings.
fn create_temp_file(server: &Server, size: u64) -> SvResult<libc::c_int> {
    use std::os::fd::IntoRawFd;
    let template = mapping_temp_dir(server).join("anonmap.XXXXXX");
    let (fd, path) = nix::unistd::mkstemp(&template).map_err(Status::from_errno)?;
    let fd = fd.into_raw_fd();
    let _ = std::fs::remove_file(&path);
    if let Err(err) = grow_file(fd, size) {
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

fn pread_exact(fd: libc::c_int, buf: &mut [u8], offset: u64) -> SvResult<usize> {
    let res = unsafe {
        libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), offset as libc::off_t)
    };
    if res < 0 {
        return Err(Status::from_errno(Errno::last()));
    }
    Ok(res as usize)
}

/// Memory and file extents of one PE section.
fn section_sizes(sec: &SectionHeader) -> (u64, u64, u64) {
    const SECTOR_ALIGN: u64 = 0x1ff;
    let map_size = if sec.virtual_size == 0 {
        round_size(sec.size_of_raw_data as u64)
    } else {
        round_size(sec.virtual_size as u64)
    };
    let file_start = sec.pointer_to_raw_data as u64 & !SECTOR_ALIGN;
    let mut file_size = (sec.size_of_raw_data as u64
        + (sec.pointer_to_raw_data as u64 & SECTOR_ALIGN)
        + SECTOR_ALIGN)
        & !SECTOR_ALIGN;
    if file_size > map_size {
        file_size = map_size;
    }
    (map_size, file_start, file_size)
}

impl Mapping {
    /// Create (or open with `OPEN_IF`) a section object.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        server: &Rc<Server>,
        root: Option<&ObjRef>,
        name: &str,
        attrs: Attributes,
        size: u64,
        flags: SecFlags,
        protect: Protection,
        backing: Option<&Rc<File>>,
        cpu: CpuType,
    ) -> SvResult<CreateResult<Mapping>> {
        let result = create_named_object(server, root, name, attrs, || {
            Ok(Rc::new(Mapping {
                header: ObjectHeader::new(),
                size: Cell::new(size),
                flags: Cell::new(
                    flags
                        & (SecFlags::IMAGE
                            | SecFlags::NOCACHE
                            | SecFlags::WRITECOMBINE
                            | SecFlags::LARGE_PAGES),
                ),
                protect,
                fd: RefCell::new(None),
                committed: RefCell::new(None),
                image: RefCell::new(None),
                cpu: Cell::new(None),
                shared_file: RefCell::new(None),
            }))
        })?;
        if !result.created {
            return Ok(result);
        }
        let mapping = &result.obj;

        let mut access = AccessMask::empty();
        if protect.contains(Protection::READ) {
            access |= AccessMask::FILE_READ_DATA;
        }
        if protect.contains(Protection::WRITE) {
            access |= AccessMask::FILE_WRITE_DATA;
        }

        match backing {
            Some(file) => {
                if flags.contains(SecFlags::RESERVE) {
                    return Err(Status::INVALID_PARAMETER);
                }
                let sharing = ShareMode::READ | ShareMode::WRITE | ShareMode::DELETE;
                // sharing rules for mappings differ, carried by the magic
                // pseudo-access bits
                let mut mapping_access = AccessMask::FILE_MAPPING_ACCESS;
                if flags.contains(SecFlags::IMAGE) {
                    mapping_access |= AccessMask::FILE_MAPPING_IMAGE;
                } else if protect.contains(Protection::WRITE) {
                    mapping_access |= AccessMask::FILE_MAPPING_WRITE;
                }
                mapping.flags.set(mapping.flags.get() | SecFlags::FILE);

                let file_fd = file.fd()?;
                let fd = match get_fd_object_for_mapping(&file_fd, mapping_access, sharing) {
                    Some(fd) => fd,
                    None => {
                        let fd = dup_fd_object(
                            &file_fd,
                            mapping_access,
                            sharing,
                            OpenOptions::SYNCHRONOUS_IO_NONALERT,
                        )?;
                        fd.set_user(mapping);
                        fd
                    }
                };
                *mapping.fd.borrow_mut() = Some(fd.clone());

                let unix_fd = fd.unix_fd()?;
                let st = nix::sys::stat::fstat(unsafe {
                    std::os::fd::BorrowedFd::borrow_raw(unix_fd)
                })
                .map_err(Status::from_errno)?;
                let file_size = st.st_size as u64;

                if flags.contains(SecFlags::IMAGE) {
                    mapping.load_image(server, file_size, unix_fd, cpu)?;
                } else if mapping.size.get() == 0 {
                    if file_size == 0 {
                        return Err(Status::MAPPED_FILE_SIZE_ZERO);
                    }
                    mapping.size.set(file_size);
                } else if file_size < mapping.size.get() {
                    if !access.contains(AccessMask::FILE_WRITE_DATA) {
                        return Err(Status::SECTION_TOO_BIG);
                    }
                    grow_file(unix_fd, mapping.size.get())?;
                }
            }
            None => {
                if mapping.size.get() == 0 || flags.contains(SecFlags::IMAGE) {
                    return Err(Status::INVALID_PARAMETER);
                }
                mapping
                    .flags
                    .set(mapping.flags.get() | (flags & (SecFlags::COMMIT | SecFlags::RESERVE)));
                if flags.contains(SecFlags::RESERVE) {
                    *mapping.committed.borrow_mut() = Some(RangeSet::new());
                }
                mapping.size.set(round_size(mapping.size.get()));
                let unix_fd = create_temp_file(server, mapping.size.get())?;
                let fd = Fd::create_anonymous(
                    server,
                    unix_fd,
                    mapping,
                    OpenOptions::SYNCHRONOUS_IO_NONALERT,
                );
                fd.allow_caching();
                *mapping.fd.borrow_mut() = Some(fd);
            }
        }
        Ok(result)
    }

    /// Parse the PE headers and build the shared-writable backing.
    fn load_image(
        self: &Rc<Self>,
        server: &Rc<Server>,
        file_size: u64,
        unix_fd: libc::c_int,
        cpu: CpuType,
    ) -> SvResult<()> {
        if file_size == 0 {
            return Err(Status::INVALID_FILE_FOR_SECTION);
        }
        let mut dos_buf = [0u8; std::mem::size_of::<DosHeader>()];
        if pread_exact(unix_fd, &mut dos_buf, 0)? != dos_buf.len() {
            return Err(Status::INVALID_IMAGE_NOT_MZ);
        }
        let dos = DosHeader::read_from_bytes(&dos_buf).expect("fixed-size header");
        if dos.e_magic != IMAGE_DOS_SIGNATURE {
            return Err(Status::INVALID_IMAGE_NOT_MZ);
        }
        let pos = dos.e_lfanew as u64;

        // signature + file header + the larger optional header; short or
        // absent parts read as zero
        let mut nt_buf =
            [0u8; 4 + std::mem::size_of::<CoffFileHeader>() + std::mem::size_of::<OptionalHeader64>()];
        let got = pread_exact(unix_fd, &mut nt_buf, pos)?;
        if got < 4 + std::mem::size_of::<CoffFileHeader>() {
            return Err(Status::INVALID_IMAGE_FORMAT);
        }
        nt_buf[got..].fill(0);
        let signature = u32::from_le_bytes(nt_buf[..4].try_into().unwrap());
        if signature != IMAGE_NT_SIGNATURE {
            if signature as u16 == IMAGE_OS2_SIGNATURE {
                return Err(Status::INVALID_IMAGE_FORMAT);
            }
            return Err(Status::INVALID_IMAGE_PROTECT);
        }
        let file_header =
            CoffFileHeader::read_from_prefix(&nt_buf[4..]).expect("buffer sized above").0;
        let opt_buf = &nt_buf[4 + std::mem::size_of::<CoffFileHeader>()..];
        let opt_magic = u16::from_le_bytes(opt_buf[..2].try_into().unwrap());

        // machine and optional-header class must match the client CPU; the
        // ARM matching is deliberately relaxed to the Thumb variants
        let (machine_ok, want_64) = match cpu {
            CpuType::X86 => (file_header.machine == IMAGE_FILE_MACHINE_I386, false),
            CpuType::X86_64 => (file_header.machine == IMAGE_FILE_MACHINE_AMD64, true),
            CpuType::PowerPc => (file_header.machine == IMAGE_FILE_MACHINE_POWERPC, false),
            CpuType::Arm => (
                matches!(
                    file_header.machine,
                    IMAGE_FILE_MACHINE_ARM | IMAGE_FILE_MACHINE_THUMB | IMAGE_FILE_MACHINE_ARMNT
                ),
                false,
            ),
            CpuType::Arm64 => (file_header.machine == IMAGE_FILE_MACHINE_ARM64, true),
        };
        if !machine_ok {
            return Err(Status::INVALID_IMAGE_FORMAT);
        }
        let want_magic =
            if want_64 { IMAGE_NT_OPTIONAL_HDR64_MAGIC } else { IMAGE_NT_OPTIONAL_HDR32_MAGIC };
        if opt_magic != want_magic {
            return Err(Status::INVALID_IMAGE_FORMAT);
        }

        let mut image = if want_64 {
            let opt = OptionalHeader64::read_from_prefix(opt_buf).expect("buffer sized above").0;
            ImageInfo {
                base: opt.image_base,
                entry_point: opt.image_base + opt.address_of_entry_point as u64,
                map_size: round_size(opt.size_of_image as u64),
                stack_size: opt.size_of_stack_reserve,
                stack_commit: opt.size_of_stack_commit,
                subsystem: opt.subsystem,
                subsystem_low: opt.minor_subsystem_version,
                subsystem_high: opt.major_subsystem_version,
                dll_charact: opt.dll_characteristics,
                loader_flags: opt.loader_flags,
                header_size: opt.size_of_headers as u64,
                checksum: opt.checksum,
                ..ImageInfo::default()
            }
        } else {
            let opt = OptionalHeader32::read_from_prefix(opt_buf).expect("buffer sized above").0;
            ImageInfo {
                base: opt.image_base as u64,
                entry_point: opt.image_base as u64 + opt.address_of_entry_point as u64,
                map_size: round_size(opt.size_of_image as u64),
                stack_size: opt.size_of_stack_reserve as u64,
                stack_commit: opt.size_of_stack_commit as u64,
                subsystem: opt.subsystem,
                subsystem_low: opt.minor_subsystem_version,
                subsystem_high: opt.major_subsystem_version,
                dll_charact: opt.dll_characteristics,
                loader_flags: opt.loader_flags,
                header_size: opt.size_of_headers as u64,
                checksum: opt.checksum,
                ..ImageInfo::default()
            }
        };
        image.image_charact = file_header.characteristics;
        image.machine = file_header.machine;
        image.file_size = file_size;

        let sec_pos = pos
            + 4
            + std::mem::size_of::<CoffFileHeader>() as u64
            + file_header.size_of_optional_header as u64;
        let sec_size =
            std::mem::size_of::<SectionHeader>() as u64 * file_header.number_of_sections as u64;
        if self.size.get() == 0 {
            self.size.set(image.map_size);
        } else if self.size.get() > image.map_size {
            return Err(Status::SECTION_TOO_BIG);
        }
        if sec_pos + sec_size > image.map_size {
            return Err(Status::INVALID_FILE_FOR_SECTION);
        }
        if sec_pos + sec_size > image.header_size {
            image.header_size = sec_pos + sec_size;
        }

        let mut sec_buf = vec![0u8; sec_size as usize];
        if pread_exact(unix_fd, &mut sec_buf, sec_pos)? != sec_buf.len() {
            return Err(Status::INVALID_FILE_FOR_SECTION);
        }
        let sections: Vec<SectionHeader> = sec_buf
            .chunks_exact(std::mem::size_of::<SectionHeader>())
            .map(|chunk| SectionHeader::read_from_bytes(chunk).expect("exact chunk"))
            .collect();

        self.build_shared_backing(server, unix_fd, &sections)?;
        self.cpu.set(Some(cpu));
        *self.image.borrow_mut() = Some(image);
        if self.shared_file.borrow().is_some() {
            server.shared_mappings().borrow_mut().push(Rc::downgrade(self));
        }
        Ok(())
    }

    /// Concatenate the writable-shared sections into one temp file so all
    /// mappers share the pages; reuse an existing backing for the same file.
    fn build_shared_backing(
        &self,
        server: &Rc<Server>,
        unix_fd: libc::c_int,
        sections: &[SectionHeader],
    ) -> SvResult<()> {
        let is_shared_write = |sec: &SectionHeader| {
            sec.characteristics & IMAGE_SCN_MEM_SHARED != 0
                && sec.characteristics & IMAGE_SCN_MEM_WRITE != 0
        };
        let mut total_size = 0u64;
        let mut max_size = 0u64;
        for sec in sections.iter().filter(|s| is_shared_write(s)) {
            let (map_size, _, file_size) = section_sizes(sec);
            max_size = max_size.max(file_size);
            total_size += map_size;
        }
        if total_size == 0 {
            return Ok(());
        }

        if let Some(existing) = self.find_shared_backing(server) {
            *self.shared_file.borrow_mut() = Some(existing);
            return Ok(());
        }

        let shared_fd = create_temp_file(server, total_size)?;
        let shared_file = File::create_for_unix_fd(
            server,
            shared_fd,
            AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE,
            ShareMode::empty(),
        );

        let mut buffer = vec![0u8; max_size as usize];
        let mut shared_pos = 0u64;
        for sec in sections.iter().filter(|s| is_shared_write(s)) {
            let (map_size, mut read_pos, mut file_size) = section_sizes(sec);
            let write_pos = shared_pos;
            shared_pos += map_size;
            if sec.pointer_to_raw_data == 0 || file_size == 0 {
                continue;
            }
            let mut toread = file_size as usize;
            while toread > 0 {
                let off = file_size as usize - toread;
                let res = pread_exact(unix_fd, &mut buffer[off..off + toread], read_pos)?;
                if res == 0 && toread < 0x200 {
                    // partial sector at EOF is not an error
                    file_size -= toread as u64;
                    break;
                }
                if res == 0 {
                    return Err(Status::INVALID_FILE_FOR_SECTION);
                }
                toread -= res;
                read_pos += res as u64;
            }
            let written = unsafe {
                libc::pwrite(
                    shared_fd,
                    buffer.as_ptr().cast(),
                    file_size as usize,
                    write_pos as libc::off_t,
                )
            };
            if written != file_size as libc::ssize_t {
                return Err(Status::INVALID_FILE_FOR_SECTION);
            }
        }
        *self.shared_file.borrow_mut() = Some(shared_file);
        Ok(())
    }

    /// A previous image mapping of the same file already built the backing.
    fn find_shared_backing(&self, server: &Server) -> Option<Rc<File>> {
        let my_fd = self.fd.borrow().clone()?;
        let mut list = server.shared_mappings().borrow_mut();
        list.retain(|weak| weak.strong_count() > 0);
        for mapping in list.iter().filter_map(Weak::upgrade) {
            let same = mapping.fd.borrow().as_ref().is_some_and(|fd| fd.is_same_file(&my_fd));
            if same {
                return mapping.shared_file.borrow().clone();
            }
        }
        None
    }

    pub fn size(&self) -> u64 {
        self.size.get()
    }

    pub fn flags(&self) -> SecFlags {
        self.flags.get()
    }

    pub fn protect(&self) -> Protection {
        self.protect
    }

    pub fn image_info(&self) -> Option<ImageInfo> {
        *self.image.borrow()
    }

    /// The client CPU the image was validated against.
    pub fn cpu(&self) -> Option<CpuType> {
        self.cpu.get()
    }

    pub fn shared_file(&self) -> Option<Rc<File>> {
        self.shared_file.borrow().clone()
    }

    /// Commit `[start, end)`; a no-op for fully committed sections.
    pub fn add_committed_range(&self, start: u64, end: u64) {
        if let Some(ranges) = self.committed.borrow_mut().as_mut() {
            ranges.add(start, end);
        }
    }

    /// The committed state at `offset`: distance to the next transition and
    /// whether the queried page is committed.
    pub fn find_committed_range(&self, offset: u64) -> (u64, bool) {
        match self.committed.borrow().as_ref() {
            None => (self.size.get() - offset, true),
            Some(ranges) => ranges.find(offset, self.size.get()),
        }
    }
}

impl KObject for Mapping {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_name(&self) -> &'static str {
        "Section"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_fd(&self) -> SvResult<Rc<Fd>> {
        self.fd.borrow().clone().ok_or(Status::OBJECT_TYPE_MISMATCH)
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_generic_default()
    }

    fn link_name(&self, self_ref: &ObjRef, name: &str, parent: &ObjRef) -> SvResult<()> {
        directory_link_name(self_ref, name, parent)
    }
}

impl FdOps for Mapping {
    fn fd_type(&self, _fd: &Fd) -> FdType {
        FdType::File
    }

    fn queue_async(
        &self,
        _server: &Server,
        _fd: &Rc<Fd>,
        _async_op: &Rc<Async>,
        _ty: AsyncType,
        _count: i32,
    ) -> SvResult<Status> {
        Err(Status::OBJECT_TYPE_MISMATCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn committed_range_merging() {
        let mut set = RangeSet::new();
        set.add(0, 4);
        set.add(4, 8);
        assert_eq!(set.as_slice(), &[(0, 8)]);

        let mut set = RangeSet::new();
        set.add(0, 4);
        set.add(6, 10);
        assert_eq!(set.as_slice(), &[(0, 4), (6, 10)]);
        set.add(4, 6);
        assert_eq!(set.as_slice(), &[(0, 10)]);
    }

    #[test]
    fn committed_range_find() {
        let mut set = RangeSet::new();
        set.add(0x1000, 0x3000);
        assert_eq!(set.find(0, 0x10000), (0x1000, false));
        assert_eq!(set.find(0x1000, 0x10000), (0x2000, true));
        assert_eq!(set.find(0x2000, 0x10000), (0x1000, true));
        assert_eq!(set.find(0x3000, 0x10000), (0x10000 - 0x3000, false));
    }

    #[test]
    fn anonymous_reserve_mapping() {
        let server = Server::new_for_tests();
        let mapping = Mapping::create(
            &server,
            None,
            "",
            Attributes::empty(),
            0x2345,
            SecFlags::RESERVE,
            Protection::READ | Protection::WRITE,
            None,
            CpuType::X86_64,
        )
        .unwrap()
        .obj;
        // size is rounded to a page multiple
        assert_eq!(mapping.size() % page_size::get() as u64, 0);
        assert!(mapping.size() >= 0x2345);
        let (len, committed) = mapping.find_committed_range(0);
        assert!(!committed);
        assert_eq!(len, mapping.size());
        mapping.add_committed_range(0, 0x1000);
        let (len, committed) = mapping.find_committed_range(0);
        assert!(committed);
        assert_eq!(len, 0x1000);
        // the backing temp file is real and the right size
        let fd = mapping.get_fd().unwrap();
        let st = nix::sys::stat::fstat(unsafe {
            std::os::fd::BorrowedFd::borrow_raw(fd.unix_fd().unwrap())
        })
        .unwrap();
        assert_eq!(st.st_size as u64, mapping.size());
    }

    #[test]
    fn anonymous_commit_mapping_is_fully_committed() {
        let server = Server::new_for_tests();
        let mapping = Mapping::create(
            &server,
            None,
            "",
            Attributes::empty(),
            0x1000,
            SecFlags::COMMIT,
            Protection::READ,
            None,
            CpuType::X86_64,
        )
        .unwrap()
        .obj;
        let (len, committed) = mapping.find_committed_range(0);
        assert!(committed);
        assert_eq!(len, 0x1000);
    }

    /// Build a minimal PE64 with `sections`.
    fn build_pe64(sections: &[SectionHeader], size_of_image: u32) -> Vec<u8> {
        let mut dos = DosHeader::read_from_bytes(&[0u8; 64]).unwrap();
        dos.e_magic = IMAGE_DOS_SIGNATURE;
        dos.e_lfanew = 0x40;
        let file_header = CoffFileHeader {
            machine: IMAGE_FILE_MACHINE_AMD64,
            number_of_sections: sections.len() as u16,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: std::mem::size_of::<OptionalHeader64>() as u16,
            characteristics: 0x0022,
        };
        let mut opt = OptionalHeader64::read_from_bytes(&[0u8; 112]).unwrap();
        opt.magic = IMAGE_NT_OPTIONAL_HDR64_MAGIC;
        opt.image_base = 0x1_4000_0000;
        opt.address_of_entry_point = 0x1000;
        opt.section_alignment = 0x1000;
        opt.file_alignment = 0x200;
        opt.size_of_image = size_of_image;
        opt.size_of_headers = 0x400;
        opt.subsystem = 3;

        let mut out = Vec::new();
        out.extend_from_slice(dos.as_bytes());
        out.extend_from_slice(&IMAGE_NT_SIGNATURE.to_le_bytes());
        out.extend_from_slice(file_header.as_bytes());
        out.extend_from_slice(opt.as_bytes());
        for sec in sections {
            out.extend_from_slice(sec.as_bytes());
        }
        // raw section data
        let data_end = sections
            .iter()
            .map(|s| (s.pointer_to_raw_data + s.size_of_raw_data) as usize)
            .max()
            .unwrap_or(out.len());
        out.resize(data_end.max(out.len()), 0xcc);
        out
    }

    fn section(name: &[u8], vaddr: u32, raw_ptr: u32, raw_size: u32, charact: u32) -> SectionHeader {
        let mut sec = SectionHeader::read_from_bytes(&[0u8; 40]).unwrap();
        sec.name[..name.len()].copy_from_slice(name);
        sec.virtual_address = vaddr;
        sec.virtual_size = raw_size;
        sec.pointer_to_raw_data = raw_ptr;
        sec.size_of_raw_data = raw_size;
        sec.characteristics = charact;
        sec
    }

    fn write_temp_pe(dir: &TempDir, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("image.dll");
        std::fs::File::create(&path).unwrap().write_all(bytes).unwrap();
        path
    }

    #[test]
    fn image_mapping_parses_pe() {
        let server = Server::new_for_tests();
        let dir = TempDir::new().unwrap();
        let sections = [
            section(b".text", 0x1000, 0x400, 0x600, 0x6000_0020),
            section(b".shared", 0x2000, 0xa00, 0x200, IMAGE_SCN_MEM_SHARED | IMAGE_SCN_MEM_WRITE),
            section(b".shr2", 0x3000, 0xc00, 0x400, IMAGE_SCN_MEM_SHARED | IMAGE_SCN_MEM_WRITE),
        ];
        let path = write_temp_pe(&dir, &build_pe64(&sections, 0x4000));
        let file = File::create_from_unix_path(
            &server,
            &path,
            AccessMask::GENERIC_READ,
            ShareMode::READ | ShareMode::WRITE | ShareMode::DELETE,
        )
        .unwrap();

        let mapping = Mapping::create(
            &server,
            None,
            "",
            Attributes::empty(),
            0,
            SecFlags::IMAGE,
            Protection::READ,
            Some(&file),
            CpuType::X86_64,
        )
        .unwrap()
        .obj;

        let info = mapping.image_info().unwrap();
        assert_eq!(info.machine, IMAGE_FILE_MACHINE_AMD64);
        assert_eq!(info.base, 0x1_4000_0000);
        assert_eq!(info.map_size, round_size(0x4000));
        assert_eq!(mapping.size(), info.map_size);

        // the two writable-shared sections produced a backing file of one
        // page each
        let shared = mapping.shared_file().expect("shared backing built");
        let st = nix::sys::stat::fstat(unsafe {
            std::os::fd::BorrowedFd::borrow_raw(shared.fd().unwrap().unix_fd().unwrap())
        })
        .unwrap();
        assert_eq!(st.st_size as u64, 2 * round_size(0x200).max(0x1000));
    }

    #[test]
    fn image_mapping_reuses_shared_backing() {
        let server = Server::new_for_tests();
        let dir = TempDir::new().unwrap();
        let sections =
            [section(b".shared", 0x1000, 0x400, 0x200, IMAGE_SCN_MEM_SHARED | IMAGE_SCN_MEM_WRITE)];
        let path = write_temp_pe(&dir, &build_pe64(&sections, 0x2000));
        let make_mapping = || {
            let file = File::create_from_unix_path(
                &server,
                &path,
                AccessMask::GENERIC_READ,
                ShareMode::READ | ShareMode::WRITE | ShareMode::DELETE,
            )
            .unwrap();
            Mapping::create(
                &server,
                None,
                "",
                Attributes::empty(),
                0,
                SecFlags::IMAGE,
                Protection::READ,
                Some(&file),
                CpuType::X86_64,
            )
            .unwrap()
            .obj
        };
        let first = make_mapping();
        let second = make_mapping();
        assert!(Rc::ptr_eq(
            &first.shared_file().unwrap(),
            &second.shared_file().unwrap()
        ));
    }

    #[test]
    fn image_machine_mismatch() {
        let server = Server::new_for_tests();
        let dir = TempDir::new().unwrap();
        let path = write_temp_pe(&dir, &build_pe64(&[], 0x2000));
        let file = File::create_from_unix_path(
            &server,
            &path,
            AccessMask::GENERIC_READ,
            ShareMode::READ | ShareMode::WRITE | ShareMode::DELETE,
        )
        .unwrap();
        let err = Mapping::create(
            &server,
            None,
            "",
            Attributes::empty(),
            0,
            SecFlags::IMAGE,
            Protection::READ,
            Some(&file),
            CpuType::X86,
        )
        .unwrap_err();
        assert_eq!(err, Status::INVALID_IMAGE_FORMAT);
    }

    #[test]
    fn non_pe_file_is_rejected() {
        let server = Server::new_for_tests();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not_pe");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let file = File::create_from_unix_path(
            &server,
            &path,
            AccessMask::GENERIC_READ,
            ShareMode::READ | ShareMode::WRITE | ShareMode::DELETE,
        )
        .unwrap();
        let err = Mapping::create(
            &server,
            None,
            "",
            Attributes::empty(),
            0,
            SecFlags::IMAGE,
            Protection::READ,
            Some(&file),
            CpuType::X86_64,
        )
        .unwrap_err();
        assert_eq!(err, Status::INVALID_IMAGE_NOT_MZ);
    }

    #[test]
    fn file_backed_mapping_grows_file() {
        let server = Server::new_for_tests();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grow");
        std::fs::write(&path, b"tiny").unwrap();
        let file = File::create_from_unix_path(
            &server,
            &path,
            AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE,
            ShareMode::READ | ShareMode::WRITE | ShareMode::DELETE,
        )
        .unwrap();
        Mapping::create(
            &server,
            None,
            "",
            Attributes::empty(),
            0x1000,
            SecFlags::empty(),
            Protection::READ | Protection::WRITE,
            Some(&file),
            CpuType::X86_64,
        )
        .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0x1000);
    }
}
