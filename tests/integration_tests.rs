//! End-to-end scenarios over a live in-process server: named objects,
//! handles, waits, files with sharing and locks, pipes, mappings, timers
//! and change notifications working together.

use std::rc::Rc;

use tempfile::TempDir;

use userkd::access::Attributes;
use userkd::access::FileAttributes;
use userkd::access::OpenOptions;
use userkd::change::ChangeAction;
use userkd::change::DirWatch;
use userkd::change::NotifyFilter;
use userkd::fd::LockResult;
use userkd::file::CreateDisposition;
use userkd::file::File;
use userkd::handle::HandleFlags;
use userkd::mapping::CpuType;
use userkd::mapping::Mapping;
use userkd::mapping::Protection;
use userkd::mapping::SecFlags;
use userkd::namespace::lookup_named_object;
use userkd::namespace::open_named_object_as;
use userkd::object::live_objects;
use userkd::object::KObject;
use userkd::object::ObjRef;
use userkd::pipe::NamedPipe;
use userkd::pipe::PipeFlags;
use userkd::pipe::PipeParams;
use userkd::pipe::PipeState;
use userkd::process::Process;
use userkd::server::Server;
use userkd::symlink::SymbolicLink;
use userkd::sync::Event;
use userkd::sync::Semaphore;
use userkd::timer::Timer;
use userkd::wait::begin_wait;
use userkd::wait::wake_up;
use userkd::wait::WaitOutcome;
use userkd::AccessMask;
use userkd::ShareMode;
use userkd::Status;
use userkd::TICKS_PER_SEC;

const ATTRS: Attributes = Attributes::CASE_INSENSITIVE;
const MS: i64 = 10_000;

fn pump(server: &Rc<Server>) {
    for _ in 0..6 {
        let ready = server.poller().wait(100);
        if ready.is_empty() {
            break;
        }
        for (fd, events) in ready {
            if let Some(ops) = fd.ops() {
                ops.poll_event(server, &fd, events);
            }
        }
    }
}

/// Reference counting property: destruction happens exactly at the final
/// release, observable through the live-object gauge.
#[test]
fn object_lifecycle_is_observable() {
    let server = Server::new_for_tests();
    let process = server.make_test_process();
    let baseline = live_objects();

    let event = Event::create(&server, None, "\\BaseNamedObjects\\life", ATTRS, true, false)
        .unwrap()
        .obj;
    assert_eq!(live_objects(), baseline + 1);

    let obj: ObjRef = event.clone();
    let h1 = process.handles().alloc(&obj, AccessMask::GENERIC_READ, HandleFlags::empty()).unwrap();
    let h2 = process.handles().alloc(&obj, AccessMask::GENERIC_READ, HandleFlags::empty()).unwrap();
    let grabbed = process.handles().get_obj(h1, AccessMask::empty()).unwrap();
    assert_eq!(live_objects(), baseline + 1);

    process.handles().close(&server, &process, h1).unwrap();
    process.handles().close(&server, &process, h2).unwrap();
    drop(grabbed);
    drop(obj);
    assert_eq!(live_objects(), baseline + 1);
    drop(event);
    assert_eq!(live_objects(), baseline);

    // and the name is gone with it
    let (_, rest) =
        lookup_named_object(&server, None, "\\BaseNamedObjects\\life", ATTRS).unwrap();
    assert_eq!(rest.as_deref(), Some("life"));
}

/// Named objects open across processes; OPEN_IF reports the existing one.
#[test]
fn named_objects_are_shared_across_processes() {
    let server = Server::new_for_tests();
    let event = Event::create(&server, None, "\\BaseNamedObjects\\shared", ATTRS, false, false)
        .unwrap()
        .obj;

    let opened: Rc<Event> =
        open_named_object_as(&server, None, "\\BaseNamedObjects\\SHARED", ATTRS).unwrap();
    assert!(Rc::ptr_eq(&event, &opened));

    let again = Event::create(
        &server,
        None,
        "\\BaseNamedObjects\\shared",
        ATTRS | Attributes::OPEN_IF,
        false,
        false,
    )
    .unwrap();
    assert!(!again.created);
    assert_eq!(again.status(), Status::OBJECT_NAME_EXISTS);

    // a semaphore under the same name is a type mismatch even with OPEN_IF
    let err = Semaphore::create(
        &server,
        None,
        "\\BaseNamedObjects\\shared",
        ATTRS | Attributes::OPEN_IF,
        0,
        1,
    )
    .unwrap_err();
    assert_eq!(err, Status::OBJECT_TYPE_MISMATCH);
}

/// Round-trip: create_symlink → open → target.
#[test]
fn symlink_round_trip() {
    let server = Server::new_for_tests();
    let _target =
        Event::create(&server, None, "\\BaseNamedObjects\\real", ATTRS, true, false).unwrap().obj;
    SymbolicLink::create(&server, None, "\\BaseNamedObjects\\alias", ATTRS, "\\BaseNamedObjects\\real")
        .unwrap();

    let link: Rc<SymbolicLink> = open_named_object_as(
        &server,
        None,
        "\\BaseNamedObjects\\alias",
        ATTRS | Attributes::OPEN_LINK,
    )
    .unwrap();
    assert_eq!(link.target(), "\\BaseNamedObjects\\real");

    let resolved: Rc<Event> =
        open_named_object_as(&server, None, "\\BaseNamedObjects\\alias", ATTRS).unwrap();
    assert_eq!(resolved.type_name(), "Event");
}

/// S1: sharing violation on the second open, cleared by closing the first.
#[test]
fn s1_sharing_denies_then_allows() {
    let server = Server::new_for_tests();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared_file");
    std::fs::write(&path, b"contents").unwrap();

    let first = File::create(
        &server,
        None,
        &path,
        AccessMask::GENERIC_READ,
        ShareMode::READ,
        CreateDisposition::Open,
        OpenOptions::empty(),
        FileAttributes::empty(),
    )
    .unwrap();

    let second = File::create(
        &server,
        None,
        &path,
        AccessMask::GENERIC_WRITE,
        ShareMode::READ | ShareMode::WRITE,
        CreateDisposition::Open,
        OpenOptions::empty(),
        FileAttributes::empty(),
    );
    assert_eq!(second.unwrap_err(), Status::SHARING_VIOLATION);

    drop(first);
    File::create(
        &server,
        None,
        &path,
        AccessMask::GENERIC_WRITE,
        ShareMode::READ | ShareMode::WRITE,
        CreateDisposition::Open,
        OpenOptions::empty(),
        FileAttributes::empty(),
    )
    .unwrap();
}

/// S6 and property 6: lock holes are re-lockable, the remainder conflicts.
#[test]
fn s6_lock_holes() {
    let server = Server::new_for_tests();
    let process = server.make_test_process();
    let other_process = server.make_test_process();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("locked");
    std::fs::write(&path, vec![0u8; 64]).unwrap();

    let open = || {
        File::create(
            &server,
            None,
            &path,
            AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE,
            ShareMode::READ | ShareMode::WRITE,
            CreateDisposition::Open,
            OpenOptions::empty(),
            FileAttributes::empty(),
        )
        .unwrap()
    };
    let file = open();
    assert!(matches!(file.lock(&process, 0, 10, true, false).unwrap(), LockResult::Granted));
    assert!(matches!(file.lock(&process, 5, 15, true, false).unwrap(), LockResult::Granted));
    file.unlock(0, 10).unwrap();

    // the hole [0,5) is free again
    assert!(matches!(file.lock(&process, 0, 5, false, false).unwrap(), LockResult::Granted));
    // but [5,20) is still shared-locked; an exclusive request from another
    // open conflicts
    let file2 = open();
    assert_eq!(
        file2.lock(&other_process, 5, 10, false, false).unwrap_err(),
        Status::FILE_LOCK_CONFLICT
    );

    // blocked-with-wait parks on the conflicting lock object
    match file2.lock(&other_process, 5, 10, false, true).unwrap() {
        LockResult::Pending(lock) => {
            let thread = other_process.main_thread().unwrap();
            let lock_obj: ObjRef = lock;
            let outcome =
                begin_wait(&server, &thread, &[lock_obj], false, false, None).unwrap();
            assert!(matches!(outcome, WaitOutcome::Pending(_)));
            // releasing the blocking lock wakes the waiter; the client then
            // retries the lock
            file.unlock(5, 15).unwrap();
            assert_eq!(thread.take_wait_result(), Some(Status::WAIT_0));
            assert!(matches!(
                file2.lock(&other_process, 5, 10, false, false).unwrap(),
                LockResult::Granted
            ));
        }
        LockResult::Granted => panic!("lock should conflict"),
    }
}

/// S2: pipe listen/connect/second-client flow.
#[test]
fn s2_named_pipe_connect() {
    let server = Server::new_for_tests();
    let process = server.make_test_process();
    let thread = process.main_thread().unwrap();

    let params = PipeParams {
        flags: PipeFlags::empty(),
        sharing: ShareMode::READ | ShareMode::WRITE,
        max_instances: 1,
        in_size: 0,
        out_size: 0,
        timeout: -TICKS_PER_SEC,
    };
    let pipe_server = NamedPipe::create(
        &server,
        "\\Device\\NamedPipe\\X",
        ATTRS,
        params,
        OpenOptions::empty(),
    )
    .unwrap();

    let listen = userkd::async_io::Async::new(&thread, 0, 0, None);
    assert_eq!(pipe_server.listen(&server, &listen).unwrap(), Status::PENDING);

    // client opens the pipe by name
    let (obj, rest) = lookup_named_object(&server, None, "\\Device\\NamedPipe\\X", ATTRS).unwrap();
    assert!(rest.is_none());
    let client = obj
        .open_file(
            &obj,
            &server,
            &process,
            AccessMask::GENERIC_READ,
            ShareMode::empty(),
            OpenOptions::empty(),
        )
        .unwrap();
    assert_eq!(listen.status(), Status::SUCCESS);
    assert_eq!(pipe_server.state(), PipeState::Connected);

    // a second client finds no free instance
    let err = obj
        .open_file(
            &obj,
            &server,
            &process,
            AccessMask::GENERIC_READ,
            ShareMode::empty(),
            OpenOptions::empty(),
        )
        .unwrap_err();
    assert_eq!(err, Status::PIPE_NOT_AVAILABLE);
    drop(client);
}

/// S4-lite: image mapping size and shared-writable backing reuse. (Client
/// views are mmapped client-side; the server guarantees both mappers get
/// the same backing file.)
#[test]
fn s4_image_mapping_shares_backing() {
    let server = Server::new_for_tests();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("image.dll");
    std::fs::write(&path, build_minimal_pe64()).unwrap();

    let map = |name: &str| {
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
            name,
            ATTRS,
            0,
            SecFlags::IMAGE,
            Protection::READ,
            Some(&file),
            CpuType::X86_64,
        )
        .unwrap()
        .obj
    };
    let first = map("\\BaseNamedObjects\\img1");
    let second = map("\\BaseNamedObjects\\img2");

    let info = first.image_info().unwrap();
    assert!(info.map_size >= 0x4000);
    assert_eq!(info.map_size % 0x1000, 0);
    assert_eq!(first.size(), info.map_size);

    let backing1 = first.shared_file().expect("shared sections present");
    let backing2 = second.shared_file().expect("shared sections present");
    assert!(Rc::ptr_eq(&backing1, &backing2));
}

/// Minimal PE64 with one shared-writable section of raw size 0x200 and one
/// of 0x400.
fn build_minimal_pe64() -> Vec<u8> {
    const SHARED_WRITE: u32 = 0x1000_0000 | 0x8000_0000;
    let mut out = vec![0u8; 0x40];
    out[0] = b'M';
    out[1] = b'Z';
    out[0x3c] = 0x40; // e_lfanew
    out.extend_from_slice(b"PE\0\0");
    // COFF file header: AMD64, 2 sections, optional header 112 bytes
    let mut coff = [0u8; 20];
    coff[..2].copy_from_slice(&0x8664u16.to_le_bytes());
    coff[2..4].copy_from_slice(&2u16.to_le_bytes());
    coff[16..18].copy_from_slice(&112u16.to_le_bytes());
    out.extend_from_slice(&coff);
    // optional header 64
    let mut opt = [0u8; 112];
    opt[..2].copy_from_slice(&0x20bu16.to_le_bytes());
    opt[24..32].copy_from_slice(&0x1_4000_0000u64.to_le_bytes()); // image base
    opt[32..36].copy_from_slice(&0x1000u32.to_le_bytes()); // section align
    opt[36..40].copy_from_slice(&0x200u32.to_le_bytes()); // file align
    opt[56..60].copy_from_slice(&0x4000u32.to_le_bytes()); // size of image
    opt[60..64].copy_from_slice(&0x400u32.to_le_bytes()); // size of headers
    out.extend_from_slice(&opt);
    // section headers
    let section = |name: &[u8], vaddr: u32, vsize: u32, raw_ptr: u32, raw_size: u32, ch: u32| {
        let mut sec = [0u8; 40];
        sec[..name.len()].copy_from_slice(name);
        sec[8..12].copy_from_slice(&vsize.to_le_bytes());
        sec[12..16].copy_from_slice(&vaddr.to_le_bytes());
        sec[16..20].copy_from_slice(&raw_size.to_le_bytes());
        sec[20..24].copy_from_slice(&raw_ptr.to_le_bytes());
        sec[36..40].copy_from_slice(&ch.to_le_bytes());
        sec
    };
    out.extend_from_slice(&section(b".shr1", 0x1000, 0x200, 0x400, 0x200, SHARED_WRITE));
    out.extend_from_slice(&section(b".shr2", 0x2000, 0x400, 0x600, 0x400, SHARED_WRITE));
    out.resize(0xa00, 0xcc);
    out
}

/// S5 covered at the wheel level; here the timer rides the real wheel with
/// a pinned clock.
#[test]
fn timer_signals_through_the_wheel() {
    let server = Server::new_for_tests();
    let process = server.make_test_process();
    let thread = process.main_thread().unwrap();
    let timer = Timer::create(&server, None, "\\BaseNamedObjects\\tick", ATTRS, false)
        .unwrap()
        .obj;

    server.timeouts().set_current_time(0);
    timer.set(&server, &thread, 100 * MS, 100, 0, 0);

    let obj: ObjRef = timer.clone();
    let outcome = begin_wait(&server, &thread, &[obj], false, false, None).unwrap();
    assert!(matches!(outcome, WaitOutcome::Pending(_)));

    server.timeouts().set_current_time(100 * MS);
    server.timeouts().process(&server);
    assert_eq!(thread.take_wait_result(), Some(Status::WAIT_0));
    // auto-reset consumed the signal; the next period re-signals
    assert!(!timer.is_signaled());
    server.timeouts().set_current_time(200 * MS);
    server.timeouts().process(&server);
    assert!(timer.is_signaled());
}

/// S3: directory watch, non-recursive vs subtree.
#[test]
fn s3_directory_watch() {
    let server = Server::new_for_tests();
    let process = server.make_test_process();
    let thread = process.main_thread().unwrap();
    let dir = TempDir::new().unwrap();

    let watch = DirWatch::open(&server, dir.path()).unwrap();
    let async_op = userkd::async_io::Async::new(&thread, 0, 0, None);
    watch
        .read_directory_changes(&server, NotifyFilter::FILE_NAME, false, true, &async_op)
        .unwrap();

    std::fs::write(dir.path().join("a"), b"1").unwrap();
    pump(&server);
    let records = watch.read_changes().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, ChangeAction::Added);
    assert_eq!(records[0].name, "a");

    std::fs::create_dir(dir.path().join("sub")).unwrap();
    pump(&server);
    let _ = watch.read_changes();
    std::fs::write(dir.path().join("sub").join("b"), b"2").unwrap();
    pump(&server);
    assert_eq!(watch.read_changes().unwrap_err(), Status::NO_DATA_DETECTED);

    // a new subtree watch sees events below existing subdirectories
    let recursive = DirWatch::open(&server, dir.path()).unwrap();
    let async_op = userkd::async_io::Async::new(&thread, 0, 0, None);
    recursive
        .read_directory_changes(&server, NotifyFilter::FILE_NAME, true, true, &async_op)
        .unwrap();
    std::fs::write(dir.path().join("sub").join("c"), b"3").unwrap();
    pump(&server);
    let records = recursive.read_changes().unwrap();
    assert!(
        records.iter().any(|r| r.action == ChangeAction::Added && r.name == "sub\\c"),
        "got {records:?}"
    );
}

/// Property 13: process teardown cancels pending asyncs in FIFO order and
/// releases its locks.
#[test]
fn process_teardown_cleans_up() {
    let server = Server::new_for_tests();
    let process = server.make_test_process();
    let thread = process.main_thread().unwrap();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("f");
    std::fs::write(&path, vec![0u8; 32]).unwrap();

    let file = File::create(
        &server,
        None,
        &path,
        AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE,
        ShareMode::READ | ShareMode::WRITE,
        CreateDisposition::Open,
        OpenOptions::empty(),
        FileAttributes::empty(),
    )
    .unwrap();
    assert!(matches!(file.lock(&process, 0, 16, false, false).unwrap(), LockResult::Granted));

    let asyncs: Vec<_> = (0..3)
        .map(|i| {
            let a = userkd::async_io::Async::new(&thread, 0x100 + i, 0, None);
            userkd::fd::fd_queue_async(
                &server,
                &file.fd().unwrap(),
                &a,
                userkd::async_io::AsyncType::Wait,
            );
            a
        })
        .collect();

    process.terminate(&server, 0);
    for a in &asyncs {
        assert_eq!(a.status(), Status::CANCELLED);
    }

    // the lock is gone: a fresh process can take the range
    let process2 = server.make_test_process();
    let file2 = File::create(
        &server,
        None,
        &path,
        AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE,
        ShareMode::READ | ShareMode::WRITE,
        CreateDisposition::Open,
        OpenOptions::empty(),
        FileAttributes::empty(),
    )
    .unwrap();
    assert!(matches!(
        file2.lock(&process2, 0, 16, false, false).unwrap(),
        LockResult::Granted
    ));
}

/// Multiple waiters are granted in queue order by an explicit wake.
#[test]
fn wake_up_grants_in_insertion_order() {
    let server = Server::new_for_tests();
    let event = Event::create(&server, None, "", Attributes::empty(), true, false).unwrap().obj;
    let obj: ObjRef = event.clone();

    let threads: Vec<_> = (0..3)
        .map(|_| {
            let process: Rc<Process> = server.make_test_process();
            let thread = process.main_thread().unwrap();
            let outcome =
                begin_wait(&server, &thread, &[obj.clone()], false, false, None).unwrap();
            assert!(matches!(outcome, WaitOutcome::Pending(_)));
            (process, thread)
        })
        .collect();

    event.set(); // wakes everyone: manual-reset
    for (_, thread) in &threads {
        assert_eq!(thread.take_wait_result(), Some(Status::WAIT_0));
    }

    // an auto-reset cousin grants exactly one waiter per wake
    let auto = Event::create(&server, None, "", Attributes::empty(), false, false).unwrap().obj;
    let auto_obj: ObjRef = auto.clone();
    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let process = server.make_test_process();
            let thread = process.main_thread().unwrap();
            begin_wait(&server, &thread, &[auto_obj.clone()], false, false, None).unwrap();
            (process, thread)
        })
        .collect();
    auto.set();
    assert_eq!(waiters[0].1.take_wait_result(), Some(Status::WAIT_0));
    assert_eq!(waiters[1].1.take_wait_result(), None);
    assert_eq!(wake_up(&auto_obj, 0), 0); // unsignaled again: nobody wakes
}
