//! User-mode compatibility kernel server
//!
//! A single-process, single-threaded daemon implementing Windows-style
//! kernel object semantics (handles, waits, file I/O, mappings, named
//! objects, change notifications, waitable timers, asynchronous I/O,
//! sockets, named pipes) on top of a POSIX host. Many client processes
//! connect to one server instance; each behaves as if it had its own
//! kernel, while synchronization, naming and cross-process operations are
//! mediated here.
//!
//! The heart of the crate is the object/handle/fd/async/wait substrate:
//! everything the server manages is a reference-counted [`object::KObject`]
//! with a wait queue; per-client [`handle::HandleTable`]s map opaque handle
//! values onto objects; the [`fd::Fd`] layer attaches POSIX descriptors and
//! async queues to objects; and the [`wait::begin_wait`] engine lets client
//! threads block on any mix of up to 64 objects. One [`server::Server`]
//! main loop multiplexes fd readiness, an ordered timeout queue, and
//! signal-driven notifications delivered at safe poll boundaries.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod access;
pub mod async_io;
pub mod change;
pub mod completion;
pub mod fd;
pub mod file;
pub mod handle;
pub mod mapping;
pub mod namespace;
pub mod object;
pub mod pipe;
pub mod poll;
pub mod process;
pub mod request;
pub mod server;
pub mod server_dir;
pub mod sock;
pub mod status;
pub mod symlink;
pub mod sync;
pub mod timeout;
pub mod timer;
pub mod wait;

pub use crate::access::AccessMask;
pub use crate::access::Attributes;
pub use crate::access::OpenOptions;
pub use crate::access::ShareMode;
pub use crate::handle::Handle;
pub use crate::handle::HandleFlags;
pub use crate::object::KObject;
pub use crate::object::ObjRef;
pub use crate::server::Server;
pub use crate::status::Status;
pub use crate::status::SvResult;
pub use crate::timeout::Ticks;
pub use crate::timeout::TICKS_PER_SEC;
