//! Timeout queue
//!
//! Absolute-time callbacks keyed in 100ns ticks since 1601, kept in one
//! sorted list. The main loop samples the clock once per iteration, runs the
//! expired prefix, and sleeps in poll until the next deadline.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use crate::server::Server;

/// 100ns ticks since January 1, 1601. Negative values denote relative
/// timeouts in request parameters.
pub type Ticks = i64;

pub const TICKS_PER_SEC: Ticks = 10_000_000;

/// Offset between the 1601 and 1970 epochs.
const TICKS_1601_TO_1970: Ticks = 86400 * (369 * 365 + 89) * TICKS_PER_SEC;

/// Current wall-clock time in ticks.
pub fn now_ticks() -> Ticks {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs() as Ticks * TICKS_PER_SEC + (now.subsec_nanos() / 100) as Ticks
        + TICKS_1601_TO_1970
}

type TimeoutCallback = Box<dyn FnOnce(&Server)>;

struct TimeoutEntry {
    when: Ticks,
    callback: RefCell<Option<TimeoutCallback>>,
}

/// Cancellation handle for a pending timeout.
pub struct TimeoutHandle(Weak<TimeoutEntry>);

impl TimeoutHandle {
    /// Cancel the timeout. A no-op if it already fired.
    pub fn cancel(&self) {
        if let Some(entry) = self.0.upgrade() {
            entry.callback.borrow_mut().take();
        }
    }
}

impl std::fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimeoutHandle")
    }
}

/// The sorted timeout list plus the per-iteration clock sample.
pub struct TimeoutQueue {
    entries: RefCell<Vec<Rc<TimeoutEntry>>>,
    current_time: Cell<Ticks>,
}

impl Default for TimeoutQueue {
    fn default() -> Self {
        TimeoutQueue::new()
    }
}

impl TimeoutQueue {
    pub fn new() -> TimeoutQueue {
        TimeoutQueue {
            entries: RefCell::new(Vec::new()),
            current_time: Cell::new(now_ticks()),
        }
    }

    /// The time sampled at the top of the current main-loop iteration.
    pub fn current_time(&self) -> Ticks {
        self.current_time.get()
    }

    /// Re-sample the clock. Called once per main-loop iteration.
    pub fn update_current_time(&self) {
        self.current_time.set(now_ticks());
    }

    /// Pin the clock to a specific value; tests drive expiry deterministically.
    pub fn set_current_time(&self, ticks: Ticks) {
        self.current_time.set(ticks);
    }

    /// Resolve a request timeout to absolute ticks: positive values are
    /// already absolute, negative values are relative to now.
    pub fn absolute(&self, when: Ticks) -> Ticks {
        if when > 0 { when } else { self.current_time.get() - when }
    }

    /// Schedule a callback. `when` may be relative (negative).
    pub fn add<F>(&self, when: Ticks, callback: F) -> TimeoutHandle
    where
        F: FnOnce(&Server) + 'static,
    {
        let when = self.absolute(when);
        let entry = Rc::new(TimeoutEntry {
            when,
            callback: RefCell::new(Some(Box::new(callback))),
        });
        let handle = TimeoutHandle(Rc::downgrade(&entry));
        let mut entries = self.entries.borrow_mut();
        // ties run in insertion order
        let pos = entries.partition_point(|e| e.when <= when);
        entries.insert(pos, entry);
        handle
    }

    /// Run all expired callbacks and return the poll timeout in milliseconds
    /// until the next deadline (−1 when the list is empty).
    pub fn process(&self, server: &Server) -> i32 {
        loop {
            let expired: Vec<Rc<TimeoutEntry>> = {
                let now = self.current_time.get();
                let mut entries = self.entries.borrow_mut();
                let split = entries.partition_point(|e| e.when <= now);
                entries.drain(..split).collect()
            };
            if expired.is_empty() {
                break;
            }
            // callbacks may add further entries, including ones that are
            // already expired; loop until the prefix is drained
            for entry in expired {
                if let Some(callback) = entry.callback.borrow_mut().take() {
                    callback(server);
                }
            }
        }
        let now = self.current_time.get();
        let mut entries = self.entries.borrow_mut();
        // drop cancelled entries parked at the front
        while entries.first().is_some_and(|e| e.callback.borrow().is_none()) {
            entries.remove(0);
        }
        match entries.first() {
            Some(entry) => {
                let diff = (entry.when - now + 9_999) / 10_000;
                diff.clamp(0, i32::MAX as Ticks) as i32
            }
            None => -1,
        }
    }

    /// True when no timeout is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().iter().all(|e| e.callback.borrow().is_none())
    }
}

impl std::fmt::Debug for TimeoutQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimeoutQueue({} pending)", self.entries.borrow().len())
    }
}
