use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Something that can make previously written data durable.
pub trait FlushTarget {
    fn sync(&mut self) -> io::Result<()>;
}

/// Durability boundary of a journal. Storage calls it; production syncs,
/// tests inject failures.
pub trait FlushStrategy: Send {
    fn flush(&mut self, target: &mut dyn FlushTarget) -> io::Result<()>;
}

/// Syncs the target on every flush.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncFlush;

impl FlushStrategy for SyncFlush {
    fn flush(&mut self, target: &mut dyn FlushTarget) -> io::Result<()> {
        target.sync()
    }
}

/// Marks data durable without touching the disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFlush;

impl FlushStrategy for NoopFlush {
    fn flush(&mut self, _target: &mut dyn FlushTarget) -> io::Result<()> {
        Ok(())
    }
}

/// Fails flushes while switched on or while a failure budget remains.
#[derive(Debug, Clone, Default)]
pub struct FaultyFlush {
    failing: Arc<AtomicBool>,
    remaining_failures: Arc<AtomicU32>,
}

impl FaultyFlush {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` flushes, then recovers.
    pub fn fail_next(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl FlushStrategy for FaultyFlush {
    fn flush(&mut self, target: &mut dyn FlushTarget) -> io::Result<()> {
        if self.should_fail() {
            return Err(io::Error::new(io::ErrorKind::Other, "injected flush failure"));
        }
        target.sync()
    }
}
