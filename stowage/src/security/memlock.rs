//! Best-effort memory locking for secret buffers.
//!
//! Locking keeps pages out of swap on supported platforms. It can fail because
//! of resource limits; callers treat failure as "not locked", never as an error.

/// Platform capability for pinning memory.
pub trait MemoryLocker: Send + Sync {
    /// Attempts to lock the pages backing `buf`. Returns true on success.
    fn lock(&self, buf: &[u8]) -> bool;

    /// Unlocks pages previously locked with [`MemoryLocker::lock`].
    fn unlock(&self, buf: &[u8]) -> bool;
}

/// Backend that never locks. Used on platforms without `mlock`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLocker;

impl MemoryLocker for NoopLocker {
    fn lock(&self, _buf: &[u8]) -> bool {
        false
    }

    fn unlock(&self, _buf: &[u8]) -> bool {
        false
    }
}

/// `mlock(2)` / `munlock(2)` backend.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MlockLocker;

#[cfg(unix)]
#[allow(unsafe_code)]
impl MemoryLocker for MlockLocker {
    fn lock(&self, buf: &[u8]) -> bool {
        if buf.is_empty() {
            return false;
        }
        // SAFETY: the pointer and length describe a live, borrowed allocation.
        unsafe { libc::mlock(buf.as_ptr().cast::<libc::c_void>(), buf.len()) == 0 }
    }

    fn unlock(&self, buf: &[u8]) -> bool {
        if buf.is_empty() {
            return false;
        }
        // SAFETY: same region that was passed to `lock`.
        unsafe { libc::munlock(buf.as_ptr().cast::<libc::c_void>(), buf.len()) == 0 }
    }
}

/// Returns the locker for the platform this binary was built for.
#[must_use]
pub fn platform_locker() -> &'static dyn MemoryLocker {
    #[cfg(unix)]
    {
        static LOCKER: MlockLocker = MlockLocker;
        &LOCKER
    }
    #[cfg(not(unix))]
    {
        static LOCKER: NoopLocker = NoopLocker;
        &LOCKER
    }
}
