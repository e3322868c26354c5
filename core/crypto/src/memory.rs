//! Secure memory buffers.
//!
//! [`SecureMemory`] hands out [`SecureBuffer`]s and keeps a weak index of
//! every live one so [`SecureMemory::wipe_all`] can destroy them all during
//! an emergency lock, even when the owning code never got to clean up.
//!
//! A buffer is wiped with several random passes followed by a zero pass when
//! it is dropped or explicitly wiped. The wipe runs on every exit path,
//! including unwinding, because it lives in `Drop`.
//!
//! # Caveat
//! This is best effort. Buffers are never grown after allocation so the heap
//! block is not silently reallocated, but bytes that were copied before they
//! reached a `SecureBuffer` (a password typed into a `String`, a value the
//! compiler spilled to the stack, a page written to swap) are outside its
//! reach.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroize;

/// Random overwrite passes before the final zero pass.
pub const DEFAULT_WIPE_PASSES: usize = 3;

/// Overwrite `buf` with `random_passes` rounds of random bytes, then zeros.
pub fn wipe(buf: &mut [u8], random_passes: usize) {
    for _ in 0..random_passes {
        OsRng.fill_bytes(buf);
    }
    buf.zeroize();
}

/// Constant-time equality for secret byte strings.
///
/// Lengths are not secret; unequal lengths return `false` immediately.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

// A panicked holder must not stop a wipe.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Cell = Mutex<Vec<u8>>;

struct Tracker {
    next_id: AtomicU64,
    passes: usize,
    live: Mutex<HashMap<u64, Weak<Cell>>>,
}

/// Allocator and registry for secret buffers.
#[derive(Clone)]
pub struct SecureMemory {
    tracker: Arc<Tracker>,
}

impl SecureMemory {
    pub fn new() -> Self {
        Self::with_passes(DEFAULT_WIPE_PASSES)
    }

    /// Use `passes` random overwrite passes per wipe.
    pub fn with_passes(passes: usize) -> Self {
        Self {
            tracker: Arc::new(Tracker {
                next_id: AtomicU64::new(1),
                passes,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn track(&self, data: Vec<u8>) -> SecureBuffer {
        let id = self.tracker.next_id.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(Mutex::new(data));
        lock(&self.tracker.live).insert(id, Arc::downgrade(&cell));
        SecureBuffer {
            id,
            cell,
            passes: self.tracker.passes,
            tracker: Arc::downgrade(&self.tracker),
        }
    }

    /// Allocate a zero-filled buffer of `len` bytes.
    pub fn allocate(&self, len: usize) -> SecureBuffer {
        self.track(vec![0u8; len])
    }

    /// Copy `bytes` into a new buffer. The caller still owns (and should
    /// wipe) the source.
    pub fn copy_from(&self, bytes: &[u8]) -> SecureBuffer {
        self.track(bytes.to_vec())
    }

    /// Take ownership of `bytes` without copying.
    pub fn adopt(&self, bytes: Vec<u8>) -> SecureBuffer {
        self.track(bytes)
    }

    /// Number of buffers still alive.
    pub fn tracked_count(&self) -> usize {
        let mut live = lock(&self.tracker.live);
        live.retain(|_, weak| weak.strong_count() > 0);
        live.len()
    }

    /// Wipe every live buffer. Returns how many were wiped.
    ///
    /// Buffers stay allocated (their owners still hold them) but read as
    /// zeros from here on.
    pub fn wipe_all(&self) -> usize {
        let cells: Vec<Arc<Cell>> = {
            let mut live = lock(&self.tracker.live);
            live.retain(|_, weak| weak.strong_count() > 0);
            live.values().filter_map(Weak::upgrade).collect()
        };
        for cell in &cells {
            wipe(&mut lock(cell), self.tracker.passes);
        }
        debug!("Wiped {} secure buffers", cells.len());
        cells.len()
    }

    /// Run `f` with `secret`, wiping it afterwards on every exit path.
    pub fn scoped<R>(&self, secret: Vec<u8>, f: impl FnOnce(&[u8]) -> R) -> R {
        with_secret(self.adopt(secret), f)
    }
}

impl Default for SecureMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f` with the contents of `secret`, then drop (and wipe) it.
pub fn with_secret<R>(secret: SecureBuffer, f: impl FnOnce(&[u8]) -> R) -> R {
    secret.expose(f)
}

/// A heap buffer holding secret bytes, wiped on drop.
pub struct SecureBuffer {
    id: u64,
    cell: Arc<Cell>,
    passes: usize,
    tracker: Weak<Tracker>,
}

impl SecureBuffer {
    pub fn len(&self) -> usize {
        lock(&self.cell).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.cell).is_empty()
    }

    /// Borrow the contents for the duration of `f`.
    pub fn expose<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = lock(&self.cell);
        f(&guard)
    }

    /// Mutably borrow the contents for the duration of `f`.
    pub fn expose_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = lock(&self.cell);
        f(&mut guard)
    }

    /// Wipe the contents in place; the length is kept.
    pub fn wipe(&self) {
        wipe(&mut lock(&self.cell), self.passes);
    }

    /// Whether every byte is zero, e.g. after an emergency wipe.
    pub fn is_wiped(&self) -> bool {
        lock(&self.cell).iter().all(|&b| b == 0)
    }

    /// Constant-time comparison against another secret.
    pub fn ct_eq(&self, other: &[u8]) -> bool {
        self.expose(|bytes| constant_time_eq(bytes, other))
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.wipe();
        if let Some(tracker) = self.tracker.upgrade() {
            lock(&tracker.live).remove(&self.id);
        }
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBuffer([REDACTED; {} bytes])", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_wipe_zeroes() {
        let mut buf = vec![0xAAu8; 64];
        wipe(&mut buf, 3);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret!"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_allocate_and_expose() {
        let memory = SecureMemory::new();
        let buf = memory.copy_from(b"hunter2");
        assert_eq!(buf.len(), 7);
        buf.expose(|bytes| assert_eq!(bytes, b"hunter2"));
        assert!(buf.ct_eq(b"hunter2"));
        assert_eq!(format!("{:?}", buf), "SecureBuffer([REDACTED; 7 bytes])");
    }

    #[test]
    fn test_tracking_follows_drop() {
        let memory = SecureMemory::new();
        let a = memory.allocate(16);
        let b = memory.copy_from(b"xyz");
        assert_eq!(memory.tracked_count(), 2);
        drop(a);
        assert_eq!(memory.tracked_count(), 1);
        drop(b);
        assert_eq!(memory.tracked_count(), 0);
    }

    #[test]
    fn test_wipe_all_reaches_forgotten_buffers() {
        let memory = SecureMemory::new();
        let key = memory.copy_from(&[7u8; 32]);
        let body = memory.adopt(b"{\"entries\":[]}".to_vec());

        assert_eq!(memory.wipe_all(), 2);
        assert!(key.is_wiped());
        assert!(body.is_wiped());
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn test_scoped_wipes_after_success() {
        let memory = SecureMemory::new();
        let len = memory.scoped(b"password".to_vec(), |bytes| {
            assert_eq!(memory.tracked_count(), 1);
            bytes.len()
        });
        assert_eq!(len, 8);
        assert_eq!(memory.tracked_count(), 0);
    }

    #[test]
    fn test_scoped_wipes_after_panic() {
        let memory = SecureMemory::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            memory.scoped(b"password".to_vec(), |_| panic!("boom"))
        }));
        assert!(result.is_err());
        assert_eq!(memory.tracked_count(), 0);
    }

    #[test]
    fn test_scoped_early_return() {
        let memory = SecureMemory::new();
        let result: Result<(), &str> = memory.scoped(b"pw".to_vec(), |bytes| {
            if bytes.len() < 8 {
                return Err("too short");
            }
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(memory.tracked_count(), 0);
    }

    #[test]
    fn test_buffer_outlives_manager() {
        let memory = SecureMemory::new();
        let buf = memory.copy_from(b"orphan");
        drop(memory);
        buf.expose(|bytes| assert_eq!(bytes, b"orphan"));
        drop(buf);
    }
}
